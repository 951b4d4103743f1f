//! The core load-generation engine: the bulk [`Loader`], the trace-driven
//! [`Runner`], the closed- and open-loop request issuers, and the result
//! pipeline feeding the latency recorders.
//!
//! A run iterates the trace phase by phase. Phase setup builds the key and
//! interarrival generators and emits a begin marker into both result
//! pipelines; the phase body issues requests closed loop (a fixed worker
//! pool draining a shared operation budget) or open loop (planned arrival
//! times, one ticket per request executed by a pool); teardown emits an end
//! marker. Result envelopes flow through one bounded channel per direction
//! into a recorder thread that owns the histograms, so recording needs no
//! locks and phase boundaries cannot overtake the outcomes they bracket.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use hashbrown::HashMap;
use log::{debug, error, info};
use parking_lot::Mutex;
use quanta::Instant;
use rand::{Rng, RngCore, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::Deserialize;

use crate::db::{Ctx, KVStore};
use crate::dist::{self, IntGen, ScrambledZipfian};
use crate::keygen::{KeyGen, ValueGen};
use crate::progress::Progress;
use crate::recorders::{MultiLatency, MultiLogWriter};
use crate::rng::ShardedRng;
use crate::trace::{ArrivalDist, KeyDist, TraceStep};
use crate::{CancelToken, Error};

/// How often issuers poll the cancellation token.
const CANCEL_CHECK_INTERVAL: u64 = 128;

/// Progress is reported on this period.
const PROGRESS_PERIOD: Duration = Duration::from_secs(10);

/// Open-loop executor pool width, per CPU.
const OPEN_LOOP_POOL_PER_CPU: usize = 4;

// {{{ config

/// The workload shape shared by the loader and the runner.
#[derive(Deserialize, Clone, Copy, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub record_count: i64,
    pub key_size: usize,
    pub val_size: usize,
}

// }}} config

// {{{ pipeline

/// One message on a result pipeline. Phase boundaries travel in-band with
/// the outcomes, so FIFO channel order is all the recorder needs.
enum Envelope {
    Begin {
        step: usize,
        at: SystemTime,
    },
    End {
        step: usize,
        at: SystemTime,
    },
    Outcome {
        step: usize,
        host: String,
        latency: Duration,
        failed: bool,
    },
    Done,
}

/// Sender half of one direction's pipeline. Outcomes bump the shared
/// success/failure counters read by the periodic logger, then get forwarded
/// to the recorder thread.
#[derive(Clone)]
struct ResultSender {
    tx: SyncSender<Envelope>,
    ok: Arc<AtomicU32>,
    failed: Arc<AtomicU32>,
}

impl ResultSender {
    fn new(tx: SyncSender<Envelope>) -> Self {
        Self {
            tx,
            ok: Arc::new(AtomicU32::new(0)),
            failed: Arc::new(AtomicU32::new(0)),
        }
    }

    fn send(&self, env: Envelope) {
        if let Envelope::Outcome { failed, .. } = &env {
            if *failed {
                self.failed.fetch_add(1, Ordering::Relaxed);
            } else {
                self.ok.fetch_add(1, Ordering::Relaxed);
            }
        }
        // the recorder only hangs up after Done, so a failed send means it
        // died and there is nowhere left to deliver to
        let _ = self.tx.send(env);
    }
}

/// Consumes envelopes until the `Done` sentinel, then flushes the recorder
/// to the log writer. Runs on its own thread and is the only writer of the
/// histograms.
fn record_worker(rx: Receiver<Envelope>, mut rec: MultiLatency, out: Arc<dyn MultiLogWriter>) {
    while let Ok(env) = rx.recv() {
        match env {
            Envelope::Begin { step, at } => rec.set_start(step, at),
            Envelope::End { step, at } => rec.set_end(step, at),
            Envelope::Outcome { step, host, latency, failed } => {
                rec.record(&host, step, latency, failed)
            }
            Envelope::Done => break,
        }
    }
    if let Err(e) = rec.write_to(&*out) {
        error!("failed to flush recorder: {}", e);
    }
}

// }}} pipeline

// {{{ loader

/// Bulk initial population: covers `[load_start, load_start + load_count)`
/// exactly once using a pool of workers that draw ids from a shared
/// counter.
///
/// Individual put failures are tolerated up to `allowed_fail_frac` of the
/// total load, which rides through transient outages; past that the whole
/// load aborts and the first breaching error is returned.
pub struct Loader {
    pub db: Arc<dyn KVStore>,
    pub config: Config,
    pub rng: Xoshiro256PlusPlus,
    pub workers: usize,
    pub allowed_fail_frac: f64,
    pub load_start: i64,
    /// Number of records to load; negative means the whole record count.
    pub load_count: i64,
}

impl Loader {
    pub fn run(&mut self, cancel: &Arc<CancelToken>) -> Result<(), Error> {
        if self.load_start < 0 {
            return Err(Error::Config(format!("load start must be non-negative, got {}", self.load_start)));
        }
        if self.workers == 0 {
            return Err(Error::Config("need at least one load worker".to_string()));
        }
        let load_count = if self.load_count < 0 {
            self.config.record_count
        } else {
            self.load_count
        };
        if load_count <= 0 {
            return Err(Error::Config(format!("load count must be positive, got {}", load_count)));
        }

        let key_gen = KeyGen::new(
            Arc::new(dist::Counter::new(self.load_start)),
            self.config.key_size,
        );
        let val_gen = ValueGen::new(self.config.val_size);

        let local = CancelToken::child(cancel);
        let nops = Arc::new(AtomicI64::new(0));
        let nfail = Arc::new(AtomicI64::new(0));

        let progress = {
            let nops = nops.clone();
            Progress::start(PROGRESS_PERIOD, move || {
                let done = nops.load(Ordering::Relaxed).min(load_count);
                info!("load: {} / {} records", done, load_count);
            })
        };

        let allowed = self.allowed_fail_frac;
        let mut first_err: Option<Error> = None;
        thread::scope(|s| {
            let (err_tx, err_rx) = mpsc::channel::<Result<(), Error>>();
            for _ in 0..self.workers {
                let db = self.db.clone();
                let key_gen = key_gen.clone();
                let local = local.clone();
                let nops = nops.clone();
                let nfail = nfail.clone();
                let err_tx = err_tx.clone();
                let seed: u64 = self.rng.gen();
                s.spawn(move || {
                    let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
                    let ctx = Ctx::new(local.clone());
                    let mut ret = Ok(());
                    loop {
                        if nops.fetch_add(1, Ordering::Relaxed) >= load_count {
                            break;
                        }
                        if local.is_cancelled() {
                            ret = Err(Error::Cancelled);
                            break;
                        }
                        let key = key_gen.next(&mut rng);
                        let val = val_gen.next(&mut rng);
                        if let Err(e) = db.put(&ctx, &key, &val) {
                            let failed = nfail.fetch_add(1, Ordering::Relaxed) + 1;
                            // tolerance is measured against the total load,
                            // not the completed part
                            if failed as f64 / load_count as f64 > allowed {
                                ret = Err(e);
                                local.cancel();
                                break;
                            }
                        }
                    }
                    let _ = err_tx.send(ret);
                });
            }
            drop(err_tx);
            while let Ok(res) = err_rx.recv() {
                if let Err(e) = res {
                    if first_err.is_none() {
                        first_err = Some(e);
                        local.cancel();
                    }
                }
            }
        });
        progress.close();

        match first_err {
            Some(e) => Err(e),
            None if cancel.is_cancelled() => Err(Error::Cancelled),
            None => Ok(()),
        }
    }
}

// }}} loader

// {{{ issuers

/// Everything an issuer needs to perform one request and report it.
struct IssueArgs {
    db: Arc<dyn KVStore>,
    ctx: Ctx,
    read_keys: KeyGen,
    write_keys: KeyGen,
    vals: ValueGen,
    rw_ratio: f32,
    step: usize,
    read_tx: ResultSender,
    write_tx: ResultSender,
}

impl IssueArgs {
    fn read_req(&self, rng: &mut dyn RngCore, start: Instant) {
        let key = self.read_keys.next(rng);
        let res = self.db.get(&self.ctx, &key);
        let latency = start.elapsed();
        let (host, failed) = match res {
            Ok((_, meta)) => (meta.host().unwrap_or("").to_string(), false),
            Err(e) => {
                debug!("get {} failed: {}", key, e);
                (String::new(), true)
            }
        };
        self.read_tx.send(Envelope::Outcome {
            step: self.step,
            host,
            latency,
            failed,
        });
    }

    fn write_req(&self, rng: &mut dyn RngCore, start: Instant) {
        let key = self.write_keys.next(rng);
        let val = self.vals.next(rng);
        let res = self.db.put(&self.ctx, &key, &val);
        let latency = start.elapsed();
        let (host, failed) = match res {
            Ok(meta) => (meta.host().unwrap_or("").to_string(), false),
            Err(e) => {
                debug!("put {} failed: {}", key, e);
                (String::new(), true)
            }
        };
        self.write_tx.send(Envelope::Outcome {
            step: self.step,
            host,
            latency,
            failed,
        });
    }
}

/// Closed loop: `workers` threads race to claim op ids off a shared budget
/// and fire the next request as soon as the previous response lands.
/// Exactly `total_ops` requests are issued unless cancelled.
fn issue_closed(args: &IssueArgs, cancel: &CancelToken, workers: usize, total_ops: i64, seeds: Vec<u64>) {
    debug_assert_eq!(seeds.len(), workers);
    let nops = AtomicI64::new(0);
    let nops = &nops;
    thread::scope(|s| {
        for seed in seeds {
            s.spawn(move || {
                let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
                loop {
                    if nops.fetch_add(1, Ordering::Relaxed) >= total_ops {
                        break;
                    }
                    if cancel.is_cancelled() {
                        break;
                    }
                    let start = Instant::now();
                    if rng.gen::<f32>() < args.rw_ratio {
                        args.read_req(&mut rng, start);
                    } else {
                        args.write_req(&mut rng, start);
                    }
                }
            });
        }
    });
}

/// One scheduled request, handed from an open-loop issuer to the executor
/// pool. Latency is measured from `start`, so queueing in the pool counts
/// against the request.
struct Ticket {
    is_read: bool,
    start: Instant,
    ordinal: usize,
}

/// Open loop for one shard: draws interarrival gaps, sleeps until each
/// planned send time, and submits a ticket per request. Gaps accumulate
/// against the plan (`planned += gap`) rather than anchoring at `now`, so a
/// slow iteration cannot permanently shift the target rate; it only causes
/// a bounded burst.
fn issue_open(
    args: &IssueArgs,
    cancel: &CancelToken,
    arrival: &dyn IntGen,
    duration: Duration,
    submit: &Sender<Ticket>,
    mut rng: Xoshiro256PlusPlus,
    ordinal0: usize,
    stride: usize,
) {
    let t0 = Instant::now();
    let mut planned = t0;
    let mut ordinal = ordinal0;
    let mut n = 0u64;
    while t0.elapsed() < duration {
        if n % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
            break;
        }
        let gap = arrival.next(&mut rng).max(0) as u64;
        planned = planned + Duration::from_micros(gap);
        let now = Instant::now();
        if planned > now {
            thread::sleep(planned - now);
        }
        let is_read = rng.gen::<f32>() < args.rw_ratio;
        if submit
            .send(Ticket {
                is_read,
                start: Instant::now(),
                ordinal,
            })
            .is_err()
        {
            break;
        }
        ordinal = ordinal.wrapping_add(stride);
        n += 1;
    }
}

/// Executor for open-loop tickets: performs the operation and reports the
/// outcome. The shared receiver is locked only while waiting for the next
/// ticket, never during the request itself.
fn open_worker(args: &IssueArgs, rngs: &ShardedRng, rx: &Mutex<Receiver<Ticket>>) {
    loop {
        // the guard drops at the end of this statement, before the request
        let msg = rx.lock().recv();
        let ticket = match msg {
            Ok(t) => t,
            Err(_) => break, // all issuers hung up and the queue is drained
        };
        let mut rng = rngs.get(ticket.ordinal);
        if ticket.is_read {
            args.read_req(&mut rng, ticket.start);
        } else {
            args.write_req(&mut rng, ticket.start);
        }
    }
}

fn wait_for(duration: Duration, cancel: &CancelToken) {
    let t0 = Instant::now();
    while t0.elapsed() < duration && !cancel.is_cancelled() {
        thread::sleep(Duration::from_millis(10).min(duration));
    }
}

// }}} issuers

// {{{ runner

/// Memoizes scrambled zipfian generators by `(record count, θ)`. Computing
/// `ζ(N, θ)` and the permutation dominates phase setup for large key
/// spaces; phases that reuse the same shape share one generator.
struct DistCache {
    cache: Mutex<HashMap<(i64, u64), Arc<ScrambledZipfian>>>,
}

impl DistCache {
    fn new() -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn zipfian(&self, nitems: i64, theta: f64, rng: &mut dyn RngCore) -> Result<Arc<ScrambledZipfian>, Error> {
        let mut cache = self.cache.lock();
        if let Some(g) = cache.get(&(nitems, theta.to_bits())) {
            return Ok(g.clone());
        }
        debug!("building scrambled zipfian for {} items, theta {}", nitems, theta);
        let g = Arc::new(ScrambledZipfian::new(rng, nitems, theta)?);
        cache.insert((nitems, theta.to_bits()), g.clone());
        Ok(g)
    }
}

fn make_key_gen(
    cache: &DistCache,
    kind: KeyDist,
    nitems: i64,
    rng: &mut dyn RngCore,
) -> Result<Arc<dyn IntGen>, Error> {
    Ok(match kind {
        KeyDist::Uniform => Arc::new(dist::Uniform::new(nitems)?),
        KeyDist::Linear => Arc::new(dist::Linear::new(nitems)?),
        KeyDist::Zipfian { theta } => cache.zipfian(nitems, theta, rng)?,
        KeyDist::LinStep { steps } => Arc::new(dist::LinStep::new(nitems, i64::from(steps))?),
    })
}

fn make_arrival_gen(kind: ArrivalDist, mean_period_us: f64) -> Result<Box<dyn IntGen>, Error> {
    Ok(match kind {
        ArrivalDist::Poisson => Box::new(dist::Poisson::new(mean_period_us)?),
        ArrivalDist::Uniform { width } => {
            Box::new(dist::UniformInterarrival::new(mean_period_us, width)?)
        }
        ArrivalDist::Closed { .. } => {
            return Err(Error::Config("closed arrivals have no interarrival generator".to_string()))
        }
    })
}

/// Replays a trace against a driver, recording per-request latencies into
/// the read and write recorders and flushing them to the writers when the
/// run ends.
///
/// Request errors never abort a run; they are counted per phase. The only
/// error a healthy run returns is [`Error::Cancelled`].
pub struct Runner {
    pub db: Arc<dyn KVStore>,
    pub config: Config,
    pub rng: Xoshiro256PlusPlus,
    pub trace: Vec<TraceStep>,

    pub read_rec: MultiLatency,
    pub read_out: Arc<dyn MultiLogWriter>,
    pub write_rec: MultiLatency,
    pub write_out: Arc<dyn MultiLogWriter>,
}

impl Runner {
    pub fn run(self, cancel: &Arc<CancelToken>) -> Result<(), Error> {
        let Runner {
            db,
            config,
            mut rng,
            trace,
            read_rec,
            read_out,
            write_rec,
            write_out,
        } = self;
        let ncpu = num_cpus::get();

        let (read_raw, read_rx) = mpsc::sync_channel(2 * ncpu);
        let (write_raw, write_rx) = mpsc::sync_channel(2 * ncpu);
        let read_tx = ResultSender::new(read_raw);
        let write_tx = ResultSender::new(write_raw);

        let read_join = {
            let out = read_out.clone();
            thread::spawn(move || record_worker(read_rx, read_rec, out))
        };
        let write_join = {
            let out = write_out.clone();
            thread::spawn(move || record_worker(write_rx, write_rec, out))
        };

        let progress = {
            let (rok, rerr) = (read_tx.ok.clone(), read_tx.failed.clone());
            let (wok, werr) = (write_tx.ok.clone(), write_tx.failed.clone());
            Progress::start(PROGRESS_PERIOD, move || {
                info!(
                    "run: reads ok={} err={} writes ok={} err={}",
                    rok.load(Ordering::Relaxed),
                    rerr.load(Ordering::Relaxed),
                    wok.load(Ordering::Relaxed),
                    werr.load(Ordering::Relaxed),
                );
            })
        };

        let cache = DistCache::new();
        let vals = ValueGen::new(config.val_size);

        let mut run_err = None;
        for (step, ts) in trace.iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            info!("phase {}: {}", step, ts);

            // PHASE_SETUP
            let args = {
                let read_keys = match make_key_gen(&cache, ts.read_dist, config.record_count, &mut rng) {
                    Ok(g) => KeyGen::new(g, config.key_size),
                    Err(e) => {
                        run_err = Some(e);
                        break;
                    }
                };
                let write_keys = match make_key_gen(&cache, ts.write_dist, config.record_count, &mut rng) {
                    Ok(g) => KeyGen::new(g, config.key_size),
                    Err(e) => {
                        run_err = Some(e);
                        break;
                    }
                };
                IssueArgs {
                    db: db.clone(),
                    ctx: Ctx::new(cancel.clone()),
                    read_keys,
                    write_keys,
                    vals,
                    rw_ratio: ts.rw_ratio,
                    step,
                    read_tx: read_tx.clone(),
                    write_tx: write_tx.clone(),
                }
            };

            let begin = SystemTime::now();
            read_tx.send(Envelope::Begin { step, at: begin });
            write_tx.send(Envelope::Begin { step, at: begin });

            // PHASE_RUN + PHASE_TEARDOWN
            match ts.arrival {
                ArrivalDist::Closed { workers } => {
                    let total_ops = (ts.duration.as_secs_f64() * f64::from(ts.avg_qps)).ceil() as i64;
                    let seeds = (0..workers).map(|_| rng.gen()).collect();
                    issue_closed(&args, cancel, workers as usize, total_ops, seeds);
                    let end = SystemTime::now();
                    read_tx.send(Envelope::End { step, at: end });
                    write_tx.send(Envelope::End { step, at: end });
                }
                _ => {
                    if let Err(e) = run_open_phase(&mut rng, &args, cancel, ts, ncpu) {
                        run_err = Some(e);
                        break;
                    }
                }
            }
        }

        // FLUSH: all issuers have been joined phase by phase, so both
        // pipelines have seen every outstanding outcome
        read_tx.send(Envelope::Done);
        write_tx.send(Envelope::Done);
        drop(read_tx);
        drop(write_tx);
        let _ = read_join.join();
        let _ = write_join.join();
        progress.close();

        for (dir, out) in [("read", &read_out), ("write", &write_out)] {
            if let Some(e) = out.err() {
                error!("{} log writer: {}", dir, e);
            }
        }

        match run_err {
            Some(e) => Err(e),
            None if cancel.is_cancelled() => Err(Error::Cancelled),
            None => Ok(()),
        }
    }
}

/// Runs one open-loop phase: the target rate is split over
/// `min(ncpu, qps)` issuer shards, each with its own arrival generator,
/// all submitting to one executor pool. The end marker is emitted as
/// soon as the phase duration expires; outcomes still in flight drain
/// afterwards and land in this phase's histograms.
fn run_open_phase(
    rng: &mut Xoshiro256PlusPlus,
    args: &IssueArgs,
    cancel: &Arc<CancelToken>,
    ts: &TraceStep,
    ncpu: usize,
) -> Result<(), Error> {
    let step = args.step;
    let nshards = ncpu.min(ts.avg_qps as usize).max(1);
    let base = ts.avg_qps / nshards as u32;
    let rem = (ts.avg_qps % nshards as u32) as usize;

    let mut issuers = Vec::with_capacity(nshards);
    for i in 0..nshards {
        let share = base + u32::from(i < rem);
        if share == 0 {
            continue;
        }
        let mean_period_us = 1_000_000.0 / f64::from(share);
        let arrival = make_arrival_gen(ts.arrival, mean_period_us)?;
        let seed: u64 = rng.gen();
        issuers.push((i, arrival, seed));
    }
    let sharded = ShardedRng::new(rng);

    let (ticket_tx, ticket_rx) = mpsc::channel::<Ticket>();
    let ticket_rx = Mutex::new(ticket_rx);
    let duration = ts.duration;

    thread::scope(|s| {
        let sharded = &sharded;
        let ticket_rx = &ticket_rx;
        for _ in 0..OPEN_LOOP_POOL_PER_CPU * ncpu {
            s.spawn(move || open_worker(args, sharded, ticket_rx));
        }

        let had_issuers = !issuers.is_empty();
        let mut handles = Vec::with_capacity(issuers.len());
        for (i, arrival, seed) in issuers.drain(..) {
            let tx = ticket_tx.clone();
            let cancel = &**cancel;
            let handle = s.spawn(move || {
                let rng = Xoshiro256PlusPlus::seed_from_u64(seed);
                issue_open(args, cancel, &*arrival, duration, &tx, rng, i, nshards);
            });
            handles.push(handle);
        }
        drop(ticket_tx);
        for h in handles {
            let _ = h.join();
        }
        if !had_issuers {
            // zero target rate: the phase still occupies its time slot
            wait_for(duration, cancel);
        }

        // duration expired: emit the end marker now; the executor pool
        // drains the remaining tickets behind it
        let end = SystemTime::now();
        args.read_tx.send(Envelope::End { step, at: end });
        args.write_tx.send(Envelope::End { step, at: end });
    });
    Ok(())
}

// }}} runner

// {{{ tests

#[cfg(test)]
mod tests {
    use super::*;
    use crate::readers::{read_latency, LatencyLog};
    use crate::recorders::{HistConfig, MemoryMultiLogWriter};
    use crate::stores::dummy::DummyStore;
    use crate::trace::parse_trace;
    use std::sync::atomic::AtomicU64;

    fn config() -> Config {
        Config {
            record_count: 1000,
            key_size: 1 << 8,
            val_size: 1 << 6,
        }
    }

    fn make_runner(
        db: Arc<dyn KVStore>,
        cfg: Config,
        trace_text: &str,
    ) -> (Runner, Arc<MemoryMultiLogWriter>, Arc<MemoryMultiLogWriter>) {
        let _ = env_logger::try_init();
        let trace = parse_trace(trace_text.as_bytes()).unwrap();
        let descs: Arc<Vec<String>> = Arc::new(trace.iter().map(ToString::to_string).collect());
        let start = SystemTime::now();
        let read_out = Arc::new(MemoryMultiLogWriter::new(start));
        let write_out = Arc::new(MemoryMultiLogWriter::new(start));
        let hcfg = HistConfig::for_latency();
        let runner = Runner {
            db,
            config: cfg,
            rng: Xoshiro256PlusPlus::seed_from_u64(883),
            trace,
            read_rec: MultiLatency::new(hcfg, descs.clone()).unwrap(),
            read_out: read_out.clone(),
            write_rec: MultiLatency::new(hcfg, descs).unwrap(),
            write_out: write_out.clone(),
        };
        (runner, read_out, write_out)
    }

    fn read_log(w: &MemoryMultiLogWriter) -> LatencyLog {
        read_latency(&mut &w.all_bytes()[..]).unwrap()
    }

    fn totals(log: &LatencyLog, step: usize) -> (u64, u32) {
        (log.hists[step].len(), log.errs[step])
    }

    /// Counts operations; optionally fails every put or injects a fixed
    /// service time.
    struct TestStore {
        gets: AtomicU64,
        puts: AtomicU64,
        fail_puts: bool,
        latency: Option<Duration>,
    }

    impl TestStore {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                gets: AtomicU64::new(0),
                puts: AtomicU64::new(0),
                fail_puts: false,
                latency: None,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                gets: AtomicU64::new(0),
                puts: AtomicU64::new(0),
                fail_puts: true,
                latency: None,
            })
        }

        fn slow(latency: Duration) -> Arc<Self> {
            Arc::new(Self {
                gets: AtomicU64::new(0),
                puts: AtomicU64::new(0),
                fail_puts: false,
                latency: Some(latency),
            })
        }

        fn ops(&self) -> u64 {
            self.gets.load(Ordering::Relaxed) + self.puts.load(Ordering::Relaxed)
        }
    }

    impl KVStore for TestStore {
        fn init(&self, _ctx: &Ctx) -> Result<(), Error> {
            Ok(())
        }

        fn get(&self, _ctx: &Ctx, key: &str) -> Result<(Option<String>, crate::db::Meta), Error> {
            self.gets.fetch_add(1, Ordering::Relaxed);
            if let Some(d) = self.latency {
                thread::sleep(d);
            }
            Ok((Some(format!("{}-value", key)), crate::db::Meta::empty()))
        }

        fn put(&self, _ctx: &Ctx, _key: &str, _val: &str) -> Result<crate::db::Meta, Error> {
            self.puts.fetch_add(1, Ordering::Relaxed);
            if let Some(d) = self.latency {
                thread::sleep(d);
            }
            if self.fail_puts {
                return Err(Error::Driver("injected put failure".to_string()));
            }
            Ok(crate::db::Meta::empty())
        }

        fn close(&self) {}
    }

    /// Reports host `h1` for 3 of every 10 puts and `h2` for the rest.
    struct WeightedHostStore {
        puts: AtomicU64,
    }

    impl KVStore for WeightedHostStore {
        fn init(&self, _ctx: &Ctx) -> Result<(), Error> {
            Ok(())
        }

        fn get(&self, _ctx: &Ctx, _key: &str) -> Result<(Option<String>, crate::db::Meta), Error> {
            Ok((None, crate::db::Meta::empty()))
        }

        fn put(&self, _ctx: &Ctx, _key: &str, _val: &str) -> Result<crate::db::Meta, Error> {
            let i = self.puts.fetch_add(1, Ordering::Relaxed);
            let host = if i % 10 < 3 { "h1" } else { "h2" };
            Ok(crate::db::Meta::with_host(host))
        }

        fn close(&self) {}
    }

    fn loader(db: Arc<dyn KVStore>, workers: usize, fail_frac: f64) -> Loader {
        let _ = env_logger::try_init();
        Loader {
            db,
            config: Config {
                record_count: 1000,
                key_size: 1 << 8,
                val_size: 1 << 12,
            },
            rng: Xoshiro256PlusPlus::seed_from_u64(0),
            workers,
            allowed_fail_frac: fail_frac,
            load_start: 0,
            load_count: -1,
        }
    }

    #[test]
    fn load_populates_every_record() {
        let store = TestStore::new();
        let mut l = loader(store.clone(), 8, 0.0);
        l.run(&CancelToken::new()).unwrap();
        assert_eq!(store.puts.load(Ordering::Relaxed), 1000);
    }

    #[test]
    fn load_aborts_past_failure_tolerance() {
        let store = TestStore::failing();
        let mut l = loader(store.clone(), 8, 0.0);
        let err = l.run(&CancelToken::new()).unwrap_err();
        assert!(matches!(err, Error::Driver(_) | Error::Cancelled));
        // siblings observed cancellation well before draining the load
        assert!(store.puts.load(Ordering::Relaxed) < 1000);
    }

    #[test]
    fn load_tolerates_failures_under_the_fraction() {
        let store = TestStore::failing();
        let mut l = loader(store.clone(), 8, 1.0);
        l.run(&CancelToken::new()).unwrap();
        assert_eq!(store.puts.load(Ordering::Relaxed), 1000);
    }

    #[test]
    fn load_rejects_bad_parameters() {
        let store = TestStore::new();
        let mut l = loader(store.clone(), 8, 0.0);
        l.load_start = -1;
        assert!(matches!(l.run(&CancelToken::new()), Err(Error::Config(_))));

        let mut l = loader(store, 0, 0.0);
        assert!(matches!(l.run(&CancelToken::new()), Err(Error::Config(_))));
    }

    #[test]
    fn closed_loop_issues_exactly_the_budget() {
        let (r, read_out, write_out) =
            make_runner(DummyStore::new(&[]), config(), "d=1s rw=0 qps=3333 ad=closed-10 rkd=uniform wkd=uniform\n");
        r.run(&CancelToken::new()).unwrap();

        let (reads, rerrs) = totals(&read_log(&read_out), 0);
        let (writes, werrs) = totals(&read_log(&write_out), 0);
        assert_eq!(writes, 3333);
        assert_eq!(reads, 0);
        assert_eq!(rerrs + werrs, 0);
    }

    #[test]
    fn closed_loop_respects_rw_ratio() {
        let (r, read_out, write_out) =
            make_runner(DummyStore::new(&[]), config(), "d=1s rw=0.5 qps=10000 ad=closed-16 rkd=zipfian-0.99 wkd=linear\n");
        r.run(&CancelToken::new()).unwrap();

        let (reads, _) = totals(&read_log(&read_out), 0);
        let (writes, _) = totals(&read_log(&write_out), 0);
        assert_eq!(reads + writes, 10000);
        let frac = reads as f64 / 10000.0;
        assert!((0.45..=0.55).contains(&frac), "read fraction {}", frac);
    }

    #[test]
    fn open_loop_poisson_hits_the_target_rate() {
        let (r, read_out, write_out) =
            make_runner(DummyStore::new(&[]), config(), "d=1s rw=0.5 qps=500 ad=poisson rkd=uniform wkd=uniform\n");
        r.run(&CancelToken::new()).unwrap();

        let (reads, _) = totals(&read_log(&read_out), 0);
        let (writes, _) = totals(&read_log(&write_out), 0);
        let total = reads + writes;
        assert!((400..=600).contains(&total), "total {}", total);
        let lo = (total as f64 * 0.4) as u64;
        let hi = (total as f64 * 0.6) as u64;
        assert!((lo..=hi).contains(&reads), "reads {} of {}", reads, total);
    }

    #[test]
    fn open_loop_uniform_arrivals_hit_the_target_rate() {
        let (r, _, write_out) =
            make_runner(DummyStore::new(&[]), config(), "d=1s rw=0 qps=800 ad=uniform-0.6 rkd=linstep-5 wkd=uniform\n");
        r.run(&CancelToken::new()).unwrap();

        let (writes, _) = totals(&read_log(&write_out), 0);
        assert!((640..=960).contains(&writes), "writes {}", writes);
    }

    #[test]
    fn per_host_latencies_partition_the_aggregate() {
        let store = Arc::new(WeightedHostStore { puts: AtomicU64::new(0) });
        let (r, _, write_out) =
            make_runner(store, config(), "d=1s rw=0 qps=10000 ad=closed-16 rkd=uniform wkd=uniform\n");
        r.run(&CancelToken::new()).unwrap();

        let (writes, _) = totals(&read_log(&write_out), 0);
        assert_eq!(writes, 10000);

        let h1 = read_latency(&mut &write_out.sub_bytes("h1").unwrap()[..]).unwrap();
        let h2 = read_latency(&mut &write_out.sub_bytes("h2").unwrap()[..]).unwrap();
        assert_eq!(h1.hists[0].len(), 3000);
        assert_eq!(h2.hists[0].len(), 7000);
        assert_eq!(h1.hists[0].len() + h2.hists[0].len(), writes);
    }

    #[test]
    fn cancellation_stops_the_run_but_drops_no_outcome() {
        let store = TestStore::slow(Duration::from_millis(1));
        let (r, read_out, write_out) = make_runner(
            store.clone(),
            config(),
            "d=10s rw=0.5 qps=100000 ad=closed-100 rkd=uniform wkd=uniform\n",
        );
        let cancel = CancelToken::new();
        {
            let cancel = cancel.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(300));
                cancel.cancel();
            });
        }
        let err = r.run(&cancel).unwrap_err();
        assert!(matches!(err, Error::Cancelled));

        let (reads, rerrs) = totals(&read_log(&read_out), 0);
        let (writes, werrs) = totals(&read_log(&write_out), 0);
        let recorded = reads + writes + u64::from(rerrs) + u64::from(werrs);
        assert!(recorded > 0, "nothing recorded before cancellation");
        assert_eq!(recorded, store.ops(), "issued ops and recorded outcomes differ");
    }

    #[test]
    fn request_errors_are_counted_not_fatal() {
        let store = TestStore::failing();
        let (r, _, write_out) =
            make_runner(store, config(), "d=1s rw=0 qps=1000 ad=closed-4 rkd=uniform wkd=uniform\n");
        r.run(&CancelToken::new()).unwrap();

        let (writes, werrs) = totals(&read_log(&write_out), 0);
        assert_eq!(writes, 0);
        assert_eq!(werrs, 1000);
    }

    #[test]
    fn multi_phase_run_brackets_every_phase() {
        let (r, read_out, write_out) = make_runner(
            DummyStore::new(&[]),
            config(),
            "d=500ms rw=0.5 qps=400 ad=poisson rkd=uniform wkd=uniform\nqps=200 ad=closed-4\n",
        );
        r.run(&CancelToken::new()).unwrap();

        let rlog = read_log(&read_out);
        let wlog = read_log(&write_out);
        assert_eq!(rlog.hists.len(), 2);
        assert_eq!(wlog.hists.len(), 2);
        // second phase is closed loop: exact budget
        let (r1, _) = totals(&rlog, 1);
        let (w1, _) = totals(&wlog, 1);
        assert_eq!(r1 + w1, 100);
        assert_eq!(rlog.descs[1], "d=500ms rw=0.500000 qps=200 ad=closed-4 rkd=uniform wkd=uniform");
    }

    #[test]
    fn zero_qps_open_phase_is_silent() {
        let (r, read_out, write_out) =
            make_runner(DummyStore::new(&[]), config(), "d=100ms rw=0.5 qps=0 ad=poisson rkd=uniform wkd=uniform\n");
        r.run(&CancelToken::new()).unwrap();
        let (reads, _) = totals(&read_log(&read_out), 0);
        let (writes, _) = totals(&read_log(&write_out), 0);
        assert_eq!(reads + writes, 0);
    }
}

// }}} tests
