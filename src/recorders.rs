//! Latency recording and interval-log output.
//!
//! A [`Latency`] owns one HdrHistogram and one error counter per trace
//! step. A [`MultiLatency`] owns an aggregate `Latency` plus one per shard
//! name (typically the server that handled the request), created lazily the
//! first time a name is observed. At the end of a run everything is
//! serialized through a [`MultiLogWriter`] as HdrHistogram interval logs:
//! one interval per phase, bracketed by the phase's wall-clock begin/end
//! times, followed by two comment lines carrying the phase descriptor and
//! its error count. [`crate::readers`] parses the logs back.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use flate2::write::GzEncoder;
use flate2::Compression;
use hashbrown::HashMap;
use hdrhistogram::serialization::interval_log::{IntervalLogWriter, IntervalLogWriterBuilder};
use hdrhistogram::serialization::V2Serializer;
use hdrhistogram::Histogram;
use parking_lot::Mutex;

use crate::Error;

pub(crate) const DESC_PREFIX: &str = "fabbench: desc for previous: ";
pub(crate) const ERR_PREFIX: &str = "fabbench: error count for previous: ";

// {{{ recorders

/// Histogram shape shared by every recorder of a run. Bounds are in
/// nanoseconds.
#[derive(Clone, Copy, Debug)]
pub struct HistConfig {
    pub lowest_discernible: u64,
    pub highest_trackable: u64,
    pub sig_figs: u8,
    pub auto_resize: bool,
}

impl HistConfig {
    /// The shape used for request latencies: 10 µs resolution up to 100 s,
    /// three significant figures, growing if a request exceeds the bound.
    pub fn for_latency() -> Self {
        Self {
            lowest_discernible: Duration::from_micros(10).as_nanos() as u64,
            highest_trackable: Duration::from_secs(100).as_nanos() as u64,
            sig_figs: 3,
            auto_resize: true,
        }
    }

    fn build(&self) -> Result<Histogram<u64>, Error> {
        let mut h =
            Histogram::new_with_bounds(self.lowest_discernible, self.highest_trackable, self.sig_figs)
                .map_err(|e| Error::Hist(format!("bad histogram bounds: {:?}", e)))?;
        h.auto(self.auto_resize);
        Ok(h)
    }
}

/// Per-step latency histograms with error counts and phase timestamps.
pub struct Latency {
    hists: Vec<Histogram<u64>>,
    errs: Vec<u32>,
    starts: Vec<Option<SystemTime>>,
    ends: Vec<Option<SystemTime>>,
}

impl Latency {
    pub fn new(cfg: &HistConfig, steps: usize) -> Result<Self, Error> {
        Ok(Self::with_hist(&cfg.build()?, steps))
    }

    fn with_hist(proto: &Histogram<u64>, steps: usize) -> Self {
        Self {
            hists: vec![proto.clone(); steps],
            errs: vec![0; steps],
            starts: vec![None; steps],
            ends: vec![None; steps],
        }
    }

    /// Records one request outcome under the given step: either a latency
    /// sample or, for failed requests, an error count bump.
    pub fn record(&mut self, step: usize, d: Duration, failed: bool) {
        if failed {
            self.errs[step] += 1;
            return;
        }
        let ns = (d.as_nanos() as u64).max(1);
        self.hists[step].saturating_record(ns);
    }

    pub fn set_start(&mut self, step: usize, at: SystemTime) {
        self.starts[step] = Some(at);
    }

    pub fn set_end(&mut self, step: usize, at: SystemTime) {
        self.ends[step] = Some(at);
    }

    /// Total number of successful samples recorded under `step`.
    pub fn total_count(&self, step: usize) -> u64 {
        self.hists[step].len()
    }

    /// Number of failed requests recorded under `step`.
    pub fn errors(&self, step: usize) -> u32 {
        self.errs[step]
    }

    /// Writes one interval per started step, each followed by the desc and
    /// error-count comments the readers rely on.
    pub fn write_to(&self, sink: &mut LogSink<'_, '_, '_>, descs: &[String]) -> Result<(), Error> {
        for (i, hist) in self.hists.iter().enumerate() {
            let start = match self.starts[i] {
                Some(s) => s,
                None => continue, // step never began (e.g. cancelled run)
            };
            let end = self.ends[i].unwrap_or(start);
            sink.write_histogram(hist, start, end)?;
            sink.write_comment(&format!("{}{}", DESC_PREFIX, descs[i]))?;
            sink.write_comment(&format!("{}{}", ERR_PREFIX, self.errs[i]))?;
        }
        Ok(())
    }
}

/// Aggregate latency plus per-shard-name breakdown.
pub struct MultiLatency {
    proto: Histogram<u64>,
    descs: Arc<Vec<String>>,
    all: Latency,
    subs: HashMap<String, Latency>,
}

impl MultiLatency {
    pub fn new(cfg: HistConfig, descs: Arc<Vec<String>>) -> Result<Self, Error> {
        let proto = cfg.build()?;
        let all = Latency::with_hist(&proto, descs.len());
        Ok(Self {
            proto,
            descs,
            all,
            subs: HashMap::new(),
        })
    }

    /// Records into the aggregate and into the sub-recorder for `name`,
    /// creating the latter on first sight. A late-born sub inherits the
    /// phase timestamps already observed by the aggregate.
    pub fn record(&mut self, name: &str, step: usize, d: Duration, failed: bool) {
        self.all.record(step, d, failed);
        if !self.subs.contains_key(name) {
            let mut sub = Latency::with_hist(&self.proto, self.descs.len());
            sub.starts.copy_from_slice(&self.all.starts);
            sub.ends.copy_from_slice(&self.all.ends);
            self.subs.insert(name.to_string(), sub);
        }
        if let Some(sub) = self.subs.get_mut(name) {
            sub.record(step, d, failed);
        }
    }

    pub fn set_start(&mut self, step: usize, at: SystemTime) {
        self.all.set_start(step, at);
        for sub in self.subs.values_mut() {
            sub.set_start(step, at);
        }
    }

    pub fn set_end(&mut self, step: usize, at: SystemTime) {
        self.all.set_end(step, at);
        for sub in self.subs.values_mut() {
            sub.set_end(step, at);
        }
    }

    pub fn aggregate(&self) -> &Latency {
        &self.all
    }

    pub fn sub(&self, name: &str) -> Option<&Latency> {
        self.subs.get(name)
    }

    /// Flushes the aggregate under the writer's well-known path, then each
    /// sub-recorder under its name.
    pub fn write_to(&self, w: &dyn MultiLogWriter) -> Result<(), Error> {
        w.write_all(&mut |sink| self.all.write_to(sink, &self.descs))?;
        let mut names: Vec<&String> = self.subs.keys().collect();
        names.sort();
        for name in names {
            w.write(name, &mut |sink| self.subs[name].write_to(sink, &self.descs))?;
        }
        Ok(())
    }
}

// }}} recorders

// {{{ log writers

/// Scaling applied to the interval max column of the log.
const MAX_VALUE_DIVISOR: f64 = 1_000_000_000.0;

/// An open interval log: histograms plus comments, header already written.
pub struct LogSink<'a, 'b, 'c> {
    inner: IntervalLogWriter<'b, 'c, &'a mut dyn Write, V2Serializer>,
    base: SystemTime,
}

impl LogSink<'_, '_, '_> {
    pub fn write_comment(&mut self, s: &str) -> Result<(), Error> {
        self.inner.write_comment(s).map_err(Error::Io)
    }

    pub fn write_histogram(&mut self, h: &Histogram<u64>, start: SystemTime, end: SystemTime) -> Result<(), Error> {
        let ts = start.duration_since(self.base).unwrap_or(Duration::ZERO);
        let dur = end.duration_since(start).unwrap_or(Duration::ZERO);
        self.inner
            .write_histogram(h, ts, dur, None)
            .map_err(|e| Error::Hist(format!("interval write failed: {:?}", e)))
    }
}

type SinkFn<'f> = dyn FnMut(&mut LogSink<'_, '_, '_>) -> Result<(), Error> + 'f;

fn with_log(w: &mut dyn Write, start: SystemTime, f: &mut SinkFn<'_>) -> Result<(), Error> {
    let mut serializer = V2Serializer::new();
    let mut writer: &mut dyn Write = w;
    let inner = IntervalLogWriterBuilder::new()
        .with_start_time(start)
        .with_base_time(start)
        .with_max_value_divisor(MAX_VALUE_DIVISOR)
        .begin_log_with(&mut writer, &mut serializer)
        .map_err(Error::Io)?;
    let mut sink = LogSink { inner, base: start };
    f(&mut sink)
}

/// A pair of output destinations: one aggregate log plus one named log per
/// shard. Errors are sticky: after the first failure every later write
/// short-circuits and [`MultiLogWriter::err`] reports what went wrong.
pub trait MultiLogWriter: Send + Sync {
    fn write_all(&self, f: &mut SinkFn<'_>) -> Result<(), Error>;
    fn write(&self, name: &str, f: &mut SinkFn<'_>) -> Result<(), Error>;
    fn err(&self) -> Option<String>;
}

/// Writes `<out>.gz` for the aggregate and `<out>-sub/<name>.gz` per shard
/// name. The sub directory is created lazily on the first sub-write.
pub struct DiskMultiLogWriter {
    out: PathBuf,
    start: SystemTime,
    level: Compression,
    err: Mutex<Option<String>>,
}

impl DiskMultiLogWriter {
    pub fn new(out: impl Into<PathBuf>, start: SystemTime, level: Compression) -> Self {
        Self {
            out: out.into(),
            start,
            level,
            err: Mutex::new(None),
        }
    }

    fn sticky<T>(&self, res: Result<T, Error>) -> Result<T, Error> {
        if let Err(e) = &res {
            let mut err = self.err.lock();
            if err.is_none() {
                *err = Some(e.to_string());
            }
        }
        res
    }

    fn write_file(&self, path: PathBuf, f: &mut SinkFn<'_>) -> Result<(), Error> {
        if let Some(e) = self.err() {
            return Err(Error::Io(io::Error::other(e)));
        }
        let res = (|| -> Result<(), Error> {
            let file = std::fs::File::create(&path)?;
            let mut gz = GzEncoder::new(file, self.level);
            with_log(&mut gz, self.start, f)?;
            gz.finish()?;
            Ok(())
        })();
        self.sticky(res)
    }
}

impl MultiLogWriter for DiskMultiLogWriter {
    fn write_all(&self, f: &mut SinkFn<'_>) -> Result<(), Error> {
        let mut path = self.out.clone().into_os_string();
        path.push(".gz");
        self.write_file(PathBuf::from(path), f)
    }

    fn write(&self, name: &str, f: &mut SinkFn<'_>) -> Result<(), Error> {
        let mut dir = self.out.clone().into_os_string();
        dir.push("-sub");
        let dir = PathBuf::from(dir);
        if !dir.exists() {
            let res = std::fs::create_dir_all(&dir).map_err(Error::Io);
            self.sticky(res)?;
        }
        self.write_file(dir.join(format!("{}.gz", name)), f)
    }

    fn err(&self) -> Option<String> {
        self.err.lock().clone()
    }
}

/// Keeps the logs in memory; used by tests and by anything that wants to
/// post-process a run without touching disk.
pub struct MemoryMultiLogWriter {
    start: SystemTime,
    all: Mutex<Vec<u8>>,
    subs: Mutex<HashMap<String, Vec<u8>>>,
    err: Mutex<Option<String>>,
}

impl MemoryMultiLogWriter {
    pub fn new(start: SystemTime) -> Self {
        Self {
            start,
            all: Mutex::new(Vec::new()),
            subs: Mutex::new(HashMap::new()),
            err: Mutex::new(None),
        }
    }

    pub fn all_bytes(&self) -> Vec<u8> {
        self.all.lock().clone()
    }

    pub fn sub_bytes(&self, name: &str) -> Option<Vec<u8>> {
        self.subs.lock().get(name).cloned()
    }

    pub fn sub_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.subs.lock().keys().cloned().collect();
        names.sort();
        names
    }

    fn sticky<T>(&self, res: Result<T, Error>) -> Result<T, Error> {
        if let Err(e) = &res {
            let mut err = self.err.lock();
            if err.is_none() {
                *err = Some(e.to_string());
            }
        }
        res
    }
}

impl MultiLogWriter for MemoryMultiLogWriter {
    fn write_all(&self, f: &mut SinkFn<'_>) -> Result<(), Error> {
        let mut buf = self.all.lock();
        let res = with_log(&mut *buf, self.start, f);
        self.sticky(res)
    }

    fn write(&self, name: &str, f: &mut SinkFn<'_>) -> Result<(), Error> {
        let mut subs = self.subs.lock();
        let buf = subs.entry(name.to_string()).or_default();
        let res = with_log(buf, self.start, f);
        self.sticky(res)
    }

    fn err(&self) -> Option<String> {
        self.err.lock().clone()
    }
}

// }}} log writers

#[cfg(test)]
mod tests {
    use super::*;

    fn descs(n: usize) -> Arc<Vec<String>> {
        Arc::new((0..n).map(|i| format!("step-{}", i)).collect())
    }

    #[test]
    fn latency_counts_errors_separately() {
        let mut l = Latency::new(&HistConfig::for_latency(), 2).unwrap();
        l.record(0, Duration::from_micros(100), false);
        l.record(0, Duration::ZERO, true);
        l.record(1, Duration::from_micros(50), false);
        assert_eq!(l.total_count(0), 1);
        assert_eq!(l.errors(0), 1);
        assert_eq!(l.total_count(1), 1);
        assert_eq!(l.errors(1), 0);
    }

    #[test]
    fn latency_accepts_extreme_values() {
        let mut l = Latency::new(&HistConfig::for_latency(), 1).unwrap();
        l.record(0, Duration::from_nanos(1), false);
        l.record(0, Duration::from_secs(100000), false);
        l.record(0, Duration::ZERO, false);
        assert_eq!(l.total_count(0), 3);
    }

    #[test]
    fn multi_latency_aggregate_equals_sub_sum() {
        let mut m = MultiLatency::new(HistConfig::for_latency(), descs(3)).unwrap();
        for step in 0..3 {
            m.set_start(step, SystemTime::now());
            for i in 0..100u32 {
                let name = if i % 10 < 3 { "h1" } else { "h2" };
                m.record(name, step, Duration::from_micros(u64::from(i + 1)), i % 7 == 0);
            }
            m.set_end(step, SystemTime::now());
        }
        for step in 0..3 {
            let sum: u64 = ["h1", "h2"]
                .iter()
                .map(|n| m.sub(n).unwrap().total_count(step))
                .sum();
            assert_eq!(m.aggregate().total_count(step), sum);
            let err_sum: u32 = ["h1", "h2"].iter().map(|n| m.sub(n).unwrap().errors(step)).sum();
            assert_eq!(m.aggregate().errors(step), err_sum);
        }
    }

    #[test]
    fn late_sub_inherits_phase_timestamps() {
        let mut m = MultiLatency::new(HistConfig::for_latency(), descs(1)).unwrap();
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1000);
        m.set_start(0, t0);
        m.record("late", 0, Duration::from_micros(5), false);
        assert_eq!(m.sub("late").unwrap().starts[0], Some(t0));
    }

    #[test]
    fn memory_writer_produces_interval_logs() {
        let start = SystemTime::now();
        let w = MemoryMultiLogWriter::new(start);
        let mut m = MultiLatency::new(HistConfig::for_latency(), descs(1)).unwrap();
        m.set_start(0, start);
        m.record("h1", 0, Duration::from_millis(1), false);
        m.set_end(0, start + Duration::from_secs(1));
        m.write_to(&w).unwrap();
        assert!(w.err().is_none());

        let all = String::from_utf8(w.all_bytes()).unwrap();
        assert!(all.contains("StartTime"), "missing legend header:\n{}", all);
        assert!(all.contains(DESC_PREFIX));
        assert!(all.contains(ERR_PREFIX));
        assert_eq!(w.sub_names(), vec!["h1".to_string()]);
    }

    #[test]
    fn unstarted_steps_are_not_written() {
        let start = SystemTime::now();
        let w = MemoryMultiLogWriter::new(start);
        let mut m = MultiLatency::new(HistConfig::for_latency(), descs(2)).unwrap();
        m.set_start(0, start);
        m.record("", 0, Duration::from_millis(1), false);
        m.set_end(0, start + Duration::from_secs(1));
        // step 1 never began
        m.write_to(&w).unwrap();
        let all = String::from_utf8(w.all_bytes()).unwrap();
        assert_eq!(all.matches(DESC_PREFIX).count(), 1);
    }
}
