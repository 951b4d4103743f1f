use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{bail, Context};
use clap::ValueHint::FilePath;
use clap::{Args, Parser, Subcommand};
use flate2::Compression;
use log::debug;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::Deserialize;

use crate::bench::{Config, Loader, Runner};
use crate::db::{self, Ctx, KVStore};
use crate::ranges;
use crate::recorders::{DiskMultiLogWriter, HistConfig, MultiLatency};
use crate::trace::parse_trace;
use crate::CancelToken;

const FORMATS_DOC: &str = r#"
CONFIG FORMAT
    The config file is a simple JSON file with the following schema:
        {
            "db": {
                "name": NAME_STR,
                "options": DB_SPECIFIC_OPTIONS
            },
            "workload": {
                "recordCount": RECORDS_INT,
                "keySize": KEY_BYTES_INT,
                "valSize": VAL_BYTES_INT
            }
        }

    Because fabbench is meant to handle multiple databases, db.options is
    db-specific. Out of the box only the dummy driver is built in; other
    drivers register themselves through the driver registry.

    For dummy, the schema for db.options is
        {
            "maxQPS": INT // optional
        }

TRACE FORMAT
    The trace consists of a series of lines with property values set.
    Each line is a step of the trace and inherits values in previous lines.
    Empty lines are ignored.

    The properties are listed below:
        d       duration of trace step (e.g. 5m3s)
        rw      frac of requests that are reads (e.g. 0.8 -> 80% are reads)
        qps     avg requests per second during trace step
        ad      request interarrival distribution
        rkd     key distribution for reads
        wkd     key distribution for writes

    Valid values for these properties are below
        d       a duration such as 90s, 5m3s, 1.5h, or 500ms
        rw      any float in [0, 1]
        qps     any non-negative integer
        ad      poisson:    poisson dist with avg qps
                closed-N:   closed-loop workload of qps*d ops with N workers
                uniform-W:  uniform dist with vals in [avg-avg*W, avg+avg*W]
        rkd     zipfian-T:  zipfian with param of T in (0, 1)
                linstep-K:  PDF linearly dec in K steps
                linear:     linearly dec PDF
                uniform:    uniform
        wkd     same options as rkd

    For example, a valid trace line might be
        d=10m rw=0.5 qps=500 ad=poisson rkd=zipfian-0.99999 wkd=uniform
"#;

#[derive(Args, Debug)]
struct CommonArgs {
    /// Config file path.
    #[arg(long, value_hint = FilePath)]
    config: String,

    /// Host addresses (comma separated).
    #[arg(long, default_value = "")]
    hosts: String,
}

impl CommonArgs {
    fn hosts(&self) -> Vec<String> {
        self.hosts
            .split(',')
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[derive(Args, Debug)]
struct LoadArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Number of concurrent workers.
    #[arg(long, default_value_t = 20)]
    workers: usize,

    /// Fraction of records that are allowed to fail to load.
    #[arg(long = "maxfailfrac", default_value_t = 0.01)]
    max_fail_frac: f64,

    /// Index to start loading from (use either start+count, or
    /// nshard+shardi).
    #[arg(long = "start", default_value_t = 0)]
    load_start: i64,

    /// Number of records to load; -1 means all (use either start+count, or
    /// nshard+shardi).
    #[arg(long = "count", default_value_t = -1, allow_negative_numbers = true)]
    load_count: i64,

    /// Number of parallel loader processes.
    #[arg(long, default_value_t = 0)]
    nshard: i64,

    /// Index of this loader process among nshard.
    #[arg(long, default_value_t = 0)]
    shardi: i64,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Trace file path.
    #[arg(long, value_hint = FilePath)]
    trace: String,

    /// Output path prefix (will add -ro.gz and -wo.gz).
    #[arg(long)]
    out: String,
}

#[derive(Parser, Debug)]
#[command(name = "fabbench", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the database table.
    Mktable(CommonArgs),
    /// Load data into the database.
    Load(LoadArgs),
    /// Run the workload.
    Run(RunArgs),
    /// Describe the config and trace formats.
    Formats,
}

#[derive(Deserialize, Debug)]
struct CmdConfig {
    db: DbSection,
    workload: Config,
}

#[derive(Deserialize, Debug)]
struct DbSection {
    name: String,
    #[serde(default)]
    options: serde_json::Value,
}

fn load_config(hosts: &[String], path: &str) -> anyhow::Result<(Arc<dyn KVStore>, Config)> {
    let text = std::fs::read_to_string(path).with_context(|| format!("unable to open config {}", path))?;
    let cfg: CmdConfig = serde_json::from_str(&text).context("unable to decode config")?;
    let db = db::dial(&cfg.db.name, hosts, &cfg.db.options).context("error connecting to db")?;
    Ok((db, cfg.workload))
}

fn mktable_cli(args: &CommonArgs) -> anyhow::Result<()> {
    let (db, _) = load_config(&args.hosts(), &args.config)?;
    let cancel = CancelToken::new();
    let res = db.init(&Ctx::new(cancel)).context("unable to create table");
    db.close();
    res
}

fn load_cli(args: &LoadArgs) -> anyhow::Result<()> {
    let (db, config) = load_config(&args.common.hosts(), &args.common.config)?;

    let (mut load_start, mut load_count) = (args.load_start, args.load_count);
    if args.nshard > 0 {
        let shards = ranges::split_records(config.record_count, args.nshard);
        if args.shardi < 0 || args.shardi as usize >= shards.len() {
            bail!("invalid value for --shardi: {}, number of shards: {}", args.shardi, shards.len());
        }
        load_start = shards[args.shardi as usize].start;
        load_count = shards[args.shardi as usize].count;
    }

    let mut loader = Loader {
        db: db.clone(),
        config,
        rng: Xoshiro256PlusPlus::from_entropy(),
        workers: args.workers,
        allowed_fail_frac: args.max_fail_frac,
        load_start,
        load_count,
    };

    let cancel = CancelToken::new();
    let res = loader.run(&cancel).context("unable to load");
    db.close();
    res
}

fn run_cli(args: &RunArgs) -> anyhow::Result<()> {
    let (db, config) = load_config(&args.common.hosts(), &args.common.config)?;

    let trace = {
        let f = File::open(&args.trace).with_context(|| format!("unable to open trace {}", args.trace))?;
        parse_trace(BufReader::new(f)).with_context(|| format!("unable to load trace {}", args.trace))?
    };

    let bench_start = SystemTime::now();
    let read_out = Arc::new(DiskMultiLogWriter::new(
        format!("{}-ro", args.out),
        bench_start,
        Compression::fast(),
    ));
    let write_out = Arc::new(DiskMultiLogWriter::new(
        format!("{}-wo", args.out),
        bench_start,
        Compression::fast(),
    ));

    let hist_cfg = HistConfig::for_latency();
    let descs: Arc<Vec<String>> = Arc::new(trace.iter().map(ToString::to_string).collect());

    let runner = Runner {
        db: db.clone(),
        config,
        rng: Xoshiro256PlusPlus::from_entropy(),
        trace,
        read_rec: MultiLatency::new(hist_cfg, descs.clone()).context("unable to build read recorder")?,
        read_out,
        write_rec: MultiLatency::new(hist_cfg, descs).context("unable to build write recorder")?,
        write_out,
    };

    let cancel = CancelToken::new();
    let res = runner.run(&cancel).context("run failed");
    db.close();
    res
}

/// The default command line entry: parses arguments and dispatches to the
/// chosen subcommand.
pub fn cmdline() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    debug!("Starting fabbench with args: {:?}", cli);
    match cli.command {
        Commands::Mktable(args) => mktable_cli(&args),
        Commands::Load(args) => load_cli(&args),
        Commands::Run(args) => run_cli(&args),
        Commands::Formats => {
            eprintln!("{}", FORMATS_DOC);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_decodes() {
        let text = r#"{
            "db": { "name": "dummy", "options": { "maxQPS": 100 } },
            "workload": { "recordCount": 1000, "keySize": 64, "valSize": 128 }
        }"#;
        let cfg: CmdConfig = serde_json::from_str(text).unwrap();
        assert_eq!(cfg.db.name, "dummy");
        assert_eq!(cfg.workload.record_count, 1000);
        assert_eq!(cfg.workload.key_size, 64);
        assert_eq!(cfg.workload.val_size, 128);
    }

    #[test]
    fn config_options_default_to_null() {
        let text = r#"{
            "db": { "name": "dummy" },
            "workload": { "recordCount": 10, "keySize": 8, "valSize": 8 }
        }"#;
        let cfg: CmdConfig = serde_json::from_str(text).unwrap();
        assert!(cfg.db.options.is_null());
    }

    #[test]
    fn hosts_split_skips_empties() {
        let args = CommonArgs {
            config: String::new(),
            hosts: "a,,b".to_string(),
        };
        assert_eq!(args.hosts(), vec!["a".to_string(), "b".to_string()]);
        let args = CommonArgs {
            config: String::new(),
            hosts: String::new(),
        };
        assert!(args.hosts().is_empty());
    }
}
