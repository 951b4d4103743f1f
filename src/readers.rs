//! Reading interval logs back.
//!
//! The log format is self-describing for histograms but carries the phase
//! descriptor and error count as comments, so reading is two passes over
//! the same buffer: a line scan that collects the `fabbench:` comments and
//! an interval-log scan that collects the histograms. The two sequences
//! align one-to-one because the writer emits the comments immediately after
//! each interval.

use std::io::{Cursor, Read};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hdrhistogram::serialization::interval_log::{IntervalLogIterator, LogEntry};
use hdrhistogram::serialization::Deserializer;
use hdrhistogram::Histogram;

use crate::recorders::{DESC_PREFIX, ERR_PREFIX};
use crate::Error;

/// One direction's worth of a run: per-phase histograms with their error
/// counts and trace-step descriptors.
pub struct LatencyLog {
    pub hists: Vec<Histogram<u64>>,
    pub errs: Vec<u32>,
    pub descs: Vec<String>,
}

/// Parses an uncompressed interval log produced by
/// [`crate::recorders::MultiLogWriter`].
pub fn read_latency(r: &mut impl Read) -> Result<LatencyLog, Error> {
    let mut bytes = Vec::new();
    r.read_to_end(&mut bytes)?;
    let text = String::from_utf8_lossy(&bytes);

    let mut log = LatencyLog {
        hists: Vec::new(),
        errs: Vec::new(),
        descs: Vec::new(),
    };

    for line in text.lines() {
        let Some(comment) = line.strip_prefix('#') else {
            continue;
        };
        let comment = comment.trim_start();
        if let Some(t) = comment.strip_prefix(ERR_PREFIX) {
            let ec: u32 = t
                .trim()
                .parse()
                .map_err(|e| Error::Parse(format!("unable to read error count: {}", e)))?;
            log.errs.push(ec);
        } else if let Some(t) = comment.strip_prefix(DESC_PREFIX) {
            log.descs.push(t.trim().to_string());
        }
    }

    for entry in IntervalLogIterator::new(&bytes) {
        let entry = entry.map_err(|e| Error::Parse(format!("unable to read log: {:?}", e)))?;
        if let LogEntry::Interval(interval) = entry {
            let encoded = BASE64
                .decode(interval.encoded_histogram())
                .map_err(|e| Error::Parse(format!("unable to decode hist: {}", e)))?;
            let hist = Deserializer::new()
                .deserialize(&mut Cursor::new(&encoded))
                .map_err(|e| Error::Parse(format!("unable to read hist: {:?}", e)))?;
            log.hists.push(hist);
        }
    }

    if log.errs.len() != log.hists.len() || log.descs.len() != log.hists.len() {
        return Err(Error::Parse(
            "number of hists and steps for errors do not match".to_string(),
        ));
    }

    Ok(log)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorders::{HistConfig, MemoryMultiLogWriter, MultiLatency, MultiLogWriter};
    use std::sync::Arc;
    use std::time::{Duration, SystemTime};

    fn descs(n: usize) -> Arc<Vec<String>> {
        Arc::new((0..n).map(|i| format!("d=1s qps={}", i)).collect())
    }

    fn written(m: &MultiLatency) -> Vec<u8> {
        let w = MemoryMultiLogWriter::new(SystemTime::UNIX_EPOCH);
        m.write_to(&w).unwrap();
        assert!(w.err().is_none());
        w.all_bytes()
    }

    #[test]
    fn round_trip_single_step() {
        let mut m = MultiLatency::new(HistConfig::for_latency(), descs(1)).unwrap();
        m.set_start(0, SystemTime::UNIX_EPOCH);
        for d in [
            Duration::from_nanos(1),
            Duration::from_micros(1),
            Duration::from_millis(1),
            Duration::from_secs(1),
            Duration::from_millis(2000),
            Duration::from_secs(100000),
        ] {
            m.record("", 0, d, false);
        }
        for _ in 0..4 {
            m.record("", 0, Duration::ZERO, true);
        }
        m.set_end(0, SystemTime::UNIX_EPOCH + Duration::from_secs(2));

        let log = read_latency(&mut &written(&m)[..]).unwrap();
        assert_eq!(log.hists.len(), 1);
        assert_eq!(log.errs.len(), 1);
        assert_eq!(log.errs[0], 4);
        assert_eq!(log.hists[0].len(), 6);
        assert_eq!(log.descs[0], "d=1s qps=0");
    }

    #[test]
    fn round_trip_multi_step() {
        let cases: &[(u64, u32)] = &[(7, 1), (5, 1), (4, 2)];
        let mut m = MultiLatency::new(HistConfig::for_latency(), descs(cases.len())).unwrap();
        let t0 = SystemTime::UNIX_EPOCH;
        for (step, &(good, errs)) in cases.iter().enumerate() {
            m.set_start(step, t0 + Duration::from_secs(step as u64));
            for i in 0..good {
                m.record("", step, Duration::from_micros(10 * (i + 1)), false);
            }
            for _ in 0..errs {
                m.record("", step, Duration::ZERO, true);
            }
            m.set_end(step, t0 + Duration::from_secs(step as u64 + 1));
        }

        let log = read_latency(&mut &written(&m)[..]).unwrap();
        assert_eq!(log.hists.len(), cases.len());
        assert_eq!(log.errs.len(), cases.len());
        for (step, &(good, errs)) in cases.iter().enumerate() {
            assert_eq!(log.hists[step].len(), good, "step {}", step);
            assert_eq!(log.errs[step], errs, "step {}", step);
        }
    }

    #[test]
    fn many_records_survive_round_trip() {
        let cases: &[(u64, f32)] = &[(1000, 0.3), (10000, 0.5), (1000, 1.0), (1000, 0.0)];
        for &(nrec, perr) in cases {
            let mut m = MultiLatency::new(HistConfig::for_latency(), descs(1)).unwrap();
            m.set_start(0, SystemTime::UNIX_EPOCH);
            let mut errs = 0;
            for i in 0..nrec {
                let failed = (i as f32 / nrec as f32) < perr;
                errs += u64::from(failed);
                m.record("", 0, Duration::from_nanos(100), failed);
            }
            m.set_end(0, SystemTime::UNIX_EPOCH + Duration::from_secs(1));

            let log = read_latency(&mut &written(&m)[..]).unwrap();
            assert_eq!(log.hists[0].len() + u64::from(log.errs[0]), nrec);
            assert_eq!(u64::from(log.errs[0]), errs);
        }
    }

    #[test]
    fn rejects_mismatched_comments() {
        let mut m = MultiLatency::new(HistConfig::for_latency(), descs(1)).unwrap();
        m.set_start(0, SystemTime::UNIX_EPOCH);
        m.record("", 0, Duration::from_micros(10), false);
        m.set_end(0, SystemTime::UNIX_EPOCH + Duration::from_secs(1));
        let mut bytes = written(&m);
        // forge an extra error-count comment
        bytes.extend_from_slice(format!("#{}99\n", ERR_PREFIX).as_bytes());
        assert!(read_latency(&mut &bytes[..]).is_err());
    }
}
