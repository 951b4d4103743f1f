//! Trace parsing and printing.
//!
//! A trace is line-oriented text; each non-empty line describes one workload
//! phase as whitespace-separated `key=value` tokens:
//!
//! ```text
//! d=10m rw=0.5 qps=500 ad=poisson rkd=zipfian-0.99999 wkd=uniform
//! ```
//!
//! Lines inherit every field they do not mention from the previous line, so
//! a long experiment that only sweeps QPS can set the rest once. The printer
//! emits a canonical form in which every line is complete.

use std::fmt;
use std::io::{self, BufRead, Write};
use std::time::Duration;

use crate::Error;

// {{{ durations

const UNITS: &[(&str, u64)] = &[
    ("ns", 1),
    ("us", 1_000),
    ("µs", 1_000),
    ("μs", 1_000),
    ("ms", 1_000_000),
    ("s", 1_000_000_000),
    ("m", 60 * 1_000_000_000),
    ("h", 3_600 * 1_000_000_000),
];

/// Parses a compact duration like `10m`, `1h2m3s`, `500ms`, or `1.5s`.
pub fn parse_duration(s: &str) -> Result<Duration, Error> {
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    let bad = || Error::Parse(format!("invalid duration: {}", s));
    let mut rest = s;
    let mut total_ns = 0f64;
    if rest.is_empty() {
        return Err(bad());
    }
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(bad)?;
        if num_len == 0 {
            return Err(bad());
        }
        let value: f64 = rest[..num_len].parse().map_err(|_| bad())?;
        rest = &rest[num_len..];
        // longest match so "ms" is not read as "m" followed by junk
        let (unit_len, scale) = UNITS
            .iter()
            .filter(|(u, _)| rest.starts_with(u))
            .map(|(u, sc)| (u.len(), *sc))
            .max_by_key(|(l, _)| *l)
            .ok_or_else(bad)?;
        rest = &rest[unit_len..];
        total_ns += value * scale as f64;
    }
    Ok(Duration::from_nanos(total_ns.round() as u64))
}

fn fmt_frac(out: &mut String, value_ns: u128, unit_ns: u128, suffix: &str) {
    use fmt::Write as _;
    let whole = value_ns / unit_ns;
    let frac = value_ns % unit_ns;
    if frac == 0 {
        let _ = write!(out, "{}{}", whole, suffix);
    } else {
        let width = unit_ns.ilog10() as usize;
        let mut digits = format!("{:0width$}", frac, width = width);
        while digits.ends_with('0') {
            digits.pop();
        }
        let _ = write!(out, "{}.{}{}", whole, digits, suffix);
    }
}

/// Formats a duration in the same compact grammar [`parse_duration`]
/// accepts. Durations of a minute or more always spell out the seconds
/// (`30m` prints as `30m0s`), which keeps the canonical form unambiguous.
pub fn format_duration(d: Duration) -> String {
    use fmt::Write as _;
    let total_ns = d.as_nanos();
    let mut out = String::new();
    if total_ns == 0 {
        return "0s".to_string();
    }
    if total_ns < 1_000 {
        let _ = write!(out, "{}ns", total_ns);
        return out;
    }
    if total_ns < 1_000_000 {
        fmt_frac(&mut out, total_ns, 1_000, "µs");
        return out;
    }
    if total_ns < 1_000_000_000 {
        fmt_frac(&mut out, total_ns, 1_000_000, "ms");
        return out;
    }
    let secs = d.as_secs();
    let h = secs / 3600;
    let m = (secs % 3600) / 60;
    if h > 0 {
        let _ = write!(out, "{}h", h);
    }
    if h > 0 || m > 0 {
        let _ = write!(out, "{}m", m);
    }
    let sec_ns = u128::from(secs % 60) * 1_000_000_000 + u128::from(d.subsec_nanos());
    fmt_frac(&mut out, sec_ns, 1_000_000_000, "s");
    out
}

// }}} durations

// {{{ distribution tags

/// How keys are selected within a phase.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum KeyDist {
    Uniform,
    Linear,
    Zipfian { theta: f64 },
    LinStep { steps: u32 },
}

impl fmt::Display for KeyDist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            KeyDist::Uniform => write!(f, "uniform"),
            KeyDist::Linear => write!(f, "linear"),
            KeyDist::Zipfian { theta } => write!(f, "zipfian-{:.6}", theta),
            KeyDist::LinStep { steps } => write!(f, "linstep-{}", steps),
        }
    }
}

fn parse_key_dist(raw: &str) -> Result<KeyDist, String> {
    let lower = raw.to_ascii_lowercase();
    if lower == "uniform" {
        return Ok(KeyDist::Uniform);
    }
    if lower == "linear" {
        return Ok(KeyDist::Linear);
    }
    if let Some(t) = lower.strip_prefix("zipfian-") {
        let theta: f64 = t.parse().map_err(|e| format!("bad theta for zipfian: {}", e))?;
        return Ok(KeyDist::Zipfian { theta });
    }
    if let Some(t) = lower.strip_prefix("linstep-") {
        let steps: u32 = t.parse().map_err(|e| format!("bad step count for linstep: {}", e))?;
        return Ok(KeyDist::LinStep { steps });
    }
    Err(format!("unknown key distribution: {}", raw))
}

/// How request arrivals are scheduled within a phase.
///
/// `Closed` carries no interarrival distribution; it routes the runner onto
/// the closed-loop worker pool. It still parses and prints like the others.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ArrivalDist {
    Closed { workers: u32 },
    Poisson,
    Uniform { width: f64 },
}

impl fmt::Display for ArrivalDist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ArrivalDist::Closed { workers } => write!(f, "closed-{}", workers),
            ArrivalDist::Poisson => write!(f, "poisson"),
            ArrivalDist::Uniform { width } => write!(f, "uniform-{:.6}", width),
        }
    }
}

fn parse_arrival_dist(raw: &str) -> Result<ArrivalDist, String> {
    let lower = raw.to_ascii_lowercase();
    if lower == "poisson" {
        return Ok(ArrivalDist::Poisson);
    }
    if let Some(t) = lower.strip_prefix("closed-") {
        let workers: u32 = t.parse().map_err(|e| format!("bad workers for closed: {}", e))?;
        return Ok(ArrivalDist::Closed { workers });
    }
    if let Some(t) = lower.strip_prefix("uniform-") {
        let width: f64 = t.parse().map_err(|e| format!("bad width for uniform: {}", e))?;
        if !(0.0..=1.0).contains(&width) {
            return Err("uniform width must be in [0, 1]".to_string());
        }
        return Ok(ArrivalDist::Uniform { width });
    }
    Err(format!("unknown arrival distribution: {}", raw))
}

// }}} distribution tags

// {{{ trace steps

/// One phase of a trace: a contiguous span with a fixed duration, mix,
/// target rate, and key/arrival distributions.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TraceStep {
    pub duration: Duration,
    pub rw_ratio: f32,
    pub avg_qps: u32,
    pub arrival: ArrivalDist,
    pub read_dist: KeyDist,
    pub write_dist: KeyDist,
}

impl Default for TraceStep {
    fn default() -> Self {
        Self {
            duration: Duration::ZERO,
            rw_ratio: 0.0,
            avg_qps: 0,
            arrival: ArrivalDist::Poisson,
            read_dist: KeyDist::Uniform,
            write_dist: KeyDist::Uniform,
        }
    }
}

impl fmt::Display for TraceStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "d={} rw={:.6} qps={} ad={} rkd={} wkd={}",
            format_duration(self.duration),
            self.rw_ratio,
            self.avg_qps,
            self.arrival,
            self.read_dist,
            self.write_dist,
        )
    }
}

fn parse_trace_step(line: &str, step: &mut TraceStep) -> Result<(), String> {
    for field in line.split_whitespace() {
        if let Some(t) = field.strip_prefix("d=") {
            step.duration = parse_duration(t).map_err(|e| e.to_string())?;
        } else if let Some(t) = field.strip_prefix("rw=") {
            let r: f32 = t.parse().map_err(|e| format!("invalid rw ratio: {}", e))?;
            if !(0.0..=1.0).contains(&r) {
                return Err(format!("rw ratio must be in [0, 1], got {}", r));
            }
            step.rw_ratio = r;
        } else if let Some(t) = field.strip_prefix("qps=") {
            step.avg_qps = t.parse().map_err(|e| format!("invalid qps: {}", e))?;
        } else if let Some(t) = field.strip_prefix("ad=") {
            step.arrival = parse_arrival_dist(t).map_err(|e| format!("invalid arrival distribution: {}", e))?;
        } else if let Some(t) = field.strip_prefix("rkd=") {
            step.read_dist = parse_key_dist(t).map_err(|e| format!("invalid read key distribution: {}", e))?;
        } else if let Some(t) = field.strip_prefix("wkd=") {
            step.write_dist = parse_key_dist(t).map_err(|e| format!("invalid write key distribution: {}", e))?;
        } else {
            return Err(format!("unknown key-value: {}", field));
        }
    }
    Ok(())
}

/// Parses a trace, carrying unspecified fields forward from line to line.
/// Blank lines are skipped.
pub fn parse_trace(r: impl BufRead) -> Result<Vec<TraceStep>, Error> {
    let mut steps = Vec::new();
    // step retains values across iterations so that lines inherit from
    // previous ones
    let mut step = TraceStep::default();
    for (i, line) in r.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        parse_trace_step(&line, &mut step).map_err(|e| Error::Parse(format!("{}: {}", i + 1, e)))?;
        steps.push(step);
    }
    Ok(steps)
}

/// Prints a trace in canonical form, one complete line per step.
pub fn print_trace(w: &mut impl Write, trace: &[TraceStep]) -> io::Result<()> {
    for t in trace {
        writeln!(w, "{}", t)?;
    }
    Ok(())
}

// }}} trace steps
