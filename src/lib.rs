//! A trace-driven load generator and latency benchmark for key-value stores.
//!
//! `fabbench` replays a *trace* — a sequence of workload phases, each with its
//! own duration, read/write mix, target rate, and key/interarrival
//! distributions — against a pluggable key-value driver. Requests are issued
//! either open loop (arrivals scheduled independently of responses) or closed
//! loop (a fixed worker pool), per-request latencies and error outcomes are
//! recorded into one HdrHistogram per phase, and the results are written as
//! gzip-compressed interval logs suitable for CDF and time-series analysis.
//!
//! The built-in `dummy` driver makes the engine testable without a real
//! database. To benchmark your own store, implement [`db::KVStore`], register
//! a constructor with [`inventory::submit!`], and reuse the exported
//! [`cmdline()`] in your `main` function.
//!
//! More detailed usage could be found in the module-level rustdocs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

/// Canonical error type for the benchmark engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad trace or config syntax. Fatal to a subcommand, not to the engine.
    #[error("parse error: {0}")]
    Parse(String),

    /// Illegal parameters detected at construction time.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A driver `get`/`put`/`init` failed.
    #[error("driver error: {0}")]
    Driver(String),

    /// The run-scoped cancellation token fired.
    #[error("cancelled")]
    Cancelled,

    /// I/O error while writing or reading logs.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Histogram construction or serialization failure.
    #[error("histogram error: {0}")]
    Hist(String),
}

/// A cancellation token shared between a run and its workers.
///
/// Issuers poll the token between operations; drivers receive it through
/// [`db::Ctx`] so in-flight requests can be aborted cleanly. A child token
/// (see [`CancelToken::child`]) observes its parent's cancellation but can be
/// cancelled independently, which is how the loader aborts its own workers
/// without tearing down the rest of the process.
#[derive(Debug, Default)]
pub struct CancelToken {
    cancelled: AtomicBool,
    parent: Option<Arc<CancelToken>>,
}

impl CancelToken {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Creates a token that is cancelled whenever `parent` is.
    pub fn child(parent: &Arc<Self>) -> Arc<Self> {
        Arc::new(Self {
            cancelled: AtomicBool::new(false),
            parent: Some(parent.clone()),
        })
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.cancelled.load(Ordering::Acquire) {
            return true;
        }
        match &self.parent {
            Some(p) => p.is_cancelled(),
            None => false,
        }
    }
}

pub mod bench;
mod cmdline;
pub mod db;
pub mod dist;
mod keygen;
pub mod progress;
pub mod ranges;
pub mod readers;
pub mod recorders;
mod rng;
pub mod stores;
pub mod trace;

pub use cmdline::cmdline;

pub extern crate inventory;
