//! The key-value driver contract and the driver registry.
//!
//! The engine is database-agnostic: it only needs [`KVStore`]. Drivers are
//! registered by name with [`inventory::submit!`] and looked up by
//! [`dial`], so external crates can plug in their own store without
//! touching the engine:
//!
//! ```ignore
//! inventory::submit! {
//!     fabbench::db::Registry::new("mystore", MyStore::dial)
//! };
//! ```

use std::sync::Arc;
use std::time::Instant;

use hashbrown::HashMap;
use log::debug;

use crate::{CancelToken, Error};

/// Per-request metadata returned by a driver.
///
/// The only field the engine reads is the optional host identity: when a
/// driver reports which server handled the request, latencies are
/// additionally partitioned per host in the output logs.
#[derive(Clone, Debug, Default)]
pub struct Meta {
    host: Option<String>,
}

impl Meta {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_host(host: impl Into<String>) -> Self {
        Self { host: Some(host.into()) }
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }
}

/// Request-scoped context handed to every driver call: the run's
/// cancellation token plus an optional deadline. Drivers should abandon
/// work once either fires.
#[derive(Clone)]
pub struct Ctx {
    cancel: Arc<CancelToken>,
    deadline: Option<Instant>,
}

impl Ctx {
    pub fn new(cancel: Arc<CancelToken>) -> Self {
        Self { cancel, deadline: None }
    }

    pub fn with_deadline(cancel: Arc<CancelToken>, deadline: Instant) -> Self {
        Self { cancel, deadline: Some(deadline) }
    }

    pub fn is_cancelled(&self) -> bool {
        if self.cancel.is_cancelled() {
            return true;
        }
        matches!(self.deadline, Some(d) if Instant::now() >= d)
    }
}

/// A connected key-value store.
pub trait KVStore: Send + Sync + 'static {
    /// Creates the underlying schema (table, keyspace, ...). Not required
    /// to be idempotent.
    fn init(&self, ctx: &Ctx) -> Result<(), Error>;

    /// Reads a key. `None` means the key does not exist, which is not an
    /// error.
    fn get(&self, ctx: &Ctx, key: &str) -> Result<(Option<String>, Meta), Error>;

    /// Writes a key.
    fn put(&self, ctx: &Ctx, key: &str, val: &str) -> Result<Meta, Error>;

    /// Releases the connection. Calls after `close` fail.
    fn close(&self);
}

type Constructor = fn(&[String], &serde_json::Value) -> Result<Arc<dyn KVStore>, Error>;

/// The centralized registry that maps a driver name to its constructor.
/// External crates register their drivers with [`inventory::submit!`].
pub struct Registry {
    name: &'static str,
    constructor: Constructor,
}

impl Registry {
    pub const fn new(name: &'static str, constructor: Constructor) -> Self {
        Self { name, constructor }
    }
}

inventory::collect!(Registry);

/// Connects to the named driver, passing it the host list and its opaque
/// options blob.
pub fn dial(name: &str, hosts: &[String], options: &serde_json::Value) -> Result<Arc<dyn KVStore>, Error> {
    let mut registered: HashMap<&'static str, Constructor> = HashMap::new();
    for r in inventory::iter::<Registry> {
        debug!("Adding supported driver: {}", r.name);
        assert!(registered.insert(r.name, r.constructor).is_none()); // no existing name
    }
    match registered.get(name) {
        Some(f) => f(hosts, options),
        None => Err(Error::Config(format!("unknown db: {}", name))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dial_unknown_fails() {
        assert!(dial("no-such-db", &[], &serde_json::Value::Null).is_err());
    }

    #[test]
    fn meta_host_round_trip() {
        assert_eq!(Meta::empty().host(), None);
        assert_eq!(Meta::with_host("h1").host(), Some("h1"));
    }

    #[test]
    fn ctx_deadline_expires() {
        let ctx = Ctx::with_deadline(CancelToken::new(), Instant::now());
        assert!(ctx.is_cancelled());
        let ctx = Ctx::new(CancelToken::new());
        assert!(!ctx.is_cancelled());
    }
}
