//! A dummy driver useful for testing the engine without a database.
//!
//! Every operation succeeds: gets echo `<key>-value`, puts discard their
//! payload. When host addresses are supplied, each response carries one of
//! them (drawn uniformly) as its host identity so per-host recording can be
//! exercised. With the `maxQPS` option set, every operation sleeps for
//! `1s / maxQPS`, emulating a backend with a fixed service time.
//!
//! ```json
//! { "maxQPS": 1000 }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::seq::SliceRandom;
use serde::Deserialize;

use crate::db::{Ctx, KVStore, Meta, Registry};
use crate::Error;

#[derive(Deserialize, Clone, Debug, Default)]
struct DummyOpt {
    #[serde(rename = "maxQPS")]
    max_qps: Option<u32>,
}

pub struct DummyStore {
    hosts: Vec<String>,
    latency: Option<Duration>,
    closed: AtomicBool,
}

impl DummyStore {
    pub fn new(hosts: &[String]) -> Arc<Self> {
        Arc::new(Self {
            hosts: hosts.to_vec(),
            latency: None,
            closed: AtomicBool::new(false),
        })
    }

    pub fn dial(hosts: &[String], options: &serde_json::Value) -> Result<Arc<dyn KVStore>, Error> {
        let opt: DummyOpt = match options {
            serde_json::Value::Null => DummyOpt::default(),
            v => serde_json::from_value(v.clone())
                .map_err(|e| Error::Config(format!("invalid dummy config: {}", e)))?,
        };
        let latency = match opt.max_qps {
            Some(0) => return Err(Error::Config("dummy: maxQPS must be positive".to_string())),
            Some(qps) => Some(Duration::from_secs(1) / qps),
            None => None,
        };
        Ok(Arc::new(Self {
            hosts: hosts.to_vec(),
            latency,
            closed: AtomicBool::new(false),
        }))
    }

    fn check_open(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Driver("db is closed".to_string()));
        }
        Ok(())
    }

    fn req_meta(&self) -> Meta {
        match self.hosts.choose(&mut rand::thread_rng()) {
            Some(h) => Meta::with_host(h.clone()),
            None => Meta::empty(),
        }
    }

    fn emulate_service_time(&self) {
        if let Some(d) = self.latency {
            thread::sleep(d);
        }
    }
}

impl KVStore for DummyStore {
    fn init(&self, _ctx: &Ctx) -> Result<(), Error> {
        self.check_open()
    }

    fn get(&self, _ctx: &Ctx, key: &str) -> Result<(Option<String>, Meta), Error> {
        self.check_open()?;
        self.emulate_service_time();
        Ok((Some(format!("{}-value", key)), self.req_meta()))
    }

    fn put(&self, _ctx: &Ctx, _key: &str, _val: &str) -> Result<Meta, Error> {
        self.check_open()?;
        self.emulate_service_time();
        Ok(self.req_meta())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

inventory::submit! {
    Registry::new("dummy", DummyStore::dial)
}
