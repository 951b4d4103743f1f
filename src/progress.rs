//! Periodic progress reporting.
//!
//! A [`Progress`] owns a background thread that invokes an out-fn on a fixed
//! period. The out-fn typically reads atomic counters maintained elsewhere
//! and logs a human-readable line. Closing flushes once more and joins the
//! worker, so no tick can land after `close()` returns.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub struct Progress {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

impl Progress {
    pub fn start(period: Duration, mut out: impl FnMut() + Send + 'static) -> Self {
        let (stop_tx, stop_rx) = mpsc::channel();
        let handle = thread::spawn(move || loop {
            match stop_rx.recv_timeout(period) {
                Err(RecvTimeoutError::Timeout) => out(),
                _ => {
                    // one final report so short runs still show up
                    out();
                    break;
                }
            }
        });
        Self { stop_tx, handle }
    }

    pub fn close(self) {
        let _ = self.stop_tx.send(());
        let _ = self.handle.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn flushes_once_on_close() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let p = Progress::start(Duration::from_secs(3600), move || {
            c.fetch_add(1, Ordering::Relaxed);
        });
        p.close();
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn ticks_on_period() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let p = Progress::start(Duration::from_millis(10), move || {
            c.fetch_add(1, Ordering::Relaxed);
        });
        thread::sleep(Duration::from_millis(100));
        p.close();
        // at least a few ticks plus the closing flush
        assert!(calls.load(Ordering::Relaxed) >= 3);
    }
}
