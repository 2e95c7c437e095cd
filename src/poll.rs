use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::debug;

use crate::registry::Registry;

/// Default polling cadence.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Background polling loop keeping backend input caches fresh.
///
/// Once per interval the loop asks every backend with a poll capability to
/// refresh its cached pin values. Stopping is cooperative: the flag is
/// checked once per cycle, so the loop shuts down deterministically at
/// process teardown (also on drop).
pub struct Poller {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Poller {
    /// Spawn the polling thread at the default 10 ms cadence.
    pub fn spawn(registry: Registry) -> Self {
        Self::spawn_with_interval(registry, POLL_INTERVAL)
    }

    /// Spawn the polling thread at a caller-chosen cadence.
    pub fn spawn_with_interval(registry: Registry, interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let handle = thread::spawn(move || {
            debug!("polling loop started ({:?} interval)", interval);
            while !stop_flag.load(Ordering::Relaxed) {
                registry.poll_all();
                thread::sleep(interval);
            }
            debug!("polling loop stopped");
        });
        Poller {
            stop,
            handle: Some(handle),
        }
    }

    /// Signal the loop to stop and wait for the in-flight cycle to finish.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.shutdown();
    }
}
