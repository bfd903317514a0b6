//! Cooperative stop signal shared by the pipeline threads

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Granularity of interruptible sleeps
const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Cloneable stop flag
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    flag: Arc<AtomicBool>,
}

impl StopSignal {
    /// Create a signal in the running state
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every holder to stop
    pub fn request_stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Has a stop been requested?
    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` unless a stop arrives first.
    ///
    /// Returns `true` if a stop was requested.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_stopped() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sleep_completes() {
        let stop = StopSignal::new();
        assert!(!stop.sleep(Duration::from_millis(10)));
    }

    #[test]
    fn test_sleep_interrupted() {
        let stop = StopSignal::new();
        let remote = stop.clone();
        let handle = std::thread::spawn(move || remote.sleep(Duration::from_secs(30)));

        std::thread::sleep(Duration::from_millis(20));
        let started = Instant::now();
        stop.request_stop();

        assert!(handle.join().unwrap());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
