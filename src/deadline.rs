//! Advisory cancellation for the dispatch loop.
//!
//! The engine polls [`Deadline::expired`] once per decoded instruction and
//! stops with a timeout fault at the next boundary. The signal never
//! interrupts a blocking host call in progress.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Default)]
pub struct Deadline {
    expires: Option<Instant>,
    cancel: Option<Arc<AtomicBool>>,
}

impl Deadline {
    /// Expire after `timeout` on the monotonic clock.
    pub fn after(timeout: Duration) -> Self {
        Self {
            expires: Some(Instant::now() + timeout),
            cancel: None,
        }
    }

    /// Expire when the host sets `cancel` to true.
    pub fn flag(cancel: Arc<AtomicBool>) -> Self {
        Self {
            expires: None,
            cancel: Some(cancel),
        }
    }

    /// Non-blocking poll.
    pub fn expired(&self) -> bool {
        if let Some(at) = self.expires {
            if Instant::now() >= at {
                return true;
            }
        }
        if let Some(flag) = &self.cancel {
            if flag.load(Ordering::Relaxed) {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_deadline_expires() {
        let deadline = Deadline::after(Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert!(deadline.expired());
    }

    #[test]
    fn future_deadline_is_not_expired() {
        let deadline = Deadline::after(Duration::from_secs(3600));
        assert!(!deadline.expired());
    }

    #[test]
    fn flag_deadline_follows_the_flag() {
        let flag = Arc::new(AtomicBool::new(false));
        let deadline = Deadline::flag(flag.clone());
        assert!(!deadline.expired());
        flag.store(true, Ordering::Relaxed);
        assert!(deadline.expired());
    }

    #[test]
    fn default_deadline_never_expires() {
        assert!(!Deadline::default().expired());
    }
}
