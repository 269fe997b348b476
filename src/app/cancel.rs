use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// One-shot stop signal shared between a controller and its worker threads.
///
/// Workers sleep through `wait_timeout`, so a cancel wakes them immediately instead of after
/// their next tick.
#[derive(Debug, Default)]
pub struct CancelToken {
    cancelled: Mutex<bool>,
    cv: Condvar,
}

impl CancelToken {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn cancel(&self) {
        let mut cancelled = match self.cancelled.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *cancelled = true;
        self.cv.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        match self.cancelled.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Sleeps for `timeout` or until cancelled. Returns `true` when cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut cancelled = match self.cancelled.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        while !*cancelled {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            cancelled = match self.cv.wait_timeout(cancelled, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn wait_timeout_elapses_without_cancel() {
        let token = CancelToken::new();
        let start = Instant::now();
        assert!(!token.wait_timeout(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert!(!token.is_cancelled());
    }

    #[test]
    fn cancel_wakes_waiting_thread() {
        let token = CancelToken::new();
        let waiter = {
            let token = Arc::clone(&token);
            thread::spawn(move || {
                let start = Instant::now();
                let cancelled = token.wait_timeout(Duration::from_secs(30));
                (cancelled, start.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(20));
        token.cancel();

        let (cancelled, elapsed) = waiter.join().expect("join");
        assert!(cancelled);
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn wait_after_cancel_returns_immediately() {
        let token = CancelToken::new();
        token.cancel();
        assert!(token.wait_timeout(Duration::from_secs(30)));
    }
}
