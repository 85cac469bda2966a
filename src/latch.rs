//! One-shot countdown latch with a bounded wait.
use std::{
    sync::{Condvar, Mutex},
    time::{Duration, Instant},
};

/// Blocks waiters until the count reaches zero.
#[derive(Debug)]
pub struct CountDownLatch {
    count: Mutex<usize>,
    zero: Condvar,
}

impl CountDownLatch {
    pub fn new(count: usize) -> CountDownLatch {
        CountDownLatch {
            count: Mutex::new(count),
            zero: Condvar::new(),
        }
    }

    pub fn count(&self) -> usize {
        *self
            .count
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Re-arm the latch with `count`.
    pub fn reset(&self, count: usize) {
        *self
            .count
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = count;
        if count == 0 {
            self.zero.notify_all();
        }
    }

    pub fn count_down(&self) {
        let mut count = self
            .count
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *count > 0 {
            *count -= 1;
            if *count == 0 {
                self.zero.notify_all();
            }
        }
    }

    /// Wait until the count reaches zero or `timeout` elapses. Returns `true` if the count
    /// reached zero.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self
            .count
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        while *count > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            count = match self.zero.wait_timeout(count, deadline - now) {
                Ok((count, _)) => count,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::CountDownLatch;

    #[test]
    fn wait_times_out_while_armed() {
        let latch = CountDownLatch::new(1);
        assert!(!latch.wait_timeout(Duration::from_millis(20)));
    }

    #[test]
    fn count_down_from_another_thread_releases_waiter() {
        let latch = Arc::new(CountDownLatch::new(1));

        {
            let latch = latch.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                latch.count_down();
            });
        }

        assert!(latch.wait_timeout(Duration::from_secs(5)));
        assert_eq!(latch.count(), 0);
    }
}
