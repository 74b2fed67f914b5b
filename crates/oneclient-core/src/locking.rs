//! Low-level synchronization utilities shared across the engine.

use crate::error::{ClientError, Result};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Locks a mutex, recovering the inner value if a panicking holder
/// poisoned it. Cache state stays usable after a background thread dies.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A write-once cell multiple threads can await: the single-flight
/// completion behind the helper cache. The first `fulfill` wins; later
/// calls are ignored.
pub struct SharedPromise<T: Clone> {
    state: Mutex<Option<T>>,
    cv: Condvar,
}

impl<T: Clone> SharedPromise<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    pub fn fulfill(&self, value: T) {
        let mut state = lock(&self.state);
        if state.is_none() {
            *state = Some(value);
            self.cv.notify_all();
        }
    }

    pub fn try_get(&self) -> Option<T> {
        lock(&self.state).clone()
    }

    pub fn is_fulfilled(&self) -> bool {
        lock(&self.state).is_some()
    }

    /// Blocks until fulfilled or the deadline passes.
    pub fn wait(&self, timeout: Duration) -> Result<T> {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.state);
        loop {
            if let Some(value) = state.as_ref() {
                return Ok(value.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ClientError::Timeout);
            }
            let (guard, _) = self
                .cv
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state = guard;
        }
    }
}

impl<T: Clone> Default for SharedPromise<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fulfilled_promise_returns_immediately() {
        let promise = SharedPromise::new();
        promise.fulfill(7);
        assert_eq!(promise.wait(Duration::from_millis(10)).unwrap(), 7);
        assert_eq!(promise.try_get(), Some(7));
    }

    #[test]
    fn first_fulfill_wins() {
        let promise = SharedPromise::new();
        promise.fulfill(1);
        promise.fulfill(2);
        assert_eq!(promise.try_get(), Some(1));
    }

    #[test]
    fn wait_times_out_without_fulfillment() {
        let promise: SharedPromise<u32> = SharedPromise::new();
        assert!(matches!(
            promise.wait(Duration::from_millis(20)),
            Err(ClientError::Timeout)
        ));
    }

    #[test]
    fn concurrent_waiters_all_observe_the_value() {
        let promise = Arc::new(SharedPromise::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let promise = Arc::clone(&promise);
            handles.push(thread::spawn(move || {
                promise.wait(Duration::from_secs(5)).unwrap()
            }));
        }
        thread::sleep(Duration::from_millis(10));
        promise.fulfill(42);
        for handle in handles {
            assert_eq!(handle.join().unwrap(), 42);
        }
    }
}
