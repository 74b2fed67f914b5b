//! Per-file memo of "direct IO failed here, tunnel through the provider".
//!
//! Mutated both from the dispatcher and from push-message callbacks, so it
//! sits behind its own short mutex rather than inside the fiber state.

use crate::locking::lock;
use std::collections::HashSet;
use std::sync::Mutex;

type FlagCallback = Box<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
pub struct ForceProxyCache {
    entries: Mutex<HashSet<String>>,
    on_add: Mutex<Option<FlagCallback>>,
    on_remove: Mutex<Option<FlagCallback>>,
}

impl ForceProxyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, uuid: &str) -> bool {
        lock(&self.entries).contains(uuid)
    }

    /// Flags `uuid` for proxy IO. The add callback fires only on the
    /// first insertion, where the dispatcher registers interest in
    /// permission changes so the flag can be lifted remotely.
    pub fn add(&self, uuid: &str) {
        let inserted = lock(&self.entries).insert(uuid.to_string());
        if inserted {
            tracing::debug!("Forcing proxy IO for {}", uuid);
            if let Some(callback) = lock(&self.on_add).as_ref() {
                callback(uuid);
            }
        }
    }

    pub fn remove(&self, uuid: &str) {
        let removed = lock(&self.entries).remove(uuid);
        if removed {
            tracing::debug!("Restoring direct IO eligibility for {}", uuid);
            if let Some(callback) = lock(&self.on_remove).as_ref() {
                callback(uuid);
            }
        }
    }

    pub fn on_add(&self, callback: FlagCallback) {
        *lock(&self.on_add) = Some(callback);
    }

    pub fn on_remove(&self, callback: FlagCallback) {
        *lock(&self.on_remove) = Some(callback);
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn add_and_contains() {
        let cache = ForceProxyCache::new();
        assert!(!cache.contains("u1"));
        cache.add("u1");
        assert!(cache.contains("u1"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn remove_clears_the_flag() {
        let cache = ForceProxyCache::new();
        cache.add("u1");
        cache.remove("u1");
        assert!(!cache.contains("u1"));
    }

    #[test]
    fn add_callback_fires_once_per_identity() {
        let cache = ForceProxyCache::new();
        let fired = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&fired);
        cache.on_add(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        cache.add("u1");
        cache.add("u1");
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        cache.add("u2");
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn remove_callback_skipped_for_absent_entries() {
        let cache = ForceProxyCache::new();
        let fired = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&fired);
        cache.on_remove(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        cache.remove("missing");
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        cache.add("u1");
        cache.remove("u1");
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
