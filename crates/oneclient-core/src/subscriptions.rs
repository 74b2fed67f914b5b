//! Ref-counted per-identity push subscriptions.
//!
//! Overlapping interests in the same `(kind, identity)` pair collapse to
//! one provider-visible subscription; the provider message goes out on the
//! 0→1 transition and the cancellation on the 1→0 transition.

use crate::proto::{RemoteClient, SubscriptionKind};
use std::collections::HashMap;

struct Entry {
    subscription_id: i64,
    ref_count: u32,
}

pub struct SubscriptionRegistry {
    remote: RemoteClient,
    entries: HashMap<(SubscriptionKind, String), Entry>,
    next_id: i64,
}

/// Kinds registered for every open file.
pub const OPEN_FILE_SUBSCRIPTIONS: [SubscriptionKind; 4] = [
    SubscriptionKind::FileAttrChanged,
    SubscriptionKind::FileLocationChanged,
    SubscriptionKind::FileRemoved,
    SubscriptionKind::FileRenamed,
];

impl SubscriptionRegistry {
    pub fn new(remote: RemoteClient) -> Self {
        Self {
            remote,
            entries: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn subscribe(&mut self, kind: SubscriptionKind, uuid: &str) {
        let key = (kind, uuid.to_string());
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.ref_count += 1;
            return;
        }
        let subscription_id = self.next_id;
        self.next_id += 1;
        tracing::debug!("Subscribing to {:?} for {} (id {})", kind, uuid, subscription_id);
        self.remote.subscribe(subscription_id, kind, uuid);
        self.entries.insert(
            key,
            Entry {
                subscription_id,
                ref_count: 1,
            },
        );
    }

    pub fn unsubscribe(&mut self, kind: SubscriptionKind, uuid: &str) {
        let key = (kind, uuid.to_string());
        let Some(entry) = self.entries.get_mut(&key) else {
            return;
        };
        entry.ref_count -= 1;
        if entry.ref_count == 0 {
            let id = entry.subscription_id;
            self.entries.remove(&key);
            tracing::debug!("Cancelling {:?} subscription for {} (id {})", kind, uuid, id);
            self.remote.cancel_subscription(id);
        }
    }

    pub fn subscribe_open_file(&mut self, uuid: &str) {
        for kind in OPEN_FILE_SUBSCRIPTIONS {
            self.subscribe(kind, uuid);
        }
    }

    pub fn unsubscribe_open_file(&mut self, uuid: &str) {
        for kind in OPEN_FILE_SUBSCRIPTIONS {
            self.unsubscribe(kind, uuid);
        }
    }

    pub fn is_subscribed(&self, kind: SubscriptionKind, uuid: &str) -> bool {
        self.entries.contains_key(&(kind, uuid.to_string()))
    }

    /// Moves every subscription held for `old_uuid` over to `new_uuid`,
    /// re-registering with the provider. Used by rename when the identity
    /// changes.
    pub fn migrate(&mut self, old_uuid: &str, new_uuid: &str) {
        if old_uuid == new_uuid {
            return;
        }
        let moved: Vec<(SubscriptionKind, Entry)> = {
            let keys: Vec<_> = self
                .entries
                .keys()
                .filter(|(_, uuid)| uuid == old_uuid)
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|key| self.entries.remove(&key).map(|entry| (key.0, entry)))
                .collect()
        };
        for (kind, entry) in moved {
            self.remote.cancel_subscription(entry.subscription_id);
            let subscription_id = self.next_id;
            self.next_id += 1;
            tracing::debug!(
                "Migrating {:?} subscription from {} to {} (id {})",
                kind,
                old_uuid,
                new_uuid,
                subscription_id
            );
            self.remote.subscribe(subscription_id, kind, new_uuid);
            self.entries.insert(
                (kind, new_uuid.to_string()),
                Entry {
                    subscription_id,
                    ref_count: entry.ref_count,
                },
            );
        }
    }

    /// Drops every subscription held for `uuid` regardless of ref counts;
    /// used when the identity disappears.
    pub fn drop_identity(&mut self, uuid: &str) {
        let keys: Vec<_> = self
            .entries
            .keys()
            .filter(|(_, u)| u == uuid)
            .cloned()
            .collect();
        for key in keys {
            if let Some(entry) = self.entries.remove(&key) {
                self.remote.cancel_subscription(entry.subscription_id);
            }
        }
    }
}
