//! Event streams flushed to the provider.
//!
//! The provider subscribes to client-side activity (reads, writes,
//! truncations, quota transitions) by pushing stream subscriptions with
//! flush thresholds. Events aggregate per identity inside each stream
//! buffer and are shipped when a count, size or time threshold trips, or
//! on an explicit flush.

use crate::proto::{EventSubscription, EventWire, RemoteClient, StreamKind};
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub enum Event {
    FileRead {
        uuid: String,
        offset: u64,
        size: u64,
    },
    FileWritten {
        uuid: String,
        offset: u64,
        size: u64,
    },
    FileTruncated {
        uuid: String,
        size: u64,
    },
    QuotaExceeded {
        space_id: String,
    },
}

impl Event {
    pub fn stream_kind(&self) -> StreamKind {
        match self {
            Event::FileRead { .. } => StreamKind::FileRead,
            Event::FileWritten { .. } => StreamKind::FileWritten,
            Event::FileTruncated { .. } => StreamKind::FileTruncated,
            Event::QuotaExceeded { .. } => StreamKind::QuotaExceeded,
        }
    }

    fn aggregation_key(&self) -> &str {
        match self {
            Event::FileRead { uuid, .. }
            | Event::FileWritten { uuid, .. }
            | Event::FileTruncated { uuid, .. } => uuid,
            Event::QuotaExceeded { space_id } => space_id,
        }
    }

    fn byte_range(&self) -> Option<(u64, u64)> {
        match self {
            Event::FileRead { offset, size, .. } | Event::FileWritten { offset, size, .. } => {
                Some((*offset, *offset + *size))
            }
            Event::FileTruncated { .. } | Event::QuotaExceeded { .. } => None,
        }
    }

    fn byte_count(&self) -> u64 {
        match self {
            Event::FileRead { size, .. }
            | Event::FileWritten { size, .. }
            | Event::FileTruncated { size, .. } => *size,
            Event::QuotaExceeded { .. } => 0,
        }
    }
}

fn coalesce_ranges(ranges: &mut Vec<(u64, u64)>) {
    ranges.sort_unstable();
    let mut merged: Vec<(u64, u64)> = Vec::with_capacity(ranges.len());
    for &(start, end) in ranges.iter() {
        match merged.last_mut() {
            Some((_, last_end)) if *last_end >= start => {
                *last_end = (*last_end).max(end);
            }
            _ => merged.push((start, end)),
        }
    }
    *ranges = merged;
}

struct StreamBuffer {
    subscription: EventSubscription,
    entries: HashMap<String, EventWire>,
    pending_count: u64,
    pending_size: u64,
    last_flush: Instant,
}

impl StreamBuffer {
    fn new(subscription: EventSubscription) -> Self {
        Self {
            subscription,
            entries: HashMap::new(),
            pending_count: 0,
            pending_size: 0,
            last_flush: Instant::now(),
        }
    }

    fn absorb(&mut self, event: &Event) {
        let key = event.aggregation_key().to_string();
        let entry = self.entries.entry(key.clone()).or_insert_with(|| EventWire {
            kind: self.subscription.kind,
            uuid: key,
            count: 0,
            size: 0,
            blocks: Vec::new(),
        });
        entry.count += 1;
        entry.size += event.byte_count();
        if let Some(range) = event.byte_range() {
            entry.blocks.push(range);
            coalesce_ranges(&mut entry.blocks);
        }
        self.pending_count += 1;
        self.pending_size += event.byte_count();
    }

    fn thresholds_tripped(&self) -> bool {
        if let Some(count) = self.subscription.count_threshold {
            if self.pending_count >= count {
                return true;
            }
        }
        if let Some(size) = self.subscription.size_threshold {
            if self.pending_size >= size {
                return true;
            }
        }
        false
    }

    fn time_tripped(&self, now: Instant) -> bool {
        match self.subscription.time_threshold_ms {
            Some(ms) => {
                !self.entries.is_empty()
                    && now.duration_since(self.last_flush) >= Duration::from_millis(ms)
            }
            None => false,
        }
    }

    fn take_batch(&mut self, now: Instant) -> Vec<EventWire> {
        self.pending_count = 0;
        self.pending_size = 0;
        self.last_flush = now;
        let mut batch: Vec<EventWire> = self.entries.drain().map(|(_, wire)| wire).collect();
        batch.sort_by(|a, b| a.uuid.cmp(&b.uuid));
        batch
    }
}

pub struct EventManager {
    remote: RemoteClient,
    streams: HashMap<i64, StreamBuffer>,
}

impl EventManager {
    pub fn new(remote: RemoteClient) -> Self {
        Self {
            remote,
            streams: HashMap::new(),
        }
    }

    /// Installs or updates a server-requested stream.
    pub fn add_subscription(&mut self, subscription: EventSubscription) {
        tracing::debug!(
            "Event stream {} for {:?} installed",
            subscription.id,
            subscription.kind
        );
        match self.streams.get_mut(&subscription.id) {
            Some(stream) => stream.subscription = subscription,
            None => {
                self.streams
                    .insert(subscription.id, StreamBuffer::new(subscription));
            }
        }
    }

    /// Tears a stream down, dropping whatever it buffered.
    pub fn cancel_subscription(&mut self, id: i64) {
        if self.streams.remove(&id).is_some() {
            tracing::debug!("Event stream {} cancelled", id);
        }
    }

    pub fn has_stream_for(&self, kind: StreamKind) -> bool {
        self.streams
            .values()
            .any(|stream| stream.subscription.kind == kind)
    }

    /// Routes an event into every interested stream, flushing streams
    /// whose count or size thresholds trip.
    pub fn emit(&mut self, event: Event) {
        let kind = event.stream_kind();
        let mut ready = Vec::new();
        for (id, stream) in self.streams.iter_mut() {
            if stream.subscription.kind != kind {
                continue;
            }
            stream.absorb(&event);
            if stream.thresholds_tripped() {
                ready.push(*id);
            }
        }
        for id in ready {
            self.flush_stream(id);
        }
    }

    pub fn flush_stream(&mut self, id: i64) {
        let Some(stream) = self.streams.get_mut(&id) else {
            return;
        };
        let batch = stream.take_batch(Instant::now());
        if batch.is_empty() {
            return;
        }
        tracing::debug!("Flushing {} aggregated events on stream {}", batch.len(), id);
        self.remote.emit_events(batch);
    }

    /// Flushes every stream regardless of thresholds.
    pub fn flush(&mut self) {
        let ids: Vec<i64> = self.streams.keys().copied().collect();
        for id in ids {
            self.flush_stream(id);
        }
    }

    /// Flushes streams whose time threshold has elapsed; called from the
    /// periodic tick.
    pub fn flush_expired(&mut self) {
        let now = Instant::now();
        let ids: Vec<i64> = self
            .streams
            .iter()
            .filter(|(_, stream)| stream.time_tripped(now))
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.flush_stream(id);
        }
    }

    /// Drops all streams and buffered events, e.g. on reconnect.
    pub fn reset(&mut self) {
        self.streams.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::proto::{Provider, ProviderRequest, ProviderResponse};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingProvider {
        batches: Mutex<Vec<Vec<EventWire>>>,
    }

    impl Provider for RecordingProvider {
        fn communicate(
            &self,
            _request: ProviderRequest,
            _timeout: Duration,
        ) -> Result<ProviderResponse> {
            Ok(ProviderResponse::Ok)
        }

        fn post(&self, request: ProviderRequest) {
            if let ProviderRequest::Events { events } = request {
                self.batches.lock().unwrap().push(events);
            }
        }
    }

    fn manager() -> (EventManager, Arc<RecordingProvider>) {
        let provider = Arc::new(RecordingProvider::default());
        let remote = RemoteClient::new(provider.clone(), Duration::from_secs(5));
        (EventManager::new(remote), provider)
    }

    fn read_subscription(id: i64, count: Option<u64>) -> EventSubscription {
        EventSubscription {
            id,
            kind: StreamKind::FileRead,
            time_threshold_ms: None,
            count_threshold: count,
            size_threshold: None,
        }
    }

    fn read_event(uuid: &str, offset: u64, size: u64) -> Event {
        Event::FileRead {
            uuid: uuid.to_string(),
            offset,
            size,
        }
    }

    #[test]
    fn events_without_streams_are_dropped() {
        let (mut manager, provider) = manager();
        manager.emit(read_event("u1", 0, 10));
        manager.flush();
        assert!(provider.batches.lock().unwrap().is_empty());
    }

    #[test]
    fn count_threshold_triggers_flush() {
        let (mut manager, provider) = manager();
        manager.add_subscription(read_subscription(1, Some(3)));

        manager.emit(read_event("u1", 0, 10));
        manager.emit(read_event("u1", 10, 10));
        assert!(provider.batches.lock().unwrap().is_empty());

        manager.emit(read_event("u1", 20, 10));
        let batches = provider.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        let wire = &batches[0][0];
        assert_eq!(wire.count, 3);
        assert_eq!(wire.size, 30);
        // Touching ranges coalesce into one block.
        assert_eq!(wire.blocks, vec![(0, 30)]);
    }

    #[test]
    fn events_aggregate_per_identity() {
        let (mut manager, provider) = manager();
        manager.add_subscription(read_subscription(1, None));

        manager.emit(read_event("u1", 0, 5));
        manager.emit(read_event("u2", 100, 5));
        manager.emit(read_event("u1", 50, 5));
        manager.flush();

        let batches = provider.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        let batch = &batches[0];
        assert_eq!(batch.len(), 2);
        let u1 = batch.iter().find(|w| w.uuid == "u1").unwrap();
        assert_eq!(u1.count, 2);
        assert_eq!(u1.blocks, vec![(0, 5), (50, 55)]);
    }

    #[test]
    fn size_threshold_triggers_flush() {
        let (mut manager, provider) = manager();
        manager.add_subscription(EventSubscription {
            id: 1,
            kind: StreamKind::FileWritten,
            time_threshold_ms: None,
            count_threshold: None,
            size_threshold: Some(100),
        });

        manager.emit(Event::FileWritten {
            uuid: "u1".to_string(),
            offset: 0,
            size: 150,
        });
        assert_eq!(provider.batches.lock().unwrap().len(), 1);
    }

    #[test]
    fn flush_expired_respects_time_threshold() {
        let (mut manager, provider) = manager();
        manager.add_subscription(EventSubscription {
            id: 1,
            kind: StreamKind::FileRead,
            time_threshold_ms: Some(0),
            count_threshold: None,
            size_threshold: None,
        });
        manager.emit(read_event("u1", 0, 1));
        manager.flush_expired();
        assert_eq!(provider.batches.lock().unwrap().len(), 1);

        // Nothing buffered, nothing flushed.
        manager.flush_expired();
        assert_eq!(provider.batches.lock().unwrap().len(), 1);
    }

    #[test]
    fn cancellation_drops_buffered_events() {
        let (mut manager, provider) = manager();
        manager.add_subscription(read_subscription(1, None));
        manager.emit(read_event("u1", 0, 1));
        manager.cancel_subscription(1);
        manager.flush();
        assert!(provider.batches.lock().unwrap().is_empty());
    }

    #[test]
    fn subscription_update_keeps_buffered_events() {
        let (mut manager, provider) = manager();
        manager.add_subscription(read_subscription(1, None));
        manager.emit(read_event("u1", 0, 1));
        // Update tightens the threshold without dropping the buffer.
        manager.add_subscription(read_subscription(1, Some(1)));
        manager.emit(read_event("u1", 1, 1));
        assert_eq!(provider.batches.lock().unwrap().len(), 1);
        assert_eq!(provider.batches.lock().unwrap()[0][0].count, 2);
    }

    #[test]
    fn reset_drops_streams() {
        let (mut manager, provider) = manager();
        manager.add_subscription(read_subscription(1, None));
        manager.emit(read_event("u1", 0, 1));
        manager.reset();
        manager.flush();
        assert!(provider.batches.lock().unwrap().is_empty());
        assert!(!manager.has_stream_for(StreamKind::FileRead));
    }
}
