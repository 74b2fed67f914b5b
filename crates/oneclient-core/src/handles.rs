//! Open-file handle table.
//!
//! Handle ids are monotonic 64-bit integers handed to the kernel adapter.
//! Each handle owns an [`OpenFileToken`] pinning its metadata cache entry,
//! lazily built helper handles keyed by `(storage, on-storage id, proxy)`,
//! and the per-handle prefetch bookkeeping. Open flags are remembered per
//! id beyond handle teardown so a connection reset can transparently
//! reopen.

use crate::helpers::{HelperHandle, OpenFlags};
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Block-aligned cluster prefetch offsets remembered per handle.
const RECENT_PREFETCH_OFFSETS: usize = 64;

/// Move-only pin on an open metadata cache entry. Dropping the token
/// schedules the release onto the fiber.
pub struct OpenFileToken {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl OpenFileToken {
    pub fn new(release: Box<dyn FnOnce() + Send>) -> Self {
        Self {
            release: Some(release),
        }
    }
}

impl Drop for OpenFileToken {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Prefetch planner state scoped to one handle.
pub struct HandlePrefetchState {
    pub last_linear: Option<(u64, u64)>,
    pub full_prefetch_triggered: bool,
    recent_cluster_offsets: LruCache<u64, ()>,
    reads_since_evaluation: u32,
    last_evaluation: Instant,
}

impl HandlePrefetchState {
    pub fn new() -> Self {
        Self {
            last_linear: None,
            full_prefetch_triggered: false,
            recent_cluster_offsets: LruCache::new(
                NonZeroUsize::new(RECENT_PREFETCH_OFFSETS).expect("nonzero capacity"),
            ),
            reads_since_evaluation: 0,
            last_evaluation: Instant::now(),
        }
    }

    /// Gate amortising planner cost on random workloads: evaluation
    /// happens after enough reads or enough elapsed time, whichever comes
    /// first. Counting resets on a positive answer.
    pub fn should_evaluate(&mut self, min_reads: u32, min_delay: Duration) -> bool {
        self.reads_since_evaluation += 1;
        let elapsed = self.last_evaluation.elapsed();
        if self.reads_since_evaluation >= min_reads || elapsed >= min_delay {
            self.reads_since_evaluation = 0;
            self.last_evaluation = Instant::now();
            return true;
        }
        false
    }

    pub fn cluster_requested_at(&self, offset: u64) -> bool {
        self.recent_cluster_offsets.contains(&offset)
    }

    pub fn record_cluster_request(&mut self, offset: u64) {
        self.recent_cluster_offsets.push(offset, ());
    }
}

impl Default for HandlePrefetchState {
    fn default() -> Self {
        Self::new()
    }
}

type HelperKey = (String, String, bool);

pub struct FuseFileHandle {
    pub flags: OpenFlags,
    pub provider_handle_id: Option<String>,
    pub virtual_file: bool,
    pub prefetch: HandlePrefetchState,
    pub on_create_tag_set: bool,
    pub on_modify_tag_set: bool,
    helper_handles: HashMap<HelperKey, Arc<dyn HelperHandle>>,
    _token: OpenFileToken,
}

impl FuseFileHandle {
    pub fn new(
        flags: OpenFlags,
        provider_handle_id: Option<String>,
        virtual_file: bool,
        token: OpenFileToken,
    ) -> Self {
        Self {
            flags,
            provider_handle_id,
            virtual_file,
            prefetch: HandlePrefetchState::new(),
            on_create_tag_set: false,
            on_modify_tag_set: false,
            helper_handles: HashMap::new(),
            _token: token,
        }
    }

    pub fn cached_helper_handle(
        &self,
        storage_id: &str,
        file_id: &str,
        proxy: bool,
    ) -> Option<Arc<dyn HelperHandle>> {
        self.helper_handles
            .get(&(storage_id.to_string(), file_id.to_string(), proxy))
            .cloned()
    }

    pub fn store_helper_handle(
        &mut self,
        storage_id: &str,
        file_id: &str,
        proxy: bool,
        handle: Arc<dyn HelperHandle>,
    ) {
        self.helper_handles
            .insert((storage_id.to_string(), file_id.to_string(), proxy), handle);
    }

    /// Forgets one helper handle, returning it for the caller to release.
    pub fn remove_helper_handle(
        &mut self,
        storage_id: &str,
        file_id: &str,
        proxy: bool,
    ) -> Option<Arc<dyn HelperHandle>> {
        self.helper_handles
            .remove(&(storage_id.to_string(), file_id.to_string(), proxy))
    }

    pub fn helper_handles(&self) -> Vec<Arc<dyn HelperHandle>> {
        self.helper_handles.values().cloned().collect()
    }

    pub fn take_helper_handles(&mut self) -> Vec<Arc<dyn HelperHandle>> {
        self.helper_handles.drain().map(|(_, handle)| handle).collect()
    }
}

pub struct HandleTable {
    next_id: u64,
    handles: HashMap<u64, FuseFileHandle>,
    remembered_flags: HashMap<u64, OpenFlags>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            handles: HashMap::new(),
            remembered_flags: HashMap::new(),
        }
    }

    pub fn insert(&mut self, handle: FuseFileHandle) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.remembered_flags.insert(id, handle.flags);
        self.handles.insert(id, handle);
        tracing::debug!("Registered fuse handle {}", id);
        id
    }

    /// Re-registers a handle under an id issued earlier; used by
    /// reopen-on-missing so the kernel-visible id survives.
    pub fn insert_with_id(&mut self, id: u64, handle: FuseFileHandle) {
        self.remembered_flags.insert(id, handle.flags);
        self.handles.insert(id, handle);
        self.next_id = self.next_id.max(id + 1);
    }

    pub fn get(&self, id: u64) -> Option<&FuseFileHandle> {
        self.handles.get(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut FuseFileHandle> {
        self.handles.get_mut(&id)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.handles.contains_key(&id)
    }

    /// Removes a handle for good, forgetting its remembered flags.
    pub fn remove(&mut self, id: u64) -> Option<FuseFileHandle> {
        self.remembered_flags.remove(&id);
        self.handles.remove(&id)
    }

    pub fn remembered_flags(&self, id: u64) -> Option<OpenFlags> {
        self.remembered_flags.get(&id).copied()
    }

    /// Drops every live handle but keeps the flags, so ids referenced by
    /// the kernel after a connection reset can be reopened in place.
    pub fn drop_handles_keep_flags(&mut self) -> Vec<FuseFileHandle> {
        self.handles.drain().map(|(_, handle)| handle).collect()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}
