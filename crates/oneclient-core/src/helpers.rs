//! Capability seams for storage back-ends.
//!
//! Concrete helpers (POSIX, S3, Ceph, WebDAV, the provider-tunnelled
//! proxy) live outside this crate; the engine only sees these traits. An
//! in-memory implementation backs the test suites and virtual-fs style
//! adapters.

use crate::error::{ClientError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Helper kind name the provider uses for proxy-tunnelled IO.
pub const PROXY_HELPER_NAME: &str = "proxy";
/// Helper kind name for plain POSIX mounts.
pub const POSIX_HELPER_NAME: &str = "posix";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenFlags {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl OpenFlags {
    pub fn is_readable(&self) -> bool {
        matches!(self, OpenFlags::ReadOnly | OpenFlags::ReadWrite)
    }

    pub fn is_writable(&self) -> bool {
        matches!(self, OpenFlags::WriteOnly | OpenFlags::ReadWrite)
    }

    pub fn from_libc(flags: i32) -> Self {
        match flags & libc::O_ACCMODE {
            libc::O_WRONLY => OpenFlags::WriteOnly,
            libc::O_RDWR => OpenFlags::ReadWrite,
            _ => OpenFlags::ReadOnly,
        }
    }
}

/// Provider-supplied description of a storage back-end, merged with any
/// command-line overrides before a helper is constructed from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelperParams {
    pub storage_id: String,
    /// Back-end kind, e.g. `posix`, `s3`, `ceph`, `webdav` or `proxy`.
    pub name: String,
    pub args: HashMap<String, String>,
}

impl HelperParams {
    pub fn is_proxy(&self) -> bool {
        self.name == PROXY_HELPER_NAME
    }

    pub fn mount_point(&self) -> Option<PathBuf> {
        self.args.get("mountPoint").map(PathBuf::from)
    }

    pub fn skip_storage_detection(&self) -> bool {
        self.args
            .get("skipStorageDetection")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false)
    }

    /// Overlays override arguments on top of the provider-supplied ones.
    pub fn apply_overrides(&mut self, overrides: &HashMap<String, String>) {
        for (key, value) in overrides {
            self.args.insert(key.clone(), value.clone());
        }
    }
}

/// One storage back-end. Implementations must be safe to share across
/// threads; all blocking happens inside the calls.
pub trait StorageHelper: Send + Sync {
    fn storage_id(&self) -> &str;

    /// Whether IO tunnels through the provider instead of reaching the
    /// storage directly.
    fn is_proxy(&self) -> bool;

    /// Whether reads transferred from a remote replica need a checksum
    /// comparison before being trusted.
    fn needs_consistency_check(&self) -> bool {
        false
    }

    fn open(&self, file_id: &str, flags: OpenFlags) -> Result<Arc<dyn HelperHandle>>;

    /// Installs refreshed parameters (e.g. after a credential rotation)
    /// without invalidating outstanding handles.
    fn update_params(&self, params: HelperParams) -> Result<()>;
}

/// An open file on one storage back-end.
pub trait HelperHandle: Send + Sync {
    /// Reads up to `size` bytes at `offset`. `continuous_hint` is the
    /// number of bytes known to be readable without another replica
    /// lookup; buffering helpers use it to bound read-ahead.
    fn read_continuous(&self, offset: u64, size: usize, continuous_hint: usize)
        -> Result<Vec<u8>>;

    /// Writes `data` at `offset`, invoking `on_written` per acknowledged
    /// chunk. Returns the total bytes written.
    fn write(
        &self,
        offset: u64,
        data: &[u8],
        on_written: &mut dyn FnMut(usize),
    ) -> Result<usize>;

    /// Flushes any buffering layer down to the storage itself.
    fn flush_underlying(&self) -> Result<()>;

    fn fsync(&self, data_only: bool) -> Result<()>;

    fn release(&self) -> Result<()>;

    /// How many bytes past a read at `(offset, size)` this helper would
    /// read ahead on its own; the prefetch planner doubles this.
    fn would_prefetch(&self, _offset: u64, _size: usize) -> u64 {
        0
    }
}

/// Builds helper instances from provider parameters. The indirection lets
/// virtual-fs adapters plug into the same surface as real storages.
pub trait HelperFactory: Send + Sync {
    fn create(&self, params: &HelperParams, proxy: bool) -> Result<Arc<dyn StorageHelper>>;
}

type FileStore = Arc<Mutex<HashMap<String, Vec<u8>>>>;

/// In-memory storage backend: one byte-vector per on-storage file id.
/// Direct and proxy instances built for the same storage share content.
/// Reads and writes on a *direct* instance can be made to fail with an
/// injected errno, which the tests use to drive proxy fallback.
pub struct InMemoryHelper {
    storage_id: String,
    proxy: bool,
    consistency_check: bool,
    files: FileStore,
    params: Mutex<HelperParams>,
    fault: Arc<Mutex<Option<i32>>>,
}

impl InMemoryHelper {
    fn new(
        params: HelperParams,
        proxy: bool,
        consistency_check: bool,
        files: FileStore,
        fault: Arc<Mutex<Option<i32>>>,
    ) -> Self {
        Self {
            storage_id: params.storage_id.clone(),
            proxy,
            consistency_check,
            files,
            params: Mutex::new(params),
            fault,
        }
    }

    pub fn current_params(&self) -> HelperParams {
        self.params.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl StorageHelper for InMemoryHelper {
    fn storage_id(&self) -> &str {
        &self.storage_id
    }

    fn is_proxy(&self) -> bool {
        self.proxy
    }

    fn needs_consistency_check(&self) -> bool {
        self.consistency_check
    }

    fn open(&self, file_id: &str, flags: OpenFlags) -> Result<Arc<dyn HelperHandle>> {
        tracing::debug!(
            "Opening in-memory file {} on storage {} ({:?})",
            file_id,
            self.storage_id,
            flags
        );
        Ok(Arc::new(InMemoryHandle {
            file_id: file_id.to_string(),
            flags,
            files: Arc::clone(&self.files),
            fault: if self.proxy {
                Arc::new(Mutex::new(None))
            } else {
                Arc::clone(&self.fault)
            },
        }))
    }

    fn update_params(&self, params: HelperParams) -> Result<()> {
        *self.params.lock().unwrap_or_else(|e| e.into_inner()) = params;
        Ok(())
    }
}

pub struct InMemoryHandle {
    file_id: String,
    flags: OpenFlags,
    files: FileStore,
    fault: Arc<Mutex<Option<i32>>>,
}

impl InMemoryHandle {
    fn check_fault(&self) -> Result<()> {
        if let Some(errno) = *self.fault.lock().unwrap_or_else(|e| e.into_inner()) {
            return Err(ClientError::from_errno(errno, &self.file_id));
        }
        Ok(())
    }
}

impl HelperHandle for InMemoryHandle {
    fn read_continuous(
        &self,
        offset: u64,
        size: usize,
        _continuous_hint: usize,
    ) -> Result<Vec<u8>> {
        self.check_fault()?;
        if !self.flags.is_readable() {
            return Err(ClientError::PermissionDenied {
                uuid: self.file_id.clone(),
                op: "read".to_string(),
            });
        }
        let files = self.files.lock().unwrap_or_else(|e| e.into_inner());
        let data = files.get(&self.file_id).ok_or_else(|| ClientError::NotFound {
            uuid: self.file_id.clone(),
        })?;
        let start = (offset as usize).min(data.len());
        let end = (start + size).min(data.len());
        Ok(data[start..end].to_vec())
    }

    fn write(
        &self,
        offset: u64,
        data: &[u8],
        on_written: &mut dyn FnMut(usize),
    ) -> Result<usize> {
        self.check_fault()?;
        if !self.flags.is_writable() {
            return Err(ClientError::PermissionDenied {
                uuid: self.file_id.clone(),
                op: "write".to_string(),
            });
        }
        let mut files = self.files.lock().unwrap_or_else(|e| e.into_inner());
        let content = files.entry(self.file_id.clone()).or_default();
        let end = offset as usize + data.len();
        if content.len() < end {
            content.resize(end, 0);
        }
        content[offset as usize..end].copy_from_slice(data);
        on_written(data.len());
        Ok(data.len())
    }

    fn flush_underlying(&self) -> Result<()> {
        Ok(())
    }

    fn fsync(&self, _data_only: bool) -> Result<()> {
        self.check_fault()
    }

    fn release(&self) -> Result<()> {
        Ok(())
    }

    fn would_prefetch(&self, _offset: u64, size: usize) -> u64 {
        size as u64
    }
}

#[derive(Default)]
struct StorageState {
    files: Option<FileStore>,
    fault: Option<Arc<Mutex<Option<i32>>>>,
}

/// Factory producing [`InMemoryHelper`] instances with per-storage shared
/// content and fault injection.
#[derive(Default)]
pub struct InMemoryHelperFactory {
    storages: Mutex<HashMap<String, StorageState>>,
    consistency_check: bool,
}

impl InMemoryHelperFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_consistency_check() -> Self {
        Self {
            storages: Mutex::new(HashMap::new()),
            consistency_check: true,
        }
    }

    /// Content store for a storage; lets tests seed on-storage files.
    pub fn files(&self, storage_id: &str) -> FileStore {
        let mut storages = self.storages.lock().unwrap_or_else(|e| e.into_inner());
        let state = storages.entry(storage_id.to_string()).or_default();
        Arc::clone(
            state
                .files
                .get_or_insert_with(|| Arc::new(Mutex::new(HashMap::new()))),
        )
    }

    /// Makes direct IO on `storage_id` fail with `errno`; `None` clears.
    pub fn set_direct_fault(&self, storage_id: &str, errno: Option<i32>) {
        let mut storages = self.storages.lock().unwrap_or_else(|e| e.into_inner());
        let state = storages.entry(storage_id.to_string()).or_default();
        let fault = state
            .fault
            .get_or_insert_with(|| Arc::new(Mutex::new(None)));
        *fault.lock().unwrap_or_else(|e| e.into_inner()) = errno;
    }

    fn state_for(&self, storage_id: &str) -> (FileStore, Arc<Mutex<Option<i32>>>) {
        let mut storages = self.storages.lock().unwrap_or_else(|e| e.into_inner());
        let state = storages.entry(storage_id.to_string()).or_default();
        let files = Arc::clone(
            state
                .files
                .get_or_insert_with(|| Arc::new(Mutex::new(HashMap::new()))),
        );
        let fault = Arc::clone(
            state
                .fault
                .get_or_insert_with(|| Arc::new(Mutex::new(None))),
        );
        (files, fault)
    }
}

impl HelperFactory for InMemoryHelperFactory {
    fn create(&self, params: &HelperParams, proxy: bool) -> Result<Arc<dyn StorageHelper>> {
        let (files, fault) = self.state_for(&params.storage_id);
        Ok(Arc::new(InMemoryHelper::new(
            params.clone(),
            proxy,
            self.consistency_check,
            files,
            fault,
        )))
    }
}
