//! Storage helper cache with automatic direct/proxy access detection.
//!
//! Helpers are cached as shared completions keyed by
//! `(storage_id, force_proxy)`: concurrent requests for the same key await
//! one build, so at most one detection probe is ever in flight per key. In
//! auto mode an undetected storage answers with a proxy helper as a safe
//! fallback while the probe runs on a background thread; the probe's
//! verdict fills the direct-key completion and pins the storage's access
//! type.

use crate::config::IoMode;
use crate::error::{ClientError, Result};
use crate::helpers::{HelperFactory, HelperParams, OpenFlags, StorageHelper};
use crate::locking::{lock, SharedPromise};
use crate::proto::{HelperMode, RemoteClient, StorageTestFile};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Unknown,
    Direct,
    Proxy,
}

impl AccessType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessType::Unknown => "unknown",
            AccessType::Direct => "direct",
            AccessType::Proxy => "proxy",
        }
    }
}

type HelperResult = std::result::Result<Arc<dyn StorageHelper>, ClientError>;
type PromiseKey = (String, bool);

/// Checks whether a path is a live mount point on this machine.
pub type MountChecker = Box<dyn Fn(&Path) -> bool + Send + Sync>;

/// Default checker: scan `/proc/self/mounts` for the exact target path.
pub fn system_mount_checker() -> MountChecker {
    Box::new(|path: &Path| {
        let wanted = path.to_string_lossy();
        match std::fs::read_to_string("/proc/self/mounts") {
            Ok(mounts) => mounts
                .lines()
                .filter_map(|line| line.split_whitespace().nth(1))
                .any(|target| target == wanted),
            Err(_) => path.is_dir(),
        }
    })
}

struct Shared {
    access: Mutex<HashMap<String, AccessType>>,
    promises: Mutex<HashMap<PromiseKey, Arc<SharedPromise<HelperResult>>>>,
}

pub struct HelperCache {
    remote: RemoteClient,
    factory: Arc<dyn HelperFactory>,
    io_mode: IoMode,
    overrides: HashMap<String, HashMap<String, String>>,
    detect_attempts: u32,
    verify_delay: Duration,
    wait_timeout: Duration,
    mount_checker: Arc<MountChecker>,
    shared: Arc<Shared>,
}

impl HelperCache {
    pub fn new(
        remote: RemoteClient,
        factory: Arc<dyn HelperFactory>,
        io_mode: IoMode,
        overrides: HashMap<String, HashMap<String, String>>,
        detect_attempts: u32,
        verify_delay: Duration,
        wait_timeout: Duration,
        mount_checker: MountChecker,
    ) -> Self {
        Self {
            remote,
            factory,
            io_mode,
            overrides,
            detect_attempts,
            verify_delay,
            wait_timeout,
            mount_checker: Arc::new(mount_checker),
            shared: Arc::new(Shared {
                access: Mutex::new(HashMap::new()),
                promises: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn access_type(&self, storage_id: &str) -> AccessType {
        lock(&self.shared.access)
            .get(storage_id)
            .copied()
            .unwrap_or(AccessType::Unknown)
    }

    fn set_access_type(shared: &Shared, storage_id: &str, access: AccessType) {
        match access {
            AccessType::Unknown => {
                lock(&shared.access).remove(storage_id);
            }
            other => {
                lock(&shared.access).insert(storage_id.to_string(), other);
            }
        }
    }

    fn merged_overrides(&self, mut params: HelperParams) -> HelperParams {
        if let Some(overrides) = self.overrides.get(&params.storage_id) {
            params.apply_overrides(overrides);
        }
        params
    }

    /// Serves the completion for `key`, or claims the build: the claimant
    /// runs `build` and fulfills the promise either way.
    fn get_or_build<F>(&self, key: PromiseKey, build: F) -> Result<Arc<dyn StorageHelper>>
    where
        F: FnOnce() -> Result<Arc<dyn StorageHelper>>,
    {
        let promise = {
            let mut promises = lock(&self.shared.promises);
            if let Some(promise) = promises.get(&key) {
                let promise = Arc::clone(promise);
                drop(promises);
                return promise.wait(self.wait_timeout)?;
            }
            let promise = Arc::new(SharedPromise::new());
            promises.insert(key.clone(), Arc::clone(&promise));
            promise
        };

        match build() {
            Ok(helper) => {
                promise.fulfill(Ok(Arc::clone(&helper)));
                Ok(helper)
            }
            Err(e) => {
                promise.fulfill(Err(e.clone()));
                lock(&self.shared.promises).remove(&key);
                Err(e)
            }
        }
    }

    fn build_proxy(&self, storage_id: &str, space_id: &str) -> Result<Arc<dyn StorageHelper>> {
        let params = self
            .remote
            .get_helper_params(storage_id, space_id, HelperMode::Proxy)?;
        let params = self.merged_overrides(params);
        let helper = self.factory.create(&params, true)?;
        let mut access = lock(&self.shared.access);
        access
            .entry(storage_id.to_string())
            .or_insert(AccessType::Proxy);
        Ok(helper)
    }

    fn get_proxy(&self, storage_id: &str, space_id: &str) -> Result<Arc<dyn StorageHelper>> {
        let storage_id = storage_id.to_string();
        let space_id = space_id.to_string();
        self.get_or_build((storage_id.clone(), true), || {
            self.build_proxy(&storage_id, &space_id)
        })
    }

    fn get_forced_direct(
        &self,
        storage_id: &str,
        space_id: &str,
    ) -> Result<Arc<dyn StorageHelper>> {
        let storage = storage_id.to_string();
        let space = space_id.to_string();
        self.get_or_build((storage.clone(), false), || {
            let params = self
                .remote
                .get_helper_params(&storage, &space, HelperMode::Direct)?;
            if params.is_proxy() {
                return Err(ClientError::PermissionDenied {
                    uuid: storage.clone(),
                    op: "direct IO forced but storage reachable only via proxy".to_string(),
                });
            }
            let params = self.merged_overrides(params);
            let helper = self.factory.create(&params, false)?;
            Self::set_access_type(&self.shared, &storage, AccessType::Direct);
            Ok(helper)
        })
    }

    /// Retrieves a helper for a file on `storage_id`.
    ///
    /// `force_proxy` requests the proxy variant outright (set by the
    /// force-proxy cache after a direct IO failure). `proxy_fallback`
    /// allows serving a proxy helper while detection is still undecided.
    pub fn get(
        &self,
        file_uuid: &str,
        space_id: &str,
        storage_id: &str,
        force_proxy: bool,
        proxy_fallback: bool,
    ) -> Result<Arc<dyn StorageHelper>> {
        if self.io_mode == IoMode::ForceDirect {
            if force_proxy {
                return Err(ClientError::PermissionDenied {
                    uuid: file_uuid.to_string(),
                    op: "proxy IO requested while direct IO is forced".to_string(),
                });
            }
            return self.get_forced_direct(storage_id, space_id);
        }
        if force_proxy || self.io_mode == IoMode::ForceProxy {
            return self.get_proxy(storage_id, space_id);
        }

        match self.access_type(storage_id) {
            AccessType::Proxy => self.get_proxy(storage_id, space_id),
            AccessType::Direct => {
                let storage = storage_id.to_string();
                let space = space_id.to_string();
                self.get_or_build((storage.clone(), false), || {
                    let params = self
                        .remote
                        .get_helper_params(&storage, &space, HelperMode::Direct)?;
                    let params = self.merged_overrides(params);
                    self.factory.create(&params, false)
                })
            }
            AccessType::Unknown => self.detect_or_fallback(
                file_uuid,
                space_id,
                storage_id,
                proxy_fallback,
            ),
        }
    }

    fn detect_or_fallback(
        &self,
        file_uuid: &str,
        space_id: &str,
        storage_id: &str,
        proxy_fallback: bool,
    ) -> Result<Arc<dyn StorageHelper>> {
        let key = (storage_id.to_string(), false);
        let (promise, owns_detection) = {
            let mut promises = lock(&self.shared.promises);
            match promises.get(&key) {
                Some(promise) => (Arc::clone(promise), false),
                None => {
                    let promise = Arc::new(SharedPromise::new());
                    promises.insert(key.clone(), Arc::clone(&promise));
                    (promise, true)
                }
            }
        };

        if owns_detection {
            match self.start_detection(file_uuid, space_id, storage_id, &promise) {
                Ok(Some(helper)) => return Ok(helper),
                Ok(None) => {}
                Err(e) => {
                    promise.fulfill(Err(e.clone()));
                    lock(&self.shared.promises).remove(&key);
                    return Err(e);
                }
            }
        }

        if let Some(result) = promise.try_get() {
            return result;
        }
        if proxy_fallback {
            tracing::debug!(
                "Serving proxy helper for {} while direct access detection runs",
                storage_id
            );
            return self.get_proxy(storage_id, space_id);
        }
        promise.wait(self.wait_timeout)?
    }

    /// Fetches direct parameters and either resolves immediately (proxy
    /// reply, trusted override mount point) or spawns the probe thread.
    fn start_detection(
        &self,
        file_uuid: &str,
        space_id: &str,
        storage_id: &str,
        promise: &Arc<SharedPromise<HelperResult>>,
    ) -> Result<Option<Arc<dyn StorageHelper>>> {
        let params = self
            .remote
            .get_helper_params(storage_id, space_id, HelperMode::Direct)?;
        let params = self.merged_overrides(params);

        if params.is_proxy() {
            tracing::debug!("Provider serves {} only via proxy", storage_id);
            let helper = self.factory.create(&params, true)?;
            Self::set_access_type(&self.shared, storage_id, AccessType::Proxy);
            promise.fulfill(Ok(Arc::clone(&helper)));
            return Ok(Some(helper));
        }

        let trusted_mount = params.mount_point().map(|mount_point| {
            params.skip_storage_detection() || (self.mount_checker)(&mount_point)
        });
        if trusted_mount == Some(true) {
            tracing::info!(
                "Storage {} reachable through a local mount point, using direct IO",
                storage_id
            );
            let helper = self.factory.create(&params, false)?;
            Self::set_access_type(&self.shared, storage_id, AccessType::Direct);
            promise.fulfill(Ok(Arc::clone(&helper)));
            return Ok(Some(helper));
        }

        let remote = self.remote.clone();
        let factory = Arc::clone(&self.factory);
        let shared = Arc::clone(&self.shared);
        let overrides = self.overrides.get(storage_id).cloned().unwrap_or_default();
        let promise = Arc::clone(promise);
        let file_uuid = file_uuid.to_string();
        let space_id = space_id.to_string();
        let storage_id = storage_id.to_string();
        let attempts = self.detect_attempts;
        let verify_delay = self.verify_delay;

        let spawned = thread::Builder::new()
            .name(format!("storage-detect-{storage_id}"))
            .spawn(move || {
                run_detection(
                    remote,
                    factory,
                    shared,
                    overrides,
                    promise,
                    file_uuid,
                    space_id,
                    storage_id,
                    attempts,
                    verify_delay,
                );
            });
        if let Err(e) = spawned {
            return Err(ClientError::Io(e));
        }
        Ok(None)
    }

    /// Re-fetches parameters for `storage_id` and installs them on every
    /// cached helper instance without touching the completion identity.
    pub fn refresh_helper_parameters(&self, storage_id: &str, space_id: &str) -> Result<()> {
        let mode = match self.access_type(storage_id) {
            AccessType::Direct => HelperMode::Direct,
            _ => HelperMode::Proxy,
        };
        let params = self
            .remote
            .get_helper_params(storage_id, space_id, mode)?;
        let params = self.merged_overrides(params);
        tracing::info!("Refreshing helper parameters for storage {}", storage_id);

        let helpers: Vec<Arc<dyn StorageHelper>> = {
            let promises = lock(&self.shared.promises);
            promises
                .iter()
                .filter(|((sid, _), _)| sid.as_str() == storage_id)
                .filter_map(|(_, promise)| promise.try_get())
                .filter_map(|result| result.ok())
                .collect()
        };
        for helper in helpers {
            helper.update_params(params.clone())?;
        }
        Ok(())
    }
}

fn demote_to_proxy(
    remote: &RemoteClient,
    factory: &Arc<dyn HelperFactory>,
    shared: &Shared,
    storage_id: &str,
    space_id: &str,
    promise: &SharedPromise<HelperResult>,
    reason: &str,
) {
    tracing::warn!("Demoting storage {} to proxy IO: {}", storage_id, reason);
    HelperCache::set_access_type(shared, storage_id, AccessType::Proxy);
    let proxy = remote
        .get_helper_params(storage_id, space_id, HelperMode::Proxy)
        .and_then(|params| factory.create(&params, true));
    match proxy {
        Ok(helper) => promise.fulfill(Ok(helper)),
        Err(e) => promise.fulfill(Err(e)),
    }
}

/// One attempt at reading the probe file through the direct helper.
fn probe_read(
    helper: &Arc<dyn StorageHelper>,
    test_file: &StorageTestFile,
) -> Result<bool> {
    let handle = helper.open(&test_file.file_id, OpenFlags::ReadOnly)?;
    let expected = test_file.file_content.as_bytes();
    let data = handle.read_continuous(0, expected.len(), expected.len())?;
    let _ = handle.release();
    Ok(data.len() == expected.len() && data == expected)
}

#[allow(clippy::too_many_arguments)]
fn run_detection(
    remote: RemoteClient,
    factory: Arc<dyn HelperFactory>,
    shared: Arc<Shared>,
    overrides: HashMap<String, String>,
    promise: Arc<SharedPromise<HelperResult>>,
    file_uuid: String,
    space_id: String,
    storage_id: String,
    attempts: u32,
    verify_delay: Duration,
) {
    tracing::debug!("Starting direct IO detection for storage {}", storage_id);

    let test_file = match remote.create_storage_test_file(&file_uuid, &storage_id) {
        Ok(test_file) => test_file,
        Err(ClientError::Again) => {
            // Transient: forget the verdict so the next request re-probes,
            // but keep the current callers unblocked via proxy.
            HelperCache::set_access_type(&shared, &storage_id, AccessType::Unknown);
            demote_current_only(&remote, &factory, &shared, &storage_id, &space_id, &promise);
            return;
        }
        Err(e) => {
            demote_to_proxy(
                &remote,
                &factory,
                &shared,
                &storage_id,
                &space_id,
                &promise,
                &format!("test file creation failed: {e}"),
            );
            return;
        }
    };

    let mut params = test_file.helper_params.clone();
    params.apply_overrides(&overrides);
    let helper = match factory.create(&params, false) {
        Ok(helper) => helper,
        Err(e) => {
            demote_to_proxy(
                &remote,
                &factory,
                &shared,
                &storage_id,
                &space_id,
                &promise,
                &format!("direct helper construction failed: {e}"),
            );
            return;
        }
    };

    let mut verified = false;
    for attempt in 0..attempts.max(1) {
        match probe_read(&helper, &test_file) {
            Ok(true) => {
                verified = true;
                break;
            }
            Ok(false) => {
                tracing::debug!(
                    "Probe content mismatch on storage {} (attempt {})",
                    storage_id,
                    attempt + 1
                );
                thread::sleep(verify_delay);
            }
            Err(ClientError::Again) => {
                HelperCache::set_access_type(&shared, &storage_id, AccessType::Unknown);
                demote_current_only(&remote, &factory, &shared, &storage_id, &space_id, &promise);
                return;
            }
            Err(e) => {
                demote_to_proxy(
                    &remote,
                    &factory,
                    &shared,
                    &storage_id,
                    &space_id,
                    &promise,
                    &format!("probe read failed: {e}"),
                );
                return;
            }
        }
    }
    if !verified {
        demote_to_proxy(
            &remote,
            &factory,
            &shared,
            &storage_id,
            &space_id,
            &promise,
            "probe content never settled",
        );
        return;
    }

    // Prove write access: modify the probe file and have the provider
    // confirm it observed the new content.
    let new_content: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    let write_result = helper
        .open(&test_file.file_id, OpenFlags::ReadWrite)
        .and_then(|handle| {
            handle.write(0, new_content.as_bytes(), &mut |_| {})?;
            handle.release()
        })
        .and_then(|_| {
            remote.verify_storage_test_file(
                &storage_id,
                &test_file.space_id,
                &test_file.file_id,
                &new_content,
            )
        });
    match write_result {
        Ok(()) => {
            tracing::info!("Storage {} verified for direct IO", storage_id);
            HelperCache::set_access_type(&shared, &storage_id, AccessType::Direct);
            promise.fulfill(Ok(helper));
        }
        Err(e) => {
            demote_to_proxy(
                &remote,
                &factory,
                &shared,
                &storage_id,
                &space_id,
                &promise,
                &format!("probe verification failed: {e}"),
            );
        }
    }
}

/// Unblocks current waiters with a proxy helper without recording a proxy
/// verdict; the promise entry is removed so the next request probes again.
fn demote_current_only(
    remote: &RemoteClient,
    factory: &Arc<dyn HelperFactory>,
    shared: &Shared,
    storage_id: &str,
    space_id: &str,
    promise: &SharedPromise<HelperResult>,
) {
    let proxy = remote
        .get_helper_params(storage_id, space_id, HelperMode::Proxy)
        .and_then(|params| factory.create(&params, true));
    match proxy {
        Ok(helper) => promise.fulfill(Ok(helper)),
        Err(e) => promise.fulfill(Err(e)),
    }
    lock(&shared.promises).remove(&(storage_id.to_string(), false));
}
