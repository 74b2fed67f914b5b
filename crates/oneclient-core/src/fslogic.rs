//! Filesystem logic dispatcher.
//!
//! The heart of the client: every kernel-adapter operation enters here,
//! runs its cache mutations as steps on the engine fiber, performs
//! provider RPC and helper I/O between steps, and applies the retry
//! envelope around recoverable failures. The dispatcher also owns the
//! symlink and xattr translation and binds cache lifecycle transitions to
//! the subscription registry.

use crate::attrs::{FileAttributes, SetAttrChanges};
use crate::cdmi;
use crate::config::{ClientConfig, PrefetchMode};
use crate::error::{ClientError, Result};
use crate::events::{Event, EventManager};
use crate::fiber::{FiberLoop, PeriodicTimer};
use crate::force_proxy::ForceProxyCache;
use crate::handles::{FuseFileHandle, HandleTable, OpenFileToken};
use crate::helper_cache::{system_mount_checker, HelperCache, MountChecker};
use crate::helpers::{HelperFactory, HelperHandle, OpenFlags};
use crate::ident;
use crate::iotrace::{IoTraceEntry, IoTraceLogger};
use crate::locking::lock;
use crate::metadata_cache::{CacheEvent, MetadataCache};
use crate::prefetch::{self, PrefetchKind, PrefetchSnapshot, SYNC_PRIORITY_IMMEDIATE};
use crate::proto::{Provider, PushMessage, RemoteClient, SubscriptionKind};
use crate::readdir_cache::{ReaddirCache, ReaddirOptions};
use crate::subscriptions::SubscriptionRegistry;
use crate::symlinks;
use crate::xattr;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Filename prefix resolving directly to a provider identity, bypassing
/// the parent-child lookup.
pub const FILE_ID_ACCESS_PREFIX: &str = ".__onedata__file_id__";

const MODE_MASK: u32 = 0o7777;
const STATFS_BLOCK_SIZE: u64 = 4096;
const STATFS_NAME_MAX: u32 = 255;
const STATFS_FREE_INODES: u64 = 10_000_000;
const STATFS_MAX_SPACES: usize = 1024;
const EVENT_FLUSH_TICK: Duration = Duration::from_millis(500);

/// statfs reply in kernel-adapter shape.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FsStatsReply {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub frsize: u32,
    pub namelen: u32,
}

/// Engine state owned by the fiber: every cache the dispatcher mutates.
struct Engine {
    config: Arc<ClientConfig>,
    remote: RemoteClient,
    root_uuid: String,
    metadata: MetadataCache,
    readdir: ReaddirCache,
    handles: HandleTable,
    events: EventManager,
    subscriptions: SubscriptionRegistry,
    disabled_spaces: HashSet<String>,
}

impl Engine {
    /// Binds cache lifecycle transitions to subscriptions and dependent
    /// caches.
    fn apply_cache_events(&mut self, events: Vec<CacheEvent>) {
        for event in events {
            match event {
                CacheEvent::Opened(uuid) => self.subscriptions.subscribe_open_file(&uuid),
                CacheEvent::Released(uuid) => self.subscriptions.unsubscribe_open_file(&uuid),
                CacheEvent::Renamed { old, new } => self.subscriptions.migrate(&old, &new),
                CacheEvent::DroppedFile(uuid) => self.subscriptions.drop_identity(&uuid),
                CacheEvent::DroppedDirectory(uuid) => {
                    self.subscriptions.drop_identity(&uuid);
                    self.readdir.invalidate(&uuid);
                }
                CacheEvent::Added(_) | CacheEvent::MarkedDeleted(_) => {}
            }
        }
    }

    fn readdir_options(&self) -> ReaddirOptions {
        ReaddirOptions {
            chunk_size: self.config.readdir_prefetch_size,
            only_full_replicas: self.config.show_only_full_replicas,
            include_link_count: self.config.show_hard_link_count,
        }
    }
}

enum IoPrep {
    Reopen,
    Empty,
    QuotaExceeded {
        space_id: String,
    },
    NeedSync {
        start: u64,
        end: u64,
        needs_checksum: bool,
        wanted_len: usize,
    },
    Ready {
        helper_handle: Arc<dyn HelperHandle>,
        storage_id: String,
        file_id: String,
        proxy: bool,
        available_end: u64,
        wanted_end: u64,
        needs_consistency_check: bool,
    },
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

pub struct FsLogic {
    config: Arc<ClientConfig>,
    remote: RemoteClient,
    fiber: Arc<FiberLoop<Engine>>,
    helper_cache: Arc<HelperCache>,
    force_proxy: Arc<ForceProxyCache>,
    iotrace: Option<Arc<IoTraceLogger>>,
    root_uuid: String,
    timers: Mutex<Vec<PeriodicTimer>>,
    stopped: AtomicBool,
}

impl FsLogic {
    pub fn new(
        config: ClientConfig,
        provider: Arc<dyn Provider>,
        factory: Arc<dyn HelperFactory>,
    ) -> Result<Self> {
        Self::with_mount_checker(config, provider, factory, system_mount_checker())
    }

    pub fn with_mount_checker(
        config: ClientConfig,
        provider: Arc<dyn Provider>,
        factory: Arc<dyn HelperFactory>,
        mount_checker: MountChecker,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let remote = RemoteClient::new(provider, config.provider_timeout());

        // Mount-time handshake; failures here abort the mount.
        let configuration = remote.get_configuration()?;
        let root_uuid = if configuration.root_uuid.is_empty() {
            config.root_uuid.clone()
        } else {
            configuration.root_uuid.clone()
        };
        tracing::info!("Session configured, root identity {}", root_uuid);

        let metadata = MetadataCache::new(
            remote.clone(),
            root_uuid.clone(),
            config.metadata_cache_size,
            config.directory_cache_drop_after(),
        );
        let mut events = EventManager::new(remote.clone());
        for subscription in configuration.subscriptions {
            events.add_subscription(subscription);
        }
        let subscriptions = SubscriptionRegistry::new(remote.clone());
        let engine = Engine {
            config: Arc::clone(&config),
            remote: remote.clone(),
            root_uuid: root_uuid.clone(),
            metadata,
            readdir: ReaddirCache::new(),
            handles: HandleTable::new(),
            events,
            subscriptions,
            disabled_spaces: configuration.disabled_spaces.into_iter().collect(),
        };
        let fiber = Arc::new(FiberLoop::new("fslogic", engine));

        let helper_cache = Arc::new(HelperCache::new(
            remote.clone(),
            factory,
            config.io_mode,
            config.helper_override_params.clone(),
            config.storage_detection_attempts,
            Duration::from_secs(config.storage_detection_retry_delay_secs),
            config.provider_timeout(),
            mount_checker,
        ));

        let force_proxy = Arc::new(ForceProxyCache::new());
        let fiber_on_add = Arc::clone(&fiber);
        force_proxy.on_add(Box::new(move |uuid| {
            let uuid = uuid.to_string();
            fiber_on_add.post(move |engine| {
                engine
                    .subscriptions
                    .subscribe(SubscriptionKind::PermissionChanged, &uuid);
            });
        }));
        let fiber_on_remove = Arc::clone(&fiber);
        force_proxy.on_remove(Box::new(move |uuid| {
            let uuid = uuid.to_string();
            fiber_on_remove.post(move |engine| {
                engine
                    .subscriptions
                    .unsubscribe(SubscriptionKind::PermissionChanged, &uuid);
            });
        }));

        let iotrace = if config.io_trace_logger_enabled {
            Some(Arc::new(IoTraceLogger::create(&config.log_dir_path)?))
        } else {
            None
        };

        let mut timers = Vec::new();
        if let Some(drop_after) = config.directory_cache_drop_after() {
            let interval = (drop_after / 2).max(Duration::from_secs(1));
            timers.push(PeriodicTimer::spawn(
                "dir-prune",
                interval,
                Arc::clone(&fiber),
                |engine| {
                    let events = engine.metadata.prune_expired_directories();
                    engine.apply_cache_events(events);
                },
            ));
        }
        timers.push(PeriodicTimer::spawn(
            "event-flush",
            EVENT_FLUSH_TICK,
            Arc::clone(&fiber),
            |engine| engine.events.flush_expired(),
        ));

        Ok(Self {
            config,
            remote,
            fiber,
            helper_cache,
            force_proxy,
            iotrace,
            root_uuid,
            timers: Mutex::new(timers),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn root_uuid(&self) -> &str {
        &self.root_uuid
    }

    pub fn access_type(&self, storage_id: &str) -> crate::helper_cache::AccessType {
        self.helper_cache.access_type(storage_id)
    }

    /// Whether direct IO has been abandoned for `uuid`.
    pub fn is_proxy_forced(&self, uuid: &str) -> bool {
        self.force_proxy.contains(uuid)
    }

    /// Flushes buffered events and closes the provider session; called
    /// once on unmount.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Stopping filesystem logic");
        for timer in lock(&self.timers).iter_mut() {
            timer.stop();
        }
        let _ = self.fiber.run(|engine| engine.events.flush());
        if let Err(e) = self.remote.close_session() {
            tracing::warn!("Closing provider session failed: {}", e);
        }
        if let Some(iotrace) = &self.iotrace {
            iotrace.flush();
        }
        self.fiber.shutdown();
    }

    fn run<R, F>(&self, step: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Engine) -> Result<R> + Send + 'static,
    {
        self.fiber.run(step)?
    }

    fn retry_delay(&self, retries_left: u32) {
        let (min_ms, max_ms) = self.config.retry_delay_range(retries_left);
        let delay = rand::thread_rng().gen_range(min_ms..=max_ms);
        tracing::info!(
            "Retrying operation after {}ms, retries left: {}",
            delay,
            retries_left
        );
        std::thread::sleep(Duration::from_millis(delay));
    }

    /// Retry envelope for operations without specialised error handling.
    fn with_retry<T, F>(&self, operation: &'static str, f: F) -> Result<T>
    where
        F: Fn(&Self) -> Result<T>,
    {
        let mut retries_left = self.config.max_retries;
        loop {
            match f(self) {
                Err(e) if e.is_recoverable() && retries_left > 0 => {
                    tracing::debug!("{} failed with recoverable error: {}", operation, e);
                    self.retry_delay(retries_left);
                    retries_left -= 1;
                }
                other => return other,
            }
        }
    }

    fn trace(&self, entry: IoTraceEntry) {
        if let Some(iotrace) = &self.iotrace {
            iotrace.log(&entry);
        }
    }

    fn open_file_token(&self, uuid: &str) -> OpenFileToken {
        let fiber = Arc::clone(&self.fiber);
        let uuid = uuid.to_string();
        OpenFileToken::new(Box::new(move || {
            fiber.post(move |engine| {
                let events = engine.metadata.release(&uuid);
                engine.apply_cache_events(events);
            });
        }))
    }

    /// Resolves the file-id access prefix, if `name` carries one.
    fn uuid_from_name(name: &str) -> Result<Option<String>> {
        match name.strip_prefix(FILE_ID_ACCESS_PREFIX) {
            Some(object_id) => cdmi::object_id_to_uuid(object_id).map(Some),
            None => Ok(None),
        }
    }

    /// Symlinks report the resolved target length as their size.
    fn substitute_symlink_size(&self, mut attr: FileAttributes) -> Result<FileAttributes> {
        if attr.file_type == crate::attrs::FileType::Symlink {
            let target = self.readlink(&attr.uuid)?;
            attr.size = Some(target.len() as u64);
        }
        Ok(attr)
    }

    // ---- metadata operations -------------------------------------------------

    pub fn lookup(&self, parent_uuid: &str, name: &str) -> Result<FileAttributes> {
        if let Some(uuid) = Self::uuid_from_name(name)? {
            return self.getattr(&uuid);
        }
        let attr = self.with_retry("lookup", |this| {
            let parent = parent_uuid.to_string();
            let name = name.to_string();
            this.run(move |engine| {
                let (attr, events) = engine.metadata.ensure_child_attr(&parent, &name)?;
                engine.apply_cache_events(events);
                Ok(attr)
            })
        })?;
        self.substitute_symlink_size(attr)
    }

    pub fn getattr(&self, uuid: &str) -> Result<FileAttributes> {
        let attr = self.with_retry("getattr", |this| {
            let uuid = uuid.to_string();
            this.run(move |engine| {
                let (attr, events) = engine.metadata.ensure_attr(&uuid)?;
                engine.apply_cache_events(events);
                Ok(attr)
            })
        })?;
        self.substitute_symlink_size(attr)
    }

    pub fn setattr(&self, uuid: &str, changes: &SetAttrChanges) -> Result<FileAttributes> {
        if changes.is_empty() {
            return self.getattr(uuid);
        }
        self.with_retry("setattr", |this| {
            if let Some(size) = changes.size {
                this.remote.truncate(uuid, size)?;
                let uuid_owned = uuid.to_string();
                this.run(move |engine| {
                    engine.metadata.truncate(&uuid_owned, size);
                    engine.events.emit(Event::FileTruncated {
                        uuid: uuid_owned.clone(),
                        size,
                    });
                    Ok(())
                })?;
            }
            if let Some(mode) = changes.mode {
                this.remote.change_mode(uuid, mode & MODE_MASK)?;
                let uuid_owned = uuid.to_string();
                this.run(move |engine| {
                    engine.metadata.change_mode(&uuid_owned, mode);
                    Ok(())
                })?;
            }
            if changes.atime.is_some() || changes.mtime.is_some() {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0);
                this.remote
                    .update_times(uuid, changes.atime, changes.mtime, Some(now))?;
                let uuid_owned = uuid.to_string();
                let (atime, mtime) = (changes.atime, changes.mtime);
                this.run(move |engine| {
                    engine
                        .metadata
                        .update_times(&uuid_owned, atime, mtime, Some(now));
                    Ok(())
                })?;
            }
            Ok(())
        })?;
        self.getattr(uuid)
    }

    pub fn mkdir(&self, parent_uuid: &str, name: &str, mode: u32) -> Result<FileAttributes> {
        self.with_retry("mkdir", |this| {
            let parent = parent_uuid.to_string();
            this.run(move |engine| {
                let (attr, events) = engine.metadata.ensure_attr(&parent)?;
                engine.apply_cache_events(events);
                if !attr.is_directory() {
                    return Err(ClientError::NotDirectory { uuid: parent });
                }
                Ok(())
            })?;
            this.remote.create_dir(parent_uuid, name, mode & MODE_MASK)?;
            let parent = parent_uuid.to_string();
            this.run(move |engine| {
                engine.readdir.invalidate(&parent);
                Ok(())
            })?;
            self.lookup(parent_uuid, name)
        })
    }

    fn reject_special_modes(mode: u32, op: &'static str) -> Result<()> {
        let file_type = mode & libc::S_IFMT;
        if file_type != 0 && file_type != libc::S_IFREG {
            tracing::warn!("Rejecting {} of non-regular file type {:o}", op, file_type);
            return Err(ClientError::NotSupported { op: op.to_string() });
        }
        Ok(())
    }

    pub fn mknod(&self, parent_uuid: &str, name: &str, mode: u32) -> Result<FileAttributes> {
        Self::reject_special_modes(mode, "mknod")?;
        self.with_retry("mknod", |this| {
            let attr = this.remote.make_file(parent_uuid, name, mode & MODE_MASK)?;
            let parent = parent_uuid.to_string();
            let cached = attr.clone();
            this.run(move |engine| {
                let events = engine.metadata.put_attr(cached);
                engine.apply_cache_events(events);
                engine.readdir.invalidate(&parent);
                Ok(())
            })?;
            Ok(attr)
        })
    }

    pub fn create(
        &self,
        parent_uuid: &str,
        name: &str,
        mode: u32,
        flags: OpenFlags,
    ) -> Result<(FileAttributes, u64)> {
        Self::reject_special_modes(mode, "create")?;
        let (attr, handle_id) = self.with_retry("create", |this| {
            let (attr, location, provider_handle) =
                this.remote
                    .create_file(parent_uuid, name, mode & MODE_MASK, flags)?;
            let token = this.open_file_token(&attr.uuid);
            let parent = parent_uuid.to_string();
            let cached = attr.clone();
            let handle_id = this.run(move |engine| {
                let events = engine.metadata.open_created(cached.clone(), location);
                engine.apply_cache_events(events);
                engine.readdir.invalidate(&parent);
                let handle = FuseFileHandle::new(
                    flags,
                    Some(provider_handle),
                    cached.virtual_entry,
                    token,
                );
                Ok(engine.handles.insert(handle))
            })?;
            Ok((attr, handle_id))
        })?;

        if let Some((tag_name, tag_value)) = self.config.tag_on_create.clone() {
            self.apply_tag(&attr.uuid, handle_id, &tag_name, &tag_value, true);
        }
        Ok((attr, handle_id))
    }

    /// Applies a configured on-create or on-modify tag at most once per
    /// handle; failures are logged, never surfaced.
    fn apply_tag(&self, uuid: &str, handle_id: u64, name: &str, value: &str, on_create: bool) {
        let already_set = self
            .fiber
            .run(move |engine| {
                let Some(handle) = engine.handles.get_mut(handle_id) else {
                    return true;
                };
                let flag = if on_create {
                    &mut handle.on_create_tag_set
                } else {
                    &mut handle.on_modify_tag_set
                };
                let was_set = *flag;
                *flag = true;
                was_set
            })
            .unwrap_or(true);
        if already_set {
            return;
        }
        match xattr::encode_xattr_name(name) {
            Some(encoded_name) => {
                let encoded_value = xattr::encode_xattr_value(value.as_bytes());
                if let Err(e) = self
                    .remote
                    .set_xattr(uuid, &encoded_name, &encoded_value, false, false)
                {
                    tracing::error!("Failed to set tag {} on {}: {}", name, uuid, e);
                }
            }
            None => tracing::error!("Tag for {} has an invalid name", uuid),
        }
    }

    pub fn unlink(&self, parent_uuid: &str, name: &str) -> Result<()> {
        let attr = match Self::uuid_from_name(name)? {
            Some(uuid) => self.getattr(&uuid)?,
            None => self.lookup(parent_uuid, name)?,
        };
        let uuid = attr.uuid.clone();
        self.with_retry("unlink", |this| {
            match this.remote.delete_file(&uuid) {
                Ok(()) => {}
                Err(e @ ClientError::NotFound { .. }) => {
                    let uuid = uuid.clone();
                    this.run(move |engine| {
                        let events = engine.metadata.mark_deleted(&uuid);
                        engine.apply_cache_events(events);
                        Ok(())
                    })?;
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
            let uuid = uuid.clone();
            let parent = parent_uuid.to_string();
            this.run(move |engine| {
                let events = engine.metadata.mark_deleted(&uuid);
                engine.apply_cache_events(events);
                engine.readdir.invalidate(&parent);
                Ok(())
            })
        })
    }

    pub fn rename(
        &self,
        parent_uuid: &str,
        name: &str,
        new_parent_uuid: &str,
        new_name: &str,
    ) -> Result<String> {
        let attr = match Self::uuid_from_name(name)? {
            Some(uuid) => self.getattr(&uuid)?,
            None => self.lookup(parent_uuid, name)?,
        };
        let old_uuid = attr.uuid.clone();
        self.with_retry("rename", |this| {
            let new_uuid = this
                .remote
                .rename(&old_uuid, new_parent_uuid, new_name)?;
            let old = old_uuid.clone();
            let renamed = new_uuid.clone();
            let old_parent = parent_uuid.to_string();
            let new_parent = new_parent_uuid.to_string();
            let target_name = new_name.to_string();
            this.run(move |engine| {
                let events = engine
                    .metadata
                    .rename(&old, &new_parent, &target_name, &renamed);
                engine.apply_cache_events(events);
                engine.readdir.invalidate(&old_parent);
                engine.readdir.invalidate(&new_parent);
                Ok(())
            })?;
            tracing::debug!("Renamed {} to {} as {}", old_uuid, new_uuid, new_name);
            Ok(new_uuid)
        })
    }

    pub fn link(
        &self,
        uuid: &str,
        new_parent_uuid: &str,
        new_name: &str,
    ) -> Result<FileAttributes> {
        self.with_retry("link", |this| {
            let attr = this.remote.make_link(uuid, new_parent_uuid, new_name)?;
            let parent = new_parent_uuid.to_string();
            let cached = attr.clone();
            this.run(move |engine| {
                let events = engine.metadata.put_attr(cached);
                engine.apply_cache_events(events);
                engine.readdir.invalidate(&parent);
                Ok(())
            })?;
            Ok(attr)
        })
    }

    pub fn symlink(&self, parent_uuid: &str, name: &str, link: &str) -> Result<FileAttributes> {
        let effective = if link.starts_with('/') {
            let link = link.to_string();
            let mount_point = self.config.mount_point.clone();
            self.run(move |engine| {
                let root = engine.root_uuid.clone();
                let mut resolve = |space_name: &str| -> Result<String> {
                    let (attr, events) = engine.metadata.ensure_child_attr(&root, space_name)?;
                    engine.apply_cache_events(events);
                    ident::uuid_to_space_id(&attr.uuid)
                };
                Ok(symlinks::encode_space_relative(
                    &link,
                    &mount_point,
                    &mut resolve,
                ))
            })?
        } else {
            link.to_string()
        };

        self.with_retry("symlink", |this| {
            let attr = this.remote.make_symlink(parent_uuid, name, &effective)?;
            let parent = parent_uuid.to_string();
            let cached = attr.clone();
            this.run(move |engine| {
                let events = engine.metadata.put_attr(cached);
                engine.apply_cache_events(events);
                engine.readdir.invalidate(&parent);
                Ok(())
            })?;
            Ok(attr)
        })
    }

    pub fn readlink(&self, uuid: &str) -> Result<String> {
        self.with_retry("readlink", |this| {
            let stored = this.remote.read_symlink(uuid)?;
            if !stored.starts_with(symlinks::SPACE_LINK_PREFIX) {
                return Ok(stored);
            }
            let mount_point = this.config.mount_point.clone();
            let show_space_ids = this.config.show_space_ids;
            this.run(move |engine| {
                let mut resolve = |space_id: &str| -> Result<String> {
                    let space_uuid = ident::space_id_to_space_uuid(space_id);
                    let (attr, events) = engine.metadata.ensure_attr(&space_uuid)?;
                    engine.apply_cache_events(events);
                    Ok(attr.name)
                };
                Ok(symlinks::resolve_space_relative(
                    &stored,
                    &mount_point,
                    show_space_ids,
                    &mut resolve,
                ))
            })
        })
    }

    // ---- directories ---------------------------------------------------------

    pub fn opendir(&self, uuid: &str) -> Result<()> {
        let uuid = uuid.to_string();
        self.run(move |engine| {
            let (attr, events) = engine.metadata.ensure_attr(&uuid)?;
            engine.apply_cache_events(events);
            if !attr.is_directory() {
                return Err(ClientError::NotDirectory { uuid });
            }
            engine.metadata.opendir(&uuid);
            Ok(())
        })
    }

    pub fn releasedir(&self, uuid: &str) -> Result<()> {
        let uuid = uuid.to_string();
        self.run(move |engine| {
            engine.metadata.releasedir(&uuid);
            Ok(())
        })
    }

    /// Chunked enumeration. The cursor covers the synthetic `.` and `..`
    /// entries at offsets 0 and 1.
    pub fn readdir(&self, uuid: &str, offset: usize, count: usize) -> Result<Vec<String>> {
        self.with_retry("readdir", |this| {
            let uuid = uuid.to_string();
            this.run(move |engine| {
                let (attr, events) = engine.metadata.ensure_attr(&uuid)?;
                engine.apply_cache_events(events);
                if !attr.is_directory() {
                    return Err(ClientError::NotDirectory { uuid });
                }
                let options = engine.readdir_options();
                let remote = engine.remote.clone();
                let events = engine.readdir.ensure_listing(
                    &mut engine.metadata,
                    &remote,
                    &uuid,
                    &options,
                )?;
                engine.apply_cache_events(events);

                let mut entries = vec![".".to_string(), "..".to_string()];
                entries.extend(engine.readdir.cached(&uuid).unwrap_or(&[]).iter().cloned());
                Ok(entries.into_iter().skip(offset).take(count).collect())
            })
        })
    }

    // ---- open files ----------------------------------------------------------

    pub fn open(&self, uuid: &str, flags: OpenFlags) -> Result<u64> {
        self.with_retry("open", |this| {
            let uuid_owned = uuid.to_string();
            let attr = this.run(move |engine| {
                let (attr, events) = engine.metadata.ensure_attr(&uuid_owned)?;
                engine.apply_cache_events(events);
                Ok(attr)
            })?;

            let provider_handle = if attr.virtual_entry {
                None
            } else {
                Some(this.remote.open_file(uuid, flags)?)
            };

            let token = this.open_file_token(uuid);
            let uuid_owned = uuid.to_string();
            let virtual_entry = attr.virtual_entry;
            this.run(move |engine| {
                let (_, events) = engine.metadata.open(&uuid_owned)?;
                engine.apply_cache_events(events);
                let handle =
                    FuseFileHandle::new(flags, provider_handle, virtual_entry, token);
                Ok(engine.handles.insert(handle))
            })
        })
    }

    /// Rebuilds a handle dropped by a connection reset, preserving its id.
    fn reopen_handle(&self, uuid: &str, handle_id: u64) -> Result<()> {
        let flags = self
            .fiber
            .run(move |engine| engine.handles.remembered_flags(handle_id))?
            .ok_or(ClientError::BadDescriptor { handle: handle_id })?;
        tracing::info!(
            "Reopening file {} on handle {} after connection reset",
            uuid,
            handle_id
        );
        let provider_handle = self.remote.open_file(uuid, flags)?;
        let token = self.open_file_token(uuid);
        let uuid = uuid.to_string();
        self.run(move |engine| {
            let (attr, events) = engine.metadata.open(&uuid)?;
            engine.apply_cache_events(events);
            let handle =
                FuseFileHandle::new(flags, Some(provider_handle), attr.virtual_entry, token);
            engine.handles.insert_with_id(handle_id, handle);
            Ok(())
        })
    }

    /// Releases a fuse handle: best-effort fsync, helper teardown, then
    /// the provider Release. Repeated release of the same id is a no-op.
    pub fn release(&self, uuid: &str, handle_id: u64) -> Result<()> {
        let Some(handle) = self
            .fiber
            .run(move |engine| engine.handles.remove(handle_id))?
        else {
            tracing::debug!("Handle {} already released", handle_id);
            return Ok(());
        };

        let mut first_error: Option<ClientError> = None;
        let helper_handles = handle.helper_handles();
        for helper_handle in &helper_handles {
            if let Err(e) = helper_handle.fsync(false) {
                tracing::warn!("fsync on release of {} failed: {}", uuid, e);
            }
        }
        for helper_handle in &helper_handles {
            if let Err(e) = helper_handle.release() {
                tracing::warn!("Releasing helper handle of {} failed: {}", uuid, e);
                first_error.get_or_insert(e);
            }
        }
        if !handle.virtual_file {
            if let Some(provider_handle) = handle.provider_handle_id.clone() {
                if let Err(e) = self.remote.release(uuid, &provider_handle) {
                    tracing::warn!("Provider release of {} failed: {}", uuid, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        drop(handle);

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn flush(&self, uuid: &str, handle_id: u64) -> Result<()> {
        let helper_handles = self.run(move |engine| {
            engine.events.flush();
            Ok(engine
                .handles
                .get(handle_id)
                .map(|handle| handle.helper_handles())
                .unwrap_or_default())
        })?;
        for helper_handle in helper_handles {
            helper_handle.flush_underlying()?;
        }
        tracing::debug!("Flushed handle {} of {}", handle_id, uuid);
        Ok(())
    }

    pub fn fsync(&self, uuid: &str, handle_id: u64, data_only: bool) -> Result<()> {
        let state = self.run(move |engine| {
            engine.events.flush();
            Ok(engine.handles.get(handle_id).map(|handle| {
                (
                    handle.virtual_file,
                    handle.provider_handle_id.clone(),
                    handle.helper_handles(),
                )
            }))
        })?;
        let Some((virtual_file, provider_handle, helper_handles)) = state else {
            tracing::debug!("fsync on already released handle {}", handle_id);
            return Ok(());
        };
        if !virtual_file {
            if let Some(provider_handle) = provider_handle {
                self.remote.fsync(uuid, &provider_handle, data_only)?;
            }
        }
        for helper_handle in helper_handles {
            helper_handle.fsync(data_only)?;
        }
        Ok(())
    }

    // ---- data plane ----------------------------------------------------------

    fn prepare_read(
        &self,
        uuid: &str,
        handle_id: u64,
        offset: u64,
        size: usize,
    ) -> Result<IoPrep> {
        let uuid = uuid.to_string();
        let helper_cache = Arc::clone(&self.helper_cache);
        let force_proxy = Arc::clone(&self.force_proxy);
        let min_prefetch = self.config.min_prefetch_block_size;
        self.run(move |engine| {
            if !engine.handles.contains(handle_id) {
                return Ok(IoPrep::Reopen);
            }
            let (attr, events) = engine.metadata.ensure_attr(&uuid)?;
            engine.apply_cache_events(events);
            let file_size = attr.size_or_zero();
            let wanted_end = (offset + size as u64).min(file_size);
            if offset >= file_size || wanted_end <= offset {
                return Ok(IoPrep::Empty);
            }

            let space_id = engine.metadata.space_id(&uuid)?;
            let proxy = force_proxy.contains(&uuid);
            match engine.metadata.get_block(&uuid, offset) {
                None => {
                    let block = engine.metadata.default_block(&uuid)?;
                    let helper = helper_cache.get(
                        &uuid,
                        &space_id,
                        &block.storage_id,
                        proxy,
                        true,
                    )?;
                    let sync_end = (offset + (size as u64).max(min_prefetch)).min(file_size);
                    Ok(IoPrep::NeedSync {
                        start: offset,
                        end: sync_end,
                        needs_checksum: helper.needs_consistency_check(),
                        wanted_len: (wanted_end - offset) as usize,
                    })
                }
                Some((_, block_end, block)) => {
                    let helper = helper_cache.get(
                        &uuid,
                        &space_id,
                        &block.storage_id,
                        proxy,
                        true,
                    )?;
                    let needs_consistency_check = helper.needs_consistency_check();
                    let handle = engine
                        .handles
                        .get_mut(handle_id)
                        .ok_or(ClientError::BadDescriptor { handle: handle_id })?;
                    let helper_handle = match handle.cached_helper_handle(
                        &block.storage_id,
                        &block.file_id,
                        proxy,
                    ) {
                        Some(helper_handle) => helper_handle,
                        None => {
                            let opened = helper.open(&block.file_id, handle.flags)?;
                            handle.store_helper_handle(
                                &block.storage_id,
                                &block.file_id,
                                proxy,
                                Arc::clone(&opened),
                            );
                            opened
                        }
                    };
                    Ok(IoPrep::Ready {
                        helper_handle,
                        storage_id: block.storage_id,
                        file_id: block.file_id,
                        proxy,
                        available_end: block_end,
                        wanted_end,
                        needs_consistency_check,
                    })
                }
            }
        })
    }

    fn apply_location_update(
        &self,
        location: crate::blocks::FileLocation,
        change_range: Option<(u64, u64)>,
    ) -> Result<()> {
        self.run(move |engine| {
            match change_range {
                Some((start, end)) => {
                    engine.metadata.update_location_in_range(start, end, location);
                }
                None => {
                    engine.metadata.update_location(location);
                }
            }
            Ok(())
        })
    }

    fn force_location_update(&self, uuid: &str) -> Result<()> {
        let uuid = uuid.to_string();
        self.run(move |engine| {
            engine.metadata.get_location(&uuid, true)?;
            Ok(())
        })
    }

    /// Shared error classification for the data plane. `Ok(())` means the
    /// operation should be retried; permanent failures come back as `Err`.
    fn handle_io_error(
        &self,
        e: ClientError,
        uuid: &str,
        storage_id: &str,
        retries_left: &mut i64,
        proxy_reset_used: &mut bool,
    ) -> Result<()> {
        match e {
            ClientError::KeyExpired { .. } if *retries_left >= 0 => {
                tracing::info!(
                    "Credentials for storage {} expired, refreshing helper parameters",
                    storage_id
                );
                let space_id = ident::uuid_to_space_id(uuid)
                    .unwrap_or_else(|_| String::new());
                self.helper_cache
                    .refresh_helper_parameters(storage_id, &space_id)?;
                *retries_left -= 1;
                Ok(())
            }
            ClientError::NotFound { .. }
                if *retries_left >= 0 && !self.force_proxy.contains(uuid) =>
            {
                // The file may have moved on the storage; refetch the map.
                self.force_location_update(uuid)?;
                *retries_left -= 1;
                Ok(())
            }
            ref err @ (ClientError::Again
            | ClientError::Cancelled
            | ClientError::Timeout
            | ClientError::ConnectionLost)
                if *retries_left >= 0 =>
            {
                tracing::debug!("Retrying IO on {} after error: {}", uuid, err);
                self.retry_delay((*retries_left).max(0) as u32);
                *retries_left -= 1;
                Ok(())
            }
            ClientError::PermissionDenied { .. } => {
                if self.force_proxy.contains(uuid) {
                    tracing::error!(
                        "IO on {} failed although proxy mode is already forced",
                        uuid
                    );
                    return Err(e);
                }
                tracing::info!(
                    "Direct IO on {} denied, falling back to proxy",
                    uuid
                );
                self.force_proxy.add(uuid);
                if !*proxy_reset_used {
                    *proxy_reset_used = true;
                    *retries_left = self.config.max_retries as i64;
                }
                Ok(())
            }
            e => Err(e),
        }
    }

    pub fn read(&self, uuid: &str, handle_id: u64, offset: u64, size: usize) -> Result<Vec<u8>> {
        let started = Instant::now();
        let mut retries_used = 0u32;
        let result = self.read_internal(uuid, handle_id, offset, size, &mut retries_used);
        if self.iotrace.is_some() {
            let mut entry = IoTraceEntry::new("read", uuid);
            entry.handle_id = handle_id;
            entry.retries = retries_used;
            entry.offset = offset;
            entry.size = size as u64;
            entry.result_size = result.as_ref().map(|d| d.len() as u64).unwrap_or(0);
            entry.duration_us = started.elapsed().as_micros() as u64;
            self.trace(entry);
        }
        result
    }

    fn read_internal(
        &self,
        uuid: &str,
        handle_id: u64,
        offset: u64,
        size: usize,
        retries_used: &mut u32,
    ) -> Result<Vec<u8>> {
        let mut retries_left = self.config.max_retries as i64;
        let mut checksum: Option<String> = None;
        let mut proxy_reset_used = false;

        loop {
            *retries_used = self
                .config
                .max_retries
                .saturating_sub(retries_left.max(0) as u32);
            match self.prepare_read(uuid, handle_id, offset, size)? {
                IoPrep::Reopen => {
                    self.reopen_handle(uuid, handle_id)?;
                }
                IoPrep::Empty => return Ok(Vec::new()),
                IoPrep::QuotaExceeded { space_id } => {
                    return Err(ClientError::QuotaExceeded { space_id })
                }
                IoPrep::NeedSync {
                    start,
                    end,
                    needs_checksum,
                    wanted_len,
                } => {
                    if retries_left < 0 {
                        tracing::info!(
                            "Block [{}, {}) of {} not synchronized after retries, returning zeros",
                            start,
                            end,
                            uuid
                        );
                        return Ok(vec![0; wanted_len]);
                    }
                    let sync = if needs_checksum {
                        self.remote
                            .synchronize_block_with_checksum(uuid, start, end)
                            .map(|(digest, location, range)| {
                                checksum = Some(digest);
                                (location, range)
                            })
                    } else {
                        self.remote
                            .synchronize_block(uuid, start, end, SYNC_PRIORITY_IMMEDIATE)
                    };
                    match sync {
                        Ok((location, range)) => {
                            self.apply_location_update(location, range)?;
                            retries_left -= 1;
                        }
                        Err(e) => {
                            self.handle_io_error(
                                e,
                                uuid,
                                "",
                                &mut retries_left,
                                &mut proxy_reset_used,
                            )?;
                        }
                    }
                }
                IoPrep::Ready {
                    helper_handle,
                    storage_id,
                    file_id,
                    proxy,
                    available_end,
                    wanted_end,
                    needs_consistency_check,
                } => {
                    if checksum.is_some() {
                        if let Err(e) = helper_handle.flush_underlying() {
                            tracing::warn!("Helper flush before checked read failed: {}", e);
                        }
                    }
                    let to_read = (wanted_end.min(available_end) - offset) as usize;
                    let continuous_hint = (available_end - offset) as usize;
                    match helper_handle.read_continuous(offset, to_read, continuous_hint) {
                        Err(e) => {
                            self.handle_io_error(
                                e,
                                uuid,
                                &storage_id,
                                &mut retries_left,
                                &mut proxy_reset_used,
                            )?;
                        }
                        Ok(data) => {
                            if needs_consistency_check {
                                if let Some(expected) = checksum.as_deref() {
                                    if sha256_hex(&data) != expected {
                                        if retries_left < 0 {
                                            return Err(ClientError::ChecksumMismatch {
                                                uuid: uuid.to_string(),
                                            });
                                        }
                                        tracing::info!(
                                            "Checksum mismatch reading {}, refreshing replica map",
                                            uuid
                                        );
                                        self.drop_helper_handle(
                                            handle_id, &storage_id, &file_id, proxy,
                                        )?;
                                        self.force_location_update(uuid)?;
                                        self.retry_delay(retries_left.max(0) as u32);
                                        retries_left -= 1;
                                        continue;
                                    }
                                }
                            }

                            if data.is_empty() && wanted_end > offset {
                                if retries_left < 0 {
                                    return Ok(data);
                                }
                                tracing::info!(
                                    "Helper returned no data for {} at {}, retrying",
                                    uuid,
                                    offset
                                );
                                self.retry_delay(retries_left.max(0) as u32);
                                self.force_location_update(uuid)?;
                                retries_left -= 1;
                                continue;
                            }

                            self.after_read(uuid, handle_id, offset, data.len())?;
                            return Ok(data);
                        }
                    }
                }
            }
        }
    }

    fn drop_helper_handle(
        &self,
        handle_id: u64,
        storage_id: &str,
        file_id: &str,
        proxy: bool,
    ) -> Result<()> {
        let storage_id = storage_id.to_string();
        let file_id = file_id.to_string();
        let dropped = self.fiber.run(move |engine| {
            engine
                .handles
                .get_mut(handle_id)
                .and_then(|handle| handle.remove_helper_handle(&storage_id, &file_id, proxy))
        })?;
        if let Some(helper_handle) = dropped {
            if let Err(e) = helper_handle.release() {
                tracing::warn!("Releasing stale helper handle failed: {}", e);
            }
        }
        Ok(())
    }

    /// Post-read bookkeeping: the FileRead event and the prefetch planner.
    fn after_read(
        &self,
        uuid: &str,
        handle_id: u64,
        offset: u64,
        bytes_read: usize,
    ) -> Result<()> {
        let uuid_owned = uuid.to_string();
        let config = Arc::clone(&self.config);
        let plan = self.run(move |engine| {
            if !engine.config.read_events_disabled {
                engine.events.emit(Event::FileRead {
                    uuid: uuid_owned.clone(),
                    offset,
                    size: bytes_read as u64,
                });
            }

            let Some(handle) = engine.handles.get_mut(handle_id) else {
                return Ok(None);
            };
            if config.cluster_window != 0
                && !handle.prefetch.should_evaluate(
                    config.prefetch_evaluation_frequency,
                    Duration::from_secs(config.prefetch_evaluation_delay_secs),
                )
            {
                return Ok(None);
            }

            let Some(attr) = engine.metadata.get_attr_cached(&uuid_owned) else {
                return Ok(None);
            };
            let file_size = attr.size_or_zero();
            let Ok(location) = engine.metadata.get_location(&uuid_owned, false) else {
                return Ok(None);
            };

            let cluster_threshold = if config.cluster_prefetch_threshold_random {
                rand::thread_rng().gen_range(2..=config.cluster_block_threshold.max(2))
            } else {
                config.cluster_block_threshold
            };

            let handle = engine
                .handles
                .get_mut(handle_id)
                .ok_or(ClientError::BadDescriptor { handle: handle_id })?;
            let would_prefetch = handle
                .helper_handles()
                .first()
                .map(|h| h.would_prefetch(offset, bytes_read))
                .unwrap_or(0);

            let snapshot = PrefetchSnapshot {
                location: &location,
                file_size,
                offset,
                size: bytes_read as u64,
                would_prefetch,
                available: location.blocks.covering(offset).map(|(s, e, _)| (s, e)),
                last_linear: handle.prefetch.last_linear,
                cluster_threshold,
                full_prefetch_triggered: handle.prefetch.full_prefetch_triggered,
            };
            let Some(plan) = prefetch::plan(&config, &snapshot) else {
                return Ok(None);
            };

            match plan.kind {
                PrefetchKind::Full => handle.prefetch.full_prefetch_triggered = true,
                PrefetchKind::Cluster => {
                    if let Some(aligned) = plan.block_aligned_at {
                        if handle.prefetch.cluster_requested_at(aligned) {
                            tracing::debug!(
                                "Cluster prefetch at {} already requested for {}",
                                aligned,
                                uuid_owned
                            );
                            return Ok(None);
                        }
                        handle.prefetch.record_cluster_request(aligned);
                    }
                }
                PrefetchKind::Linear => {
                    if let Some(range) = plan.set_last_linear {
                        handle.prefetch.last_linear = Some(range);
                    }
                }
            }
            tracing::debug!(
                "Requesting {:?} prefetch of [{}, {}) for {}",
                plan.kind,
                plan.start,
                plan.end,
                uuid_owned
            );
            Ok(Some(plan))
        })?;

        if let Some(plan) = plan {
            match self.config.prefetch_mode {
                PrefetchMode::Async => {
                    self.remote
                        .request_block_synchronization(uuid, plan.start, plan.end, plan.priority);
                }
                PrefetchMode::Sync => {
                    let (location, range) = self.remote.synchronize_block(
                        uuid,
                        plan.start,
                        plan.end,
                        plan.priority,
                    )?;
                    self.apply_location_update(location, range)?;
                }
            }
        }
        Ok(())
    }

    fn prepare_write(&self, uuid: &str, handle_id: u64) -> Result<IoPrep> {
        let uuid = uuid.to_string();
        let helper_cache = Arc::clone(&self.helper_cache);
        let force_proxy = Arc::clone(&self.force_proxy);
        self.run(move |engine| {
            if !engine.handles.contains(handle_id) {
                return Ok(IoPrep::Reopen);
            }
            let (_, events) = engine.metadata.ensure_attr(&uuid)?;
            engine.apply_cache_events(events);
            let space_id = engine.metadata.space_id(&uuid)?;
            if engine.disabled_spaces.contains(&space_id) {
                return Ok(IoPrep::QuotaExceeded { space_id });
            }

            let block = engine.metadata.default_block(&uuid)?;
            let proxy = force_proxy.contains(&uuid);
            let helper = helper_cache.get(&uuid, &space_id, &block.storage_id, proxy, true)?;
            let needs_consistency_check = helper.needs_consistency_check();
            let handle = engine
                .handles
                .get_mut(handle_id)
                .ok_or(ClientError::BadDescriptor { handle: handle_id })?;
            let helper_handle =
                match handle.cached_helper_handle(&block.storage_id, &block.file_id, proxy) {
                    Some(helper_handle) => helper_handle,
                    None => {
                        let opened = helper.open(&block.file_id, handle.flags)?;
                        handle.store_helper_handle(
                            &block.storage_id,
                            &block.file_id,
                            proxy,
                            Arc::clone(&opened),
                        );
                        opened
                    }
                };
            Ok(IoPrep::Ready {
                helper_handle,
                storage_id: block.storage_id,
                file_id: block.file_id,
                proxy,
                available_end: 0,
                wanted_end: 0,
                needs_consistency_check,
            })
        })
    }

    pub fn write(&self, uuid: &str, handle_id: u64, offset: u64, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let started = Instant::now();
        let mut retries_used = 0u32;
        let result = self.write_internal(uuid, handle_id, offset, data, &mut retries_used);
        if self.iotrace.is_some() {
            let mut entry = IoTraceEntry::new("write", uuid);
            entry.handle_id = handle_id;
            entry.retries = retries_used;
            entry.offset = offset;
            entry.size = data.len() as u64;
            entry.result_size = result.as_ref().map(|n| *n as u64).unwrap_or(0);
            entry.duration_us = started.elapsed().as_micros() as u64;
            self.trace(entry);
        }
        result
    }

    fn write_internal(
        &self,
        uuid: &str,
        handle_id: u64,
        offset: u64,
        data: &[u8],
        retries_used: &mut u32,
    ) -> Result<usize> {
        let mut retries_left = self.config.max_retries as i64;
        let mut proxy_reset_used = false;

        loop {
            *retries_used = self
                .config
                .max_retries
                .saturating_sub(retries_left.max(0) as u32);
            let prep = self.prepare_write(uuid, handle_id)?;
            let (helper_handle, storage_id, file_id) = match prep {
                IoPrep::Reopen => {
                    self.reopen_handle(uuid, handle_id)?;
                    continue;
                }
                IoPrep::QuotaExceeded { space_id } => {
                    tracing::error!(
                        "Write to {} rejected: space {} exceeded its quota",
                        uuid,
                        space_id
                    );
                    return Err(ClientError::QuotaExceeded { space_id });
                }
                IoPrep::Ready {
                    helper_handle,
                    storage_id,
                    file_id,
                    ..
                } => (helper_handle, storage_id, file_id),
                IoPrep::Empty | IoPrep::NeedSync { .. } => {
                    return Err(ClientError::Protocol {
                        msg: "unexpected write preparation state".to_string(),
                    })
                }
            };

            let mut chunks: Vec<usize> = Vec::new();
            match helper_handle.write(offset, data, &mut |n| chunks.push(n)) {
                Err(e) => {
                    self.handle_io_error(
                        e,
                        uuid,
                        &storage_id,
                        &mut retries_left,
                        &mut proxy_reset_used,
                    )?;
                }
                Ok(written) => {
                    let uuid_owned = uuid.to_string();
                    let written_block = crate::blocks::FileBlock {
                        storage_id: storage_id.clone(),
                        file_id: file_id.clone(),
                    };
                    let tag_pending = self.run(move |engine| {
                        let mut chunk_offset = offset;
                        for chunk in chunks {
                            engine.events.emit(Event::FileWritten {
                                uuid: uuid_owned.clone(),
                                offset: chunk_offset,
                                size: chunk as u64,
                            });
                            chunk_offset += chunk as u64;
                        }
                        engine.metadata.add_block(
                            &uuid_owned,
                            offset,
                            offset + written as u64,
                            written_block,
                        );
                        Ok(engine
                            .handles
                            .get(handle_id)
                            .map(|handle| !handle.on_modify_tag_set)
                            .unwrap_or(false))
                    })?;

                    if tag_pending {
                        if let Some((tag_name, tag_value)) = self.config.tag_on_modify.clone() {
                            self.apply_tag(uuid, handle_id, &tag_name, &tag_value, false);
                        }
                    }
                    tracing::debug!(
                        "Wrote {} bytes to {} at offset {} on storage {}",
                        written,
                        uuid,
                        offset,
                        storage_id
                    );
                    return Ok(written);
                }
            }
        }
    }

    // ---- statfs --------------------------------------------------------------

    pub fn statfs(&self, uuid: &str) -> Result<FsStatsReply> {
        let mut reply = FsStatsReply {
            bsize: STATFS_BLOCK_SIZE as u32,
            frsize: STATFS_BLOCK_SIZE as u32,
            namelen: STATFS_NAME_MAX,
            files: STATFS_FREE_INODES,
            ffree: STATFS_FREE_INODES,
            ..Default::default()
        };

        if self.config.emulate_available_space > 0 {
            let blocks = self.config.emulate_available_space / STATFS_BLOCK_SIZE;
            reply.blocks = blocks;
            reply.bfree = blocks;
            reply.bavail = blocks;
            return Ok(reply);
        }

        let (total, free) = if uuid != self.root_uuid {
            let stats = self.with_retry("statfs", |this| this.remote.get_fs_stats(uuid))?;
            (stats.total_size, stats.free_size)
        } else {
            // Aggregate over every accessible space under the root.
            let mut total = 0u64;
            let mut free = 0u64;
            let spaces = self.readdir(uuid, 0, STATFS_MAX_SPACES)?;
            for space_name in spaces {
                if space_name == "." || space_name == ".." {
                    continue;
                }
                let attr = match self.lookup(uuid, &space_name) {
                    Ok(attr) => attr,
                    Err(ClientError::NotFound { .. }) => continue,
                    Err(e) => return Err(e),
                };
                match self.remote.get_fs_stats(&attr.uuid) {
                    Ok(stats) => {
                        total += stats.total_size;
                        free += stats.free_size;
                    }
                    Err(ClientError::NotFound { .. }) => continue,
                    Err(e) => return Err(e),
                }
            }
            (total, free)
        };

        reply.blocks = total.div_ceil(STATFS_BLOCK_SIZE);
        reply.bfree = free.div_ceil(STATFS_BLOCK_SIZE);
        reply.bavail = reply.bfree;
        Ok(reply)
    }

    // ---- extended attributes -------------------------------------------------

    /// Serves one synthetic attribute as its provider-style JSON document,
    /// or `None` when `name` is not synthetic.
    fn synthetic_xattr(&self, uuid: &str, name: &str) -> Result<Option<String>> {
        let value = match name {
            xattr::XATTR_GUID => Some(format!("\"{uuid}\"")),
            xattr::XATTR_FILE_ID => Some(format!("\"{}\"", cdmi::uuid_to_object_id(uuid)?)),
            xattr::XATTR_SPACE_ID => {
                let uuid_owned = uuid.to_string();
                let space_id =
                    self.run(move |engine| engine.metadata.space_id(&uuid_owned))?;
                Some(format!("\"{space_id}\""))
            }
            xattr::XATTR_STORAGE_FILE_ID | xattr::XATTR_STORAGE_ID => {
                let uuid_owned = uuid.to_string();
                let block = self.run(move |engine| {
                    let (_, events) = engine.metadata.ensure_attr(&uuid_owned)?;
                    engine.apply_cache_events(events);
                    engine.metadata.get_location(&uuid_owned, false)?;
                    engine.metadata.default_block(&uuid_owned)
                })?;
                if name == xattr::XATTR_STORAGE_ID {
                    Some(format!("\"{}\"", block.storage_id))
                } else {
                    Some(format!("\"{}\"", block.file_id))
                }
            }
            xattr::XATTR_ACCESS_TYPE => {
                let uuid_owned = uuid.to_string();
                let block = self.run(move |engine| {
                    let (_, events) = engine.metadata.ensure_attr(&uuid_owned)?;
                    engine.apply_cache_events(events);
                    engine.metadata.get_location(&uuid_owned, false)?;
                    engine.metadata.default_block(&uuid_owned)
                })?;
                let access = self.helper_cache.access_type(&block.storage_id);
                Some(format!("\"{}\"", access.as_str()))
            }
            xattr::XATTR_FILE_BLOCKS
            | xattr::XATTR_FILE_BLOCKS_COUNT
            | xattr::XATTR_REPLICATION_PROGRESS => {
                let uuid_owned = uuid.to_string();
                let name_owned = name.to_string();
                let rendered = self.run(move |engine| {
                    let (attr, events) = engine.metadata.ensure_attr(&uuid_owned)?;
                    engine.apply_cache_events(events);
                    let size = attr.size_or_zero();
                    // Without a live location subscription the cached map
                    // may be stale; refetch it.
                    let force = !engine.subscriptions.is_subscribed(
                        SubscriptionKind::FileLocationChanged,
                        &uuid_owned,
                    );
                    let location = engine.metadata.get_location(&uuid_owned, force)?;
                    Ok(match name_owned.as_str() {
                        xattr::XATTR_FILE_BLOCKS_COUNT => {
                            format!("\"{}\"", location.blocks.count())
                        }
                        xattr::XATTR_REPLICATION_PROGRESS => {
                            let percent =
                                (location.replication_progress(size) * 100.0).floor() as u64;
                            format!("\"{percent}%\"")
                        }
                        _ => {
                            if size == 0 {
                                "\"empty\"".to_string()
                            } else {
                                format!(
                                    "\"[{}]\"",
                                    location.progress_string(
                                        size,
                                        crate::blocks::FILE_BLOCKS_MAP_LENGTH
                                    )
                                )
                            }
                        }
                    })
                })?;
                Some(rendered)
            }
            _ => None,
        };
        Ok(value)
    }

    /// Returns the raw bytes of an attribute value, decoding the provider
    /// JSON document representation.
    pub fn getxattr(&self, uuid: &str, name: &str) -> Result<Vec<u8>> {
        if let Some(document) = self.synthetic_xattr(uuid, name)? {
            return Ok(xattr::decode_xattr_value(&document));
        }
        let document = self.with_retry("getxattr", |this| this.remote.get_xattr(uuid, name))?;
        Ok(xattr::decode_xattr_value(&document))
    }

    pub fn setxattr(
        &self,
        uuid: &str,
        name: &str,
        value: &[u8],
        create: bool,
        replace: bool,
    ) -> Result<()> {
        let encoded_name =
            xattr::encode_xattr_name(name).ok_or_else(|| ClientError::InvalidArgument {
                msg: "extended attribute name must not be empty".to_string(),
            })?;
        let encoded_value = xattr::encode_xattr_value(value);
        self.with_retry("setxattr", |this| {
            this.remote
                .set_xattr(uuid, &encoded_name, &encoded_value, create, replace)
        })
    }

    pub fn removexattr(&self, uuid: &str, name: &str) -> Result<()> {
        self.with_retry("removexattr", |this| this.remote.remove_xattr(uuid, name))
    }

    pub fn listxattr(&self, uuid: &str) -> Result<Vec<String>> {
        let mut names = self.with_retry("listxattr", |this| this.remote.list_xattr(uuid))?;
        names.extend(xattr::COMMON_SYNTHETIC_XATTRS.iter().map(|s| s.to_string()));
        let attr = self.getattr(uuid)?;
        if attr.file_type.is_regular_or_link() {
            names.extend(xattr::DATA_SYNTHETIC_XATTRS.iter().map(|s| s.to_string()));
        }
        Ok(names)
    }

    // ---- push messages -------------------------------------------------------

    /// Entry point for provider push streams; safe to call from any
    /// thread.
    pub fn handle_push(&self, message: PushMessage) {
        match message {
            PushMessage::FileAttrChanged(attr) | PushMessage::ReplicaStatusChanged(attr) => {
                self.fiber.post(move |engine| engine.metadata.update_attr(attr));
            }
            PushMessage::FileLocationChanged {
                location,
                change_start,
                change_end,
            } => {
                self.fiber.post(move |engine| {
                    match change_start.zip(change_end) {
                        Some((start, end)) => {
                            engine.metadata.update_location_in_range(start, end, location);
                        }
                        None => {
                            engine.metadata.update_location(location);
                        }
                    }
                });
            }
            PushMessage::FileRemoved { uuid } => {
                self.fiber.post(move |engine| {
                    let events = engine.metadata.mark_deleted(&uuid);
                    engine.apply_cache_events(events);
                });
            }
            PushMessage::FileRenamed {
                old_uuid,
                new_uuid,
                new_parent_uuid,
                new_name,
            } => {
                self.fiber.post(move |engine| {
                    let events =
                        engine
                            .metadata
                            .rename(&old_uuid, &new_parent_uuid, &new_name, &new_uuid);
                    engine.apply_cache_events(events);
                });
            }
            PushMessage::PermissionChanged { uuid } => {
                // Permissions changed server-side; let direct IO be probed
                // again on the next access.
                self.force_proxy.remove(&uuid);
            }
            PushMessage::QuotaExceeded { disabled_spaces } => {
                self.fiber.post(move |engine| {
                    for space_id in &disabled_spaces {
                        engine.events.emit(Event::QuotaExceeded {
                            space_id: space_id.clone(),
                        });
                    }
                    engine.disabled_spaces = disabled_spaces.into_iter().collect();
                });
            }
            PushMessage::SubscriptionCreated(subscription) => {
                self.fiber
                    .post(move |engine| engine.events.add_subscription(subscription));
            }
            PushMessage::SubscriptionCancelled { id } => {
                self.fiber
                    .post(move |engine| engine.events.cancel_subscription(id));
            }
        }
    }
}

impl Drop for FsLogic {
    fn drop(&mut self) {
        self.stop();
    }
}
