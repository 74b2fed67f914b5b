//! Common test fixtures: an in-memory provider simulation plus a mounted
//! engine wired to the in-memory storage helpers.

#![allow(dead_code)]

use oneclient_core::attrs::{FileAttributes, FileType};
use oneclient_core::blocks::{FileBlock, FileLocation, IntervalMap};
use oneclient_core::config::ClientConfig;
use oneclient_core::error::{ClientError, Result};
use oneclient_core::fslogic::FsLogic;
use oneclient_core::helper_cache::MountChecker;
use oneclient_core::helpers::{HelperParams, InMemoryHelperFactory, PROXY_HELPER_NAME};
use oneclient_core::ident;
use oneclient_core::proto::{
    Configuration, EventSubscription, EventWire, FsStats, Provider, ProviderRequest,
    ProviderResponse, StorageTestFile,
};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const STORAGE_ID: &str = "storage-1";
pub const SPACE_ID: &str = "SPACE-A";
pub const SPACE_NAME: &str = "space-A";
pub const MOUNT_POINT: &str = "/mnt/oneclient";

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

struct State {
    attrs: HashMap<String, FileAttributes>,
    children: HashMap<String, Vec<String>>,
    locations: HashMap<String, FileLocation>,
    symlinks: HashMap<String, String>,
    xattrs: HashMap<String, HashMap<String, String>>,
    fs_stats: HashMap<String, (u64, u64)>,
    next_file: u64,
    next_handle: u64,
    next_probe: u64,
}

/// Scriptable provider holding the remote side of the filesystem tree.
/// File content lives in the shared in-memory helper factory, the same
/// place the storage helpers read it from.
pub struct TestProvider {
    pub factory: Arc<InMemoryHelperFactory>,
    pub root_uuid: String,
    state: Mutex<State>,
    pub posts: Mutex<Vec<ProviderRequest>>,
    pub sync_calls: Mutex<Vec<(String, u64, u64, u32)>>,
    /// Synchronization requests acknowledge but replicate nothing.
    pub sync_noop: AtomicBool,
    /// Checksum responses are deliberately wrong.
    pub corrupt_checksums: AtomicBool,
    pub stream_subscriptions: Mutex<Vec<EventSubscription>>,
}

impl TestProvider {
    pub fn new(factory: Arc<InMemoryHelperFactory>) -> Self {
        let root_uuid = "root".to_string();
        let mut attrs = HashMap::new();
        attrs.insert(
            root_uuid.clone(),
            FileAttributes {
                uuid: root_uuid.clone(),
                name: "/".to_string(),
                parent_uuid: None,
                mode: 0o755,
                uid: 0,
                gid: 0,
                atime: 0,
                mtime: 0,
                ctime: 0,
                file_type: FileType::Directory,
                size: None,
                fully_replicated: None,
                nlink: None,
                virtual_entry: false,
                virtual_adapter: None,
            },
        );
        Self {
            factory,
            root_uuid,
            state: Mutex::new(State {
                attrs,
                children: HashMap::new(),
                locations: HashMap::new(),
                symlinks: HashMap::new(),
                xattrs: HashMap::new(),
                fs_stats: HashMap::new(),
                next_file: 1,
                next_handle: 1,
                next_probe: 1,
            }),
            posts: Mutex::new(Vec::new()),
            sync_calls: Mutex::new(Vec::new()),
            sync_noop: AtomicBool::new(false),
            corrupt_checksums: AtomicBool::new(false),
            stream_subscriptions: Mutex::new(Vec::new()),
        }
    }

    fn dir_attr(uuid: &str, parent: &str, name: &str) -> FileAttributes {
        FileAttributes {
            uuid: uuid.to_string(),
            name: name.to_string(),
            parent_uuid: Some(parent.to_string()),
            mode: 0o755,
            uid: 0,
            gid: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
            file_type: FileType::Directory,
            size: None,
            fully_replicated: None,
            nlink: None,
            virtual_entry: false,
            virtual_adapter: None,
        }
    }

    /// Registers a space directory directly under the root. The identity
    /// follows the space-uuid scheme so space-relative symlinks resolve.
    pub fn add_space(&self, space_id: &str, name: &str) -> String {
        let uuid = ident::space_id_to_space_uuid(space_id);
        let mut state = self.state.lock().unwrap();
        let root = self.root_uuid.clone();
        state
            .attrs
            .insert(uuid.clone(), Self::dir_attr(&uuid, &root, name));
        state
            .children
            .entry(root)
            .or_default()
            .push(uuid.clone());
        uuid
    }

    pub fn add_dir(&self, parent_uuid: &str, name: &str) -> String {
        let mut state = self.state.lock().unwrap();
        let n = state.next_file;
        state.next_file += 1;
        let uuid = ident::encode_uuid(&format!("dir-{n}"), SPACE_ID);
        state
            .attrs
            .insert(uuid.clone(), Self::dir_attr(&uuid, parent_uuid, name));
        state
            .children
            .entry(parent_uuid.to_string())
            .or_default()
            .push(uuid.clone());
        uuid
    }

    /// Registers a regular file. `content` is seeded into the on-storage
    /// store; `replicated` lists the byte ranges the location map starts
    /// with (pass `&[(0, len)]` for a fully local file).
    pub fn add_file(
        &self,
        parent_uuid: &str,
        name: &str,
        content: &[u8],
        replicated: &[(u64, u64)],
    ) -> String {
        let mut state = self.state.lock().unwrap();
        let n = state.next_file;
        state.next_file += 1;
        let file_id = format!("sfid-{n}");
        let uuid = ident::encode_uuid(&format!("file-{n}"), SPACE_ID);

        state.attrs.insert(
            uuid.clone(),
            FileAttributes {
                uuid: uuid.clone(),
                name: name.to_string(),
                parent_uuid: Some(parent_uuid.to_string()),
                mode: 0o644,
                uid: 0,
                gid: 0,
                atime: 0,
                mtime: 0,
                ctime: 0,
                file_type: FileType::Regular,
                size: Some(content.len() as u64),
                fully_replicated: None,
                nlink: None,
                virtual_entry: false,
                virtual_adapter: None,
            },
        );

        let mut blocks = IntervalMap::new();
        for &(start, end) in replicated {
            blocks.put(
                start,
                end,
                FileBlock {
                    storage_id: STORAGE_ID.to_string(),
                    file_id: file_id.clone(),
                },
            );
        }
        state.locations.insert(
            uuid.clone(),
            FileLocation {
                uuid: uuid.clone(),
                space_id: SPACE_ID.to_string(),
                storage_id: STORAGE_ID.to_string(),
                file_id: file_id.clone(),
                version: 1,
                blocks,
            },
        );
        state
            .children
            .entry(parent_uuid.to_string())
            .or_default()
            .push(uuid.clone());

        self.factory
            .files(STORAGE_ID)
            .lock()
            .unwrap()
            .insert(file_id, content.to_vec());
        uuid
    }

    pub fn set_fs_stats(&self, uuid: &str, total: u64, free: u64) {
        self.state
            .lock()
            .unwrap()
            .fs_stats
            .insert(uuid.to_string(), (total, free));
    }

    pub fn stored_symlink(&self, uuid: &str) -> Option<String> {
        self.state.lock().unwrap().symlinks.get(uuid).cloned()
    }

    pub fn location_of(&self, uuid: &str) -> Option<FileLocation> {
        self.state.lock().unwrap().locations.get(uuid).cloned()
    }

    pub fn block_sync_posts(&self) -> Vec<(String, u64, u64, u32)> {
        self.posts
            .lock()
            .unwrap()
            .iter()
            .filter_map(|request| match request {
                ProviderRequest::BlockSynchronizationRequest {
                    uuid,
                    start,
                    end,
                    priority,
                } => Some((uuid.clone(), *start, *end, *priority)),
                _ => None,
            })
            .collect()
    }

    pub fn event_batches(&self) -> Vec<Vec<EventWire>> {
        self.posts
            .lock()
            .unwrap()
            .iter()
            .filter_map(|request| match request {
                ProviderRequest::Events { events } => Some(events.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn subscribe_stream(&self, subscription: EventSubscription) {
        self.stream_subscriptions.lock().unwrap().push(subscription);
    }

    fn direct_params(&self) -> HelperParams {
        HelperParams {
            storage_id: STORAGE_ID.to_string(),
            name: "posix".to_string(),
            args: HashMap::new(),
        }
    }

    fn child_by_name(state: &State, parent: &str, name: &str) -> Option<String> {
        state.children.get(parent).and_then(|children| {
            children
                .iter()
                .find(|uuid| {
                    state
                        .attrs
                        .get(*uuid)
                        .map(|attr| attr.name == name)
                        .unwrap_or(false)
                })
                .cloned()
        })
    }

    fn apply_sync(
        &self,
        state: &mut State,
        uuid: &str,
        start: u64,
        end: u64,
    ) -> Result<(FileLocation, u64, u64)> {
        let size = state
            .attrs
            .get(uuid)
            .and_then(|attr| attr.size)
            .unwrap_or(0);
        let start = start.min(size);
        let end = end.min(size);
        let location = state
            .locations
            .get_mut(uuid)
            .ok_or_else(|| ClientError::NotFound {
                uuid: uuid.to_string(),
            })?;
        if !self.sync_noop.load(Ordering::SeqCst) && end > start {
            let block = location.default_block();
            location.blocks.put(start, end, block);
        }
        location.version += 1;
        Ok((location.clone(), start, end))
    }

    fn range_checksum(&self, state: &State, uuid: &str, start: u64, end: u64) -> String {
        if self.corrupt_checksums.load(Ordering::SeqCst) {
            return "corrupt".to_string();
        }
        let Some(location) = state.locations.get(uuid) else {
            return String::new();
        };
        let files = self.factory.files(STORAGE_ID);
        let files = files.lock().unwrap();
        let Some(content) = files.get(&location.file_id) else {
            return String::new();
        };
        let start = (start as usize).min(content.len());
        let end = (end as usize).min(content.len());
        sha256_hex(&content[start..end])
    }
}

impl Provider for TestProvider {
    fn communicate(
        &self,
        request: ProviderRequest,
        _timeout: Duration,
    ) -> Result<ProviderResponse> {
        let mut state = self.state.lock().unwrap();
        match request {
            ProviderRequest::GetConfiguration => {
                Ok(ProviderResponse::Configuration(Configuration {
                    root_uuid: self.root_uuid.clone(),
                    subscriptions: self.stream_subscriptions.lock().unwrap().clone(),
                    disabled_spaces: Vec::new(),
                }))
            }
            ProviderRequest::GetFsStats { uuid } => state
                .fs_stats
                .get(&uuid)
                .map(|&(total_size, free_size)| {
                    ProviderResponse::FsStats(FsStats {
                        total_size,
                        free_size,
                    })
                })
                .ok_or(ClientError::NotFound { uuid }),
            ProviderRequest::GetFileAttr { uuid } => state
                .attrs
                .get(&uuid)
                .cloned()
                .map(ProviderResponse::FileAttr)
                .ok_or(ClientError::NotFound { uuid }),
            ProviderRequest::GetChildAttr { parent_uuid, name } => {
                Self::child_by_name(&state, &parent_uuid, &name)
                    .and_then(|uuid| state.attrs.get(&uuid).cloned())
                    .map(ProviderResponse::FileAttr)
                    .ok_or(ClientError::NotFound {
                        uuid: format!("{parent_uuid}/{name}"),
                    })
            }
            ProviderRequest::GetFileChildrenAttrs {
                uuid,
                offset,
                limit,
                ..
            } => {
                let children: Vec<FileAttributes> = state
                    .children
                    .get(&uuid)
                    .map(|uuids| {
                        uuids
                            .iter()
                            .filter_map(|child| state.attrs.get(child).cloned())
                            .collect()
                    })
                    .unwrap_or_default();
                let start = (offset as usize).min(children.len());
                let end = (start + limit).min(children.len());
                Ok(ProviderResponse::FileChildren {
                    children: children[start..end].to_vec(),
                    index_token: Some(format!("tok-{end}")),
                    is_last: end >= children.len(),
                })
            }
            ProviderRequest::GetFileLocation { uuid } => state
                .locations
                .get(&uuid)
                .cloned()
                .map(ProviderResponse::FileLocation)
                .ok_or(ClientError::NotFound { uuid }),
            ProviderRequest::GetHelperParams { mode, .. } => {
                let params = match mode {
                    oneclient_core::proto::HelperMode::Proxy => HelperParams {
                        storage_id: STORAGE_ID.to_string(),
                        name: PROXY_HELPER_NAME.to_string(),
                        args: HashMap::new(),
                    },
                    _ => self.direct_params(),
                };
                Ok(ProviderResponse::HelperParams(params))
            }
            ProviderRequest::CreateStorageTestFile { storage_id, .. } => {
                let n = state.next_probe;
                state.next_probe += 1;
                let file_id = format!("probe-{n}");
                let content = format!("probe-content-{n}");
                self.factory
                    .files(&storage_id)
                    .lock()
                    .unwrap()
                    .insert(file_id.clone(), content.clone().into_bytes());
                Ok(ProviderResponse::StorageTestFile(StorageTestFile {
                    helper_params: self.direct_params(),
                    space_id: SPACE_ID.to_string(),
                    file_id,
                    file_content: content,
                }))
            }
            ProviderRequest::VerifyStorageTestFile {
                storage_id,
                file_id,
                file_content,
                ..
            } => {
                let files = self.factory.files(&storage_id);
                let files = files.lock().unwrap();
                match files.get(&file_id) {
                    Some(content) if content == &file_content.clone().into_bytes() => {
                        Ok(ProviderResponse::Ok)
                    }
                    _ => Err(ClientError::Protocol {
                        msg: "storage test file content mismatch".to_string(),
                    }),
                }
            }
            ProviderRequest::CreateFile {
                parent_uuid,
                name,
                mode,
                ..
            } => {
                let n = state.next_file;
                state.next_file += 1;
                let file_id = format!("sfid-{n}");
                let uuid = ident::encode_uuid(&format!("file-{n}"), SPACE_ID);
                let attr = FileAttributes {
                    uuid: uuid.clone(),
                    name: name.clone(),
                    parent_uuid: Some(parent_uuid.clone()),
                    mode,
                    uid: 0,
                    gid: 0,
                    atime: 0,
                    mtime: 0,
                    ctime: 0,
                    file_type: FileType::Regular,
                    size: Some(0),
                    fully_replicated: None,
                    nlink: None,
                    virtual_entry: false,
                    virtual_adapter: None,
                };
                let location = FileLocation {
                    uuid: uuid.clone(),
                    space_id: SPACE_ID.to_string(),
                    storage_id: STORAGE_ID.to_string(),
                    file_id: file_id.clone(),
                    version: 1,
                    blocks: IntervalMap::new(),
                };
                state.attrs.insert(uuid.clone(), attr.clone());
                state.locations.insert(uuid.clone(), location.clone());
                state
                    .children
                    .entry(parent_uuid)
                    .or_default()
                    .push(uuid.clone());
                self.factory
                    .files(STORAGE_ID)
                    .lock()
                    .unwrap()
                    .insert(file_id, Vec::new());
                let handle = state.next_handle;
                state.next_handle += 1;
                Ok(ProviderResponse::FileCreated {
                    attr,
                    location,
                    handle_id: format!("ph-{handle}"),
                })
            }
            ProviderRequest::CreateDir {
                parent_uuid, name, ..
            } => {
                let n = state.next_file;
                state.next_file += 1;
                let uuid = ident::encode_uuid(&format!("dir-{n}"), SPACE_ID);
                state
                    .attrs
                    .insert(uuid.clone(), Self::dir_attr(&uuid, &parent_uuid, &name));
                state
                    .children
                    .entry(parent_uuid)
                    .or_default()
                    .push(uuid);
                Ok(ProviderResponse::Ok)
            }
            ProviderRequest::MakeFile {
                parent_uuid, name, mode,
            } => {
                let n = state.next_file;
                state.next_file += 1;
                let file_id = format!("sfid-{n}");
                let uuid = ident::encode_uuid(&format!("file-{n}"), SPACE_ID);
                let attr = FileAttributes {
                    uuid: uuid.clone(),
                    name,
                    parent_uuid: Some(parent_uuid.clone()),
                    mode,
                    uid: 0,
                    gid: 0,
                    atime: 0,
                    mtime: 0,
                    ctime: 0,
                    file_type: FileType::Regular,
                    size: Some(0),
                    fully_replicated: None,
                    nlink: None,
                    virtual_entry: false,
                    virtual_adapter: None,
                };
                let location = FileLocation {
                    uuid: uuid.clone(),
                    space_id: SPACE_ID.to_string(),
                    storage_id: STORAGE_ID.to_string(),
                    file_id: file_id.clone(),
                    version: 1,
                    blocks: IntervalMap::new(),
                };
                state.attrs.insert(uuid.clone(), attr.clone());
                state.locations.insert(uuid.clone(), location);
                state
                    .children
                    .entry(parent_uuid)
                    .or_default()
                    .push(uuid);
                self.factory
                    .files(STORAGE_ID)
                    .lock()
                    .unwrap()
                    .insert(file_id, Vec::new());
                Ok(ProviderResponse::FileAttr(attr))
            }
            ProviderRequest::MakeLink {
                uuid,
                parent_uuid,
                name,
            } => {
                let target = state
                    .attrs
                    .get(&uuid)
                    .cloned()
                    .ok_or(ClientError::NotFound { uuid: uuid.clone() })?;
                let n = state.next_file;
                state.next_file += 1;
                let link_uuid = ident::encode_uuid(&format!("link-{n}"), SPACE_ID);
                let attr = FileAttributes {
                    uuid: link_uuid.clone(),
                    name,
                    parent_uuid: Some(parent_uuid.clone()),
                    file_type: FileType::Link,
                    ..target
                };
                state.attrs.insert(link_uuid.clone(), attr.clone());
                if let Some(mut location) = state.locations.get(&uuid).cloned() {
                    location.uuid = link_uuid.clone();
                    state.locations.insert(link_uuid.clone(), location);
                }
                state
                    .children
                    .entry(parent_uuid)
                    .or_default()
                    .push(link_uuid);
                Ok(ProviderResponse::FileAttr(attr))
            }
            ProviderRequest::MakeSymlink {
                parent_uuid,
                name,
                link,
            } => {
                let n = state.next_file;
                state.next_file += 1;
                let uuid = ident::encode_uuid(&format!("sym-{n}"), SPACE_ID);
                let attr = FileAttributes {
                    uuid: uuid.clone(),
                    name,
                    parent_uuid: Some(parent_uuid.clone()),
                    mode: 0o777,
                    uid: 0,
                    gid: 0,
                    atime: 0,
                    mtime: 0,
                    ctime: 0,
                    file_type: FileType::Symlink,
                    size: None,
                    fully_replicated: None,
                    nlink: None,
                    virtual_entry: false,
                    virtual_adapter: None,
                };
                state.attrs.insert(uuid.clone(), attr.clone());
                state.symlinks.insert(uuid.clone(), link);
                state
                    .children
                    .entry(parent_uuid)
                    .or_default()
                    .push(uuid);
                Ok(ProviderResponse::FileAttr(attr))
            }
            ProviderRequest::OpenFile { .. } => {
                let handle = state.next_handle;
                state.next_handle += 1;
                Ok(ProviderResponse::FileOpened {
                    handle_id: format!("ph-{handle}"),
                })
            }
            ProviderRequest::Release { .. } | ProviderRequest::FSync { .. } => {
                Ok(ProviderResponse::Ok)
            }
            ProviderRequest::SynchronizeBlock {
                uuid,
                start,
                end,
                priority,
            } => {
                self.sync_calls
                    .lock()
                    .unwrap()
                    .push((uuid.clone(), start, end, priority));
                let (location, start, end) = self.apply_sync(&mut state, &uuid, start, end)?;
                Ok(ProviderResponse::LocationChanged {
                    location,
                    change_start: Some(start),
                    change_end: Some(end),
                })
            }
            ProviderRequest::SynchronizeBlockAndComputeChecksum { uuid, start, end } => {
                let (location, start, end) = self.apply_sync(&mut state, &uuid, start, end)?;
                let checksum = self.range_checksum(&state, &uuid, start, end);
                Ok(ProviderResponse::SyncChecksum {
                    checksum,
                    location,
                    change_start: Some(start),
                    change_end: Some(end),
                })
            }
            ProviderRequest::Truncate { uuid, size } => {
                if let Some(attr) = state.attrs.get_mut(&uuid) {
                    attr.size = Some(size);
                }
                let file_id = state.locations.get_mut(&uuid).map(|location| {
                    location.blocks.truncate(size);
                    location.version += 1;
                    location.file_id.clone()
                });
                if let Some(file_id) = file_id {
                    if let Some(content) = self
                        .factory
                        .files(STORAGE_ID)
                        .lock()
                        .unwrap()
                        .get_mut(&file_id)
                    {
                        content.resize(size as usize, 0);
                    }
                }
                Ok(ProviderResponse::Ok)
            }
            ProviderRequest::Rename {
                uuid,
                target_parent_uuid,
                target_name,
            } => {
                let mut attr = state
                    .attrs
                    .remove(&uuid)
                    .ok_or(ClientError::NotFound { uuid: uuid.clone() })?;
                if let Some(old_parent) = attr.parent_uuid.as_deref() {
                    if let Some(children) = state.children.get_mut(old_parent) {
                        children.retain(|child| child != &uuid);
                    }
                }
                let n = state.next_file;
                state.next_file += 1;
                let new_uuid = ident::encode_uuid(&format!("moved-{n}"), SPACE_ID);
                attr.uuid = new_uuid.clone();
                attr.name = target_name;
                attr.parent_uuid = Some(target_parent_uuid.clone());
                state.attrs.insert(new_uuid.clone(), attr);
                if let Some(mut location) = state.locations.remove(&uuid) {
                    location.uuid = new_uuid.clone();
                    state.locations.insert(new_uuid.clone(), location);
                }
                if let Some(value) = state.symlinks.remove(&uuid) {
                    state.symlinks.insert(new_uuid.clone(), value);
                }
                if let Some(xattrs) = state.xattrs.remove(&uuid) {
                    state.xattrs.insert(new_uuid.clone(), xattrs);
                }
                state
                    .children
                    .entry(target_parent_uuid)
                    .or_default()
                    .push(new_uuid.clone());
                Ok(ProviderResponse::FileRenamed { new_uuid })
            }
            ProviderRequest::DeleteFile { uuid } => {
                let attr = state
                    .attrs
                    .remove(&uuid)
                    .ok_or(ClientError::NotFound { uuid: uuid.clone() })?;
                if let Some(parent) = attr.parent_uuid.as_deref() {
                    if let Some(children) = state.children.get_mut(parent) {
                        children.retain(|child| child != &uuid);
                    }
                }
                state.locations.remove(&uuid);
                state.symlinks.remove(&uuid);
                state.children.remove(&uuid);
                Ok(ProviderResponse::Ok)
            }
            ProviderRequest::ChangeMode { uuid, mode } => {
                if let Some(attr) = state.attrs.get_mut(&uuid) {
                    attr.mode = mode;
                }
                Ok(ProviderResponse::Ok)
            }
            ProviderRequest::UpdateTimes {
                uuid,
                atime,
                mtime,
                ctime,
            } => {
                if let Some(attr) = state.attrs.get_mut(&uuid) {
                    if let Some(t) = atime {
                        attr.atime = t;
                    }
                    if let Some(t) = mtime {
                        attr.mtime = t;
                    }
                    if let Some(t) = ctime {
                        attr.ctime = t;
                    }
                }
                Ok(ProviderResponse::Ok)
            }
            ProviderRequest::ReadSymlink { uuid } => state
                .symlinks
                .get(&uuid)
                .cloned()
                .map(ProviderResponse::Symlink)
                .ok_or(ClientError::NotFound { uuid }),
            ProviderRequest::GetXAttr { uuid, name } => state
                .xattrs
                .get(&uuid)
                .and_then(|attrs| attrs.get(&name))
                .cloned()
                .map(ProviderResponse::XAttr)
                .ok_or(ClientError::NotFound {
                    uuid: format!("{uuid}#{name}"),
                }),
            ProviderRequest::SetXAttr {
                uuid, name, value, ..
            } => {
                state.xattrs.entry(uuid).or_default().insert(name, value);
                Ok(ProviderResponse::Ok)
            }
            ProviderRequest::RemoveXAttr { uuid, name } => {
                let removed = state
                    .xattrs
                    .get_mut(&uuid)
                    .and_then(|attrs| attrs.remove(&name));
                match removed {
                    Some(_) => Ok(ProviderResponse::Ok),
                    None => Err(ClientError::NotFound {
                        uuid: format!("{uuid}#{name}"),
                    }),
                }
            }
            ProviderRequest::ListXAttr { uuid } => {
                let mut names: Vec<String> = state
                    .xattrs
                    .get(&uuid)
                    .map(|attrs| attrs.keys().cloned().collect())
                    .unwrap_or_default();
                names.sort();
                Ok(ProviderResponse::XAttrList(names))
            }
            ProviderRequest::CloseSession => Ok(ProviderResponse::Ok),
            other => {
                self.posts.lock().unwrap().push(other);
                Ok(ProviderResponse::Ok)
            }
        }
    }

    fn post(&self, request: ProviderRequest) {
        self.posts.lock().unwrap().push(request);
    }
}

/// A mounted engine over the in-memory provider and storage, with one
/// space registered.
pub struct TestWorld {
    pub provider: Arc<TestProvider>,
    pub factory: Arc<InMemoryHelperFactory>,
    pub fs: FsLogic,
    pub root: String,
    pub space: String,
}

impl TestWorld {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(configure: impl FnOnce(&mut ClientConfig)) -> Self {
        Self::build(configure, false, Box::new(|_| false))
    }

    pub fn with_consistency_check(configure: impl FnOnce(&mut ClientConfig)) -> Self {
        Self::build(configure, true, Box::new(|_| false))
    }

    pub fn with_mount_checker(
        configure: impl FnOnce(&mut ClientConfig),
        checker: MountChecker,
    ) -> Self {
        Self::build(configure, false, checker)
    }

    fn build(
        configure: impl FnOnce(&mut ClientConfig),
        consistency_check: bool,
        checker: MountChecker,
    ) -> Self {
        let factory = Arc::new(if consistency_check {
            InMemoryHelperFactory::with_consistency_check()
        } else {
            InMemoryHelperFactory::new()
        });
        let provider = Arc::new(TestProvider::new(Arc::clone(&factory)));
        let space = provider.add_space(SPACE_ID, SPACE_NAME);

        let mut config = ClientConfig {
            root_uuid: provider.root_uuid.clone(),
            mount_point: PathBuf::from(MOUNT_POINT),
            io_mode: oneclient_core::config::IoMode::ForceProxy,
            directory_cache_drop_after_secs: 0,
            max_retries: 2,
            retry_delays_ms: vec![(1, 2)],
            storage_detection_retry_delay_secs: 0,
            min_prefetch_block_size: 0,
            ..Default::default()
        };
        configure(&mut config);

        let fs = FsLogic::with_mount_checker(
            config,
            provider.clone() as Arc<dyn Provider>,
            factory.clone(),
            checker,
        )
        .expect("engine mounts against the test provider");

        let root = provider.root_uuid.clone();
        Self {
            provider,
            factory,
            fs,
            root,
            space,
        }
    }
}
