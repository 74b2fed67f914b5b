//! Abstract provider RPC surface.
//!
//! The wire codec itself is an external collaborator; the engine sees
//! typed request/response messages and a blocking [`Provider`] transport.
//! [`RemoteClient`] wraps the transport with one method per request,
//! turning unexpected response variants into protocol errors.

use crate::attrs::FileAttributes;
use crate::blocks::FileLocation;
use crate::error::{ClientError, Result};
use crate::helpers::{HelperParams, OpenFlags};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Mode requested from GetHelperParams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HelperMode {
    Auto,
    Direct,
    Proxy,
}

/// Server-driven event stream kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    FileRead,
    FileWritten,
    FileTruncated,
    QuotaExceeded,
}

/// Per-identity push subscription kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscriptionKind {
    FileAttrChanged,
    FileLocationChanged,
    FileRemoved,
    FileRenamed,
    ReplicaStatusChanged,
    PermissionChanged,
}

/// Flush thresholds for one server-requested event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSubscription {
    pub id: i64,
    pub kind: StreamKind,
    pub time_threshold_ms: Option<u64>,
    pub count_threshold: Option<u64>,
    pub size_threshold: Option<u64>,
}

/// Aggregated event batch entry flushed to the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventWire {
    pub kind: StreamKind,
    pub uuid: String,
    pub count: u64,
    pub size: u64,
    pub blocks: Vec<(u64, u64)>,
}

/// Mount-time handshake payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Configuration {
    pub root_uuid: String,
    pub subscriptions: Vec<EventSubscription>,
    pub disabled_spaces: Vec<String>,
}

/// Probe-file description used by direct-IO detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageTestFile {
    pub helper_params: HelperParams,
    pub space_id: String,
    pub file_id: String,
    pub file_content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsStats {
    pub total_size: u64,
    pub free_size: u64,
}

#[derive(Debug, Clone)]
pub enum ProviderRequest {
    GetConfiguration,
    GetFsStats {
        uuid: String,
    },
    GetFileAttr {
        uuid: String,
    },
    GetChildAttr {
        parent_uuid: String,
        name: String,
    },
    GetFileChildrenAttrs {
        uuid: String,
        offset: u64,
        limit: usize,
        index_token: Option<String>,
        include_replication_status: bool,
        include_link_count: bool,
    },
    GetFileLocation {
        uuid: String,
    },
    GetHelperParams {
        storage_id: String,
        space_id: String,
        mode: HelperMode,
    },
    CreateStorageTestFile {
        uuid: String,
        storage_id: String,
    },
    VerifyStorageTestFile {
        storage_id: String,
        space_id: String,
        file_id: String,
        file_content: String,
    },
    CreateFile {
        parent_uuid: String,
        name: String,
        mode: u32,
        flags: OpenFlags,
    },
    CreateDir {
        parent_uuid: String,
        name: String,
        mode: u32,
    },
    MakeFile {
        parent_uuid: String,
        name: String,
        mode: u32,
    },
    MakeLink {
        uuid: String,
        parent_uuid: String,
        name: String,
    },
    MakeSymlink {
        parent_uuid: String,
        name: String,
        link: String,
    },
    OpenFile {
        uuid: String,
        flags: OpenFlags,
    },
    Release {
        uuid: String,
        handle_id: String,
    },
    FSync {
        uuid: String,
        handle_id: String,
        data_only: bool,
    },
    SynchronizeBlock {
        uuid: String,
        start: u64,
        end: u64,
        priority: u32,
    },
    SynchronizeBlockAndComputeChecksum {
        uuid: String,
        start: u64,
        end: u64,
    },
    /// Fire-and-forget block synchronization used by async prefetch.
    BlockSynchronizationRequest {
        uuid: String,
        start: u64,
        end: u64,
        priority: u32,
    },
    Truncate {
        uuid: String,
        size: u64,
    },
    Rename {
        uuid: String,
        target_parent_uuid: String,
        target_name: String,
    },
    DeleteFile {
        uuid: String,
    },
    ChangeMode {
        uuid: String,
        mode: u32,
    },
    UpdateTimes {
        uuid: String,
        atime: Option<i64>,
        mtime: Option<i64>,
        ctime: Option<i64>,
    },
    ReadSymlink {
        uuid: String,
    },
    GetXAttr {
        uuid: String,
        name: String,
    },
    SetXAttr {
        uuid: String,
        name: String,
        value: String,
        create: bool,
        replace: bool,
    },
    RemoveXAttr {
        uuid: String,
        name: String,
    },
    ListXAttr {
        uuid: String,
    },
    Subscribe {
        subscription_id: i64,
        kind: SubscriptionKind,
        uuid: String,
    },
    CancelSubscription {
        subscription_id: i64,
    },
    Events {
        events: Vec<EventWire>,
    },
    CloseSession,
}

impl ProviderRequest {
    /// Short name used in logs and protocol errors.
    pub fn name(&self) -> &'static str {
        match self {
            ProviderRequest::GetConfiguration => "GetConfiguration",
            ProviderRequest::GetFsStats { .. } => "GetFsStats",
            ProviderRequest::GetFileAttr { .. } => "GetFileAttr",
            ProviderRequest::GetChildAttr { .. } => "GetChildAttr",
            ProviderRequest::GetFileChildrenAttrs { .. } => "GetFileChildrenAttrs",
            ProviderRequest::GetFileLocation { .. } => "GetFileLocation",
            ProviderRequest::GetHelperParams { .. } => "GetHelperParams",
            ProviderRequest::CreateStorageTestFile { .. } => "CreateStorageTestFile",
            ProviderRequest::VerifyStorageTestFile { .. } => "VerifyStorageTestFile",
            ProviderRequest::CreateFile { .. } => "CreateFile",
            ProviderRequest::CreateDir { .. } => "CreateDir",
            ProviderRequest::MakeFile { .. } => "MakeFile",
            ProviderRequest::MakeLink { .. } => "MakeLink",
            ProviderRequest::MakeSymlink { .. } => "MakeSymlink",
            ProviderRequest::OpenFile { .. } => "OpenFile",
            ProviderRequest::Release { .. } => "Release",
            ProviderRequest::FSync { .. } => "FSync",
            ProviderRequest::SynchronizeBlock { .. } => "SynchronizeBlock",
            ProviderRequest::SynchronizeBlockAndComputeChecksum { .. } => {
                "SynchronizeBlockAndComputeChecksum"
            }
            ProviderRequest::BlockSynchronizationRequest { .. } => "BlockSynchronizationRequest",
            ProviderRequest::Truncate { .. } => "Truncate",
            ProviderRequest::Rename { .. } => "Rename",
            ProviderRequest::DeleteFile { .. } => "DeleteFile",
            ProviderRequest::ChangeMode { .. } => "ChangeMode",
            ProviderRequest::UpdateTimes { .. } => "UpdateTimes",
            ProviderRequest::ReadSymlink { .. } => "ReadSymlink",
            ProviderRequest::GetXAttr { .. } => "GetXAttr",
            ProviderRequest::SetXAttr { .. } => "SetXAttr",
            ProviderRequest::RemoveXAttr { .. } => "RemoveXAttr",
            ProviderRequest::ListXAttr { .. } => "ListXAttr",
            ProviderRequest::Subscribe { .. } => "Subscribe",
            ProviderRequest::CancelSubscription { .. } => "CancelSubscription",
            ProviderRequest::Events { .. } => "Events",
            ProviderRequest::CloseSession => "CloseSession",
        }
    }
}

#[derive(Debug, Clone)]
pub enum ProviderResponse {
    Ok,
    Configuration(Configuration),
    FsStats(FsStats),
    FileAttr(FileAttributes),
    FileChildren {
        children: Vec<FileAttributes>,
        index_token: Option<String>,
        is_last: bool,
    },
    FileLocation(FileLocation),
    LocationChanged {
        location: FileLocation,
        change_start: Option<u64>,
        change_end: Option<u64>,
    },
    HelperParams(HelperParams),
    StorageTestFile(StorageTestFile),
    FileCreated {
        attr: FileAttributes,
        location: FileLocation,
        handle_id: String,
    },
    FileOpened {
        handle_id: String,
    },
    FileRenamed {
        new_uuid: String,
    },
    Symlink(String),
    XAttr(String),
    XAttrList(Vec<String>),
    SyncChecksum {
        checksum: String,
        location: FileLocation,
        change_start: Option<u64>,
        change_end: Option<u64>,
    },
}

/// Messages the provider pushes outside the request/response cycle.
#[derive(Debug, Clone)]
pub enum PushMessage {
    FileAttrChanged(FileAttributes),
    FileLocationChanged {
        location: FileLocation,
        change_start: Option<u64>,
        change_end: Option<u64>,
    },
    FileRemoved {
        uuid: String,
    },
    FileRenamed {
        old_uuid: String,
        new_uuid: String,
        new_parent_uuid: String,
        new_name: String,
    },
    ReplicaStatusChanged(FileAttributes),
    PermissionChanged {
        uuid: String,
    },
    QuotaExceeded {
        disabled_spaces: Vec<String>,
    },
    SubscriptionCreated(EventSubscription),
    SubscriptionCancelled {
        id: i64,
    },
}

/// Blocking transport to the remote provider.
pub trait Provider: Send + Sync {
    /// Sends a request and awaits the typed response within `timeout`.
    fn communicate(&self, request: ProviderRequest, timeout: Duration)
        -> Result<ProviderResponse>;

    /// Sends a request without awaiting a response.
    fn post(&self, request: ProviderRequest);
}

fn unexpected(request: &ProviderRequest, response: &ProviderResponse) -> ClientError {
    ClientError::Protocol {
        msg: format!("unexpected response {:?} to {}", response, request.name()),
    }
}

/// Typed facade over [`Provider`] carrying the configured RPC deadline.
#[derive(Clone)]
pub struct RemoteClient {
    provider: Arc<dyn Provider>,
    timeout: Duration,
}

impl RemoteClient {
    pub fn new(provider: Arc<dyn Provider>, timeout: Duration) -> Self {
        Self { provider, timeout }
    }

    pub fn post(&self, request: ProviderRequest) {
        self.provider.post(request);
    }

    fn call(&self, request: ProviderRequest) -> Result<ProviderResponse> {
        tracing::debug!("Provider RPC: {}", request.name());
        self.provider.communicate(request, self.timeout)
    }

    fn call_ok(&self, request: ProviderRequest) -> Result<()> {
        match self.call(request.clone())? {
            ProviderResponse::Ok => Ok(()),
            other => Err(unexpected(&request, &other)),
        }
    }

    fn call_attr(&self, request: ProviderRequest) -> Result<FileAttributes> {
        match self.call(request.clone())? {
            ProviderResponse::FileAttr(attr) => Ok(attr),
            other => Err(unexpected(&request, &other)),
        }
    }

    pub fn get_configuration(&self) -> Result<Configuration> {
        let request = ProviderRequest::GetConfiguration;
        match self.call(request.clone())? {
            ProviderResponse::Configuration(config) => Ok(config),
            other => Err(unexpected(&request, &other)),
        }
    }

    pub fn get_fs_stats(&self, uuid: &str) -> Result<FsStats> {
        let request = ProviderRequest::GetFsStats {
            uuid: uuid.to_string(),
        };
        match self.call(request.clone())? {
            ProviderResponse::FsStats(stats) => Ok(stats),
            other => Err(unexpected(&request, &other)),
        }
    }

    pub fn get_file_attr(&self, uuid: &str) -> Result<FileAttributes> {
        self.call_attr(ProviderRequest::GetFileAttr {
            uuid: uuid.to_string(),
        })
    }

    pub fn get_child_attr(&self, parent_uuid: &str, name: &str) -> Result<FileAttributes> {
        self.call_attr(ProviderRequest::GetChildAttr {
            parent_uuid: parent_uuid.to_string(),
            name: name.to_string(),
        })
    }

    #[allow(clippy::type_complexity)]
    pub fn get_file_children_attrs(
        &self,
        uuid: &str,
        offset: u64,
        limit: usize,
        index_token: Option<String>,
        include_replication_status: bool,
        include_link_count: bool,
    ) -> Result<(Vec<FileAttributes>, Option<String>, bool)> {
        let request = ProviderRequest::GetFileChildrenAttrs {
            uuid: uuid.to_string(),
            offset,
            limit,
            index_token,
            include_replication_status,
            include_link_count,
        };
        match self.call(request.clone())? {
            ProviderResponse::FileChildren {
                children,
                index_token,
                is_last,
            } => Ok((children, index_token, is_last)),
            other => Err(unexpected(&request, &other)),
        }
    }

    pub fn get_file_location(&self, uuid: &str) -> Result<FileLocation> {
        let request = ProviderRequest::GetFileLocation {
            uuid: uuid.to_string(),
        };
        match self.call(request.clone())? {
            ProviderResponse::FileLocation(location) => Ok(location),
            other => Err(unexpected(&request, &other)),
        }
    }

    pub fn get_helper_params(
        &self,
        storage_id: &str,
        space_id: &str,
        mode: HelperMode,
    ) -> Result<HelperParams> {
        let request = ProviderRequest::GetHelperParams {
            storage_id: storage_id.to_string(),
            space_id: space_id.to_string(),
            mode,
        };
        match self.call(request.clone())? {
            ProviderResponse::HelperParams(params) => Ok(params),
            other => Err(unexpected(&request, &other)),
        }
    }

    pub fn create_storage_test_file(
        &self,
        uuid: &str,
        storage_id: &str,
    ) -> Result<StorageTestFile> {
        let request = ProviderRequest::CreateStorageTestFile {
            uuid: uuid.to_string(),
            storage_id: storage_id.to_string(),
        };
        match self.call(request.clone())? {
            ProviderResponse::StorageTestFile(test_file) => Ok(test_file),
            other => Err(unexpected(&request, &other)),
        }
    }

    pub fn verify_storage_test_file(
        &self,
        storage_id: &str,
        space_id: &str,
        file_id: &str,
        file_content: &str,
    ) -> Result<()> {
        self.call_ok(ProviderRequest::VerifyStorageTestFile {
            storage_id: storage_id.to_string(),
            space_id: space_id.to_string(),
            file_id: file_id.to_string(),
            file_content: file_content.to_string(),
        })
    }

    pub fn create_file(
        &self,
        parent_uuid: &str,
        name: &str,
        mode: u32,
        flags: OpenFlags,
    ) -> Result<(FileAttributes, FileLocation, String)> {
        let request = ProviderRequest::CreateFile {
            parent_uuid: parent_uuid.to_string(),
            name: name.to_string(),
            mode,
            flags,
        };
        match self.call(request.clone())? {
            ProviderResponse::FileCreated {
                attr,
                location,
                handle_id,
            } => Ok((attr, location, handle_id)),
            other => Err(unexpected(&request, &other)),
        }
    }

    pub fn create_dir(&self, parent_uuid: &str, name: &str, mode: u32) -> Result<()> {
        self.call_ok(ProviderRequest::CreateDir {
            parent_uuid: parent_uuid.to_string(),
            name: name.to_string(),
            mode,
        })
    }

    pub fn make_file(&self, parent_uuid: &str, name: &str, mode: u32) -> Result<FileAttributes> {
        self.call_attr(ProviderRequest::MakeFile {
            parent_uuid: parent_uuid.to_string(),
            name: name.to_string(),
            mode,
        })
    }

    pub fn make_link(
        &self,
        uuid: &str,
        parent_uuid: &str,
        name: &str,
    ) -> Result<FileAttributes> {
        self.call_attr(ProviderRequest::MakeLink {
            uuid: uuid.to_string(),
            parent_uuid: parent_uuid.to_string(),
            name: name.to_string(),
        })
    }

    pub fn make_symlink(
        &self,
        parent_uuid: &str,
        name: &str,
        link: &str,
    ) -> Result<FileAttributes> {
        self.call_attr(ProviderRequest::MakeSymlink {
            parent_uuid: parent_uuid.to_string(),
            name: name.to_string(),
            link: link.to_string(),
        })
    }

    pub fn open_file(&self, uuid: &str, flags: OpenFlags) -> Result<String> {
        let request = ProviderRequest::OpenFile {
            uuid: uuid.to_string(),
            flags,
        };
        match self.call(request.clone())? {
            ProviderResponse::FileOpened { handle_id } => Ok(handle_id),
            other => Err(unexpected(&request, &other)),
        }
    }

    pub fn release(&self, uuid: &str, handle_id: &str) -> Result<()> {
        self.call_ok(ProviderRequest::Release {
            uuid: uuid.to_string(),
            handle_id: handle_id.to_string(),
        })
    }

    pub fn fsync(&self, uuid: &str, handle_id: &str, data_only: bool) -> Result<()> {
        self.call_ok(ProviderRequest::FSync {
            uuid: uuid.to_string(),
            handle_id: handle_id.to_string(),
            data_only,
        })
    }

    #[allow(clippy::type_complexity)]
    pub fn synchronize_block(
        &self,
        uuid: &str,
        start: u64,
        end: u64,
        priority: u32,
    ) -> Result<(FileLocation, Option<(u64, u64)>)> {
        let request = ProviderRequest::SynchronizeBlock {
            uuid: uuid.to_string(),
            start,
            end,
            priority,
        };
        match self.call(request.clone())? {
            ProviderResponse::LocationChanged {
                location,
                change_start,
                change_end,
            } => Ok((location, change_start.zip(change_end))),
            other => Err(unexpected(&request, &other)),
        }
    }

    #[allow(clippy::type_complexity)]
    pub fn synchronize_block_with_checksum(
        &self,
        uuid: &str,
        start: u64,
        end: u64,
    ) -> Result<(String, FileLocation, Option<(u64, u64)>)> {
        let request = ProviderRequest::SynchronizeBlockAndComputeChecksum {
            uuid: uuid.to_string(),
            start,
            end,
        };
        match self.call(request.clone())? {
            ProviderResponse::SyncChecksum {
                checksum,
                location,
                change_start,
                change_end,
            } => Ok((checksum, location, change_start.zip(change_end))),
            other => Err(unexpected(&request, &other)),
        }
    }

    pub fn request_block_synchronization(&self, uuid: &str, start: u64, end: u64, priority: u32) {
        self.post(ProviderRequest::BlockSynchronizationRequest {
            uuid: uuid.to_string(),
            start,
            end,
            priority,
        });
    }

    pub fn truncate(&self, uuid: &str, size: u64) -> Result<()> {
        self.call_ok(ProviderRequest::Truncate {
            uuid: uuid.to_string(),
            size,
        })
    }

    pub fn rename(
        &self,
        uuid: &str,
        target_parent_uuid: &str,
        target_name: &str,
    ) -> Result<String> {
        let request = ProviderRequest::Rename {
            uuid: uuid.to_string(),
            target_parent_uuid: target_parent_uuid.to_string(),
            target_name: target_name.to_string(),
        };
        match self.call(request.clone())? {
            ProviderResponse::FileRenamed { new_uuid } => Ok(new_uuid),
            other => Err(unexpected(&request, &other)),
        }
    }

    pub fn delete_file(&self, uuid: &str) -> Result<()> {
        self.call_ok(ProviderRequest::DeleteFile {
            uuid: uuid.to_string(),
        })
    }

    pub fn change_mode(&self, uuid: &str, mode: u32) -> Result<()> {
        self.call_ok(ProviderRequest::ChangeMode {
            uuid: uuid.to_string(),
            mode,
        })
    }

    pub fn update_times(
        &self,
        uuid: &str,
        atime: Option<i64>,
        mtime: Option<i64>,
        ctime: Option<i64>,
    ) -> Result<()> {
        self.call_ok(ProviderRequest::UpdateTimes {
            uuid: uuid.to_string(),
            atime,
            mtime,
            ctime,
        })
    }

    pub fn read_symlink(&self, uuid: &str) -> Result<String> {
        let request = ProviderRequest::ReadSymlink {
            uuid: uuid.to_string(),
        };
        match self.call(request.clone())? {
            ProviderResponse::Symlink(link) => Ok(link),
            other => Err(unexpected(&request, &other)),
        }
    }

    pub fn get_xattr(&self, uuid: &str, name: &str) -> Result<String> {
        let request = ProviderRequest::GetXAttr {
            uuid: uuid.to_string(),
            name: name.to_string(),
        };
        match self.call(request.clone())? {
            ProviderResponse::XAttr(value) => Ok(value),
            other => Err(unexpected(&request, &other)),
        }
    }

    pub fn set_xattr(
        &self,
        uuid: &str,
        name: &str,
        value: &str,
        create: bool,
        replace: bool,
    ) -> Result<()> {
        self.call_ok(ProviderRequest::SetXAttr {
            uuid: uuid.to_string(),
            name: name.to_string(),
            value: value.to_string(),
            create,
            replace,
        })
    }

    pub fn remove_xattr(&self, uuid: &str, name: &str) -> Result<()> {
        self.call_ok(ProviderRequest::RemoveXAttr {
            uuid: uuid.to_string(),
            name: name.to_string(),
        })
    }

    pub fn list_xattr(&self, uuid: &str) -> Result<Vec<String>> {
        let request = ProviderRequest::ListXAttr {
            uuid: uuid.to_string(),
        };
        match self.call(request.clone())? {
            ProviderResponse::XAttrList(names) => Ok(names),
            other => Err(unexpected(&request, &other)),
        }
    }

    pub fn subscribe(&self, subscription_id: i64, kind: SubscriptionKind, uuid: &str) {
        self.post(ProviderRequest::Subscribe {
            subscription_id,
            kind,
            uuid: uuid.to_string(),
        });
    }

    pub fn cancel_subscription(&self, subscription_id: i64) {
        self.post(ProviderRequest::CancelSubscription { subscription_id });
    }

    pub fn emit_events(&self, events: Vec<EventWire>) {
        self.post(ProviderRequest::Events { events });
    }

    pub fn close_session(&self) -> Result<()> {
        self.call_ok(ProviderRequest::CloseSession)
    }
}
