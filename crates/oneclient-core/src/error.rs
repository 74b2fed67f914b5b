use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("File not found: {uuid}")]
    NotFound { uuid: String },

    #[error("Permission denied for {uuid} during {op}")]
    PermissionDenied { uuid: String, op: String },

    #[error("Credentials for storage {storage_id} expired")]
    KeyExpired { storage_id: String },

    #[error("Operation timed out")]
    Timeout,

    #[error("Connection to provider lost")]
    ConnectionLost,

    #[error("Resource temporarily unavailable")]
    Again,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Checksum mismatch while reading {uuid}")]
    ChecksumMismatch { uuid: String },

    #[error("Quota exceeded for space {space_id}")]
    QuotaExceeded { space_id: String },

    #[error("Operation not supported: {op}")]
    NotSupported { op: String },

    #[error("Not a directory: {uuid}")]
    NotDirectory { uuid: String },

    #[error("Is a directory: {uuid}")]
    IsDirectory { uuid: String },

    #[error("Name already exists: {name}")]
    AlreadyExists { name: String },

    #[error("Invalid argument: {msg}")]
    InvalidArgument { msg: String },

    #[error("Unknown file handle: {handle}")]
    BadDescriptor { handle: u64 },

    #[error("Unexpected provider response: {msg}")]
    Protocol { msg: String },

    #[error("Invalid configuration: {msg}")]
    InvalidConfiguration { msg: String },
}

pub type Result<T> = std::result::Result<T, ClientError>;

// io::Error is not Clone; rebuild it from the os error or kind so shared
// completions can hand the same failure to every waiter.
impl Clone for ClientError {
    fn clone(&self) -> Self {
        match self {
            ClientError::Io(e) => ClientError::Io(match e.raw_os_error() {
                Some(errno) => std::io::Error::from_raw_os_error(errno),
                None => std::io::Error::from(e.kind()),
            }),
            ClientError::NotFound { uuid } => ClientError::NotFound { uuid: uuid.clone() },
            ClientError::PermissionDenied { uuid, op } => ClientError::PermissionDenied {
                uuid: uuid.clone(),
                op: op.clone(),
            },
            ClientError::KeyExpired { storage_id } => ClientError::KeyExpired {
                storage_id: storage_id.clone(),
            },
            ClientError::Timeout => ClientError::Timeout,
            ClientError::ConnectionLost => ClientError::ConnectionLost,
            ClientError::Again => ClientError::Again,
            ClientError::Cancelled => ClientError::Cancelled,
            ClientError::ChecksumMismatch { uuid } => ClientError::ChecksumMismatch {
                uuid: uuid.clone(),
            },
            ClientError::QuotaExceeded { space_id } => ClientError::QuotaExceeded {
                space_id: space_id.clone(),
            },
            ClientError::NotSupported { op } => ClientError::NotSupported { op: op.clone() },
            ClientError::NotDirectory { uuid } => ClientError::NotDirectory {
                uuid: uuid.clone(),
            },
            ClientError::IsDirectory { uuid } => ClientError::IsDirectory { uuid: uuid.clone() },
            ClientError::AlreadyExists { name } => ClientError::AlreadyExists {
                name: name.clone(),
            },
            ClientError::InvalidArgument { msg } => ClientError::InvalidArgument {
                msg: msg.clone(),
            },
            ClientError::BadDescriptor { handle } => ClientError::BadDescriptor {
                handle: *handle,
            },
            ClientError::Protocol { msg } => ClientError::Protocol { msg: msg.clone() },
            ClientError::InvalidConfiguration { msg } => ClientError::InvalidConfiguration {
                msg: msg.clone(),
            },
        }
    }
}

impl ClientError {
    pub fn to_errno(&self) -> i32 {
        use libc::*;
        match self {
            ClientError::Io(e) => e.raw_os_error().unwrap_or(EIO),
            ClientError::NotFound { .. } => ENOENT,
            ClientError::PermissionDenied { .. } => EACCES,
            ClientError::KeyExpired { .. } => EKEYEXPIRED,
            ClientError::Timeout => ETIMEDOUT,
            ClientError::ConnectionLost => ECONNABORTED,
            ClientError::Again => EAGAIN,
            ClientError::Cancelled => ECANCELED,
            ClientError::ChecksumMismatch { .. } => EIO,
            ClientError::QuotaExceeded { .. } => ENOSPC,
            ClientError::NotSupported { .. } => ENOTSUP,
            ClientError::NotDirectory { .. } => ENOTDIR,
            ClientError::IsDirectory { .. } => EISDIR,
            ClientError::AlreadyExists { .. } => EEXIST,
            ClientError::InvalidArgument { .. } => EINVAL,
            ClientError::BadDescriptor { .. } => EBADF,
            ClientError::Protocol { .. } => EIO,
            ClientError::InvalidConfiguration { .. } => EINVAL,
        }
    }

    /// Errors the dispatcher retries with a widening, jittered delay.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ClientError::Timeout
                | ClientError::ConnectionLost
                | ClientError::Again
                | ClientError::Cancelled
        )
    }

    /// Maps an errno reported by a storage helper back into a typed error.
    pub fn from_errno(errno: i32, uuid: &str) -> ClientError {
        use libc::*;
        match errno {
            ENOENT => ClientError::NotFound {
                uuid: uuid.to_string(),
            },
            EACCES | EPERM => ClientError::PermissionDenied {
                uuid: uuid.to_string(),
                op: "storage io".to_string(),
            },
            EKEYEXPIRED => ClientError::KeyExpired {
                storage_id: String::new(),
            },
            EAGAIN => ClientError::Again,
            ECANCELED => ClientError::Cancelled,
            ETIMEDOUT => ClientError::Timeout,
            ENOSPC => ClientError::QuotaExceeded {
                space_id: String::new(),
            },
            other => {
                ClientError::Io(std::io::Error::from_raw_os_error(other))
            }
        }
    }
}
