use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
    /// Hard link to a regular file; behaves like a regular file for IO.
    Link,
}

impl FileType {
    pub fn is_regular_or_link(&self) -> bool {
        matches!(self, FileType::Regular | FileType::Link)
    }
}

/// Provider-reported attributes of a single file or directory.
///
/// `size` is absent for directories and symlinks; for symlinks the
/// dispatcher substitutes the resolved link length on demand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileAttributes {
    pub uuid: String,
    pub name: String,
    pub parent_uuid: Option<String>,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub file_type: FileType,
    pub size: Option<u64>,
    /// Present when the listing was requested with replication status.
    pub fully_replicated: Option<bool>,
    /// Present when the listing was requested with hard link counts.
    pub nlink: Option<u32>,
    /// Entry served by a virtual-fs adapter rather than a real storage.
    pub virtual_entry: bool,
    pub virtual_adapter: Option<String>,
}

impl FileAttributes {
    pub fn is_directory(&self) -> bool {
        self.file_type == FileType::Directory
    }

    pub fn size_or_zero(&self) -> u64 {
        self.size.unwrap_or(0)
    }
}

/// Attribute changes requested through `setattr`; unset fields are left
/// untouched.
#[derive(Debug, Clone, Default)]
pub struct SetAttrChanges {
    pub mode: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<i64>,
    pub mtime: Option<i64>,
}

impl SetAttrChanges {
    pub fn is_empty(&self) -> bool {
        self.mode.is_none() && self.size.is_none() && self.atime.is_none() && self.mtime.is_none()
    }
}
