//! Metadata cache with open-file pinning and directory expiry.
//!
//! Two record maps (files, directories) plus a parent-to-children name
//! index. Open files are pinned: they survive any eviction pressure until
//! the last release. Directories idle past the configured threshold are
//! pruned together with their unopened children. Lifecycle transitions are
//! reported to the dispatcher as [`CacheEvent`]s, which it binds to the
//! subscription registry.

use crate::attrs::{FileAttributes, FileType};
use crate::blocks::{FileBlock, FileLocation};
use crate::error::{ClientError, Result};
use crate::ident;
use crate::proto::RemoteClient;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Lifecycle transitions the dispatcher reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    Added(String),
    Opened(String),
    Released(String),
    MarkedDeleted(String),
    Renamed { old: String, new: String },
    DroppedFile(String),
    DroppedDirectory(String),
}

#[derive(Debug)]
struct FileRecord {
    attr: FileAttributes,
    location: Option<FileLocation>,
    open_count: u32,
    deleted: bool,
    last_used: Instant,
}

#[derive(Debug)]
struct DirRecord {
    attr: FileAttributes,
    open_count: u32,
    dir_read_complete: bool,
    deleted: bool,
    last_used: Instant,
}

pub struct MetadataCache {
    remote: RemoteClient,
    root_uuid: String,
    target_size: usize,
    drop_after: Option<Duration>,
    files: HashMap<String, FileRecord>,
    dirs: HashMap<String, DirRecord>,
    children: HashMap<String, HashMap<String, String>>,
}

impl MetadataCache {
    pub fn new(
        remote: RemoteClient,
        root_uuid: String,
        target_size: usize,
        drop_after: Option<Duration>,
    ) -> Self {
        Self {
            remote,
            root_uuid,
            target_size,
            drop_after,
            files: HashMap::new(),
            dirs: HashMap::new(),
            children: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.files.len() + self.dirs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.dirs.is_empty()
    }

    fn touch(&mut self, uuid: &str) {
        let now = Instant::now();
        if let Some(record) = self.files.get_mut(uuid) {
            record.last_used = now;
        }
        if let Some(record) = self.dirs.get_mut(uuid) {
            record.last_used = now;
        }
    }

    pub fn touch_parent_of(&mut self, uuid: &str) {
        let parent = self
            .files
            .get(uuid)
            .map(|r| r.attr.parent_uuid.clone())
            .or_else(|| self.dirs.get(uuid).map(|r| r.attr.parent_uuid.clone()))
            .flatten();
        if let Some(parent) = parent {
            self.touch(&parent);
        }
    }

    pub fn contains(&self, uuid: &str) -> bool {
        self.files.contains_key(uuid) || self.dirs.contains_key(uuid)
    }

    pub fn get_attr_cached(&self, uuid: &str) -> Option<FileAttributes> {
        self.files
            .get(uuid)
            .map(|r| r.attr.clone())
            .or_else(|| self.dirs.get(uuid).map(|r| r.attr.clone()))
    }

    /// Caches `attr`, wiring the parent's child index. Returns events for
    /// newly added identities.
    pub fn put_attr(&mut self, attr: FileAttributes) -> Vec<CacheEvent> {
        let uuid = attr.uuid.clone();
        let mut events = Vec::new();
        if let Some(parent) = attr.parent_uuid.clone() {
            self.children
                .entry(parent)
                .or_default()
                .insert(attr.name.clone(), uuid.clone());
        }
        let now = Instant::now();
        if attr.is_directory() {
            match self.dirs.get_mut(&uuid) {
                Some(record) => {
                    record.attr = attr;
                    record.last_used = now;
                }
                None => {
                    self.dirs.insert(
                        uuid.clone(),
                        DirRecord {
                            attr,
                            open_count: 0,
                            dir_read_complete: false,
                            deleted: false,
                            last_used: now,
                        },
                    );
                    events.push(CacheEvent::Added(uuid));
                }
            }
        } else {
            match self.files.get_mut(&uuid) {
                Some(record) => {
                    record.attr = attr;
                    record.last_used = now;
                }
                None => {
                    self.files.insert(
                        uuid.clone(),
                        FileRecord {
                            attr,
                            location: None,
                            open_count: 0,
                            deleted: false,
                            last_used: now,
                        },
                    );
                    events.push(CacheEvent::Added(uuid));
                }
            }
        }
        events
    }

    /// Applies a pushed attribute update to an already cached identity.
    pub fn update_attr(&mut self, attr: FileAttributes) {
        if let Some(record) = self.files.get_mut(&attr.uuid) {
            if record.deleted {
                return;
            }
            let new_size = attr.size;
            record.attr = attr;
            if let (Some(size), Some(location)) = (new_size, record.location.as_mut()) {
                location.blocks.truncate(size);
            }
        } else if let Some(record) = self.dirs.get_mut(&attr.uuid) {
            if record.deleted {
                return;
            }
            record.attr = attr;
        }
    }

    /// Attribute lookup by identity, cache first.
    pub fn ensure_attr(&mut self, uuid: &str) -> Result<(FileAttributes, Vec<CacheEvent>)> {
        if let Some(attr) = self.get_attr_cached(uuid) {
            self.touch(uuid);
            return Ok((attr, Vec::new()));
        }
        let attr = self.remote.get_file_attr(uuid)?;
        let events = self.put_attr(attr.clone());
        Ok((attr, events))
    }

    /// Attribute lookup by parent and name, index first. A directory whose
    /// full listing is cached answers misses with NotFound locally.
    pub fn ensure_child_attr(
        &mut self,
        parent_uuid: &str,
        name: &str,
    ) -> Result<(FileAttributes, Vec<CacheEvent>)> {
        if let Some(child_uuid) = self
            .children
            .get(parent_uuid)
            .and_then(|names| names.get(name))
            .cloned()
        {
            if let Some(attr) = self.get_attr_cached(&child_uuid) {
                self.touch(parent_uuid);
                return Ok((attr, Vec::new()));
            }
        }
        if self
            .dirs
            .get(parent_uuid)
            .map(|r| r.dir_read_complete)
            .unwrap_or(false)
        {
            return Err(ClientError::NotFound {
                uuid: format!("{parent_uuid}/{name}"),
            });
        }
        let attr = self.remote.get_child_attr(parent_uuid, name)?;
        let events = self.put_attr(attr.clone());
        self.touch(parent_uuid);
        Ok((attr, events))
    }

    /// Pins `uuid` in the cache, fetching attributes and location if
    /// needed. Fires `Opened` on the 0→1 transition.
    pub fn open(&mut self, uuid: &str) -> Result<(FileAttributes, Vec<CacheEvent>)> {
        let (attr, mut events) = self.ensure_attr(uuid)?;
        if attr.file_type.is_regular_or_link() {
            self.ensure_location(uuid, false)?;
        }
        if let Some(record) = self.files.get_mut(uuid) {
            record.open_count += 1;
            if record.open_count == 1 {
                events.push(CacheEvent::Opened(uuid.to_string()));
            }
        }
        self.touch_parent_of(uuid);
        Ok((attr, events))
    }

    /// Caches provider-pushed attributes and location for a file created
    /// through the dispatcher, then pins it.
    pub fn open_created(
        &mut self,
        attr: FileAttributes,
        location: FileLocation,
    ) -> Vec<CacheEvent> {
        let uuid = attr.uuid.clone();
        let mut events = self.put_attr(attr);
        if let Some(record) = self.files.get_mut(&uuid) {
            record.location = Some(location);
            record.open_count += 1;
            if record.open_count == 1 {
                events.push(CacheEvent::Opened(uuid.clone()));
            }
        }
        self.touch_parent_of(&uuid);
        events
    }

    /// Unpins `uuid`. A tombstoned record whose last pin drops is removed
    /// and further events for it become no-ops.
    pub fn release(&mut self, uuid: &str) -> Vec<CacheEvent> {
        let mut events = Vec::new();
        let Some(record) = self.files.get_mut(uuid) else {
            return events;
        };
        if record.open_count == 0 {
            return events;
        }
        record.open_count -= 1;
        if record.open_count == 0 {
            events.push(CacheEvent::Released(uuid.to_string()));
            if record.deleted {
                self.files.remove(uuid);
                events.push(CacheEvent::DroppedFile(uuid.to_string()));
            }
        }
        events
    }

    pub fn open_count(&self, uuid: &str) -> u32 {
        self.files
            .get(uuid)
            .map(|r| r.open_count)
            .or_else(|| self.dirs.get(uuid).map(|r| r.open_count))
            .unwrap_or(0)
    }

    pub fn opendir(&mut self, uuid: &str) {
        if let Some(record) = self.dirs.get_mut(uuid) {
            record.open_count += 1;
            record.last_used = Instant::now();
        }
    }

    pub fn releasedir(&mut self, uuid: &str) {
        if let Some(record) = self.dirs.get_mut(uuid) {
            record.open_count = record.open_count.saturating_sub(1);
            record.last_used = Instant::now();
        }
    }

    pub fn is_deleted(&self, uuid: &str) -> bool {
        self.files
            .get(uuid)
            .map(|r| r.deleted)
            .or_else(|| self.dirs.get(uuid).map(|r| r.deleted))
            .unwrap_or(false)
    }

    fn ensure_location(&mut self, uuid: &str, force_update: bool) -> Result<FileLocation> {
        let record = self.files.get(uuid).ok_or_else(|| ClientError::NotFound {
            uuid: uuid.to_string(),
        })?;
        if record.deleted || (!force_update && record.location.is_some()) {
            return record
                .location
                .clone()
                .ok_or_else(|| ClientError::NotFound {
                    uuid: uuid.to_string(),
                });
        }
        let fetched = self.remote.get_file_location(uuid)?;
        let record = self.files.get_mut(uuid).ok_or_else(|| ClientError::NotFound {
            uuid: uuid.to_string(),
        })?;
        match record.location.as_mut() {
            Some(cached) => {
                cached.update_from(fetched);
            }
            None => record.location = Some(fetched),
        }
        record
            .location
            .clone()
            .ok_or_else(|| ClientError::NotFound {
                uuid: uuid.to_string(),
            })
    }

    /// Location lookup, cache first unless forced or absent.
    pub fn get_location(&mut self, uuid: &str, force_update: bool) -> Result<FileLocation> {
        self.ensure_location(uuid, force_update)
    }

    /// Applies a full pushed location; stale versions are ignored.
    pub fn update_location(&mut self, location: FileLocation) -> bool {
        let Some(record) = self.files.get_mut(&location.uuid) else {
            return false;
        };
        match record.location.as_mut() {
            Some(cached) => cached.update_from(location),
            None => {
                record.location = Some(location);
                true
            }
        }
    }

    /// Applies a pushed location within `[start, end)` only.
    pub fn update_location_in_range(
        &mut self,
        start: u64,
        end: u64,
        location: FileLocation,
    ) -> bool {
        let Some(record) = self.files.get_mut(&location.uuid) else {
            return false;
        };
        match record.location.as_mut() {
            Some(cached) => cached.update_in_range(start, end, &location),
            None => {
                record.location = Some(location);
                true
            }
        }
    }

    /// Records locally written bytes: grows the size to cover the write
    /// and overlays the block.
    pub fn add_block(&mut self, uuid: &str, start: u64, end: u64, block: FileBlock) {
        let Some(record) = self.files.get_mut(uuid) else {
            tracing::warn!("Dropping block update for unknown file {}", uuid);
            return;
        };
        let size = record.attr.size.unwrap_or(0).max(end);
        record.attr.size = Some(size);
        if let Some(location) = record.location.as_mut() {
            location.blocks.put(start, end, block);
        }
    }

    pub fn get_block(&self, uuid: &str, offset: u64) -> Option<(u64, u64, FileBlock)> {
        self.files
            .get(uuid)
            .and_then(|r| r.location.as_ref())
            .and_then(|l| l.blocks.covering(offset))
            .map(|(s, e, b)| (s, e, b.clone()))
    }

    pub fn default_block(&self, uuid: &str) -> Result<FileBlock> {
        self.files
            .get(uuid)
            .and_then(|r| r.location.as_ref())
            .map(|l| l.default_block())
            .ok_or_else(|| ClientError::NotFound {
                uuid: uuid.to_string(),
            })
    }

    pub fn space_id(&self, uuid: &str) -> Result<String> {
        if let Some(location) = self.files.get(uuid).and_then(|r| r.location.as_ref()) {
            return Ok(location.space_id.clone());
        }
        ident::uuid_to_space_id(uuid)
    }

    /// Applies a truncation: size, block map, and handles growth too.
    pub fn truncate(&mut self, uuid: &str, new_size: u64) {
        if let Some(record) = self.files.get_mut(uuid) {
            record.attr.size = Some(new_size);
            if let Some(location) = record.location.as_mut() {
                location.blocks.truncate(new_size);
            }
        }
    }

    pub fn change_mode(&mut self, uuid: &str, mode: u32) {
        if let Some(record) = self.files.get_mut(uuid) {
            record.attr.mode = mode & 0o7777;
        } else if let Some(record) = self.dirs.get_mut(uuid) {
            record.attr.mode = mode & 0o7777;
        }
    }

    pub fn update_times(
        &mut self,
        uuid: &str,
        atime: Option<i64>,
        mtime: Option<i64>,
        ctime: Option<i64>,
    ) {
        let apply = |attr: &mut FileAttributes| {
            if let Some(t) = atime {
                attr.atime = t;
            }
            if let Some(t) = mtime {
                attr.mtime = t;
            }
            if let Some(t) = ctime {
                attr.ctime = t;
            }
        };
        if let Some(record) = self.files.get_mut(uuid) {
            apply(&mut record.attr);
        } else if let Some(record) = self.dirs.get_mut(uuid) {
            apply(&mut record.attr);
        }
    }

    /// Atomically rewires a rename: both the name index and the record
    /// move in one step; with a changed identity the record is re-keyed.
    pub fn rename(
        &mut self,
        old_uuid: &str,
        new_parent_uuid: &str,
        new_name: &str,
        new_uuid: &str,
    ) -> Vec<CacheEvent> {
        let mut events = Vec::new();
        let old_attr = match self.get_attr_cached(old_uuid) {
            Some(attr) => attr,
            None => return events,
        };

        // Unlink from the old parent.
        if let Some(parent) = old_attr.parent_uuid.as_deref() {
            if let Some(names) = self.children.get_mut(parent) {
                names.remove(&old_attr.name);
            }
        }

        // Move and rewrite the record.
        if old_attr.is_directory() {
            if let Some(mut record) = self.dirs.remove(old_uuid) {
                record.attr.uuid = new_uuid.to_string();
                record.attr.name = new_name.to_string();
                record.attr.parent_uuid = Some(new_parent_uuid.to_string());
                record.last_used = Instant::now();
                self.dirs.insert(new_uuid.to_string(), record);
            }
            if old_uuid != new_uuid {
                if let Some(names) = self.children.remove(old_uuid) {
                    for child_uuid in names.values() {
                        if let Some(child) = self.files.get_mut(child_uuid) {
                            child.attr.parent_uuid = Some(new_uuid.to_string());
                        } else if let Some(child) = self.dirs.get_mut(child_uuid) {
                            child.attr.parent_uuid = Some(new_uuid.to_string());
                        }
                    }
                    self.children.insert(new_uuid.to_string(), names);
                }
            }
        } else if let Some(mut record) = self.files.remove(old_uuid) {
            record.attr.uuid = new_uuid.to_string();
            record.attr.name = new_name.to_string();
            record.attr.parent_uuid = Some(new_parent_uuid.to_string());
            record.last_used = Instant::now();
            if let Some(location) = record.location.as_mut() {
                location.uuid = new_uuid.to_string();
            }
            self.files.insert(new_uuid.to_string(), record);
        }

        // Link under the new parent.
        self.children
            .entry(new_parent_uuid.to_string())
            .or_default()
            .insert(new_name.to_string(), new_uuid.to_string());
        self.touch(new_parent_uuid);

        events.push(CacheEvent::Renamed {
            old: old_uuid.to_string(),
            new: new_uuid.to_string(),
        });
        events
    }

    /// Tombstones `uuid`. Open records linger until the last release;
    /// closed ones are dropped immediately.
    pub fn mark_deleted(&mut self, uuid: &str) -> Vec<CacheEvent> {
        let mut events = Vec::new();
        let attr = match self.get_attr_cached(uuid) {
            Some(attr) => attr,
            None => return events,
        };
        if let Some(parent) = attr.parent_uuid.as_deref() {
            if let Some(names) = self.children.get_mut(parent) {
                names.remove(&attr.name);
            }
        }
        events.push(CacheEvent::MarkedDeleted(uuid.to_string()));
        if attr.is_directory() {
            let pinned = self.dirs.get(uuid).map(|r| r.open_count > 0).unwrap_or(false);
            if pinned {
                if let Some(record) = self.dirs.get_mut(uuid) {
                    record.deleted = true;
                }
            } else {
                self.dirs.remove(uuid);
                self.children.remove(uuid);
                events.push(CacheEvent::DroppedDirectory(uuid.to_string()));
            }
        } else {
            let pinned = self.files.get(uuid).map(|r| r.open_count > 0).unwrap_or(false);
            if pinned {
                if let Some(record) = self.files.get_mut(uuid) {
                    record.deleted = true;
                }
            } else {
                self.files.remove(uuid);
                events.push(CacheEvent::DroppedFile(uuid.to_string()));
            }
        }
        events
    }

    pub fn set_directory_synced(&mut self, uuid: &str) {
        if let Some(record) = self.dirs.get_mut(uuid) {
            record.dir_read_complete = true;
        }
    }

    pub fn is_directory_synced(&self, uuid: &str) -> bool {
        self.dirs
            .get(uuid)
            .map(|r| r.dir_read_complete)
            .unwrap_or(false)
    }

    pub fn children_of(&self, uuid: &str) -> Vec<(String, String)> {
        self.children
            .get(uuid)
            .map(|names| {
                names
                    .iter()
                    .map(|(name, child)| (name.clone(), child.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn drop_directory(&mut self, uuid: &str, events: &mut Vec<CacheEvent>) {
        if let Some(names) = self.children.remove(uuid) {
            for child_uuid in names.values() {
                let unpinned = self
                    .files
                    .get(child_uuid)
                    .map(|r| r.open_count == 0)
                    .unwrap_or(false);
                if unpinned {
                    self.files.remove(child_uuid);
                    events.push(CacheEvent::DroppedFile(child_uuid.clone()));
                }
            }
        }
        self.dirs.remove(uuid);
        events.push(CacheEvent::DroppedDirectory(uuid.to_string()));
    }

    /// Walks directories from the least recently touched end, dropping
    /// those idle past the threshold, then keeps evicting idle unpinned
    /// directories while the cache exceeds its size target.
    pub fn prune_expired_directories(&mut self) -> Vec<CacheEvent> {
        let mut events = Vec::new();
        let Some(drop_after) = self.drop_after else {
            return events;
        };
        let now = Instant::now();

        let mut candidates: Vec<(Instant, String)> = self
            .dirs
            .iter()
            .filter(|(uuid, record)| {
                *uuid != &self.root_uuid && record.open_count == 0 && !record.deleted
            })
            .map(|(uuid, record)| (record.last_used, uuid.clone()))
            .collect();
        candidates.sort();

        for (last_used, uuid) in candidates {
            let expired = now.duration_since(last_used) >= drop_after;
            let over_target = self.len() > self.target_size;
            if !expired && !over_target {
                break;
            }
            tracing::debug!(
                "Pruning directory {} (expired: {}, cache size: {})",
                uuid,
                expired,
                self.len()
            );
            self.drop_directory(&uuid, &mut events);
        }
        events
    }
}
