//! Directory enumeration cache.
//!
//! Listings are fetched in provider-sized chunks following the opaque
//! index token and cached whole, keyed by directory identity, until the
//! directory leaves the metadata cache. Concurrent readers coalesce on the
//! fiber: the fetch runs as one step sequence, so a second reader either
//! finds the cached listing or queues behind the fetch.

use crate::error::Result;
use crate::metadata_cache::{CacheEvent, MetadataCache};
use crate::proto::RemoteClient;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct ReaddirOptions {
    pub chunk_size: usize,
    /// Hide regular files whose replicas are incomplete.
    pub only_full_replicas: bool,
    /// Ask the provider for hard-link counts alongside attributes.
    pub include_link_count: bool,
}

pub struct ReaddirCache {
    listings: HashMap<String, Vec<String>>,
}

impl ReaddirCache {
    pub fn new() -> Self {
        Self {
            listings: HashMap::new(),
        }
    }

    pub fn cached(&self, uuid: &str) -> Option<&[String]> {
        self.listings.get(uuid).map(|names| names.as_slice())
    }

    /// Ensures the full listing of `uuid` is cached, fetching chunk by
    /// chunk and feeding every child's attributes into the metadata cache.
    pub fn ensure_listing(
        &mut self,
        metadata: &mut MetadataCache,
        remote: &RemoteClient,
        uuid: &str,
        options: &ReaddirOptions,
    ) -> Result<Vec<CacheEvent>> {
        if self.listings.contains_key(uuid) {
            return Ok(Vec::new());
        }

        let mut events = Vec::new();
        let mut names = Vec::new();
        let mut offset = 0u64;
        let mut index_token: Option<String> = None;

        loop {
            let (children, token, is_last) = remote.get_file_children_attrs(
                uuid,
                offset,
                options.chunk_size,
                index_token.take(),
                options.only_full_replicas,
                options.include_link_count,
            )?;
            let fetched = children.len();
            tracing::debug!(
                "Fetched {} directory entries for {} at offset {}",
                fetched,
                uuid,
                offset
            );
            offset += fetched as u64;
            index_token = token;

            for attr in children {
                if options.only_full_replicas
                    && attr.file_type.is_regular_or_link()
                    && attr.fully_replicated == Some(false)
                {
                    continue;
                }
                names.push(attr.name.clone());
                events.extend(metadata.put_attr(attr));
            }

            if is_last || fetched == 0 {
                break;
            }
        }

        metadata.set_directory_synced(uuid);
        self.listings.insert(uuid.to_string(), names);
        Ok(events)
    }

    /// Cursor-style slice of a cached listing.
    pub fn read(&self, uuid: &str, offset: usize, count: usize) -> Vec<String> {
        self.listings
            .get(uuid)
            .map(|names| {
                names
                    .iter()
                    .skip(offset)
                    .take(count)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drops a cached listing, e.g. when the directory is evicted or its
    /// content changes.
    pub fn invalidate(&mut self, uuid: &str) {
        self.listings.remove(uuid);
    }

    pub fn clear(&mut self) {
        self.listings.clear();
    }
}

impl Default for ReaddirCache {
    fn default() -> Self {
        Self::new()
    }
}
