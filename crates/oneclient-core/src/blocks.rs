use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Replica coordinates of a contiguous byte range: which storage holds it
/// and under which on-storage file id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileBlock {
    pub storage_id: String,
    pub file_id: String,
}

/// Interval map from half-open byte ranges `[start, end)` to [`FileBlock`]
/// payloads. Inserting overlapping ranges overwrites the overlapped parts;
/// adjacent ranges carrying equal payloads coalesce into one interval.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(into = "Vec<(u64, u64, FileBlock)>", from = "Vec<(u64, u64, FileBlock)>")]
pub struct IntervalMap {
    ranges: BTreeMap<u64, (u64, FileBlock)>,
}

impl From<IntervalMap> for Vec<(u64, u64, FileBlock)> {
    fn from(map: IntervalMap) -> Self {
        map.ranges
            .into_iter()
            .map(|(start, (end, block))| (start, end, block))
            .collect()
    }
}

impl From<Vec<(u64, u64, FileBlock)>> for IntervalMap {
    fn from(ranges: Vec<(u64, u64, FileBlock)>) -> Self {
        let mut map = IntervalMap::default();
        for (start, end, block) in ranges {
            map.put(start, end, block);
        }
        map
    }
}

impl IntervalMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overlays `[start, end) -> block`, overwriting overlapped parts and
    /// coalescing with touching neighbours of equal payload.
    pub fn put(&mut self, start: u64, end: u64, block: FileBlock) {
        if start >= end {
            return;
        }

        // Split the interval containing `start`, if any.
        if let Some((&s, &(e, ref b))) = self.ranges.range(..=start).next_back() {
            if e > start {
                let left_block = b.clone();
                self.ranges.remove(&s);
                if s < start {
                    self.ranges.insert(s, (start, left_block.clone()));
                }
                if e > end {
                    self.ranges.insert(end, (e, left_block));
                }
            }
        }

        // Remove or truncate every interval starting inside [start, end).
        let covered: Vec<u64> = self
            .ranges
            .range(start..end)
            .map(|(&s, _)| s)
            .collect();
        for s in covered {
            let (e, b) = self.ranges.remove(&s).expect("interval key just listed");
            if e > end {
                self.ranges.insert(end, (e, b));
            }
        }

        let mut new_start = start;
        let mut new_end = end;

        // Coalesce left.
        if let Some((&s, &(e, ref b))) = self.ranges.range(..start).next_back() {
            if e == start && *b == block {
                self.ranges.remove(&s);
                new_start = s;
            }
        }
        // Coalesce right.
        if let Some(&(e, ref b)) = self.ranges.get(&end) {
            if *b == block {
                self.ranges.remove(&end);
                new_end = e;
            }
        }

        self.ranges.insert(new_start, (new_end, block));
    }

    /// The interval containing `offset`, if replicated.
    pub fn covering(&self, offset: u64) -> Option<(u64, u64, &FileBlock)> {
        self.ranges
            .range(..=offset)
            .next_back()
            .filter(|(_, (end, _))| *end > offset)
            .map(|(&start, &(end, ref block))| (start, end, block))
    }

    /// Number of distinct intervals intersecting `[start, end)`.
    pub fn count_in_range(&self, start: u64, end: u64) -> usize {
        self.iter()
            .filter(|(s, e, _)| *s < end && *e > start)
            .count()
    }

    /// Total replicated bytes within `[start, end)`.
    pub fn length_in_range(&self, start: u64, end: u64) -> u64 {
        self.iter()
            .map(|(s, e, _)| {
                let s = s.max(start);
                let e = e.min(end);
                e.saturating_sub(s)
            })
            .sum()
    }

    pub fn total_length(&self) -> u64 {
        self.iter().map(|(s, e, _)| e - s).sum()
    }

    pub fn count(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Discards every byte at or beyond `size`.
    pub fn truncate(&mut self, size: u64) {
        let beyond: Vec<u64> = self.ranges.range(size..).map(|(&s, _)| s).collect();
        for s in beyond {
            self.ranges.remove(&s);
        }
        if let Some((&s, &(e, ref b))) = self.ranges.range(..size).next_back() {
            if e > size {
                let b = b.clone();
                self.ranges.insert(s, (size, b));
            }
        }
    }

    /// Removes all replicated ranges within `[start, end)`.
    pub fn clear_range(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }
        if let Some((&s, &(e, ref b))) = self.ranges.range(..=start).next_back() {
            if e > start {
                let b = b.clone();
                self.ranges.remove(&s);
                if s < start {
                    self.ranges.insert(s, (start, b.clone()));
                }
                if e > end {
                    self.ranges.insert(end, (e, b));
                }
            }
        }
        let covered: Vec<u64> = self.ranges.range(start..end).map(|(&s, _)| s).collect();
        for s in covered {
            let (e, b) = self.ranges.remove(&s).expect("interval key just listed");
            if e > end {
                self.ranges.insert(end, (e, b));
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, u64, &FileBlock)> {
        self.ranges
            .iter()
            .map(|(&start, &(end, ref block))| (start, end, block))
    }
}

/// Provider-reported replica layout of one file. `version` is monotonic
/// per identity; stale full updates are ignored by the metadata cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileLocation {
    pub uuid: String,
    pub space_id: String,
    /// Storage backing newly written data.
    pub storage_id: String,
    /// On-storage file id for newly written data.
    pub file_id: String,
    pub version: u64,
    pub blocks: IntervalMap,
}

/// Width of the textual replication map served via the `file_blocks` xattr.
pub const FILE_BLOCKS_MAP_LENGTH: usize = 50;

impl FileLocation {
    pub fn default_block(&self) -> FileBlock {
        FileBlock {
            storage_id: self.storage_id.clone(),
            file_id: self.file_id.clone(),
        }
    }

    pub fn replication_progress(&self, file_size: u64) -> f64 {
        if file_size == 0 {
            return 0.0;
        }
        let replicated = self.blocks.total_length().min(file_size);
        replicated as f64 / file_size as f64
    }

    pub fn is_replication_complete(&self, file_size: u64) -> bool {
        self.blocks.length_in_range(0, file_size) >= file_size
    }

    /// Replaces this location wholesale; ignored when `new` is stale.
    pub fn update_from(&mut self, new: FileLocation) -> bool {
        if new.version < self.version {
            return false;
        }
        *self = new;
        true
    }

    /// Applies `new`'s blocks within `[start, end)` only, keeping blocks
    /// outside the window. Ignored when `new` is stale.
    pub fn update_in_range(&mut self, start: u64, end: u64, new: &FileLocation) -> bool {
        if new.version < self.version {
            return false;
        }
        self.blocks.clear_range(start, end);
        for (s, e, block) in new.blocks.iter() {
            let s = s.max(start);
            let e = e.min(end);
            if s < e {
                self.blocks.put(s, e, block.clone());
            }
        }
        self.version = new.version;
        self.storage_id = new.storage_id.clone();
        self.file_id = new.file_id.clone();
        true
    }

    /// Textual replication map: one character per progress step, ' ' for
    /// nothing, '.' for under half, 'o' for partial, '#' for complete.
    pub fn progress_string(&self, file_size: u64, steps: usize) -> String {
        debug_assert!(steps > 0);
        if file_size < (steps as u64) * 2 {
            let replicated = self.blocks.total_length().min(file_size);
            let fill = if replicated == 0 {
                ' '
            } else if replicated < file_size / 2 {
                '.'
            } else if replicated < file_size {
                'o'
            } else {
                '#'
            };
            return fill.to_string().repeat(steps);
        }

        let step_len = file_size / steps as u64;
        let mut result = String::with_capacity(steps);
        for i in 0..steps as u64 {
            let start = i * step_len;
            let end = if i == steps as u64 - 1 {
                file_size
            } else {
                (i + 1) * step_len
            };
            let replicated = self.blocks.length_in_range(start, end);
            result.push(if replicated == 0 {
                ' '
            } else if replicated < step_len / 2 {
                '.'
            } else if replicated < end - start {
                'o'
            } else {
                '#'
            });
        }
        result
    }
}
