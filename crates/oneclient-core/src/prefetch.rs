//! Prefetch planner.
//!
//! Pure with respect to cached state: the read path hands it a snapshot
//! (file size, replica layout, the handle's last linear range) and acts on
//! the returned plan. Two modes compose. Linear prefetch extends past the
//! current read by twice the helper's own read-ahead, short-circuiting to
//! a whole-file request once a configured head fraction is mostly
//! replicated. Cluster prefetch watches a window around the read offset
//! and requests the whole window when it fragments into enough distinct
//! blocks.

use crate::blocks::FileLocation;
use crate::config::ClientConfig;

pub const SYNC_PRIORITY_IMMEDIATE: u32 = 32;
pub const SYNC_PRIORITY_LINEAR_PREFETCH: u32 = 96;
pub const SYNC_PRIORITY_CLUSTER_PREFETCH: u32 = 160;

/// Fraction of the threshold window that must be replicated before the
/// whole-file shortcut fires.
const LINEAR_THRESHOLD_MATCH_RATIO: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchKind {
    Linear,
    Cluster,
    /// Whole-file prefetch from the linear threshold shortcut.
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefetchPlan {
    pub start: u64,
    pub end: u64,
    pub kind: PrefetchKind,
    pub priority: u32,
    /// For block-aligned cluster plans: the aligned offset the caller must
    /// deduplicate on before issuing the request.
    pub block_aligned_at: Option<u64>,
    /// New `last_linear` range the caller records on the handle.
    pub set_last_linear: Option<(u64, u64)>,
}

/// Immutable inputs to one planner evaluation.
pub struct PrefetchSnapshot<'a> {
    pub location: &'a FileLocation,
    pub file_size: u64,
    pub offset: u64,
    pub size: u64,
    /// Helper's own advised read-ahead for this read.
    pub would_prefetch: u64,
    /// Contiguous replicated range containing `offset`, if any.
    pub available: Option<(u64, u64)>,
    pub last_linear: Option<(u64, u64)>,
    /// Cluster block threshold for this evaluation (fixed or drawn).
    pub cluster_threshold: u32,
    pub full_prefetch_triggered: bool,
}

fn range_len(range: (u64, u64)) -> u64 {
    range.1.saturating_sub(range.0)
}

fn intersection(a: (u64, u64), b: (u64, u64)) -> (u64, u64) {
    let start = a.0.max(b.0);
    let end = a.1.min(b.1);
    (start, end.max(start))
}

/// `a` with its left part covered by `b` removed.
fn left_subtract(a: (u64, u64), b: (u64, u64)) -> (u64, u64) {
    if b.0 <= a.0 && b.1 > a.0 {
        (b.1.min(a.1), a.1)
    } else {
        a
    }
}

fn cluster_plan(config: &ClientConfig, snap: &PrefetchSnapshot<'_>) -> Option<PrefetchPlan> {
    if config.cluster_window == 0 || snap.file_size == 0 {
        return None;
    }
    let initial_window = if config.cluster_window < 0 {
        snap.file_size
    } else {
        config.cluster_window as u64
    };
    if initial_window == 0 {
        return None;
    }

    let (left, right, aligned) = if config.cluster_window_grow_factor == 0.0 {
        // Window aligned to consecutive blocks of the configured size.
        let left = snap.offset / initial_window * initial_window;
        let right = (left + initial_window).min(snap.file_size);
        (left, right, true)
    } else {
        // Window centred on the read offset, growing with replication.
        let progress = snap.location.replication_progress(snap.file_size);
        let window = (initial_window as f64
            * (1.0
                + config.cluster_window_grow_factor * snap.file_size as f64 * progress
                    / initial_window as f64)) as u64;
        let left = snap.offset.saturating_sub(window / 2);
        let right = (snap.offset + window / 2).min(snap.file_size);
        (left, right, false)
    };

    let blocks_in_window = snap.location.blocks.count_in_range(left, right);
    tracing::debug!(
        "Cluster window [{}, {}) for {} holds {} blocks (threshold {})",
        left,
        right,
        snap.location.uuid,
        blocks_in_window,
        snap.cluster_threshold
    );
    if blocks_in_window <= snap.cluster_threshold as usize {
        return None;
    }

    Some(PrefetchPlan {
        start: left,
        end: right,
        kind: PrefetchKind::Cluster,
        priority: SYNC_PRIORITY_CLUSTER_PREFETCH,
        block_aligned_at: aligned.then_some(left),
        set_last_linear: None,
    })
}

fn full_file_plan(config: &ClientConfig, snap: &PrefetchSnapshot<'_>) -> Option<PrefetchPlan> {
    if config.linear_read_prefetch_threshold <= 0.0
        || snap.file_size == 0
        || snap.full_prefetch_triggered
    {
        return None;
    }
    let head = (snap.file_size as f64 * config.linear_read_prefetch_threshold).floor();
    let replicated = snap.location.blocks.length_in_range(0, head as u64) as f64;
    if replicated < LINEAR_THRESHOLD_MATCH_RATIO * head {
        return None;
    }
    Some(PrefetchPlan {
        start: 0,
        end: snap.file_size,
        kind: PrefetchKind::Full,
        priority: SYNC_PRIORITY_LINEAR_PREFETCH,
        block_aligned_at: None,
        set_last_linear: None,
    })
}

fn linear_plan(snap: &PrefetchSnapshot<'_>) -> Option<PrefetchPlan> {
    let read_end = snap.offset + snap.size;
    let want = (
        read_end,
        read_end.saturating_add(snap.would_prefetch.saturating_mul(2)),
    );
    let mut candidate = intersection(want, (0, snap.file_size));
    if let Some(available) = snap.available {
        candidate = left_subtract(candidate, available);
    }
    if range_len(candidate) == 0 {
        return None;
    }

    let worth = match snap.last_linear {
        None => true,
        Some(last) => {
            let overlap = intersection(candidate, last);
            range_len(overlap) == 0
                || range_len(left_subtract(candidate, last)) >= range_len(candidate) / 2
        }
    };
    if !worth {
        return None;
    }

    Some(PrefetchPlan {
        start: candidate.0,
        end: candidate.1,
        kind: PrefetchKind::Linear,
        priority: SYNC_PRIORITY_LINEAR_PREFETCH,
        block_aligned_at: None,
        set_last_linear: Some(candidate),
    })
}

/// Evaluates the planner over one completed read. Returns `None` when the
/// file is fully replicated or nothing is worth requesting.
pub fn plan(config: &ClientConfig, snap: &PrefetchSnapshot<'_>) -> Option<PrefetchPlan> {
    if snap.location.is_replication_complete(snap.file_size) {
        return None;
    }

    let cluster = cluster_plan(config, snap);
    if let Some(full) = full_file_plan(config, snap) {
        return Some(full);
    }
    if cluster.is_some() {
        return cluster;
    }
    linear_plan(snap)
}
