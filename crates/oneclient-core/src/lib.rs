#![warn(missing_docs)]

//! Client-side engine for mounting remote Onedata spaces.
//!
//! Sits between a kernel filesystem adapter and a remote provider:
//! translates POSIX-shaped operations into provider RPCs, caches metadata
//! and replica layouts, detects direct storage access, prefetches blocks
//! ahead of demand reads and feeds activity events back to the provider.
//! The kernel adapter, wire codec and concrete storage helpers are
//! external collaborators plugged in through the traits in [`proto`] and
//! [`helpers`].

/// File attributes, types and setattr changes.
pub mod attrs;
/// Replica block maps: interval map with payload coalescing, file locations.
pub mod blocks;
/// CDMI object-id translation for file-id based access.
pub mod cdmi;
/// Configuration options and the retry-delay schedule.
pub mod config;
/// Error types, errno mapping, retry classification.
pub mod error;
/// Event streams aggregated and flushed to the provider.
pub mod events;
/// Single-threaded step executor owning all cache mutations.
pub mod fiber;
/// Per-file force-proxy flags after failed direct IO.
pub mod force_proxy;
/// Filesystem logic dispatcher, retry envelope, read/write paths.
pub mod fslogic;
/// Fuse handle table, open-file pinning tokens, per-handle prefetch state.
pub mod handles;
/// Storage helper cache, direct/proxy access detection, probe protocol.
pub mod helper_cache;
/// Capability traits for storage back-ends, in-memory test helper.
pub mod helpers;
/// Provider identity helpers (space ids, share identities).
pub mod ident;
/// Optional structured per-call I/O trace.
pub mod iotrace;
/// Synchronization utilities: poison-recovering locks, shared promises.
pub mod locking;
/// Metadata cache with open-file pinning and directory expiry.
pub mod metadata_cache;
/// Linear and clustered prefetch planning.
pub mod prefetch;
/// Abstract provider RPC surface and typed client.
pub mod proto;
/// Directory enumeration cache with chunked fetches.
pub mod readdir_cache;
/// Ref-counted per-identity push subscriptions.
pub mod subscriptions;
/// Space-relative symlink translation.
pub mod symlinks;
/// Extended attribute encoding and the synthetic catalogue.
pub mod xattr;

pub use error::{ClientError, Result};
pub use fslogic::FsLogic;
