//! # The blob/bucket engine.
//!
//! This module implements the operations applications actually see: put and
//! get blobs, create and destroy buckets, rename, truncate, reorganize. It
//! composes the metadata store, the per-target allocators, the placement
//! policy, and the target drivers into one coherent machine.
//!
//! ## Design constraints
//!
//! These invariants are the groundwork for keeping the engine simple to
//! reason about:
//! - a blob's byte sequence is exactly the concatenation of its buffer
//!   fragments, so `sum(fragment sizes) == blob_size` at all times
//! - every fragment referenced by a live blob is held allocated by its
//!   target's allocator, and no two live fragments overlap
//! - a blob id lives in exactly one owning tag's blob list
//! - ids are never reused within a process lifetime
//!
//! ## Locking discipline
//!
//! Lock order is map, then entity, then allocator, and no operation holds
//! two entity locks at once (reorganization-migration is the one exception,
//! and it orders by ascending blob id). Map locks are dropped before any
//! I/O; entity locks may be held across I/O on that entity's own buffers.
//! Allocator mutexes cover span bookkeeping only.
//!
//! ## Write paths
//!
//! A put is either a replacement or a partial write. Replacement computes a
//! fresh schema, commits the new fragments, and only then swaps the list
//! and frees the old ones, so a failure mid-put never leaves the blob
//! half-written. Partial writes overwrite the overlap in place, fragment by
//! fragment, and extend the blob through a schema for just the extension.
//!
//! Each put carries an undo list of the allocations it has made. A tier
//! fault excludes the failed target and re-places the unwritten remainder;
//! if nothing can absorb it, the undo list rolls everything back and the
//! old fragments survive untouched.
//!
//! ## Staged buckets
//!
//! Buckets bound to a backing file stage pages in on first touch: a get of
//! an absent blob synthesizes it from the file, and a partial put against a
//! page that never staged in pulls the page first, then overlays the write.
//! Stage-out happens in the background flush pass, and the bucket's backend
//! size ratchets up as pages are written past its end.

use snafu::Snafu;

use crate::io::DriverError;
use crate::placement::PlacementError;

pub mod blob;
pub mod tag;

/// Error surfaced by engine operations, across the rpc boundary as well.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CoreError {
    #[snafu(display("{} not found", what))]
    NotFound { what: &'static str },

    #[snafu(display("{} already exists", what))]
    AlreadyExists { what: &'static str },

    #[snafu(display("insufficient capacity: {}", source))]
    InsufficientCapacity { source: PlacementError },

    #[snafu(display("tier fault: {}", source))]
    TierFault { source: DriverError },

    #[snafu(display("operation cancelled"))]
    Cancelled,

    #[snafu(display("backing file unavailable: {}", source))]
    StagerUnavailable { source: std::io::Error },

    #[snafu(display("invalid argument: {}", reason))]
    InvalidArgument { reason: String },
}

impl CoreError {
    pub(crate) fn invalid_argument(reason: impl Into<String>) -> Self {
        CoreError::InvalidArgument {
            reason: reason.into(),
        }
    }
}

/// A forwarded request came back with a response variant its sender cannot
/// interpret; only a mismatched peer produces this.
pub(crate) fn unexpected_response(response: &crate::rpc::Response) -> CoreError {
    CoreError::invalid_argument(format!("unexpected response variant: {response:?}"))
}
