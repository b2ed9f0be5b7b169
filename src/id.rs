//! Identifiers and small value types shared across the engine.
//!
//! Every entity id carries the node that owns it: the node component routes
//! requests to the entity's home node, and the `unique` component is drawn
//! from a per-node monotonic counter, so ids are never reused within a
//! process lifetime.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies a node in the cluster.
pub type NodeId = u32;

/// Identifies a tag (bucket), owned by its home node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TagId {
    pub node: NodeId,
    pub unique: u64,
}

/// Identifies a blob, owned by its home node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlobId {
    pub node: NodeId,
    pub unique: u64,
}

/// Identifies a trait attached to a tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraitId {
    pub node: NodeId,
    pub unique: u64,
}

/// Identifies a storage target: one device slab on one node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetId {
    pub node: NodeId,
    pub device: u16,
    pub slab: u16,
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.node, self.device, self.slab)
    }
}

/// One buffer fragment of a blob: a byte range inside a target.
///
/// The concatenation of a blob's fragments, in list order, is the blob's
/// byte sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferInfo {
    pub target: TargetId,
    pub offset: u64,
    pub size: u64,
}

/// Mode for [`tag_update_size`](crate::node::Node::tag_update_size).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateSizeMode {
    /// Add the delta to the tag's backend size.
    Add,
    /// Raise the backend size to the given value if it is larger.
    Cap,
}

/// Per-operation blob flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobFlags(pub u32);

impl BlobFlags {
    /// Replace the blob's entire buffer set with this write.
    pub const REPLACE: BlobFlags = BlobFlags(1 << 0);
    /// Write at the blob's current end, ignoring the offset.
    pub const APPEND: BlobFlags = BlobFlags(1 << 1);
    /// Shrink the blob to exactly the end of this write.
    pub const TRUNCATE: BlobFlags = BlobFlags(1 << 2);
    /// The blob's page has been staged in from the backing file.
    pub const DID_STAGE_IN: BlobFlags = BlobFlags(1 << 3);
    /// The blob's bucket is backed by a stager.
    pub const SHOULD_STAGE: BlobFlags = BlobFlags(1 << 4);
    /// This operation created the blob.
    pub const DID_CREATE: BlobFlags = BlobFlags(1 << 5);
    /// The given score is user-set and must survive rescoring.
    pub const USER_SCORE_STATIONARY: BlobFlags = BlobFlags(1 << 6);
    /// On destroy, leave the id in the owning tag's blob list.
    pub const KEEP_IN_TAG: BlobFlags = BlobFlags(1 << 7);

    pub fn contains(self, other: BlobFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: BlobFlags) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for BlobFlags {
    type Output = BlobFlags;

    fn bitor(self, rhs: BlobFlags) -> BlobFlags {
        BlobFlags(self.0 | rhs.0)
    }
}

/// Per-tag flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagFlags(pub u32);

impl TagFlags {
    /// The tag mirrors a backing file through a stager.
    pub const IS_FILE: TagFlags = TagFlags(1 << 0);
    /// Blobs in this tag may be destroyed under capacity pressure.
    pub const TRANSIENT: TagFlags = TagFlags(1 << 1);

    pub fn contains(self, other: TagFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: TagFlags) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for TagFlags {
    type Output = TagFlags;

    fn bitor(self, rhs: TagFlags) -> TagFlags {
        TagFlags(self.0 | rhs.0)
    }
}
