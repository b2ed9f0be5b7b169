//! Keyed metadata maps for tags and blobs.
//!
//! Four maps, each behind its own reader/writer lock: tag name to id, tag id
//! to tag, namespaced blob name to id, and blob id to blob. Entities are
//! shared as `Arc`s whose mutable state sits behind its own entity lock.
//!
//! The locking discipline is fixed and every caller follows it: take the map
//! read lock, clone the `Arc` (or copy the id) out, drop the map lock, then
//! take the entity lock and do the work. Map locks are never held across
//! I/O; entity locks may be. Lock order is map, then entity, then allocator.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_utils::atomic::AtomicCell;
use parking_lot::RwLock;

use crate::id::{BlobFlags, BlobId, BufferInfo, NodeId, TagFlags, TagId, TraitId};

/// Tags hold at most this many traits.
pub const MAX_TRAITS_PER_TAG: usize = 8;

/// Mutable state of a tag, guarded by the tag's entity lock.
#[derive(Debug)]
pub struct TagInfo {
    pub name: String,
    pub id: TagId,
    /// Sum of owned blob sizes.
    pub internal_size: u64,
    /// Externally reported size; tracks the backing file when a stager is
    /// attached and may exceed `internal_size`.
    pub backend_size: u64,
    /// Owned blob ids in creation order.
    pub blob_ids: Vec<BlobId>,
    pub traits: Vec<TraitId>,
    pub flags: TagFlags,
    pub owns_blobs: bool,
}

/// A tag entity: shared handle plus entity lock.
#[derive(Debug)]
pub struct Tag {
    pub info: tokio::sync::RwLock<TagInfo>,
}

/// Mutable state of a blob, guarded by the blob's entity lock.
#[derive(Debug)]
pub struct BlobInfo {
    pub name: String,
    pub id: BlobId,
    pub tag_id: TagId,
    /// Buffer fragments; their concatenation is the blob's bytes.
    pub buffers: Vec<BufferInfo>,
    pub blob_size: u64,
    /// Tier priority in [0, 1]; higher is hotter.
    pub score: f32,
    pub user_score_stationary: bool,
    /// Incremented on every write.
    pub mod_count: u64,
    /// The `mod_count` most recently staged out.
    pub flushed_mod_count: u64,
    pub flags: BlobFlags,
}

/// A blob entity: shared handle, entity lock, and access timestamp.
///
/// The access timestamp lives outside the lock so reads can refresh it
/// without contending with writers.
#[derive(Debug)]
pub struct Blob {
    pub info: tokio::sync::RwLock<BlobInfo>,
    pub last_access: AtomicCell<Instant>,
}

impl Blob {
    pub fn touch(&self) {
        self.last_access.store(Instant::now());
    }
}

/// The per-node metadata store.
#[derive(Debug)]
pub struct MetadataStore {
    node: NodeId,
    id_alloc: AtomicU64,
    tag_names: RwLock<HashMap<String, TagId>>,
    tags: RwLock<HashMap<TagId, Arc<Tag>>>,
    blob_names: RwLock<HashMap<(TagId, String), BlobId>>,
    blobs: RwLock<HashMap<BlobId, Arc<Blob>>>,
    /// Forwarding entries for blobs migrated to another node, kept for one
    /// reorganizer epoch.
    tombstones: RwLock<HashMap<BlobId, BlobId>>,
}

impl MetadataStore {
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            id_alloc: AtomicU64::new(1),
            tag_names: RwLock::new(HashMap::new()),
            tags: RwLock::new(HashMap::new()),
            blob_names: RwLock::new(HashMap::new()),
            blobs: RwLock::new(HashMap::new()),
            tombstones: RwLock::new(HashMap::new()),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    fn next_unique(&self) -> u64 {
        self.id_alloc.fetch_add(1, Ordering::Relaxed)
    }

    /// Inserts a tag under `name` if absent, building its info from the
    /// freshly allocated id. Returns the (existing or new) id and whether
    /// this call created it.
    ///
    /// Ids burned by losing a creation race are never reused; the counter
    /// only moves forward.
    pub fn try_emplace_tag(
        &self,
        name: &str,
        build: impl FnOnce(TagId) -> TagInfo,
    ) -> (TagId, bool) {
        let id = TagId {
            node: self.node,
            unique: self.next_unique(),
        };

        // The entity is published before the name so that a name hit always
        // resolves; losing the race burns the id, which is fine, ids only
        // move forward.
        let tag = Arc::new(Tag {
            info: tokio::sync::RwLock::new(build(id)),
        });
        self.tags.write().insert(id, Arc::clone(&tag));

        let mut names = self.tag_names.write();
        if let Some(existing) = names.get(name).copied() {
            drop(names);
            self.tags.write().remove(&id);
            return (existing, false);
        }
        names.insert(name.to_string(), id);
        (id, true)
    }

    pub fn find_tag(&self, id: TagId) -> Option<Arc<Tag>> {
        self.tags.read().get(&id).cloned()
    }

    pub fn find_tag_id(&self, name: &str) -> Option<TagId> {
        self.tag_names.read().get(name).copied()
    }

    pub fn erase_tag(&self, id: TagId, name: &str) {
        self.tag_names.write().remove(name);
        self.tags.write().remove(&id);
    }

    /// Atomically swaps the name mapping of a tag. Fails if the new name is
    /// already taken by a different tag.
    pub fn rename_tag(&self, id: TagId, old_name: &str, new_name: &str) -> bool {
        let mut names = self.tag_names.write();
        match names.get(new_name).copied() {
            Some(existing) if existing != id => false,
            _ => {
                names.remove(old_name);
                names.insert(new_name.to_string(), id);
                true
            }
        }
    }

    /// Inserts a blob under `(tag_id, name)` if absent. Returns the id,
    /// the entity when it lives here (a name may be bound to a blob that
    /// migrated to another node), and whether this call created it.
    pub fn try_emplace_blob(&self, tag_id: TagId, name: &str) -> (BlobId, Option<Arc<Blob>>, bool) {
        let id = BlobId {
            node: self.node,
            unique: self.next_unique(),
        };

        // Publish the entity before the name so a name hit always resolves.
        let blob = Arc::new(Blob {
            info: tokio::sync::RwLock::new(BlobInfo {
                name: name.to_string(),
                id,
                tag_id,
                buffers: Vec::new(),
                blob_size: 0,
                score: 0.0,
                user_score_stationary: false,
                mod_count: 0,
                flushed_mod_count: 0,
                flags: BlobFlags::default(),
            }),
            last_access: AtomicCell::new(Instant::now()),
        });
        self.blobs.write().insert(id, Arc::clone(&blob));

        loop {
            let mut names = self.blob_names.write();
            let existing = names.get(&(tag_id, name.to_string())).copied();
            match existing {
                Some(existing) => {
                    drop(names);
                    let winner = self.find_blob(existing);
                    // A local binding with no entity means a concurrent
                    // destroy is between its two map removals; retry. A
                    // remote binding is a migrated blob: the caller
                    // forwards to its new home.
                    if winner.is_some() || existing.node != self.node {
                        self.blobs.write().remove(&id);
                        return (existing, winner, false);
                    }
                }
                None => {
                    names.insert((tag_id, name.to_string()), id);
                    return (id, Some(blob), true);
                }
            }
        }
    }

    /// Creates a blob entity without binding a name. Used when adopting a
    /// migrated blob: its name mapping lives on the tag's home node and is
    /// rebound there separately.
    pub fn emplace_blob_entity(&self, tag_id: TagId, name: &str) -> (BlobId, Arc<Blob>) {
        let id = BlobId {
            node: self.node,
            unique: self.next_unique(),
        };
        let blob = Arc::new(Blob {
            info: tokio::sync::RwLock::new(BlobInfo {
                name: name.to_string(),
                id,
                tag_id,
                buffers: Vec::new(),
                blob_size: 0,
                score: 0.0,
                user_score_stationary: false,
                mod_count: 0,
                flushed_mod_count: 0,
                flags: BlobFlags::default(),
            }),
            last_access: AtomicCell::new(Instant::now()),
        });
        self.blobs.write().insert(id, Arc::clone(&blob));
        (id, blob)
    }

    /// Rebinds `(tag, name)` to a new id, replacing any previous binding.
    pub fn bind_blob_name(&self, tag_id: TagId, name: &str, id: BlobId) {
        self.blob_names
            .write()
            .insert((tag_id, name.to_string()), id);
    }

    /// Looks up a blob by id, following at most one tombstone hop.
    pub fn find_blob(&self, id: BlobId) -> Option<Arc<Blob>> {
        if let Some(blob) = self.blobs.read().get(&id) {
            return Some(Arc::clone(blob));
        }
        let forwarded = *self.tombstones.read().get(&id)?;
        self.blobs.read().get(&forwarded).cloned()
    }

    pub fn resolve_tombstone(&self, id: BlobId) -> Option<BlobId> {
        self.tombstones.read().get(&id).copied()
    }

    pub fn find_blob_id(&self, tag_id: TagId, name: &str) -> Option<BlobId> {
        self.blob_names
            .read()
            .get(&(tag_id, name.to_string()))
            .copied()
    }

    pub fn erase_blob(&self, id: BlobId, tag_id: TagId, name: &str) {
        self.blob_names.write().remove(&(tag_id, name.to_string()));
        self.blobs.write().remove(&id);
    }

    /// Atomically swaps the `(tag, name)` mapping of a blob. Fails if the
    /// new name is already taken within the tag.
    pub fn rename_blob(&self, tag_id: TagId, old_name: &str, new_name: &str, id: BlobId) -> bool {
        let mut names = self.blob_names.write();
        match names.get(&(tag_id, new_name.to_string())).copied() {
            Some(existing) if existing != id => false,
            _ => {
                names.remove(&(tag_id, old_name.to_string()));
                names.insert((tag_id, new_name.to_string()), id);
                true
            }
        }
    }

    pub fn insert_tombstone(&self, old: BlobId, new: BlobId) {
        self.tombstones.write().insert(old, new);
    }

    /// Drops all tombstones; called once per reorganizer epoch.
    pub fn clear_tombstones(&self) {
        self.tombstones.write().clear();
    }

    /// Snapshot of all live blob entities.
    pub fn iter_blobs(&self) -> Vec<Arc<Blob>> {
        self.blobs.read().values().cloned().collect()
    }

    /// Snapshot of all live tag entities.
    pub fn iter_tags(&self) -> Vec<Arc<Tag>> {
        self.tags.read().values().cloned().collect()
    }

    pub fn blob_count(&self) -> usize {
        self.blobs.read().len()
    }
}
