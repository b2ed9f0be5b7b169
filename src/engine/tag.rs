//! Bucket (tag) operations.

use std::sync::Arc;

use bytes::Bytes;

use super::{unexpected_response, CoreError};
use crate::id::{BlobFlags, BlobId, TagFlags, TagId, TraitId, UpdateSizeMode};
use crate::internal_events::{TagCreated, TagDestroyed};
use crate::metadata::{TagInfo, MAX_TRAITS_PER_TAG};
use crate::node::Node;
use crate::rpc::{Request, Response};
use crate::stager::{mapper, StagerKind};

/// Options for [`Node::get_or_create_tag`].
#[derive(Clone, Debug, Default)]
pub struct TagCreateOptions {
    /// Whether the tag owns its blobs (destroying it destroys them).
    pub owns_blobs: bool,
    /// Externally reported starting size, for file-backed buckets.
    pub backend_size: u64,
    pub flags: TagFlags,
    /// Traits attached at creation, at most [`MAX_TRAITS_PER_TAG`].
    pub traits: Vec<TraitId>,
    /// Stager parameter pack; registering one marks the tag as file-backed.
    pub params: Option<Vec<u8>>,
}

impl TagCreateOptions {
    pub fn owning() -> Self {
        Self {
            owns_blobs: true,
            ..Self::default()
        }
    }

    /// Options for a bucket mirroring a backing file through a stager.
    pub fn file_backed(params: Vec<u8>, backend_size: u64) -> Self {
        Self {
            owns_blobs: true,
            backend_size,
            flags: TagFlags::IS_FILE,
            params: Some(params),
            ..Self::default()
        }
    }
}

impl Node {
    /// Gets or creates the tag named `name`. Name collisions return the
    /// existing id; creation is idempotent.
    pub async fn get_or_create_tag(
        &self,
        name: &str,
        opts: TagCreateOptions,
    ) -> Result<TagId, CoreError> {
        if name.is_empty() {
            return Err(CoreError::invalid_argument("tag name cannot be empty"));
        }
        if opts.traits.len() > MAX_TRAITS_PER_TAG {
            return Err(CoreError::invalid_argument(format!(
                "tags hold at most {MAX_TRAITS_PER_TAG} traits"
            )));
        }

        // Parse the parameter pack before touching the maps so a malformed
        // pack cannot leave a half-registered tag behind.
        let stager = match &opts.params {
            Some(params) => Some(StagerKind::from_params(name, params)?),
            None => None,
        };

        let mut flags = opts.flags;
        if stager.is_some() {
            flags.insert(TagFlags::IS_FILE);
        }

        let (tag_id, created) = self.metadata.try_emplace_tag(name, |id| TagInfo {
            name: name.to_string(),
            id,
            internal_size: 0,
            backend_size: opts.backend_size,
            blob_ids: Vec::new(),
            traits: opts.traits.clone(),
            flags,
            owns_blobs: opts.owns_blobs,
        });

        if created {
            if let Some(stager) = stager {
                self.stagers.write().insert(tag_id, Arc::new(stager));
            }
            TagCreated {
                name,
                file_backed: flags.contains(TagFlags::IS_FILE),
            }
            .emit();
        }

        Ok(tag_id)
    }

    /// Looks up a tag id by name.
    pub fn get_tag_id(&self, name: &str) -> Result<TagId, CoreError> {
        self.metadata
            .find_tag_id(name)
            .ok_or(CoreError::NotFound { what: "tag" })
    }

    pub async fn get_tag_name(&self, tag_id: TagId) -> Result<String, CoreError> {
        let tag = self
            .metadata
            .find_tag(tag_id)
            .ok_or(CoreError::NotFound { what: "tag" })?;
        let info = tag.info.read().await;
        Ok(info.name.clone())
    }

    /// Renames the tag. The name-map swap is atomic; a taken name fails the
    /// whole operation.
    pub async fn rename_tag(&self, tag_id: TagId, new_name: &str) -> Result<(), CoreError> {
        if new_name.is_empty() {
            return Err(CoreError::invalid_argument("tag name cannot be empty"));
        }
        let tag = self
            .metadata
            .find_tag(tag_id)
            .ok_or(CoreError::NotFound { what: "tag" })?;

        let mut info = tag.info.write().await;
        if !self.metadata.rename_tag(tag_id, &info.name, new_name) {
            return Err(CoreError::AlreadyExists { what: "tag name" });
        }
        info.name = new_name.to_string();
        Ok(())
    }

    /// Destroys the tag. If the tag owns its blobs the destruction cascades
    /// to them, releasing their buffers.
    pub async fn destroy_tag(&self, tag_id: TagId) -> Result<(), CoreError> {
        let tag = self
            .metadata
            .find_tag(tag_id)
            .ok_or(CoreError::NotFound { what: "tag" })?;

        let (name, owned) = {
            let info = tag.info.read().await;
            let owned = if info.owns_blobs {
                info.blob_ids.clone()
            } else {
                Vec::new()
            };
            (info.name.clone(), owned)
        };

        for blob_id in owned {
            // Keep the membership list untouched while we walk it; the tag
            // is going away with it.
            if let Err(error) = self
                .destroy_blob(tag_id, blob_id, BlobFlags::KEEP_IN_TAG)
                .await
            {
                debug!(%error, ?blob_id, "Blob already gone during tag destruction.");
            }
        }

        self.stagers.write().remove(&tag_id);
        self.metadata.erase_tag(tag_id, &name);
        TagDestroyed { name: &name }.emit();
        Ok(())
    }

    /// Adds a blob id to the tag's membership list. Idempotent.
    pub async fn tag_add_blob(&self, tag_id: TagId, blob_id: BlobId) -> Result<(), CoreError> {
        let tag = self
            .metadata
            .find_tag(tag_id)
            .ok_or(CoreError::NotFound { what: "tag" })?;
        let mut info = tag.info.write().await;
        if !info.blob_ids.contains(&blob_id) {
            info.blob_ids.push(blob_id);
        }
        Ok(())
    }

    pub async fn tag_remove_blob(&self, tag_id: TagId, blob_id: BlobId) -> Result<(), CoreError> {
        let tag = self
            .metadata
            .find_tag(tag_id)
            .ok_or(CoreError::NotFound { what: "tag" })?;
        let mut info = tag.info.write().await;
        info.blob_ids.retain(|id| *id != blob_id);
        Ok(())
    }

    /// Destroys every owned blob but keeps the tag itself.
    pub async fn tag_clear_blobs(&self, tag_id: TagId) -> Result<(), CoreError> {
        let tag = self
            .metadata
            .find_tag(tag_id)
            .ok_or(CoreError::NotFound { what: "tag" })?;

        let owned = {
            let info = tag.info.read().await;
            if info.owns_blobs {
                info.blob_ids.clone()
            } else {
                Vec::new()
            }
        };

        for blob_id in owned {
            if let Err(error) = self
                .destroy_blob(tag_id, blob_id, BlobFlags::KEEP_IN_TAG)
                .await
            {
                debug!(%error, ?blob_id, "Blob already gone while clearing tag.");
            }
        }

        let mut info = tag.info.write().await;
        info.blob_ids.clear();
        info.internal_size = 0;
        Ok(())
    }

    /// The tag's size: the backing file's reported size when a stager is
    /// attached, the sum of owned blob sizes otherwise.
    pub async fn tag_get_size(&self, tag_id: TagId) -> Result<u64, CoreError> {
        let tag = self
            .metadata
            .find_tag(tag_id)
            .ok_or(CoreError::NotFound { what: "tag" })?;
        let info = tag.info.read().await;
        if info.flags.contains(TagFlags::IS_FILE) {
            Ok(info.backend_size.max(info.internal_size))
        } else {
            Ok(info.internal_size)
        }
    }

    /// Adjusts the tag's externally reported size.
    pub async fn tag_update_size(
        &self,
        tag_id: TagId,
        update: i64,
        mode: UpdateSizeMode,
    ) -> Result<(), CoreError> {
        let tag = self
            .metadata
            .find_tag(tag_id)
            .ok_or(CoreError::NotFound { what: "tag" })?;
        let mut info = tag.info.write().await;
        match mode {
            UpdateSizeMode::Add => {
                info.backend_size = info.backend_size.saturating_add_signed(update);
            }
            UpdateSizeMode::Cap => {
                let value = u64::try_from(update).unwrap_or(0);
                info.backend_size = info.backend_size.max(value);
            }
        }
        Ok(())
    }

    pub async fn tag_get_contained_blob_ids(
        &self,
        tag_id: TagId,
    ) -> Result<Vec<BlobId>, CoreError> {
        let tag = self
            .metadata
            .find_tag(tag_id)
            .ok_or(CoreError::NotFound { what: "tag" })?;
        let info = tag.info.read().await;
        Ok(info.blob_ids.clone())
    }

    /// Labels the blob with a second, non-owning tag. The label holds a
    /// reference, never ownership: destroying it leaves the blob (and the
    /// owning tag's accounting) untouched.
    pub async fn tag_blob(&self, blob_id: BlobId, tag: TagId) -> Result<(), CoreError> {
        if self.metadata.find_blob(blob_id).is_none() {
            return Err(CoreError::NotFound { what: "blob" });
        }
        if tag.node != self.node_id() {
            let request = Request::TagAddBlob {
                tag_id: tag,
                blob_id,
            };
            return match self.forward(tag.node, request).await? {
                Response::Unit => Ok(()),
                other => Err(unexpected_response(&other)),
            };
        }
        self.tag_add_blob(tag, blob_id).await
    }

    /// Whether the blob belongs to `tag` -- as its owner or as a label.
    pub async fn blob_has_tag(&self, blob_id: BlobId, tag: TagId) -> Result<bool, CoreError> {
        let blob = self
            .metadata
            .find_blob(blob_id)
            .ok_or(CoreError::NotFound { what: "blob" })?;
        if blob.info.read().await.tag_id == tag {
            return Ok(true);
        }
        let Some(label) = self.metadata.find_tag(tag) else {
            return Ok(false);
        };
        let contains = label.info.read().await.blob_ids.contains(&blob_id);
        Ok(contains)
    }

    /// Appends `data` to the bucket, splitting it into page-named blobs at
    /// `page_size` boundaries starting from the bucket's current size.
    pub async fn append(
        &self,
        tag_id: TagId,
        data: Bytes,
        page_size: u64,
        score: f32,
    ) -> Result<(), CoreError> {
        if page_size == 0 {
            return Err(CoreError::invalid_argument("page_size cannot be zero"));
        }

        let mut cursor = self.tag_get_size(tag_id).await?;
        let mut remaining = data;

        while !remaining.is_empty() {
            let page_index = cursor / page_size;
            let page_offset = cursor % page_size;
            let take = usize::try_from(page_size - page_offset)
                .unwrap_or(usize::MAX)
                .min(remaining.len());
            let chunk = remaining.split_to(take);

            let name = mapper::encode_page_name(page_index);
            self.put_blob(tag_id, &name, None, page_offset, chunk, score, BlobFlags::default())
                .await?;
            cursor += take as u64;
        }

        Ok(())
    }
}
