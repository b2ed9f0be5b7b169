//! Blob operations: put, get, truncate, destroy, rename, reorganize.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use super::{unexpected_response, CoreError};
use crate::id::{BlobFlags, BlobId, BufferInfo, TagId, TargetId};
use crate::internal_events::{
    BlobDestroyed, BlobRead, BlobWritten, PlacementFailed, TierFaultRecovered,
};
use crate::io::DriverError;
use crate::metadata::{Blob, BlobInfo};
use crate::node::Node;
use crate::placement::{compute_schema, PlacementError};
use crate::reorganizer::ReorgRequest;
use crate::rpc::{Request, Response};

impl Node {
    /// Gets or creates the id for `(tag, name)`. Idempotent: concurrent
    /// callers observe the same id, and exactly one of them creates it.
    pub async fn get_or_create_blob_id(
        &self,
        tag_id: TagId,
        name: &str,
    ) -> Result<BlobId, CoreError> {
        if name.is_empty() {
            return Err(CoreError::invalid_argument("blob name cannot be empty"));
        }
        if self.metadata.find_tag(tag_id).is_none() {
            return Err(CoreError::NotFound { what: "tag" });
        }

        let (blob_id, _blob, created) = self.metadata.try_emplace_blob(tag_id, name);
        if created {
            self.route_tag_add_blob(tag_id, blob_id).await;
        }
        Ok(blob_id)
    }

    /// Looks up a blob id by name, without creating it.
    pub fn get_blob_id(&self, tag_id: TagId, name: &str) -> Result<BlobId, CoreError> {
        self.metadata
            .find_blob_id(tag_id, name)
            .ok_or(CoreError::NotFound { what: "blob" })
    }

    pub async fn get_blob_name(&self, blob_id: BlobId) -> Result<String, CoreError> {
        let blob = self
            .metadata
            .find_blob(blob_id)
            .ok_or(CoreError::NotFound { what: "blob" })?;
        let name = blob.info.read().await.name.clone();
        Ok(name)
    }

    pub async fn get_blob_size(&self, blob_id: BlobId) -> Result<u64, CoreError> {
        let blob = self
            .metadata
            .find_blob(blob_id)
            .ok_or(CoreError::NotFound { what: "blob" })?;
        let blob_size = blob.info.read().await.blob_size;
        Ok(blob_size)
    }

    pub async fn get_blob_score(&self, blob_id: BlobId) -> Result<f32, CoreError> {
        let blob = self
            .metadata
            .find_blob(blob_id)
            .ok_or(CoreError::NotFound { what: "blob" })?;
        let score = blob.info.read().await.score;
        Ok(score)
    }

    pub async fn get_blob_buffers(&self, blob_id: BlobId) -> Result<Vec<BufferInfo>, CoreError> {
        let blob = self
            .metadata
            .find_blob(blob_id)
            .ok_or(CoreError::NotFound { what: "blob" })?;
        let buffers = blob.info.read().await.buffers.clone();
        Ok(buffers)
    }

    /// Puts `data` into the blob at `offset`.
    ///
    /// With the REPLACE flag (or a write that exactly covers the blob from
    /// offset zero) the old buffer set is freed and replaced wholesale.
    /// Otherwise the overlap with existing bytes is overwritten in place and
    /// any extension past the current end is placed fresh. On a staged
    /// bucket, a partial put against a page that has not staged in pulls
    /// the page from the backing file first, then overlays the write.
    pub async fn put_blob(
        &self,
        tag_id: TagId,
        name: &str,
        blob_id: Option<BlobId>,
        offset: u64,
        data: Bytes,
        score: f32,
        flags: BlobFlags,
    ) -> Result<BlobId, CoreError> {
        let stager = self.find_stager(tag_id);

        let resolved = match blob_id {
            Some(id) => id,
            None => self.get_or_create_blob_id(tag_id, name).await?,
        };

        // A name that resolves to a migrated blob executes at its new home.
        if resolved.node != self.node_id() {
            let request = Request::PutBlob {
                tag_id,
                name: name.to_string(),
                blob_id: Some(resolved),
                offset,
                data: data.to_vec(),
                score,
                flags,
            };
            return match self.forward(resolved.node, request).await? {
                Response::BlobId(id) => Ok(id),
                other => Err(unexpected_response(&other)),
            };
        }

        let blob = self
            .metadata
            .find_blob(resolved)
            .ok_or(CoreError::NotFound { what: "blob" })?;
        let (blob_id, blob_name) = {
            let info = blob.info.read().await;
            (info.id, info.name.clone())
        };

        // A partial write against a staged page that never came in from the
        // backing file first stages it in, so the overlay lands on the
        // page's real bytes instead of a hole.
        if let Some(stager) = &stager {
            if !flags.contains(BlobFlags::REPLACE) {
                let needs_stage = {
                    let info = blob.info.read().await;
                    info.buffers.is_empty() && !info.flags.contains(BlobFlags::DID_STAGE_IN)
                };
                if needs_stage {
                    stager.stage_in(self, tag_id, &blob_name, score).await?;
                }
            }
        }

        // Staged pages accept writes past their end (the backing file may
        // simply be shorter); the gap zero-fills like the file would.
        let mut flags = flags;
        if stager.is_some() {
            flags.insert(BlobFlags::SHOULD_STAGE);
        }

        let written = data.len() as u64;
        self.commit_write(tag_id, &blob, offset, data, score, flags)
            .await?;

        if let Some(stager) = &stager {
            // Size reporting toward the backing file is fire-and-forget.
            if let Err(error) = stager
                .update_size(self, tag_id, &blob_name, offset, written)
                .await
            {
                error!(%error, ?tag_id, blob_name = %blob_name, "Failed to update staged bucket size.");
            }
        }

        BlobWritten { bytes: written }.emit();
        Ok(blob_id)
    }

    /// Commits a staged page read by a stager. Bypasses the stage-in check
    /// -- this *is* the stage-in -- and marks the blob accordingly.
    pub(crate) async fn write_staged_page(
        &self,
        tag_id: TagId,
        name: &str,
        data: Bytes,
        score: f32,
    ) -> Result<BlobId, CoreError> {
        let id = self.get_or_create_blob_id(tag_id, name).await?;
        let blob = self
            .metadata
            .find_blob(id)
            .ok_or(CoreError::NotFound { what: "blob" })?;
        self.commit_write(
            tag_id,
            &blob,
            0,
            data,
            score,
            BlobFlags::REPLACE | BlobFlags::DID_STAGE_IN,
        )
        .await?;
        Ok(id)
    }

    /// Reads up to `len` bytes from the blob starting at `offset`. A `len`
    /// of zero reads to the end of the blob. Returns the bytes actually
    /// read; a range past the end truncates rather than errors.
    pub async fn get_blob(
        &self,
        tag_id: TagId,
        name: &str,
        blob_id: Option<BlobId>,
        offset: u64,
        len: u64,
    ) -> Result<(u64, Bytes), CoreError> {
        let stager = self.find_stager(tag_id);

        let resolved = match blob_id {
            Some(id) => Some(id),
            None => self.metadata.find_blob_id(tag_id, name),
        };
        let blob_id = match resolved {
            Some(id) => id,
            // A read miss against a staged bucket synthesizes the blob from
            // the backing file: create it empty, stage-in fills it below.
            None if stager.is_some() => self.get_or_create_blob_id(tag_id, name).await?,
            None => return Err(CoreError::NotFound { what: "blob" }),
        };

        // A name that resolves to a migrated blob reads at its new home.
        if blob_id.node != self.node_id() {
            let request = Request::GetBlob {
                tag_id,
                name: name.to_string(),
                blob_id: Some(blob_id),
                offset,
                len,
            };
            return match self.forward(blob_id.node, request).await? {
                Response::Blob { read, data } => Ok((read, Bytes::from(data))),
                other => Err(unexpected_response(&other)),
            };
        }

        let blob = self
            .metadata
            .find_blob(blob_id)
            .ok_or(CoreError::NotFound { what: "blob" })?;

        let mut staged_attempt = false;
        loop {
            {
                let info = blob.info.read().await;
                let needs_stage = info.buffers.is_empty()
                    && !info.flags.contains(BlobFlags::DID_STAGE_IN)
                    && stager.is_some()
                    && !staged_attempt;

                if !needs_stage {
                    let data = self.read_range(&info, offset, len).await?;
                    blob.touch();
                    BlobRead {
                        bytes: data.len() as u64,
                    }
                    .emit();
                    return Ok((data.len() as u64, data));
                }
            }

            // Entity lock is released around the stage-in; it re-enters the
            // engine through the put path.
            staged_attempt = true;
            let (blob_name, score) = {
                let info = blob.info.read().await;
                (info.name.clone(), info.score)
            };
            if let Some(stager) = &stager {
                stager.stage_in(self, tag_id, &blob_name, score).await?;
            }
        }
    }

    /// Shrinks the blob to `new_size`, freeing trailing buffers and
    /// splitting the boundary buffer if needed.
    pub async fn truncate_blob(
        &self,
        tag_id: TagId,
        blob_id: BlobId,
        new_size: u64,
    ) -> Result<(), CoreError> {
        let blob = self
            .metadata
            .find_blob(blob_id)
            .ok_or(CoreError::NotFound { what: "blob" })?;

        let old_size = {
            let mut info = blob.info.write().await;
            if new_size > info.blob_size {
                return Err(CoreError::invalid_argument(format!(
                    "cannot truncate {} bytes up to {}",
                    info.blob_size, new_size
                )));
            }
            let old_size = info.blob_size;
            self.truncate_locked(&mut info, new_size);
            info.mod_count += 1;
            old_size
        };

        self.apply_tag_size_delta(tag_id, new_size as i64 - old_size as i64)
            .await;
        Ok(())
    }

    /// Destroys the blob, releasing its buffers. With KEEP_IN_TAG the id
    /// stays in the owning tag's membership list (used by cascading
    /// destruction, which drops the whole list at once).
    pub async fn destroy_blob(
        &self,
        tag_id: TagId,
        blob_id: BlobId,
        flags: BlobFlags,
    ) -> Result<(), CoreError> {
        let blob = self
            .metadata
            .find_blob(blob_id)
            .ok_or(CoreError::NotFound { what: "blob" })?;

        let (actual_id, name, freed_size, buffers) = {
            let mut info = blob.info.write().await;
            let buffers = std::mem::take(&mut info.buffers);
            let freed_size = info.blob_size;
            info.blob_size = 0;
            (info.id, info.name.clone(), freed_size, buffers)
        };

        self.free_buffers(&buffers);
        self.metadata.erase_blob(actual_id, tag_id, &name);

        self.apply_tag_size_delta(tag_id, -(freed_size as i64)).await;
        if !flags.contains(BlobFlags::KEEP_IN_TAG) {
            self.route_tag_remove_blob(tag_id, actual_id).await;
        }

        BlobDestroyed { bytes: freed_size }.emit();
        Ok(())
    }

    /// Atomically swaps the blob's name mapping.
    pub async fn rename_blob(
        &self,
        tag_id: TagId,
        blob_id: BlobId,
        new_name: &str,
    ) -> Result<(), CoreError> {
        if new_name.is_empty() {
            return Err(CoreError::invalid_argument("blob name cannot be empty"));
        }
        let blob = self
            .metadata
            .find_blob(blob_id)
            .ok_or(CoreError::NotFound { what: "blob" })?;

        let mut info = blob.info.write().await;
        if !self
            .metadata
            .rename_blob(tag_id, &info.name, new_name, info.id)
        {
            return Err(CoreError::AlreadyExists { what: "blob name" });
        }
        info.name = new_name.to_string();
        Ok(())
    }

    /// Enqueues a reorganization of the blob toward a new score or node.
    /// The request executes in the background; this returns as soon as it
    /// is queued.
    pub fn reorganize_blob(
        &self,
        tag_id: TagId,
        blob_id: BlobId,
        score: f32,
        node_id: u32,
        user_score: bool,
    ) -> Result<(), CoreError> {
        let request = ReorgRequest::Rescore {
            tag_id,
            blob_id,
            score,
            node_id,
            user_score,
        };
        if self.reorg_tx.send(request).is_err() {
            debug!(?blob_id, "Reorganizer is gone; dropping reorganization request.");
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Write path internals
    // ---------------------------------------------------------------------

    /// Applies a write to the blob under its entity lock and settles the
    /// owning tag's size afterwards.
    pub(crate) async fn commit_write(
        &self,
        tag_id: TagId,
        blob: &Arc<Blob>,
        offset: u64,
        data: Bytes,
        score: f32,
        flags: BlobFlags,
    ) -> Result<(), CoreError> {
        let (old_size, new_size) = {
            let mut info = blob.info.write().await;
            blob.touch();

            let mut offset = if flags.contains(BlobFlags::APPEND) {
                info.blob_size
            } else {
                offset
            };
            let mut data = data;

            if !flags.contains(BlobFlags::REPLACE) && offset > info.blob_size {
                if flags.contains(BlobFlags::SHOULD_STAGE) {
                    // The page is shorter than the write position; pad the
                    // hole with zeroes the way the backing file would.
                    let gap = usize::try_from(offset - info.blob_size)
                        .expect("page gaps fit in memory");
                    let mut padded = BytesMut::with_capacity(gap + data.len());
                    padded.resize(gap, 0);
                    padded.extend_from_slice(&data);
                    data = padded.freeze();
                    offset = info.blob_size;
                } else {
                    return Err(CoreError::invalid_argument(format!(
                        "write at offset {} starts past blob end {}",
                        offset, info.blob_size
                    )));
                }
            }

            let data_len = data.len() as u64;
            let replace =
                flags.contains(BlobFlags::REPLACE) || (offset == 0 && data_len == info.blob_size);

            let old_size = info.blob_size;

            if replace {
                let new_buffers = self.place_and_write(data).await?;
                let old_buffers = std::mem::replace(&mut info.buffers, new_buffers);
                self.free_buffers(&old_buffers);
                info.blob_size = data_len;
            } else {
                let overlap_end = (offset + data_len).min(info.blob_size);
                if offset < overlap_end {
                    let span = usize::try_from(overlap_end - offset)
                        .expect("overlap fits: it is bounded by the payload length");
                    self.overwrite_in_place(&info.buffers, offset, &data[..span])
                        .await?;
                }
                if offset + data_len > info.blob_size {
                    let extension = data.slice(
                        usize::try_from(overlap_end - offset)
                            .expect("overlap fits: it is bounded by the payload length")..,
                    );
                    let new_buffers = self.place_and_write(extension).await?;
                    info.buffers.extend(new_buffers);
                    info.blob_size = offset + data_len;
                }
            }

            if flags.contains(BlobFlags::TRUNCATE) && offset + data_len < info.blob_size {
                self.truncate_locked(&mut info, offset + data_len);
            }

            info.mod_count += 1;
            if flags.contains(BlobFlags::USER_SCORE_STATIONARY) {
                info.score = score.clamp(0.0, 1.0);
                info.user_score_stationary = true;
            } else if !info.user_score_stationary {
                info.score = score.clamp(0.0, 1.0);
            }
            if flags.contains(BlobFlags::DID_STAGE_IN) {
                info.flags.insert(BlobFlags::DID_STAGE_IN);
            }

            (old_size, info.blob_size)
        };

        self.apply_tag_size_delta(tag_id, new_size as i64 - old_size as i64)
            .await;
        Ok(())
    }

    /// Places `data` across targets and writes it, returning the committed
    /// fragments. A target that faults mid-write is excluded and the
    /// unwritten remainder re-placed among the rest; on total failure every
    /// allocation this call made is rolled back.
    pub(crate) async fn place_and_write(
        &self,
        data: Bytes,
    ) -> Result<Vec<BufferInfo>, CoreError> {
        self.place_and_write_excluding(data, &HashSet::new()).await
    }

    /// As [`place_and_write`](Self::place_and_write), but restricted to the
    /// given candidate targets. Used by tier migration.
    pub(crate) async fn place_and_write_among(
        &self,
        data: Bytes,
        allowed: &HashSet<TargetId>,
    ) -> Result<Vec<BufferInfo>, CoreError> {
        let excluded: HashSet<TargetId> = self
            .targets
            .iter()
            .map(|t| t.id)
            .filter(|id| !allowed.contains(id))
            .collect();
        self.place_and_write_excluding(data, &excluded).await
    }

    pub(crate) async fn place_and_write_excluding(
        &self,
        data: Bytes,
        initially_excluded: &HashSet<TargetId>,
    ) -> Result<Vec<BufferInfo>, CoreError> {
        let mut placed: Vec<BufferInfo> = Vec::new();
        let mut excluded = initially_excluded.clone();
        let mut cursor = 0usize;
        let mut last_fault: Option<DriverError> = None;

        'placement: while cursor < data.len() {
            let snapshots: Vec<_> = self
                .target_snapshots()
                .into_iter()
                .filter(|s| !excluded.contains(&s.id))
                .collect();

            let outstanding = (data.len() - cursor) as u64;
            let schema = match compute_schema(outstanding, &snapshots, self.headroom()) {
                Ok(schema) => schema,
                Err(error @ PlacementError::InsufficientCapacity { .. }) => {
                    self.free_buffers(&placed);
                    PlacementFailed { bytes: outstanding }.emit();
                    self.hint_pressure();
                    // A fault-driven retry that ran out of targets is a tier
                    // fault, not a capacity problem.
                    return Err(match last_fault {
                        Some(source) => CoreError::TierFault { source },
                        None => CoreError::InsufficientCapacity { source: error },
                    });
                }
            };

            for entry in schema.entries {
                let target = self
                    .find_target(entry.target)
                    .expect("schema only references known targets");

                let offset = match target.allocator.allocate(entry.size) {
                    Ok(offset) => offset,
                    Err(_) => {
                        // Lost a capacity race since the snapshot; let the
                        // next round re-place what is left elsewhere.
                        excluded.insert(entry.target);
                        continue 'placement;
                    }
                };

                let size = usize::try_from(entry.size).expect("schema entries fit in memory");
                let chunk = data.slice(cursor..cursor + size);
                match target.driver.write_at(offset, &chunk).await {
                    Ok(()) => {
                        cursor += size;
                        placed.push(BufferInfo {
                            target: entry.target,
                            offset,
                            size: entry.size,
                        });
                    }
                    Err(error) => {
                        warn!(%error, target = %entry.target, "Tier fault during placement; re-placing remainder.");
                        if let Err(error) = target.allocator.free(offset, entry.size) {
                            error!(%error, target = %entry.target, "Leaked buffer while unwinding a tier fault.");
                        }
                        TierFaultRecovered {
                            target: entry.target,
                        }
                        .emit();
                        excluded.insert(entry.target);
                        last_fault = Some(error);
                        continue 'placement;
                    }
                }
            }
        }

        Ok(placed)
    }

    /// Overwrites `[offset, offset + data.len())` across existing fragments.
    async fn overwrite_in_place(
        &self,
        buffers: &[BufferInfo],
        offset: u64,
        data: &[u8],
    ) -> Result<(), CoreError> {
        let mut fragment_start = 0u64;
        let mut written = 0usize;

        for buffer in buffers {
            let fragment_end = fragment_start + buffer.size;
            if fragment_end > offset && written < data.len() {
                let begin = offset.max(fragment_start) - fragment_start;
                let available = buffer.size - begin;
                let take = usize::try_from(available)
                    .unwrap_or(usize::MAX)
                    .min(data.len() - written);

                let target = self
                    .find_target(buffer.target)
                    .expect("blob fragments only reference known targets");
                target
                    .driver
                    .write_at(buffer.offset + begin, &data[written..written + take])
                    .await
                    .map_err(|source| CoreError::TierFault { source })?;
                written += take;
            }
            fragment_start = fragment_end;
            if written == data.len() {
                break;
            }
        }

        Ok(())
    }

    /// Reads `[offset, offset + len)` (clamped to the blob's end) out of the
    /// fragment list. A `len` of zero reads to the end.
    pub(crate) async fn read_range(
        &self,
        info: &BlobInfo,
        offset: u64,
        len: u64,
    ) -> Result<Bytes, CoreError> {
        if offset >= info.blob_size {
            return Ok(Bytes::new());
        }
        let len = if len == 0 { info.blob_size - offset } else { len };
        let end = (offset + len).min(info.blob_size);
        let total = usize::try_from(end - offset).expect("read spans fit in memory");
        let mut assembled = BytesMut::with_capacity(total);

        let mut fragment_start = 0u64;
        for buffer in &info.buffers {
            let fragment_end = fragment_start + buffer.size;
            if fragment_end > offset && fragment_start < end {
                let begin = offset.max(fragment_start) - fragment_start;
                let stop = end.min(fragment_end) - fragment_start;

                let target = self
                    .find_target(buffer.target)
                    .expect("blob fragments only reference known targets");
                let chunk = target
                    .driver
                    .read_at(buffer.offset + begin, stop - begin)
                    .await
                    .map_err(|source| CoreError::TierFault { source })?;
                assembled.extend_from_slice(&chunk);
            }
            fragment_start = fragment_end;
            if fragment_start >= end {
                break;
            }
        }

        Ok(assembled.freeze())
    }

    /// Truncates the buffer list in place to `new_size` logical bytes.
    fn truncate_locked(&self, info: &mut BlobInfo, new_size: u64) {
        let mut fragment_start = 0u64;
        let mut keep = Vec::with_capacity(info.buffers.len());
        let mut freed = Vec::new();

        for buffer in info.buffers.drain(..) {
            let fragment_end = fragment_start + buffer.size;
            if fragment_end <= new_size {
                keep.push(buffer);
            } else if fragment_start >= new_size {
                freed.push(buffer);
            } else {
                // Boundary fragment: release the aligned tail, keep the head.
                let retained = new_size - fragment_start;
                if let Some(target) = self.find_target(buffer.target) {
                    if let Err(error) =
                        target.allocator.shrink(buffer.offset, buffer.size, retained)
                    {
                        error!(%error, target = %buffer.target, "Failed to shrink boundary buffer.");
                    }
                }
                keep.push(BufferInfo {
                    size: retained,
                    ..buffer
                });
            }
            fragment_start = fragment_end;
        }

        for buffer in &freed {
            if let Some(target) = self.find_target(buffer.target) {
                if let Err(error) = target.allocator.free(buffer.offset, buffer.size) {
                    error!(%error, target = %buffer.target, "Failed to free truncated buffer.");
                }
            }
        }

        info.buffers = keep;
        info.blob_size = new_size;
    }

    /// Returns every fragment in `buffers` to its allocator. Failures are
    /// logged and skipped; a leaked span is recoverable noise, a crashed
    /// engine is not.
    pub(crate) fn free_buffers(&self, buffers: &[BufferInfo]) {
        for buffer in buffers {
            match self.find_target(buffer.target) {
                Some(target) => {
                    if let Err(error) = target.allocator.free(buffer.offset, buffer.size) {
                        error!(%error, target = %buffer.target, "Failed to free buffer.");
                    }
                }
                None => {
                    error!(target = %buffer.target, "Buffer references an unknown target.");
                }
            }
        }
    }

    /// Settles the owning tag's internal size. When the tag lives on
    /// another node (the blob migrated away from its creation site), the
    /// adjustment is forwarded fire-and-forget.
    pub(crate) async fn apply_tag_size_delta(&self, tag_id: TagId, delta: i64) {
        if tag_id.node != self.node_id() {
            let request = Request::TagAdjustInternalSize { tag_id, delta };
            if let Err(error) = self.transport.send(tag_id.node, request).await {
                error!(%error, ?tag_id, "Failed to forward tag size adjustment.");
            }
            return;
        }
        let Some(tag) = self.metadata.find_tag(tag_id) else {
            return;
        };
        let mut info = tag.info.write().await;
        info.internal_size = info.internal_size.saturating_add_signed(delta);
    }

    pub(crate) async fn route_tag_add_blob(&self, tag_id: TagId, blob_id: BlobId) {
        if tag_id.node != self.node_id() {
            let request = Request::TagAddBlob { tag_id, blob_id };
            if let Err(error) = self.transport.send(tag_id.node, request).await {
                error!(%error, ?tag_id, "Failed to forward tag membership update.");
            }
            return;
        }
        if let Err(error) = self.tag_add_blob(tag_id, blob_id).await {
            debug!(%error, ?tag_id, "Tag vanished while registering blob.");
        }
    }

    pub(crate) async fn route_tag_remove_blob(&self, tag_id: TagId, blob_id: BlobId) {
        if tag_id.node != self.node_id() {
            let request = Request::TagRemoveBlob { tag_id, blob_id };
            if let Err(error) = self.transport.send(tag_id.node, request).await {
                error!(%error, ?tag_id, "Failed to forward tag membership update.");
            }
            return;
        }
        if let Err(error) = self.tag_remove_blob(tag_id, blob_id).await {
            debug!(%error, ?tag_id, "Tag vanished while unregistering blob.");
        }
    }

    fn hint_pressure(&self) {
        let _ = self.reorg_tx.send(ReorgRequest::PressureHint);
    }

    /// Sends a request to another node, translating wire errors back into
    /// engine errors.
    pub(crate) async fn forward(
        &self,
        node: u32,
        request: Request,
    ) -> Result<Response, CoreError> {
        match self.transport.send(node, request).await {
            Ok(Response::Error(payload)) => Err(payload.into_core_error()),
            Ok(response) => Ok(response),
            Err(error) => Err(CoreError::TierFault {
                source: DriverError::RemoteFault {
                    target: TargetId {
                        node,
                        device: 0,
                        slab: 0,
                    },
                    message: error.to_string(),
                },
            }),
        }
    }
}
