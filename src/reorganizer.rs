//! Background reorganization: the loop that keeps blobs on the right tier.
//!
//! A periodic pass snapshots target occupancy, demotes the coldest blobs
//! off targets above their evict threshold, promotes hot blobs toward the
//! fastest tier, and executes explicit rescore/migration requests queued by
//! [`reorganize_blob`](crate::node::Node::reorganize_blob). Planned moves
//! are dispatched through a bounded in-flight window so a pressure spike
//! cannot turn into an I/O storm.
//!
//! Every move is copy-then-swap: new buffers are fully written before the
//! blob's list is swapped under its write lock, and a blob that was
//! modified mid-copy abandons the move with its old buffers intact. The
//! same pass owns the stage-out flush loop, pushing dirty pages of
//! file-backed buckets to their backing files on a slower cadence.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::time::MissedTickBehavior;

use crate::engine::CoreError;
use crate::id::{BlobFlags, BlobId, NodeId, TagFlags, TagId, TargetId};
use crate::internal_events::{BlobFlushed, ReorganizationComplete, TargetUtilization};
use crate::metadata::Blob;
use crate::node::Node;
use crate::rpc::{Request, Response};

/// A queued reorganization request.
#[derive(Clone, Debug)]
pub enum ReorgRequest {
    /// Re-score a blob and/or move it to another node.
    Rescore {
        tag_id: TagId,
        blob_id: BlobId,
        score: f32,
        node_id: NodeId,
        user_score: bool,
    },
    /// A writer hit `InsufficientCapacity`; run a pass soon.
    PressureHint,
}

/// One planned buffer movement, produced by a pass and executed through the
/// bounded window.
enum PlannedMove {
    Demote {
        tag_id: TagId,
        blob: Arc<Blob>,
        below: f64,
    },
    Promote {
        blob: Arc<Blob>,
    },
}

impl Node {
    /// Spawns the background loop: reorganization ticks, flush ticks, and
    /// the explicit-request queue. The loop exits on shutdown.
    ///
    /// # Panics
    ///
    /// Panics if called twice; the request queue has a single consumer.
    pub fn spawn_background(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            let mut queue = node
                .reorg_rx
                .lock()
                .await
                .take()
                .expect("background loop may only be started once");

            let config = node.config().reorganizer.clone();
            let mut reorg_tick = tokio::time::interval(config.tick_interval());
            reorg_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut flush_tick = tokio::time::interval(config.flush_interval());
            flush_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut shutdown = node.shutdown_rx.clone();

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            debug!("Background loop shutting down.");
                            break;
                        }
                    }
                    _ = reorg_tick.tick() => {
                        node.run_reorganization_pass().await;
                        // A pass is an epoch boundary for migration
                        // forwarding.
                        node.metadata.clear_tombstones();
                    }
                    _ = flush_tick.tick() => {
                        node.run_flush_pass().await;
                    }
                    request = queue.recv() => {
                        match request {
                            Some(ReorgRequest::Rescore { tag_id, blob_id, score, node_id, user_score }) => {
                                node.execute_rescore(tag_id, blob_id, score, node_id, user_score).await;
                            }
                            Some(ReorgRequest::PressureHint) => {
                                node.run_reorganization_pass().await;
                            }
                            None => break,
                        }
                    }
                }
            }
        })
    }

    /// One reorganization pass: plan demotions for overloaded targets and
    /// promotions for hot misplaced blobs, then execute the plan with a
    /// bounded number of concurrent moves.
    pub(crate) async fn run_reorganization_pass(&self) {
        let config = &self.config().reorganizer;
        let mut planned: Vec<PlannedMove> = Vec::new();

        for target in &self.targets {
            TargetUtilization {
                target: target.id,
                capacity: target.capacity,
                remaining: target.allocator.remaining(),
            }
            .emit();
            if target.occupancy() <= config.evict_threshold {
                continue;
            }
            let over_budget = {
                let used = target.capacity - target.allocator.remaining();
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let threshold_bytes = (config.evict_threshold * target.capacity as f64) as u64;
                used.saturating_sub(threshold_bytes)
            };
            planned.extend(self.plan_evictions(target.id, target.base_score(), over_budget).await);
        }

        planned.extend(self.plan_promotions().await);

        if planned.is_empty() {
            return;
        }
        debug!(moves = planned.len(), "Executing reorganization plan.");

        let mut inflight = FuturesUnordered::new();
        let mut queue = planned.into_iter();
        loop {
            while inflight.len() < config.max_inflight {
                match queue.next() {
                    Some(request) => inflight.push(self.execute_move(request)),
                    None => break,
                }
            }
            if inflight.next().await.is_none() {
                break;
            }
        }
    }

    /// Picks the coldest blobs holding bytes on `target` until enough bytes
    /// are planned to bring it back under its threshold.
    async fn plan_evictions(
        &self,
        target: TargetId,
        target_rank: f64,
        over_budget: u64,
    ) -> Vec<PlannedMove> {
        let half_life = self.config().reorganizer.recency_half_life();
        let now = Instant::now();

        let mut candidates = Vec::new();
        for blob in self.metadata.iter_blobs() {
            let info = blob.info.read().await;
            let resident: u64 = info
                .buffers
                .iter()
                .filter(|b| b.target == target)
                .map(|b| b.size)
                .sum();
            if resident == 0 {
                continue;
            }
            let age = now.saturating_duration_since(blob.last_access.load());
            let recency = 0.5_f64.powf(age.as_secs_f64() / half_life.as_secs_f64().max(f64::EPSILON));
            let weight = f64::from(info.score) * recency;
            let tag_id = info.tag_id;
            drop(info);
            candidates.push((weight, resident, tag_id, blob));
        }

        candidates.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        let mut planned = Vec::new();
        let mut freed = 0u64;
        for (_, resident, tag_id, blob) in candidates {
            if freed >= over_budget {
                break;
            }
            freed += resident;
            planned.push(PlannedMove::Demote {
                tag_id,
                blob,
                below: target_rank,
            });
        }
        planned
    }

    /// Finds blobs whose score clears the promote threshold but whose bytes
    /// sit below the tier that score deserves.
    async fn plan_promotions(&self) -> Vec<PlannedMove> {
        let threshold = self.config().reorganizer.promote_threshold;
        let best_rank = self
            .targets
            .iter()
            .map(|t| t.base_score())
            .fold(0.0_f64, f64::max);

        let mut planned = Vec::new();
        for blob in self.metadata.iter_blobs() {
            let info = blob.info.read().await;
            if info.score < threshold || info.buffers.is_empty() {
                continue;
            }
            let misplaced = info.buffers.iter().any(|b| {
                self.find_target(b.target)
                    .is_some_and(|t| t.base_score() < best_rank)
            });
            let tag_id = info.tag_id;
            drop(info);
            if misplaced {
                planned.push(PlannedMove::Promote { blob });
            }
        }
        planned
    }

    async fn execute_move(&self, request: PlannedMove) {
        match request {
            PlannedMove::Demote { tag_id, blob, below } => {
                let allowed: HashSet<TargetId> = self
                    .targets
                    .iter()
                    .filter(|t| t.base_score() < below)
                    .map(|t| t.id)
                    .collect();

                match self.migrate_buffers(&blob, &allowed).await {
                    Ok(moved) => ReorganizationComplete { moved }.emit(),
                    Err(CoreError::InsufficientCapacity { .. }) => {
                        self.evict_if_transient(tag_id, &blob).await;
                    }
                    Err(error) => {
                        warn!(%error, "Demotion failed; blob keeps its current buffers.");
                    }
                }
            }
            PlannedMove::Promote { blob } => {
                // Pull the whole blob above its slowest current tier; if the
                // faster tiers cannot hold it, it stays where it is.
                let lowest_rank = {
                    let info = blob.info.read().await;
                    info.buffers
                        .iter()
                        .filter_map(|b| self.find_target(b.target))
                        .map(|t| t.base_score())
                        .fold(f64::MAX, f64::min)
                };
                let allowed: HashSet<TargetId> = self
                    .targets
                    .iter()
                    .filter(|t| t.base_score() > lowest_rank)
                    .map(|t| t.id)
                    .collect();
                if allowed.is_empty() {
                    return;
                }
                match self.migrate_buffers(&blob, &allowed).await {
                    Ok(moved) => ReorganizationComplete { moved }.emit(),
                    Err(error) => {
                        debug!(%error, "Promotion skipped; blob keeps its current buffers.");
                    }
                }
            }
        }
    }

    /// Destroys a blob displaced from a full hierarchy, but only when its
    /// owning tag opted into eviction.
    async fn evict_if_transient(&self, tag_id: TagId, blob: &Arc<Blob>) {
        let transient = match self.metadata.find_tag(tag_id) {
            Some(tag) => tag.info.read().await.flags.contains(TagFlags::TRANSIENT),
            None => false,
        };
        if !transient {
            debug!(?tag_id, "No lower tier has room; blob stays put.");
            return;
        }
        let blob_id = blob.info.read().await.id;
        if let Err(error) = self.destroy_blob(tag_id, blob_id, BlobFlags::default()).await {
            warn!(%error, ?blob_id, "Eviction failed.");
        } else {
            info!(?blob_id, "Evicted blob from a transient tag under pressure.");
        }
    }

    /// Executes an explicit rescore/migration request.
    pub(crate) async fn execute_rescore(
        &self,
        tag_id: TagId,
        blob_id: BlobId,
        score: f32,
        node_id: NodeId,
        user_score: bool,
    ) {
        let Some(blob) = self.metadata.find_blob(blob_id) else {
            debug!(?blob_id, "Rescore target vanished.");
            return;
        };

        let (current_node, staged) = {
            let mut info = blob.info.write().await;
            if user_score {
                info.score = score.clamp(0.0, 1.0);
                info.user_score_stationary = true;
            } else if !info.user_score_stationary {
                info.score = score.clamp(0.0, 1.0);
            }
            (info.id.node, info.flags.contains(BlobFlags::DID_STAGE_IN))
        };

        // Staged pages stay with their bucket's stager; only their tier can
        // change, not their home.
        if node_id != current_node && !staged && self.find_stager(tag_id).is_none() {
            if let Err(error) = self.migrate_to_node(tag_id, &blob, node_id).await {
                warn!(%error, ?blob_id, "Node migration abandoned.");
            }
            return;
        }

        let score = blob.info.read().await.score;
        let allowed = self.targets_for_score(f64::from(score));
        match self.migrate_buffers(&blob, &allowed).await {
            Ok(moved) => ReorganizationComplete { moved }.emit(),
            Err(error) => warn!(%error, ?blob_id, "Rescore migration abandoned."),
        }
    }

    /// The targets a blob of the given score may occupy: the tier matching
    /// its score band, plus everything below it.
    fn targets_for_score(&self, score: f64) -> HashSet<TargetId> {
        let mut ranks: Vec<f64> = self.targets.iter().map(|t| t.base_score()).collect();
        ranks.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
        ranks.dedup();

        let tiers = ranks.len().max(1);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let tier = (((1.0 - score.clamp(0.0, 1.0)) * tiers as f64) as usize).min(tiers - 1);
        let ceiling = ranks[tier];

        self.targets
            .iter()
            .filter(|t| t.base_score() <= ceiling)
            .map(|t| t.id)
            .collect()
    }

    /// Moves a blob's bytes onto the allowed targets: copy everything to a
    /// fresh schema, then swap the buffer list under the blob's write lock.
    /// A blob modified during the copy keeps its old buffers, as does any
    /// failure along the way.
    ///
    /// Returns whether the swap happened.
    pub(crate) async fn migrate_buffers(
        &self,
        blob: &Arc<Blob>,
        allowed: &HashSet<TargetId>,
    ) -> Result<bool, CoreError> {
        let (data, observed_mod_count) = {
            let info = blob.info.read().await;
            let already_placed = info.buffers.iter().all(|b| allowed.contains(&b.target));
            if already_placed || info.buffers.is_empty() {
                return Ok(false);
            }
            let data = self.read_range(&info, 0, 0).await?;
            (data, info.mod_count)
        };

        let new_buffers = self.place_and_write_among(data, allowed).await?;

        let old_buffers = {
            let mut info = blob.info.write().await;
            if info.mod_count != observed_mod_count {
                drop(info);
                self.free_buffers(&new_buffers);
                debug!("Blob changed during reorganization; move abandoned.");
                return Ok(false);
            }
            std::mem::replace(&mut info.buffers, new_buffers)
        };

        self.free_buffers(&old_buffers);
        Ok(true)
    }

    /// Moves a blob's home to another node: the new node adopts the bytes
    /// under a fresh id, the tag's name binding and membership swap over,
    /// and the old id becomes a tombstone forwarding to the new one for one
    /// reorganizer epoch.
    pub(crate) async fn migrate_to_node(
        &self,
        tag_id: TagId,
        blob: &Arc<Blob>,
        node_id: NodeId,
    ) -> Result<bool, CoreError> {
        let (old_id, name, data, score, stationary, observed_mod_count) = {
            let info = blob.info.read().await;
            let data = self.read_range(&info, 0, 0).await?;
            (
                info.id,
                info.name.clone(),
                data,
                info.score,
                info.user_score_stationary,
                info.mod_count,
            )
        };

        let response = self
            .transport
            .send(
                node_id,
                Request::AdoptBlob {
                    tag_id,
                    name: name.clone(),
                    data: data.to_vec(),
                    score,
                    stationary,
                },
            )
            .await
            .map_err(|error| CoreError::invalid_argument(error.to_string()))?;
        let new_id = match response {
            Response::BlobId(id) => id,
            Response::Error(payload) => {
                return Err(CoreError::invalid_argument(payload.message));
            }
            other => {
                return Err(CoreError::invalid_argument(format!(
                    "unexpected adoption response: {other:?}"
                )));
            }
        };

        let (old_buffers, old_size) = {
            let mut info = blob.info.write().await;
            if info.mod_count != observed_mod_count {
                drop(info);
                // The copy is stale; ask the adopter to drop it.
                let _ = self
                    .transport
                    .send(
                        node_id,
                        Request::DestroyBlob {
                            tag_id,
                            blob_id: new_id,
                            flags: BlobFlags::KEEP_IN_TAG,
                        },
                    )
                    .await;
                return Ok(false);
            }
            let buffers = std::mem::take(&mut info.buffers);
            let size = info.blob_size;
            info.blob_size = 0;
            (buffers, size)
        };

        self.free_buffers(&old_buffers);
        self.metadata.erase_blob(old_id, tag_id, &name);
        self.metadata.insert_tombstone(old_id, new_id);

        // The adopter's write already grew the tag's size; the departure
        // settles it back.
        self.apply_tag_size_delta(tag_id, -(old_size as i64)).await;
        self.rebind_blob_home(tag_id, &name, old_id, new_id).await;

        ReorganizationComplete { moved: true }.emit();
        Ok(true)
    }

    /// Points the tag's name binding and membership at a migrated blob's
    /// new id, on the tag's home node.
    async fn rebind_blob_home(&self, tag_id: TagId, name: &str, old_id: BlobId, new_id: BlobId) {
        if tag_id.node != self.node_id() {
            let request = Request::RebindBlobName {
                tag_id,
                name: name.to_string(),
                old_id,
                new_id,
            };
            if let Err(error) = self.transport.send(tag_id.node, request).await {
                error!(%error, ?tag_id, "Failed to rebind migrated blob name.");
            }
            return;
        }
        self.rebind_blob_local(tag_id, name, old_id, new_id).await;
    }

    pub(crate) async fn rebind_blob_local(
        &self,
        tag_id: TagId,
        name: &str,
        old_id: BlobId,
        new_id: BlobId,
    ) {
        self.metadata.bind_blob_name(tag_id, name, new_id);
        if let Some(tag) = self.metadata.find_tag(tag_id) {
            let mut info = tag.info.write().await;
            match info.blob_ids.iter().position(|id| *id == old_id) {
                Some(index) => info.blob_ids[index] = new_id,
                None => info.blob_ids.push(new_id),
            }
        }
    }

    /// Adopts a migrated blob: a fresh local id, the bytes placed locally.
    pub(crate) async fn adopt_blob(
        &self,
        tag_id: TagId,
        name: &str,
        data: Bytes,
        score: f32,
        stationary: bool,
    ) -> Result<BlobId, CoreError> {
        let (id, blob) = self.metadata.emplace_blob_entity(tag_id, name);
        self.commit_write(tag_id, &blob, 0, data, score, BlobFlags::REPLACE)
            .await?;
        if stationary {
            blob.info.write().await.user_score_stationary = true;
        }
        Ok(id)
    }

    /// One flush pass: stage out every staged blob whose bytes moved since
    /// its last flush. Failures are logged and retried on the next pass.
    pub(crate) async fn run_flush_pass(&self) {
        for blob in self.metadata.iter_blobs() {
            let (tag_id, name, mod_count, data) = {
                let info = blob.info.read().await;
                if info.mod_count == info.flushed_mod_count {
                    continue;
                }
                let Some(_) = self.find_stager(info.tag_id) else {
                    continue;
                };
                match self.read_range(&info, 0, 0).await {
                    Ok(data) => (info.tag_id, info.name.clone(), info.mod_count, data),
                    Err(error) => {
                        error!(%error, blob = %info.name, "Failed to read blob for flushing.");
                        continue;
                    }
                }
            };

            let Some(stager) = self.find_stager(tag_id) else {
                continue;
            };
            if let Err(error) = stager.stage_out(&name, &data).await {
                error!(%error, blob = %name, "Stage-out failed; will retry next pass.");
                continue;
            }

            let mut info = blob.info.write().await;
            if info.flushed_mod_count < mod_count {
                info.flushed_mod_count = mod_count;
            }
            BlobFlushed {
                bytes: data.len() as u64,
            }
            .emit();
        }
    }

    /// Forces a flush pass; used by tests and by graceful shutdown.
    pub async fn flush_staged(&self) {
        self.run_flush_pass().await;
    }
}
