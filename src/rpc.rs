//! The node-facing request surface.
//!
//! Every engine operation has exactly one serializable request form and one
//! response form; [`Node::handle`] dispatches them. A request addressed to
//! an entity whose home is another node is forwarded through the
//! [`NodeTransport`] before it touches the local engine, so callers never
//! need to know where an id lives.
//!
//! The transport itself is a collaborator seam: production deployments plug
//! in their RPC stack, tests and single-process setups use
//! [`MemoryTransport`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use snafu::Snafu;

use crate::engine::tag::TagCreateOptions;
use crate::engine::CoreError;
use crate::id::{
    BlobFlags, BlobId, BufferInfo, NodeId, TagFlags, TagId, TargetId, UpdateSizeMode,
};
use crate::node::Node;

#[derive(Debug, Snafu)]
pub enum TransportError {
    #[snafu(display("node {} is not reachable", node))]
    Unreachable { node: NodeId },

    #[snafu(display("node {} has shut down", node))]
    Gone { node: NodeId },
}

/// Node-to-node forwarding. Implementations deliver a request to the named
/// node and return its response.
#[async_trait]
pub trait NodeTransport: Send + Sync + fmt::Debug {
    async fn send(&self, node: NodeId, request: Request) -> Result<Response, TransportError>;
}

/// One request per engine operation.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Request {
    // Tag operations.
    GetOrCreateTag {
        name: String,
        owns_blobs: bool,
        backend_size: u64,
        flags: TagFlags,
        params: Option<Vec<u8>>,
    },
    GetTagId {
        name: String,
    },
    GetTagName {
        tag_id: TagId,
    },
    RenameTag {
        tag_id: TagId,
        new_name: String,
    },
    DestroyTag {
        tag_id: TagId,
    },
    TagAddBlob {
        tag_id: TagId,
        blob_id: BlobId,
    },
    TagRemoveBlob {
        tag_id: TagId,
        blob_id: BlobId,
    },
    TagClearBlobs {
        tag_id: TagId,
    },
    TagGetSize {
        tag_id: TagId,
    },
    TagUpdateSize {
        tag_id: TagId,
        update: i64,
        mode: UpdateSizeMode,
    },
    TagGetContainedBlobIds {
        tag_id: TagId,
    },
    TagAdjustInternalSize {
        tag_id: TagId,
        delta: i64,
    },
    Append {
        tag_id: TagId,
        data: Vec<u8>,
        page_size: u64,
        score: f32,
    },

    // Blob operations.
    GetOrCreateBlobId {
        tag_id: TagId,
        name: String,
    },
    GetBlobId {
        tag_id: TagId,
        name: String,
    },
    GetBlobName {
        tag_id: TagId,
        blob_id: BlobId,
    },
    GetBlobSize {
        tag_id: TagId,
        blob_id: BlobId,
    },
    GetBlobScore {
        tag_id: TagId,
        blob_id: BlobId,
    },
    GetBlobBuffers {
        tag_id: TagId,
        blob_id: BlobId,
    },
    BlobHasTag {
        tag_id: TagId,
        blob_id: BlobId,
        tag: TagId,
    },
    TagBlob {
        tag_id: TagId,
        blob_id: BlobId,
        tag: TagId,
    },
    PutBlob {
        tag_id: TagId,
        name: String,
        blob_id: Option<BlobId>,
        offset: u64,
        data: Vec<u8>,
        score: f32,
        flags: BlobFlags,
    },
    GetBlob {
        tag_id: TagId,
        name: String,
        blob_id: Option<BlobId>,
        offset: u64,
        len: u64,
    },
    TruncateBlob {
        tag_id: TagId,
        blob_id: BlobId,
        size: u64,
    },
    DestroyBlob {
        tag_id: TagId,
        blob_id: BlobId,
        flags: BlobFlags,
    },
    RenameBlob {
        tag_id: TagId,
        blob_id: BlobId,
        new_name: String,
    },
    ReorganizeBlob {
        tag_id: TagId,
        blob_id: BlobId,
        score: f32,
        node_id: NodeId,
        user_score: bool,
    },

    // Migration internals: adoption on the receiving node, name rebinding
    // on the tag's home node.
    AdoptBlob {
        tag_id: TagId,
        name: String,
        data: Vec<u8>,
        score: f32,
        stationary: bool,
    },
    RebindBlobName {
        tag_id: TagId,
        name: String,
        old_id: BlobId,
        new_id: BlobId,
    },

    // Staging.
    UnregisterStager {
        tag_id: TagId,
    },
    StageIn {
        tag_id: TagId,
        blob_name: String,
        score: f32,
    },
    StageOut {
        tag_id: TagId,
        blob_name: String,
        data: Vec<u8>,
    },

    // Raw target I/O, addressed to the device's owning node.
    TargetRead {
        target: TargetId,
        offset: u64,
        len: u64,
    },
    TargetWrite {
        target: TargetId,
        offset: u64,
        data: Vec<u8>,
    },
    TargetFlush {
        target: TargetId,
    },

    // Stats polling.
    PollBlobStats,
    PollTargetStats,
    PollTagStats,
}

impl Request {
    /// The node that should execute this request. Name-keyed blob
    /// operations run on the tag's home node so every peer resolves the
    /// same namespace; id-keyed operations run on the id's home node; raw
    /// target I/O runs where the device is.
    pub fn home_node(&self, local: NodeId) -> NodeId {
        match self {
            Request::GetOrCreateTag { .. }
            | Request::GetTagId { .. }
            | Request::PollBlobStats
            | Request::PollTargetStats
            | Request::PollTagStats => local,

            Request::GetTagName { tag_id }
            | Request::RenameTag { tag_id, .. }
            | Request::DestroyTag { tag_id }
            | Request::TagAddBlob { tag_id, .. }
            | Request::TagRemoveBlob { tag_id, .. }
            | Request::TagClearBlobs { tag_id }
            | Request::TagGetSize { tag_id }
            | Request::TagUpdateSize { tag_id, .. }
            | Request::TagGetContainedBlobIds { tag_id }
            | Request::TagAdjustInternalSize { tag_id, .. }
            | Request::Append { tag_id, .. }
            | Request::GetOrCreateBlobId { tag_id, .. }
            | Request::GetBlobId { tag_id, .. }
            | Request::RebindBlobName { tag_id, .. }
            | Request::UnregisterStager { tag_id }
            | Request::StageIn { tag_id, .. }
            | Request::StageOut { tag_id, .. } => tag_id.node,

            Request::GetBlobName { blob_id, .. }
            | Request::GetBlobSize { blob_id, .. }
            | Request::GetBlobScore { blob_id, .. }
            | Request::GetBlobBuffers { blob_id, .. }
            | Request::BlobHasTag { blob_id, .. }
            | Request::TagBlob { blob_id, .. }
            | Request::TruncateBlob { blob_id, .. }
            | Request::DestroyBlob { blob_id, .. }
            | Request::RenameBlob { blob_id, .. }
            | Request::ReorganizeBlob { blob_id, .. } => blob_id.node,

            Request::PutBlob {
                tag_id, blob_id, ..
            }
            | Request::GetBlob {
                tag_id, blob_id, ..
            } => blob_id.map_or(tag_id.node, |id| id.node),

            Request::AdoptBlob { .. } => local,

            Request::TargetRead { target, .. }
            | Request::TargetWrite { target, .. }
            | Request::TargetFlush { target } => target.node,
        }
    }

    /// Whether the caller expects no response beyond delivery.
    pub fn is_fire_and_forget(&self) -> bool {
        matches!(
            self,
            Request::TagAddBlob { .. }
                | Request::TagUpdateSize { .. }
                | Request::TagAdjustInternalSize { .. }
                | Request::ReorganizeBlob { .. }
        )
    }

    /// The id the lane dispatcher shards on: blob operations serialize per
    /// blob, everything else per tag.
    pub fn shard_key(&self) -> u64 {
        match self {
            Request::GetOrCreateTag { name, .. } | Request::GetTagId { name } => {
                hash_bucket_name(name)
            }

            Request::GetBlobName { blob_id, .. }
            | Request::GetBlobSize { blob_id, .. }
            | Request::GetBlobScore { blob_id, .. }
            | Request::GetBlobBuffers { blob_id, .. }
            | Request::BlobHasTag { blob_id, .. }
            | Request::TagBlob { blob_id, .. }
            | Request::TruncateBlob { blob_id, .. }
            | Request::DestroyBlob { blob_id, .. }
            | Request::RenameBlob { blob_id, .. }
            | Request::ReorganizeBlob { blob_id, .. } => blob_id.unique,

            Request::GetOrCreateBlobId { tag_id, name }
            | Request::GetBlobId { tag_id, name }
            | Request::AdoptBlob { tag_id, name, .. }
            | Request::RebindBlobName { tag_id, name, .. }
            | Request::StageIn {
                tag_id,
                blob_name: name,
                ..
            }
            | Request::StageOut {
                tag_id,
                blob_name: name,
                ..
            } => u64::from(hash_blob_name(*tag_id, name)),

            Request::PutBlob {
                tag_id,
                name,
                blob_id,
                ..
            }
            | Request::GetBlob {
                tag_id,
                name,
                blob_id,
                ..
            } => blob_id.map_or_else(|| u64::from(hash_blob_name(*tag_id, name)), |id| id.unique),

            Request::GetTagName { tag_id }
            | Request::RenameTag { tag_id, .. }
            | Request::DestroyTag { tag_id }
            | Request::TagAddBlob { tag_id, .. }
            | Request::TagRemoveBlob { tag_id, .. }
            | Request::TagClearBlobs { tag_id }
            | Request::TagGetSize { tag_id }
            | Request::TagUpdateSize { tag_id, .. }
            | Request::TagGetContainedBlobIds { tag_id }
            | Request::TagAdjustInternalSize { tag_id, .. }
            | Request::Append { tag_id, .. }
            | Request::UnregisterStager { tag_id } => tag_id.unique,

            Request::TargetRead { target, .. }
            | Request::TargetWrite { target, .. }
            | Request::TargetFlush { target } => u64::from(target.device),

            Request::PollBlobStats | Request::PollTargetStats | Request::PollTagStats => 0,
        }
    }
}

/// Shift-mixed polynomial hash over a tag name.
pub fn hash_bucket_name(name: &str) -> u64 {
    let mut hash: u32 = 0;
    for (i, byte) in name.bytes().enumerate() {
        #[allow(clippy::cast_possible_truncation)]
        let shift = (i % 4) as u32;
        hash = hash
            .wrapping_mul(31)
            .wrapping_add(u32::from(byte) << shift);
    }
    u64::from(hash)
}

/// Hash of a blob name inside its tag's namespace.
pub fn hash_blob_name(tag_id: TagId, name: &str) -> u32 {
    #[allow(clippy::cast_possible_truncation)]
    let name_hash = hash_bucket_name(name) as u32;
    #[allow(clippy::cast_possible_truncation)]
    let tag_hash = (tag_id.unique ^ u64::from(tag_id.node)) as u32;
    name_hash ^ tag_hash
}

/// Serializable error form crossing the rpc boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    InsufficientCapacity,
    TierFault,
    Cancelled,
    StagerUnavailable,
    InvalidArgument,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorPayload {
    /// Rebuilds an engine error from its wire form. Error kinds survive the
    /// round trip exactly; structured sources collapse into the carried
    /// message where a variant has nowhere to hold them.
    pub fn into_core_error(self) -> CoreError {
        match self.kind {
            ErrorKind::NotFound => CoreError::NotFound {
                what: "remote entity",
            },
            ErrorKind::AlreadyExists => CoreError::AlreadyExists {
                what: "remote entity",
            },
            ErrorKind::InsufficientCapacity => CoreError::InsufficientCapacity {
                source: crate::placement::PlacementError::InsufficientCapacity {
                    size: 0,
                    usable: 0,
                    targets: 0,
                },
            },
            ErrorKind::TierFault => CoreError::TierFault {
                source: crate::io::DriverError::RemoteFault {
                    target: TargetId {
                        node: 0,
                        device: 0,
                        slab: 0,
                    },
                    message: self.message,
                },
            },
            ErrorKind::Cancelled => CoreError::Cancelled,
            ErrorKind::StagerUnavailable => CoreError::StagerUnavailable {
                source: std::io::Error::new(std::io::ErrorKind::Other, self.message),
            },
            ErrorKind::InvalidArgument => CoreError::InvalidArgument {
                reason: self.message,
            },
        }
    }
}

impl From<&CoreError> for ErrorPayload {
    fn from(error: &CoreError) -> Self {
        let kind = match error {
            CoreError::NotFound { .. } => ErrorKind::NotFound,
            CoreError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            CoreError::InsufficientCapacity { .. } => ErrorKind::InsufficientCapacity,
            CoreError::TierFault { .. } => ErrorKind::TierFault,
            CoreError::Cancelled => ErrorKind::Cancelled,
            CoreError::StagerUnavailable { .. } => ErrorKind::StagerUnavailable,
            CoreError::InvalidArgument { .. } => ErrorKind::InvalidArgument,
        };
        ErrorPayload {
            kind,
            message: error.to_string(),
        }
    }
}

/// Per-blob statistics snapshot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlobStats {
    pub id: BlobId,
    pub tag_id: TagId,
    pub name: String,
    pub size: u64,
    pub score: f32,
    pub mod_count: u64,
    pub fragment_count: usize,
}

/// Per-target statistics snapshot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TargetStats {
    pub id: TargetId,
    pub capacity: u64,
    pub remaining: u64,
    pub bandwidth: f64,
    pub latency: f64,
    pub score: f64,
}

/// Per-tag statistics snapshot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TagStats {
    pub id: TagId,
    pub name: String,
    pub internal_size: u64,
    pub backend_size: u64,
    pub blob_count: usize,
}

/// One response per request form.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    Unit,
    TagId(TagId),
    BlobId(BlobId),
    Name(String),
    Size(u64),
    Score(f32),
    Bool(bool),
    Buffers(Vec<BufferInfo>),
    BlobIds(Vec<BlobId>),
    Blob { read: u64, data: Vec<u8> },
    Data(Vec<u8>),
    BlobStats(Vec<BlobStats>),
    TargetStats(Vec<TargetStats>),
    TagStats(Vec<TagStats>),
    Error(ErrorPayload),
}

impl Response {
    fn from_result<T>(result: Result<T, CoreError>, map: impl FnOnce(T) -> Response) -> Response {
        match result {
            Ok(value) => map(value),
            Err(error) => Response::Error(ErrorPayload::from(&error)),
        }
    }
}

impl Node {
    /// Executes a request, forwarding it first if its home is elsewhere.
    ///
    /// Blob ids that migrated away resolve through their tombstones before
    /// routing, so callers holding a stale id keep working for the epoch
    /// the tombstone lives.
    pub async fn handle(&self, request: Request) -> Response {
        let request = self.resolve_forwarding(request);

        let home = request.home_node(self.node_id());
        if home != self.node_id() {
            return match self.transport.send(home, request).await {
                Ok(response) => response,
                Err(error) => Response::Error(ErrorPayload {
                    kind: ErrorKind::NotFound,
                    message: error.to_string(),
                }),
            };
        }

        self.dispatch(request).await
    }

    /// Rewrites id-keyed requests whose blob id has a local tombstone.
    fn resolve_forwarding(&self, mut request: Request) -> Request {
        let blob_id = match &mut request {
            Request::GetBlobName { blob_id, .. }
            | Request::GetBlobSize { blob_id, .. }
            | Request::GetBlobScore { blob_id, .. }
            | Request::GetBlobBuffers { blob_id, .. }
            | Request::BlobHasTag { blob_id, .. }
            | Request::TagBlob { blob_id, .. }
            | Request::TruncateBlob { blob_id, .. }
            | Request::DestroyBlob { blob_id, .. }
            | Request::RenameBlob { blob_id, .. }
            | Request::ReorganizeBlob { blob_id, .. } => Some(blob_id),
            Request::PutBlob { blob_id, .. } | Request::GetBlob { blob_id, .. } => {
                blob_id.as_mut()
            }
            _ => None,
        };

        if let Some(blob_id) = blob_id {
            if let Some(forwarded) = self.metadata.resolve_tombstone(*blob_id) {
                *blob_id = forwarded;
            }
        }
        request
    }

    #[allow(clippy::too_many_lines)]
    async fn dispatch(&self, request: Request) -> Response {
        match request {
            Request::GetOrCreateTag {
                name,
                owns_blobs,
                backend_size,
                flags,
                params,
            } => {
                let opts = TagCreateOptions {
                    owns_blobs,
                    backend_size,
                    flags,
                    params,
                    ..TagCreateOptions::default()
                };
                Response::from_result(
                    self.get_or_create_tag(&name, opts).await,
                    Response::TagId,
                )
            }
            Request::GetTagId { name } => {
                Response::from_result(self.get_tag_id(&name), Response::TagId)
            }
            Request::GetTagName { tag_id } => {
                Response::from_result(self.get_tag_name(tag_id).await, Response::Name)
            }
            Request::RenameTag { tag_id, new_name } => {
                Response::from_result(self.rename_tag(tag_id, &new_name).await, |()| {
                    Response::Unit
                })
            }
            Request::DestroyTag { tag_id } => {
                Response::from_result(self.destroy_tag(tag_id).await, |()| Response::Unit)
            }
            Request::TagAddBlob { tag_id, blob_id } => {
                Response::from_result(self.tag_add_blob(tag_id, blob_id).await, |()| {
                    Response::Unit
                })
            }
            Request::TagRemoveBlob { tag_id, blob_id } => {
                Response::from_result(self.tag_remove_blob(tag_id, blob_id).await, |()| {
                    Response::Unit
                })
            }
            Request::TagClearBlobs { tag_id } => {
                Response::from_result(self.tag_clear_blobs(tag_id).await, |()| Response::Unit)
            }
            Request::TagGetSize { tag_id } => {
                Response::from_result(self.tag_get_size(tag_id).await, Response::Size)
            }
            Request::TagUpdateSize {
                tag_id,
                update,
                mode,
            } => Response::from_result(
                self.tag_update_size(tag_id, update, mode).await,
                |()| Response::Unit,
            ),
            Request::TagGetContainedBlobIds { tag_id } => Response::from_result(
                self.tag_get_contained_blob_ids(tag_id).await,
                Response::BlobIds,
            ),
            Request::TagAdjustInternalSize { tag_id, delta } => {
                self.apply_tag_size_delta(tag_id, delta).await;
                Response::Unit
            }
            Request::Append {
                tag_id,
                data,
                page_size,
                score,
            } => Response::from_result(
                self.append(tag_id, Bytes::from(data), page_size, score).await,
                |()| Response::Unit,
            ),

            Request::GetOrCreateBlobId { tag_id, name } => Response::from_result(
                self.get_or_create_blob_id(tag_id, &name).await,
                Response::BlobId,
            ),
            Request::GetBlobId { tag_id, name } => {
                Response::from_result(self.get_blob_id(tag_id, &name), Response::BlobId)
            }
            Request::GetBlobName { blob_id, .. } => {
                Response::from_result(self.get_blob_name(blob_id).await, Response::Name)
            }
            Request::GetBlobSize { blob_id, .. } => {
                Response::from_result(self.get_blob_size(blob_id).await, Response::Size)
            }
            Request::GetBlobScore { blob_id, .. } => {
                Response::from_result(self.get_blob_score(blob_id).await, Response::Score)
            }
            Request::GetBlobBuffers { blob_id, .. } => {
                Response::from_result(self.get_blob_buffers(blob_id).await, Response::Buffers)
            }
            Request::BlobHasTag { blob_id, tag, .. } => {
                Response::from_result(self.blob_has_tag(blob_id, tag).await, Response::Bool)
            }
            Request::TagBlob { blob_id, tag, .. } => {
                Response::from_result(self.tag_blob(blob_id, tag).await, |()| Response::Unit)
            }
            Request::PutBlob {
                tag_id,
                name,
                blob_id,
                offset,
                data,
                score,
                flags,
            } => Response::from_result(
                self.put_blob(tag_id, &name, blob_id, offset, Bytes::from(data), score, flags)
                    .await,
                Response::BlobId,
            ),
            Request::GetBlob {
                tag_id,
                name,
                blob_id,
                offset,
                len,
            } => Response::from_result(
                self.get_blob(tag_id, &name, blob_id, offset, len).await,
                |(read, data)| Response::Blob {
                    read,
                    data: data.to_vec(),
                },
            ),
            Request::TruncateBlob {
                tag_id,
                blob_id,
                size,
            } => Response::from_result(
                self.truncate_blob(tag_id, blob_id, size).await,
                |()| Response::Unit,
            ),
            Request::DestroyBlob {
                tag_id,
                blob_id,
                flags,
            } => Response::from_result(
                self.destroy_blob(tag_id, blob_id, flags).await,
                |()| Response::Unit,
            ),
            Request::RenameBlob {
                tag_id,
                blob_id,
                new_name,
            } => Response::from_result(
                self.rename_blob(tag_id, blob_id, &new_name).await,
                |()| Response::Unit,
            ),
            Request::ReorganizeBlob {
                tag_id,
                blob_id,
                score,
                node_id,
                user_score,
            } => Response::from_result(
                self.reorganize_blob(tag_id, blob_id, score, node_id, user_score),
                |()| Response::Unit,
            ),

            Request::AdoptBlob {
                tag_id,
                name,
                data,
                score,
                stationary,
            } => Response::from_result(
                self.adopt_blob(tag_id, &name, Bytes::from(data), score, stationary)
                    .await,
                Response::BlobId,
            ),
            Request::RebindBlobName {
                tag_id,
                name,
                old_id,
                new_id,
            } => {
                self.rebind_blob_local(tag_id, &name, old_id, new_id).await;
                Response::Unit
            }

            Request::UnregisterStager { tag_id } => {
                self.unregister_stager(tag_id);
                Response::Unit
            }
            Request::StageIn {
                tag_id,
                blob_name,
                score,
            } => {
                let Some(stager) = self.find_stager(tag_id) else {
                    return Response::Error(ErrorPayload {
                        kind: ErrorKind::NotFound,
                        message: "no stager is registered for the tag".to_string(),
                    });
                };
                Response::from_result(
                    stager.stage_in(self, tag_id, &blob_name, score).await,
                    |()| Response::Unit,
                )
            }
            Request::StageOut {
                tag_id,
                blob_name,
                data,
            } => {
                let Some(stager) = self.find_stager(tag_id) else {
                    return Response::Error(ErrorPayload {
                        kind: ErrorKind::NotFound,
                        message: "no stager is registered for the tag".to_string(),
                    });
                };
                Response::from_result(
                    stager.stage_out(&blob_name, &Bytes::from(data)).await,
                    |()| Response::Unit,
                )
            }

            Request::TargetRead {
                target,
                offset,
                len,
            } => match self.local_target_for_device(target.device) {
                Some(local) => match local.driver.read_at(offset, len).await {
                    Ok(data) => Response::Data(data.to_vec()),
                    Err(error) => {
                        Response::Error(ErrorPayload::from(&CoreError::TierFault {
                            source: error,
                        }))
                    }
                },
                None => Response::Error(ErrorPayload {
                    kind: ErrorKind::NotFound,
                    message: format!("no local device {}", target.device),
                }),
            },
            Request::TargetWrite {
                target,
                offset,
                data,
            } => match self.local_target_for_device(target.device) {
                Some(local) => match local.driver.write_at(offset, &data).await {
                    Ok(()) => Response::Unit,
                    Err(error) => {
                        Response::Error(ErrorPayload::from(&CoreError::TierFault {
                            source: error,
                        }))
                    }
                },
                None => Response::Error(ErrorPayload {
                    kind: ErrorKind::NotFound,
                    message: format!("no local device {}", target.device),
                }),
            },
            Request::TargetFlush { target } => match self.local_target_for_device(target.device)
            {
                Some(local) => match local.driver.flush().await {
                    Ok(()) => Response::Unit,
                    Err(error) => {
                        Response::Error(ErrorPayload::from(&CoreError::TierFault {
                            source: error,
                        }))
                    }
                },
                None => Response::Error(ErrorPayload {
                    kind: ErrorKind::NotFound,
                    message: format!("no local device {}", target.device),
                }),
            },

            Request::PollBlobStats => Response::BlobStats(self.poll_blob_stats().await),
            Request::PollTargetStats => Response::TargetStats(self.poll_target_stats()),
            Request::PollTagStats => Response::TagStats(self.poll_tag_stats().await),
        }
    }

    /// Drops the stager registered for a tag, leaving resident blobs in
    /// place. Subsequent misses stay misses.
    pub fn unregister_stager(&self, tag_id: TagId) {
        self.stagers.write().remove(&tag_id);
    }

    /// Snapshot of every blob's metadata, for external observers.
    pub async fn poll_blob_stats(&self) -> Vec<BlobStats> {
        let mut stats = Vec::new();
        for blob in self.metadata.iter_blobs() {
            let info = blob.info.read().await;
            stats.push(BlobStats {
                id: info.id,
                tag_id: info.tag_id,
                name: info.name.clone(),
                size: info.blob_size,
                score: info.score,
                mod_count: info.mod_count,
                fragment_count: info.buffers.len(),
            });
        }
        stats
    }

    /// Snapshot of every target's capacity and scoring state.
    pub fn poll_target_stats(&self) -> Vec<TargetStats> {
        self.targets
            .iter()
            .map(|target| {
                let snapshot = target.snapshot();
                TargetStats {
                    id: target.id,
                    capacity: target.capacity,
                    remaining: snapshot.remaining,
                    bandwidth: target.bandwidth,
                    latency: target.latency,
                    score: snapshot.score,
                }
            })
            .collect()
    }

    /// Snapshot of every tag's sizes and membership count.
    pub async fn poll_tag_stats(&self) -> Vec<TagStats> {
        let mut stats = Vec::new();
        for tag in self.metadata.iter_tags() {
            let info = tag.info.read().await;
            stats.push(TagStats {
                id: info.id,
                name: info.name.clone(),
                internal_size: info.internal_size,
                backend_size: info.backend_size,
                blob_count: info.blob_ids.len(),
            });
        }
        stats
    }
}

/// In-process transport: a registry of nodes by id. The reference transport
/// for tests and single-process, multi-node setups.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    nodes: parking_lot::RwLock<HashMap<NodeId, Weak<Node>>>,
}

impl MemoryTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a node for delivery. Nodes are held weakly so a dropped
    /// node reads as gone rather than leaking.
    pub fn register(&self, node: &Arc<Node>) {
        self.nodes
            .write()
            .insert(node.node_id(), Arc::downgrade(node));
    }
}

#[async_trait]
impl NodeTransport for MemoryTransport {
    async fn send(&self, node: NodeId, request: Request) -> Result<Response, TransportError> {
        let target = self
            .nodes
            .read()
            .get(&node)
            .cloned()
            .ok_or(TransportError::Unreachable { node })?;
        let target = target.upgrade().ok_or(TransportError::Gone { node })?;
        Ok(target.handle(request).await)
    }
}

/// A transport for single-node deployments: every send fails as
/// unreachable, which surfaces misrouted requests instead of hiding them.
#[derive(Debug, Default)]
pub struct NullTransport;

#[async_trait]
impl NodeTransport for NullTransport {
    async fn send(&self, node: NodeId, _request: Request) -> Result<Response, TransportError> {
        Err(TransportError::Unreachable { node })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_hashes_are_stable_and_tag_scoped() {
        let tag_a = TagId { node: 0, unique: 1 };
        let tag_b = TagId { node: 0, unique: 2 };
        assert_eq!(hash_blob_name(tag_a, "x"), hash_blob_name(tag_a, "x"));
        assert_ne!(hash_blob_name(tag_a, "x"), hash_blob_name(tag_b, "x"));
    }

    #[test]
    fn blob_requests_route_to_the_blob_home() {
        let tag_id = TagId { node: 0, unique: 1 };
        let blob_id = BlobId { node: 3, unique: 9 };
        let request = Request::GetBlobSize { tag_id, blob_id };
        assert_eq!(request.home_node(0), 3);

        let by_name = Request::GetBlob {
            tag_id,
            name: "page".to_string(),
            blob_id: None,
            offset: 0,
            len: 0,
        };
        assert_eq!(by_name.home_node(5), 0);
    }

    #[test]
    fn fire_and_forget_covers_membership_and_size_updates() {
        let tag_id = TagId { node: 0, unique: 1 };
        let blob_id = BlobId { node: 0, unique: 2 };
        assert!(Request::TagAddBlob { tag_id, blob_id }.is_fire_and_forget());
        assert!(!Request::TagGetSize { tag_id }.is_fire_and_forget());
    }
}
