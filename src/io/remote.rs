//! Remote-target driver: forwards I/O to the node owning the target.

use std::sync::Arc;

use bytes::Bytes;
use snafu::ResultExt;

use super::{DriverError, RemoteUnreachableSnafu};
use crate::id::TargetId;
use crate::rpc::{NodeTransport, Request, Response};

/// A target that lives on another node.
///
/// The driver carries no state beyond the target id and the transport; the
/// owning node performs the actual device access and bounds checking.
pub struct RemoteDriver {
    target: TargetId,
    transport: Arc<dyn NodeTransport>,
}

impl std::fmt::Debug for RemoteDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteDriver")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

impl RemoteDriver {
    pub fn new(target: TargetId, transport: Arc<dyn NodeTransport>) -> Self {
        Self { target, transport }
    }

    pub fn target(&self) -> TargetId {
        self.target
    }

    pub async fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), DriverError> {
        let response = self
            .transport
            .send(
                self.target.node,
                Request::TargetWrite {
                    target: self.target,
                    offset,
                    data: data.to_vec(),
                },
            )
            .await
            .context(RemoteUnreachableSnafu {
                target: self.target,
            })?;
        match response {
            Response::Unit => Ok(()),
            other => Err(remote_fault(self.target, &other)),
        }
    }

    pub async fn read_at(&self, offset: u64, len: u64) -> Result<Bytes, DriverError> {
        let response = self
            .transport
            .send(
                self.target.node,
                Request::TargetRead {
                    target: self.target,
                    offset,
                    len,
                },
            )
            .await
            .context(RemoteUnreachableSnafu {
                target: self.target,
            })?;
        match response {
            Response::Data(data) => Ok(Bytes::from(data)),
            other => Err(remote_fault(self.target, &other)),
        }
    }

    pub async fn flush(&self) -> Result<(), DriverError> {
        let response = self
            .transport
            .send(
                self.target.node,
                Request::TargetFlush {
                    target: self.target,
                },
            )
            .await
            .context(RemoteUnreachableSnafu {
                target: self.target,
            })?;
        match response {
            Response::Unit => Ok(()),
            other => Err(remote_fault(self.target, &other)),
        }
    }
}

fn remote_fault(target: TargetId, response: &Response) -> DriverError {
    let message = match response {
        Response::Error(payload) => payload.message.clone(),
        other => format!("unexpected response variant: {other:?}"),
    };
    DriverError::RemoteFault { target, message }
}
