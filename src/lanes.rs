//! Lane sharding: serializing operations per entity.
//!
//! Work enters the engine through lanes. Each lane is a single-consumer
//! queue drained by one worker task, so two operations sharded to the same
//! lane execute in submission order; lanes run in parallel with each other.
//! Blob operations shard by blob id (or by the hashed `(tag, name)` key
//! before an id exists), tag operations by tag id, so all mutations of one
//! entity serialize on one lane and a put followed by a get from the same
//! caller observes the put.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::node::Node;
use crate::rpc::{ErrorKind, ErrorPayload, Request, Response};

struct Job {
    request: Request,
    reply: Option<oneshot::Sender<Response>>,
}

/// A set of lane workers around one node.
pub struct LaneSet {
    senders: Vec<mpsc::UnboundedSender<Job>>,
}

impl LaneSet {
    /// Spawns `lanes` workers over the node. Workers exit when the lane
    /// set is dropped or the node shuts down.
    pub fn spawn(node: Arc<Node>) -> Self {
        let lanes = node.config().lanes;
        let mut senders = Vec::with_capacity(lanes);

        for lane in 0..lanes {
            let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
            let node = Arc::clone(&node);
            let mut shutdown = node.shutdown_rx.clone();

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                debug!(lane, "Lane worker shutting down.");
                                break;
                            }
                        }
                        job = rx.recv() => {
                            let Some(job) = job else { break };
                            let response = node.handle(job.request).await;
                            if let Some(reply) = job.reply {
                                // The caller may have given up waiting.
                                let _ = reply.send(response);
                            }
                        }
                    }
                }

                // Work still queued at shutdown is cancelled, not executed;
                // callers holding a reply channel hear about it.
                while let Ok(job) = rx.try_recv() {
                    if let Some(reply) = job.reply {
                        let _ = reply.send(Response::Error(ErrorPayload {
                            kind: ErrorKind::Cancelled,
                            message: "node is shutting down".to_string(),
                        }));
                    }
                }
            });
            senders.push(tx);
        }

        Self { senders }
    }

    pub fn lanes(&self) -> usize {
        self.senders.len()
    }

    fn lane_for(&self, request: &Request) -> usize {
        usize::try_from(request.shard_key() % self.senders.len() as u64)
            .expect("lane index fits in usize")
    }

    /// Submits a request and returns a receiver for its response. Awaiting
    /// the receiver gives the caller the causal ordering guarantee: the
    /// operation has fully completed on its lane.
    pub fn submit(&self, request: Request) -> oneshot::Receiver<Response> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let lane = self.lane_for(&request);
        let job = Job {
            request,
            reply: Some(reply_tx),
        };
        if self.senders[lane].send(job).is_err() {
            debug!(lane, "Lane worker is gone; request dropped.");
        }
        reply_rx
    }

    /// Submits a fire-and-forget request: no response channel, errors are
    /// logged by the executing side and dropped.
    pub fn submit_detached(&self, request: Request) {
        debug_assert!(request.is_fire_and_forget());
        let lane = self.lane_for(&request);
        let job = Job {
            request,
            reply: None,
        };
        if self.senders[lane].send(job).is_err() {
            debug!(lane, "Lane worker is gone; request dropped.");
        }
    }
}
