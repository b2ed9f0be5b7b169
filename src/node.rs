//! Node state: targets, metadata, stagers, and the background loop handle.
//!
//! One [`Node`] value holds everything a node knows. It is created at
//! startup, passed (behind an `Arc`) into every handler, and torn down
//! atomically by dropping it after shutdown. Nothing in the crate is a
//! process-wide singleton.

use std::sync::Arc;

use parking_lot::RwLock;
use snafu::{ResultExt, Snafu};
use tokio::sync::{mpsc, watch, Mutex};

use crate::config::{CoreConfig, DeviceConfig, DeviceKind};
use crate::id::{NodeId, TagId, TargetId};
use crate::io::{DriverError, FileDriver, RamDriver, RemoteDriver, TargetDriver};
use crate::metadata::MetadataStore;
use crate::placement::TargetSnapshot;
use crate::pool::BufferAllocator;
use crate::reorganizer::ReorgRequest;
use crate::rpc::NodeTransport;
use crate::stager::StagerKind;

/// How strongly occupancy discounts a target's placement score. Kept well
/// under 1.0 so a busy fast tier still outranks an idle slow one until it
/// is actually full.
const PRESSURE_WEIGHT: f64 = 0.3;

#[derive(Debug, Snafu)]
pub enum NodeError {
    #[snafu(display("failed to initialize target {}: {}", target, source))]
    TargetInit {
        target: TargetId,
        source: DriverError,
    },
}

/// One storage target: driver, allocator, and scoring inputs.
#[derive(Debug)]
pub struct Target {
    pub id: TargetId,
    pub capacity: u64,
    pub bandwidth: f64,
    pub latency: f64,
    base_score: f64,
    pub driver: TargetDriver,
    pub allocator: BufferAllocator,
}

impl Target {
    /// Static tier rank derived from bandwidth and latency, in (0, 1].
    pub fn base_score(&self) -> f64 {
        self.base_score
    }

    pub fn occupancy(&self) -> f64 {
        1.0 - self.allocator.remaining() as f64 / self.capacity as f64
    }

    /// Point-in-time view for placement: the static rank discounted by
    /// current occupancy.
    pub fn snapshot(&self) -> TargetSnapshot {
        let remaining = self.allocator.remaining();
        let occupancy = 1.0 - remaining as f64 / self.capacity as f64;
        TargetSnapshot {
            id: self.id,
            capacity: self.capacity,
            remaining,
            alignment: self.allocator.alignment(),
            score: self.base_score * (1.0 - PRESSURE_WEIGHT * occupancy),
        }
    }
}

/// Per-node engine state.
pub struct Node {
    node_id: NodeId,
    config: CoreConfig,
    pub(crate) metadata: MetadataStore,
    pub(crate) targets: Vec<Arc<Target>>,
    pub(crate) stagers: RwLock<std::collections::HashMap<TagId, Arc<StagerKind>>>,
    pub(crate) transport: Arc<dyn NodeTransport>,
    pub(crate) reorg_tx: mpsc::UnboundedSender<ReorgRequest>,
    pub(crate) reorg_rx: Mutex<Option<mpsc::UnboundedReceiver<ReorgRequest>>>,
    shutdown_tx: watch::Sender<bool>,
    pub(crate) shutdown_rx: watch::Receiver<bool>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("node_id", &self.node_id)
            .field("targets", &self.targets.len())
            .field("blobs", &self.metadata.blob_count())
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Builds the node's targets from its device list and assembles the
    /// engine state. Device init failures (for example an unopenable slab
    /// file) are startup errors; nothing is retried lazily.
    pub async fn new(
        config: CoreConfig,
        transport: Arc<dyn NodeTransport>,
    ) -> Result<Arc<Node>, NodeError> {
        let scores = base_scores(&config.devices);
        let mut targets = Vec::with_capacity(config.devices.len());

        for (index, device) in config.devices.iter().enumerate() {
            let index_u16 = u16::try_from(index).unwrap_or(u16::MAX);
            let (id, driver) = match &device.kind {
                DeviceKind::Ram => {
                    let id = TargetId {
                        node: config.node_id,
                        device: index_u16,
                        slab: index_u16,
                    };
                    let driver = RamDriver::new(device.capacity)
                        .context(TargetInitSnafu { target: id })?;
                    (id, TargetDriver::Ram(driver))
                }
                DeviceKind::File { path } => {
                    let id = TargetId {
                        node: config.node_id,
                        device: index_u16,
                        slab: index_u16,
                    };
                    let driver = FileDriver::open(path, device.capacity)
                        .await
                        .context(TargetInitSnafu { target: id })?;
                    (id, TargetDriver::File(driver))
                }
                DeviceKind::Remote { node, device } => {
                    let id = TargetId {
                        node: *node,
                        device: *device,
                        slab: index_u16,
                    };
                    let driver =
                        TargetDriver::Remote(RemoteDriver::new(id, Arc::clone(&transport)));
                    (id, driver)
                }
            };

            targets.push(Arc::new(Target {
                id,
                capacity: device.capacity,
                bandwidth: device.bandwidth,
                latency: device.latency,
                base_score: scores[index],
                driver,
                allocator: BufferAllocator::new(device.capacity, device.alignment()),
            }));
        }

        let (reorg_tx, reorg_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let node = Arc::new(Node {
            node_id: config.node_id,
            metadata: MetadataStore::new(config.node_id),
            config,
            targets,
            stagers: RwLock::new(std::collections::HashMap::new()),
            transport,
            reorg_tx,
            reorg_rx: Mutex::new(Some(reorg_rx)),
            shutdown_tx,
            shutdown_rx,
        });

        debug!(
            node_id = node.node_id,
            targets = node.targets.len(),
            "Node initialized."
        );
        Ok(node)
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Signals the background loop and lane workers to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub(crate) fn find_target(&self, id: TargetId) -> Option<&Arc<Target>> {
        self.targets.iter().find(|t| t.id == id)
    }

    /// Resolves a target addressed by a remote peer: peers address the
    /// owning node's device, not the slab index the peer assigned locally.
    pub(crate) fn local_target_for_device(&self, device: u16) -> Option<&Arc<Target>> {
        self.targets
            .iter()
            .find(|t| t.id.node == self.node_id && t.id.device == device)
    }

    /// Snapshots every target for placement.
    pub(crate) fn target_snapshots(&self) -> Vec<TargetSnapshot> {
        self.targets.iter().map(|t| t.snapshot()).collect()
    }

    pub(crate) fn find_stager(&self, tag_id: TagId) -> Option<Arc<StagerKind>> {
        self.stagers.read().get(&tag_id).cloned()
    }

    pub(crate) fn headroom(&self) -> f64 {
        self.config.placement.headroom
    }
}

/// Normalizes device bandwidth/latency into static tier ranks in (0, 1]:
/// the best bandwidth and best latency each contribute half.
fn base_scores(devices: &[DeviceConfig]) -> Vec<f64> {
    let max_bandwidth = devices
        .iter()
        .map(|d| d.bandwidth)
        .fold(f64::MIN_POSITIVE, f64::max);
    let min_latency = devices
        .iter()
        .map(|d| d.latency)
        .fold(f64::MAX, f64::min)
        .max(f64::MIN_POSITIVE);

    devices
        .iter()
        .map(|d| {
            let bandwidth_rank = d.bandwidth / max_bandwidth;
            let latency_rank = min_latency / d.latency.max(f64::MIN_POSITIVE);
            (bandwidth_rank + latency_rank) / 2.0
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(bandwidth: f64, latency: f64) -> DeviceConfig {
        DeviceConfig {
            kind: DeviceKind::Ram,
            capacity: 1 << 20,
            bandwidth,
            latency,
            alignment: None,
        }
    }

    #[test]
    fn faster_devices_rank_higher() {
        let scores = base_scores(&[device(8000.0, 0.1), device(500.0, 100.0), device(100.0, 5000.0)]);
        assert!(scores[0] > scores[1]);
        assert!(scores[1] > scores[2]);
        assert!((scores[0] - 1.0).abs() < f64::EPSILON);
    }
}
