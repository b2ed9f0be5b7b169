//! Node configuration.
//!
//! An enclosing process describes the local node -- its id, its storage
//! devices, and the tuning knobs for placement and reorganization -- and
//! hands the resulting [`CoreConfig`] to [`Node::new`](crate::node::Node::new).
//! The builder validates everything up front so the engine never has to
//! revisit configuration errors at runtime.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use snafu::Snafu;

use crate::id::NodeId;

/// Buffer alignment for memory-backed targets.
pub const RAM_ALIGNMENT: u64 = 64;

/// Buffer alignment for file-backed targets.
pub const FILE_ALIGNMENT: u64 = 4096;

const DEFAULT_HEADROOM: f64 = 0.10;
const DEFAULT_EVICT_THRESHOLD: f64 = 0.90;
const DEFAULT_PROMOTE_THRESHOLD: f32 = 0.80;
const DEFAULT_TICK_INTERVAL_MS: u64 = 1_000;
const DEFAULT_FLUSH_INTERVAL_MS: u64 = 5_000;
const DEFAULT_RECENCY_HALF_LIFE_MS: u64 = 60_000;
const DEFAULT_MAX_INFLIGHT: usize = 4;
const DEFAULT_LANES: usize = 4;

#[derive(Debug, Snafu)]
pub enum BuildError {
    #[snafu(display("parameter '{}' was invalid: {}", param_name, reason))]
    InvalidParameter {
        param_name: &'static str,
        reason: String,
    },
}

/// What kind of device backs a target.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// A pre-allocated in-memory region.
    Ram,
    /// A local file, created (and truncated) at startup.
    File { path: PathBuf },
    /// A device owned by another node, reached through the transport.
    Remote { node: NodeId, device: u16 },
}

/// One storage device on this node.
#[derive(Clone, Debug, Deserialize)]
pub struct DeviceConfig {
    pub kind: DeviceKind,
    /// Total buffering capacity, in bytes.
    pub capacity: u64,
    /// Nominal bandwidth, in MB/s. Only the ratios between devices matter.
    pub bandwidth: f64,
    /// Nominal access latency, in microseconds.
    pub latency: f64,
    /// Buffer alignment granularity. Defaults per device kind.
    #[serde(default)]
    pub alignment: Option<u64>,
}

impl DeviceConfig {
    /// The effective allocation granularity for this device.
    pub fn alignment(&self) -> u64 {
        self.alignment.unwrap_or(match self.kind {
            DeviceKind::Ram => RAM_ALIGNMENT,
            DeviceKind::File { .. } | DeviceKind::Remote { .. } => FILE_ALIGNMENT,
        })
    }
}

/// Placement tuning.
#[derive(Clone, Debug, Deserialize)]
pub struct PlacementConfig {
    /// Fraction of each target's capacity held back from any single write,
    /// so concurrent writers are not starved by one large placement.
    pub headroom: f64,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            headroom: DEFAULT_HEADROOM,
        }
    }
}

/// Background reorganization tuning.
#[derive(Clone, Debug, Deserialize)]
pub struct ReorganizerConfig {
    /// Milliseconds between reorganization passes.
    pub tick_interval_ms: u64,
    /// Milliseconds between stage-out flush passes.
    pub flush_interval_ms: u64,
    /// Occupancy fraction above which a target sheds its coldest blobs.
    pub evict_threshold: f64,
    /// Score at or above which a blob is pulled toward the fastest tier.
    pub promote_threshold: f32,
    /// Half-life of the recency weight applied to scores during eviction.
    pub recency_half_life_ms: u64,
    /// Maximum number of concurrently executing reorganizations.
    pub max_inflight: usize,
}

impl Default for ReorganizerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            evict_threshold: DEFAULT_EVICT_THRESHOLD,
            promote_threshold: DEFAULT_PROMOTE_THRESHOLD,
            recency_half_life_ms: DEFAULT_RECENCY_HALF_LIFE_MS,
            max_inflight: DEFAULT_MAX_INFLIGHT,
        }
    }
}

impl ReorganizerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn recency_half_life(&self) -> Duration {
        Duration::from_millis(self.recency_half_life_ms)
    }
}

/// Node configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct CoreConfig {
    /// This node's id.
    pub node_id: NodeId,
    /// The storage devices backing this node's targets, fastest first by
    /// convention, although ordering is derived from bandwidth/latency.
    pub devices: Vec<DeviceConfig>,
    #[serde(default)]
    pub placement: PlacementConfig,
    #[serde(default)]
    pub reorganizer: ReorganizerConfig,
    /// Number of lanes work is sharded onto.
    #[serde(default = "default_lanes")]
    pub lanes: usize,
}

fn default_lanes() -> usize {
    DEFAULT_LANES
}

/// Builder for [`CoreConfig`].
#[derive(Clone, Debug)]
pub struct CoreConfigBuilder {
    node_id: NodeId,
    devices: Vec<DeviceConfig>,
    placement: PlacementConfig,
    reorganizer: ReorganizerConfig,
    lanes: usize,
}

impl CoreConfigBuilder {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            devices: Vec::new(),
            placement: PlacementConfig::default(),
            reorganizer: ReorganizerConfig::default(),
            lanes: DEFAULT_LANES,
        }
    }

    /// Adds a storage device to the node.
    pub fn device(mut self, device: DeviceConfig) -> Self {
        self.devices.push(device);
        self
    }

    /// Sets the per-target placement headroom fraction.
    ///
    /// Defaults to 10%.
    pub fn headroom(mut self, headroom: f64) -> Self {
        self.placement.headroom = headroom;
        self
    }

    /// Sets the interval between reorganization passes.
    ///
    /// Defaults to 1s.
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.reorganizer.tick_interval_ms = duration_to_ms(interval);
        self
    }

    /// Sets the interval between stage-out flush passes.
    ///
    /// Defaults to 5s.
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.reorganizer.flush_interval_ms = duration_to_ms(interval);
        self
    }

    /// Sets the occupancy fraction above which a target evicts.
    ///
    /// Defaults to 90%.
    pub fn evict_threshold(mut self, threshold: f64) -> Self {
        self.reorganizer.evict_threshold = threshold;
        self
    }

    /// Sets the number of lanes work is sharded onto.
    ///
    /// Defaults to 4.
    pub fn lanes(mut self, lanes: usize) -> Self {
        self.lanes = lanes;
        self
    }

    /// Consumes this builder and constructs a `CoreConfig`.
    pub fn build(self) -> Result<CoreConfig, BuildError> {
        if self.devices.is_empty() {
            return Err(BuildError::InvalidParameter {
                param_name: "devices",
                reason: "at least one device is required".to_string(),
            });
        }

        for device in &self.devices {
            if device.capacity == 0 {
                return Err(BuildError::InvalidParameter {
                    param_name: "devices",
                    reason: "device capacity cannot be zero".to_string(),
                });
            }
            if device.alignment() == 0 {
                return Err(BuildError::InvalidParameter {
                    param_name: "devices",
                    reason: "device alignment cannot be zero".to_string(),
                });
            }
            if device.capacity < device.alignment() {
                return Err(BuildError::InvalidParameter {
                    param_name: "devices",
                    reason: format!(
                        "device capacity must be at least one allocation unit ({} bytes)",
                        device.alignment()
                    ),
                });
            }
        }

        if !(0.0..1.0).contains(&self.placement.headroom) {
            return Err(BuildError::InvalidParameter {
                param_name: "headroom",
                reason: "must be within [0, 1)".to_string(),
            });
        }

        if !(0.0..=1.0).contains(&self.reorganizer.evict_threshold) {
            return Err(BuildError::InvalidParameter {
                param_name: "evict_threshold",
                reason: "must be within [0, 1]".to_string(),
            });
        }

        if self.reorganizer.max_inflight == 0 {
            return Err(BuildError::InvalidParameter {
                param_name: "max_inflight",
                reason: "cannot be zero".to_string(),
            });
        }

        if self.lanes == 0 {
            return Err(BuildError::InvalidParameter {
                param_name: "lanes",
                reason: "cannot be zero".to_string(),
            });
        }

        Ok(CoreConfig {
            node_id: self.node_id,
            devices: self.devices,
            placement: self.placement,
            reorganizer: self.reorganizer,
            lanes: self.lanes,
        })
    }
}

fn duration_to_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
