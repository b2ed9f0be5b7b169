//! Shared helpers for the scenario and property tests.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Once};

use temp_dir::TempDir;

use crate::config::{CoreConfigBuilder, DeviceConfig, DeviceKind};
use crate::node::Node;
use crate::rpc::{MemoryTransport, NullTransport};

static TRACING_INIT: Once = Once::new();

/// Initializes a subscriber honoring `RUST_LOG`; safe to call from every
/// test.
pub fn install_tracing() {
    TRACING_INIT.call_once(|| {
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

/// Runs the closure with a temporary directory that lives for the duration
/// of the returned future.
pub async fn with_temp_dir<F, Fut, V>(f: F) -> V
where
    F: FnOnce(&Path) -> Fut,
    Fut: Future<Output = V>,
{
    let dir = TempDir::new().expect("failed to create temporary directory");
    f(dir.path()).await
}

/// A fast tier for tests.
pub fn ram_device(capacity: u64) -> DeviceConfig {
    DeviceConfig {
        kind: DeviceKind::Ram,
        capacity,
        bandwidth: 8000.0,
        latency: 0.1,
        alignment: None,
    }
}

/// A slow tier for tests, backed by a slab file under `dir`.
pub fn file_device(dir: &Path, name: &str, capacity: u64) -> DeviceConfig {
    DeviceConfig {
        kind: DeviceKind::File {
            path: dir.join(name),
        },
        capacity,
        bandwidth: 500.0,
        latency: 100.0,
        alignment: None,
    }
}

/// A device reaching another node's slab over the transport.
pub fn remote_device(node: u32, device: u16, capacity: u64) -> DeviceConfig {
    DeviceConfig {
        kind: DeviceKind::Remote { node, device },
        capacity,
        bandwidth: 200.0,
        latency: 500.0,
        alignment: None,
    }
}

/// Builds a single node with zero placement headroom, so the literal byte
/// splits in the scenarios hold exactly.
pub async fn build_node(devices: Vec<DeviceConfig>) -> Arc<Node> {
    install_tracing();
    let mut builder = CoreConfigBuilder::new(0).headroom(0.0).lanes(2);
    for device in devices {
        builder = builder.device(device);
    }
    let config = builder.build().expect("test config must build");
    Node::new(config, Arc::new(NullTransport))
        .await
        .expect("test node must initialize")
}

/// Builds a cluster of nodes wired through a [`MemoryTransport`]. Each
/// entry is `(node_id, devices)`.
pub async fn build_cluster(nodes: Vec<(u32, Vec<DeviceConfig>)>) -> HashMap<u32, Arc<Node>> {
    install_tracing();
    let transport = MemoryTransport::new();
    let mut cluster = HashMap::new();
    for (node_id, devices) in nodes {
        let mut builder = CoreConfigBuilder::new(node_id).headroom(0.0).lanes(2);
        for device in devices {
            builder = builder.device(device);
        }
        let config = builder.build().expect("test config must build");
        let node = Node::new(config, transport.clone())
            .await
            .expect("test node must initialize");
        transport.register(&node);
        cluster.insert(node_id, node);
    }
    cluster
}

/// A deterministic payload: `len` bytes of `byte`.
pub fn filled(byte: u8, len: usize) -> bytes::Bytes {
    bytes::Bytes::from(vec![byte; len])
}

/// A payload that varies by position, for catching fragment-order bugs.
pub fn patterned(len: usize) -> bytes::Bytes {
    #[allow(clippy::cast_possible_truncation)]
    bytes::Bytes::from((0..len).map(|i| (i * 31 % 251) as u8).collect::<Vec<u8>>())
}

/// A uniformly random payload.
pub fn random_payload(len: usize) -> bytes::Bytes {
    use rand::RngCore;
    let mut payload = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut payload);
    bytes::Bytes::from(payload)
}

/// Checks the engine's structural invariants: fragment sums match blob
/// sizes, no two live fragments overlap on a target, allocator accounting
/// conserves capacity, and tag sizes add up.
pub async fn check_consistency(node: &Node) {
    let blobs = node.metadata.iter_blobs();

    let mut per_target: HashMap<crate::id::TargetId, Vec<(u64, u64)>> = HashMap::new();
    let mut per_tag_sizes: HashMap<crate::id::TagId, u64> = HashMap::new();

    for blob in &blobs {
        let info = blob.info.read().await;
        let fragment_sum: u64 = info.buffers.iter().map(|b| b.size).sum();
        assert_eq!(
            fragment_sum, info.blob_size,
            "blob '{}' fragments sum to {} but blob_size is {}",
            info.name, fragment_sum, info.blob_size
        );

        for buffer in &info.buffers {
            per_target
                .entry(buffer.target)
                .or_default()
                .push((buffer.offset, buffer.size));
        }
        *per_tag_sizes.entry(info.tag_id).or_default() += info.blob_size;
    }

    for target in &node.targets {
        let alignment = target.allocator.alignment();
        let mut spans = per_target.remove(&target.id).unwrap_or_default();
        spans.sort_unstable();

        let mut allocated = 0u64;
        let mut previous_end = 0u64;
        for (offset, size) in spans {
            let aligned = size.max(1).div_ceil(alignment) * alignment;
            assert!(
                offset >= previous_end,
                "target {} has overlapping fragments at offset {}",
                target.id,
                offset
            );
            previous_end = offset + aligned;
            allocated += aligned;
        }

        assert_eq!(
            target.allocator.remaining() + allocated,
            target.capacity,
            "target {} leaks capacity",
            target.id
        );
    }
    assert!(
        per_target.is_empty(),
        "blobs reference targets this node does not know"
    );

    for tag in node.metadata.iter_tags() {
        let info = tag.info.read().await;
        if !info.owns_blobs {
            continue;
        }
        let expected = per_tag_sizes.get(&info.id).copied().unwrap_or(0);
        assert_eq!(
            info.internal_size, expected,
            "tag '{}' accounts {} bytes but owns {}",
            info.name, info.internal_size, expected
        );
    }
}
