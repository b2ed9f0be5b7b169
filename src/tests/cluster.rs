//! Multi-node scenarios over the in-memory transport.

use pretty_assertions::assert_eq;

use crate::id::{BlobFlags, TagFlags};
use crate::rpc::{Request, Response};
use crate::test::{build_cluster, check_consistency, filled, patterned, ram_device, remote_device};

#[tokio::test]
async fn requests_forward_to_the_entity_home_node() {
    let cluster = build_cluster(vec![
        (0, vec![ram_device(4 << 20)]),
        (1, vec![ram_device(4 << 20)]),
    ])
    .await;
    let node0 = &cluster[&0];
    let node1 = &cluster[&1];

    // The tag is created on node 0; node 1 addresses it purely by id.
    let tag_id = match node0
        .handle(Request::GetOrCreateTag {
            name: "shared".to_string(),
            owns_blobs: true,
            backend_size: 0,
            flags: TagFlags::default(),
            params: None,
        })
        .await
    {
        Response::TagId(id) => id,
        other => panic!("unexpected response: {other:?}"),
    };
    assert_eq!(tag_id.node, 0);

    let payload = patterned(128 * 1024);
    let blob_id = match node1
        .handle(Request::PutBlob {
            tag_id,
            name: "b".to_string(),
            blob_id: None,
            offset: 0,
            data: payload.to_vec(),
            score: 0.5,
            flags: BlobFlags::default(),
        })
        .await
    {
        Response::BlobId(id) => id,
        other => panic!("unexpected response: {other:?}"),
    };
    // Name-keyed creation lands on the tag's home node.
    assert_eq!(blob_id.node, 0);

    let response = node1
        .handle(Request::GetBlob {
            tag_id,
            name: "b".to_string(),
            blob_id: None,
            offset: 0,
            len: 0,
        })
        .await;
    match response {
        Response::Blob { read, data } => {
            assert_eq!(read, 128 * 1024);
            assert_eq!(data, payload.to_vec());
        }
        other => panic!("unexpected response: {other:?}"),
    }

    // The bytes live on node 0's targets, nothing on node 1.
    check_consistency(node0).await;
    check_consistency(node1).await;
    assert_eq!(node1.targets[0].allocator.remaining(), 4 << 20);
}

#[tokio::test]
async fn remote_targets_carry_spilled_bytes() {
    // Node 0 buffers onto its small RAM tier and spills onto a slab that
    // node 1 serves remotely as its device 0.
    let cluster = build_cluster(vec![
        (1, vec![ram_device(8 << 20)]),
        (0, vec![ram_device(256 * 1024), remote_device(1, 0, 4 << 20)]),
    ])
    .await;
    let node0 = &cluster[&0];

    let tag_id = node0
        .get_or_create_tag("spill", crate::engine::tag::TagCreateOptions::owning())
        .await
        .unwrap();

    let payload = patterned(1 << 20);
    let blob_id = node0
        .put_blob(tag_id, "big", None, 0, payload.clone(), 0.5, BlobFlags::default())
        .await
        .unwrap();

    let buffers = node0.get_blob_buffers(blob_id).await.unwrap();
    assert!(buffers.iter().any(|b| b.target.node == 1));

    let (read, data) = node0.get_blob(tag_id, "big", None, 0, 0).await.unwrap();
    assert_eq!(read, 1 << 20);
    assert_eq!(data, payload);
}

#[tokio::test]
async fn migration_moves_a_blob_home_and_forwards_stale_ids() {
    let cluster = build_cluster(vec![
        (0, vec![ram_device(4 << 20)]),
        (1, vec![ram_device(4 << 20)]),
    ])
    .await;
    let node0 = &cluster[&0];
    let node1 = &cluster[&1];

    let tag_id = node0
        .get_or_create_tag("mig", crate::engine::tag::TagCreateOptions::owning())
        .await
        .unwrap();
    let payload = filled(0x5A, 256 * 1024);
    let old_id = node0
        .put_blob(tag_id, "wanderer", None, 0, payload.clone(), 0.6, BlobFlags::default())
        .await
        .unwrap();
    assert_eq!(old_id.node, 0);

    // Move the blob's home to node 1.
    node0.execute_rescore(tag_id, old_id, 0.6, 1, false).await;

    // The name now resolves to a node-1 blob.
    let new_id = node0.get_blob_id(tag_id, "wanderer").unwrap();
    assert_eq!(new_id.node, 1);
    assert_ne!(new_id, old_id);

    // The bytes moved with it.
    assert_eq!(node0.targets[0].allocator.remaining(), 4 << 20);
    let (read, data) = node0
        .get_blob(tag_id, "wanderer", None, 0, 0)
        .await
        .unwrap();
    assert_eq!(read, 256 * 1024);
    assert_eq!(data, payload);

    // A stale id keeps working through its tombstone for the epoch.
    let response = node0
        .handle(Request::GetBlobSize {
            tag_id,
            blob_id: old_id,
        })
        .await;
    match response {
        Response::Size(size) => assert_eq!(size, 256 * 1024),
        other => panic!("unexpected response: {other:?}"),
    }

    // Membership swapped to the new id.
    let members = node0.tag_get_contained_blob_ids(tag_id).await.unwrap();
    assert_eq!(members, vec![new_id]);

    // Tag accounting settled: the size counted once, on the tag's node.
    assert_eq!(node0.tag_get_size(tag_id).await.unwrap(), 256 * 1024);

    check_consistency(node0).await;
    check_consistency(node1).await;
}

#[tokio::test]
async fn tombstones_expire_after_an_epoch() {
    let cluster = build_cluster(vec![
        (0, vec![ram_device(4 << 20)]),
        (1, vec![ram_device(4 << 20)]),
    ])
    .await;
    let node0 = &cluster[&0];

    let tag_id = node0
        .get_or_create_tag("mig", crate::engine::tag::TagCreateOptions::owning())
        .await
        .unwrap();
    let old_id = node0
        .put_blob(tag_id, "b", None, 0, filled(1, 4096), 0.5, BlobFlags::default())
        .await
        .unwrap();

    node0.execute_rescore(tag_id, old_id, 0.5, 1, false).await;

    // An epoch boundary clears the forwarding entries.
    node0.run_reorganization_pass().await;

    let response = node0
        .handle(Request::GetBlobSize {
            tag_id,
            blob_id: old_id,
        })
        .await;
    assert!(
        matches!(response, Response::Error(ref payload) if payload.message.contains("not found")),
        "stale id must stop resolving after the epoch: {response:?}"
    );
}
