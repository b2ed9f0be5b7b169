//! Single-node put/get scenarios.

use pretty_assertions::assert_eq;

use crate::engine::tag::TagCreateOptions;
use crate::engine::CoreError;
use crate::id::BlobFlags;
use crate::test::{
    build_node, check_consistency, file_device, filled, patterned, ram_device, random_payload,
    with_temp_dir,
};

#[tokio::test]
async fn single_blob_round_trips() {
    let node = build_node(vec![ram_device(4 << 20)]).await;
    let tag_id = node
        .get_or_create_tag("B", TagCreateOptions::owning())
        .await
        .unwrap();

    let payload = filled(0x41, 1 << 20);
    let blob_id = node
        .put_blob(tag_id, "b", None, 0, payload.clone(), 0.5, BlobFlags::default())
        .await
        .unwrap();

    assert_eq!(node.get_blob_size(blob_id).await.unwrap(), 1 << 20);
    let (read, data) = node.get_blob(tag_id, "b", None, 0, 0).await.unwrap();
    assert_eq!(read, 1 << 20);
    assert_eq!(data, payload);

    check_consistency(&node).await;
}

#[tokio::test]
async fn multi_tier_placement_splits_across_targets() {
    with_temp_dir(|dir| {
        let dir = dir.to_path_buf();
        async move {
            let node = build_node(vec![
                ram_device(512 * 1024),
                file_device(&dir, "slab", 4 << 20),
            ])
            .await;
            let tag_id = node
                .get_or_create_tag("B", TagCreateOptions::owning())
                .await
                .unwrap();

            let payload = filled(0x42, 1 << 20);
            let blob_id = node
                .put_blob(tag_id, "b", None, 0, payload.clone(), 0.5, BlobFlags::default())
                .await
                .unwrap();

            // The fast tier fills completely, the overflow lands below.
            let buffers = node.get_blob_buffers(blob_id).await.unwrap();
            assert_eq!(buffers.len(), 2);
            assert_eq!(buffers[0].target.device, 0);
            assert_eq!(buffers[0].size, 512 * 1024);
            assert_eq!(buffers[1].target.device, 1);
            assert_eq!(buffers[1].size, 524_288);

            let (read, data) = node.get_blob(tag_id, "b", None, 0, 0).await.unwrap();
            assert_eq!(read, 1 << 20);
            assert_eq!(data, payload);

            check_consistency(&node).await;
        }
    })
    .await;
}

#[tokio::test]
async fn partial_put_overlays_and_extends() {
    let node = build_node(vec![ram_device(4 << 20)]).await;
    let tag_id = node
        .get_or_create_tag("B", TagCreateOptions::owning())
        .await
        .unwrap();

    let base = random_payload(64 * 1024);
    node.put_blob(tag_id, "b", None, 0, base.clone(), 0.5, BlobFlags::default())
        .await
        .unwrap();

    // Overlay inside the blob.
    let overlay = filled(0xEE, 4096);
    node.put_blob(tag_id, "b", None, 1000, overlay.clone(), 0.5, BlobFlags::default())
        .await
        .unwrap();

    let mut expected = base.to_vec();
    expected[1000..1000 + 4096].copy_from_slice(&overlay);

    let (_, data) = node.get_blob(tag_id, "b", None, 0, 0).await.unwrap();
    assert_eq!(data.to_vec(), expected);

    // Overlay straddling the end extends the blob.
    let tail = filled(0xDD, 8192);
    node.put_blob(
        tag_id,
        "b",
        None,
        expected.len() as u64 - 100,
        tail.clone(),
        0.5,
        BlobFlags::default(),
    )
    .await
    .unwrap();

    expected.truncate(expected.len() - 100);
    expected.extend_from_slice(&tail);

    let blob_id = node.get_blob_id(tag_id, "b").unwrap();
    assert_eq!(node.get_blob_size(blob_id).await.unwrap(), expected.len() as u64);
    let (_, data) = node.get_blob(tag_id, "b", None, 0, 0).await.unwrap();
    assert_eq!(data.to_vec(), expected);

    check_consistency(&node).await;
}

#[tokio::test]
async fn writes_past_the_end_need_append() {
    let node = build_node(vec![ram_device(1 << 20)]).await;
    let tag_id = node
        .get_or_create_tag("B", TagCreateOptions::owning())
        .await
        .unwrap();

    node.put_blob(tag_id, "b", None, 0, filled(1, 100), 0.5, BlobFlags::default())
        .await
        .unwrap();

    let error = node
        .put_blob(tag_id, "b", None, 500, filled(2, 10), 0.5, BlobFlags::default())
        .await
        .unwrap_err();
    assert!(matches!(error, CoreError::InvalidArgument { .. }));

    // APPEND ignores the offset and writes at the end.
    node.put_blob(tag_id, "b", None, 500, filled(2, 10), 0.5, BlobFlags::APPEND)
        .await
        .unwrap();
    let blob_id = node.get_blob_id(tag_id, "b").unwrap();
    assert_eq!(node.get_blob_size(blob_id).await.unwrap(), 110);

    let (_, data) = node.get_blob(tag_id, "b", None, 100, 0).await.unwrap();
    assert_eq!(data.to_vec(), vec![2u8; 10]);
}

#[tokio::test]
async fn truncate_frees_trailing_capacity() {
    let node = build_node(vec![ram_device(1 << 20)]).await;
    let tag_id = node
        .get_or_create_tag("B", TagCreateOptions::owning())
        .await
        .unwrap();

    let payload = patterned(256 * 1024);
    let blob_id = node
        .put_blob(tag_id, "b", None, 0, payload.clone(), 0.5, BlobFlags::default())
        .await
        .unwrap();
    let full_remaining = node.targets[0].allocator.remaining();

    node.truncate_blob(tag_id, blob_id, 100_000).await.unwrap();
    assert_eq!(node.get_blob_size(blob_id).await.unwrap(), 100_000);
    assert!(node.targets[0].allocator.remaining() > full_remaining);

    let (read, data) = node.get_blob(tag_id, "b", None, 0, 0).await.unwrap();
    assert_eq!(read, 100_000);
    assert_eq!(data.to_vec(), payload[..100_000].to_vec());

    // Growing through truncate is not a thing.
    assert!(matches!(
        node.truncate_blob(tag_id, blob_id, 1 << 20).await,
        Err(CoreError::InvalidArgument { .. })
    ));

    check_consistency(&node).await;
}

#[tokio::test]
async fn rename_then_destroy_returns_capacity() {
    let node = build_node(vec![ram_device(1 << 20)]).await;
    let capacity = node.targets[0].allocator.remaining();
    let tag_id = node
        .get_or_create_tag("B", TagCreateOptions::owning())
        .await
        .unwrap();

    let payload = patterned(128 * 1024);
    let blob_id = node
        .put_blob(tag_id, "old", None, 0, payload.clone(), 0.5, BlobFlags::default())
        .await
        .unwrap();

    node.rename_blob(tag_id, blob_id, "new").await.unwrap();

    assert!(matches!(
        node.get_blob(tag_id, "old", None, 0, 0).await,
        Err(CoreError::NotFound { .. })
    ));
    let (_, data) = node.get_blob(tag_id, "new", None, 0, 0).await.unwrap();
    assert_eq!(data, payload);

    node.destroy_blob(tag_id, blob_id, BlobFlags::default())
        .await
        .unwrap();
    assert_eq!(node.targets[0].allocator.remaining(), capacity);
    assert!(node
        .tag_get_contained_blob_ids(tag_id)
        .await
        .unwrap()
        .is_empty());

    check_consistency(&node).await;
}

#[tokio::test]
async fn reads_are_clamped_short() {
    let node = build_node(vec![ram_device(1 << 20)]).await;
    let tag_id = node
        .get_or_create_tag("B", TagCreateOptions::owning())
        .await
        .unwrap();
    node.put_blob(tag_id, "b", None, 0, filled(7, 1000), 0.5, BlobFlags::default())
        .await
        .unwrap();

    let (read, data) = node.get_blob(tag_id, "b", None, 900, 500).await.unwrap();
    assert_eq!(read, 100);
    assert_eq!(data.to_vec(), vec![7u8; 100]);

    let (read, data) = node.get_blob(tag_id, "b", None, 5000, 100).await.unwrap();
    assert_eq!(read, 0);
    assert!(data.is_empty());
}

#[tokio::test]
async fn insufficient_capacity_is_surfaced() {
    let node = build_node(vec![ram_device(64 * 1024)]).await;
    let tag_id = node
        .get_or_create_tag("B", TagCreateOptions::owning())
        .await
        .unwrap();

    let error = node
        .put_blob(tag_id, "big", None, 0, filled(1, 1 << 20), 0.5, BlobFlags::default())
        .await
        .unwrap_err();
    assert!(matches!(error, CoreError::InsufficientCapacity { .. }));

    // The failed put left nothing allocated behind.
    assert_eq!(node.targets[0].allocator.remaining(), 64 * 1024);
    check_consistency(&node).await;
}

#[tokio::test]
async fn replace_flag_swaps_content_wholesale() {
    let node = build_node(vec![ram_device(1 << 20)]).await;
    let tag_id = node
        .get_or_create_tag("B", TagCreateOptions::owning())
        .await
        .unwrap();

    node.put_blob(tag_id, "b", None, 0, patterned(100_000), 0.4, BlobFlags::default())
        .await
        .unwrap();
    let replacement = filled(9, 5000);
    let blob_id = node
        .put_blob(tag_id, "b", None, 0, replacement.clone(), 0.4, BlobFlags::REPLACE)
        .await
        .unwrap();

    assert_eq!(node.get_blob_size(blob_id).await.unwrap(), 5000);
    let (_, data) = node.get_blob(tag_id, "b", None, 0, 0).await.unwrap();
    assert_eq!(data, replacement);
    check_consistency(&node).await;
}

#[tokio::test]
async fn tags_cascade_destruction_to_owned_blobs() {
    let node = build_node(vec![ram_device(1 << 20)]).await;
    let capacity = node.targets[0].allocator.remaining();
    let tag_id = node
        .get_or_create_tag("B", TagCreateOptions::owning())
        .await
        .unwrap();

    for name in ["a", "b", "c"] {
        node.put_blob(tag_id, name, None, 0, patterned(32 * 1024), 0.5, BlobFlags::default())
            .await
            .unwrap();
    }
    assert_eq!(node.tag_get_size(tag_id).await.unwrap(), 3 * 32 * 1024);

    node.destroy_tag(tag_id).await.unwrap();
    assert!(matches!(
        node.get_tag_id("B"),
        Err(CoreError::NotFound { .. })
    ));
    assert_eq!(node.targets[0].allocator.remaining(), capacity);
}

#[tokio::test]
async fn tagging_attaches_a_blob_to_a_non_owning_tag() {
    use crate::rpc::{Request, Response};

    let node = build_node(vec![ram_device(1 << 20)]).await;
    let owner = node
        .get_or_create_tag("data", TagCreateOptions::owning())
        .await
        .unwrap();
    // The label does not own blobs; it only references them.
    let label = node
        .get_or_create_tag("hot-set", TagCreateOptions::default())
        .await
        .unwrap();

    let payload = patterned(16 * 1024);
    let blob_id = node
        .put_blob(owner, "b", None, 0, payload.clone(), 0.5, BlobFlags::default())
        .await
        .unwrap();

    let response = node
        .handle(Request::TagBlob {
            tag_id: owner,
            blob_id,
            tag: label,
        })
        .await;
    assert!(matches!(response, Response::Unit), "unexpected response: {response:?}");

    // Both memberships are visible: ownership and the label reference.
    assert!(node.blob_has_tag(blob_id, owner).await.unwrap());
    assert!(node.blob_has_tag(blob_id, label).await.unwrap());
    assert_eq!(
        node.tag_get_contained_blob_ids(label).await.unwrap(),
        vec![blob_id]
    );

    // The label reference carries no size accounting and no ownership:
    // destroying the label leaves the blob and its owner intact.
    assert_eq!(node.tag_get_size(label).await.unwrap(), 0);
    node.destroy_tag(label).await.unwrap();
    let (_, data) = node.get_blob(owner, "b", None, 0, 0).await.unwrap();
    assert_eq!(data, payload);
    assert_eq!(
        node.tag_get_contained_blob_ids(owner).await.unwrap(),
        vec![blob_id]
    );

    check_consistency(&node).await;
}

#[tokio::test]
async fn tag_creation_is_idempotent() {
    let node = build_node(vec![ram_device(1 << 20)]).await;
    let first = node
        .get_or_create_tag("B", TagCreateOptions::owning())
        .await
        .unwrap();
    let second = node
        .get_or_create_tag("B", TagCreateOptions::owning())
        .await
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(node.get_tag_id("B").unwrap(), first);
}

#[tokio::test]
async fn append_splits_at_page_boundaries() {
    let node = build_node(vec![ram_device(1 << 20)]).await;
    let tag_id = node
        .get_or_create_tag("log", TagCreateOptions::owning())
        .await
        .unwrap();

    // 10000 bytes over 4096-byte pages: pages 0 and 1 full, page 2 partial.
    node.append(tag_id, patterned(10_000), 4096, 0.5).await.unwrap();
    assert_eq!(node.tag_get_size(tag_id).await.unwrap(), 10_000);
    assert_eq!(
        node.tag_get_contained_blob_ids(tag_id).await.unwrap().len(),
        3
    );

    // A second append continues mid-page.
    node.append(tag_id, filled(3, 200), 4096, 0.5).await.unwrap();
    assert_eq!(node.tag_get_size(tag_id).await.unwrap(), 10_200);

    let expected = patterned(10_000);
    let (_, page2) = node
        .get_blob(
            tag_id,
            &crate::stager::mapper::encode_page_name(2),
            None,
            0,
            0,
        )
        .await
        .unwrap();
    assert_eq!(&page2[..expected.len() - 8192], &expected[8192..]);
    assert_eq!(&page2[expected.len() - 8192..], &vec![3u8; 200][..]);

    check_consistency(&node).await;
}
