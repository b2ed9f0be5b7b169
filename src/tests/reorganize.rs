//! Background reorganization scenarios: eviction, promotion, migration.

use pretty_assertions::assert_eq;

use crate::engine::tag::TagCreateOptions;
use crate::id::{BlobFlags, TagFlags};
use crate::test::{
    build_node, check_consistency, file_device, filled, patterned, ram_device, with_temp_dir,
};

#[tokio::test]
async fn pressure_evicts_the_coldest_blob_off_the_fast_tier() {
    with_temp_dir(|dir| {
        let dir = dir.to_path_buf();
        async move {
            let node = build_node(vec![
                ram_device(1 << 20),
                file_device(&dir, "slab", 8 << 20),
            ])
            .await;
            let tag_id = node
                .get_or_create_tag("B", TagCreateOptions::owning())
                .await
                .unwrap();

            let payloads = [
                ("hot", 0.9_f32, filled(0xA1, 512 * 1024)),
                ("warm", 0.5, filled(0xA2, 512 * 1024)),
                ("cold", 0.1, filled(0xA3, 512 * 1024)),
            ];
            for (name, score, payload) in &payloads {
                node.put_blob(tag_id, name, None, 0, payload.clone(), *score, BlobFlags::default())
                    .await
                    .unwrap();
            }

            // The first two puts filled the 1 MiB fast tier; the cold one
            // already landed below. The pass brings the fast tier back
            // under its threshold by shedding the lowest-scored resident.
            node.run_reorganization_pass().await;

            let ram = node.targets[0].id;
            let cold_id = node.get_blob_id(tag_id, "cold").unwrap();
            let cold_buffers = node.get_blob_buffers(cold_id).await.unwrap();
            assert!(
                cold_buffers.iter().all(|b| b.target != ram),
                "the coldest blob must live entirely off the fast tier"
            );

            let hot_id = node.get_blob_id(tag_id, "hot").unwrap();
            let hot_buffers = node.get_blob_buffers(hot_id).await.unwrap();
            assert!(
                hot_buffers.iter().all(|b| b.target == ram),
                "the hottest blob keeps its fast-tier placement"
            );

            // Every blob still reads back exactly.
            for (name, _, payload) in &payloads {
                let (_, data) = node.get_blob(tag_id, name, None, 0, 0).await.unwrap();
                assert_eq!(&data, payload, "blob '{name}' corrupted by reorganization");
            }

            check_consistency(&node).await;
        }
    })
    .await;
}

#[tokio::test]
async fn reorganization_preserves_bytes_across_demote_and_promote() {
    with_temp_dir(|dir| {
        let dir = dir.to_path_buf();
        async move {
            let node = build_node(vec![
                ram_device(2 << 20),
                file_device(&dir, "slab", 8 << 20),
            ])
            .await;
            let tag_id = node
                .get_or_create_tag("B", TagCreateOptions::owning())
                .await
                .unwrap();

            let payload = patterned(768 * 1024);
            let blob_id = node
                .put_blob(tag_id, "b", None, 0, payload.clone(), 0.9, BlobFlags::default())
                .await
                .unwrap();

            // Demote to the slow tier, then boost back up; the periodic
            // pass executes the promotion.
            node.execute_rescore(tag_id, blob_id, 0.05, node.node_id(), false)
                .await;
            let ram = node.targets[0].id;
            let buffers = node.get_blob_buffers(blob_id).await.unwrap();
            assert!(buffers.iter().all(|b| b.target != ram));
            let (_, data) = node.get_blob(tag_id, "b", None, 0, 0).await.unwrap();
            assert_eq!(data, payload);

            node.execute_rescore(tag_id, blob_id, 0.95, node.node_id(), false)
                .await;
            node.run_reorganization_pass().await;
            let buffers = node.get_blob_buffers(blob_id).await.unwrap();
            assert!(buffers.iter().all(|b| b.target == ram));
            let (_, data) = node.get_blob(tag_id, "b", None, 0, 0).await.unwrap();
            assert_eq!(data, payload);

            check_consistency(&node).await;
        }
    })
    .await;
}

#[tokio::test]
async fn stationary_scores_survive_rescoring() {
    let node = build_node(vec![ram_device(1 << 20)]).await;
    let tag_id = node
        .get_or_create_tag("B", TagCreateOptions::owning())
        .await
        .unwrap();

    let blob_id = node
        .put_blob(
            tag_id,
            "pinned",
            None,
            0,
            filled(1, 4096),
            0.8,
            BlobFlags::USER_SCORE_STATIONARY,
        )
        .await
        .unwrap();

    node.execute_rescore(tag_id, blob_id, 0.1, node.node_id(), false)
        .await;
    assert!((node.get_blob_score(blob_id).await.unwrap() - 0.8).abs() < f32::EPSILON);

    // An explicit user rescore still applies.
    node.execute_rescore(tag_id, blob_id, 0.3, node.node_id(), true)
        .await;
    assert!((node.get_blob_score(blob_id).await.unwrap() - 0.3).abs() < f32::EPSILON);
}

#[tokio::test]
async fn transient_tags_lose_blobs_when_nothing_lower_has_room() {
    let node = build_node(vec![ram_device(256 * 1024)]).await;
    let tag_id = node
        .get_or_create_tag(
            "scratch",
            TagCreateOptions {
                owns_blobs: true,
                flags: TagFlags::TRANSIENT,
                ..TagCreateOptions::default()
            },
        )
        .await
        .unwrap();

    node.put_blob(tag_id, "a", None, 0, filled(1, 128 * 1024), 0.9, BlobFlags::default())
        .await
        .unwrap();
    node.put_blob(tag_id, "b", None, 0, filled(2, 120 * 1024), 0.1, BlobFlags::default())
        .await
        .unwrap();

    // ~97% occupancy with a single tier: the coldest blob has nowhere to
    // go, and the transient tag allows destroying it.
    node.run_reorganization_pass().await;

    assert!(node.get_blob_id(tag_id, "b").is_err());
    let (_, data) = node.get_blob(tag_id, "a", None, 0, 0).await.unwrap();
    assert_eq!(data.len(), 128 * 1024);

    check_consistency(&node).await;
}

#[tokio::test]
async fn background_loop_ticks_and_stops_on_shutdown() {
    with_temp_dir(|dir| {
        let dir = dir.to_path_buf();
        async move {
            let config = crate::config::CoreConfigBuilder::new(0)
                .headroom(0.0)
                .tick_interval(std::time::Duration::from_millis(10))
                .flush_interval(std::time::Duration::from_millis(10))
                .device(ram_device(1 << 20))
                .device(file_device(&dir, "slab", 8 << 20))
                .build()
                .unwrap();
            let node = crate::node::Node::new(config, std::sync::Arc::new(crate::rpc::NullTransport))
                .await
                .unwrap();
            let handle = node.spawn_background();

            let tag_id = node
                .get_or_create_tag("B", TagCreateOptions::owning())
                .await
                .unwrap();
            node.put_blob(tag_id, "hot", None, 0, filled(1, 512 * 1024), 0.9, BlobFlags::default())
                .await
                .unwrap();
            node.put_blob(tag_id, "cold", None, 0, filled(2, 512 * 1024), 0.1, BlobFlags::default())
                .await
                .unwrap();

            // Give the loop a few ticks to notice the full fast tier.
            let ram = node.targets[0].id;
            let cold_id = node.get_blob_id(tag_id, "cold").unwrap();
            let mut evicted = false;
            for _ in 0..50 {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                let buffers = node.get_blob_buffers(cold_id).await.unwrap();
                if buffers.iter().all(|b| b.target != ram) {
                    evicted = true;
                    break;
                }
            }
            assert!(evicted, "the background loop must demote the cold blob");

            node.shutdown();
            handle.await.unwrap();
            check_consistency(&node).await;
        }
    })
    .await;
}

#[tokio::test]
async fn persistent_tags_keep_blobs_under_pressure() {
    let node = build_node(vec![ram_device(256 * 1024)]).await;
    let tag_id = node
        .get_or_create_tag("durable", TagCreateOptions::owning())
        .await
        .unwrap();

    node.put_blob(tag_id, "a", None, 0, filled(1, 128 * 1024), 0.9, BlobFlags::default())
        .await
        .unwrap();
    node.put_blob(tag_id, "b", None, 0, filled(2, 120 * 1024), 0.1, BlobFlags::default())
        .await
        .unwrap();

    node.run_reorganization_pass().await;

    // Nowhere to demote to and no permission to evict: both stay.
    assert!(node.get_blob_id(tag_id, "a").is_ok());
    assert!(node.get_blob_id(tag_id, "b").is_ok());
    check_consistency(&node).await;
}
