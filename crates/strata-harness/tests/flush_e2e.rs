//! End-to-end flush coordination scenarios.

use std::fs;
use strata_bo::meta::MetadataManager;
use strata_harness::{scenario::ScenarioLog, TestCluster, TierSpec};
use strata_types::{BucketId, Context, SwapBlob, MEBIBYTE};

const FAST: u32 = 0;

fn tiers() -> Vec<TierSpec> {
    vec![
        TierSpec {
            bandwidth_mbps: 1000.0,
            capacity: 64 * MEBIBYTE,
            buffer_size: 16 * MEBIBYTE,
        },
        TierSpec {
            bandwidth_mbps: 100.0,
            capacity: 1024 * MEBIBYTE,
            buffer_size: 16 * MEBIBYTE,
        },
    ]
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(17).wrapping_add(seed)).collect()
}

#[test]
fn three_async_flushes_to_one_file_serialize_and_drain() {
    let cluster = TestCluster::new(1, &tiers()).expect("cluster");
    let node = cluster.node(0);
    let bucket = BucketId::from_parts(0, 1);

    let dir = tempfile::tempdir().expect("tempdir");
    let target = dir.path().join("flush.bin");
    let filename = target.to_str().expect("utf8 path").to_owned();
    node.mdm.create_vbucket(&filename);

    let chunk = MEBIBYTE as usize;
    let mut blobs = Vec::new();
    for i in 0..3_u8 {
        let name = cluster.name_for_node(bucket, &format!("part-{i}"), 0);
        let data = pattern(chunk, i);
        let blob = cluster.put_blob(0, bucket, &name, 0.0, &[(FAST, data.clone())]);
        blobs.push((blob, data, (i as u64) * chunk as u64));
    }

    for (blob, _, offset) in &blobs {
        let accepted = node
            .organizer
            .enqueue_flushing_task(*blob, &filename, *offset)
            .expect("enqueue over rpc");
        assert!(accepted);
    }

    node.organizer
        .await_async_flushing_tasks(&filename)
        .expect("await");

    // Counter drained back to zero and stays there.
    let info = node.mdm.local_vbucket_info(&filename).expect("vbucket");
    assert_eq!(info.outstanding_flushes(), 0);

    let file_bytes = fs::read(&target).expect("read back");
    assert_eq!(file_bytes.len(), 3 * chunk);
    for (_, data, offset) in &blobs {
        let start = *offset as usize;
        assert_eq!(&file_bytes[start..start + chunk], data.as_slice());
    }
    cluster.shutdown();
}

#[test]
fn sync_flush_preserves_existing_file_content() {
    let cluster = TestCluster::new(1, &tiers()).expect("cluster");
    let node = cluster.node(0);
    let bucket = BucketId::from_parts(0, 1);

    let dir = tempfile::tempdir().expect("tempdir");
    let target = dir.path().join("existing.bin");
    let filename = target.to_str().expect("utf8 path").to_owned();

    let first = cluster.put_blob(
        0,
        bucket,
        &cluster.name_for_node(bucket, "first", 0),
        0.0,
        &[(FAST, pattern(8192, 1))],
    );
    let second = cluster.put_blob(
        0,
        bucket,
        &cluster.name_for_node(bucket, "second", 0),
        0.0,
        &[(FAST, pattern(1024, 2))],
    );

    node.organizer.flush_blob(first, &filename, 0).expect("flush");
    // Second flush opens the existing file write-only, no truncation:
    // bytes outside the written range survive.
    node.organizer
        .flush_blob(second, &filename, 4096)
        .expect("flush over");

    let bytes = fs::read(&target).expect("read back");
    assert_eq!(bytes.len(), 8192);
    assert_eq!(&bytes[..4096], &pattern(8192, 1)[..4096]);
    assert_eq!(&bytes[4096..5120], pattern(1024, 2).as_slice());
    assert_eq!(&bytes[5120..], &pattern(8192, 1)[5120..]);
    cluster.shutdown();
}

#[test]
fn swap_resident_blobs_are_refused() {
    let cluster = TestCluster::new(1, &tiers()).expect("cluster");
    let node = cluster.node(0);
    let bucket = BucketId::from_parts(0, 1);

    let dir = tempfile::tempdir().expect("tempdir");
    let filename = dir
        .path()
        .join("never.bin")
        .to_str()
        .expect("utf8 path")
        .to_owned();
    node.mdm.create_vbucket(&filename);

    let blob = cluster.put_blob(
        0,
        bucket,
        &cluster.name_for_node(bucket, "swapped", 0),
        0.0,
        &[(FAST, pattern(512, 9))],
    );
    node.mdm.mark_in_swap(blob);

    let accepted = node
        .organizer
        .enqueue_flushing_task(blob, &filename, 0)
        .expect("enqueue over rpc");
    assert!(!accepted);

    // Refusal must not leak a counter increment.
    let info = node.mdm.local_vbucket_info(&filename).expect("vbucket");
    assert_eq!(info.outstanding_flushes(), 0);
    cluster.shutdown();
}

#[test]
fn concurrent_organize_and_flush_serialize_on_the_blob_lock() {
    let cluster = TestCluster::new(1, &tiers()).expect("cluster");
    let node = cluster.node(0);
    let bucket = BucketId::from_parts(0, 1);

    let dir = tempfile::tempdir().expect("tempdir");
    let filename = dir
        .path()
        .join("busy.bin")
        .to_str()
        .expect("utf8 path")
        .to_owned();
    node.mdm.create_vbucket(&filename);

    let name = cluster.name_for_node(bucket, "busy", 0);
    let payload_big = pattern(9 * MEBIBYTE as usize, 3);
    let payload_small = pattern(MEBIBYTE as usize, 4);
    let blob = cluster.put_blob(
        0,
        bucket,
        &name,
        0.9,
        &[(FAST, payload_big.clone()), (FAST, payload_small.clone())],
    );

    // Queue the flush and kick off reorganization back to back; the blob
    // lock serializes their bodies in whichever order the workers pick
    // them up.
    let accepted = node
        .organizer
        .enqueue_flushing_task(blob, &filename, 0)
        .expect("enqueue over rpc");
    assert!(accepted);
    node.organizer
        .organize_blob(bucket, &name, 0.01, None)
        .expect("organize");

    cluster.quiesce();
    node.organizer
        .await_async_flushing_tasks(&filename)
        .expect("await");

    let mut expected = payload_big;
    expected.extend_from_slice(&payload_small);

    // Neither task corrupted the other's view: the file holds the whole
    // blob and the blob reassembles bit-for-bit regardless of tier.
    assert_eq!(fs::read(&filename).expect("read back"), expected);
    assert_eq!(cluster.read_blob(0, blob).expect("read"), expected);
    cluster.shutdown();
}

#[test]
fn swap_blobs_are_replaced_into_the_hierarchy() {
    let cluster = TestCluster::new(1, &tiers()).expect("cluster");
    let node = cluster.node(0);
    let bucket = BucketId::from_parts(0, 1);
    let mut log = ScenarioLog::new("swap_replacement");

    let data = pattern(3 * MEBIBYTE as usize, 5);
    node.pool.stash_swap(0, &data);
    let swap = SwapBlob {
        node_id: 0,
        offset: 0,
        size: data.len() as u64,
        bucket_id: bucket,
    };

    log.step(
        "place_in_hierarchy",
        serde_json::json!({ "size": swap.size }),
        || {
            node.organizer
                .place_in_hierarchy(swap, "resurrected", &Context::default())
                .map_err(anyhow::Error::from)
        },
    )
    .expect("place");

    let blob_id = node
        .mdm
        .local_get_id(
            &strata_types::internal_blob_name(bucket, "resurrected"),
            strata_types::MapType::BlobId,
        )
        .map(strata_types::BlobId::from_u64)
        .expect("blob registered");
    assert_eq!(cluster.read_blob(0, blob_id).expect("read"), data);
    cluster.shutdown();
}
