//! End-to-end organizer scenarios on the in-memory cluster.

use strata_bo::meta::{BufferPool, MetadataManager};
use strata_harness::{TestCluster, TierSpec};
use strata_types::{BucketId, MEBIBYTE};

const FAST: u32 = 0;
const SLOW: u32 = 1;
const EPSILON: f64 = 0.01;

/// Fast tier sized exactly for the seeded blob (so it starts full) plus a
/// roomy slow tier.
fn tiers(fast_capacity: u64) -> Vec<TierSpec> {
    vec![
        TierSpec {
            bandwidth_mbps: 1000.0,
            capacity: fast_capacity,
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
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

#[test]
fn raising_importance_moves_the_bulk_to_the_slow_tier() {
    // A 10 MiB blob entirely on the (full) fast tier, split 9 MiB + 1 MiB.
    // Importance 0.9: moving just the 9 MiB buffer lands the score on 0.9,
    // so the organizer stops after exactly one move.
    let cluster = TestCluster::new(1, &tiers(10 * MEBIBYTE)).expect("cluster");
    let bucket = BucketId::from_parts(0, 1);
    let name = cluster.name_for_node(bucket, "hot", 0);
    let payload_big = pattern(9 * MEBIBYTE as usize, 1);
    let payload_small = pattern(MEBIBYTE as usize, 2);
    let blob = cluster.put_blob(
        0,
        bucket,
        &name,
        0.9,
        &[(FAST, payload_big.clone()), (FAST, payload_small.clone())],
    );

    let before = cluster.access_score(0, blob).expect("score");
    assert!(before.abs() < 1e-4, "blob starts all-fast, score {before}");

    cluster
        .node(0)
        .organizer
        .organize_blob(bucket, &name, EPSILON, None)
        .expect("organize");
    cluster.quiesce();

    let after = cluster.access_score(0, blob).expect("score");
    assert!(
        (0.9 - EPSILON as f32..=0.9 + EPSILON as f32).contains(&after),
        "score after move = {after}"
    );

    // Exactly one move: the big buffer relocated, the small one stayed.
    let node = cluster.node(0);
    let list = node.mdm.local_get_buffer_id_list(blob);
    assert_eq!(list.len(), 2);
    assert_eq!(node.pool.device_of(list[0]), Some(SLOW));
    assert_eq!(node.pool.device_of(list[1]), Some(FAST));

    // Bytes survive the move intact.
    let mut expected = payload_big;
    expected.extend_from_slice(&payload_small);
    assert_eq!(cluster.read_blob(0, blob).expect("read"), expected);
    cluster.shutdown();
}

#[test]
fn lowering_importance_promotes_to_the_fast_tier() {
    // Same split, seeded on the slow tier; fast tier has room.
    let cluster = TestCluster::new(1, &tiers(64 * MEBIBYTE)).expect("cluster");
    let bucket = BucketId::from_parts(0, 1);
    let name = cluster.name_for_node(bucket, "cold", 0);
    let blob = cluster.put_blob(
        0,
        bucket,
        &name,
        0.1,
        &[
            (SLOW, pattern(9 * MEBIBYTE as usize, 3)),
            (SLOW, pattern(MEBIBYTE as usize, 4)),
        ],
    );

    let before = cluster.access_score(0, blob).expect("score");
    assert!((before - 1.0).abs() < 1e-4, "blob starts all-slow, score {before}");

    cluster
        .node(0)
        .organizer
        .organize_blob(bucket, &name, EPSILON, None)
        .expect("organize");
    cluster.quiesce();

    let after = cluster.access_score(0, blob).expect("score");
    assert!(after <= 0.1 + EPSILON as f32, "score after move = {after}");

    let node = cluster.node(0);
    let list = node.mdm.local_get_buffer_id_list(blob);
    assert_eq!(node.pool.device_of(list[0]), Some(FAST));
    cluster.shutdown();
}

#[test]
fn matching_importance_enqueues_nothing() {
    let cluster = TestCluster::new(1, &tiers(64 * MEBIBYTE)).expect("cluster");
    let bucket = BucketId::from_parts(0, 1);
    let name = cluster.name_for_node(bucket, "steady", 0);
    let blob = cluster.put_blob(0, bucket, &name, 0.0, &[(FAST, pattern(4096, 5))]);

    let before = cluster.node(0).mdm.local_get_buffer_id_list(blob);
    cluster
        .node(0)
        .organizer
        .organize_blob(bucket, &name, EPSILON, None)
        .expect("organize");
    cluster.quiesce();

    // Same buffers, same placement: the organizer saw it was already
    // within epsilon and did nothing.
    assert_eq!(cluster.node(0).mdm.local_get_buffer_id_list(blob), before);
    cluster.shutdown();
}

#[test]
fn overshooting_moves_are_rejected() {
    // One indivisible 10 MiB buffer; importance 0.5. The only candidate
    // (slow tier) would land the score on 1.0, overshooting by 0.5, so no
    // move may be enqueued.
    let cluster = TestCluster::new(1, &tiers(10 * MEBIBYTE)).expect("cluster");
    let bucket = BucketId::from_parts(0, 1);
    let name = cluster.name_for_node(bucket, "pinned", 0);
    let blob = cluster.put_blob(
        0,
        bucket,
        &name,
        0.5,
        &[(FAST, pattern(10 * MEBIBYTE as usize, 6))],
    );

    let before = cluster.node(0).mdm.local_get_buffer_id_list(blob);
    cluster
        .node(0)
        .organizer
        .organize_blob(bucket, &name, EPSILON, None)
        .expect("organize");
    cluster.quiesce();

    assert_eq!(cluster.node(0).mdm.local_get_buffer_id_list(blob), before);
    let score = cluster.access_score(0, blob).expect("score");
    assert!(score.abs() < 1e-4, "placement unchanged, score {score}");
    cluster.shutdown();
}

#[test]
fn full_demotion_takes_one_move_per_buffer() {
    // Four equal buffers, importance 1.0: every buffer is moved exactly
    // once and the loop visits each source buffer at most once.
    let cluster = TestCluster::new(1, &tiers(10 * MEBIBYTE)).expect("cluster");
    let bucket = BucketId::from_parts(0, 1);
    let name = cluster.name_for_node(bucket, "archive", 0);
    let chunks: Vec<(u32, Vec<u8>)> = (0..4)
        .map(|i| (FAST, pattern((5 * MEBIBYTE / 2) as usize, 7 + i)))
        .collect();
    let blob = cluster.put_blob(0, bucket, &name, 1.0, &chunks);

    cluster
        .node(0)
        .organizer
        .organize_blob(bucket, &name, EPSILON, None)
        .expect("organize");
    cluster.quiesce();

    let node = cluster.node(0);
    let list = node.mdm.local_get_buffer_id_list(blob);
    assert_eq!(list.len(), 4);
    for id in &list {
        assert_eq!(node.pool.device_of(*id), Some(SLOW));
    }
    let score = cluster.access_score(0, blob).expect("score");
    assert!((score - 1.0).abs() < 1e-4, "score {score}");

    // The fast tier got everything back.
    let targets = node.pool.local_targets();
    let remaining = node.pool.remaining_target_capacities(&targets);
    assert_eq!(remaining[FAST as usize], 10 * MEBIBYTE);
    cluster.shutdown();
}

#[test]
fn non_authoritative_callers_forward_over_rpc() {
    let cluster = TestCluster::new(2, &tiers(10 * MEBIBYTE)).expect("cluster");
    let bucket = BucketId::from_parts(1, 1);
    // Blob metadata and data both live on node 1.
    let name = cluster.name_for_node(bucket, "remote", 1);
    let blob = cluster.put_blob(
        1,
        bucket,
        &name,
        0.9,
        &[
            (FAST, pattern(9 * MEBIBYTE as usize, 11)),
            (FAST, pattern(MEBIBYTE as usize, 12)),
        ],
    );

    // Organize from node 0: it is not authoritative, so the call routes
    // to node 1, which runs the pass and queues the move locally.
    cluster
        .node(0)
        .organizer
        .organize_blob(bucket, &name, EPSILON, None)
        .expect("organize via rpc");
    cluster.quiesce();

    let after = cluster.access_score(1, blob).expect("score");
    assert!(
        (0.9 - EPSILON as f32..=0.9 + EPSILON as f32).contains(&after),
        "score after remote organize = {after}"
    );
    cluster.shutdown();
}
