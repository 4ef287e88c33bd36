//! Access-score math and the placement sort orders.
//!
//! The access score estimates expected read time for a blob given its
//! current buffer placement, normalized so that 0 is the all-fastest-device
//! placement and 1 the all-slowest. Importance scores arrive in the same
//! normalized space, which is what lets the organizer hill-climb the
//! difference.

use std::cmp::Ordering;
use strata_types::{BufferId, BufferInfo, PoolBandwidthRange, TargetInfo, MEBIBYTE};

/// Byte count as a fractional mebibyte figure.
#[must_use]
pub fn bytes_to_megabytes(bytes: u64) -> f32 {
    bytes as f32 / MEBIBYTE as f32
}

/// Normalize a raw "total seconds" figure into [0, 1] against the best and
/// worst cases for the same total size: all bytes on the fastest device
/// versus all bytes on the slowest.
///
/// A single-tier pool has no range; the score is defined as 0 there, as it
/// is for an empty blob.
#[must_use]
pub fn normalize_access_score(range: PoolBandwidthRange, raw_seconds: f32, total_mb: f32) -> f32 {
    if range.min_mbps <= 0.0 || range.max_mbps <= 0.0 {
        return 0.0;
    }
    let best_seconds = total_mb / range.max_mbps;
    let worst_seconds = total_mb / range.min_mbps;
    let span = worst_seconds - best_seconds;
    if span <= 0.0 {
        return 0.0;
    }
    (raw_seconds - best_seconds) / span
}

/// Compute a blob's normalized access score from its buffer snapshots.
///
/// Invariant under permutation of `buffer_info`: the score is a sum over
/// rows plus a normalization that only sees totals.
#[must_use]
pub fn compute_blob_access_score(
    range: PoolBandwidthRange,
    buffer_info: &[BufferInfo],
) -> f32 {
    let mut raw_seconds = 0.0_f32;
    let mut total_mb = 0.0_f32;

    for info in buffer_info {
        let size_mb = bytes_to_megabytes(info.size);
        total_mb += size_mb;
        if info.bandwidth_mbps > 0.0 {
            raw_seconds += size_mb / info.bandwidth_mbps;
        }
    }

    if total_mb == 0.0 {
        return 0.0;
    }
    normalize_access_score(range, raw_seconds, total_mb)
}

/// Recompute the score as if `src` had been moved to a device with
/// `new_bandwidth_mbps`, leaving every other row untouched.
#[must_use]
pub fn predict_access_score(
    range: PoolBandwidthRange,
    buffer_info: &[BufferInfo],
    src: BufferId,
    new_bandwidth_mbps: f32,
) -> f32 {
    let hypothetical: Vec<BufferInfo> = buffer_info
        .iter()
        .map(|info| {
            if info.id == src {
                BufferInfo {
                    bandwidth_mbps: new_bandwidth_mbps,
                    ..*info
                }
            } else {
                *info
            }
        })
        .collect();
    compute_blob_access_score(range, &hypothetical)
}

fn buffer_order(lhs: &BufferInfo, rhs: &BufferInfo, increasing: bool) -> Ordering {
    let primary = if increasing {
        // Raising the score: visit the fastest-placed buffers first.
        rhs.bandwidth_mbps.total_cmp(&lhs.bandwidth_mbps)
    } else {
        lhs.bandwidth_mbps.total_cmp(&rhs.bandwidth_mbps)
    };
    // Bandwidth ties fall through to size, larger first in both directions.
    primary.then_with(|| rhs.size.cmp(&lhs.size))
}

/// Order buffer snapshots for the organizer walk. Stable, so equal rows
/// keep their input order.
pub fn sort_buffer_info(buffer_info: &mut [BufferInfo], increasing: bool) {
    buffer_info.sort_by(|lhs, rhs| buffer_order(lhs, rhs, increasing));
}

/// Order candidate targets by bandwidth: ascending when the score must
/// rise (slow targets first), descending when it must fall. Stable, so
/// bandwidth ties keep their input order.
pub fn sort_target_info(target_info: &mut [TargetInfo], increasing: bool) {
    target_info.sort_by(|lhs, rhs| {
        if increasing {
            lhs.bandwidth_mbps.total_cmp(&rhs.bandwidth_mbps)
        } else {
            rhs.bandwidth_mbps.total_cmp(&lhs.bandwidth_mbps)
        }
    });
}
