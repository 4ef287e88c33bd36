//! Consumed interfaces: the metadata manager, buffer pool, and placement
//! engine the organizer borrows.
//!
//! The metadata manager exclusively owns the persistent name↔ID maps and
//! buffer-ID lists; the buffer pool owns the buffers and per-buffer I/O;
//! the placement engine owns policy. The organizer only ever mutates
//! metadata through these traits, which provide their own serialization.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use strata_error::Result;
use strata_types::{
    BlobId, BucketId, BufferId, Context, MapType, PlacementSchema, PoolBandwidthRange, SwapBlob,
    TargetId,
};
use tracing::trace;

/// Snapshot of one buffer's header: capacity, used bytes, owning device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferHeader {
    pub capacity: u64,
    pub used: u64,
    pub device_index: u32,
}

/// Per-vbucket flush accounting shared between flushers and the drain
/// barrier.
#[derive(Debug)]
pub struct VBucketInfo {
    name: String,
    async_flush_count: AtomicI64,
}

impl VBucketInfo {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            async_flush_count: AtomicI64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Outstanding async flushes. Zero at steady state; transient
    /// increments are always paired with decrements.
    #[must_use]
    pub fn outstanding_flushes(&self) -> i64 {
        self.async_flush_count.load(Ordering::Acquire)
    }

    /// Apply a signed adjustment and return the new count.
    pub fn adjust_flush_count(&self, adjustment: i64) -> i64 {
        let new = self
            .async_flush_count
            .fetch_add(adjustment, Ordering::AcqRel)
            + adjustment;
        trace!(
            event = "vbucket_flush_count",
            vbucket = %self.name,
            adjustment,
            count = new
        );
        new
    }
}

/// Node-local metadata manager surface consumed by the organizer.
pub trait MetadataManager: Send + Sync {
    /// Look up a packed ID by name in one of the three ID maps.
    fn local_get_id(&self, name: &str, map: MapType) -> Option<u64>;

    /// The blob's ordered buffer-ID list (a snapshot copy).
    fn local_get_buffer_id_list(&self, blob: BlobId) -> Vec<BufferId>;

    /// Replace the blob's buffer-ID list. Callers must hold the blob lock.
    fn local_set_buffer_id_list(&self, blob: BlobId, buffers: Vec<BufferId>);

    /// The blob's declared importance score in normalized [0, 1] space.
    fn local_blob_importance(&self, blob: BlobId) -> f32;

    /// Try-lock the blob for exclusive reorganization/flush. Never blocks.
    fn local_lock_blob(&self, blob: BlobId) -> bool;

    /// Release the blob lock. Returns false if the blob was not locked.
    fn local_unlock_blob(&self, blob: BlobId) -> bool;

    /// Flush accounting state for a vbucket, if the vbucket exists.
    fn local_vbucket_info(&self, name: &str) -> Option<Arc<VBucketInfo>>;

    /// Whether the blob currently lives in swap rather than in buffers.
    fn blob_is_in_swap(&self, blob: BlobId) -> bool;
}

/// Node-local buffer pool surface consumed by the organizer.
pub trait BufferPool: Send + Sync {
    /// Header for a pool-local buffer; `None` for buffers this node does
    /// not own (a cross-node miss).
    fn buffer_header(&self, id: BufferId) -> Option<BufferHeader>;

    /// Measured bandwidth of a local device.
    fn device_bandwidth_mbps(&self, device_index: u32) -> Option<f32>;

    /// Pool-wide min/max device bandwidths, for score normalization.
    fn bandwidth_range(&self) -> PoolBandwidthRange;

    /// The targets on this node.
    fn local_targets(&self) -> Vec<TargetId>;

    /// Bandwidths for `targets`, index-aligned.
    fn target_bandwidths(&self, targets: &[TargetId]) -> Vec<f32>;

    /// Remaining capacities for `targets`, index-aligned.
    fn remaining_target_capacities(&self, targets: &[TargetId]) -> Vec<u64>;

    /// Allocate buffers satisfying `schema`, in schema order. Empty when
    /// the allocation failed.
    fn get_buffers(&self, schema: &PlacementSchema) -> Vec<BufferId>;

    /// Return a buffer to the pool.
    fn release_buffer(&self, id: BufferId);

    /// Read up to `buf.len()` bytes from the buffer at `offset`.
    fn local_read_buffer(&self, id: BufferId, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Write `data` into the buffer at `offset`, growing `used` as needed.
    fn local_write_buffer(&self, id: BufferId, data: &[u8], offset: u64) -> Result<usize>;

    /// Materialize a swap-resident blob's bytes.
    fn read_from_swap(&self, swap: &SwapBlob) -> Result<Vec<u8>>;

    /// Write `data` into buffers per `schema` and register the blob under
    /// `name` in `bucket`.
    fn place_blob(
        &self,
        schema: &PlacementSchema,
        data: &[u8],
        name: &str,
        bucket: BucketId,
        ctx: &Context,
    ) -> Result<()>;
}

/// Data placement engine surface consumed by swap re-placement.
pub trait PlacementEngine: Send + Sync {
    /// One schema per requested size, or a placement error.
    fn calculate_placement(&self, sizes: &[u64], ctx: &Context) -> Result<Vec<PlacementSchema>>;
}
