#![forbid(unsafe_code)]
//! Core types for the Strata buffer organizer.
//!
//! Identifiers are opaque 64-bit values packing `(node_id, index)`. The
//! packing is an implementation detail: callers go through the accessor
//! methods, and the wire carries the packed integer bit-identically.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One mebibyte, the unit the cost model normalizes sizes to.
pub const MEBIBYTE: u64 = 1 << 20;

#[inline]
fn pack(node_id: u32, index: u32) -> u64 {
    (u64::from(node_id) << 32) | u64::from(index)
}

#[inline]
fn unpack_node(packed: u64) -> u32 {
    (packed >> 32) as u32
}

#[inline]
fn unpack_index(packed: u64) -> u32 {
    (packed & 0xFFFF_FFFF) as u32
}

// ── Packed identifiers ──────────────────────────────────────────────────────

/// Identifies one fixed-capacity buffer on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BufferId(u64);

impl BufferId {
    #[must_use]
    pub fn from_parts(node_id: u32, index: u32) -> Self {
        Self(pack(node_id, index))
    }

    #[must_use]
    pub fn from_u64(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// The node whose buffer pool owns this buffer.
    #[must_use]
    pub fn node_id(self) -> u32 {
        unpack_node(self.0)
    }

    /// Pool-local buffer index on the owning node.
    #[must_use]
    pub fn index(self) -> u32 {
        unpack_index(self.0)
    }
}

/// Identifies one device on one node; the unit placement schemas address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TargetId(u64);

impl TargetId {
    #[must_use]
    pub fn from_parts(node_id: u32, device_index: u32) -> Self {
        Self(pack(node_id, device_index))
    }

    #[must_use]
    pub fn from_u64(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn node_id(self) -> u32 {
        unpack_node(self.0)
    }

    /// Device index within the owning node's inventory.
    #[must_use]
    pub fn device_index(self) -> u32 {
        unpack_index(self.0)
    }
}

/// Identifies a blob. The `node_id` half names the node that is
/// authoritative for the blob's metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlobId(u64);

impl BlobId {
    /// The null blob, used where a lookup may miss.
    pub const NULL: Self = Self(0);

    #[must_use]
    pub fn from_parts(node_id: u32, index: u32) -> Self {
        Self(pack(node_id, index))
    }

    #[must_use]
    pub fn from_u64(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// The node authoritative for this blob's metadata.
    #[must_use]
    pub fn node_id(self) -> u32 {
        unpack_node(self.0)
    }

    #[must_use]
    pub fn index(self) -> u32 {
        unpack_index(self.0)
    }

    #[must_use]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Identifies a bucket (a logical grouping of blobs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BucketId(u64);

impl BucketId {
    pub const NULL: Self = Self(0);

    #[must_use]
    pub fn from_parts(node_id: u32, index: u32) -> Self {
        Self(pack(node_id, index))
    }

    #[must_use]
    pub fn from_u64(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn node_id(self) -> u32 {
        unpack_node(self.0)
    }

    #[must_use]
    pub fn index(self) -> u32 {
        unpack_index(self.0)
    }

    #[must_use]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Identifies a virtual bucket, which additionally tracks async-flush
/// accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VBucketId(u64);

impl VBucketId {
    pub const NULL: Self = Self(0);

    #[must_use]
    pub fn from_parts(node_id: u32, index: u32) -> Self {
        Self(pack(node_id, index))
    }

    #[must_use]
    pub fn from_u64(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn node_id(self) -> u32 {
        unpack_node(self.0)
    }

    #[must_use]
    pub fn index(self) -> u32 {
        unpack_index(self.0)
    }

    #[must_use]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node_id(), self.index())
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node_id(), self.device_index())
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node_id(), self.index())
    }
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node_id(), self.index())
    }
}

impl fmt::Display for VBucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node_id(), self.index())
    }
}

// ── Ephemeral snapshots ─────────────────────────────────────────────────────

/// Snapshot of one buffer captured while organizing or sorting.
///
/// `bandwidth_mbps` is the measured bandwidth of the owning device; `size`
/// is the buffer's used byte count, never its capacity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BufferInfo {
    pub id: BufferId,
    pub bandwidth_mbps: f32,
    pub size: u64,
}

/// Snapshot of one target's bandwidth and remaining capacity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetInfo {
    pub id: TargetId,
    pub bandwidth_mbps: f32,
    pub capacity: u64,
}

/// Pool-wide min/max device bandwidths used to normalize access scores.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoolBandwidthRange {
    pub min_mbps: f32,
    pub max_mbps: f32,
}

/// A blob temporarily spilled to a swap file because no buffers were
/// available at placement time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapBlob {
    pub node_id: u32,
    pub offset: u64,
    pub size: u64,
    pub bucket_id: BucketId,
}

// ── Placement schema ────────────────────────────────────────────────────────

/// One `(size, target)` leg of a placement schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubPlacement {
    pub size: u64,
    pub target: TargetId,
}

/// Ordered list of `(size, target)` pairs describing where to allocate
/// buffers for a blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementSchema {
    pub placements: Vec<SubPlacement>,
}

impl PlacementSchema {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, size: u64, target: TargetId) {
        self.placements.push(SubPlacement { size, target });
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.placements.is_empty()
    }

    /// Total bytes this schema allocates, saturating on overflow.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.placements
            .iter()
            .fold(0_u64, |acc, p| acc.saturating_add(p.size))
    }

    /// Merge adjacent and non-adjacent legs that address the same target
    /// into one leg per target, preserving first-appearance order.
    #[must_use]
    pub fn aggregate(&self) -> Self {
        let mut out: Vec<SubPlacement> = Vec::new();
        for p in &self.placements {
            match out.iter_mut().find(|q| q.target == p.target) {
                Some(q) => q.size = q.size.saturating_add(p.size),
                None => out.push(*p),
            }
        }
        Self { placements: out }
    }
}

// ── Wire enums ──────────────────────────────────────────────────────────────
//
// Discriminants are part of the wire contract (little-endian u32); do not
// reorder.

/// Which ID map a metadata name lookup addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum MapType {
    BucketId = 0,
    VBucketId = 1,
    BlobId = 2,
}

impl MapType {
    #[must_use]
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    #[must_use]
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::BucketId),
            1 => Some(Self::VBucketId),
            2 => Some(Self::BlobId),
            _ => None,
        }
    }
}

/// Priority class attached to each work-queue enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum BoPriority {
    High = 0,
    Low = 1,
}

impl BoPriority {
    #[must_use]
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    #[must_use]
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::High),
            1 => Some(Self::Low),
            _ => None,
        }
    }
}

/// Operation carried by a buffer-organizer task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum BoOperation {
    Move = 0,
    Copy = 1,
    Delete = 2,
}

impl BoOperation {
    #[must_use]
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    #[must_use]
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Move),
            1 => Some(Self::Copy),
            2 => Some(Self::Delete),
            _ => None,
        }
    }
}

/// Which side of a capacity threshold a target violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum ThresholdViolation {
    Min = 0,
    Max = 1,
}

impl ThresholdViolation {
    #[must_use]
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    #[must_use]
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Min),
            1 => Some(Self::Max),
            _ => None,
        }
    }
}

/// Caller-supplied access-pattern hint carried in the request context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum PrefetchHint {
    #[default]
    None = 0,
    FileSequential = 1,
    Apriori = 2,
    FileStrided = 3,
    MachineLearning = 4,
}

impl PrefetchHint {
    #[must_use]
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    #[must_use]
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::None),
            1 => Some(Self::FileSequential),
            2 => Some(Self::Apriori),
            3 => Some(Self::FileStrided),
            4 => Some(Self::MachineLearning),
            _ => None,
        }
    }
}

/// Arguments for one buffer-organizer task, tagged by operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoTask {
    /// Read `src` and rewrite its bytes across `dests` in order, then swap
    /// the blob's buffer-ID list.
    Move {
        src: BufferId,
        dests: Vec<BufferId>,
        blob: BlobId,
    },
    /// Replicate `src` onto `dest` without retiring the original.
    Copy { src: BufferId, dest: TargetId },
    /// Release `src` back to its pool.
    Delete { src: BufferId },
}

impl BoTask {
    #[must_use]
    pub fn operation(&self) -> BoOperation {
        match self {
            Self::Move { .. } => BoOperation::Move,
            Self::Copy { .. } => BoOperation::Copy,
            Self::Delete { .. } => BoOperation::Delete,
        }
    }
}

/// Report of one target exceeding or undershooting a capacity threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViolationInfo {
    pub target: TargetId,
    pub violation: ThresholdViolation,
    pub violation_size: u64,
}

/// Prefetcher inputs carried in the request context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefetchContext {
    pub hint: PrefetchHint,
    pub read_ahead: u32,
}

/// Per-request policy context passed explicitly through every operation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Context {
    /// Placement retries the surrounding system may attempt after a failed
    /// re-placement from swap.
    pub buffer_organizer_retries: u32,
    /// Retry round-robin placement with a different starting device.
    pub rr_retry: bool,
    /// Refuse to spill to swap when placement fails.
    pub disable_swap: bool,
    pub prefetch: PrefetchContext,
}

impl Default for Context {
    fn default() -> Self {
        Self {
            buffer_organizer_retries: 3,
            rr_retry: false,
            disable_swap: false,
            prefetch: PrefetchContext::default(),
        }
    }
}

// ── Naming and routing ──────────────────────────────────────────────────────

/// Bucket-scoped internal blob name.
///
/// Blob names are only unique within a bucket; the internal name prefixes
/// the packed bucket id so the global name→id maps stay collision-free.
#[must_use]
pub fn internal_blob_name(bucket_id: BucketId, blob_name: &str) -> String {
    format!("{:016x}#{}", bucket_id.as_u64(), blob_name)
}

/// FNV-1a 64-bit hash, the stable name hash used for routing.
#[must_use]
pub fn hash_name(name: &str) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = FNV_OFFSET;
    for byte in name.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// The node on which metadata updates for `name` are serialized.
///
/// Every node computes the same answer, so a caller that is not the
/// authoritative node forwards over RPC instead of mutating locally.
#[must_use]
pub fn node_for_name(name: &str, num_nodes: u32) -> u32 {
    debug_assert!(num_nodes > 0);
    (hash_name(name) % u64::from(num_nodes.max(1))) as u32
}
