#![forbid(unsafe_code)]
//! In-memory cluster fixtures for exercising the buffer organizer
//! end-to-end: a RAM metadata manager, a tiered RAM buffer pool, a greedy
//! capacity-first placement engine, and a loopback transport wiring N
//! nodes together.
//!
//! Everything here is deterministic and single-process. Worker pools are
//! real; "remote" calls run synchronously over the loopback transport.

pub mod scenario;

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use strata_bo::{
    BoContext, BufferHeader, BufferOrganizer, BufferPool, MetadataManager, OrganizerConfig,
    PlacementEngine, VBucketInfo, WorkQueueConfig,
};
use strata_error::{BoError, Result};
use strata_rpc::{LoopbackTransport, RpcServer};
use strata_types::{
    internal_blob_name, node_for_name, BlobId, BucketId, BufferId, BufferInfo, Context, MapType,
    PlacementSchema, PoolBandwidthRange, SwapBlob, TargetId,
};

// ── RAM metadata manager ────────────────────────────────────────────────────

#[derive(Default)]
struct MdmState {
    blob_ids: HashMap<String, u64>,
    bucket_ids: HashMap<String, u64>,
    vbucket_ids: HashMap<String, u64>,
    buffer_lists: HashMap<u64, Vec<BufferId>>,
    importance: HashMap<u64, f32>,
    locked_blobs: HashSet<u64>,
    vbuckets: HashMap<String, Arc<VBucketInfo>>,
    swap_blobs: HashSet<u64>,
    next_blob_index: u32,
}

/// Metadata manager over plain in-memory maps.
pub struct RamMetadataManager {
    node_id: u32,
    state: Mutex<MdmState>,
}

impl RamMetadataManager {
    #[must_use]
    pub fn new(node_id: u32) -> Self {
        Self {
            node_id,
            state: Mutex::new(MdmState {
                next_blob_index: 1,
                ..MdmState::default()
            }),
        }
    }

    /// Register a blob under its internal name with an explicit buffer
    /// list and importance score. Returns the new blob's ID.
    pub fn create_blob(
        &self,
        internal_name: &str,
        buffers: Vec<BufferId>,
        importance: f32,
    ) -> BlobId {
        let mut state = self.state.lock();
        let blob_id = BlobId::from_parts(self.node_id, state.next_blob_index);
        state.next_blob_index += 1;
        state.blob_ids.insert(internal_name.to_owned(), blob_id.as_u64());
        state.buffer_lists.insert(blob_id.as_u64(), buffers);
        state.importance.insert(blob_id.as_u64(), importance);
        blob_id
    }

    pub fn set_importance(&self, blob: BlobId, importance: f32) {
        self.state.lock().importance.insert(blob.as_u64(), importance);
    }

    /// Create the flush-accounting record for a vbucket.
    pub fn create_vbucket(&self, name: &str) -> Arc<VBucketInfo> {
        let mut state = self.state.lock();
        let index = state.vbucket_ids.len() as u32 + 1;
        let info = Arc::new(VBucketInfo::new(name));
        state.vbucket_ids.insert(name.to_owned(), u64::from(index));
        state.vbuckets.insert(name.to_owned(), Arc::clone(&info));
        info
    }

    pub fn mark_in_swap(&self, blob: BlobId) {
        self.state.lock().swap_blobs.insert(blob.as_u64());
    }
}

impl MetadataManager for RamMetadataManager {
    fn local_get_id(&self, name: &str, map: MapType) -> Option<u64> {
        let state = self.state.lock();
        let table = match map {
            MapType::BlobId => &state.blob_ids,
            MapType::BucketId => &state.bucket_ids,
            MapType::VBucketId => &state.vbucket_ids,
        };
        table.get(name).copied()
    }

    fn local_get_buffer_id_list(&self, blob: BlobId) -> Vec<BufferId> {
        self.state
            .lock()
            .buffer_lists
            .get(&blob.as_u64())
            .cloned()
            .unwrap_or_default()
    }

    fn local_set_buffer_id_list(&self, blob: BlobId, buffers: Vec<BufferId>) {
        self.state.lock().buffer_lists.insert(blob.as_u64(), buffers);
    }

    fn local_blob_importance(&self, blob: BlobId) -> f32 {
        self.state
            .lock()
            .importance
            .get(&blob.as_u64())
            .copied()
            .unwrap_or(0.0)
    }

    fn local_lock_blob(&self, blob: BlobId) -> bool {
        self.state.lock().locked_blobs.insert(blob.as_u64())
    }

    fn local_unlock_blob(&self, blob: BlobId) -> bool {
        self.state.lock().locked_blobs.remove(&blob.as_u64())
    }

    fn local_vbucket_info(&self, name: &str) -> Option<Arc<VBucketInfo>> {
        self.state.lock().vbuckets.get(name).cloned()
    }

    fn blob_is_in_swap(&self, blob: BlobId) -> bool {
        self.state.lock().swap_blobs.contains(&blob.as_u64())
    }
}

// ── Tiered RAM buffer pool ──────────────────────────────────────────────────

/// One storage tier in a [`RamBufferPool`].
#[derive(Debug, Clone, Copy)]
pub struct TierSpec {
    pub bandwidth_mbps: f32,
    pub capacity: u64,
    /// Largest buffer the tier hands out per allocation.
    pub buffer_size: u64,
}

struct DeviceState {
    spec: TierSpec,
    allocated: u64,
}

struct RamBuffer {
    device_index: u32,
    capacity: u64,
    data: Vec<u8>,
}

struct PoolState {
    devices: Vec<DeviceState>,
    buffers: HashMap<u64, RamBuffer>,
    swap: HashMap<u64, Vec<u8>>,
    next_index: u32,
}

/// Buffer pool whose devices are plain byte vectors.
pub struct RamBufferPool {
    node_id: u32,
    mdm: Arc<RamMetadataManager>,
    state: Mutex<PoolState>,
}

impl RamBufferPool {
    #[must_use]
    pub fn new(node_id: u32, mdm: Arc<RamMetadataManager>, tiers: &[TierSpec]) -> Self {
        Self {
            node_id,
            mdm,
            state: Mutex::new(PoolState {
                devices: tiers
                    .iter()
                    .map(|spec| DeviceState {
                        spec: *spec,
                        allocated: 0,
                    })
                    .collect(),
                buffers: HashMap::new(),
                swap: HashMap::new(),
                next_index: 1,
            }),
        }
    }

    /// Place a pre-filled buffer on a tier, charging its capacity.
    pub fn seed_buffer(&self, device_index: u32, data: &[u8]) -> BufferId {
        let mut state = self.state.lock();
        let id = BufferId::from_parts(self.node_id, state.next_index);
        state.next_index += 1;
        let capacity = data.len() as u64;
        state.devices[device_index as usize].allocated += capacity;
        state.buffers.insert(
            id.as_u64(),
            RamBuffer {
                device_index,
                capacity,
                data: data.to_vec(),
            },
        );
        id
    }

    /// Which device a buffer currently sits on.
    pub fn device_of(&self, id: BufferId) -> Option<u32> {
        self.state.lock().buffers.get(&id.as_u64()).map(|b| b.device_index)
    }

    /// Stage bytes in the pool's swap area at `offset`.
    pub fn stash_swap(&self, offset: u64, data: &[u8]) {
        self.state.lock().swap.insert(offset, data.to_vec());
    }

    fn allocate(&self, state: &mut PoolState, device_index: u32, capacity: u64) -> Option<BufferId> {
        let device = &mut state.devices[device_index as usize];
        if device.spec.capacity.saturating_sub(device.allocated) < capacity {
            return None;
        }
        device.allocated += capacity;
        let id = BufferId::from_parts(self.node_id, state.next_index);
        state.next_index += 1;
        state.buffers.insert(
            id.as_u64(),
            RamBuffer {
                device_index,
                capacity,
                data: Vec::new(),
            },
        );
        Some(id)
    }
}

impl BufferPool for RamBufferPool {
    fn buffer_header(&self, id: BufferId) -> Option<BufferHeader> {
        self.state.lock().buffers.get(&id.as_u64()).map(|b| BufferHeader {
            capacity: b.capacity,
            used: b.data.len() as u64,
            device_index: b.device_index,
        })
    }

    fn device_bandwidth_mbps(&self, device_index: u32) -> Option<f32> {
        self.state
            .lock()
            .devices
            .get(device_index as usize)
            .map(|d| d.spec.bandwidth_mbps)
    }

    fn bandwidth_range(&self) -> PoolBandwidthRange {
        let state = self.state.lock();
        let mut min_mbps = f32::MAX;
        let mut max_mbps = 0.0_f32;
        for device in &state.devices {
            min_mbps = min_mbps.min(device.spec.bandwidth_mbps);
            max_mbps = max_mbps.max(device.spec.bandwidth_mbps);
        }
        if state.devices.is_empty() {
            return PoolBandwidthRange {
                min_mbps: 0.0,
                max_mbps: 0.0,
            };
        }
        PoolBandwidthRange { min_mbps, max_mbps }
    }

    fn local_targets(&self) -> Vec<TargetId> {
        let state = self.state.lock();
        (0..state.devices.len() as u32)
            .map(|index| TargetId::from_parts(self.node_id, index))
            .collect()
    }

    fn target_bandwidths(&self, targets: &[TargetId]) -> Vec<f32> {
        let state = self.state.lock();
        targets
            .iter()
            .map(|t| state.devices[t.device_index() as usize].spec.bandwidth_mbps)
            .collect()
    }

    fn remaining_target_capacities(&self, targets: &[TargetId]) -> Vec<u64> {
        let state = self.state.lock();
        targets
            .iter()
            .map(|t| {
                let device = &state.devices[t.device_index() as usize];
                device.spec.capacity.saturating_sub(device.allocated)
            })
            .collect()
    }

    fn get_buffers(&self, schema: &PlacementSchema) -> Vec<BufferId> {
        let mut state = self.state.lock();
        let mut allocated = Vec::new();
        for placement in &schema.placements {
            debug_assert_eq!(placement.target.node_id(), self.node_id);
            let device_index = placement.target.device_index();
            let buffer_size = state.devices[device_index as usize].spec.buffer_size;
            let mut needed = placement.size;
            while needed > 0 {
                let capacity = needed.min(buffer_size);
                match self.allocate(&mut state, device_index, capacity) {
                    Some(id) => {
                        allocated.push(id);
                        needed -= capacity;
                    }
                    None => {
                        // Roll the whole request back; allocation is
                        // all-or-nothing.
                        for id in allocated {
                            let buffer = state.buffers.remove(&id.as_u64());
                            if let Some(buffer) = buffer {
                                state.devices[buffer.device_index as usize].allocated -=
                                    buffer.capacity;
                            }
                        }
                        return Vec::new();
                    }
                }
            }
        }
        allocated
    }

    fn release_buffer(&self, id: BufferId) {
        let mut state = self.state.lock();
        if let Some(buffer) = state.buffers.remove(&id.as_u64()) {
            state.devices[buffer.device_index as usize].allocated -= buffer.capacity;
        }
    }

    fn local_read_buffer(&self, id: BufferId, buf: &mut [u8], offset: u64) -> Result<usize> {
        let state = self.state.lock();
        let buffer = state.buffers.get(&id.as_u64()).ok_or(BoError::BufferUnresolved {
            buffer: id.as_u64(),
        })?;
        let start = offset as usize;
        let len = buf.len().min(buffer.data.len().saturating_sub(start));
        buf[..len].copy_from_slice(&buffer.data[start..start + len]);
        Ok(len)
    }

    fn local_write_buffer(&self, id: BufferId, data: &[u8], offset: u64) -> Result<usize> {
        let mut state = self.state.lock();
        let buffer = state
            .buffers
            .get_mut(&id.as_u64())
            .ok_or(BoError::BufferUnresolved {
                buffer: id.as_u64(),
            })?;
        let end = offset as usize + data.len();
        if end as u64 > buffer.capacity {
            return Err(BoError::TargetsFull {
                needed: end as u64 - buffer.capacity,
            });
        }
        if buffer.data.len() < end {
            buffer.data.resize(end, 0);
        }
        buffer.data[offset as usize..end].copy_from_slice(data);
        Ok(data.len())
    }

    fn read_from_swap(&self, swap: &SwapBlob) -> Result<Vec<u8>> {
        self.state
            .lock()
            .swap
            .get(&swap.offset)
            .cloned()
            .ok_or_else(|| BoError::NotFound(format!("swap blob at offset {}", swap.offset)))
    }

    fn place_blob(
        &self,
        schema: &PlacementSchema,
        data: &[u8],
        name: &str,
        bucket: BucketId,
        _ctx: &Context,
    ) -> Result<()> {
        let dests = self.get_buffers(schema);
        if dests.is_empty() {
            return Err(BoError::PlacementFailed(format!(
                "no buffers for {} bytes",
                data.len()
            )));
        }
        let mut offset = 0_usize;
        for dest in &dests {
            if offset == data.len() {
                break;
            }
            let capacity = self
                .buffer_header(*dest)
                .map(|h| h.capacity as usize)
                .unwrap_or(0);
            let portion = capacity.min(data.len() - offset);
            self.local_write_buffer(*dest, &data[offset..offset + portion], 0)?;
            offset += portion;
        }
        if offset != data.len() {
            return Err(BoError::PlacementFailed("schema under-sized".to_owned()));
        }
        self.mdm
            .create_blob(&internal_blob_name(bucket, name), dests, 0.0);
        Ok(())
    }
}

// ── Greedy placement engine ─────────────────────────────────────────────────

/// Capacity-first placement: fastest tier with room wins, splitting
/// across tiers only when no single tier can hold the blob.
pub struct GreedyPlacementEngine {
    pool: Arc<RamBufferPool>,
}

impl GreedyPlacementEngine {
    #[must_use]
    pub fn new(pool: Arc<RamBufferPool>) -> Self {
        Self { pool }
    }
}

impl PlacementEngine for GreedyPlacementEngine {
    fn calculate_placement(&self, sizes: &[u64], _ctx: &Context) -> Result<Vec<PlacementSchema>> {
        let targets = self.pool.local_targets();
        let bandwidths = self.pool.target_bandwidths(&targets);
        let capacities = self.pool.remaining_target_capacities(&targets);

        let mut ranked: Vec<(TargetId, f32, u64)> = targets
            .into_iter()
            .zip(bandwidths)
            .zip(capacities)
            .map(|((t, bw), cap)| (t, bw, cap))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));

        let mut schemas = Vec::with_capacity(sizes.len());
        for size in sizes {
            let mut schema = PlacementSchema::new();
            let mut remaining = *size;
            for (target, _bw, capacity) in &ranked {
                if remaining == 0 {
                    break;
                }
                let take = remaining.min(*capacity);
                if take > 0 {
                    schema.push(take, *target);
                    remaining -= take;
                }
            }
            if remaining > 0 {
                return Err(BoError::PlacementFailed(format!(
                    "hierarchy cannot hold {size} bytes"
                )));
            }
            schemas.push(schema);
        }
        Ok(schemas)
    }
}

// ── Cluster fixture ─────────────────────────────────────────────────────────

/// One node's wired-up subsystems.
pub struct TestNode {
    pub mdm: Arc<RamMetadataManager>,
    pub pool: Arc<RamBufferPool>,
    pub organizer: Arc<BufferOrganizer>,
    pub server: Arc<RpcServer>,
}

/// An in-process cluster of `N` organizer nodes sharing a loopback
/// transport. Every node gets the same tier layout.
pub struct TestCluster {
    pub transport: Arc<LoopbackTransport>,
    pub nodes: Vec<TestNode>,
}

impl TestCluster {
    pub fn new(num_nodes: u32, tiers: &[TierSpec]) -> Result<Self> {
        Self::with_config(num_nodes, tiers, OrganizerConfig::default())
    }

    pub fn with_config(
        num_nodes: u32,
        tiers: &[TierSpec],
        config: OrganizerConfig,
    ) -> Result<Self> {
        let transport = Arc::new(LoopbackTransport::new());
        let mut nodes = Vec::with_capacity(num_nodes as usize);

        for node_id in 0..num_nodes {
            let mdm = Arc::new(RamMetadataManager::new(node_id));
            let pool = Arc::new(RamBufferPool::new(node_id, Arc::clone(&mdm), tiers));
            let dpe = Arc::new(GreedyPlacementEngine::new(Arc::clone(&pool)));
            let ctx = Arc::new(BoContext {
                node_id,
                num_nodes,
                mdm: Arc::clone(&mdm) as Arc<dyn MetadataManager>,
                pool: Arc::clone(&pool) as Arc<dyn BufferPool>,
                dpe,
                transport: Arc::clone(&transport) as Arc<dyn strata_rpc::RpcTransport>,
            });
            let organizer = Arc::new(BufferOrganizer::new(
                ctx,
                WorkQueueConfig::default(),
                config,
            )?);
            let server = Arc::new(RpcServer::new());
            organizer.register_procedures(&server);
            transport.register_node(node_id, Arc::clone(&server));

            nodes.push(TestNode {
                mdm,
                pool,
                organizer,
                server,
            });
        }

        Ok(Self { transport, nodes })
    }

    #[must_use]
    pub fn node(&self, node_id: u32) -> &TestNode {
        &self.nodes[node_id as usize]
    }

    /// Seed a blob on `node_id`: one buffer per `(tier, bytes)` pair, in
    /// order, registered on that node under the bucket-scoped name.
    ///
    /// The caller is responsible for picking a name whose authoritative
    /// node is `node_id` (see [`TestCluster::name_for_node`]).
    pub fn put_blob(
        &self,
        node_id: u32,
        bucket: BucketId,
        name: &str,
        importance: f32,
        placements: &[(u32, Vec<u8>)],
    ) -> BlobId {
        let node = self.node(node_id);
        let buffers: Vec<BufferId> = placements
            .iter()
            .map(|(tier, data)| node.pool.seed_buffer(*tier, data))
            .collect();
        node.mdm
            .create_blob(&internal_blob_name(bucket, name), buffers, importance)
    }

    /// Find a blob name with the given prefix that hashes to `node_id`.
    #[must_use]
    pub fn name_for_node(&self, bucket: BucketId, prefix: &str, node_id: u32) -> String {
        let num_nodes = self.nodes.len() as u32;
        for salt in 0..10_000_u32 {
            let candidate = format!("{prefix}-{salt}");
            if node_for_name(&internal_blob_name(bucket, &candidate), num_nodes) == node_id {
                return candidate;
            }
        }
        unreachable!("no name found for node {node_id}");
    }

    /// Reassemble a blob's bytes from its current placement.
    pub fn read_blob(&self, node_id: u32, blob: BlobId) -> Result<Vec<u8>> {
        let node = self.node(node_id);
        let mut out = Vec::new();
        for id in node.mdm.local_get_buffer_id_list(blob) {
            let header = node
                .pool
                .buffer_header(id)
                .ok_or(BoError::BufferUnresolved { buffer: id.as_u64() })?;
            let mut chunk = vec![0_u8; header.used as usize];
            node.pool.local_read_buffer(id, &mut chunk, 0)?;
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Current normalized access score of a blob on `node_id`.
    pub fn access_score(&self, node_id: u32, blob: BlobId) -> Result<f32> {
        let node = self.node(node_id);
        let ctx = node.organizer.context();
        let buffer_ids = node.mdm.local_get_buffer_id_list(blob);
        let info: Vec<BufferInfo> = ctx.get_buffer_info_list(&buffer_ids)?;
        Ok(strata_bo::cost::compute_blob_access_score(
            node.pool.bandwidth_range(),
            &info,
        ))
    }

    /// Wait for every node's queue to drain.
    pub fn quiesce(&self) {
        for node in &self.nodes {
            node.organizer.wait_idle();
        }
    }

    /// Shut down every organizer, draining queues.
    pub fn shutdown(&self) {
        for node in &self.nodes {
            node.organizer.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_types::MEBIBYTE;

    fn two_tier() -> Vec<TierSpec> {
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

    #[test]
    fn cluster_wires_loopback_round_trips() {
        let cluster = TestCluster::new(2, &two_tier()).expect("cluster");
        let bucket = BucketId::from_parts(0, 1);
        let name = cluster.name_for_node(bucket, "blob", 1);
        let blob = cluster.put_blob(1, bucket, &name, 0.5, &[(0, vec![1_u8; 1024])]);

        // Node 0 asks node 1 for the snapshot over the loopback.
        let ctx = cluster.node(0).organizer.context();
        let ids = cluster.node(1).mdm.local_get_buffer_id_list(blob);
        let info = ctx.get_buffer_info(ids[0]).expect("remote snapshot");
        assert_eq!(info.size, 1024);
        assert_eq!(info.bandwidth_mbps, 1000.0);
        cluster.shutdown();
    }

    #[test]
    fn greedy_placement_prefers_fast_then_splits() {
        let cluster = TestCluster::new(1, &two_tier()).expect("cluster");
        let node = cluster.node(0);
        let ctx = node.organizer.context();

        let schemas = ctx
            .dpe
            .calculate_placement(&[32 * MEBIBYTE], &Context::default())
            .expect("placement");
        assert_eq!(schemas[0].placements.len(), 1);
        assert_eq!(schemas[0].placements[0].target.device_index(), 0);

        // Larger than the fast tier: spills across both.
        let schemas = ctx
            .dpe
            .calculate_placement(&[128 * MEBIBYTE], &Context::default())
            .expect("placement");
        assert_eq!(schemas[0].placements.len(), 2);
        assert_eq!(schemas[0].total_size(), 128 * MEBIBYTE);
        cluster.shutdown();
    }
}
