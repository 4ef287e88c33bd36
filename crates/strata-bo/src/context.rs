//! The explicit per-node context threaded through every organizer
//! operation: node identity plus handles to the borrowed subsystems.
//!
//! Cross-node operations route by authority. Buffer snapshots go to the
//! buffer's owning node; blob locks go to the blob's authoritative node;
//! vbucket counters go to the node that hashes from the vbucket name.

use std::sync::Arc;
use strata_error::{BoError, Result};
use strata_rpc::{remote_get_buffer_info, remote_lock_blob, remote_unlock_blob, RpcTransport};
use strata_types::{BlobId, BufferId, BufferInfo};
use tracing::warn;

use crate::meta::{BufferPool, MetadataManager, PlacementEngine};

/// Everything one node's organizer borrows from the surrounding system.
pub struct BoContext {
    pub node_id: u32,
    pub num_nodes: u32,
    pub mdm: Arc<dyn MetadataManager>,
    pub pool: Arc<dyn BufferPool>,
    pub dpe: Arc<dyn PlacementEngine>,
    pub transport: Arc<dyn RpcTransport>,
}

impl BoContext {
    /// Snapshot one buffer's bandwidth and used size, locally or over RPC.
    pub fn get_buffer_info(&self, buffer_id: BufferId) -> Result<BufferInfo> {
        if buffer_id.node_id() == self.node_id {
            self.local_get_buffer_info(buffer_id)
        } else {
            remote_get_buffer_info(self.transport.as_ref(), buffer_id.node_id(), buffer_id)
        }
    }

    /// Buffer snapshot from this node's own pool.
    pub fn local_get_buffer_info(&self, buffer_id: BufferId) -> Result<BufferInfo> {
        let header = self
            .pool
            .buffer_header(buffer_id)
            .ok_or(BoError::BufferUnresolved {
                buffer: buffer_id.as_u64(),
            })?;
        let bandwidth_mbps = self
            .pool
            .device_bandwidth_mbps(header.device_index)
            .ok_or(BoError::BufferUnresolved {
                buffer: buffer_id.as_u64(),
            })?;
        Ok(BufferInfo {
            id: buffer_id,
            bandwidth_mbps,
            size: header.used,
        })
    }

    /// Snapshot a whole buffer list, preserving order.
    pub fn get_buffer_info_list(&self, buffer_ids: &[BufferId]) -> Result<Vec<BufferInfo>> {
        buffer_ids
            .iter()
            .map(|id| self.get_buffer_info(*id))
            .collect()
    }

    /// Try-lock `blob_id` on its authoritative node.
    pub fn lock_blob(&self, blob_id: BlobId) -> Result<bool> {
        if blob_id.node_id() == self.node_id {
            Ok(self.mdm.local_lock_blob(blob_id))
        } else {
            remote_lock_blob(self.transport.as_ref(), blob_id.node_id(), blob_id)
        }
    }

    /// Release `blob_id` on its authoritative node.
    pub fn unlock_blob(&self, blob_id: BlobId) -> Result<bool> {
        if blob_id.node_id() == self.node_id {
            Ok(self.mdm.local_unlock_blob(blob_id))
        } else {
            remote_unlock_blob(self.transport.as_ref(), blob_id.node_id(), blob_id)
        }
    }
}

/// Holds the distributed blob lock for a scope.
///
/// The lock is released on drop no matter how the scope exits, so an RPC
/// error inside a move or flush cannot strand a remote-held lock.
pub struct BlobLockGuard<'a> {
    ctx: &'a BoContext,
    blob_id: BlobId,
}

impl<'a> BlobLockGuard<'a> {
    /// Try to take the blob lock. `BlobLockContended` means another mover
    /// or flusher owns the blob right now; callers abandon the task.
    pub fn try_acquire(ctx: &'a BoContext, blob_id: BlobId) -> Result<Self> {
        if ctx.lock_blob(blob_id)? {
            Ok(Self { ctx, blob_id })
        } else {
            Err(BoError::BlobLockContended {
                blob: blob_id.as_u64(),
            })
        }
    }
}

impl Drop for BlobLockGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.ctx.unlock_blob(self.blob_id) {
            // Drop cannot propagate; the contended blob stays visible in
            // the log.
            warn!(
                event = "blob_unlock_failed",
                blob = %self.blob_id,
                error = %err
            );
        }
    }
}
