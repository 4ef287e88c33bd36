//! The placement-improvement loop.
//!
//! `organize_blob` routes to the blob's authoritative node, which compares
//! the blob's declared importance with its current access score and
//! enqueues low-priority moves that push the score toward the importance
//! within an epsilon tolerance. One candidate move per source buffer at
//! most, so a pass always terminates; epsilon keeps successive passes from
//! oscillating across the optimum.

use std::sync::Arc;
use strata_error::{BoError, Result};
use strata_rpc::{
    remote_organize_blob, FlushTaskArgs, OrganizeBlobArgs, ProcedureId, RpcServer,
};
use strata_types::{
    internal_blob_name, node_for_name, BlobId, BoPriority, BoTask, BucketId, BufferId, MapType,
    PlacementSchema, TargetInfo,
};
use strata_wire::{from_slice, to_vec};
use tracing::{debug, info, warn};

use crate::context::BoContext;
use crate::cost::{
    compute_blob_access_score, predict_access_score, sort_buffer_info, sort_target_info,
};
use crate::flush;
use crate::movers;
use crate::queue::{WorkQueue, WorkQueueConfig};

/// Tuning for the organizer loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrganizerConfig {
    /// Also reject candidate moves that push the access score *away* from
    /// the importance target. Off by default: a move that lands short of
    /// the target is still accepted, and later passes finish the job.
    pub reject_undershoot: bool,
}

/// One node's buffer organizer: the two-priority worker pool plus the
/// organize entry points. Owns its pool on the heap; `shutdown` (or drop)
/// drains and joins it on every teardown path.
pub struct BufferOrganizer {
    ctx: Arc<BoContext>,
    queue: WorkQueue,
    config: OrganizerConfig,
}

impl BufferOrganizer {
    pub fn new(
        ctx: Arc<BoContext>,
        queue_config: WorkQueueConfig,
        config: OrganizerConfig,
    ) -> Result<Self> {
        Ok(Self {
            ctx,
            queue: WorkQueue::new(queue_config)?,
            config,
        })
    }

    #[must_use]
    pub fn context(&self) -> &Arc<BoContext> {
        &self.ctx
    }

    #[must_use]
    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    /// Hand a task to the local pool. Returns `false` when the queue
    /// refused it (bounded and full, or shutting down).
    pub fn enqueue_task(&self, task: BoTask, priority: BoPriority) -> bool {
        let ctx = Arc::clone(&self.ctx);
        self.queue
            .enqueue(priority, move || movers::execute(&ctx, &task))
    }

    /// Block until every queued task has run.
    pub fn wait_idle(&self) {
        self.queue.wait_idle();
    }

    /// Drain pending tasks and join the workers.
    pub fn shutdown(&self) {
        self.queue.shutdown();
    }

    /// Reshape `blob_name` in `bucket_id` so its access score approaches
    /// its importance score. Runs locally when this node is authoritative
    /// for the blob, otherwise forwards.
    ///
    /// `importance` overrides the score stored in the metadata manager;
    /// `None` fetches it there. An override is not forwarded over RPC, so
    /// remote organizing always uses the stored score.
    pub fn organize_blob(
        &self,
        bucket_id: BucketId,
        blob_name: &str,
        epsilon: f64,
        importance: Option<f32>,
    ) -> Result<()> {
        let internal_name = internal_blob_name(bucket_id, blob_name);
        let target_node = node_for_name(&internal_name, self.ctx.num_nodes);
        if target_node == self.ctx.node_id {
            self.local_organize_blob(&internal_name, epsilon, importance)
        } else {
            remote_organize_blob(
                self.ctx.transport.as_ref(),
                target_node,
                &internal_name,
                epsilon,
            )
        }
    }

    /// The authoritative-node organize pass.
    pub fn local_organize_blob(
        &self,
        internal_name: &str,
        epsilon: f64,
        importance: Option<f32>,
    ) -> Result<()> {
        let ctx = &self.ctx;
        let blob_id = ctx
            .mdm
            .local_get_id(internal_name, MapType::BlobId)
            .map(BlobId::from_u64)
            .ok_or_else(|| BoError::NotFound(format!("blob {internal_name}")))?;

        let importance = importance.unwrap_or_else(|| ctx.mdm.local_blob_importance(blob_id));
        let buffer_ids = ctx.mdm.local_get_buffer_id_list(blob_id);
        let mut buffer_info = ctx.get_buffer_info_list(&buffer_ids)?;
        let range = ctx.pool.bandwidth_range();
        let access_score = compute_blob_access_score(range, &buffer_info);

        if f64::from((importance - access_score).abs()) < epsilon {
            debug!(
                event = "organize_within_epsilon",
                blob = %blob_id,
                importance,
                access_score
            );
            return Ok(());
        }

        // A score below the importance must rise, which takes *slower*
        // placement; the sort orders below follow from that direction.
        let increasing = importance > access_score;
        info!(
            event = "organize_blob",
            blob = %blob_id,
            importance,
            access_score,
            increasing
        );
        sort_buffer_info(&mut buffer_info, increasing);

        for src in &buffer_info {
            let Some(candidate) = self.pick_target(src.size, increasing) else {
                debug!(event = "organize_no_target", src = %src.id, size = src.size);
                continue;
            };

            let predicted =
                predict_access_score(range, &buffer_info, src.id, candidate.bandwidth_mbps);

            if self.move_is_valid(importance, access_score, predicted, increasing, epsilon) {
                self.enqueue_move(blob_id, src.id, src.size, candidate);
            }

            if f64::from((importance - predicted).abs()) < epsilon {
                break;
            }
        }
        Ok(())
    }

    /// Snapshot this node's targets and pick the first, in direction
    /// order, with room for `size` bytes.
    fn pick_target(&self, size: u64, increasing: bool) -> Option<TargetInfo> {
        let pool = &self.ctx.pool;
        let targets = pool.local_targets();
        let bandwidths = pool.target_bandwidths(&targets);
        let capacities = pool.remaining_target_capacities(&targets);

        let mut target_info: Vec<TargetInfo> = targets
            .iter()
            .zip(bandwidths.iter())
            .zip(capacities.iter())
            .map(|((id, bandwidth_mbps), capacity)| TargetInfo {
                id: *id,
                bandwidth_mbps: *bandwidth_mbps,
                capacity: *capacity,
            })
            .collect();
        sort_target_info(&mut target_info, increasing);

        target_info.into_iter().find(|t| t.capacity >= size)
    }

    /// The validity gate: reject a move that overshoots the importance by
    /// more than epsilon. With `reject_undershoot`, also reject one that
    /// pushes the score away from the importance.
    fn move_is_valid(
        &self,
        importance: f32,
        access_score: f32,
        predicted: f32,
        increasing: bool,
        epsilon: f64,
    ) -> bool {
        let importance = f64::from(importance);
        let predicted = f64::from(predicted);
        let access_score = f64::from(access_score);

        let overshoots = if increasing {
            predicted > importance && predicted - importance > epsilon
        } else {
            predicted < importance && importance - predicted > epsilon
        };
        if overshoots {
            debug!(event = "organize_overshoot_rejected", predicted, importance);
            return false;
        }

        if self.config.reject_undershoot {
            let wrong_direction = if increasing {
                predicted < access_score
            } else {
                predicted > access_score
            };
            if wrong_direction {
                debug!(event = "organize_wrong_direction_rejected", predicted, access_score);
                return false;
            }
        }
        true
    }

    /// Allocate destination buffers for the candidate and enqueue the
    /// move at low priority. An empty allocation is a transient miss.
    fn enqueue_move(&self, blob_id: BlobId, src: BufferId, size: u64, candidate: TargetInfo) {
        let mut schema = PlacementSchema::new();
        schema.push(size, candidate.id);
        let dests = self.ctx.pool.get_buffers(&schema);
        if dests.is_empty() {
            warn!(event = "organize_alloc_failed", target = %candidate.id, size);
            return;
        }
        let accepted = self.enqueue_task(
            BoTask::Move {
                src,
                dests,
                blob: blob_id,
            },
            BoPriority::Low,
        );
        if !accepted {
            warn!(event = "organize_enqueue_refused", blob = %blob_id, src = %src);
        }
    }

    /// Register this organizer's procedures on the node's RPC server:
    /// both the metadata-engine surface it answers for and the
    /// `BO::`-prefixed organizer-engine surface.
    pub fn register_procedures(self: &Arc<Self>, server: &RpcServer) {
        let ctx = Arc::clone(&self.ctx);
        server.register(ProcedureId::GET_BUFFER_INFO, move |payload| {
            let id: BufferId =
                from_slice(payload).map_err(|e| BoError::WireFormat(e.to_string()))?;
            Ok(to_vec(&ctx.local_get_buffer_info(id)?))
        });

        let org = Arc::clone(self);
        server.register(ProcedureId::ORGANIZE_BLOB, move |payload| {
            let args: OrganizeBlobArgs =
                from_slice(payload).map_err(|e| BoError::WireFormat(e.to_string()))?;
            org.local_organize_blob(&args.internal_name, args.epsilon, None)?;
            Ok(Vec::new())
        });

        let ctx = Arc::clone(&self.ctx);
        server.register(ProcedureId::INCREMENT_FLUSH_COUNT, move |payload| {
            let name: String =
                from_slice(payload).map_err(|e| BoError::WireFormat(e.to_string()))?;
            flush::local_adjust_flush_count(&ctx, &name, 1);
            Ok(to_vec(&true))
        });

        let ctx = Arc::clone(&self.ctx);
        server.register(ProcedureId::DECREMENT_FLUSH_COUNT, move |payload| {
            let name: String =
                from_slice(payload).map_err(|e| BoError::WireFormat(e.to_string()))?;
            flush::local_adjust_flush_count(&ctx, &name, -1);
            Ok(to_vec(&true))
        });

        let ctx = Arc::clone(&self.ctx);
        server.register(ProcedureId::GET_FLUSH_COUNT, move |payload| {
            let name: String =
                from_slice(payload).map_err(|e| BoError::WireFormat(e.to_string()))?;
            Ok(to_vec(&flush::local_outstanding_flushes(&ctx, &name)))
        });

        let ctx = Arc::clone(&self.ctx);
        server.register(ProcedureId::LOCK_BLOB, move |payload| {
            let id: BlobId =
                from_slice(payload).map_err(|e| BoError::WireFormat(e.to_string()))?;
            Ok(to_vec(&ctx.mdm.local_lock_blob(id)))
        });

        let ctx = Arc::clone(&self.ctx);
        server.register(ProcedureId::UNLOCK_BLOB, move |payload| {
            let id: BlobId =
                from_slice(payload).map_err(|e| BoError::WireFormat(e.to_string()))?;
            Ok(to_vec(&ctx.mdm.local_unlock_blob(id)))
        });

        let org = Arc::clone(self);
        server.register(ProcedureId::ENQUEUE_FLUSHING_TASK, move |payload| {
            let args: FlushTaskArgs =
                from_slice(payload).map_err(|e| BoError::WireFormat(e.to_string()))?;
            let accepted =
                org.local_enqueue_flushing_task(args.blob_id, &args.filename, args.offset);
            Ok(to_vec(&accepted))
        });
    }
}
