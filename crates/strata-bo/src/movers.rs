//! Task bodies for the three organizer operations.
//!
//! A move runs entirely under the distributed blob lock: read the source
//! buffer, fill the destinations in order, then swap the blob's buffer-ID
//! list and release the source. Readers also serialize on the blob lock,
//! so they observe the old list or the new list, never a mix. Lock
//! contention abandons the task; the organizer will revisit the blob on a
//! later pass.

use strata_error::{BoError, Result};
use strata_types::{BlobId, BoTask, BufferId, PlacementSchema, TargetId};
use tracing::{debug, error, warn};

use crate::context::{BlobLockGuard, BoContext};

/// Run one queued task, logging instead of propagating: transient misses
/// are warnings, anything else is an error. Tasks are never retried here.
pub fn execute(ctx: &BoContext, task: &BoTask) {
    let op = task.operation();
    let outcome = match task {
        BoTask::Move { src, dests, blob } => bo_move(ctx, *src, dests, *blob),
        BoTask::Copy { src, dest } => bo_copy(ctx, *src, *dest),
        BoTask::Delete { src } => bo_delete(ctx, *src),
    };
    match outcome {
        Ok(()) => debug!(event = "bo_task_done", op = ?op),
        Err(err) if err.is_transient() => {
            warn!(event = "bo_task_skipped", op = ?op, error = %err);
        }
        Err(err) => {
            error!(event = "bo_task_failed", op = ?op, error = %err);
        }
    }
}

/// Move the source buffer's bytes into `dests` and retarget the blob's
/// buffer-ID list at them.
pub fn bo_move(
    ctx: &BoContext,
    src: BufferId,
    dests: &[BufferId],
    blob_id: BlobId,
) -> Result<()> {
    let _guard = BlobLockGuard::try_acquire(ctx, blob_id)?;

    let src_header = ctx
        .pool
        .buffer_header(src)
        .ok_or(BoError::BufferUnresolved {
            buffer: src.as_u64(),
        })?;
    let used = src_header.used as usize;
    let mut data = vec![0_u8; used];
    let read = ctx.pool.local_read_buffer(src, &mut data, 0)?;
    if read != used {
        return Err(BoError::BufferUnresolved {
            buffer: src.as_u64(),
        });
    }

    let written = write_portions(ctx, &data, dests)?;

    // Swap the blob's list while still holding the blob lock, then retire
    // the source buffer. If the source is no longer in the list the blob
    // was rewritten underneath us; leave the metadata alone.
    let old_list = ctx.mdm.local_get_buffer_id_list(blob_id);
    match old_list.iter().position(|id| *id == src) {
        Some(pos) => {
            let mut new_list = Vec::with_capacity(old_list.len() + written.len() - 1);
            new_list.extend_from_slice(&old_list[..pos]);
            new_list.extend_from_slice(&written);
            new_list.extend_from_slice(&old_list[pos + 1..]);
            ctx.mdm.local_set_buffer_id_list(blob_id, new_list);
            ctx.pool.release_buffer(src);
            debug!(
                event = "blob_list_swapped",
                blob = %blob_id,
                src = %src,
                dests = written.len()
            );
        }
        None => {
            warn!(
                event = "move_source_not_in_list",
                blob = %blob_id,
                src = %src
            );
        }
    }

    Ok(())
}

/// Replicate the source buffer onto freshly allocated buffers on `dest`.
/// The original buffers and the blob's list are untouched.
pub fn bo_copy(ctx: &BoContext, src: BufferId, dest: TargetId) -> Result<()> {
    let src_header = ctx
        .pool
        .buffer_header(src)
        .ok_or(BoError::BufferUnresolved {
            buffer: src.as_u64(),
        })?;
    let used = src_header.used as usize;
    let mut data = vec![0_u8; used];
    let read = ctx.pool.local_read_buffer(src, &mut data, 0)?;
    if read != used {
        return Err(BoError::BufferUnresolved {
            buffer: src.as_u64(),
        });
    }

    let mut schema = PlacementSchema::new();
    schema.push(src_header.used, dest);
    let dests = ctx.pool.get_buffers(&schema);
    if dests.is_empty() {
        return Err(BoError::TargetsFull {
            needed: src_header.used,
        });
    }

    write_portions(ctx, &data, &dests)?;
    Ok(())
}

/// Release the buffer back to its pool.
pub fn bo_delete(ctx: &BoContext, src: BufferId) -> Result<()> {
    ctx.pool.release_buffer(src);
    Ok(())
}

/// Fill each destination up to its capacity from `data`, in order.
/// Returns the destinations that received bytes; errors unless every
/// source byte found a home.
fn write_portions(ctx: &BoContext, data: &[u8], dests: &[BufferId]) -> Result<Vec<BufferId>> {
    let mut offset = 0_usize;
    let mut written = Vec::with_capacity(dests.len());

    for dest in dests {
        if offset == data.len() {
            break;
        }
        let Some(dest_header) = ctx.pool.buffer_header(*dest) else {
            // Cross-node miss: the caller sized `dests` to cover the
            // source, so a skipped destination usually means a short
            // write below.
            warn!(event = "dest_buffer_unresolved", dest = %dest);
            continue;
        };
        let portion = (dest_header.capacity as usize).min(data.len() - offset);
        if portion == 0 {
            continue;
        }
        let wrote = ctx
            .pool
            .local_write_buffer(*dest, &data[offset..offset + portion], 0)?;
        if wrote != portion {
            return Err(BoError::BufferUnresolved {
                buffer: dest.as_u64(),
            });
        }
        offset += portion;
        written.push(*dest);
    }

    let remaining = data.len() - offset;
    if remaining != 0 {
        debug_assert_eq!(remaining, 0, "destinations do not cover the source buffer");
        error!(event = "move_short_write", remaining);
        return Err(BoError::TargetsFull {
            needed: remaining as u64,
        });
    }
    Ok(written)
}
