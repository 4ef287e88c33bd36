//! Flush coordination: per-blob flush-to-file tasks, per-vbucket
//! outstanding counters, the blocking drain barrier, and swap
//! re-placement.
//!
//! A flush holds two locks: the distributed blob lock, so no move rewrites
//! the buffer list mid-flush, and an exclusive advisory lock on the
//! destination file, so concurrent flushers on the node (and any other
//! process honoring advisory locks) serialize per file. The flush target
//! doubles as the vbucket name for async accounting, so a drain barrier
//! keyed by the filename observes exactly the flushes aimed at it.

use fs2::FileExt as _;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt as _;
use std::os::unix::fs::OpenOptionsExt as _;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use strata_error::{BoError, Result};
use strata_rpc::{
    remote_decrement_flush_count, remote_get_flush_count, remote_increment_flush_count,
};
use strata_types::{node_for_name, BlobId, BoPriority, Context, SwapBlob};
use tracing::{debug, error, info, warn};

use crate::context::{BlobLockGuard, BoContext};
use crate::organize::BufferOrganizer;

/// Staging-buffer size for the file persist loop.
const FLUSH_STAGE_SIZE: usize = 4096;

const AWAIT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const AWAIT_LOG_EVERY: u32 = 10;

/// Decrements the vbucket counter exactly once when dropped.
struct FlushCountGuard<'a> {
    ctx: &'a BoContext,
    vbkt_name: &'a str,
}

impl Drop for FlushCountGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = decrement_flush_count(self.ctx, self.vbkt_name) {
            warn!(
                event = "flush_count_decrement_failed",
                vbucket = self.vbkt_name,
                error = %err
            );
        }
    }
}

/// Flush a blob's bytes to `filename` at `offset`.
///
/// Takes the distributed blob lock (abandoning the task on contention),
/// opens the file (`O_WRONLY`, adding `O_CREAT|O_TRUNC` mode 0644 when
/// absent), holds an exclusive advisory lock across the write, and on all
/// exit paths releases the blob lock and, when `async_flush`, decrements
/// the per-vbucket counter exactly once.
pub fn flush_blob(
    ctx: &BoContext,
    blob_id: BlobId,
    filename: &str,
    offset: u64,
    async_flush: bool,
) -> Result<()> {
    let _count_guard = async_flush.then(|| FlushCountGuard {
        ctx,
        vbkt_name: filename,
    });

    let _blob_guard = BlobLockGuard::try_acquire(ctx, blob_id)?;

    let path = Path::new(filename);
    let file = open_flush_target(path).map_err(|err| {
        error!(event = "flush_open_failed", filename, error = %err);
        BoError::library_call("open", &err)
    })?;

    debug!(event = "flush_blob", blob = %blob_id, filename, offset);

    file.lock_exclusive()
        .map_err(|err| BoError::library_call("flock", &err))?;
    let persist_result = persist_blob(ctx, blob_id, &file, offset);
    let unlock_result = fs2::FileExt::unlock(&file);

    persist_result?;
    unlock_result.map_err(|err| BoError::library_call("flock", &err))?;
    Ok(())
}

fn open_flush_target(path: &Path) -> std::io::Result<File> {
    if path.exists() {
        OpenOptions::new().write(true).open(path)
    } else {
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o644)
            .open(path)
    }
}

/// Write the blob's buffers to the file in list order through a fixed
/// staging buffer.
fn persist_blob(ctx: &BoContext, blob_id: BlobId, file: &File, mut file_offset: u64) -> Result<()> {
    let buffer_ids = ctx.mdm.local_get_buffer_id_list(blob_id);
    let mut stage = [0_u8; FLUSH_STAGE_SIZE];

    for id in buffer_ids {
        let header = ctx
            .pool
            .buffer_header(id)
            .ok_or(BoError::BufferUnresolved { buffer: id.as_u64() })?;
        let mut buffer_offset = 0_u64;
        let mut remaining = header.used;
        while remaining > 0 {
            let chunk = remaining.min(FLUSH_STAGE_SIZE as u64) as usize;
            let read = ctx
                .pool
                .local_read_buffer(id, &mut stage[..chunk], buffer_offset)?;
            if read == 0 {
                return Err(BoError::BufferUnresolved { buffer: id.as_u64() });
            }
            file.write_all_at(&stage[..read], file_offset)
                .map_err(|err| BoError::library_call("pwrite", &err))?;
            file_offset += read as u64;
            buffer_offset += read as u64;
            remaining -= read as u64;
        }
    }
    Ok(())
}

// ── Per-vbucket accounting ──────────────────────────────────────────────────

/// Apply a signed adjustment to the vbucket's counter on this node. A
/// missing vbucket is ignored, matching lookups that raced a teardown.
pub fn local_adjust_flush_count(ctx: &BoContext, vbkt_name: &str, adjustment: i64) {
    match ctx.mdm.local_vbucket_info(vbkt_name) {
        Some(info) => {
            info.adjust_flush_count(adjustment);
        }
        None => {
            debug!(event = "vbucket_missing", vbucket = vbkt_name, adjustment);
        }
    }
}

/// Outstanding async flushes recorded on this node.
#[must_use]
pub fn local_outstanding_flushes(ctx: &BoContext, vbkt_name: &str) -> i64 {
    ctx.mdm
        .local_vbucket_info(vbkt_name)
        .map_or(0, |info| info.outstanding_flushes())
}

fn authoritative_node(ctx: &BoContext, vbkt_name: &str) -> u32 {
    node_for_name(vbkt_name, ctx.num_nodes)
}

/// Bump the counter on the vbucket's authoritative node.
pub fn increment_flush_count(ctx: &BoContext, vbkt_name: &str) -> Result<()> {
    let target = authoritative_node(ctx, vbkt_name);
    if target == ctx.node_id {
        local_adjust_flush_count(ctx, vbkt_name, 1);
        Ok(())
    } else {
        remote_increment_flush_count(ctx.transport.as_ref(), target, vbkt_name).map(|_| ())
    }
}

/// Drop the counter on the vbucket's authoritative node.
pub fn decrement_flush_count(ctx: &BoContext, vbkt_name: &str) -> Result<()> {
    let target = authoritative_node(ctx, vbkt_name);
    if target == ctx.node_id {
        local_adjust_flush_count(ctx, vbkt_name, -1);
        Ok(())
    } else {
        remote_decrement_flush_count(ctx.transport.as_ref(), target, vbkt_name).map(|_| ())
    }
}

/// Outstanding async flushes, read from the authoritative node.
pub fn outstanding_flushes(ctx: &BoContext, vbkt_name: &str) -> Result<i64> {
    let target = authoritative_node(ctx, vbkt_name);
    if target == ctx.node_id {
        Ok(local_outstanding_flushes(ctx, vbkt_name))
    } else {
        remote_get_flush_count(ctx.transport.as_ref(), target, vbkt_name)
    }
}

/// Block until the vbucket's outstanding async-flush counter reads zero,
/// polling every 500 ms and logging every 10th poll.
pub fn await_async_flushing_tasks(ctx: &BoContext, vbkt_name: &str) -> Result<()> {
    let mut counter = 0_u32;
    loop {
        let outstanding = outstanding_flushes(ctx, vbkt_name)?;
        if outstanding == 0 {
            return Ok(());
        }
        counter += 1;
        if counter == AWAIT_LOG_EVERY {
            info!(
                event = "awaiting_flushes",
                vbucket = vbkt_name,
                outstanding
            );
            counter = 0;
        }
        thread::sleep(AWAIT_POLL_INTERVAL);
    }
}

/// Re-place a swap-resident blob into the hierarchy: ask the placement
/// engine for a schema, read the swap bytes, and hand both to the pool's
/// placement primitive.
pub fn place_in_hierarchy(
    ctx: &BoContext,
    swap_blob: SwapBlob,
    name: &str,
    api_ctx: &Context,
) -> Result<()> {
    let schemas = match ctx.dpe.calculate_placement(&[swap_blob.size], api_ctx) {
        Ok(schemas) => schemas,
        Err(err) => {
            error!(event = "swap_placement_failed", name, error = %err);
            return Err(err);
        }
    };
    let schema = schemas
        .first()
        .ok_or_else(|| BoError::PlacementFailed("placement returned no schema".to_owned()))?;

    let data = ctx.pool.read_from_swap(&swap_blob)?;
    ctx.pool
        .place_blob(schema, &data, name, swap_blob.bucket_id, api_ctx)
}

impl BufferOrganizer {
    /// Queue an async flush on this node. Refuses swap-resident blobs.
    /// The vbucket counter is incremented before dispatch and decremented
    /// exactly once when the task finishes (or the enqueue is refused).
    pub fn local_enqueue_flushing_task(
        &self,
        blob_id: BlobId,
        filename: &str,
        offset: u64,
    ) -> bool {
        let ctx = self.context();
        if ctx.mdm.blob_is_in_swap(blob_id) {
            warn!(event = "flush_refused_swap_blob", blob = %blob_id);
            return false;
        }

        if let Err(err) = increment_flush_count(ctx, filename) {
            warn!(event = "flush_count_increment_failed", filename, error = %err);
            return false;
        }

        let task_ctx = Arc::clone(ctx);
        let task_filename = filename.to_owned();
        let accepted = self.queue().enqueue(BoPriority::Low, move || {
            if let Err(err) = flush_blob(&task_ctx, blob_id, &task_filename, offset, true) {
                if err.is_transient() {
                    warn!(event = "flush_skipped", blob = %blob_id, error = %err);
                } else {
                    error!(event = "flush_failed", blob = %blob_id, error = %err);
                }
            }
        });

        if !accepted {
            // The closure never ran, so rebalance the counter here.
            if let Err(err) = decrement_flush_count(ctx, filename) {
                warn!(event = "flush_count_decrement_failed", filename, error = %err);
            }
        }
        accepted
    }

    /// Queue a flush through the organizer engine's RPC surface, even for
    /// the local node; the wire name (`BO::EnqueueFlushingTask`) selects
    /// the organizer listener rather than the metadata engine.
    pub fn enqueue_flushing_task(
        &self,
        blob_id: BlobId,
        filename: &str,
        offset: u64,
    ) -> Result<bool> {
        let ctx = self.context();
        strata_rpc::enqueue_flushing_task(
            ctx.transport.as_ref(),
            ctx.node_id,
            blob_id,
            filename,
            offset,
        )
    }

    /// Synchronous flush of one blob on the caller thread.
    pub fn flush_blob(&self, blob_id: BlobId, filename: &str, offset: u64) -> Result<()> {
        flush_blob(self.context(), blob_id, filename, offset, false)
    }

    /// Block until the vbucket's async flushes have drained.
    pub fn await_async_flushing_tasks(&self, vbkt_name: &str) -> Result<()> {
        await_async_flushing_tasks(self.context(), vbkt_name)
    }

    /// Re-place a swap-resident blob into the hierarchy.
    pub fn place_in_hierarchy(
        &self,
        swap_blob: SwapBlob,
        name: &str,
        api_ctx: &Context,
    ) -> Result<()> {
        place_in_hierarchy(self.context(), swap_blob, name, api_ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fs2::FileExt as _;
    use std::io::Write as _;

    #[test]
    fn flush_target_is_created_with_truncate_only_when_absent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("target.bin");

        // Absent: created (and would be truncated).
        let file = open_flush_target(&path).expect("create");
        drop(file);
        assert!(path.exists());

        // Existing content must survive a reopen.
        {
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .open(&path)
                .expect("reopen");
            file.write_all(b"keep me").expect("seed");
        }
        let file = open_flush_target(&path).expect("open existing");
        drop(file);
        assert_eq!(std::fs::read(&path).expect("read"), b"keep me");
    }

    #[test]
    fn exclusive_lock_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("locked.bin");
        let file = open_flush_target(&path).expect("create");

        file.lock_exclusive().expect("lock");
        let second = open_flush_target(&path).expect("open again");
        assert!(
            second.try_lock_exclusive().is_err(),
            "second exclusive lock must be refused while the first is held"
        );
        fs2::FileExt::unlock(&file).expect("unlock");
        second.try_lock_exclusive().expect("lock after release");
    }
}
