#![forbid(unsafe_code)]
//! RPC seam and procedure routing for the buffer organizer.
//!
//! The transport itself is external; this crate owns the seam. Procedures
//! are addressed internally by a structured `(engine, name)` pair. On the
//! wire, calls bound for the buffer-organizer engine keep the legacy
//! `BO::` name prefix, which the receiving side strips before lookup —
//! the organizer runs its own listener, separate from the metadata engine,
//! so queued transfers never starve metadata lookups.
//!
//! All calls are blocking: the caller thread waits for the reply unless
//! the procedure is declared response-less (`notify`).

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use strata_error::{BoError, Result};
use strata_types::{BlobId, BufferId, BufferInfo};
use strata_wire::{from_slice, to_vec, WireDecode, WireEncode, WireReader};
use tracing::debug;

/// Wire prefix marking procedures dispatched to the organizer engine.
pub const BO_PREFIX: &str = "BO::";

/// Which listener on the target node handles a procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Engine {
    /// The node's main metadata engine.
    Metadata,
    /// The buffer-organizer engine (separate listener).
    BufferOrganizer,
}

/// Structured procedure address: engine plus bare name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcedureId {
    pub engine: Engine,
    pub name: &'static str,
}

impl ProcedureId {
    pub const GET_BUFFER_INFO: Self = Self {
        engine: Engine::Metadata,
        name: "RemoteGetBufferInfo",
    };
    pub const ORGANIZE_BLOB: Self = Self {
        engine: Engine::Metadata,
        name: "RemoteOrganizeBlob",
    };
    pub const INCREMENT_FLUSH_COUNT: Self = Self {
        engine: Engine::Metadata,
        name: "RemoteIncrementFlushCount",
    };
    pub const DECREMENT_FLUSH_COUNT: Self = Self {
        engine: Engine::Metadata,
        name: "RemoteDecrementFlushCount",
    };
    pub const LOCK_BLOB: Self = Self {
        engine: Engine::Metadata,
        name: "RemoteLockBlob",
    };
    pub const UNLOCK_BLOB: Self = Self {
        engine: Engine::Metadata,
        name: "RemoteUnlockBlob",
    };
    pub const GET_FLUSH_COUNT: Self = Self {
        engine: Engine::Metadata,
        name: "RemoteGetNumOutstandingFlushingTasks",
    };
    pub const ENQUEUE_FLUSHING_TASK: Self = Self {
        engine: Engine::BufferOrganizer,
        name: "EnqueueFlushingTask",
    };

    /// The name as it appears on the wire (`BO::`-prefixed for the
    /// organizer engine).
    #[must_use]
    pub fn wire_name(&self) -> String {
        match self.engine {
            Engine::Metadata => self.name.to_owned(),
            Engine::BufferOrganizer => format!("{BO_PREFIX}{}", self.name),
        }
    }
}

/// Split a wire name into its engine and bare procedure name.
#[must_use]
pub fn parse_wire_name(wire_name: &str) -> (Engine, &str) {
    match wire_name.strip_prefix(BO_PREFIX) {
        Some(bare) => (Engine::BufferOrganizer, bare),
        None => (Engine::Metadata, wire_name),
    }
}

// ── Transport seam ──────────────────────────────────────────────────────────

/// Blocking transport the organizer borrows from the surrounding system.
pub trait RpcTransport: Send + Sync {
    /// Call `wire_name` on `node_id` and wait for the reply payload.
    fn call(&self, node_id: u32, wire_name: &str, payload: &[u8]) -> Result<Vec<u8>>;

    /// Fire a response-less procedure. The default waits for the transport
    /// ack and drops the empty reply.
    fn notify(&self, node_id: u32, wire_name: &str, payload: &[u8]) -> Result<()> {
        self.call(node_id, wire_name, payload).map(|_| ())
    }
}

fn call_typed<R: WireDecode>(
    transport: &dyn RpcTransport,
    node_id: u32,
    proc: ProcedureId,
    payload: Vec<u8>,
) -> Result<R> {
    let wire_name = proc.wire_name();
    debug!(event = "rpc_call", node_id, procedure = %wire_name);
    let reply = transport.call(node_id, &wire_name, &payload)?;
    from_slice(&reply).map_err(|err| BoError::Rpc {
        node: node_id,
        detail: format!("{}: bad reply: {err}", proc.name),
    })
}

// ── Typed client surface ────────────────────────────────────────────────────

/// Fetch a buffer's bandwidth/size snapshot from its owning node.
pub fn remote_get_buffer_info(
    transport: &dyn RpcTransport,
    node_id: u32,
    buffer_id: BufferId,
) -> Result<BufferInfo> {
    call_typed(
        transport,
        node_id,
        ProcedureId::GET_BUFFER_INFO,
        to_vec(&buffer_id),
    )
}

/// Forward an organize request to the blob's authoritative node.
/// Response-less: the organizer runs asynchronously on the remote side.
pub fn remote_organize_blob(
    transport: &dyn RpcTransport,
    node_id: u32,
    internal_name: &str,
    epsilon: f64,
) -> Result<()> {
    let mut payload = Vec::new();
    internal_name.encode(&mut payload);
    epsilon.encode(&mut payload);
    let wire_name = ProcedureId::ORGANIZE_BLOB.wire_name();
    debug!(event = "rpc_notify", node_id, procedure = %wire_name);
    transport.notify(node_id, &wire_name, &payload)
}

/// Bump the outstanding-flush counter on the vbucket's authoritative node.
pub fn remote_increment_flush_count(
    transport: &dyn RpcTransport,
    node_id: u32,
    vbkt_name: &str,
) -> Result<bool> {
    call_typed(
        transport,
        node_id,
        ProcedureId::INCREMENT_FLUSH_COUNT,
        to_vec(&vbkt_name),
    )
}

/// Drop the outstanding-flush counter on the vbucket's authoritative node.
pub fn remote_decrement_flush_count(
    transport: &dyn RpcTransport,
    node_id: u32,
    vbkt_name: &str,
) -> Result<bool> {
    call_typed(
        transport,
        node_id,
        ProcedureId::DECREMENT_FLUSH_COUNT,
        to_vec(&vbkt_name),
    )
}

/// Try-lock the blob on its authoritative node.
pub fn remote_lock_blob(
    transport: &dyn RpcTransport,
    node_id: u32,
    blob_id: BlobId,
) -> Result<bool> {
    call_typed(transport, node_id, ProcedureId::LOCK_BLOB, to_vec(&blob_id))
}

/// Release the blob lock on its authoritative node.
pub fn remote_unlock_blob(
    transport: &dyn RpcTransport,
    node_id: u32,
    blob_id: BlobId,
) -> Result<bool> {
    call_typed(
        transport,
        node_id,
        ProcedureId::UNLOCK_BLOB,
        to_vec(&blob_id),
    )
}

/// Read the outstanding async-flush count from the vbucket's
/// authoritative node.
pub fn remote_get_flush_count(
    transport: &dyn RpcTransport,
    node_id: u32,
    vbkt_name: &str,
) -> Result<i64> {
    call_typed(
        transport,
        node_id,
        ProcedureId::GET_FLUSH_COUNT,
        to_vec(&vbkt_name),
    )
}

/// Hand a flush task to the organizer engine on `node_id`.
///
/// Returns `false` when the remote refused the task (swap-resident blob or
/// full queue).
pub fn enqueue_flushing_task(
    transport: &dyn RpcTransport,
    node_id: u32,
    blob_id: BlobId,
    filename: &str,
    offset: u64,
) -> Result<bool> {
    let mut payload = Vec::new();
    blob_id.encode(&mut payload);
    filename.encode(&mut payload);
    offset.encode(&mut payload);
    call_typed(
        transport,
        node_id,
        ProcedureId::ENQUEUE_FLUSHING_TASK,
        payload,
    )
}

// ── Server-side dispatch ────────────────────────────────────────────────────

/// Decoded arguments for `EnqueueFlushingTask`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushTaskArgs {
    pub blob_id: BlobId,
    pub filename: String,
    pub offset: u64,
}

impl WireDecode for FlushTaskArgs {
    fn decode(r: &mut WireReader<'_>) -> std::result::Result<Self, strata_wire::WireError> {
        Ok(Self {
            blob_id: BlobId::decode(r)?,
            filename: r.string()?,
            offset: r.u64()?,
        })
    }
}

/// Decoded arguments for `RemoteOrganizeBlob`.
#[derive(Debug, Clone, PartialEq)]
pub struct OrganizeBlobArgs {
    pub internal_name: String,
    pub epsilon: f64,
}

impl WireDecode for OrganizeBlobArgs {
    fn decode(r: &mut WireReader<'_>) -> std::result::Result<Self, strata_wire::WireError> {
        Ok(Self {
            internal_name: r.string()?,
            epsilon: r.f64()?,
        })
    }
}

type Handler = Box<dyn Fn(&[u8]) -> Result<Vec<u8>> + Send + Sync>;

/// Procedure table for one node. Both engines share the table; the engine
/// tag keeps their namespaces apart.
#[derive(Default)]
pub struct RpcServer {
    handlers: RwLock<HashMap<(Engine, String), Handler>>,
}

impl RpcServer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `proc`, replacing any previous one.
    pub fn register<F>(&self, proc: ProcedureId, handler: F)
    where
        F: Fn(&[u8]) -> Result<Vec<u8>> + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .insert((proc.engine, proc.name.to_owned()), Box::new(handler));
    }

    /// Dispatch an incoming wire-named call to its handler.
    pub fn dispatch(&self, wire_name: &str, payload: &[u8]) -> Result<Vec<u8>> {
        let (engine, bare) = parse_wire_name(wire_name);
        let handlers = self.handlers.read();
        let handler = handlers
            .get(&(engine, bare.to_owned()))
            .ok_or_else(|| BoError::NotFound(format!("procedure {wire_name}")))?;
        handler(payload)
    }
}

/// In-process transport wiring N node procedure tables together.
///
/// Used by the test harness; calls run synchronously on the caller thread,
/// including calls a node makes to itself.
#[derive(Default)]
pub struct LoopbackTransport {
    nodes: RwLock<HashMap<u32, Arc<RpcServer>>>,
}

impl LoopbackTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_node(&self, node_id: u32, server: Arc<RpcServer>) {
        self.nodes.write().insert(node_id, server);
    }

    fn server_for(&self, node_id: u32) -> Result<Arc<RpcServer>> {
        self.nodes
            .read()
            .get(&node_id)
            .cloned()
            .ok_or(BoError::Rpc {
                node: node_id,
                detail: "no such node".to_owned(),
            })
    }
}

impl RpcTransport for LoopbackTransport {
    fn call(&self, node_id: u32, wire_name: &str, payload: &[u8]) -> Result<Vec<u8>> {
        self.server_for(node_id)?.dispatch(wire_name, payload)
    }
}
