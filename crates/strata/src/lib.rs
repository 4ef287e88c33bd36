#![forbid(unsafe_code)]
//! Strata buffer organizer public API facade.
//!
//! Re-exports the organizer, its consumed-interface traits, and the core
//! types through a stable external interface. This is the crate the
//! surrounding system (daemon, adapters, harness) depends on.

pub use strata_bo::{
    BlobLockGuard, BoContext, BufferHeader, BufferOrganizer, BufferPool, MetadataManager,
    OrganizerConfig, PlacementEngine, VBucketInfo, WorkQueue, WorkQueueConfig,
};
pub use strata_error::{BoError, Result};
pub use strata_rpc::{
    parse_wire_name, Engine, LoopbackTransport, ProcedureId, RpcServer, RpcTransport, BO_PREFIX,
};
pub use strata_types::*;
pub use strata_wire::{from_slice, to_vec, WireDecode, WireEncode, WireError};
