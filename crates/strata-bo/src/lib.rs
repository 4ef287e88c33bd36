#![forbid(unsafe_code)]
//! Buffer organizer for the Strata multi-tier staging hierarchy.
//!
//! After a blob lands in whatever buffers the placement engine could get at
//! ingest time, the organizer asynchronously reshapes its placement so the
//! blob's observed access cost matches its declared importance, and flushes
//! blobs to backing files on demand with per-file exclusion.
//!
//! Five cooperating pieces:
//! - [`queue`]: the two-priority worker pool local to each node
//! - [`cost`]: pure access-score math and the placement sort orders
//! - [`organize`]: the placement-improvement loop ([`BufferOrganizer`])
//! - [`movers`]: move/copy/delete task bodies run under the blob lock
//! - [`flush`]: flush-to-file tasks, vbucket accounting, and the drain barrier
//!
//! The metadata manager, buffer pool, placement engine, and RPC transport
//! are borrowed through the traits in [`meta`] and [`context`]; this crate
//! never owns persistent metadata.

pub mod context;
pub mod cost;
pub mod flush;
pub mod meta;
pub mod movers;
pub mod organize;
pub mod queue;

pub use context::{BlobLockGuard, BoContext};
pub use meta::{BufferHeader, BufferPool, MetadataManager, PlacementEngine, VBucketInfo};
pub use organize::{BufferOrganizer, OrganizerConfig};
pub use queue::{WorkQueue, WorkQueueConfig};
