//! Differential synchronization engine.
//!
//! Each session keeps a [`Shadow`] of every resource it observes. The server
//! reconciles shadow and master copies by exchanging deltas tagged with a
//! [`Clock`], healing a peer that missed exactly one round by rollback and
//! reporting anything worse as divergence.
//!
//! # Layers
//!
//! | Type | Role |
//! |---|---|
//! | [`Clock`] | `(cv, sv, bv)` version vector, duplicate and divergence checks |
//! | [`ResourceValue`] / [`KindRegistry`] | per-kind delta/apply/patch contract, dispatched by kind name |
//! | [`Shadow`] | dual-shadow algorithm: `update_pending` (server to client), `sync_incoming` (client to server) |
//! | [`Session`] | taint tracking, tag request/ack protocol, flush cycle |
//! | [`Store`] | master values, compare-and-swap patches, subscriptions, session records |
//!
//! # Invariants
//!
//! 1. A session's state is only ever touched by one execution context at a
//!    time. Nothing in this crate locks around [`Session`] or [`Shadow`]; the
//!    hub guarantees serialization.
//! 2. A resource appears in a session's tainted list only while a shadow for
//!    it exists.
//! 3. At most one outstanding tag exists per resource per session. Resends
//!    reuse the tag value.
//! 4. The store is the only state shared between sessions and applies
//!    patches with compare-and-swap.

mod clock;
mod error;
pub mod kind;
pub mod session;
mod shadow;
pub mod store;
mod types;

pub use clock::{Clock, CvStatus};
pub use error::{ApplyError, KindError, Result, StoreError, SyncError};
pub use kind::{Delta, DynKind, KindRegistry, Patch, ResourceValue};
pub use session::{ClientSink, Session, SessionConfig, SessionEvent, SessionFlow};
pub use shadow::Shadow;
pub use store::{MemoryStore, SessionRecord, Store, TaintSink};
pub use types::{ClientMsg, Document, Edit, ErrorCode, ResourceRef, SessionId, Tag};
