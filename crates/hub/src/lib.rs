//! Session hub for the dsync engine.
//!
//! The hub owns one worker task and one bounded mailbox per active session,
//! which is what makes every [`Session`](dsync_core::Session) single-writer.
//! Producers talk to it through cloneable [`HubHandle`]s; the store reaches it
//! through the same handle acting as its [`TaintSink`](dsync_core::TaintSink).
//!
//! # Lifecycle
//!
//! 1. The first [`Envelope`] for a session spawns a worker, which restores
//!    the session record from the store or waits for `Create`.
//! 2. A worker with no client and nothing to do for
//!    [`HubConfig::idle_linger`] closes its mailbox, drains it, saves the
//!    record and reports its exit.
//! 3. [`HubHandle::shutdown`] closes every mailbox and returns once every
//!    worker has saved and exited.

mod config;
mod handle;
mod hub;
mod worker;


pub use config::{ConfigError, HubConfig};
pub use handle::{Envelope, HubError, HubHandle, HubInbox};
pub use hub::SessionHub;
