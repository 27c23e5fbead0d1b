//! The store boundary: master values, subscriptions and session records.
//!
//! The store is the only state shared between sessions. Writes go through
//! [`Store::apply_patch`], which must compare-and-swap using the prior state
//! recorded in the patch and, on success, tell every other subscribed session
//! through a [`TaintSink`]. Notification is fire-and-forget so a store never
//! waits on a session.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::{Document, ResourceRef, SessionId, Shadow, StoreError, Tag};

mod memory;

pub use memory::MemoryStore;

/// Persistent form of a session between activations.
///
/// Client attachment, tag send times and flush timestamps are runtime-only;
/// every restored tag counts as stale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
	pub id: SessionId,
	pub uid: String,
	pub shadows: Vec<Shadow>,
	pub tainted: Vec<ResourceRef>,
	pub tags: Vec<(ResourceRef, Tag)>,
}

#[async_trait]
pub trait Store: Send + Sync {
	/// Current master value, or the kind's empty value when none exists yet.
	async fn load(&self, resource: &ResourceRef) -> Result<Document, StoreError>;

	/// Compare-and-swap write of one serialized patch.
	///
	/// On success every subscriber of `resource` other than `origin`, and
	/// every subscriber of a resource the patch affects, gets a taint.
	async fn apply_patch(&self, resource: &ResourceRef, patch: &Document, origin: Option<&SessionId>) -> Result<(), StoreError>;

	async fn subscriptions_for(&self, resource: &ResourceRef) -> Result<Vec<SessionId>, StoreError>;

	async fn subscribe(&self, session: &SessionId, resource: &ResourceRef) -> Result<(), StoreError>;

	async fn unsubscribe(&self, session: &SessionId, resource: &ResourceRef) -> Result<(), StoreError>;

	async fn load_session(&self, id: &SessionId) -> Result<Option<SessionRecord>, StoreError>;

	async fn save_session(&self, record: &SessionRecord) -> Result<(), StoreError>;

	async fn delete_session(&self, id: &SessionId) -> Result<(), StoreError>;
}

/// Receiver of change notifications. Must not block.
pub trait TaintSink: Send + Sync {
	fn taint(&self, session: &SessionId, resource: &ResourceRef, at: Instant);
}
