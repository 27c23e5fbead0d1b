//! Per-session state machine.
//!
//! Each tracked resource moves through clean → tainted → tag-sent → clean.
//! A taint says the shadow may lag the master. Flushing a tainted resource
//! queues the difference on its shadow and pushes it to the client under a
//! fresh [`Tag`]; the client's echo of that tag closes the round. A tag left
//! unanswered past the grace period is resent unchanged.
//!
//! Client-initiated syncs run every carried edit through
//! [`Shadow::sync_incoming`], forward the resulting patches to the store and
//! answer with the server's own pending edits.
//!
//! Nothing here locks: the owner must serialize every call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dsync_worker::MailboxSendOutcome;
use tokio::time::Instant;

use crate::kind::KindRegistry;
use crate::store::{SessionRecord, Store};
use crate::{ClientMsg, Document, Edit, ErrorCode, ResourceRef, Result, SessionId, Shadow, SyncError, Tag};

mod event;
#[cfg(test)]
mod tests;

pub use event::{ClientSink, SessionEvent};

/// Tunables of the session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
	/// How long an unanswered tag counts as in flight before it is resent.
	pub tag_grace: Duration,
}

impl Default for SessionConfig {
	fn default() -> Self {
		Self {
			tag_grace: Duration::from_secs(10),
		}
	}
}

/// What the owner should do after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionFlow {
	Continue,
	/// The session deleted itself; do not persist it again.
	Destroyed,
}

#[derive(Debug, Clone)]
struct OutstandingTag {
	tag: Tag,
	/// `None` when the round never reached the current client.
	last_sent: Option<Instant>,
}

pub struct Session {
	id: SessionId,
	uid: String,
	shadows: HashMap<ResourceRef, Shadow>,
	tainted: Vec<ResourceRef>,
	tags: HashMap<ResourceRef, OutstandingTag>,
	flushes: HashMap<ResourceRef, Instant>,
	client: Option<ClientSink>,
	store: Arc<dyn Store>,
	kinds: Arc<KindRegistry>,
	config: SessionConfig,
}

impl Session {
	pub fn new(id: SessionId, uid: String, store: Arc<dyn Store>, kinds: Arc<KindRegistry>, config: SessionConfig) -> Self {
		Self {
			id,
			uid,
			shadows: HashMap::new(),
			tainted: Vec::new(),
			tags: HashMap::new(),
			flushes: HashMap::new(),
			client: None,
			store,
			kinds,
			config,
		}
	}

	/// Rebuilds a session from its persisted record. Restored tags are stale.
	pub fn restore(record: SessionRecord, store: Arc<dyn Store>, kinds: Arc<KindRegistry>, config: SessionConfig) -> Self {
		let mut session = Self::new(record.id, record.uid, store, kinds, config);
		session.shadows = record.shadows.into_iter().map(|s| (s.resource.clone(), s)).collect();
		for resource in &record.tainted {
			session.mark_tainted(resource);
		}
		session.tags = record
			.tags
			.into_iter()
			.filter(|(resource, _)| session.shadows.contains_key(resource))
			.map(|(resource, tag)| (resource, OutstandingTag { tag, last_sent: None }))
			.collect();
		session
	}

	/// Snapshot for persistence.
	pub fn record(&self) -> SessionRecord {
		let mut shadows: Vec<_> = self.shadows.values().cloned().collect();
		shadows.sort_by(|a, b| a.resource.cmp(&b.resource));
		let mut tags: Vec<_> = self.tags.iter().map(|(r, out)| (r.clone(), out.tag.clone())).collect();
		tags.sort_by(|a, b| a.0.cmp(&b.0));
		SessionRecord {
			id: self.id.clone(),
			uid: self.uid.clone(),
			shadows,
			tainted: self.tainted.clone(),
			tags,
		}
	}

	pub fn id(&self) -> &SessionId {
		&self.id
	}

	pub fn uid(&self) -> &str {
		&self.uid
	}

	pub fn shadow(&self, resource: &ResourceRef) -> Option<&Shadow> {
		self.shadows.get(resource)
	}

	pub fn tainted(&self) -> &[ResourceRef] {
		&self.tainted
	}

	pub fn is_tainted(&self, resource: &ResourceRef) -> bool {
		self.tainted.contains(resource)
	}

	/// The outstanding tag for `resource`, if a server round is open.
	pub fn tag(&self, resource: &ResourceRef) -> Option<&Tag> {
		self.tags.get(resource).map(|out| &out.tag)
	}

	pub fn has_client(&self) -> bool {
		self.client.is_some()
	}

	/// Handles one event, then flushes whatever is tainted.
	pub async fn handle(&mut self, event: SessionEvent, now: Instant) -> SessionFlow {
		tracing::trace!(session = %self.id, event = event.name(), "session.handle");
		match event {
			SessionEvent::Create { uid } => {
				if self.uid.is_empty() {
					self.uid = uid;
				} else if self.uid != uid {
					tracing::warn!(session = %self.id, current = %self.uid, requested = %uid, "session already owned by another user, ignoring create");
				}
			}
			SessionEvent::Subscribe { resource } => self.subscribe(resource).await,
			SessionEvent::Unsubscribe { resource } => self.unsubscribe(&resource).await,
			SessionEvent::Sync { resource, tag, edits } => self.res_sync(resource, tag, edits, now).await,
			SessionEvent::Taint { resource, at } => self.taint(resource, at).await,
			SessionEvent::ClientAttached { sink } => self.attach(sink),
			SessionEvent::ClientDetached => {
				tracing::debug!(session = %self.id, "session.client_detached");
				self.client = None;
			}
			SessionEvent::Flush => {}
			SessionEvent::Destroy => {
				self.destroy().await;
				return SessionFlow::Destroyed;
			}
		}
		self.flush(now).await;
		SessionFlow::Continue
	}

	/// Marks `resource` dirty. No-op without a shadow or when already tainted.
	pub fn mark_tainted(&mut self, resource: &ResourceRef) -> bool {
		if !self.shadows.contains_key(resource) || self.tainted.contains(resource) {
			return false;
		}
		self.tainted.push(resource.clone());
		true
	}

	/// Runs one flush cycle over every tainted resource.
	///
	/// Without a client nothing happens and the taints stay for the next
	/// attach.
	pub async fn flush(&mut self, now: Instant) {
		if self.tainted.is_empty() {
			return;
		}
		for resource in self.tainted.clone() {
			if self.client.is_none() {
				return;
			}
			self.flush_one(&resource, now).await;
		}
	}

	async fn flush_one(&mut self, resource: &ResourceRef, now: Instant) {
		if !self.shadows.contains_key(resource) {
			self.untaint(resource);
			return;
		}

		if let Some(out) = self.tags.get(resource) {
			if let Some(sent) = out.last_sent
				&& now.saturating_duration_since(sent) < self.config.tag_grace
			{
				return;
			}
			// Stale round: resend under the same tag. The resource stays
			// tainted so the flush after the ack picks up newer changes.
			let tag = out.tag.clone();
			tracing::debug!(session = %self.id, %resource, %tag, "session.resend");
			if self.push_pending(resource, tag).await
				&& let Some(out) = self.tags.get_mut(resource)
			{
				out.last_sent = Some(now);
			}
			return;
		}

		match self.update_pending(resource).await {
			Ok(changed) => {
				// Pending left over from an undelivered reply still needs a round.
				let unacked = self.shadows.get(resource).is_some_and(|shadow| !shadow.pending.is_empty());
				if changed || unacked {
					let tag = Tag::mint();
					tracing::debug!(session = %self.id, %resource, %tag, "session.push");
					let delivered = self.push_pending(resource, tag.clone()).await;
					self.tags.insert(
						resource.clone(),
						OutstandingTag {
							tag,
							last_sent: delivered.then_some(now),
						},
					);
				}
				self.untaint(resource);
				self.flushes.insert(resource.clone(), now);
			}
			Err(err) => {
				tracing::warn!(session = %self.id, %resource, error = %err, "flush abandoned, retrying next cycle");
			}
		}
	}

	/// Loads the master and queues its difference on the shadow.
	async fn update_pending(&mut self, resource: &ResourceRef) -> Result<bool> {
		let kinds = Arc::clone(&self.kinds);
		let kind = kinds.resolve(&resource.kind)?;
		let master = self.store.load(resource).await?;
		let shadow = self
			.shadows
			.get_mut(resource)
			.ok_or_else(|| SyncError::UnknownResource(resource.clone()))?;
		shadow.update_pending(kind, master)
	}

	async fn subscribe(&mut self, resource: ResourceRef) {
		if self.shadows.contains_key(&resource) {
			tracing::debug!(session = %self.id, %resource, "already subscribed");
			return;
		}
		let kinds = Arc::clone(&self.kinds);
		let Some(kind) = kinds.get(&resource.kind) else {
			tracing::warn!(session = %self.id, %resource, "subscribe to unregistered kind");
			self.push_fatal(resource, None, ErrorCode::UnknownResource).await;
			return;
		};
		if let Err(err) = self.store.subscribe(&self.id, &resource).await {
			tracing::warn!(session = %self.id, %resource, error = %err, "subscription not recorded");
			self.push_fatal(resource, None, ErrorCode::Internal).await;
			return;
		}

		tracing::debug!(session = %self.id, %resource, "session.subscribe");
		self.shadows.insert(resource.clone(), Shadow::new(resource.clone(), kind));
		self.mark_tainted(&resource);
	}

	async fn unsubscribe(&mut self, resource: &ResourceRef) {
		if self.shadows.remove(resource).is_none() {
			tracing::debug!(session = %self.id, %resource, "unsubscribe without subscription");
		}
		self.tags.remove(resource);
		self.untaint(resource);
		self.flushes.remove(resource);
		if let Err(err) = self.store.unsubscribe(&self.id, resource).await {
			tracing::warn!(session = %self.id, %resource, error = %err, "store unsubscribe failed");
		}
	}

	async fn taint(&mut self, resource: ResourceRef, at: Instant) {
		if let Some(flushed) = self.flushes.get(&resource)
			&& at < *flushed
		{
			tracing::trace!(session = %self.id, %resource, "stale taint dropped");
			return;
		}
		if !self.mark_tainted(&resource) && !self.shadows.contains_key(&resource) {
			tracing::debug!(session = %self.id, %resource, "taint for resource without shadow");
			self.push_fatal(resource, None, ErrorCode::UnknownResource).await;
		}
	}

	fn attach(&mut self, sink: ClientSink) {
		tracing::debug!(session = %self.id, "session.client_attached");
		self.client = Some(sink);
		// Rounds sent to a previous connection are resent to this one.
		let open: Vec<_> = self.tags.keys().cloned().collect();
		for resource in open {
			if let Some(out) = self.tags.get_mut(&resource) {
				out.last_sent = None;
			}
			self.mark_tainted(&resource);
		}
	}

	async fn res_sync(&mut self, resource: ResourceRef, tag: Option<Tag>, edits: Vec<Edit>, now: Instant) {
		if tag.is_none() && edits.is_empty() {
			tracing::warn!(session = %self.id, %resource, "sync carries neither tag nor edits, discarding");
			return;
		}
		if !self.shadows.contains_key(&resource) {
			tracing::debug!(session = %self.id, %resource, "sync for unknown resource");
			self.push_fatal(resource, tag, ErrorCode::UnknownResource).await;
			return;
		}

		if let Some(tag) = &tag
			&& self.tags.get(&resource).is_some_and(|out| out.tag == *tag)
		{
			self.tags.remove(&resource);
			let acked = match (edits.last(), self.shadows.get_mut(&resource)) {
				(Some(edit), Some(shadow)) => shadow.acknowledge(&edit.clock),
				_ => 0,
			};
			tracing::debug!(session = %self.id, %resource, %tag, acked, "session.ack");
			return;
		}

		if let Err(err) = self.apply_client_edits(&resource, &edits).await {
			self.fail_sync(resource, tag, err).await;
			return;
		}

		// A client-initiated sync supersedes any unanswered server round.
		self.tags.remove(&resource);
		let refreshed = match self.update_pending(&resource).await {
			Ok(_) => true,
			Err(err) => {
				tracing::warn!(session = %self.id, %resource, error = %err, "master reload failed after client sync");
				false
			}
		};
		let reply = tag.unwrap_or_else(Tag::mint);
		if self.push_pending(&resource, reply).await && refreshed {
			self.untaint(&resource);
			self.flushes.insert(resource, now);
		} else {
			self.mark_tainted(&resource);
		}
	}

	async fn apply_client_edits(&mut self, resource: &ResourceRef, edits: &[Edit]) -> Result<()> {
		let kinds = Arc::clone(&self.kinds);
		let kind = kinds.resolve(&resource.kind)?;
		for edit in edits {
			let shadow = self
				.shadows
				.get_mut(resource)
				.ok_or_else(|| SyncError::UnknownResource(resource.clone()))?;
			let patches = shadow.sync_incoming(kind, edit)?;
			for patch in &patches {
				self.persist(resource, patch).await;
			}
		}
		Ok(())
	}

	/// Forwards one patch to the store. A rejected patch leaves the resource
	/// tainted so the next flush pushes the master back to the client.
	async fn persist(&mut self, resource: &ResourceRef, patch: &Document) {
		if let Err(err) = self.store.apply_patch(resource, patch, Some(&self.id)).await {
			tracing::warn!(session = %self.id, %resource, error = %err, "patch rejected by store");
			self.mark_tainted(resource);
		}
	}

	async fn fail_sync(&mut self, resource: ResourceRef, tag: Option<Tag>, err: SyncError) {
		tracing::warn!(session = %self.id, %resource, error = %err, "sync failed");
		let code = err.code();
		if let SyncError::Diverged { .. } = err
			&& let Some(kind) = self.kinds.get(&resource.kind)
		{
			self.shadows.insert(resource.clone(), Shadow::new(resource.clone(), kind));
			self.tags.remove(&resource);
			self.flushes.remove(&resource);
			self.mark_tainted(&resource);
		}
		self.push_fatal(resource, tag, code).await;
	}

	async fn destroy(&mut self) {
		tracing::debug!(session = %self.id, "session.destroy");
		let resources: Vec<_> = self.shadows.keys().cloned().collect();
		for resource in &resources {
			self.unsubscribe(resource).await;
		}
		if let Err(err) = self.store.delete_session(&self.id).await {
			tracing::warn!(session = %self.id, error = %err, "session record not deleted");
		}
		self.client = None;
	}

	fn untaint(&mut self, resource: &ResourceRef) {
		self.tainted.retain(|r| r != resource);
	}

	async fn push_pending(&mut self, resource: &ResourceRef, tag: Tag) -> bool {
		let Some(shadow) = self.shadows.get(resource) else {
			return false;
		};
		let msg = ClientMsg::Sync {
			resource: resource.clone(),
			tag,
			clock: shadow.clock,
			edits: shadow.pending.clone(),
		};
		self.push(msg).await
	}

	async fn push_fatal(&mut self, resource: ResourceRef, tag: Option<Tag>, code: ErrorCode) {
		self.push(ClientMsg::Fatal { resource, tag, code }).await;
	}

	/// Delivers to the client. A closed or full output detaches it.
	async fn push(&mut self, msg: ClientMsg) -> bool {
		let Some(client) = &self.client else {
			return false;
		};
		let outcome = client.try_send(msg).await;
		match outcome {
			Ok(MailboxSendOutcome::Enqueued) => true,
			Ok(MailboxSendOutcome::DroppedNewest) => {
				tracing::warn!(session = %self.id, "client output full, detaching");
				self.client = None;
				false
			}
			Err(err) => {
				tracing::debug!(session = %self.id, error = %err, "client output gone, detaching");
				self.client = None;
				false
			}
		}
	}
}
