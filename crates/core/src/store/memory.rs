use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{SessionRecord, Store, TaintSink};
use crate::kind::{DynKind, KindRegistry};
use crate::{Document, KindError, ResourceRef, SessionId, StoreError};

#[derive(Default)]
struct MemoryState {
	values: HashMap<ResourceRef, Document>,
	subscribers: HashMap<ResourceRef, BTreeSet<SessionId>>,
	sessions: HashMap<SessionId, SessionRecord>,
}

impl MemoryState {
	fn subscribers_of<'a>(&'a self, resource: &ResourceRef) -> impl Iterator<Item = &'a SessionId> + 'a {
		self.subscribers.get(resource).into_iter().flatten()
	}
}

/// In-process [`Store`] backed by hash maps.
///
/// Patches are validated and applied under one lock; taint notifications go
/// out after the lock is released.
pub struct MemoryStore {
	kinds: Arc<KindRegistry>,
	state: Mutex<MemoryState>,
	sink: Option<Arc<dyn TaintSink>>,
}

impl MemoryStore {
	pub fn new(kinds: Arc<KindRegistry>) -> Self {
		Self {
			kinds,
			state: Mutex::new(MemoryState::default()),
			sink: None,
		}
	}

	/// Routes change notifications to `sink`.
	pub fn with_sink(mut self, sink: Arc<dyn TaintSink>) -> Self {
		self.sink = Some(sink);
		self
	}

	/// Overwrites a master value without a precondition and taints every
	/// subscriber. Used for seeding and for changes made outside any session.
	pub fn put(&self, resource: ResourceRef, value: Document) {
		let targets: Vec<_> = {
			let mut state = self.state.lock();
			state.values.insert(resource.clone(), value);
			state.subscribers_of(&resource).cloned().map(|s| (s, resource.clone())).collect()
		};
		self.notify(targets);
	}

	/// Stored master value, if one was ever written.
	pub fn get(&self, resource: &ResourceRef) -> Option<Document> {
		self.state.lock().values.get(resource).cloned()
	}

	fn kind(&self, resource: &ResourceRef) -> Result<&dyn DynKind, StoreError> {
		self.kinds.get(&resource.kind).ok_or_else(|| StoreError::UnknownKind(resource.kind.clone()))
	}

	fn notify(&self, targets: Vec<(SessionId, ResourceRef)>) {
		let Some(sink) = &self.sink else {
			return;
		};
		let at = Instant::now();
		for (session, resource) in targets {
			tracing::trace!(%session, %resource, "store.taint");
			sink.taint(&session, &resource, at);
		}
	}
}

fn patch_error(resource: &ResourceRef, err: KindError) -> StoreError {
	match err {
		KindError::Apply(reason) => StoreError::Conflict {
			resource: resource.clone(),
			reason,
		},
		KindError::Codec(source) => StoreError::Malformed {
			resource: resource.clone(),
			source,
		},
	}
}

#[async_trait]
impl Store for MemoryStore {
	async fn load(&self, resource: &ResourceRef) -> Result<Document, StoreError> {
		let kind = self.kind(resource)?;
		let state = self.state.lock();
		Ok(state.values.get(resource).cloned().unwrap_or_else(|| kind.empty()))
	}

	async fn apply_patch(&self, resource: &ResourceRef, patch: &Document, origin: Option<&SessionId>) -> Result<(), StoreError> {
		let kind = self.kind(resource)?;
		let affected = kind.patch_affects(patch).map_err(|err| patch_error(resource, err))?;

		let targets = {
			let mut state = self.state.lock();
			let current = state.values.get(resource).cloned().unwrap_or_else(|| kind.empty());
			let next = kind.apply_patch(&current, patch).map_err(|err| patch_error(resource, err))?;
			state.values.insert(resource.clone(), next);

			let mut targets: Vec<_> = state
				.subscribers_of(resource)
				.filter(|s| Some(*s) != origin)
				.cloned()
				.map(|s| (s, resource.clone()))
				.collect();
			for other in &affected {
				targets.extend(state.subscribers_of(other).cloned().map(|s| (s, other.clone())));
			}
			targets
		};

		self.notify(targets);
		Ok(())
	}

	async fn subscriptions_for(&self, resource: &ResourceRef) -> Result<Vec<SessionId>, StoreError> {
		Ok(self.state.lock().subscribers_of(resource).cloned().collect())
	}

	async fn subscribe(&self, session: &SessionId, resource: &ResourceRef) -> Result<(), StoreError> {
		self.kind(resource)?;
		self.state.lock().subscribers.entry(resource.clone()).or_default().insert(session.clone());
		Ok(())
	}

	async fn unsubscribe(&self, session: &SessionId, resource: &ResourceRef) -> Result<(), StoreError> {
		let mut state = self.state.lock();
		if let Some(subs) = state.subscribers.get_mut(resource) {
			subs.remove(session);
			if subs.is_empty() {
				state.subscribers.remove(resource);
			}
		}
		Ok(())
	}

	async fn load_session(&self, id: &SessionId) -> Result<Option<SessionRecord>, StoreError> {
		Ok(self.state.lock().sessions.get(id).cloned())
	}

	async fn save_session(&self, record: &SessionRecord) -> Result<(), StoreError> {
		self.state.lock().sessions.insert(record.id.clone(), record.clone());
		Ok(())
	}

	async fn delete_session(&self, id: &SessionId) -> Result<(), StoreError> {
		self.state.lock().sessions.remove(id);
		Ok(())
	}
}
