use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dsync_worker::{Mailbox, MailboxPolicy, MailboxReceiver};
use pretty_assertions::assert_eq;
use tokio::time::{Instant, advance};

use super::*;
use crate::Clock;
use crate::kind::{Note, NoteDelta, ResourceValue};
use crate::StoreError;
use crate::store::MemoryStore;

/// Wraps a [`MemoryStore`]; master and record access fails while offline.
struct FlakyStore {
	inner: Arc<MemoryStore>,
	offline: AtomicBool,
}

impl FlakyStore {
	fn set_offline(&self, offline: bool) {
		self.offline.store(offline, Ordering::SeqCst);
	}

	fn check(&self) -> std::result::Result<(), StoreError> {
		if self.offline.load(Ordering::SeqCst) {
			return Err(StoreError::Backend("store offline".into()));
		}
		Ok(())
	}
}

#[async_trait]
impl Store for FlakyStore {
	async fn load(&self, resource: &ResourceRef) -> std::result::Result<Document, StoreError> {
		self.check()?;
		self.inner.load(resource).await
	}

	async fn apply_patch(&self, resource: &ResourceRef, patch: &Document, origin: Option<&SessionId>) -> std::result::Result<(), StoreError> {
		self.check()?;
		self.inner.apply_patch(resource, patch, origin).await
	}

	async fn subscriptions_for(&self, resource: &ResourceRef) -> std::result::Result<Vec<SessionId>, StoreError> {
		self.inner.subscriptions_for(resource).await
	}

	async fn subscribe(&self, session: &SessionId, resource: &ResourceRef) -> std::result::Result<(), StoreError> {
		self.inner.subscribe(session, resource).await
	}

	async fn unsubscribe(&self, session: &SessionId, resource: &ResourceRef) -> std::result::Result<(), StoreError> {
		self.inner.unsubscribe(session, resource).await
	}

	async fn load_session(&self, id: &SessionId) -> std::result::Result<Option<SessionRecord>, StoreError> {
		self.check()?;
		self.inner.load_session(id).await
	}

	async fn save_session(&self, record: &SessionRecord) -> std::result::Result<(), StoreError> {
		self.check()?;
		self.inner.save_session(record).await
	}

	async fn delete_session(&self, id: &SessionId) -> std::result::Result<(), StoreError> {
		self.inner.delete_session(id).await
	}
}

struct Harness {
	store: Arc<MemoryStore>,
	backend: Arc<FlakyStore>,
	session: Session,
	client: MailboxReceiver<ClientMsg>,
}

impl Harness {
	async fn new() -> Self {
		Self::with_output_capacity(16).await
	}

	async fn with_output_capacity(capacity: usize) -> Self {
		let kinds = Arc::new(KindRegistry::standard());
		let store = Arc::new(MemoryStore::new(kinds.clone()));
		let backend = Arc::new(FlakyStore {
			inner: store.clone(),
			offline: AtomicBool::new(false),
		});
		let session = Session::new(SessionId::from("s1"), "u1".into(), backend.clone(), kinds, SessionConfig::default());
		let mut harness = Self {
			store,
			backend,
			session,
			client: Mailbox::new(1, MailboxPolicy::DropNewest).receiver(),
		};
		harness.client = harness.attach(capacity).await;
		harness
	}

	async fn attach(&mut self, capacity: usize) -> MailboxReceiver<ClientMsg> {
		let (sink, client) = Mailbox::new(capacity, MailboxPolicy::DropNewest).split();
		self.send(SessionEvent::ClientAttached { sink }).await;
		client
	}

	async fn send(&mut self, event: SessionEvent) -> SessionFlow {
		self.session.handle(event, Instant::now()).await
	}

	async fn next_msg(&self) -> Option<ClientMsg> {
		self.client.try_recv().await
	}

	async fn expect_sync(&self) -> (Tag, Clock, Vec<Edit>) {
		match self.next_msg().await {
			Some(ClientMsg::Sync { tag, clock, edits, .. }) => (tag, clock, edits),
			other => panic!("expected a sync message, got {other:?}"),
		}
	}

	/// Subscribes to `resource` and acks the initial full sync.
	async fn subscribe_synced(&mut self, resource: &ResourceRef) {
		self.send(SessionEvent::Subscribe { resource: resource.clone() }).await;
		let (tag, clock, _) = self.expect_sync().await;
		self.send(ack(resource, tag, clock)).await;
		assert!(self.session.tag(resource).is_none());
	}
}

fn note_ref() -> ResourceRef {
	ResourceRef::new("note", "r")
}

fn note_doc(body: &str) -> Document {
	serde_json::to_value(Note::new("", body)).unwrap()
}

fn body_delta(from: &str, to: &str) -> Document {
	serde_json::to_value(Note::new("", from).delta(&Note::new("", to))).unwrap()
}

fn empty_delta() -> Document {
	serde_json::to_value(NoteDelta::default()).unwrap()
}

fn ack(resource: &ResourceRef, tag: Tag, server: Clock) -> SessionEvent {
	SessionEvent::Sync {
		resource: resource.clone(),
		tag: Some(tag),
		edits: vec![Edit {
			clock: Clock::new(server.cv, server.sv, 0),
			delta: empty_delta(),
		}],
	}
}

fn client_edit(resource: &ResourceRef, tag: &str, clock: Clock, delta: Document) -> SessionEvent {
	SessionEvent::Sync {
		resource: resource.clone(),
		tag: Some(Tag(tag.into())),
		edits: vec![Edit { clock, delta }],
	}
}

#[tokio::test(start_paused = true)]
async fn taint_flush_ack_round_trip() {
	let mut h = Harness::new().await;
	let r = note_ref();
	h.store.put(r.clone(), note_doc("v0"));

	h.send(SessionEvent::Subscribe { resource: r.clone() }).await;
	let (t0, clock0, edits0) = h.expect_sync().await;
	assert_eq!(clock0, Clock::new(0, 1, 0));
	assert_eq!(edits0[0].delta, body_delta("", "v0"));
	h.send(ack(&r, t0.clone(), clock0)).await;
	assert!(h.session.shadow(&r).unwrap().pending.is_empty());

	advance(Duration::from_secs(1)).await;
	h.store.put(r.clone(), note_doc("v1"));
	h.send(SessionEvent::Taint {
		resource: r.clone(),
		at: Instant::now(),
	})
	.await;

	let (t1, clock1, edits1) = h.expect_sync().await;
	assert_ne!(t1, t0);
	assert_eq!(
		edits1,
		[Edit {
			clock: Clock::new(0, 1, 1),
			delta: body_delta("v0", "v1"),
		}]
	);
	assert_eq!(clock1.sv, 2);
	assert_eq!(h.session.shadow(&r).unwrap().clock.sv, 2);
	assert!(h.next_msg().await.is_none());
	assert_eq!(h.session.tag(&r), Some(&t1));

	h.send(ack(&r, t1, clock1)).await;
	assert!(h.session.tag(&r).is_none());
	assert!(!h.session.is_tainted(&r));
	assert!(h.session.shadow(&r).unwrap().pending.is_empty());
	assert!(h.next_msg().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn taint_older_than_last_flush_is_dropped() {
	let mut h = Harness::new().await;
	let r = note_ref();
	h.store.put(r.clone(), note_doc("v0"));
	let before = Instant::now();
	advance(Duration::from_millis(5)).await;
	h.subscribe_synced(&r).await;

	h.store.put(r.clone(), note_doc("changed"));
	h.send(SessionEvent::Taint { resource: r.clone(), at: before }).await;

	assert!(!h.session.is_tainted(&r));
	assert!(h.next_msg().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn open_round_is_skipped_within_grace_and_resent_with_same_tag() {
	let mut h = Harness::new().await;
	let r = note_ref();
	h.store.put(r.clone(), note_doc("v0"));
	h.send(SessionEvent::Subscribe { resource: r.clone() }).await;
	let (t0, _, first) = h.expect_sync().await;

	advance(Duration::from_secs(1)).await;
	h.store.put(r.clone(), note_doc("v1"));
	h.send(SessionEvent::Taint {
		resource: r.clone(),
		at: Instant::now(),
	})
	.await;
	assert!(h.next_msg().await.is_none());
	assert!(h.session.is_tainted(&r));

	advance(Duration::from_secs(10)).await;
	h.send(SessionEvent::Flush).await;
	let (resent, clock, edits) = h.expect_sync().await;
	assert_eq!(resent, t0);
	assert_eq!(edits, first);
	assert!(h.session.is_tainted(&r));

	h.send(ack(&r, t0.clone(), clock)).await;
	let (t1, _, edits) = h.expect_sync().await;
	assert_ne!(t1, t0);
	assert_eq!(edits.len(), 1);
	assert_eq!(edits[0].delta, body_delta("v0", "v1"));
	assert!(!h.session.is_tainted(&r));
}

#[tokio::test(start_paused = true)]
async fn client_sync_is_applied_persisted_and_answered() {
	let mut h = Harness::new().await;
	let r = note_ref();
	h.store.put(r.clone(), note_doc("v0"));
	h.subscribe_synced(&r).await;

	h.send(client_edit(&r, "c1", Clock::new(0, 1, 0), body_delta("v0", "v0 edited"))).await;

	let (tag, clock, edits) = h.expect_sync().await;
	assert_eq!(tag, Tag("c1".into()));
	assert_eq!(clock, Clock::new(1, 1, 0));
	assert!(edits.is_empty());
	assert_eq!(h.store.get(&r).unwrap(), note_doc("v0 edited"));
	assert!(h.session.tag(&r).is_none());
	assert!(!h.session.is_tainted(&r));
}

#[tokio::test(start_paused = true)]
async fn duplicate_client_edit_is_acked_without_reapplying() {
	let mut h = Harness::new().await;
	let r = note_ref();
	h.store.put(r.clone(), note_doc("v0"));
	h.subscribe_synced(&r).await;

	h.send(client_edit(&r, "c1", Clock::new(0, 1, 0), body_delta("v0", "x"))).await;
	let _ = h.expect_sync().await;
	h.send(client_edit(&r, "c1", Clock::new(0, 1, 0), body_delta("v0", "x"))).await;

	let (_, clock, _) = h.expect_sync().await;
	assert_eq!(clock.cv, 1);
	assert_eq!(h.store.get(&r).unwrap(), note_doc("x"));
}

#[tokio::test(start_paused = true)]
async fn rejected_patch_pushes_master_back() {
	let mut h = Harness::new().await;
	let r = note_ref();
	h.store.put(r.clone(), note_doc("v0"));
	h.subscribe_synced(&r).await;

	// Another writer moves the master without this session hearing about it.
	h.store.put(r.clone(), note_doc("theirs"));
	h.send(client_edit(&r, "c1", Clock::new(0, 1, 0), body_delta("v0", "mine"))).await;

	let (tag, clock, edits) = h.expect_sync().await;
	assert_eq!(tag, Tag("c1".into()));
	assert_eq!(clock.cv, 1);
	assert_eq!(edits.len(), 1);
	assert_eq!(edits[0].delta, body_delta("mine", "theirs"));
	assert_eq!(h.store.get(&r).unwrap(), note_doc("theirs"));
}

#[tokio::test(start_paused = true)]
async fn sync_for_unknown_resource_gets_fatal_reply() {
	let mut h = Harness::new().await;
	let ghost = ResourceRef::new("note", "ghost");
	h.send(client_edit(&ghost, "c9", Clock::default(), body_delta("", "x"))).await;

	assert_eq!(
		h.next_msg().await,
		Some(ClientMsg::Fatal {
			resource: ghost,
			tag: Some(Tag("c9".into())),
			code: ErrorCode::UnknownResource,
		})
	);
}

#[tokio::test(start_paused = true)]
async fn sync_without_tag_or_edits_is_discarded() {
	let mut h = Harness::new().await;
	let r = note_ref();
	h.store.put(r.clone(), note_doc("v0"));
	h.subscribe_synced(&r).await;

	h.send(SessionEvent::Sync {
		resource: r.clone(),
		tag: None,
		edits: Vec::new(),
	})
	.await;
	assert!(h.next_msg().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn diverged_client_resets_shadow_and_resyncs() {
	let mut h = Harness::new().await;
	let r = note_ref();
	h.store.put(r.clone(), note_doc("v0"));
	h.subscribe_synced(&r).await;

	h.send(client_edit(&r, "c1", Clock::new(5, 1, 0), body_delta("v0", "x"))).await;

	assert_eq!(
		h.next_msg().await,
		Some(ClientMsg::Fatal {
			resource: r.clone(),
			tag: Some(Tag("c1".into())),
			code: ErrorCode::Diverged,
		})
	);
	let (_, clock, edits) = h.expect_sync().await;
	assert_eq!(clock, Clock::new(0, 1, 0));
	assert_eq!(edits[0].delta, body_delta("", "v0"));
}

#[tokio::test(start_paused = true)]
async fn unsubscribe_forgets_shadow_tag_and_subscription() {
	let mut h = Harness::new().await;
	let r = note_ref();
	h.store.put(r.clone(), note_doc("v0"));
	h.send(SessionEvent::Subscribe { resource: r.clone() }).await;
	assert!(h.session.tag(&r).is_some());

	h.send(SessionEvent::Unsubscribe { resource: r.clone() }).await;
	assert!(h.session.shadow(&r).is_none());
	assert!(h.session.tag(&r).is_none());
	assert!(!h.session.is_tainted(&r));
	assert!(h.store.subscriptions_for(&r).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn taints_wait_for_a_client() {
	let mut h = Harness::new().await;
	let r = note_ref();
	h.store.put(r.clone(), note_doc("v0"));
	h.send(SessionEvent::ClientDetached).await;
	h.send(SessionEvent::Subscribe { resource: r.clone() }).await;
	assert!(h.session.is_tainted(&r));

	h.client = h.attach(4).await;
	let (_, _, edits) = h.expect_sync().await;
	assert_eq!(edits[0].delta, body_delta("", "v0"));
	assert!(!h.session.is_tainted(&r));
}

#[tokio::test(start_paused = true)]
async fn full_output_detaches_and_reattach_resends_open_rounds() {
	let mut h = Harness::with_output_capacity(1).await;
	let (a, b) = (ResourceRef::new("note", "a"), ResourceRef::new("note", "b"));
	h.store.put(a.clone(), note_doc("a0"));
	h.store.put(b.clone(), note_doc("b0"));

	h.send(SessionEvent::Subscribe { resource: a.clone() }).await;
	h.send(SessionEvent::Subscribe { resource: b.clone() }).await;
	assert!(!h.session.has_client());
	let open: HashSet<_> = [h.session.tag(&a).unwrap().clone(), h.session.tag(&b).unwrap().clone()].into();

	h.client = h.attach(4).await;
	let (t1, ..) = h.expect_sync().await;
	let (t2, ..) = h.expect_sync().await;
	assert_eq!(HashSet::from([t1, t2]), open);
}

#[tokio::test(start_paused = true)]
async fn store_failure_keeps_resource_tainted_until_next_cycle() {
	let mut h = Harness::new().await;
	let r = note_ref();
	h.store.put(r.clone(), note_doc("v0"));
	h.backend.set_offline(true);

	h.send(SessionEvent::Subscribe { resource: r.clone() }).await;
	assert!(h.next_msg().await.is_none());
	assert!(h.session.is_tainted(&r));

	h.backend.set_offline(false);
	h.send(SessionEvent::Flush).await;
	let _ = h.expect_sync().await;
	assert!(!h.session.is_tainted(&r));
}

#[tokio::test(start_paused = true)]
async fn undelivered_reply_is_pushed_on_next_flush() {
	let mut h = Harness::with_output_capacity(1).await;
	let r = note_ref();
	h.store.put(r.clone(), note_doc("v0"));
	h.subscribe_synced(&r).await;

	// Master moves without a taint reaching the session, then the output fills.
	h.store.put(r.clone(), note_doc("v1"));
	h.send(client_edit(&ResourceRef::new("note", "ghost"), "g", Clock::default(), body_delta("", "x"))).await;
	h.send(SessionEvent::Sync {
		resource: r.clone(),
		tag: Some(Tag("c1".into())),
		edits: Vec::new(),
	})
	.await;
	assert!(!h.session.has_client());
	assert_eq!(h.session.shadow(&r).unwrap().pending.len(), 1);

	h.client = h.attach(4).await;
	advance(Duration::from_secs(60)).await;
	h.send(SessionEvent::Flush).await;

	let (tag, _, edits) = h.expect_sync().await;
	assert_eq!(edits.len(), 1);
	assert_eq!(edits[0].delta, body_delta("v0", "v1"));
	assert_eq!(h.session.tag(&r), Some(&tag));
	assert!(!h.session.is_tainted(&r));
}

#[tokio::test(start_paused = true)]
async fn oversized_text_ops_are_answered_with_invalid_delta() {
	let mut h = Harness::new().await;
	let r = note_ref();
	h.store.put(r.clone(), note_doc("v"));
	h.subscribe_synced(&r).await;

	let delta = serde_json::json!({ "body": [{ "retain": usize::MAX }, { "delete": 2 }] });
	h.send(client_edit(&r, "c1", Clock::new(0, 1, 0), delta)).await;

	assert_eq!(
		h.next_msg().await,
		Some(ClientMsg::Fatal {
			resource: r.clone(),
			tag: Some(Tag("c1".into())),
			code: ErrorCode::InvalidDelta,
		})
	);
	assert_eq!(h.session.shadow(&r).unwrap().clock.cv, 0);
	assert_eq!(h.store.get(&r).unwrap(), note_doc("v"));

	h.send(client_edit(&r, "c2", Clock::new(0, 1, 0), body_delta("v", "v2"))).await;
	let (tag, clock, _) = h.expect_sync().await;
	assert_eq!(tag, Tag("c2".into()));
	assert_eq!(clock.cv, 1);
	assert_eq!(h.store.get(&r).unwrap(), note_doc("v2"));
}

#[tokio::test(start_paused = true)]
async fn restored_session_resends_open_rounds() {
	let mut h = Harness::new().await;
	let r = note_ref();
	h.store.put(r.clone(), note_doc("v0"));
	h.send(SessionEvent::Subscribe { resource: r.clone() }).await;
	let (t0, ..) = h.expect_sync().await;

	let record = h.session.record();
	assert_eq!(record.tags, [(r.clone(), t0.clone())]);
	h.session = Session::restore(record, h.store.clone(), Arc::new(KindRegistry::standard()), SessionConfig::default());
	assert_eq!(h.session.uid(), "u1");

	h.client = h.attach(4).await;
	let (resent, ..) = h.expect_sync().await;
	assert_eq!(resent, t0);
}

#[tokio::test(start_paused = true)]
async fn destroy_drops_subscriptions_and_record() {
	let mut h = Harness::new().await;
	let r = note_ref();
	h.send(SessionEvent::Subscribe { resource: r.clone() }).await;
	h.store.save_session(&h.session.record()).await.unwrap();

	assert_eq!(h.send(SessionEvent::Destroy).await, SessionFlow::Destroyed);
	assert!(h.store.subscriptions_for(&r).await.unwrap().is_empty());
	assert!(h.store.load_session(h.session.id()).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn mark_tainted_requires_a_shadow() {
	let mut h = Harness::new().await;
	assert!(!h.session.mark_tainted(&note_ref()));
	h.send(SessionEvent::ClientDetached).await;
	h.send(SessionEvent::Subscribe { resource: note_ref() }).await;
	assert!(!h.session.mark_tainted(&note_ref()));
	assert_eq!(h.session.tainted(), [note_ref()]);
}
