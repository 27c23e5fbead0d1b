//! Session worker: the single execution context of one active session.

use std::sync::Arc;

use dsync_core::{KindRegistry, Session, SessionEvent, SessionFlow, SessionId, Store};
use dsync_worker::MailboxReceiver;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep};

use crate::HubConfig;
use crate::handle::Envelope;

/// Sent on the hub's exit channel once a worker task has finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WorkerExit {
	pub session: SessionId,
	pub generation: u64,
}

pub(crate) struct SessionWorker {
	id: SessionId,
	generation: u64,
	mailbox: MailboxReceiver<Envelope>,
	store: Arc<dyn Store>,
	kinds: Arc<KindRegistry>,
	config: HubConfig,
	session: Option<Session>,
}

impl SessionWorker {
	pub(crate) fn new(id: SessionId, generation: u64, mailbox: MailboxReceiver<Envelope>, store: Arc<dyn Store>, kinds: Arc<KindRegistry>, config: HubConfig) -> Self {
		Self {
			id,
			generation,
			mailbox,
			store,
			kinds,
			config,
			session: None,
		}
	}

	/// Serves the mailbox until it is closed and drained, either by the hub
	/// or by going idle, then persists the session.
	pub(crate) async fn run(mut self) {
		self.activate().await;

		let period = self.config.flush_interval();
		let linger = self.config.idle_linger();
		let mut tick = interval_at(Instant::now() + period, period);
		tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
		let idle = sleep(linger);
		tokio::pin!(idle);

		loop {
			tokio::select! {
				biased;
				msg = self.mailbox.recv() => {
					let Some(envelope) = msg else {
						break;
					};
					self.deliver(envelope).await;
					idle.as_mut().reset(Instant::now() + linger);
				}
				_ = tick.tick() => {
					if let Some(session) = &mut self.session {
						session.handle(SessionEvent::Flush, Instant::now()).await;
					}
				}
				() = &mut idle => {
					// A connected client keeps the session resident.
					if self.session.as_ref().is_some_and(Session::has_client) {
						idle.as_mut().reset(Instant::now() + linger);
					} else {
						tracing::debug!(session = %self.id, generation = self.generation, "hub.worker.idle");
						self.mailbox.close().await;
					}
				}
			}
		}

		self.persist().await;
	}

	async fn activate(&mut self) {
		match self.store.load_session(&self.id).await {
			Ok(Some(record)) => {
				tracing::debug!(session = %self.id, generation = self.generation, resources = record.shadows.len(), "hub.worker.restore");
				self.session = Some(Session::restore(record, Arc::clone(&self.store), Arc::clone(&self.kinds), self.config.session_config()));
			}
			Ok(None) => {}
			Err(err) => {
				tracing::warn!(session = %self.id, error = %err, "session record unavailable, starting unborn");
			}
		}
	}

	async fn deliver(&mut self, envelope: Envelope) {
		debug_assert_eq!(envelope.session, self.id, "envelope routed to the wrong session worker");
		if envelope.session != self.id {
			tracing::error!(worker = %self.id, session = %envelope.session, event = envelope.event.name(), "misrouted envelope dropped");
			return;
		}

		let now = Instant::now();
		match (&mut self.session, envelope.event) {
			(Some(session), event) => {
				if session.handle(event, now).await == SessionFlow::Destroyed {
					tracing::debug!(session = %self.id, "session destroyed");
					self.session = None;
				}
			}
			(None, SessionEvent::Create { uid }) => {
				tracing::debug!(session = %self.id, %uid, "session.create");
				self.session = Some(Session::new(self.id.clone(), uid, Arc::clone(&self.store), Arc::clone(&self.kinds), self.config.session_config()));
			}
			(None, event) => {
				tracing::warn!(session = %self.id, event = event.name(), "event for unborn session discarded");
			}
		}
	}

	async fn persist(&self) {
		let Some(session) = &self.session else {
			return;
		};
		if let Err(err) = self.store.save_session(&session.record()).await {
			tracing::warn!(session = %self.id, error = %err, "session record not saved");
		}
	}
}
