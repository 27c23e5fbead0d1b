use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use dsync_core::{KindRegistry, SessionId, Store};
use dsync_worker::{GenerationClock, Mailbox, MailboxPolicy, MailboxSender, TaskClass};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::HubConfig;
use crate::handle::{Envelope, HubCmd, HubInbox};
use crate::worker::{SessionWorker, WorkerExit};

struct ActiveSession {
	mailbox: MailboxSender<Envelope>,
	generation: u64,
	/// Events that arrived after the worker closed its mailbox, replayed into
	/// the next generation.
	backlog: VecDeque<Envelope>,
}

/// Dispatcher owning one serialized worker per active session.
///
/// Workers are spawned on the first event for a session and retire on their
/// own once idle. Events for a retiring session are parked and handed to a
/// fresh worker when the old one reports its exit, so per-session order is
/// kept across generations.
pub struct SessionHub {
	store: Arc<dyn Store>,
	kinds: Arc<KindRegistry>,
	config: HubConfig,
	active: HashMap<SessionId, ActiveSession>,
	generations: GenerationClock,
	exits: mpsc::Sender<WorkerExit>,
	closing: bool,
}

impl SessionHub {
	/// Spawns the dispatcher task. It runs until
	/// [`HubHandle::shutdown`](crate::HubHandle::shutdown) is called or every
	/// handle is dropped.
	pub fn start(inbox: HubInbox, store: Arc<dyn Store>, kinds: Arc<KindRegistry>, config: HubConfig) -> JoinHandle<()> {
		let (exits, exit_rx) = mpsc::channel(config.hub_mailbox.max(1));
		let hub = Self {
			store,
			kinds,
			config,
			active: HashMap::new(),
			generations: GenerationClock::new(),
			exits,
			closing: false,
		};
		dsync_worker::spawn(TaskClass::Dispatcher, hub.run(inbox.rx, exit_rx))
	}

	async fn run(mut self, mut inbox: mpsc::Receiver<HubCmd>, mut exit_rx: mpsc::Receiver<WorkerExit>) {
		tracing::debug!("hub.start");
		let mut replies = Vec::new();
		loop {
			tokio::select! {
				cmd = inbox.recv() => match cmd {
					Some(HubCmd::Route(envelope)) => self.route(envelope).await,
					Some(HubCmd::Shutdown { reply }) => {
						replies.push(reply);
						break;
					}
					None => break,
				},
				Some(exit) = exit_rx.recv() => self.on_exit(exit).await,
			}
		}

		// Whatever was queued before the close still gets delivered.
		inbox.close();
		while let Some(cmd) = inbox.recv().await {
			match cmd {
				HubCmd::Route(envelope) => self.route(envelope).await,
				HubCmd::Shutdown { reply } => replies.push(reply),
			}
		}

		self.shutdown(&mut exit_rx).await;
		for reply in replies {
			let _ = reply.send(());
		}
		tracing::debug!("hub.stop");
	}

	async fn route(&mut self, envelope: Envelope) {
		let id = envelope.session.clone();
		if !self.active.contains_key(&id) {
			self.activate(id.clone());
		}
		let Some(entry) = self.active.get_mut(&id) else {
			return;
		};
		if !entry.backlog.is_empty() {
			entry.backlog.push_back(envelope);
			return;
		}
		if let Err((err, envelope)) = entry.mailbox.send_returning(envelope).await {
			tracing::debug!(session = %id, generation = entry.generation, error = %err, "session retiring, event parked");
			entry.backlog.push_back(envelope);
		}
	}

	fn activate(&mut self, id: SessionId) {
		let generation = self.generations.next();
		let (mailbox, rx) = Mailbox::new(self.config.session_mailbox, MailboxPolicy::Backpressure).split();
		let worker = SessionWorker::new(id.clone(), generation, rx, Arc::clone(&self.store), Arc::clone(&self.kinds), self.config.clone());

		let closer = mailbox.clone();
		let exits = self.exits.clone();
		let session = id.clone();
		tracing::debug!(%session, generation, "hub.worker.spawn");
		dsync_worker::spawn(TaskClass::Session, async move {
			// The worker runs in its own task so a panic is observed here and
			// still produces an exit.
			let outcome = dsync_worker::spawn(TaskClass::Session, worker.run()).await;
			closer.close().await;
			if let Err(err) = outcome {
				tracing::error!(%session, generation, error = %err, "session worker failed");
			}
			let _ = exits.send(WorkerExit { session, generation }).await;
		});

		self.active.insert(
			id,
			ActiveSession {
				mailbox,
				generation,
				backlog: VecDeque::new(),
			},
		);
	}

	async fn on_exit(&mut self, exit: WorkerExit) {
		let current = self.active.get(&exit.session).is_some_and(|entry| entry.generation == exit.generation);
		if !current {
			tracing::trace!(session = %exit.session, generation = exit.generation, "stale worker exit ignored");
			return;
		}
		let Some(entry) = self.active.remove(&exit.session) else {
			return;
		};
		tracing::debug!(session = %exit.session, generation = exit.generation, parked = entry.backlog.len(), "hub.worker.exit");
		if entry.backlog.is_empty() {
			return;
		}

		self.activate(exit.session.clone());
		for envelope in entry.backlog {
			self.route(envelope).await;
		}
		if self.closing
			&& let Some(next) = self.active.get(&exit.session)
		{
			next.mailbox.close().await;
		}
	}

	/// Closes every mailbox and waits until each worker, including the ones
	/// spawned to replay backlogs, has exited.
	async fn shutdown(&mut self, exit_rx: &mut mpsc::Receiver<WorkerExit>) {
		tracing::info!(active = self.active.len(), "hub shutting down");
		self.closing = true;
		for entry in self.active.values() {
			entry.mailbox.close().await;
		}
		while !self.active.is_empty() {
			let Some(exit) = exit_rx.recv().await else {
				break;
			};
			self.on_exit(exit).await;
		}
	}
}
