use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use dsync_core::{ClientMsg, ClientSink, MemoryStore, SessionEvent, SessionId};
use dsync_hub::{Envelope, HubError, HubHandle};
use dsync_worker::{Mailbox, MailboxPolicy, MailboxReceiver, TaskClass};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::wire::{Inbound, Outbound, WireEvent};

const OUTPUT_LINES: usize = 256;

#[derive(Debug, thiserror::Error)]
pub(crate) enum DriverError {
	#[error("stdio failure: {0}")]
	Io(#[from] io::Error),
	#[error(transparent)]
	Hub(#[from] HubError),
}

/// Feeds inbound JSON lines to the hub and writes client output back out.
pub(crate) struct Driver {
	hub: HubHandle,
	store: Arc<MemoryStore>,
	client_capacity: usize,
	clients: HashMap<SessionId, ClientSink>,
	lines: mpsc::Sender<String>,
	writer: JoinHandle<io::Result<()>>,
}

impl Driver {
	pub(crate) fn new<W>(hub: HubHandle, store: Arc<MemoryStore>, client_capacity: usize, output: W) -> Self
	where
		W: AsyncWrite + Unpin + Send + 'static,
	{
		let (lines, rx) = mpsc::channel(OUTPUT_LINES);
		let writer = dsync_worker::spawn(TaskClass::ClientOutput, write_lines(output, rx));
		Self {
			hub,
			store,
			client_capacity,
			clients: HashMap::new(),
			lines,
			writer,
		}
	}

	/// Reads until end of input or cancellation.
	pub(crate) async fn serve<R>(&mut self, input: R, shutdown: CancellationToken) -> Result<(), DriverError>
	where
		R: AsyncBufRead + Unpin,
	{
		let mut lines = input.lines();
		loop {
			let line = tokio::select! {
				_ = shutdown.cancelled() => break,
				line = lines.next_line() => line?,
			};
			let Some(line) = line else {
				tracing::debug!("input closed");
				break;
			};
			self.handle_line(&line).await?;
		}
		Ok(())
	}

	async fn handle_line(&mut self, line: &str) -> Result<(), HubError> {
		if line.trim().is_empty() {
			return Ok(());
		}
		let Inbound { session, event } = match serde_json::from_str(line) {
			Ok(inbound) => inbound,
			Err(err) => {
				tracing::warn!(error = %err, "malformed input line skipped");
				return Ok(());
			}
		};

		let event = match event {
			WireEvent::Create { uid } => SessionEvent::Create { uid },
			WireEvent::Subscribe { resource } => SessionEvent::Subscribe { resource },
			WireEvent::Unsubscribe { resource } => SessionEvent::Unsubscribe { resource },
			WireEvent::Sync { resource, tag, edits } => SessionEvent::Sync { resource, tag, edits },
			WireEvent::Attach => SessionEvent::ClientAttached {
				sink: self.attach(&session).await,
			},
			WireEvent::Detach => {
				self.detach(&session).await;
				SessionEvent::ClientDetached
			}
			WireEvent::Destroy => {
				self.detach(&session).await;
				SessionEvent::Destroy
			}
			WireEvent::Put { resource, value } => {
				self.store.put(resource, value);
				return Ok(());
			}
		};
		self.hub.send(Envelope { session, event }).await
	}

	async fn attach(&mut self, session: &SessionId) -> ClientSink {
		self.detach(session).await;
		let (sink, output) = Mailbox::new(self.client_capacity, MailboxPolicy::DropNewest).split();
		dsync_worker::spawn(TaskClass::ClientOutput, forward(session.clone(), output, self.lines.clone()));
		self.clients.insert(session.clone(), sink.clone());
		sink
	}

	async fn detach(&mut self, session: &SessionId) {
		if let Some(previous) = self.clients.remove(session) {
			previous.close().await;
		}
	}

	/// Closes every client output and waits for the last line to be written.
	pub(crate) async fn finish(mut self) -> io::Result<()> {
		for (_, sink) in self.clients.drain() {
			sink.close().await;
		}
		drop(self.lines);
		self.writer.await.map_err(io::Error::other)?
	}
}

async fn forward(session: SessionId, output: MailboxReceiver<ClientMsg>, lines: mpsc::Sender<String>) {
	while let Some(message) = output.recv().await {
		let line = match serde_json::to_string(&Outbound {
			session: &session,
			message: &message,
		}) {
			Ok(line) => line,
			Err(err) => {
				tracing::error!(%session, error = %err, "client message not serializable");
				continue;
			}
		};
		if lines.send(line).await.is_err() {
			break;
		}
	}
	tracing::trace!(%session, "client output closed");
}

async fn write_lines<W>(mut output: W, mut rx: mpsc::Receiver<String>) -> io::Result<()>
where
	W: AsyncWrite + Unpin,
{
	while let Some(line) = rx.recv().await {
		output.write_all(line.as_bytes()).await?;
		output.write_all(b"\n").await?;
		output.flush().await?;
	}
	output.shutdown().await
}
