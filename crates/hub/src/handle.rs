use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dsync_core::{ResourceRef, SessionEvent, SessionId, TaintSink};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// One event addressed to one session.
#[derive(Debug)]
pub struct Envelope {
	pub session: SessionId,
	pub event: SessionEvent,
}

impl Envelope {
	pub fn new(session: impl Into<SessionId>, event: SessionEvent) -> Self {
		Self {
			session: session.into(),
			event,
		}
	}
}

#[derive(Debug)]
pub(crate) enum HubCmd {
	Route(Envelope),
	Shutdown { reply: oneshot::Sender<()> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
	#[error("session hub is closed")]
	Closed,
}

/// Receiving end of the hub's command channel, consumed by
/// [`SessionHub::start`](crate::SessionHub::start).
pub struct HubInbox {
	pub(crate) rx: mpsc::Receiver<HubCmd>,
}

/// Cloneable front door of a running [`SessionHub`](crate::SessionHub).
#[derive(Clone)]
pub struct HubHandle {
	tx: mpsc::Sender<HubCmd>,
	dropped_taints: Arc<AtomicU64>,
}

impl std::fmt::Debug for HubHandle {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("HubHandle").field("closed", &self.tx.is_closed()).finish_non_exhaustive()
	}
}

impl HubHandle {
	/// Creates the command channel. The inbox goes to the hub, handles to
	/// producers and to the store as its [`TaintSink`].
	pub fn channel(capacity: usize) -> (Self, HubInbox) {
		let (tx, rx) = mpsc::channel(capacity.max(1));
		let handle = Self {
			tx,
			dropped_taints: Arc::new(AtomicU64::new(0)),
		};
		(handle, HubInbox { rx })
	}

	/// Queues `envelope`, waiting while the hub's inbox is full.
	pub async fn send(&self, envelope: Envelope) -> Result<(), HubError> {
		self.tx.send(HubCmd::Route(envelope)).await.map_err(|_| HubError::Closed)
	}

	pub async fn dispatch(&self, session: impl Into<SessionId>, event: SessionEvent) -> Result<(), HubError> {
		self.send(Envelope::new(session, event)).await
	}

	/// Stops accepting events, drains every session worker and waits for all
	/// of them to exit.
	pub async fn shutdown(&self) -> Result<(), HubError> {
		let (reply, rx) = oneshot::channel();
		self.tx.send(HubCmd::Shutdown { reply }).await.map_err(|_| HubError::Closed)?;
		rx.await.map_err(|_| HubError::Closed)
	}

	pub fn is_closed(&self) -> bool {
		self.tx.is_closed()
	}
}

impl TaintSink for HubHandle {
	fn taint(&self, session: &SessionId, resource: &ResourceRef, at: Instant) {
		let cmd = HubCmd::Route(Envelope {
			session: session.clone(),
			event: SessionEvent::Taint {
				resource: resource.clone(),
				at,
			},
		});
		match self.tx.try_send(cmd) {
			Ok(()) => {}
			Err(TrySendError::Full(_)) => {
				let dropped = self.dropped_taints.fetch_add(1, Ordering::Relaxed) + 1;
				if dropped == 1 || dropped.is_multiple_of(1024) {
					tracing::warn!(%session, %resource, dropped, "hub inbox full, taint dropped");
				}
			}
			Err(TrySendError::Closed(_)) => {
				tracing::trace!(%session, %resource, "hub closed, taint dropped");
			}
		}
	}
}
