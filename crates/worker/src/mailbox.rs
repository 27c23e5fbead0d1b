use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

/// Overflow policy for a bounded mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxPolicy {
	/// `send` waits for capacity; nothing is ever dropped.
	Backpressure,
	/// The incoming message is dropped when the queue is full.
	///
	/// Used for outputs towards peers that may be slow or gone, where the
	/// producer must never stall.
	DropNewest,
}

/// Outcome from enqueueing a mailbox message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxSendOutcome {
	/// Message was enqueued.
	Enqueued,
	/// Message was dropped because the policy is drop-newest and the queue was full.
	DroppedNewest,
}

/// Mailbox send error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxSendError {
	/// Mailbox is closed.
	Closed,
	/// Queue is full and non-blocking send was used.
	Full,
}

impl std::fmt::Display for MailboxSendError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Closed => f.write_str("mailbox closed"),
			Self::Full => f.write_str("mailbox full"),
		}
	}
}

impl std::error::Error for MailboxSendError {}

struct MailboxState<T> {
	queue: VecDeque<T>,
	closed: bool,
}

struct MailboxInner<T> {
	capacity: usize,
	policy: MailboxPolicy,
	state: Mutex<MailboxState<T>>,
	notify_recv: Notify,
	notify_send: Notify,
}

impl<T> MailboxInner<T> {
	async fn close(&self) {
		self.state.lock().await.closed = true;
		self.notify_recv.notify_waiters();
		self.notify_send.notify_waiters();
	}
}

/// Multi-producer mailbox sender.
pub struct MailboxSender<T> {
	inner: Arc<MailboxInner<T>>,
}

/// Single-consumer mailbox receiver.
pub struct MailboxReceiver<T> {
	inner: Arc<MailboxInner<T>>,
}

/// Bounded FIFO mailbox.
///
/// Session workers read their events from one of these, and client outputs
/// are one of these with [`MailboxPolicy::DropNewest`]. Closing is a state
/// flag rather than a sender count: a closed mailbox rejects new messages but
/// still hands out everything queued before the close.
pub struct Mailbox<T> {
	inner: Arc<MailboxInner<T>>,
}

impl<T> Clone for MailboxSender<T> {
	fn clone(&self) -> Self {
		Self {
			inner: Arc::clone(&self.inner),
		}
	}
}

impl<T> std::fmt::Debug for MailboxSender<T> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("MailboxSender")
			.field("capacity", &self.inner.capacity)
			.field("policy", &self.inner.policy)
			.finish_non_exhaustive()
	}
}

impl<T> Mailbox<T> {
	/// Creates a bounded mailbox. A zero capacity is bumped to one.
	pub fn new(capacity: usize, policy: MailboxPolicy) -> Self {
		let capacity = capacity.max(1);
		Self {
			inner: Arc::new(MailboxInner {
				capacity,
				policy,
				state: Mutex::new(MailboxState {
					queue: VecDeque::with_capacity(capacity),
					closed: false,
				}),
				notify_recv: Notify::new(),
				notify_send: Notify::new(),
			}),
		}
	}

	/// Returns a sender handle.
	pub fn sender(&self) -> MailboxSender<T> {
		MailboxSender {
			inner: Arc::clone(&self.inner),
		}
	}

	/// Returns a receiver handle.
	pub fn receiver(&self) -> MailboxReceiver<T> {
		MailboxReceiver {
			inner: Arc::clone(&self.inner),
		}
	}

	/// Splits into a sender and receiver pair.
	pub fn split(self) -> (MailboxSender<T>, MailboxReceiver<T>) {
		(self.sender(), MailboxReceiver { inner: self.inner })
	}
}

impl<T> MailboxSender<T> {
	/// Requests mailbox closure. The receiver drains existing items then returns `None`.
	pub async fn close(&self) {
		self.inner.close().await;
	}

	/// Non-blocking enqueue.
	pub async fn try_send(&self, msg: T) -> Result<MailboxSendOutcome, MailboxSendError> {
		let mut state = self.inner.state.lock().await;
		enqueue_with_policy(&self.inner, &mut state, msg).map_err(|(err, _)| err)
	}

	/// Enqueue honoring policy (`Backpressure` waits for capacity).
	pub async fn send(&self, msg: T) -> Result<MailboxSendOutcome, MailboxSendError> {
		self.send_returning(msg).await.map_err(|(err, _)| err)
	}

	/// Like [`send`](Self::send), but a rejected message is handed back to
	/// the caller instead of being dropped.
	pub async fn send_returning(&self, msg: T) -> Result<MailboxSendOutcome, (MailboxSendError, T)> {
		if self.inner.policy == MailboxPolicy::Backpressure {
			loop {
				// Register before checking capacity so a pop between the
				// check and the await is not missed.
				let notified = self.inner.notify_send.notified();

				let mut state = self.inner.state.lock().await;
				if state.closed {
					return Err((MailboxSendError::Closed, msg));
				}
				if state.queue.len() < self.inner.capacity {
					state.queue.push_back(msg);
					self.inner.notify_recv.notify_one();
					return Ok(MailboxSendOutcome::Enqueued);
				}
				drop(state);
				notified.await;
			}
		}

		let mut state = self.inner.state.lock().await;
		enqueue_with_policy(&self.inner, &mut state, msg)
	}

	/// Returns true once the mailbox has been closed from either side.
	pub async fn is_closed(&self) -> bool {
		self.inner.state.lock().await.closed
	}

	/// Returns current queue length.
	pub async fn len(&self) -> usize {
		self.inner.state.lock().await.queue.len()
	}

	/// Returns queue capacity.
	pub fn capacity(&self) -> usize {
		self.inner.capacity
	}
}

impl<T> MailboxReceiver<T> {
	/// Receives one message. Returns `None` once the mailbox is closed and drained.
	pub async fn recv(&self) -> Option<T> {
		loop {
			let notified = self.inner.notify_recv.notified();
			let mut state = self.inner.state.lock().await;
			if let Some(msg) = state.queue.pop_front() {
				drop(state);
				self.inner.notify_send.notify_one();
				return Some(msg);
			}
			if state.closed {
				return None;
			}
			drop(state);
			notified.await;
		}
	}

	/// Pops one message without waiting.
	pub async fn try_recv(&self) -> Option<T> {
		let msg = self.inner.state.lock().await.queue.pop_front();
		if msg.is_some() {
			self.inner.notify_send.notify_one();
		}
		msg
	}

	/// Closes the mailbox from the consuming side.
	///
	/// Senders observe [`MailboxSendError::Closed`] from this point on while
	/// [`recv`](Self::recv) keeps returning what was queued before.
	pub async fn close(&self) {
		self.inner.close().await;
	}

	/// Returns current queue length.
	pub async fn len(&self) -> usize {
		self.inner.state.lock().await.queue.len()
	}
}

fn enqueue_with_policy<T>(inner: &MailboxInner<T>, state: &mut MailboxState<T>, msg: T) -> Result<MailboxSendOutcome, (MailboxSendError, T)> {
	if state.closed {
		return Err((MailboxSendError::Closed, msg));
	}
	if state.queue.len() < inner.capacity {
		state.queue.push_back(msg);
		inner.notify_recv.notify_one();
		return Ok(MailboxSendOutcome::Enqueued);
	}
	match inner.policy {
		MailboxPolicy::Backpressure => Err((MailboxSendError::Full, msg)),
		MailboxPolicy::DropNewest => Ok(MailboxSendOutcome::DroppedNewest),
	}
}
