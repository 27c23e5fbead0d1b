use dsync_worker::MailboxSender;
use tokio::time::Instant;

use crate::{ClientMsg, Edit, ResourceRef, Tag};

/// Output mailbox of a connected client.
pub type ClientSink = MailboxSender<ClientMsg>;

/// Everything a session reacts to.
#[derive(Debug)]
pub enum SessionEvent {
	/// Brings the session into existence for user `uid`.
	Create { uid: String },
	Subscribe { resource: ResourceRef },
	Unsubscribe { resource: ResourceRef },
	/// Client edits for one resource, or the ack of a server round when
	/// `tag` matches the outstanding one.
	Sync {
		resource: ResourceRef,
		tag: Option<Tag>,
		edits: Vec<Edit>,
	},
	/// The master of `resource` changed at `at`.
	Taint { resource: ResourceRef, at: Instant },
	ClientAttached { sink: ClientSink },
	ClientDetached,
	/// Timer tick; resends stale tags.
	Flush,
	/// Deletes the session and its subscriptions.
	Destroy,
}

impl SessionEvent {
	/// Short name for logs.
	pub fn name(&self) -> &'static str {
		match self {
			Self::Create { .. } => "create",
			Self::Subscribe { .. } => "subscribe",
			Self::Unsubscribe { .. } => "unsubscribe",
			Self::Sync { .. } => "sync",
			Self::Taint { .. } => "taint",
			Self::ClientAttached { .. } => "client_attached",
			Self::ClientDetached => "client_detached",
			Self::Flush => "flush",
			Self::Destroy => "destroy",
		}
	}
}
