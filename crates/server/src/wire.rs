//! Line protocol spoken on stdio.
//!
//! Input, one JSON object per line:
//!
//! ```json
//! {"session":"s1","event":{"type":"create","uid":"alice"}}
//! {"session":"s1","event":{"type":"attach"}}
//! {"session":"s1","event":{"type":"subscribe","resource":{"kind":"note","id":"n1"}}}
//! {"session":"s1","event":{"type":"sync","resource":{"kind":"note","id":"n1"},"tag":"t","edits":[]}}
//! ```
//!
//! Output lines are `{"session":..,"message":..}` with a [`ClientMsg`] body.

use dsync_core::{ClientMsg, Document, Edit, ResourceRef, SessionId, Tag};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub(crate) struct Inbound {
	pub session: SessionId,
	pub event: WireEvent,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum WireEvent {
	Create {
		uid: String,
	},
	Subscribe {
		resource: ResourceRef,
	},
	Unsubscribe {
		resource: ResourceRef,
	},
	Sync {
		resource: ResourceRef,
		#[serde(default)]
		tag: Option<Tag>,
		#[serde(default)]
		edits: Vec<Edit>,
	},
	/// Opens an output stream for the session on stdout.
	Attach,
	Detach,
	Destroy,
	/// Overwrites a master value outside any session.
	Put {
		resource: ResourceRef,
		value: Document,
	},
}

#[derive(Debug, Serialize)]
pub(crate) struct Outbound<'a> {
	pub session: &'a SessionId,
	pub message: &'a ClientMsg,
}
