use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Clock;

/// Kind-erased resource value, delta or patch.
///
/// Typed kinds serialize through this at the registry boundary so shadows,
/// sessions and stores stay kind-agnostic.
pub type Document = serde_json::Value;

/// Identifier of one logical client session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
	/// Returns the raw id.
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for SessionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<&str> for SessionId {
	fn from(id: &str) -> Self {
		Self(id.to_owned())
	}
}

impl From<String> for SessionId {
	fn from(id: String) -> Self {
		Self(id)
	}
}

/// Unique key of a synchronizable resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceRef {
	/// Registered kind name, e.g. `note`.
	pub kind: String,
	/// Identifier within the kind.
	pub id: String,
}

impl ResourceRef {
	/// Builds a reference from its parts.
	pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
		Self {
			kind: kind.into(),
			id: id.into(),
		}
	}
}

impl fmt::Display for ResourceRef {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}/{}", self.kind, self.id)
	}
}

/// Opaque correlation id of one server-initiated sync round.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(pub String);

impl Tag {
	/// Mints a fresh random tag.
	pub fn mint() -> Self {
		Self(uuid::Uuid::new_v4().to_string())
	}
}

impl fmt::Display for Tag {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// A delta stamped with the clock of the shadow that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edit {
	pub clock: Clock,
	pub delta: Document,
}

/// Error codes reported to clients in fatal responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
	/// No shadow exists for the resource (never subscribed, or removed).
	UnknownResource,
	/// Client and server disagree about history; the shadow was reset.
	Diverged,
	/// A delta could not be decoded or applied.
	InvalidDelta,
	/// Anything else.
	Internal,
}

/// Message pushed to a client's output mailbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
	/// Pending server edits for one resource.
	///
	/// Server-initiated rounds carry a tag the client must echo back;
	/// responses to client syncs echo the client's tag.
	Sync {
		resource: ResourceRef,
		tag: Tag,
		clock: Clock,
		edits: Vec<Edit>,
	},
	/// The request for `resource` failed and will not be retried.
	Fatal {
		resource: ResourceRef,
		tag: Option<Tag>,
		code: ErrorCode,
	},
}

impl ClientMsg {
	/// Resource this message concerns.
	pub fn resource(&self) -> &ResourceRef {
		match self {
			Self::Sync { resource, .. } | Self::Fatal { resource, .. } => resource,
		}
	}
}
