use thiserror::Error;

use crate::{Clock, ErrorCode, ResourceRef};

/// Errors from the synchronization algorithms.
#[derive(Debug, Error)]
pub enum SyncError {
	/// Local and peer clocks disagree beyond what a single rollback heals.
	#[error("clock diverged: local {local}, peer {peer}")]
	Diverged { local: Clock, peer: Clock },

	#[error("unknown resource kind `{0}`")]
	UnknownKind(String),

	#[error("no shadow for {0}")]
	UnknownResource(ResourceRef),

	#[error(transparent)]
	Kind(#[from] KindError),

	#[error(transparent)]
	Store(#[from] StoreError),
}

impl SyncError {
	/// Code reported to the client when this error ends a sync round.
	pub fn code(&self) -> ErrorCode {
		match self {
			Self::Diverged { .. } => ErrorCode::Diverged,
			Self::UnknownKind(_) | Self::UnknownResource(_) => ErrorCode::UnknownResource,
			Self::Kind(_) => ErrorCode::InvalidDelta,
			Self::Store(_) => ErrorCode::Internal,
		}
	}
}

/// Failure of a typed kind operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyError {
	/// A text delta does not cover the text it is applied to.
	#[error("delta spans {expected} chars but the text has {actual}")]
	LengthMismatch { expected: usize, actual: usize },

	/// A patch's recorded prior state no longer matches the master.
	#[error("precondition failed: {0}")]
	Precondition(String),
}

/// Failure at the kind-erased boundary.
#[derive(Debug, Error)]
pub enum KindError {
	#[error("malformed document: {0}")]
	Codec(#[from] serde_json::Error),

	#[error(transparent)]
	Apply(#[from] ApplyError),
}

/// Errors from a [`Store`](crate::Store) implementation.
#[derive(Debug, Error)]
pub enum StoreError {
	/// Compare-and-swap rejected the patch.
	#[error("conflict on {resource}: {reason}")]
	Conflict { resource: ResourceRef, reason: ApplyError },

	#[error("unknown resource kind `{0}`")]
	UnknownKind(String),

	#[error("malformed document for {resource}: {source}")]
	Malformed {
		resource: ResourceRef,
		#[source]
		source: serde_json::Error,
	},

	/// I/O or engine failure of the backing storage.
	#[error("store backend failure: {0}")]
	Backend(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;
