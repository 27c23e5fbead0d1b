use serde::{Deserialize, Serialize};

use crate::kind::DynKind;
use crate::{Clock, CvStatus, Document, Edit, ResourceRef, Result};

/// One session's working copy of one resource.
///
/// `value` is what the session's peer is believed to hold once every
/// `pending` edit lands. `backup` is the value matching `clock.bv`, restored
/// when the peer turns out to have missed the last server round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shadow {
	pub resource: ResourceRef,
	pub value: Document,
	pub backup: Document,
	pub pending: Vec<Edit>,
	pub clock: Clock,
}

impl Shadow {
	/// A shadow seeded with the kind's empty value, so the first
	/// [`update_pending`](Self::update_pending) ships the whole master.
	pub fn new(resource: ResourceRef, kind: &dyn DynKind) -> Self {
		let empty = kind.empty();
		Self {
			resource,
			value: empty.clone(),
			backup: empty,
			pending: Vec::new(),
			clock: Clock::default(),
		}
	}

	/// Queues the changes between the shadow and `master` as a pending edit.
	///
	/// Returns `false` when the shadow already equals the master.
	pub fn update_pending(&mut self, kind: &dyn DynKind, master: Document) -> Result<bool> {
		let Some(delta) = kind.delta(&self.value, &master)? else {
			return Ok(false);
		};

		self.backup = std::mem::replace(&mut self.value, master);
		self.clock.checkpoint();
		self.pending.push(Edit { clock: self.clock, delta });
		self.clock.sv += 1;
		Ok(true)
	}

	/// Applies one edit received from the peer.
	///
	/// Returns the serialized patches the edit implies; the caller forwards
	/// them to the store. Duplicates and empty deltas yield no patches and
	/// leave the clock alone.
	pub fn sync_incoming(&mut self, kind: &dyn DynKind, edit: &Edit) -> Result<Vec<Document>> {
		let (value, backup, pending) = (&mut self.value, &self.backup, &mut self.pending);
		let rolled_back = self.clock.sync_sv_with(&edit.clock, || {
			*value = backup.clone();
			pending.clear();
		})?;
		if rolled_back {
			tracing::debug!(resource = %self.resource, clock = %self.clock, "shadow.rollback");
		}

		self.pending.retain(|queued| !edit.clock.ack(&queued.clock));

		if self.clock.check_cv(&edit.clock)? == CvStatus::Duplicate {
			tracing::trace!(resource = %self.resource, local = %self.clock, peer = %edit.clock, "shadow.duplicate_edit");
			return Ok(Vec::new());
		}
		if kind.is_empty_delta(&edit.delta)? {
			return Ok(Vec::new());
		}

		let (next, patches) = kind.apply(&self.value, &edit.delta)?;
		self.backup = std::mem::replace(&mut self.value, next);
		self.clock.cv += 1;
		Ok(patches)
	}

	/// Drops pending edits the peer has confirmed, without applying anything.
	///
	/// Only a peer clock that agrees on `sv` is trusted; anything else is left
	/// for the next [`sync_incoming`](Self::sync_incoming) to reconcile.
	pub fn acknowledge(&mut self, peer: &Clock) -> usize {
		if peer.sv != self.clock.sv {
			return 0;
		}
		let before = self.pending.len();
		self.pending.retain(|queued| !peer.ack(&queued.clock));
		before - self.pending.len()
	}
}
