use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Result, SyncError};

/// Version vector of one shadow.
///
/// * `cv`: edits accepted from the peer.
/// * `sv`: edits sent towards the peer.
/// * `bv`: `sv` at the last checkpoint, always `<= sv`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Clock {
	pub cv: i64,
	pub sv: i64,
	pub bv: i64,
}

/// Result of comparing an incoming edit's `cv` with the local one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CvStatus {
	/// Next expected edit; apply it.
	Fresh,
	/// Already applied; absorb silently.
	Duplicate,
}

impl Clock {
	pub const fn new(cv: i64, sv: i64, bv: i64) -> Self {
		Self { cv, sv, bv }
	}

	/// Whether a pending edit stamped with `pending` has been seen by the
	/// peer whose clock is `self`.
	pub fn ack(&self, pending: &Clock) -> bool {
		self.sv >= pending.sv
	}

	/// Classifies an incoming edit by its client version.
	pub fn check_cv(&self, incoming: &Clock) -> Result<CvStatus> {
		match self.cv.cmp(&incoming.cv) {
			std::cmp::Ordering::Equal => Ok(CvStatus::Fresh),
			std::cmp::Ordering::Greater => Ok(CvStatus::Duplicate),
			std::cmp::Ordering::Less => Err(SyncError::Diverged {
				local: *self,
				peer: *incoming,
			}),
		}
	}

	/// Reconciles the server version with the peer's view of it.
	///
	/// A peer that reports the checkpointed `bv` missed the last server round:
	/// `sv` drops back to `bv` and `rollback` restores the matching shadow
	/// state. Returns whether the rollback ran.
	pub fn sync_sv_with(&mut self, peer: &Clock, rollback: impl FnOnce()) -> Result<bool> {
		if self.sv == peer.sv {
			return Ok(false);
		}
		if self.bv != peer.sv {
			return Err(SyncError::Diverged {
				local: *self,
				peer: *peer,
			});
		}
		self.sv = self.bv;
		rollback();
		Ok(true)
	}

	/// Records the current `sv` as the rollback point.
	pub fn checkpoint(&mut self) {
		self.bv = self.sv;
	}
}

impl fmt::Display for Clock {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "(cv={}, sv={}, bv={})", self.cv, self.sv, self.bv)
	}
}
