use serde::{Deserialize, Serialize};

use super::text::{TextDelta, fingerprint};
use super::{Delta, Patch, ResourceValue};
use crate::ApplyError;

/// A titled text note.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
	pub title: String,
	pub body: String,
}

impl Note {
	pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
		Self {
			title: title.into(),
			body: body.into(),
		}
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteDelta {
	/// Replacement title, if it changed.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub title: Option<String>,
	#[serde(default)]
	pub body: TextDelta,
}

impl Delta for NoteDelta {
	fn is_empty(&self) -> bool {
		self.title.is_none() && self.body.is_identity()
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum NotePatch {
	Title { old: String, new: String },
	/// Body edit guarded by a fingerprint of the text it was computed against.
	Body { base_len: u64, base_hash: u64, delta: TextDelta },
}

impl Patch<Note> for NotePatch {
	fn apply_to(&self, master: &Note) -> Result<Note, ApplyError> {
		match self {
			Self::Title { old, new } => {
				if master.title != *old {
					return Err(ApplyError::Precondition(format!("title is {:?}, expected {:?}", master.title, old)));
				}
				Ok(Note {
					title: new.clone(),
					body: master.body.clone(),
				})
			}
			Self::Body { base_len, base_hash, delta } => {
				if fingerprint(&master.body) != (*base_len, *base_hash) {
					return Err(ApplyError::Precondition("body changed since the delta was computed".into()));
				}
				Ok(Note {
					title: master.title.clone(),
					body: delta.apply(&master.body)?,
				})
			}
		}
	}
}

impl ResourceValue for Note {
	const KIND: &'static str = "note";

	type Delta = NoteDelta;
	type Patch = NotePatch;

	fn delta(&self, newer: &Self) -> NoteDelta {
		NoteDelta {
			title: (self.title != newer.title).then(|| newer.title.clone()),
			body: TextDelta::diff(&self.body, &newer.body),
		}
	}

	fn apply(&self, delta: &NoteDelta) -> Result<(Self, Vec<NotePatch>), ApplyError> {
		let mut next = self.clone();
		let mut patches = Vec::new();

		if let Some(title) = &delta.title
			&& *title != self.title
		{
			patches.push(NotePatch::Title {
				old: self.title.clone(),
				new: title.clone(),
			});
			next.title = title.clone();
		}

		if !delta.body.is_identity() {
			next.body = delta.body.apply(&self.body)?;
			let (base_len, base_hash) = fingerprint(&self.body);
			patches.push(NotePatch::Body {
				base_len,
				base_hash,
				delta: delta.body.clone(),
			});
		} else if delta.body.base_len() != self.body.chars().count() && !delta.body.ops().is_empty() {
			return Err(ApplyError::LengthMismatch {
				expected: delta.body.base_len(),
				actual: self.body.chars().count(),
			});
		}

		Ok((next, patches))
	}
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;
	use proptest::prelude::*;

	use super::*;

	#[test]
	fn delta_of_equal_notes_is_empty() {
		let note = Note::new("t", "body");
		assert!(note.delta(&note).is_empty());
		let (same, patches) = note.apply(&note.delta(&note)).unwrap();
		assert_eq!(same, note);
		assert!(patches.is_empty());
	}

	#[test]
	fn patches_replay_on_matching_master() {
		let base = Note::new("draft", "v0");
		let target = Note::new("final", "v1");
		let (applied, patches) = base.apply(&base.delta(&target)).unwrap();
		assert_eq!(applied, target);

		let master = patches.iter().try_fold(base, |m, p| p.apply_to(&m)).unwrap();
		assert_eq!(master, target);
	}

	#[test]
	fn body_patch_refuses_moved_master() {
		let base = Note::new("", "v0");
		let (_, patches) = base.apply(&base.delta(&Note::new("", "v1"))).unwrap();
		let moved = Note::new("", "v2");
		assert!(matches!(patches[0].apply_to(&moved), Err(ApplyError::Precondition(_))));
	}

	#[test]
	fn title_patch_refuses_moved_master() {
		let patch = NotePatch::Title {
			old: "a".into(),
			new: "b".into(),
		};
		assert!(patch.apply_to(&Note::new("c", "")).is_err());
		assert_eq!(patch.apply_to(&Note::new("a", "x")).unwrap(), Note::new("b", "x"));
	}

	#[test]
	fn identity_delta_for_other_length_is_rejected() {
		let delta = Note::new("", "abc").delta(&Note::new("", "abc"));
		assert!(Note::new("", "abcd").apply(&delta).is_err());
	}

	proptest! {
		#[test]
		fn apply_of_delta_reaches_newer(t0 in "\\PC{0,8}", b0 in "\\PC{0,30}", t1 in "\\PC{0,8}", b1 in "\\PC{0,30}") {
			let base = Note::new(t0, b0);
			let newer = Note::new(t1, b1);
			let (applied, patches) = base.apply(&base.delta(&newer)).unwrap();
			prop_assert_eq!(&applied, &newer);
			let master = patches.iter().try_fold(base.clone(), |m, p| p.apply_to(&m)).unwrap();
			prop_assert_eq!(master, newer);
		}
	}
}
