use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::{Delta, Note, Patch, ResourceValue};
use crate::{ApplyError, ResourceRef};

/// A named collection of note ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folio {
	pub name: String,
	pub notes: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolioDelta {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub added: Vec<String>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub removed: Vec<String>,
}

impl Delta for FolioDelta {
	fn is_empty(&self) -> bool {
		self.name.is_none() && self.added.is_empty() && self.removed.is_empty()
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FolioPatch {
	Rename { old: String, new: String },
	/// Expects the note to be absent.
	AddNote { note: String },
	/// Expects the note to be present.
	RemoveNote { note: String },
}

impl Patch<Folio> for FolioPatch {
	fn apply_to(&self, master: &Folio) -> Result<Folio, ApplyError> {
		let mut next = master.clone();
		match self {
			Self::Rename { old, new } => {
				if master.name != *old {
					return Err(ApplyError::Precondition(format!("folio is named {:?}, expected {:?}", master.name, old)));
				}
				next.name = new.clone();
			}
			Self::AddNote { note } => {
				if !next.notes.insert(note.clone()) {
					return Err(ApplyError::Precondition(format!("note {note} already in folio")));
				}
			}
			Self::RemoveNote { note } => {
				if !next.notes.remove(note) {
					return Err(ApplyError::Precondition(format!("note {note} not in folio")));
				}
			}
		}
		Ok(next)
	}

	/// Membership changes are visible to whoever watches the note itself.
	fn affects(&self) -> Vec<ResourceRef> {
		match self {
			Self::Rename { .. } => Vec::new(),
			Self::AddNote { note } | Self::RemoveNote { note } => vec![ResourceRef::new(Note::KIND, note.clone())],
		}
	}
}

impl ResourceValue for Folio {
	const KIND: &'static str = "folio";

	type Delta = FolioDelta;
	type Patch = FolioPatch;

	fn delta(&self, newer: &Self) -> FolioDelta {
		FolioDelta {
			name: (self.name != newer.name).then(|| newer.name.clone()),
			added: newer.notes.difference(&self.notes).cloned().collect(),
			removed: self.notes.difference(&newer.notes).cloned().collect(),
		}
	}

	/// Set semantics: adding a present note or removing an absent one is a
	/// no-op and yields no patch.
	fn apply(&self, delta: &FolioDelta) -> Result<(Self, Vec<FolioPatch>), ApplyError> {
		let mut next = self.clone();
		let mut patches = Vec::new();

		if let Some(name) = &delta.name
			&& *name != self.name
		{
			patches.push(FolioPatch::Rename {
				old: self.name.clone(),
				new: name.clone(),
			});
			next.name = name.clone();
		}
		for note in &delta.removed {
			if next.notes.remove(note) {
				patches.push(FolioPatch::RemoveNote { note: note.clone() });
			}
		}
		for note in &delta.added {
			if next.notes.insert(note.clone()) {
				patches.push(FolioPatch::AddNote { note: note.clone() });
			}
		}

		Ok((next, patches))
	}
}
