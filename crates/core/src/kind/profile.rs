use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{Delta, Patch, ResourceValue};
use crate::ApplyError;

/// Free-form user profile fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
	#[serde(default)]
	pub fields: BTreeMap<String, String>,
}

/// Per-key change: `Some` sets, `None` removes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProfileDelta(pub BTreeMap<String, Option<String>>);

impl Delta for ProfileDelta {
	fn is_empty(&self) -> bool {
		self.0.is_empty()
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfilePatch {
	pub key: String,
	pub old: Option<String>,
	pub new: Option<String>,
}

impl Patch<Profile> for ProfilePatch {
	fn apply_to(&self, master: &Profile) -> Result<Profile, ApplyError> {
		let current = master.fields.get(&self.key);
		if current != self.old.as_ref() {
			return Err(ApplyError::Precondition(format!("field {} is {:?}, expected {:?}", self.key, current, self.old)));
		}
		let mut next = master.clone();
		match &self.new {
			Some(value) => next.fields.insert(self.key.clone(), value.clone()),
			None => next.fields.remove(&self.key),
		};
		Ok(next)
	}
}

impl ResourceValue for Profile {
	const KIND: &'static str = "profile";

	type Delta = ProfileDelta;
	type Patch = ProfilePatch;

	fn delta(&self, newer: &Self) -> ProfileDelta {
		let mut changes = BTreeMap::new();
		for (key, value) in &newer.fields {
			if self.fields.get(key) != Some(value) {
				changes.insert(key.clone(), Some(value.clone()));
			}
		}
		for key in self.fields.keys() {
			if !newer.fields.contains_key(key) {
				changes.insert(key.clone(), None);
			}
		}
		ProfileDelta(changes)
	}

	fn apply(&self, delta: &ProfileDelta) -> Result<(Self, Vec<ProfilePatch>), ApplyError> {
		let mut next = self.clone();
		let mut patches = Vec::new();
		for (key, new) in &delta.0 {
			let old = self.fields.get(key).cloned();
			if old == *new {
				continue;
			}
			match new {
				Some(value) => next.fields.insert(key.clone(), value.clone()),
				None => next.fields.remove(key),
			};
			patches.push(ProfilePatch {
				key: key.clone(),
				old,
				new: new.clone(),
			});
		}
		Ok((next, patches))
	}
}
