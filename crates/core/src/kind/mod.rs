//! Resource kinds and the registry that dispatches to them by name.
//!
//! A kind is a typed [`ResourceValue`] with its own [`Delta`] and [`Patch`]
//! types. [`KindRegistry::register`] wraps it behind [`DynKind`], which speaks
//! [`Document`]s, so the shadow and session layers never name a concrete kind.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::{ApplyError, Document, KindError, ResourceRef, SyncError};

mod folio;
mod note;
mod profile;
pub mod text;

pub use folio::{Folio, FolioDelta, FolioPatch};
pub use note::{Note, NoteDelta, NotePatch};
pub use profile::{Profile, ProfileDelta, ProfilePatch};

/// Description of every change between two values of one kind.
pub trait Delta: Serialize + DeserializeOwned + Send {
	/// True when applying the delta changes nothing.
	fn is_empty(&self) -> bool;
}

/// Store-level mutation produced by applying a delta.
///
/// Carries enough of the prior state for [`apply_to`](Patch::apply_to) to
/// refuse a master that moved underneath it.
pub trait Patch<V>: Serialize + DeserializeOwned + Send {
	/// Compare-and-swap: checks the recorded prior state against `master`
	/// and returns the patched value.
	fn apply_to(&self, master: &V) -> Result<V, ApplyError>;

	/// Other resources whose subscribers must hear about this patch.
	fn affects(&self) -> Vec<ResourceRef> {
		Vec::new()
	}
}

/// A synchronizable value type.
///
/// `Default` is the empty value new shadows are seeded with.
pub trait ResourceValue: Clone + Default + PartialEq + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
	/// Registry name of the kind.
	const KIND: &'static str;

	type Delta: Delta;
	type Patch: Patch<Self>;

	/// Every change needed to turn `self` into `newer`. Total; empty for equal values.
	fn delta(&self, newer: &Self) -> Self::Delta;

	/// Applies `delta`, returning the new value and the patches that persist it.
	fn apply(&self, delta: &Self::Delta) -> Result<(Self, Vec<Self::Patch>), ApplyError>;
}

/// Kind-erased operation set.
pub trait DynKind: Send + Sync {
	fn name(&self) -> &'static str;

	/// Serialized empty value.
	fn empty(&self) -> Document;

	/// Delta from `old` to `newer`, or `None` when they are equal.
	fn delta(&self, old: &Document, newer: &Document) -> Result<Option<Document>, KindError>;

	fn is_empty_delta(&self, delta: &Document) -> Result<bool, KindError>;

	/// Applies a delta, returning the new value and serialized patches.
	fn apply(&self, value: &Document, delta: &Document) -> Result<(Document, Vec<Document>), KindError>;

	/// Compare-and-swap application of a serialized patch to a master value.
	fn apply_patch(&self, master: &Document, patch: &Document) -> Result<Document, KindError>;

	fn patch_affects(&self, patch: &Document) -> Result<Vec<ResourceRef>, KindError>;
}

struct Erased<V>(PhantomData<fn() -> V>);

fn decode<T: DeserializeOwned>(doc: &Document) -> Result<T, KindError> {
	Ok(T::deserialize(doc)?)
}

fn encode<T: Serialize>(value: &T) -> Result<Document, KindError> {
	Ok(serde_json::to_value(value)?)
}

impl<V: ResourceValue> DynKind for Erased<V> {
	fn name(&self) -> &'static str {
		V::KIND
	}

	fn empty(&self) -> Document {
		serde_json::to_value(V::default()).unwrap_or(Document::Null)
	}

	fn delta(&self, old: &Document, newer: &Document) -> Result<Option<Document>, KindError> {
		let old: V = decode(old)?;
		let newer: V = decode(newer)?;
		let delta = old.delta(&newer);
		if delta.is_empty() {
			return Ok(None);
		}
		encode(&delta).map(Some)
	}

	fn is_empty_delta(&self, delta: &Document) -> Result<bool, KindError> {
		Ok(decode::<V::Delta>(delta)?.is_empty())
	}

	fn apply(&self, value: &Document, delta: &Document) -> Result<(Document, Vec<Document>), KindError> {
		let value: V = decode(value)?;
		let delta: V::Delta = decode(delta)?;
		let (next, patches) = value.apply(&delta)?;
		let patches = patches.iter().map(encode).collect::<Result<Vec<_>, _>>()?;
		Ok((encode(&next)?, patches))
	}

	fn apply_patch(&self, master: &Document, patch: &Document) -> Result<Document, KindError> {
		let master: V = decode(master)?;
		let patch: V::Patch = decode(patch)?;
		encode(&patch.apply_to(&master)?)
	}

	fn patch_affects(&self, patch: &Document) -> Result<Vec<ResourceRef>, KindError> {
		Ok(decode::<V::Patch>(patch)?.affects())
	}
}

/// Kind name to operation set.
#[derive(Clone, Default)]
pub struct KindRegistry {
	kinds: HashMap<&'static str, Arc<dyn DynKind>>,
}

impl KindRegistry {
	/// An empty registry.
	pub fn new() -> Self {
		Self::default()
	}

	/// Registry with the built-in `note`, `folio` and `profile` kinds.
	pub fn standard() -> Self {
		Self::new().with::<Note>().with::<Folio>().with::<Profile>()
	}

	/// Registers `V` under [`ResourceValue::KIND`], replacing any previous entry.
	pub fn register<V: ResourceValue>(&mut self) -> &mut Self {
		if self.kinds.insert(V::KIND, Arc::new(Erased::<V>(PhantomData))).is_some() {
			tracing::warn!(kind = V::KIND, "resource kind registered twice, keeping the latest");
		}
		self
	}

	/// Builder form of [`register`](Self::register).
	pub fn with<V: ResourceValue>(mut self) -> Self {
		self.register::<V>();
		self
	}

	pub fn get(&self, kind: &str) -> Option<&dyn DynKind> {
		self.kinds.get(kind).map(|k| k.as_ref())
	}

	/// Like [`get`](Self::get) but reports a missing kind as an error.
	pub fn resolve(&self, kind: &str) -> Result<&dyn DynKind, SyncError> {
		self.get(kind).ok_or_else(|| SyncError::UnknownKind(kind.to_owned()))
	}

	pub fn contains(&self, kind: &str) -> bool {
		self.kinds.contains_key(kind)
	}

	/// Registered kind names, unordered.
	pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
		self.kinds.keys().copied()
	}
}

impl fmt::Debug for KindRegistry {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_set().entries(self.kinds.keys()).finish()
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn standard_registry_knows_builtin_kinds() {
		let registry = KindRegistry::standard();
		let mut names: Vec<_> = registry.names().collect();
		names.sort_unstable();
		assert_eq!(names, ["folio", "note", "profile"]);
		assert!(matches!(registry.resolve("calendar"), Err(SyncError::UnknownKind(k)) if k == "calendar"));
	}

	#[test]
	fn erased_delta_is_none_for_equal_documents() {
		let registry = KindRegistry::standard();
		let note = registry.resolve("note").unwrap();
		let doc = json!({ "title": "t", "body": "b" });
		assert!(note.delta(&doc, &doc).unwrap().is_none());
	}

	#[test]
	fn erased_apply_round_trips_through_documents() {
		let registry = KindRegistry::standard();
		let profile = registry.resolve("profile").unwrap();
		let old = profile.empty();
		let new = json!({ "fields": { "name": "Ada" } });

		let delta = profile.delta(&old, &new).unwrap().unwrap();
		let (value, patches) = profile.apply(&old, &delta).unwrap();
		assert_eq!(value, new);
		assert_eq!(patches.len(), 1);
		assert_eq!(profile.apply_patch(&old, &patches[0]).unwrap(), new);
	}

	#[test]
	fn erased_apply_rejects_malformed_delta() {
		let registry = KindRegistry::standard();
		let note = registry.resolve("note").unwrap();
		let err = note.apply(&note.empty(), &json!({ "body": 42 })).unwrap_err();
		assert!(matches!(err, KindError::Codec(_)));
	}
}
