//! Character-level text deltas.
//!
//! A [`TextDelta`] is a run of retain/delete/insert operations that spans the
//! whole base text, the same shape editors exchange for buffer edits.
//! Positions and lengths count `char`s, not bytes.

use ropey::Rope;
use serde::{Deserialize, Serialize};

use crate::ApplyError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextOp {
	/// Keep the next `n` chars.
	Retain(usize),
	/// Remove the next `n` chars.
	Delete(usize),
	/// Insert text at the cursor.
	Insert(String),
}

/// Ordered operations transforming one text into another.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TextDelta {
	ops: Vec<TextOp>,
}

impl TextDelta {
	pub fn new() -> Self {
		Self::default()
	}

	/// Minimal single-region delta: common prefix and suffix are retained,
	/// the middle is replaced.
	pub fn diff(old: &str, new: &str) -> Self {
		let old_chars: Vec<char> = old.chars().collect();
		let new_chars: Vec<char> = new.chars().collect();

		let prefix = old_chars.iter().zip(&new_chars).take_while(|(a, b)| a == b).count();
		let max_suffix = old_chars.len().min(new_chars.len()) - prefix;
		let suffix = old_chars
			.iter()
			.rev()
			.zip(new_chars.iter().rev())
			.take(max_suffix)
			.take_while(|(a, b)| a == b)
			.count();

		let mut delta = Self::new();
		delta.retain(prefix);
		delta.delete(old_chars.len() - prefix - suffix);
		delta.insert(&new_chars[prefix..new_chars.len() - suffix].iter().collect::<String>());
		delta.retain(suffix);
		delta
	}

	/// Adds a retain, merging with a preceding retain.
	pub fn retain(&mut self, n: usize) {
		if n == 0 {
			return;
		}
		if let Some(TextOp::Retain(count)) = self.ops.last_mut() {
			*count = count.saturating_add(n);
		} else {
			self.ops.push(TextOp::Retain(n));
		}
	}

	/// Adds a delete, merging with a preceding delete.
	pub fn delete(&mut self, n: usize) {
		if n == 0 {
			return;
		}
		if let Some(TextOp::Delete(count)) = self.ops.last_mut() {
			*count = count.saturating_add(n);
		} else {
			self.ops.push(TextOp::Delete(n));
		}
	}

	/// Adds an insert. Inserts are kept ahead of an adjacent delete so equal
	/// edits always serialize the same way.
	pub fn insert(&mut self, text: &str) {
		if text.is_empty() {
			return;
		}
		match self.ops.as_mut_slice() {
			[.., TextOp::Insert(prev)] | [.., TextOp::Insert(prev), TextOp::Delete(_)] => prev.push_str(text),
			[.., last @ TextOp::Delete(_)] => {
				let del = std::mem::replace(last, TextOp::Insert(text.to_owned()));
				self.ops.push(del);
			}
			_ => self.ops.push(TextOp::Insert(text.to_owned())),
		}
	}

	pub fn ops(&self) -> &[TextOp] {
		&self.ops
	}

	/// True when the delta only retains.
	pub fn is_identity(&self) -> bool {
		self.ops.iter().all(|op| matches!(op, TextOp::Retain(_)))
	}

	/// Number of base chars the delta consumes, saturating at `usize::MAX`.
	pub fn base_len(&self) -> usize {
		self.ops.iter().fold(0usize, |len, op| match op {
			TextOp::Retain(n) | TextOp::Delete(n) => len.saturating_add(*n),
			TextOp::Insert(_) => len,
		})
	}

	/// Applies the delta. Fails unless it spans exactly the whole of `text`.
	pub fn apply(&self, text: &str) -> Result<String, ApplyError> {
		let mut rope = Rope::from_str(text);
		let actual = rope.len_chars();
		let expected = self.base_len();
		// A saturated length never matches a real rope, so oversized counts stop here.
		if expected != actual {
			return Err(ApplyError::LengthMismatch { expected, actual });
		}

		let mut pos = 0;
		for op in &self.ops {
			match op {
				TextOp::Retain(n) => pos += n,
				TextOp::Delete(n) => rope.remove(pos..pos + n),
				TextOp::Insert(s) => {
					rope.insert(pos, s);
					pos += s.chars().count();
				}
			}
		}
		Ok(rope.to_string())
	}
}

/// `(char_len, xxh3_64)` of a text, used as a compare-and-swap precondition.
pub fn fingerprint(text: &str) -> (u64, u64) {
	(text.chars().count() as u64, xxhash_rust::xxh3::xxh3_64(text.as_bytes()))
}
