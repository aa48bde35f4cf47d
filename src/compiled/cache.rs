//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::any::TypeId;
use std::hash::BuildHasher;
use std::sync::Arc;

use hashbrown::{DefaultHashBuilder, HashTable};
use thin_vec::ThinVec;

use crate::compiled::boundary::CompiledFn;
use crate::compiled::key::CacheKey;
use crate::define_index_type;
use crate::util::index_vec::IndexVec;

//--------------------------------------------------------------------------------------------------

define_index_type!(CacheNodeIndex);

pub struct CacheEntry {
	pub key_hash: u64,
	pub node_kind: TypeId,
	/// Owned copy of the key bytes.
	pub key: ThinVec<u8>,
	pub child: CacheNodeIndex,
}

impl CacheEntry {
	pub fn key(&self) -> CacheKey<'_> {
		CacheKey { node_kind: self.node_kind, bytes: &self.key }
	}
}

pub struct CacheNode {
	next: HashTable<CacheEntry>,
	compiled_fn: Option<Arc<dyn CompiledFn>>,
}

impl CacheNode {
	fn new() -> Self {
		Self { next: HashTable::new(), compiled_fn: None }
	}
}

/// Position in the trie. Only valid for the generation it was created in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheCursor {
	node: CacheNodeIndex,
	generation: u64,
}

//--------------------------------------------------------------------------------------------------

/// Keys of one linearization, in visit order, copied into a single buffer.
///
/// The buffer holds every key of the traversal, so it grows with the total key
/// bytes of the graph rather than with the longest key. The trie is walked
/// once the path is complete, which lets cache hits take only the read lock.
#[derive(Default)]
pub struct KeyPath {
	bytes: Vec<u8>,
	keys: Vec<(TypeId, std::ops::Range<usize>)>,
}

impl KeyPath {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn push(&mut self, key: CacheKey<'_>) {
		let begin = self.bytes.len();
		self.bytes.extend_from_slice(key.bytes);
		self.keys.push((key.node_kind, begin..self.bytes.len()));
	}

	pub fn len(&self) -> usize {
		self.keys.len()
	}

	pub fn is_empty(&self) -> bool {
		self.keys.is_empty()
	}

	pub fn iter(&self) -> impl Iterator<Item = CacheKey<'_>> {
		self.keys.iter().map(|(node_kind, range)| CacheKey {
			node_kind: *node_kind,
			bytes: self.bytes.get(range.clone()).unwrap_or_default(),
		})
	}
}

//--------------------------------------------------------------------------------------------------

/// Trie of cached executables. Each edge is labeled by the key of one node call;
/// the path from the root spells out a whole linearized graph.
pub struct CacheTrie {
	nodes: IndexVec<CacheNodeIndex, CacheNode>,
	hasher: DefaultHashBuilder,
	generation: u64,
}

impl Default for CacheTrie {
	fn default() -> Self {
		Self::new()
	}
}

impl CacheTrie {
	pub fn new() -> Self {
		let mut nodes = IndexVec::new();
		nodes.push(CacheNode::new());
		Self {
			nodes,
			hasher: DefaultHashBuilder::default(),
			generation: 0,
		}
	}

	fn root_index() -> CacheNodeIndex {
		CacheNodeIndex::new(0)
	}

	pub fn root(&self) -> CacheCursor {
		CacheCursor {
			node: Self::root_index(),
			generation: self.generation,
		}
	}

	fn is_current(&self, cursor: CacheCursor) -> bool {
		cursor.generation == self.generation && self.nodes.get(cursor.node).is_some()
	}

	pub fn hash_key(&self, key: CacheKey<'_>) -> u64 {
		self.hasher.hash_one(key)
	}

	/// Returns the child reached by `key`, creating it on first use. A stale
	/// cursor is restarted at the root.
	pub fn lookup(&mut self, cursor: CacheCursor, key: CacheKey<'_>) -> CacheCursor {
		let cursor = if self.is_current(cursor) { cursor } else { self.root() };
		let key_hash = self.hash_key(key);
		let next_index = self.nodes.next_index();
		let Some(node) = self.nodes.get_mut(cursor.node) else {
			return cursor;
		};
		let entry = node.next.find(key_hash, |e| e.key_hash == key_hash && e.key() == key);
		if let Some(entry) = entry {
			return CacheCursor { node: entry.child, generation: self.generation };
		}
		node.next.insert_unique(
			key_hash,
			CacheEntry {
				key_hash,
				node_kind: key.node_kind,
				key: ThinVec::from(key.bytes),
				child: next_index,
			},
			|e| e.key_hash,
		);
		let child = self.nodes.push(CacheNode::new());
		CacheCursor { node: child, generation: self.generation }
	}

	/// Read-only walk. Returns `None` as soon as a key has no child.
	pub fn find(&self, cursor: CacheCursor, key: CacheKey<'_>) -> Option<CacheCursor> {
		if !self.is_current(cursor) {
			return None;
		}
		let key_hash = self.hash_key(key);
		let node = self.nodes.get(cursor.node)?;
		let entry = node.next.find(key_hash, |e| e.key_hash == key_hash && e.key() == key)?;
		Some(CacheCursor { node: entry.child, generation: self.generation })
	}

	/// Follows `path` without modifying the trie.
	pub fn find_path(&self, path: &KeyPath) -> Option<CacheCursor> {
		path.iter().try_fold(self.root(), |cursor, key| self.find(cursor, key))
	}

	/// Follows `path`, creating missing nodes.
	pub fn lookup_path(&mut self, path: &KeyPath) -> CacheCursor {
		path.iter().fold(self.root(), |cursor, key| self.lookup(cursor, key))
	}

	pub fn compiled_fn(&self, cursor: CacheCursor) -> Option<Arc<dyn CompiledFn>> {
		if !self.is_current(cursor) {
			return None;
		}
		self.nodes.get(cursor.node).and_then(|node| node.compiled_fn.clone())
	}

	/// Stores `compiled_fn` at `cursor` and returns the executable now held there.
	/// If another capture got there first, its executable is kept. A cursor from
	/// before the last `clear()` attaches nothing.
	pub fn attach(
		&mut self,
		cursor: CacheCursor,
		compiled_fn: Arc<dyn CompiledFn>,
	) -> Arc<dyn CompiledFn> {
		if !self.is_current(cursor) {
			log::debug!("cache was cleared during capture, executable not stored");
			return compiled_fn;
		}
		match self.nodes.get_mut(cursor.node) {
			Some(node) => node.compiled_fn.get_or_insert(compiled_fn).clone(),
			None => compiled_fn,
		}
	}

	pub fn clear(&mut self) {
		self.nodes.clear();
		self.nodes.push(CacheNode::new());
		self.generation += 1;
	}

	pub fn is_empty(&self) -> bool {
		self.nodes
			.get(Self::root_index())
			.is_none_or(|root| root.next.is_empty() && root.compiled_fn.is_none())
	}

	/// Number of trie nodes, root included.
	pub fn len(&self) -> usize {
		self.nodes.len()
	}
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;
	use crate::compiled::CompileError;
	use crate::tensor::Tensor;
	use crate::ErrPack;

	struct Noop;

	impl CompiledFn for Noop {
		fn call(
			&self,
			_inputs: &[Tensor],
			_sizes: &[i64],
		) -> Result<Vec<Tensor>, ErrPack<CompileError>> {
			Ok(Vec::new())
		}
	}

	struct KindA;
	struct KindB;

	#[test]
	fn equal_keys_from_different_buffers_share_a_child() {
		let mut trie = CacheTrie::new();
		let root = trie.root();

		let first = vec![1_u8, 2, 3];
		let a = trie.lookup(root, CacheKey { node_kind: TypeId::of::<KindA>(), bytes: &first });
		drop(first);

		let second = [1_u8, 2, 3];
		let b = trie.lookup(root, CacheKey { node_kind: TypeId::of::<KindA>(), bytes: &second });
		assert_eq!(a, b);
		assert_eq!(trie.len(), 2);

		let c = trie.lookup(root, CacheKey { node_kind: TypeId::of::<KindB>(), bytes: &second });
		assert_ne!(a, c);
		let d = trie.lookup(root, CacheKey { node_kind: TypeId::of::<KindA>(), bytes: &[1, 2] });
		assert_ne!(a, d);
		assert_eq!(trie.len(), 4);
	}

	#[test]
	fn empty_only_when_new_or_cleared() {
		let mut trie = CacheTrie::new();
		assert!(trie.is_empty());
		let key = CacheKey { node_kind: TypeId::of::<KindA>(), bytes: &[] };
		let child = trie.lookup(trie.root(), key);
		assert!(!trie.is_empty());
		assert!(trie.find(trie.root(), key).is_some());

		trie.attach(child, Arc::new(Noop));
		assert!(trie.compiled_fn(child).is_some());

		trie.clear();
		assert!(trie.is_empty());
		assert!(trie.compiled_fn(child).is_none());
		assert!(trie.find(trie.root(), key).is_none());
	}

	#[test]
	fn paths_share_prefixes() {
		let mut trie = CacheTrie::new();
		let kind = TypeId::of::<KindA>();
		let mut short = KeyPath::new();
		short.push(CacheKey { node_kind: kind, bytes: &[1] });
		short.push(CacheKey { node_kind: kind, bytes: &[2, 2] });
		let mut long = KeyPath::new();
		long.push(CacheKey { node_kind: kind, bytes: &[1] });
		long.push(CacheKey { node_kind: kind, bytes: &[2, 2] });
		long.push(CacheKey { node_kind: TypeId::of::<KindB>(), bytes: &[] });

		assert!(trie.find_path(&short).is_none());
		let a = trie.lookup_path(&short);
		assert_eq!(trie.find_path(&short), Some(a));
		let b = trie.lookup_path(&long);
		assert_ne!(a, b);
		// root + 3 nodes, the first two shared
		assert_eq!(trie.len(), 4);
	}

	#[test]
	fn stale_cursor_attaches_nothing() {
		let mut trie = CacheTrie::new();
		let key = CacheKey { node_kind: TypeId::of::<KindA>(), bytes: &[7] };
		let stale = trie.lookup(trie.root(), key);
		trie.clear();
		trie.attach(stale, Arc::new(Noop));
		assert!(trie.is_empty());

		let fresh = trie.lookup(trie.root(), key);
		assert!(trie.compiled_fn(fresh).is_none());
	}

	#[test]
	fn first_attached_executable_wins() {
		let mut trie = CacheTrie::new();
		let key = CacheKey { node_kind: TypeId::of::<KindA>(), bytes: &[7] };
		let cursor = trie.lookup(trie.root(), key);
		let first: Arc<dyn CompiledFn> = Arc::new(Noop);
		let kept = trie.attach(cursor, first.clone());
		assert!(Arc::ptr_eq(&kept, &first));
		let kept = trie.attach(cursor, Arc::new(Noop));
		assert!(Arc::ptr_eq(&kept, &first));
	}
}

//--------------------------------------------------------------------------------------------------
