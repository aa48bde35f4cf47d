//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::hash::Hash;

//--------------------------------------------------------------------------------------------------

pub trait IndexTrait: Copy + Clone + PartialEq + Eq + Hash + Ord {
	fn to_raw(self) -> usize;
	fn from_raw(raw: usize) -> Self;
}

#[macro_export]
macro_rules! define_index_type {
	($name:ident) => {
		#[repr(transparent)]
		#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
		pub struct $name {
			pub raw: usize,
		}

		impl $name {
			pub fn new(raw: usize) -> Self {
				$name { raw }
			}
		}

		impl $crate::util::index_vec::IndexTrait for $name {
			fn to_raw(self) -> usize {
				self.raw
			}

			fn from_raw(raw: usize) -> Self {
				$name { raw }
			}
		}
	};
}

//--------------------------------------------------------------------------------------------------

/// A `Vec` addressed by a typed index.
pub struct IndexVec<Index: IndexTrait, T> {
	pub raw: Vec<T>,
	_marker: std::marker::PhantomData<Index>,
}

impl<Index: IndexTrait, T> Default for IndexVec<Index, T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<Index: IndexTrait, T> IndexVec<Index, T> {
	pub fn new() -> Self {
		Self {
			raw: Vec::new(),
			_marker: std::marker::PhantomData,
		}
	}

	pub fn push(&mut self, item: T) -> Index {
		let index = Index::from_raw(self.raw.len());
		self.raw.push(item);
		index
	}

	pub fn next_index(&self) -> Index {
		Index::from_raw(self.raw.len())
	}

	pub fn get(&self, index: Index) -> Option<&T> {
		self.raw.get(index.to_raw())
	}

	pub fn get_mut(&mut self, index: Index) -> Option<&mut T> {
		self.raw.get_mut(index.to_raw())
	}

	pub fn len(&self) -> usize {
		self.raw.len()
	}

	pub fn is_empty(&self) -> bool {
		self.raw.is_empty()
	}

	pub fn clear(&mut self) {
		self.raw.clear();
	}
}

//--------------------------------------------------------------------------------------------------
