//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::any::TypeId;
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use arrayvec::ArrayVec;

use crate::autograd::GraphNode;
use crate::compiled::CompileError;
use crate::compiled::call::{AutogradCompilerCall, GradTarget, NodeCall, OutputRef};
use crate::tensor::{DType, SavedTensor, Scalar, SymInt, Tensor, TensorOptions};
use crate::{ErrPack, cold_path};

//--------------------------------------------------------------------------------------------------

pub const MAX_KEY_SIZE: usize = 512;

/// Fingerprint of one node call. The bytes are borrowed; whoever retains a key
/// has to copy them.
#[derive(Clone, Copy, Debug)]
pub struct CacheKey<'a> {
	pub node_kind: TypeId,
	pub bytes: &'a [u8],
}

impl<'a> PartialEq for CacheKey<'a> {
	fn eq(&self, other: &Self) -> bool {
		self.node_kind == other.node_kind && self.bytes == other.bytes
	}
}

impl<'a> Eq for CacheKey<'a> {}

impl<'a> PartialOrd for CacheKey<'a> {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

impl<'a> Ord for CacheKey<'a> {
	fn cmp(&self, other: &Self) -> Ordering {
		self.node_kind
			.cmp(&other.node_kind)
			.then(self.bytes.len().cmp(&other.bytes.len()))
			.then_with(|| self.bytes.cmp(other.bytes))
	}
}

impl<'a> Hash for CacheKey<'a> {
	/// Only the kind and the length. Collisions are resolved by `eq`.
	fn hash<H: Hasher>(&self, state: &mut H) {
		self.node_kind.hash(state);
		self.bytes.len().hash(state);
	}
}

//--------------------------------------------------------------------------------------------------

/// Something a node can feed into its specialization key.
pub trait CompiledArg {
	fn collect_into(&self, args: &mut CompiledNodeArgs) -> Result<(), ErrPack<CompileError>>;
}

/// Builds the specialization key of one node call and routes tensor and size
/// arguments into the compiler call.
pub struct CompiledNodeArgs<'a> {
	compiler: &'a mut AutogradCompilerCall,
	node_call: &'a mut NodeCall,
	key: ArrayVec<u8, MAX_KEY_SIZE>,
}

impl<'a> CompiledNodeArgs<'a> {
	pub fn new(compiler: &'a mut AutogradCompilerCall, node_call: &'a mut NodeCall) -> Self {
		Self { compiler, node_call, key: ArrayVec::new() }
	}

	pub fn collect<T: CompiledArg + ?Sized>(&mut self, t: &T) -> Result<(), ErrPack<CompileError>> {
		t.collect_into(self)
	}

	pub fn specialize_on_bytes(&mut self, bytes: &[u8]) -> Result<(), ErrPack<CompileError>> {
		push_bytes(&mut self.key, bytes)
	}

	/// Variable width: below 253 one byte, otherwise a marker byte followed by
	/// 2, 4 or 8 bytes.
	pub fn collect_size(&mut self, size: usize) -> Result<(), ErrPack<CompileError>> {
		push_size(&mut self.key, size)
	}

	pub fn add_tensor_input(&mut self, tensor: &Tensor) {
		self.compiler.add_tensor_input(tensor);
	}

	pub fn add_size_input(&mut self, size: SymInt) -> Result<(), ErrPack<CompileError>> {
		match size {
			SymInt::Concrete(s) => {
				self.compiler.add_size_input(s);
				Ok(())
			},
			SymInt::Symbolic(_) => {
				cold_path();
				Err(ErrPack::with_message(
					CompileError::MalformedGraph,
					"symbolic size found while collecting inputs",
				))
			},
		}
	}

	pub fn set_grad_target(&mut self, target: GradTarget) {
		self.compiler.add_set_grad_target(target);
	}

	/// Encodes where every input comes from, so the shape of the graph is part
	/// of the key and not only the node's own arguments.
	pub fn collect_input_refs(&mut self) -> Result<(), ErrPack<CompileError>> {
		push_size(&mut self.key, self.node_call.inputs.len())?;
		for input in &self.node_call.inputs {
			push_output_ref(&mut self.key, *input)?;
		}
		Ok(())
	}

	/// Copies the node's hooks into the call. Hooks are not specialized on, but
	/// their counts and target slots are.
	pub fn collect_hooks_from(&mut self, node: &GraphNode) -> Result<(), ErrPack<CompileError>> {
		self.node_call.tensor_pre_hooks.extend(node.tensor_pre_hooks.iter().cloned());
		self.node_call.pre_hooks.extend(node.pre_hooks.iter().cloned());
		self.node_call.post_hooks.extend(node.post_hooks.iter().cloned());
		self.specialize_on_hook_counts()
	}

	fn specialize_on_hook_counts(&mut self) -> Result<(), ErrPack<CompileError>> {
		push_size(&mut self.key, self.node_call.tensor_pre_hooks.len())?;
		for (_, input_nr) in &self.node_call.tensor_pre_hooks {
			push_size(&mut self.key, *input_nr)?;
		}
		push_size(&mut self.key, self.node_call.pre_hooks.len())?;
		push_size(&mut self.key, self.node_call.post_hooks.len())
	}

	pub fn key(&self) -> CacheKey<'_> {
		CacheKey {
			node_kind: self.node_call.node_kind,
			bytes: self.key.as_slice(),
		}
	}
}

fn push_bytes(key: &mut ArrayVec<u8, MAX_KEY_SIZE>, bytes: &[u8]) -> Result<(), ErrPack<CompileError>> {
	if key.try_extend_from_slice(bytes).is_err() {
		cold_path();
		return Err(ErrPack::with_message(
			CompileError::KeyTooLarge,
			format!("specialization key exceeds {MAX_KEY_SIZE} bytes"),
		));
	}
	Ok(())
}

#[allow(clippy::cast_possible_truncation)]
fn push_size(key: &mut ArrayVec<u8, MAX_KEY_SIZE>, size: usize) -> Result<(), ErrPack<CompileError>> {
	const MAX: usize = u8::MAX as usize;
	if size < MAX - 2 {
		push_bytes(key, &[size as u8])
	} else if let Ok(s) = u16::try_from(size) {
		push_bytes(key, &[(MAX - 2) as u8])?;
		push_bytes(key, &s.to_ne_bytes())
	} else if let Ok(s) = u32::try_from(size) {
		push_bytes(key, &[(MAX - 1) as u8])?;
		push_bytes(key, &s.to_ne_bytes())
	} else {
		push_bytes(key, &[MAX as u8])?;
		push_bytes(key, &(size as u64).to_ne_bytes())
	}
}

fn push_output_ref(
	key: &mut ArrayVec<u8, MAX_KEY_SIZE>,
	output: OutputRef,
) -> Result<(), ErrPack<CompileError>> {
	if output.is_set() {
		push_size(key, output.node_id + 1)?;
		push_size(key, output.index + 1)
	} else {
		push_size(key, 0)?;
		push_size(key, 0)
	}
}

//--------------------------------------------------------------------------------------------------

impl CompiledArg for Tensor {
	fn collect_into(&self, args: &mut CompiledNodeArgs) -> Result<(), ErrPack<CompileError>> {
		let defined = self.is_defined();
		args.collect(&defined)?;
		if defined {
			args.add_tensor_input(self);
		}
		Ok(())
	}
}

impl CompiledArg for SavedTensor {
	fn collect_into(&self, args: &mut CompiledNodeArgs) -> Result<(), ErrPack<CompileError>> {
		args.collect(&self.unpack()?)
	}
}

impl CompiledArg for SymInt {
	fn collect_into(&self, args: &mut CompiledNodeArgs) -> Result<(), ErrPack<CompileError>> {
		args.add_size_input(*self)
	}
}

impl<T: CompiledArg> CompiledArg for [T] {
	fn collect_into(&self, args: &mut CompiledNodeArgs) -> Result<(), ErrPack<CompileError>> {
		args.collect_size(self.len())?;
		for t in self {
			args.collect(t)?;
		}
		Ok(())
	}
}

impl<T: CompiledArg> CompiledArg for Vec<T> {
	fn collect_into(&self, args: &mut CompiledNodeArgs) -> Result<(), ErrPack<CompileError>> {
		args.collect(self.as_slice())
	}
}

impl<T: CompiledArg> CompiledArg for Option<T> {
	fn collect_into(&self, args: &mut CompiledNodeArgs) -> Result<(), ErrPack<CompileError>> {
		args.collect(&self.is_some())?;
		match self {
			Some(t) => args.collect(t),
			None => Ok(()),
		}
	}
}

impl CompiledArg for OutputRef {
	fn collect_into(&self, args: &mut CompiledNodeArgs) -> Result<(), ErrPack<CompileError>> {
		push_output_ref(&mut args.key, *self)
	}
}

impl CompiledArg for DType {
	fn collect_into(&self, args: &mut CompiledNodeArgs) -> Result<(), ErrPack<CompileError>> {
		args.specialize_on_bytes(&[*self as u8])
	}
}

impl CompiledArg for Scalar {
	fn collect_into(&self, args: &mut CompiledNodeArgs) -> Result<(), ErrPack<CompileError>> {
		match *self {
			Self::Double(v) => {
				args.specialize_on_bytes(&[0])?;
				args.collect(&v)
			},
			Self::Long(v) => {
				args.specialize_on_bytes(&[1])?;
				args.collect(&v)
			},
			Self::Bool(v) => {
				args.specialize_on_bytes(&[2])?;
				args.collect(&v)
			},
		}
	}
}

impl CompiledArg for TensorOptions {
	fn collect_into(&self, args: &mut CompiledNodeArgs) -> Result<(), ErrPack<CompileError>> {
		args.collect(&self.dtype)?;
		args.collect(&self.requires_grad)
	}
}

impl CompiledArg for bool {
	fn collect_into(&self, args: &mut CompiledNodeArgs) -> Result<(), ErrPack<CompileError>> {
		args.specialize_on_bytes(&[u8::from(*self)])
	}
}

macro_rules! specialize_on_ne_bytes {
	($($t:ty),*) => {
		$(
			impl CompiledArg for $t {
				fn collect_into(
					&self,
					args: &mut CompiledNodeArgs,
				) -> Result<(), ErrPack<CompileError>> {
					args.specialize_on_bytes(&self.to_ne_bytes())
				}
			}
		)*
	};
}

specialize_on_ne_bytes!(i8, i16, i32, i64, u8, u16, u32, u64, f32, f64);

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;
	use crate::autograd::functions::ImplicitAdd;
	use crate::compiled::call::CallTarget;

	fn key_len(f: impl FnOnce(&mut CompiledNodeArgs) -> Result<(), ErrPack<CompileError>>) -> usize {
		let mut compiler = AutogradCompilerCall::new();
		let mut call = NodeCall::new(CallTarget::ImplicitAdd, TypeId::of::<ImplicitAdd>(), 0);
		let mut args = CompiledNodeArgs::new(&mut compiler, &mut call);
		f(&mut args).unwrap();
		args.key().bytes.len()
	}

	#[test]
	fn size_encoding_widths() {
		assert_eq!(key_len(|a| a.collect_size(0)), 1);
		assert_eq!(key_len(|a| a.collect_size(252)), 1);
		assert_eq!(key_len(|a| a.collect_size(253)), 3);
		assert_eq!(key_len(|a| a.collect_size(65535)), 3);
		assert_eq!(key_len(|a| a.collect_size(65536)), 5);
		assert_eq!(key_len(|a| a.collect_size(u32::MAX as usize)), 5);
		assert_eq!(key_len(|a| a.collect_size(u32::MAX as usize + 1)), 9);
	}

	#[test]
	fn tensors_become_inputs_and_sizes_stay_out_of_the_key() {
		let mut compiler = AutogradCompilerCall::new();
		let mut call = NodeCall::new(CallTarget::ImplicitAdd, TypeId::of::<ImplicitAdd>(), 0);
		let mut args = CompiledNodeArgs::new(&mut compiler, &mut call);

		let tensors = vec![Tensor::scalar(1.0), Tensor::undefined(), Tensor::scalar(2.0)];
		args.collect(&tensors).unwrap();
		// length + one defined flag per tensor
		assert_eq!(args.key().bytes, &[3, 1, 0, 1]);

		let sizes = vec![SymInt::Concrete(640), SymInt::Concrete(480)];
		args.collect(&sizes).unwrap();
		// only the length of the size list is specialized on
		assert_eq!(args.key().bytes, &[3, 1, 0, 1, 2]);

		drop(args);
		assert_eq!(compiler.inputs.len(), 2);
		assert_eq!(compiler.size_inputs, vec![640, 480]);
	}

	#[test]
	fn options_are_presence_byte_plus_value() {
		assert_eq!(key_len(|a| a.collect(&None::<f64>)), 1);
		assert_eq!(key_len(|a| a.collect(&Some(1.5_f64))), 9);
		assert_eq!(key_len(|a| a.collect(&Some(Scalar::Bool(true)))), 3);
	}

	#[test]
	fn output_refs_reserve_zero_for_unset() {
		let mut compiler = AutogradCompilerCall::new();
		let mut call = NodeCall::implicit_add(OutputRef::new(3, 0), OutputRef::UNSET);
		let mut args = CompiledNodeArgs::new(&mut compiler, &mut call);
		args.collect_input_refs().unwrap();
		assert_eq!(args.key().bytes, &[2, 4, 1, 0, 0]);
	}

	#[test]
	fn key_overflow_is_an_error() {
		let mut compiler = AutogradCompilerCall::new();
		let mut call = NodeCall::new(CallTarget::ImplicitAdd, TypeId::of::<ImplicitAdd>(), 0);
		let mut args = CompiledNodeArgs::new(&mut compiler, &mut call);
		let values = vec![0_u64; MAX_KEY_SIZE / 8];
		let err = args.collect(&values).err().map(|e| e.code);
		assert_eq!(err, Some(CompileError::KeyTooLarge));
	}

	#[test]
	fn keys_order_by_kind_then_length_then_bytes() {
		let kind = TypeId::of::<ImplicitAdd>();
		let short = CacheKey { node_kind: kind, bytes: &[9] };
		let long_low = CacheKey { node_kind: kind, bytes: &[0, 0] };
		let long_high = CacheKey { node_kind: kind, bytes: &[0, 1] };
		assert!(short < long_low);
		assert!(long_low < long_high);
		let copy = [0_u8, 1];
		assert_eq!(long_high, CacheKey { node_kind: kind, bytes: &copy });
	}
}

//--------------------------------------------------------------------------------------------------
