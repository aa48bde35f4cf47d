//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::any::TypeId;
use std::cell::RefCell;
use std::rc::Rc;

use smallvec::SmallVec;

use crate::autograd::functions::ImplicitAdd;
use crate::autograd::{NodeIndex, PostHook, PreHook, TensorPreHook};
use crate::tensor::Tensor;

//--------------------------------------------------------------------------------------------------

/// Slot that receives a final gradient.
pub type GradTarget = Rc<RefCell<Option<Tensor>>>;

/// Output `index` of the call with 1-based position `node_id` in the call list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutputRef {
	pub node_id: usize,
	pub index: usize,
}

impl OutputRef {
	pub const UNSET: Self = Self { node_id: 0, index: 0 };

	pub fn new(node_id: usize, index: usize) -> Self {
		debug_assert!(node_id > 0);
		Self { node_id, index }
	}

	pub fn is_set(&self) -> bool {
		self.node_id != 0
	}
}

//--------------------------------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallTarget {
	Node(NodeIndex),
	ImplicitAdd,
}

/// One visit of a node: where each of its inputs comes from, plus the hooks
/// that have to run around it.
pub struct NodeCall {
	pub target: CallTarget,
	pub node_kind: TypeId,
	pub inputs: SmallVec<[OutputRef; 4]>,

	pub tensor_pre_hooks: SmallVec<[(Rc<dyn TensorPreHook>, usize); 1]>,
	pub pre_hooks: SmallVec<[Rc<dyn PreHook>; 1]>,
	pub post_hooks: SmallVec<[Rc<dyn PostHook>; 1]>,
}

impl NodeCall {
	pub fn new(target: CallTarget, node_kind: TypeId, num_inputs: usize) -> Self {
		Self {
			target,
			node_kind,
			inputs: SmallVec::from_elem(OutputRef::UNSET, num_inputs),
			tensor_pre_hooks: SmallVec::new(),
			pre_hooks: SmallVec::new(),
			post_hooks: SmallVec::new(),
		}
	}

	#[allow(clippy::indexing_slicing)]
	pub fn implicit_add(a: OutputRef, b: OutputRef) -> Self {
		let mut call = Self::new(CallTarget::ImplicitAdd, TypeId::of::<ImplicitAdd>(), 2);
		call.inputs[0] = a;
		call.inputs[1] = b;
		call
	}
}

impl std::fmt::Debug for NodeCall {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("NodeCall")
			.field("target", &self.target)
			.field("inputs", &self.inputs)
			.field("tensor_pre_hooks", &self.tensor_pre_hooks.len())
			.field("pre_hooks", &self.pre_hooks.len())
			.field("post_hooks", &self.post_hooks.len())
			.finish()
	}
}

//--------------------------------------------------------------------------------------------------

/// Everything gathered from the graph while encoding keys: the tensors that
/// become trace inputs, the integer size inputs, and the gradient slots that
/// receive the executable's outputs.
#[derive(Default)]
pub struct AutogradCompilerCall {
	pub inputs: Vec<Tensor>,
	pub size_inputs: Vec<i64>,
	pub set_grad_targets: Vec<GradTarget>,
}

impl AutogradCompilerCall {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn add_tensor_input(&mut self, tensor: &Tensor) {
		self.inputs.push(tensor.clone());
	}

	pub fn add_size_input(&mut self, size: i64) {
		self.size_inputs.push(size);
	}

	pub fn add_set_grad_target(&mut self, target: GradTarget) {
		self.set_grad_targets.push(target);
	}
}

//--------------------------------------------------------------------------------------------------
