//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::any::TypeId;
use std::collections::HashMap;
use std::rc::Rc;

use smallvec::SmallVec;

use crate::compiled::key::CompiledNodeArgs;
use crate::compiled::swap::SwapSavedVariables;
use crate::compiled::CompileError;
use crate::tensor::{Tensor, TensorOpError};
use crate::util::index_vec::IndexVec;
use crate::{ErrPack, cold_path, define_index_type};

pub mod functions;

//--------------------------------------------------------------------------------------------------

/// One backward computation. Implementations are stored in a `Graph` and
/// addressed by `NodeIndex`.
pub trait Node: 'static {
	fn name(&self) -> &'static str {
		std::any::type_name::<Self>()
	}

	/// Identity of the node's type. Two calls can share a cached executable
	/// only if their kinds match.
	fn node_kind(&self) -> TypeId {
		TypeId::of::<Self>()
	}

	fn num_inputs(&self) -> usize;

	/// Feeds every argument the computation depends on into the key encoder.
	fn compiled_args(&self, args: &mut CompiledNodeArgs) -> Result<(), ErrPack<CompileError>>;

	fn apply(&mut self, inputs: Vec<Tensor>) -> Result<Vec<Tensor>, ErrPack<TensorOpError>>;

	/// Runs `apply` with saved values swapped for the trace's placeholders.
	fn apply_with_saved(
		&mut self,
		inputs: Vec<Tensor>,
		saved: &mut SwapSavedVariables,
	) -> Result<Vec<Tensor>, ErrPack<CompileError>>;

	fn release_variables(&mut self) {}
}

//--------------------------------------------------------------------------------------------------

pub trait TensorPreHook {
	fn call(&self, grad: &Tensor) -> Result<Tensor, ErrPack<TensorOpError>>;
}

pub trait PreHook {
	fn call(&self, grads: Vec<Tensor>) -> Result<Vec<Tensor>, ErrPack<TensorOpError>>;
}

pub trait PostHook {
	fn call(
		&self,
		outputs: Vec<Tensor>,
		inputs: &[Tensor],
	) -> Result<Vec<Tensor>, ErrPack<TensorOpError>>;
}

impl<F: Fn(&Tensor) -> Result<Tensor, ErrPack<TensorOpError>>> TensorPreHook for F {
	fn call(&self, grad: &Tensor) -> Result<Tensor, ErrPack<TensorOpError>> {
		self(grad)
	}
}

impl<F: Fn(Vec<Tensor>) -> Result<Vec<Tensor>, ErrPack<TensorOpError>>> PreHook for F {
	fn call(&self, grads: Vec<Tensor>) -> Result<Vec<Tensor>, ErrPack<TensorOpError>> {
		self(grads)
	}
}

impl<F> PostHook for F
where
	F: Fn(Vec<Tensor>, &[Tensor]) -> Result<Vec<Tensor>, ErrPack<TensorOpError>>,
{
	fn call(
		&self,
		outputs: Vec<Tensor>,
		inputs: &[Tensor],
	) -> Result<Vec<Tensor>, ErrPack<TensorOpError>> {
		self(outputs, inputs)
	}
}

//--------------------------------------------------------------------------------------------------

define_index_type!(NodeIndex);

/// Where one output of a node flows: input slot `input_nr` of `node`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Edge {
	pub node: NodeIndex,
	pub input_nr: usize,
}

pub struct GraphNode {
	pub node: Box<dyn Node>,

	/// One entry per output. `None` means no gradient flows out of that output.
	pub next_edges: SmallVec<[Option<Edge>; 2]>,

	pub tensor_pre_hooks: Vec<(Rc<dyn TensorPreHook>, usize)>,
	pub pre_hooks: Vec<Rc<dyn PreHook>>,
	pub post_hooks: Vec<Rc<dyn PostHook>>,
}

/// Number of not yet resolved incoming edges, per node.
pub type Dependencies = HashMap<NodeIndex, usize>;

#[derive(Clone, Copy, Debug)]
pub struct GraphConnectError;

pub struct Graph {
	nodes: IndexVec<NodeIndex, GraphNode>,
}

impl Default for Graph {
	fn default() -> Self {
		Self::new()
	}
}

impl Graph {
	pub fn new() -> Self {
		Self { nodes: IndexVec::new() }
	}

	pub fn len(&self) -> usize {
		self.nodes.len()
	}

	pub fn is_empty(&self) -> bool {
		self.nodes.is_empty()
	}

	pub fn node(&self, index: NodeIndex) -> Option<&GraphNode> {
		self.nodes.get(index)
	}

	pub fn node_mut(&mut self, index: NodeIndex) -> Option<&mut GraphNode> {
		self.nodes.get_mut(index)
	}

	/// Edges may only point at nodes that are already in the graph, so the
	/// graph is acyclic by construction.
	pub fn add_node<N: Node>(
		&mut self,
		node: N,
		next_edges: impl IntoIterator<Item = Option<Edge>>,
	) -> Result<NodeIndex, ErrPack<GraphConnectError>> {
		let next_edges: SmallVec<[Option<Edge>; 2]> = next_edges.into_iter().collect();
		for edge in next_edges.iter().flatten() {
			let Some(target) = self.nodes.get(edge.node) else {
				cold_path();
				return Err(ErrPack::with_message(
					GraphConnectError,
					format!("Node index {} not found", edge.node.raw),
				));
			};
			if edge.input_nr >= target.node.num_inputs() {
				cold_path();
				return Err(ErrPack::with_message(
					GraphConnectError,
					format!("Node index {} has no input port {}", edge.node.raw, edge.input_nr),
				));
			}
		}
		Ok(self.nodes.push(GraphNode {
			node: Box::new(node),
			next_edges,
			tensor_pre_hooks: Vec::new(),
			pre_hooks: Vec::new(),
			post_hooks: Vec::new(),
		}))
	}

	fn hooked_node(
		&mut self,
		index: NodeIndex,
	) -> Result<&mut GraphNode, ErrPack<GraphConnectError>> {
		self.nodes.get_mut(index).ok_or_else(|| {
			cold_path();
			ErrPack::with_message(GraphConnectError, format!("Node index {} not found", index.raw))
		})
	}

	pub fn register_tensor_pre_hook(
		&mut self,
		index: NodeIndex,
		input_nr: usize,
		hook: Rc<dyn TensorPreHook>,
	) -> Result<(), ErrPack<GraphConnectError>> {
		let node = self.hooked_node(index)?;
		if input_nr >= node.node.num_inputs() {
			cold_path();
			return Err(ErrPack::with_message(
				GraphConnectError,
				format!("Node index {} has no input port {}", index.raw, input_nr),
			));
		}
		node.tensor_pre_hooks.push((hook, input_nr));
		Ok(())
	}

	pub fn register_pre_hook(
		&mut self,
		index: NodeIndex,
		hook: Rc<dyn PreHook>,
	) -> Result<(), ErrPack<GraphConnectError>> {
		self.hooked_node(index)?.pre_hooks.push(hook);
		Ok(())
	}

	pub fn register_post_hook(
		&mut self,
		index: NodeIndex,
		hook: Rc<dyn PostHook>,
	) -> Result<(), ErrPack<GraphConnectError>> {
		self.hooked_node(index)?.post_hooks.push(hook);
		Ok(())
	}

	/// Counts the valid edges into every node reachable from `roots`.
	pub fn compute_dependencies(
		&self,
		roots: &[NodeIndex],
	) -> Result<Dependencies, ErrPack<GraphConnectError>> {
		let mut dependencies = Dependencies::new();
		let mut seen = bit_set::BitSet::with_capacity(self.nodes.len());
		let mut stack: Vec<NodeIndex> = Vec::with_capacity(roots.len());
		for &root in roots {
			if seen.insert(root.raw) {
				stack.push(root);
			}
		}
		while let Some(index) = stack.pop() {
			let node = self.nodes.get(index).ok_or_else(|| {
				cold_path();
				ErrPack::with_message(
					GraphConnectError,
					format!("Node index {} not found", index.raw),
				)
			})?;
			for edge in node.next_edges.iter().flatten() {
				*dependencies.entry(edge.node).or_insert(0) += 1;
				if seen.insert(edge.node.raw) {
					stack.push(edge.node);
				}
			}
		}
		Ok(dependencies)
	}
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;
	use crate::autograd::functions::{AccumulateGrad, GraphRoot, MulScalarBackward};

	#[test]
	fn edges_must_point_at_existing_inputs() -> Result<(), ErrPack<GraphConnectError>> {
		let mut graph = Graph::new();
		let (acc, _) = AccumulateGrad::new();
		let acc = graph.add_node(acc, [])?;
		let bad_slot = graph.add_node(
			MulScalarBackward::new(2.0),
			[Some(Edge { node: acc, input_nr: 1 })],
		);
		assert!(bad_slot.is_err());
		let missing = graph.add_node(
			MulScalarBackward::new(2.0),
			[Some(Edge { node: NodeIndex::new(7), input_nr: 0 })],
		);
		assert!(missing.is_err());
		Ok(())
	}

	#[test]
	fn dependencies_count_every_edge() -> Result<(), ErrPack<GraphConnectError>> {
		let mut graph = Graph::new();
		let (acc, _) = AccumulateGrad::new();
		let acc = graph.add_node(acc, [])?;
		let mul = graph.add_node(MulScalarBackward::new(2.0), [Some(Edge { node: acc, input_nr: 0 })])?;
		let root = graph.add_node(
			GraphRoot::new(vec![Tensor::scalar(1.0), Tensor::scalar(2.0), Tensor::scalar(3.0)]),
			[
				Some(Edge { node: mul, input_nr: 0 }),
				None,
				Some(Edge { node: mul, input_nr: 0 }),
			],
		)?;
		let deps = graph.compute_dependencies(&[root])?;
		assert_eq!(deps.get(&mul), Some(&2));
		assert_eq!(deps.get(&acc), Some(&1));
		assert_eq!(deps.get(&root), None);
		Ok(())
	}
}

//--------------------------------------------------------------------------------------------------
