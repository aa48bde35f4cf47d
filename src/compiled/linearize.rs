//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::collections::HashMap;

use bit_set::BitSet;

use crate::autograd::{Dependencies, Graph, NodeIndex};
use crate::compiled::CompileError;
use crate::compiled::call::{AutogradCompilerCall, CallTarget, NodeCall, OutputRef};
use crate::compiled::key::{CacheKey, CompiledNodeArgs};
use crate::{ErrPack, cold_path};

//--------------------------------------------------------------------------------------------------

pub struct Linearization {
	/// Node `i` of the list has node id `i + 1`.
	pub calls: Vec<NodeCall>,
	pub compiler_call: AutogradCompilerCall,
}

fn malformed(message: String) -> ErrPack<CompileError> {
	cold_path();
	ErrPack::with_message(CompileError::MalformedGraph, message)
}

fn new_call(graph: &Graph, index: NodeIndex) -> Result<NodeCall, ErrPack<CompileError>> {
	let Some(graph_node) = graph.node(index) else {
		return Err(malformed(format!("node index {} not found", index.raw)));
	};
	let node = &graph_node.node;
	Ok(NodeCall::new(CallTarget::Node(index), node.node_kind(), node.num_inputs()))
}

/// Orders the nodes reachable from `roots` so that every call comes after the
/// calls producing its inputs.
///
/// `visit_key` receives the key of every call, synthetic adds included, in the
/// order the calls are appended. `dependencies` has to hold the number of
/// incoming edges of every reachable node, as computed by
/// `Graph::compute_dependencies`.
pub fn linearize(
	graph: &Graph,
	roots: &[NodeIndex],
	dependencies: &Dependencies,
	mut visit_key: impl FnMut(CacheKey<'_>),
) -> Result<Linearization, ErrPack<CompileError>> {
	let mut dependencies = dependencies.clone();
	let mut pending: HashMap<NodeIndex, NodeCall> = HashMap::new();
	let mut finalized = BitSet::with_capacity(graph.len());
	let mut worklist: Vec<NodeIndex> = Vec::with_capacity(roots.len());
	let mut calls: Vec<NodeCall> = Vec::with_capacity(dependencies.len() + roots.len() + 8);
	let mut compiler_call = AutogradCompilerCall::new();

	for &root in roots {
		if pending.contains_key(&root) {
			continue;
		}
		if dependencies.get(&root).is_some_and(|&d| d > 0) {
			return Err(malformed(format!("root {} has incoming edges", root.raw)));
		}
		pending.insert(root, new_call(graph, root)?);
		worklist.push(root);
	}

	while let Some(index) = worklist.pop() {
		let Some(graph_node) = graph.node(index) else {
			return Err(malformed(format!("node index {} not found", index.raw)));
		};
		let Some(mut call) = pending.remove(&index) else {
			return Err(malformed(format!("node {} scheduled without a call", index.raw)));
		};
		if !finalized.insert(index.raw) {
			return Err(malformed(format!("node {} scheduled twice", index.raw)));
		}

		{
			let mut args = CompiledNodeArgs::new(&mut compiler_call, &mut call);
			args.collect_input_refs()?;
			graph_node.node.compiled_args(&mut args)?;
			args.collect_hooks_from(graph_node)?;
			visit_key(args.key());
		}

		log::trace!("call {}: {} (node {})", calls.len() + 1, graph_node.node.name(), index.raw);
		calls.push(call);
		let node_id = calls.len();

		for (output_nr, edge) in graph_node.next_edges.iter().enumerate().rev() {
			let Some(edge) = edge else {
				continue;
			};
			let input_buffer = match pending.entry(edge.node) {
				std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
				std::collections::hash_map::Entry::Vacant(e) => e.insert(new_call(graph, edge.node)?),
			};
			let Some(slot) = input_buffer.inputs.get_mut(edge.input_nr) else {
				return Err(malformed(format!(
					"node {} has no input {}",
					edge.node.raw, edge.input_nr
				)));
			};

			let output = OutputRef::new(node_id, output_nr);
			if !slot.is_set() {
				*slot = output;
			} else {
				let mut implicit_add = NodeCall::implicit_add(*slot, output);
				{
					let mut args = CompiledNodeArgs::new(&mut compiler_call, &mut implicit_add);
					args.collect_input_refs()?;
					visit_key(args.key());
				}
				log::trace!(
					"call {}: implicit add into input {} of node {}",
					calls.len() + 1,
					edge.input_nr,
					edge.node.raw
				);
				calls.push(implicit_add);
				*slot = OutputRef::new(calls.len(), 0);
			}

			let Some(remaining) = dependencies.get_mut(&edge.node) else {
				return Err(malformed(format!("node {} missing from dependencies", edge.node.raw)));
			};
			if *remaining == 0 {
				return Err(malformed(format!("node {} has too many incoming edges", edge.node.raw)));
			}
			*remaining -= 1;
			if *remaining == 0 {
				dependencies.remove(&edge.node);
				worklist.push(edge.node);
			}
		}
	}

	if !pending.is_empty() {
		let mut stuck: Vec<usize> = pending.keys().map(|i| i.raw).collect();
		stuck.sort_unstable();
		return Err(malformed(format!("nodes {stuck:?} never became ready")));
	}

	Ok(Linearization { calls, compiler_call })
}

//--------------------------------------------------------------------------------------------------


//--------------------------------------------------------------------------------------------------
