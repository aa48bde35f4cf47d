//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::sync::Arc;

use crate::autograd::functions::ImplicitAdd;
use crate::autograd::{Graph, Node};
use crate::compiled::CompileError;
use crate::compiled::boundary::{CompiledFn, CompilerBoundary};
use crate::compiled::call::{CallTarget, NodeCall, OutputRef};
use crate::compiled::linearize::Linearization;
use crate::compiled::swap::{SwapSavedVariables, TraceState};
use crate::tensor::Tensor;
use crate::{ErrPack, cold_path};

//--------------------------------------------------------------------------------------------------

fn gather_inputs(
	call: &NodeCall,
	node_outputs: &[Vec<Tensor>],
) -> Result<Vec<Tensor>, ErrPack<CompileError>> {
	call.inputs
		.iter()
		.map(|input| {
			if !input.is_set() {
				return Ok(Tensor::undefined());
			}
			output_of(node_outputs, *input)
		})
		.collect()
}

fn output_of(node_outputs: &[Vec<Tensor>], r: OutputRef) -> Result<Tensor, ErrPack<CompileError>> {
	r.node_id
		.checked_sub(1)
		.and_then(|i| node_outputs.get(i))
		.map(|outputs| outputs.get(r.index).cloned().unwrap_or_default())
		.ok_or_else(|| {
			cold_path();
			ErrPack::with_message(
				CompileError::MalformedGraph,
				format!("call {} read before it ran", r.node_id),
			)
		})
}

fn node_mut<'g>(
	graph: &'g mut Graph,
	call: &NodeCall,
	implicit_add: &'g mut ImplicitAdd,
) -> Result<&'g mut dyn Node, ErrPack<CompileError>> {
	match call.target {
		CallTarget::ImplicitAdd => Ok(implicit_add),
		CallTarget::Node(index) => match graph.node_mut(index) {
			Some(graph_node) => Ok(graph_node.node.as_mut()),
			None => {
				cold_path();
				Err(ErrPack::with_message(
					CompileError::MalformedGraph,
					format!("node index {} not found", index.raw),
				))
			},
		},
	}
}

//--------------------------------------------------------------------------------------------------

/// Runs the call list once on placeholders and hands the result to `compiler`.
///
/// Hooks are forwarded to the compiler instead of being called, so they become
/// part of the trace.
pub fn capture(
	graph: &mut Graph,
	linearization: &Linearization,
	compiler: &mut dyn CompilerBoundary,
) -> Result<Arc<dyn CompiledFn>, ErrPack<CompileError>> {
	let compiler_call = &linearization.compiler_call;
	let placeholders =
		compiler.begin_capture(&compiler_call.inputs, &compiler_call.size_inputs)?;
	// Extra placeholders are only reported when the state is dropped.
	if placeholders.tensors.len() < compiler_call.inputs.len()
		|| placeholders.sizes.len() < compiler_call.size_inputs.len()
	{
		cold_path();
		return Err(ErrPack::with_message(
			CompileError::InputCountMismatch,
			format!(
				"begin_capture returned {} tensors and {} sizes for {} inputs and {} sizes",
				placeholders.tensors.len(),
				placeholders.sizes.len(),
				compiler_call.inputs.len(),
				compiler_call.size_inputs.len()
			),
		));
	}

	let mut state = TraceState::new(placeholders);
	let mut node_outputs: Vec<Vec<Tensor>> = Vec::with_capacity(linearization.calls.len());
	let mut implicit_add = ImplicitAdd;

	for call in &linearization.calls {
		let mut inputs = gather_inputs(call, &node_outputs)?;
		for (hook, input_nr) in &call.tensor_pre_hooks {
			inputs = compiler.tensor_pre_hook(inputs, hook, *input_nr)?;
		}
		for hook in &call.pre_hooks {
			inputs = compiler.pre_hook(inputs, hook)?;
		}

		let node = node_mut(graph, call, &mut implicit_add)?;
		let mut outputs = {
			let mut saved = SwapSavedVariables::new(&mut state);
			node.apply_with_saved(inputs.clone(), &mut saved)?
		};

		for hook in &call.post_hooks {
			outputs = compiler.post_hook(outputs, &inputs, hook)?;
		}
		node_outputs.push(outputs);
	}

	compiler.end_capture(state.outputs())
}

/// Runs the call list directly on real values, with hooks called in place.
/// Saved state of every node is released right after it ran.
pub fn run_eager(graph: &mut Graph, calls: &[NodeCall]) -> Result<(), ErrPack<CompileError>> {
	let mut node_outputs: Vec<Vec<Tensor>> = Vec::with_capacity(calls.len());
	let mut implicit_add = ImplicitAdd;

	for call in calls {
		let mut inputs = gather_inputs(call, &node_outputs)?;
		for (hook, input_nr) in &call.tensor_pre_hooks {
			match inputs.get_mut(*input_nr) {
				Some(grad) if grad.is_defined() => *grad = hook.call(grad)?,
				_ => {},
			}
		}
		for hook in &call.pre_hooks {
			inputs = hook.call(inputs)?;
		}

		let node = node_mut(graph, call, &mut implicit_add)?;
		let mut outputs = node.apply(inputs.clone())?;
		node.release_variables();

		for hook in &call.post_hooks {
			outputs = hook.call(outputs, &inputs)?;
		}
		node_outputs.push(outputs);
	}
	Ok(())
}

//--------------------------------------------------------------------------------------------------
