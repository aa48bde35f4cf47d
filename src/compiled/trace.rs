//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::autograd::{PostHook, PreHook, TensorPreHook};
use crate::compiled::CompileError;
use crate::compiled::boundary::{CaptureInputs, CompiledFn, CompilerBoundary, CompilerFactory};
use crate::tensor::{DType, SymInt, Tensor};
use crate::{ErrPack, cold_path};

//--------------------------------------------------------------------------------------------------

pub type ValueId = usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SizeOperand {
	Const(i64),
	Input(usize),
}

#[derive(Clone, Debug, PartialEq)]
pub enum TraceOp {
	Input(usize),
	Add(ValueId, ValueId),
	Mul(ValueId, ValueId),
	MulScalar(ValueId, f64),
	Reshape(ValueId, Vec<SizeOperand>),
	Cast(ValueId, DType),
}

#[derive(Default)]
struct TraceGraph {
	ops: Vec<TraceOp>,
	num_inputs: usize,
}

/// Shared recording target of all proxies of one capture.
#[derive(Clone, Default)]
pub struct Tracer(Rc<RefCell<TraceGraph>>);

impl Tracer {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn record(&self, op: TraceOp) -> ValueId {
		let mut graph = self.0.borrow_mut();
		graph.ops.push(op);
		graph.ops.len() - 1
	}

	pub fn same_trace(&self, other: &Self) -> bool {
		Rc::ptr_eq(&self.0, &other.0)
	}

	/// Adds the next positional input and returns its proxy.
	pub fn input(&self) -> Tensor {
		let index = {
			let mut graph = self.0.borrow_mut();
			graph.num_inputs += 1;
			graph.num_inputs - 1
		};
		let value = self.record(TraceOp::Input(index));
		Tensor::new_proxy(self.clone(), value)
	}

	pub fn num_ops(&self) -> usize {
		self.0.borrow().ops.len()
	}

	fn ops(&self) -> Vec<TraceOp> {
		self.0.borrow().ops.clone()
	}
}

//--------------------------------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TracedOutput {
	Value(ValueId),
	Undefined,
}

/// A finished trace. Runs the recorded operations on real tensors.
pub struct TracedProgram {
	ops: Vec<TraceOp>,
	num_inputs: usize,
	num_sizes: usize,
	outputs: Vec<TracedOutput>,
}

impl TracedProgram {
	fn value(values: &[Tensor], id: ValueId) -> Result<&Tensor, ErrPack<CompileError>> {
		values.get(id).ok_or_else(|| {
			cold_path();
			ErrPack::with_message(CompileError::Boundary, format!("trace value %{id} not yet computed"))
		})
	}

	fn size(sizes: &[i64], operand: SizeOperand) -> Result<SymInt, ErrPack<CompileError>> {
		match operand {
			SizeOperand::Const(c) => Ok(SymInt::Concrete(c)),
			SizeOperand::Input(i) => match sizes.get(i) {
				Some(&s) => Ok(SymInt::Concrete(s)),
				None => {
					cold_path();
					Err(ErrPack::new(CompileError::InputCountMismatch))
				},
			},
		}
	}
}

impl CompiledFn for TracedProgram {
	fn call(&self, inputs: &[Tensor], sizes: &[i64]) -> Result<Vec<Tensor>, ErrPack<CompileError>> {
		if inputs.len() != self.num_inputs || sizes.len() != self.num_sizes {
			cold_path();
			return Err(ErrPack::with_message(
				CompileError::InputCountMismatch,
				format!(
					"expected {} tensors and {} sizes, got {} and {}",
					self.num_inputs,
					self.num_sizes,
					inputs.len(),
					sizes.len()
				),
			));
		}
		let mut values: Vec<Tensor> = Vec::with_capacity(self.ops.len());
		for op in &self.ops {
			let value = match op {
				TraceOp::Input(i) => match inputs.get(*i) {
					Some(t) => t.clone(),
					None => {
						cold_path();
						return Err(ErrPack::new(CompileError::InputCountMismatch));
					},
				},
				TraceOp::Add(a, b) => Self::value(&values, *a)?.add(Self::value(&values, *b)?)?,
				TraceOp::Mul(a, b) => Self::value(&values, *a)?.mul(Self::value(&values, *b)?)?,
				TraceOp::MulScalar(a, scale) => Self::value(&values, *a)?.mul_scalar(*scale)?,
				TraceOp::Reshape(a, dims) => {
					let dims = dims
						.iter()
						.map(|d| Self::size(sizes, *d))
						.collect::<Result<Vec<_>, _>>()?;
					Self::value(&values, *a)?.reshape(&dims)?
				},
				TraceOp::Cast(a, dtype) => Self::value(&values, *a)?.cast(*dtype)?,
			};
			values.push(value);
		}
		self.outputs
			.iter()
			.map(|out| match *out {
				TracedOutput::Value(id) => Self::value(&values, id).cloned(),
				TracedOutput::Undefined => Ok(Tensor::undefined()),
			})
			.collect()
	}
}

//--------------------------------------------------------------------------------------------------

/// Reference backend. Hooks are applied to proxies, so whatever they compute
/// becomes part of the trace.
pub struct TraceCompiler {
	tracer: Tracer,
	num_sizes: usize,
}

impl Default for TraceCompiler {
	fn default() -> Self {
		Self::new()
	}
}

impl TraceCompiler {
	pub fn new() -> Self {
		Self { tracer: Tracer::new(), num_sizes: 0 }
	}
}

impl CompilerBoundary for TraceCompiler {
	fn begin_capture(
		&mut self,
		inputs: &[Tensor],
		sizes: &[i64],
	) -> Result<CaptureInputs, ErrPack<CompileError>> {
		let tensors = inputs.iter().map(|_| self.tracer.input()).collect();
		self.num_sizes = sizes.len();
		let sizes = (0..sizes.len()).map(SymInt::Symbolic).collect();
		Ok(CaptureInputs { tensors, sizes })
	}

	fn tensor_pre_hook(
		&mut self,
		mut inputs: Vec<Tensor>,
		hook: &Rc<dyn TensorPreHook>,
		input_nr: usize,
	) -> Result<Vec<Tensor>, ErrPack<CompileError>> {
		let Some(grad) = inputs.get_mut(input_nr) else {
			cold_path();
			return Err(ErrPack::with_message(
				CompileError::Boundary,
				format!("tensor hook targets missing input {input_nr}"),
			));
		};
		if grad.is_defined() {
			*grad = hook.call(grad)?;
		}
		Ok(inputs)
	}

	fn pre_hook(
		&mut self,
		inputs: Vec<Tensor>,
		hook: &Rc<dyn PreHook>,
	) -> Result<Vec<Tensor>, ErrPack<CompileError>> {
		Ok(hook.call(inputs)?)
	}

	fn post_hook(
		&mut self,
		outputs: Vec<Tensor>,
		inputs: &[Tensor],
		hook: &Rc<dyn PostHook>,
	) -> Result<Vec<Tensor>, ErrPack<CompileError>> {
		Ok(hook.call(outputs, inputs)?)
	}

	fn end_capture(&mut self, outputs: &[Tensor]) -> Result<Arc<dyn CompiledFn>, ErrPack<CompileError>> {
		let outputs = outputs
			.iter()
			.map(|t| {
				if !t.is_defined() {
					return Ok(TracedOutput::Undefined);
				}
				match t.proxy() {
					Some((tracer, value)) if tracer.same_trace(&self.tracer) => {
						Ok(TracedOutput::Value(value))
					},
					_ => {
						cold_path();
						Err(ErrPack::with_message(
							CompileError::Boundary,
							"captured output is not a value of this trace",
						))
					},
				}
			})
			.collect::<Result<Vec<_>, _>>()?;
		let num_inputs = self.tracer.0.borrow().num_inputs;
		log::debug!(
			"captured trace: {} ops, {} inputs, {} sizes, {} outputs",
			self.tracer.num_ops(),
			num_inputs,
			self.num_sizes,
			outputs.len()
		);
		Ok(Arc::new(TracedProgram {
			ops: self.tracer.ops(),
			num_inputs,
			num_sizes: self.num_sizes,
			outputs,
		}))
	}
}

/// Creates a `TraceCompiler` per capture and counts the captures.
#[derive(Default)]
pub struct TraceCompilerFactory {
	captures: AtomicUsize,
}

impl TraceCompilerFactory {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn captures(&self) -> usize {
		self.captures.load(Ordering::Relaxed)
	}
}

impl CompilerFactory for TraceCompilerFactory {
	fn create(&self) -> Box<dyn CompilerBoundary> {
		self.captures.fetch_add(1, Ordering::Relaxed);
		Box::new(TraceCompiler::new())
	}
}

//--------------------------------------------------------------------------------------------------


//--------------------------------------------------------------------------------------------------
