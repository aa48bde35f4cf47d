//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::cell::RefCell;
use std::rc::Rc;

use crate::ErrPack;
use crate::autograd::Node;
use crate::compiled::CompileError;
use crate::compiled::call::GradTarget;
use crate::compiled::key::CompiledNodeArgs;
use crate::compiled::swap::SwapSavedVariables;
use crate::tensor::{SavedTensor, Scalar, SymInt, Tensor, TensorOpError, TensorOptions};

//--------------------------------------------------------------------------------------------------

fn first(inputs: Vec<Tensor>) -> Tensor {
	inputs.into_iter().next().unwrap_or_default()
}

//--------------------------------------------------------------------------------------------------

/// Entry point of a backward pass. Produces the initial gradients.
pub struct GraphRoot {
	grads: Vec<Tensor>,
}

impl GraphRoot {
	pub fn new(grads: Vec<Tensor>) -> Self {
		Self { grads }
	}
}

impl Node for GraphRoot {
	fn num_inputs(&self) -> usize {
		0
	}

	fn compiled_args(&self, args: &mut CompiledNodeArgs) -> Result<(), ErrPack<CompileError>> {
		args.collect(&self.grads)
	}

	fn apply(&mut self, _inputs: Vec<Tensor>) -> Result<Vec<Tensor>, ErrPack<TensorOpError>> {
		Ok(self.grads.clone())
	}

	fn apply_with_saved(
		&mut self,
		inputs: Vec<Tensor>,
		saved: &mut SwapSavedVariables,
	) -> Result<Vec<Tensor>, ErrPack<CompileError>> {
		saved.before(&mut self.grads)?;
		let result = self.apply(inputs);
		saved.after(&mut self.grads);
		Ok(result?)
	}

	fn release_variables(&mut self) {
		self.grads.clear();
	}
}

//--------------------------------------------------------------------------------------------------

/// Stores the incoming gradient into an externally owned slot.
pub struct AccumulateGrad {
	target: GradTarget,
}

impl AccumulateGrad {
	/// Returns the node and the slot it writes to.
	pub fn new() -> (Self, GradTarget) {
		let target = Rc::new(RefCell::new(None));
		(Self { target: target.clone() }, target)
	}
}

impl Node for AccumulateGrad {
	fn num_inputs(&self) -> usize {
		1
	}

	fn compiled_args(&self, args: &mut CompiledNodeArgs) -> Result<(), ErrPack<CompileError>> {
		args.set_grad_target(self.target.clone());
		Ok(())
	}

	fn apply(&mut self, inputs: Vec<Tensor>) -> Result<Vec<Tensor>, ErrPack<TensorOpError>> {
		let grad = first(inputs);
		*self.target.borrow_mut() = grad.is_defined().then_some(grad);
		Ok(Vec::new())
	}

	fn apply_with_saved(
		&mut self,
		inputs: Vec<Tensor>,
		saved: &mut SwapSavedVariables,
	) -> Result<Vec<Tensor>, ErrPack<CompileError>> {
		saved.set_grad_value(first(inputs));
		Ok(Vec::new())
	}
}

//--------------------------------------------------------------------------------------------------

/// Sums two gradients flowing into the same input slot. Never part of a
/// `Graph`; inserted by the linearizer.
pub struct ImplicitAdd;

impl Node for ImplicitAdd {
	fn num_inputs(&self) -> usize {
		2
	}

	fn compiled_args(&self, _args: &mut CompiledNodeArgs) -> Result<(), ErrPack<CompileError>> {
		Ok(())
	}

	fn apply(&mut self, inputs: Vec<Tensor>) -> Result<Vec<Tensor>, ErrPack<TensorOpError>> {
		let mut inputs = inputs.into_iter();
		let a = inputs.next().unwrap_or_default();
		let b = inputs.next().unwrap_or_default();
		Ok(vec![a.add(&b)?])
	}

	fn apply_with_saved(
		&mut self,
		inputs: Vec<Tensor>,
		_saved: &mut SwapSavedVariables,
	) -> Result<Vec<Tensor>, ErrPack<CompileError>> {
		Ok(self.apply(inputs)?)
	}
}

//--------------------------------------------------------------------------------------------------

/// Backward of `a + alpha * b`.
pub struct AddBackward {
	alpha: Option<Scalar>,
}

impl AddBackward {
	pub fn new(alpha: Option<Scalar>) -> Self {
		Self { alpha }
	}
}

impl Node for AddBackward {
	fn num_inputs(&self) -> usize {
		1
	}

	fn compiled_args(&self, args: &mut CompiledNodeArgs) -> Result<(), ErrPack<CompileError>> {
		args.collect(&self.alpha)
	}

	fn apply(&mut self, inputs: Vec<Tensor>) -> Result<Vec<Tensor>, ErrPack<TensorOpError>> {
		let grad = first(inputs);
		let grad_b = match self.alpha {
			Some(alpha) => grad.mul_scalar(alpha.to_f64())?,
			None => grad.clone(),
		};
		Ok(vec![grad, grad_b])
	}

	fn apply_with_saved(
		&mut self,
		inputs: Vec<Tensor>,
		_saved: &mut SwapSavedVariables,
	) -> Result<Vec<Tensor>, ErrPack<CompileError>> {
		Ok(self.apply(inputs)?)
	}
}

//--------------------------------------------------------------------------------------------------

/// Backward of `a * b`.
pub struct MulBackward {
	self_: SavedTensor,
	other: SavedTensor,
}

impl MulBackward {
	pub fn new(self_: Tensor, other: Tensor) -> Self {
		Self {
			self_: SavedTensor::new(self_),
			other: SavedTensor::new(other),
		}
	}
}

impl Node for MulBackward {
	fn num_inputs(&self) -> usize {
		1
	}

	fn compiled_args(&self, args: &mut CompiledNodeArgs) -> Result<(), ErrPack<CompileError>> {
		args.collect(&self.self_)?;
		args.collect(&self.other)
	}

	fn apply(&mut self, inputs: Vec<Tensor>) -> Result<Vec<Tensor>, ErrPack<TensorOpError>> {
		let grad = first(inputs);
		let self_ = self.self_.unpack()?;
		let other = self.other.unpack()?;
		Ok(vec![grad.mul(&other)?, grad.mul(&self_)?])
	}

	fn apply_with_saved(
		&mut self,
		inputs: Vec<Tensor>,
		saved: &mut SwapSavedVariables,
	) -> Result<Vec<Tensor>, ErrPack<CompileError>> {
		saved.before(&mut self.self_)?;
		if let Err(e) = saved.before(&mut self.other) {
			saved.after(&mut self.self_);
			return Err(e);
		}
		let result = self.apply(inputs);
		saved.after(&mut self.other);
		saved.after(&mut self.self_);
		Ok(result?)
	}

	fn release_variables(&mut self) {
		self.self_.release();
		self.other.release();
	}
}

//--------------------------------------------------------------------------------------------------

/// Backward of `a * scale` for a constant `scale`.
pub struct MulScalarBackward {
	scale: f64,
}

impl MulScalarBackward {
	pub fn new(scale: f64) -> Self {
		Self { scale }
	}
}

impl Node for MulScalarBackward {
	fn num_inputs(&self) -> usize {
		1
	}

	fn compiled_args(&self, args: &mut CompiledNodeArgs) -> Result<(), ErrPack<CompileError>> {
		args.collect(&self.scale)
	}

	fn apply(&mut self, inputs: Vec<Tensor>) -> Result<Vec<Tensor>, ErrPack<TensorOpError>> {
		Ok(vec![first(inputs).mul_scalar(self.scale)?])
	}

	fn apply_with_saved(
		&mut self,
		inputs: Vec<Tensor>,
		_saved: &mut SwapSavedVariables,
	) -> Result<Vec<Tensor>, ErrPack<CompileError>> {
		Ok(self.apply(inputs)?)
	}
}

//--------------------------------------------------------------------------------------------------

/// Backward of a reshape. Reshapes the gradient back to the input's sizes.
pub struct ReshapeBackward {
	self_sizes: Vec<SymInt>,
}

impl ReshapeBackward {
	pub fn new(self_sizes: &[i64]) -> Self {
		Self {
			self_sizes: self_sizes.iter().map(|&s| SymInt::Concrete(s)).collect(),
		}
	}
}

impl Node for ReshapeBackward {
	fn num_inputs(&self) -> usize {
		1
	}

	fn compiled_args(&self, args: &mut CompiledNodeArgs) -> Result<(), ErrPack<CompileError>> {
		args.collect(&self.self_sizes)
	}

	fn apply(&mut self, inputs: Vec<Tensor>) -> Result<Vec<Tensor>, ErrPack<TensorOpError>> {
		Ok(vec![first(inputs).reshape(&self.self_sizes)?])
	}

	fn apply_with_saved(
		&mut self,
		inputs: Vec<Tensor>,
		saved: &mut SwapSavedVariables,
	) -> Result<Vec<Tensor>, ErrPack<CompileError>> {
		saved.before(&mut self.self_sizes)?;
		let result = self.apply(inputs);
		saved.after(&mut self.self_sizes);
		Ok(result?)
	}
}

//--------------------------------------------------------------------------------------------------

/// Backward of a dtype conversion. Converts the gradient back.
pub struct ToCopyBackward {
	self_options: TensorOptions,
}

impl ToCopyBackward {
	pub fn new(self_options: TensorOptions) -> Self {
		Self { self_options }
	}
}

impl Node for ToCopyBackward {
	fn num_inputs(&self) -> usize {
		1
	}

	fn compiled_args(&self, args: &mut CompiledNodeArgs) -> Result<(), ErrPack<CompileError>> {
		args.collect(&self.self_options)
	}

	fn apply(&mut self, inputs: Vec<Tensor>) -> Result<Vec<Tensor>, ErrPack<TensorOpError>> {
		Ok(vec![first(inputs).cast(self.self_options.dtype)?])
	}

	fn apply_with_saved(
		&mut self,
		inputs: Vec<Tensor>,
		_saved: &mut SwapSavedVariables,
	) -> Result<Vec<Tensor>, ErrPack<CompileError>> {
		Ok(self.apply(inputs)?)
	}
}

//--------------------------------------------------------------------------------------------------
