//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use crate::compiled::CompileError;
use crate::compiled::boundary::CaptureInputs;
use crate::tensor::{SavedTensor, SymInt, Tensor};
use crate::{ErrPack, cold_path};

//--------------------------------------------------------------------------------------------------

/// Cursor over the placeholders of one capture, plus the outputs collected so far.
///
/// Placeholders are handed out in the order the inputs were collected while
/// encoding keys. Every one of them should be consumed exactly once.
pub struct TraceState {
	proxies: Vec<Tensor>,
	sizes: Vec<SymInt>,
	next_proxy: usize,
	next_size: usize,
	outputs: Vec<Tensor>,
}

impl TraceState {
	pub fn new(inputs: CaptureInputs) -> Self {
		Self {
			proxies: inputs.tensors,
			sizes: inputs.sizes,
			next_proxy: 0,
			next_size: 0,
			outputs: Vec::new(),
		}
	}

	fn next_proxy(&mut self) -> Result<Tensor, ErrPack<CompileError>> {
		let Some(proxy) = self.proxies.get(self.next_proxy) else {
			cold_path();
			return Err(ErrPack::with_message(
				CompileError::ProxyInputsExhausted,
				format!("all {} proxy inputs already consumed", self.proxies.len()),
			));
		};
		self.next_proxy += 1;
		Ok(proxy.clone())
	}

	fn next_size(&mut self) -> Result<SymInt, ErrPack<CompileError>> {
		let Some(size) = self.sizes.get(self.next_size) else {
			cold_path();
			return Err(ErrPack::with_message(
				CompileError::ProxySizesExhausted,
				format!("all {} symbolic sizes already consumed", self.sizes.len()),
			));
		};
		self.next_size += 1;
		Ok(*size)
	}

	pub fn outputs(&self) -> &[Tensor] {
		&self.outputs
	}

	pub fn is_fully_consumed(&self) -> bool {
		self.next_proxy == self.proxies.len() && self.next_size == self.sizes.len()
	}
}

impl Drop for TraceState {
	fn drop(&mut self) {
		if self.next_proxy < self.proxies.len() {
			log::warn!(
				"{} of {} proxy inputs were never consumed",
				self.proxies.len() - self.next_proxy,
				self.proxies.len()
			);
		}
		if self.next_size < self.sizes.len() {
			log::warn!(
				"{} of {} symbolic sizes were never consumed",
				self.sizes.len() - self.next_size,
				self.sizes.len()
			);
		}
	}
}

//--------------------------------------------------------------------------------------------------

/// Swaps a node's saved values for placeholders while the node runs during a
/// capture.
///
/// `after()` calls must mirror the `before()` calls in reverse order.
pub struct SwapSavedVariables<'s> {
	state: &'s mut TraceState,
	stashed_tensors: Vec<Tensor>,
	stashed_sizes: Vec<SymInt>,
}

impl<'s> SwapSavedVariables<'s> {
	pub fn new(state: &'s mut TraceState) -> Self {
		Self {
			state,
			stashed_tensors: Vec::new(),
			stashed_sizes: Vec::new(),
		}
	}

	pub fn before<T: SwapArg + ?Sized>(&mut self, t: &mut T) -> Result<(), ErrPack<CompileError>> {
		t.swap_in(self)
	}

	pub fn after<T: SwapArg + ?Sized>(&mut self, t: &mut T) {
		t.swap_out(self);
	}

	/// Records the value that the executable must return for the next gradient
	/// target.
	pub fn set_grad_value(&mut self, value: Tensor) {
		self.state.outputs.push(value);
	}
}

impl<'s> Drop for SwapSavedVariables<'s> {
	fn drop(&mut self) {
		if !self.stashed_tensors.is_empty() || !self.stashed_sizes.is_empty() {
			log::warn!(
				"{} stashed tensors and {} stashed sizes were never restored",
				self.stashed_tensors.len(),
				self.stashed_sizes.len()
			);
		}
	}
}

//--------------------------------------------------------------------------------------------------

/// A saved value that can be replaced by placeholders during a capture.
pub trait SwapArg {
	fn swap_in(&mut self, saved: &mut SwapSavedVariables) -> Result<(), ErrPack<CompileError>>;
	fn swap_out(&mut self, saved: &mut SwapSavedVariables);
}

impl SwapArg for Tensor {
	fn swap_in(&mut self, saved: &mut SwapSavedVariables) -> Result<(), ErrPack<CompileError>> {
		if self.is_defined() {
			let proxy = saved.state.next_proxy()?;
			saved.stashed_tensors.push(std::mem::replace(self, proxy));
		}
		Ok(())
	}

	fn swap_out(&mut self, saved: &mut SwapSavedVariables) {
		if !self.is_defined() {
			return;
		}
		if let Some(original) = saved.stashed_tensors.pop() {
			*self = original;
		}
	}
}

impl SwapArg for SavedTensor {
	fn swap_in(&mut self, saved: &mut SwapSavedVariables) -> Result<(), ErrPack<CompileError>> {
		self.data.swap_in(saved)
	}

	fn swap_out(&mut self, saved: &mut SwapSavedVariables) {
		self.data.swap_out(saved);
	}
}

impl SwapArg for SymInt {
	fn swap_in(&mut self, saved: &mut SwapSavedVariables) -> Result<(), ErrPack<CompileError>> {
		let size = saved.state.next_size()?;
		saved.stashed_sizes.push(std::mem::replace(self, size));
		Ok(())
	}

	fn swap_out(&mut self, saved: &mut SwapSavedVariables) {
		if let Some(original) = saved.stashed_sizes.pop() {
			*self = original;
		}
	}
}

impl<T: SwapArg> SwapArg for [T] {
	/// On failure, the elements swapped so far are restored.
	fn swap_in(&mut self, saved: &mut SwapSavedVariables) -> Result<(), ErrPack<CompileError>> {
		for i in 0..self.len() {
			let result = self.get_mut(i).map_or(Ok(()), |t| t.swap_in(saved));
			if let Err(e) = result {
				if let Some(done) = self.get_mut(..i) {
					done.swap_out(saved);
				}
				return Err(e);
			}
		}
		Ok(())
	}

	fn swap_out(&mut self, saved: &mut SwapSavedVariables) {
		for t in self.iter_mut().rev() {
			t.swap_out(saved);
		}
	}
}

impl<T: SwapArg> SwapArg for Vec<T> {
	fn swap_in(&mut self, saved: &mut SwapSavedVariables) -> Result<(), ErrPack<CompileError>> {
		self.as_mut_slice().swap_in(saved)
	}

	fn swap_out(&mut self, saved: &mut SwapSavedVariables) {
		self.as_mut_slice().swap_out(saved);
	}
}

impl<T: SwapArg> SwapArg for Option<T> {
	fn swap_in(&mut self, saved: &mut SwapSavedVariables) -> Result<(), ErrPack<CompileError>> {
		match self {
			Some(t) => t.swap_in(saved),
			None => Ok(()),
		}
	}

	fn swap_out(&mut self, saved: &mut SwapSavedVariables) {
		if let Some(t) = self {
			t.swap_out(saved);
		}
	}
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;
	use crate::compiled::trace::Tracer;

	fn state(num_proxies: usize, num_sizes: usize) -> TraceState {
		let tracer = Tracer::new();
		TraceState::new(CaptureInputs {
			tensors: (0..num_proxies).map(|_| tracer.input()).collect(),
			sizes: (0..num_sizes).map(SymInt::Symbolic).collect(),
		})
	}

	#[test]
	fn swap_and_restore() -> Result<(), ErrPack<CompileError>> {
		let mut state = state(2, 1);
		let mut grads = vec![Tensor::scalar(1.0), Tensor::undefined(), Tensor::scalar(2.0)];
		let mut size = SymInt::Concrete(7);
		{
			let mut saved = SwapSavedVariables::new(&mut state);
			saved.before(&mut grads)?;
			saved.before(&mut size)?;
			assert!(grads[0].is_proxy());
			assert!(!grads[1].is_defined());
			assert!(grads[2].is_proxy());
			assert_eq!(size, SymInt::Symbolic(0));
			saved.after(&mut size);
			saved.after(&mut grads);
		}
		assert_eq!(grads[0].item(), Some(1.0));
		assert_eq!(grads[2].item(), Some(2.0));
		assert_eq!(size, SymInt::Concrete(7));
		assert!(state.is_fully_consumed());
		Ok(())
	}

	#[test]
	fn exhausted_inputs_restore_partial_swaps() {
		let mut state = state(1, 0);
		let mut grads = vec![Tensor::scalar(1.0), Tensor::scalar(2.0)];
		let mut saved = SwapSavedVariables::new(&mut state);
		let err = saved.before(&mut grads).err().map(|e| e.code);
		assert_eq!(err, Some(CompileError::ProxyInputsExhausted));
		drop(saved);
		assert_eq!(grads[0].item(), Some(1.0));
		assert_eq!(grads[1].item(), Some(2.0));

		let mut size = SymInt::Concrete(3);
		let mut saved = SwapSavedVariables::new(&mut state);
		let err = saved.before(&mut size).err().map(|e| e.code);
		assert_eq!(err, Some(CompileError::ProxySizesExhausted));
	}

	#[test]
	fn grad_values_become_outputs() {
		let mut state = state(0, 0);
		{
			let mut saved = SwapSavedVariables::new(&mut state);
			saved.set_grad_value(Tensor::scalar(4.0));
			saved.set_grad_value(Tensor::undefined());
		}
		assert_eq!(state.outputs().len(), 2);
		assert!(!state.outputs()[1].is_defined());
	}

	#[test]
	fn extra_placeholders_are_left_over() -> Result<(), ErrPack<CompileError>> {
		let mut state = state(2, 1);
		let mut grad = Tensor::scalar(1.0);
		{
			let mut saved = SwapSavedVariables::new(&mut state);
			saved.before(&mut grad)?;
			saved.after(&mut grad);
		}
		assert!(!state.is_fully_consumed());

		let mut grad = Tensor::scalar(2.0);
		let mut size = SymInt::Concrete(5);
		{
			let mut saved = SwapSavedVariables::new(&mut state);
			saved.before(&mut grad)?;
			saved.before(&mut size)?;
			saved.after(&mut size);
			saved.after(&mut grad);
		}
		assert!(state.is_fully_consumed());
		Ok(())
	}
}

//--------------------------------------------------------------------------------------------------
