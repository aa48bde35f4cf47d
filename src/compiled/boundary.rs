//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::rc::Rc;
use std::sync::Arc;

use crate::ErrPack;
use crate::autograd::{PostHook, PreHook, TensorPreHook};
use crate::compiled::CompileError;
use crate::tensor::{SymInt, Tensor};

//--------------------------------------------------------------------------------------------------

/// Placeholders handed out by `begin_capture`, one per collected input.
pub struct CaptureInputs {
	pub tensors: Vec<Tensor>,
	pub sizes: Vec<SymInt>,
}

/// Executable produced by a capture.
///
/// `inputs` and `sizes` are positionally matched with the values passed to
/// `begin_capture`. The result is matched with the list given to `end_capture`.
pub trait CompiledFn: Send + Sync {
	fn call(&self, inputs: &[Tensor], sizes: &[i64]) -> Result<Vec<Tensor>, ErrPack<CompileError>>;
}

/// One capture session of a compiler backend.
///
/// Errors returned from any of these methods abort the request and reach the
/// caller of `execute` unchanged.
pub trait CompilerBoundary {
	fn begin_capture(
		&mut self,
		inputs: &[Tensor],
		sizes: &[i64],
	) -> Result<CaptureInputs, ErrPack<CompileError>>;

	fn tensor_pre_hook(
		&mut self,
		inputs: Vec<Tensor>,
		hook: &Rc<dyn TensorPreHook>,
		input_nr: usize,
	) -> Result<Vec<Tensor>, ErrPack<CompileError>>;

	fn pre_hook(
		&mut self,
		inputs: Vec<Tensor>,
		hook: &Rc<dyn PreHook>,
	) -> Result<Vec<Tensor>, ErrPack<CompileError>>;

	fn post_hook(
		&mut self,
		outputs: Vec<Tensor>,
		inputs: &[Tensor],
		hook: &Rc<dyn PostHook>,
	) -> Result<Vec<Tensor>, ErrPack<CompileError>>;

	fn end_capture(&mut self, outputs: &[Tensor]) -> Result<Arc<dyn CompiledFn>, ErrPack<CompileError>>;
}

/// Installed process-wide. Creates a fresh boundary for every capture.
pub trait CompilerFactory: Send + Sync {
	fn create(&self) -> Box<dyn CompilerBoundary>;
}

//--------------------------------------------------------------------------------------------------
