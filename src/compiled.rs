//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use crate::autograd::{Dependencies, Graph, GraphConnectError, NodeIndex};
use crate::compiled::boundary::{CompiledFn, CompilerFactory};
use crate::compiled::cache::{CacheTrie, KeyPath};
use crate::compiled::call::CallTarget;
use crate::compiled::linearize::{Linearization, linearize};
use crate::tensor::TensorOpError;
use crate::{ErrExtra, ErrPack, cold_path};

pub mod boundary;
pub mod cache;
pub mod call;
pub mod key;
pub mod linearize;
pub mod replay;
pub mod swap;
pub mod trace;


//--------------------------------------------------------------------------------------------------

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CompileError {
	KeyTooLarge,
	ProxyInputsExhausted,
	ProxySizesExhausted,
	OutputCountMismatch,
	InputCountMismatch,
	MalformedGraph,
	TensorOp,
	Boundary,
}

impl From<ErrPack<TensorOpError>> for ErrPack<CompileError> {
	#[cold]
	#[inline(never)]
	fn from(err: ErrPack<TensorOpError>) -> Self {
		Self {
			code: CompileError::TensorOp,
			extra: Some(Box::new(ErrExtra {
				message: format!("tensor operation failed: {:?}", err.code).into(),
				nested: Some(Box::new(err)),
			})),
		}
	}
}

impl From<ErrPack<GraphConnectError>> for ErrPack<CompileError> {
	#[cold]
	#[inline(never)]
	fn from(err: ErrPack<GraphConnectError>) -> Self {
		Self {
			code: CompileError::MalformedGraph,
			extra: Some(Box::new(ErrExtra {
				message: err.message().to_owned().into(),
				nested: Some(Box::new(err)),
			})),
		}
	}
}

//--------------------------------------------------------------------------------------------------

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
	/// No compiler installed. Nodes ran directly.
	Eager,
	CacheHit,
	/// Cache miss. A new executable was captured and run.
	Captured,
}

pub struct CompiledAutograd {
	cache: RwLock<CacheTrie>,
	compiler: RwLock<Option<Arc<dyn CompilerFactory>>>,
}

impl Default for CompiledAutograd {
	fn default() -> Self {
		Self::new()
	}
}

impl CompiledAutograd {
	pub fn new() -> Self {
		Self {
			cache: RwLock::new(CacheTrie::new()),
			compiler: RwLock::new(None),
		}
	}

	pub fn instance() -> &'static Self {
		static instance: OnceLock<CompiledAutograd> = OnceLock::new();
		instance.get_or_init(Self::new)
	}

	/// Installs `compiler`, or disables compilation with `None`. Returns the
	/// previously installed compiler.
	pub fn set_compiler(
		&self,
		compiler: Option<Arc<dyn CompilerFactory>>,
	) -> Option<Arc<dyn CompilerFactory>> {
		let mut slot = self.compiler.write().unwrap_or_else(PoisonError::into_inner);
		std::mem::replace(&mut *slot, compiler)
	}

	pub fn compiler(&self) -> Option<Arc<dyn CompilerFactory>> {
		self.compiler.read().unwrap_or_else(PoisonError::into_inner).clone()
	}

	pub fn clear_cache(&self) {
		self.cache.write().unwrap_or_else(PoisonError::into_inner).clear();
		log::debug!("compiled autograd cache cleared");
	}

	pub fn is_cache_empty(&self) -> bool {
		self.cache.read().unwrap_or_else(PoisonError::into_inner).is_empty()
	}

	/// Runs the backward graph reachable from `roots` and stores the final
	/// gradients into the targets of its `AccumulateGrad` nodes.
	///
	/// `dependencies` must count the incoming edges of every reachable node.
	/// Saved state of all visited nodes is released.
	pub fn execute(
		&self,
		graph: &mut Graph,
		roots: &[NodeIndex],
		dependencies: &Dependencies,
	) -> Result<ExecutionOutcome, ErrPack<CompileError>> {
		let Some(factory) = self.compiler() else {
			let linearization = linearize(graph, roots, dependencies, |_| {})?;
			log::debug!("no compiler installed, running {} calls eagerly", linearization.calls.len());
			replay::run_eager(graph, &linearization.calls)?;
			return Ok(ExecutionOutcome::Eager);
		};

		let mut path = KeyPath::new();
		let linearization = linearize(graph, roots, dependencies, |key| path.push(key))?;

		let (compiled_fn, outcome) = match self.find_compiled(&path) {
			Some(compiled_fn) => {
				log::debug!("cache hit after {} calls", path.len());
				(compiled_fn, ExecutionOutcome::CacheHit)
			},
			None => self.capture(graph, &linearization, &path, factory.as_ref())?,
		};

		for call in &linearization.calls {
			let CallTarget::Node(index) = call.target else {
				continue;
			};
			if let Some(graph_node) = graph.node_mut(index) {
				graph_node.node.release_variables();
			}
		}

		Self::run_compiled(&linearization, compiled_fn.as_ref())?;
		Ok(outcome)
	}

	fn find_compiled(&self, path: &KeyPath) -> Option<Arc<dyn CompiledFn>> {
		let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
		cache.find_path(path).and_then(|cursor| cache.compiled_fn(cursor))
	}

	/// The trie is locked only to insert the path and to attach the result.
	fn capture(
		&self,
		graph: &mut Graph,
		linearization: &Linearization,
		path: &KeyPath,
		factory: &dyn CompilerFactory,
	) -> Result<(Arc<dyn CompiledFn>, ExecutionOutcome), ErrPack<CompileError>> {
		let cursor = {
			let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
			let cursor = cache.lookup_path(path);
			if let Some(compiled_fn) = cache.compiled_fn(cursor) {
				log::debug!("cache hit after {} calls", path.len());
				return Ok((compiled_fn, ExecutionOutcome::CacheHit));
			}
			cursor
		};

		log::debug!(
			"cache miss, capturing {} calls with {} inputs and {} sizes",
			linearization.calls.len(),
			linearization.compiler_call.inputs.len(),
			linearization.compiler_call.size_inputs.len()
		);
		let mut compiler = factory.create();
		let compiled_fn = replay::capture(graph, linearization, compiler.as_mut())?;

		let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
		Ok((cache.attach(cursor, compiled_fn), ExecutionOutcome::Captured))
	}

	fn run_compiled(
		linearization: &Linearization,
		compiled_fn: &dyn CompiledFn,
	) -> Result<(), ErrPack<CompileError>> {
		let compiler_call = &linearization.compiler_call;
		let outputs = compiled_fn.call(&compiler_call.inputs, &compiler_call.size_inputs)?;
		if outputs.len() != compiler_call.set_grad_targets.len() {
			cold_path();
			return Err(ErrPack::with_message(
				CompileError::OutputCountMismatch,
				format!(
					"executable returned {} outputs for {} gradient targets",
					outputs.len(),
					compiler_call.set_grad_targets.len()
				),
			));
		}
		for (target, grad) in compiler_call.set_grad_targets.iter().zip(outputs) {
			*target.borrow_mut() = grad.is_defined().then_some(grad);
		}
		Ok(())
	}
}

//--------------------------------------------------------------------------------------------------

/// Installs `compiler` process-wide and returns the prior one.
pub fn set_autograd_compiler(
	compiler: Option<Arc<dyn CompilerFactory>>,
) -> Option<Arc<dyn CompilerFactory>> {
	CompiledAutograd::instance().set_compiler(compiler)
}

pub fn clear_cache() {
	CompiledAutograd::instance().clear_cache();
}

pub fn is_cache_empty() -> bool {
	CompiledAutograd::instance().is_cache_empty()
}

//--------------------------------------------------------------------------------------------------
