//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::sync::Arc;

use compiled_autograd::ErrPack;
use compiled_autograd::autograd::functions::{AccumulateGrad, GraphRoot, MulScalarBackward};
use compiled_autograd::autograd::{Edge, Graph};
use compiled_autograd::compiled::trace::TraceCompilerFactory;
use compiled_autograd::compiled::{CompileError, CompiledAutograd};
use compiled_autograd::tensor::Tensor;

/// Backward of `y = 2 * (a + b)`, seeded with the gradients `ga` and `gb`.
fn backward(engine: &CompiledAutograd, ga: f64, gb: f64) -> Result<(), ErrPack<CompileError>> {
	let mut graph = Graph::new();
	let (acc, target) = AccumulateGrad::new();
	let acc = graph.add_node(acc, [])?;
	let scaled = graph.add_node(MulScalarBackward::new(2.0), [Some(Edge { node: acc, input_nr: 0 })])?;
	let edge = Some(Edge { node: scaled, input_nr: 0 });
	let root =
		graph.add_node(GraphRoot::new(vec![Tensor::scalar(ga), Tensor::scalar(gb)]), [edge, edge])?;

	let dependencies = graph.compute_dependencies(&[root])?;
	let outcome = engine.execute(&mut graph, &[root], &dependencies)?;
	let grad = target.borrow().as_ref().and_then(Tensor::item);
	println!("grads ({ga}, {gb}) -> {grad:?} [{outcome:?}]");
	Ok(())
}

fn main() -> Result<(), ErrPack<CompileError>> {
	stderrlog::new()
		.module(module_path!())
		.module("compiled_autograd")
		.verbosity(3_usize)
		.init()
		.ok();

	let engine = CompiledAutograd::instance();
	backward(engine, 3.0, 4.0)?;

	let factory = Arc::new(TraceCompilerFactory::new());
	engine.set_compiler(Some(factory.clone()));
	backward(engine, 3.0, 4.0)?;
	backward(engine, 5.0, 6.0)?;
	println!("captures: {}", factory.captures());

	engine.clear_cache();
	backward(engine, 5.0, 6.0)?;
	println!("captures: {}", factory.captures());
	Ok(())
}
