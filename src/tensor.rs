//------------------------------------------------------------------------------
//
// Copyright 2025 Jiri Bobek. All rights reserved.
// License: GPL 3.0 or later. See LICENSE.txt for details.
//
//------------------------------------------------------------------------------

use std::rc::Rc;

use ndarray::{ArrayD, IxDyn};

use crate::compiled::trace::{SizeOperand, TraceOp, Tracer, ValueId};
use crate::{ErrPack, cold_path};

//--------------------------------------------------------------------------------------------------

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TensorOpError {
	ShapeMismatch,
	InvalidShape,
	MixedTrace,
	SymbolicSizeOnRealTensor,
	ReleasedVariable,
}

//--------------------------------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DType {
	F32,
	F64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Scalar {
	Double(f64),
	Long(i64),
	Bool(bool),
}

impl Scalar {
	#[allow(clippy::cast_precision_loss)]
	pub fn to_f64(self) -> f64 {
		match self {
			Self::Double(v) => v,
			Self::Long(v) => v as f64,
			Self::Bool(v) => f64::from(u8::from(v)),
		}
	}
}

/// Options that a value was created with. Encoded field by field into
/// specialization keys, never as raw bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TensorOptions {
	pub dtype: DType,
	pub requires_grad: bool,
}

/// An integer size. Concrete in eager code; during a capture it is replaced by a
/// reference to one of the trace's size inputs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SymInt {
	Concrete(i64),
	Symbolic(usize),
}

//--------------------------------------------------------------------------------------------------

enum TensorRepr {
	Real(ArrayD<f64>),
	Proxy { tracer: Tracer, value: ValueId },
}

/// A reference counted value. It is either undefined (no gradient), a real
/// array, or a proxy that records every operation applied to it into a trace.
#[derive(Clone, Default)]
pub struct Tensor {
	repr: Option<Rc<TensorRepr>>,
}

impl Tensor {
	pub fn undefined() -> Self {
		Self { repr: None }
	}

	pub fn from_array(array: ArrayD<f64>) -> Self {
		Self { repr: Some(Rc::new(TensorRepr::Real(array))) }
	}

	pub fn scalar(value: f64) -> Self {
		Self::from_array(ArrayD::from_elem(IxDyn(&[]), value))
	}

	pub fn from_shape_vec(shape: &[usize], data: Vec<f64>) -> Result<Self, ErrPack<TensorOpError>> {
		match ArrayD::from_shape_vec(IxDyn(shape), data) {
			Ok(array) => Ok(Self::from_array(array)),
			Err(e) => {
				cold_path();
				Err(ErrPack::with_message(TensorOpError::InvalidShape, e.to_string()))
			},
		}
	}

	pub(crate) fn new_proxy(tracer: Tracer, value: ValueId) -> Self {
		Self {
			repr: Some(Rc::new(TensorRepr::Proxy { tracer, value })),
		}
	}

	pub fn is_defined(&self) -> bool {
		self.repr.is_some()
	}

	pub fn is_proxy(&self) -> bool {
		matches!(self.repr.as_deref(), Some(TensorRepr::Proxy { .. }))
	}

	pub fn array(&self) -> Option<&ArrayD<f64>> {
		match self.repr.as_deref() {
			Some(TensorRepr::Real(array)) => Some(array),
			_ => None,
		}
	}

	pub fn shape(&self) -> Option<&[usize]> {
		self.array().map(|a| a.shape())
	}

	/// Value of a real single-element tensor.
	pub fn item(&self) -> Option<f64> {
		let array = self.array()?;
		if array.len() == 1 { array.iter().next().copied() } else { None }
	}

	pub(crate) fn proxy(&self) -> Option<(&Tracer, ValueId)> {
		match self.repr.as_deref() {
			Some(TensorRepr::Proxy { tracer, value }) => Some((tracer, *value)),
			_ => None,
		}
	}

	//----------------------------------------------------------------------------------------------

	/// Undefined operands are treated as zero.
	pub fn add(&self, other: &Self) -> Result<Self, ErrPack<TensorOpError>> {
		match (self.repr.as_deref(), other.repr.as_deref()) {
			(None, _) => Ok(other.clone()),
			(_, None) => Ok(self.clone()),
			(Some(TensorRepr::Real(a)), Some(TensorRepr::Real(b))) => {
				check_same_shape(a, b)?;
				Ok(Self::from_array(a + b))
			},
			_ => self.record_binary(other, TraceOp::Add),
		}
	}

	/// Multiplying by an undefined operand gives an undefined result.
	pub fn mul(&self, other: &Self) -> Result<Self, ErrPack<TensorOpError>> {
		match (self.repr.as_deref(), other.repr.as_deref()) {
			(None, _) | (_, None) => Ok(Self::undefined()),
			(Some(TensorRepr::Real(a)), Some(TensorRepr::Real(b))) => {
				check_same_shape(a, b)?;
				Ok(Self::from_array(a * b))
			},
			_ => self.record_binary(other, TraceOp::Mul),
		}
	}

	pub fn mul_scalar(&self, scale: f64) -> Result<Self, ErrPack<TensorOpError>> {
		match self.repr.as_deref() {
			None => Ok(Self::undefined()),
			Some(TensorRepr::Real(a)) => Ok(Self::from_array(a * scale)),
			Some(TensorRepr::Proxy { tracer, value }) => {
				Ok(record(tracer, TraceOp::MulScalar(*value, scale)))
			},
		}
	}

	pub fn reshape(&self, sizes: &[SymInt]) -> Result<Self, ErrPack<TensorOpError>> {
		match self.repr.as_deref() {
			None => Ok(Self::undefined()),
			Some(TensorRepr::Real(a)) => {
				let dims = concrete_dims(sizes)?;
				match a.to_shape(dims) {
					Ok(reshaped) => Ok(Self::from_array(reshaped.into_owned())),
					Err(e) => {
						cold_path();
						Err(ErrPack::with_message(TensorOpError::ShapeMismatch, e.to_string()))
					},
				}
			},
			Some(TensorRepr::Proxy { tracer, value }) => {
				let sizes = sizes
					.iter()
					.map(|s| match *s {
						SymInt::Concrete(c) => SizeOperand::Const(c),
						SymInt::Symbolic(i) => SizeOperand::Input(i),
					})
					.collect();
				Ok(record(tracer, TraceOp::Reshape(*value, sizes)))
			},
		}
	}

	#[allow(clippy::cast_possible_truncation)]
	pub fn cast(&self, dtype: DType) -> Result<Self, ErrPack<TensorOpError>> {
		match self.repr.as_deref() {
			None => Ok(Self::undefined()),
			Some(TensorRepr::Real(a)) => match dtype {
				DType::F32 => Ok(Self::from_array(a.mapv(|x| f64::from(x as f32)))),
				DType::F64 => Ok(self.clone()),
			},
			Some(TensorRepr::Proxy { tracer, value }) => {
				Ok(record(tracer, TraceOp::Cast(*value, dtype)))
			},
		}
	}

	fn record_binary(
		&self,
		other: &Self,
		op: fn(ValueId, ValueId) -> TraceOp,
	) -> Result<Self, ErrPack<TensorOpError>> {
		match (self.proxy(), other.proxy()) {
			(Some((tracer, a)), Some((other_tracer, b))) if tracer.same_trace(other_tracer) => {
				Ok(record(tracer, op(a, b)))
			},
			_ => {
				cold_path();
				Err(ErrPack::with_message(
					TensorOpError::MixedTrace,
					"operands belong to different traces or mix real and proxy values",
				))
			},
		}
	}
}

impl std::fmt::Debug for Tensor {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self.repr.as_deref() {
			None => write!(f, "Tensor(undefined)"),
			Some(TensorRepr::Real(a)) => write!(f, "Tensor({a})"),
			Some(TensorRepr::Proxy { value, .. }) => write!(f, "Tensor(proxy %{value})"),
		}
	}
}

fn record(tracer: &Tracer, op: TraceOp) -> Tensor {
	let value = tracer.record(op);
	Tensor::new_proxy(tracer.clone(), value)
}

fn check_same_shape(a: &ArrayD<f64>, b: &ArrayD<f64>) -> Result<(), ErrPack<TensorOpError>> {
	if a.shape() != b.shape() {
		cold_path();
		return Err(ErrPack::with_message(
			TensorOpError::ShapeMismatch,
			format!("shapes {:?} and {:?} don't match", a.shape(), b.shape()),
		));
	}
	Ok(())
}

fn concrete_dims(sizes: &[SymInt]) -> Result<Vec<usize>, ErrPack<TensorOpError>> {
	sizes
		.iter()
		.map(|s| match *s {
			SymInt::Concrete(c) => usize::try_from(c).map_err(|_| {
				cold_path();
				ErrPack::with_message(TensorOpError::InvalidShape, format!("negative size {c}"))
			}),
			SymInt::Symbolic(_) => {
				cold_path();
				Err(ErrPack::new(TensorOpError::SymbolicSizeOnRealTensor))
			},
		})
		.collect()
}

//--------------------------------------------------------------------------------------------------

/// A tensor saved by a node for use in its backward computation. Released once
/// the node no longer needs it.
#[derive(Clone, Debug, Default)]
pub struct SavedTensor {
	pub(crate) data: Tensor,
	released: bool,
}

impl SavedTensor {
	pub fn new(data: Tensor) -> Self {
		Self { data, released: false }
	}

	pub fn unpack(&self) -> Result<Tensor, ErrPack<TensorOpError>> {
		if self.released {
			cold_path();
			return Err(ErrPack::with_message(
				TensorOpError::ReleasedVariable,
				"saved tensor was already released",
			));
		}
		Ok(self.data.clone())
	}

	pub fn release(&mut self) {
		self.data = Tensor::undefined();
		self.released = true;
	}

	pub fn is_released(&self) -> bool {
		self.released
	}
}

//--------------------------------------------------------------------------------------------------


//--------------------------------------------------------------------------------------------------
