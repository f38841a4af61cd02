#![forbid(unsafe_code)]

//! Value model shared by the framework runtime, the frontend and the
//! inference engine.
//!
//! Tensors store their elements as [`Literal`]s. Floating elements are kept
//! as `f64` bit patterns that have already been rounded to the tensor's
//! element type, so two tensors of the same dtype compare element-for-element
//! regardless of which engine produced them.

#[cfg(test)]
pub mod proptest_strategies;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DType {
    Bool,
    U8,
    I8,
    I16,
    I32,
    I64,
    F16,
    BF16,
    F32,
    F64,
}

/// Coarse type category used by scalar/zero-dim promotion rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TypeCategory {
    Bool,
    Integral,
    Floating,
}

impl DType {
    pub const ALL: [DType; 10] = [
        DType::Bool,
        DType::U8,
        DType::I8,
        DType::I16,
        DType::I32,
        DType::I64,
        DType::F16,
        DType::BF16,
        DType::F32,
        DType::F64,
    ];

    /// Array-library style type name (`float32`, `int64`, ...).
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::U8 => "uint8",
            Self::I8 => "int8",
            Self::I16 => "int16",
            Self::I32 => "int32",
            Self::I64 => "int64",
            Self::F16 => "float16",
            Self::BF16 => "bfloat16",
            Self::F32 => "float32",
            Self::F64 => "float64",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|dtype| dtype.name() == name)
    }

    #[must_use]
    pub fn category(self) -> TypeCategory {
        match self {
            Self::Bool => TypeCategory::Bool,
            Self::U8 | Self::I8 | Self::I16 | Self::I32 | Self::I64 => TypeCategory::Integral,
            Self::F16 | Self::BF16 | Self::F32 | Self::F64 => TypeCategory::Floating,
        }
    }

    #[must_use]
    pub fn is_floating(self) -> bool {
        self.category() == TypeCategory::Floating
    }

    #[must_use]
    pub fn is_integral(self) -> bool {
        self.category() == TypeCategory::Integral
    }

    #[must_use]
    pub fn size_bytes(self) -> usize {
        match self {
            Self::Bool | Self::U8 | Self::I8 => 1,
            Self::I16 | Self::F16 | Self::BF16 => 2,
            Self::I32 | Self::F32 => 4,
            Self::I64 | Self::F64 => 8,
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    pub dims: Vec<u32>,
}

impl Shape {
    #[must_use]
    pub fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    #[must_use]
    pub fn vector(len: u32) -> Self {
        Self { dims: vec![len] }
    }

    #[must_use]
    pub fn new(dims: impl Into<Vec<u32>>) -> Self {
        Self { dims: dims.into() }
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    #[must_use]
    pub fn element_count(&self) -> Option<u64> {
        self.dims
            .iter()
            .try_fold(1_u64, |acc, dim| acc.checked_mul(u64::from(*dim)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Literal {
    I64(i64),
    Bool(bool),
    F64Bits(u64),
}

impl Literal {
    #[must_use]
    pub fn from_f64(value: f64) -> Self {
        Self::F64Bits(value.to_bits())
    }

    /// Numeric view; booleans read as 0/1.
    #[must_use]
    pub fn as_f64(self) -> f64 {
        match self {
            Self::F64Bits(bits) => f64::from_bits(bits),
            Self::I64(value) => value as f64,
            Self::Bool(value) => f64::from(u8::from(value)),
        }
    }

    #[must_use]
    pub fn as_i64(self) -> Option<i64> {
        match self {
            Self::I64(value) => Some(value),
            Self::Bool(value) => Some(i64::from(value)),
            Self::F64Bits(_) => None,
        }
    }

    #[must_use]
    pub fn as_bool(self) -> bool {
        match self {
            Self::Bool(value) => value,
            Self::I64(value) => value != 0,
            Self::F64Bits(bits) => f64::from_bits(bits) != 0.0,
        }
    }

    #[must_use]
    pub fn is_nan(self) -> bool {
        matches!(self, Self::F64Bits(bits) if f64::from_bits(bits).is_nan())
    }

    /// The dtype a bare scalar of this kind carries when promoted on its own.
    #[must_use]
    pub fn natural_dtype(self) -> DType {
        match self {
            Self::I64(_) => DType::I64,
            Self::Bool(_) => DType::Bool,
            Self::F64Bits(_) => DType::F64,
        }
    }

    /// Converts to the storage form of `dtype`: integers wrap to the target
    /// width, floats round to the target precision, NaN becomes 0 when
    /// converted to an integer type.
    #[must_use]
    pub fn cast(self, dtype: DType) -> Self {
        match dtype {
            DType::Bool => Self::Bool(self.as_bool()),
            DType::F64 => Self::from_f64(self.as_f64()),
            DType::F32 => Self::from_f64(f64::from(self.as_f64() as f32)),
            DType::F16 => Self::from_f64(half::f16::from_f64(self.as_f64()).to_f64()),
            DType::BF16 => Self::from_f64(half::bf16::from_f64(self.as_f64()).to_f64()),
            DType::I64 => Self::I64(self.integral_value()),
            DType::I32 => Self::I64(i64::from(self.integral_value() as i32)),
            DType::I16 => Self::I64(i64::from(self.integral_value() as i16)),
            DType::I8 => Self::I64(i64::from(self.integral_value() as i8)),
            DType::U8 => Self::I64(i64::from(self.integral_value() as u8)),
        }
    }

    fn integral_value(self) -> i64 {
        match self {
            Self::I64(value) => value,
            Self::Bool(value) => i64::from(value),
            Self::F64Bits(bits) => {
                let value = f64::from_bits(bits);
                if value.is_nan() { 0 } else { value as i64 }
            }
        }
    }
}

impl std::fmt::Display for Literal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::I64(value) => write!(f, "{value}"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::F64Bits(bits) => write!(f, "{:?}", f64::from_bits(*bits)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValueError {
    #[error("shape element count overflowed: {:?}", shape.dims)]
    ShapeOverflow { shape: Shape },
    #[error(
        "tensor element count mismatch for shape {:?}: expected {expected_count}, got {actual_count}",
        shape.dims
    )]
    ElementCountMismatch {
        shape: Shape,
        expected_count: u64,
        actual_count: usize,
    },
    #[error("expected a single-element tensor, got shape {:?}", shape.dims)]
    NotSingleElement { shape: Shape },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorValue {
    pub dtype: DType,
    pub shape: Shape,
    pub elements: Vec<Literal>,
}

impl TensorValue {
    /// Builds a tensor, casting every element into the storage form of `dtype`.
    pub fn new(dtype: DType, shape: Shape, elements: Vec<Literal>) -> Result<Self, ValueError> {
        let expected_count = shape.element_count().ok_or(ValueError::ShapeOverflow {
            shape: shape.clone(),
        })?;

        if expected_count != elements.len() as u64 {
            return Err(ValueError::ElementCountMismatch {
                shape,
                expected_count,
                actual_count: elements.len(),
            });
        }

        let elements = elements
            .into_iter()
            .map(|literal| literal.cast(dtype))
            .collect();
        Ok(Self {
            dtype,
            shape,
            elements,
        })
    }

    pub fn from_f64s(dtype: DType, shape: Shape, values: &[f64]) -> Result<Self, ValueError> {
        Self::new(
            dtype,
            shape,
            values.iter().copied().map(Literal::from_f64).collect(),
        )
    }

    pub fn from_i64s(dtype: DType, shape: Shape, values: &[i64]) -> Result<Self, ValueError> {
        Self::new(
            dtype,
            shape,
            values.iter().copied().map(Literal::I64).collect(),
        )
    }

    pub fn from_bools(shape: Shape, values: &[bool]) -> Result<Self, ValueError> {
        Self::new(
            DType::Bool,
            shape,
            values.iter().copied().map(Literal::Bool).collect(),
        )
    }

    #[must_use]
    pub fn rank0(dtype: DType, literal: Literal) -> Self {
        Self {
            dtype,
            shape: Shape::scalar(),
            elements: vec![literal.cast(dtype)],
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    /// The sole element of a one-element tensor.
    pub fn item(&self) -> Result<Literal, ValueError> {
        match self.elements.as_slice() {
            [only] => Ok(*only),
            _ => Err(ValueError::NotSingleElement {
                shape: self.shape.clone(),
            }),
        }
    }

    #[must_use]
    pub fn cast(&self, dtype: DType) -> Self {
        Self {
            dtype,
            shape: self.shape.clone(),
            elements: self
                .elements
                .iter()
                .map(|literal| literal.cast(dtype))
                .collect(),
        }
    }

    /// Re-rounds floating elements through `precision` while keeping the
    /// declared dtype. Non-floating tensors are returned unchanged.
    #[must_use]
    pub fn round_through(&self, precision: DType) -> Self {
        if !self.dtype.is_floating() || !precision.is_floating() || precision >= self.dtype {
            return self.clone();
        }
        Self {
            dtype: self.dtype,
            shape: self.shape.clone(),
            elements: self
                .elements
                .iter()
                .map(|literal| literal.cast(precision))
                .collect(),
        }
    }

    #[must_use]
    pub fn to_f64_vec(&self) -> Vec<f64> {
        self.elements.iter().copied().map(Literal::as_f64).collect()
    }
}

/// A runtime value: a bare (weakly typed) scalar or a typed tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Value {
    Scalar(Literal),
    Tensor(TensorValue),
}

impl Value {
    #[must_use]
    pub fn scalar_i64(value: i64) -> Self {
        Self::Scalar(Literal::I64(value))
    }

    #[must_use]
    pub fn scalar_f64(value: f64) -> Self {
        Self::Scalar(Literal::from_f64(value))
    }

    #[must_use]
    pub fn scalar_bool(value: bool) -> Self {
        Self::Scalar(Literal::Bool(value))
    }

    pub fn vector_f32(values: &[f32]) -> Result<Self, ValueError> {
        let values = values.iter().copied().map(f64::from).collect::<Vec<_>>();
        Ok(Self::Tensor(TensorValue::from_f64s(
            DType::F32,
            Shape::vector(values.len() as u32),
            &values,
        )?))
    }

    pub fn vector_i64(values: &[i64]) -> Result<Self, ValueError> {
        Ok(Self::Tensor(TensorValue::from_i64s(
            DType::I64,
            Shape::vector(values.len() as u32),
            values,
        )?))
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::Scalar(lit) => lit.natural_dtype(),
            Self::Tensor(tensor) => tensor.dtype,
        }
    }

    #[must_use]
    pub fn as_scalar_literal(&self) -> Option<Literal> {
        match self {
            Self::Scalar(lit) => Some(*lit),
            Self::Tensor(_) => None,
        }
    }

    #[must_use]
    pub fn as_tensor(&self) -> Option<&TensorValue> {
        match self {
            Self::Scalar(_) => None,
            Self::Tensor(tensor) => Some(tensor),
        }
    }

    /// Materialises a bare scalar as a rank-0 tensor of its natural dtype.
    #[must_use]
    pub fn into_tensor(self) -> TensorValue {
        match self {
            Self::Scalar(lit) => TensorValue::rank0(lit.natural_dtype(), lit),
            Self::Tensor(tensor) => tensor,
        }
    }

    /// Truthiness of a scalar or single-element tensor.
    pub fn truthy(&self) -> Result<bool, ValueError> {
        match self {
            Self::Scalar(lit) => Ok(lit.as_bool()),
            Self::Tensor(tensor) => tensor.item().map(Literal::as_bool),
        }
    }
}
