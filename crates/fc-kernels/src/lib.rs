#![forbid(unsafe_code)]

mod arithmetic;
mod broadcast;
mod reduction;
mod type_promotion;

use fc_core::{DType, Literal, Value, ValueError};
use serde::{Deserialize, Serialize};

pub use arithmetic::{binary_result_dtype, unary_result_dtype};
pub use broadcast::broadcast_shapes;
pub use reduction::{list_tensor_dtype, reduce_sum_dtype};
pub use type_promotion::{Operand, OperandRank, promote_operands, promote_types};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KernelError {
    #[error("type mismatch for {op}: {detail}")]
    TypeMismatch { op: &'static str, detail: String },
    #[error("shape mismatch for {op}: left={left:?} right={right:?}")]
    ShapeMismatch {
        op: &'static str,
        left: Vec<u32>,
        right: Vec<u32>,
    },
    #[error("{op} does not support rank {rank}")]
    RankUnsupported { op: &'static str, rank: usize },
    #[error("invalid tensor: {0}")]
    InvalidTensor(#[from] ValueError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Gt,
}

impl BinaryOp {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::Gt => "gt",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Relu,
    Exp,
    Tanh,
    Sigmoid,
}

impl UnaryOp {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Neg => "neg",
            Self::Relu => "relu",
            Self::Exp => "exp",
            Self::Tanh => "tanh",
            Self::Sigmoid => "sigmoid",
        }
    }
}

/// Elementwise binary op with broadcasting and scalar/zero-dim promotion.
#[inline]
pub fn eval_binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, KernelError> {
    arithmetic::eval_binary(op, lhs, rhs)
}

#[inline]
pub fn eval_unary(op: UnaryOp, input: &Value) -> Result<Value, KernelError> {
    arithmetic::eval_unary(op, input)
}

/// Matrix product of rank-1/rank-2 tensors. `transpose_rhs` reads `rhs` as
/// `[n, k]`, which is how linear-layer weights are stored.
pub fn eval_matmul(lhs: &Value, rhs: &Value, transpose_rhs: bool) -> Result<Value, KernelError> {
    reduction::eval_matmul(lhs, rhs, transpose_rhs)
}

/// Sum over every element into a rank-0 tensor.
pub fn eval_reduce_sum(input: &Value) -> Result<Value, KernelError> {
    reduction::eval_reduce_sum(input)
}

#[must_use]
pub fn eval_cast(input: &Value, dtype: DType) -> Value {
    match input {
        Value::Scalar(lit) => Value::Tensor(fc_core::TensorValue::rank0(dtype, *lit)),
        Value::Tensor(tensor) => Value::Tensor(tensor.cast(dtype)),
    }
}

/// Builds a 1-D tensor from a list of scalars using list-construction typing.
pub fn eval_tensor_from_list(elements: &[Literal]) -> Result<Value, KernelError> {
    reduction::eval_tensor_from_list(elements)
}

/// Same typing as [`eval_tensor_from_list`] but for a list that has already
/// been materialised as a 1-D tensor.
pub fn eval_tensor_from_array(input: &Value) -> Result<Value, KernelError> {
    match input {
        Value::Tensor(tensor) if tensor.rank() == 1 => Ok(Value::Tensor(
            tensor.cast(list_tensor_dtype(tensor.dtype)),
        )),
        Value::Tensor(tensor) => Err(KernelError::RankUnsupported {
            op: "tensor_from_list",
            rank: tensor.rank(),
        }),
        Value::Scalar(_) => Err(KernelError::TypeMismatch {
            op: "tensor_from_list",
            detail: "expected a list, got a scalar".to_owned(),
        }),
    }
}
