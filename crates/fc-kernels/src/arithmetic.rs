use fc_core::{DType, Literal, Shape, TensorValue, Value};

use crate::broadcast::{broadcast_shapes, broadcast_source_indices};
use crate::type_promotion::{Operand, OperandRank, promote_operands, promote_types};
use crate::{BinaryOp, KernelError, UnaryOp};

/// Result dtype of a binary op; `None` for two bare scalars, which stay
/// weakly typed.
pub fn binary_result_dtype(op: BinaryOp, lhs: Operand, rhs: Operand) -> Option<DType> {
    if lhs.rank == OperandRank::Scalar && rhs.rank == OperandRank::Scalar {
        return None;
    }
    let common = promote_operands(lhs, rhs);
    Some(match op {
        BinaryOp::Gt => DType::Bool,
        BinaryOp::Div if !common.is_floating() => DType::F32,
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => common,
    })
}

pub fn unary_result_dtype(op: UnaryOp, input: DType) -> Result<DType, KernelError> {
    match op {
        UnaryOp::Neg | UnaryOp::Relu => {
            if input == DType::Bool {
                Err(KernelError::TypeMismatch {
                    op: op.as_str(),
                    detail: "boolean operands are not supported".to_owned(),
                })
            } else {
                Ok(input)
            }
        }
        UnaryOp::Exp | UnaryOp::Tanh | UnaryOp::Sigmoid => {
            Ok(if input.is_floating() { input } else { DType::F32 })
        }
    }
}

pub(crate) fn eval_binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, KernelError> {
    if let (Value::Scalar(left), Value::Scalar(right)) = (lhs, rhs) {
        let compute = promote_types(left.natural_dtype(), right.natural_dtype());
        return Ok(Value::Scalar(apply_binary(op, *left, *right, compute)));
    }

    let result_dtype = binary_result_dtype(op, Operand::of(lhs), Operand::of(rhs)).ok_or(
        KernelError::TypeMismatch {
            op: op.as_str(),
            detail: "no result type for operand pair".to_owned(),
        },
    )?;

    let (lhs_dims, lhs_elements) = dims_and_elements(lhs);
    let (rhs_dims, rhs_elements) = dims_and_elements(rhs);
    let out_dims =
        broadcast_shapes(lhs_dims, rhs_dims).ok_or_else(|| KernelError::ShapeMismatch {
            op: op.as_str(),
            left: lhs_dims.to_vec(),
            right: rhs_dims.to_vec(),
        })?;

    let compute = match op {
        BinaryOp::Gt => promote_operands(Operand::of(lhs), Operand::of(rhs)),
        _ => result_dtype,
    };
    let lhs_index = broadcast_source_indices(lhs_dims, &out_dims);
    let rhs_index = broadcast_source_indices(rhs_dims, &out_dims);
    let elements = lhs_index
        .iter()
        .zip(rhs_index.iter())
        .map(|(l, r)| {
            let left = lhs_elements[*l].cast(compute);
            let right = rhs_elements[*r].cast(compute);
            apply_binary(op, left, right, compute)
        })
        .collect::<Vec<_>>();

    Ok(Value::Tensor(TensorValue::new(
        result_dtype,
        Shape::new(out_dims),
        elements,
    )?))
}

fn dims_and_elements(value: &Value) -> (&[u32], &[Literal]) {
    match value {
        Value::Scalar(lit) => (&[], std::slice::from_ref(lit)),
        Value::Tensor(tensor) => (&tensor.shape.dims, &tensor.elements),
    }
}

fn apply_binary(op: BinaryOp, left: Literal, right: Literal, compute: DType) -> Literal {
    if compute.is_floating() || op == BinaryOp::Div {
        let (a, b) = (left.as_f64(), right.as_f64());
        return match op {
            BinaryOp::Add => Literal::from_f64(a + b),
            BinaryOp::Sub => Literal::from_f64(a - b),
            BinaryOp::Mul => Literal::from_f64(a * b),
            BinaryOp::Div => Literal::from_f64(a / b),
            BinaryOp::Gt => Literal::Bool(a > b),
        };
    }

    let (a, b) = (left.as_i64().unwrap_or(0), right.as_i64().unwrap_or(0));
    let raw = match op {
        BinaryOp::Add => a.wrapping_add(b),
        BinaryOp::Sub => a.wrapping_sub(b),
        BinaryOp::Mul => a.wrapping_mul(b),
        BinaryOp::Gt => return Literal::Bool(a > b),
        BinaryOp::Div => return Literal::from_f64(a as f64 / b as f64),
    };
    if compute == DType::Bool {
        Literal::Bool(raw != 0)
    } else {
        Literal::I64(raw)
    }
}

pub(crate) fn eval_unary(op: UnaryOp, input: &Value) -> Result<Value, KernelError> {
    match input {
        Value::Scalar(lit) => {
            let dtype = unary_result_dtype(op, lit.natural_dtype())?;
            let out = apply_unary(op, *lit, dtype);
            Ok(Value::Scalar(if dtype.is_floating() {
                Literal::from_f64(out.as_f64())
            } else {
                out
            }))
        }
        Value::Tensor(tensor) => {
            let dtype = unary_result_dtype(op, tensor.dtype)?;
            let elements = tensor
                .elements
                .iter()
                .map(|lit| apply_unary(op, *lit, dtype))
                .collect();
            Ok(Value::Tensor(TensorValue::new(
                dtype,
                tensor.shape.clone(),
                elements,
            )?))
        }
    }
}

fn apply_unary(op: UnaryOp, input: Literal, dtype: DType) -> Literal {
    if !dtype.is_floating() {
        let value = input.as_i64().unwrap_or(0);
        return Literal::I64(match op {
            UnaryOp::Neg => value.wrapping_neg(),
            _ => value.max(0),
        });
    }
    let x = input.as_f64();
    Literal::from_f64(match op {
        UnaryOp::Neg => -x,
        UnaryOp::Relu => {
            if x > 0.0 || x.is_nan() {
                x
            } else {
                0.0
            }
        }
        UnaryOp::Exp => x.exp(),
        UnaryOp::Tanh => x.tanh(),
        UnaryOp::Sigmoid => 1.0 / (1.0 + (-x).exp()),
    })
}
