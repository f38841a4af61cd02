use fc_core::{DType, Literal, Shape, TensorValue, Value};

use crate::KernelError;
use crate::type_promotion::promote_types;

/// Integral and boolean sums accumulate into int64.
#[must_use]
pub fn reduce_sum_dtype(input: DType) -> DType {
    if input.is_floating() {
        input
    } else {
        DType::I64
    }
}

/// Element type of a tensor built from a list whose elements have `element`.
#[must_use]
pub fn list_tensor_dtype(element: DType) -> DType {
    match element.category() {
        fc_core::TypeCategory::Bool => DType::Bool,
        fc_core::TypeCategory::Integral => DType::I64,
        fc_core::TypeCategory::Floating => DType::F32,
    }
}

pub(crate) fn eval_reduce_sum(input: &Value) -> Result<Value, KernelError> {
    let Value::Tensor(tensor) = input else {
        return Err(KernelError::TypeMismatch {
            op: "sum",
            detail: "expected a tensor operand".to_owned(),
        });
    };
    let dtype = reduce_sum_dtype(tensor.dtype);
    let total = if dtype.is_floating() {
        Literal::from_f64(tensor.elements.iter().map(|lit| lit.as_f64()).sum())
    } else {
        Literal::I64(
            tensor
                .elements
                .iter()
                .map(|lit| lit.as_i64().unwrap_or(0))
                .fold(0_i64, i64::wrapping_add),
        )
    };
    Ok(Value::Tensor(TensorValue::rank0(dtype, total)))
}

pub(crate) fn eval_matmul(
    lhs: &Value,
    rhs: &Value,
    transpose_rhs: bool,
) -> Result<Value, KernelError> {
    let (Value::Tensor(a), Value::Tensor(b)) = (lhs, rhs) else {
        return Err(KernelError::TypeMismatch {
            op: "matmul",
            detail: "both operands must be tensors".to_owned(),
        });
    };
    // Rank-1 operands are promoted to a row (lhs) or column (rhs) and the
    // inserted axis is dropped from the result.
    let (m, k) = match a.shape.dims.as_slice() {
        [k] => (1, *k as usize),
        [m, k] => (*m as usize, *k as usize),
        dims => {
            return Err(KernelError::RankUnsupported {
                op: "matmul",
                rank: dims.len(),
            });
        }
    };
    // (k, n, stride along k, stride along n) for reading rhs.
    let (k_rhs, n, k_stride, n_stride) = match (b.shape.dims.as_slice(), transpose_rhs) {
        ([k], _) => (*k as usize, 1, 1, 0),
        ([k, n], false) => (*k as usize, *n as usize, *n as usize, 1),
        ([n, k], true) => (*k as usize, *n as usize, 1, *k as usize),
        (dims, _) => {
            return Err(KernelError::RankUnsupported {
                op: "matmul",
                rank: dims.len(),
            });
        }
    };
    if k != k_rhs {
        return Err(KernelError::ShapeMismatch {
            op: "matmul",
            left: a.shape.dims.clone(),
            right: b.shape.dims.clone(),
        });
    }

    let dtype = promote_types(a.dtype, b.dtype);
    let mut elements = Vec::with_capacity(m * n);
    for row in 0..m {
        for col in 0..n {
            let lit = if dtype.is_floating() {
                Literal::from_f64(
                    (0..k)
                        .map(|i| {
                            a.elements[row * k + i].as_f64()
                                * b.elements[i * k_stride + col * n_stride].as_f64()
                        })
                        .sum(),
                )
            } else {
                Literal::I64((0..k).fold(0_i64, |acc, i| {
                    let x = a.elements[row * k + i].as_i64().unwrap_or(0);
                    let y = b.elements[i * k_stride + col * n_stride].as_i64().unwrap_or(0);
                    acc.wrapping_add(x.wrapping_mul(y))
                }))
            };
            elements.push(lit);
        }
    }

    let mut dims = Vec::with_capacity(2);
    if a.rank() == 2 {
        dims.push(m as u32);
    }
    if b.rank() == 2 {
        dims.push(n as u32);
    }
    Ok(Value::Tensor(TensorValue::new(
        dtype,
        Shape::new(dims),
        elements,
    )?))
}

pub(crate) fn eval_tensor_from_list(elements: &[Literal]) -> Result<Value, KernelError> {
    let element_dtype = elements
        .iter()
        .map(|lit| lit.natural_dtype())
        .reduce(promote_types)
        .unwrap_or(DType::F32);
    Ok(Value::Tensor(TensorValue::new(
        list_tensor_dtype(element_dtype),
        Shape::vector(elements.len() as u32),
        elements.to_vec(),
    )?))
}

#[cfg(test)]
mod tests {
    use crate::{eval_matmul, eval_reduce_sum, eval_tensor_from_list};
    use fc_core::{DType, Literal, Shape, TensorValue, Value};

    fn tensor(dtype: DType, dims: &[u32], values: &[f64]) -> Value {
        Value::Tensor(
            TensorValue::from_f64s(dtype, Shape::new(dims.to_vec()), values)
                .expect("tensor should build"),
        )
    }

    #[test]
    fn matmul_two_by_two() {
        let a = tensor(DType::F32, &[2, 2], &[1.0, 2.0, 3.0, 4.0]);
        let b = tensor(DType::F32, &[2, 2], &[5.0, 6.0, 7.0, 8.0]);
        let out = eval_matmul(&a, &b, false).expect("matmul");
        assert_eq!(out, tensor(DType::F32, &[2, 2], &[19.0, 22.0, 43.0, 50.0]));
    }

    #[test]
    fn matmul_transposed_rhs_matches_linear_weights() {
        let x = tensor(DType::F32, &[1, 3], &[1.0, 2.0, 3.0]);
        let w = tensor(DType::F32, &[2, 3], &[1.0, 0.0, 0.0, 0.0, 1.0, 1.0]);
        let out = eval_matmul(&x, &w, true).expect("matmul");
        assert_eq!(out, tensor(DType::F32, &[1, 2], &[1.0, 5.0]));
    }

    #[test]
    fn matmul_vector_dot_is_rank0() {
        let a = tensor(DType::F64, &[3], &[1.0, 2.0, 3.0]);
        let out = eval_matmul(&a, &a, false).expect("dot");
        assert_eq!(out, tensor(DType::F64, &[], &[14.0]));
    }

    #[test]
    fn matmul_rejects_inner_dimension_mismatch() {
        let a = tensor(DType::F32, &[2, 3], &[0.0; 6]);
        let b = tensor(DType::F32, &[2, 3], &[0.0; 6]);
        assert!(eval_matmul(&a, &b, false).is_err());
    }

    #[test]
    fn integer_sum_widens_to_int64() {
        let x = Value::Tensor(
            TensorValue::from_i64s(DType::I32, Shape::vector(3), &[1, 2, 3]).expect("tensor"),
        );
        let out = eval_reduce_sum(&x).expect("sum");
        assert_eq!(out, Value::Tensor(TensorValue::rank0(DType::I64, Literal::I64(6))));
        assert!(eval_reduce_sum(&Value::scalar_i64(1)).is_err());
    }

    #[test]
    fn list_typing_prefers_int64_and_float32() {
        let ints = eval_tensor_from_list(&[Literal::I64(1), Literal::I64(2)]).expect("ints");
        assert_eq!(ints.dtype(), DType::I64);
        let floats =
            eval_tensor_from_list(&[Literal::I64(1), Literal::from_f64(0.5)]).expect("floats");
        assert_eq!(floats.dtype(), DType::F32);
    }
}
