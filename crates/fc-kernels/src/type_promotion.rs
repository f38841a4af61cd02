use fc_core::{DType, TypeCategory, Value};

/// How strongly an operand participates in result-type selection.
///
/// Dimensioned tensors dominate zero-dim tensors, which dominate bare
/// scalars, unless the weaker operand belongs to a higher type category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OperandRank {
    Scalar,
    ZeroDim,
    Dimensioned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operand {
    pub dtype: DType,
    pub rank: OperandRank,
}

impl Operand {
    #[must_use]
    pub fn new(dtype: DType, rank: OperandRank) -> Self {
        Self { dtype, rank }
    }

    #[must_use]
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Scalar(lit) => Self::new(lit.natural_dtype(), OperandRank::Scalar),
            Value::Tensor(tensor) if tensor.rank() == 0 => {
                Self::new(tensor.dtype, OperandRank::ZeroDim)
            }
            Value::Tensor(tensor) => Self::new(tensor.dtype, OperandRank::Dimensioned),
        }
    }
}

/// Symmetric promotion of two concrete dtypes.
#[must_use]
pub fn promote_types(lhs: DType, rhs: DType) -> DType {
    if lhs == rhs {
        return lhs;
    }
    match (lhs.category(), rhs.category()) {
        (TypeCategory::Bool, _) => rhs,
        (_, TypeCategory::Bool) => lhs,
        (TypeCategory::Floating, TypeCategory::Floating) => {
            if matches!((lhs, rhs), (DType::F16, DType::BF16) | (DType::BF16, DType::F16)) {
                DType::F32
            } else {
                lhs.max(rhs)
            }
        }
        (TypeCategory::Floating, _) => lhs,
        (_, TypeCategory::Floating) => rhs,
        (TypeCategory::Integral, TypeCategory::Integral) => promote_integral(lhs, rhs),
    }
}

fn promote_integral(lhs: DType, rhs: DType) -> DType {
    match (lhs, rhs) {
        (DType::U8, DType::I8) | (DType::I8, DType::U8) => DType::I16,
        (DType::U8, other) | (other, DType::U8) => other,
        _ => lhs.max(rhs),
    }
}

fn category_default(category: TypeCategory) -> DType {
    match category {
        TypeCategory::Bool => DType::Bool,
        TypeCategory::Integral => DType::I64,
        TypeCategory::Floating => DType::F32,
    }
}

/// Result dtype of mixing two operands before any op-specific adjustment.
#[must_use]
pub fn promote_operands(lhs: Operand, rhs: Operand) -> DType {
    if lhs.rank == rhs.rank {
        return promote_types(lhs.dtype, rhs.dtype);
    }
    let (strong, weak) = if lhs.rank > rhs.rank {
        (lhs, rhs)
    } else {
        (rhs, lhs)
    };
    if weak.dtype.category() > strong.dtype.category() {
        match weak.rank {
            OperandRank::Scalar => category_default(weak.dtype.category()),
            _ => weak.dtype,
        }
    } else {
        strong.dtype
    }
}
