use fc_core::{Literal, TensorValue};
use fc_script::IValue;
use serde::{Deserialize, Serialize};

/// One flattened reference output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReferenceOutput {
    Scalar(Literal),
    List(Vec<Literal>),
    Tensor(TensorValue),
}

impl ReferenceOutput {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Scalar(_) => "scalar",
            Self::List(_) => "list",
            Self::Tensor(_) => "tensor",
        }
    }

    /// Numeric view used by the closeness check.
    #[must_use]
    pub fn to_f64_vec(&self) -> Vec<f64> {
        match self {
            Self::Scalar(lit) => vec![lit.as_f64()],
            Self::List(items) => items.iter().map(|lit| lit.as_f64()).collect(),
            Self::Tensor(tensor) => tensor.to_f64_vec(),
        }
    }
}

/// Expands tuples and generic lists depth-first and drops `None`. Scalar
/// lists stay single outputs.
#[must_use]
pub fn flatten_reference(value: &IValue) -> Vec<ReferenceOutput> {
    let mut out = Vec::new();
    flatten_into(value, &mut out);
    out
}

fn flatten_into(value: &IValue, out: &mut Vec<ReferenceOutput>) {
    match value {
        IValue::None => {}
        IValue::Scalar(lit) => out.push(ReferenceOutput::Scalar(*lit)),
        IValue::Tensor(tensor) => out.push(ReferenceOutput::Tensor(tensor.clone())),
        IValue::ScalarList(items) => out.push(ReferenceOutput::List(items.clone())),
        IValue::List(items) | IValue::Tuple(items) => {
            for item in items {
                flatten_into(item, out);
            }
        }
    }
}
