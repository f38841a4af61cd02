#![forbid(unsafe_code)]

//! Framework runtime used as the reference side of equivalence tests.
//!
//! A [`Module`] describes its computation as a [`Graph`]. The graph can be
//! captured into a [`ScriptModule`] either by scripting ([`script`]), which
//! keeps control flow, or by tracing ([`trace`]), which records only the
//! path taken for one set of example inputs. Captured modules execute through
//! the reference interpreter.

mod capture;
pub mod grad;
pub mod graph;
mod interpreter;

use fc_core::{Literal, TensorValue, Value, ValueError};
use fc_kernels::KernelError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use capture::{CaptureMode, ScriptModule, script, trace};
pub use grad::{NoGradGuard, is_grad_enabled};
pub use graph::{
    Attr, Block, Graph, GraphBuilder, GraphInput, GraphValidationError, Node, NodeKind, ValueId,
};
pub use interpreter::evaluate_node;

/// A runtime value flowing through a captured graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IValue {
    None,
    Scalar(Literal),
    Tensor(TensorValue),
    /// Homogeneous list of scalars, e.g. the result of `aten::size`.
    ScalarList(Vec<Literal>),
    List(Vec<IValue>),
    Tuple(Vec<IValue>),
}

impl IValue {
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

    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Scalar(_) => "Scalar",
            Self::Tensor(_) => "Tensor",
            Self::ScalarList(_) => "ScalarList",
            Self::List(_) => "List",
            Self::Tuple(_) => "Tuple",
        }
    }

    /// Kernel operand view; only scalars and tensors qualify.
    #[must_use]
    pub fn as_value(&self) -> Option<Value> {
        match self {
            Self::Scalar(lit) => Some(Value::Scalar(*lit)),
            Self::Tensor(tensor) => Some(Value::Tensor(tensor.clone())),
            _ => None,
        }
    }
}

impl From<Value> for IValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Scalar(lit) => Self::Scalar(lit),
            Value::Tensor(tensor) => Self::Tensor(tensor),
        }
    }
}

impl From<TensorValue> for IValue {
    fn from(tensor: TensorValue) -> Self {
        Self::Tensor(tensor)
    }
}

impl std::fmt::Display for IValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn join<T: std::fmt::Display>(items: &[T]) -> String {
            items
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        }
        match self {
            Self::None => f.write_str("None"),
            Self::Scalar(lit) => write!(f, "{lit}"),
            Self::Tensor(tensor) => write!(
                f,
                "Tensor<{}{:?}>[{}]",
                tensor.dtype,
                tensor.shape.dims,
                join(&tensor.elements)
            ),
            Self::ScalarList(items) => write!(f, "[{}]", join(items)),
            Self::List(items) => write!(f, "[{}]", join(items)),
            Self::Tuple(items) => write!(f, "({})", join(items)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScriptError {
    #[error("expected {expected} inputs, got {actual}")]
    InputArity { expected: usize, actual: usize },
    #[error("value {0} was read before it was bound")]
    MissingValue(ValueId),
    #[error("{kind} is missing operand #{index}")]
    MissingOperand { kind: NodeKind, index: usize },
    #[error("{kind} is missing attribute `{attr}`")]
    MissingAttribute { kind: NodeKind, attr: &'static str },
    #[error("module has no parameter named `{0}`")]
    UnknownParameter(String),
    #[error("{kind} cannot take a {found} operand")]
    OperandKind { kind: NodeKind, found: &'static str },
    #[error("{kind} is not supported in training mode; call eval() first")]
    TrainingOnly { kind: NodeKind },
    #[error("module definition failed: {0}")]
    Definition(String),
    #[error(transparent)]
    Kernel(#[from] KernelError),
    #[error(transparent)]
    Validation(#[from] GraphValidationError),
    #[error(transparent)]
    Value(#[from] ValueError),
}

/// A framework module: a named computation with parameters and a
/// training/evaluation mode.
pub trait Module {
    fn name(&self) -> &str;

    /// The module's computation as a static graph.
    fn definition(&self) -> Result<Graph, ScriptError>;

    fn parameters(&self) -> BTreeMap<String, TensorValue> {
        BTreeMap::new()
    }

    fn training(&self) -> bool;

    fn set_training(&mut self, training: bool);

    fn eval(&mut self) {
        self.set_training(false);
    }
}

/// Stock [`Module`] built from an explicit graph. Starts in training mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphModule {
    name: String,
    graph: Graph,
    params: BTreeMap<String, TensorValue>,
    training: bool,
}

impl GraphModule {
    #[must_use]
    pub fn new(name: impl Into<String>, graph: Graph) -> Self {
        Self {
            name: name.into(),
            graph,
            params: BTreeMap::new(),
            training: true,
        }
    }

    #[must_use]
    pub fn with_parameter(mut self, name: impl Into<String>, value: TensorValue) -> Self {
        self.params.insert(name.into(), value);
        self
    }
}

impl Module for GraphModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn definition(&self) -> Result<Graph, ScriptError> {
        Ok(self.graph.clone())
    }

    fn parameters(&self) -> BTreeMap<String, TensorValue> {
        self.params.clone()
    }

    fn training(&self) -> bool {
        self.training
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }
}
