//! Converted model representation.
//!
//! A [`Model`] is a flat list of [`IrNode`]s over a single namespace of
//! [`OutputPort`]s. `If` bodies read ports of the enclosing scope directly and
//! expose their results through the node's own outputs. Element types and
//! shapes are derived by [`Model::validate_nodes_and_infer_types`], which must
//! be re-run after parameters are patched.

use fc_core::{DType, Value};
use fc_kernels::{
    BinaryOp, Operand, OperandRank, UnaryOp, binary_result_dtype, list_tensor_dtype,
    promote_types, reduce_sum_dtype, unary_result_dtype,
};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OutputPort(pub u32);

impl std::fmt::Display for OutputPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "port:{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dimension {
    Static(u32),
    Dynamic,
}

impl Dimension {
    #[must_use]
    pub fn compatible_with(self, dim: u32) -> bool {
        match self {
            Self::Static(expected) => expected == dim,
            Self::Dynamic => true,
        }
    }

    fn merge(self, other: Self) -> Self {
        if self == other { self } else { Self::Dynamic }
    }
}

impl std::fmt::Display for Dimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Static(dim) => write!(f, "{dim}"),
            Self::Dynamic => f.write_str("?"),
        }
    }
}

/// A shape whose rank, dimensions, or both may be unknown.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartialShape {
    /// `None` when even the rank is unknown.
    dims: Option<Vec<Dimension>>,
}

impl PartialShape {
    #[must_use]
    pub fn dynamic() -> Self {
        Self { dims: None }
    }

    /// Known rank, every dimension unknown.
    #[must_use]
    pub fn wildcard(rank: usize) -> Self {
        Self {
            dims: Some(vec![Dimension::Dynamic; rank]),
        }
    }

    #[must_use]
    pub fn from_static(dims: &[u32]) -> Self {
        Self {
            dims: Some(dims.iter().copied().map(Dimension::Static).collect()),
        }
    }

    #[must_use]
    pub fn new(dims: Vec<Dimension>) -> Self {
        Self { dims: Some(dims) }
    }

    #[must_use]
    pub fn rank(&self) -> Option<usize> {
        self.dims.as_ref().map(Vec::len)
    }

    #[must_use]
    pub fn dims(&self) -> Option<&[Dimension]> {
        self.dims.as_deref()
    }

    #[must_use]
    pub fn is_static(&self) -> bool {
        self.dims
            .as_ref()
            .is_some_and(|dims| dims.iter().all(|dim| matches!(dim, Dimension::Static(_))))
    }

    #[must_use]
    pub fn compatible_with(&self, dims: &[u32]) -> bool {
        match &self.dims {
            None => true,
            Some(expected) => {
                expected.len() == dims.len()
                    && expected
                        .iter()
                        .zip(dims)
                        .all(|(pattern, dim)| pattern.compatible_with(*dim))
            }
        }
    }

    fn merge(&self, other: &Self) -> Self {
        match (&self.dims, &other.dims) {
            (Some(a), Some(b)) if a.len() == b.len() => Self {
                dims: Some(a.iter().zip(b).map(|(x, y)| x.merge(*y)).collect()),
            },
            _ => Self::dynamic(),
        }
    }
}

impl std::fmt::Display for PartialShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.dims {
            None => f.write_str("[...]"),
            Some(dims) => {
                let rendered = dims
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(",");
                write!(f, "[{rendered}]")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IrParameter {
    pub name: String,
    /// `None` until the element type is resolved.
    pub element_type: Option<DType>,
    pub partial_shape: PartialShape,
    pub output: OutputPort,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IrOp {
    /// Bare scalar constants stay weakly typed.
    Constant(Value),
    Add,
    Subtract,
    Multiply,
    Divide,
    Greater,
    Negative,
    Relu,
    Exp,
    Tanh,
    Sigmoid,
    MatMul { transpose_b: bool },
    ReduceSum,
    Convert(DType),
    ShapeOf,
    TensorFromList,
    If { then_body: Body, else_body: Body },
}

impl IrOp {
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Constant(_) => "Constant",
            Self::Add => "Add",
            Self::Subtract => "Subtract",
            Self::Multiply => "Multiply",
            Self::Divide => "Divide",
            Self::Greater => "Greater",
            Self::Negative => "Negative",
            Self::Relu => "Relu",
            Self::Exp => "Exp",
            Self::Tanh => "Tanh",
            Self::Sigmoid => "Sigmoid",
            Self::MatMul { .. } => "MatMul",
            Self::ReduceSum => "ReduceSum",
            Self::Convert(_) => "Convert",
            Self::ShapeOf => "ShapeOf",
            Self::TensorFromList => "TensorFromList",
            Self::If { .. } => "If",
        }
    }

    #[must_use]
    pub fn binary_op(&self) -> Option<BinaryOp> {
        Some(match self {
            Self::Add => BinaryOp::Add,
            Self::Subtract => BinaryOp::Sub,
            Self::Multiply => BinaryOp::Mul,
            Self::Divide => BinaryOp::Div,
            Self::Greater => BinaryOp::Gt,
            _ => return None,
        })
    }

    #[must_use]
    pub fn unary_op(&self) -> Option<UnaryOp> {
        Some(match self {
            Self::Negative => UnaryOp::Neg,
            Self::Relu => UnaryOp::Relu,
            Self::Exp => UnaryOp::Exp,
            Self::Tanh => UnaryOp::Tanh,
            Self::Sigmoid => UnaryOp::Sigmoid,
            _ => return None,
        })
    }

    fn input_count(&self) -> usize {
        match self {
            Self::Constant(_) => 0,
            Self::Add
            | Self::Subtract
            | Self::Multiply
            | Self::Divide
            | Self::Greater
            | Self::MatMul { .. } => 2,
            Self::Negative
            | Self::Relu
            | Self::Exp
            | Self::Tanh
            | Self::Sigmoid
            | Self::ReduceSum
            | Self::Convert(_)
            | Self::ShapeOf
            | Self::TensorFromList
            | Self::If { .. } => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IrNode {
    pub op: IrOp,
    pub inputs: SmallVec<[OutputPort; 4]>,
    pub outputs: SmallVec<[OutputPort; 2]>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Body {
    pub nodes: Vec<IrNode>,
    pub results: Vec<OutputPort>,
}

/// Inferred element type and shape of one port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    pub element_type: DType,
    pub shape: PartialShape,
    /// Bare scalar that defers to the other operand during promotion.
    pub weak: bool,
}

impl PortInfo {
    fn operand(&self) -> Operand {
        let rank = if self.weak {
            OperandRank::Scalar
        } else if self.shape.rank() == Some(0) {
            OperandRank::ZeroDim
        } else {
            OperandRank::Dimensioned
        };
        Operand {
            dtype: self.element_type,
            rank,
        }
    }

    fn tensor(element_type: DType, shape: PartialShape) -> Self {
        Self {
            element_type,
            shape,
            weak: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IrError {
    #[error("parameter `{name}` has no element type")]
    DynamicElementType { name: String },
    #[error("input index {index} is out of range for {count} parameters")]
    InputIndex { index: usize, count: usize },
    #[error("{op} reads undefined {port}")]
    UndefinedPort { op: &'static str, port: OutputPort },
    #[error("{port} is defined more than once")]
    DuplicatePort { port: OutputPort },
    #[error("{op} expects {expected} inputs, found {actual}")]
    Arity {
        op: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("{op}: {detail}")]
    TypeInference { op: &'static str, detail: String },
    #[error("{op}: incompatible shapes {left} and {right}")]
    IncompatibleShapes {
        op: &'static str,
        left: PartialShape,
        right: PartialShape,
    },
    #[error("If branches disagree on result {index}: {then_type} vs {else_type}")]
    BranchTypeMismatch {
        index: usize,
        then_type: DType,
        else_type: DType,
    },
    #[error("model result {port} is not defined")]
    UndefinedResult { port: OutputPort },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    pub name: String,
    parameters: Vec<IrParameter>,
    nodes: Vec<IrNode>,
    results: Vec<OutputPort>,
    #[serde(skip)]
    inferred: Option<BTreeMap<OutputPort, PortInfo>>,
}

impl Model {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        parameters: Vec<IrParameter>,
        nodes: Vec<IrNode>,
        results: Vec<OutputPort>,
    ) -> Self {
        Self {
            name: name.into(),
            parameters,
            nodes,
            results,
            inferred: None,
        }
    }

    #[must_use]
    pub fn inputs(&self) -> &[IrParameter] {
        &self.parameters
    }

    #[must_use]
    pub fn nodes(&self) -> &[IrNode] {
        &self.nodes
    }

    #[must_use]
    pub fn outputs(&self) -> &[OutputPort] {
        &self.results
    }

    pub fn set_element_type(&mut self, index: usize, element_type: DType) -> Result<(), IrError> {
        let count = self.parameters.len();
        let parameter = self
            .parameters
            .get_mut(index)
            .ok_or(IrError::InputIndex { index, count })?;
        parameter.element_type = Some(element_type);
        self.inferred = None;
        Ok(())
    }

    pub fn set_partial_shape(&mut self, index: usize, shape: PartialShape) -> Result<(), IrError> {
        let count = self.parameters.len();
        let parameter = self
            .parameters
            .get_mut(index)
            .ok_or(IrError::InputIndex { index, count })?;
        parameter.partial_shape = shape;
        self.inferred = None;
        Ok(())
    }

    #[must_use]
    pub fn is_validated(&self) -> bool {
        self.inferred.is_some()
    }

    /// Inferred info of the `index`-th model result, once validated.
    #[must_use]
    pub fn output_info(&self, index: usize) -> Option<&PortInfo> {
        let port = self.results.get(index)?;
        self.inferred.as_ref()?.get(port)
    }

    /// Whether a node with type name `type_name` exists at any body depth.
    #[must_use]
    pub fn contains_type(&self, type_name: &str) -> bool {
        fn walk(nodes: &[IrNode], type_name: &str) -> bool {
            nodes.iter().any(|node| {
                node.op.type_name() == type_name
                    || match &node.op {
                        IrOp::If {
                            then_body,
                            else_body,
                        } => walk(&then_body.nodes, type_name) || walk(&else_body.nodes, type_name),
                        _ => false,
                    }
            })
        }
        walk(&self.nodes, type_name)
    }

    pub fn validate_nodes_and_infer_types(&mut self) -> Result<(), IrError> {
        let mut ports = BTreeMap::new();
        for parameter in &self.parameters {
            let element_type =
                parameter
                    .element_type
                    .ok_or_else(|| IrError::DynamicElementType {
                        name: parameter.name.clone(),
                    })?;
            define(
                &mut ports,
                parameter.output,
                PortInfo::tensor(element_type, parameter.partial_shape.clone()),
            )?;
        }
        infer_nodes(&self.nodes, &mut ports)?;
        for result in &self.results {
            if !ports.contains_key(result) {
                return Err(IrError::UndefinedResult { port: *result });
            }
        }
        tracing::debug!(
            model = %self.name,
            ports = ports.len(),
            "validated model"
        );
        self.inferred = Some(ports);
        Ok(())
    }
}

fn define(
    ports: &mut BTreeMap<OutputPort, PortInfo>,
    port: OutputPort,
    info: PortInfo,
) -> Result<(), IrError> {
    if ports.insert(port, info).is_some() {
        return Err(IrError::DuplicatePort { port });
    }
    Ok(())
}

fn infer_nodes(
    nodes: &[IrNode],
    ports: &mut BTreeMap<OutputPort, PortInfo>,
) -> Result<(), IrError> {
    for node in nodes {
        let op = node.op.type_name();
        let expected = node.op.input_count();
        if node.inputs.len() != expected {
            return Err(IrError::Arity {
                op,
                expected,
                actual: node.inputs.len(),
            });
        }
        let inputs = node
            .inputs
            .iter()
            .map(|port| {
                ports
                    .get(port)
                    .cloned()
                    .ok_or(IrError::UndefinedPort { op, port: *port })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let infos = match &node.op {
            IrOp::If {
                then_body,
                else_body,
            } => infer_if(then_body, else_body, ports)?,
            other => vec![infer_single(other, &inputs)?],
        };
        if infos.len() != node.outputs.len() {
            return Err(IrError::Arity {
                op,
                expected: infos.len(),
                actual: node.outputs.len(),
            });
        }
        for (port, info) in node.outputs.iter().zip(infos) {
            define(ports, *port, info)?;
        }
    }
    Ok(())
}

fn infer_if(
    then_body: &Body,
    else_body: &Body,
    ports: &mut BTreeMap<OutputPort, PortInfo>,
) -> Result<Vec<PortInfo>, IrError> {
    infer_nodes(&then_body.nodes, ports)?;
    infer_nodes(&else_body.nodes, ports)?;
    if then_body.results.len() != else_body.results.len() {
        return Err(IrError::Arity {
            op: "If",
            expected: then_body.results.len(),
            actual: else_body.results.len(),
        });
    }
    then_body
        .results
        .iter()
        .zip(&else_body.results)
        .enumerate()
        .map(|(index, (a, b))| {
            let then_info = ports
                .get(a)
                .ok_or(IrError::UndefinedPort { op: "If", port: *a })?;
            let else_info = ports
                .get(b)
                .ok_or(IrError::UndefinedPort { op: "If", port: *b })?;
            if then_info.element_type != else_info.element_type {
                return Err(IrError::BranchTypeMismatch {
                    index,
                    then_type: then_info.element_type,
                    else_type: else_info.element_type,
                });
            }
            Ok(PortInfo {
                element_type: then_info.element_type,
                shape: then_info.shape.merge(&else_info.shape),
                weak: then_info.weak && else_info.weak,
            })
        })
        .collect()
}

fn infer_single(op: &IrOp, inputs: &[PortInfo]) -> Result<PortInfo, IrError> {
    let name = op.type_name();
    let type_error = |detail: String| IrError::TypeInference { op: name, detail };

    if let Some(binary) = op.binary_op() {
        let (lhs, rhs) = (&inputs[0], &inputs[1]);
        if lhs.weak && rhs.weak {
            let common = promote_types(lhs.element_type, rhs.element_type);
            let element_type = match binary {
                BinaryOp::Gt => DType::Bool,
                BinaryOp::Div if !common.is_floating() => DType::F64,
                _ => common,
            };
            return Ok(PortInfo {
                element_type,
                shape: PartialShape::from_static(&[]),
                weak: true,
            });
        }
        let element_type = binary_result_dtype(binary, lhs.operand(), rhs.operand())
            .ok_or_else(|| type_error("no result type for operand pair".to_owned()))?;
        let shape = broadcast_partial(name, &lhs.shape, &rhs.shape)?;
        return Ok(PortInfo::tensor(element_type, shape));
    }

    if let Some(unary) = op.unary_op() {
        let input = &inputs[0];
        let element_type = unary_result_dtype(unary, input.element_type)
            .map_err(|err| type_error(err.to_string()))?;
        return Ok(PortInfo {
            element_type,
            shape: input.shape.clone(),
            weak: input.weak,
        });
    }

    match op {
        IrOp::Constant(Value::Scalar(lit)) => Ok(PortInfo {
            element_type: lit.natural_dtype(),
            shape: PartialShape::from_static(&[]),
            weak: true,
        }),
        IrOp::Constant(Value::Tensor(tensor)) => Ok(PortInfo::tensor(
            tensor.dtype,
            PartialShape::from_static(&tensor.shape.dims),
        )),
        IrOp::MatMul { transpose_b } => infer_matmul(*transpose_b, &inputs[0], &inputs[1]),
        IrOp::ReduceSum => {
            let input = require_tensor(name, &inputs[0])?;
            Ok(PortInfo::tensor(
                reduce_sum_dtype(input.element_type),
                PartialShape::from_static(&[]),
            ))
        }
        IrOp::Convert(dtype) => {
            let input = &inputs[0];
            let shape = if input.weak {
                PartialShape::from_static(&[])
            } else {
                input.shape.clone()
            };
            Ok(PortInfo::tensor(*dtype, shape))
        }
        IrOp::ShapeOf => {
            let input = require_tensor(name, &inputs[0])?;
            let length = match input.shape.rank() {
                Some(rank) => Dimension::Static(rank as u32),
                None => Dimension::Dynamic,
            };
            Ok(PortInfo::tensor(DType::I64, PartialShape::new(vec![length])))
        }
        IrOp::TensorFromList => {
            let input = &inputs[0];
            let shape = if input.weak {
                PartialShape::from_static(&[])
            } else {
                match input.shape.rank() {
                    Some(1) | None => input.shape.clone(),
                    Some(rank) => {
                        return Err(type_error(format!("expected a rank-1 list, got rank {rank}")));
                    }
                }
            };
            Ok(PortInfo::tensor(list_tensor_dtype(input.element_type), shape))
        }
        _ => Err(type_error("unexpected operator".to_owned())),
    }
}

fn require_tensor<'a>(op: &'static str, info: &'a PortInfo) -> Result<&'a PortInfo, IrError> {
    if info.weak {
        return Err(IrError::TypeInference {
            op,
            detail: "expected a tensor operand, got a scalar".to_owned(),
        });
    }
    Ok(info)
}

fn broadcast_partial(
    op: &'static str,
    lhs: &PartialShape,
    rhs: &PartialShape,
) -> Result<PartialShape, IrError> {
    let (Some(a), Some(b)) = (lhs.dims(), rhs.dims()) else {
        return Ok(PartialShape::dynamic());
    };
    let rank = a.len().max(b.len());
    let pad = |dims: &[Dimension], axis: usize| {
        let offset = rank - dims.len();
        if axis < offset {
            Dimension::Static(1)
        } else {
            dims[axis - offset]
        }
    };
    let mut out = Vec::with_capacity(rank);
    for axis in 0..rank {
        let dim = match (pad(a, axis), pad(b, axis)) {
            (x, y) if x == y => x,
            (Dimension::Static(1), other) | (other, Dimension::Static(1)) => other,
            (Dimension::Dynamic, Dimension::Static(n)) | (Dimension::Static(n), Dimension::Dynamic) => {
                Dimension::Static(n)
            }
            _ => {
                return Err(IrError::IncompatibleShapes {
                    op,
                    left: lhs.clone(),
                    right: rhs.clone(),
                });
            }
        };
        out.push(dim);
    }
    Ok(PartialShape::new(out))
}

fn infer_matmul(transpose_b: bool, lhs: &PortInfo, rhs: &PortInfo) -> Result<PortInfo, IrError> {
    let op = "MatMul";
    require_tensor(op, lhs)?;
    require_tensor(op, rhs)?;
    let element_type = promote_types(lhs.element_type, rhs.element_type);
    let (Some(a), Some(b)) = (lhs.shape.dims(), rhs.shape.dims()) else {
        return Ok(PortInfo::tensor(element_type, PartialShape::dynamic()));
    };
    let mismatch = || IrError::IncompatibleShapes {
        op,
        left: lhs.shape.clone(),
        right: rhs.shape.clone(),
    };
    let (m, k_lhs) = match a {
        [k] => (None, *k),
        [m, k] => (Some(*m), *k),
        _ => return Err(mismatch()),
    };
    let (k_rhs, n) = match (b, transpose_b) {
        ([k], _) => (*k, None),
        ([k, n], false) => (*k, Some(*n)),
        ([n, k], true) => (*k, Some(*n)),
        _ => return Err(mismatch()),
    };
    if let (Dimension::Static(x), Dimension::Static(y)) = (k_lhs, k_rhs)
        && x != y
    {
        return Err(mismatch());
    }
    let dims = m.into_iter().chain(n).collect();
    Ok(PortInfo::tensor(element_type, PartialShape::new(dims)))
}
