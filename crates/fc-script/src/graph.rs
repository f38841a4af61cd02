//! Static graph representation produced by scripting or tracing a module.
//!
//! Graphs are in SSA form: every [`ValueId`] is bound exactly once, either as
//! a graph input or as a node output. Nested [`Block`]s (the branches of
//! `prim::If`) may read values bound in enclosing scopes, but their own
//! bindings are only visible to the outside through the owning node's
//! outputs.

use fc_core::DType;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;

use crate::IValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ValueId(pub u32);

impl std::fmt::Display for ValueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "%{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    // Structural
    Constant,
    GetAttr,
    ListConstruct,
    TupleConstruct,
    If,
    // Elementwise
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    Relu,
    Exp,
    Tanh,
    Sigmoid,
    Gt,
    // Linear algebra and reductions
    MatMul,
    Linear,
    Sum,
    // Type and shape
    To,
    Size,
    Tensor,
    // Training-mode sensitive
    Dropout,
}

impl NodeKind {
    pub const ALL: [NodeKind; 22] = [
        NodeKind::Constant,
        NodeKind::GetAttr,
        NodeKind::ListConstruct,
        NodeKind::TupleConstruct,
        NodeKind::If,
        NodeKind::Add,
        NodeKind::Sub,
        NodeKind::Mul,
        NodeKind::Div,
        NodeKind::Neg,
        NodeKind::Relu,
        NodeKind::Exp,
        NodeKind::Tanh,
        NodeKind::Sigmoid,
        NodeKind::Gt,
        NodeKind::MatMul,
        NodeKind::Linear,
        NodeKind::Sum,
        NodeKind::To,
        NodeKind::Size,
        NodeKind::Tensor,
        NodeKind::Dropout,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Constant => "prim::Constant",
            Self::GetAttr => "prim::GetAttr",
            Self::ListConstruct => "prim::ListConstruct",
            Self::TupleConstruct => "prim::TupleConstruct",
            Self::If => "prim::If",
            Self::Add => "aten::add",
            Self::Sub => "aten::sub",
            Self::Mul => "aten::mul",
            Self::Div => "aten::div",
            Self::Neg => "aten::neg",
            Self::Relu => "aten::relu",
            Self::Exp => "aten::exp",
            Self::Tanh => "aten::tanh",
            Self::Sigmoid => "aten::sigmoid",
            Self::Gt => "aten::gt",
            Self::MatMul => "aten::matmul",
            Self::Linear => "aten::linear",
            Self::Sum => "aten::sum",
            Self::To => "aten::to",
            Self::Size => "aten::size",
            Self::Tensor => "aten::tensor",
            Self::Dropout => "aten::dropout",
        }
    }

    #[must_use]
    pub fn from_qualified(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }

    /// Pure nodes can be folded when every input is a constant.
    #[must_use]
    pub fn is_pure(self) -> bool {
        !matches!(
            self,
            Self::Constant
                | Self::GetAttr
                | Self::If
                | Self::ListConstruct
                | Self::TupleConstruct
                | Self::Dropout
        )
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Attr {
    Value(IValue),
    Str(String),
    DType(DType),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub kind: NodeKind,
    pub inputs: SmallVec<[ValueId; 4]>,
    pub outputs: SmallVec<[ValueId; 2]>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, Attr>,
    /// Nested blocks; for `prim::If`: `[then_block, else_block]`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocks: Vec<Block>,
}

impl Node {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.kind.as_str()
    }

    #[must_use]
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    #[must_use]
    pub fn attr(&self, name: &str) -> Option<&Attr> {
        self.attrs.get(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Block {
    pub nodes: Vec<Node>,
    pub outputs: Vec<ValueId>,
}

impl Block {
    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    #[must_use]
    pub fn contains_kind(&self, kind: &str) -> bool {
        contains_kind(&self.nodes, kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphInput {
    pub id: ValueId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Graph {
    pub inputs: Vec<GraphInput>,
    pub nodes: Vec<Node>,
    pub outputs: Vec<ValueId>,
}

fn contains_kind(nodes: &[Node], kind: &str) -> bool {
    nodes.iter().any(|node| {
        node.kind() == kind || node.blocks().iter().any(|block| block.contains_kind(kind))
    })
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphValidationError {
    #[error("duplicate binding of {var} in {section}")]
    DuplicateBinding { section: &'static str, var: ValueId },
    #[error("{kind} node reads unbound value {var}")]
    UnboundInput { kind: NodeKind, var: ValueId },
    #[error("graph output {var} is not bound")]
    UnknownOutput { var: ValueId },
    #[error("{kind} expects {expected} blocks, found {actual}")]
    BlockCount {
        kind: NodeKind,
        expected: usize,
        actual: usize,
    },
    #[error("{kind} block yields {actual} values but the node has {expected} outputs")]
    BlockArity {
        kind: NodeKind,
        expected: usize,
        actual: usize,
    },
    #[error("{kind} expects {expected} inputs, found {actual}")]
    InputArity {
        kind: NodeKind,
        expected: usize,
        actual: usize,
    },
}

impl Graph {
    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Whether any node, at any block depth, has the qualified kind `kind`.
    #[must_use]
    pub fn contains_kind(&self, kind: &str) -> bool {
        contains_kind(&self.nodes, kind)
    }

    /// Node count including nodes inside nested blocks.
    #[must_use]
    pub fn node_count(&self) -> usize {
        fn count(nodes: &[Node]) -> usize {
            nodes
                .iter()
                .map(|node| 1 + node.blocks.iter().map(|b| count(&b.nodes)).sum::<usize>())
                .sum()
        }
        count(&self.nodes)
    }

    pub fn validate_well_formed(&self) -> Result<(), GraphValidationError> {
        let mut bound = BTreeSet::new();
        for input in &self.inputs {
            if !bound.insert(input.id) {
                return Err(GraphValidationError::DuplicateBinding {
                    section: "inputs",
                    var: input.id,
                });
            }
        }

        let mut scope = bound.clone();
        validate_nodes(&self.nodes, &mut scope, &mut bound)?;

        for output in &self.outputs {
            if !scope.contains(output) {
                return Err(GraphValidationError::UnknownOutput { var: *output });
            }
        }
        Ok(())
    }
}

/// `scope` holds the values visible at this nesting level; `bound` every
/// value bound anywhere so far, which enforces global single assignment.
fn validate_nodes(
    nodes: &[Node],
    scope: &mut BTreeSet<ValueId>,
    bound: &mut BTreeSet<ValueId>,
) -> Result<(), GraphValidationError> {
    for node in nodes {
        for input in &node.inputs {
            if !scope.contains(input) {
                return Err(GraphValidationError::UnboundInput {
                    kind: node.kind,
                    var: *input,
                });
            }
        }

        if node.kind == NodeKind::If {
            if node.blocks.len() != 2 {
                return Err(GraphValidationError::BlockCount {
                    kind: node.kind,
                    expected: 2,
                    actual: node.blocks.len(),
                });
            }
            if node.inputs.len() != 1 {
                return Err(GraphValidationError::InputArity {
                    kind: node.kind,
                    expected: 1,
                    actual: node.inputs.len(),
                });
            }
        } else if !node.blocks.is_empty() {
            return Err(GraphValidationError::BlockCount {
                kind: node.kind,
                expected: 0,
                actual: node.blocks.len(),
            });
        }

        for block in &node.blocks {
            let mut inner = scope.clone();
            validate_nodes(&block.nodes, &mut inner, bound)?;
            if block.outputs.len() != node.outputs.len() {
                return Err(GraphValidationError::BlockArity {
                    kind: node.kind,
                    expected: node.outputs.len(),
                    actual: block.outputs.len(),
                });
            }
            for output in &block.outputs {
                if !inner.contains(output) {
                    return Err(GraphValidationError::UnknownOutput { var: *output });
                }
            }
        }

        for output in &node.outputs {
            if !bound.insert(*output) {
                return Err(GraphValidationError::DuplicateBinding {
                    section: "node outputs",
                    var: *output,
                });
            }
            scope.insert(*output);
        }
    }
    Ok(())
}

impl std::fmt::Display for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inputs = self
            .inputs
            .iter()
            .map(|input| format!("{} : {}", input.id, input.name))
            .collect::<Vec<_>>()
            .join(", ");
        writeln!(f, "graph({inputs}):")?;
        let mut out = String::new();
        write_nodes(&mut out, &self.nodes, 1);
        f.write_str(&out)?;
        writeln!(f, "  return ({})", join_ids(&self.outputs))
    }
}

fn write_nodes(out: &mut String, nodes: &[Node], depth: usize) {
    let indent = "  ".repeat(depth);
    for node in nodes {
        let _ = write!(
            out,
            "{indent}{} = {}({})",
            join_ids(&node.outputs),
            node.kind,
            join_ids(&node.inputs)
        );
        if !node.attrs.is_empty() {
            let attrs = node
                .attrs
                .iter()
                .map(|(key, value)| format!("{key}={}", render_attr(value)))
                .collect::<Vec<_>>()
                .join(", ");
            let _ = write!(out, "[{attrs}]");
        }
        out.push('\n');
        for (index, block) in node.blocks.iter().enumerate() {
            let _ = writeln!(out, "{indent}  block{index}():");
            write_nodes(out, &block.nodes, depth + 2);
            let _ = writeln!(out, "{indent}    -> ({})", join_ids(&block.outputs));
        }
    }
}

fn render_attr(attr: &Attr) -> String {
    match attr {
        Attr::Value(value) => value.to_string(),
        Attr::Str(name) => format!("\"{name}\""),
        Attr::DType(dtype) => dtype.to_string(),
    }
}

fn join_ids(ids: &[ValueId]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Incremental construction of SSA graphs, including nested `prim::If`
/// blocks.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    next_id: u32,
    inputs: Vec<GraphInput>,
    frames: Vec<Vec<Node>>,
}

impl GraphBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: 0,
            inputs: Vec::new(),
            frames: vec![Vec::new()],
        }
    }

    fn fresh(&mut self) -> ValueId {
        let id = ValueId(self.next_id);
        self.next_id += 1;
        id
    }

    fn push(&mut self, node: Node) {
        if let Some(frame) = self.frames.last_mut() {
            frame.push(node);
        }
    }

    pub fn input(&mut self, name: impl Into<String>) -> ValueId {
        let id = self.fresh();
        self.inputs.push(GraphInput {
            id,
            name: name.into(),
        });
        id
    }

    pub fn op_with_attrs(
        &mut self,
        kind: NodeKind,
        inputs: &[ValueId],
        attrs: BTreeMap<String, Attr>,
    ) -> ValueId {
        let output = self.fresh();
        self.push(Node {
            kind,
            inputs: inputs.iter().copied().collect(),
            outputs: smallvec::smallvec![output],
            attrs,
            blocks: Vec::new(),
        });
        output
    }

    pub fn op(&mut self, kind: NodeKind, inputs: &[ValueId]) -> ValueId {
        self.op_with_attrs(kind, inputs, BTreeMap::new())
    }

    pub fn constant(&mut self, value: IValue) -> ValueId {
        self.op_with_attrs(
            NodeKind::Constant,
            &[],
            BTreeMap::from([("value".to_owned(), Attr::Value(value))]),
        )
    }

    pub fn none(&mut self) -> ValueId {
        self.constant(IValue::None)
    }

    pub fn get_attr(&mut self, name: impl Into<String>) -> ValueId {
        self.op_with_attrs(
            NodeKind::GetAttr,
            &[],
            BTreeMap::from([("name".to_owned(), Attr::Str(name.into()))]),
        )
    }

    pub fn to(&mut self, input: ValueId, dtype: DType) -> ValueId {
        self.op_with_attrs(
            NodeKind::To,
            &[input],
            BTreeMap::from([("dtype".to_owned(), Attr::DType(dtype))]),
        )
    }

    pub fn dropout(&mut self, input: ValueId, p: f64) -> ValueId {
        self.op_with_attrs(
            NodeKind::Dropout,
            &[input],
            BTreeMap::from([("p".to_owned(), Attr::Value(IValue::scalar_f64(p)))]),
        )
    }

    pub fn list(&mut self, items: &[ValueId]) -> ValueId {
        self.op(NodeKind::ListConstruct, items)
    }

    pub fn tuple(&mut self, items: &[ValueId]) -> ValueId {
        self.op(NodeKind::TupleConstruct, items)
    }

    /// Emits `prim::If(cond)` with the two branches built by the closures.
    /// The node gets as many outputs as the then-branch yields.
    pub fn if_else(
        &mut self,
        cond: ValueId,
        then_branch: impl FnOnce(&mut Self) -> Vec<ValueId>,
        else_branch: impl FnOnce(&mut Self) -> Vec<ValueId>,
    ) -> Vec<ValueId> {
        let then_block = self.block(then_branch);
        let else_block = self.block(else_branch);
        let outputs = (0..then_block.outputs.len())
            .map(|_| self.fresh())
            .collect::<Vec<_>>();
        self.push(Node {
            kind: NodeKind::If,
            inputs: smallvec::smallvec![cond],
            outputs: outputs.iter().copied().collect(),
            attrs: BTreeMap::new(),
            blocks: vec![then_block, else_block],
        });
        outputs
    }

    fn block(&mut self, body: impl FnOnce(&mut Self) -> Vec<ValueId>) -> Block {
        self.frames.push(Vec::new());
        let outputs = body(self);
        let nodes = self.frames.pop().unwrap_or_default();
        Block { nodes, outputs }
    }

    #[must_use]
    pub fn build(mut self, outputs: &[ValueId]) -> Graph {
        let nodes = self.frames.drain(..).next().unwrap_or_default();
        Graph {
            inputs: self.inputs,
            nodes,
            outputs: outputs.to_vec(),
        }
    }
}
