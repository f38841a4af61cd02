//! Decoding of captured modules, with optional freezing.
//!
//! Freezing inlines parameters as constants, folds every node whose inputs
//! are all constant, inlines `prim::If` nodes with a constant condition and
//! finally drops nodes whose results are never used.

use fc_core::TensorValue;
use fc_script::{Attr, Graph, IValue, Node, NodeKind, ScriptModule, ValueId, evaluate_node};
use smallvec::smallvec;
use std::collections::{BTreeMap, BTreeSet};

use crate::FrontendError;

#[derive(Debug, Clone)]
pub struct GraphDecoder {
    name: String,
    graph: Graph,
    params: BTreeMap<String, TensorValue>,
    frozen: bool,
}

impl GraphDecoder {
    pub fn new(module: &ScriptModule, freeze: bool) -> Result<Self, FrontendError> {
        let captured = module.inlined_graph();
        let graph = if freeze {
            let frozen = freeze_graph(captured, module.parameters())?;
            tracing::debug!(
                module = module.name(),
                before = captured.node_count(),
                after = frozen.node_count(),
                "froze module"
            );
            frozen
        } else {
            captured.clone()
        };
        Ok(Self {
            name: module.name().to_owned(),
            graph,
            params: module.parameters().clone(),
            frozen: freeze,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    #[must_use]
    pub fn parameters(&self) -> &BTreeMap<String, TensorValue> {
        &self.params
    }

    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    #[must_use]
    pub fn input_names(&self) -> Vec<&str> {
        self.graph
            .inputs
            .iter()
            .map(|input| input.name.as_str())
            .collect()
    }
}

#[derive(Default)]
struct Folder<'a> {
    params: Option<&'a BTreeMap<String, TensorValue>>,
    constants: BTreeMap<ValueId, IValue>,
    aliases: BTreeMap<ValueId, ValueId>,
}

fn freeze_graph(
    graph: &Graph,
    params: &BTreeMap<String, TensorValue>,
) -> Result<Graph, FrontendError> {
    let mut folder = Folder {
        params: Some(params),
        ..Folder::default()
    };
    let nodes = folder.fold_nodes(&graph.nodes)?;
    let outputs = graph
        .outputs
        .iter()
        .map(|id| folder.resolve(*id))
        .collect::<Vec<_>>();

    let mut live = outputs.iter().copied().collect::<BTreeSet<_>>();
    let nodes = eliminate_dead_nodes(nodes, &mut live);
    let frozen = Graph {
        inputs: graph.inputs.clone(),
        nodes,
        outputs,
    };
    frozen.validate_well_formed()?;
    Ok(frozen)
}

fn constant_node(output: ValueId, value: IValue) -> Node {
    Node {
        kind: NodeKind::Constant,
        inputs: smallvec![],
        outputs: smallvec![output],
        attrs: BTreeMap::from([("value".to_owned(), Attr::Value(value))]),
        blocks: Vec::new(),
    }
}

fn foldable(kind: NodeKind) -> bool {
    kind.is_pure() || kind == NodeKind::ListConstruct
}

impl Folder<'_> {
    fn resolve(&self, mut id: ValueId) -> ValueId {
        while let Some(next) = self.aliases.get(&id) {
            id = *next;
        }
        id
    }

    fn fold_nodes(&mut self, nodes: &[Node]) -> Result<Vec<Node>, FrontendError> {
        let mut out = Vec::with_capacity(nodes.len());
        for node in nodes {
            let mut node = node.clone();
            for input in &mut node.inputs {
                *input = self.resolve(*input);
            }

            match node.kind {
                NodeKind::GetAttr => {
                    let Some(Attr::Str(name)) = node.attr("name") else {
                        return Err(FrontendError::MissingAttribute {
                            kind: node.kind,
                            attr: "name",
                        });
                    };
                    let value = self
                        .params
                        .and_then(|params| params.get(name))
                        .cloned()
                        .ok_or_else(|| FrontendError::UnknownParameter(name.clone()))?;
                    let output = single_output(&node)?;
                    self.constants.insert(output, IValue::Tensor(value.clone()));
                    out.push(constant_node(output, IValue::Tensor(value)));
                }
                NodeKind::Constant => {
                    if let (Some(Attr::Value(value)), Some(output)) =
                        (node.attr("value"), node.outputs.first())
                    {
                        self.constants.insert(*output, value.clone());
                    }
                    out.push(node);
                }
                NodeKind::If => {
                    let taken = node
                        .inputs
                        .first()
                        .and_then(|cond| self.constants.get(cond))
                        .and_then(IValue::as_value)
                        .map(|cond| cond.truthy())
                        .transpose()?;
                    if let Some(taken) = taken
                        && let Some(block) = node.blocks.get(if taken { 0 } else { 1 })
                    {
                        out.extend(self.fold_nodes(&block.nodes)?);
                        for (output, source) in node.outputs.iter().zip(&block.outputs) {
                            let target = self.resolve(*source);
                            self.aliases.insert(*output, target);
                        }
                    } else {
                        for block in &mut node.blocks {
                            block.nodes = self.fold_nodes(&block.nodes)?;
                            for output in &mut block.outputs {
                                *output = self.resolve(*output);
                            }
                        }
                        out.push(node);
                    }
                }
                kind if foldable(kind) && node.inputs.iter().all(|id| self.constants.contains_key(id)) => {
                    let args = node
                        .inputs
                        .iter()
                        .filter_map(|id| self.constants.get(id).cloned())
                        .collect::<Vec<_>>();
                    let value = evaluate_node(&node, &args)?;
                    let output = single_output(&node)?;
                    self.constants.insert(output, value.clone());
                    out.push(constant_node(output, value));
                }
                _ => out.push(node),
            }
        }
        Ok(out)
    }
}

fn single_output(node: &Node) -> Result<ValueId, FrontendError> {
    node.outputs
        .first()
        .copied()
        .ok_or(FrontendError::Unsupported {
            kind: node.kind,
            detail: "node has no outputs".to_owned(),
        })
}

/// Reverse sweep keeping nodes that feed a live value. Block outputs of a
/// kept `prim::If` become live inside that block.
fn eliminate_dead_nodes(nodes: Vec<Node>, live: &mut BTreeSet<ValueId>) -> Vec<Node> {
    let mut kept = Vec::with_capacity(nodes.len());
    for mut node in nodes.into_iter().rev() {
        if !node.outputs.iter().any(|id| live.contains(id)) {
            continue;
        }
        for block in &mut node.blocks {
            live.extend(block.outputs.iter().copied());
            block.nodes = eliminate_dead_nodes(std::mem::take(&mut block.nodes), live);
        }
        live.extend(node.inputs.iter().copied());
        kept.push(node);
    }
    kept.reverse();
    kept
}

#[cfg(test)]
mod tests {
    use super::GraphDecoder;
    use crate::FrontendError;
    use fc_core::{DType, Shape, TensorValue};
    use fc_script::{GraphBuilder, GraphModule, IValue, Module, NodeKind, script};

    fn scaled_bias_module() -> GraphModule {
        // y = x + bias * 2, plus an unused tanh
        let mut g = GraphBuilder::new();
        let x = g.input("x");
        let bias = g.get_attr("bias");
        let two = g.constant(IValue::scalar_i64(2));
        let scaled = g.op(NodeKind::Mul, &[bias, two]);
        let _unused = g.op(NodeKind::Tanh, &[x]);
        let y = g.op(NodeKind::Add, &[x, scaled]);
        let mut module = GraphModule::new("scaled_bias", g.build(&[y])).with_parameter(
            "bias",
            TensorValue::from_f64s(DType::F32, Shape::vector(2), &[0.5, 1.5]).expect("bias"),
        );
        module.eval();
        module
    }

    #[test]
    fn freezing_folds_parameter_arithmetic() {
        let scripted = script(&scaled_bias_module()).expect("script");
        let decoder = GraphDecoder::new(&scripted, true).expect("decode");
        let graph = decoder.graph();
        assert!(decoder.is_frozen());
        assert!(!graph.contains_kind("prim::GetAttr"));
        assert!(!graph.contains_kind("aten::mul"));
        assert!(!graph.contains_kind("aten::tanh"));
        assert!(graph.contains_kind("aten::add"));
        assert_eq!(graph.node_count(), 2);

        let folded = graph
            .nodes
            .iter()
            .find(|node| node.kind == NodeKind::Constant)
            .and_then(|node| node.attr("value"));
        let expected =
            TensorValue::from_f64s(DType::F32, Shape::vector(2), &[1.0, 3.0]).expect("t");
        assert_eq!(
            folded,
            Some(&fc_script::Attr::Value(IValue::Tensor(expected)))
        );
    }

    #[test]
    fn unfrozen_decoding_keeps_the_captured_graph() {
        let scripted = script(&scaled_bias_module()).expect("script");
        let decoder = GraphDecoder::new(&scripted, false).expect("decode");
        assert_eq!(decoder.graph(), scripted.inlined_graph());
        assert_eq!(decoder.input_names(), vec!["x"]);
    }

    #[test]
    fn constant_condition_inlines_the_taken_branch() {
        let mut g = GraphBuilder::new();
        let x = g.input("x");
        let flag = g.constant(IValue::scalar_bool(false));
        let out = g.if_else(
            flag,
            |g| vec![g.op(NodeKind::Exp, &[x])],
            |g| vec![g.op(NodeKind::Neg, &[x])],
        );
        let mut module = GraphModule::new("const_if", g.build(&out));
        module.eval();
        let scripted = script(&module).expect("script");
        let decoder = GraphDecoder::new(&scripted, true).expect("decode");
        let graph = decoder.graph();
        assert!(!graph.contains_kind("prim::If"));
        assert!(graph.contains_kind("aten::neg"));
        assert!(!graph.contains_kind("aten::exp"));
        assert_eq!(graph.validate_well_formed(), Ok(()));
    }

    #[test]
    fn folding_errors_surface_as_frontend_errors() {
        let mut g = GraphBuilder::new();
        let a = g.constant(IValue::Tensor(
            TensorValue::from_f64s(DType::F32, Shape::vector(2), &[1.0, 2.0]).expect("t"),
        ));
        let b = g.constant(IValue::Tensor(
            TensorValue::from_f64s(DType::F32, Shape::vector(3), &[1.0, 2.0, 3.0]).expect("t"),
        ));
        let sum = g.op(NodeKind::Add, &[a, b]);
        let module = GraphModule::new("bad_fold", g.build(&[sum]));
        let scripted = script(&module).expect("script");
        assert!(matches!(
            GraphDecoder::new(&scripted, true),
            Err(FrontendError::Script(_))
        ));
    }
}
