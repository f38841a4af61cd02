use fc_core::{TensorValue, Value};
use fc_engine::{Body, IrNode, IrOp, IrParameter, Model, OutputPort, PartialShape};
use fc_script::{Attr, Graph, IValue, Node, NodeKind, ValueId};
use smallvec::{SmallVec, smallvec};
use std::collections::BTreeMap;

use crate::FrontendError;

/// What a framework value became in the IR.
#[derive(Debug, Clone)]
enum Lowered {
    Port(OutputPort),
    None,
    /// Tuples and generic lists; expanded when they reach the model results.
    Seq(Vec<Lowered>),
}

struct Lowering<'a> {
    params: &'a BTreeMap<String, TensorValue>,
    values: BTreeMap<ValueId, Lowered>,
    next_port: u32,
}

fn port_of(id: ValueId) -> OutputPort {
    OutputPort(id.0)
}

fn max_value_id(graph: &Graph) -> u32 {
    fn walk(nodes: &[Node], max: &mut u32) {
        for node in nodes {
            for id in node.outputs.iter().chain(&node.inputs) {
                *max = (*max).max(id.0);
            }
            for block in &node.blocks {
                walk(&block.nodes, max);
            }
        }
    }
    let mut max = graph.inputs.iter().map(|input| input.id.0).max().unwrap_or(0);
    walk(&graph.nodes, &mut max);
    max
}

/// Lowers a decoded graph into an IR model. Parameters start with no element
/// type and a fully dynamic shape.
pub(crate) fn lower_graph(
    name: &str,
    graph: &Graph,
    params: &BTreeMap<String, TensorValue>,
) -> Result<Model, FrontendError> {
    let mut lowering = Lowering {
        params,
        values: BTreeMap::new(),
        next_port: max_value_id(graph) + 1,
    };

    let parameters = graph
        .inputs
        .iter()
        .map(|input| {
            lowering
                .values
                .insert(input.id, Lowered::Port(port_of(input.id)));
            IrParameter {
                name: input.name.clone(),
                element_type: None,
                partial_shape: PartialShape::dynamic(),
                output: port_of(input.id),
            }
        })
        .collect::<Vec<_>>();

    let mut nodes = Vec::new();
    lowering.lower_nodes(&graph.nodes, &mut nodes)?;

    let mut results = Vec::new();
    for output in &graph.outputs {
        let lowered = lowering.value(NodeKind::TupleConstruct, *output)?;
        expand_results(&lowered, &mut results);
    }
    Ok(Model::new(name, parameters, nodes, results))
}

fn expand_results(lowered: &Lowered, results: &mut Vec<OutputPort>) {
    match lowered {
        Lowered::Port(port) => results.push(*port),
        Lowered::None => {}
        Lowered::Seq(items) => {
            for item in items {
                expand_results(item, results);
            }
        }
    }
}

impl Lowering<'_> {
    fn fresh_port(&mut self) -> OutputPort {
        let port = OutputPort(self.next_port);
        self.next_port += 1;
        port
    }

    fn value(&self, kind: NodeKind, id: ValueId) -> Result<Lowered, FrontendError> {
        self.values
            .get(&id)
            .cloned()
            .ok_or(FrontendError::UndefinedValue { kind, value: id })
    }

    fn port(&self, kind: NodeKind, id: ValueId) -> Result<OutputPort, FrontendError> {
        match self.value(kind, id)? {
            Lowered::Port(port) => Ok(port),
            Lowered::None => Err(FrontendError::Unsupported {
                kind,
                detail: "operand is None".to_owned(),
            }),
            Lowered::Seq(_) => Err(FrontendError::Unsupported {
                kind,
                detail: "operand is a non-constant list or tuple".to_owned(),
            }),
        }
    }

    fn lower_nodes(&mut self, nodes: &[Node], ir: &mut Vec<IrNode>) -> Result<(), FrontendError> {
        for node in nodes {
            self.lower_node(node, ir)?;
        }
        Ok(())
    }

    fn lower_node(&mut self, node: &Node, ir: &mut Vec<IrNode>) -> Result<(), FrontendError> {
        let kind = node.kind;
        let Some(&output) = node.outputs.first() else {
            return Err(FrontendError::Unsupported {
                kind,
                detail: "node has no outputs".to_owned(),
            });
        };

        let lowered = match kind {
            NodeKind::Constant => {
                let Some(Attr::Value(value)) = node.attr("value") else {
                    return Err(FrontendError::MissingAttribute {
                        kind,
                        attr: "value",
                    });
                };
                self.lower_constant(value, port_of(output), ir)?
            }
            NodeKind::GetAttr => {
                let Some(Attr::Str(name)) = node.attr("name") else {
                    return Err(FrontendError::MissingAttribute { kind, attr: "name" });
                };
                let tensor = self
                    .params
                    .get(name)
                    .cloned()
                    .ok_or_else(|| FrontendError::UnknownParameter(name.clone()))?;
                ir.push(IrNode {
                    op: IrOp::Constant(Value::Tensor(tensor)),
                    inputs: smallvec![],
                    outputs: smallvec![port_of(output)],
                });
                Lowered::Port(port_of(output))
            }
            NodeKind::ListConstruct | NodeKind::TupleConstruct => Lowered::Seq(
                node.inputs
                    .iter()
                    .map(|id| self.value(kind, *id))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            NodeKind::Dropout => {
                let input = node.inputs.first().copied().ok_or(FrontendError::Unsupported {
                    kind,
                    detail: "missing input".to_owned(),
                })?;
                self.value(kind, input)?
            }
            NodeKind::If => self.lower_if(node, ir)?,
            NodeKind::Linear => self.lower_linear(node, output, ir)?,
            NodeKind::Add => push(ir, self.simple(node, IrOp::Add)?),
            NodeKind::Sub => push(ir, self.simple(node, IrOp::Subtract)?),
            NodeKind::Mul => push(ir, self.simple(node, IrOp::Multiply)?),
            NodeKind::Div => push(ir, self.simple(node, IrOp::Divide)?),
            NodeKind::Gt => push(ir, self.simple(node, IrOp::Greater)?),
            NodeKind::Neg => push(ir, self.simple(node, IrOp::Negative)?),
            NodeKind::Relu => push(ir, self.simple(node, IrOp::Relu)?),
            NodeKind::Exp => push(ir, self.simple(node, IrOp::Exp)?),
            NodeKind::Tanh => push(ir, self.simple(node, IrOp::Tanh)?),
            NodeKind::Sigmoid => push(ir, self.simple(node, IrOp::Sigmoid)?),
            NodeKind::MatMul => push(ir, self.simple(node, IrOp::MatMul { transpose_b: false })?),
            NodeKind::Sum => push(ir, self.simple(node, IrOp::ReduceSum)?),
            NodeKind::Size => push(ir, self.simple(node, IrOp::ShapeOf)?),
            NodeKind::Tensor => push(ir, self.simple(node, IrOp::TensorFromList)?),
            NodeKind::To => {
                let Some(Attr::DType(dtype)) = node.attr("dtype") else {
                    return Err(FrontendError::MissingAttribute {
                        kind,
                        attr: "dtype",
                    });
                };
                push(ir, self.simple(node, IrOp::Convert(*dtype))?)
            }
        };
        self.values.insert(output, lowered);
        Ok(())
    }

    fn simple(&self, node: &Node, op: IrOp) -> Result<IrNode, FrontendError> {
        let inputs = node
            .inputs
            .iter()
            .map(|id| self.port(node.kind, *id))
            .collect::<Result<SmallVec<_>, _>>()?;
        Ok(IrNode {
            op,
            inputs,
            outputs: node.outputs.iter().copied().map(port_of).collect(),
        })
    }

    fn lower_constant(
        &mut self,
        value: &IValue,
        port: OutputPort,
        ir: &mut Vec<IrNode>,
    ) -> Result<Lowered, FrontendError> {
        let constant = match value {
            IValue::None => return Ok(Lowered::None),
            IValue::Scalar(lit) => Value::Scalar(*lit),
            IValue::Tensor(tensor) => Value::Tensor(tensor.clone()),
            IValue::ScalarList(items) => fc_kernels::eval_tensor_from_list(items)?,
            IValue::List(items) | IValue::Tuple(items) => {
                let mut lowered = Vec::with_capacity(items.len());
                for item in items {
                    let item_port = self.fresh_port();
                    lowered.push(self.lower_constant(item, item_port, ir)?);
                }
                return Ok(Lowered::Seq(lowered));
            }
        };
        ir.push(IrNode {
            op: IrOp::Constant(constant),
            inputs: smallvec![],
            outputs: smallvec![port],
        });
        Ok(Lowered::Port(port))
    }

    /// `linear(x, w, b)` becomes `MatMul(x, w^T)` followed by `Add(b)` when a
    /// bias is present.
    fn lower_linear(
        &mut self,
        node: &Node,
        output: ValueId,
        ir: &mut Vec<IrNode>,
    ) -> Result<Lowered, FrontendError> {
        let kind = node.kind;
        let (x, w) = match node.inputs.as_slice() {
            [x, w, ..] => (self.port(kind, *x)?, self.port(kind, *w)?),
            _ => {
                return Err(FrontendError::Unsupported {
                    kind,
                    detail: "expected input and weight".to_owned(),
                });
            }
        };
        let bias = match node.inputs.get(2) {
            Some(id) => match self.value(kind, *id)? {
                Lowered::None => None,
                _ => Some(self.port(kind, *id)?),
            },
            None => None,
        };

        let product = if bias.is_some() {
            self.fresh_port()
        } else {
            port_of(output)
        };
        ir.push(IrNode {
            op: IrOp::MatMul { transpose_b: true },
            inputs: smallvec![x, w],
            outputs: smallvec![product],
        });
        if let Some(bias) = bias {
            ir.push(IrNode {
                op: IrOp::Add,
                inputs: smallvec![product, bias],
                outputs: smallvec![port_of(output)],
            });
        }
        Ok(Lowered::Port(port_of(output)))
    }

    fn lower_if(&mut self, node: &Node, ir: &mut Vec<IrNode>) -> Result<Lowered, FrontendError> {
        let kind = node.kind;
        let cond = match node.inputs.first() {
            Some(id) => self.port(kind, *id)?,
            None => {
                return Err(FrontendError::Unsupported {
                    kind,
                    detail: "missing condition".to_owned(),
                });
            }
        };
        let [then_block, else_block] = node.blocks.as_slice() else {
            return Err(FrontendError::Unsupported {
                kind,
                detail: format!("expected 2 blocks, found {}", node.blocks.len()),
            });
        };

        let mut bodies = Vec::with_capacity(2);
        for block in [then_block, else_block] {
            let mut nodes = Vec::new();
            self.lower_nodes(&block.nodes, &mut nodes)?;
            let results = block
                .outputs
                .iter()
                .map(|id| self.port(kind, *id))
                .collect::<Result<Vec<_>, _>>()?;
            bodies.push(Body { nodes, results });
        }
        let else_body = bodies.pop().unwrap_or_default();
        let then_body = bodies.pop().unwrap_or_default();

        let outputs = node.outputs.iter().copied().map(port_of).collect::<SmallVec<_>>();
        for (id, port) in node.outputs.iter().zip(&outputs).skip(1) {
            self.values.insert(*id, Lowered::Port(*port));
        }
        let first = outputs[0];
        ir.push(IrNode {
            op: IrOp::If {
                then_body,
                else_body,
            },
            inputs: smallvec![cond],
            outputs,
        });
        Ok(Lowered::Port(first))
    }
}

fn push(ir: &mut Vec<IrNode>, node: IrNode) -> Lowered {
    let port = node.outputs[0];
    ir.push(node);
    Lowered::Port(port)
}
