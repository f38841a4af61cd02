use fc_core::{Literal, TensorValue, Value};
use fc_kernels::{BinaryOp, UnaryOp};
use std::cell::RefCell;
use std::collections::BTreeMap;

use crate::graph::{Attr, Graph, Node, NodeKind, ValueId};
use crate::{IValue, ScriptError, is_grad_enabled};

type Env = BTreeMap<ValueId, IValue>;

/// Nodes executed during a trace, with `prim::If` outputs aliased to the
/// value the taken branch produced.
#[derive(Debug, Default)]
pub(crate) struct TraceRecorder {
    pub(crate) nodes: Vec<Node>,
    aliases: BTreeMap<ValueId, ValueId>,
}

impl TraceRecorder {
    pub(crate) fn resolve(&self, mut id: ValueId) -> ValueId {
        while let Some(next) = self.aliases.get(&id) {
            id = *next;
        }
        id
    }

    fn record(&mut self, node: &Node) {
        let mut recorded = node.clone();
        for input in &mut recorded.inputs {
            *input = self.resolve(*input);
        }
        self.nodes.push(recorded);
    }
}

pub(crate) struct Interpreter<'a> {
    params: &'a BTreeMap<String, TensorValue>,
    training: bool,
    tape: Option<&'a RefCell<Vec<NodeKind>>>,
    recorder: Option<TraceRecorder>,
}

impl<'a> Interpreter<'a> {
    pub(crate) fn new(params: &'a BTreeMap<String, TensorValue>, training: bool) -> Self {
        Self {
            params,
            training,
            tape: None,
            recorder: None,
        }
    }

    pub(crate) fn with_tape(mut self, tape: &'a RefCell<Vec<NodeKind>>) -> Self {
        self.tape = Some(tape);
        self
    }

    pub(crate) fn recording(mut self) -> Self {
        self.recorder = Some(TraceRecorder::default());
        self
    }

    pub(crate) fn into_recorder(self) -> Option<TraceRecorder> {
        self.recorder
    }

    pub(crate) fn run(&mut self, graph: &Graph, args: &[IValue]) -> Result<Vec<IValue>, ScriptError> {
        if args.len() != graph.inputs.len() {
            return Err(ScriptError::InputArity {
                expected: graph.inputs.len(),
                actual: args.len(),
            });
        }
        let mut env = Env::new();
        for (input, arg) in graph.inputs.iter().zip(args) {
            env.insert(input.id, arg.clone());
        }
        self.run_nodes(&graph.nodes, &mut env)?;
        graph
            .outputs
            .iter()
            .map(|id| read(&env, *id).cloned())
            .collect()
    }

    fn run_nodes(&mut self, nodes: &[Node], env: &mut Env) -> Result<(), ScriptError> {
        for node in nodes {
            if node.kind == NodeKind::If {
                self.eval_if(node, env)?;
                continue;
            }
            let args = node
                .inputs
                .iter()
                .map(|id| read(env, *id).cloned())
                .collect::<Result<Vec<_>, _>>()?;
            let out = self.apply(node, &args)?;
            tracing::trace!(kind = node.kind.as_str(), out = %out, "executed node");

            if let Some(tape) = self.tape
                && is_grad_enabled()
                && records_on_tape(node.kind)
            {
                tape.borrow_mut().push(node.kind);
            }
            if let Some(recorder) = &mut self.recorder {
                recorder.record(node);
            }
            if let Some(id) = node.outputs.first() {
                env.insert(*id, out);
            }
        }
        Ok(())
    }

    fn eval_if(&mut self, node: &Node, env: &mut Env) -> Result<(), ScriptError> {
        let cond_id = node
            .inputs
            .first()
            .copied()
            .ok_or(ScriptError::MissingOperand {
                kind: node.kind,
                index: 0,
            })?;
        let cond = read(env, cond_id)?;
        let taken = cond
            .as_value()
            .ok_or(ScriptError::OperandKind {
                kind: node.kind,
                found: cond.type_name(),
            })?
            .truthy()?;
        let block = node
            .blocks
            .get(if taken { 0 } else { 1 })
            .ok_or(ScriptError::MissingAttribute {
                kind: node.kind,
                attr: "blocks",
            })?;
        tracing::trace!(taken, "prim::If");

        self.run_nodes(&block.nodes, env)?;
        for (out, source) in node.outputs.iter().zip(&block.outputs) {
            let value = read(env, *source)?.clone();
            env.insert(*out, value);
            if let Some(recorder) = &mut self.recorder {
                let target = recorder.resolve(*source);
                recorder.aliases.insert(*out, target);
            }
        }
        Ok(())
    }

    fn apply(&self, node: &Node, args: &[IValue]) -> Result<IValue, ScriptError> {
        let kind = node.kind;
        match kind {
            NodeKind::Constant => match node.attr("value") {
                Some(Attr::Value(value)) => Ok(value.clone()),
                _ => Err(ScriptError::MissingAttribute {
                    kind,
                    attr: "value",
                }),
            },
            NodeKind::GetAttr => {
                let Some(Attr::Str(name)) = node.attr("name") else {
                    return Err(ScriptError::MissingAttribute { kind, attr: "name" });
                };
                self.params
                    .get(name)
                    .cloned()
                    .map(IValue::Tensor)
                    .ok_or_else(|| ScriptError::UnknownParameter(name.clone()))
            }
            NodeKind::ListConstruct => {
                let scalars = args
                    .iter()
                    .map(|arg| match arg {
                        IValue::Scalar(lit) => Some(*lit),
                        _ => None,
                    })
                    .collect::<Option<Vec<Literal>>>();
                Ok(match scalars {
                    Some(items) if !items.is_empty() => IValue::ScalarList(items),
                    _ => IValue::List(args.to_vec()),
                })
            }
            NodeKind::TupleConstruct => Ok(IValue::Tuple(args.to_vec())),
            NodeKind::If => Err(ScriptError::MissingAttribute {
                kind,
                attr: "blocks",
            }),
            NodeKind::Add => binary(kind, BinaryOp::Add, args),
            NodeKind::Sub => binary(kind, BinaryOp::Sub, args),
            NodeKind::Mul => binary(kind, BinaryOp::Mul, args),
            NodeKind::Div => binary(kind, BinaryOp::Div, args),
            NodeKind::Gt => binary(kind, BinaryOp::Gt, args),
            NodeKind::Neg => unary(kind, UnaryOp::Neg, args),
            NodeKind::Relu => unary(kind, UnaryOp::Relu, args),
            NodeKind::Exp => unary(kind, UnaryOp::Exp, args),
            NodeKind::Tanh => unary(kind, UnaryOp::Tanh, args),
            NodeKind::Sigmoid => unary(kind, UnaryOp::Sigmoid, args),
            NodeKind::MatMul => Ok(fc_kernels::eval_matmul(
                &operand(kind, args, 0)?,
                &operand(kind, args, 1)?,
                false,
            )?
            .into()),
            NodeKind::Linear => {
                let product = fc_kernels::eval_matmul(
                    &operand(kind, args, 0)?,
                    &operand(kind, args, 1)?,
                    true,
                )?;
                match args.get(2) {
                    Some(bias) if !bias.is_none() => Ok(fc_kernels::eval_binary(
                        BinaryOp::Add,
                        &product,
                        &operand(kind, args, 2)?,
                    )?
                    .into()),
                    _ => Ok(product.into()),
                }
            }
            NodeKind::Sum => Ok(fc_kernels::eval_reduce_sum(&operand(kind, args, 0)?)?.into()),
            NodeKind::To => {
                let Some(Attr::DType(dtype)) = node.attr("dtype") else {
                    return Err(ScriptError::MissingAttribute {
                        kind,
                        attr: "dtype",
                    });
                };
                Ok(fc_kernels::eval_cast(&operand(kind, args, 0)?, *dtype).into())
            }
            NodeKind::Size => match arg(kind, args, 0)? {
                IValue::Tensor(tensor) => Ok(IValue::ScalarList(
                    tensor
                        .shape
                        .dims
                        .iter()
                        .map(|dim| Literal::I64(i64::from(*dim)))
                        .collect(),
                )),
                other => Err(ScriptError::OperandKind {
                    kind,
                    found: other.type_name(),
                }),
            },
            NodeKind::Tensor => match arg(kind, args, 0)? {
                IValue::ScalarList(items) => Ok(fc_kernels::eval_tensor_from_list(items)?.into()),
                IValue::Scalar(lit) => Ok(IValue::Tensor(TensorValue::rank0(
                    fc_kernels::list_tensor_dtype(lit.natural_dtype()),
                    *lit,
                ))),
                other => Err(ScriptError::OperandKind {
                    kind,
                    found: other.type_name(),
                }),
            },
            NodeKind::Dropout => {
                if self.training {
                    return Err(ScriptError::TrainingOnly { kind });
                }
                Ok(arg(kind, args, 0)?.clone())
            }
        }
    }
}

/// Evaluates one parameter-free node outside any graph, as constant folding
/// does. Runs in evaluation mode and never touches the autograd tape.
pub fn evaluate_node(node: &Node, args: &[IValue]) -> Result<IValue, ScriptError> {
    let params = BTreeMap::new();
    Interpreter::new(&params, false).apply(node, args)
}

/// Differentiable ops; structural nodes never reach the autograd tape.
fn records_on_tape(kind: NodeKind) -> bool {
    !matches!(
        kind,
        NodeKind::Constant
            | NodeKind::GetAttr
            | NodeKind::ListConstruct
            | NodeKind::TupleConstruct
            | NodeKind::Size
    )
}

fn read(env: &Env, id: ValueId) -> Result<&IValue, ScriptError> {
    env.get(&id).ok_or(ScriptError::MissingValue(id))
}

fn arg(kind: NodeKind, args: &[IValue], index: usize) -> Result<&IValue, ScriptError> {
    args.get(index)
        .ok_or(ScriptError::MissingOperand { kind, index })
}

fn operand(kind: NodeKind, args: &[IValue], index: usize) -> Result<Value, ScriptError> {
    let value = arg(kind, args, index)?;
    value.as_value().ok_or(ScriptError::OperandKind {
        kind,
        found: value.type_name(),
    })
}

fn binary(kind: NodeKind, op: BinaryOp, args: &[IValue]) -> Result<IValue, ScriptError> {
    let lhs = operand(kind, args, 0)?;
    let rhs = operand(kind, args, 1)?;
    Ok(fc_kernels::eval_binary(op, &lhs, &rhs)?.into())
}

fn unary(kind: NodeKind, op: UnaryOp, args: &[IValue]) -> Result<IValue, ScriptError> {
    Ok(fc_kernels::eval_unary(op, &operand(kind, args, 0)?)?.into())
}

#[cfg(test)]
mod tests {
    use super::Interpreter;
    use crate::graph::{GraphBuilder, NodeKind};
    use crate::{IValue, NoGradGuard, ScriptError};
    use fc_core::{DType, Literal, Shape, TensorValue};
    use std::cell::RefCell;
    use std::collections::BTreeMap;

    fn f32s(dims: &[u32], values: &[f64]) -> IValue {
        IValue::Tensor(
            TensorValue::from_f64s(DType::F32, Shape::new(dims.to_vec()), values)
                .expect("tensor"),
        )
    }

    #[test]
    fn linear_with_bias_matches_hand_computation() {
        let mut g = GraphBuilder::new();
        let x = g.input("x");
        let w = g.get_attr("weight");
        let b = g.get_attr("bias");
        let y = g.op(NodeKind::Linear, &[x, w, b]);
        let graph = g.build(&[y]);

        let params = BTreeMap::from([
            (
                "weight".to_owned(),
                TensorValue::from_f64s(DType::F32, Shape::new([2, 2]), &[1.0, 2.0, 3.0, 4.0])
                    .expect("weight"),
            ),
            (
                "bias".to_owned(),
                TensorValue::from_f64s(DType::F32, Shape::vector(2), &[0.5, -0.5])
                    .expect("bias"),
            ),
        ]);
        let out = Interpreter::new(&params, false)
            .run(&graph, &[f32s(&[1, 2], &[1.0, 1.0])])
            .expect("run");
        assert_eq!(out, vec![f32s(&[1, 2], &[3.5, 6.5])]);
    }

    #[test]
    fn size_and_list_construct_produce_scalar_lists() {
        let mut g = GraphBuilder::new();
        let x = g.input("x");
        let shape = g.op(NodeKind::Size, &[x]);
        let one = g.constant(IValue::scalar_i64(1));
        let two = g.constant(IValue::scalar_i64(2));
        let list = g.list(&[one, two]);
        let graph = g.build(&[shape, list]);

        let params = BTreeMap::new();
        let out = Interpreter::new(&params, false)
            .run(&graph, &[f32s(&[2, 3], &[0.0; 6])])
            .expect("run");
        assert_eq!(
            out,
            vec![
                IValue::ScalarList(vec![Literal::I64(2), Literal::I64(3)]),
                IValue::ScalarList(vec![Literal::I64(1), Literal::I64(2)]),
            ]
        );
    }

    #[test]
    fn dropout_rejects_training_mode() {
        let mut g = GraphBuilder::new();
        let x = g.input("x");
        let y = g.dropout(x, 0.5);
        let graph = g.build(&[y]);
        let params = BTreeMap::new();
        let input = f32s(&[2], &[1.0, 2.0]);

        let err = Interpreter::new(&params, true)
            .run(&graph, std::slice::from_ref(&input))
            .expect_err("training dropout");
        assert_eq!(
            err,
            ScriptError::TrainingOnly {
                kind: NodeKind::Dropout
            }
        );
        let out = Interpreter::new(&params, false)
            .run(&graph, std::slice::from_ref(&input))
            .expect("eval dropout");
        assert_eq!(out, vec![input]);
    }

    #[test]
    fn tape_only_records_with_grad_enabled() {
        let mut g = GraphBuilder::new();
        let x = g.input("x");
        let y = g.op(NodeKind::Tanh, &[x]);
        let graph = g.build(&[y]);
        let params = BTreeMap::new();
        let tape = RefCell::new(Vec::new());
        let input = [f32s(&[1], &[0.0])];

        Interpreter::new(&params, false)
            .with_tape(&tape)
            .run(&graph, &input)
            .expect("run");
        assert_eq!(tape.borrow().as_slice(), &[NodeKind::Tanh]);

        let _guard = NoGradGuard::new();
        Interpreter::new(&params, false)
            .with_tape(&tape)
            .run(&graph, &input)
            .expect("run");
        assert_eq!(tape.borrow().len(), 1);
    }

    #[test]
    fn wrong_arity_is_reported() {
        let mut g = GraphBuilder::new();
        let x = g.input("x");
        let graph = g.build(&[x]);
        let params = BTreeMap::new();
        let err = Interpreter::new(&params, false)
            .run(&graph, &[])
            .expect_err("arity");
        assert_eq!(
            err,
            ScriptError::InputArity {
                expected: 1,
                actual: 0
            }
        );
    }
}
