use fc_core::{DType, TensorValue, Value};
use std::collections::BTreeMap;

use crate::EngineError;
use crate::ir::{IrNode, IrOp, Model, OutputPort};

type Env = BTreeMap<OutputPort, Value>;

/// Host execution of a validated model. Every floating value produced,
/// including inputs and constants, is rounded through `precision` while
/// keeping its declared element type.
pub(crate) fn execute(
    model: &Model,
    inputs: &[Value],
    precision: DType,
) -> Result<Vec<Value>, EngineError> {
    let mut env = Env::new();
    for (parameter, input) in model.inputs().iter().zip(inputs) {
        env.insert(parameter.output, round(input.clone(), precision));
    }
    run_nodes(model.nodes(), &mut env, precision)?;
    model
        .outputs()
        .iter()
        .map(|port| read(&env, *port).cloned())
        .collect()
}

fn round(value: Value, precision: DType) -> Value {
    match value {
        Value::Tensor(tensor) => Value::Tensor(tensor.round_through(precision)),
        scalar => scalar,
    }
}

fn read(env: &Env, port: OutputPort) -> Result<&Value, EngineError> {
    env.get(&port).ok_or(EngineError::MissingPort(port))
}

fn run_nodes(nodes: &[IrNode], env: &mut Env, precision: DType) -> Result<(), EngineError> {
    for node in nodes {
        if let IrOp::If {
            then_body,
            else_body,
        } = &node.op
        {
            let cond = read(env, node.inputs[0])?.truthy()?;
            let body = if cond { then_body } else { else_body };
            run_nodes(&body.nodes, env, precision)?;
            for (out, result) in node.outputs.iter().zip(&body.results) {
                let value = read(env, *result)?.clone();
                env.insert(*out, value);
            }
            continue;
        }

        let args = node
            .inputs
            .iter()
            .map(|port| read(env, *port))
            .collect::<Result<Vec<_>, _>>()?;
        let out = eval_op(&node.op, &args)?;
        if let Some(port) = node.outputs.first() {
            env.insert(*port, round(out, precision));
        }
    }
    Ok(())
}

fn eval_op(op: &IrOp, args: &[&Value]) -> Result<Value, EngineError> {
    if let Some(binary) = op.binary_op() {
        return Ok(fc_kernels::eval_binary(binary, args[0], args[1])?);
    }
    if let Some(unary) = op.unary_op() {
        return Ok(fc_kernels::eval_unary(unary, args[0])?);
    }
    Ok(match op {
        IrOp::Constant(value) => value.clone(),
        IrOp::MatMul { transpose_b } => fc_kernels::eval_matmul(args[0], args[1], *transpose_b)?,
        IrOp::ReduceSum => fc_kernels::eval_reduce_sum(args[0])?,
        IrOp::Convert(dtype) => fc_kernels::eval_cast(args[0], *dtype),
        IrOp::ShapeOf => {
            let tensor = args[0].as_tensor().ok_or(EngineError::Execution {
                op: op.type_name(),
                detail: "expected a tensor operand".to_owned(),
            })?;
            let dims = tensor
                .shape
                .dims
                .iter()
                .map(|dim| i64::from(*dim))
                .collect::<Vec<_>>();
            Value::vector_i64(&dims)?
        }
        IrOp::TensorFromList => match args[0] {
            Value::Scalar(lit) => Value::Tensor(TensorValue::rank0(
                fc_kernels::list_tensor_dtype(lit.natural_dtype()),
                *lit,
            )),
            list => fc_kernels::eval_tensor_from_array(list)?,
        },
        other => {
            return Err(EngineError::Execution {
                op: other.type_name(),
                detail: "operator has no host kernel".to_owned(),
            });
        }
    })
}
