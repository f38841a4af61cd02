use fc_core::TensorValue;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::BTreeMap;

use crate::graph::{Graph, Node, NodeKind};
use crate::interpreter::Interpreter;
use crate::{Attr, IValue, Module, ScriptError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CaptureMode {
    Script,
    Trace,
}

impl CaptureMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Script => "script",
            Self::Trace => "trace",
        }
    }
}

/// A module captured as a static graph together with its parameters.
///
/// Executing [`ScriptModule::forward`] while gradient recording is enabled
/// appends the executed differentiable ops to the module's tape.
#[derive(Debug)]
pub struct ScriptModule {
    name: String,
    mode: CaptureMode,
    graph: Graph,
    params: BTreeMap<String, TensorValue>,
    training: bool,
    tape: RefCell<Vec<NodeKind>>,
}

impl ScriptModule {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn mode(&self) -> CaptureMode {
        self.mode
    }

    /// The captured graph with every call inlined.
    #[must_use]
    pub fn inlined_graph(&self) -> &Graph {
        &self.graph
    }

    #[must_use]
    pub fn parameters(&self) -> &BTreeMap<String, TensorValue> {
        &self.params
    }

    #[must_use]
    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Number of ops recorded for differentiation so far.
    #[must_use]
    pub fn tape_len(&self) -> usize {
        self.tape.borrow().len()
    }

    pub fn clear_tape(&self) {
        self.tape.borrow_mut().clear();
    }

    /// Runs the captured graph. A single graph output is returned as is;
    /// several outputs come back as a tuple.
    pub fn forward(&self, args: &[IValue]) -> Result<IValue, ScriptError> {
        let mut outputs = Interpreter::new(&self.params, self.training)
            .with_tape(&self.tape)
            .run(&self.graph, args)?;
        Ok(if outputs.len() == 1 {
            outputs.remove(0)
        } else {
            IValue::Tuple(outputs)
        })
    }
}

fn checked_definition(
    module: &dyn Module,
) -> Result<(Graph, BTreeMap<String, TensorValue>), ScriptError> {
    let graph = module.definition()?;
    graph.validate_well_formed()?;
    let params = module.parameters();
    check_attributes(&graph.nodes, &params)?;
    Ok((graph, params))
}

fn check_attributes(
    nodes: &[Node],
    params: &BTreeMap<String, TensorValue>,
) -> Result<(), ScriptError> {
    for node in nodes {
        if node.kind == NodeKind::GetAttr
            && let Some(Attr::Str(name)) = node.attr("name")
            && !params.contains_key(name)
        {
            return Err(ScriptError::UnknownParameter(name.clone()));
        }
        for block in &node.blocks {
            check_attributes(&block.nodes, params)?;
        }
    }
    Ok(())
}

/// Captures `module` with its control flow intact.
pub fn script(module: &dyn Module) -> Result<ScriptModule, ScriptError> {
    let (graph, params) = checked_definition(module)?;
    tracing::debug!(
        module = module.name(),
        nodes = graph.node_count(),
        "scripted module"
    );
    Ok(ScriptModule {
        name: module.name().to_owned(),
        mode: CaptureMode::Script,
        graph,
        params,
        training: module.training(),
        tape: RefCell::new(Vec::new()),
    })
}

/// Captures `module` by executing it on `example_inputs` and recording the
/// ops that ran. Branches not taken for these inputs are absent from the
/// result.
pub fn trace(module: &dyn Module, example_inputs: &[IValue]) -> Result<ScriptModule, ScriptError> {
    let (graph, params) = checked_definition(module)?;

    let mut interpreter = Interpreter::new(&params, module.training()).recording();
    interpreter.run(&graph, example_inputs)?;
    let recorder = interpreter.into_recorder().unwrap_or_default();

    let outputs = graph
        .outputs
        .iter()
        .map(|id| recorder.resolve(*id))
        .collect::<Vec<_>>();
    let traced = Graph {
        inputs: graph.inputs.clone(),
        nodes: recorder.nodes,
        outputs,
    };
    traced.validate_well_formed()?;
    tracing::debug!(
        module = module.name(),
        nodes = traced.node_count(),
        "traced module"
    );

    Ok(ScriptModule {
        name: module.name().to_owned(),
        mode: CaptureMode::Trace,
        graph: traced,
        params,
        training: module.training(),
        tape: RefCell::new(Vec::new()),
    })
}
