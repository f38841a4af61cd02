#![forbid(unsafe_code)]

//! Conversion of captured framework modules into the engine IR.
//!
//! The pipeline is `GraphDecoder::new` (decode, optionally freeze) →
//! [`FrontEnd::load`] → [`FrontEnd::convert`]. [`convert_model`] runs the
//! whole pipeline in one call and resolves input types from example inputs.

mod convert_model;
mod decoder;
mod lowering;

use fc_core::ValueError;
use fc_engine::{IrError, Model};
use fc_kernels::KernelError;
use fc_script::{GraphValidationError, NodeKind, ScriptError, ValueId};

pub use convert_model::{ConvertOptions, convert_model};
pub use decoder::GraphDecoder;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrontendError {
    #[error("no frontend registered for framework `{0}`")]
    UnknownFramework(String),
    #[error("{kind}: {detail}")]
    Unsupported { kind: NodeKind, detail: String },
    #[error("{kind} is missing attribute `{attr}`")]
    MissingAttribute { kind: NodeKind, attr: &'static str },
    #[error("module has no parameter named `{0}`")]
    UnknownParameter(String),
    #[error("{kind} reads {value} before it is defined")]
    UndefinedValue { kind: NodeKind, value: ValueId },
    #[error("expected {expected} example inputs, got {actual}")]
    ExampleInputs { expected: usize, actual: usize },
    #[error(transparent)]
    Graph(#[from] GraphValidationError),
    #[error(transparent)]
    Script(#[from] ScriptError),
    #[error(transparent)]
    Kernel(#[from] KernelError),
    #[error(transparent)]
    Ir(#[from] IrError),
    #[error(transparent)]
    Value(#[from] ValueError),
}

/// Registry of available frontends.
#[derive(Debug, Clone, Default)]
pub struct FrontEndManager;

impl FrontEndManager {
    const FRAMEWORKS: [&'static str; 1] = ["script"];

    #[must_use]
    pub fn new() -> Self {
        Self
    }

    #[must_use]
    pub fn available_front_ends(&self) -> Vec<&'static str> {
        Self::FRAMEWORKS.to_vec()
    }

    pub fn load_by_framework(&self, framework: &str) -> Result<FrontEnd, FrontendError> {
        Self::FRAMEWORKS
            .iter()
            .find(|name| **name == framework)
            .map(|name| FrontEnd { name })
            .ok_or_else(|| FrontendError::UnknownFramework(framework.to_owned()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrontEnd {
    name: &'static str,
}

/// A decoded graph accepted by a frontend, ready for conversion.
#[derive(Debug, Clone)]
pub struct InputModel {
    decoder: GraphDecoder,
}

impl InputModel {
    #[must_use]
    pub fn decoder(&self) -> &GraphDecoder {
        &self.decoder
    }

    #[must_use]
    pub fn input_names(&self) -> Vec<&str> {
        self.decoder.input_names()
    }
}

impl FrontEnd {
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn load(&self, decoder: GraphDecoder) -> Result<InputModel, FrontendError> {
        decoder.graph().validate_well_formed()?;
        tracing::debug!(
            frontend = self.name,
            module = decoder.name(),
            nodes = decoder.graph().node_count(),
            frozen = decoder.is_frozen(),
            "loaded input model"
        );
        Ok(InputModel { decoder })
    }

    /// Lowers the input model. Tuple and list outputs are expanded into
    /// separate results in order; `None` outputs produce no result.
    pub fn convert(&self, model: InputModel) -> Result<Model, FrontendError> {
        let decoder = model.decoder;
        let converted =
            lowering::lower_graph(decoder.name(), decoder.graph(), decoder.parameters())?;
        tracing::info!(
            frontend = self.name,
            model = %converted.name,
            nodes = converted.nodes().len(),
            inputs = converted.inputs().len(),
            results = converted.outputs().len(),
            "converted model"
        );
        Ok(converted)
    }
}
