#![forbid(unsafe_code)]

//! Equivalence test fixture for the conversion frontend.
//!
//! A test case implements [`LayerTest`] to supply inputs and calls
//! [`LayerTest::run_equivalence_test`] once per `(device, precision)` pair
//! from [`build_param_matrix`]. Each run captures the module, converts it,
//! runs both the engine and the framework reference on the same inputs, and
//! fails on the first structural or exact mismatch or, after all outputs have
//! been compared, on any accuracy failure.

pub mod compare;
pub mod config;
mod flatten;
mod layer_test;
mod matrix;
mod precision;
mod report;

use fc_core::DType;
use fc_engine::{EngineError, IrError};
use fc_frontend::FrontendError;
use fc_script::ScriptError;

pub use compare::{Closeness, TOLERANCE_TABLE, allclose, check_output, compare_outputs, tolerance};
pub use config::HarnessConfig;
pub use flatten::{ReferenceOutput, flatten_reference};
pub use layer_test::{
    ConversionRoute, InputValue, LayerTest, TYPE_MAP, TestOptions, resolve_element_type,
};
pub use matrix::build_param_matrix;
pub use precision::{Precision, UnknownPrecision};
pub use report::{EquivalenceReport, OutputComparison};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HarnessError {
    #[error("{0}")]
    Configuration(String),
    #[error("unsupported input element type `{0}`")]
    UnsupportedType(String),
    #[error("{0}")]
    StructuralMismatch(String),
    #[error("output {index}: reference dtype {reference} differs from converted dtype {converted}")]
    DtypeMismatch {
        index: usize,
        reference: DType,
        converted: DType,
    },
    #[error("output {index}: converted value {converted} is not equal to reference {reference}")]
    ExactMismatch {
        index: usize,
        reference: String,
        converted: String,
    },
    #[error("Accuracy validation failed")]
    Accuracy {
        failed_outputs: Vec<usize>,
        max_abs_diff: f64,
    },
    #[error(transparent)]
    Script(#[from] ScriptError),
    #[error(transparent)]
    Frontend(#[from] FrontendError),
    #[error(transparent)]
    Ir(#[from] IrError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}
