use fc_core::{DType, Literal, Shape, TensorValue, Value};
use fc_engine::{CompileConfig, Core, Device, Model, PartialShape};
use fc_frontend::{ConvertOptions, FrontEndManager, GraphDecoder, convert_model};
use fc_script::{Graph, IValue, Module, NoGradGuard, ScriptModule, script, trace};
use fc_test_utils::{TestLogV1, TestPhaseTimings, TestResult, fixture_id_from_json, test_id};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::compare::{compare_outputs, tolerance};
use crate::{EquivalenceReport, HarnessConfig, HarnessError, Precision, flatten_reference};

/// Element types a converted model input may take, keyed by type name.
pub const TYPE_MAP: [(&str, DType); 8] = [
    ("float64", DType::F64),
    ("float32", DType::F32),
    ("bool", DType::Bool),
    ("int32", DType::I32),
    ("int64", DType::I64),
    ("int16", DType::I16),
    ("int8", DType::I8),
    ("uint8", DType::U8),
];

pub fn resolve_element_type(name: &str) -> Result<DType, HarnessError> {
    TYPE_MAP
        .iter()
        .find(|(candidate, _)| *candidate == name)
        .map(|(_, dtype)| *dtype)
        .ok_or_else(|| HarnessError::UnsupportedType(name.to_owned()))
}

/// One test input as produced by [`LayerTest::prepare_input`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputValue {
    Array(TensorValue),
    Scalar(Literal),
    List(Vec<Literal>),
}

impl InputValue {
    /// The value handed to the framework reference: lists stay lists.
    #[must_use]
    pub fn to_reference(&self) -> IValue {
        match self {
            Self::Array(tensor) => IValue::Tensor(tensor.clone()),
            Self::Scalar(lit) => IValue::Scalar(*lit),
            Self::List(items) => IValue::ScalarList(items.clone()),
        }
    }

    /// The value handed to the engine. Scalars become rank-0 arrays. Lists
    /// become 1-D arrays typed like an array library would type them, and
    /// integer lists are then narrowed from int64 to int32.
    pub fn to_converted(&self) -> Result<Value, HarnessError> {
        match self {
            Self::Array(tensor) => Ok(Value::Tensor(tensor.clone())),
            Self::Scalar(lit) => Ok(Value::Tensor(TensorValue::rank0(
                lit.natural_dtype(),
                *lit,
            ))),
            Self::List(items) => coerce_list(items).map(Value::Tensor),
        }
    }
}

fn coerce_list(items: &[Literal]) -> Result<TensorValue, HarnessError> {
    let dtype = if items.is_empty() || items.iter().any(|lit| matches!(lit, Literal::F64Bits(_)))
    {
        DType::F64
    } else if items.iter().all(|lit| matches!(lit, Literal::Bool(_))) {
        DType::Bool
    } else {
        DType::I32
    };
    let len = u32::try_from(items.len())
        .map_err(|_| HarnessError::Configuration("list input is too long".to_owned()))?;
    let elements = items.iter().map(|lit| lit.cast(dtype)).collect();
    TensorValue::new(dtype, Shape::vector(len), elements)
        .map_err(|err| HarnessError::Configuration(err.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionRoute {
    /// `GraphDecoder` → `FrontEnd::load` → `FrontEnd::convert`.
    #[default]
    Frontend,
    /// One-shot `convert_model` with the inputs as examples. Always freezes.
    ConvertModel,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestOptions {
    pub dynamic_shapes: bool,
    pub trace_model: bool,
    pub freeze_model: bool,
    pub input_prep_kwargs: Option<serde_json::Value>,
    pub custom_eps: Option<f64>,
    pub skip_reference: bool,
    pub route: ConversionRoute,
    pub infer_timeout: Option<Duration>,
    pub log_dir: Option<PathBuf>,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self::from_config(&HarnessConfig::default())
    }
}

impl TestOptions {
    #[must_use]
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self {
            dynamic_shapes: true,
            trace_model: false,
            freeze_model: true,
            input_prep_kwargs: None,
            custom_eps: None,
            skip_reference: false,
            route: ConversionRoute::Frontend,
            infer_timeout: Some(config.infer_timeout),
            log_dir: config.log_dir.clone(),
        }
    }
}

/// A layer test case: supplies inputs and checks that a module converts into
/// an engine model that computes the same outputs.
pub trait LayerTest {
    fn prepare_input(
        &self,
        _kwargs: Option<&serde_json::Value>,
    ) -> Result<Vec<InputValue>, HarnessError> {
        Err(HarnessError::Configuration(
            "Please provide inputs generation function".to_owned(),
        ))
    }

    /// Captures and converts `model`, checks that every kind in
    /// `expected_kinds` occurs in the captured graph, runs both sides on the
    /// same inputs and compares the outputs.
    fn run_equivalence_test(
        &self,
        model: Box<dyn Module>,
        expected_kinds: &[&str],
        device: Device,
        precision: Precision,
        options: &TestOptions,
    ) -> Result<EquivalenceReport, HarnessError> {
        run_equivalence(self, model, expected_kinds, device, precision, options)
    }
}

fn run_equivalence<T: LayerTest + ?Sized>(
    test: &T,
    mut model: Box<dyn Module>,
    expected_kinds: &[&str],
    device: Device,
    precision: Precision,
    options: &TestOptions,
) -> Result<EquivalenceReport, HarnessError> {
    let name = model.name().to_owned();
    let span = tracing::info_span!("equivalence", model = %name, %device, %precision);
    let _entered = span.enter();

    let mut timings = TestPhaseTimings::default();
    let outcome = execute(
        test,
        model.as_mut(),
        expected_kinds,
        device,
        precision,
        options,
        &mut timings,
    );
    if let Some(dir) = &options.log_dir {
        write_case_log(dir, &name, expected_kinds, device, precision, &outcome, timings);
    }
    outcome
}

/// Runs one case. Each phase stores its elapsed time in `timings` before its
/// error, if any, is propagated.
fn execute<T: LayerTest + ?Sized>(
    test: &T,
    model: &mut dyn Module,
    expected_kinds: &[&str],
    device: Device,
    precision: Precision,
    options: &TestOptions,
    timings: &mut TestPhaseTimings,
) -> Result<EquivalenceReport, HarnessError> {
    let inputs = test.prepare_input(options.input_prep_kwargs.as_ref())?;
    let reference_inputs = inputs.iter().map(InputValue::to_reference).collect::<Vec<_>>();
    let converted_inputs = inputs
        .iter()
        .map(InputValue::to_converted)
        .collect::<Result<Vec<_>, _>>()?;

    model.eval();
    let _no_grad = NoGradGuard::new();

    let started = Instant::now();
    let converted = capture_and_convert(model, &reference_inputs, &converted_inputs, options);
    timings.convert_ms = millis(started.elapsed());
    let (captured, converted) = converted?;

    check_kinds(captured.inlined_graph(), expected_kinds)?;

    let started = Instant::now();
    let inferred = compile_and_infer(&converted, &converted_inputs, device, precision, options);
    timings.infer_ms = millis(started.elapsed());
    let converted_outputs = inferred?;

    let mut report = EquivalenceReport {
        model: captured.name().to_owned(),
        device,
        precision,
        capture: captured.mode(),
        reference_skipped: options.skip_reference,
        outputs: Vec::new(),
        timings: timings.clone(),
    };
    if options.skip_reference {
        tracing::warn!("reference execution skipped; outputs are not compared");
        return Ok(report);
    }

    let started = Instant::now();
    let reference = captured.forward(&reference_inputs);
    timings.reference_ms = millis(started.elapsed());
    let reference = reference?;

    let started = Instant::now();
    let eps = tolerance(precision, options.custom_eps);
    let compared = compare_outputs(&flatten_reference(&reference), &converted_outputs, eps);
    timings.compare_ms = millis(started.elapsed());
    report.outputs = compared?;
    report.timings = timings.clone();
    tracing::info!(
        outputs = report.outputs.len(),
        max_abs_diff = ?report.max_abs_diff(),
        "outputs match"
    );
    Ok(report)
}

fn capture_and_convert(
    model: &dyn Module,
    reference_inputs: &[IValue],
    converted_inputs: &[Value],
    options: &TestOptions,
) -> Result<(ScriptModule, Model), HarnessError> {
    let captured = if options.trace_model {
        trace(model, reference_inputs)?
    } else {
        script(model)?
    };
    let mut converted = convert(&captured, converted_inputs, options)?;
    patch_inputs(&mut converted, converted_inputs, options.dynamic_shapes)?;
    Ok((captured, converted))
}

fn compile_and_infer(
    model: &Model,
    inputs: &[Value],
    device: Device,
    precision: Precision,
    options: &TestOptions,
) -> Result<Vec<TensorValue>, HarnessError> {
    let compiled = Core::new().compile_model(
        model,
        device,
        &CompileConfig {
            inference_precision: Some(precision.element_type()),
            infer_timeout: options.infer_timeout,
        },
    )?;
    Ok(compiled.infer(inputs)?.into_values())
}

fn convert(
    captured: &ScriptModule,
    examples: &[Value],
    options: &TestOptions,
) -> Result<Model, HarnessError> {
    match options.route {
        ConversionRoute::Frontend => {
            let frontend = FrontEndManager::new().load_by_framework("script")?;
            let decoder = GraphDecoder::new(captured, options.freeze_model)?;
            Ok(frontend.convert(frontend.load(decoder)?)?)
        }
        ConversionRoute::ConvertModel => {
            let convert_options = ConvertOptions {
                example_inputs: Some(examples.to_vec()),
                static_shapes: !options.dynamic_shapes,
            };
            Ok(convert_model(captured, &convert_options)?)
        }
    }
}

/// Stamps input element types and shapes onto the converted model and
/// re-runs type inference.
fn patch_inputs(model: &mut Model, inputs: &[Value], dynamic: bool) -> Result<(), HarnessError> {
    if model.inputs().len() != inputs.len() {
        return Err(HarnessError::Configuration(format!(
            "converted model takes {} inputs, prepare_input produced {}",
            model.inputs().len(),
            inputs.len()
        )));
    }
    for (index, input) in inputs.iter().enumerate() {
        let element_type = resolve_element_type(input.dtype().name())?;
        let dims: &[u32] = match input {
            Value::Scalar(_) => &[],
            Value::Tensor(tensor) => &tensor.shape.dims,
        };
        let shape = if dynamic {
            PartialShape::wildcard(dims.len())
        } else {
            PartialShape::from_static(dims)
        };
        tracing::debug!(index, %element_type, %shape, "patched input");
        model.set_element_type(index, element_type)?;
        model.set_partial_shape(index, shape)?;
    }
    model.validate_nodes_and_infer_types()?;
    Ok(())
}

fn check_kinds(graph: &Graph, expected_kinds: &[&str]) -> Result<(), HarnessError> {
    for kind in expected_kinds {
        if !graph.contains_kind(kind) {
            return Err(HarnessError::StructuralMismatch(format!(
                "Operation {kind} type doesn't exist in provided graph"
            )));
        }
    }
    Ok(())
}

fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

fn write_case_log(
    dir: &Path,
    model: &str,
    expected_kinds: &[&str],
    device: Device,
    precision: Precision,
    outcome: &Result<EquivalenceReport, HarnessError>,
    timings: TestPhaseTimings,
) {
    let case = serde_json::json!({
        "model": model,
        "kinds": expected_kinds,
        "device": device,
        "precision": precision,
    });
    let fixture_id = match fixture_id_from_json(&case) {
        Ok(id) => id,
        Err(err) => {
            tracing::warn!(%err, "cannot digest test case");
            return;
        }
    };
    let id = test_id(module_path!(), model);
    let log = match outcome {
        Ok(report) => report.to_test_log(&id, &fixture_id),
        Err(err) => failure_log(id, fixture_id, device, precision, err, timings),
    };
    match log.write_to_dir(dir) {
        Ok(path) => tracing::debug!(path = %path.display(), "wrote test log"),
        Err(err) => tracing::warn!(%err, dir = %dir.display(), "cannot write test log"),
    }
}

/// Log record for a failed case, keeping the timings of the phases that ran.
fn failure_log(
    test_id: String,
    fixture_id: String,
    device: Device,
    precision: Precision,
    err: &HarnessError,
    timings: TestPhaseTimings,
) -> TestLogV1 {
    let mut log = TestLogV1::case(
        test_id,
        fixture_id,
        device.as_str(),
        precision.as_str(),
        TestResult::Fail,
    )
    .with_phase_timings(timings);
    if let HarnessError::Accuracy { max_abs_diff, .. } = err {
        log.max_abs_diff = Some(*max_abs_diff);
    }
    log.details = Some(err.to_string());
    log
}

#[cfg(test)]
mod tests {
    use super::{InputValue, LayerTest, TYPE_MAP, failure_log, resolve_element_type};
    use crate::{HarnessError, Precision};
    use fc_core::{DType, Literal, Value};
    use fc_engine::Device;
    use fc_test_utils::{TestPhaseTimings, TestResult};

    #[test]
    fn test_every_mapped_type_name_resolves() {
        for (name, dtype) in TYPE_MAP {
            assert_eq!(resolve_element_type(name).expect("mapped"), dtype);
            assert_eq!(dtype.name(), name);
        }
        assert_eq!(
            resolve_element_type("float16"),
            Err(HarnessError::UnsupportedType("float16".to_owned()))
        );
        assert!(resolve_element_type("complex64").is_err());
    }

    #[test]
    fn test_integer_lists_are_narrowed() {
        let list = InputValue::List(vec![Literal::I64(2), Literal::I64(3)]);
        let Value::Tensor(tensor) = list.to_converted().expect("coerce") else {
            panic!("lists convert to tensors");
        };
        assert_eq!(tensor.dtype, DType::I32);
        assert_eq!(tensor.shape.dims, vec![2]);
        assert_eq!(
            list.to_reference(),
            fc_script::IValue::ScalarList(vec![Literal::I64(2), Literal::I64(3)])
        );
    }

    #[test]
    fn test_float_and_bool_lists_keep_their_category() {
        let floats = InputValue::List(vec![Literal::I64(1), Literal::from_f64(0.5)]);
        assert_eq!(floats.to_converted().expect("coerce").dtype(), DType::F64);
        let flags = InputValue::List(vec![Literal::Bool(true)]);
        assert_eq!(flags.to_converted().expect("coerce").dtype(), DType::Bool);
    }

    #[test]
    fn test_scalars_become_rank0_arrays() {
        let value = InputValue::Scalar(Literal::I64(4)).to_converted().expect("convert");
        let Value::Tensor(tensor) = value else {
            panic!("scalars convert to tensors");
        };
        assert_eq!(tensor.rank(), 0);
        assert_eq!(tensor.dtype, DType::I64);
    }

    #[test]
    fn test_default_input_generator_is_a_configuration_error() {
        struct NoInputs;
        impl LayerTest for NoInputs {}
        let err = NoInputs.prepare_input(None).expect_err("no generator");
        assert_eq!(
            err.to_string(),
            "Please provide inputs generation function"
        );
    }

    #[test]
    fn test_failed_case_log_keeps_phase_timings() {
        let timings = TestPhaseTimings {
            convert_ms: 12,
            infer_ms: 30,
            reference_ms: 5,
            compare_ms: 1,
        };
        let err = HarnessError::Accuracy {
            failed_outputs: vec![1],
            max_abs_diff: 0.5,
        };
        let log = failure_log(
            "suite::case".to_owned(),
            "abc".to_owned(),
            Device::Gpu,
            Precision::Bf16,
            &err,
            timings.clone(),
        );
        assert_eq!(log.result, TestResult::Fail);
        assert_eq!(log.precision, "BF16");
        assert_eq!(log.duration_ms, 48);
        assert_eq!(log.phase_timings, timings);
        assert_eq!(log.max_abs_diff, Some(0.5));
        assert_eq!(log.details.as_deref(), Some("Accuracy validation failed"));
    }
}
