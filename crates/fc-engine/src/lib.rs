#![forbid(unsafe_code)]

//! Inference engine for converted models.
//!
//! [`Core::compile_model`] binds a validated [`Model`] to a [`Device`] and an
//! inference precision; [`CompiledModel::infer`] runs it on host kernels.
//! Reduced-precision devices round every floating intermediate through the
//! inference precision, so results carry the same element types as at full
//! precision but with reduced accuracy.

pub mod device;
mod executor;
pub mod ir;

use fc_core::{DType, TensorValue, Value, ValueError};
use fc_kernels::KernelError;
use std::time::{Duration, Instant};

pub use device::{Device, UnknownDevice};
pub use ir::{
    Body, Dimension, IrError, IrNode, IrOp, IrParameter, Model, OutputPort, PartialShape, PortInfo,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("{device} does not support {precision} inference")]
    UnsupportedPrecision { device: Device, precision: DType },
    #[error("expected {expected} inputs, got {actual}")]
    InputCount { expected: usize, actual: usize },
    #[error("input {index} (`{name}`): {detail}")]
    InputMismatch {
        index: usize,
        name: String,
        detail: String,
    },
    #[error("{0} was read before it was computed")]
    MissingPort(OutputPort),
    #[error("{op} failed: {detail}")]
    Execution { op: &'static str, detail: String },
    #[error("inference took {elapsed:?}, reaching the {limit:?} limit")]
    InferTimeout { elapsed: Duration, limit: Duration },
    #[error(transparent)]
    Ir(#[from] IrError),
    #[error(transparent)]
    Kernel(#[from] KernelError),
    #[error(transparent)]
    Value(#[from] ValueError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompileConfig {
    /// Overrides the device's default inference precision.
    pub inference_precision: Option<DType>,
    pub infer_timeout: Option<Duration>,
}

/// Entry point of the engine.
#[derive(Debug, Clone, Default)]
pub struct Core;

impl Core {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    #[must_use]
    pub fn available_devices(&self) -> Vec<Device> {
        Device::ALL.to_vec()
    }

    pub fn compile_model(
        &self,
        model: &Model,
        device: Device,
        config: &CompileConfig,
    ) -> Result<CompiledModel, EngineError> {
        let precision = config
            .inference_precision
            .unwrap_or_else(|| device.default_inference_precision());
        if !device.supports_precision(precision) {
            return Err(EngineError::UnsupportedPrecision { device, precision });
        }

        let mut model = model.clone();
        if !model.is_validated() {
            model.validate_nodes_and_infer_types()?;
        }
        tracing::debug!(
            model = %model.name,
            %device,
            %precision,
            timeout = ?config.infer_timeout,
            "compiled model"
        );
        Ok(CompiledModel {
            model,
            device,
            precision,
            infer_timeout: config.infer_timeout,
        })
    }
}

#[derive(Debug, Clone)]
pub struct CompiledModel {
    model: Model,
    device: Device,
    precision: DType,
    infer_timeout: Option<Duration>,
}

impl CompiledModel {
    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }

    #[must_use]
    pub fn inference_precision(&self) -> DType {
        self.precision
    }

    #[must_use]
    pub fn outputs(&self) -> &[OutputPort] {
        self.model.outputs()
    }

    #[must_use]
    pub fn output(&self, index: usize) -> Option<OutputPort> {
        self.model.outputs().get(index).copied()
    }

    pub fn infer(&self, inputs: &[Value]) -> Result<InferResult, EngineError> {
        self.check_inputs(inputs)?;
        let started = Instant::now();
        let values = executor::execute(&self.model, inputs, self.precision)?;
        let elapsed = started.elapsed();
        if let Some(limit) = self.infer_timeout
            && elapsed >= limit
        {
            return Err(EngineError::InferTimeout { elapsed, limit });
        }
        tracing::trace!(
            model = %self.model.name,
            outputs = values.len(),
            ?elapsed,
            "inference finished"
        );
        Ok(InferResult {
            values: self
                .model
                .outputs()
                .iter()
                .copied()
                .zip(values.into_iter().map(Value::into_tensor))
                .collect(),
        })
    }

    fn check_inputs(&self, inputs: &[Value]) -> Result<(), EngineError> {
        let parameters = self.model.inputs();
        if inputs.len() != parameters.len() {
            return Err(EngineError::InputCount {
                expected: parameters.len(),
                actual: inputs.len(),
            });
        }
        for (index, (parameter, input)) in parameters.iter().zip(inputs).enumerate() {
            let mismatch = |detail: String| EngineError::InputMismatch {
                index,
                name: parameter.name.clone(),
                detail,
            };
            if let Some(expected) = parameter.element_type
                && input.dtype() != expected
            {
                return Err(mismatch(format!(
                    "element type {} does not match {expected}",
                    input.dtype()
                )));
            }
            let dims: &[u32] = match input {
                Value::Scalar(_) => &[],
                Value::Tensor(tensor) => &tensor.shape.dims,
            };
            if !parameter.partial_shape.compatible_with(dims) {
                return Err(mismatch(format!(
                    "shape {dims:?} does not match {}",
                    parameter.partial_shape
                )));
            }
        }
        Ok(())
    }
}

/// Inference outputs keyed by output port, in model result order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferResult {
    values: Vec<(OutputPort, TensorValue)>,
}

impl InferResult {
    #[must_use]
    pub fn get(&self, port: OutputPort) -> Option<&TensorValue> {
        self.values
            .iter()
            .find(|(candidate, _)| *candidate == port)
            .map(|(_, value)| value)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (OutputPort, &TensorValue)> {
        self.values.iter().map(|(port, value)| (*port, value))
    }

    #[must_use]
    pub fn into_values(self) -> Vec<TensorValue> {
        self.values.into_iter().map(|(_, value)| value).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{CompileConfig, Core, Device, EngineError, IrNode, IrOp, IrParameter, Model};
    use super::{OutputPort, PartialShape};
    use fc_core::{DType, Shape, TensorValue, Value};
    use smallvec::smallvec;
    use std::time::Duration;

    fn relu_model() -> Model {
        let mut model = Model::new(
            "relu",
            vec![IrParameter {
                name: "x".to_owned(),
                element_type: Some(DType::F32),
                partial_shape: PartialShape::wildcard(1),
                output: OutputPort(0),
            }],
            vec![IrNode {
                op: IrOp::Relu,
                inputs: smallvec![OutputPort(0)],
                outputs: smallvec![OutputPort(1)],
            }],
            vec![OutputPort(1)],
        );
        model.validate_nodes_and_infer_types().expect("validate");
        model
    }

    fn f32s(values: &[f64]) -> Value {
        Value::Tensor(
            TensorValue::from_f64s(DType::F32, Shape::vector(values.len() as u32), values)
                .expect("tensor"),
        )
    }

    #[test]
    fn compile_and_infer_on_cpu() {
        let compiled = Core::new()
            .compile_model(&relu_model(), Device::Cpu, &CompileConfig::default())
            .expect("compile");
        assert_eq!(compiled.inference_precision(), DType::F32);
        let result = compiled.infer(&[f32s(&[-1.0, 2.0])]).expect("infer");
        let port = compiled.output(0).expect("port");
        assert_eq!(
            result.get(port),
            Some(&TensorValue::from_f64s(DType::F32, Shape::vector(2), &[0.0, 2.0]).expect("t"))
        );
        assert_eq!(compiled.output(1), None);
    }

    #[test]
    fn cpu_rejects_half_precision_hint() {
        let config = CompileConfig {
            inference_precision: Some(DType::F16),
            infer_timeout: None,
        };
        let err = Core::new()
            .compile_model(&relu_model(), Device::Cpu, &config)
            .expect_err("unsupported");
        assert_eq!(
            err,
            EngineError::UnsupportedPrecision {
                device: Device::Cpu,
                precision: DType::F16,
            }
        );
    }

    #[test]
    fn gpu_accepts_bfloat16_hint() {
        let config = CompileConfig {
            inference_precision: Some(DType::BF16),
            infer_timeout: None,
        };
        let compiled = Core::new()
            .compile_model(&relu_model(), Device::Gpu, &config)
            .expect("gpu runs bf16");
        assert_eq!(compiled.inference_precision(), DType::BF16);
        let result = compiled.infer(&[f32s(&[1.001, -3.0])]).expect("infer");
        let port = compiled.output(0).expect("port");
        assert_eq!(
            result.get(port),
            Some(&TensorValue::from_f64s(DType::F32, Shape::vector(2), &[1.0, 0.0]).expect("t"))
        );
    }

    #[test]
    fn input_type_and_rank_are_checked() {
        let compiled = Core::new()
            .compile_model(&relu_model(), Device::Gpu, &CompileConfig::default())
            .expect("compile");
        assert!(matches!(
            compiled.infer(&[Value::vector_i64(&[1]).expect("vector")]),
            Err(EngineError::InputMismatch { index: 0, .. })
        ));
        let matrix = Value::Tensor(
            TensorValue::from_f64s(DType::F32, Shape::new([1, 1]), &[1.0]).expect("tensor"),
        );
        assert!(matches!(
            compiled.infer(&[matrix]),
            Err(EngineError::InputMismatch { .. })
        ));
        assert!(matches!(
            compiled.infer(&[]),
            Err(EngineError::InputCount {
                expected: 1,
                actual: 0
            })
        ));
    }

    #[test]
    fn zero_timeout_is_enforced_after_inference() {
        let config = CompileConfig {
            inference_precision: None,
            infer_timeout: Some(Duration::ZERO),
        };
        let compiled = Core::new()
            .compile_model(&relu_model(), Device::Cpu, &config)
            .expect("compile");
        assert!(matches!(
            compiled.infer(&[f32s(&[1.0])]),
            Err(EngineError::InferTimeout { .. })
        ));
    }
}
