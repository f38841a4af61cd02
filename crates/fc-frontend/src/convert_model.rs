use fc_core::Value;
use fc_engine::{Model, PartialShape};
use fc_script::ScriptModule;

use crate::{FrontEndManager, FrontendError, GraphDecoder};

/// Options for [`convert_model`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConvertOptions {
    /// Values whose element types (and, with `static_shapes`, shapes) are
    /// stamped onto the model inputs.
    pub example_inputs: Option<Vec<Value>>,
    /// Use the example shapes as static input shapes instead of rank-only
    /// wildcards.
    pub static_shapes: bool,
}

/// Freezes and converts a captured module in one call. With example inputs
/// the returned model is already validated; without them the inputs stay
/// untyped and the caller must set element types before compiling.
pub fn convert_model(
    module: &ScriptModule,
    options: &ConvertOptions,
) -> Result<Model, FrontendError> {
    let frontend = FrontEndManager::new().load_by_framework("script")?;
    let decoder = GraphDecoder::new(module, true)?;
    let mut model = frontend.convert(frontend.load(decoder)?)?;

    let Some(examples) = &options.example_inputs else {
        return Ok(model);
    };
    if examples.len() != model.inputs().len() {
        return Err(FrontendError::ExampleInputs {
            expected: model.inputs().len(),
            actual: examples.len(),
        });
    }
    for (index, example) in examples.iter().enumerate() {
        let dims = match example {
            Value::Scalar(_) => Vec::new(),
            Value::Tensor(tensor) => tensor.shape.dims.to_vec(),
        };
        let shape = if options.static_shapes {
            PartialShape::from_static(&dims)
        } else {
            PartialShape::wildcard(dims.len())
        };
        model.set_element_type(index, example.dtype())?;
        model.set_partial_shape(index, shape)?;
    }
    model.validate_nodes_and_infer_types()?;
    tracing::debug!(
        model = %model.name,
        static_shapes = options.static_shapes,
        "typed model from example inputs"
    );
    Ok(model)
}
