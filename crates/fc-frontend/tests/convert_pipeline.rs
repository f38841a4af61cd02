use fc_core::{DType, Shape, TensorValue, Value};
use fc_engine::{CompileConfig, Core, Device};
use fc_frontend::{ConvertOptions, FrontEndManager, GraphDecoder, convert_model};
use fc_script::{GraphBuilder, GraphModule, IValue, Module, NodeKind, script, trace};
use proptest::prelude::*;

fn gated_linear() -> GraphModule {
    // y = if sum(x) > 0 { tanh(linear(x)) } else { -linear(x) }
    let mut g = GraphBuilder::new();
    let x = g.input("x");
    let w = g.get_attr("weight");
    let b = g.get_attr("bias");
    let projected = g.op(NodeKind::Linear, &[x, w, b]);
    let total = g.op(NodeKind::Sum, &[x]);
    let zero = g.constant(IValue::scalar_i64(0));
    let positive = g.op(NodeKind::Gt, &[total, zero]);
    let out = g.if_else(
        positive,
        |g| vec![g.op(NodeKind::Tanh, &[projected])],
        |g| vec![g.op(NodeKind::Neg, &[projected])],
    );
    let mut module = GraphModule::new("gated_linear", g.build(&out))
        .with_parameter(
            "weight",
            TensorValue::from_f64s(
                DType::F32,
                Shape::new([2, 3]),
                &[0.5, -0.25, 1.0, 0.0, 0.75, -1.5],
            )
            .expect("weight"),
        )
        .with_parameter(
            "bias",
            TensorValue::from_f64s(DType::F32, Shape::vector(2), &[0.1, -0.2]).expect("bias"),
        );
    module.eval();
    module
}

fn input(values: &[f64]) -> TensorValue {
    TensorValue::from_f64s(DType::F32, Shape::new([1, 3]), values).expect("input")
}

fn run_converted(module: &fc_script::ScriptModule, x: &TensorValue) -> TensorValue {
    let options = ConvertOptions {
        example_inputs: Some(vec![Value::Tensor(x.clone())]),
        static_shapes: false,
    };
    let model = convert_model(module, &options).expect("convert");
    let compiled = Core::new()
        .compile_model(&model, Device::Cpu, &CompileConfig::default())
        .expect("compile");
    let result = compiled
        .infer(&[Value::Tensor(x.clone())])
        .expect("infer");
    let port = compiled.output(0).expect("output port");
    result.get(port).cloned().expect("output tensor")
}

#[test]
fn scripted_branching_module_matches_reference_on_both_paths() {
    let scripted = script(&gated_linear()).expect("script");
    for values in [[1.0, 2.0, 3.0], [-1.0, -2.0, 0.5]] {
        let x = input(&values);
        let reference = scripted
            .forward(&[IValue::Tensor(x.clone())])
            .expect("reference");
        assert_eq!(reference, IValue::Tensor(run_converted(&scripted, &x)));
    }
}

#[test]
fn traced_module_keeps_only_the_recorded_branch() {
    let module = gated_linear();
    let x = input(&[1.0, 2.0, 3.0]);
    let traced = trace(&module, &[IValue::Tensor(x.clone())]).expect("trace");
    assert!(!traced.inlined_graph().contains_kind("prim::If"));
    assert!(traced.inlined_graph().contains_kind("aten::tanh"));

    let decoder = GraphDecoder::new(&traced, true).expect("decode");
    let frontend = FrontEndManager::new()
        .load_by_framework("script")
        .expect("frontend");
    let model = frontend
        .convert(frontend.load(decoder).expect("load"))
        .expect("convert");
    assert!(model.contains_type("Tanh"));
    assert!(!model.contains_type("If"));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_cpu_conversion_is_exact(values in proptest::collection::vec(-4.0f32..4.0, 3)) {
        let scripted = script(&gated_linear())
            .map_err(|err| TestCaseError::fail(err.to_string()))?;
        let values = values.iter().map(|v| f64::from(*v)).collect::<Vec<_>>();
        let x = input(&values);
        let reference = scripted
            .forward(&[IValue::Tensor(x.clone())])
            .map_err(|err| TestCaseError::fail(err.to_string()))?;
        prop_assert_eq!(reference, IValue::Tensor(run_converted(&scripted, &x)));
    }
}
