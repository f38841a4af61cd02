use crate::{DType, Literal, Shape, TensorValue};
use proptest::prelude::*;

pub fn arb_dtype() -> impl Strategy<Value = DType> {
    prop::sample::select(DType::ALL.to_vec())
}

pub fn arb_literal() -> impl Strategy<Value = Literal> {
    prop_oneof![
        (-1_000_000_i64..1_000_000).prop_map(Literal::I64),
        any::<bool>().prop_map(Literal::Bool),
        (-1.0e6_f64..1.0e6).prop_map(Literal::from_f64),
        Just(Literal::from_f64(f64::NAN)),
    ]
}

pub fn arb_shape() -> impl Strategy<Value = Shape> {
    prop::collection::vec(1_u32..4, 0..=3).prop_map(Shape::new)
}

pub fn arb_f32_tensor() -> impl Strategy<Value = TensorValue> {
    arb_shape().prop_flat_map(|shape| {
        let count = shape.element_count().unwrap_or(1) as usize;
        prop::collection::vec(-100.0_f64..100.0, count).prop_map(move |values| {
            TensorValue::from_f64s(DType::F32, shape.clone(), &values)
                .unwrap_or_else(|_| TensorValue::rank0(DType::F32, Literal::from_f64(0.0)))
        })
    })
}
