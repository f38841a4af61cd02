//! Per-output checks between flattened reference outputs and converted
//! tensors.

use fc_core::{Literal, TensorValue};
use serde::{Deserialize, Serialize};

use crate::{HarnessError, OutputComparison, Precision, ReferenceOutput};

/// Absolute and relative tolerance per precision label.
pub const TOLERANCE_TABLE: [(Precision, f64); 3] = [
    (Precision::Fp32, 1e-4),
    (Precision::Fp16, 5e-2),
    (Precision::Bf16, 5e-2),
];

/// Tolerance for `precision`; `custom_eps` replaces the FP32 entry only.
#[must_use]
pub fn tolerance(precision: Precision, custom_eps: Option<f64>) -> f64 {
    if precision == Precision::Fp32
        && let Some(eps) = custom_eps
    {
        return eps;
    }
    TOLERANCE_TABLE
        .iter()
        .find(|(label, _)| *label == precision)
        .map_or(5e-2, |(_, eps)| *eps)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Closeness {
    pub passed: bool,
    /// Largest `|converted - reference|` over pairs that are not both NaN
    /// or the same infinity. Infinite when lengths differ.
    pub max_abs_diff: f64,
    pub mismatched: usize,
}

/// `|converted - reference| <= atol + rtol * |reference|` elementwise, with
/// NaN matching NaN and equal-signed infinities matching.
#[must_use]
pub fn allclose(reference: &[f64], converted: &[f64], atol: f64, rtol: f64) -> Closeness {
    if reference.len() != converted.len() {
        return Closeness {
            passed: false,
            max_abs_diff: f64::INFINITY,
            mismatched: reference.len().max(converted.len()),
        };
    }
    let mut max_abs_diff = 0.0_f64;
    let mut mismatched = 0;
    for (expected, actual) in reference.iter().zip(converted) {
        if (expected.is_nan() && actual.is_nan())
            || (expected.is_infinite() && expected == actual)
        {
            continue;
        }
        let diff = (actual - expected).abs();
        let diff = if diff.is_nan() { f64::INFINITY } else { diff };
        max_abs_diff = max_abs_diff.max(diff);
        if diff.is_infinite() || diff > atol + rtol * expected.abs() {
            mismatched += 1;
        }
    }
    Closeness {
        passed: mismatched == 0,
        max_abs_diff,
        mismatched,
    }
}

fn literals_equal(a: Literal, b: Literal) -> bool {
    a.as_f64() == b.as_f64()
}

/// Exact and structural checks that precede the numeric comparison.
pub fn check_output(
    index: usize,
    reference: &ReferenceOutput,
    converted: &TensorValue,
) -> Result<(), HarnessError> {
    let outcome = exact_check(index, reference, converted);
    if let Err(err) = &outcome {
        tracing::warn!(
            index,
            kind = reference.kind(),
            reference = ?reference,
            converted = ?converted,
            %err,
            "output failed exact check"
        );
    }
    outcome
}

fn exact_check(
    index: usize,
    reference: &ReferenceOutput,
    converted: &TensorValue,
) -> Result<(), HarnessError> {
    match reference {
        ReferenceOutput::Scalar(expected) => match converted.item() {
            Ok(actual) if literals_equal(*expected, actual) => Ok(()),
            _ => Err(HarnessError::ExactMismatch {
                index,
                reference: expected.to_string(),
                converted: format_elements(converted),
            }),
        },
        ReferenceOutput::List(expected) => {
            let equal = expected.len() == converted.elements.len()
                && expected
                    .iter()
                    .zip(&converted.elements)
                    .all(|(a, b)| literals_equal(*a, *b));
            if equal {
                Ok(())
            } else {
                Err(HarnessError::ExactMismatch {
                    index,
                    reference: format!("{expected:?}"),
                    converted: format_elements(converted),
                })
            }
        }
        ReferenceOutput::Tensor(expected) => {
            if expected.dtype != converted.dtype {
                return Err(HarnessError::DtypeMismatch {
                    index,
                    reference: expected.dtype,
                    converted: converted.dtype,
                });
            }
            if expected.shape != converted.shape {
                return Err(HarnessError::StructuralMismatch(format!(
                    "output {index}: reference shape {:?} differs from converted shape {:?}",
                    expected.shape.dims, converted.shape.dims
                )));
            }
            Ok(())
        }
    }
}

/// Compares flattened reference outputs with converted outputs in order.
/// Length, exact and dtype mismatches fail immediately; numeric closeness is
/// evaluated for every output before any accuracy failure is reported.
pub fn compare_outputs(
    reference: &[ReferenceOutput],
    converted: &[TensorValue],
    eps: f64,
) -> Result<Vec<OutputComparison>, HarnessError> {
    if reference.len() != converted.len() {
        let err = HarnessError::StructuralMismatch(format!(
            "reference produced {} outputs, converted model produced {}",
            reference.len(),
            converted.len()
        ));
        tracing::warn!(%err, "output count differs");
        return Err(err);
    }

    let mut outputs = Vec::with_capacity(reference.len());
    for (index, (expected, actual)) in reference.iter().zip(converted).enumerate() {
        check_output(index, expected, actual)?;
        let closeness = allclose(&expected.to_f64_vec(), &actual.to_f64_vec(), eps, eps);
        tracing::debug!(
            index,
            kind = expected.kind(),
            reference = ?expected,
            converted = ?actual,
            atol = eps,
            rtol = eps,
            max_abs_diff = closeness.max_abs_diff,
            passed = closeness.passed,
            "compared output"
        );
        if !closeness.passed {
            tracing::warn!(
                index,
                max_abs_diff = closeness.max_abs_diff,
                mismatched = closeness.mismatched,
                eps,
                reference = ?expected,
                converted = ?actual,
                "output is outside tolerance"
            );
        }
        outputs.push(OutputComparison {
            index,
            kind: expected.kind(),
            tolerance: eps,
            max_abs_diff: closeness.max_abs_diff,
            passed: closeness.passed,
        });
    }

    let failed_outputs = outputs
        .iter()
        .filter(|output| !output.passed)
        .map(|output| output.index)
        .collect::<Vec<_>>();
    if !failed_outputs.is_empty() {
        let max_abs_diff = outputs
            .iter()
            .map(|output| output.max_abs_diff)
            .fold(0.0, f64::max);
        return Err(HarnessError::Accuracy {
            failed_outputs,
            max_abs_diff,
        });
    }
    tracing::debug!(
        atol = eps,
        rtol = eps,
        outputs = outputs.len(),
        "Accuracy validation successful"
    );
    Ok(outputs)
}

fn format_elements(tensor: &TensorValue) -> String {
    let items = tensor
        .elements
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>();
    format!("[{}]", items.join(", "))
}
