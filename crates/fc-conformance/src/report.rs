use fc_engine::Device;
use fc_script::CaptureMode;
use fc_test_utils::{TestLogV1, TestPhaseTimings, TestResult};
use serde::Serialize;

use crate::Precision;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputComparison {
    pub index: usize,
    /// `scalar`, `list` or `tensor`.
    pub kind: &'static str,
    pub tolerance: f64,
    pub max_abs_diff: f64,
    pub passed: bool,
}

/// Outcome of one successful equivalence run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EquivalenceReport {
    pub model: String,
    pub device: Device,
    pub precision: Precision,
    pub capture: CaptureMode,
    pub reference_skipped: bool,
    pub outputs: Vec<OutputComparison>,
    pub timings: TestPhaseTimings,
}

impl EquivalenceReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.outputs.iter().all(|output| output.passed)
    }

    #[must_use]
    pub fn max_abs_diff(&self) -> Option<f64> {
        self.outputs
            .iter()
            .map(|output| output.max_abs_diff)
            .reduce(f64::max)
    }

    #[must_use]
    pub fn to_test_log(&self, test_id: &str, fixture_id: &str) -> TestLogV1 {
        let result = if self.reference_skipped {
            TestResult::Skip
        } else if self.passed() {
            TestResult::Pass
        } else {
            TestResult::Fail
        };
        let mut log = TestLogV1::case(
            test_id,
            fixture_id,
            self.device.as_str(),
            self.precision.as_str(),
            result,
        )
        .with_phase_timings(self.timings.clone());
        log.max_abs_diff = self.max_abs_diff();
        if self.reference_skipped {
            log.details = Some("reference execution skipped".to_owned());
        }
        log
    }
}
