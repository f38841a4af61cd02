use fc_engine::Device;

use crate::{HarnessConfig, Precision};

/// Device-major cross product of devices and precisions, minus the
/// `(CPU, FP16)` pair. `None` on an axis takes the configured defaults;
/// an explicit empty slice yields no cases.
#[must_use]
pub fn build_param_matrix(
    devices: Option<&[Device]>,
    precisions: Option<&[Precision]>,
    config: &HarnessConfig,
) -> Vec<(Device, Precision)> {
    let devices = devices.unwrap_or(config.default_devices.as_slice());
    let precisions = precisions.unwrap_or(config.default_precisions.as_slice());
    devices
        .iter()
        .flat_map(|device| precisions.iter().map(move |precision| (*device, *precision)))
        .filter(|pair| *pair != (Device::Cpu, Precision::Fp16))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::build_param_matrix;
    use crate::{HarnessConfig, Precision};
    use fc_engine::Device;
    use proptest::prelude::*;

    #[test]
    fn test_cpu_half_precision_is_excluded() {
        let matrix = build_param_matrix(
            Some([Device::Cpu, Device::Gpu].as_slice()),
            Some([Precision::Fp32, Precision::Fp16].as_slice()),
            &HarnessConfig::default(),
        );
        assert_eq!(
            matrix,
            vec![
                (Device::Cpu, Precision::Fp32),
                (Device::Gpu, Precision::Fp32),
                (Device::Gpu, Precision::Fp16),
            ]
        );
    }

    #[test]
    fn test_defaults_come_from_config() {
        let matrix = build_param_matrix(None, None, &HarnessConfig::default());
        assert_eq!(matrix, vec![(Device::Cpu, Precision::Fp32)]);

        let config = HarnessConfig {
            default_devices: vec![Device::Gpu],
            ..HarnessConfig::default()
        };
        let matrix = build_param_matrix(None, Some([Precision::Bf16].as_slice()), &config);
        assert_eq!(matrix, vec![(Device::Gpu, Precision::Bf16)]);
    }

    #[test]
    fn test_explicit_empty_axis_is_empty() {
        let config = HarnessConfig::default();
        assert!(build_param_matrix(Some(&[][..]), None, &config).is_empty());
        assert!(build_param_matrix(None, Some(&[][..]), &config).is_empty());
    }

    proptest! {
        #[test]
        fn prop_matrix_never_pairs_cpu_with_fp16(
            devices in proptest::collection::vec(prop::sample::select(vec![Device::Cpu, Device::Gpu]), 0..4),
            precisions in proptest::collection::vec(prop::sample::select(Precision::ALL.to_vec()), 0..4),
        ) {
            let matrix = build_param_matrix(
                Some(devices.as_slice()),
                Some(precisions.as_slice()),
                &HarnessConfig::default(),
            );
            prop_assert!(!matrix.contains(&(Device::Cpu, Precision::Fp16)));
            let excluded = devices.iter().filter(|d| **d == Device::Cpu).count()
                * precisions.iter().filter(|p| **p == Precision::Fp16).count();
            prop_assert_eq!(matrix.len(), devices.len() * precisions.len() - excluded);
        }
    }
}
