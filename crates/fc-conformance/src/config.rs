use fc_engine::Device;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::{HarnessError, Precision};

pub const ENV_DEVICES: &str = "FC_TEST_DEVICE";
pub const ENV_PRECISIONS: &str = "FC_TEST_PRECISION";
pub const ENV_INFER_TIMEOUT: &str = "FC_INFER_TIMEOUT_SECS";
pub const ENV_LOG_DIR: &str = "FC_TEST_LOG_DIR";

/// Defaults shared by every test case in a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    pub default_devices: Vec<Device>,
    pub default_precisions: Vec<Precision>,
    #[serde(rename = "infer_timeout_secs", with = "secs")]
    pub infer_timeout: Duration,
    /// Directory receiving one JSON test-log record per case.
    pub log_dir: Option<PathBuf>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            default_devices: vec![Device::Cpu],
            default_precisions: vec![Precision::Fp32, Precision::Fp16],
            infer_timeout: Duration::from_secs(60),
            log_dir: None,
        }
    }
}

impl HarnessConfig {
    pub fn from_env() -> Result<Self, HarnessError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Applies overrides from `lookup` on top of the defaults. Unset or blank
    /// variables keep the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, HarnessError> {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|raw| !raw.trim().is_empty());

        if let Some(raw) = get(ENV_DEVICES) {
            config.default_devices = parse_list(ENV_DEVICES, &raw)?;
        }
        if let Some(raw) = get(ENV_PRECISIONS) {
            config.default_precisions = parse_list(ENV_PRECISIONS, &raw)?;
        }
        if let Some(raw) = get(ENV_INFER_TIMEOUT) {
            let secs = raw.trim().parse::<u64>().map_err(|err| {
                HarnessError::Configuration(format!("{ENV_INFER_TIMEOUT}=`{raw}`: {err}"))
            })?;
            config.infer_timeout = Duration::from_secs(secs);
        }
        if let Some(raw) = get(ENV_LOG_DIR) {
            config.log_dir = Some(PathBuf::from(raw.trim()));
        }
        tracing::debug!(?config, "resolved harness configuration");
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, HarnessError> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            HarnessError::Configuration(format!("cannot read {}: {err}", path.display()))
        })?;
        serde_json::from_str(&raw).map_err(|err| {
            HarnessError::Configuration(format!("cannot parse {}: {err}", path.display()))
        })
    }
}

/// Splits on `,` or `;` and parses every non-empty item.
fn parse_list<T>(key: &str, raw: &str) -> Result<Vec<T>, HarnessError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.split([',', ';'])
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            item.parse::<T>()
                .map_err(|err| HarnessError::Configuration(format!("{key}: {err}")))
        })
        .collect()
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::{ENV_DEVICES, ENV_INFER_TIMEOUT, ENV_PRECISIONS, HarnessConfig};
    use crate::{HarnessError, Precision};
    use fc_engine::Device;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect::<BTreeMap<_, _>>();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_overrides() {
        let config = HarnessConfig::from_lookup(lookup(&[])).expect("config");
        assert_eq!(config, HarnessConfig::default());
        assert_eq!(config.default_devices, vec![Device::Cpu]);
        assert_eq!(
            config.default_precisions,
            vec![Precision::Fp32, Precision::Fp16]
        );
    }

    #[test]
    fn test_overrides_accept_both_separators() {
        let config = HarnessConfig::from_lookup(lookup(&[
            (ENV_DEVICES, "CPU;gpu"),
            (ENV_PRECISIONS, "FP32, BF16"),
            (ENV_INFER_TIMEOUT, "5"),
        ]))
        .expect("config");
        assert_eq!(config.default_devices, vec![Device::Cpu, Device::Gpu]);
        assert_eq!(
            config.default_precisions,
            vec![Precision::Fp32, Precision::Bf16]
        );
        assert_eq!(config.infer_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_unknown_labels_are_configuration_errors() {
        let err = HarnessConfig::from_lookup(lookup(&[(ENV_DEVICES, "CPU;NPU")]))
            .expect_err("NPU is not a device");
        assert!(matches!(err, HarnessError::Configuration(ref msg) if msg.contains("NPU")));

        let err = HarnessConfig::from_lookup(lookup(&[(ENV_PRECISIONS, "INT8")]))
            .expect_err("INT8 is not a precision");
        assert!(matches!(err, HarnessError::Configuration(_)));
    }

    #[test]
    fn test_blank_variables_keep_defaults() {
        let config =
            HarnessConfig::from_lookup(lookup(&[(ENV_DEVICES, "  ")])).expect("config");
        assert_eq!(config.default_devices, vec![Device::Cpu]);
    }

    #[test]
    fn test_json_file_fills_missing_fields_with_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("harness.json");
        std::fs::write(
            &path,
            r#"{ "default_devices": ["GPU"], "infer_timeout_secs": 3 }"#,
        )
        .expect("write");
        let config = HarnessConfig::from_json_file(&path).expect("config");
        assert_eq!(config.default_devices, vec![Device::Gpu]);
        assert_eq!(config.default_precisions, HarnessConfig::default().default_precisions);
        assert_eq!(config.infer_timeout, Duration::from_secs(3));

        std::fs::write(&path, r#"{ "default_devices": ["TPU"] }"#).expect("write");
        assert!(matches!(
            HarnessConfig::from_json_file(&path),
            Err(HarnessError::Configuration(_))
        ));
    }
}
