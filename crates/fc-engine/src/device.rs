//! Target devices and the precisions they execute at.

use fc_core::DType;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Device {
    Cpu,
    Gpu,
}

impl Device {
    pub const ALL: [Device; 2] = [Device::Cpu, Device::Gpu];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "CPU",
            Self::Gpu => "GPU",
        }
    }

    /// Precision used when the compile config carries no hint.
    #[must_use]
    pub fn default_inference_precision(self) -> DType {
        match self {
            Self::Cpu => DType::F32,
            Self::Gpu => DType::F16,
        }
    }

    #[must_use]
    pub fn supports_precision(self, precision: DType) -> bool {
        match self {
            Self::Cpu => matches!(precision, DType::F32 | DType::BF16),
            Self::Gpu => matches!(precision, DType::F32 | DType::F16 | DType::BF16),
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown device `{0}`")]
pub struct UnknownDevice(pub String);

impl std::str::FromStr for Device {
    type Err = UnknownDevice;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CPU" => Ok(Self::Cpu),
            "GPU" => Ok(Self::Gpu),
            _ => Err(UnknownDevice(s.to_owned())),
        }
    }
}
