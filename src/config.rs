//! Translation configuration

use crate::error::{AbiError, AbiResult};
use crate::version::DriverVersion;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// `NV_MAX_DEVICES` on stock driver builds
pub const NV_MAX_DEVICES: u32 = 32;

/// `NV_MAX_SUBDEVICES` on stock driver builds
pub const NV_MAX_SUBDEVICES: u32 = 8;

/// Configuration for registry construction and request translation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AbiConfig {
    /// Device count constant sizing `UVM_MAX_GPUS` arrays
    pub max_devices: u32,
    /// Sub-device count; `UVM_MAX_GPUS_V2` is `max_devices * max_subdevices`
    pub max_subdevices: u32,
    /// Apply per-command request fixups (e.g. forced initialization flags)
    pub apply_request_fixups: bool,
    /// ABI version the client was built against, when it differs from the host driver
    pub client_version: Option<DriverVersion>,
}

impl Default for AbiConfig {
    fn default() -> Self {
        Self {
            max_devices: NV_MAX_DEVICES,
            max_subdevices: NV_MAX_SUBDEVICES,
            apply_request_fixups: true,
            client_version: None,
        }
    }
}

impl AbiConfig {
    /// Configuration for hosts exposing a single GPU without sub-devices
    pub fn single_device() -> Self {
        Self {
            max_devices: 1,
            max_subdevices: 1,
            ..Self::default()
        }
    }

    /// Parse configuration from a JSON document
    pub fn from_json_str(json: &str) -> AbiResult<Self> {
        let config: AbiConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> AbiResult<Self> {
        let text = fs::read_to_string(path.as_ref()).map_err(|e| {
            AbiError::InvalidConfig(format!("{}: {}", path.as_ref().display(), e))
        })?;
        Self::from_json_str(&text)
    }

    /// Check that the device constants can size a structure
    pub fn validate(&self) -> AbiResult<()> {
        if self.max_devices == 0 {
            return Err(AbiError::InvalidConfig("max_devices must be non-zero".to_string()));
        }
        if self.max_subdevices == 0 {
            return Err(AbiError::InvalidConfig("max_subdevices must be non-zero".to_string()));
        }
        if self.max_devices.checked_mul(self.max_subdevices).is_none() {
            return Err(AbiError::InvalidConfig(format!(
                "max_devices * max_subdevices overflows ({} * {})",
                self.max_devices, self.max_subdevices
            )));
        }
        Ok(())
    }

    /// Effective `UVM_MAX_GPUS`
    pub fn max_gpus(&self) -> usize {
        self.max_devices as usize
    }

    /// Effective `UVM_MAX_GPUS_V2`
    pub fn max_gpus_v2(&self) -> usize {
        self.max_devices as usize * self.max_subdevices as usize
    }
}
