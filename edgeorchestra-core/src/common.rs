//! Identifiers and device telemetry types.

use std::{collections::BTreeSet, str::FromStr};

use derive_more::Display;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

/// An error related to parsing an identifier from its string form.
#[derive(Error, Debug)]
pub enum ParseIdError {
    #[error("not a valid UUID: {0}")]
    Uuid(#[from] uuid::Error),
    #[error("not a valid model id: expected 64 lowercase hex characters")]
    ModelId,
}

/// The server-assigned identifier of a registered device.
#[derive(
    Debug,
    Display,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
pub struct DeviceId(Uuid);

impl DeviceId {
    /// Generates a fresh random device id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl FromStr for DeviceId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// The identifier of a training job.
#[derive(
    Debug,
    Display,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
pub struct JobId(Uuid);

impl JobId {
    /// Generates a fresh random job id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl FromStr for JobId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// The content address of a model artifact: the lowercase hex encoding of the
/// SHA-256 digest of its bytes.
#[derive(Debug, Display, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModelId(String);

impl ModelId {
    /// Computes the content address of `bytes`.
    pub fn digest(bytes: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for ModelId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            Ok(Self(s.to_string()))
        } else {
            Err(ParseIdError::ModelId)
        }
    }
}

/// The lifecycle status of a device.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    #[display(fmt = "online")]
    Online,
    #[display(fmt = "offline")]
    Offline,
    #[display(fmt = "training")]
    Training,
    #[display(fmt = "error")]
    Error,
}

/// The reported charging state of a device battery.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatteryState {
    #[display(fmt = "charging")]
    Charging,
    #[display(fmt = "full")]
    Full,
    #[display(fmt = "discharging")]
    Discharging,
    #[display(fmt = "not_charging")]
    NotCharging,
    #[display(fmt = "unspecified")]
    Unspecified,
}

impl Default for BatteryState {
    fn default() -> Self {
        BatteryState::Unspecified
    }
}

/// A device telemetry snapshot as reported with each heartbeat.
///
/// All load figures are fractions in `0..=1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceMetrics {
    pub cpu_usage: f32,
    pub memory_usage: f32,
    pub thermal_pressure: f32,
    pub battery_level: f32,
    #[serde(default)]
    pub battery_state: BatteryState,
    #[serde(default)]
    pub low_power_mode: bool,
}

impl Default for DeviceMetrics {
    fn default() -> Self {
        Self {
            cpu_usage: 0.0,
            memory_usage: 0.0,
            thermal_pressure: 0.0,
            battery_level: 0.0,
            battery_state: BatteryState::Unspecified,
            low_power_mode: false,
        }
    }
}

/// The hardware capabilities a device advertises at registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    pub chip: String,
    pub memory_bytes: u64,
    pub cpu_cores: u32,
    pub gpu_cores: u32,
    pub neural_engine_cores: u32,
    /// Training frameworks the on-device trainer supports.
    pub supported_frameworks: BTreeSet<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_id_digest_shape() {
        let id = ModelId::digest(b"weights");
        assert_eq!(id.as_str().len(), 64);
        assert_eq!(id, id.as_str().parse().unwrap());
    }

    #[test]
    fn test_model_id_rejects_bad_input() {
        assert!("not-hex".parse::<ModelId>().is_err());
        assert!("ABCD".repeat(16).parse::<ModelId>().is_err());
    }

    #[test]
    fn test_device_id_roundtrip() {
        let id = DeviceId::generate();
        assert_eq!(id, id.to_string().parse().unwrap());
    }

    #[test]
    fn test_status_serde_names() {
        assert_eq!(serde_json::to_string(&DeviceStatus::Online).unwrap(), "\"online\"");
        assert_eq!(
            serde_json::to_string(&BatteryState::NotCharging).unwrap(),
            "\"not_charging\""
        );
        assert_eq!(DeviceStatus::Training.to_string(), "training");
    }
}
