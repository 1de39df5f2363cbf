//! Loading and validation of settings.
//!
//! Values defined in the configuration file can be overridden by environment
//! variables. An example configuration file lives in `configs/` at the
//! repository root.

use std::{fmt, net::SocketAddr, path::Path, path::PathBuf};

use config::{Config, ConfigError, Environment};
use redis::{ConnectionInfo, IntoConnectionInfo};
use serde::{
    de::{self, Deserializer, Visitor},
    Deserialize,
};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationError, ValidationErrors};

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Validate, Deserialize)]
/// The combined settings.
///
/// Each section in the configuration file corresponds to the identically named
/// settings field.
pub struct Settings {
    pub api: ApiSettings,
    #[serde(default)]
    pub heartbeat: HeartbeatSettings,
    #[serde(default)]
    #[validate]
    pub round: RoundSettings,
    #[serde(default)]
    #[validate]
    pub eligibility: EligibilitySettings,
    #[validate]
    pub model_store: ModelStoreSettings,
    #[serde(default)]
    pub sweeper: SweeperSettings,
    #[serde(default)]
    pub jobs: JobSettings,
    pub redis: RedisSettings,
    pub log: LoggingSettings,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation
    /// failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let settings: Settings = Self::load(path)?;
        settings.validate()?;
        Ok(settings)
    }

    fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Config::new();
        config.merge(config::File::from(path.as_ref()))?;
        config.merge(Environment::with_prefix("edgeorchestra").separator("__"))?;
        config.try_into()
    }
}

#[derive(Debug, Deserialize, Clone)]
/// gRPC API settings.
pub struct ApiSettings {
    /// The address to which the gRPC server should be bound.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [api]
    /// bind_address = "0.0.0.0:50051"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// EDGEORCHESTRA_API__BIND_ADDRESS=127.0.0.1:50051
    /// ```
    pub bind_address: SocketAddr,

    /// The path to the server certificate to enable TLS. If this is present,
    /// then `tls_key` must also be present.
    #[serde(default)]
    pub tls_certificate: Option<PathBuf>,

    /// The path to the server private key. If this is present, then
    /// `tls_certificate` must also be present.
    #[serde(default)]
    pub tls_key: Option<PathBuf>,

    /// The path to a trust anchor enabling mutual TLS. Client certificates
    /// are then required on every connection. Leave this out to disable
    /// client authentication.
    #[serde(default)]
    pub tls_client_auth: Option<PathBuf>,

    /// When set, every call must carry this value in its `x-api-key`
    /// metadata.
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Copy)]
/// Heartbeat protocol settings.
pub struct HeartbeatSettings {
    /// The interval in seconds at which workers are expected to send
    /// heartbeats.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [heartbeat]
    /// interval_s = 5
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// EDGEORCHESTRA_HEARTBEAT__INTERVAL_S=5
    /// ```
    #[serde(default = "default_heartbeat_interval")]
    pub interval_s: u64,

    /// The number of missed heartbeat intervals after which a device is
    /// considered stale. Liveness records expire after
    /// `miss_threshold * interval_s` seconds.
    #[serde(default = "default_miss_threshold")]
    pub miss_threshold: u32,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval_s: default_heartbeat_interval(),
            miss_threshold: default_miss_threshold(),
        }
    }
}

fn default_heartbeat_interval() -> u64 {
    5
}

fn default_miss_threshold() -> u32 {
    3
}

#[derive(Debug, Validate, Deserialize, Clone, Copy)]
#[validate(schema(function = "validate_round"))]
/// Training round settings.
pub struct RoundSettings {
    /// The soft deadline of a round, in seconds. Once it has passed, the
    /// round aggregates as soon as the quorum is met.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [round]
    /// timeout_s = 300
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// EDGEORCHESTRA_ROUND__TIMEOUT_S=300
    /// ```
    #[serde(default = "default_round_timeout")]
    pub timeout_s: u64,

    /// The grace period past the soft deadline, in seconds. At
    /// `timeout_s + grace_s` the round aggregates with whatever quorum it has,
    /// or aborts below quorum.
    #[serde(default = "default_round_grace")]
    pub grace_s: u64,

    /// The minimum number of accepted submissions required to aggregate a
    /// round.
    #[serde(default = "default_quorum_min")]
    pub quorum_min: usize,

    /// Seconds between participant-selection attempts while a round cannot
    /// reach its quorum of eligible devices.
    #[serde(default = "default_selection_backoff")]
    pub selection_backoff_s: u64,

    /// Selection attempts before the job is marked failed.
    #[serde(default = "default_selection_max_attempts")]
    pub selection_max_attempts: u32,

    /// How often an aborted round is retried before the job is marked failed.
    #[serde(default = "default_round_max_retries")]
    pub max_retries: u32,
}

impl RoundSettings {
    fn validate_round(&self) -> Result<(), ValidationError> {
        if self.quorum_min < 1 {
            return Err(ValidationError::new("quorum_min must be at least 1"));
        }
        if self.timeout_s == 0 {
            return Err(ValidationError::new("timeout_s must be positive"));
        }
        if self.selection_max_attempts == 0 {
            return Err(ValidationError::new(
                "selection_max_attempts must be positive",
            ));
        }
        Ok(())
    }
}

/// A wrapper for validate derive.
fn validate_round(s: &RoundSettings) -> Result<(), ValidationError> {
    s.validate_round()
}

impl Default for RoundSettings {
    fn default() -> Self {
        Self {
            timeout_s: default_round_timeout(),
            grace_s: default_round_grace(),
            quorum_min: default_quorum_min(),
            selection_backoff_s: default_selection_backoff(),
            selection_max_attempts: default_selection_max_attempts(),
            max_retries: default_round_max_retries(),
        }
    }
}

fn default_round_timeout() -> u64 {
    300
}

fn default_round_grace() -> u64 {
    60
}

fn default_quorum_min() -> usize {
    1
}

fn default_selection_backoff() -> u64 {
    15
}

fn default_selection_max_attempts() -> u32 {
    8
}

fn default_round_max_retries() -> u32 {
    3
}

#[derive(Debug, Validate, Deserialize, Clone, Copy)]
#[validate(schema(function = "validate_eligibility"))]
/// Worker eligibility thresholds.
pub struct EligibilitySettings {
    /// The minimum battery charge fraction a device must report to be
    /// selected for a round.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [eligibility]
    /// battery_floor = 0.30
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// EDGEORCHESTRA_ELIGIBILITY__BATTERY_FLOOR=0.30
    /// ```
    #[serde(default = "default_battery_floor")]
    pub battery_floor: f32,

    /// The maximum thermal pressure fraction a device may report and still be
    /// selected.
    #[serde(default = "default_thermal_ceiling")]
    pub thermal_ceiling: f32,
}

impl EligibilitySettings {
    fn validate_eligibility(&self) -> Result<(), ValidationError> {
        if (0. ..=1.).contains(&self.battery_floor) && (0. ..=1.).contains(&self.thermal_ceiling) {
            Ok(())
        } else {
            Err(ValidationError::new("thresholds must lie in [0, 1]"))
        }
    }
}

/// A wrapper for validate derive.
fn validate_eligibility(s: &EligibilitySettings) -> Result<(), ValidationError> {
    s.validate_eligibility()
}

impl Default for EligibilitySettings {
    fn default() -> Self {
        Self {
            battery_floor: default_battery_floor(),
            thermal_ceiling: default_thermal_ceiling(),
        }
    }
}

fn default_battery_floor() -> f32 {
    0.30
}

fn default_thermal_ceiling() -> f32 {
    0.70
}

#[derive(Debug, Validate, Deserialize, Clone)]
#[validate(schema(function = "validate_model_store"))]
/// Model blob store settings.
pub struct ModelStoreSettings {
    /// The directory under which model artifacts are stored, sharded by the
    /// first two hex characters of their content address.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [model_store]
    /// directory = "/var/lib/edgeorchestra/models"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// EDGEORCHESTRA_MODEL_STORE__DIRECTORY=/var/lib/edgeorchestra/models
    /// ```
    pub directory: PathBuf,

    /// The size of a model download chunk, in bytes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size_bytes: usize,

    /// How long an unreferenced blob is kept before garbage collection, in
    /// seconds.
    #[serde(default = "default_blob_retention")]
    pub blob_retention_s: u64,
}

impl ModelStoreSettings {
    fn validate_model_store(&self) -> Result<(), ValidationError> {
        if self.chunk_size_bytes == 0 {
            return Err(ValidationError::new("chunk_size_bytes must be positive"));
        }
        Ok(())
    }
}

/// A wrapper for validate derive.
fn validate_model_store(s: &ModelStoreSettings) -> Result<(), ValidationError> {
    s.validate_model_store()
}

fn default_chunk_size() -> usize {
    1024 * 1024
}

fn default_blob_retention() -> u64 {
    24 * 60 * 60
}

#[derive(Debug, Deserialize, Clone, Copy)]
/// Stale-device sweeper settings.
pub struct SweeperSettings {
    /// The sweep period in seconds.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [sweeper]
    /// period_s = 30
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// EDGEORCHESTRA_SWEEPER__PERIOD_S=30
    /// ```
    #[serde(default = "default_sweeper_period")]
    pub period_s: u64,
}

impl Default for SweeperSettings {
    fn default() -> Self {
        Self {
            period_s: default_sweeper_period(),
        }
    }
}

fn default_sweeper_period() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone, Copy)]
/// Limits on training jobs.
pub struct JobSettings {
    /// The maximum number of concurrently running jobs. Starting more fails
    /// with `resource_exhausted`.
    #[serde(default = "default_max_active_jobs")]
    pub max_active: usize,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            max_active: default_max_active_jobs(),
        }
    }
}

fn default_max_active_jobs() -> usize {
    8
}

#[derive(Debug, Deserialize)]
/// Redis settings.
pub struct RedisSettings {
    /// The URL where Redis is running.
    ///
    /// The format of the URL is
    /// `redis://[<username>][:<passwd>@]<hostname>[:port][/<db>]`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [redis]
    /// url = "redis://127.0.0.1/"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// EDGEORCHESTRA_REDIS__URL=redis://127.0.0.1/
    /// ```
    #[serde(deserialize_with = "deserialize_redis_url")]
    pub url: ConnectionInfo,
}

fn deserialize_redis_url<'de, D>(deserializer: D) -> Result<ConnectionInfo, D::Error>
where
    D: Deserializer<'de>,
{
    struct ConnectionInfoVisitor;

    impl<'de> Visitor<'de> for ConnectionInfoVisitor {
        type Value = ConnectionInfo;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(
                formatter,
                "redis://[<username>][:<passwd>@]<hostname>[:port][/<db>]"
            )
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            value
                .into_connection_info()
                .map_err(|_| de::Error::invalid_value(serde::de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(ConnectionInfoVisitor)
}

#[derive(Debug, Deserialize)]
/// Logging settings.
pub struct LoggingSettings {
    /// A comma-separated list of logging directives.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "info"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// EDGEORCHESTRA_LOG__FILTER=info
    /// ```
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a valid tracing filter directive")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(serde::de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_new() {
        assert!(Settings::new("../configs/config.toml").is_ok());
        assert!(Settings::new("").is_err());
    }

    #[test]
    fn test_defaults_match_protocol() {
        let heartbeat = HeartbeatSettings::default();
        assert_eq!(heartbeat.interval_s, 5);
        assert_eq!(heartbeat.miss_threshold, 3);

        let round = RoundSettings::default();
        assert_eq!(round.timeout_s, 300);
        assert_eq!(round.grace_s, 60);
        assert_eq!(round.quorum_min, 1);
        assert_eq!(round.selection_backoff_s, 15);
        assert_eq!(round.selection_max_attempts, 8);
        assert_eq!(round.max_retries, 3);

        let eligibility = EligibilitySettings::default();
        assert!((eligibility.battery_floor - 0.30).abs() < f32::EPSILON);
        assert!((eligibility.thermal_ceiling - 0.70).abs() < f32::EPSILON);
    }

    #[test]
    fn test_validate_round() {
        let mut round = RoundSettings::default();
        round.quorum_min = 0;
        assert!(round.validate().is_err());

        let mut round = RoundSettings::default();
        round.timeout_s = 0;
        assert!(round.validate().is_err());

        assert!(RoundSettings::default().validate().is_ok());
    }

    #[test]
    fn test_validate_eligibility() {
        let mut eligibility = EligibilitySettings::default();
        eligibility.battery_floor = 1.5;
        assert!(eligibility.validate().is_err());

        let mut eligibility = EligibilitySettings::default();
        eligibility.thermal_ceiling = -0.1;
        assert!(eligibility.validate().is_err());

        assert!(EligibilitySettings::default().validate().is_ok());
    }
}
