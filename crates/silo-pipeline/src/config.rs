//! Configuration types for the pipeline
//!
//! One YAML file describes every stage; each deployed process loads the same
//! file and runs the stage it was started for. Values support `${VAR}` /
//! `${VAR:-default}` environment expansion. Configuration is read once at
//! process start and never mutated at runtime.

use crate::error::{PipelineError, Result};
use crate::stages::transformer::TransformRule;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use silo_bus::BusConfig;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use validator::Validate;

/// Pre-compiled regex for environment variable expansion
/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Root configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    /// Message bus (embedded; data_dir empty = in-memory)
    #[serde(default)]
    pub bus: BusConfig,

    /// Metadata registry backend
    #[serde(default)]
    pub registry: RegistrySettings,

    /// Destination store backend
    #[serde(default)]
    pub store: StoreSettings,

    /// Topic names per hop
    #[serde(default)]
    pub topics: TopicConfig,

    /// Consumer group per stage
    #[serde(default)]
    pub groups: GroupConfig,

    /// Global runtime settings
    #[serde(default)]
    pub settings: GlobalSettings,

    /// Connector stage
    #[serde(default)]
    pub connector: ConnectorSettings,

    /// Detector stage
    #[serde(default)]
    pub detector: DetectorSettings,

    /// Extractor stage
    #[serde(default)]
    pub extractor: ExtractorSettings,

    /// Transformer stage
    #[serde(default)]
    pub transformer: TransformerSettings,

    /// Loader stage
    #[serde(default)]
    pub loader: LoaderSettings,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        // An empty document is a fully defaulted config
        serde_yaml::from_str("{}").expect("empty pipeline config must deserialize")
    }
}

impl PipelineConfig {
    /// Load from a YAML file, expanding `${VAR}` / `${VAR:-default}`
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml(&raw)
    }

    /// Parse from a YAML string, expanding environment variables
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let expanded = expand_env_vars(raw);
        let config: Self = serde_yaml::from_str(&expanded)
            .map_err(|e| PipelineError::config(format!("invalid pipeline config: {}", e)))?;
        config.validate_all()?;
        Ok(config)
    }

    /// Validate every stage section
    pub fn validate_all(&self) -> Result<()> {
        self.settings
            .validate()
            .and_then(|_| self.connector.validate())
            .and_then(|_| self.detector.validate())
            .and_then(|_| self.extractor.validate())
            .map_err(|e| PipelineError::config(e.to_string()))
    }
}

/// Expand `${VAR}` and `${VAR:-default}` from the process environment.
/// Unset variables without a default expand to the empty string.
fn expand_env_vars(raw: &str) -> String {
    ENV_VAR_REGEX
        .replace_all(raw, |caps: &regex::Captures<'_>| {
            let var = &caps[1];
            match std::env::var(var) {
                Ok(value) => value,
                Err(_) => caps.get(2).map(|d| d.as_str().to_string()).unwrap_or_default(),
            }
        })
        .into_owned()
}

/// Backend selection for the registry and the destination store.
///
/// `memory` serves tests and single-process deployments; a database-backed
/// variant plugs in here without touching stage code (both components sit
/// behind storage traits).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Memory,
}

/// Metadata registry settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RegistrySettings {
    #[serde(default)]
    pub backend: BackendKind,
}

/// Destination store settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StoreSettings {
    #[serde(default)]
    pub backend: BackendKind,
}

/// Topic name per pipeline hop
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TopicConfig {
    #[serde(default = "default_raw_topic")]
    pub raw: String,

    #[serde(default = "default_resolved_topic")]
    pub resolved: String,

    #[serde(default = "default_rows_topic")]
    pub rows: String,

    #[serde(default = "default_transformed_topic")]
    pub transformed: String,

    /// Dead-letter topic consumed by an external operator tool
    #[serde(default = "default_dead_letter_topic")]
    pub dead_letter: String,
}

fn default_raw_topic() -> String {
    "uploads.raw".to_string()
}

fn default_resolved_topic() -> String {
    "schema.resolved".to_string()
}

fn default_rows_topic() -> String {
    "rows.extracted".to_string()
}

fn default_transformed_topic() -> String {
    "rows.transformed".to_string()
}

fn default_dead_letter_topic() -> String {
    "pipeline.deadletter".to_string()
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            raw: default_raw_topic(),
            resolved: default_resolved_topic(),
            rows: default_rows_topic(),
            transformed: default_transformed_topic(),
            dead_letter: default_dead_letter_topic(),
        }
    }
}

impl TopicConfig {
    /// All topics, for bus bootstrap
    pub fn all(&self) -> [&str; 5] {
        [
            &self.raw,
            &self.resolved,
            &self.rows,
            &self.transformed,
            &self.dead_letter,
        ]
    }
}

/// Consumer group per consuming stage
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GroupConfig {
    #[serde(default = "default_detector_group")]
    pub detector: String,

    #[serde(default = "default_extractor_group")]
    pub extractor: String,

    #[serde(default = "default_transformer_group")]
    pub transformer: String,

    #[serde(default = "default_loader_group")]
    pub loader: String,
}

fn default_detector_group() -> String {
    "silo-detector".to_string()
}

fn default_extractor_group() -> String {
    "silo-extractor".to_string()
}

fn default_transformer_group() -> String {
    "silo-transformer".to_string()
}

fn default_loader_group() -> String {
    "silo-loader".to_string()
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            detector: default_detector_group(),
            extractor: default_extractor_group(),
            transformer: default_transformer_group(),
            loader: default_loader_group(),
        }
    }
}

/// Global runtime settings
#[derive(Debug, Clone, Deserialize, Serialize, Validate, JsonSchema)]
pub struct GlobalSettings {
    /// Per-message retry policy for transient failures
    #[serde(default)]
    pub retry: RetrySettings,

    /// Startup attachment policy (bus, registry, store)
    #[serde(default)]
    pub startup: StartupSettings,

    /// Messages fetched per partition per poll
    #[serde(default = "default_batch_size")]
    #[validate(range(min = 1))]
    pub batch_size: usize,

    /// Idle sleep between empty polls, milliseconds
    #[serde(default = "default_poll_interval_ms")]
    #[validate(range(min = 1))]
    pub poll_interval_ms: u64,

    /// Delay before re-checking a parked (schema-conflicted) partition
    #[serde(default = "default_park_retry_ms")]
    pub park_retry_ms: u64,

    /// Health endpoint
    #[serde(default)]
    pub health: HealthSettings,
}

fn default_batch_size() -> usize {
    64
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_park_retry_ms() -> u64 {
    5_000
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            retry: RetrySettings::default(),
            startup: StartupSettings::default(),
            batch_size: default_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
            park_retry_ms: default_park_retry_ms(),
            health: HealthSettings::default(),
        }
    }
}

impl GlobalSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn park_retry(&self) -> Duration {
        Duration::from_millis(self.park_retry_ms)
    }
}

/// Per-message retry policy
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_retries() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetrySettings {
    pub fn to_retry_config(&self) -> crate::retry::RetryConfig {
        crate::retry::RetryConfig {
            max_retries: self.max_retries,
            initial_delay: Duration::from_millis(self.initial_backoff_ms),
            max_delay: Duration::from_millis(self.max_backoff_ms),
            backoff_multiplier: self.backoff_multiplier,
        }
    }
}

/// Startup attachment policy
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct StartupSettings {
    #[serde(default = "default_attach_attempts")]
    pub attempts: u32,

    #[serde(default = "default_attach_delay_ms")]
    pub delay_ms: u64,
}

fn default_attach_attempts() -> u32 {
    10
}

fn default_attach_delay_ms() -> u64 {
    500
}

impl Default for StartupSettings {
    fn default() -> Self {
        Self {
            attempts: default_attach_attempts(),
            delay_ms: default_attach_delay_ms(),
        }
    }
}

impl StartupSettings {
    pub fn to_attach_config(&self) -> crate::retry::AttachConfig {
        crate::retry::AttachConfig {
            attempts: self.attempts,
            delay: Duration::from_millis(self.delay_ms),
        }
    }
}

/// Health endpoint settings
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct HealthSettings {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_health_port")]
    pub port: u16,

    #[serde(default = "default_health_path")]
    pub path: String,
}

fn default_health_port() -> u16 {
    8090
}

fn default_health_path() -> String {
    "/health".to_string()
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_health_port(),
            path: default_health_path(),
        }
    }
}

/// Connector stage settings
#[derive(Debug, Clone, Deserialize, Serialize, Validate, JsonSchema)]
pub struct ConnectorSettings {
    /// Directory raw uploads are stored under, keyed by source id
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,

    /// Accepted upload extensions (lowercase, without dot)
    #[serde(default = "default_upload_extensions")]
    #[validate(length(min = 1))]
    pub extensions: Vec<String>,
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("data/uploads")
}

fn default_upload_extensions() -> Vec<String> {
    vec!["csv".to_string(), "tsv".to_string(), "txt".to_string()]
}

impl Default for ConnectorSettings {
    fn default() -> Self {
        Self {
            upload_dir: default_upload_dir(),
            extensions: default_upload_extensions(),
        }
    }
}

/// Detector stage settings
#[derive(Debug, Clone, Deserialize, Serialize, Validate, JsonSchema)]
pub struct DetectorSettings {
    /// Data rows sampled for type inference
    #[serde(default = "default_sample_rows")]
    #[validate(range(min = 1))]
    pub sample_rows: usize,
}

fn default_sample_rows() -> usize {
    100
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            sample_rows: default_sample_rows(),
        }
    }
}

/// Extractor stage settings
#[derive(Debug, Clone, Deserialize, Serialize, Validate, JsonSchema)]
pub struct ExtractorSettings {
    /// Rows per published batch
    #[serde(default = "default_batch_rows")]
    #[validate(range(min = 1))]
    pub batch_rows: usize,

    /// Directory for per-source malformed-row sinks (JSONL)
    #[serde(default = "default_error_dir")]
    pub error_dir: PathBuf,
}

fn default_batch_rows() -> usize {
    2_000
}

fn default_error_dir() -> PathBuf {
    PathBuf::from("data/errors")
}

impl Default for ExtractorSettings {
    fn default() -> Self {
        Self {
            batch_rows: default_batch_rows(),
            error_dir: default_error_dir(),
        }
    }
}

/// Transformer stage settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TransformerSettings {
    /// Ordered rule list per source name. Sources without an entry pass
    /// through unchanged.
    #[serde(default)]
    pub rules: HashMap<String, Vec<TransformRule>>,
}

/// Loader stage settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoaderSettings {
    /// Prefix for destination table names (table = prefix + source name)
    #[serde(default = "default_table_prefix")]
    pub table_prefix: String,

    /// Declared natural-key columns per source name. Sources without an
    /// entry fall back to a content hash of the row.
    #[serde(default)]
    pub natural_keys: HashMap<String, Vec<String>>,
}

fn default_table_prefix() -> String {
    "src_".to_string()
}

impl Default for LoaderSettings {
    fn default() -> Self {
        Self {
            table_prefix: default_table_prefix(),
            natural_keys: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_defaults() {
        let config = PipelineConfig::from_yaml("{}").unwrap();
        assert_eq!(config.topics.raw, "uploads.raw");
        assert_eq!(config.groups.loader, "silo-loader");
        assert_eq!(config.settings.batch_size, 64);
        assert_eq!(config.detector.sample_rows, 100);
        assert!(config.transformer.rules.is_empty());
    }

    #[test]
    fn test_env_expansion() {
        std::env::set_var("SILO_TEST_TOPIC", "uploads.custom");
        let config = PipelineConfig::from_yaml(
            "topics:\n  raw: ${SILO_TEST_TOPIC}\n  resolved: ${SILO_TEST_UNSET:-schema.fallback}\n",
        )
        .unwrap();
        assert_eq!(config.topics.raw, "uploads.custom");
        assert_eq!(config.topics.resolved, "schema.fallback");
        std::env::remove_var("SILO_TEST_TOPIC");
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = PipelineConfig::from_yaml("settings:\n  batch_size: 0\n").unwrap_err();
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn test_transform_rules_parse() {
        let config = PipelineConfig::from_yaml(
            r#"
transformer:
  rules:
    enrollment:
      - type: rename
        from: revenue
        to: revenue_usd
      - type: drop
        column: internal_note
"#,
        )
        .unwrap();
        let rules = &config.transformer.rules["enrollment"];
        assert_eq!(rules.len(), 2);
    }

    #[test]
    fn test_topics_all() {
        let config = PipelineConfig::default();
        assert_eq!(config.topics.all().len(), 5);
    }
}
