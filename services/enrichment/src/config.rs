//! Service configuration, layered from defaults, config files and
//! `ENRICHMENT__*` environment variables.

use backoff::ExponentialBackoff;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while validating a loaded configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Main configuration for the enrichment service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Kafka notification consumer; the webhook is the only entry point when absent
    pub kafka: Option<KafkaConfig>,
    /// S3 configuration
    #[serde(default)]
    pub s3: S3Config,
    /// Record store configuration
    pub database: DatabaseConfig,
    /// Text extraction configuration
    #[serde(default)]
    pub ocr: OcrConfig,
    /// Batch processing configuration
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Kafka consumer configuration for bucket notifications
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    /// Kafka bootstrap servers
    pub bootstrap_servers: String,
    /// Consumer group ID
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    /// Topic the object store publishes bucket notifications to
    #[serde(default = "default_notification_topic")]
    pub notification_topic: String,
    /// Enable SSL
    #[serde(default)]
    pub ssl_enabled: bool,
    /// SSL CA certificate path
    pub ssl_ca_location: Option<String>,
    /// SASL username
    pub sasl_username: Option<String>,
    /// SASL password
    pub sasl_password: Option<String>,
    /// Auto offset reset policy
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u32,
    /// Max poll interval in milliseconds
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u32,
    /// First delay before a failed batch is redelivered
    #[serde(default = "default_redelivery_backoff_initial_ms")]
    pub redelivery_backoff_initial_ms: u64,
    /// Upper bound for the redelivery delay
    #[serde(default = "default_redelivery_backoff_max_ms")]
    pub redelivery_backoff_max_ms: u64,
}

/// S3 configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Bucket that presigned upload links point into
    pub upload_bucket: Option<String>,
    /// Presigned URL expiration in seconds
    #[serde(default = "default_presigned_url_expiry_secs")]
    pub presigned_url_expiry_secs: u64,
}

/// Record store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Table holding enriched records
    #[serde(default = "default_table_name")]
    pub table_name: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Create the records table on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Text extraction configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OcrConfig {
    /// Run text extraction at all
    #[serde(default)]
    pub enabled: bool,
    /// Objects larger than this are never sent for extraction
    #[serde(default = "default_ocr_max_bytes")]
    pub max_bytes: u64,
    /// Maximum number of text lines kept per record
    #[serde(default = "default_ocr_max_lines")]
    pub max_lines: usize,
    /// Upper bound on a single extraction call
    #[serde(default = "default_ocr_timeout_secs")]
    pub timeout_secs: u64,
}

/// Batch processing configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Notification origins accepted by the decoder
    #[serde(default = "default_accepted_sources")]
    pub accepted_sources: Vec<String>,
    /// Pairs processed concurrently within one batch
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Upper bound on fetch + extraction + upsert for one pair
    #[serde(default = "default_pair_timeout_secs")]
    pub pair_timeout_secs: u64,
    /// Upsert attempts before the batch is failed
    #[serde(default = "default_upsert_max_attempts")]
    pub upsert_max_attempts: u32,
    /// Initial delay between upsert attempts in milliseconds
    #[serde(default = "default_upsert_retry_base_ms")]
    pub upsert_retry_base_ms: u64,
}

/// API configuration for the query and notification endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

// Default value functions
fn default_service_name() -> String {
    "enrichment-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_consumer_group() -> String {
    "enrichment-service".to_string()
}

fn default_notification_topic() -> String {
    "images.bucket-notifications".to_string()
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_session_timeout_ms() -> u32 {
    30000
}

fn default_max_poll_interval_ms() -> u32 {
    300000
}

fn default_redelivery_backoff_initial_ms() -> u64 {
    1000
}

fn default_redelivery_backoff_max_ms() -> u64 {
    60000
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_presigned_url_expiry_secs() -> u64 {
    3600
}

fn default_table_name() -> String {
    "image_records".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_ocr_max_bytes() -> u64 {
    5 * 1024 * 1024 // 5MB
}

fn default_ocr_max_lines() -> usize {
    50
}

fn default_ocr_timeout_secs() -> u64 {
    15
}

fn default_accepted_sources() -> Vec<String> {
    vec!["aws:s3".to_string()]
}

fn default_concurrency() -> usize {
    8
}

fn default_pair_timeout_secs() -> u64 {
    30
}

fn default_upsert_max_attempts() -> u32 {
    3
}

fn default_upsert_retry_base_ms() -> u64 {
    100
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("config/enrichment").required(false))
            .add_source(config::File::with_name("/etc/enrichment/enrichment").required(false))
            // Override with environment variables
            // ENRICHMENT__OCR__MAX_BYTES -> ocr.max_bytes
            .add_source(
                config::Environment::with_prefix("ENRICHMENT")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("pipeline.accepted_sources")
                    .with_list_parse_key("api.cors_origins")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ocr.max_lines == 0 {
            return Err(ConfigError::InvalidValue {
                key: "ocr.max_lines".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        if self.pipeline.concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "pipeline.concurrency".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        if self.pipeline.upsert_max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "pipeline.upsert_max_attempts".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        if !is_plain_identifier(&self.database.table_name) {
            return Err(ConfigError::InvalidValue {
                key: "database.table_name".to_string(),
                message: format!(
                    "'{}' is not a plain SQL identifier",
                    self.database.table_name
                ),
            });
        }

        Ok(())
    }

    /// Get presigned URL expiry as Duration
    pub fn presigned_url_expiry(&self) -> Duration {
        Duration::from_secs(self.s3.presigned_url_expiry_secs)
    }
}

impl KafkaConfig {
    /// Backoff applied between redeliveries of the same failed batch
    pub fn redelivery_backoff(&self) -> ExponentialBackoff {
        let initial = Duration::from_millis(self.redelivery_backoff_initial_ms);
        ExponentialBackoff {
            current_interval: initial,
            initial_interval: initial,
            max_interval: Duration::from_millis(self.redelivery_backoff_max_ms),
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

impl OcrConfig {
    /// Get extraction timeout as Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl PipelineConfig {
    /// Get per-pair timeout as Duration
    pub fn pair_timeout(&self) -> Duration {
        Duration::from_secs(self.pair_timeout_secs)
    }

    /// Get initial upsert retry delay as Duration
    pub fn upsert_retry_base(&self) -> Duration {
        Duration::from_millis(self.upsert_retry_base_ms)
    }
}

/// Table names are interpolated into SQL, so only `[A-Za-z_][A-Za-z0-9_]*` is allowed
pub(crate) fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
            upload_bucket: None,
            presigned_url_expiry_secs: default_presigned_url_expiry_secs(),
        }
    }
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_bytes: default_ocr_max_bytes(),
            max_lines: default_ocr_max_lines(),
            timeout_secs: default_ocr_timeout_secs(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            accepted_sources: default_accepted_sources(),
            concurrency: default_concurrency(),
            pair_timeout_secs: default_pair_timeout_secs(),
            upsert_max_attempts: default_upsert_max_attempts(),
            upsert_retry_base_ms: default_upsert_retry_base_ms(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
        }
    }
}
