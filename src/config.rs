use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the coffer control plane
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    pub service: ServiceConfig,
    /// PostgreSQL configuration
    pub database: DatabaseConfig,
    /// Blob store (S3) configuration
    pub s3: S3Config,
    /// Pre-signed session defaults
    #[serde(default)]
    pub presign: PresignConfig,
    /// Background job runtime configuration
    #[serde(default)]
    pub jobs: JobsConfig,
    /// Buckets created on startup if missing
    #[serde(default)]
    pub default_buckets: Vec<String>,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Opaque service instance id
    #[serde(default = "default_service_id")]
    pub id: String,
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Deployment environment (dev, test, prod)
    #[serde(default = "default_environment")]
    pub environment: String,
    /// HTTP listen address
    #[serde(default = "default_host")]
    pub host: String,
    /// HTTP listen port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Shared secret expected in X-STORAGE-API-KEY
    pub api_key: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,
    /// Allowed CORS origins (empty = any)
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
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
    /// Run migrations on startup
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

/// Blob store configuration. The whole service shares one physical bucket;
/// logical buckets become key prefixes.
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// Endpoint URL (MinIO, LocalStack, or AWS)
    pub endpoint: String,
    /// Access key id
    pub access_key_id: String,
    /// Secret access key
    pub secret_access_key: String,
    /// Physical bucket backing every logical bucket
    pub bucket: String,
    /// Region
    #[serde(default = "default_region")]
    pub region: String,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Talk plain HTTP to the endpoint when it carries no scheme
    #[serde(default)]
    pub disable_ssl: bool,
}

/// Pre-signed URL expiry defaults
#[derive(Debug, Clone, Deserialize)]
pub struct PresignConfig {
    /// Default upload URL expiry in seconds
    #[serde(default = "default_upload_expiry_secs")]
    pub upload_expiry_secs: u64,
    /// Default download URL expiry in seconds
    #[serde(default = "default_download_expiry_secs")]
    pub download_expiry_secs: u64,
}

/// Job runtime configuration
#[derive(Debug, Clone, Deserialize)]
pub struct JobsConfig {
    /// Maximum number of jobs executing concurrently
    #[serde(default = "default_job_concurrency")]
    pub concurrency: usize,
    /// Poll interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Retry backoff cap in seconds
    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,
    /// Attempts after which a job is parked as dead
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,
    /// Re-queue jobs stuck running longer than this many seconds
    #[serde(default = "default_stuck_after_secs")]
    pub stuck_after_secs: u64,
}

// Default value functions
fn default_service_id() -> String {
    "coffer-1".to_string()
}

fn default_service_name() -> String {
    "coffer".to_string()
}

fn default_environment() -> String {
    "dev".to_string()
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
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

fn default_run_migrations() -> bool {
    true
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_upload_expiry_secs() -> u64 {
    120
}

fn default_download_expiry_secs() -> u64 {
    300
}

fn default_job_concurrency() -> usize {
    100
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_backoff_cap_secs() -> u64 {
    300
}

fn default_max_attempts() -> i32 {
    25
}

fn default_stuck_after_secs() -> u64 {
    600
}

impl Default for PresignConfig {
    fn default() -> Self {
        Self {
            upload_expiry_secs: default_upload_expiry_secs(),
            download_expiry_secs: default_download_expiry_secs(),
        }
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            concurrency: default_job_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            backoff_cap_secs: default_backoff_cap_secs(),
            max_attempts: default_max_attempts(),
            stuck_after_secs: default_stuck_after_secs(),
        }
    }
}

impl Config {
    /// Load configuration from config files and environment
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("config/coffer").required(false))
            .add_source(config::File::with_name("/etc/coffer/coffer").required(false))
            // Override with environment variables
            // COFFER__SERVICE__API_KEY -> service.api_key
            .add_source(
                config::Environment::with_prefix("COFFER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    pub fn db_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.database.connect_timeout_secs)
    }

    pub fn db_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.database.idle_timeout_secs)
    }

    pub fn job_poll_interval(&self) -> Duration {
        Duration::from_millis(self.jobs.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        assert_eq!(default_upload_expiry_secs(), 120);
        assert_eq!(default_download_expiry_secs(), 300);
        assert_eq!(default_job_concurrency(), 100);
        assert_eq!(default_region(), "us-east-1");
    }

    #[test]
    fn test_jobs_config_defaults() {
        let jobs = JobsConfig::default();
        assert_eq!(jobs.concurrency, 100);
        assert!(jobs.max_attempts > 0);
    }
}
