use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the recognition service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// S3 configuration
    #[serde(default)]
    pub s3: S3Config,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Object detector configuration
    #[serde(default)]
    pub detector: DetectorConfig,
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

/// S3 blob storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// Bucket holding the uploaded images
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Base URL used when building object locators.
    /// Falls back to `endpoint_url`, then to the regional AWS endpoint.
    pub public_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Multipart upload threshold in bytes (5MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads in bytes (5MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
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
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Object detector configuration.
///
/// Without an `endpoint` detection is disabled and every image gets an
/// empty detection list.
#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    /// Inference endpoint that accepts raw image bytes
    pub endpoint: Option<String>,
    /// Optional path probed once at startup (e.g. "/healthz")
    pub health_path: Option<String>,
    /// Request timeout in seconds
    #[serde(default = "default_detector_timeout_secs")]
    pub timeout_secs: u64,
}

/// HTTP API configuration
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
    /// Allowed CORS origins (empty = any)
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Maximum accepted upload body in bytes
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
    /// Upper bound applied to the `limit` list parameter
    #[serde(default = "default_max_list_limit")]
    pub max_list_limit: u32,
}

// Default value functions
fn default_service_name() -> String {
    "recognition-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_bucket() -> String {
    "images".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_multipart_threshold() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_part_size() -> usize {
    5 * 1024 * 1024 // 5MB
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

fn default_detector_timeout_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8000
}

fn default_max_upload_bytes() -> usize {
    20 * 1024 * 1024 // 20MB
}

fn default_max_list_limit() -> u32 {
    100
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .set_default("service.name", "recognition-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            .add_source(config::File::with_name("config/recognition").required(false))
            .add_source(config::File::with_name("/etc/recognition/recognition").required(false))
            // RECOGNITION__DATABASE__URL -> database.url
            .add_source(
                config::Environment::with_prefix("RECOGNITION")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }
}

impl DatabaseConfig {
    /// Get connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Get idle timeout as Duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl S3Config {
    /// Base URL that object locators are built from
    pub fn locator_base(&self) -> String {
        let base = self
            .public_url
            .clone()
            .or_else(|| self.endpoint_url.clone())
            .unwrap_or_else(|| format!("https://s3.{}.amazonaws.com", self.region));
        base.trim_end_matches('/').to_string()
    }
}

impl DetectorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
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
            bucket: default_bucket(),
            region: default_region(),
            endpoint_url: None,
            public_url: None,
            force_path_style: false,
            multipart_threshold_bytes: default_multipart_threshold(),
            part_size_bytes: default_part_size(),
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            health_path: None,
            timeout_secs: default_detector_timeout_secs(),
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
            max_upload_bytes: default_max_upload_bytes(),
            max_list_limit: default_max_list_limit(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        assert_eq!(default_bucket(), "images");
        assert_eq!(default_api_port(), 8000);
        assert_eq!(default_max_list_limit(), 100);
        assert_eq!(DetectorConfig::default().endpoint, None);
    }

    #[test]
    fn test_locator_base_precedence() {
        let mut s3 = S3Config::default();
        assert_eq!(s3.locator_base(), "https://s3.us-east-1.amazonaws.com");

        s3.endpoint_url = Some("http://minio:9000/".to_string());
        assert_eq!(s3.locator_base(), "http://minio:9000");

        s3.public_url = Some("https://cdn.example.com".to_string());
        assert_eq!(s3.locator_base(), "https://cdn.example.com");
    }

    #[test]
    fn test_deserialize_minimal_config() {
        let config: Config = serde_json::from_value(serde_json::json!({
            "database": { "url": "postgres://localhost/images" }
        }))
        .unwrap();

        assert_eq!(config.s3.bucket, "images");
        assert!(config.database.run_migrations);
        assert_eq!(config.detector.timeout_secs, 30);
        assert_eq!(config.api.max_upload_bytes, 20 * 1024 * 1024);
    }
}
