use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the QR code service
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Shared AWS SDK configuration
    #[serde(default)]
    pub aws: AwsConfig,
    /// S3 configuration
    #[serde(default)]
    pub s3: S3Config,
    /// DynamoDB configuration
    #[serde(default)]
    pub dynamodb: DynamoDbConfig,
    /// QR image rendering parameters
    #[serde(default)]
    pub encoder: EncoderConfig,
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

/// AWS settings shared by every client
#[derive(Debug, Clone, Deserialize)]
pub struct AwsConfig {
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
}

/// S3 storage configuration
///
/// The bucket itself is chosen per request.
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Presigned URL expiration in seconds
    #[serde(default = "default_presigned_url_expiry_secs")]
    pub presigned_url_expiry_secs: u64,
    /// Prefix under which QR images are written
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

/// DynamoDB configuration
///
/// The table itself is chosen per request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DynamoDbConfig {
    /// Custom endpoint URL (for DynamoDB Local, LocalStack, etc.)
    pub endpoint_url: Option<String>,
}

/// QR error correction level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCorrection {
    #[default]
    Low,
    Medium,
    Quartile,
    High,
}

/// QR image rendering parameters
#[derive(Debug, Clone, Deserialize)]
pub struct EncoderConfig {
    /// Error correction level
    #[serde(default)]
    pub error_correction: ErrorCorrection,
    /// Quiet zone width in modules
    #[serde(default = "default_margin")]
    pub margin: u32,
    /// Pixels per module
    #[serde(default = "default_scale")]
    pub scale: u32,
}

/// API configuration for the invocation endpoint
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
    "qrcode-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_presigned_url_expiry_secs() -> u64 {
    3600 // 1 hour
}

fn default_key_prefix() -> String {
    "qrcodes".to_string()
}

fn default_margin() -> u32 {
    4
}

fn default_scale() -> u32 {
    10
}

fn default_true() -> bool {
    true
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
            .add_source(config::File::with_name("config/qrcode").required(false))
            .add_source(config::File::with_name("/etc/qrcode/qrcode").required(false))
            // Override with environment variables
            // QRCODE__S3__ENDPOINT_URL -> s3.endpoint_url
            .add_source(
                config::Environment::with_prefix("QRCODE")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("api.cors_origins")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Get presigned URL expiry as Duration
    pub fn presigned_url_expiry(&self) -> Duration {
        Duration::from_secs(self.s3.presigned_url_expiry_secs)
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

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
        }
    }
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            endpoint_url: None,
            force_path_style: false,
            presigned_url_expiry_secs: default_presigned_url_expiry_secs(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            error_correction: ErrorCorrection::default(),
            margin: default_margin(),
            scale: default_scale(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: default_true(),
            cors_origins: Vec::new(),
        }
    }
}
