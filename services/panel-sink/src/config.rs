use crate::security::DeserializationPolicy;
use config::builder::DefaultState;
use config::ConfigBuilder;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Host environment variables and the configuration keys they populate
const ENVIRONMENT_KEYS: &[(&str, &str)] = &[
    ("S3_URL", "s3.url"),
    ("S3_ACCESS_KEY", "s3.access-key"),
    ("S3_SECRET_KEY", "s3.secret-key"),
    ("KAFKA_APP_ID", "kafka.app-id"),
    ("KAFKA_BOOTSTRAP_SERVERS", "kafka.bootstrap-servers"),
    ("KAFKA_USERNAME", "kafka.username"),
    ("KAFKA_PASSWORD", "kafka.password"),
    ("NAV_TRUSTSTORE_PATH", "kafka.truststore-path"),
    ("NAV_TRUSTSTORE_PASSWORD", "kafka.truststore-password"),
    ("KAFKA_DESERIALIZATION_POLICY", "kafka.deserialization-policy"),
    ("LOG_LEVEL", "service.log-level"),
    ("HTTP_PORT", "service.http-port"),
];

/// Main configuration for the panel sink
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Kafka configuration
    pub kafka: KafkaConfig,
    /// S3 configuration
    pub s3: S3Config,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServiceConfig {
    /// Service name for logging
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Port serving /isalive, /isready and /metrics
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Upper bound on shutdown before workers are aborted
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

/// Kafka streaming client configuration
#[derive(Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct KafkaConfig {
    /// Processing group identity, used as the consumer group id
    #[serde(default = "default_app_id")]
    pub app_id: String,
    /// Kafka bootstrap servers
    pub bootstrap_servers: String,
    /// Topic carrying rendered panels
    #[serde(default = "default_panel_topic")]
    pub topic: String,
    /// SASL username
    pub username: Option<String>,
    /// SASL password
    pub password: Option<String>,
    /// Truststore path, switches the client to SASL_SSL when present
    pub truststore_path: Option<String>,
    /// Truststore password
    pub truststore_password: Option<String>,
    /// Handling of records without a value: `fail-fast` or `log-and-continue`
    #[serde(default)]
    pub deserialization_policy: DeserializationPolicy,
    /// Number of consumer workers in the group
    #[serde(default = "default_num_stream_threads")]
    pub num_stream_threads: usize,
    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u32,
    /// Max poll interval in milliseconds
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u32,
}

/// S3 storage configuration
#[derive(Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct S3Config {
    /// Endpoint URL of the S3-compatible store
    #[serde(default = "default_s3_url")]
    pub url: String,
    pub access_key: String,
    pub secret_key: String,
    /// Bucket receiving panel snapshots
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// Signing region
    #[serde(default = "default_region")]
    pub region: String,
}

// Default value functions
fn default_service_name() -> String {
    "grafana-panel-sink".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_http_port() -> u16 {
    8080
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

fn default_app_id() -> String {
    "grafana-image-exporter-sink-v1".to_string()
}

fn default_panel_topic() -> String {
    "aapen-grafana-paneler-v1".to_string()
}

fn default_num_stream_threads() -> usize {
    1
}

fn default_session_timeout_ms() -> u32 {
    30000
}

fn default_max_poll_interval_ms() -> u32 {
    300000
}

fn default_s3_url() -> String {
    "http://s3.nais-rook.svc.nais.local".to_string()
}

fn default_bucket() -> String {
    "grafana-panels".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

impl Config {
    /// Load configuration from config files and the process environment
    pub fn load() -> anyhow::Result<Self> {
        let env: HashMap<String, String> = std::env::vars().collect();

        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/panel-sink").required(false))
            .add_source(config::File::with_name("/etc/panel-sink/panel-sink").required(false));

        Self::build(builder, &env)
    }

    /// Build configuration from an explicit host environment map
    pub fn from_environment(env: &HashMap<String, String>) -> anyhow::Result<Self> {
        Self::build(config::Config::builder(), env)
    }

    fn build(
        mut builder: ConfigBuilder<DefaultState>,
        env: &HashMap<String, String>,
    ) -> anyhow::Result<Self> {
        for (variable, key) in ENVIRONMENT_KEYS {
            builder = builder.set_override_option(*key, env.get(*variable).cloned())?;
        }

        let config = builder.build()?.try_deserialize::<Self>()?;
        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.kafka.bootstrap_servers.trim().is_empty() {
            anyhow::bail!("kafka.bootstrap-servers must not be empty");
        }
        if self.kafka.app_id.trim().is_empty() {
            anyhow::bail!("kafka.app-id must not be empty");
        }
        if self.kafka.num_stream_threads == 0 {
            anyhow::bail!("kafka.num-stream-threads must be at least 1");
        }
        Ok(())
    }

    /// Get shutdown grace period as Duration
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.service.shutdown_grace_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            http_port: default_http_port(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

fn redact(value: &Option<String>) -> Option<&'static str> {
    value.as_ref().map(|_| "***")
}

impl std::fmt::Debug for KafkaConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaConfig")
            .field("app_id", &self.app_id)
            .field("bootstrap_servers", &self.bootstrap_servers)
            .field("topic", &self.topic)
            .field("username", &self.username)
            .field("password", &redact(&self.password))
            .field("truststore_path", &self.truststore_path)
            .field("truststore_password", &redact(&self.truststore_password))
            .field("deserialization_policy", &self.deserialization_policy)
            .field("num_stream_threads", &self.num_stream_threads)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for S3Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Config")
            .field("url", &self.url)
            .field("access_key", &self.access_key)
            .field("secret_key", &"***")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .finish()
    }
}
