use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use tokio::time::Duration;

use crate::auth::parse_public_key;
use crate::logging::LogFormat;
use crate::topics::is_topic_level;
use crate::utils::parse_duration_string;

pub const DEFAULT_BROKER_URL: &str = "ws://127.0.0.1:8080/pubsub";
pub const DEFAULT_TOPIC_PREFIX: &str = "fleet";
pub const DEFAULT_METRICS_PORT: u16 = 9090;
pub const DEFAULT_SHUTDOWN_GRACE: &str = "5s";

/// Errors raised while assembling the agent configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("Missing required setting: {0}")]
    MissingField(&'static str),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue {
        field: &'static str,
        message: String,
    },
}

impl ConfigError {
    fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field,
            message: message.into(),
        }
    }
}

/// Optional YAML base layer. Every key mirrors an environment variable.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FileConfig {
    pub agent_id: Option<String>,
    pub broker_url: Option<String>,
    pub topic_prefix: Option<String>,
    pub public_key: Option<String>,
    pub lock_dir: Option<PathBuf>,
    pub metrics_port: Option<u16>,
    pub log_format: Option<String>,
    pub log_level: Option<String>,
    pub shutdown_grace: Option<String>,
}

impl FileConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }
}

/// Resolved agent configuration.
///
/// The serialized form is what task modules receive as their node options,
/// so the verifying key is carried as hex rather than as a key object.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    pub agent_id: String,
    pub broker_url: String,
    pub topic_prefix: String,
    pub public_key_hex: String,
    pub lock_dir: PathBuf,
    pub metrics_port: u16,
    pub log_format: LogFormat,
    pub log_level: String,
    #[serde(serialize_with = "serialize_duration_secs")]
    pub shutdown_grace: Duration,
}

fn serialize_duration_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

impl AgentConfig {
    /// Loads configuration from environment variables, layered over the YAML
    /// file named by `AGENT_CONFIG_FILE` when set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let file = match env::var("AGENT_CONFIG_FILE") {
            Ok(path) if !path.trim().is_empty() => FileConfig::from_file(path.trim())?,
            _ => FileConfig::default(),
        };
        Self::from_layers(file, |key| env::var(key).ok())
    }

    /// Resolve settings, preferring `lookup` (normally the environment) over
    /// the file layer.
    pub fn from_layers<F>(file: FileConfig, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let agent_id = var("AGENT_ID")
            .or(file.agent_id)
            .or_else(|| var("HOSTNAME"))
            .unwrap_or_else(|| "unknown-agent".to_string());
        if !is_topic_level(&agent_id) {
            return Err(ConfigError::invalid(
                "AGENT_ID",
                format!("'{}' must not contain '/', '+' or '#'", agent_id),
            ));
        }

        let broker_url = var("AGENT_BROKER_URL")
            .or(file.broker_url)
            .unwrap_or_else(|| DEFAULT_BROKER_URL.to_string());
        if !(broker_url.starts_with("ws://") || broker_url.starts_with("wss://")) {
            return Err(ConfigError::invalid(
                "AGENT_BROKER_URL",
                format!("'{}' must start with ws:// or wss://", broker_url),
            ));
        }

        let topic_prefix = var("AGENT_TOPIC_PREFIX")
            .or(file.topic_prefix)
            .unwrap_or_else(|| DEFAULT_TOPIC_PREFIX.to_string());

        let public_key_hex = var("AGENT_PUBLIC_KEY")
            .or(file.public_key)
            .ok_or(ConfigError::MissingField("AGENT_PUBLIC_KEY"))?;
        parse_public_key(&public_key_hex)
            .map_err(|e| ConfigError::invalid("AGENT_PUBLIC_KEY", e.to_string()))?;

        let lock_dir = var("AGENT_LOCK_DIR")
            .map(PathBuf::from)
            .or(file.lock_dir)
            .unwrap_or_else(env::temp_dir);

        let metrics_port = match var("METRICS_PORT") {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|e| ConfigError::invalid("METRICS_PORT", format!("'{}': {}", raw, e)))?,
            None => file.metrics_port.unwrap_or(DEFAULT_METRICS_PORT),
        };

        let log_format_raw = var("LOG_FORMAT")
            .or(file.log_format)
            .unwrap_or_else(|| "pretty".to_string());
        let log_format = LogFormat::parse(&log_format_raw).ok_or_else(|| {
            ConfigError::invalid(
                "LOG_FORMAT",
                format!("'{}' (expected json or pretty)", log_format_raw),
            )
        })?;

        let log_level = var("LOG_LEVEL")
            .or(file.log_level)
            .unwrap_or_else(|| "info".to_string());

        let grace_raw = var("AGENT_SHUTDOWN_GRACE")
            .or(file.shutdown_grace)
            .unwrap_or_else(|| DEFAULT_SHUTDOWN_GRACE.to_string());
        let shutdown_grace = parse_duration_string(&grace_raw)
            .map_err(|e| ConfigError::invalid("AGENT_SHUTDOWN_GRACE", format!("'{}': {}", grace_raw, e)))?;

        Ok(AgentConfig {
            agent_id,
            broker_url,
            topic_prefix,
            public_key_hex,
            lock_dir,
            metrics_port,
            log_format,
            log_level,
            shutdown_grace,
        })
    }

    /// The command-signing key. Validated during loading.
    pub fn verifying_key(&self) -> Result<VerifyingKey, ConfigError> {
        parse_public_key(&self.public_key_hex)
            .map_err(|e| ConfigError::invalid("AGENT_PUBLIC_KEY", e.to_string()))
    }

    /// Node options handed to task modules.
    pub fn node_options(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Prints a summary of the loaded configuration.
    pub fn print_summary(&self) {
        tracing::info!(
            agent_id = %self.agent_id,
            broker_url = %self.broker_url,
            topic_prefix = %self.topic_prefix,
            lock_dir = %self.lock_dir.display(),
            metrics_port = self.metrics_port,
            shutdown_grace_secs = self.shutdown_grace.as_secs_f64(),
            "Agent configuration loaded"
        );
    }
}
