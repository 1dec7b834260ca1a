//! Session configuration
//!
//! Loaded once from TOML or JSON and validated before a session is created.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::{SessionMeta, WireFormat};
use crate::error::{ConfigError, RetryPolicy};
use crate::state::{ObjectDeclaration, ObjectKind};
use crate::transport::{Endpoint, SessionOptions};

/// Reconnect schedule used while degraded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            initial_delay_ms: policy.initial_delay.as_millis() as u64,
            backoff_multiplier: policy.backoff_multiplier,
            max_delay_ms: policy.max_delay.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// `tcp://host:port` or `host:port`
    pub server_address: String,

    /// Upper bound for one exchange, in milliseconds
    pub timeout_ms: u64,

    /// Consecutive failed exchanges before the session is considered lost
    pub failure_threshold: u32,

    /// Minimum host time between exchanges; 0 exchanges on every tick
    pub exchange_interval_ms: u64,

    /// Body format of outgoing messages
    pub wire_format: WireFormat,

    /// Run socket I/O on a dedicated thread
    pub io_thread: bool,

    pub retry: RetrySection,

    pub meta: SessionMeta,

    /// Objects and attributes this host publishes
    pub send: Vec<ObjectDeclaration>,

    /// Objects and attributes this host subscribes to
    pub receive: Vec<ObjectDeclaration>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_address: "tcp://127.0.0.1:7000".to_string(),
            timeout_ms: 100,
            failure_threshold: 3,
            exchange_interval_ms: 0,
            wire_format: WireFormat::default(),
            io_thread: false,
            retry: RetrySection::default(),
            meta: SessionMeta::default(),
            send: Vec::new(),
            receive: Vec::new(),
        }
    }
}

impl SyncConfig {
    /// Load from a `.toml` or `.json` file and validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let config = match extension.as_str() {
            "toml" => Self::from_toml_str(&contents)?,
            "json" => Self::from_json_str(&contents)?,
            other => return Err(ConfigError::UnsupportedFormat(other.to_string())),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    pub fn from_json_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(contents)?)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Starter configuration: one robot whose pose is published and whose
    /// joint is driven by the server
    pub fn example() -> Self {
        Self {
            send: vec![ObjectDeclaration::new(
                "robot1",
                ObjectKind::ArticulatedJoint,
                ["position", "quaternion"],
            )],
            receive: vec![ObjectDeclaration::new(
                "robot1",
                ObjectKind::ArticulatedJoint,
                ["joint1"],
            )],
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        Endpoint::parse(&self.server_address)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        if self.timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeout_ms must be greater than 0".into()));
        }
        if self.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "failure_threshold must be at least 1".into(),
            ));
        }
        if !self.retry.backoff_multiplier.is_finite() || self.retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "retry.backoff_multiplier must be a finite number >= 1.0".into(),
            ));
        }

        let sent = declared_pairs("send", &self.send)?;
        let received = declared_pairs("receive", &self.receive)?;
        if let Some((id, attribute)) = sent.intersection(&received).next() {
            return Err(ConfigError::Invalid(format!(
                "'{id}.{attribute}' is declared in both send and receive"
            )));
        }

        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn exchange_interval(&self) -> Duration {
        Duration::from_millis(self.exchange_interval_ms)
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            timeout: self.timeout(),
            failure_threshold: self.failure_threshold,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            initial_delay: Duration::from_millis(self.retry.initial_delay_ms),
            backoff_multiplier: self.retry.backoff_multiplier,
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }
}

fn declared_pairs(
    section: &str,
    declarations: &[ObjectDeclaration],
) -> Result<BTreeSet<(String, String)>, ConfigError> {
    let mut ids = BTreeSet::new();
    let mut pairs = BTreeSet::new();

    for declaration in declarations {
        if declaration.id.is_empty() {
            return Err(ConfigError::Invalid(format!("{section}: empty object id")));
        }
        if !ids.insert(declaration.id.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "{section}: object '{}' is declared twice",
                declaration.id
            )));
        }
        for attribute in &declaration.attributes {
            if attribute.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "{section}: empty attribute name on '{}'",
                    declaration.id
                )));
            }
            if !pairs.insert((declaration.id.clone(), attribute.clone())) {
                return Err(ConfigError::Invalid(format!(
                    "{section}: '{}.{attribute}' is listed twice",
                    declaration.id
                )));
            }
        }
    }

    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.timeout(), Duration::from_millis(100));
        assert_eq!(config.retry_policy(), RetryPolicy::default());
    }

    #[test]
    fn test_example_roundtrips_through_toml() {
        let config = SyncConfig::example();
        let text = config.to_toml_string().unwrap();
        assert_eq!(SyncConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = SyncConfig::from_toml_str(
            r#"
            server_address = "localhost:7500"
            wire_format = "json"

            [[receive]]
            id = "robot1"
            attributes = ["joint1"]
            "#,
        )
        .unwrap();

        assert_eq!(config.wire_format, WireFormat::Json);
        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.receive[0].kind, ObjectKind::AttributeBag);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_files() {
        let dir = tempfile::tempdir().unwrap();

        let toml_path = dir.path().join("sync.toml");
        fs::write(&toml_path, SyncConfig::example().to_toml_string().unwrap()).unwrap();
        assert_eq!(SyncConfig::load(&toml_path).unwrap(), SyncConfig::example());

        let json_path = dir.path().join("sync.json");
        let mut file = fs::File::create(&json_path).unwrap();
        file.write_all(br#"{"timeout_ms": 250}"#).unwrap();
        assert_eq!(SyncConfig::load(&json_path).unwrap().timeout_ms, 250);

        let yaml_path = dir.path().join("sync.yaml");
        fs::write(&yaml_path, "timeout_ms: 1").unwrap();
        assert!(matches!(
            SyncConfig::load(&yaml_path),
            Err(ConfigError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_validation_failures() {
        let bad_address = SyncConfig {
            server_address: "udp://nowhere".into(),
            ..Default::default()
        };
        assert!(bad_address.validate().is_err());

        let zero_timeout = SyncConfig {
            timeout_ms: 0,
            ..Default::default()
        };
        assert!(zero_timeout.validate().is_err());

        let mut both_ways = SyncConfig::example();
        both_ways.receive[0].attributes.push("position".into());
        let err = both_ways.validate().unwrap_err();
        assert!(err.to_string().contains("robot1.position"));

        let mut twice = SyncConfig::example();
        twice.send.push(twice.send[0].clone());
        assert!(twice.validate().is_err());
    }
}
