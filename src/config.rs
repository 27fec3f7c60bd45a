use crate::connector::ProxyEndpoint;
use crate::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutputType {
    Stdout,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogTarget {
    #[serde(rename = "type")]
    pub output_type: LogOutputType,
    pub path: Option<PathBuf>,
    pub level: Option<LogLevel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: Option<LogLevel>,
    pub format: Option<LogFormat>,
    pub targets: Option<Vec<LogTarget>>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Some(LogLevel::Info),
            format: Some(LogFormat::Text),
            targets: Some(vec![LogTarget {
                output_type: LogOutputType::Stdout,
                path: None,
                level: None,
            }]),
        }
    }
}

fn default_listen_port() -> u16 {
    8888
}

fn default_accept_backlog() -> u32 {
    100
}

fn default_worker_pool_size() -> usize {
    10
}

fn default_target_host() -> String {
    "localhost".to_string()
}

fn default_target_port() -> u16 {
    8080
}

/// Relay server settings. Fixed once the server is constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default = "default_accept_backlog")]
    pub accept_backlog: u32,
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
    #[serde(default = "default_target_host")]
    pub target_host: String,
    #[serde(default = "default_target_port")]
    pub target_port: u16,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            accept_backlog: default_accept_backlog(),
            worker_pool_size: default_worker_pool_size(),
            target_host: default_target_host(),
            target_port: default_target_port(),
        }
    }
}

impl TunnelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.worker_pool_size == 0 {
            return Err(ProxyError::Config("worker_pool_size must be at least 1".to_string()));
        }
        if self.accept_backlog == 0 {
            return Err(ProxyError::Config("accept_backlog must be at least 1".to_string()));
        }
        if self.target_host.trim().is_empty() {
            return Err(ProxyError::Config("target_host must not be empty".to_string()));
        }
        if self.target_port == 0 {
            return Err(ProxyError::Config("target_port must not be 0".to_string()));
        }
        Ok(())
    }
}

fn default_proxy() -> ProxyEndpoint {
    ProxyEndpoint::direct()
}

fn default_connect_timeout_millis() -> u64 {
    10_000
}

/// Settings for an [`HttpProxyConnector`](crate::connector::HttpProxyConnector).
/// The relay server connects to its target directly and never reads these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorConfig {
    #[serde(default = "default_proxy")]
    pub proxy: ProxyEndpoint,
    #[serde(default = "default_connect_timeout_millis")]
    pub connect_timeout_millis: u64,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            proxy: default_proxy(),
            connect_timeout_millis: default_connect_timeout_millis(),
        }
    }
}

impl ConnectorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout_millis == 0 {
            return Err(ProxyError::Config("connect_timeout_millis must not be 0".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| ProxyError::Config(format!("Invalid config file {}: {}", path.display(), e)))
    }

    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let content =
            serde_json::to_string_pretty(self).map_err(|e| ProxyError::Config(format!("Cannot serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.tunnel.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::ProxyType;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.tunnel.listen_port, 8888);
        assert_eq!(config.tunnel.accept_backlog, 100);
        assert_eq!(config.tunnel.worker_pool_size, 10);
        assert_eq!(config.tunnel.target_host, "localhost");
        assert_eq!(config.tunnel.target_port, 8080);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: Config = serde_json::from_str(r#"{"tunnel": {"target_host": "backend", "target_port": 9000}}"#).unwrap();
        assert_eq!(config.tunnel.target_host, "backend");
        assert_eq!(config.tunnel.target_port, 9000);
        assert_eq!(config.tunnel.listen_port, 8888);
    }

    #[test]
    fn test_connector_config_defaults_and_validation() {
        let connector: ConnectorConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(connector.proxy.proxy_type, ProxyType::Direct);
        assert_eq!(connector.connect_timeout_millis, 10_000);
        assert!(connector.validate().is_ok());

        let connector = ConnectorConfig {
            connect_timeout_millis: 0,
            ..ConnectorConfig::default()
        };
        assert!(matches!(connector.validate(), Err(ProxyError::Config(_))));
    }

    #[test]
    fn test_server_config_has_no_connector_section() {
        let json = serde_json::to_value(Config::default()).unwrap();
        assert!(json.get("tunnel").is_some());
        assert!(json.get("connector").is_none());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.tunnel.worker_pool_size = 0;
        assert!(matches!(config.validate(), Err(ProxyError::Config(_))));

        let mut config = Config::default();
        config.tunnel.accept_backlog = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.tunnel.target_host = "  ".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.tunnel.target_port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tunnel.json");

        let mut config = Config::default();
        config.tunnel.listen_port = 9999;
        config.logging = Some(LoggingConfig::default());
        config.to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.tunnel, config.tunnel);
        assert_eq!(loaded.logging.unwrap().level, Some(LogLevel::Info));
    }

    #[test]
    fn test_invalid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(Config::from_file(&path), Err(ProxyError::Config(_))));
        assert!(matches!(Config::from_file(dir.path().join("missing.json")), Err(ProxyError::Io(_))));
    }
}
