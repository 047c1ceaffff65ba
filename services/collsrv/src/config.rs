//! Service configuration: defaults, YAML file, `COLLSRV_*` environment

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{CollectorError, Result};
use crate::reader::ReaderSettings;

/// Command-line arguments
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "PLC acquisition collector")]
pub struct Args {
    /// Service configuration file
    #[arg(short, long, default_value = "config/collsrv.yaml")]
    pub config: PathBuf,

    /// Machine definition root (settings.yml, machines/)
    #[arg(long, env = "CONFIG_PATH")]
    pub config_path: Option<PathBuf>,

    /// Database file override
    #[arg(long, env = "DB_PATH")]
    pub db_path: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long)]
    pub log_level: Option<String>,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,

    /// Only validate machine definitions and exit
    #[arg(long)]
    pub validate: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/collector.db"),
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "localhost".to_string(),
            port: 1883,
            client_id: "collsrv".to_string(),
            username: None,
            password: None,
            keep_alive_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "0.0.0.0:8000".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Scheduler tick
    pub sync_interval_secs: u64,
    pub reconnect_delay_secs: u64,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: 60,
            reconnect_delay_secs: 60,
            connect_timeout_ms: 3000,
            request_timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    pub config_path: PathBuf,
    pub database: DatabaseConfig,
    pub mqtt: MqttConfig,
    pub api: ApiConfig,
    pub polling: PollingConfig,
    pub status_interval_secs: u64,
    pub logging: LoggingConfig,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("./config"),
            database: DatabaseConfig::default(),
            mqtt: MqttConfig::default(),
            api: ApiConfig::default(),
            polling: PollingConfig::default(),
            status_interval_secs: 30,
            logging: LoggingConfig::default(),
        }
    }
}

impl CollectorConfig {
    /// Defaults, then `path` if present, then `COLLSRV_` variables (`__` nests)
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: Self = Self::figment(path).extract()?;
        config.apply_legacy_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Yaml::file(path))
            .merge(Env::prefixed("COLLSRV_").split("__"))
    }

    /// `CONFIG_PATH`, `MQTT_HOST` and `MQTT_PORT` from older deployments
    pub fn apply_legacy_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(path) = var("CONFIG_PATH").filter(|v| !v.is_empty()) {
            self.config_path = PathBuf::from(path);
        }
        if let Some(host) = var("MQTT_HOST").filter(|v| !v.is_empty()) {
            self.mqtt.host = host;
        }
        if let Some(port) = var("MQTT_PORT").and_then(|v| v.parse().ok()) {
            self.mqtt.port = port;
        }
    }

    pub fn apply_args(&mut self, args: &Args) {
        if let Some(path) = &args.config_path {
            self.config_path = path.clone();
        }
        if let Some(path) = &args.db_path {
            self.database.path = path.clone();
        }
        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.api.enabled {
            self.api_addr()?;
        }
        if self.status_interval_secs == 0 {
            return Err(CollectorError::config("status_interval_secs must be > 0"));
        }
        if self.polling.sync_interval_secs == 0 {
            return Err(CollectorError::config("polling.sync_interval_secs must be > 0"));
        }
        if self.mqtt.enabled && self.mqtt.host.trim().is_empty() {
            return Err(CollectorError::config("mqtt.host is empty"));
        }
        Ok(())
    }

    pub fn api_addr(&self) -> Result<SocketAddr> {
        self.api
            .bind
            .parse()
            .map_err(|e| CollectorError::config(format!("api.bind '{}': {}", self.api.bind, e)))
    }

    pub fn reader_settings(&self) -> ReaderSettings {
        ReaderSettings {
            connect_timeout: Duration::from_millis(self.polling.connect_timeout_ms),
            request_timeout: Duration::from_millis(self.polling.request_timeout_ms),
            reconnect_delay: Duration::from_secs(self.polling.reconnect_delay_secs),
        }
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.polling.sync_interval_secs.max(1))
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs.max(1))
    }
}
