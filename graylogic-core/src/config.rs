//! Configuration management using Figment
//!
//! Configuration is loaded from a YAML file (path supplied on the command
//! line) with environment-variable overrides prefixed `GRAYLOGIC_`. Secrets
//! (JWT secret, MQTT and TSDB credentials) must come from the environment;
//! a secret found in the YAML file is rejected at validation time.

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// SQLite database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// MQTT broker configuration
    #[serde(default)]
    pub mqtt: MqttConfig,

    /// Time-series database configuration
    #[serde(default)]
    pub tsdb: TsdbConfig,

    /// KNX daemon supervision and bridge configuration
    #[serde(default)]
    pub knx: KnxConfig,

    /// Authentication configuration
    #[serde(default)]
    pub auth: AuthConfig,

    /// State-history retention configuration
    #[serde(default)]
    pub history: HistoryConfig,

    /// Log filter directive (e.g. "info", "graylogic_core=debug")
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Whether TLS terminates in front of us (enables HSTS)
    #[serde(default)]
    pub tls_enabled: bool,

    /// Trust X-Forwarded-For for client-IP resolution
    #[serde(default)]
    pub trust_proxy: bool,

    /// Allowed CORS origins; empty list means same-origin only
    #[serde(default)]
    pub cors_origins: Vec<String>,

    /// Request body size cap in bytes
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

/// SQLite database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file
    #[serde(default = "default_db_path")]
    pub path: PathBuf,

    /// Maximum pool connections (readers; the writer serializes on SQLite)
    #[serde(default = "default_db_max_connections")]
    pub max_connections: u32,
}

/// MQTT broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker host
    #[serde(default = "default_mqtt_host")]
    pub host: String,

    /// Broker port
    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    /// Client identifier
    #[serde(default = "default_mqtt_client_id")]
    pub client_id: String,

    /// Username (environment only)
    #[serde(default)]
    pub username: Option<String>,

    /// Password (environment only)
    #[serde(default)]
    pub password: Option<String>,

    /// Keep-alive interval in seconds
    #[serde(default = "default_mqtt_keep_alive")]
    pub keep_alive_secs: u64,
}

/// Time-series database (VictoriaMetrics / Influx line protocol) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TsdbConfig {
    /// Base URL, e.g. <http://127.0.0.1:8428>
    #[serde(default = "default_tsdb_url")]
    pub url: String,

    /// Batch flush interval in seconds
    #[serde(default = "default_tsdb_flush")]
    pub flush_interval_secs: u64,

    /// Flush when the batch reaches this many records
    #[serde(default = "default_tsdb_batch")]
    pub batch_size: usize,

    /// Per-write HTTP timeout in seconds
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,

    /// Per-query HTTP timeout in seconds
    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,
}

/// KNX daemon supervision and bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnxConfig {
    /// Whether the KNX bridge is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Path to the daemon binary
    #[serde(default = "default_knxd_binary")]
    pub daemon_binary: PathBuf,

    /// Arguments passed to the daemon
    #[serde(default)]
    pub daemon_args: Vec<String>,

    /// Unix socket the daemon exposes
    #[serde(default = "default_knxd_socket")]
    pub daemon_socket: PathBuf,

    /// PID file path
    #[serde(default = "default_knxd_pidfile")]
    pub pid_file: PathBuf,

    /// Seconds between unexpected exit and restart
    #[serde(default = "default_restart_delay")]
    pub restart_delay_secs: u64,

    /// Maximum consecutive restart attempts; 0 = unlimited
    #[serde(default)]
    pub max_restart_attempts: u32,

    /// Seconds between health probes
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,

    /// Consecutive D-state probes tolerated before a forced restart
    #[serde(default = "default_dstate_tolerance")]
    pub dstate_tolerance: u32,

    /// Optional canary group address probed at L3 (e.g. "1/0/7")
    #[serde(default)]
    pub canary_group_address: Option<String>,
}

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HS256 signing secret; must be at least 32 bytes, environment only
    #[serde(default)]
    pub jwt_secret: String,

    /// Access token lifetime in minutes
    #[serde(default = "default_access_ttl")]
    pub access_ttl_minutes: i64,

    /// Refresh token lifetime in days
    #[serde(default = "default_refresh_ttl")]
    pub refresh_ttl_days: i64,
}

/// State-history retention configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Delete state_history rows older than this many days
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8486
}
fn default_body_limit() -> usize {
    1024 * 1024
}
fn default_db_path() -> PathBuf {
    PathBuf::from("graylogic.db")
}
fn default_db_max_connections() -> u32 {
    4
}
fn default_mqtt_host() -> String {
    "127.0.0.1".to_string()
}
fn default_mqtt_port() -> u16 {
    1883
}
fn default_mqtt_client_id() -> String {
    "graylogic-core".to_string()
}
fn default_mqtt_keep_alive() -> u64 {
    30
}
fn default_tsdb_url() -> String {
    "http://127.0.0.1:8428".to_string()
}
fn default_tsdb_flush() -> u64 {
    10
}
fn default_tsdb_batch() -> usize {
    500
}
fn default_write_timeout() -> u64 {
    5
}
fn default_query_timeout() -> u64 {
    10
}
fn default_true() -> bool {
    true
}
fn default_knxd_binary() -> PathBuf {
    PathBuf::from("/usr/bin/knxd")
}
fn default_knxd_socket() -> PathBuf {
    PathBuf::from("/run/knxd/knxd.sock")
}
fn default_knxd_pidfile() -> PathBuf {
    PathBuf::from("/run/graylogic/knxd.pid")
}
fn default_restart_delay() -> u64 {
    5
}
fn default_health_interval() -> u64 {
    30
}
fn default_dstate_tolerance() -> u32 {
    3
}
fn default_access_ttl() -> i64 {
    15
}
fn default_refresh_ttl() -> i64 {
    30
}
fn default_retention_days() -> u32 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            tls_enabled: false,
            trust_proxy: false,
            cors_origins: Vec::new(),
            body_limit_bytes: default_body_limit(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            max_connections: default_db_max_connections(),
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            client_id: default_mqtt_client_id(),
            username: None,
            password: None,
            keep_alive_secs: default_mqtt_keep_alive(),
        }
    }
}

impl Default for TsdbConfig {
    fn default() -> Self {
        Self {
            url: default_tsdb_url(),
            flush_interval_secs: default_tsdb_flush(),
            batch_size: default_tsdb_batch(),
            write_timeout_secs: default_write_timeout(),
            query_timeout_secs: default_query_timeout(),
        }
    }
}

impl Default for KnxConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            daemon_binary: default_knxd_binary(),
            daemon_args: Vec::new(),
            daemon_socket: default_knxd_socket(),
            pid_file: default_knxd_pidfile(),
            restart_delay_secs: default_restart_delay(),
            max_restart_attempts: 0,
            health_interval_secs: default_health_interval(),
            dstate_tolerance: default_dstate_tolerance(),
            canary_group_address: None,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            access_ttl_minutes: default_access_ttl(),
            refresh_ttl_days: default_refresh_ttl(),
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            mqtt: MqttConfig::default(),
            tsdb: TsdbConfig::default(),
            knx: KnxConfig::default(),
            auth: AuthConfig::default(),
            history: HistoryConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file with `GRAYLOGIC_` env overrides.
    ///
    /// Nested keys use `__` in the environment, e.g.
    /// `GRAYLOGIC_SERVER__PORT=9000`, `GRAYLOGIC_JWT_SECRET=...` (shorthand
    /// for `GRAYLOGIC_AUTH__JWT_SECRET`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));

        if let Some(path) = path {
            if !path.exists() {
                return Err(Error::ConfigInvalid(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            figment = figment.merge(Yaml::file(path));
        }

        let mut config: Config = figment
            .merge(Env::prefixed("GRAYLOGIC_").split("__"))
            .extract()
            .map_err(|e| Error::ConfigInvalid(e.to_string()))?;

        // Secrets come from the environment; the short form wins over YAML
        if let Ok(secret) = std::env::var("GRAYLOGIC_JWT_SECRET") {
            config.auth.jwt_secret = secret;
        }
        if let Ok(password) = std::env::var("GRAYLOGIC_MQTT_PASSWORD") {
            config.mqtt.password = Some(password);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints that serde defaults cannot express
    pub fn validate(&self) -> Result<()> {
        if self.auth.jwt_secret.len() < 32 {
            return Err(Error::ConfigInvalid(
                "auth.jwt_secret must be at least 32 bytes (set GRAYLOGIC_JWT_SECRET)".to_string(),
            ));
        }
        if self.auth.access_ttl_minutes <= 0 {
            return Err(Error::ConfigInvalid(
                "auth.access_ttl_minutes must be positive".to_string(),
            ));
        }
        if self.tsdb.batch_size == 0 {
            return Err(Error::ConfigInvalid(
                "tsdb.batch_size must be at least 1".to_string(),
            ));
        }
        if self.server.body_limit_bytes == 0 {
            return Err(Error::ConfigInvalid(
                "server.body_limit_bytes must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Per-operation write timeout
    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.tsdb.write_timeout_secs)
    }

    /// Per-operation query timeout
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.tsdb.query_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_secret() -> Config {
        let mut config = Config::default();
        config.auth.jwt_secret = "0123456789abcdef0123456789abcdef".to_string();
        config
    }

    #[test]
    fn defaults_cover_every_section() {
        let config = Config::default();
        assert_eq!(config.server.port, 8486);
        assert_eq!(config.tsdb.batch_size, 500);
        assert_eq!(config.knx.dstate_tolerance, 3);
        assert_eq!(config.history.retention_days, 30);
        assert!(!config.server.trust_proxy);
    }

    #[test]
    fn short_jwt_secret_is_rejected() {
        let mut config = Config::default();
        config.auth.jwt_secret = "short".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn valid_config_passes() {
        assert!(with_secret().validate().is_ok());
    }

    #[test]
    fn missing_file_is_config_error() {
        let err = Config::load(Some(Path::new("/nonexistent/graylogic.yaml"))).unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));
    }

    #[test]
    fn yaml_and_env_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "server:\n  port: 9100\nauth:\n  jwt_secret: 0123456789abcdef0123456789abcdef\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.server.port, 9100);
    }
}
