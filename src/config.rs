//! Daemon configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via IPROTO_CONFIG)
//! 3. Environment variables

use iproto_client::ConnectionConfig;
use iproto_replication::stream::DEFAULT_STREAM_CAPACITY;
use iproto_replication::{ReplicaConfig, VectorClock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Upstream connection.
    pub connection: ConnectionSection,
    /// Replica identity and start position.
    pub replication: ReplicationSection,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("IPROTO_CONFIG") {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))
    }

    /// Applies overrides from `lookup`, normally the process environment.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        self.connection.apply_overrides(&lookup);
        self.replication.apply_overrides(&lookup);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connection.addr.trim().is_empty() {
            return Err(ConfigError::Validation("connection.addr is empty".to_string()));
        }
        if self.connection.password.is_some() && self.connection.user.is_none() {
            return Err(ConfigError::Validation(
                "connection.password set without connection.user".to_string(),
            ));
        }
        if self.replication.queue_capacity == 0 {
            return Err(ConfigError::Validation(
                "replication.queue_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Builds the session configuration.
    pub fn replica_config(&self) -> ReplicaConfig {
        let conn = &self.connection;
        let mut connection = ConnectionConfig::new(conn.addr.clone())
            .with_connect_timeout(Duration::from_millis(conn.connect_timeout_ms))
            .with_request_timeout(Duration::from_millis(conn.request_timeout_ms));
        if let Some(user) = &conn.user {
            connection =
                connection.with_credentials(user.clone(), conn.password.clone().unwrap_or_default());
        }

        let repl = &self.replication;
        let mut config = ReplicaConfig::new(connection)
            .with_anonymous(repl.anonymous)
            .with_vclock(repl.start_vclock())
            .with_heartbeat_interval(Duration::from_millis(repl.heartbeat_interval_ms));
        if let Some(uuid) = repl.instance_uuid {
            config = config.with_instance_uuid(uuid);
        }
        if let Some(uuid) = repl.replicaset_uuid {
            config = config.with_replicaset_uuid(uuid);
        }
        if let Some(code) = repl.already_member_code {
            config = config.with_already_member_code(code);
        }
        config
    }
}

/// Connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSection {
    /// Upstream address, `host:port`.
    pub addr: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub connect_timeout_ms: u64,
    /// Per-request timeout; 0 selects the client default.
    pub request_timeout_ms: u64,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:3301".to_string(),
            user: None,
            password: None,
            connect_timeout_ms: 10_000,
            request_timeout_ms: 30_000,
        }
    }
}

impl ConnectionSection {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(addr) = lookup("IPROTO_ADDR") {
            self.addr = addr;
        }
        if let Some(user) = lookup("IPROTO_USER") {
            self.user = Some(user);
        }
        if let Some(password) = lookup("IPROTO_PASSWORD") {
            self.password = Some(password);
        }
        if let Some(timeout) = lookup("IPROTO_REQUEST_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                self.request_timeout_ms = ms;
            }
        }
    }
}

/// Replica identity and start position.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationSection {
    /// Local instance UUID; generated when absent.
    pub instance_uuid: Option<Uuid>,
    /// Expected replica set; learned when absent.
    pub replicaset_uuid: Option<Uuid>,
    /// Follow without registering in the replica set.
    pub anonymous: bool,
    /// Subscribe from `vclock` without a state transfer.
    pub skip_join: bool,
    /// Print state transfer rows before the change stream.
    pub print_snapshot: bool,
    /// Start position, replica id to LSN.
    pub vclock: BTreeMap<u32, u64>,
    pub heartbeat_interval_ms: u64,
    /// Join error code meaning this instance is already registered.
    pub already_member_code: Option<u32>,
    /// Depth of the entry queue between the session and the printer.
    pub queue_capacity: usize,
}

impl Default for ReplicationSection {
    fn default() -> Self {
        Self {
            instance_uuid: None,
            replicaset_uuid: None,
            anonymous: false,
            skip_join: false,
            print_snapshot: false,
            vclock: BTreeMap::new(),
            heartbeat_interval_ms: 1000,
            already_member_code: None,
            queue_capacity: DEFAULT_STREAM_CAPACITY,
        }
    }
}

impl ReplicationSection {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(uuid) = lookup("IPROTO_INSTANCE_UUID") {
            match Uuid::parse_str(&uuid) {
                Ok(uuid) => self.instance_uuid = Some(uuid),
                Err(e) => tracing::warn!("Ignoring IPROTO_INSTANCE_UUID: {}", e),
            }
        }
        if let Some(uuid) = lookup("IPROTO_REPLICASET_UUID") {
            match Uuid::parse_str(&uuid) {
                Ok(uuid) => self.replicaset_uuid = Some(uuid),
                Err(e) => tracing::warn!("Ignoring IPROTO_REPLICASET_UUID: {}", e),
            }
        }
        if let Some(anonymous) = lookup("IPROTO_ANONYMOUS") {
            self.anonymous = parse_flag(&anonymous);
        }
        if let Some(skip) = lookup("IPROTO_SKIP_JOIN") {
            self.skip_join = parse_flag(&skip);
        }
    }

    pub fn start_vclock(&self) -> VectorClock {
        self.vclock.iter().map(|(&id, &lsn)| (id, lsn)).collect()
    }
}

fn parse_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {}", .0.display(), .1)]
    Io(PathBuf, std::io::Error),

    #[error("failed to parse config file '{}': {}", .0.display(), .1)]
    Parse(PathBuf, String),

    #[error("configuration validation failed: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.connection.addr, "127.0.0.1:3301");
        assert_eq!(config.connection.request_timeout_ms, 30_000);
        assert!(!config.replication.anonymous);
        assert!(config.replication.vclock.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "connection:\n  addr: db1:3301\n  user: replicator\n  password: secret\n\
             replication:\n  anonymous: true\n  replicaset_uuid: 0d5bd431-7f3e-4695-a5c2-82de547ba22a\n  vclock:\n    1: 10\n    2: 7"
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.connection.addr, "db1:3301");
        assert_eq!(config.connection.user.as_deref(), Some("replicator"));
        assert_eq!(config.connection.connect_timeout_ms, 10_000);
        assert!(config.replication.anonymous);
        assert_eq!(config.replication.start_vclock().get(1), 10);
        assert_eq!(config.replication.start_vclock().get(2), 7);

        let replica = config.replica_config();
        assert!(replica.anonymous);
        assert_eq!(
            replica.replicaset_uuid.map(|u| u.to_string()).as_deref(),
            Some("0d5bd431-7f3e-4695-a5c2-82de547ba22a")
        );
        assert_eq!(replica.vclock.signature(), 17);
        assert_eq!(replica.connection.user.as_deref(), Some("replicator"));
    }

    #[test]
    fn test_file_errors() {
        let missing = Config::from_file("/nonexistent/iproto.yaml");
        assert!(matches!(missing, Err(ConfigError::Io(..))));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "connection: [not, a, map]").unwrap();
        let err = Config::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(..)));
        assert!(err.to_string().starts_with("failed to parse config file"));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_overrides(env(&[
            ("IPROTO_ADDR", "db2:3302"),
            ("IPROTO_USER", "admin"),
            ("IPROTO_PASSWORD", "pw"),
            ("IPROTO_INSTANCE_UUID", "7ed0d9e1-8d4a-4e5b-bd6e-0f2b0a3b5c11"),
            ("IPROTO_REPLICASET_UUID", "not-a-uuid"),
            ("IPROTO_ANONYMOUS", "TRUE"),
            ("IPROTO_REQUEST_TIMEOUT_MS", "0"),
            ("IPROTO_SKIP_JOIN", "1"),
        ]));

        assert_eq!(config.connection.addr, "db2:3302");
        assert_eq!(config.connection.password.as_deref(), Some("pw"));
        assert_eq!(config.connection.request_timeout_ms, 0);
        assert_eq!(
            config.replication.instance_uuid.map(|u| u.to_string()).as_deref(),
            Some("7ed0d9e1-8d4a-4e5b-bd6e-0f2b0a3b5c11")
        );
        assert!(config.replication.replicaset_uuid.is_none());
        assert!(config.replication.anonymous);
        assert!(config.replication.skip_join);

        let replica = config.replica_config();
        assert_eq!(
            replica.connection.effective_request_timeout(),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.connection.password = Some("pw".to_string());
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));

        let mut config = Config::default();
        config.connection.addr = " ".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.replication.queue_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let mut config = Config::default();
        config.replication.vclock.insert(1, 42);
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.connection.addr, config.connection.addr);
        assert_eq!(parsed.replication.vclock, config.replication.vclock);
    }
}
