//! Configuration for the keeper
//!
//! The configuration is built once at startup (file, then environment) and
//! threaded through every component as an immutable value.

use crate::common::{Error, Result};
use crate::pgsql::conninfo::ConnInfo;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix of the environment variables overriding file settings,
/// e.g. `PGKEEPER_FORMATION` or `PGKEEPER_POSTGRES__PORT`.
pub const ENV_PREFIX: &str = "PGKEEPER";

/// Keeper configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Name this node registers with at the coordinator
    pub node_name: String,

    /// Formation the node belongs to
    #[serde(default = "default_formation")]
    pub formation: String,

    /// Replication group inside the formation
    #[serde(default)]
    pub group_id: i32,

    /// Managed Postgres instance
    pub postgres: PostgresConfig,

    /// Coordinator (monitor) endpoint
    pub coordinator: CoordinatorConfig,

    /// Replication settings shared by primary and standby
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// Loop, retry and grace timings
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Where the keeper persists its state between restarts
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_formation() -> String {
    "default".to_string()
}
fn default_state_file() -> PathBuf {
    PathBuf::from("./pgkeeper.state")
}
fn default_log_level() -> String {
    "info".to_string()
}

/// Local Postgres instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    /// Data directory
    pub pgdata: PathBuf,

    /// Host other nodes use to reach this instance
    #[serde(default = "default_pg_host")]
    pub host: String,

    #[serde(default = "default_pg_port")]
    pub port: u16,

    #[serde(default = "default_dbname")]
    pub dbname: String,

    /// Directory holding pg_ctl, pg_basebackup and pg_rewind
    #[serde(default)]
    pub bin_dir: Option<PathBuf>,

    /// Explicit connection string for the local instance
    #[serde(default)]
    pub conninfo: Option<String>,
}

fn default_pg_host() -> String {
    "localhost".to_string()
}
fn default_pg_port() -> u16 {
    5432
}
fn default_dbname() -> String {
    "postgres".to_string()
}

/// Coordinator endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub conninfo: String,
}

/// Replication settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Role standbys use to stream from the primary
    #[serde(default = "default_replication_user")]
    pub username: String,

    #[serde(default)]
    pub password: Option<String>,

    /// Physical slot the primary keeps for its standby
    #[serde(default = "default_slot_name")]
    pub slot_name: String,

    /// Database created on a fresh primary, if any
    #[serde(default)]
    pub database: Option<String>,

    /// Extensions created on a fresh primary
    #[serde(default)]
    pub extensions: Vec<String>,
}

fn default_replication_user() -> String {
    "pgkeeper_replicator".to_string()
}
fn default_slot_name() -> String {
    "pgkeeper_standby".to_string()
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            username: default_replication_user(),
            password: None,
            slot_name: default_slot_name(),
            database: None,
            extensions: Vec::new(),
        }
    }
}

/// Timings, written as duration strings ("500ms", "5s", "1m")
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Pause between two keeper cycles when no notification arrives
    #[serde(default = "default_loop_interval", with = "duration_str")]
    pub loop_interval: Duration,

    /// Pause between two pings while waiting for a remote server
    #[serde(default = "default_retry_poll_interval", with = "duration_str")]
    pub retry_poll_interval: Duration,

    /// Give up on a remote server after this long
    #[serde(default = "default_retry_timeout", with = "duration_str")]
    pub retry_timeout: Duration,

    /// Connection establishment timeout for a single attempt
    #[serde(default = "default_connect_timeout", with = "duration_str")]
    pub connect_timeout: Duration,

    /// How long a primary tolerates having no healthy standby before it
    /// disables synchronous replication
    #[serde(default = "default_sync_rep_grace", with = "duration_str")]
    pub sync_rep_grace_period: Duration,
}

fn default_loop_interval() -> Duration {
    Duration::from_secs(5)
}
fn default_retry_poll_interval() -> Duration {
    Duration::from_secs(1)
}
fn default_retry_timeout() -> Duration {
    Duration::from_secs(60)
}
fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_sync_rep_grace() -> Duration {
    Duration::from_secs(30)
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            loop_interval: default_loop_interval(),
            retry_poll_interval: default_retry_poll_interval(),
            retry_timeout: default_retry_timeout(),
            connect_timeout: default_connect_timeout(),
            sync_rep_grace_period: default_sync_rep_grace(),
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file, then `PGKEEPER_*`
    /// environment variables, and validate it.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a configuration held in a TOML string.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(contents, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_name.trim().is_empty() {
            return Err(Error::InvalidConfig("node_name cannot be empty".into()));
        }
        if self.formation.trim().is_empty() {
            return Err(Error::InvalidConfig("formation cannot be empty".into()));
        }
        if self.group_id < 0 {
            return Err(Error::InvalidConfig(format!(
                "group_id must be positive, got {}",
                self.group_id
            )));
        }

        ConnInfo::parse(&self.coordinator.conninfo)?;
        ConnInfo::parse(&self.local_conninfo())?;
        validate_slot_name(&self.replication.slot_name)?;

        let t = &self.timeouts;
        for (name, value) in [
            ("loop_interval", t.loop_interval),
            ("retry_poll_interval", t.retry_poll_interval),
            ("retry_timeout", t.retry_timeout),
            ("connect_timeout", t.connect_timeout),
        ] {
            if value.is_zero() {
                return Err(Error::InvalidConfig(format!("{} cannot be zero", name)));
            }
        }
        if t.retry_poll_interval > t.retry_timeout {
            return Err(Error::InvalidConfig(
                "retry_poll_interval is longer than retry_timeout".into(),
            ));
        }

        Ok(())
    }

    /// Connection string of the managed instance.
    pub fn local_conninfo(&self) -> String {
        match &self.postgres.conninfo {
            Some(conninfo) => conninfo.clone(),
            None => format!(
                "postgresql://{}:{}/{}",
                self.postgres.host, self.postgres.port, self.postgres.dbname
            ),
        }
    }
}

/// Replication slot names are limited to lower case letters, digits and
/// underscores, at most 63 bytes.
pub fn validate_slot_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 63 {
        return Err(Error::InvalidConfig(format!(
            "invalid replication slot name length: \"{}\"",
            name
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(Error::InvalidConfig(format!(
            "replication slot name \"{}\" may only contain lower case letters, digits and underscores",
            name
        )));
    }
    Ok(())
}

mod duration_str {
    use crate::common::utils::{format_duration, parse_duration};
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
