use crate::Error;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnectOptions;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_VIRTUAL_NODES: usize = 150;
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
pub const DEFAULT_REPLICATION_FACTOR: u32 = 1;

const DEFAULT_PORT: u16 = 5432;
const DEFAULT_POOL_SIZE: u32 = 10;
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_STATEMENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Manager-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub virtual_nodes_per_shard: usize,
    #[serde(with = "duration_ms")]
    pub health_check_interval: Duration,
    /// Upper bound for a single liveness probe.
    #[serde(with = "duration_ms")]
    pub health_check_timeout: Duration,
    /// Recorded and reported only; no replicas are written.
    pub replication_factor: u32,
    pub consecutive_failure_threshold: u32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            virtual_nodes_per_shard: DEFAULT_VIRTUAL_NODES,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            health_check_timeout: DEFAULT_HEALTH_CHECK_TIMEOUT,
            replication_factor: DEFAULT_REPLICATION_FACTOR,
            consecutive_failure_threshold: DEFAULT_FAILURE_THRESHOLD,
        }
    }
}

impl ManagerConfig {
    /// Read settings from the environment, falling back to defaults for
    /// unset variables:
    ///
    /// - `SHARD_VIRTUAL_NODES`
    /// - `SHARD_HEALTH_CHECK_INTERVAL_MS`
    /// - `SHARD_HEALTH_CHECK_TIMEOUT_MS`
    /// - `SHARD_REPLICATION_FACTOR`
    /// - `SHARD_FAILURE_THRESHOLD`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if a variable is set but unparsable,
    /// or the resulting config fails [`validate`](Self::validate).
    pub fn from_env() -> Result<Self, Error> {
        let defaults = Self::default();
        let config = Self {
            virtual_nodes_per_shard: env_or("SHARD_VIRTUAL_NODES", defaults.virtual_nodes_per_shard)?,
            health_check_interval: Duration::from_millis(env_or(
                "SHARD_HEALTH_CHECK_INTERVAL_MS",
                defaults.health_check_interval.as_millis() as u64,
            )?),
            health_check_timeout: Duration::from_millis(env_or(
                "SHARD_HEALTH_CHECK_TIMEOUT_MS",
                defaults.health_check_timeout.as_millis() as u64,
            )?),
            replication_factor: env_or("SHARD_REPLICATION_FACTOR", defaults.replication_factor)?,
            consecutive_failure_threshold: env_or(
                "SHARD_FAILURE_THRESHOLD",
                defaults.consecutive_failure_threshold,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_virtual_nodes(mut self, virtual_nodes: usize) -> Self {
        self.virtual_nodes_per_shard = virtual_nodes;
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn with_health_check_timeout(mut self, timeout: Duration) -> Self {
        self.health_check_timeout = timeout;
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.consecutive_failure_threshold = threshold;
        self
    }

    pub fn with_replication_factor(mut self, factor: u32) -> Self {
        self.replication_factor = factor;
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.virtual_nodes_per_shard == 0 {
            return Err(Error::configuration("virtual_nodes_per_shard must be > 0"));
        }
        if self.consecutive_failure_threshold == 0 {
            return Err(Error::configuration(
                "consecutive_failure_threshold must be > 0",
            ));
        }
        if self.health_check_interval.is_zero() {
            return Err(Error::configuration("health_check_interval must be > 0"));
        }
        if self.health_check_timeout.is_zero() {
            return Err(Error::configuration("health_check_timeout must be > 0"));
        }
        Ok(())
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> Result<T, Error> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::configuration(format!("{name} has invalid value '{raw}'"))),
        Err(_) => Ok(default),
    }
}

/// Connection settings for one shard.
///
/// Deserializes from JSON with every field but `host` and `database`
/// optional, so a shard list can be as short as
/// `[{"host": "db-0", "database": "app"}]`.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub database: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_idle_timeout", with = "duration_ms")]
    pub idle_timeout: Duration,
    #[serde(default = "default_connect_timeout", with = "duration_ms")]
    pub connect_timeout: Duration,
    #[serde(default = "default_statement_timeout", with = "duration_ms")]
    pub statement_timeout: Duration,
    /// Display name; the manager falls back to `shard-{index}`.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_pool_size() -> u32 {
    DEFAULT_POOL_SIZE
}

fn default_idle_timeout() -> Duration {
    DEFAULT_IDLE_TIMEOUT
}

fn default_connect_timeout() -> Duration {
    DEFAULT_CONNECT_TIMEOUT
}

fn default_statement_timeout() -> Duration {
    DEFAULT_STATEMENT_TIMEOUT
}

fn default_weight() -> u32 {
    1
}

impl ShardConfig {
    pub fn new(host: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            database: database.into(),
            username: None,
            password: None,
            pool_size: DEFAULT_POOL_SIZE,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            statement_timeout: DEFAULT_STATEMENT_TIMEOUT,
            name: None,
            weight: 1,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_pool_size(mut self, pool_size: u32) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = timeout;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// `host:port/database`, used in logs and error messages.
    pub fn endpoint(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.database)
    }

    /// Build sqlx connect options.
    ///
    /// The statement cache is disabled so shards can sit behind PgBouncer in
    /// transaction mode.
    pub fn connect_options(&self) -> PgConnectOptions {
        let mut options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.database)
            .application_name("pg-shard-manager")
            .statement_cache_capacity(0);
        if let Some(username) = &self.username {
            options = options.username(username);
        }
        if let Some(password) = &self.password {
            options = options.password(password);
        }
        options
    }
}

impl fmt::Debug for ShardConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("pool_size", &self.pool_size)
            .field("idle_timeout", &self.idle_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("statement_timeout", &self.statement_timeout)
            .field("name", &self.name)
            .field("weight", &self.weight)
            .finish()
    }
}

/// Durations as integer milliseconds in JSON.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_manager_config_defaults() {
        let config = ManagerConfig::default();
        assert_eq!(config.virtual_nodes_per_shard, 150);
        assert_eq!(config.health_check_interval, Duration::from_secs(30));
        assert_eq!(config.consecutive_failure_threshold, 3);
        assert_eq!(config.replication_factor, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        assert!(ManagerConfig::default().with_virtual_nodes(0).validate().is_err());
        assert!(ManagerConfig::default().with_failure_threshold(0).validate().is_err());
        assert!(ManagerConfig::default()
            .with_health_check_interval(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        env::set_var("SHARD_VIRTUAL_NODES", "64");
        env::set_var("SHARD_HEALTH_CHECK_INTERVAL_MS", "1500");
        env::set_var("SHARD_FAILURE_THRESHOLD", "5");

        let config = ManagerConfig::from_env().unwrap();

        env::remove_var("SHARD_VIRTUAL_NODES");
        env::remove_var("SHARD_HEALTH_CHECK_INTERVAL_MS");
        env::remove_var("SHARD_FAILURE_THRESHOLD");

        assert_eq!(config.virtual_nodes_per_shard, 64);
        assert_eq!(config.health_check_interval, Duration::from_millis(1500));
        assert_eq!(config.consecutive_failure_threshold, 5);
        assert_eq!(config.health_check_timeout, DEFAULT_HEALTH_CHECK_TIMEOUT);
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_garbage() {
        env::set_var("SHARD_REPLICATION_FACTOR", "three");
        let result = ManagerConfig::from_env();
        env::remove_var("SHARD_REPLICATION_FACTOR");

        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_shard_config_from_minimal_json() {
        let config: ShardConfig =
            serde_json::from_str(r#"{"host": "db-0.internal", "database": "app"}"#).unwrap();
        assert_eq!(config, ShardConfig::new("db-0.internal", "app"));
        assert_eq!(config.endpoint(), "db-0.internal:5432/app");
    }

    #[test]
    fn test_shard_config_json_durations_in_millis() {
        let config: ShardConfig = serde_json::from_str(
            r#"{"host": "h", "database": "d", "connect_timeout": 250, "pool_size": 4}"#,
        )
        .unwrap();
        assert_eq!(config.connect_timeout, Duration::from_millis(250));
        assert_eq!(config.pool_size, 4);
    }

    #[test]
    fn test_debug_redacts_password() {
        let config = ShardConfig::new("h", "d").with_credentials("app", "hunter2");
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));

        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("hunter2"));
    }
}
