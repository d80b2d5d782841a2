use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use figment::{
    Figment,
    providers::{Env, Format, Toml, Yaml},
};

/// Prefix for environment variable overrides, e.g. `RECLAIMDB__DATABASE__PWD`.
pub const ENV_PREFIX: &str = "RECLAIMDB__";

/// Default number of rows preserved by a table rewrite.
pub const DEFAULT_CAPTURE_LIMIT: u64 = 1000;

/// A credential that never shows up in `Debug` output or serialized configuration.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(********)")
    }
}

impl Serialize for Secret {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("********")
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Secret)
    }
}

/// Server connection settings and the databases to process.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Driver identifier, e.g. `ODBC Driver 17 for SQL Server`.
    ///
    /// Env: RECLAIMDB__DATABASE__DRIVER
    pub driver: String,

    /// Server address: `host`, `host,port` or `host:port`.
    ///
    /// Env: RECLAIMDB__DATABASE__SERVER
    pub server: String,

    /// Login name.
    ///
    /// Env: RECLAIMDB__DATABASE__UID
    pub uid: String,

    /// Login password.
    ///
    /// Env: RECLAIMDB__DATABASE__PWD
    pub pwd: Secret,

    /// Databases processed by a run, in order.
    ///
    /// Env: RECLAIMDB__DATABASE__DATABASES
    pub databases: Vec<String>,

    /// Accept the server certificate without validation.
    ///
    /// Env: RECLAIMDB__DATABASE__TRUST_SERVER_CERTIFICATE
    #[serde(default = "default_trust_server_certificate")]
    pub trust_server_certificate: bool,
}

fn default_trust_server_certificate() -> bool {
    true
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// File that receives a copy of every log line (appended).
    ///
    /// Env: RECLAIMDB__LOGGING__FILE
    pub file: PathBuf,

    /// Default filter directive when neither RUST_LOG nor a CLI flag overrides it.
    ///
    /// Env: RECLAIMDB__LOGGING__LEVEL
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Table rewrite settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RewriteConfig {
    /// Maximum number of rows kept by a rewrite. Rows beyond it are discarded.
    ///
    /// Env: RECLAIMDB__REWRITE__CAPTURE_LIMIT
    #[serde(default = "default_capture_limit")]
    pub capture_limit: u64,
}

fn default_capture_limit() -> u64 {
    DEFAULT_CAPTURE_LIMIT
}

impl Default for RewriteConfig {
    fn default() -> Self {
        Self {
            capture_limit: default_capture_limit(),
        }
    }
}

/// Readiness polling and shrink settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShrinkConfig {
    /// Pause between two readiness polls.
    ///
    /// Env: RECLAIMDB__SHRINK__POLL_INTERVAL
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,

    /// Pause between observing ONLINE and issuing the shrink.
    ///
    /// Env: RECLAIMDB__SHRINK__SETTLE_DELAY
    #[serde(with = "humantime_serde", default = "default_settle_delay")]
    pub settle_delay: Duration,

    /// Upper bound on the readiness wait. Unset means wait indefinitely.
    ///
    /// Env: RECLAIMDB__SHRINK__MAX_WAIT
    #[serde(
        with = "humantime_serde",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub max_wait: Option<Duration>,
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_settle_delay() -> Duration {
    Duration::from_secs(1)
}

impl Default for ShrinkConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            settle_delay: default_settle_delay(),
            max_wait: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Configuration {
    /// Server, credentials and database list
    pub database: DatabaseConfig,
    /// Tables whose summed row count exceeds this are rewritten
    pub row_threshold: u64,
    /// Log file and level
    pub logging: LoggingConfig,
    #[serde(default)]
    pub rewrite: RewriteConfig,
    #[serde(default)]
    pub shrink: ShrinkConfig,
    /// Select and report candidates without rewriting or shrinking
    #[serde(default)]
    pub dry_run: bool,
}

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Failed to read configuration: {0}")]
    Extract(#[from] Box<figment::Error>),

    #[error("Configuration key '{0}' must not be empty")]
    EmptyValue(&'static str),

    #[error("database.databases must list at least one database")]
    NoDatabases,

    #[error("row_threshold {0} exceeds the largest row count the engine reports")]
    ThresholdOutOfRange(u64),

    #[error("rewrite.capture_limit must be positive")]
    ZeroCaptureLimit,

    #[error("shrink.poll_interval must be positive")]
    ZeroPollInterval,
}

impl Configuration {
    /// Load configuration from a YAML (`.yaml`/`.yml`) or TOML file, then apply
    /// `RECLAIMDB__` environment overrides and validate the result.
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let figment = match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => Figment::from(Yaml::file_exact(path)),
            _ => Figment::from(Toml::file_exact(path)),
        };

        let config: Configuration = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(Box::new)?;

        config.validate()?;
        Ok(config)
    }

    /// Check the semantic constraints serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.server.trim().is_empty() {
            return Err(ConfigError::EmptyValue("database.server"));
        }
        if self.database.uid.trim().is_empty() {
            return Err(ConfigError::EmptyValue("database.uid"));
        }
        if self.database.driver.trim().is_empty() {
            return Err(ConfigError::EmptyValue("database.driver"));
        }
        if self.database.databases.is_empty() {
            return Err(ConfigError::NoDatabases);
        }
        if self
            .database
            .databases
            .iter()
            .any(|name| name.trim().is_empty())
        {
            return Err(ConfigError::EmptyValue("database.databases"));
        }
        if self.logging.file.as_os_str().is_empty() {
            return Err(ConfigError::EmptyValue("logging.file"));
        }
        if i64::try_from(self.row_threshold).is_err() {
            return Err(ConfigError::ThresholdOutOfRange(self.row_threshold));
        }
        if self.rewrite.capture_limit == 0 {
            return Err(ConfigError::ZeroCaptureLimit);
        }
        if self.shrink.poll_interval.is_zero() {
            return Err(ConfigError::ZeroPollInterval);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    const MINIMAL_YAML: &str = r#"
database:
  driver: "ODBC Driver 17 for SQL Server"
  server: "sql01,1433"
  uid: "sa"
  pwd: "hunter2"
  databases:
    - Sales
    - Archive
row_threshold: 500
logging:
  file: "reclaim.log"
"#;

    #[test]
    fn test_minimal_yaml_applies_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file("config.yaml", MINIMAL_YAML)?;

            let config = Configuration::load_from_path(Path::new("config.yaml")).unwrap();

            assert_eq!(config.database.server, "sql01,1433");
            assert_eq!(config.database.pwd.expose(), "hunter2");
            assert_eq!(config.database.databases, vec!["Sales", "Archive"]);
            assert!(config.database.trust_server_certificate);
            assert_eq!(config.row_threshold, 500);
            assert_eq!(config.logging.file, PathBuf::from("reclaim.log"));
            assert_eq!(config.logging.level, "info");
            assert_eq!(config.rewrite.capture_limit, 1000);
            assert_eq!(config.shrink.poll_interval, Duration::from_secs(5));
            assert_eq!(config.shrink.settle_delay, Duration::from_secs(1));
            assert_eq!(config.shrink.max_wait, None);
            assert!(!config.dry_run);
            Ok(())
        });
    }

    #[test]
    fn test_toml_with_overrides() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "reclaim.toml",
                r#"
row_threshold = 10000
dry_run = true

[database]
driver = "ODBC Driver 18 for SQL Server"
server = "localhost"
uid = "maint"
pwd = "secret"
databases = ["One"]

[logging]
file = "/var/log/reclaim.log"
level = "debug"

[rewrite]
capture_limit = 250

[shrink]
poll_interval = "2s"
settle_delay = "500ms"
max_wait = "10m"
"#,
            )?;

            let config = Configuration::load_from_path(Path::new("reclaim.toml")).unwrap();

            assert_eq!(config.row_threshold, 10000);
            assert!(config.dry_run);
            assert_eq!(config.rewrite.capture_limit, 250);
            assert_eq!(config.shrink.poll_interval, Duration::from_secs(2));
            assert_eq!(config.shrink.settle_delay, Duration::from_millis(500));
            assert_eq!(config.shrink.max_wait, Some(Duration::from_secs(600)));
            assert_eq!(config.logging.level, "debug");
            Ok(())
        });
    }

    #[test]
    fn test_env_var_override() {
        Jail::expect_with(|jail| {
            jail.create_file("config.yaml", MINIMAL_YAML)?;
            jail.set_env("RECLAIMDB__DATABASE__PWD", "from-env");
            jail.set_env("RECLAIMDB__ROW_THRESHOLD", "42");

            let config = Configuration::load_from_path(Path::new("config.yaml")).unwrap();

            assert_eq!(config.database.pwd.expose(), "from-env");
            assert_eq!(config.row_threshold, 42);
            Ok(())
        });
    }

    #[test]
    fn test_missing_key_fails() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "config.yaml",
                r#"
database:
  driver: "ODBC Driver 17 for SQL Server"
  server: "sql01"
  uid: "sa"
  pwd: "x"
  databases: [A]
logging:
  file: "reclaim.log"
"#,
            )?;

            let err = Configuration::load_from_path(Path::new("config.yaml")).unwrap_err();
            assert!(matches!(err, ConfigError::Extract(_)));
            Ok(())
        });
    }

    #[test]
    fn test_malformed_threshold_fails() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "config.yaml",
                &MINIMAL_YAML.replace("row_threshold: 500", "row_threshold: lots"),
            )?;

            let err = Configuration::load_from_path(Path::new("config.yaml")).unwrap_err();
            assert!(matches!(err, ConfigError::Extract(_)));
            Ok(())
        });
    }

    #[test]
    fn test_missing_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.yaml");

        let err = Configuration::load_from_path(&path).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(p) if p == path));
    }

    #[test]
    fn test_empty_database_list_is_invalid() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "config.yaml",
                &MINIMAL_YAML.replace("    - Sales\n    - Archive\n", "    []\n"),
            )?;

            let err = Configuration::load_from_path(Path::new("config.yaml")).unwrap_err();
            assert!(matches!(err, ConfigError::NoDatabases));
            Ok(())
        });
    }

    #[test]
    fn test_zero_capture_limit_is_invalid() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "config.yaml",
                &format!("{MINIMAL_YAML}rewrite:\n  capture_limit: 0\n"),
            )?;

            let err = Configuration::load_from_path(Path::new("config.yaml")).unwrap_err();
            assert!(matches!(err, ConfigError::ZeroCaptureLimit));
            Ok(())
        });
    }

    #[test]
    fn test_password_is_redacted() {
        let secret = Secret::new("hunter2");
        assert_eq!(format!("{secret:?}"), "Secret(********)");
        assert_eq!(serde_json::to_string(&secret).unwrap(), "\"********\"");
    }
}
