//! Runtime configuration, read from the environment (and `.env`).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::error::ConfigError;

const DEFAULT_LISTEN_PORT: u16 = 8080;
const DEFAULT_ARTIFACT_DIRS: &str = "/opt/agent,data/agent";
const DEFAULT_ARTIFACT_PREFIX: &str = "fleet-agent";
const DEFAULT_POOL_SIZE: usize = 16;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
const DEFAULT_RETENTION_QUEUE_CAPACITY: usize = 256;

/// PostgreSQL connection settings.
#[derive(Debug)]
pub struct DatabaseConfig {
    pub url: SecretString,
    pub pool_size: usize,
}

impl DatabaseConfig {
    pub fn url(&self) -> &str {
        self.url.expose_secret()
    }
}

/// How log lines are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{}'", other)),
        }
    }
}

#[derive(Debug)]
pub struct Config {
    /// `None` runs on the in-memory store.
    pub database: Option<DatabaseConfig>,
    pub listen_addr: SocketAddr,
    /// Bearer token for the operator routes.
    pub admin_token: SecretString,
    /// Searched in order for published agent binaries.
    pub artifact_dirs: Vec<PathBuf>,
    pub artifact_prefix: String,
    pub sweep_interval: Duration,
    pub retention_queue_capacity: usize,
    pub log_format: LogFormat,
}

impl Config {
    /// Load `.env` if present, then read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let database = match get("DATABASE_URL") {
            Some(url) => Some(DatabaseConfig {
                url: SecretString::from(url),
                pool_size: parse_or(&get, "DATABASE_POOL_SIZE", DEFAULT_POOL_SIZE)?,
            }),
            None => None,
        };

        let admin_token = get("DISPATCH_ADMIN_TOKEN")
            .map(SecretString::from)
            .ok_or_else(|| ConfigError::MissingEnvVar("DISPATCH_ADMIN_TOKEN".into()))?;

        let listen_addr = parse_or(
            &get,
            "DISPATCH_LISTEN_ADDR",
            SocketAddr::from(([0, 0, 0, 0], DEFAULT_LISTEN_PORT)),
        )?;

        let artifact_dirs = get("AGENT_ARTIFACT_DIRS")
            .unwrap_or_else(|| DEFAULT_ARTIFACT_DIRS.to_string())
            .split(',')
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(PathBuf::from)
            .collect();

        let artifact_prefix =
            get("AGENT_ARTIFACT_PREFIX").unwrap_or_else(|| DEFAULT_ARTIFACT_PREFIX.to_string());

        let sweep_secs: u64 = parse_or(
            &get,
            "LIVENESS_SWEEP_INTERVAL_SECS",
            DEFAULT_SWEEP_INTERVAL_SECS,
        )?;
        if sweep_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "LIVENESS_SWEEP_INTERVAL_SECS".into(),
                message: "must be at least 1".into(),
            });
        }

        let retention_queue_capacity = parse_or(
            &get,
            "RETENTION_QUEUE_CAPACITY",
            DEFAULT_RETENTION_QUEUE_CAPACITY,
        )?;

        let log_format = parse_or(&get, "LOG_FORMAT", LogFormat::default())?;

        Ok(Self {
            database,
            listen_addr,
            admin_token,
            artifact_dirs,
            artifact_prefix,
            sweep_interval: Duration::from_secs(sweep_secs),
            retention_queue_capacity,
            log_format,
        })
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[("DISPATCH_ADMIN_TOKEN", "secret")]).unwrap();
        assert!(config.database.is_none());
        assert_eq!(config.listen_addr, "0.0.0.0:8080".parse::<SocketAddr>().unwrap());
        assert_eq!(config.admin_token.expose_secret(), "secret");
        assert_eq!(
            config.artifact_dirs,
            vec![PathBuf::from("/opt/agent"), PathBuf::from("data/agent")]
        );
        assert_eq!(config.artifact_prefix, "fleet-agent");
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.retention_queue_capacity, 256);
        assert_eq!(config.log_format, LogFormat::Pretty);
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("DISPATCH_ADMIN_TOKEN", "secret"),
            ("DATABASE_URL", "postgres://localhost/fleet"),
            ("DATABASE_POOL_SIZE", "4"),
            ("DISPATCH_LISTEN_ADDR", "127.0.0.1:9000"),
            ("AGENT_ARTIFACT_DIRS", " /srv/a , ,/srv/b"),
            ("LIVENESS_SWEEP_INTERVAL_SECS", "15"),
            ("LOG_FORMAT", "JSON"),
        ])
        .unwrap();
        let db = config.database.unwrap();
        assert_eq!(db.url(), "postgres://localhost/fleet");
        assert_eq!(db.pool_size, 4);
        assert_eq!(config.listen_addr, "127.0.0.1:9000".parse::<SocketAddr>().unwrap());
        assert_eq!(
            config.artifact_dirs,
            vec![PathBuf::from("/srv/a"), PathBuf::from("/srv/b")]
        );
        assert_eq!(config.sweep_interval, Duration::from_secs(15));
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_missing_admin_token() {
        assert!(matches!(
            load(&[]),
            Err(ConfigError::MissingEnvVar(key)) if key == "DISPATCH_ADMIN_TOKEN"
        ));
    }

    #[test]
    fn test_invalid_values() {
        for (key, value) in [
            ("DATABASE_POOL_SIZE", "many"),
            ("DISPATCH_LISTEN_ADDR", "nowhere"),
            ("LIVENESS_SWEEP_INTERVAL_SECS", "0"),
            ("LOG_FORMAT", "xml"),
        ] {
            let mut vars = vec![
                ("DISPATCH_ADMIN_TOKEN", "secret"),
                ("DATABASE_URL", "postgres://localhost/fleet"),
            ];
            vars.push((key, value));
            match load(&vars) {
                Err(ConfigError::InvalidValue { key: got, .. }) => assert_eq!(got, key),
                other => panic!("expected invalid {}, got {:?}", key, other.map(|_| ())),
            }
        }
    }
}
