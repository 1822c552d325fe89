use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use notez_gateway::GatewayConfig;

/// Secrets that only exist in sample files and must never reach production.
pub const PLACEHOLDER_SECRETS: &[&str] = &["change-me-to-a-random-string", "dev-secret-change-me"];

#[derive(Debug, Clone)]
pub struct Config {
    pub jwt_secret: String,
    pub db_path: PathBuf,
    pub host: String,
    pub port: u16,
    pub backlog_size: u32,
    pub assistant_delay: Duration,
    pub cleanup_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from any key lookup. Unset keys fall back to their
    /// defaults; a value that is set but does not parse is an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let port: u16 = get("NOTEZ_PORT", "3000")
            .parse()
            .context("NOTEZ_PORT must be a port number")?;
        let backlog_size: u32 = get("NOTEZ_BACKLOG_SIZE", "20")
            .parse()
            .context("NOTEZ_BACKLOG_SIZE must be a positive integer")?;
        if backlog_size == 0 {
            anyhow::bail!("NOTEZ_BACKLOG_SIZE must be a positive integer");
        }
        let assistant_delay_ms: u64 = get("NOTEZ_ASSISTANT_DELAY_MS", "2000")
            .parse()
            .context("NOTEZ_ASSISTANT_DELAY_MS must be a number of milliseconds")?;
        let cleanup_secs: u64 = get("NOTEZ_CLEANUP_INTERVAL_SECS", "3600")
            .parse()
            .context("NOTEZ_CLEANUP_INTERVAL_SECS must be a number of seconds")?;
        if cleanup_secs == 0 {
            anyhow::bail!("NOTEZ_CLEANUP_INTERVAL_SECS must be greater than zero");
        }

        Ok(Self {
            jwt_secret: get("NOTEZ_JWT_SECRET", "dev-secret-change-me"),
            db_path: get("NOTEZ_DB_PATH", "notez.db").into(),
            host: get("NOTEZ_HOST", "0.0.0.0"),
            port,
            backlog_size,
            assistant_delay: Duration::from_millis(assistant_delay_ms),
            cleanup_interval: Duration::from_secs(cleanup_secs),
        })
    }

    pub fn uses_placeholder_secret(&self) -> bool {
        self.jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&self.jwt_secret.as_str())
    }

    pub fn addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.host, self.port))
    }

    pub fn gateway(&self) -> GatewayConfig {
        GatewayConfig {
            backlog_size: self.backlog_size,
            assistant_delay: self.assistant_delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.backlog_size, 20);
        assert_eq!(config.assistant_delay, Duration::from_secs(2));
        assert_eq!(config.cleanup_interval, Duration::from_secs(3600));
        assert_eq!(config.db_path, PathBuf::from("notez.db"));
        assert!(config.uses_placeholder_secret());
        assert_eq!(config.addr().unwrap().port(), 3000);
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("NOTEZ_JWT_SECRET", "s3cret"),
            ("NOTEZ_HOST", "127.0.0.1"),
            ("NOTEZ_PORT", "8080"),
            ("NOTEZ_BACKLOG_SIZE", "50"),
            ("NOTEZ_ASSISTANT_DELAY_MS", "250"),
        ]))
        .unwrap();
        assert!(!config.uses_placeholder_secret());
        assert_eq!(config.addr().unwrap().to_string(), "127.0.0.1:8080");
        let gateway = config.gateway();
        assert_eq!(gateway.backlog_size, 50);
        assert_eq!(gateway.assistant_delay, Duration::from_millis(250));
    }

    #[test]
    fn test_bad_values_fail() {
        assert!(Config::from_lookup(lookup(&[("NOTEZ_PORT", "eighty")])).is_err());
        assert!(Config::from_lookup(lookup(&[("NOTEZ_BACKLOG_SIZE", "-1")])).is_err());
        assert!(Config::from_lookup(lookup(&[("NOTEZ_BACKLOG_SIZE", "0")])).is_err());
        assert!(Config::from_lookup(lookup(&[("NOTEZ_CLEANUP_INTERVAL_SECS", "0")])).is_err());
    }
}
