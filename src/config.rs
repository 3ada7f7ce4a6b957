//! Environment-sourced configuration.
//!
//! Loaded once at startup via [`AuditConfig::from_env`]. Unlike the crawler's
//! typestate `CrawlConfigBuilder`, there is no multi-step required-field
//! invariant here — every field has a default except the two API keys, so a
//! direct `std::env::var` + parse-with-default pattern is enough.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    MissingRequired(&'static str),
    #[error("environment variable {name} has an invalid value {value:?}: {source}")]
    InvalidValue {
        name: &'static str,
        value: String,
        source: std::num::ParseIntError,
    },
}

#[derive(Debug, Clone)]
pub struct AuditConfig {
    pub psi_api_key: String,
    pub google_api_key: String,
    pub cache_db_path: PathBuf,
    pub cache_ttl_seconds: u64,
    pub audit_timeout_seconds: u64,
    pub max_concurrent_audits: usize,
    pub max_queue_size: usize,
    pub queue_timeout_seconds: u64,
    pub browser_pool_size: usize,
    pub browser_launch_timeout_seconds: u64,
    pub browser_idle_timeout_seconds: u64,
    pub bind_addr: String,
    pub max_jobs_per_ip: usize,
}

fn parse_env<T: std::str::FromStr<Err = std::num::ParseIntError>>(
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|source| ConfigError::InvalidValue { name, value, source }),
        Err(_) => Ok(default),
    }
}

fn default_cache_path() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("webauditor")
        .join("audit_cache.db")
}

impl AuditConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let psi_api_key = std::env::var("PSI_API_KEY")
            .map_err(|_| ConfigError::MissingRequired("PSI_API_KEY"))?;
        let google_api_key = std::env::var("GOOGLE_API_KEY")
            .map_err(|_| ConfigError::MissingRequired("GOOGLE_API_KEY"))?;

        let cache_db_path = std::env::var("AUDIT_CACHE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_cache_path());

        Ok(Self {
            psi_api_key,
            google_api_key,
            cache_db_path,
            cache_ttl_seconds: parse_env("CACHE_TTL_SECONDS", 86_400)?,
            audit_timeout_seconds: parse_env("AUDIT_TIMEOUT", 600)?,
            max_concurrent_audits: parse_env("MAX_CONCURRENT_AUDITS", 10)?,
            max_queue_size: parse_env("MAX_QUEUE_SIZE", 50)?,
            queue_timeout_seconds: parse_env("QUEUE_TIMEOUT_SECONDS", 300)?,
            browser_pool_size: parse_env("BROWSER_POOL_SIZE", 5)?,
            browser_launch_timeout_seconds: parse_env("BROWSER_LAUNCH_TIMEOUT", 30)?,
            browser_idle_timeout_seconds: parse_env("BROWSER_IDLE_TIMEOUT", 300)?,
            bind_addr: std::env::var("AUDIT_BIND_ADDR")
                .unwrap_or_else(|_| "127.0.0.1:8080".to_string()),
            max_jobs_per_ip: 5,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clear_env() {
        for key in [
            "PSI_API_KEY",
            "GOOGLE_API_KEY",
            "AUDIT_CACHE_PATH",
            "CACHE_TTL_SECONDS",
            "MAX_CONCURRENT_AUDITS",
        ] {
            unsafe { std::env::remove_var(key) };
        }
    }

    #[test]
    fn missing_required_key_is_fatal() {
        clear_env();
        let result = AuditConfig::from_env();
        assert!(matches!(result, Err(ConfigError::MissingRequired("PSI_API_KEY"))));
    }

    #[test]
    fn defaults_apply_when_only_keys_set() {
        clear_env();
        unsafe {
            std::env::set_var("PSI_API_KEY", "psi-test-key");
            std::env::set_var("GOOGLE_API_KEY", "google-test-key");
        }
        let config = AuditConfig::from_env().expect("config should load");
        assert_eq!(config.max_concurrent_audits, 10);
        assert_eq!(config.max_queue_size, 50);
        assert_eq!(config.cache_ttl_seconds, 86_400);
        clear_env();
    }
}
