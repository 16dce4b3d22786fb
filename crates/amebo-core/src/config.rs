//! Runtime configuration loaded from environment variables.

use std::env;
use std::time::Duration;

/// Relational backend selector (`AMEBO_ENGINE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engine {
    /// Single-file embedded store (SQLite).
    Embedded,
    /// Networked relational store (Postgres).
    Networked,
}

/// Errors raised while loading [`AmeboConfig`] from the environment.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable was missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// A variable was present but could not be parsed into its target type.
    #[error("invalid value for {name}: {reason}")]
    Invalid {
        /// Name of the offending variable.
        name: &'static str,
        /// Human-readable parse failure detail.
        reason: String,
    },
}

/// Fully-resolved runtime configuration for an Amebo process.
#[derive(Debug, Clone)]
pub struct AmeboConfig {
    /// Backend selector (`AMEBO_ENGINE`).
    pub engine: Engine,
    /// Connection string for the networked backend (`AMEBO_DSN`).
    pub dsn: Option<String>,
    /// Max gists picked per dispatcher cycle (`ENVELOPE_SIZE`).
    pub envelope_size: i64,
    /// Below this picked-batch size, the dispatcher idles (`AMEBO_REST_WHEN`).
    pub rest_when: usize,
    /// Idle sleep between cycles (`AMEBO_IDLE_SECS`).
    pub idle: Duration,
    /// Per-delivery HTTP timeout (`AMEBO_REQUEST_TIMEOUT_SECS`).
    pub request_timeout: Duration,
    /// Token-signing secret (`AMEBO_SECRET`, or a deterministic fallback).
    pub secret: String,
    /// Whether `secret` came from `AMEBO_SECRET` or the host-derived fallback.
    pub secret_is_fallback: bool,
    /// Administrator bootstrap username (`AMEBO_USERNAME`).
    pub admin_username: Option<String>,
    /// Administrator bootstrap password (`AMEBO_PASSWORD`).
    pub admin_password: Option<String>,
    /// HTTP bind address (`AMEBO_BIND`).
    pub bind: String,
    /// Pagination cap (`AMEBO_MAX_PAGE_SIZE`).
    pub max_page_size: u32,
}

impl AmeboConfig {
    /// Loads configuration from the process environment, applying defaults
    /// for every optional variable.
    pub fn from_env() -> Result<Self, ConfigError> {
        let engine = match env::var("AMEBO_ENGINE").ok().as_deref() {
            None | Some("embedded") => Engine::Embedded,
            Some("networked") => Engine::Networked,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    name: "AMEBO_ENGINE",
                    reason: format!("expected 'embedded' or 'networked', got '{other}'"),
                });
            }
        };

        let dsn = env::var("AMEBO_DSN").ok();
        if matches!(engine, Engine::Networked) && dsn.is_none() {
            return Err(ConfigError::Missing("AMEBO_DSN"));
        }

        let envelope_size = parse_env_or("ENVELOPE_SIZE", 256)?;
        let rest_when = parse_env_or("AMEBO_REST_WHEN", 8)?;
        let idle_secs: u64 = parse_env_or("AMEBO_IDLE_SECS", 2)?;
        let request_timeout_secs: u64 = parse_env_or("AMEBO_REQUEST_TIMEOUT_SECS", 10)?;
        let max_page_size = parse_env_or("AMEBO_MAX_PAGE_SIZE", 100)?;

        let (secret, secret_is_fallback) = match env::var("AMEBO_SECRET").ok() {
            Some(s) if !s.is_empty() => (s, false),
            _ => (host_derived_secret(), true),
        };

        let bind = env::var("AMEBO_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_string());

        Ok(Self {
            engine,
            dsn,
            envelope_size,
            rest_when,
            idle: Duration::from_secs(idle_secs),
            request_timeout: Duration::from_secs(request_timeout_secs),
            secret,
            secret_is_fallback,
            admin_username: env::var("AMEBO_USERNAME").ok(),
            admin_password: env::var("AMEBO_PASSWORD").ok(),
            bind,
            max_page_size,
        })
    }
}

fn parse_env_or<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
{
    match env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
            name,
            reason: format!("could not parse '{raw}'"),
        }),
        Err(_) => Ok(default),
    }
}

/// Deterministic signing-key fallback derived from host identity, used when
/// `AMEBO_SECRET` is unset. Not persisted across hosts; callers should warn
/// when this path is taken.
#[must_use]
pub fn host_derived_secret() -> String {
    use sha2::{Digest, Sha256};
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "amebo-unknown-host".to_string());
    let mut hasher = Sha256::new();
    hasher.update(b"amebo-dev-fallback-secret:");
    hasher.update(host.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_derived_secret_is_deterministic_within_a_process() {
        assert_eq!(host_derived_secret(), host_derived_secret());
    }

    #[test]
    fn parse_env_or_falls_back_when_unset() {
        std::env::remove_var("AMEBO_TEST_UNSET_VALUE");
        let value: u64 = parse_env_or("AMEBO_TEST_UNSET_VALUE", 42).unwrap();
        assert_eq!(value, 42);
    }
}
