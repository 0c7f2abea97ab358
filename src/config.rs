//! Environment-driven runtime configuration.
//!
//! Every knob has a default except the two collaborator API keys, which
//! are required to start the server. A `.env` file is honored when
//! present (loaded by `main` before this runs).

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Permissive CORS for local frontend development.
    pub dev_mode: bool,
    pub db_path: PathBuf,

    pub gemini_api_key: String,
    pub gemini_base_url: String,
    pub gemini_model: String,

    pub serpapi_key: String,
    pub serpapi_base_url: String,
    pub search_language: String,
    pub search_country: String,

    pub generation_timeout: Duration,
    pub search_timeout: Duration,
    /// Fan-out limit for batch product resolution.
    pub resolve_concurrency: usize,
}

pub const DEFAULT_DB_PATH: &str = ".visage/visage.db";

impl Config {
    pub fn from_env() -> Result<Self> {
        let gemini_api_key =
            std::env::var("GEMINI_API_KEY").context("GEMINI_API_KEY not set")?;
        let serpapi_key = std::env::var("SERPAPI_KEY").context("SERPAPI_KEY not set")?;

        Ok(Self {
            host: env_or("VISAGE_HOST", "127.0.0.1"),
            port: env_parse("VISAGE_PORT", 8000)?,
            dev_mode: env_flag("VISAGE_DEV"),
            db_path: PathBuf::from(env_or("VISAGE_DB", DEFAULT_DB_PATH)),
            gemini_api_key,
            gemini_base_url: env_or(
                "GEMINI_BASE_URL",
                "https://generativelanguage.googleapis.com",
            ),
            gemini_model: env_or("GEMINI_MODEL", "gemini-2.0-flash"),
            serpapi_key,
            serpapi_base_url: env_or("SERPAPI_BASE_URL", "https://serpapi.com"),
            search_language: env_or("SEARCH_LANGUAGE", "en"),
            search_country: env_or("SEARCH_COUNTRY", "us"),
            generation_timeout: Duration::from_millis(env_parse(
                "GENERATION_TIMEOUT_MS",
                60_000,
            )?),
            search_timeout: Duration::from_millis(env_parse("SEARCH_TIMEOUT_MS", 20_000)?),
            resolve_concurrency: env_parse("RESOLVE_CONCURRENCY", 4)?,
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| v != "false" && v != "0" && !v.is_empty())
        .unwrap_or(false)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{} has an invalid value: {}", key, raw)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_or_falls_back_when_unset() {
        assert_eq!(env_or("VISAGE_TEST_SURELY_UNSET", "fallback"), "fallback");
    }

    #[test]
    fn env_parse_falls_back_when_unset() {
        let port: u16 = env_parse("VISAGE_TEST_SURELY_UNSET_PORT", 8000).unwrap();
        assert_eq!(port, 8000);
    }

    #[test]
    fn env_flag_defaults_to_false() {
        assert!(!env_flag("VISAGE_TEST_SURELY_UNSET_FLAG"));
    }
}
