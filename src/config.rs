//! Process-wide configuration, loaded once at startup and immutable
//! afterward.

use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub require_approval: bool,
    pub cors_origins: Vec<String>,
    pub rate_limit_per_min: u32,
    pub secret_key: String,
    /// `> 0` enables the background tick loop at that cadence, in seconds.
    pub scheduler_background_interval_seconds: u64,
    pub max_retries: i32,
    pub backoff_base_seconds: f64,
    pub backoff_jitter_seconds: f64,
    pub default_claim_ttl_seconds: i64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("PORT must be a valid number")?,
            require_approval: env::var("REQUIRE_APPROVAL")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(true),
            cors_origins: env::var("CORS_ORIGINS")
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_default(),
            rate_limit_per_min: env::var("RATE_LIMIT_PER_MIN")
                .unwrap_or_else(|_| "600".to_string())
                .parse()
                .context("RATE_LIMIT_PER_MIN must be a valid number")?,
            secret_key: env::var("SECRET_KEY").unwrap_or_else(|_| "dev-only-insecure-key".to_string()),
            scheduler_background_interval_seconds: env::var("SCHEDULER_BACKGROUND_INTERVAL")
                .unwrap_or_else(|_| "0".to_string())
                .parse()
                .context("SCHEDULER_BACKGROUND_INTERVAL must be a valid number")?,
            max_retries: env::var("MAX_RETRIES")
                .unwrap_or_else(|_| "3".to_string())
                .parse()
                .context("MAX_RETRIES must be a valid number")?,
            backoff_base_seconds: env::var("BACKOFF_BASE_SECONDS")
                .unwrap_or_else(|_| "1".to_string())
                .parse()
                .context("BACKOFF_BASE_SECONDS must be a valid number")?,
            backoff_jitter_seconds: env::var("BACKOFF_JITTER_SECONDS")
                .unwrap_or_else(|_| "0".to_string())
                .parse()
                .context("BACKOFF_JITTER_SECONDS must be a valid number")?,
            default_claim_ttl_seconds: env::var("DEFAULT_CLAIM_TTL_SECONDS")
                .unwrap_or_else(|_| "300".to_string())
                .parse()
                .context("DEFAULT_CLAIM_TTL_SECONDS must be a valid number")?,
        })
    }

    pub fn default_retry_policy(&self) -> crate::retry::RetryPolicy {
        crate::retry::RetryPolicy {
            max_retries: self.max_retries,
            backoff_base_seconds: self.backoff_base_seconds,
            backoff_jitter_seconds: self.backoff_jitter_seconds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn require_approval_defaults_to_true() {
        env::remove_var("REQUIRE_APPROVAL");
        env::set_var("DATABASE_URL", "postgres://localhost/test");
        let config = Config::from_env().unwrap();
        assert!(config.require_approval);
    }

    #[test]
    fn require_approval_false_disables_gate() {
        env::set_var("DATABASE_URL", "postgres://localhost/test");
        env::set_var("REQUIRE_APPROVAL", "false");
        let config = Config::from_env().unwrap();
        assert!(!config.require_approval);
        env::remove_var("REQUIRE_APPROVAL");
    }
}
