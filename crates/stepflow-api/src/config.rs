//! Environment configuration for the service binary

use anyhow::Context;

use stepflow_storage::DEFAULT_QUEUE_PREFIX;

/// Configuration read from the environment.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Queue store endpoint, e.g. `redis://127.0.0.1:6379`.
    pub redis_url: String,
    /// Document store endpoint, e.g. `postgres://localhost/stepflow`.
    pub database_url: String,
    /// Key namespace shared with workers and schedulers.
    pub queue_prefix: String,
    pub port: u16,
}

impl ApiConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let redis_url =
            std::env::var("REDIS_URL").context("REDIS_URL environment variable required")?;
        let database_url = std::env::var("DATABASE_URL")
            .context("DATABASE_URL environment variable required")?;
        let queue_prefix = std::env::var("STEPFLOW_QUEUE_PREFIX")
            .unwrap_or_else(|_| DEFAULT_QUEUE_PREFIX.to_string());
        let port = match std::env::var("PORT") {
            Ok(raw) => raw.parse().context("PORT must be a number")?,
            Err(_) => 8080,
        };

        Ok(Self {
            redis_url,
            database_url,
            queue_prefix,
            port,
        })
    }
}
