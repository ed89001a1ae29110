//! Runtime settings read from the environment (optionally via `.env`).

use crate::error::ConfigError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    /// In-process document store (collections of JSON documents).
    Document,
    /// PostgreSQL through sqlx.
    Postgres,
}

impl std::str::FromStr for Backend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "document" | "memory" => Ok(Backend::Document),
            "postgres" | "postgresql" | "pg" => Ok(Backend::Postgres),
            _ => Err(ConfigError::Settings(format!(
                "invalid backend: {} (expected document or postgres)",
                s
            ))),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub backend: Backend,
    pub database_url: String,
    pub max_connections: u32,
    /// PostgreSQL schema holding resource tables.
    pub schema: String,
}

impl Settings {
    /// Read `RESOURCE_ENGINE_BACKEND`, `DATABASE_URL`, `DATABASE_MAX_CONNECTIONS` and `RESOURCE_ENGINE_SCHEMA`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let backend = lookup("RESOURCE_ENGINE_BACKEND")
            .map(|s| s.parse())
            .transpose()?
            .unwrap_or(Backend::Document);
        let database_url =
            lookup("DATABASE_URL").unwrap_or_else(|| "postgres://localhost/resource_engine".into());
        let max_connections = match lookup("DATABASE_MAX_CONNECTIONS") {
            Some(v) => v
                .parse()
                .map_err(|_| ConfigError::Settings(format!("DATABASE_MAX_CONNECTIONS: invalid number '{}'", v)))?,
            None => 5,
        };
        let schema = lookup("RESOURCE_ENGINE_SCHEMA").unwrap_or_else(|| "public".into());
        Ok(Settings {
            backend,
            database_url,
            max_connections,
            schema,
        })
    }
}
