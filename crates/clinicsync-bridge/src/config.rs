use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone)]
pub struct BridgeConfig {
    pub bind_addr: String,
    /// libSQL URL or database path of the authoritative store.
    pub database_url: String,
    pub database_auth_token: Option<String>,
    pub schema_path: Option<PathBuf>,
    /// Tables served in addition to the schema's syncable and authoritative ones.
    pub extra_tables: Vec<String>,
    /// Upper bound on rows per table returned by `/v1/changes`.
    pub changes_limit: u32,
    /// Create the clinic tables on startup when missing.
    pub bootstrap_schema: bool,
}

impl fmt::Debug for BridgeConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("BridgeConfig")
            .field("bind_addr", &self.bind_addr)
            .field("database_url", &self.database_url)
            .field(
                "database_auth_token",
                &self.database_auth_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("schema_path", &self.schema_path)
            .field("extra_tables", &self.extra_tables)
            .field("changes_limit", &self.changes_limit)
            .field("bootstrap_schema", &self.bootstrap_schema)
            .finish()
    }
}

impl BridgeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = value_or_default(&lookup, "BRIDGE_BIND_ADDR", "127.0.0.1:8787");
        let database_url = required_trimmed(&lookup, "BRIDGE_DATABASE_URL")?;
        let database_auth_token = optional_trimmed(&lookup, "BRIDGE_DATABASE_AUTH_TOKEN");
        let schema_path = optional_trimmed(&lookup, "BRIDGE_SCHEMA_PATH").map(PathBuf::from);

        let extra_tables: Vec<String> = optional_trimmed(&lookup, "BRIDGE_EXTRA_TABLES")
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|table| !table.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if let Some(bad) = extra_tables
            .iter()
            .find(|table| !clinicsync_core::sql::is_safe_identifier(table))
        {
            return Err(ConfigError::Invalid(format!(
                "BRIDGE_EXTRA_TABLES contains an invalid table name `{bad}`"
            )));
        }

        let changes_limit = value_or_default(&lookup, "BRIDGE_CHANGES_LIMIT", "1000")
            .parse::<u32>()
            .map_err(|_| {
                ConfigError::Invalid(
                    "BRIDGE_CHANGES_LIMIT must be an integer in [1, 10000]".to_string(),
                )
            })?;
        if !(1..=10_000).contains(&changes_limit) {
            return Err(ConfigError::Invalid(
                "BRIDGE_CHANGES_LIMIT must be in [1, 10000]".to_string(),
            ));
        }

        let bootstrap_schema = match optional_trimmed(&lookup, "BRIDGE_BOOTSTRAP_SCHEMA") {
            None => false,
            Some(value) => matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        };

        Ok(Self {
            bind_addr,
            database_url,
            database_auth_token,
            schema_path,
            extra_tables,
            changes_limit,
            bootstrap_schema,
        })
    }
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn required_trimmed(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<String, ConfigError> {
    optional_trimmed(lookup, name).ok_or(ConfigError::MissingVar(name))
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
