//! Runtime settings for the sync core, read from `CLINICSYNC_*` variables.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::models::SyncSchema;
use crate::remote::RetryPolicy;
use crate::util::is_http_url;

/// How the core reaches the authoritative store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteMode {
    /// Direct libSQL connection (remote URL or a local database file).
    Direct,
    /// Authenticated HTTP bridge.
    Bridge,
}

impl FromStr for RemoteMode {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(Self::Direct),
            "bridge" => Ok(Self::Bridge),
            other => Err(Error::Config(format!(
                "CLINICSYNC_REMOTE_MODE must be `direct` or `bridge`, got `{other}`"
            ))),
        }
    }
}

#[derive(Clone)]
pub struct SyncSettings {
    pub remote_mode: RemoteMode,
    /// libSQL URL or database path in direct mode, bridge base URL in bridge mode.
    pub remote_url: Option<String>,
    pub remote_token: Option<String>,
    /// Local cache database file. `None` leaves the choice to the caller.
    pub cache_path: Option<PathBuf>,
    pub pull_interval: Duration,
    pub push_interval: Duration,
    pub push_debounce: Duration,
    pub push_budget: Duration,
    pub pull_batch_size: u32,
    pub http_timeout: Duration,
    pub transport_retry: RetryPolicy,
    /// `max_attempts` is the dead-letter ceiling for queued operations.
    pub queue_retry: RetryPolicy,
    pub reconcile_after_push: bool,
    pub schema_path: Option<PathBuf>,
}

impl fmt::Debug for SyncSettings {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("SyncSettings")
            .field("remote_mode", &self.remote_mode)
            .field("remote_url", &self.remote_url)
            .field(
                "remote_token",
                &self.remote_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("cache_path", &self.cache_path)
            .field("pull_interval", &self.pull_interval)
            .field("push_interval", &self.push_interval)
            .field("push_debounce", &self.push_debounce)
            .field("push_budget", &self.push_budget)
            .field("pull_batch_size", &self.pull_batch_size)
            .field("http_timeout", &self.http_timeout)
            .field("transport_retry", &self.transport_retry)
            .field("queue_retry", &self.queue_retry)
            .field("reconcile_after_push", &self.reconcile_after_push)
            .field("schema_path", &self.schema_path)
            .finish()
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            remote_mode: RemoteMode::Direct,
            remote_url: None,
            remote_token: None,
            cache_path: None,
            pull_interval: Duration::from_secs(30),
            push_interval: Duration::from_secs(10),
            push_debounce: Duration::from_millis(250),
            push_budget: Duration::from_millis(5_000),
            pull_batch_size: 500,
            http_timeout: Duration::from_secs(15),
            transport_retry: RetryPolicy::transport(3),
            queue_retry: RetryPolicy::queue(5),
            reconcile_after_push: true,
            schema_path: None,
        }
    }
}

impl SyncSettings {
    pub fn from_env() -> Result<Self> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let remote_mode = optional_trimmed(&lookup, "CLINICSYNC_REMOTE_MODE")
            .map(|value| value.parse::<RemoteMode>())
            .transpose()?
            .unwrap_or(defaults.remote_mode);
        let remote_url = optional_trimmed(&lookup, "CLINICSYNC_REMOTE_URL")
            .map(|value| value.trim_end_matches('/').to_string());
        if remote_mode == RemoteMode::Bridge {
            match remote_url.as_deref() {
                Some(url) if is_http_url(url) => {}
                Some(_) => {
                    return Err(Error::Config(
                        "CLINICSYNC_REMOTE_URL must start with http:// or https:// in bridge mode"
                            .to_string(),
                    ))
                }
                None => {
                    return Err(Error::Config(
                        "CLINICSYNC_REMOTE_URL is required in bridge mode".to_string(),
                    ))
                }
            }
        }
        let remote_token = optional_trimmed(&lookup, "CLINICSYNC_REMOTE_TOKEN");
        let cache_path = optional_trimmed(&lookup, "CLINICSYNC_CACHE_PATH").map(PathBuf::from);

        let pull_interval_secs =
            parse_in_range(&lookup, "CLINICSYNC_PULL_INTERVAL_SECS", 30, 1..=86_400)?;
        let push_interval_secs =
            parse_in_range(&lookup, "CLINICSYNC_PUSH_INTERVAL_SECS", 10, 1..=86_400)?;
        let push_debounce_ms = parse_in_range(&lookup, "CLINICSYNC_PUSH_DEBOUNCE_MS", 250, 0..=60_000)?;
        let push_budget_ms =
            parse_in_range(&lookup, "CLINICSYNC_PUSH_BUDGET_MS", 5_000, 100..=600_000)?;
        let pull_batch_size = parse_u32_in_range(&lookup, "CLINICSYNC_PULL_BATCH_SIZE", 500, 1..=50_000)?;
        let http_timeout_secs = parse_in_range(&lookup, "CLINICSYNC_HTTP_TIMEOUT_SECS", 15, 1..=300)?;
        let queue_max_attempts =
            parse_u32_in_range(&lookup, "CLINICSYNC_QUEUE_MAX_ATTEMPTS", 5, 1..=100)?;
        let transport_max_attempts =
            parse_u32_in_range(&lookup, "CLINICSYNC_TRANSPORT_MAX_ATTEMPTS", 3, 1..=10)?;

        let reconcile_after_push = match optional_trimmed(&lookup, "CLINICSYNC_RECONCILE_AFTER_PUSH")
        {
            None => defaults.reconcile_after_push,
            Some(value) => parse_bool(&value).ok_or_else(|| {
                Error::Config(format!(
                    "CLINICSYNC_RECONCILE_AFTER_PUSH must be true or false, got `{value}`"
                ))
            })?,
        };
        let schema_path = optional_trimmed(&lookup, "CLINICSYNC_SCHEMA_PATH").map(PathBuf::from);

        Ok(Self {
            remote_mode,
            remote_url,
            remote_token,
            cache_path,
            pull_interval: Duration::from_secs(pull_interval_secs),
            push_interval: Duration::from_secs(push_interval_secs),
            push_debounce: Duration::from_millis(push_debounce_ms),
            push_budget: Duration::from_millis(push_budget_ms),
            pull_batch_size,
            http_timeout: Duration::from_secs(http_timeout_secs),
            transport_retry: RetryPolicy::transport(transport_max_attempts),
            queue_retry: RetryPolicy::queue(queue_max_attempts),
            reconcile_after_push,
            schema_path,
        })
    }

    /// The configured schema file, or the built-in clinic schema.
    pub fn load_schema(&self) -> Result<SyncSchema> {
        match &self.schema_path {
            Some(path) => SyncSchema::from_json_file(path),
            None => Ok(SyncSchema::clinic()),
        }
    }
}

fn parse_in_range(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: u64,
    range: std::ops::RangeInclusive<u64>,
) -> Result<u64> {
    let Some(raw) = optional_trimmed(lookup, name) else {
        return Ok(default);
    };
    let invalid = || {
        Error::Config(format!(
            "{name} must be an integer in [{}, {}]",
            range.start(),
            range.end()
        ))
    };
    let value = raw.parse::<u64>().map_err(|_| invalid())?;
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(invalid())
    }
}

fn parse_u32_in_range(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: u32,
    range: std::ops::RangeInclusive<u32>,
) -> Result<u32> {
    let widened = u64::from(*range.start())..=u64::from(*range.end());
    let value = parse_in_range(lookup, name, u64::from(default), widened)?;
    u32::try_from(value).map_err(|_| Error::Config(format!("{name} is out of range")))
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
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
