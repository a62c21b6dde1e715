use std::path::PathBuf;
use std::sync::Arc;

use clinicsync_core::cache::LocalCache;
use clinicsync_core::config::SyncSettings;
use clinicsync_core::models::SyncSchema;
use clinicsync_core::remote::{self, RemoteExecutor, RetryPolicy};
use clinicsync_core::router::QueryRouter;
use clinicsync_core::scheduler::{SchedulerConfig, SyncScheduler};
use clinicsync_core::{Row, SqlValue};
use serde::Serialize;

use crate::error::CliError;

/// Cache path from `--cache-path` or `CLINICSYNC_CACHE_PATH`, else the
/// platform data directory.
pub fn resolve_cache_path(settings: &SyncSettings) -> Result<PathBuf, CliError> {
    match &settings.cache_path {
        Some(path) => Ok(path.clone()),
        None => default_cache_path(),
    }
}

pub fn default_cache_path() -> Result<PathBuf, CliError> {
    dirs::data_dir()
        .map(|dir| dir.join("clinicsync").join("cache.db"))
        .ok_or_else(|| {
            CliError::Config("Could not determine a data directory; pass --cache-path".to_string())
        })
}

pub async fn open_cache(settings: &SyncSettings) -> Result<Arc<LocalCache>, CliError> {
    let path = resolve_cache_path(settings)?;
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    tracing::debug!(path = %path.display(), "Opening local cache");
    Ok(Arc::new(LocalCache::open(&path).await?))
}

/// Cache, schema and remote wired together for commands that talk to the
/// remote store.
pub struct SyncContext {
    pub cache: Arc<LocalCache>,
    pub schema: Arc<SyncSchema>,
    pub remote: Arc<dyn RemoteExecutor>,
    pub scheduler: Arc<SyncScheduler>,
    read_retry: RetryPolicy,
}

impl SyncContext {
    pub async fn connect(settings: &SyncSettings) -> Result<Self, CliError> {
        let schema = Arc::new(settings.load_schema()?);
        let cache = open_cache(settings).await?;
        let remote = remote::connect(settings).await?;
        let scheduler = Arc::new(SyncScheduler::new(
            cache.clone(),
            remote.clone(),
            schema.clone(),
            SchedulerConfig::from(settings),
        ));
        Ok(Self {
            cache,
            schema,
            remote,
            scheduler,
            read_retry: settings.transport_retry.clone(),
        })
    }

    pub fn router(&self) -> QueryRouter {
        QueryRouter::new(self.cache.clone(), self.remote.clone(), self.schema.clone())
            .with_push_trigger(self.scheduler.push_trigger())
            .with_read_retry(self.read_retry.clone())
    }
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Interpret a `--param` value: integers, reals and `null` are typed,
/// anything else is text. Quote-wrapped values are always text.
pub fn parse_param(raw: &str) -> SqlValue {
    if let Some(text) = raw
        .strip_prefix('\'')
        .and_then(|rest| rest.strip_suffix('\''))
    {
        return SqlValue::Text(text.to_string());
    }
    if raw.eq_ignore_ascii_case("null") {
        return SqlValue::Null;
    }
    if let Ok(value) = raw.parse::<i64>() {
        return SqlValue::Integer(value);
    }
    if let Ok(value) = raw.parse::<f64>() {
        if value.is_finite() {
            return SqlValue::Real(value);
        }
    }
    SqlValue::Text(raw.to_string())
}

/// Tab-separated header plus one line per row. Columns come from the first
/// row; later rows print blanks for columns they lack.
pub fn format_rows(rows: &[Row]) -> Vec<String> {
    let Some(first) = rows.first() else {
        return vec!["(no rows)".to_string()];
    };
    let columns: Vec<&str> = first.columns().collect();

    let mut lines = Vec::with_capacity(rows.len() + 1);
    lines.push(columns.join("\t"));
    for row in rows {
        let values: Vec<String> = columns
            .iter()
            .map(|column| row.get(column).map(ToString::to_string).unwrap_or_default())
            .collect();
        lines.push(values.join("\t"));
    }
    lines
}
