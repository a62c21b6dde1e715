//! Access to the authoritative store.

mod bridge;
mod direct;
pub mod protocol;
mod retry;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{RemoteMode, SyncSettings};
use crate::error::{Error, Result};
use crate::models::{QueryOutcome, Statement};

pub use bridge::BridgeClient;
pub use direct::LibSqlRemote;
pub use retry::RetryPolicy;

/// Executes statements against the authoritative store.
///
/// Errors for which [`Error::is_transient`] holds may succeed on retry;
/// everything else is final for the given statement.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn execute(&self, statement: &Statement) -> Result<QueryOutcome>;

    /// Human-readable target, safe to log.
    fn describe(&self) -> String;
}

#[async_trait]
impl<T: RemoteExecutor + ?Sized> RemoteExecutor for Arc<T> {
    async fn execute(&self, statement: &Statement) -> Result<QueryOutcome> {
        (**self).execute(statement).await
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Build the executor selected by `settings`.
pub async fn connect(settings: &SyncSettings) -> Result<Arc<dyn RemoteExecutor>> {
    let url = settings
        .remote_url
        .as_deref()
        .ok_or_else(|| Error::Config("CLINICSYNC_REMOTE_URL is not set".to_string()))?;
    let token = settings.remote_token.clone();

    let remote: Arc<dyn RemoteExecutor> = match settings.remote_mode {
        RemoteMode::Direct => Arc::new(LibSqlRemote::connect(url, token).await?),
        RemoteMode::Bridge => Arc::new(BridgeClient::new(url, token, settings.http_timeout)?),
    };
    tracing::info!(remote = %remote.describe(), "Remote executor ready");
    Ok(remote)
}
