#![allow(dead_code)]

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clinicsync_core::cache::{LocalCache, CLINIC_SCHEMA};
use clinicsync_core::models::{QueryOutcome, Row, Statement, SyncSchema};
use clinicsync_core::remote::{LibSqlRemote, RemoteExecutor, RetryPolicy};
use clinicsync_core::router::QueryRouter;
use clinicsync_core::scheduler::{SchedulerConfig, SyncScheduler};
use clinicsync_core::{Error, Result};

/// How the test remote answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Mode {
    Online = 0,
    Offline = 1,
    /// Every statement fails with a permanent remote error.
    Rejecting = 2,
    /// Every statement fails validation.
    Invalid = 3,
}

/// In-memory remote store that can be taken offline.
pub struct SwitchableRemote {
    inner: LibSqlRemote,
    mode: AtomicU8,
    delay: Duration,
}

impl SwitchableRemote {
    pub async fn new(delay: Duration) -> Self {
        let inner = LibSqlRemote::open_in_memory().await.unwrap();
        for ddl in CLINIC_SCHEMA {
            inner.execute(&Statement::new(*ddl)).await.unwrap();
        }
        Self {
            inner,
            mode: AtomicU8::new(Mode::Online as u8),
            delay,
        }
    }

    pub fn set_mode(&self, mode: Mode) {
        self.mode.store(mode as u8, Ordering::SeqCst);
    }

    fn mode(&self) -> Mode {
        match self.mode.load(Ordering::SeqCst) {
            1 => Mode::Offline,
            2 => Mode::Rejecting,
            3 => Mode::Invalid,
            _ => Mode::Online,
        }
    }

    /// Run directly against the store, ignoring the mode.
    pub async fn seed(&self, sql: &str) {
        self.inner.execute(&Statement::new(sql)).await.unwrap();
    }

    pub async fn rows(&self, sql: &str) -> Vec<Row> {
        self.inner
            .execute(&Statement::new(sql))
            .await
            .unwrap()
            .into_rows()
    }
}

#[async_trait]
impl RemoteExecutor for SwitchableRemote {
    async fn execute(&self, statement: &Statement) -> Result<QueryOutcome> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match self.mode() {
            Mode::Online => self.inner.execute(statement).await,
            Mode::Offline => Err(Error::RemoteUnavailable("connection refused".to_string())),
            Mode::Rejecting => Err(Error::Remote("constraint failed".to_string())),
            Mode::Invalid => Err(Error::validation("unknown table")),
        }
    }

    fn describe(&self) -> String {
        "switchable test remote".to_string()
    }
}

pub struct Harness {
    pub remote: Arc<SwitchableRemote>,
    pub cache: Arc<LocalCache>,
    pub router: QueryRouter,
    pub scheduler: Arc<SyncScheduler>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with(SchedulerConfig::default(), Duration::ZERO).await
    }

    pub async fn with(config: SchedulerConfig, delay: Duration) -> Self {
        let remote = Arc::new(SwitchableRemote::new(delay).await);
        let cache = Arc::new(LocalCache::open_in_memory().await.unwrap());
        let schema = Arc::new(SyncSchema::clinic());
        let config = SchedulerConfig {
            transport_retry: RetryPolicy::none(),
            ..config
        };

        let scheduler = Arc::new(SyncScheduler::new(
            cache.clone(),
            remote.clone(),
            schema.clone(),
            config,
        ));
        let router = QueryRouter::new(cache.clone(), remote.clone(), schema)
            .with_push_trigger(scheduler.push_trigger())
            .with_read_retry(RetryPolicy::none());

        Self {
            remote,
            cache,
            router,
            scheduler,
        }
    }

    pub async fn write(&self, statement: Statement) {
        self.router.execute(&statement).await.unwrap();
    }

    pub async fn local_rows(&self, sql: &str) -> Vec<Row> {
        self.cache.query(sql, Vec::new()).await.unwrap()
    }
}
