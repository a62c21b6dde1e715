use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Query, Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::Utc;
use clinicsync_core::models::{MutationResult, QueryOutcome, Row, Statement, SyncSchema};
use clinicsync_core::remote::protocol::{
    BatchRequest, BatchResponse, ChangesQuery, ChangesResponse, WriteRequest,
};
use clinicsync_core::remote::{LibSqlRemote, RemoteExecutor};
use clinicsync_core::sql::{self, quote_ident, StatementKind};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::auth::{extract_bearer_token, TokenIdentity, TokenStore};
use crate::config::BridgeConfig;
use crate::error::AppError;

/// Tables the bridge serves, keyed by lowercase name. Tables with a change
/// marker are included in `/v1/changes`.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    tables: BTreeMap<String, Option<String>>,
}

impl AllowList {
    pub fn new(schema: &SyncSchema, extra_tables: &[String]) -> Self {
        let mut tables = BTreeMap::new();
        for table in &schema.tables {
            tables.insert(
                table.name.to_ascii_lowercase(),
                Some(table.change_marker.clone()),
            );
        }
        for table in schema.authoritative.iter().chain(extra_tables) {
            tables.entry(table.to_ascii_lowercase()).or_insert(None);
        }
        Self { tables }
    }

    pub fn contains(&self, table: &str) -> bool {
        self.tables.contains_key(&table.to_ascii_lowercase())
    }

    fn check(&self, table: &str) -> Result<(), AppError> {
        if !sql::is_safe_identifier(table) {
            return Err(AppError::bad_request(format!("invalid table name `{table}`")));
        }
        if self.contains(table) {
            Ok(())
        } else {
            Err(AppError::bad_request(format!("table `{table}` is not served by this bridge")))
        }
    }

    fn change_markers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.tables
            .iter()
            .filter_map(|(table, marker)| Some((table.as_str(), marker.as_deref()?)))
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<BridgeConfig>,
    store: Arc<LibSqlRemote>,
    tokens: Arc<TokenStore>,
    allow_list: Arc<AllowList>,
}

impl AppState {
    pub fn new(config: Arc<BridgeConfig>, store: Arc<LibSqlRemote>, schema: &SyncSchema) -> Self {
        Self {
            tokens: Arc::new(TokenStore::new(store.clone())),
            allow_list: Arc::new(AllowList::new(schema, &config.extra_tables)),
            store,
            config,
        }
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }
}

pub fn app_router(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/query", post(run_query))
        .route("/write", post(write))
        .route("/batch", post(batch))
        .route("/changes", get(changes))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/v1", protected_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
}

async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().timestamp(),
    })
}

async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = extract_bearer_token(request.headers())?;
    let identity = state.tokens.verify(token).await?;
    request.extensions_mut().insert(identity);
    Ok(next.run(request).await)
}

async fn run_query(
    State(state): State<AppState>,
    Extension(caller): Extension<TokenIdentity>,
    Json(statement): Json<Statement>,
) -> Result<Json<QueryOutcome>, AppError> {
    let info = sql::analyze(&statement.sql);
    match info.kind {
        StatementKind::Session | StatementKind::Schema => {
            return Err(AppError::bad_request(
                "session and schema statements are not accepted",
            ));
        }
        StatementKind::Read | StatementKind::Mutation(_) => {}
    }
    for table in &info.tables {
        state.allow_list.check(table)?;
    }

    let outcome = state.store.execute(&statement).await?;
    tracing::debug!(
        endpoint = "query",
        token_id = %caller.token_id,
        tables = ?info.tables,
        "Executed statement"
    );
    Ok(Json(outcome))
}

async fn write(
    State(state): State<AppState>,
    Extension(caller): Extension<TokenIdentity>,
    Json(request): Json<WriteRequest>,
) -> Result<Json<MutationResult>, AppError> {
    state.allow_list.check(&request.table)?;
    let statement = request.to_statement()?;
    let result = state
        .store
        .execute(&statement)
        .await?
        .mutation()
        .unwrap_or_default();
    tracing::info!(
        endpoint = "write",
        token_id = %caller.token_id,
        table = %request.table,
        rows = result.rows_affected,
        "Applied write"
    );
    Ok(Json(result))
}

async fn batch(
    State(state): State<AppState>,
    Extension(caller): Extension<TokenIdentity>,
    Json(request): Json<BatchRequest>,
) -> Result<Json<BatchResponse>, AppError> {
    if request.operations.is_empty() {
        return Err(AppError::bad_request("batch has no operations"));
    }
    let statements = request
        .operations
        .iter()
        .map(|operation| {
            state.allow_list.check(&operation.table)?;
            Ok(operation.to_statement()?)
        })
        .collect::<Result<Vec<_>, AppError>>()?;

    let results: Vec<MutationResult> = state
        .store
        .execute_batch(&statements)
        .await?
        .iter()
        .map(|outcome| outcome.mutation().unwrap_or_default())
        .collect();
    tracing::info!(
        endpoint = "batch",
        token_id = %caller.token_id,
        operations = results.len(),
        "Applied batch"
    );
    Ok(Json(BatchResponse { results }))
}

async fn changes(
    State(state): State<AppState>,
    Extension(caller): Extension<TokenIdentity>,
    Query(query): Query<ChangesQuery>,
) -> Result<Json<ChangesResponse>, AppError> {
    let limit = query
        .limit
        .map_or(state.config.changes_limit, |limit| {
            limit.clamp(1, state.config.changes_limit)
        });

    let mut response = ChangesResponse::new();
    for (table, marker) in state.allow_list.change_markers() {
        match table_changes(&state.store, table, marker, query.since.as_deref(), limit).await {
            Ok(rows) => {
                if !rows.is_empty() {
                    response.insert(table.to_string(), rows);
                }
            }
            // A table missing from this store is skipped rather than failing the feed.
            Err(clinicsync_core::Error::Remote(message)) => {
                tracing::warn!(table, "Skipping table in change feed: {message}");
            }
            Err(error) => return Err(error.into()),
        }
    }

    tracing::debug!(
        endpoint = "changes",
        token_id = %caller.token_id,
        tables = response.len(),
        "Served change feed"
    );
    Ok(Json(response))
}

/// Rows of `table` changed after `since`, at most `limit` plus the rest of a
/// run of equal markers the limit would have cut.
async fn table_changes(
    store: &LibSqlRemote,
    table: &str,
    marker: &str,
    since: Option<&str>,
    limit: u32,
) -> clinicsync_core::Result<Vec<Row>> {
    let mut statement = Statement::new(format!("SELECT * FROM {}", quote_ident(table)));
    if let Some(since) = since {
        statement.sql.push_str(&format!(" WHERE {} > ?", quote_ident(marker)));
        statement = statement.bind(since);
    }
    statement
        .sql
        .push_str(&format!(" ORDER BY {} ASC LIMIT {limit}", quote_ident(marker)));

    let mut rows = store.execute(&statement).await?.into_rows();
    if rows.len() >= usize::try_from(limit).unwrap_or(usize::MAX) {
        if let Some(last) = sql::take_trailing_run(&mut rows, marker) {
            rows.extend(
                store
                    .execute(&sql::marker_run(table, marker, &last))
                    .await?
                    .into_rows(),
            );
        }
    }
    Ok(rows)
}
