//! Bearer tokens for `/v1/*`.
//!
//! Tokens live in the `bridge_tokens` table of the authoritative store. Only a
//! blake3 hash of each token is stored; the plaintext is shown once at issue.

use std::sync::Arc;

use axum::http::HeaderMap;
use chrono::Utc;
use clinicsync_core::models::{SqlValue, Statement};
use clinicsync_core::remote::{LibSqlRemote, RemoteExecutor};
use clinicsync_core::util::timestamp_now;
use serde::Serialize;
use uuid::Uuid;

use crate::error::AppError;

const TOKEN_PREFIX: &str = "csb_";

const CREATE_TOKENS_TABLE: &str = "CREATE TABLE IF NOT EXISTS bridge_tokens (
    token_id TEXT PRIMARY KEY,
    token_hash TEXT NOT NULL UNIQUE,
    label TEXT,
    created_at TEXT NOT NULL,
    expires_at TEXT,
    revoked_at TEXT
)";

/// A freshly issued token. `token` is not recoverable afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    pub token_id: String,
    pub token: String,
    pub expires_at: Option<String>,
}

/// The caller behind a verified bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenIdentity {
    pub token_id: String,
    pub label: Option<String>,
}

pub struct TokenStore {
    store: Arc<LibSqlRemote>,
}

impl TokenStore {
    pub fn new(store: Arc<LibSqlRemote>) -> Self {
        Self { store }
    }

    pub async fn ensure_schema(&self) -> clinicsync_core::Result<()> {
        self.store.execute(&Statement::new(CREATE_TOKENS_TABLE)).await?;
        Ok(())
    }

    pub async fn issue(
        &self,
        label: Option<String>,
        ttl: Option<chrono::Duration>,
    ) -> clinicsync_core::Result<IssuedToken> {
        let token_id = Uuid::now_v7().to_string();
        let token = format!("{TOKEN_PREFIX}{}", Uuid::new_v4().simple());
        let expires_at = ttl.map(|ttl| {
            (Utc::now() + ttl)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
        });

        self.store
            .execute(
                &Statement::new(
                    "INSERT INTO bridge_tokens (token_id, token_hash, label, created_at, expires_at)
                     VALUES (?, ?, ?, ?, ?)",
                )
                .bind(token_id.as_str())
                .bind(hash_token(&token))
                .bind(label)
                .bind(timestamp_now())
                .bind(expires_at.clone()),
            )
            .await?;

        tracing::info!(token_id = %token_id, "Issued bridge token");
        Ok(IssuedToken {
            token_id,
            token,
            expires_at,
        })
    }

    /// Returns whether a live token was revoked.
    pub async fn revoke(&self, token_id: &str) -> clinicsync_core::Result<bool> {
        let outcome = self
            .store
            .execute(
                &Statement::new(
                    "UPDATE bridge_tokens SET revoked_at = ? WHERE token_id = ? AND revoked_at IS NULL",
                )
                .bind(timestamp_now())
                .bind(token_id),
            )
            .await?;
        let revoked = outcome
            .mutation()
            .is_some_and(|result| result.rows_affected > 0);
        if revoked {
            tracing::info!(token_id, "Revoked bridge token");
        }
        Ok(revoked)
    }

    pub async fn verify(&self, token: &str) -> Result<TokenIdentity, AppError> {
        let rows = self
            .store
            .execute(
                &Statement::new(
                    "SELECT token_id, label, expires_at, revoked_at FROM bridge_tokens
                     WHERE token_hash = ?",
                )
                .bind(hash_token(token)),
            )
            .await?
            .into_rows();
        let row = rows
            .first()
            .ok_or_else(|| AppError::unauthorized("Unknown token"))?;

        let text = |column: &str| row.get(column).and_then(SqlValue::as_str).map(str::to_string);
        if text("revoked_at").is_some() {
            return Err(AppError::unauthorized("Token has been revoked"));
        }
        if let Some(expires_at) = text("expires_at") {
            if expires_at <= timestamp_now() {
                return Err(AppError::unauthorized("Token has expired"));
            }
        }

        let token_id = text("token_id").ok_or_else(|| AppError::internal("token row has no id"))?;
        Ok(TokenIdentity {
            token_id,
            label: text("label"),
        })
    }
}

fn hash_token(token: &str) -> String {
    blake3::hash(token.as_bytes()).to_hex().to_string()
}

pub fn extract_bearer_token(headers: &HeaderMap) -> Result<&str, AppError> {
    let header = headers
        .get("authorization")
        .ok_or_else(|| AppError::unauthorized("Missing Authorization header"))?
        .to_str()
        .map_err(|_| AppError::unauthorized("Authorization header is not valid UTF-8"))?;

    let (scheme, token) = header
        .split_once(' ')
        .ok_or_else(|| AppError::unauthorized("Authorization header must be `Bearer <token>`"))?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AppError::unauthorized(
            "Authorization scheme must be `Bearer`",
        ));
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(AppError::unauthorized("Bearer token is empty"));
    }

    Ok(token)
}
