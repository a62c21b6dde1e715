//! clinicsync-bridge - authenticated HTTP front for the authoritative store
//!
//! Clients that cannot hold database credentials reach the store through
//! this bridge using `clinicsync_core::remote::BridgeClient`.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;

pub use routes::{app_router, AllowList, AppState};

use clinicsync_core::cache::CLINIC_SCHEMA;
use clinicsync_core::models::Statement;
use clinicsync_core::remote::{LibSqlRemote, RemoteExecutor};

/// Create the clinic tables in the store when they do not exist yet.
pub async fn bootstrap_schema(store: &LibSqlRemote) -> clinicsync_core::Result<()> {
    for ddl in CLINIC_SCHEMA {
        store.execute(&Statement::new(*ddl)).await?;
    }
    tracing::info!(tables = CLINIC_SCHEMA.len(), "Clinic schema ensured");
    Ok(())
}
