//! clinicsync-core - offline-first sync core for the clinic application
//!
//! This crate contains the local cache, the query router that every
//! statement goes through, the background pull/push scheduler, and the
//! reconciliation service that repairs identity drift after reconnecting.

pub mod cache;
pub mod config;
pub mod error;
pub mod models;
pub mod reconcile;
pub mod remote;
pub mod router;
pub mod scheduler;
pub mod sql;
pub mod util;

pub use error::{Error, Result};
pub use models::{MutationResult, QueryOutcome, Row, SqlValue, Statement};
