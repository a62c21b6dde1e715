//! Data models for clinicsync

mod cursor;
mod operation;
mod schema;
mod statement;
mod value;

pub use cursor::{IdentityKey, SyncCursor};
pub use operation::{CapturedStatement, OperationStatus, PendingOperation};
pub use schema::{DerivedField, DuplicateRule, ForeignKeyRef, SyncSchema, SyncableTable};
pub use statement::{MutationResult, QueryOutcome, Statement};
pub use value::{Row, SqlValue};
