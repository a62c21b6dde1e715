pub mod common;
pub mod cursor;
pub mod query;
pub mod queue;
pub mod reconcile;
pub mod sync;
