//! Persistence layer — libSQL-backed storage for work items and the
//! poll checkpoint.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlStore;
pub use traits::{Store, WorkItem, WorkStatus};
