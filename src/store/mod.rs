//! Persistence layer: libSQL-backed storage for workflows, steps and approvals.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::WorkflowStore;
