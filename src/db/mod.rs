//! Database Layer - dialect-neutral access to MySQL or Postgres
//!
//! One adapter instance per process owns the live pool. Callers write
//! SQL with `?` placeholders; the adapter rewrites them for the active
//! backend and normalizes rows to column-name -> JSON value maps.

pub mod adapter;
pub mod dialect;
pub mod retry;
pub mod row;
pub mod schema;

pub use adapter::{DbAdapter, DbTransaction, ExecResult, TestReport};
pub use dialect::Dialect;
pub use retry::{FailureClass, RetryPolicy};
pub use row::{Row, SqlValue};
