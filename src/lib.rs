//! # Citadb - Persistence & recovery layer for the clinic scheduler
//!
//! Dialect-neutral database access plus an audit-log-driven undo engine.
//!
//! Citadb provides:
//! - A connection adapter that runs the same SQL against MySQL or Postgres
//! - Bounded connect retry with credential-failure detection
//! - An append-only audit trail for tracked mutations
//! - An undo engine that reconstructs prior state from audit snapshots
//! - Schema-aware resolution of loosely-typed doctor identifiers

pub mod audit;
pub mod config;
pub mod db;
pub mod people;
pub mod resolver;
pub mod ui;
pub mod undo;

// Re-exports for convenient access
pub use audit::{AuditEntry, AuditWriter, RequestContext, Snapshot};
pub use config::DbConfig;
pub use db::{DbAdapter, Dialect};
pub use resolver::ProfessionalResolver;
pub use undo::{UndoEngine, UndoOutcome};

/// Result type alias for Citadb operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Citadb operations
///
/// Transport failures (the database is unreachable) and business
/// failures (this input or audit entry cannot be processed) are
/// separate variants so callers can tell them apart.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Not connected to the database (was connect_with_retry called?)")]
    NotConnected,

    #[error("Database rejected the credentials for user '{user}'; fix DB_USER/DB_PASSWORD before restarting")]
    CredentialsRejected { user: String },

    #[error("Gave up connecting after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("Query error: {0}")]
    Query(#[from] sqlx::Error),

    #[error("Query has {expected} placeholders but {given} parameters were supplied")]
    PlaceholderMismatch { expected: usize, given: usize },

    #[error("No doctor matches '{token}'; use the numeric id, license code or email")]
    DoctorNotFound { token: String },

    #[error("Audit write failed: {0}")]
    AuditWrite(#[source] sqlx::Error),

    #[error("Audit entry {0} not found")]
    AuditEntryNotFound(i64),

    #[error("Undo is only supported for appointment entries, not '{0}'")]
    UndoUnsupported(String),

    #[error("Appointment {0} no longer exists")]
    AppointmentMissing(String),

    #[error("Cannot derive an undo action from audit entry {id}: {reason}")]
    Unrecoverable { id: i64, reason: String },

    #[error("Record '{id}' not found in {table}")]
    PersonNotFound { table: String, id: String },

    #[error("No updatable fields in the request payload")]
    NoUpdatableFields,
}

impl Error {
    /// True for failures of the database transport itself, as opposed
    /// to failures of the requested operation.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::NotConnected
                | Error::CredentialsRejected { .. }
                | Error::RetriesExhausted { .. }
                | Error::Query(_)
        )
    }
}
