//! Policy-enforced data access.
//!
//! Repositories are the only code allowed to issue business statements,
//! and they never filter by tenant: once a scope's context is bound, the
//! database's policy engine is the sole authority on row visibility.

pub mod settings;
pub mod tasks;

pub use settings::SettingsRepository;
pub use tasks::TaskRepository;

use crate::db::DbError;

/// Domain-level query failures, surfaced after the context was correctly
/// bound. Rolled back by the caller, never retried automatically.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    /// The operation's input failed domain validation; no SQL was issued.
    #[error("invalid data: {0}")]
    Invalid(String),
    /// A repository operation was invoked outside an active scope.
    #[error("no active request scope")]
    NoActiveScope,
    /// The database's policy engine denied the statement.
    #[error("row policy denied the statement")]
    Denied,
    /// A database constraint rejected the data.
    #[error("constraint violation: {0}")]
    Constraint(String),
    /// Any other database-reported failure.
    #[error("database failure: {0}")]
    Database(#[source] DbError),
}

impl From<DbError> for QueryError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::PolicyDenied => Self::Denied,
            DbError::Constraint(detail) => Self::Constraint(detail),
            other => Self::Database(other),
        }
    }
}
