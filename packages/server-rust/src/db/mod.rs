//! Database session seam.
//!
//! [`DbSession`] is one physical database session: the binder issues its
//! session-control statements through it, the request scope drives the
//! transaction, and the repository issues business statements. All three
//! share the same session (and, for Postgres, the same wire connection) —
//! there is no side channel for context activation.
//!
//! Implementations: [`memory`] (always compiled, emulates the row policy)
//! and [`postgres`] (cargo feature `postgres`, one `sqlx::PgConnection`
//! per session).

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;
use rowfence_core::{NewTask, SettingsUpdate, Task, TaskPatch, UserSettings};
use uuid::Uuid;

/// Errors surfaced by a database session.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// The underlying connection is gone or in an unusable state.
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    /// A statement failed to execute.
    #[error("statement failed: {0}")]
    Statement(String),
    /// The row-level policy denied the statement.
    #[error("row-level policy denied the statement")]
    PolicyDenied,
    /// A database constraint rejected the data.
    #[error("constraint violation: {0}")]
    Constraint(String),
}

/// One physical database session.
///
/// `&mut self` everywhere: a session is exclusively owned by at most one
/// borrower, which is what makes per-session state (role, claims, open
/// transaction) safe to carry between calls.
#[async_trait]
pub trait DbSession: Send {
    // --- session control (issued by the binder) ---

    /// Switches the session's execution role.
    async fn set_role(&mut self, role: &str) -> Result<(), DbError>;

    /// Sets a session-scoped configuration claim read by row policies.
    async fn set_claim(&mut self, key: &str, value: &str) -> Result<(), DbError>;

    /// Resets role and claims to the unprivileged baseline.
    async fn reset_session(&mut self) -> Result<(), DbError>;

    // --- transaction control (issued by the request scope) ---

    async fn begin(&mut self) -> Result<(), DbError>;
    async fn commit(&mut self) -> Result<(), DbError>;
    async fn rollback(&mut self) -> Result<(), DbError>;

    // --- business statements (issued by the repository) ---
    //
    // None of these takes a tenant parameter. Row visibility and the
    // tenant_id column on insert come from the session's bound claims.

    async fn insert_task(&mut self, draft: &NewTask) -> Result<Task, DbError>;
    async fn list_tasks(&mut self) -> Result<Vec<Task>, DbError>;
    async fn get_task(&mut self, id: Uuid) -> Result<Option<Task>, DbError>;
    async fn update_task(&mut self, id: Uuid, patch: &TaskPatch) -> Result<Option<Task>, DbError>;
    async fn delete_task(&mut self, id: Uuid) -> Result<bool, DbError>;

    /// The bound tenant's settings row, `None` before first write.
    async fn get_settings(&mut self) -> Result<Option<UserSettings>, DbError>;

    /// Inserts or fully overwrites the bound tenant's settings row.
    async fn upsert_settings(&mut self, desired: &SettingsUpdate) -> Result<UserSettings, DbError>;

    /// Cheap health probe consulted by the pool before reuse.
    fn is_healthy(&self) -> bool;
}

/// Produces fresh sessions for the pool's initial fill and for replacing
/// discarded connections.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn DbSession>, DbError>;
}
