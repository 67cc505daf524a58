//! Session-layer error taxonomy.
//!
//! Every failure mode crosses the [`RequestScope`](super::RequestScope)
//! boundary as the typed error that caused it; nothing is swallowed or
//! coerced on the way up.

use std::time::Duration;

use rowfence_core::TenantIdentity;

use crate::auth::AuthError;
use crate::db::DbError;
use crate::repository::QueryError;

/// Connection pool failures.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// No connection freed up within the acquire timeout. Retryable by
    /// the caller with backoff; a capacity signal, not a bug.
    #[error("pool exhausted after waiting {}ms for a free connection", waited.as_millis())]
    Exhausted {
        /// How long the caller waited before giving up.
        waited: Duration,
    },
    /// Opening a replacement connection failed.
    #[error("failed to open a database connection: {0}")]
    Connect(#[source] DbError),
}

/// The session could not be placed into a tenant-scoped state.
///
/// Fatal for the request: no business statement may run, and the
/// (possibly half-configured) connection is discarded, never pooled.
#[derive(Debug, thiserror::Error)]
#[error("failed to activate tenant context: {source}")]
pub struct ContextBindError {
    #[source]
    pub source: DbError,
}

/// A safety-invariant breach in context handling. Critical defect:
/// logged at the highest severity, counted, and the offending connection
/// is discarded.
#[derive(Debug, thiserror::Error)]
pub enum LeakageGuardViolation {
    /// `apply` was called on a handle already bound to another tenant.
    #[error(
        "handle {handle_id} is bound to tenant {bound}; refusing rebind to {requested}"
    )]
    RebindAttempt {
        handle_id: u64,
        bound: TenantIdentity,
        requested: TenantIdentity,
    },
    /// A handle came back to the pool still carrying a bound identity.
    #[error("handle {handle_id} was released still bound to tenant {bound}")]
    ResidualContext {
        handle_id: u64,
        bound: TenantIdentity,
    },
}

/// Failure modes of [`SessionContextBinder::apply`](super::SessionContextBinder::apply).
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error(transparent)]
    Bind(#[from] ContextBindError),
    #[error(transparent)]
    Leak(#[from] LeakageGuardViolation),
}

/// Everything a request scope can surface to its caller.
#[derive(Debug, thiserror::Error)]
pub enum ScopeError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    ContextBind(#[from] ContextBindError),
    #[error(transparent)]
    LeakageGuard(#[from] LeakageGuardViolation),
    #[error(transparent)]
    Query(#[from] QueryError),
}

impl From<ApplyError> for ScopeError {
    fn from(err: ApplyError) -> Self {
        match err {
            ApplyError::Bind(e) => Self::ContextBind(e),
            ApplyError::Leak(e) => Self::LeakageGuard(e),
        }
    }
}
