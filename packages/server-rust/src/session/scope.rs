//! Per-request unit of work.
//!
//! A [`RequestScope`] owns exactly one leased connection for its
//! lifetime and walks the state machine
//! `Idle → Bound → Executing → {Committed | RolledBack} → Released`.
//! Cleanup (clear context, release connection) is unconditional: it runs
//! on commit, on rollback, and — via the lease's drop path — when the
//! request future is cancelled mid-flight.

use std::sync::Arc;

use rowfence_core::TenantIdentity;
use tracing::{debug, warn};

use crate::auth::IdentityResolver;
use crate::repository::QueryError;

use super::binder::SessionContextBinder;
use super::error::ScopeError;
use super::handle::ConnectionHandle;
use super::pool::{ConnectionPool, Lease};

/// Lifecycle states of a request scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeState {
    /// Created, context not yet bound. Transient: `begin` either delivers
    /// a `Bound` scope or no scope at all.
    Idle,
    /// Context bound, transaction open, ready for repository calls.
    Bound,
    /// A repository operation is running on the connection.
    Executing,
    /// Transaction committed; cleanup pending or done.
    Committed,
    /// Transaction rolled back; cleanup pending or done.
    RolledBack,
    /// Connection cleared and returned; the scope is spent.
    Released,
}

/// Requested disposition of the scope's transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Commit,
    Rollback,
}

/// Entry point held by the HTTP layer: resolves a credential and opens a
/// tenant-scoped unit of work per request.
pub struct ScopeManager {
    resolver: IdentityResolver,
    pool: ConnectionPool,
    binder: Arc<SessionContextBinder>,
}

impl ScopeManager {
    #[must_use]
    pub fn new(
        resolver: IdentityResolver,
        pool: ConnectionPool,
        binder: Arc<SessionContextBinder>,
    ) -> Self {
        Self {
            resolver,
            pool,
            binder,
        }
    }

    /// Occupancy of the underlying pool, for health reporting.
    #[must_use]
    pub fn pool_stats(&self) -> super::pool::PoolStats {
        self.pool.stats()
    }

    /// Apply/clear pairing counters of the underlying binder.
    #[must_use]
    pub fn pairing(&self) -> (u64, u64) {
        self.binder.pairing()
    }

    /// Verifies `credential` and opens a scope for its tenant.
    ///
    /// # Errors
    ///
    /// [`ScopeError::Auth`] on a bad credential, plus everything
    /// [`Self::begin_for`] can return.
    pub async fn begin(&self, credential: &str) -> Result<RequestScope, ScopeError> {
        let tenant = self.resolver.resolve(credential)?;
        self.begin_for(tenant).await
    }

    /// Opens a scope for an already-resolved tenant identity: acquires a
    /// connection, binds the context, opens the request transaction.
    ///
    /// Any failure unwinds fully — no handle is leaked, and a handle that
    /// failed activation is discarded, never pooled.
    ///
    /// # Errors
    ///
    /// [`ScopeError::Pool`] when no connection frees up in time,
    /// [`ScopeError::ContextBind`] when activation fails,
    /// [`ScopeError::LeakageGuard`] on an invariant breach,
    /// [`ScopeError::Query`] when the transaction cannot be opened.
    pub async fn begin_for(&self, tenant: TenantIdentity) -> Result<RequestScope, ScopeError> {
        let mut lease = self.pool.acquire().await?;

        if let Err(e) = self.binder.apply(lease.handle_mut(), &tenant).await {
            // The handle is tainted (or was refused); release discards it.
            self.pool.release(lease).await;
            return Err(e.into());
        }

        if let Err(e) = lease.handle_mut().session_mut().begin().await {
            warn!(tenant = %tenant, error = %e, "failed to open request transaction");
            lease.handle_mut().taint();
            let _ = self.binder.clear(lease.handle_mut()).await;
            self.pool.release(lease).await;
            return Err(ScopeError::Query(QueryError::from(e)));
        }
        lease.handle_mut().set_in_tx(true);

        debug!(tenant = %tenant, "request scope bound");
        Ok(RequestScope {
            state: ScopeState::Bound,
            tenant,
            lease: Some(lease),
            binder: Arc::clone(&self.binder),
            pool: self.pool.clone(),
        })
    }
}

/// One request's unit of work over one exclusively-owned connection.
///
/// Dropping a scope without calling [`end`](Self::end) is safe: the lease
/// drop path rolls back and scrubs the connection before it is pooled
/// again. Explicit `end` is still the normal path — it reports commit
/// errors, which the drop path cannot.
pub struct RequestScope {
    state: ScopeState,
    tenant: TenantIdentity,
    lease: Option<Lease>,
    binder: Arc<SessionContextBinder>,
    pool: ConnectionPool,
}

impl RequestScope {
    /// The tenant this scope acts for.
    #[must_use]
    pub fn tenant(&self) -> &TenantIdentity {
        &self.tenant
    }

    #[must_use]
    pub fn state(&self) -> ScopeState {
        self.state
    }

    /// Checks invariants and enters `Executing` for one repository call.
    ///
    /// Verifies the scope still owns a connection *and* that the bound
    /// context is present on the handle before any business statement may
    /// touch it; context activation completing first is a hard ordering
    /// guarantee, not an assumption.
    pub(crate) fn enter_execution(&mut self) -> Result<&mut ConnectionHandle, QueryError> {
        if self.state != ScopeState::Bound {
            return Err(QueryError::NoActiveScope);
        }
        let lease = self.lease.as_mut().ok_or(QueryError::NoActiveScope)?;
        let handle = lease.handle_mut();
        if handle.bound_identity().is_none() {
            return Err(QueryError::NoActiveScope);
        }
        debug_assert_eq!(handle.bound_identity(), Some(&self.tenant));
        self.state = ScopeState::Executing;
        Ok(handle)
    }

    /// Leaves `Executing` after a repository call, successful or not.
    pub(crate) fn exit_execution(&mut self) {
        if self.state == ScopeState::Executing {
            self.state = ScopeState::Bound;
        }
    }

    /// Finishes the scope: commits or rolls back, then unconditionally
    /// clears the context and releases the connection.
    ///
    /// Idempotent — calling `end` on a finished scope is a no-op.
    ///
    /// # Errors
    ///
    /// [`ScopeError::Query`] when the commit (or rollback) statement
    /// itself fails; cleanup has still run when this returns.
    pub async fn end(&mut self, outcome: Outcome) -> Result<(), ScopeError> {
        let Some(mut lease) = self.lease.take() else {
            return Ok(());
        };

        let handle = lease.handle_mut();
        let tx_result = if handle.in_tx() {
            let result = match outcome {
                Outcome::Commit => handle.session_mut().commit().await,
                Outcome::Rollback => handle.session_mut().rollback().await,
            };
            match &result {
                Ok(()) => handle.set_in_tx(false),
                // Transaction state unknown; never pool this connection.
                Err(_) => handle.taint(),
            }
            result
        } else {
            Ok(())
        };

        self.state = match (outcome, &tx_result) {
            (Outcome::Commit, Ok(())) => ScopeState::Committed,
            _ => ScopeState::RolledBack,
        };

        // Unconditional cleanup, in order: clear context, then release.
        if let Err(e) = self.binder.clear(handle).await {
            warn!(tenant = %self.tenant, error = %e, "context clear failed during scope end");
        }
        self.pool.release(lease).await;
        self.state = ScopeState::Released;

        match tx_result {
            Ok(()) => Ok(()),
            Err(e) => Err(ScopeError::Query(QueryError::from(e))),
        }
    }
}

impl std::fmt::Debug for RequestScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestScope")
            .field("state", &self.state)
            .field("tenant", &self.tenant)
            .finish_non_exhaustive()
    }
}
