//! Activation and deactivation of the tenant context on a connection.
//!
//! `apply` must complete before any business statement runs on the same
//! session, and `clear` must run exactly once per successful `apply`, on
//! every exit path. The binder keeps pairing counters so that invariant
//! is observable at any quiescent point.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use metrics::counter;
use rowfence_core::TenantIdentity;
use tracing::{debug, error, warn};

use crate::db::DbError;

use super::config::SessionConfig;
use super::error::{ApplyError, ContextBindError, LeakageGuardViolation};
use super::handle::{ConnectionHandle, SessionContext};

/// Issues the session-scoped statements that activate and deactivate the
/// row policy context for a tenant.
pub struct SessionContextBinder {
    config: SessionConfig,
    applied: AtomicU64,
    cleared: AtomicU64,
}

impl SessionContextBinder {
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            applied: AtomicU64::new(0),
            cleared: AtomicU64::new(0),
        }
    }

    /// Activates the row policy context for `tenant` on `handle`.
    ///
    /// Re-applying the same tenant on an already-bound handle is a no-op.
    /// Applying a *different* tenant is a leakage guard violation and
    /// fails before any statement is issued.
    ///
    /// On statement failure the handle is tainted: a partially configured
    /// session must never reach the pool's free list.
    ///
    /// # Errors
    ///
    /// [`ApplyError::Leak`] on a cross-tenant rebind attempt;
    /// [`ApplyError::Bind`] when an activation statement fails.
    pub async fn apply(
        &self,
        handle: &mut ConnectionHandle,
        tenant: &TenantIdentity,
    ) -> Result<(), ApplyError> {
        if let Some(bound) = handle.bound_identity() {
            if bound == tenant {
                debug!(handle = handle.id(), tenant = %tenant, "context already bound");
                return Ok(());
            }
            let violation = LeakageGuardViolation::RebindAttempt {
                handle_id: handle.id(),
                bound: bound.clone(),
                requested: tenant.clone(),
            };
            error!(handle = handle.id(), %violation, "leakage guard tripped");
            counter!("rowfence_leakage_guard_total").increment(1);
            return Err(violation.into());
        }

        let result = self.activate(handle, tenant).await;
        match result {
            Ok(()) => {
                handle.set_context(SessionContext {
                    tenant: tenant.clone(),
                    applied_at: Instant::now(),
                });
                self.applied.fetch_add(1, Ordering::SeqCst);
                counter!("rowfence_context_applied_total").increment(1);
                debug!(handle = handle.id(), tenant = %tenant, "tenant context applied");
                Ok(())
            }
            Err(source) => {
                handle.taint();
                warn!(
                    handle = handle.id(),
                    tenant = %tenant,
                    error = %source,
                    "context activation failed; handle tainted"
                );
                counter!("rowfence_context_bind_failures_total").increment(1);
                Err(ContextBindError { source }.into())
            }
        }
    }

    async fn activate(
        &self,
        handle: &mut ConnectionHandle,
        tenant: &TenantIdentity,
    ) -> Result<(), DbError> {
        let role = self.config.authenticated_role.clone();
        let session = handle.session_mut();
        session.set_role(&role).await?;
        session
            .set_claim(&self.config.sub_claim_key, tenant.as_str())
            .await?;
        session.set_claim(&self.config.role_claim_key, &role).await?;
        Ok(())
    }

    /// Deactivates any bound context on `handle`, returning the session
    /// to the unprivileged baseline. No-op on an unbound handle.
    ///
    /// On failure the handle is tainted and must be discarded by the
    /// caller; the context still counts as cleared because it leaves
    /// circulation with the connection.
    ///
    /// # Errors
    ///
    /// Returns the underlying [`DbError`] when the reset statements fail.
    pub async fn clear(&self, handle: &mut ConnectionHandle) -> Result<(), DbError> {
        let Some(ctx) = handle.take_context() else {
            return Ok(());
        };

        match handle.session_mut().reset_session().await {
            Ok(()) => {
                self.cleared.fetch_add(1, Ordering::SeqCst);
                counter!("rowfence_context_cleared_total").increment(1);
                debug!(handle = handle.id(), tenant = %ctx.tenant, "tenant context cleared");
                Ok(())
            }
            Err(e) => {
                handle.taint();
                self.cleared.fetch_add(1, Ordering::SeqCst);
                counter!("rowfence_context_cleared_total").increment(1);
                warn!(
                    handle = handle.id(),
                    tenant = %ctx.tenant,
                    error = %e,
                    "context clear failed; handle tainted for discard"
                );
                Err(e)
            }
        }
    }

    /// (applies, clears) so far. Equal at any quiescent point.
    #[must_use]
    pub fn pairing(&self) -> (u64, u64) {
        (
            self.applied.load(Ordering::SeqCst),
            self.cleared.load(Ordering::SeqCst),
        )
    }
}

impl Default for SessionContextBinder {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::db::memory::{MemoryDb, MemoryFactory};
    use crate::db::SessionFactory;
    use crate::session::error::ApplyError;

    use super::*;

    async fn handle_on(db: &Arc<MemoryDb>) -> ConnectionHandle {
        let factory = MemoryFactory::new(Arc::clone(db));
        ConnectionHandle::new(7, factory.connect().await.unwrap())
    }

    #[tokio::test]
    async fn apply_then_clear_pairs() {
        let db = Arc::new(MemoryDb::default());
        let binder = SessionContextBinder::default();
        let mut handle = handle_on(&db).await;
        let alice = TenantIdentity::new("alice");

        binder.apply(&mut handle, &alice).await.unwrap();
        assert_eq!(handle.bound_identity(), Some(&alice));

        binder.clear(&mut handle).await.unwrap();
        assert!(handle.bound_identity().is_none());
        assert_eq!(binder.pairing(), (1, 1));
    }

    #[tokio::test]
    async fn apply_enables_business_statements() {
        let db = Arc::new(MemoryDb::default());
        let binder = SessionContextBinder::default();
        let mut handle = handle_on(&db).await;

        binder
            .apply(&mut handle, &TenantIdentity::new("alice"))
            .await
            .unwrap();
        assert!(handle.session_mut().list_tasks().await.is_ok());

        binder.clear(&mut handle).await.unwrap();
        assert!(handle.session_mut().list_tasks().await.is_err());
    }

    #[tokio::test]
    async fn same_tenant_reapply_is_noop() {
        let db = Arc::new(MemoryDb::default());
        let binder = SessionContextBinder::default();
        let mut handle = handle_on(&db).await;
        let alice = TenantIdentity::new("alice");

        binder.apply(&mut handle, &alice).await.unwrap();
        binder.apply(&mut handle, &alice).await.unwrap();

        // One activation, not two.
        assert_eq!(binder.pairing().0, 1);
    }

    #[tokio::test]
    async fn cross_tenant_rebind_fails_fast() {
        let db = Arc::new(MemoryDb::default());
        let binder = SessionContextBinder::default();
        let mut handle = handle_on(&db).await;

        binder
            .apply(&mut handle, &TenantIdentity::new("alice"))
            .await
            .unwrap();
        let err = binder
            .apply(&mut handle, &TenantIdentity::new("bob"))
            .await
            .unwrap_err();

        assert!(matches!(err, ApplyError::Leak(_)));
        // Original binding is untouched.
        assert_eq!(
            handle.bound_identity().map(TenantIdentity::as_str),
            Some("alice")
        );
    }

    #[tokio::test]
    async fn failed_apply_taints_handle_and_binds_nothing() {
        let db = Arc::new(MemoryDb::default());
        db.faults().fail_next_set_claim();

        let binder = SessionContextBinder::default();
        let mut handle = handle_on(&db).await;

        let err = binder
            .apply(&mut handle, &TenantIdentity::new("alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApplyError::Bind(_)));
        assert!(handle.bound_identity().is_none());
        assert!(handle.is_tainted());
        assert_eq!(binder.pairing(), (0, 0));
    }

    #[tokio::test]
    async fn failed_clear_taints_but_still_counts() {
        let db = Arc::new(MemoryDb::default());
        let binder = SessionContextBinder::default();
        let mut handle = handle_on(&db).await;

        binder
            .apply(&mut handle, &TenantIdentity::new("alice"))
            .await
            .unwrap();

        db.faults().fail_next_reset();
        assert!(binder.clear(&mut handle).await.is_err());
        assert!(handle.is_tainted());
        // The context left circulation with the connection.
        assert_eq!(binder.pairing(), (1, 1));
    }

    #[tokio::test]
    async fn clear_on_unbound_handle_is_noop() {
        let db = Arc::new(MemoryDb::default());
        let binder = SessionContextBinder::default();
        let mut handle = handle_on(&db).await;

        binder.clear(&mut handle).await.unwrap();
        assert_eq!(binder.pairing(), (0, 0));
    }
}
