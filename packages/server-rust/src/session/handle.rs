//! Leasable connection handle with on-handle context state.
//!
//! Context state lives on the handle itself rather than in any shared
//! registry: a statement can only run with the wrong tenant's context if
//! the wrong context is physically on this handle, which the binder's
//! rebind guard rules out. There is no hand-out path to race against.

use std::time::Instant;

use rowfence_core::TenantIdentity;

use crate::db::DbSession;

/// "Tenant X is currently activated on this connection."
///
/// Created by a successful `apply`, destroyed by `clear`. At most one
/// exists per handle at any time.
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// The activated tenant.
    pub tenant: TenantIdentity,
    /// When activation completed; used for diagnostics only.
    pub applied_at: Instant,
}

/// One pooled physical connection, exclusively owned by at most one
/// request scope at any instant and by the pool otherwise.
pub struct ConnectionHandle {
    id: u64,
    session: Box<dyn DbSession>,
    context: Option<SessionContext>,
    in_tx: bool,
    tainted: bool,
}

impl ConnectionHandle {
    pub(crate) fn new(id: u64, session: Box<dyn DbSession>) -> Self {
        Self {
            id,
            session,
            context: None,
            in_tx: false,
            tainted: false,
        }
    }

    /// Stable identifier, for logs and leak reports.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The tenant currently activated on this connection, if any.
    #[must_use]
    pub fn bound_identity(&self) -> Option<&TenantIdentity> {
        self.context.as_ref().map(|ctx| &ctx.tenant)
    }

    /// The full session context, if one is active.
    #[must_use]
    pub fn context(&self) -> Option<&SessionContext> {
        self.context.as_ref()
    }

    pub(crate) fn set_context(&mut self, context: SessionContext) {
        debug_assert!(self.context.is_none(), "context overwrite on handle");
        self.context = Some(context);
    }

    pub(crate) fn take_context(&mut self) -> Option<SessionContext> {
        self.context.take()
    }

    /// Mutable access to the underlying database session.
    pub(crate) fn session_mut(&mut self) -> &mut dyn DbSession {
        self.session.as_mut()
    }

    /// Whether a transaction opened through the scope is still open.
    #[must_use]
    pub fn in_tx(&self) -> bool {
        self.in_tx
    }

    pub(crate) fn set_in_tx(&mut self, in_tx: bool) {
        self.in_tx = in_tx;
    }

    /// Marks the connection as unusable. Tainted handles are discarded by
    /// the pool instead of being reused.
    pub(crate) fn taint(&mut self) {
        self.tainted = true;
    }

    #[must_use]
    pub fn is_tainted(&self) -> bool {
        self.tainted
    }

    /// Usable for another lease: not tainted and the session still
    /// reports healthy.
    #[must_use]
    pub fn is_reusable(&self) -> bool {
        !self.tainted && self.session.is_healthy()
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("bound", &self.bound_identity())
            .field("in_tx", &self.in_tx)
            .field("tainted", &self.tainted)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::db::memory::{MemoryDb, MemoryFactory};
    use crate::db::SessionFactory;

    use super::*;

    async fn handle() -> ConnectionHandle {
        let factory = MemoryFactory::new(Arc::new(MemoryDb::default()));
        ConnectionHandle::new(1, factory.connect().await.unwrap())
    }

    #[tokio::test]
    async fn fresh_handle_is_unbound_and_reusable() {
        let handle = handle().await;
        assert!(handle.bound_identity().is_none());
        assert!(!handle.in_tx());
        assert!(handle.is_reusable());
    }

    #[tokio::test]
    async fn context_set_and_take() {
        let mut handle = handle().await;
        handle.set_context(SessionContext {
            tenant: TenantIdentity::new("alice"),
            applied_at: Instant::now(),
        });
        assert_eq!(
            handle.bound_identity().map(TenantIdentity::as_str),
            Some("alice")
        );

        let ctx = handle.take_context().unwrap();
        assert_eq!(ctx.tenant.as_str(), "alice");
        assert!(handle.bound_identity().is_none());
    }

    #[tokio::test]
    async fn tainted_handle_is_not_reusable() {
        let mut handle = handle().await;
        handle.taint();
        assert!(!handle.is_reusable());
    }
}
