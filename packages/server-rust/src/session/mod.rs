//! Tenant-scoped session layer.
//!
//! The mechanism this server exists for: binding an authenticated tenant
//! identity to a physical database connection for exactly one request,
//! with guaranteed cleanup on every exit path.
//!
//! - [`ConnectionPool`] leases exclusively-owned connection handles
//! - [`SessionContextBinder`] activates and deactivates the row policy
//!   context on a leased handle
//! - [`RequestScope`] orchestrates resolve → lease → bind → execute →
//!   commit/rollback → clear → release for one request

pub mod binder;
pub mod config;
pub mod error;
pub mod handle;
pub mod pool;
pub mod scope;

pub use binder::SessionContextBinder;
pub use config::{PoolConfig, SessionConfig};
pub use error::{ContextBindError, LeakageGuardViolation, PoolError, ScopeError};
pub use handle::{ConnectionHandle, SessionContext};
pub use pool::{ConnectionPool, Lease, PoolStats};
pub use scope::{Outcome, RequestScope, ScopeManager, ScopeState};
