//! Bounded connection pool with a mandatory-reset free list.
//!
//! Capacity is a `tokio` semaphore; the free list is a `parking_lot`
//! mutex over idle handles. A [`Lease`] owns its handle and its permit,
//! so no two borrowers can ever hold the same handle, and capacity is
//! only freed once the handle is back (or discarded).
//!
//! Two return paths:
//! - explicit release (normal scope teardown): the handle must already be
//!   unbound; residual context here is a [`LeakageGuardViolation`] — the
//!   event is logged at `error!`, counted, and the connection discarded.
//! - lease drop (request cancelled mid-flight): the handle is routed to a
//!   background reclaim worker that rolls back, clears context, and only
//!   then pools it. This is the guaranteed finalizer, not a violation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use metrics::{counter, gauge};
use parking_lot::Mutex;
use rowfence_core::TenantIdentity;
use tokio::sync::mpsc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

use crate::db::SessionFactory;

use super::binder::SessionContextBinder;
use super::config::PoolConfig;
use super::error::{LeakageGuardViolation, PoolError};
use super::handle::ConnectionHandle;

/// Snapshot of pool occupancy, for tests and the health endpoint.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct PoolStats {
    /// Configured capacity.
    pub capacity: usize,
    /// Handles currently sitting in the free list.
    pub idle: usize,
    /// Idle handles still carrying a bound identity. Always zero; a
    /// nonzero value is itself a leakage guard failure.
    pub idle_bound: usize,
    /// Handles currently leased out.
    pub leased: u64,
    /// Connections discarded instead of pooled, lifetime total.
    pub discarded: u64,
    /// Leakage guard violations observed, lifetime total.
    pub leak_events: u64,
}

/// Shared pool of physical database connections.
///
/// Cheap to clone; clones share the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: PoolConfig,
    factory: Arc<dyn SessionFactory>,
    binder: Arc<SessionContextBinder>,
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<ConnectionHandle>>,
    reclaim_tx: mpsc::UnboundedSender<Reclaimed>,
    next_handle_id: AtomicU64,
    leased: AtomicU64,
    discarded: AtomicU64,
    leak_events: AtomicU64,
}

/// A handle traveling back through the drop path, with its permit.
struct Reclaimed {
    handle: ConnectionHandle,
    permit: OwnedSemaphorePermit,
}

/// How a handle is coming back to the pool.
enum ReturnPath {
    /// Normal teardown; residual context is an invariant breach.
    Explicit,
    /// Lease dropped (cancellation); residual context is expected and
    /// scrubbed here.
    Abandoned,
}

impl ConnectionPool {
    /// Creates a pool over `factory`, with connections opened lazily on
    /// demand. Must be called within a tokio runtime: the pool spawns a
    /// background worker that scrubs dropped leases.
    #[must_use]
    pub fn new(
        config: PoolConfig,
        factory: Arc<dyn SessionFactory>,
        binder: Arc<SessionContextBinder>,
    ) -> Self {
        let (reclaim_tx, reclaim_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(PoolInner {
            semaphore: Arc::new(Semaphore::new(config.capacity)),
            config,
            factory,
            binder,
            idle: Mutex::new(Vec::new()),
            reclaim_tx,
            next_handle_id: AtomicU64::new(1),
            leased: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            leak_events: AtomicU64::new(0),
        });
        spawn_reclaim_worker(Arc::downgrade(&inner), reclaim_rx);
        info!(capacity = inner.config.capacity, "connection pool created");
        Self { inner }
    }

    /// Leases a connection, waiting up to the configured acquire timeout.
    ///
    /// The returned handle never carries a bound identity.
    ///
    /// # Errors
    ///
    /// [`PoolError::Exhausted`] when no handle frees up in time (a
    /// backpressure signal, retryable by the caller);
    /// [`PoolError::Connect`] when a replacement connection cannot be
    /// opened.
    pub async fn acquire(&self) -> Result<Lease, PoolError> {
        let started = Instant::now();
        let acquired = tokio::time::timeout(
            self.inner.config.acquire_timeout,
            Arc::clone(&self.inner.semaphore).acquire_owned(),
        )
        .await;
        let permit = match acquired {
            Ok(Ok(permit)) => permit,
            // The semaphore is never closed; a closed error still means
            // no permit, so report it the same way.
            Ok(Err(_)) | Err(_) => {
                counter!("rowfence_pool_exhausted_total").increment(1);
                return Err(PoolError::Exhausted {
                    waited: started.elapsed(),
                });
            }
        };

        let handle = loop {
            let candidate = self.inner.idle.lock().pop();
            match candidate {
                Some(handle) if handle.bound_identity().is_some() => {
                    // Free-list invariant breach: never hand this out.
                    self.inner.record_leak(&handle);
                    self.inner.discard(handle);
                }
                Some(handle) if !handle.is_reusable() => self.inner.discard(handle),
                Some(handle) => break handle,
                None => {
                    let session = self
                        .inner
                        .factory
                        .connect()
                        .await
                        .map_err(PoolError::Connect)?;
                    let id = self.inner.next_handle_id.fetch_add(1, Ordering::SeqCst);
                    debug!(handle = id, "opened replacement connection");
                    break ConnectionHandle::new(id, session);
                }
            }
        };

        let leased = self.inner.leased.fetch_add(1, Ordering::SeqCst) + 1;
        #[allow(clippy::cast_precision_loss)]
        gauge!("rowfence_pool_leased").set(leased as f64);
        Ok(Lease {
            handle: Some(handle),
            permit: Some(permit),
            pool: Arc::clone(&self.inner),
        })
    }

    /// Returns a lease to the pool through the normal path.
    ///
    /// The handle is expected to be unbound; a still-bound handle trips
    /// the leakage guard (logged, counted) and is discarded rather than
    /// ever reaching the free list.
    pub async fn release(&self, mut lease: Lease) {
        if let (Some(handle), Some(permit)) = (lease.handle.take(), lease.permit.take()) {
            self.inner.restore(handle, permit, ReturnPath::Explicit).await;
        }
    }

    /// Current occupancy snapshot.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        // Read `leased` before the free list: a return decrements it only
        // after pooling or discarding the handle, so a zero seen here
        // means the snapshot below already includes that handle.
        let leased = self.inner.leased.load(Ordering::SeqCst);
        let idle = self.inner.idle.lock();
        PoolStats {
            capacity: self.inner.config.capacity,
            idle: idle.len(),
            idle_bound: idle
                .iter()
                .filter(|h| h.bound_identity().is_some())
                .count(),
            leased,
            discarded: self.inner.discarded.load(Ordering::SeqCst),
            leak_events: self.inner.leak_events.load(Ordering::SeqCst),
        }
    }
}

impl PoolInner {
    async fn restore(
        &self,
        mut handle: ConnectionHandle,
        permit: OwnedSemaphorePermit,
        path: ReturnPath,
    ) {
        // A transaction left open means the scope never completed; undo it
        // before the handle can carry state anywhere.
        if handle.in_tx() {
            match handle.session_mut().rollback().await {
                Ok(()) => handle.set_in_tx(false),
                Err(e) => {
                    warn!(handle = handle.id(), error = %e, "rollback on return failed");
                    handle.taint();
                }
            }
        }

        let mut unusable = false;
        if handle.bound_identity().is_some() {
            match path {
                ReturnPath::Explicit => {
                    self.record_leak(&handle);
                    unusable = true;
                }
                ReturnPath::Abandoned => {
                    debug!(handle = handle.id(), "scrubbing context from abandoned lease");
                    unusable = self.binder.clear(&mut handle).await.is_err();
                }
            }
        }

        if !unusable && handle.is_reusable() {
            self.idle.lock().push(handle);
        } else {
            self.discard(handle);
        }

        // The handle is back in the free list or gone; only now does the
        // lease stop counting, so leased == 0 implies every handle is
        // accounted for.
        let leased = self.leased.fetch_sub(1, Ordering::SeqCst) - 1;
        #[allow(clippy::cast_precision_loss)]
        gauge!("rowfence_pool_leased").set(leased as f64);
        // Capacity is freed last.
        drop(permit);
    }

    fn record_leak(&self, handle: &ConnectionHandle) {
        let bound = handle
            .bound_identity()
            .cloned()
            .unwrap_or_else(|| TenantIdentity::new(""));
        let violation = LeakageGuardViolation::ResidualContext {
            handle_id: handle.id(),
            bound,
        };
        error!(handle = handle.id(), %violation, "leakage guard tripped");
        self.leak_events.fetch_add(1, Ordering::SeqCst);
        counter!("rowfence_leakage_guard_total").increment(1);
    }

    fn discard(&self, handle: ConnectionHandle) {
        debug!(handle = handle.id(), tainted = handle.is_tainted(), "discarding connection");
        self.discarded.fetch_add(1, Ordering::SeqCst);
        counter!("rowfence_pool_discarded_total").increment(1);
        drop(handle);
    }
}

fn spawn_reclaim_worker(pool: Weak<PoolInner>, mut rx: mpsc::UnboundedReceiver<Reclaimed>) {
    tokio::spawn(async move {
        while let Some(Reclaimed { handle, permit }) = rx.recv().await {
            let Some(inner) = pool.upgrade() else { break };
            inner.restore(handle, permit, ReturnPath::Abandoned).await;
        }
    });
}

/// Exclusive lease on one pooled connection.
///
/// Dropping the lease (instead of releasing it) routes the handle through
/// the reclaim worker, which performs rollback and context scrubbing
/// before the connection becomes available again.
pub struct Lease {
    handle: Option<ConnectionHandle>,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<PoolInner>,
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease").finish_non_exhaustive()
    }
}

impl Lease {
    /// The leased handle.
    ///
    /// # Panics
    ///
    /// Panics if called after the lease was released; the pool consumes
    /// the handle on release, so this cannot happen through safe use.
    #[must_use]
    pub fn handle(&self) -> &ConnectionHandle {
        self.handle.as_ref().expect("lease already released")
    }

    pub(crate) fn handle_mut(&mut self) -> &mut ConnectionHandle {
        self.handle.as_mut().expect("lease already released")
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let (Some(handle), Some(permit)) = (self.handle.take(), self.permit.take()) {
            if self.pool.reclaim_tx.send(Reclaimed { handle, permit }).is_err() {
                // Worker is gone (runtime shutdown); the connection and
                // permit are simply dropped.
                self.pool.leased.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}
