//! Network module with deferred startup lifecycle.
//!
//! `new()` creates resources, `start()` binds the TCP listener, and
//! `serve()` starts accepting connections. The separation lets the rest
//! of the application (pool warm-up, signal wiring) run between bind and
//! accept, and lets tests bind port 0 without serving.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::session::ScopeManager;

use super::config::NetworkConfig;
use super::handlers::{
    complete_task_handler, create_task_handler, delete_task_handler, get_settings_handler,
    get_task_handler, health_handler, list_tasks_handler, liveness_handler, put_settings_handler,
    readiness_handler, update_task_handler, AppState,
};
use super::middleware::build_http_layers;
use super::shutdown::ShutdownController;

/// Manages the full HTTP server lifecycle.
///
/// Follows the deferred startup pattern:
/// 1. `new()` -- allocates shared state (shutdown controller)
/// 2. `start()` -- binds the TCP listener to the configured address
/// 3. `serve()` -- accepts connections until shutdown is signalled
pub struct NetworkModule {
    config: NetworkConfig,
    scopes: Arc<ScopeManager>,
    listener: Option<TcpListener>,
    shutdown: Arc<ShutdownController>,
}

impl NetworkModule {
    /// Creates a new network module without binding any port.
    #[must_use]
    pub fn new(config: NetworkConfig, scopes: Arc<ScopeManager>) -> Self {
        Self {
            config,
            scopes,
            listener: None,
            shutdown: Arc::new(ShutdownController::new()),
        }
    }

    /// Returns a shared reference to the shutdown controller.
    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Assembles the axum router with all routes and middleware.
    ///
    /// Routes:
    /// - `POST /tasks`, `GET /tasks`
    /// - `GET|PATCH|DELETE /tasks/{id}`, `POST /tasks/{id}/complete`
    /// - `GET /health` + `/health/live` + `/health/ready`
    pub fn build_router(&self) -> Router {
        let state = AppState {
            scopes: Arc::clone(&self.scopes),
            shutdown: Arc::clone(&self.shutdown),
            start_time: Instant::now(),
        };

        let layers = build_http_layers(&self.config);

        Router::new()
            .route("/tasks", post(create_task_handler).get(list_tasks_handler))
            .route(
                "/tasks/{id}",
                get(get_task_handler)
                    .patch(update_task_handler)
                    .delete(delete_task_handler),
            )
            .route("/tasks/{id}/complete", post(complete_task_handler))
            .route(
                "/settings",
                get(get_settings_handler).put(put_settings_handler),
            )
            .route("/health", get(health_handler))
            .route("/health/live", get(liveness_handler))
            .route("/health/ready", get(readiness_handler))
            .layer(layers)
            .with_state(state)
    }

    /// Binds the TCP listener to the configured host and port.
    ///
    /// Returns the actual bound port, which may differ from the configured
    /// port when port 0 is used (OS-assigned ephemeral port).
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound (e.g., port in use).
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();

        info!("TCP listener bound to {}:{}", self.config.host, port);

        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves connections until the shutdown future resolves, then drains.
    ///
    /// After the shutdown signal:
    /// 1. Health state transitions to Draining (readiness flips to 503)
    /// 2. Waits up to 30 seconds for in-flight requests to complete
    /// 3. Health state transitions to Stopped
    ///
    /// # Errors
    ///
    /// Returns an error if the server encounters a fatal I/O error.
    ///
    /// # Panics
    ///
    /// Panics if `start()` was not called before `serve()`.
    pub async fn serve(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let listener = self
            .listener
            .as_ref()
            .expect("start() must be called before serve()");
        info!("serving HTTP on {}", listener.local_addr()?);

        let router = self.build_router();
        let shutdown_ctrl = Arc::clone(&self.shutdown);

        // Flip readiness to passing only once we are about to accept.
        shutdown_ctrl.set_ready();

        let listener = self
            .listener
            .expect("start() must be called before serve()");
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        shutdown_ctrl.trigger_shutdown();
        let drained = shutdown_ctrl.wait_for_drain(Duration::from_secs(30)).await;
        if drained {
            info!("all in-flight requests drained");
        } else {
            warn!("drain timeout expired with in-flight requests remaining");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::auth::{AuthConfig, IdentityResolver};
    use crate::db::memory::{MemoryDb, MemoryFactory};
    use crate::session::{
        ConnectionPool, PoolConfig, SessionConfig, SessionContextBinder,
    };

    use super::*;

    fn scope_manager() -> Arc<ScopeManager> {
        let binder = Arc::new(SessionContextBinder::new(SessionConfig::default()));
        let pool = ConnectionPool::new(
            PoolConfig {
                capacity: 2,
                acquire_timeout: Duration::from_millis(100),
            },
            Arc::new(MemoryFactory::new(Arc::new(MemoryDb::default()))),
            Arc::clone(&binder),
        );
        Arc::new(ScopeManager::new(
            IdentityResolver::new(&AuthConfig {
                secret: "test-secret".to_string(),
                leeway: Duration::from_secs(0),
            }),
            pool,
            binder,
        ))
    }

    #[tokio::test]
    async fn new_creates_module_without_binding() {
        let module = NetworkModule::new(NetworkConfig::default(), scope_manager());
        assert!(module.listener.is_none());
    }

    #[tokio::test]
    async fn build_router_creates_router() {
        let module = NetworkModule::new(NetworkConfig::default(), scope_manager());
        let _router = module.build_router();
    }

    #[tokio::test]
    async fn start_binds_to_os_assigned_port() {
        let mut module = NetworkModule::new(NetworkConfig::default(), scope_manager());
        let port = module.start().await.expect("start should succeed");
        assert!(port > 0, "OS-assigned port should be > 0");
        assert!(module.listener.is_some());
    }

    #[tokio::test]
    #[should_panic(expected = "start() must be called before serve()")]
    async fn serve_panics_without_start() {
        let module = NetworkModule::new(NetworkConfig::default(), scope_manager());
        let _ = module.serve(std::future::pending::<()>()).await;
    }
}
