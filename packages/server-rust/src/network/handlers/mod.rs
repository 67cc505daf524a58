//! HTTP handler definitions for the Rowfence server.
//!
//! This module defines `AppState` (the shared state carried through axum
//! extractors) and re-exports all handler functions for convenient access
//! when building the router.

pub mod health;
pub mod settings;
pub mod tasks;

pub use health::{health_handler, liveness_handler, readiness_handler};
pub use settings::{get_settings_handler, put_settings_handler};
pub use tasks::{
    complete_task_handler, create_task_handler, delete_task_handler, get_task_handler,
    list_tasks_handler, update_task_handler,
};

use std::sync::Arc;
use std::time::Instant;

use crate::session::ScopeManager;

use super::ShutdownController;

/// Shared application state passed to all axum handlers via `State`
/// extraction.
///
/// Holds `Arc` references to shared resources so cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    /// Entry point for opening a tenant-scoped unit of work per request.
    pub scopes: Arc<ScopeManager>,
    /// Graceful shutdown controller with health state and in-flight tracking.
    pub shutdown: Arc<ShutdownController>,
    /// Server process start time, used for uptime calculation.
    pub start_time: Instant,
}
