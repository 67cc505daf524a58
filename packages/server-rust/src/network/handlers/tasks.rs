//! Task endpoint handlers.
//!
//! Each handler is one unit of work: extract the bearer credential, open
//! a scope, run exactly one repository operation, then end the scope --
//! commit on success, rollback on error. Handlers never touch tenancy;
//! the scope carries it.

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use rowfence_core::{NewTask, Task, TaskPatch};
use serde_json::json;
use tracing::error;
use uuid::Uuid;

use crate::repository::{QueryError, TaskRepository};
use crate::session::{Outcome, PoolError, RequestScope, ScopeError};

use super::AppState;

/// Error reply for the task endpoints.
///
/// Wraps the layered error taxonomy and maps it onto status codes at the
/// very edge, so the inner layers never reason about HTTP.
#[derive(Debug)]
pub struct ApiError {
    pub(super) status: StatusCode,
    message: String,
    pub(super) retry_after: Option<u64>,
}

impl ApiError {
    fn not_found() -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: "task not found".to_string(),
            retry_after: None,
        }
    }

    fn unauthorized(message: &str) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: message.to_string(),
            retry_after: None,
        }
    }
}

impl From<ScopeError> for ApiError {
    fn from(err: ScopeError) -> Self {
        let (status, retry_after) = match &err {
            ScopeError::Auth(_) => (StatusCode::UNAUTHORIZED, None),
            ScopeError::Pool(PoolError::Exhausted { .. }) => {
                (StatusCode::SERVICE_UNAVAILABLE, Some(1))
            }
            ScopeError::Pool(PoolError::Connect(_)) => (StatusCode::SERVICE_UNAVAILABLE, None),
            ScopeError::Query(QueryError::Invalid(_)) => (StatusCode::UNPROCESSABLE_ENTITY, None),
            ScopeError::Query(QueryError::Denied | QueryError::Constraint(_)) => {
                (StatusCode::CONFLICT, None)
            }
            ScopeError::Query(QueryError::NoActiveScope | QueryError::Database(_))
            | ScopeError::ContextBind(_)
            | ScopeError::LeakageGuard(_) => (StatusCode::INTERNAL_SERVER_ERROR, None),
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %err, "request failed with internal error");
        }
        // Internal errors get a generic body; details stay in the logs.
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            "internal server error".to_string()
        } else {
            err.to_string()
        };
        Self {
            status,
            message,
            retry_after,
        }
    }
}

impl From<QueryError> for ApiError {
    fn from(err: QueryError) -> Self {
        ScopeError::Query(err).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.message }));
        let mut response = (self.status, body).into_response();
        if let Some(secs) = self.retry_after {
            if let Ok(value) = secs.to_string().parse() {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

/// Extracts the bearer credential from the `Authorization` header.
pub(super) fn bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or_else(|| ApiError::unauthorized("missing authorization header"))?;
    let value = value
        .to_str()
        .map_err(|_| ApiError::unauthorized("malformed authorization header"))?;
    value
        .strip_prefix("Bearer ")
        .ok_or_else(|| ApiError::unauthorized("expected bearer credential"))
}

/// Finishes a scope after its single repository operation.
///
/// Commit on success, rollback on error; the rollback result is ignored
/// because the operation error is the one the client should see (cleanup
/// still ran either way).
pub(super) async fn finish<T>(
    mut scope: RequestScope,
    result: Result<T, QueryError>,
) -> Result<T, ApiError> {
    match result {
        Ok(value) => {
            scope.end(Outcome::Commit).await?;
            Ok(value)
        }
        Err(err) => {
            let _ = scope.end(Outcome::Rollback).await;
            Err(err.into())
        }
    }
}

/// `POST /tasks` -- creates a task for the caller's tenant.
pub async fn create_task_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(draft): Json<NewTask>,
) -> Result<(StatusCode, Json<Task>), ApiError> {
    let token = bearer_token(&headers)?;
    let _guard = state.shutdown.in_flight_guard();

    let mut scope = state.scopes.begin(token).await?;
    let result = TaskRepository::new().create(&mut scope, draft).await;
    let task = finish(scope, result).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

/// `GET /tasks` -- lists the caller's tenant's tasks.
pub async fn list_tasks_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Task>>, ApiError> {
    let token = bearer_token(&headers)?;
    let _guard = state.shutdown.in_flight_guard();

    let mut scope = state.scopes.begin(token).await?;
    let result = TaskRepository::new().list(&mut scope).await;
    Ok(Json(finish(scope, result).await?))
}

/// `GET /tasks/{id}` -- fetches one task; 404 covers both a missing row
/// and another tenant's row.
pub async fn get_task_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Task>, ApiError> {
    let token = bearer_token(&headers)?;
    let _guard = state.shutdown.in_flight_guard();

    let mut scope = state.scopes.begin(token).await?;
    let result = TaskRepository::new().get(&mut scope, id).await;
    let task = finish(scope, result).await?.ok_or_else(ApiError::not_found)?;
    Ok(Json(task))
}

/// `PATCH /tasks/{id}` -- partial update.
pub async fn update_task_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(patch): Json<TaskPatch>,
) -> Result<Json<Task>, ApiError> {
    let token = bearer_token(&headers)?;
    let _guard = state.shutdown.in_flight_guard();

    let mut scope = state.scopes.begin(token).await?;
    let result = TaskRepository::new().update(&mut scope, id, &patch).await;
    let task = finish(scope, result).await?.ok_or_else(ApiError::not_found)?;
    Ok(Json(task))
}

/// `POST /tasks/{id}/complete` -- marks a task completed.
pub async fn complete_task_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Task>, ApiError> {
    let token = bearer_token(&headers)?;
    let _guard = state.shutdown.in_flight_guard();

    let mut scope = state.scopes.begin(token).await?;
    let result = TaskRepository::new().set_completed(&mut scope, id, true).await;
    let task = finish(scope, result).await?.ok_or_else(ApiError::not_found)?;
    Ok(Json(task))
}

/// `DELETE /tasks/{id}` -- deletes a task; 204 on success.
pub async fn delete_task_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let token = bearer_token(&headers)?;
    let _guard = state.shutdown.in_flight_guard();

    let mut scope = state.scopes.begin(token).await?;
    let result = TaskRepository::new().delete(&mut scope, id).await;
    if finish(scope, result).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use chrono::Utc;
    use rowfence_core::TenantIdentity;

    use crate::auth::{AuthConfig, IdentityResolver};
    use crate::db::memory::{MemoryDb, MemoryFactory};
    use crate::network::ShutdownController;
    use crate::session::{
        ConnectionPool, PoolConfig, ScopeManager, SessionConfig, SessionContextBinder,
    };

    use super::*;

    const SECRET: &str = "test-secret";

    fn test_state(db: &Arc<MemoryDb>) -> AppState {
        let binder = Arc::new(SessionContextBinder::new(SessionConfig::default()));
        let pool = ConnectionPool::new(
            PoolConfig {
                capacity: 2,
                acquire_timeout: Duration::from_millis(100),
            },
            Arc::new(MemoryFactory::new(Arc::clone(db))),
            Arc::clone(&binder),
        );
        let scopes = ScopeManager::new(
            IdentityResolver::new(&AuthConfig {
                secret: SECRET.to_string(),
                leeway: Duration::from_secs(0),
            }),
            pool,
            binder,
        );
        AppState {
            scopes: Arc::new(scopes),
            shutdown: Arc::new(ShutdownController::new()),
            start_time: Instant::now(),
        }
    }

    fn auth_headers(tenant: &str) -> HeaderMap {
        let resolver = IdentityResolver::new(&AuthConfig {
            secret: SECRET.to_string(),
            leeway: Duration::from_secs(0),
        });
        let token = resolver
            .issue(&TenantIdentity::new(tenant), Duration::from_secs(60))
            .unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            format!("Bearer {token}").parse().unwrap(),
        );
        headers
    }

    fn draft(title: &str) -> NewTask {
        NewTask {
            title: title.to_string(),
            description: String::new(),
            color: "#3788d8".to_string(),
            date_time: Utc::now(),
            end_time: None,
            duration_minutes: None,
        }
    }

    #[tokio::test]
    async fn create_then_list_roundtrip() {
        let db = Arc::new(MemoryDb::default());
        let state = test_state(&db);

        let (status, Json(created)) = create_task_handler(
            State(state.clone()),
            auth_headers("alice"),
            Json(draft("report")),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created.title, "report");

        let Json(listed) = list_tasks_handler(State(state), auth_headers("alice"))
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, created.id);
    }

    #[tokio::test]
    async fn missing_bearer_is_unauthorized() {
        let db = Arc::new(MemoryDb::default());
        let state = test_state(&db);

        let err = list_tasks_handler(State(state), HeaderMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn bad_token_is_unauthorized() {
        let db = Arc::new(MemoryDb::default());
        let state = test_state(&db);

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer not.a.token".parse().unwrap());
        let err = list_tasks_handler(State(state), headers).await.unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn cross_tenant_get_is_not_found() {
        let db = Arc::new(MemoryDb::default());
        let state = test_state(&db);

        let (_, Json(created)) = create_task_handler(
            State(state.clone()),
            auth_headers("alice"),
            Json(draft("secret")),
        )
        .await
        .unwrap();

        let err = get_task_handler(State(state), auth_headers("bob"), Path(created.id))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_draft_is_unprocessable() {
        let db = Arc::new(MemoryDb::default());
        let state = test_state(&db);

        let err = create_task_handler(State(state), auth_headers("alice"), Json(draft("  ")))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::UNPROCESSABLE_ENTITY);
        // A rejected write leaves nothing behind.
        assert_eq!(db.raw_row_count(), 0);
    }

    #[tokio::test]
    async fn complete_and_delete_flow() {
        let db = Arc::new(MemoryDb::default());
        let state = test_state(&db);

        let (_, Json(created)) = create_task_handler(
            State(state.clone()),
            auth_headers("alice"),
            Json(draft("finish me")),
        )
        .await
        .unwrap();

        let Json(done) = complete_task_handler(
            State(state.clone()),
            auth_headers("alice"),
            Path(created.id),
        )
        .await
        .unwrap();
        assert!(done.completed);

        let status =
            delete_task_handler(State(state.clone()), auth_headers("alice"), Path(created.id))
                .await
                .unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);

        let err = delete_task_handler(State(state), auth_headers("alice"), Path(created.id))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn pool_exhaustion_maps_to_retryable_503() {
        let db = Arc::new(MemoryDb::default());
        let state = test_state(&db);

        // Hold both connections so the handler's acquire times out.
        let s1 = state
            .scopes
            .begin_for(TenantIdentity::new("holder-1"))
            .await
            .unwrap();
        let s2 = state
            .scopes
            .begin_for(TenantIdentity::new("holder-2"))
            .await
            .unwrap();

        let err = list_tasks_handler(State(state.clone()), auth_headers("alice"))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.retry_after, Some(1));
        drop((s1, s2));
    }

    #[tokio::test]
    async fn failed_request_rolls_back_but_pool_recovers() {
        let db = Arc::new(MemoryDb::default());
        let state = test_state(&db);
        db.faults().fail_next_statement();

        let err = create_task_handler(
            State(state.clone()),
            auth_headers("alice"),
            Json(draft("doomed")),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(db.raw_row_count(), 0);

        // Subsequent requests are unaffected.
        let (status, _) = create_task_handler(
            State(state),
            auth_headers("alice"),
            Json(draft("survivor")),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
    }
}
