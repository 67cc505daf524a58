//! Settings endpoint handlers.
//!
//! Same shape as the task handlers: bearer credential, one scope, one
//! repository operation, commit or rollback. The settings row always
//! exists from the caller's point of view; the first read creates it
//! with the defaults.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use rowfence_core::{SettingsPatch, UserSettings};

use crate::repository::SettingsRepository;

use super::tasks::{bearer_token, finish, ApiError};
use super::AppState;

/// `GET /settings` -- the caller's tenant's settings, created with
/// defaults on first read.
pub async fn get_settings_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<UserSettings>, ApiError> {
    let token = bearer_token(&headers)?;
    let _guard = state.shutdown.in_flight_guard();

    let mut scope = state.scopes.begin(token).await?;
    let result = SettingsRepository::new().get(&mut scope).await;
    Ok(Json(finish(scope, result).await?))
}

/// `PUT /settings` -- partial update; an empty body reads back the
/// current (or freshly defaulted) row.
pub async fn put_settings_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(patch): Json<SettingsPatch>,
) -> Result<Json<UserSettings>, ApiError> {
    let token = bearer_token(&headers)?;
    let _guard = state.shutdown.in_flight_guard();

    let mut scope = state.scopes.begin(token).await?;
    let result = SettingsRepository::new().update(&mut scope, &patch).await;
    Ok(Json(finish(scope, result).await?))
}
