//! Settings operations over a bound request scope.
//!
//! Same contract as the task repository: every method runs on the
//! scope's connection under its tenant context, tenancy never appears as
//! a parameter, and validation runs before any statement is issued.
//!
//! The settings row is created lazily: the first read writes the
//! defaults, so callers always see a row.

use rowfence_core::{
    SettingsPatch, SettingsUpdate, UserSettings, MAX_LANGUAGE_LEN, MIN_LANGUAGE_LEN,
};
use tracing::debug;

use crate::session::RequestScope;

use super::QueryError;

/// Stateless repository for the per-tenant settings row.
#[derive(Debug, Default, Clone, Copy)]
pub struct SettingsRepository;

impl SettingsRepository {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// The scope's tenant's settings, creating the default row on first
    /// read.
    ///
    /// # Errors
    ///
    /// [`QueryError::NoActiveScope`] on a spent scope; database errors
    /// otherwise.
    pub async fn get(&self, scope: &mut RequestScope) -> Result<UserSettings, QueryError> {
        let handle = scope.enter_execution()?;
        let result = handle.session_mut().get_settings().await;
        scope.exit_execution();

        if let Some(settings) = result? {
            return Ok(settings);
        }
        self.write(scope, SettingsUpdate::default()).await
    }

    /// Applies a partial update over the current (or default) row. An
    /// empty patch changes nothing and reads back the row instead.
    ///
    /// # Errors
    ///
    /// [`QueryError::Invalid`] when the merged values fail validation,
    /// before any write; [`QueryError::NoActiveScope`] on a spent scope;
    /// database errors otherwise.
    pub async fn update(
        &self,
        scope: &mut RequestScope,
        patch: &SettingsPatch,
    ) -> Result<UserSettings, QueryError> {
        if patch.is_empty() {
            return self.get(scope).await;
        }

        let handle = scope.enter_execution()?;
        let result = handle.session_mut().get_settings().await;
        scope.exit_execution();

        let base = result?
            .as_ref()
            .map_or_else(SettingsUpdate::default, SettingsUpdate::from);
        let mut merged = patch.over(&base);
        validate_fields(&mut merged)?;
        self.write(scope, merged).await
    }

    async fn write(
        &self,
        scope: &mut RequestScope,
        desired: SettingsUpdate,
    ) -> Result<UserSettings, QueryError> {
        let handle = scope.enter_execution()?;
        let result = handle.session_mut().upsert_settings(&desired).await;
        scope.exit_execution();

        let settings = result?;
        debug!(tenant = %scope.tenant(), "settings written");
        Ok(settings)
    }
}

/// Validates the merged values and normalizes the accent color to the
/// stored uppercase form.
fn validate_fields(desired: &mut SettingsUpdate) -> Result<(), QueryError> {
    let len = desired.language.chars().count();
    if !(MIN_LANGUAGE_LEN..=MAX_LANGUAGE_LEN).contains(&len) {
        return Err(QueryError::Invalid(format!(
            "language must be {MIN_LANGUAGE_LEN} to {MAX_LANGUAGE_LEN} characters"
        )));
    }
    if !is_hex_color(&desired.accent_color) {
        return Err(QueryError::Invalid(
            "accent_color must match #RRGGBB".to_string(),
        ));
    }
    desired.accent_color = desired.accent_color.to_uppercase();
    Ok(())
}

fn is_hex_color(value: &str) -> bool {
    let Some(digits) = value.strip_prefix('#') else {
        return false;
    };
    digits.len() == 6 && digits.chars().all(|c| c.is_ascii_hexdigit())
}
