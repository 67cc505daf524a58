//! Per-tenant display settings.
//!
//! Exactly one settings row exists per tenant; it is created on first
//! read with the defaults below. Like tasks, the `tenant_id` column is
//! populated by the database from the bound session claim.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::TenantIdentity;

/// Default interface language (ISO 639-1).
pub const DEFAULT_LANGUAGE: &str = "it";

/// Default accent color, `#RRGGBB` uppercase.
pub const DEFAULT_ACCENT_COLOR: &str = "#7A5BFF";

/// Minimum accepted language tag length.
pub const MIN_LANGUAGE_LEN: usize = 2;

/// Maximum accepted language tag length.
pub const MAX_LANGUAGE_LEN: usize = 5;

/// Interface color theme.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Light,
    Dark,
}

impl Theme {
    /// Database text representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::Dark => "dark",
        }
    }

    /// Parses the database text representation.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "light" => Some(Self::Light),
            "dark" => Some(Self::Dark),
            _ => None,
        }
    }
}

/// The settings row for one tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSettings {
    /// Owning tenant. Set by the database from the session claim.
    pub tenant_id: TenantIdentity,
    /// Interface language tag, [`MIN_LANGUAGE_LEN`]..=[`MAX_LANGUAGE_LEN`]
    /// characters.
    pub language: String,
    /// Color theme.
    pub theme: Theme,
    /// Accent color, `#RRGGBB`, stored uppercase.
    pub accent_color: String,
    /// Row creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

/// Full desired values for a settings row. Carries no tenant field:
/// ownership comes from the session the statement runs on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsUpdate {
    pub language: String,
    pub theme: Theme,
    pub accent_color: String,
}

impl Default for SettingsUpdate {
    fn default() -> Self {
        Self {
            language: DEFAULT_LANGUAGE.to_string(),
            theme: Theme::default(),
            accent_color: DEFAULT_ACCENT_COLOR.to_string(),
        }
    }
}

impl From<&UserSettings> for SettingsUpdate {
    fn from(settings: &UserSettings) -> Self {
        Self {
            language: settings.language.clone(),
            theme: settings.theme,
            accent_color: settings.accent_color.clone(),
        }
    }
}

/// Partial update for a settings row. `None` fields are left untouched;
/// an entirely empty patch reads back the current (or default) row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsPatch {
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub theme: Option<Theme>,
    #[serde(default)]
    pub accent_color: Option<String>,
}

impl SettingsPatch {
    /// True when the patch changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.language.is_none() && self.theme.is_none() && self.accent_color.is_none()
    }

    /// The desired row values after laying this patch over `base`.
    #[must_use]
    pub fn over(&self, base: &SettingsUpdate) -> SettingsUpdate {
        SettingsUpdate {
            language: self.language.clone().unwrap_or_else(|| base.language.clone()),
            theme: self.theme.unwrap_or(base.theme),
            accent_color: self
                .accent_color
                .clone()
                .unwrap_or_else(|| base.accent_color.clone()),
        }
    }
}
