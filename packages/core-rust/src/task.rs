//! Task domain model.
//!
//! The `tenant_id` field is populated by the database (from the bound
//! session claim) and is never accepted as an application parameter;
//! see the repository contract in `rowfence-server`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::TenantIdentity;

/// Maximum accepted title length, mirrored by a database check constraint.
pub const MAX_TITLE_LEN: usize = 200;

/// Minimum accepted explicit duration, in minutes.
pub const MIN_DURATION_MINUTES: i32 = 5;

/// A scheduled task row, as visible to its owning tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier.
    pub id: Uuid,
    /// Owning tenant. Set by the database from the session claim.
    pub tenant_id: TenantIdentity,
    /// Short title, at most [`MAX_TITLE_LEN`] characters.
    pub title: String,
    /// Free-form description.
    pub description: String,
    /// Display color tag.
    pub color: String,
    /// Scheduled start.
    pub date_time: DateTime<Utc>,
    /// Scheduled end. Mutually exclusive with `duration_minutes`.
    pub end_time: Option<DateTime<Utc>>,
    /// Explicit duration in minutes. Mutually exclusive with `end_time`.
    pub duration_minutes: Option<i32>,
    /// Completion flag.
    pub completed: bool,
    /// Row creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp (maintained by a database trigger in the
    /// Postgres backend).
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Duration of the task in minutes, however it was specified.
    ///
    /// Prefers the explicit `duration_minutes`; otherwise derives it from
    /// the `end_time`/`date_time` span. `None` when neither is set.
    #[must_use]
    pub fn effective_duration_minutes(&self) -> Option<i64> {
        if let Some(minutes) = self.duration_minutes {
            return Some(i64::from(minutes));
        }
        self.end_time
            .map(|end| (end - self.date_time).num_minutes())
    }

    /// Whether the task's deadline has passed without completion.
    ///
    /// Completed tasks are never overdue. The deadline is `end_time` when
    /// present, `date_time` otherwise.
    #[must_use]
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        if self.completed {
            return false;
        }
        self.end_time.unwrap_or(self.date_time) < now
    }
}

/// Payload for creating a task. Carries no tenant field: ownership comes
/// from the session the statement runs on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_color")]
    pub color: String,
    pub date_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_minutes: Option<i32>,
}

fn default_color() -> String {
    "#3788d8".to_string()
}

/// Partial update for an existing task. `None` fields are left untouched.
///
/// `end_time` and `duration_minutes` use a double-`Option` so a patch can
/// distinguish "leave as is" (`None`) from "set to null" (`Some(None)`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskPatch {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub date_time: Option<DateTime<Utc>>,
    #[serde(default, with = "double_option", skip_serializing_if = "Option::is_none")]
    pub end_time: Option<Option<DateTime<Utc>>>,
    #[serde(default, with = "double_option", skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<Option<i32>>,
    #[serde(default)]
    pub completed: Option<bool>,
}

impl TaskPatch {
    /// True when the patch changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.color.is_none()
            && self.date_time.is_none()
            && self.end_time.is_none()
            && self.duration_minutes.is_none()
            && self.completed.is_none()
    }
}

/// Serde helper so absent fields deserialize to `None` while explicit
/// nulls deserialize to `Some(None)`.
mod double_option {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S, T>(value: &Option<Option<T>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: Serialize,
    {
        match value {
            Some(inner) => inner.serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
    where
        D: Deserializer<'de>,
        T: Deserialize<'de>,
    {
        Option::<T>::deserialize(deserializer).map(Some)
    }
}
