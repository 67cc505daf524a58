//! Task operations over a bound request scope.
//!
//! Every method takes a [`RequestScope`] and runs inside its
//! transaction, on its connection, under its tenant context. Tenancy is
//! never passed as a parameter or written into a predicate here: the
//! database policy derives it from the session context, so a repository
//! bug cannot widen a query past the caller's tenant.
//!
//! Input validation runs before any statement is issued, so a rejected
//! draft never costs a round trip.

use rowfence_core::{
    NewTask, Task, TaskPatch, MAX_TITLE_LEN, MIN_DURATION_MINUTES,
};
use tracing::debug;
use uuid::Uuid;

use crate::db::memory::apply_patch;
use crate::session::RequestScope;

use super::QueryError;

/// Stateless repository for task rows.
#[derive(Debug, Default, Clone, Copy)]
pub struct TaskRepository;

impl TaskRepository {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Inserts a task for the scope's tenant.
    ///
    /// # Errors
    ///
    /// [`QueryError::Invalid`] when the draft fails validation, before any
    /// statement runs; [`QueryError::NoActiveScope`] on a spent scope;
    /// database errors otherwise.
    pub async fn create(&self, scope: &mut RequestScope, draft: NewTask) -> Result<Task, QueryError> {
        validate_fields(
            &draft.title,
            draft.date_time,
            draft.end_time,
            draft.duration_minutes,
        )?;

        let handle = scope.enter_execution()?;
        let result = handle.session_mut().insert_task(&draft).await;
        scope.exit_execution();

        let task = result?;
        debug!(task = %task.id, tenant = %scope.tenant(), "task created");
        Ok(task)
    }

    /// Lists the scope's tenant's tasks, most recent first.
    ///
    /// # Errors
    ///
    /// [`QueryError::NoActiveScope`] on a spent scope; database errors
    /// otherwise.
    pub async fn list(&self, scope: &mut RequestScope) -> Result<Vec<Task>, QueryError> {
        let handle = scope.enter_execution()?;
        let result = handle.session_mut().list_tasks().await;
        scope.exit_execution();
        Ok(result?)
    }

    /// Fetches one task by id; `None` covers both a genuinely missing row
    /// and a row belonging to another tenant.
    ///
    /// # Errors
    ///
    /// [`QueryError::NoActiveScope`] on a spent scope; database errors
    /// otherwise.
    pub async fn get(&self, scope: &mut RequestScope, id: Uuid) -> Result<Option<Task>, QueryError> {
        let handle = scope.enter_execution()?;
        let result = handle.session_mut().get_task(id).await;
        scope.exit_execution();
        Ok(result?)
    }

    /// Applies a partial update. The merged row is validated before any
    /// write, so a patch can never produce an invalid task (for example
    /// by adding `duration_minutes` to a task that has `end_time`).
    ///
    /// # Errors
    ///
    /// [`QueryError::Invalid`] on an empty patch or an invalid merged
    /// row; [`QueryError::NoActiveScope`] on a spent scope; database
    /// errors otherwise.
    pub async fn update(
        &self,
        scope: &mut RequestScope,
        id: Uuid,
        patch: &TaskPatch,
    ) -> Result<Option<Task>, QueryError> {
        if patch.is_empty() {
            return Err(QueryError::Invalid("patch contains no fields".to_string()));
        }

        let Some(current) = self.get(scope, id).await? else {
            return Ok(None);
        };
        let mut merged = current;
        apply_patch(&mut merged, patch);
        validate_fields(
            &merged.title,
            merged.date_time,
            merged.end_time,
            merged.duration_minutes,
        )?;

        let handle = scope.enter_execution()?;
        let result = handle.session_mut().update_task(id, patch).await;
        scope.exit_execution();
        Ok(result?)
    }

    /// Marks a task completed (or not).
    ///
    /// # Errors
    ///
    /// Same as [`Self::update`].
    pub async fn set_completed(
        &self,
        scope: &mut RequestScope,
        id: Uuid,
        completed: bool,
    ) -> Result<Option<Task>, QueryError> {
        let patch = TaskPatch {
            completed: Some(completed),
            ..TaskPatch::default()
        };
        self.update(scope, id, &patch).await
    }

    /// Deletes a task; `false` means no row was visible to delete.
    ///
    /// # Errors
    ///
    /// [`QueryError::NoActiveScope`] on a spent scope; database errors
    /// otherwise.
    pub async fn delete(&self, scope: &mut RequestScope, id: Uuid) -> Result<bool, QueryError> {
        let handle = scope.enter_execution()?;
        let result = handle.session_mut().delete_task(id).await;
        scope.exit_execution();

        let deleted = result?;
        if deleted {
            debug!(task = %id, tenant = %scope.tenant(), "task deleted");
        }
        Ok(deleted)
    }
}

/// Field-level validation shared by create and update (update validates
/// the merged row, not the patch in isolation).
fn validate_fields(
    title: &str,
    date_time: chrono::DateTime<chrono::Utc>,
    end_time: Option<chrono::DateTime<chrono::Utc>>,
    duration_minutes: Option<i32>,
) -> Result<(), QueryError> {
    if title.trim().is_empty() {
        return Err(QueryError::Invalid("title must not be empty".to_string()));
    }
    if title.chars().count() > MAX_TITLE_LEN {
        return Err(QueryError::Invalid(format!(
            "title exceeds {MAX_TITLE_LEN} characters"
        )));
    }
    if end_time.is_some() && duration_minutes.is_some() {
        return Err(QueryError::Invalid(
            "end_time and duration_minutes are mutually exclusive".to_string(),
        ));
    }
    if let Some(end) = end_time {
        if end <= date_time {
            return Err(QueryError::Invalid(
                "end_time must be after date_time".to_string(),
            ));
        }
    }
    if let Some(duration) = duration_minutes {
        if duration < MIN_DURATION_MINUTES {
            return Err(QueryError::Invalid(format!(
                "duration_minutes must be at least {MIN_DURATION_MINUTES}"
            )));
        }
    }
    Ok(())
}
