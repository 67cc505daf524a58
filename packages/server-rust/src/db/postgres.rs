//! PostgreSQL [`DbSession`] backend over one `sqlx::PgConnection`.
//!
//! Session control maps to the statements the database's policy engine
//! reads: `SET ROLE <role>` plus `set_config(<claim key>, <value>, false)`
//! session variables, undone with `RESET ROLE` and empty-string configs.
//! Inserts take `tenant_id` from `current_setting(<sub claim>)::uuid`
//! inside the SQL, never from an application parameter.

use async_trait::async_trait;
use rowfence_core::{
    NewTask, SettingsUpdate, Task, TaskPatch, TenantIdentity, Theme, UserSettings,
};
use sqlx::postgres::PgConnection;
use sqlx::{Connection, Row};
use uuid::Uuid;

use super::memory::apply_patch;
use super::{DbError, DbSession, SessionFactory};

const TASK_COLUMNS: &str = "id, tenant_id, title, description, color, date_time, end_time, \
                            duration_minutes, completed, created_at, updated_at";

const SETTINGS_COLUMNS: &str = "tenant_id, language, theme, accent_color, created_at, updated_at";

/// Connects fresh Postgres sessions for the pool.
pub struct PgSessionFactory {
    database_url: String,
    sub_claim_key: String,
}

impl PgSessionFactory {
    /// `sub_claim_key` must match the binder's configured subject claim;
    /// it is spliced into insert SQL and therefore validated here.
    ///
    /// # Panics
    ///
    /// Panics if `sub_claim_key` is not a plain dotted identifier. The
    /// key comes from static configuration, not request input.
    #[must_use]
    pub fn new(database_url: impl Into<String>, sub_claim_key: impl Into<String>) -> Self {
        let sub_claim_key = sub_claim_key.into();
        assert!(
            is_safe_config_key(&sub_claim_key),
            "sub claim key {sub_claim_key:?} is not a plain dotted identifier"
        );
        Self {
            database_url: database_url.into(),
            sub_claim_key,
        }
    }
}

#[async_trait]
impl SessionFactory for PgSessionFactory {
    async fn connect(&self) -> Result<Box<dyn DbSession>, DbError> {
        let conn = PgConnection::connect(&self.database_url)
            .await
            .map_err(|e| DbError::ConnectionLost(e.to_string()))?;
        Ok(Box::new(PgSession {
            conn,
            sub_claim_key: self.sub_claim_key.clone(),
            set_claims: Vec::new(),
            broken: false,
        }))
    }
}

/// One live Postgres session.
pub struct PgSession {
    conn: PgConnection,
    sub_claim_key: String,
    /// Claim keys set since the last reset, so `reset_session` can blank
    /// exactly what was configured.
    set_claims: Vec<String>,
    broken: bool,
}

impl PgSession {
    fn map_err(&mut self, err: sqlx::Error) -> DbError {
        match &err {
            sqlx::Error::Database(db) => match db.code().as_deref() {
                // insufficient_privilege: the row policy (or role grant)
                // rejected the statement.
                Some("42501") => DbError::PolicyDenied,
                Some(code) if code.starts_with("23") => DbError::Constraint(db.to_string()),
                _ => DbError::Statement(db.to_string()),
            },
            sqlx::Error::Io(_) | sqlx::Error::Protocol(_) | sqlx::Error::PoolClosed => {
                self.broken = true;
                DbError::ConnectionLost(err.to_string())
            }
            _ => DbError::Statement(err.to_string()),
        }
    }

    async fn run(&mut self, sql: &str) -> Result<(), DbError> {
        match sqlx::query(sql).execute(&mut self.conn).await {
            Ok(_) => Ok(()),
            Err(e) => Err(self.map_err(e)),
        }
    }
}

/// Accepts `ident` or `ident.ident` shapes made of `[a-z0-9_]`, the only
/// shapes ever spliced into session-control SQL.
fn is_safe_config_key(key: &str) -> bool {
    !key.is_empty()
        && key.split('.').all(|part| {
            !part.is_empty()
                && part
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        })
}

fn row_to_task(row: &sqlx::postgres::PgRow) -> Result<Task, sqlx::Error> {
    Ok(Task {
        id: row.try_get("id")?,
        tenant_id: TenantIdentity::new(row.try_get::<Uuid, _>("tenant_id")?.to_string()),
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        color: row.try_get("color")?,
        date_time: row.try_get("date_time")?,
        end_time: row.try_get("end_time")?,
        duration_minutes: row.try_get("duration_minutes")?,
        completed: row.try_get("completed")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_settings(row: &sqlx::postgres::PgRow) -> Result<UserSettings, sqlx::Error> {
    let theme_name: String = row.try_get("theme")?;
    let theme = Theme::from_name(&theme_name)
        .ok_or_else(|| sqlx::Error::Decode(format!("unknown theme {theme_name:?}").into()))?;
    Ok(UserSettings {
        tenant_id: TenantIdentity::new(row.try_get::<Uuid, _>("tenant_id")?.to_string()),
        language: row.try_get("language")?,
        theme,
        accent_color: row.try_get("accent_color")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl DbSession for PgSession {
    async fn set_role(&mut self, role: &str) -> Result<(), DbError> {
        if !is_safe_config_key(role) {
            return Err(DbError::Statement(format!(
                "role {role:?} is not a plain identifier"
            )));
        }
        self.run(&format!("SET ROLE {role}")).await
    }

    async fn set_claim(&mut self, key: &str, value: &str) -> Result<(), DbError> {
        if !is_safe_config_key(key) {
            return Err(DbError::Statement(format!(
                "claim key {key:?} is not a plain dotted identifier"
            )));
        }
        match sqlx::query("SELECT set_config($1, $2, false)")
            .bind(key)
            .bind(value)
            .execute(&mut self.conn)
            .await
        {
            Ok(_) => {
                if !self.set_claims.iter().any(|k| k == key) {
                    self.set_claims.push(key.to_string());
                }
                Ok(())
            }
            Err(e) => Err(self.map_err(e)),
        }
    }

    async fn reset_session(&mut self) -> Result<(), DbError> {
        self.run("RESET ROLE").await?;
        for key in std::mem::take(&mut self.set_claims) {
            if let Err(e) = sqlx::query("SELECT set_config($1, '', false)")
                .bind(&key)
                .execute(&mut self.conn)
                .await
            {
                return Err(self.map_err(e));
            }
        }
        Ok(())
    }

    async fn begin(&mut self) -> Result<(), DbError> {
        self.run("BEGIN").await
    }

    async fn commit(&mut self) -> Result<(), DbError> {
        self.run("COMMIT").await
    }

    async fn rollback(&mut self) -> Result<(), DbError> {
        self.run("ROLLBACK").await
    }

    async fn insert_task(&mut self, draft: &NewTask) -> Result<Task, DbError> {
        let sql = format!(
            "INSERT INTO tasks (id, tenant_id, title, description, color, date_time, \
             end_time, duration_minutes) \
             VALUES ($1, current_setting('{key}')::uuid, $2, $3, $4, $5, $6, $7) \
             RETURNING {TASK_COLUMNS}",
            key = self.sub_claim_key,
        );
        let result = sqlx::query(&sql)
            .bind(Uuid::new_v4())
            .bind(&draft.title)
            .bind(&draft.description)
            .bind(&draft.color)
            .bind(draft.date_time)
            .bind(draft.end_time)
            .bind(draft.duration_minutes)
            .fetch_one(&mut self.conn)
            .await;
        match result {
            Ok(row) => row_to_task(&row).map_err(|e| self.map_err(e)),
            Err(e) => Err(self.map_err(e)),
        }
    }

    async fn list_tasks(&mut self) -> Result<Vec<Task>, DbError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY date_time DESC");
        let rows = sqlx::query(&sql)
            .fetch_all(&mut self.conn)
            .await
            .map_err(|e| self.map_err(e))?;
        rows.iter()
            .map(row_to_task)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| self.map_err(e))
    }

    async fn get_task(&mut self, id: Uuid) -> Result<Option<Task>, DbError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut self.conn)
            .await
            .map_err(|e| self.map_err(e))?;
        row.as_ref()
            .map(row_to_task)
            .transpose()
            .map_err(|e| self.map_err(e))
    }

    async fn update_task(&mut self, id: Uuid, patch: &TaskPatch) -> Result<Option<Task>, DbError> {
        // Read-modify-write under FOR UPDATE. The policy scopes both the
        // read and the write, so a row outside the bound tenant is simply
        // a miss.
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut self.conn)
            .await
            .map_err(|e| self.map_err(e))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut task = row_to_task(&row).map_err(|e| self.map_err(e))?;
        apply_patch(&mut task, patch);

        let sql = format!(
            "UPDATE tasks SET title = $2, description = $3, color = $4, date_time = $5, \
             end_time = $6, duration_minutes = $7, completed = $8 \
             WHERE id = $1 RETURNING {TASK_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(&task.title)
            .bind(&task.description)
            .bind(&task.color)
            .bind(task.date_time)
            .bind(task.end_time)
            .bind(task.duration_minutes)
            .bind(task.completed)
            .fetch_one(&mut self.conn)
            .await
            .map_err(|e| self.map_err(e))?;
        row_to_task(&row).map(Some).map_err(|e| self.map_err(e))
    }

    async fn delete_task(&mut self, id: Uuid) -> Result<bool, DbError> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = $1")
            .bind(id)
            .execute(&mut self.conn)
            .await
            .map_err(|e| self.map_err(e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_settings(&mut self) -> Result<Option<UserSettings>, DbError> {
        // At most one row is visible: the policy scopes the table to the
        // bound tenant and tenant_id is unique.
        let sql = format!("SELECT {SETTINGS_COLUMNS} FROM user_settings");
        let row = sqlx::query(&sql)
            .fetch_optional(&mut self.conn)
            .await
            .map_err(|e| self.map_err(e))?;
        row.as_ref()
            .map(row_to_settings)
            .transpose()
            .map_err(|e| self.map_err(e))
    }

    async fn upsert_settings(&mut self, desired: &SettingsUpdate) -> Result<UserSettings, DbError> {
        let sql = format!(
            "INSERT INTO user_settings (tenant_id, language, theme, accent_color) \
             VALUES (current_setting('{key}')::uuid, $1, $2, $3) \
             ON CONFLICT (tenant_id) DO UPDATE \
             SET language = $1, theme = $2, accent_color = $3, updated_at = now() \
             RETURNING {SETTINGS_COLUMNS}",
            key = self.sub_claim_key,
        );
        let result = sqlx::query(&sql)
            .bind(&desired.language)
            .bind(desired.theme.as_str())
            .bind(&desired.accent_color)
            .fetch_one(&mut self.conn)
            .await;
        match result {
            Ok(row) => row_to_settings(&row).map_err(|e| self.map_err(e)),
            Err(e) => Err(self.map_err(e)),
        }
    }

    fn is_healthy(&self) -> bool {
        !self.broken
    }
}
