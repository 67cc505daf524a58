//! In-memory [`DbSession`] backend emulating the row-level policy.
//!
//! Backed by shared [`DashMap`]s of task and settings rows. Each session
//! carries its
//! own role/claim state and a write journal for the open transaction, so
//! the policy behaves like the real database: business statements are
//! denied unless the session assumed the authenticated role and set a
//! subject claim, and every statement only sees or mutates rows whose
//! `tenant_id` equals that claim.
//!
//! Used for development and for every test that exercises pool, binder,
//! and scope semantics without a running database. Includes fault
//! injection hooks for the failure-path tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use rowfence_core::{NewTask, SettingsUpdate, Task, TaskPatch, TenantIdentity, UserSettings};
use uuid::Uuid;

use super::{DbError, DbSession, SessionFactory};

/// Fault injection switches, shared by all sessions of one [`MemoryDb`].
///
/// Each `fail_next_*` flag fires once and self-clears.
#[derive(Debug, Default)]
pub struct FaultPlan {
    fail_next_set_claim: AtomicBool,
    fail_next_statement: AtomicBool,
    fail_next_reset: AtomicBool,
    statement_delay: Mutex<Option<Duration>>,
}

impl FaultPlan {
    /// Makes the next `set_claim` fail (context activation failure).
    pub fn fail_next_set_claim(&self) {
        self.fail_next_set_claim.store(true, Ordering::SeqCst);
    }

    /// Makes the next business statement fail.
    pub fn fail_next_statement(&self) {
        self.fail_next_statement.store(true, Ordering::SeqCst);
    }

    /// Makes the next `reset_session` fail (clear failure path).
    pub fn fail_next_reset(&self) {
        self.fail_next_reset.store(true, Ordering::SeqCst);
    }

    /// Delays every business statement, for cancellation tests.
    pub fn delay_statements(&self, delay: Duration) {
        *self.statement_delay.lock() = Some(delay);
    }

    fn take(&self, flag: &AtomicBool) -> bool {
        flag.swap(false, Ordering::SeqCst)
    }
}

/// Shared in-memory database state.
pub struct MemoryDb {
    policy_role: String,
    sub_claim_key: String,
    tasks: DashMap<Uuid, Task>,
    settings: DashMap<TenantIdentity, UserSettings>,
    business_statements: AtomicU64,
    faults: FaultPlan,
}

impl MemoryDb {
    /// Creates an empty database whose emulated policy accepts the given
    /// role and reads the given claim key.
    #[must_use]
    pub fn new(policy_role: impl Into<String>, sub_claim_key: impl Into<String>) -> Self {
        Self {
            policy_role: policy_role.into(),
            sub_claim_key: sub_claim_key.into(),
            tasks: DashMap::new(),
            settings: DashMap::new(),
            business_statements: AtomicU64::new(0),
            faults: FaultPlan::default(),
        }
    }

    /// Fault injection switches for tests.
    #[must_use]
    pub fn faults(&self) -> &FaultPlan {
        &self.faults
    }

    /// Number of business statements executed so far, across all sessions.
    #[must_use]
    pub fn business_statement_count(&self) -> u64 {
        self.business_statements.load(Ordering::SeqCst)
    }

    /// Total number of task rows, ignoring the policy. Test support.
    #[must_use]
    pub fn raw_row_count(&self) -> usize {
        self.tasks.len()
    }

    /// Total number of settings rows, ignoring the policy. Test support.
    #[must_use]
    pub fn raw_settings_count(&self) -> usize {
        self.settings.len()
    }
}

impl Default for MemoryDb {
    fn default() -> Self {
        Self::new("authenticated", "request.jwt.claim.sub")
    }
}

/// [`SessionFactory`] handing out sessions over one shared [`MemoryDb`].
#[derive(Clone)]
pub struct MemoryFactory {
    db: Arc<MemoryDb>,
}

impl MemoryFactory {
    #[must_use]
    pub fn new(db: Arc<MemoryDb>) -> Self {
        Self { db }
    }

    /// The shared database behind this factory.
    #[must_use]
    pub fn db(&self) -> &Arc<MemoryDb> {
        &self.db
    }
}

#[async_trait]
impl SessionFactory for MemoryFactory {
    async fn connect(&self) -> Result<Box<dyn DbSession>, DbError> {
        Ok(Box::new(MemorySession {
            db: Arc::clone(&self.db),
            role: None,
            claims: HashMap::new(),
            journal: None,
            healthy: true,
        }))
    }
}

/// Journaled write, applied to the shared map on commit.
enum TxOp {
    Insert(Task),
    Replace(Task),
    Delete(Uuid),
    PutSettings(UserSettings),
}

/// One emulated database session.
pub struct MemorySession {
    db: Arc<MemoryDb>,
    role: Option<String>,
    claims: HashMap<String, String>,
    journal: Option<Vec<TxOp>>,
    healthy: bool,
}

impl MemorySession {
    /// The tenant the emulated policy resolves for this session, or a
    /// policy denial when role/claim are not in place.
    fn current_tenant(&self) -> Result<TenantIdentity, DbError> {
        let role_ok = self.role.as_deref() == Some(self.db.policy_role.as_str());
        let sub = self.claims.get(&self.db.sub_claim_key);
        match (role_ok, sub) {
            (true, Some(sub)) if !sub.is_empty() => Ok(TenantIdentity::new(sub.clone())),
            _ => Err(DbError::PolicyDenied),
        }
    }

    /// Runs the shared pre-statement machinery: policy check, injected
    /// delay, injected failure, statement accounting.
    async fn business_guard(&mut self) -> Result<TenantIdentity, DbError> {
        let tenant = self.current_tenant()?;

        let delay = *self.db.faults.statement_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.db.faults.take(&self.db.faults.fail_next_statement) {
            return Err(DbError::Statement("injected statement failure".to_string()));
        }

        self.db.business_statements.fetch_add(1, Ordering::SeqCst);
        Ok(tenant)
    }

    /// The row with `id` as this session currently sees it: the shared
    /// map overlaid with this session's journal.
    fn effective_row(&self, tenant: &TenantIdentity, id: Uuid) -> Option<Task> {
        let mut row = self
            .db
            .tasks
            .get(&id)
            .filter(|t| t.tenant_id == *tenant)
            .map(|t| t.clone());

        if let Some(journal) = &self.journal {
            for op in journal {
                match op {
                    TxOp::Insert(t) | TxOp::Replace(t) if t.id == id => row = Some(t.clone()),
                    TxOp::Delete(del) if *del == id => row = None,
                    _ => {}
                }
            }
        }
        row
    }

    /// The bound tenant's settings row as this session currently sees it.
    fn effective_settings(&self, tenant: &TenantIdentity) -> Option<UserSettings> {
        let mut row = self.db.settings.get(tenant).map(|s| s.clone());
        if let Some(journal) = &self.journal {
            for op in journal {
                if let TxOp::PutSettings(s) = op {
                    if s.tenant_id == *tenant {
                        row = Some(s.clone());
                    }
                }
            }
        }
        row
    }

    fn stage(&mut self, op: TxOp) {
        match &mut self.journal {
            Some(journal) => journal.push(op),
            // Autocommit: no open transaction, apply directly.
            None => apply_op(&self.db, op),
        }
    }
}

fn apply_op(db: &MemoryDb, op: TxOp) {
    match op {
        TxOp::Insert(t) | TxOp::Replace(t) => {
            db.tasks.insert(t.id, t);
        }
        TxOp::Delete(id) => {
            db.tasks.remove(&id);
        }
        TxOp::PutSettings(s) => {
            db.settings.insert(s.tenant_id.clone(), s);
        }
    }
}

/// Applies a patch to a task row, including the `updated_at` bump the
/// Postgres backend gets from its trigger.
pub(crate) fn apply_patch(task: &mut Task, patch: &TaskPatch) {
    if let Some(title) = &patch.title {
        task.title.clone_from(title);
    }
    if let Some(description) = &patch.description {
        task.description.clone_from(description);
    }
    if let Some(color) = &patch.color {
        task.color.clone_from(color);
    }
    if let Some(date_time) = patch.date_time {
        task.date_time = date_time;
    }
    if let Some(end_time) = patch.end_time {
        task.end_time = end_time;
    }
    if let Some(duration) = patch.duration_minutes {
        task.duration_minutes = duration;
    }
    if let Some(completed) = patch.completed {
        task.completed = completed;
    }
    task.updated_at = Utc::now();
}

#[async_trait]
impl DbSession for MemorySession {
    async fn set_role(&mut self, role: &str) -> Result<(), DbError> {
        self.role = Some(role.to_string());
        Ok(())
    }

    async fn set_claim(&mut self, key: &str, value: &str) -> Result<(), DbError> {
        if self.db.faults.take(&self.db.faults.fail_next_set_claim) {
            return Err(DbError::Statement("injected set_claim failure".to_string()));
        }
        self.claims.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn reset_session(&mut self) -> Result<(), DbError> {
        if self.db.faults.take(&self.db.faults.fail_next_reset) {
            return Err(DbError::ConnectionLost(
                "injected reset failure".to_string(),
            ));
        }
        self.role = None;
        self.claims.clear();
        Ok(())
    }

    async fn begin(&mut self) -> Result<(), DbError> {
        if self.journal.is_some() {
            return Err(DbError::Statement("transaction already open".to_string()));
        }
        self.journal = Some(Vec::new());
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), DbError> {
        let journal = self
            .journal
            .take()
            .ok_or_else(|| DbError::Statement("no open transaction".to_string()))?;
        for op in journal {
            apply_op(&self.db, op);
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DbError> {
        if self.journal.take().is_none() {
            return Err(DbError::Statement("no open transaction".to_string()));
        }
        Ok(())
    }

    async fn insert_task(&mut self, draft: &NewTask) -> Result<Task, DbError> {
        let tenant = self.business_guard().await?;
        let now = Utc::now();
        let task = Task {
            id: Uuid::new_v4(),
            tenant_id: tenant,
            title: draft.title.clone(),
            description: draft.description.clone(),
            color: draft.color.clone(),
            date_time: draft.date_time,
            end_time: draft.end_time,
            duration_minutes: draft.duration_minutes,
            completed: false,
            created_at: now,
            updated_at: now,
        };
        self.stage(TxOp::Insert(task.clone()));
        Ok(task)
    }

    async fn list_tasks(&mut self) -> Result<Vec<Task>, DbError> {
        let tenant = self.business_guard().await?;

        let mut rows: HashMap<Uuid, Task> = self
            .db
            .tasks
            .iter()
            .filter(|t| t.tenant_id == tenant)
            .map(|t| (t.id, t.clone()))
            .collect();

        if let Some(journal) = &self.journal {
            for op in journal {
                match op {
                    TxOp::Insert(t) | TxOp::Replace(t) => {
                        rows.insert(t.id, t.clone());
                    }
                    TxOp::Delete(id) => {
                        rows.remove(id);
                    }
                    TxOp::PutSettings(_) => {}
                }
            }
        }

        let mut rows: Vec<Task> = rows.into_values().collect();
        // Most recent first, matching the Postgres ORDER BY.
        rows.sort_by(|a, b| b.date_time.cmp(&a.date_time));
        Ok(rows)
    }

    async fn get_task(&mut self, id: Uuid) -> Result<Option<Task>, DbError> {
        let tenant = self.business_guard().await?;
        Ok(self.effective_row(&tenant, id))
    }

    async fn update_task(&mut self, id: Uuid, patch: &TaskPatch) -> Result<Option<Task>, DbError> {
        let tenant = self.business_guard().await?;
        let Some(mut task) = self.effective_row(&tenant, id) else {
            return Ok(None);
        };
        apply_patch(&mut task, patch);
        self.stage(TxOp::Replace(task.clone()));
        Ok(Some(task))
    }

    async fn delete_task(&mut self, id: Uuid) -> Result<bool, DbError> {
        let tenant = self.business_guard().await?;
        if self.effective_row(&tenant, id).is_none() {
            return Ok(false);
        }
        self.stage(TxOp::Delete(id));
        Ok(true)
    }

    async fn get_settings(&mut self) -> Result<Option<UserSettings>, DbError> {
        let tenant = self.business_guard().await?;
        Ok(self.effective_settings(&tenant))
    }

    async fn upsert_settings(&mut self, desired: &SettingsUpdate) -> Result<UserSettings, DbError> {
        let tenant = self.business_guard().await?;
        let now = Utc::now();
        let row = match self.effective_settings(&tenant) {
            Some(existing) => UserSettings {
                language: desired.language.clone(),
                theme: desired.theme,
                accent_color: desired.accent_color.clone(),
                updated_at: now,
                ..existing
            },
            None => UserSettings {
                tenant_id: tenant,
                language: desired.language.clone(),
                theme: desired.theme,
                accent_color: desired.accent_color.clone(),
                created_at: now,
                updated_at: now,
            },
        };
        self.stage(TxOp::PutSettings(row.clone()));
        Ok(row)
    }

    fn is_healthy(&self) -> bool {
        self.healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    async fn session_for(db: &Arc<MemoryDb>, tenant: &str) -> Box<dyn DbSession> {
        let mut session = MemoryFactory::new(Arc::clone(db)).connect().await.unwrap();
        session.set_role("authenticated").await.unwrap();
        session
            .set_claim("request.jwt.claim.sub", tenant)
            .await
            .unwrap();
        session
    }

    #[tokio::test]
    async fn statements_denied_without_role_and_claim() {
        let db = Arc::new(MemoryDb::default());
        let mut session = MemoryFactory::new(Arc::clone(&db)).connect().await.unwrap();

        let err = session.list_tasks().await.unwrap_err();
        assert!(matches!(err, DbError::PolicyDenied));

        // Role alone is not enough.
        session.set_role("authenticated").await.unwrap();
        let err = session.list_tasks().await.unwrap_err();
        assert!(matches!(err, DbError::PolicyDenied));
    }

    #[tokio::test]
    async fn rows_are_invisible_across_tenants() {
        let db = Arc::new(MemoryDb::default());

        let mut alice = session_for(&db, "alice").await;
        alice.insert_task(&draft("alice's task")).await.unwrap();

        let mut bob = session_for(&db, "bob").await;
        assert!(bob.list_tasks().await.unwrap().is_empty());
        assert_eq!(alice.list_tasks().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cross_tenant_mutation_is_a_miss() {
        let db = Arc::new(MemoryDb::default());

        let mut alice = session_for(&db, "alice").await;
        let task = alice.insert_task(&draft("secret")).await.unwrap();

        let mut bob = session_for(&db, "bob").await;
        assert!(bob.get_task(task.id).await.unwrap().is_none());
        assert!(!bob.delete_task(task.id).await.unwrap());
        assert!(bob
            .update_task(task.id, &TaskPatch::default())
            .await
            .unwrap()
            .is_none());

        // Row untouched.
        assert_eq!(db.raw_row_count(), 1);
    }

    #[tokio::test]
    async fn rollback_discards_journaled_writes() {
        let db = Arc::new(MemoryDb::default());
        let mut session = session_for(&db, "alice").await;

        session.begin().await.unwrap();
        session.insert_task(&draft("ephemeral")).await.unwrap();
        // Visible inside the transaction...
        assert_eq!(session.list_tasks().await.unwrap().len(), 1);
        session.rollback().await.unwrap();

        // ...gone after rollback.
        assert!(session.list_tasks().await.unwrap().is_empty());
        assert_eq!(db.raw_row_count(), 0);
    }

    #[tokio::test]
    async fn commit_publishes_journaled_writes() {
        let db = Arc::new(MemoryDb::default());
        let mut session = session_for(&db, "alice").await;

        session.begin().await.unwrap();
        let task = session.insert_task(&draft("kept")).await.unwrap();
        session.commit().await.unwrap();

        let mut second = session_for(&db, "alice").await;
        let seen = second.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(seen.title, "kept");
    }

    #[tokio::test]
    async fn update_inside_transaction_overlays_base_row() {
        let db = Arc::new(MemoryDb::default());
        let mut session = session_for(&db, "alice").await;
        let task = session.insert_task(&draft("v1")).await.unwrap();

        session.begin().await.unwrap();
        let patch = TaskPatch {
            title: Some("v2".to_string()),
            ..TaskPatch::default()
        };
        let updated = session.update_task(task.id, &patch).await.unwrap().unwrap();
        assert_eq!(updated.title, "v2");

        session.rollback().await.unwrap();
        let base = session.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(base.title, "v1");
    }

    #[tokio::test]
    async fn reset_drops_role_and_claims() {
        let db = Arc::new(MemoryDb::default());
        let mut session = session_for(&db, "alice").await;
        assert!(session.list_tasks().await.is_ok());

        session.reset_session().await.unwrap();
        assert!(matches!(
            session.list_tasks().await.unwrap_err(),
            DbError::PolicyDenied
        ));
    }

    #[tokio::test]
    async fn injected_set_claim_failure_fires_once() {
        let db = Arc::new(MemoryDb::default());
        db.faults().fail_next_set_claim();

        let mut session = MemoryFactory::new(Arc::clone(&db)).connect().await.unwrap();
        assert!(session.set_claim("k", "v").await.is_err());
        assert!(session.set_claim("k", "v").await.is_ok());
    }

    #[tokio::test]
    async fn settings_are_invisible_across_tenants() {
        let db = Arc::new(MemoryDb::default());

        let mut alice = session_for(&db, "alice").await;
        let stored = alice
            .upsert_settings(&SettingsUpdate {
                language: "en".to_string(),
                ..SettingsUpdate::default()
            })
            .await
            .unwrap();
        assert_eq!(stored.tenant_id.as_str(), "alice");

        let mut bob = session_for(&db, "bob").await;
        assert!(bob.get_settings().await.unwrap().is_none());
        assert_eq!(
            alice.get_settings().await.unwrap().unwrap().language,
            "en"
        );
    }

    #[tokio::test]
    async fn settings_upsert_preserves_created_at() {
        let db = Arc::new(MemoryDb::default());
        let mut session = session_for(&db, "alice").await;

        let first = session
            .upsert_settings(&SettingsUpdate::default())
            .await
            .unwrap();
        let second = session
            .upsert_settings(&SettingsUpdate {
                language: "de".to_string(),
                ..SettingsUpdate::default()
            })
            .await
            .unwrap();

        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at >= first.updated_at);
        assert_eq!(db.raw_settings_count(), 1);
    }

    #[tokio::test]
    async fn settings_write_respects_the_transaction() {
        let db = Arc::new(MemoryDb::default());
        let mut session = session_for(&db, "alice").await;

        session.begin().await.unwrap();
        session
            .upsert_settings(&SettingsUpdate::default())
            .await
            .unwrap();
        // Visible inside the transaction, gone after rollback.
        assert!(session.get_settings().await.unwrap().is_some());
        session.rollback().await.unwrap();

        assert!(session.get_settings().await.unwrap().is_none());
        assert_eq!(db.raw_settings_count(), 0);
    }

    #[tokio::test]
    async fn statement_counter_only_counts_business_statements() {
        let db = Arc::new(MemoryDb::default());
        let mut session = session_for(&db, "alice").await;
        assert_eq!(db.business_statement_count(), 0);

        session.list_tasks().await.unwrap();
        session.insert_task(&draft("t")).await.unwrap();
        assert_eq!(db.business_statement_count(), 2);
    }
}
