//! Admin user-list reconciliation.
//!
//! A `UserListView` holds a local projection of the profile collection (joined with
//! emails) and, while the audit panel is visible, the latest audit entries. It never
//! patches rows in place: every change notification triggers a full re-fetch, and
//! mutations (`save_user`, `delete_user`) leave local state alone and wait for the
//! notification that follows them.
//!
//! Each load takes a ticket when it is issued. A response is applied only if its
//! ticket is newer than the last applied one and the view has not been unmounted,
//! so a slow, older response can never overwrite a newer one.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditLogEntry, AuditRow};
use crate::backend::{
    Backend, BackendResult, ChangeNotification, ConnectionStatus, DataBackend, FeedEvent, PROFILES_TABLE,
};
use crate::error::{AppError, AppResult};
use crate::identity::{Role, UserRow};

pub const SAVE_FAILED: &str = "Error al guardar los cambios";
pub const DELETE_FAILED: &str = "Error al eliminar el usuario";
pub const PASSWORD_NOT_CHANGED: &str = "Perfil actualizado, pero hubo un error al cambiar la contraseña";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadState {
    Loading,
    Ready,
}

/// Fetch all profiles newest first, then resolve emails. An email lookup failure
/// degrades every row to the sentinel instead of failing the list.
pub async fn fetch_users(data: &dyn DataBackend, token: &str) -> BackendResult<Vec<UserRow>> {
    let profiles = data.list_profiles(token).await?;
    let emails = match data.get_user_emails(token).await {
        Ok(list) => list.into_iter().filter_map(|u| u.email.map(|e| (u.id, e))).collect(),
        Err(e) => {
            error!(target: "reconcile", "Error loading emails: {}", e);
            std::collections::HashMap::new()
        }
    };
    Ok(profiles
        .into_iter()
        .map(|p| {
            let email = emails.get(&p.id).cloned();
            UserRow::new(p, email)
        })
        .collect())
}

pub async fn fetch_audit(data: &dyn DataBackend, token: &str, limit: usize) -> BackendResult<Vec<AuditLogEntry>> {
    let mut entries = data.list_audit_logs(token, limit).await?;
    entries.truncate(limit);
    Ok(entries)
}

/// Requested edit of one user from the admin panel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserEdit {
    pub name: String,
    pub role: Role,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SaveOutcome {
    Saved,
    PasswordNotChanged { warning: String },
}

pub async fn save_user(data: &dyn DataBackend, token: &str, user_id: &str, edit: &UserEdit) -> AppResult<SaveOutcome> {
    let name = edit.name.trim();
    if name.is_empty() {
        return Err(AppError::user("name_required", "El nombre es obligatorio"));
    }
    if let Err(e) = data.admin_update_profile(token, user_id, name, edit.role).await {
        error!(target: "reconcile", user_id, "Error saving user: {}", e);
        return Err(AppError::mutation("save_failed".to_string(), format!("{}: {}", SAVE_FAILED, e)));
    }
    let password = edit.password.as_deref().filter(|p| !p.is_empty());
    if let Some(pw) = password {
        if let Err(e) = data.update_user_password(token, user_id, pw).await {
            error!(target: "reconcile", user_id, "Error updating password: {}", e);
            return Ok(SaveOutcome::PasswordNotChanged { warning: PASSWORD_NOT_CHANGED.to_string() });
        }
    }
    info!(target: "reconcile", user_id, role = %edit.role, "user saved");
    Ok(SaveOutcome::Saved)
}

/// Delete the profile row, then the auth record. Only the first step can fail the call.
pub async fn delete_user(data: &dyn DataBackend, token: &str, user_id: &str) -> AppResult<()> {
    if let Err(e) = data.delete_profile(token, user_id).await {
        error!(target: "reconcile", user_id, "Error deleting user: {}", e);
        return Err(AppError::mutation("delete_failed".to_string(), format!("{}: {}", DELETE_FAILED, e)));
    }
    if let Err(e) = data.delete_user(token, user_id).await {
        error!(target: "reconcile", user_id, "Error deleting auth user: {}", e);
    }
    info!(target: "reconcile", user_id, "user deleted");
    Ok(())
}

/// Serializable state pushed to live subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct ViewSnapshot {
    pub revision: u64,
    pub load_state: LoadState,
    pub connection: ConnectionStatus,
    pub users: Vec<UserRow>,
    pub audit_visible: bool,
    pub audit_state: LoadState,
    pub audit: Vec<AuditRow>,
}

struct ViewState {
    users: Vec<UserRow>,
    load_state: LoadState,
    connection: ConnectionStatus,
    audit_visible: bool,
    audit_state: LoadState,
    audit: Vec<AuditLogEntry>,
    applied_users: u64,
    applied_audit: u64,
    revision: u64,
}

pub struct UserListView {
    backend: Arc<dyn Backend>,
    token: String,
    audit_limit: usize,
    state: Mutex<ViewState>,
    user_tickets: AtomicU64,
    audit_tickets: AtomicU64,
    disposed: AtomicBool,
    changed: watch::Sender<u64>,
}

impl UserListView {
    pub fn new(backend: Arc<dyn Backend>, token: impl Into<String>, audit_limit: usize) -> Arc<Self> {
        let (changed, _) = watch::channel(0);
        Arc::new(Self {
            backend,
            token: token.into(),
            audit_limit,
            state: Mutex::new(ViewState {
                users: Vec::new(),
                load_state: LoadState::Loading,
                connection: ConnectionStatus::Connecting,
                audit_visible: false,
                audit_state: LoadState::Ready,
                audit: Vec::new(),
                applied_users: 0,
                applied_audit: 0,
                revision: 0,
            }),
            user_tickets: AtomicU64::new(0),
            audit_tickets: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
            changed,
        })
    }

    /// Receiver that observes the revision number after every state change.
    pub fn watch(&self) -> watch::Receiver<u64> { self.changed.subscribe() }

    pub fn is_disposed(&self) -> bool { self.disposed.load(Ordering::SeqCst) }

    pub fn snapshot(&self) -> ViewSnapshot {
        let s = self.state.lock();
        ViewSnapshot {
            revision: s.revision,
            load_state: s.load_state,
            connection: s.connection,
            users: s.users.clone(),
            audit_visible: s.audit_visible,
            audit_state: s.audit_state,
            audit: s.audit.iter().map(AuditLogEntry::render).collect(),
        }
    }

    pub fn users(&self) -> Vec<UserRow> { self.state.lock().users.clone() }

    pub fn connection(&self) -> ConnectionStatus { self.state.lock().connection }

    fn mutate<F: FnOnce(&mut ViewState)>(&self, f: F) {
        let rev = {
            let mut s = self.state.lock();
            f(&mut s);
            s.revision += 1;
            s.revision
        };
        self.changed.send_replace(rev);
    }

    pub fn set_connection(&self, status: ConnectionStatus) {
        if self.is_disposed() { return; }
        info!(target: "reconcile", ?status, "change feed status");
        self.mutate(|s| s.connection = status);
    }

    /// Full re-fetch of the user list. Returns the list as it stands afterwards.
    pub async fn load_users(&self) -> Vec<UserRow> {
        let ticket = self.user_tickets.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.is_disposed() {
            self.mutate(|s| s.load_state = LoadState::Loading);
        }
        let result = fetch_users(self.backend.as_data(), &self.token).await;
        if self.is_disposed() {
            debug!(target: "reconcile", ticket, "view unmounted; dropping user list response");
            return self.users();
        }
        let mut stale = false;
        self.mutate(|s| {
            if ticket <= s.applied_users {
                stale = true;
                return;
            }
            s.applied_users = ticket;
            match result {
                Ok(rows) => s.users = rows,
                Err(e) => error!(target: "reconcile", "Error loading profiles: {}", e),
            }
            s.load_state = LoadState::Ready;
        });
        if stale {
            debug!(target: "reconcile", ticket, "discarding stale user list response");
        }
        self.users()
    }

    /// Refresh the audit window. No-op while the audit panel is hidden.
    pub async fn load_audit_log(&self) {
        if !self.state.lock().audit_visible { return; }
        let ticket = self.audit_tickets.fetch_add(1, Ordering::SeqCst) + 1;
        self.mutate(|s| s.audit_state = LoadState::Loading);
        let result = fetch_audit(self.backend.as_data(), &self.token, self.audit_limit).await;
        if self.is_disposed() { return; }
        self.mutate(|s| {
            // hidden since the load was issued
            if !s.audit_visible || ticket <= s.applied_audit { return; }
            s.applied_audit = ticket;
            match result {
                Ok(entries) => s.audit = entries,
                Err(e) => {
                    error!(target: "reconcile", "Error loading audit log: {}", e);
                    s.audit.clear();
                }
            }
            s.audit_state = LoadState::Ready;
        });
    }

    pub async fn set_audit_visible(&self, visible: bool) {
        if self.is_disposed() { return; }
        self.mutate(|s| {
            s.audit_visible = visible;
            if !visible {
                s.audit.clear();
                s.audit_state = LoadState::Ready;
            }
        });
        if visible { self.load_audit_log().await; }
    }

    pub async fn on_change_notification(&self, note: &ChangeNotification) {
        if self.is_disposed() { return; }
        debug!(target: "reconcile", event = %note.event_type, table = %note.affected_table, "change notification");
        self.load_users().await;
        self.load_audit_log().await;
    }

    pub async fn save_user(&self, user_id: &str, edit: &UserEdit) -> AppResult<SaveOutcome> {
        save_user(self.backend.as_data(), &self.token, user_id, edit).await
    }

    pub async fn delete_user(&self, user_id: &str) -> AppResult<()> {
        delete_user(self.backend.as_data(), &self.token, user_id).await
    }

    /// Open the change channel for the profile table and start reconciling.
    /// The returned handle unmounts the view when dropped.
    pub async fn mount(self: &Arc<Self>) -> BackendResult<MountedView> {
        let mut sub = self.backend.as_feed().subscribe(&self.token, PROFILES_TABLE).await?;
        let view = Arc::clone(self);
        let task = tokio::spawn(async move {
            view.load_users().await;
            while let Some(ev) = sub.recv().await {
                if view.is_disposed() { break; }
                match ev {
                    FeedEvent::Status(status) => view.set_connection(status),
                    FeedEvent::Change(note) => view.on_change_notification(&note).await,
                }
            }
            warn!(target: "reconcile", "change feed ended");
            view.set_connection(ConnectionStatus::Disconnected);
            sub.close();
        });
        Ok(MountedView { view: Arc::clone(self), task: Some(task) })
    }
}

/// A mounted view. Unmounting closes the channel and discards in-flight responses.
pub struct MountedView {
    view: Arc<UserListView>,
    task: Option<JoinHandle<()>>,
}

impl MountedView {
    pub fn view(&self) -> &Arc<UserListView> { &self.view }

    pub fn unmount(mut self) { self.teardown(); }

    fn teardown(&mut self) {
        self.view.disposed.store(true, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
            debug!(target: "reconcile", "view unmounted");
        }
    }
}

impl Drop for MountedView {
    fn drop(&mut self) { self.teardown(); }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use chrono::{DateTime, Utc};

    fn ts(s: &str) -> DateTime<Utc> { s.parse().unwrap() }

    fn seeded() -> (Arc<MemoryBackend>, String) {
        let mem = Arc::new(MemoryBackend::new());
        mem.add_user("u-old", "old@example.com", "pw1234", "Old", Role::User, ts("2024-01-01T00:00:00Z"));
        mem.add_user("u-adm", "adm@example.com", "pw1234", "Adm", Role::Admin, ts("2024-01-02T00:00:00Z"));
        mem.add_user("u-new", "new@example.com", "pw1234", "New", Role::User, ts("2024-01-03T00:00:00Z"));
        let token = mem.issue_token("u-adm");
        (mem, token)
    }

    #[tokio::test]
    async fn users_come_back_newest_first_with_emails() {
        let (mem, token) = seeded();
        let view = UserListView::new(mem.clone(), token, 50);
        let users = view.load_users().await;
        let ids: Vec<&str> = users.iter().map(|u| u.id()).collect();
        assert_eq!(ids, vec!["u-new", "u-adm", "u-old"]);
        assert_eq!(users[0].email, "new@example.com");
        assert_eq!(view.snapshot().load_state, LoadState::Ready);
    }

    #[tokio::test]
    async fn email_failure_degrades_to_sentinel() {
        let (mem, token) = seeded();
        mem.fail_emails.store(true, Ordering::SeqCst);
        let view = UserListView::new(mem.clone(), token, 50);
        let users = view.load_users().await;
        assert_eq!(users.len(), 3);
        assert!(users.iter().all(|u| u.email == crate::identity::EMAIL_UNAVAILABLE));
    }

    #[tokio::test]
    async fn profile_failure_keeps_previous_list() {
        let (mem, token) = seeded();
        let view = UserListView::new(mem.clone(), token, 50);
        assert_eq!(view.load_users().await.len(), 3);
        mem.fail_list_profiles.store(true, Ordering::SeqCst);
        assert_eq!(view.load_users().await.len(), 3);
        assert_eq!(view.snapshot().load_state, LoadState::Ready);
    }

    #[tokio::test]
    async fn older_response_never_overwrites_newer() {
        let (mem, token) = seeded();
        let view = UserListView::new(mem.clone(), token.clone(), 50);
        // first load is slow and sees the original three users
        mem.push_list_delay(std::time::Duration::from_millis(200));
        let slow = {
            let v = Arc::clone(&view);
            tokio::spawn(async move { v.load_users().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        mem.add_user("u-late", "late@example.com", "pw1234", "Late", Role::User, ts("2024-01-04T00:00:00Z"));
        let fresh = view.load_users().await;
        assert_eq!(fresh.len(), 4);
        let after_slow = slow.await.unwrap();
        assert_eq!(after_slow.len(), 4, "stale response must be discarded");
    }

    #[tokio::test]
    async fn audit_loads_only_while_visible() {
        let (mem, token) = seeded();
        let view = UserListView::new(mem.clone(), token, 50);
        view.load_audit_log().await;
        assert_eq!(mem.audit_calls(), 0);
        view.set_audit_visible(true).await;
        assert_eq!(mem.audit_calls(), 1);
        let note = ChangeNotification { event_type: "UPDATE".into(), affected_table: "profiles".into(), payload: serde_json::Value::Null };
        view.on_change_notification(&note).await;
        assert_eq!(mem.audit_calls(), 2);
        view.set_audit_visible(false).await;
        view.on_change_notification(&note).await;
        assert_eq!(mem.audit_calls(), 2);
    }

    #[tokio::test]
    async fn hiding_audit_clears_rows_and_ignores_late_response() {
        let (mem, token) = seeded();
        let edit = UserEdit { name: "Renamed".into(), role: Role::User, password: None };
        save_user(mem.as_ref(), &token, "u-old", &edit).await.unwrap();

        let view = UserListView::new(mem.clone(), token, 50);
        view.set_audit_visible(true).await;
        assert!(!view.snapshot().audit.is_empty());

        view.set_audit_visible(false).await;
        let snap = view.snapshot();
        assert!(snap.audit.is_empty());
        assert_eq!(snap.audit_state, LoadState::Ready);

        // a load issued while visible that lands after hiding is dropped
        mem.push_audit_delay(std::time::Duration::from_millis(150));
        let late = {
            let v = Arc::clone(&view);
            tokio::spawn(async move { v.set_audit_visible(true).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert_eq!(view.snapshot().audit_state, LoadState::Loading);
        view.set_audit_visible(false).await;
        late.await.unwrap();
        let snap = view.snapshot();
        assert!(snap.audit.is_empty());
        assert_eq!(snap.audit_state, LoadState::Ready);
    }

    #[tokio::test]
    async fn audit_toggle_after_unmount_is_ignored() {
        let (mem, token) = seeded();
        let view = UserListView::new(mem.clone(), token, 50);
        let mounted = view.mount().await.unwrap();
        mounted.unmount();
        let rev = view.snapshot().revision;
        view.set_audit_visible(true).await;
        assert_eq!(view.snapshot().revision, rev);
        assert!(!view.snapshot().audit_visible);
        assert_eq!(mem.audit_calls(), 0);
    }

    #[tokio::test]
    async fn save_rejects_blank_name_and_reports_password_failure() {
        let (mem, token) = seeded();
        let blank = UserEdit { name: "  ".into(), role: Role::User, password: None };
        let err = save_user(mem.as_ref(), &token, "u-old", &blank).await.unwrap_err();
        assert_eq!(err.http_status(), 400);

        let edit = UserEdit { name: "Renamed".into(), role: Role::Admin, password: Some("newpass".into()) };
        assert_eq!(save_user(mem.as_ref(), &token, "u-old", &edit).await.unwrap(), SaveOutcome::Saved);
        assert_eq!(mem.profile_now("u-old").unwrap().role, Role::Admin);
        assert_eq!(mem.password_of("u-old").as_deref(), Some("newpass"));
    }

    #[tokio::test]
    async fn failed_delete_surfaces_error_and_changes_nothing() {
        let (mem, token) = seeded();
        mem.fail_mutations.store(true, Ordering::SeqCst);
        let err = delete_user(mem.as_ref(), &token, "u-old").await.unwrap_err();
        assert_eq!(err.code_str(), "delete_failed");
        assert!(mem.profile_now("u-old").is_some());
    }
}
