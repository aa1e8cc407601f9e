//! In-process backend for tests and local runs (`ADMINPANEL_BACKEND_URL=memory:`).
//!
//! Behaves like the hosted backend for the calls this crate makes: profiles are created
//! on sign-up, every profile mutation appends an audit entry and fans a change
//! notification out to open subscriptions, and admin-only procedures check the caller.
//!
//! # Failure injection
//!
//! - `fail_role_lookup`, `fail_list_profiles`, `fail_emails`, `fail_audit`, `fail_mutations`
//!   make the matching calls return `BackendError::Unavailable`.
//! - `push_list_delay` / `push_audit_delay` delay the next `list_profiles` /
//!   `list_audit_logs` call, to reorder responses.
//! - Call counters expose how many loads the view issued.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::{
    AuthBackend, AuthSession, BackendError, BackendResult, ChangeFeed, ChangeNotification, ConnectionStatus,
    DataBackend, FeedEvent, SignUpOutcome, Subscription, UserEmail, PROFILES_TABLE,
};
use crate::audit::{newest_first, AuditAction, AuditLogEntry};
use crate::identity::{Principal, Profile, Role};

const FEED_BUFFER: usize = 64;

#[derive(Debug, Clone)]
struct Account {
    id: String,
    email: String,
    password: String,
}

#[derive(Default)]
struct State {
    accounts: Vec<Account>,
    tokens: HashMap<String, String>,
    profiles: HashMap<String, Profile>,
    audit: Vec<AuditLogEntry>,
    subscribers: Vec<(String, mpsc::Sender<FeedEvent>)>,
    list_delays: VecDeque<Duration>,
    audit_delays: VecDeque<Duration>,
}

#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<State>,
    seq: AtomicU64,
    pub fail_role_lookup: AtomicBool,
    pub fail_list_profiles: AtomicBool,
    pub fail_emails: AtomicBool,
    pub fail_audit: AtomicBool,
    pub fail_mutations: AtomicBool,
    pub require_email_confirmation: AtomicBool,
    list_profiles_calls: AtomicUsize,
    audit_calls: AtomicUsize,
}

fn unavailable(what: &str) -> BackendError {
    BackendError::Unavailable(format!("injected failure: {}", what))
}

fn snapshot(p: &Profile) -> Map<String, Value> {
    match serde_json::to_value(p) {
        Ok(Value::Object(m)) => m,
        _ => Map::new(),
    }
}

impl MemoryBackend {
    pub fn new() -> Self { Self::default() }

    fn next_id(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.seq.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Seed an account with its profile. Seeding does not audit or notify.
    pub fn add_user(&self, id: &str, email: &str, password: &str, name: &str, role: Role, created_at: DateTime<Utc>) {
        let mut st = self.state.lock();
        st.accounts.push(Account { id: id.into(), email: email.into(), password: password.into() });
        st.profiles.insert(id.into(), Profile { id: id.into(), name: name.into(), role, created_at });
    }

    /// Seed an account that has no profile row.
    pub fn add_account_without_profile(&self, id: &str, email: &str, password: &str) {
        self.state.lock().accounts.push(Account { id: id.into(), email: email.into(), password: password.into() });
    }

    /// Issue an access token for a seeded account without a password round trip.
    pub fn issue_token(&self, user_id: &str) -> String {
        let token = self.next_id(&format!("tok-{}", user_id));
        self.state.lock().tokens.insert(token.clone(), user_id.to_string());
        token
    }

    pub fn push_audit(&self, entry: AuditLogEntry) {
        self.state.lock().audit.push(entry);
    }

    pub fn push_list_delay(&self, delay: Duration) {
        self.state.lock().list_delays.push_back(delay);
    }

    pub fn push_audit_delay(&self, delay: Duration) {
        self.state.lock().audit_delays.push_back(delay);
    }

    pub fn list_profiles_calls(&self) -> usize { self.list_profiles_calls.load(Ordering::SeqCst) }

    pub fn audit_calls(&self) -> usize { self.audit_calls.load(Ordering::SeqCst) }

    pub fn subscriber_count(&self) -> usize {
        let mut st = self.state.lock();
        st.subscribers.retain(|(_, tx)| !tx.is_closed());
        st.subscribers.len()
    }

    pub fn profile_now(&self, id: &str) -> Option<Profile> {
        self.state.lock().profiles.get(id).cloned()
    }

    pub fn password_of(&self, id: &str) -> Option<String> {
        self.state.lock().accounts.iter().find(|a| a.id == id).map(|a| a.password.clone())
    }

    /// Fan a notification out to every open subscription on `table`.
    pub fn emit_change(&self, table: &str, event_type: &str, payload: Value) {
        let note = ChangeNotification { event_type: event_type.into(), affected_table: table.into(), payload };
        self.broadcast(table, FeedEvent::Change(note));
    }

    /// Report a transport status to every open subscription.
    pub fn emit_status(&self, status: ConnectionStatus) {
        let mut st = self.state.lock();
        st.subscribers.retain(|(_, tx)| deliver(tx, FeedEvent::Status(status)));
    }

    /// Drop every open subscription, as a transport that gave up would.
    pub fn close_feeds(&self) {
        self.state.lock().subscribers.clear();
    }

    fn broadcast(&self, table: &str, ev: FeedEvent) {
        let mut st = self.state.lock();
        st.subscribers.retain(|(t, tx)| {
            if t != table { return !tx.is_closed(); }
            deliver(tx, ev.clone())
        });
    }

    fn caller(&self, token: &str) -> BackendResult<String> {
        self.state.lock().tokens.get(token).cloned().ok_or(BackendError::Unauthorized)
    }

    fn require_admin(&self, token: &str) -> BackendResult<String> {
        let uid = self.caller(token)?;
        let is_admin = self.state.lock().profiles.get(&uid).map(|p| p.role.is_admin()).unwrap_or(false);
        if !is_admin {
            return Err(BackendError::Status { status: 403, message: "admin role required".into() });
        }
        Ok(uid)
    }

    fn principal_of(&self, uid: &str) -> BackendResult<Principal> {
        let st = self.state.lock();
        st.accounts
            .iter()
            .find(|a| a.id == uid)
            .map(|a| Principal::new(a.id.clone(), a.email.clone()))
            .ok_or(BackendError::Unauthorized)
    }

    fn record_change(&self, action: AuditAction, actor: Option<&str>, old: Option<&Profile>, new: Option<&Profile>) {
        let record_id = new.or(old).map(|p| p.id.clone()).unwrap_or_default();
        let entry = {
            let st = self.state.lock();
            let actor_name = actor.and_then(|a| st.profiles.get(a)).map(|p| p.name.clone());
            AuditLogEntry {
                id: self.next_id("audit"),
                action,
                table_name: PROFILES_TABLE.into(),
                record_id: record_id.clone(),
                old_data: old.map(snapshot),
                new_data: new.map(snapshot),
                changed_by: actor.map(str::to_string),
                changed_by_name: actor_name,
                changed_at: Utc::now(),
            }
        };
        let event = match action {
            AuditAction::Insert => "INSERT",
            AuditAction::Update => "UPDATE",
            AuditAction::Delete => "DELETE",
        };
        self.state.lock().audit.push(entry);
        self.emit_change(PROFILES_TABLE, event, json!({ "id": record_id }));
    }
}

/// `false` only once the subscriber is gone. A full buffer drops the event: the
/// subscriber still has queued changes, and any one of them triggers a full refetch.
fn deliver(tx: &mpsc::Sender<FeedEvent>, ev: FeedEvent) -> bool {
    match tx.try_send(ev) {
        Ok(()) | Err(TrySendError::Full(_)) => true,
        Err(TrySendError::Closed(_)) => false,
    }
}

#[async_trait]
impl AuthBackend for MemoryBackend {
    async fn get_user(&self, token: &str) -> BackendResult<Principal> {
        let uid = self.caller(token)?;
        self.principal_of(&uid)
    }

    async fn sign_in_with_password(&self, email: &str, password: &str) -> BackendResult<AuthSession> {
        let found = {
            let st = self.state.lock();
            st.accounts.iter().find(|a| a.email.eq_ignore_ascii_case(email) && a.password == password).cloned()
        };
        let Some(acct) = found else {
            return Err(BackendError::InvalidCredentials("Invalid login credentials".into()));
        };
        let access_token = self.issue_token(&acct.id);
        Ok(AuthSession { access_token, principal: Principal::new(acct.id, acct.email) })
    }

    async fn sign_up(&self, name: &str, email: &str, password: &str) -> BackendResult<SignUpOutcome> {
        let id = {
            let st = self.state.lock();
            if st.accounts.iter().any(|a| a.email.eq_ignore_ascii_case(email)) {
                return Err(BackendError::Status { status: 422, message: "User already registered".into() });
            }
            drop(st);
            self.next_id("user")
        };
        let profile = Profile { id: id.clone(), name: name.into(), role: Role::User, created_at: Utc::now() };
        {
            let mut st = self.state.lock();
            st.accounts.push(Account { id: id.clone(), email: email.into(), password: password.into() });
            st.profiles.insert(id.clone(), profile.clone());
        }
        self.record_change(AuditAction::Insert, Some(&id), None, Some(&profile));
        let principal = Principal::new(id.clone(), email);
        let session = if self.require_email_confirmation.load(Ordering::SeqCst) {
            None
        } else {
            Some(AuthSession { access_token: self.issue_token(&id), principal: principal.clone() })
        };
        Ok(SignUpOutcome { principal, session })
    }

    async fn sign_out(&self, token: &str) -> BackendResult<()> {
        self.state.lock().tokens.remove(token);
        Ok(())
    }
}

#[async_trait]
impl DataBackend for MemoryBackend {
    async fn profile(&self, token: &str, id: &str) -> BackendResult<Option<Profile>> {
        self.caller(token)?;
        Ok(self.state.lock().profiles.get(id).cloned())
    }

    async fn profile_role(&self, token: &str, id: &str) -> BackendResult<Option<Role>> {
        if self.fail_role_lookup.load(Ordering::SeqCst) { return Err(unavailable("profile_role")); }
        Ok(self.profile(token, id).await?.map(|p| p.role))
    }

    async fn list_profiles(&self, token: &str) -> BackendResult<Vec<Profile>> {
        self.list_profiles_calls.fetch_add(1, Ordering::SeqCst);
        self.caller(token)?;
        if self.fail_list_profiles.load(Ordering::SeqCst) { return Err(unavailable("list_profiles")); }
        // Read before any injected delay so a delayed response carries the older data.
        let (mut out, delay) = {
            let mut st = self.state.lock();
            let out: Vec<Profile> = st.profiles.values().cloned().collect();
            (out, st.list_delays.pop_front())
        };
        if let Some(d) = delay { tokio::time::sleep(d).await; }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    async fn get_user_emails(&self, token: &str) -> BackendResult<Vec<UserEmail>> {
        self.caller(token)?;
        if self.fail_emails.load(Ordering::SeqCst) { return Err(unavailable("get_user_emails")); }
        let st = self.state.lock();
        Ok(st.accounts.iter().map(|a| UserEmail { id: a.id.clone(), email: Some(a.email.clone()) }).collect())
    }

    async fn list_audit_logs(&self, token: &str, limit: usize) -> BackendResult<Vec<AuditLogEntry>> {
        self.audit_calls.fetch_add(1, Ordering::SeqCst);
        self.caller(token)?;
        if self.fail_audit.load(Ordering::SeqCst) { return Err(unavailable("audit_logs")); }
        let (all, delay) = {
            let mut st = self.state.lock();
            (st.audit.clone(), st.audit_delays.pop_front())
        };
        if let Some(d) = delay { tokio::time::sleep(d).await; }
        Ok(newest_first(all, limit))
    }

    async fn delete_profile(&self, token: &str, id: &str) -> BackendResult<()> {
        let actor = self.require_admin(token)?;
        if self.fail_mutations.load(Ordering::SeqCst) { return Err(unavailable("delete_profile")); }
        let removed = self.state.lock().profiles.remove(id);
        match removed {
            Some(old) => {
                self.record_change(AuditAction::Delete, Some(&actor), Some(&old), None);
                Ok(())
            }
            None => Err(BackendError::NotFound(format!("profile {}", id))),
        }
    }

    async fn delete_user(&self, token: &str, user_id: &str) -> BackendResult<()> {
        self.require_admin(token)?;
        if self.fail_mutations.load(Ordering::SeqCst) { return Err(unavailable("delete_user")); }
        let mut st = self.state.lock();
        st.accounts.retain(|a| a.id != user_id);
        st.tokens.retain(|_, uid| uid != user_id);
        Ok(())
    }

    async fn admin_update_profile(&self, token: &str, target_user_id: &str, new_name: &str, new_role: Role) -> BackendResult<()> {
        let actor = self.require_admin(token)?;
        if self.fail_mutations.load(Ordering::SeqCst) { return Err(unavailable("admin_update_profile")); }
        let (old, new) = {
            let mut st = self.state.lock();
            let Some(p) = st.profiles.get_mut(target_user_id) else {
                return Err(BackendError::NotFound(format!("profile {}", target_user_id)));
            };
            let old = p.clone();
            p.name = new_name.to_string();
            p.role = new_role;
            (old, p.clone())
        };
        self.record_change(AuditAction::Update, Some(&actor), Some(&old), Some(&new));
        Ok(())
    }

    async fn update_user_password(&self, token: &str, user_id: &str, new_password: &str) -> BackendResult<()> {
        self.require_admin(token)?;
        if self.fail_mutations.load(Ordering::SeqCst) { return Err(unavailable("update_user_password")); }
        let mut st = self.state.lock();
        match st.accounts.iter_mut().find(|a| a.id == user_id) {
            Some(a) => {
                a.password = new_password.to_string();
                Ok(())
            }
            None => Err(BackendError::NotFound(format!("user {}", user_id))),
        }
    }
}

#[async_trait]
impl ChangeFeed for MemoryBackend {
    async fn subscribe(&self, token: &str, table: &str) -> BackendResult<Subscription> {
        self.caller(token)?;
        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        let _ = tx.try_send(FeedEvent::Status(ConnectionStatus::Connecting));
        let _ = tx.try_send(FeedEvent::Status(ConnectionStatus::Connected));
        self.state.lock().subscribers.push((table.to_string(), tx));
        Ok(Subscription::new(rx, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> { s.parse().unwrap() }

    #[tokio::test]
    async fn full_subscriber_is_kept_and_closed_one_pruned() {
        let b = MemoryBackend::new();
        b.add_user("adm", "root@example.com", "secret1", "Root", Role::Admin, ts("2024-01-01T00:00:00Z"));
        let admin = b.issue_token("adm");
        let mut sub = b.subscribe(&admin, PROFILES_TABLE).await.unwrap();
        for _ in 0..(FEED_BUFFER * 2) {
            b.emit_change(PROFILES_TABLE, "UPDATE", json!({"id":"adm"}));
        }
        assert_eq!(b.subscriber_count(), 1);
        assert!(sub.recv().await.is_some());

        sub.close();
        b.emit_change(PROFILES_TABLE, "UPDATE", json!({"id":"adm"}));
        assert_eq!(b.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn sign_up_creates_profile_audits_and_notifies() {
        let b = MemoryBackend::new();
        b.add_user("adm", "root@example.com", "secret1", "Root", Role::Admin, ts("2024-01-01T00:00:00Z"));
        let admin = b.issue_token("adm");
        let mut sub = b.subscribe(&admin, PROFILES_TABLE).await.unwrap();
        assert_eq!(sub.recv().await, Some(FeedEvent::Status(ConnectionStatus::Connecting)));
        assert_eq!(sub.recv().await, Some(FeedEvent::Status(ConnectionStatus::Connected)));

        let out = b.sign_up("Ana", "ana@example.com", "secret1").await.unwrap();
        assert!(out.session.is_some());
        let p = b.profile_now(&out.principal.id).unwrap();
        assert_eq!(p.role, Role::User);

        match sub.recv().await {
            Some(FeedEvent::Change(n)) => {
                assert_eq!(n.event_type, "INSERT");
                assert_eq!(n.affected_table, PROFILES_TABLE);
            }
            other => panic!("expected change, got {:?}", other),
        }
        let logs = b.list_audit_logs(&admin, 50).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].action, AuditAction::Insert);
    }

    #[tokio::test]
    async fn admin_procedures_reject_non_admins() {
        let b = MemoryBackend::new();
        b.add_user("u1", "a@example.com", "pw1234", "A", Role::User, ts("2024-01-01T00:00:00Z"));
        let tok = b.issue_token("u1");
        let err = b.admin_update_profile(&tok, "u1", "A", Role::Admin).await.unwrap_err();
        assert!(matches!(err, BackendError::Status { status: 403, .. }));
        assert!(matches!(b.list_profiles("bogus").await, Err(BackendError::Unauthorized)));
    }

    #[tokio::test]
    async fn wrong_password_is_invalid_credentials() {
        let b = MemoryBackend::new();
        b.add_user("u1", "a@example.com", "pw1234", "A", Role::User, ts("2024-01-01T00:00:00Z"));
        let err = b.sign_in_with_password("a@example.com", "nope").await.unwrap_err();
        assert!(matches!(err, BackendError::InvalidCredentials(_)));
        assert!(b.sign_in_with_password("A@example.com", "pw1234").await.is_ok());
    }

    #[tokio::test]
    async fn closed_subscriptions_are_pruned() {
        let b = MemoryBackend::new();
        b.add_user("u1", "a@example.com", "pw1234", "A", Role::User, ts("2024-01-01T00:00:00Z"));
        let tok = b.issue_token("u1");
        let sub = b.subscribe(&tok, PROFILES_TABLE).await.unwrap();
        assert_eq!(b.subscriber_count(), 1);
        drop(sub);
        assert_eq!(b.subscriber_count(), 0);
    }
}
