//! Managed backend collaborators: authentication, the row-secured data store with its
//! remote procedures, and the realtime change feed.
//!
//! The traits are the seam the gate and the reconciliation view are written against.
//! `RestBackend` talks to the hosted backend over HTTP/WebSocket; `MemoryBackend`
//! is an in-process stand-in with failure injection.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::audit::AuditLogEntry;
use crate::identity::{Principal, Profile, Role};

pub mod memory;
pub mod realtime;
pub mod rest;

pub use memory::MemoryBackend;
pub use rest::RestBackend;

/// Table whose changes drive the admin user list.
pub const PROFILES_TABLE: &str = "profiles";
pub const AUDIT_TABLE: &str = "audit_logs";

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("transport error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("websocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("backend returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Tokens returned by a successful password sign-in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSession {
    pub access_token: String,
    pub principal: Principal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignUpOutcome {
    pub principal: Principal,
    /// `None` when the backend requires email confirmation before issuing a session.
    pub session: Option<AuthSession>,
}

/// Row returned by the `get_user_emails` procedure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserEmail {
    pub id: String,
    pub email: Option<String>,
}

/// Push event meaning "a row changed"; carries no authority, only a reason to re-fetch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeNotification {
    pub event_type: String,
    pub affected_table: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Status(ConnectionStatus),
    Change(ChangeNotification),
}

/// An open change-notification channel. Dropping or closing it tears the transport down.
pub struct Subscription {
    rx: mpsc::Receiver<FeedEvent>,
    transport: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(rx: mpsc::Receiver<FeedEvent>, transport: Option<JoinHandle<()>>) -> Self {
        Self { rx, transport }
    }

    pub async fn recv(&mut self) -> Option<FeedEvent> { self.rx.recv().await }

    pub fn close(&mut self) {
        self.rx.close();
        if let Some(h) = self.transport.take() { h.abort(); }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) { self.close(); }
}

#[async_trait]
pub trait AuthBackend: Send + Sync {
    /// Resolve an access token to its principal.
    async fn get_user(&self, token: &str) -> BackendResult<Principal>;
    async fn sign_in_with_password(&self, email: &str, password: &str) -> BackendResult<AuthSession>;
    /// Registers the identity; the backend creates the profile from `name`.
    async fn sign_up(&self, name: &str, email: &str, password: &str) -> BackendResult<SignUpOutcome>;
    async fn sign_out(&self, token: &str) -> BackendResult<()>;
}

/// Row-secured store access. Every call runs with the caller's access token.
#[async_trait]
pub trait DataBackend: Send + Sync {
    async fn profile(&self, token: &str, id: &str) -> BackendResult<Option<Profile>>;

    async fn profile_role(&self, token: &str, id: &str) -> BackendResult<Option<Role>> {
        Ok(self.profile(token, id).await?.map(|p| p.role))
    }

    /// All profiles, newest `created_at` first.
    async fn list_profiles(&self, token: &str) -> BackendResult<Vec<Profile>>;
    async fn get_user_emails(&self, token: &str) -> BackendResult<Vec<UserEmail>>;
    /// Newest `changed_at` first, at most `limit`.
    async fn list_audit_logs(&self, token: &str, limit: usize) -> BackendResult<Vec<AuditLogEntry>>;
    async fn delete_profile(&self, token: &str, id: &str) -> BackendResult<()>;
    async fn delete_user(&self, token: &str, user_id: &str) -> BackendResult<()>;
    async fn admin_update_profile(&self, token: &str, target_user_id: &str, new_name: &str, new_role: Role) -> BackendResult<()>;
    async fn update_user_password(&self, token: &str, user_id: &str, new_password: &str) -> BackendResult<()>;
}

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Open one channel delivering every change on `table`.
    async fn subscribe(&self, token: &str, table: &str) -> BackendResult<Subscription>;
}

pub trait Backend: AuthBackend + DataBackend + ChangeFeed {
    fn as_data(&self) -> &dyn DataBackend;
    fn as_feed(&self) -> &dyn ChangeFeed;
}

impl<T: AuthBackend + DataBackend + ChangeFeed> Backend for T {
    fn as_data(&self) -> &dyn DataBackend { self }
    fn as_feed(&self) -> &dyn ChangeFeed { self }
}
