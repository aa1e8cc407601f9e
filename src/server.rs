//!
//! adminpanel HTTP/WS server
//! -------------------------
//! Axum router for the admin panel. Every route sits behind the session gate, which
//! runs as a middleware layer and either redirects the request or attaches a
//! `RequestContext` for the handlers below.
//!
//! Responsibilities:
//! - Login, registration and logout against the auth backend (cookie carries the access token).
//! - Role landing pages for `/admin` and `/user`.
//! - Admin user management: list, edit, delete, audit log, and the live user list socket.
//! - File listing and upload proxying to the external file service, plus live refresh sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post, put};
use axum::{Extension, Json, Router};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::audit::AuditLogEntry;
use crate::backend::realtime::RealtimeOptions;
use crate::backend::{Backend, BackendError, MemoryBackend, RestBackend};
use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::files::{FileServiceClient, UploadWatcher};
use crate::identity::{
    authorize, clear_session_cookie, is_gated_path, parse_cookie, session_cookie, Decision, Principal, RequestContext,
    Role, Session, LOGIN_PATH, SESSION_COOKIE,
};
use crate::reconcile::{self, UserEdit, UserListView};

pub const MIN_PASSWORD_LEN: usize = 6;
pub const CONFIRM_EMAIL_MESSAGE: &str = "Revisa tu correo para confirmar tu cuenta";

const DEFAULT_ADMIN_EMAIL: &str = "admin@localhost";
const DEFAULT_ADMIN_PASSWORD: &str = "admin123";

/// Shared server state injected into all handlers and the gate.
#[derive(Clone)]
pub struct AppState {
    pub backend: Arc<dyn Backend>,
    pub files: FileServiceClient,
    pub audit_limit: usize,
    pub reconnect_delay: Duration,
    pub secure_cookie: bool,
}

impl AppState {
    pub fn new(config: &AppConfig, backend: Arc<dyn Backend>) -> anyhow::Result<Self> {
        let files = FileServiceClient::new(&config.files_url)?;
        Ok(Self {
            backend,
            files,
            audit_limit: config.audit_limit,
            reconnect_delay: config.reconnect_delay,
            secure_cookie: config.secure_cookie,
        })
    }
}

/// In-process backend with one admin account, so a `memory:` run can be logged into.
fn seeded_memory_backend() -> MemoryBackend {
    let mem = MemoryBackend::new();
    mem.add_user("admin", DEFAULT_ADMIN_EMAIL, DEFAULT_ADMIN_PASSWORD, "Administrador", Role::Admin, Utc::now());
    warn!(target: "startup", "in-memory backend: default admin '{}' created; do not use in production", DEFAULT_ADMIN_EMAIL);
    mem
}

pub fn build_backend(config: &AppConfig) -> anyhow::Result<Arc<dyn Backend>> {
    if config.is_memory_backend() {
        return Ok(Arc::new(seeded_memory_backend()));
    }
    let realtime = RealtimeOptions { reconnect_delay: config.reconnect_delay, ..RealtimeOptions::default() };
    Ok(Arc::new(RestBackend::new(&config.backend_url, &config.backend_key, realtime)?))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(login_page))
        .route("/login", post(login))
        .route("/register", post(register))
        .route("/logout", post(logout))
        .route("/admin", get(admin_home))
        .route("/admin/users", get(list_users))
        .route("/admin/users/live", get(live_users))
        .route("/admin/users/{id}", put(save_user).delete(delete_user))
        .route("/admin/audit", get(audit_log))
        .route("/admin/files", get(all_files))
        .route("/admin/files/live", get(live_all_files))
        .route("/admin/upload", post(upload))
        .route("/user", get(user_home))
        .route("/user/files", get(my_files))
        .route("/user/files/live", get(live_my_files))
        .route("/user/upload", post(upload))
        .layer(middleware::from_fn_with_state(state.clone(), session_gate))
        .with_state(state)
}

/// Serve on an already bound listener.
pub async fn serve(listener: tokio::net::TcpListener, state: AppState) -> anyhow::Result<()> {
    axum::serve(listener, router(state)).await?;
    Ok(())
}

pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    let backend = build_backend(&config)?;
    let state = AppState::new(&config, backend)?;
    let addr: SocketAddr = format!("0.0.0.0:{}", config.http_port).parse()?;
    info!(target: "startup", "Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    serve(listener, state).await
}

/// Resolve the cookie token to a session. A token the backend rejects counts as no session.
async fn resolve_session(state: &AppState, headers: &HeaderMap) -> Option<Session> {
    let token = parse_cookie(headers, SESSION_COOKIE)?;
    match state.backend.get_user(&token).await {
        Ok(principal) => Some(Session { token, principal }),
        Err(e) => {
            debug!(target: "gate", "session token not accepted: {}", e);
            None
        }
    }
}

async fn session_gate(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let path = req.uri().path().to_string();
    if !is_gated_path(&path) {
        return next.run(req).await;
    }
    let session = resolve_session(&state, req.headers()).await;
    let (decision, role) = authorize(&path, session.as_ref(), state.backend.as_data()).await;
    match decision {
        Decision::Redirect(to) => {
            info!(target: "gate", path = %path, to, "redirect");
            Redirect::temporary(to).into_response()
        }
        Decision::Allow => {
            let ctx = match session {
                Some(s) => RequestContext { principal: Some(s.principal), role, token: Some(s.token) },
                None => RequestContext::anonymous(),
            };
            req.extensions_mut().insert(ctx);
            next.run(req).await
        }
    }
}

fn signed_in(ctx: &RequestContext) -> AppResult<(&str, &Principal)> {
    match (ctx.token.as_deref(), ctx.principal.as_ref()) {
        (Some(token), Some(p)) => Ok((token, p)),
        _ => Err(AppError::auth("not_signed_in", "Sesión no iniciada")),
    }
}

/// Session plus the admin role carried in the request context.
fn signed_in_admin(ctx: &RequestContext) -> AppResult<(&str, &Principal)> {
    let signed = signed_in(ctx)?;
    if !ctx.is_admin() {
        return Err(AppError::forbidden("admin_required", "Se requiere rol de administrador"));
    }
    Ok(signed)
}

#[derive(Debug, Deserialize)]
struct LoginPayload {
    email: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct RegisterPayload {
    name: String,
    email: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct AuditQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct UploadQuery {
    filename: Option<String>,
}

/// Client commands on the live user list socket.
#[derive(Debug, Deserialize)]
struct LiveCommand {
    audit: bool,
}

async fn login_page(Extension(ctx): Extension<RequestContext>) -> impl IntoResponse {
    Json(json!({
        "page": "login",
        "signed_in": ctx.principal.is_some(),
        "actions": { "login": "/login", "register": "/register" },
    }))
}

fn cookie_headers(state: &AppState, token: &str) -> AppResult<HeaderMap> {
    let cookie = session_cookie(token, state.secure_cookie)
        .ok_or_else(|| AppError::internal("bad_token", "El token de sesión no es válido para una cookie"))?;
    let mut headers = HeaderMap::new();
    headers.insert("Set-Cookie", cookie);
    Ok(headers)
}

async fn login(State(state): State<AppState>, Json(payload): Json<LoginPayload>) -> Response {
    match state.backend.sign_in_with_password(payload.email.trim(), &payload.password).await {
        Ok(session) => {
            info!(target: "auth", user_id = %session.principal.id, "signed in");
            match cookie_headers(&state, &session.access_token) {
                Ok(headers) => (StatusCode::OK, headers, Json(json!({"status":"ok","redirect": LOGIN_PATH}))).into_response(),
                Err(e) => e.into_response(),
            }
        }
        Err(e) => {
            let message = match e {
                BackendError::InvalidCredentials(msg) => msg,
                other => {
                    error!(target: "auth", "login error: {}", other);
                    other.to_string()
                }
            };
            (StatusCode::UNAUTHORIZED, Json(json!({"status":"error","error": message}))).into_response()
        }
    }
}

async fn register(State(state): State<AppState>, Json(payload): Json<RegisterPayload>) -> AppResult<Response> {
    let name = payload.name.trim();
    let email = payload.email.trim();
    if name.is_empty() || email.is_empty() {
        return Err(AppError::user("missing_fields", "Nombre y correo son obligatorios"));
    }
    if payload.password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AppError::user("weak_password", "La contraseña debe tener al menos 6 caracteres"));
    }
    let outcome = state.backend.sign_up(name, email, &payload.password).await.map_err(|e| {
        warn!(target: "auth", "sign up failed: {}", e);
        let msg = e.to_string();
        AppError::user("register_failed", msg.as_str())
    })?;
    info!(target: "auth", user_id = %outcome.principal.id, "registered");
    match outcome.session {
        None => Ok(Json(json!({"status":"ok","message": CONFIRM_EMAIL_MESSAGE})).into_response()),
        Some(session) => {
            let headers = cookie_headers(&state, &session.access_token)?;
            Ok((StatusCode::OK, headers, Json(json!({"status":"ok","redirect": LOGIN_PATH}))).into_response())
        }
    }
}

async fn logout(State(state): State<AppState>, Extension(ctx): Extension<RequestContext>, headers: HeaderMap) -> impl IntoResponse {
    // a token the backend already rejected never reaches the context; still ask it to revoke
    let token = ctx.token.or_else(|| parse_cookie(&headers, SESSION_COOKIE));
    if let Some(token) = token {
        if let Err(e) = state.backend.sign_out(&token).await {
            warn!(target: "auth", "sign out failed: {}", e);
        }
    }
    let mut h = HeaderMap::new();
    h.insert("Set-Cookie", clear_session_cookie());
    (StatusCode::OK, h, Json(json!({"status":"ok","redirect": LOGIN_PATH})))
}

/// Display name for the welcome line: the profile name, else the email.
async fn display_name(state: &AppState, token: &str, principal: &Principal) -> String {
    match state.backend.profile(token, &principal.id).await {
        Ok(Some(p)) if !p.name.trim().is_empty() => p.name,
        Ok(_) => principal.email.clone(),
        Err(e) => {
            warn!(target: "gate", user_id = %principal.id, "profile load failed: {}", e);
            principal.email.clone()
        }
    }
}

async fn admin_home(State(state): State<AppState>, Extension(ctx): Extension<RequestContext>) -> AppResult<Json<serde_json::Value>> {
    let (token, principal) = signed_in_admin(&ctx)?;
    let name = display_name(&state, token, principal).await;
    Ok(Json(json!({"welcome": format!("Bienvenido Administrador, {}", name), "role": Role::Admin})))
}

async fn user_home(State(state): State<AppState>, Extension(ctx): Extension<RequestContext>) -> AppResult<Json<serde_json::Value>> {
    let (token, principal) = signed_in(&ctx)?;
    let name = display_name(&state, token, principal).await;
    Ok(Json(json!({"welcome": format!("Bienvenido, {}", name), "role": Role::User})))
}

async fn list_users(State(state): State<AppState>, Extension(ctx): Extension<RequestContext>) -> AppResult<impl IntoResponse> {
    let (token, _) = signed_in_admin(&ctx)?;
    let users = reconcile::fetch_users(state.backend.as_data(), token).await?;
    Ok(Json(users))
}

async fn save_user(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
    Json(edit): Json<UserEdit>,
) -> AppResult<impl IntoResponse> {
    let (token, _) = signed_in_admin(&ctx)?;
    let outcome = reconcile::save_user(state.backend.as_data(), token, &id, &edit).await?;
    Ok(Json(outcome))
}

async fn delete_user(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let (token, _) = signed_in_admin(&ctx)?;
    reconcile::delete_user(state.backend.as_data(), token, &id).await?;
    Ok(Json(json!({"status":"ok"})))
}

async fn audit_log(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Query(q): Query<AuditQuery>,
) -> AppResult<impl IntoResponse> {
    let (token, _) = signed_in_admin(&ctx)?;
    let limit = q.limit.filter(|l| *l > 0).unwrap_or(state.audit_limit);
    let entries = reconcile::fetch_audit(state.backend.as_data(), token, limit).await?;
    let rows: Vec<_> = entries.iter().map(AuditLogEntry::render).collect();
    Ok(Json(rows))
}

async fn live_users(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    ws: WebSocketUpgrade,
) -> AppResult<Response> {
    let (token, _) = signed_in_admin(&ctx)?;
    let view = UserListView::new(Arc::clone(&state.backend), token, state.audit_limit);
    Ok(ws.on_upgrade(move |socket| live_users_session(socket, view)))
}

fn text(v: serde_json::Value) -> Message { Message::Text(v.to_string().into()) }

/// One mounted user list for the lifetime of the socket.
async fn live_users_session(socket: WebSocket, view: Arc<UserListView>) {
    let (mut sender, mut receiver) = socket.split();
    let mounted = match view.mount().await {
        Ok(m) => m,
        Err(e) => {
            error!(target: "reconcile", "could not open change feed: {}", e);
            let err = AppError::from(e);
            let _ = sender.send(text(json!({"status":"error","code": err.code_str(),"message": err.message()}))).await;
            let _ = sender.close().await;
            return;
        }
    };
    let mut changes = view.watch();
    if sender.send(text(json!(view.snapshot()))).await.is_err() {
        return;
    }
    loop {
        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() { break; }
                if sender.send(text(json!(view.snapshot()))).await.is_err() { break; }
            }
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(t))) => match serde_json::from_str::<LiveCommand>(t.as_str()) {
                    Ok(cmd) => view.set_audit_visible(cmd.audit).await,
                    Err(e) => {
                        let _ = sender.send(text(json!({"status":"error","code":"bad_command","message": e.to_string()}))).await;
                    }
                },
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            }
        }
    }
    mounted.unmount();
}

async fn my_files(State(state): State<AppState>, Extension(ctx): Extension<RequestContext>) -> AppResult<impl IntoResponse> {
    let (_, principal) = signed_in(&ctx)?;
    Ok(Json(state.files.list_for_user(&principal.id).await?))
}

async fn all_files(State(state): State<AppState>, Extension(ctx): Extension<RequestContext>) -> AppResult<impl IntoResponse> {
    signed_in_admin(&ctx)?;
    Ok(Json(state.files.list_all().await?))
}

async fn upload(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Query(q): Query<UploadQuery>,
    body: Bytes,
) -> AppResult<impl IntoResponse> {
    let (_, principal) = signed_in(&ctx)?;
    let filename = q.filename.as_deref().map(str::trim).filter(|f| !f.is_empty());
    let Some(filename) = filename else {
        return Err(AppError::user("missing_filename", "Falta el nombre del archivo"));
    };
    if body.is_empty() {
        return Err(AppError::user("empty_file", "Selecciona un archivo"));
    }
    let result = state.files.upload(&principal.id, filename, body.to_vec()).await.map_err(|e| {
        error!(target: "files", "Upload failed: {}", e);
        let msg = match &e {
            BackendError::Status { message, .. } => message.clone(),
            other => other.to_string(),
        };
        AppError::upstream("upload_failed".to_string(), msg)
    })?;
    Ok(Json(json!({"status":"ok","result": result})))
}

async fn live_my_files(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    ws: WebSocketUpgrade,
) -> AppResult<Response> {
    let (_, principal) = signed_in(&ctx)?;
    let owner = Some(principal.id.clone());
    Ok(ws.on_upgrade(move |socket| live_files_session(socket, state, owner)))
}

async fn live_all_files(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    ws: WebSocketUpgrade,
) -> AppResult<Response> {
    signed_in_admin(&ctx)?;
    Ok(ws.on_upgrade(move |socket| live_files_session(socket, state, None)))
}

async fn push_file_list(state: &AppState, owner: Option<&str>) -> serde_json::Value {
    let listed = match owner {
        Some(id) => state.files.list_for_user(id).await,
        None => state.files.list_all().await,
    };
    match listed {
        Ok(files) => json!({"status":"ok","files": files}),
        Err(e) => {
            error!(target: "files", "Error fetching files: {}", e);
            json!({"status":"error","code":"files_unavailable","message": e.to_string()})
        }
    }
}

/// Push the file list on connect and again whenever the file service announces an upload.
async fn live_files_session(socket: WebSocket, state: AppState, owner: Option<String>) {
    let (mut sender, mut receiver) = socket.split();
    let events = match state.files.events_url() {
        Ok(u) => u,
        Err(e) => {
            error!(target: "files", "{}", e);
            return;
        }
    };
    let (notify, mut refresh) = mpsc::channel::<()>(8);
    let watcher = UploadWatcher::spawn(events, state.reconnect_delay, move || {
        let _ = notify.try_send(());
    });
    if sender.send(text(push_file_list(&state, owner.as_deref()).await)).await.is_err() {
        watcher.stop().await;
        return;
    }
    loop {
        tokio::select! {
            Some(()) = refresh.recv() => {
                if sender.send(text(push_file_list(&state, owner.as_deref()).await)).await.is_err() { break; }
            }
            msg = receiver.next() => match msg {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            }
        }
    }
    watcher.stop().await;
}
