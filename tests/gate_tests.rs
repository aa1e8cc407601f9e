use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{redirect, StatusCode};
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use adminpanel::backend::{Backend, MemoryBackend};
use adminpanel::files::FileServiceClient;
use adminpanel::identity::{Role, SESSION_COOKIE};
use adminpanel::server::{self, AppState};

fn ts(s: &str) -> DateTime<Utc> { s.parse().unwrap() }

fn seeded() -> Arc<MemoryBackend> {
    let mem = Arc::new(MemoryBackend::new());
    mem.add_user("adm", "root@example.com", "secret1", "Root", Role::Admin, ts("2024-01-01T00:00:00Z"));
    mem.add_user("ana", "ana@example.com", "secret2", "Ana", Role::User, ts("2024-02-01T00:00:00Z"));
    mem
}

// Start the server on an ephemeral localhost port. Abort the handle to stop it.
async fn start(mem: Arc<MemoryBackend>) -> (JoinHandle<()>, String) {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.expect("bind 127.0.0.1:0");
    let port = listener.local_addr().unwrap().port();
    let backend: Arc<dyn Backend> = mem;
    let state = AppState {
        backend,
        files: FileServiceClient::new("http://127.0.0.1:9").unwrap(),
        audit_limit: 50,
        reconnect_delay: Duration::from_millis(100),
        secure_cookie: false,
    };
    let handle = tokio::spawn(async move {
        if let Err(e) = server::serve(listener, state).await {
            eprintln!("server task error: {e:?}");
        }
    });
    (handle, format!("http://127.0.0.1:{}", port))
}

fn client() -> reqwest::Client {
    reqwest::Client::builder().redirect(redirect::Policy::none()).build().unwrap()
}

fn cookie(token: &str) -> String { format!("{}={}", SESSION_COOKIE, token) }

async fn get(base: &str, path: &str, token: Option<&str>) -> reqwest::Response {
    let mut req = client().get(format!("{}{}", base, path));
    if let Some(t) = token { req = req.header("cookie", cookie(t)); }
    req.send().await.unwrap()
}

fn location(resp: &reqwest::Response) -> Option<&str> {
    resp.headers().get("location").and_then(|v| v.to_str().ok())
}

fn session_token(resp: &reqwest::Response) -> Option<String> {
    let raw = resp.headers().get("set-cookie")?.to_str().ok()?;
    let first = raw.split(';').next()?;
    let (k, v) = first.split_once('=')?;
    (k == SESSION_COOKIE).then(|| v.to_string())
}

#[tokio::test]
async fn anonymous_visitor_is_sent_to_login() {
    let (h, base) = start(seeded()).await;
    for path in ["/admin", "/admin/users", "/user", "/user/files"] {
        let resp = get(&base, path, None).await;
        assert_eq!(resp.status(), StatusCode::TEMPORARY_REDIRECT, "path {}", path);
        assert_eq!(location(&resp), Some("/"), "path {}", path);
    }
    let resp = get(&base, "/", None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["page"], "login");
    h.abort();
}

#[tokio::test]
async fn lookalike_prefixes_and_static_assets_are_not_gated() {
    let (h, base) = start(seeded()).await;
    assert_eq!(get(&base, "/administrator", None).await.status(), StatusCode::NOT_FOUND);
    assert_eq!(get(&base, "/users", None).await.status(), StatusCode::NOT_FOUND);
    assert_eq!(get(&base, "/static/app.css", None).await.status(), StatusCode::NOT_FOUND);
    h.abort();
}

#[tokio::test]
async fn image_like_admin_paths_still_redirect_anonymous_callers() {
    let (h, base) = start(seeded()).await;
    let resp = client().delete(format!("{}/admin/users/x.png", base)).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(location(&resp), Some("/"));
    let resp = client()
        .put(format!("{}/admin/users/x.png", base))
        .json(&json!({"name":"X","role":"admin"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(location(&resp), Some("/"));
    assert_eq!(location(&get(&base, "/user/avatar.jpg", None).await), Some("/"));
    h.abort();
}

#[tokio::test]
async fn roles_are_routed_to_their_own_area() {
    let mem = seeded();
    let admin = mem.issue_token("adm");
    let user = mem.issue_token("ana");
    let (h, base) = start(mem).await;

    let resp = get(&base, "/user", Some(&admin)).await;
    assert_eq!(location(&resp), Some("/admin"));
    let resp = get(&base, "/admin/users", Some(&user)).await;
    assert_eq!(location(&resp), Some("/user"));
    let resp = get(&base, "/", Some(&admin)).await;
    assert_eq!(location(&resp), Some("/admin"));
    let resp = get(&base, "/", Some(&user)).await;
    assert_eq!(location(&resp), Some("/user"));

    let body: Value = get(&base, "/admin", Some(&admin)).await.json().await.unwrap();
    assert_eq!(body["welcome"], "Bienvenido Administrador, Root");
    let body: Value = get(&base, "/user", Some(&user)).await.json().await.unwrap();
    assert_eq!(body["welcome"], "Bienvenido, Ana");
    h.abort();
}

#[tokio::test]
async fn failed_role_lookup_fails_closed_but_login_renders() {
    let mem = seeded();
    let admin = mem.issue_token("adm");
    mem.fail_role_lookup.store(true, Ordering::SeqCst);
    let (h, base) = start(mem).await;

    let resp = get(&base, "/admin", Some(&admin)).await;
    assert_eq!(resp.status(), StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(location(&resp), Some("/"));
    let resp = get(&base, "/", Some(&admin)).await;
    assert_eq!(resp.status(), StatusCode::OK);
    h.abort();
}

#[tokio::test]
async fn identity_without_profile_never_reaches_protected_pages() {
    let mem = seeded();
    mem.add_account_without_profile("ghost", "ghost@example.com", "secret3");
    let ghost = mem.issue_token("ghost");
    let (h, base) = start(mem.clone()).await;

    assert_eq!(location(&get(&base, "/user", Some(&ghost)).await), Some("/"));
    assert_eq!(location(&get(&base, "/admin", Some(&ghost)).await), Some("/"));
    assert_eq!(get(&base, "/", Some(&ghost)).await.status(), StatusCode::OK);
    // the gate never creates a profile
    assert!(mem.profile_now("ghost").is_none());
    h.abort();
}

#[tokio::test]
async fn unknown_cookie_is_treated_as_anonymous() {
    let (h, base) = start(seeded()).await;
    let resp = get(&base, "/user", Some("forged-token")).await;
    assert_eq!(location(&resp), Some("/"));
    assert_eq!(get(&base, "/", Some("forged-token")).await.status(), StatusCode::OK);
    h.abort();
}

#[tokio::test]
async fn login_sets_cookie_and_bad_credentials_stay_on_form() {
    let (h, base) = start(seeded()).await;
    let resp = client()
        .post(format!("{}/login", base))
        .json(&json!({"email":"root@example.com","password":"wrong"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("Invalid login credentials"));

    let resp = client()
        .post(format!("{}/login", base))
        .json(&json!({"email":"root@example.com","password":"secret1"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let token = session_token(&resp).expect("session cookie");
    let resp = get(&base, "/", Some(&token)).await;
    assert_eq!(location(&resp), Some("/admin"));
    h.abort();
}

#[tokio::test]
async fn register_validates_and_honours_email_confirmation() {
    let mem = seeded();
    let (h, base) = start(mem.clone()).await;

    let resp = client()
        .post(format!("{}/register", base))
        .json(&json!({"name":"Bea","email":"bea@example.com","password":"12345"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    mem.require_email_confirmation.store(true, Ordering::SeqCst);
    let resp = client()
        .post(format!("{}/register", base))
        .json(&json!({"name":"Bea","email":"bea@example.com","password":"123456"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(session_token(&resp).is_none());
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["message"], "Revisa tu correo para confirmar tu cuenta");

    mem.require_email_confirmation.store(false, Ordering::SeqCst);
    let resp = client()
        .post(format!("{}/register", base))
        .json(&json!({"name":"Carla","email":"carla@example.com","password":"123456"}))
        .send()
        .await
        .unwrap();
    let token = session_token(&resp).expect("session cookie");
    let body: Value = get(&base, "/user", Some(&token)).await.json().await.unwrap();
    assert_eq!(body["welcome"], "Bienvenido, Carla");
    h.abort();
}

#[tokio::test]
async fn logout_revokes_the_session() {
    let mem = seeded();
    let user = mem.issue_token("ana");
    let (h, base) = start(mem).await;
    let resp = client().post(format!("{}/logout", base)).header("cookie", cookie(&user)).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let set = resp.headers().get("set-cookie").unwrap().to_str().unwrap().to_string();
    assert!(set.contains("Expires=Thu, 01 Jan 1970"));
    assert_eq!(location(&get(&base, "/user", Some(&user)).await), Some("/"));
    h.abort();
}

#[tokio::test]
async fn admin_edits_and_deletes_users_with_audit_trail() {
    let mem = seeded();
    let admin = mem.issue_token("adm");
    let (h, base) = start(mem.clone()).await;

    let users: Value = get(&base, "/admin/users", Some(&admin)).await.json().await.unwrap();
    let ids: Vec<&str> = users.as_array().unwrap().iter().map(|u| u["id"].as_str().unwrap()).collect();
    assert_eq!(ids, vec!["ana", "adm"]);
    assert_eq!(users[0]["email"], "ana@example.com");

    let resp = client()
        .put(format!("{}/admin/users/ana", base))
        .header("cookie", cookie(&admin))
        .json(&json!({"name":"Ana María","role":"user"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "saved");

    let resp = client()
        .put(format!("{}/admin/users/ana", base))
        .header("cookie", cookie(&admin))
        .json(&json!({"name":"   ","role":"user"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let rows: Value = get(&base, "/admin/audit?limit=10", Some(&admin)).await.json().await.unwrap();
    assert_eq!(rows[0]["action"], "Actualizado");
    assert_eq!(rows[0]["affected_user"], "Ana María");
    assert_eq!(rows[0]["changed_by"], "Root");

    let resp = client().delete(format!("{}/admin/users/ana", base)).header("cookie", cookie(&admin)).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(mem.profile_now("ana").is_none());
    h.abort();
}

#[tokio::test]
async fn failed_delete_reports_error_and_user_cannot_reach_admin_api() {
    let mem = seeded();
    let admin = mem.issue_token("adm");
    let user = mem.issue_token("ana");
    let (h, base) = start(mem.clone()).await;

    let resp = client().delete(format!("{}/admin/users/adm", base)).header("cookie", cookie(&user)).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::TEMPORARY_REDIRECT);
    assert!(mem.profile_now("adm").is_some());

    mem.fail_mutations.store(true, Ordering::SeqCst);
    let resp = client().delete(format!("{}/admin/users/ana", base)).header("cookie", cookie(&admin)).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "delete_failed");
    assert!(mem.profile_now("ana").is_some());
    h.abort();
}
