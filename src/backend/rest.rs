//! HTTP client for the hosted backend: the auth API, the row-secured REST interface
//! for tables and remote procedures, and the realtime socket for change feeds.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Response, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::debug;

use super::realtime::{self, RealtimeOptions};
use super::{
    AuthBackend, AuthSession, BackendError, BackendResult, ChangeFeed, DataBackend, SignUpOutcome, Subscription,
    UserEmail, AUDIT_TABLE, PROFILES_TABLE,
};
use crate::audit::AuditLogEntry;
use crate::identity::{Principal, Profile, Role};

#[derive(Debug, Deserialize)]
struct RawUser {
    id: String,
    #[serde(default)]
    email: Option<String>,
}

impl From<RawUser> for Principal {
    fn from(u: RawUser) -> Self { Principal::new(u.id, u.email.unwrap_or_default()) }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    user: RawUser,
}

#[derive(Clone)]
pub struct RestBackend {
    base: Url,
    anon_key: String,
    client: reqwest::Client,
    realtime: RealtimeOptions,
}

impl RestBackend {
    pub fn new(base: &str, anon_key: &str, realtime: RealtimeOptions) -> BackendResult<Self> {
        let base = Url::parse(base).map_err(|e| BackendError::Config(format!("invalid backend url '{}': {}", base, e)))?;
        let client = reqwest::Client::builder().build()?;
        Ok(Self { base, anon_key: anon_key.to_string(), client, realtime })
    }

    fn url(&self, path: &str) -> BackendResult<Url> {
        self.base.join(path).map_err(|e| BackendError::Config(format!("bad path {}: {}", path, e)))
    }

    fn headers(&self, token: Option<&str>) -> BackendResult<HeaderMap> {
        let mut h = HeaderMap::new();
        let key = HeaderValue::from_str(&self.anon_key).map_err(|_| BackendError::Config("anon key is not a valid header".into()))?;
        h.insert("apikey", key);
        let bearer = format!("Bearer {}", token.unwrap_or(&self.anon_key));
        h.insert(AUTHORIZATION, HeaderValue::from_str(&bearer).map_err(|_| BackendError::Unauthorized)?);
        Ok(h)
    }

    async fn check(resp: Response) -> BackendResult<Response> {
        let status = resp.status();
        if status.is_success() { return Ok(resp); }
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        let message = ["error_description", "msg", "message", "error"]
            .iter()
            .find_map(|k| body.get(*k).and_then(|v| v.as_str()))
            .map(str::to_string)
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("error").to_string());
        Err(match status {
            StatusCode::UNAUTHORIZED => BackendError::Unauthorized,
            StatusCode::NOT_FOUND => BackendError::NotFound(message),
            _ => BackendError::Status { status: status.as_u16(), message },
        })
    }

    async fn select<T: for<'de> Deserialize<'de>>(&self, token: &str, table: &str, query: &str) -> BackendResult<Vec<T>> {
        let url = self.url(&format!("rest/v1/{}?{}", table, query))?;
        let resp = self.client.get(url).headers(self.headers(Some(token))?).send().await?;
        let resp = Self::check(resp).await?;
        Ok(resp.json::<Vec<T>>().await?)
    }

    async fn rpc(&self, token: &str, name: &str, args: Value) -> BackendResult<Value> {
        let url = self.url(&format!("rest/v1/rpc/{}", name))?;
        debug!(target: "backend", rpc = name, "calling remote procedure");
        let resp = self.client.post(url).headers(self.headers(Some(token))?).json(&args).send().await?;
        let resp = Self::check(resp).await?;
        let text = resp.text().await?;
        if text.trim().is_empty() { return Ok(Value::Null); }
        Ok(serde_json::from_str(&text)?)
    }
}

#[async_trait]
impl AuthBackend for RestBackend {
    async fn get_user(&self, token: &str) -> BackendResult<Principal> {
        let url = self.url("auth/v1/user")?;
        let resp = self.client.get(url).headers(self.headers(Some(token))?).send().await?;
        let resp = Self::check(resp).await.map_err(|e| match e {
            BackendError::Status { status: 403, .. } => BackendError::Unauthorized,
            other => other,
        })?;
        Ok(resp.json::<RawUser>().await?.into())
    }

    async fn sign_in_with_password(&self, email: &str, password: &str) -> BackendResult<AuthSession> {
        let url = self.url("auth/v1/token?grant_type=password")?;
        let resp = self
            .client
            .post(url)
            .headers(self.headers(None)?)
            .json(&json!({ "email": email, "password": password }))
            .send()
            .await?;
        let resp = Self::check(resp).await.map_err(|e| match e {
            BackendError::Status { status: 400, message } => BackendError::InvalidCredentials(message),
            other => other,
        })?;
        let t: TokenResponse = resp.json().await?;
        Ok(AuthSession { access_token: t.access_token, principal: t.user.into() })
    }

    async fn sign_up(&self, name: &str, email: &str, password: &str) -> BackendResult<SignUpOutcome> {
        let url = self.url("auth/v1/signup")?;
        let resp = self
            .client
            .post(url)
            .headers(self.headers(None)?)
            .json(&json!({ "email": email, "password": password, "data": { "name": name } }))
            .send()
            .await?;
        let v: Value = Self::check(resp).await?.json().await?;
        // With email confirmation enabled the response is the bare user object.
        if v.get("access_token").is_some() {
            let t: TokenResponse = serde_json::from_value(v)?;
            let principal: Principal = t.user.into();
            let session = AuthSession { access_token: t.access_token, principal: principal.clone() };
            return Ok(SignUpOutcome { principal, session: Some(session) });
        }
        let user = v.get("user").cloned().unwrap_or(v);
        let principal: Principal = serde_json::from_value::<RawUser>(user)?.into();
        Ok(SignUpOutcome { principal, session: None })
    }

    async fn sign_out(&self, token: &str) -> BackendResult<()> {
        let url = self.url("auth/v1/logout")?;
        let resp = self.client.post(url).headers(self.headers(Some(token))?).send().await?;
        Self::check(resp).await?;
        Ok(())
    }
}

#[async_trait]
impl DataBackend for RestBackend {
    async fn profile(&self, token: &str, id: &str) -> BackendResult<Option<Profile>> {
        let q = format!("select=*&id=eq.{}", urlencoding::encode(id));
        Ok(self.select::<Profile>(token, PROFILES_TABLE, &q).await?.into_iter().next())
    }

    async fn profile_role(&self, token: &str, id: &str) -> BackendResult<Option<Role>> {
        #[derive(Deserialize)]
        struct RoleOnly { role: Role }
        let q = format!("select=role&id=eq.{}", urlencoding::encode(id));
        Ok(self.select::<RoleOnly>(token, PROFILES_TABLE, &q).await?.into_iter().next().map(|r| r.role))
    }

    async fn list_profiles(&self, token: &str) -> BackendResult<Vec<Profile>> {
        self.select(token, PROFILES_TABLE, "select=*&order=created_at.desc").await
    }

    async fn get_user_emails(&self, token: &str) -> BackendResult<Vec<UserEmail>> {
        let v = self.rpc(token, "get_user_emails", json!({})).await?;
        if v.is_null() { return Ok(Vec::new()); }
        Ok(serde_json::from_value(v)?)
    }

    async fn list_audit_logs(&self, token: &str, limit: usize) -> BackendResult<Vec<AuditLogEntry>> {
        let q = format!("select=*&order=changed_at.desc&limit={}", limit);
        self.select(token, AUDIT_TABLE, &q).await
    }

    async fn delete_profile(&self, token: &str, id: &str) -> BackendResult<()> {
        let url = self.url(&format!("rest/v1/{}?id=eq.{}", PROFILES_TABLE, urlencoding::encode(id)))?;
        let resp = self.client.delete(url).headers(self.headers(Some(token))?).send().await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn delete_user(&self, token: &str, user_id: &str) -> BackendResult<()> {
        self.rpc(token, "delete_user", json!({ "user_id": user_id })).await?;
        Ok(())
    }

    async fn admin_update_profile(&self, token: &str, target_user_id: &str, new_name: &str, new_role: Role) -> BackendResult<()> {
        let args = json!({ "target_user_id": target_user_id, "new_name": new_name, "new_role": new_role });
        self.rpc(token, "admin_update_profile", args).await?;
        Ok(())
    }

    async fn update_user_password(&self, token: &str, user_id: &str, new_password: &str) -> BackendResult<()> {
        self.rpc(token, "update_user_password", json!({ "user_id": user_id, "new_password": new_password })).await?;
        Ok(())
    }
}

#[async_trait]
impl ChangeFeed for RestBackend {
    async fn subscribe(&self, token: &str, table: &str) -> BackendResult<Subscription> {
        let url = realtime::socket_url(&self.base, &self.anon_key)?;
        let (tx, rx) = mpsc::channel(64);
        let handle = tokio::spawn(realtime::run_channel(
            url,
            table.to_string(),
            token.to_string(),
            self.realtime.clone(),
            tx,
        ));
        Ok(Subscription::new(rx, Some(handle)))
    }
}
