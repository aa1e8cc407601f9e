//! Client for the external file service: multipart uploads, per-user and global file
//! listings, and the push socket announcing new uploads.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::CACHE_CONTROL;
use reqwest::multipart::{Form, Part};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::backend::{BackendError, BackendResult};

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(3000);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadedFile {
    pub user_id: String,
    pub filename: String,
    pub stored_filename: String,
    pub url: String,
}

/// `true` for a `{"event":"new_file"}` push message.
pub fn is_new_file_event(text: &str) -> Result<bool, serde_json::Error> {
    let v: Value = serde_json::from_str(text)?;
    Ok(v.get("event").and_then(|e| e.as_str()) == Some("new_file"))
}

#[derive(Clone)]
pub struct FileServiceClient {
    base: Url,
    client: reqwest::Client,
}

impl FileServiceClient {
    pub fn new(base: &str) -> BackendResult<Self> {
        let base = Url::parse(base).map_err(|e| BackendError::Config(format!("invalid file service url '{}': {}", base, e)))?;
        Ok(Self { base, client: reqwest::Client::new() })
    }

    fn url(&self, path: &str) -> BackendResult<Url> {
        self.base.join(path).map_err(|e| BackendError::Config(format!("bad path {}: {}", path, e)))
    }

    /// ws(s)://host/ws
    pub fn events_url(&self) -> BackendResult<Url> {
        let mut ws = self.base.clone();
        let scheme = if self.base.scheme() == "https" { "wss" } else { "ws" };
        ws.set_scheme(scheme).map_err(|_| BackendError::Config("cannot derive websocket url".into()))?;
        ws.join("/ws").map_err(|e| BackendError::Config(e.to_string()))
    }

    pub async fn upload(&self, user_id: &str, filename: &str, bytes: Vec<u8>) -> BackendResult<Value> {
        let part = Part::bytes(bytes).file_name(filename.to_string());
        let form = Form::new().part("file", part).text("user_id", user_id.to_string());
        let resp = self.client.post(self.url("/upload")?).multipart(form).send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            let message = if text.trim().is_empty() {
                status.canonical_reason().unwrap_or("error").to_string()
            } else {
                text
            };
            return Err(BackendError::Status { status: status.as_u16(), message });
        }
        info!(target: "files", user_id, filename, "upload accepted");
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }

    async fn list(&self, path: &str) -> BackendResult<Vec<UploadedFile>> {
        let resp = self.client.get(self.url(path)?).header(CACHE_CONTROL, "no-store").send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(BackendError::Status { status: status.as_u16(), message: resp.text().await.unwrap_or_default() });
        }
        Ok(resp.json().await?)
    }

    pub async fn list_for_user(&self, user_id: &str) -> BackendResult<Vec<UploadedFile>> {
        self.list(&format!("/files/{}", urlencoding::encode(user_id))).await
    }

    pub async fn list_all(&self) -> BackendResult<Vec<UploadedFile>> {
        self.list("/files/all").await
    }
}

/// Long-lived subscription to new-upload events with fixed-delay reconnect.
/// Stopping (or dropping) it closes the socket and prevents any further reconnect.
pub struct UploadWatcher {
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl UploadWatcher {
    pub fn spawn<F>(url: Url, reconnect_delay: Duration, on_new_file: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(watch_loop(url, reconnect_delay, Arc::new(on_new_file), stop_rx));
        Self { stop, task: Some(task) }
    }

    pub async fn stop(mut self) {
        let _ = self.stop.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for UploadWatcher {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
        if let Some(task) = self.task.take() { task.abort(); }
    }
}

async fn watch_loop(url: Url, delay: Duration, on_new_file: Arc<dyn Fn() + Send + Sync>, mut stop: watch::Receiver<bool>) {
    loop {
        if *stop.borrow() { return; }
        match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((mut ws, _)) => {
                info!(target: "files", "Connected to WebSocket");
                loop {
                    tokio::select! {
                        _ = stop.changed() => {
                            let _ = ws.close(None).await;
                            return;
                        }
                        msg = ws.next() => match msg {
                            Some(Ok(Message::Text(text))) => match is_new_file_event(&text) {
                                Ok(true) => on_new_file(),
                                Ok(false) => {}
                                Err(e) => warn!(target: "files", "Error parsing WS message: {}", e),
                            },
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Err(e)) => {
                                debug!(target: "files", "socket error: {}", e);
                                break;
                            }
                            Some(Ok(_)) => {}
                        }
                    }
                }
            }
            Err(e) => warn!(target: "files", "WebSocket connection error. Is the file service running? {}", e),
        }
        tokio::select! {
            _ = stop.changed() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognises_new_file_events() {
        assert!(is_new_file_event(r#"{"event":"new_file"}"#).unwrap());
        assert!(!is_new_file_event(r#"{"event":"other"}"#).unwrap());
        assert!(is_new_file_event("garbage").is_err());
    }

    #[test]
    fn events_url_uses_ws_scheme() {
        let c = FileServiceClient::new("http://127.0.0.1:8000").unwrap();
        assert_eq!(c.events_url().unwrap().as_str(), "ws://127.0.0.1:8000/ws");
        assert_eq!(DEFAULT_RECONNECT_DELAY, Duration::from_millis(3000));
    }
}
