//! Realtime change feed over the backend's Phoenix-style WebSocket.
//!
//! One task per subscription: connect, join `realtime:public:<table>` for every
//! postgres change, heartbeat, forward changes. When the socket drops the task reports
//! `Disconnected`, waits a fixed delay and reconnects. It ends when the receiving
//! side of the subscription is closed or the task is aborted.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::{BackendError, BackendResult, ChangeNotification, ConnectionStatus, FeedEvent};

#[derive(Debug, Clone)]
pub struct RealtimeOptions {
    pub heartbeat: Duration,
    pub reconnect_delay: Duration,
}

impl Default for RealtimeOptions {
    fn default() -> Self {
        Self { heartbeat: Duration::from_secs(30), reconnect_delay: Duration::from_millis(3000) }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    JoinOk,
    JoinError(String),
    Change(ChangeNotification),
    Closed,
    Other,
}

pub fn topic_for(table: &str) -> String { format!("realtime:public:{}", table) }

/// Convert http(s)://host to ws(s)://host/realtime/v1/websocket?apikey=..&vsn=1.0.0
pub fn socket_url(base: &Url, api_key: &str) -> BackendResult<Url> {
    let mut ws = base.clone();
    let scheme = if base.scheme() == "https" { "wss" } else { "ws" };
    ws.set_scheme(scheme).map_err(|_| BackendError::Config(format!("cannot derive websocket url from {}", base)))?;
    let mut ws = ws
        .join("realtime/v1/websocket")
        .map_err(|e| BackendError::Config(format!("bad realtime url: {}", e)))?;
    ws.query_pairs_mut().append_pair("apikey", api_key).append_pair("vsn", "1.0.0");
    Ok(ws)
}

pub fn join_message(table: &str, access_token: &str, msg_ref: u64) -> Value {
    json!({
        "topic": topic_for(table),
        "event": "phx_join",
        "payload": {
            "config": {
                "postgres_changes": [{ "event": "*", "schema": "public", "table": table }]
            },
            "access_token": access_token
        },
        "ref": msg_ref.to_string(),
    })
}

pub fn heartbeat_message(msg_ref: u64) -> Value {
    json!({ "topic": "phoenix", "event": "heartbeat", "payload": {}, "ref": msg_ref.to_string() })
}

/// Classify one inbound text frame for `topic`. Frames for other topics are `Other`.
pub fn parse_frame(text: &str, topic: &str) -> Frame {
    let Ok(v) = serde_json::from_str::<Value>(text) else { return Frame::Other; };
    if v.get("topic").and_then(|t| t.as_str()) != Some(topic) { return Frame::Other; }
    let payload = v.get("payload").cloned().unwrap_or(Value::Null);
    match v.get("event").and_then(|e| e.as_str()) {
        Some("phx_reply") => match payload.get("status").and_then(|s| s.as_str()) {
            Some("ok") => Frame::JoinOk,
            Some(_) => Frame::JoinError(payload.get("response").map(|r| r.to_string()).unwrap_or_default()),
            None => Frame::Other,
        },
        Some("postgres_changes") => {
            let data = payload.get("data").cloned().unwrap_or(Value::Null);
            let event_type = data.get("type").and_then(|t| t.as_str()).unwrap_or("*").to_string();
            let affected_table = data
                .get("table")
                .and_then(|t| t.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| topic.rsplit(':').next().unwrap_or_default().to_string());
            Frame::Change(ChangeNotification { event_type, affected_table, payload: data })
        }
        Some("phx_close") | Some("phx_error") => Frame::Closed,
        _ => Frame::Other,
    }
}

/// Drive one subscription until the consumer goes away.
pub async fn run_channel(url: Url, table: String, access_token: String, opts: RealtimeOptions, tx: mpsc::Sender<FeedEvent>) {
    loop {
        if tx.send(FeedEvent::Status(ConnectionStatus::Connecting)).await.is_err() { return; }
        match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((ws, _resp)) => match drive(ws, &table, &access_token, &opts, &tx).await {
                Ok(()) => debug!(target: "realtime", table = %table, "channel closed"),
                Err(e) => warn!(target: "realtime", table = %table, "channel error: {}", e),
            },
            Err(e) => warn!(target: "realtime", table = %table, "connect failed: {}", e),
        }
        if tx.send(FeedEvent::Status(ConnectionStatus::Disconnected)).await.is_err() { return; }
        tokio::time::sleep(opts.reconnect_delay).await;
    }
}

async fn drive<S>(ws: S, table: &str, access_token: &str, opts: &RealtimeOptions, tx: &mpsc::Sender<FeedEvent>) -> BackendResult<()>
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    let topic = topic_for(table);
    let (mut sink, mut stream) = ws.split();
    let mut msg_ref: u64 = 1;
    sink.send(Message::Text(join_message(table, access_token, msg_ref).to_string())).await?;

    let mut heartbeat = tokio::time::interval(opts.heartbeat);
    heartbeat.tick().await;
    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                msg_ref += 1;
                sink.send(Message::Text(heartbeat_message(msg_ref).to_string())).await?;
            }
            _ = tx.closed() => {
                let _ = sink.send(Message::Close(None)).await;
                return Ok(());
            }
            msg = stream.next() => match msg {
                None | Some(Ok(Message::Close(_))) => return Ok(()),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(Message::Text(text))) => match parse_frame(&text, &topic) {
                    Frame::JoinOk => {
                        info!(target: "realtime", table, "subscribed");
                        if tx.send(FeedEvent::Status(ConnectionStatus::Connected)).await.is_err() { return Ok(()); }
                    }
                    Frame::JoinError(msg) => {
                        return Err(BackendError::Status { status: 400, message: format!("join rejected: {}", msg) });
                    }
                    Frame::Change(note) => {
                        if tx.send(FeedEvent::Change(note)).await.is_err() { return Ok(()); }
                    }
                    Frame::Closed => return Ok(()),
                    Frame::Other => {}
                },
                Some(Ok(_)) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_url_switches_scheme_and_adds_key() {
        let base = Url::parse("https://abc.supabase.co").unwrap();
        let u = socket_url(&base, "anon").unwrap();
        assert_eq!(u.as_str(), "wss://abc.supabase.co/realtime/v1/websocket?apikey=anon&vsn=1.0.0");
        let base = Url::parse("http://127.0.0.1:54321").unwrap();
        assert!(socket_url(&base, "k").unwrap().as_str().starts_with("ws://127.0.0.1:54321/realtime/v1/websocket"));
    }

    #[test]
    fn join_requests_all_events_on_table() {
        let j = join_message("profiles", "tok", 1);
        assert_eq!(j["topic"], "realtime:public:profiles");
        assert_eq!(j["payload"]["config"]["postgres_changes"][0]["event"], "*");
        assert_eq!(j["payload"]["access_token"], "tok");
    }

    #[test]
    fn parses_reply_change_and_foreign_topics() {
        let topic = topic_for("profiles");
        let ok = r#"{"topic":"realtime:public:profiles","event":"phx_reply","payload":{"status":"ok","response":{}},"ref":"1"}"#;
        assert_eq!(parse_frame(ok, &topic), Frame::JoinOk);

        let change = r#"{"topic":"realtime:public:profiles","event":"postgres_changes","payload":{"data":{"type":"UPDATE","table":"profiles","record":{"id":"u1"}}},"ref":null}"#;
        match parse_frame(change, &topic) {
            Frame::Change(n) => {
                assert_eq!(n.event_type, "UPDATE");
                assert_eq!(n.affected_table, "profiles");
                assert_eq!(n.payload["record"]["id"], "u1");
            }
            other => panic!("unexpected {:?}", other),
        }

        let hb = r#"{"topic":"phoenix","event":"phx_reply","payload":{"status":"ok"},"ref":"2"}"#;
        assert_eq!(parse_frame(hb, &topic), Frame::Other);
        assert_eq!(parse_frame("not json", &topic), Frame::Other);

        let err = r#"{"topic":"realtime:public:profiles","event":"phx_reply","payload":{"status":"error","response":{"reason":"denied"}}}"#;
        assert!(matches!(parse_frame(err, &topic), Frame::JoinError(_)));
    }
}
