//! Managed backend: Supabase Realtime over the Phoenix WebSocket protocol,
//! snapshots over the REST endpoint.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crm_common::config::BackendConfig;
use crm_common::error::{Error, Result};
use crm_common::types::{ChannelKey, SessionScope};

use crate::cdc::RawChange;
use crate::transport::{RawChangeStream, RealtimeBackend};

const JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const FEED_BUFFER: usize = 256;

/// Phoenix protocol message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhoenixMessage {
    /// Topic (channel name)
    pub topic: String,
    /// Event type
    pub event: String,
    /// Payload
    #[serde(default)]
    pub payload: Value,
    /// Reference for request/response matching
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
    /// Join reference
    #[serde(default)]
    pub join_ref: Option<String>,
}

impl PhoenixMessage {
    /// Create a new message
    pub fn new(topic: &str, event: &str, payload: Value) -> Self {
        Self {
            topic: topic.to_string(),
            event: event.to_string(),
            payload,
            reference: Some(Uuid::new_v4().to_string()),
            join_ref: None,
        }
    }

    /// Keepalive sent on the `phoenix` topic
    pub fn heartbeat() -> Self {
        Self::new("phoenix", "heartbeat", json!({}))
    }

    /// Reply status of a `phx_reply`
    #[must_use]
    pub fn reply_status(&self) -> Option<&str> {
        if self.event != "phx_reply" {
            return None;
        }
        self.payload.get("status").and_then(Value::as_str)
    }

    fn to_frame(&self) -> Result<Message> {
        Ok(Message::Text(serde_json::to_string(self)?.into()))
    }
}

/// Supabase Realtime + PostgREST backend
pub struct SupabaseBackend {
    config: BackendConfig,
    http: reqwest::Client,
}

impl SupabaseBackend {
    /// Create a backend client
    ///
    /// # Errors
    /// Returns `ConfigError` when the HTTP client cannot be built.
    pub fn new(config: BackendConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::ConfigError(format!("http client: {e}")))?;
        Ok(Self { config, http })
    }

    /// Realtime topic of a channel
    #[must_use]
    pub fn topic(&self, channel: ChannelKey) -> String {
        format!("realtime:{}:{}", self.config.schema, channel.kind().table())
    }

    /// Row filter applied to change feeds and snapshots
    #[must_use]
    pub fn scope_filter(&self, scope: &SessionScope) -> String {
        format!("{}=eq.{}", self.config.scope_column, scope.workspace_id)
    }

    /// `phx_join` for a channel's `postgres_changes` feed
    #[must_use]
    pub fn join_message(&self, channel: ChannelKey, scope: &SessionScope) -> PhoenixMessage {
        let mut join = PhoenixMessage::new(
            &self.topic(channel),
            "phx_join",
            json!({
                "config": {
                    "broadcast": {"self": false},
                    "presence": {"key": ""},
                    "postgres_changes": [{
                        "event": "*",
                        "schema": self.config.schema,
                        "table": channel.kind().table(),
                        "filter": self.scope_filter(scope),
                    }],
                },
                "access_token": self.config.api_key,
            }),
        );
        join.join_ref.clone_from(&join.reference);
        join
    }

    fn socket_url(&self) -> String {
        let base = self.config.realtime_url.trim_end_matches('/');
        match &self.config.api_key {
            Some(key) => format!("{base}/websocket?apikey={key}&vsn=1.0.0"),
            None => format!("{base}/websocket?vsn=1.0.0"),
        }
    }
}

#[async_trait]
impl RealtimeBackend for SupabaseBackend {
    async fn subscribe(&self, channel: ChannelKey, scope: &SessionScope) -> Result<RawChangeStream> {
        let (socket, _) = connect_async(self.socket_url())
            .await
            .map_err(|e| Error::Transport(format!("{channel}: {e}")))?;
        let (mut write, mut read) = socket.split();

        let topic = self.topic(channel);
        let join = self.join_message(channel, scope);
        write
            .send(join.to_frame()?)
            .await
            .map_err(|e| Error::Transport(format!("{channel}: join: {e}")))?;

        tokio::time::timeout(JOIN_TIMEOUT, async {
            while let Some(frame) = read.next().await {
                let frame = frame.map_err(|e| Error::Transport(e.to_string()))?;
                let Some(msg) = parse_frame(&frame)? else {
                    continue;
                };
                if msg.topic != topic {
                    continue;
                }
                if msg.reference == join.reference {
                    return match msg.reply_status() {
                        Some("ok") => Ok(()),
                        _ => Err(Error::Transport(format!("join rejected: {}", msg.payload))),
                    };
                }
                if msg.event == "phx_error" || msg.event == "phx_close" {
                    return Err(Error::Transport(format!("{} during join", msg.event)));
                }
            }
            Err(Error::Transport("socket closed during join".into()))
        })
        .await
        .map_err(|_| Error::Transport(format!("{channel}: join timed out")))??;
        info!("Joined {}", topic);

        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        let heartbeat_every = Duration::from_secs(self.config.heartbeat_interval_secs.max(1));
        tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(heartbeat_every);
            heartbeat.tick().await;
            let reason = loop {
                tokio::select! {
                    () = tx.closed() => break None,
                    _ = heartbeat.tick() => {
                        let sent = match PhoenixMessage::heartbeat().to_frame() {
                            Ok(frame) => write.send(frame).await.map_err(|e| e.to_string()),
                            Err(e) => Err(e.to_string()),
                        };
                        if let Err(e) = sent {
                            break Some(format!("heartbeat failed: {e}"));
                        }
                    }
                    frame = read.next() => {
                        let frame = match frame {
                            Some(Ok(frame)) => frame,
                            Some(Err(e)) => break Some(e.to_string()),
                            None => break Some("socket closed".to_string()),
                        };
                        if let Message::Close(close) = &frame {
                            break Some(format!("closed by server: {close:?}"));
                        }
                        let msg = match parse_frame(&frame) {
                            Ok(Some(msg)) => msg,
                            Ok(None) => continue,
                            Err(e) => {
                                warn!("Unreadable frame on {}: {}", topic, e);
                                continue;
                            }
                        };
                        if msg.topic != topic {
                            continue;
                        }
                        match msg.event.as_str() {
                            "postgres_changes" => {
                                let change = decode_change(&msg.payload);
                                if tx.send(Ok(change)).await.is_err() {
                                    break None;
                                }
                            }
                            "phx_error" | "phx_close" => {
                                break Some(format!("{} on {}", msg.event, topic));
                            }
                            other => debug!("Ignoring {} on {}", other, topic),
                        }
                    }
                }
            };
            if let Some(reason) = reason {
                let _ = tx.send(Err(Error::Transport(reason))).await;
            }
            let _ = write.close().await;
        });

        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn fetch_snapshot(&self, channel: ChannelKey, scope: &SessionScope) -> Result<Vec<Value>> {
        let table = channel.kind().table();
        let url = format!("{}/{}", self.config.rest_url.trim_end_matches('/'), table);
        let mut request = self.http.get(&url).query(&[
            ("select", "*".to_string()),
            (
                self.config.scope_column.as_str(),
                format!("eq.{}", scope.workspace_id),
            ),
        ]);
        if let Some(key) = &self.config.api_key {
            request = request.header("apikey", key).bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Snapshot(format!("{table}: {e}")))?;
        let status = response.status();
        if status.is_client_error()
            && status != StatusCode::REQUEST_TIMEOUT
            && status != StatusCode::TOO_MANY_REQUESTS
        {
            return Err(Error::SnapshotRejected(format!("{table}: HTTP {status}")));
        }
        if !status.is_success() {
            return Err(Error::Snapshot(format!("{table}: HTTP {status}")));
        }
        let rows: Vec<Value> = response
            .json()
            .await
            .map_err(|e| Error::Snapshot(format!("{table}: {e}")))?;
        debug!("Fetched {} rows from {}", rows.len(), table);
        Ok(rows)
    }
}

fn parse_frame(frame: &Message) -> Result<Option<PhoenixMessage>> {
    match frame {
        Message::Text(text) => Ok(Some(serde_json::from_str(text)?)),
        Message::Binary(bytes) => Ok(Some(serde_json::from_slice(bytes)?)),
        _ => Ok(None),
    }
}

/// `payload.data` of a `postgres_changes` push. Undecodable payloads become a
/// change carrying the decode error, so they are counted as malformed rather
/// than ending the feed.
fn decode_change(payload: &Value) -> RawChange {
    let data = payload.get("data").unwrap_or(payload);
    serde_json::from_value(data.clone()).unwrap_or_else(|e| RawChange {
        schema: None,
        table: data
            .get("table")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        event_type: String::new(),
        record: None,
        old_record: None,
        commit_timestamp: None,
        errors: Some(vec![e.to_string()]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> SupabaseBackend {
        SupabaseBackend::new(BackendConfig {
            realtime_url: "wss://demo.supabase.co/realtime/v1/".into(),
            api_key: Some("anon".into()),
            ..BackendConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_join_message() {
        let backend = backend();
        let join = backend.join_message(ChannelKey::Conversations, &SessionScope::workspace("w1"));
        assert_eq!(join.topic, "realtime:public:dispatch_conversations");
        assert_eq!(join.event, "phx_join");
        assert_eq!(join.join_ref, join.reference);
        let changes = &join.payload["config"]["postgres_changes"][0];
        assert_eq!(changes["table"], "dispatch_conversations");
        assert_eq!(changes["filter"], "workspace_id=eq.w1");
        assert_eq!(join.payload["access_token"], "anon");
    }

    #[test]
    fn test_socket_url() {
        assert_eq!(
            backend().socket_url(),
            "wss://demo.supabase.co/realtime/v1/websocket?apikey=anon&vsn=1.0.0"
        );
    }

    #[test]
    fn test_wire_format() {
        let msg = PhoenixMessage::heartbeat();
        let text = serde_json::to_string(&msg).unwrap();
        assert!(text.contains("\"ref\""));
        let parsed: PhoenixMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.topic, "phoenix");

        let reply: PhoenixMessage = serde_json::from_value(json!({
            "topic": "realtime:public:leads",
            "event": "phx_reply",
            "payload": {"status": "ok", "response": {}},
            "ref": "1"
        }))
        .unwrap();
        assert_eq!(reply.reply_status(), Some("ok"));
    }

    #[test]
    fn test_decode_postgres_change() {
        let change = decode_change(&json!({
            "data": {
                "schema": "public",
                "table": "leads",
                "type": "UPDATE",
                "commit_timestamp": "2024-03-01T10:00:00Z",
                "record": {"id": 1, "version": 2},
                "old_record": {"id": 1},
                "errors": null
            },
            "ids": [1]
        }));
        assert_eq!(change.table, "leads");
        assert_eq!(change.event_type, "UPDATE");
        assert!(change.errors.is_none());

        let broken = decode_change(&json!({"data": {"table": "leads"}}));
        assert!(broken.errors.is_some());
    }
}
