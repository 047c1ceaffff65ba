//! Realtime fan-out to topic-subscribed WebSocket connections

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{CollectorError, Result};

pub type ConnectionId = Uuid;

/// MQTT-style topic filter.
///
/// `+` (or `*`) consumes exactly one segment; `#` as the last segment
/// matches the remaining segments including none. A `#` anywhere else never
/// matches. A bare `*` or `#` matches every topic.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    if pattern == "#" || pattern == "*" {
        return true;
    }
    let topic: Vec<&str> = topic.split('/').collect();
    let pattern: Vec<&str> = pattern.split('/').collect();

    for (i, segment) in pattern.iter().enumerate() {
        if *segment == "#" {
            return i + 1 == pattern.len() && topic.len() >= i;
        }
        let Some(actual) = topic.get(i) else {
            return false;
        };
        if *segment != "+" && *segment != "*" && segment != actual {
            return false;
        }
    }
    pattern.len() == topic.len()
}

/// Push message delivered to subscribers
#[derive(Debug, Clone, Serialize)]
pub struct RealtimeMessage<'a> {
    pub topic: &'a str,
    pub payload: &'a Value,
}

struct Subscriber {
    tx: mpsc::UnboundedSender<String>,
    patterns: Vec<String>,
}

impl Subscriber {
    /// No patterns means everything
    fn wants(&self, topic: &str) -> bool {
        self.patterns.is_empty() || self.patterns.iter().any(|p| topic_matches(p, topic))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Subscribe,
    Unsubscribe,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v,
        }
    }
}

/// Inbound control message; `topic` and `sensors` are aliases of `topics`
#[derive(Debug, Clone, Deserialize)]
struct RawControl {
    action: ControlAction,
    topics: Option<OneOrMany>,
    topic: Option<OneOrMany>,
    sensors: Option<OneOrMany>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    pub action: ControlAction,
    pub topics: Vec<String>,
}

impl ControlMessage {
    pub fn parse(text: &str) -> Result<Self> {
        let raw: RawControl = serde_json::from_str(text)?;
        let topics = [raw.topics, raw.topic, raw.sensors]
            .into_iter()
            .flatten()
            .flat_map(OneOrMany::into_vec)
            .filter(|t| !t.trim().is_empty())
            .collect::<Vec<_>>();
        if topics.is_empty() {
            return Err(CollectorError::data("Control message carries no topics"));
        }
        if let Some(bad) = topics.iter().find(|t| !is_valid_filter(t)) {
            return Err(CollectorError::data(format!(
                "Invalid topic filter '{}': '#' must be the last segment",
                bad
            )));
        }
        Ok(Self {
            action: raw.action,
            topics,
        })
    }
}

/// `#` is only valid as the last segment of a filter
fn is_valid_filter(pattern: &str) -> bool {
    let segments: Vec<&str> = pattern.split('/').collect();
    !segments[..segments.len() - 1].contains(&"#")
}

/// Live subscriber set
#[derive(Default)]
pub struct RealtimeHub {
    subscribers: DashMap<ConnectionId, Subscriber>,
}

impl RealtimeHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tx: mpsc::UnboundedSender<String>) -> ConnectionId {
        let id = Uuid::new_v4();
        self.subscribers.insert(
            id,
            Subscriber {
                tx,
                patterns: Vec::new(),
            },
        );
        id
    }

    pub fn subscribe(&self, id: ConnectionId, patterns: &[String]) -> bool {
        let Some(mut sub) = self.subscribers.get_mut(&id) else {
            return false;
        };
        for pattern in patterns {
            if !sub.patterns.contains(pattern) {
                sub.patterns.push(pattern.clone());
            }
        }
        true
    }

    pub fn unsubscribe(&self, id: ConnectionId, patterns: &[String]) -> bool {
        let Some(mut sub) = self.subscribers.get_mut(&id) else {
            return false;
        };
        sub.patterns.retain(|p| !patterns.contains(p));
        true
    }

    pub fn patterns(&self, id: ConnectionId) -> Option<Vec<String>> {
        self.subscribers.get(&id).map(|sub| sub.patterns.clone())
    }

    pub fn remove(&self, id: ConnectionId) {
        self.subscribers.remove(&id);
    }

    pub fn connection_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Deliver to every matching subscriber and drop those whose channel is gone.
    /// Returns the number of deliveries.
    pub fn broadcast(&self, topic: &str, payload: &Value) -> usize {
        if self.subscribers.is_empty() {
            return 0;
        }
        let text = match serde_json::to_string(&RealtimeMessage { topic, payload }) {
            Ok(text) => text,
            Err(e) => {
                warn!("Realtime message for {} not serializable: {}", topic, e);
                return 0;
            },
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for entry in self.subscribers.iter() {
            if !entry.wants(topic) {
                continue;
            }
            if entry.tx.send(text.clone()).is_ok() {
                delivered += 1;
            } else {
                dead.push(*entry.key());
            }
        }

        for id in dead {
            debug!("Dropping realtime connection {}", id);
            self.subscribers.remove(&id);
        }
        delivered
    }

    /// Apply one inbound control message and build the acknowledgement
    pub fn handle_control(&self, id: ConnectionId, text: &str) -> Value {
        match ControlMessage::parse(text) {
            Ok(msg) => {
                match msg.action {
                    ControlAction::Subscribe => self.subscribe(id, &msg.topics),
                    ControlAction::Unsubscribe => self.unsubscribe(id, &msg.topics),
                };
                let kind = match msg.action {
                    ControlAction::Subscribe => "subscribed",
                    ControlAction::Unsubscribe => "unsubscribed",
                };
                json!({ "type": kind, "topics": msg.topics })
            },
            Err(e) => json!({ "type": "error", "message": e.to_string() }),
        }
    }
}

/// Drive one upgraded WebSocket until either side goes away
pub async fn serve_socket(socket: WebSocket, hub: Arc<RealtimeHub>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let id = hub.register(tx.clone());
    info!("Realtime connection opened: {}", id);

    let greeting = json!({ "type": "connected", "message": "Connected to collector realtime feed" });
    let _ = tx.send(greeting.to_string());

    let mut send_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let recv_hub = Arc::clone(&hub);
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    let ack = recv_hub.handle_control(id, text.as_str());
                    if tx.send(ack.to_string()).is_err() {
                        break;
                    }
                },
                Message::Close(_) => break,
                _ => {},
            }
        }
    });

    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    }

    hub.remove(id);
    info!("Realtime connection closed: {}", id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcards() {
        let topic = "machines/sec21/plc1/temp";
        assert!(topic_matches("machines/+/plc1/#", topic));
        assert!(topic_matches("machines/*/plc1/temp", topic));
        assert!(topic_matches(topic, topic));
        assert!(!topic_matches("machines/sec21/plc2/#", topic));
        assert!(!topic_matches("machines/+/plc1", topic));
        assert!(!topic_matches("machines/sec21/plc1/temp/x", topic));
    }

    #[test]
    fn test_multi_level_matches_parent_and_bare_wildcards_match_all() {
        assert!(topic_matches("machines/sec21/#", "machines/sec21"));
        assert!(!topic_matches("machines/sec21/plc1/#", "machines/sec21"));
        assert!(topic_matches("#", "system/status"));
        assert!(topic_matches("*", "machines/a/b/c"));
    }

    #[test]
    fn test_inner_multi_level_wildcard_never_matches() {
        assert!(!topic_matches("a/#/b", "a/x/y"));
        assert!(!topic_matches("a/#/b", "a/x/b"));
        assert!(ControlMessage::parse(r#"{"action":"subscribe","topics":["a/#/b"]}"#).is_err());
        assert!(ControlMessage::parse(r#"{"action":"subscribe","topics":["a/+/#"]}"#).is_ok());
    }

    #[test]
    fn test_no_patterns_receives_everything() {
        let hub = RealtimeHub::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.register(tx);

        assert_eq!(hub.broadcast("system/status", &json!({"ok": true})), 1);
        let text = rx.try_recv().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["topic"], "system/status");
        assert_eq!(value["payload"]["ok"], true);
    }

    #[test]
    fn test_subscription_filters_and_unsubscribe() {
        let hub = RealtimeHub::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = hub.register(tx);
        hub.subscribe(id, &["machines/+/plc1/#".to_string()]);

        assert_eq!(hub.broadcast("machines/sec21/plc2/temp", &json!(1)), 0);
        assert_eq!(hub.broadcast("machines/sec21/plc1/temp", &json!(1)), 1);
        assert!(rx.try_recv().is_ok());

        hub.unsubscribe(id, &["machines/+/plc1/#".to_string()]);
        assert_eq!(hub.patterns(id), Some(vec![]));
    }

    #[test]
    fn test_dead_connection_is_removed_without_affecting_others() {
        let hub = RealtimeHub::new();
        let (dead_tx, dead_rx) = mpsc::unbounded_channel();
        let (live_tx, mut live_rx) = mpsc::unbounded_channel();
        let dead = hub.register(dead_tx);
        hub.register(live_tx);
        drop(dead_rx);

        assert_eq!(hub.broadcast("machines/a/b/c", &json!(2)), 1);
        assert!(live_rx.try_recv().is_ok());
        assert_eq!(hub.connection_count(), 1);
        assert!(hub.patterns(dead).is_none());
    }

    #[test]
    fn test_control_aliases() {
        let msg = ControlMessage::parse(r#"{"action":"subscribe","sensors":"machines/#"}"#).unwrap();
        assert_eq!(msg.topics, vec!["machines/#".to_string()]);

        let msg = ControlMessage::parse(
            r#"{"action":"unsubscribe","topics":["a/+"],"topic":"b/#"}"#,
        )
        .unwrap();
        assert_eq!(msg.action, ControlAction::Unsubscribe);
        assert_eq!(msg.topics.len(), 2);

        assert!(ControlMessage::parse(r#"{"action":"subscribe"}"#).is_err());
        assert!(ControlMessage::parse(r#"{"action":"publish","topics":"x"}"#).is_err());
    }
}
