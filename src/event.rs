//! Orchestrator events, replies, and the marshaller/progress collaborators.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// An event exchanged with the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(default = "new_event_id")]
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub previous_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub previous_names: Vec<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transitioning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transitioning_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transitioning_progress: Option<u8>,
    #[serde(default = "now_millis")]
    pub time: i64,
}

fn new_event_id() -> String {
    Uuid::new_v4().to_string()
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl Event {
    /// Create a new event with a fresh id.
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            id: new_event_id(),
            name: name.into(),
            reply_to: None,
            resource_id: None,
            resource_type: None,
            previous_ids: Vec::new(),
            previous_names: Vec::new(),
            data,
            transitioning: None,
            transitioning_message: None,
            transitioning_progress: None,
            time: now_millis(),
        }
    }

    /// Build the reply to this event carrying `data`.
    pub fn reply(&self, data: Option<Value>) -> Event {
        let name = self
            .reply_to
            .clone()
            .unwrap_or_else(|| format!("{}.reply", self.name));

        Event {
            resource_id: self.resource_id.clone(),
            resource_type: self.resource_type.clone(),
            previous_ids: vec![self.id.clone()],
            previous_names: vec![self.name.clone()],
            ..Event::new(name, data.unwrap_or(Value::Null))
        }
    }

    /// Build an error reply carrying `message`.
    pub fn error_reply(&self, message: impl Into<String>) -> Event {
        let mut reply = self.reply(None);
        reply.transitioning = Some("error".to_string());
        reply.transitioning_message = Some(message.into());
        reply
    }

    /// Build a progress update for this event.
    pub fn progress(&self, message: &str, data: Option<Value>) -> Event {
        let mut update = self.reply(data);
        update.transitioning = Some("yes".to_string());
        update.transitioning_message = Some(message.to_string());
        update
    }
}

/// Serializes events for tunneling and decodes structured replies.
pub trait Marshaller: Send + Sync {
    /// Serialize an event.
    fn to_bytes(&self, event: &Event) -> serde_json::Result<Vec<u8>>;

    /// Decode a reply into a structured value.
    fn from_bytes(&self, bytes: &[u8]) -> serde_json::Result<Value>;
}

/// JSON marshaller.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonMarshaller;

impl Marshaller for JsonMarshaller {
    fn to_bytes(&self, event: &Event) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(event)
    }

    fn from_bytes(&self, bytes: &[u8]) -> serde_json::Result<Value> {
        serde_json::from_slice(bytes)
    }
}

/// Fire-and-forget status reporting to the orchestrator.
pub trait Progress: Send + Sync {
    fn update(&self, message: &str, data: Option<Value>);
}

/// Discards every update.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl Progress for NoProgress {
    fn update(&self, message: &str, _data: Option<Value>) {
        debug!("Progress: {}", message);
    }
}

/// Emits progress events for `event` into the agent's outbound channel.
pub struct EventProgress {
    event: Event,
    outbox: mpsc::UnboundedSender<Event>,
}

impl EventProgress {
    pub fn new(event: Event, outbox: mpsc::UnboundedSender<Event>) -> Self {
        Self { event, outbox }
    }
}

impl Progress for EventProgress {
    fn update(&self, message: &str, data: Option<Value>) {
        if self.outbox.send(self.event.progress(message, data)).is_err() {
            warn!("Dropping progress update '{}', outbound channel closed", message);
        }
    }
}
