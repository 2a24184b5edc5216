#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **agentcore-types** – Shared wire types for the agent coordination core.
//!
//! This crate is dependency-light and sits at the bottom of the crate graph
//! so every other crate can depend on it without cycles. It defines the
//! [`Message`] value object exchanged between agents and the identifiers and
//! enumerations (`AgentId`, `MessageType`, `Priority`) used across the
//! broker, distributor, communication manager, and façade.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum allowed length for an agent identifier.
pub const MAX_AGENT_ID_LEN: usize = 256;

/// Maximum allowed length for a capability tag.
pub const MAX_CAPABILITY_LEN: usize = 128;

/// Unique, opaque agent identifier.
///
/// Agents in this system are externally named workers (processes,
/// containerized workloads, or services) rather than kernel-assigned
/// numeric entities, so the identifier is a validated string newtype.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl AgentId {
    /// Construct a new agent id, validating length and non-emptiness.
    pub fn new(id: impl Into<String>) -> Result<Self, TypesError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(TypesError::InvalidField("agent id cannot be empty".into()));
        }
        if id.len() > MAX_AGENT_ID_LEN {
            return Err(TypesError::InvalidField(format!(
                "agent id too long: {} > {}",
                id.len(),
                MAX_AGENT_ID_LEN
            )));
        }
        Ok(Self(id))
    }

    /// Borrow the underlying string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Validation/construction errors for the wire types in this crate.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TypesError {
    /// A field failed a structural validation rule.
    #[error("invalid field: {0}")]
    InvalidField(String),
}

/// The kind of a [`Message`].
///
/// Serializes to the lowercase/snake_case strings used on the wire, matching
/// the canonical representation external API handlers expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Point-to-point message addressed to exactly one recipient.
    Direct,
    /// Fanned out to every registered agent other than the sender.
    Broadcast,
    /// A task assignment sent to a selected agent.
    TaskRequest,
    /// A reply to a previously sent `TaskRequest`.
    TaskResponse,
    /// An unsolicited status notification.
    StatusUpdate,
    /// An error notification delivered in-band.
    Error,
    /// A system-originated control message.
    System,
}

/// Delivery priority, used both for queue ordering and as a rate-limit
/// dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Drained before any other priority class.
    High,
    /// Drained after `High`, before `Low`.
    Medium,
    /// Drained last.
    Low,
}

impl Priority {
    /// Sort key used by the broker to order a recipient's queue
    /// (`High` = 0, `Medium` = 1, `Low` = 2).
    pub fn sort_key(self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }
}

/// Opaque, structured message payload.
///
/// The core never inspects `content` beyond treating it as serializable
/// data; schemas are enforced at callers' edges. Wrapping `serde_json::Value`
/// in a single untagged variant keeps the wire representation transparent
/// (the JSON for `content` is exactly the inner value) while leaving room to
/// add other payload shapes without breaking callers that match on
/// `MessageContent::Json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Arbitrary JSON-serializable payload.
    Json(serde_json::Value),
}

impl MessageContent {
    /// Borrow the inner JSON value.
    pub fn as_json(&self) -> &serde_json::Value {
        match self {
            MessageContent::Json(v) => v,
        }
    }
}

impl From<serde_json::Value> for MessageContent {
    fn from(v: serde_json::Value) -> Self {
        MessageContent::Json(v)
    }
}

/// Free-form metadata attached to a message.
pub type Metadata = HashMap<String, serde_json::Value>;

/// A value object produced on send and consumed on receive.
///
/// Invariants (enforced by [`Message::new`] and preserved thereafter):
/// - `id` is unique for the lifetime of the broker that issued it.
/// - `delivered == true` implies `delivered_at.is_some()`.
/// - `expires_at.is_none()` iff `ttl_seconds.is_none()`.
/// - `message_type == Broadcast` implies `recipient_id.is_none()` at
///   creation; per-recipient copies fanned out by the broker set it and
///   derive their `id` as `"<original id>:<recipient>"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier.
    pub id: String,
    /// Message kind.
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Sender agent id.
    pub sender_id: AgentId,
    /// Recipient agent id; absent for a not-yet-fanned-out broadcast.
    pub recipient_id: Option<AgentId>,
    /// Request/response linkage; defaults to `id`.
    pub correlation_id: String,
    /// Delivery priority.
    pub priority: Priority,
    /// Opaque payload.
    pub content: MessageContent,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: Metadata,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Optional time-to-live, in seconds, relative to `created_at`.
    pub ttl_seconds: Option<i64>,
    /// Derived expiry timestamp; `None` iff `ttl_seconds` is `None`.
    pub expires_at: Option<DateTime<Utc>>,
    /// Whether this message has been handed to a consumer.
    pub delivered: bool,
    /// Timestamp of delivery; set exactly once, alongside `delivered`.
    pub delivered_at: Option<DateTime<Utc>>,
}

/// Parameters accepted by [`Message::new`].
pub struct NewMessage {
    /// Message kind.
    pub message_type: MessageType,
    /// Sender agent id.
    pub sender_id: AgentId,
    /// Recipient agent id; required unless `message_type == Broadcast`.
    pub recipient_id: Option<AgentId>,
    /// Opaque payload.
    pub content: MessageContent,
    /// Delivery priority.
    pub priority: Priority,
    /// Free-form metadata.
    pub metadata: Metadata,
    /// Optional time-to-live in seconds.
    pub ttl_seconds: Option<i64>,
    /// Explicit correlation id; defaults to the generated `id` when absent.
    pub correlation_id: Option<String>,
}

impl Message {
    /// Construct a new message, generating its `id` and deriving
    /// `expires_at`/`correlation_id` per the invariants documented on the
    /// struct.
    pub fn new(params: NewMessage) -> Result<Self, TypesError> {
        if params.message_type != MessageType::Broadcast && params.recipient_id.is_none() {
            return Err(TypesError::InvalidField(
                "recipient_id is required unless message_type is broadcast".into(),
            ));
        }

        let id = Uuid::new_v4().to_string();
        let created_at = Utc::now();
        let expires_at = params
            .ttl_seconds
            .map(|secs| created_at + chrono::Duration::seconds(secs));
        let correlation_id = params.correlation_id.unwrap_or_else(|| id.clone());

        Ok(Self {
            id,
            message_type: params.message_type,
            sender_id: params.sender_id,
            recipient_id: params.recipient_id,
            correlation_id,
            priority: params.priority,
            content: params.content,
            metadata: params.metadata,
            created_at,
            ttl_seconds: params.ttl_seconds,
            expires_at,
            delivered: false,
            delivered_at: None,
        })
    }

    /// Produce a per-recipient copy of a broadcast message.
    ///
    /// The copy's `id` is derived as `"<original id>:<recipient>"`; callers
    /// must treat this derived id as opaque and never reparse it.
    pub fn fanout_copy(&self, recipient: AgentId) -> Self {
        let mut copy = self.clone();
        copy.id = format!("{}:{}", self.id, recipient);
        copy.recipient_id = Some(recipient);
        copy
    }

    /// Whether this message has passed its expiry, relative to `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(exp) => now >= exp,
            None => false,
        }
    }

    /// Whether this message is currently expired.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Mark this message delivered at the given instant.
    pub fn mark_delivered_at(&mut self, now: DateTime<Utc>) {
        self.delivered = true;
        self.delivered_at = Some(now);
    }

    /// Mark this message delivered now.
    pub fn mark_delivered(&mut self) {
        self.mark_delivered_at(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content(v: serde_json::Value) -> MessageContent {
        MessageContent::Json(v)
    }

    #[test]
    fn direct_requires_recipient() {
        let err = Message::new(NewMessage {
            message_type: MessageType::Direct,
            sender_id: AgentId::new("a").unwrap(),
            recipient_id: None,
            content: content(serde_json::json!({"x": 1})),
            priority: Priority::Medium,
            metadata: Metadata::new(),
            ttl_seconds: None,
            correlation_id: None,
        })
        .unwrap_err();
        assert!(matches!(err, TypesError::InvalidField(_)));
    }

    #[test]
    fn broadcast_allows_missing_recipient_and_fanout_derives_id() {
        let msg = Message::new(NewMessage {
            message_type: MessageType::Broadcast,
            sender_id: AgentId::new("a").unwrap(),
            recipient_id: None,
            content: content(serde_json::json!({"hi": true})),
            priority: Priority::Medium,
            metadata: Metadata::new(),
            ttl_seconds: None,
            correlation_id: None,
        })
        .unwrap();
        assert!(msg.recipient_id.is_none());

        let copy = msg.fanout_copy(AgentId::new("b").unwrap());
        assert_eq!(copy.id, format!("{}:b", msg.id));
        assert_eq!(copy.recipient_id, Some(AgentId::new("b").unwrap()));
    }

    #[test]
    fn correlation_id_defaults_to_generated_id() {
        let msg = Message::new(NewMessage {
            message_type: MessageType::Direct,
            sender_id: AgentId::new("a").unwrap(),
            recipient_id: Some(AgentId::new("b").unwrap()),
            content: content(serde_json::json!(null)),
            priority: Priority::Low,
            metadata: Metadata::new(),
            ttl_seconds: None,
            correlation_id: None,
        })
        .unwrap();
        assert_eq!(msg.correlation_id, msg.id);
    }

    #[test]
    fn ttl_zero_is_already_expired() {
        let msg = Message::new(NewMessage {
            message_type: MessageType::Direct,
            sender_id: AgentId::new("a").unwrap(),
            recipient_id: Some(AgentId::new("b").unwrap()),
            content: content(serde_json::json!(null)),
            priority: Priority::Low,
            metadata: Metadata::new(),
            ttl_seconds: Some(0),
            correlation_id: None,
        })
        .unwrap();
        assert!(msg.is_expired());
    }

    #[test]
    fn mark_delivered_sets_both_fields_together() {
        let mut msg = Message::new(NewMessage {
            message_type: MessageType::Direct,
            sender_id: AgentId::new("a").unwrap(),
            recipient_id: Some(AgentId::new("b").unwrap()),
            content: content(serde_json::json!(null)),
            priority: Priority::Medium,
            metadata: Metadata::new(),
            ttl_seconds: None,
            correlation_id: None,
        })
        .unwrap();
        assert!(!msg.delivered);
        assert!(msg.delivered_at.is_none());
        msg.mark_delivered();
        assert!(msg.delivered);
        assert!(msg.delivered_at.is_some());
    }

    #[test]
    fn agent_id_rejects_empty_and_oversized() {
        assert!(AgentId::new("").is_err());
        assert!(AgentId::new("   ").is_err());
        assert!(AgentId::new("x".repeat(MAX_AGENT_ID_LEN + 1)).is_err());
        assert!(AgentId::new("x".repeat(MAX_AGENT_ID_LEN)).is_ok());
    }
}
