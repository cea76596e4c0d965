use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::models::rule::RecipientId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestState {
    ToMatch,
    ToSend,
    Error,
}

impl RequestState {
    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "TO_MATCH" => Some(RequestState::ToMatch),
            "TO_SEND" => Some(RequestState::ToSend),
            "ERROR" => Some(RequestState::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestState::ToMatch => "TO_MATCH",
            RequestState::ToSend => "TO_SEND",
            RequestState::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    Create,
    Update,
    Delete,
    #[serde(other)]
    Other,
}

impl ActionKind {
    pub fn from_string(s: &str) -> Self {
        match s {
            "CREATE" => ActionKind::Create,
            "UPDATE" => ActionKind::Update,
            "DELETE" => ActionKind::Delete,
            _ => ActionKind::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Create => "CREATE",
            ActionKind::Update => "UPDATE",
            ActionKind::Delete => "DELETE",
            ActionKind::Other => "OTHER",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Urgency {
    Immediate,
    #[default]
    Deferred,
}

impl Urgency {
    pub fn from_string(s: &str) -> Self {
        match s {
            "IMMEDIATE" => Urgency::Immediate,
            _ => Urgency::Deferred,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Urgency::Immediate => "IMMEDIATE",
            Urgency::Deferred => "DEFERRED",
        }
    }

    /// Sort key used when pulling batches: immediate requests go first.
    pub fn rank(&self) -> i16 {
        match self {
            Urgency::Immediate => 0,
            Urgency::Deferred => 1,
        }
    }
}

/// An incoming feature action as decoded from the intake transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    #[serde(default = "generate_request_id")]
    pub request_id: String,

    #[serde(default)]
    pub owner: Option<String>,

    pub action: ActionKind,
    pub payload: JsonValue,

    /// Explicit recipients; when present the event bypasses rule matching.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub recipients: BTreeSet<RecipientId>,
}

fn generate_request_id() -> String {
    Uuid::new_v4().to_string()
}

impl RawEvent {
    pub fn new(action: ActionKind, payload: JsonValue) -> Self {
        Self {
            request_id: generate_request_id(),
            owner: None,
            action,
            payload,
            recipients: BTreeSet::new(),
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_recipients(mut self, recipients: impl IntoIterator<Item = RecipientId>) -> Self {
        self.recipients = recipients.into_iter().collect();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub id: Uuid,
    pub request_id: String,
    pub owner: Option<String>,
    pub payload: JsonValue,
    pub action: ActionKind,
    pub urgency: Urgency,
    pub created_at: DateTime<Utc>,
    pub pending_recipients: BTreeSet<RecipientId>,
    pub state: RequestState,
}

impl NotificationRequest {
    pub fn from_event(event: RawEvent, created_at: DateTime<Utc>) -> Self {
        let state = if event.recipients.is_empty() {
            RequestState::ToMatch
        } else {
            RequestState::ToSend
        };

        Self {
            id: Uuid::new_v4(),
            request_id: event.request_id,
            owner: event.owner,
            payload: event.payload,
            action: event.action,
            urgency: Urgency::Deferred,
            created_at,
            pending_recipients: event.recipients,
            state,
        }
    }

    pub fn is_pending_for(&self, recipient_id: &RecipientId) -> bool {
        self.pending_recipients.contains(recipient_id)
    }
}
