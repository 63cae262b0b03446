//! Messages exchanged between subscribers and the publisher.
//!
//! Client messages are JSON objects tagged by `action`:
//!
//! ```text
//! {"action":"subscribe","query":"[{\"class\":\"Employee\"}]","count":false}
//! {"action":"unsubscribe","uid":"invoice-number"}
//! {"action":"publish","event":"update","guid":"…","etype":"Employee","entity":{…}}
//! ```
//!
//! Server messages are untagged; each shape is told apart by its keys
//! (`set`, `added`, `updated`, `removed`, `count`, `uid`).

use nymph_model::{Entity, Guid};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifies one subscriber connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Client → publisher ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ClientMessage {
    Subscribe(Subscription),
    Unsubscribe(Subscription),
    Publish(Publication),
}

impl ClientMessage {
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

/// Target of a subscribe or unsubscribe: a serialised query or a UID name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    /// Deliver result sizes instead of entity events.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub count: bool,
}

impl Subscription {
    pub fn query(query: impl Into<String>) -> Self {
        Self {
            query: Some(query.into()),
            ..Self::default()
        }
    }

    pub fn count(query: impl Into<String>) -> Self {
        Self {
            query: Some(query.into()),
            count: true,
            ..Self::default()
        }
    }

    pub fn uid(name: impl Into<String>) -> Self {
        Self {
            uid: Some(name.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PublishEvent {
    #[serde(rename = "create")]
    Create,
    #[serde(rename = "update")]
    Update,
    #[serde(rename = "delete")]
    Delete,
    #[serde(rename = "newUID")]
    NewUid,
    #[serde(rename = "setUID")]
    SetUid,
    #[serde(rename = "renameUID")]
    RenameUid,
    #[serde(rename = "deleteUID")]
    DeleteUid,
}

impl PublishEvent {
    pub fn is_uid(self) -> bool {
        matches!(
            self,
            Self::NewUid | Self::SetUid | Self::RenameUid | Self::DeleteUid
        )
    }
}

/// An entity or UID change announced by another server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Publication {
    pub event: PublishEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guid: Option<Guid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<Entity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<i64>,
}

impl Publication {
    pub fn entity(event: PublishEvent, guid: Guid, etype: impl Into<String>, entity: Option<Entity>) -> Self {
        Self {
            event,
            guid: Some(guid),
            etype: Some(etype.into()),
            entity,
            name: None,
            old_name: None,
            new_name: None,
            value: None,
        }
    }

    pub fn uid(event: PublishEvent, name: impl Into<String>, value: Option<i64>) -> Self {
        Self {
            event,
            guid: None,
            etype: None,
            entity: None,
            name: Some(name.into()),
            old_name: None,
            new_name: None,
            value,
        }
    }

    pub fn rename_uid(old_name: impl Into<String>, new_name: impl Into<String>) -> Self {
        Self {
            event: PublishEvent::RenameUid,
            guid: None,
            etype: None,
            entity: None,
            name: None,
            old_name: Some(old_name.into()),
            new_name: Some(new_name.into()),
            value: None,
        }
    }
}

// ── Publisher → client ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    /// Full result, sent once when a subscription is made.
    Set { query: String, set: Vec<Entity> },
    Added { query: String, added: Guid, data: Entity },
    Updated { query: String, updated: Guid, data: Entity },
    Removed { query: String, removed: Guid },
    /// Result size, for count subscriptions.
    Count { query: String, count: u64 },
    /// A UID change relayed to the subscribers of `uid`.
    #[serde(rename_all = "camelCase")]
    Uid {
        uid: String,
        event: PublishEvent,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        old_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        new_name: Option<String>,
    },
}

impl ServerMessage {
    /// Query key the message belongs to, when it is a query message.
    pub fn query(&self) -> Option<&str> {
        match self {
            Self::Set { query, .. }
            | Self::Added { query, .. }
            | Self::Updated { query, .. }
            | Self::Removed { query, .. }
            | Self::Count { query, .. } => Some(query),
            Self::Uid { .. } => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
