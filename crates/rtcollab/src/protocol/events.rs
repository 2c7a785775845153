use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::fmt;

use super::InboundFrame;

/// Payload of a semantic collaboration frame
///
/// `changes`, `position`, `selection` and `content` are opaque to the
/// transport and passed through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollaborationEvent {
    pub user_id: Option<String>,
    pub user_name: Option<String>,
    /// Per-connection participant id; one user may hold several
    pub session_id: Option<String>,
    pub changes: Option<Vec<JsonValue>>,
    pub position: Option<JsonValue>,
    pub selection: Option<JsonValue>,
    pub content: Option<JsonValue>,
    /// Server-assigned save version
    pub version: Option<u64>,
    pub timestamp: Option<String>,
}

/// A participant currently present in a room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveUser {
    pub user_id: String,
    #[serde(default)]
    pub user_name: String,
    pub session_id: String,
    #[serde(default)]
    pub last_seen: String,
}

/// A push notification delivered on the notification channel
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(default)]
    pub id: Option<JsonValue>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    /// Every other field the server sent
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

/// An `error` frame, or a transport error raised locally
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorEvent {
    pub message: Option<String>,
    pub timestamp: Option<String>,
}

impl ErrorEvent {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            timestamp: Some(chrono::Utc::now().to_rfc3339()),
        }
    }

    /// The message, or a generic description when the server sent none
    pub fn description(&self) -> &str {
        self.message.as_deref().unwrap_or("Connection error")
    }
}

/// Inbound frame types with a typed meaning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ContentChange,
    CursorPosition,
    SelectionChange,
    UserJoined,
    UserLeft,
    ActiveUsers,
    TypingStart,
    TypingStop,
    ContentSaved,
    Notification,
    Error,
    Pong,
}

impl EventKind {
    pub const ALL: [EventKind; 12] = [
        EventKind::ContentChange,
        EventKind::CursorPosition,
        EventKind::SelectionChange,
        EventKind::UserJoined,
        EventKind::UserLeft,
        EventKind::ActiveUsers,
        EventKind::TypingStart,
        EventKind::TypingStop,
        EventKind::ContentSaved,
        EventKind::Notification,
        EventKind::Error,
        EventKind::Pong,
    ];

    /// Wire name of the frame type
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ContentChange => "content_change",
            EventKind::CursorPosition => "cursor_position",
            EventKind::SelectionChange => "selection_change",
            EventKind::UserJoined => "user_joined",
            EventKind::UserLeft => "user_left",
            EventKind::ActiveUsers => "active_users",
            EventKind::TypingStart => "typing_start",
            EventKind::TypingStop => "typing_stop",
            EventKind::ContentSaved => "content_saved",
            EventKind::Notification => "notification_message",
            EventKind::Error => "error",
            EventKind::Pong => "pong",
        }
    }

    /// Map a wire type string; `None` for types without a typed meaning
    pub fn from_type(kind: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == kind)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded inbound event, one variant per [`EventKind`]
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    ContentChange(CollaborationEvent),
    CursorPosition(CollaborationEvent),
    SelectionChange(CollaborationEvent),
    UserJoined(CollaborationEvent),
    UserLeft(CollaborationEvent),
    ActiveUsers(Vec<ActiveUser>),
    TypingStart(CollaborationEvent),
    TypingStop(CollaborationEvent),
    ContentSaved(CollaborationEvent),
    Notification(Notification),
    Error(ErrorEvent),
    Pong,
}

#[derive(Deserialize)]
struct ActiveUsersPayload {
    #[serde(default)]
    users: Vec<ActiveUser>,
}

impl InboundEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            InboundEvent::ContentChange(_) => EventKind::ContentChange,
            InboundEvent::CursorPosition(_) => EventKind::CursorPosition,
            InboundEvent::SelectionChange(_) => EventKind::SelectionChange,
            InboundEvent::UserJoined(_) => EventKind::UserJoined,
            InboundEvent::UserLeft(_) => EventKind::UserLeft,
            InboundEvent::ActiveUsers(_) => EventKind::ActiveUsers,
            InboundEvent::TypingStart(_) => EventKind::TypingStart,
            InboundEvent::TypingStop(_) => EventKind::TypingStop,
            InboundEvent::ContentSaved(_) => EventKind::ContentSaved,
            InboundEvent::Notification(_) => EventKind::Notification,
            InboundEvent::Error(_) => EventKind::Error,
            InboundEvent::Pong => EventKind::Pong,
        }
    }

    /// The collaboration payload, for the variants that carry one
    pub fn collaboration(&self) -> Option<&CollaborationEvent> {
        match self {
            InboundEvent::ContentChange(event)
            | InboundEvent::CursorPosition(event)
            | InboundEvent::SelectionChange(event)
            | InboundEvent::UserJoined(event)
            | InboundEvent::UserLeft(event)
            | InboundEvent::TypingStart(event)
            | InboundEvent::TypingStop(event)
            | InboundEvent::ContentSaved(event) => Some(event),
            _ => None,
        }
    }

    /// Decode a frame into its typed event
    ///
    /// Returns `Ok(None)` for frame types without a typed meaning, and an
    /// error when a known type carries a payload of the wrong shape.
    pub fn from_frame(frame: &InboundFrame) -> crate::CollabResult<Option<Self>> {
        let Some(kind) = EventKind::from_type(&frame.kind) else {
            return Ok(None);
        };
        let fields = JsonValue::Object(frame.fields());

        let event = match kind {
            EventKind::ContentChange => {
                InboundEvent::ContentChange(serde_json::from_value(fields)?)
            }
            EventKind::CursorPosition => {
                InboundEvent::CursorPosition(serde_json::from_value(fields)?)
            }
            EventKind::SelectionChange => {
                InboundEvent::SelectionChange(serde_json::from_value(fields)?)
            }
            EventKind::UserJoined => InboundEvent::UserJoined(serde_json::from_value(fields)?),
            EventKind::UserLeft => InboundEvent::UserLeft(serde_json::from_value(fields)?),
            EventKind::ActiveUsers => {
                let payload: ActiveUsersPayload = serde_json::from_value(fields)?;
                InboundEvent::ActiveUsers(payload.users)
            }
            EventKind::TypingStart => InboundEvent::TypingStart(serde_json::from_value(fields)?),
            EventKind::TypingStop => InboundEvent::TypingStop(serde_json::from_value(fields)?),
            EventKind::ContentSaved => InboundEvent::ContentSaved(serde_json::from_value(fields)?),
            EventKind::Notification => InboundEvent::Notification(serde_json::from_value(fields)?),
            EventKind::Error => InboundEvent::Error(serde_json::from_value(fields)?),
            EventKind::Pong => InboundEvent::Pong,
        };

        Ok(Some(event))
    }
}
