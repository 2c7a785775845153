use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

pub mod events;
pub mod resource;

pub use events::{
    ActiveUser, CollaborationEvent, ErrorEvent, EventKind, InboundEvent, Notification,
};
pub use resource::{ResourceIdentity, ResourceType};

/// The outbound wire unit: `{ type, data?, timestamp? }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl Frame {
    /// Create a frame with no payload
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            data: None,
            timestamp: None,
        }
    }

    /// Create a frame carrying a `data` payload
    pub fn with_data(kind: impl Into<String>, data: JsonValue) -> Self {
        Self {
            kind: kind.into(),
            data: Some(data),
            timestamp: None,
        }
    }

    /// Heartbeat frame stamped with the current time
    pub fn ping() -> Self {
        Self {
            kind: "ping".to_string(),
            data: None,
            timestamp: Some(chrono::Utc::now().to_rfc3339()),
        }
    }

    /// Build the frame for a typed outbound message
    pub fn from_message(message: &OutboundMessage) -> crate::CollabResult<Self> {
        let value = serde_json::to_value(message)?;
        Ok(serde_json::from_value(value)?)
    }

    /// Encode as a JSON text frame
    pub fn encode(&self) -> crate::CollabResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Messages sent from client to server
///
/// Serialized adjacently tagged, so every message lands on the wire as
/// `{"type": "...", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum OutboundMessage {
    ContentChange {
        changes: Vec<JsonValue>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<u64>,
    },
    CursorPosition {
        position: JsonValue,
    },
    SelectionChange {
        selection: JsonValue,
    },
    SaveContent {
        content: JsonValue,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<u64>,
    },
    TypingStart {},
    TypingStop {},
    MarkRead {
        notification_id: String,
    },
}

/// A parsed inbound text frame
///
/// The server sends flattened objects: `type` plus every other top-level
/// field as the payload.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame {
    pub kind: String,
    pub payload: Map<String, JsonValue>,
}

impl InboundFrame {
    pub fn new(kind: impl Into<String>, payload: Map<String, JsonValue>) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    /// Parse a JSON text frame
    pub fn parse(text: &str) -> crate::CollabResult<Self> {
        let value: JsonValue = serde_json::from_str(text)?;
        let JsonValue::Object(mut payload) = value else {
            return Err(crate::CollabError::protocol("frame is not a JSON object"));
        };

        let kind = match payload.remove("type") {
            Some(JsonValue::String(kind)) => kind,
            _ => {
                return Err(crate::CollabError::protocol(
                    "frame has no string `type` field",
                ))
            }
        };

        Ok(Self { kind, payload })
    }

    /// Payload fields used for typed decoding
    ///
    /// Envelope frames (`{type, data: {...}, timestamp?}`) are unwrapped so
    /// both shapes decode the same way.
    pub fn fields(&self) -> Map<String, JsonValue> {
        let is_envelope = self
            .payload
            .keys()
            .all(|key| key == "data" || key == "timestamp");

        match self.payload.get("data") {
            Some(JsonValue::Object(data)) if is_envelope => {
                let mut merged = data.clone();
                if let Some(timestamp) = self.payload.get("timestamp") {
                    merged
                        .entry("timestamp")
                        .or_insert_with(|| timestamp.clone());
                }
                merged
            }
            _ => self.payload.clone(),
        }
    }

    /// The full frame as a JSON object, `type` included
    pub fn to_value(&self) -> JsonValue {
        let mut object = self.payload.clone();
        object.insert("type".to_string(), JsonValue::String(self.kind.clone()));
        JsonValue::Object(object)
    }
}
