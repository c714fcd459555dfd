use serde::{Deserialize, Serialize};

// -- Wire events ------------------------------------------------------------

/// A reference excerpt attached to a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceItem {
    pub title: String,
    pub snippet: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<i64>,
}

/// One NDJSON record from the debate stream, tagged on `"type"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Session {
        session_id: i64,
    },
    Turn {
        turn_id: i64,
        speaker: String,
    },
    Sources {
        turn_id: i64,
        #[serde(default)]
        speaker: String,
        #[serde(default)]
        items: Vec<SourceItem>,
    },
    Delta {
        turn_id: i64,
        #[serde(default)]
        speaker: String,
        delta: String,
    },
    #[serde(rename = "endturn")]
    EndTurn {
        turn_id: i64,
        #[serde(default)]
        speaker: String,
    },
    Error {
        message: String,
    },
}

impl StreamEvent {
    /// Cast a decoded record. Returns `None` for unknown `type` tags or
    /// records missing required fields.
    pub fn from_value(value: serde_json::Value) -> Option<Self> {
        match serde_json::from_value(value) {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::debug!(error = %e, "ignoring unrecognized stream record");
                None
            }
        }
    }

    /// The turn this event belongs to, if any.
    pub fn turn_id(&self) -> Option<i64> {
        match self {
            StreamEvent::Turn { turn_id, .. }
            | StreamEvent::Sources { turn_id, .. }
            | StreamEvent::Delta { turn_id, .. }
            | StreamEvent::EndTurn { turn_id, .. } => Some(*turn_id),
            StreamEvent::Session { .. } | StreamEvent::Error { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Session { .. } => "session",
            StreamEvent::Turn { .. } => "turn",
            StreamEvent::Sources { .. } => "sources",
            StreamEvent::Delta { .. } => "delta",
            StreamEvent::EndTurn { .. } => "endturn",
            StreamEvent::Error { .. } => "error",
        }
    }
}

// -- Delta payload ----------------------------------------------------------

/// Text and optional audio filename carried by a `delta` record.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeltaPayload {
    pub text: String,
    pub audio: Option<String>,
}

#[derive(Deserialize)]
struct DeltaEnvelope {
    text: String,
    #[serde(default)]
    audio: Option<String>,
}

impl DeltaPayload {
    /// Unwrap a raw delta string.
    ///
    /// The backend sometimes sends `{"text": "...", "audio": "file.mp3"}` as the
    /// delta string itself. Anything that does not parse as such an object is
    /// plain text, whitespace included.
    pub fn unwrap(raw: &str) -> Self {
        if raw.trim_start().starts_with('{') {
            if let Ok(envelope) = serde_json::from_str::<DeltaEnvelope>(raw) {
                return DeltaPayload {
                    text: envelope.text,
                    audio: envelope.audio.filter(|a| !a.is_empty()),
                };
            }
        }
        DeltaPayload { text: raw.to_string(), audio: None }
    }
}
