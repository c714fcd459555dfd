//! Conversation state published to the UI layer.

use serde::{Deserialize, Serialize};

use crate::events::SourceItem;

/// One assistant (or judge) contribution, identified by the server's turn id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub turn_id: i64,
    pub speaker: String,
    /// Revealed text. Append-only until `ended`.
    pub text: String,
    #[serde(default)]
    pub sources: Vec<SourceItem>,
    #[serde(default)]
    pub audio_url: Option<String>,
    /// Set by `endturn`; no text is appended afterwards.
    #[serde(default)]
    pub ended: bool,
}

impl ConversationTurn {
    pub fn new(turn_id: i64, speaker: impl Into<String>) -> Self {
        Self {
            turn_id,
            speaker: speaker.into(),
            text: String::new(),
            sources: Vec::new(),
            audio_url: None,
            ended: false,
        }
    }
}

/// An entry in the transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum Message {
    User { text: String },
    #[serde(rename = "assistant")]
    Turn(ConversationTurn),
    /// A visible, non-fatal note such as a server-reported stream error.
    Notice { text: String },
}

/// Snapshot of a conversation as the UI sees it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    pub session_id: Option<i64>,
    pub messages: Vec<Message>,
    pub loading: bool,
    /// The turn currently receiving text, for the typing indicator.
    pub streaming_turn: Option<i64>,
    /// Speaker of `streaming_turn`.
    pub speaking: Option<String>,
}

impl ConversationState {
    pub fn turn(&self, turn_id: i64) -> Option<&ConversationTurn> {
        self.messages.iter().find_map(|m| match m {
            Message::Turn(t) if t.turn_id == turn_id => Some(t),
            _ => None,
        })
    }

    pub fn turn_mut(&mut self, turn_id: i64) -> Option<&mut ConversationTurn> {
        self.messages.iter_mut().find_map(|m| match m {
            Message::Turn(t) if t.turn_id == turn_id => Some(t),
            _ => None,
        })
    }

    pub fn turns(&self) -> impl Iterator<Item = &ConversationTurn> {
        self.messages.iter().filter_map(|m| match m {
            Message::Turn(t) => Some(t),
            _ => None,
        })
    }

    pub fn first_user_text(&self) -> Option<&str> {
        self.messages.iter().find_map(|m| match m {
            Message::User { text } => Some(text.as_str()),
            _ => None,
        })
    }

    pub fn notices(&self) -> impl Iterator<Item = &str> {
        self.messages.iter().filter_map(|m| match m {
            Message::Notice { text } => Some(text.as_str()),
            _ => None,
        })
    }

    /// Clear the loading and typing indicators.
    pub fn stop_indicators(&mut self) {
        self.loading = false;
        self.streaming_turn = None;
        self.speaking = None;
    }
}
