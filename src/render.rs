//! Incremental terminal rendering of conversation snapshots.

use std::collections::HashMap;

use colored::*;

use crate::conversation::{ConversationState, Message};

/// Turns successive snapshots into only the text that is new since the last
/// call. Speaker headers are printed when output switches to another turn.
#[derive(Debug, Default)]
pub struct TranscriptPrinter {
    // Text already printed per turn. A snapshot whose turn text no longer
    // starts with this was replaced (reset or resume) and is printed afresh.
    printed: HashMap<i64, String>,
    seen_messages: usize,
    current_turn: Option<i64>,
    session_id: Option<i64>,
    plain: bool,
}

impl TranscriptPrinter {
    pub fn new() -> Self {
        Self::default()
    }

    /// No ANSI styling.
    pub fn plain() -> Self {
        Self { plain: true, ..Self::default() }
    }

    pub fn render(&mut self, state: &ConversationState) -> String {
        let switched_session = self.session_id.is_some() && state.session_id != self.session_id;
        if switched_session || state.messages.len() < self.seen_messages {
            // conversation was reset or replaced
            self.printed.clear();
            self.seen_messages = 0;
            self.current_turn = None;
        }
        self.session_id = state.session_id;

        let mut out = String::new();
        for (idx, message) in state.messages.iter().enumerate() {
            let is_new = idx >= self.seen_messages;
            match message {
                Message::User { text } if is_new => {
                    self.current_turn = None;
                    out.push_str(&format!("\n{} {}\n", self.style_user(">"), text));
                }
                Message::Notice { text } if is_new => {
                    self.current_turn = None;
                    out.push_str(&format!("\n{} {}\n", self.style_notice("[!]"), text));
                }
                Message::Turn(turn) => {
                    let done = match self.printed.get(&turn.turn_id) {
                        Some(prev) if turn.text.starts_with(prev.as_str()) => prev.len(),
                        Some(_) => {
                            self.current_turn = None;
                            0
                        }
                        None => 0,
                    };
                    if turn.text.len() <= done {
                        continue;
                    }
                    if self.current_turn != Some(turn.turn_id) {
                        out.push_str(&format!("\n{}: ", self.style_speaker(&turn.speaker)));
                        self.current_turn = Some(turn.turn_id);
                    }
                    out.push_str(&turn.text[done..]);
                    self.printed.insert(turn.turn_id, turn.text.clone());
                }
                _ => {}
            }
        }
        self.seen_messages = state.messages.len();
        out
    }

    fn style_user(&self, s: &str) -> String {
        if self.plain {
            s.to_string()
        } else {
            s.bright_yellow().bold().to_string()
        }
    }

    fn style_notice(&self, s: &str) -> String {
        if self.plain {
            s.to_string()
        } else {
            s.bright_red().bold().to_string()
        }
    }

    fn style_speaker(&self, s: &str) -> String {
        if self.plain {
            s.to_string()
        } else {
            s.bright_cyan().bold().to_string()
        }
    }
}
