//! Applies decoded stream events to a [`ConversationState`].
//!
//! Text never goes straight into the transcript: `delta` hands it to the
//! [`TurnBuffer`], and the session pump moves it over with [`apply_reveals`].

use tokio::time::Instant;

use crate::audio::{AudioCache, AudioResolver};
use crate::conversation::{ConversationState, ConversationTurn, Message};
use crate::events::{DeltaPayload, StreamEvent};
use crate::turn_buffer::{Reveal, TurnBuffer};

/// What the session needs to interpret one event, besides the state itself.
pub struct InterpretContext<'a> {
    pub buffer: &'a mut TurnBuffer,
    pub audio: &'a mut AudioCache,
    pub resolver: &'a dyn AudioResolver,
    pub now: Instant,
}

/// Outcome of applying one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// Nothing to do (duplicate turn, unknown turn, frozen turn).
    Ignored,
    /// Text went into the buffer; the transcript is unchanged.
    Buffered,
    /// The transcript or indicators changed.
    Changed,
    SessionAssigned(i64),
    TurnEnded(i64),
    ServerError(String),
}

impl Applied {
    /// Whether subscribers need a fresh snapshot.
    pub fn changed_state(&self) -> bool {
        !matches!(self, Applied::Ignored | Applied::Buffered)
    }

    /// Whether the session record should be saved after this event.
    pub fn wants_persist(&self) -> bool {
        matches!(
            self,
            Applied::SessionAssigned(_) | Applied::TurnEnded(_) | Applied::ServerError(_)
        )
    }
}

pub fn apply(ctx: &mut InterpretContext<'_>, state: &mut ConversationState, event: StreamEvent) -> Applied {
    match event {
        StreamEvent::Session { session_id } => {
            tracing::info!(session_id, "session assigned");
            state.session_id = Some(session_id);
            Applied::SessionAssigned(session_id)
        }

        StreamEvent::Turn { turn_id, speaker } => {
            if state.turn(turn_id).is_some() {
                tracing::warn!(turn_id, "duplicate turn event ignored");
                return Applied::Ignored;
            }
            tracing::debug!(turn_id, %speaker, "turn started");
            state.messages.push(Message::Turn(ConversationTurn::new(turn_id, speaker.clone())));
            state.streaming_turn = Some(turn_id);
            state.speaking = Some(speaker);
            ctx.buffer.begin_turn(turn_id, ctx.now);
            Applied::Changed
        }

        StreamEvent::Sources { turn_id, items, .. } => match state.turn_mut(turn_id) {
            Some(turn) => {
                turn.sources = items;
                Applied::Changed
            }
            None => {
                tracing::debug!(turn_id, "sources for unknown turn");
                Applied::Ignored
            }
        },

        StreamEvent::Delta { turn_id, speaker, delta } => {
            let payload = DeltaPayload::unwrap(&delta);
            let mut changed = false;

            if state.turn(turn_id).is_none() {
                tracing::debug!(turn_id, "delta before turn event; creating turn");
                state.messages.push(Message::Turn(ConversationTurn::new(turn_id, speaker)));
                ctx.buffer.begin_turn(turn_id, ctx.now);
                changed = true;
            }
            let Some(turn) = state.turn_mut(turn_id) else {
                return Applied::Ignored;
            };
            if turn.ended {
                tracing::warn!(turn_id, "delta after endturn dropped");
                return Applied::Ignored;
            }

            if let Some(filename) = payload.audio.as_deref() {
                let url = ctx.resolver.resolve(filename, &turn.speaker);
                ctx.audio.insert(turn_id, url.clone());
                turn.audio_url = Some(url);
                changed = true;
            }
            ctx.buffer.push(turn_id, &payload.text, ctx.now);

            if changed {
                Applied::Changed
            } else {
                Applied::Buffered
            }
        }

        StreamEvent::EndTurn { turn_id, .. } => {
            ctx.buffer.end_turn(turn_id, |reveal| {
                append_reveal(state, reveal);
            });
            match state.turn_mut(turn_id) {
                Some(turn) => turn.ended = true,
                None => {
                    tracing::debug!(turn_id, "endturn for unknown turn");
                    return Applied::Ignored;
                }
            }
            if state.streaming_turn == Some(turn_id) {
                state.streaming_turn = None;
                state.speaking = None;
            }
            tracing::debug!(turn_id, "turn ended");
            Applied::TurnEnded(turn_id)
        }

        StreamEvent::Error { message } => {
            tracing::warn!(%message, "server reported stream error");
            state.stop_indicators();
            state.messages.push(Message::Notice { text: message.clone() });
            Applied::ServerError(message)
        }
    }
}

/// Move a flushed batch into the transcript. Returns whether any text landed.
pub fn apply_reveals(state: &mut ConversationState, reveals: &[Reveal]) -> bool {
    let mut changed = false;
    for reveal in reveals {
        changed |= append_reveal(state, reveal);
    }
    changed
}

fn append_reveal(state: &mut ConversationState, reveal: &Reveal) -> bool {
    match state.turn_mut(reveal.turn_id) {
        Some(turn) if !turn.ended => {
            turn.text.push_str(&reveal.text);
            true
        }
        Some(_) => {
            tracing::warn!(turn_id = reveal.turn_id, "reveal for ended turn dropped");
            false
        }
        None => {
            tracing::warn!(turn_id = reveal.turn_id, "reveal for unknown turn dropped");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::UrlAudioResolver;
    use crate::events::SourceItem;
    use crate::turn_buffer::PacingConfig;
    use std::time::Duration;

    struct Harness {
        buffer: TurnBuffer,
        audio: AudioCache,
        resolver: UrlAudioResolver,
        state: ConversationState,
        t0: Instant,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                buffer: TurnBuffer::new(PacingConfig {
                    dwell: Duration::from_millis(200),
                    frame: Duration::from_millis(16),
                }),
                audio: AudioCache::default(),
                resolver: UrlAudioResolver::new("http://api"),
                state: ConversationState::default(),
                t0: Instant::now(),
            }
        }

        fn feed_at(&mut self, offset_ms: u64, event: StreamEvent) -> Applied {
            let mut ctx = InterpretContext {
                buffer: &mut self.buffer,
                audio: &mut self.audio,
                resolver: &self.resolver,
                now: self.t0 + Duration::from_millis(offset_ms),
            };
            apply(&mut ctx, &mut self.state, event)
        }

        fn flush_at(&mut self, offset_ms: u64) {
            let state = &mut self.state;
            self.buffer
                .flush_due(self.t0 + Duration::from_millis(offset_ms), |batch| {
                    apply_reveals(state, batch);
                });
        }
    }

    fn turn(id: i64, speaker: &str) -> StreamEvent {
        StreamEvent::Turn { turn_id: id, speaker: speaker.to_string() }
    }

    fn delta(id: i64, text: &str) -> StreamEvent {
        StreamEvent::Delta { turn_id: id, speaker: "Pro".to_string(), delta: text.to_string() }
    }

    fn end(id: i64) -> StreamEvent {
        StreamEvent::EndTurn { turn_id: id, speaker: "Pro".to_string() }
    }

    #[test]
    fn test_session_event_records_id() {
        let mut h = Harness::new();
        let out = h.feed_at(0, StreamEvent::Session { session_id: 12 });
        assert_eq!(out, Applied::SessionAssigned(12));
        assert!(out.wants_persist());
        assert_eq!(h.state.session_id, Some(12));
    }

    #[test]
    fn test_turn_event_creates_turn_and_sets_indicators() {
        let mut h = Harness::new();
        assert_eq!(h.feed_at(0, turn(1, "Pro")), Applied::Changed);
        assert_eq!(h.state.streaming_turn, Some(1));
        assert_eq!(h.state.speaking.as_deref(), Some("Pro"));
        assert_eq!(h.state.turn(1).map(|t| t.text.as_str()), Some(""));
    }

    #[test]
    fn test_duplicate_turn_ignored() {
        let mut h = Harness::new();
        h.feed_at(0, turn(1, "Pro"));
        assert_eq!(h.feed_at(5, turn(1, "Pro")), Applied::Ignored);
        assert_eq!(h.state.turns().count(), 1);
    }

    #[test]
    fn test_sources_attach_or_noop() {
        let mut h = Harness::new();
        h.feed_at(0, turn(1, "Pro"));
        let items = vec![SourceItem { title: "T".into(), snippet: "S".into(), chunk_index: Some(0) }];
        let attach = StreamEvent::Sources { turn_id: 1, speaker: "Pro".into(), items: items.clone() };
        assert_eq!(h.feed_at(1, attach), Applied::Changed);
        assert_eq!(h.state.turn(1).expect("turn").sources, items);

        let orphan = StreamEvent::Sources { turn_id: 99, speaker: "X".into(), items };
        assert_eq!(h.feed_at(2, orphan), Applied::Ignored);
    }

    #[test]
    fn test_delta_is_buffered_not_rendered() {
        let mut h = Harness::new();
        h.feed_at(0, turn(1, "Pro"));
        assert_eq!(h.feed_at(10, delta(1, "Y")), Applied::Buffered);
        assert_eq!(h.state.turn(1).expect("turn").text, "");
        assert_eq!(h.buffer.pending(1), Some("Y"));
    }

    #[test]
    fn test_dwell_holds_fragments_through_interpreter() {
        let mut h = Harness::new();
        h.feed_at(0, turn(1, "Pro"));
        h.feed_at(10, delta(1, "Y"));
        h.flush_at(26);
        assert_eq!(h.state.turn(1).expect("turn").text, "");
        h.feed_at(150, delta(1, "our"));
        h.flush_at(166);
        assert_eq!(h.state.turn(1).expect("turn").text, "");
        h.flush_at(200);
        assert_eq!(h.state.turn(1).expect("turn").text, "Your");
    }

    #[test]
    fn test_delta_audio_attached_immediately() {
        let mut h = Harness::new();
        h.feed_at(0, turn(1, "Pro"));
        let out = h.feed_at(5, delta(1, r#"{"text":"Hello","audio":"t1.mp3"}"#));
        assert_eq!(out, Applied::Changed);
        let t = h.state.turn(1).expect("turn");
        assert_eq!(t.audio_url.as_deref(), Some("http://api/audio/t1.mp3"));
        assert_eq!(t.text, "");
        assert_eq!(h.audio.get(1), Some("http://api/audio/t1.mp3"));
        assert_eq!(h.buffer.pending(1), Some("Hello"));
    }

    #[test]
    fn test_delta_for_unknown_turn_creates_it() {
        let mut h = Harness::new();
        assert_eq!(h.feed_at(0, delta(5, "hi")), Applied::Changed);
        assert_eq!(h.state.turn(5).map(|t| t.speaker.as_str()), Some("Pro"));
        h.flush_at(200);
        assert_eq!(h.state.turn(5).expect("turn").text, "hi");
    }

    #[test]
    fn test_endturn_flushes_and_freezes() {
        let mut h = Harness::new();
        h.feed_at(0, turn(1, "Pro"));
        h.feed_at(10, delta(1, "quick"));
        assert_eq!(h.feed_at(20, end(1)), Applied::TurnEnded(1));
        let t = h.state.turn(1).expect("turn");
        assert_eq!(t.text, "quick");
        assert!(t.ended);
        assert!(h.state.streaming_turn.is_none());
        assert!(h.state.speaking.is_none());

        assert_eq!(h.feed_at(30, delta(1, "late")), Applied::Ignored);
        h.flush_at(500);
        assert_eq!(h.state.turn(1).expect("turn").text, "quick");
    }

    #[test]
    fn test_endturn_twice_no_duplicate_text() {
        let mut h = Harness::new();
        h.feed_at(0, turn(1, "Pro"));
        h.feed_at(10, delta(1, "once"));
        h.feed_at(20, end(1));
        h.feed_at(21, end(1));
        assert_eq!(h.state.turn(1).expect("turn").text, "once");
    }

    #[test]
    fn test_endturn_keeps_other_streaming_turn() {
        let mut h = Harness::new();
        h.feed_at(0, turn(1, "Pro"));
        h.feed_at(1, turn(2, "Con"));
        h.feed_at(2, end(1));
        assert_eq!(h.state.streaming_turn, Some(2));
        assert_eq!(h.state.speaking.as_deref(), Some("Con"));
    }

    #[test]
    fn test_error_event_keeps_revealed_text() {
        let mut h = Harness::new();
        h.state.loading = true;
        h.feed_at(0, turn(1, "Pro"));
        h.feed_at(10, delta(1, "one "));
        h.flush_at(200);
        h.feed_at(210, delta(1, "two "));
        h.flush_at(226);
        h.feed_at(230, delta(1, "three"));
        h.flush_at(246);
        assert_eq!(h.state.turn(1).expect("turn").text, "one two three");

        let out = h.feed_at(250, StreamEvent::Error { message: "model overloaded".into() });
        assert_eq!(out, Applied::ServerError("model overloaded".to_string()));
        assert!(!h.state.loading);
        assert!(h.state.streaming_turn.is_none());
        assert_eq!(h.state.turn(1).expect("turn").text, "one two three");
        assert_eq!(h.state.notices().collect::<Vec<_>>(), vec!["model overloaded"]);
    }

    #[test]
    fn test_applied_flags() {
        assert!(!Applied::Ignored.changed_state());
        assert!(!Applied::Buffered.changed_state());
        assert!(Applied::TurnEnded(1).changed_state());
        assert!(!Applied::Changed.wants_persist());
    }
}
