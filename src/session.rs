//! # Debate Session
//!
//! ## Responsibility
//! Owns one conversation: opens streams through a [`DebateTransport`], pumps
//! decoded events through the interpreter and a [`TurnBuffer`], and publishes
//! every change as a whole [`ConversationState`] snapshot on a watch channel.
//!
//! ## Guarantees
//! - At most one primary stream per session; starting another cancels the first.
//! - A cancelled stream never touches the state again (checked under the
//!   channel lock), so an abort or reset cannot be overwritten by a late flush.
//! - Subscribers only ever observe complete batches.
//!
//! ## NOT Responsible For
//! - Retrying failed streams. Errors go back to the caller.
//! - Stalled streams. There is no watchdog; the server or the caller ends them.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::audio::{AudioCache, AudioResolver, UrlAudioResolver};
use crate::config::DebateConfig;
use crate::conversation::{ConversationState, Message};
use crate::decoder::{decode_stream, DecodeOptions};
use crate::error::DebateError;
use crate::events::StreamEvent;
use crate::interpreter::{self, Applied, InterpretContext};
use crate::store::{MemorySessionStore, SessionStore, StoredSession};
use crate::transport::{DebateRequest, DebateTransport, SpeechRequest};
use crate::turn_buffer::{PacingConfig, TurnBuffer};

/// How a stream ended when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEnd {
    /// The server closed the stream.
    Finished,
    /// `abort_active_stream`, `reset_conversation` or a newer stream cancelled it.
    Cancelled,
    /// The server closed the stream after reporting an `error` event.
    ServerError(String),
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct DebateSession<T> {
    transport: T,
    store: Arc<dyn SessionStore>,
    resolver: Arc<dyn AudioResolver>,
    pacing: PacingConfig,
    decode: DecodeOptions,
    participants: Vec<String>,
    state: watch::Sender<ConversationState>,
    active: Mutex<Option<CancellationToken>>,
    speech: Mutex<Option<CancellationToken>>,
    audio: Mutex<AudioCache>,
}

/// Builder for [`DebateSession`].
pub struct DebateSessionBuilder<T> {
    transport: T,
    store: Option<Arc<dyn SessionStore>>,
    resolver: Option<Arc<dyn AudioResolver>>,
    pacing: PacingConfig,
    decode: DecodeOptions,
    participants: Vec<String>,
}

impl<T: DebateTransport> DebateSessionBuilder<T> {
    pub fn store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn AudioResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn pacing(mut self, pacing: PacingConfig) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn decode_options(mut self, decode: DecodeOptions) -> Self {
        self.decode = decode;
        self
    }

    pub fn participants(mut self, participants: Vec<String>) -> Self {
        self.participants = participants;
        self
    }

    /// Take pacing, decoding, participants and the audio base from `config`.
    pub fn config(self, config: &DebateConfig) -> Self {
        self.pacing(config.pacing())
            .decode_options(config.decode_options())
            .participants(config.participants.clone())
            .resolver(Arc::new(UrlAudioResolver::new(config.audio_base())))
    }

    pub fn build(self) -> DebateSession<T> {
        let (state, _) = watch::channel(ConversationState::default());
        DebateSession {
            transport: self.transport,
            store: self.store.unwrap_or_else(|| Arc::new(MemorySessionStore::new())),
            resolver: self.resolver.unwrap_or_else(|| Arc::new(UrlAudioResolver::new(""))),
            pacing: self.pacing,
            decode: self.decode,
            participants: self.participants,
            state,
            active: Mutex::new(None),
            speech: Mutex::new(None),
            audio: Mutex::new(AudioCache::default()),
        }
    }
}

impl<T: DebateTransport> DebateSession<T> {
    pub fn builder(transport: T) -> DebateSessionBuilder<T> {
        DebateSessionBuilder {
            transport,
            store: None,
            resolver: None,
            pacing: PacingConfig::default(),
            decode: DecodeOptions::default(),
            participants: DebateConfig::default().participants,
        }
    }

    /// Receive every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<ConversationState> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> ConversationState {
        self.state.borrow().clone()
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn cached_audio(&self, turn_id: i64) -> Option<String> {
        lock(&self.audio).get(turn_id).map(str::to_string)
    }

    pub fn is_streaming(&self) -> bool {
        lock(&self.active).is_some()
    }

    // -----------------------------------------------------------------------
    // Entry points
    // -----------------------------------------------------------------------

    /// Post `topic` as a user message and stream a new debate about it.
    pub async fn start_debate(&self, topic: &str) -> Result<StreamEnd, DebateError> {
        self.push_user_message(topic);
        let request = DebateRequest::Start {
            topic: topic.to_string(),
            participants: self.participants.clone(),
        };
        self.start_turn(request).await
    }

    /// Post `text` and stream the responses. Opens a new debate when the
    /// backend has not assigned a session yet.
    pub async fn send_user_message(&self, text: &str) -> Result<StreamEnd, DebateError> {
        self.push_user_message(text);
        let session_id = self.state.borrow().session_id;
        let request = match session_id {
            Some(session_id) => DebateRequest::Inject { session_id, text: text.to_string() },
            None => DebateRequest::Start {
                topic: text.to_string(),
                participants: self.participants.clone(),
            },
        };
        self.start_turn(request).await
    }

    /// Open a stream for `request` and apply it until it ends.
    ///
    /// Cancels any stream already running on this session. Transport failures
    /// before the first byte come back as `Err` with the loading flag cleared.
    pub async fn start_turn(&self, request: DebateRequest) -> Result<StreamEnd, DebateError> {
        let cancel = self.replace_active();
        self.commit(&cancel, |state| {
            state.loading = true;
            state.streaming_turn = None;
            state.speaking = None;
            true
        });

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(StreamEnd::Cancelled),
            opened = self.transport.open_stream(&request, &cancel) => opened,
        };
        let bytes = match opened {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "failed to open debate stream");
                self.commit(&cancel, |state| {
                    state.stop_indicators();
                    true
                });
                self.release(&cancel);
                return Err(e);
            }
        };

        let records = decode_stream(bytes, cancel.clone(), self.decode);
        let result = self.pump(records, &cancel).await;
        self.release(&cancel);
        result
    }

    /// Cancel the running stream and any speech fetch. Pending text is
    /// discarded; already revealed text stays.
    pub fn abort_active_stream(&self) {
        if let Some(token) = lock(&self.active).take() {
            tracing::info!("aborting active stream");
            token.cancel();
        }
        if let Some(token) = lock(&self.speech).take() {
            token.cancel();
        }
        self.state.send_if_modified(|state| {
            let was_busy = state.loading || state.streaming_turn.is_some() || state.speaking.is_some();
            state.stop_indicators();
            was_busy
        });
    }

    /// Abort everything and start over with an empty conversation.
    pub fn reset_conversation(&self) {
        self.abort_active_stream();
        lock(&self.audio).clear();
        self.state.send_replace(ConversationState::default());
        tracing::info!("conversation reset");
    }

    /// Replace the conversation with a stored session. Returns `false` when
    /// the store has no such session.
    pub fn resume(&self, session_id: i64) -> Result<bool, DebateError> {
        let Some(stored) = self.store.load(session_id)? else {
            return Ok(false);
        };
        self.abort_active_stream();
        let state = stored.into_state();
        {
            let mut audio = lock(&self.audio);
            audio.clear();
            for turn in state.turns() {
                if let Some(url) = &turn.audio_url {
                    audio.insert(turn.turn_id, url.clone());
                }
            }
        }
        self.state.send_replace(state);
        tracing::info!(session_id, "session resumed");
        Ok(true)
    }

    /// Audio for a turn: from the cache, or synthesized, resolved, cached and
    /// attached to the turn. `Ok(None)` when there is nothing to speak, the
    /// backend has no audio, or the fetch was cancelled.
    pub async fn speak_turn(&self, turn_id: i64) -> Result<Option<String>, DebateError> {
        if let Some(url) = self.cached_audio(turn_id) {
            return Ok(Some(url));
        }
        let request = {
            let state = self.state.borrow();
            let turn = state.turn(turn_id).ok_or(DebateError::UnknownTurn(turn_id))?;
            SpeechRequest { text: turn.text.clone(), speaker: turn.speaker.clone() }
        };
        if request.text.trim().is_empty() {
            return Ok(None);
        }

        let token = CancellationToken::new();
        if let Some(previous) = lock(&self.speech).replace(token.clone()) {
            previous.cancel();
        }
        let fetched = self.transport.synthesize(&request, &token).await;
        {
            let mut slot = lock(&self.speech);
            if !token.is_cancelled() {
                *slot = None;
            }
        }
        let Some(filename) = fetched? else {
            return Ok(None);
        };
        if token.is_cancelled() {
            return Ok(None);
        }

        let url = self.resolver.resolve(&filename, &request.speaker);
        lock(&self.audio).insert(turn_id, url.clone());
        self.state.send_if_modified(|state| match state.turn_mut(turn_id) {
            Some(turn) => {
                turn.audio_url = Some(url.clone());
                true
            }
            None => false,
        });
        Ok(Some(url))
    }

    // -----------------------------------------------------------------------
    // Pump
    // -----------------------------------------------------------------------

    async fn pump<S>(&self, records: S, cancel: &CancellationToken) -> Result<StreamEnd, DebateError>
    where
        S: Stream<Item = Result<Value, DebateError>> + Send,
    {
        let mut records = std::pin::pin!(records);
        let mut buffer = TurnBuffer::new(self.pacing);
        let mut server_error: Option<String> = None;

        loop {
            let deadline = buffer.next_flush();
            let flush_timer = async move {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    buffer.clear();
                    tracing::debug!("stream cancelled; pending text discarded");
                    return Ok(StreamEnd::Cancelled);
                }
                _ = flush_timer => {
                    let now = Instant::now();
                    self.commit(cancel, |state| {
                        let mut changed = false;
                        buffer.flush_due(now, |batch| changed = interpreter::apply_reveals(state, batch));
                        changed
                    });
                }
                next = records.next() => match next {
                    Some(Ok(value)) => {
                        let Some(event) = StreamEvent::from_value(value) else {
                            continue;
                        };
                        tracing::trace!(kind = event.kind(), turn_id = ?event.turn_id(), "stream event");
                        let applied = self.interpret(&mut buffer, cancel, event);
                        if let Applied::ServerError(message) = &applied {
                            server_error = Some(message.clone());
                        }
                        if applied.wants_persist() {
                            self.persist(cancel).await;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "debate stream broke mid-response");
                        let note = format!("Connection lost: {e}");
                        self.finish(&mut buffer, cancel, Some(note)).await;
                        return Err(e);
                    }
                    None if cancel.is_cancelled() => {
                        buffer.clear();
                        return Ok(StreamEnd::Cancelled);
                    }
                    None => {
                        self.finish(&mut buffer, cancel, None).await;
                        tracing::debug!("debate stream finished");
                        return Ok(match server_error {
                            Some(message) => StreamEnd::ServerError(message),
                            None => StreamEnd::Finished,
                        });
                    }
                }
            }
        }
    }

    fn interpret(&self, buffer: &mut TurnBuffer, cancel: &CancellationToken, event: StreamEvent) -> Applied {
        let mut audio = lock(&self.audio);
        let now = Instant::now();
        let mut applied = Applied::Ignored;
        self.commit(cancel, |state| {
            let mut ctx = InterpretContext {
                buffer,
                audio: &mut audio,
                resolver: self.resolver.as_ref(),
                now,
            };
            applied = interpreter::apply(&mut ctx, state, event);
            applied.changed_state()
        });
        applied
    }

    /// Stream is over: reveal everything still buffered, drop the indicators,
    /// optionally leave a note, and save.
    async fn finish(&self, buffer: &mut TurnBuffer, cancel: &CancellationToken, note: Option<String>) {
        self.commit(cancel, |state| {
            buffer.drain_all(|batch| {
                interpreter::apply_reveals(state, batch);
            });
            state.stop_indicators();
            if let Some(text) = note {
                state.messages.push(Message::Notice { text });
            }
            true
        });
        self.persist(cancel).await;
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Apply `f` unless `cancel` has fired. Runs under the channel lock.
    fn commit<F>(&self, cancel: &CancellationToken, f: F) -> bool
    where
        F: FnOnce(&mut ConversationState) -> bool,
    {
        self.state.send_if_modified(|state| {
            if cancel.is_cancelled() {
                return false;
            }
            f(state)
        })
    }

    fn push_user_message(&self, text: &str) {
        self.state.send_modify(|state| {
            state.messages.push(Message::User { text: text.to_string() });
        });
    }

    fn replace_active(&self) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some(previous) = lock(&self.active).replace(token.clone()) {
            tracing::debug!("cancelling previous stream");
            previous.cancel();
        }
        token
    }

    fn release(&self, token: &CancellationToken) {
        let mut slot = lock(&self.active);
        // A live token can only be the one in the slot; replaced ones are cancelled.
        if !token.is_cancelled() {
            *slot = None;
        }
    }

    /// Save the current snapshot. Store I/O runs on the blocking pool and is
    /// awaited, so saves from one stream land in order.
    async fn persist(&self, cancel: &CancellationToken) {
        if cancel.is_cancelled() {
            return;
        }
        let snapshot = self.state.borrow().clone();
        let Some(session_id) = snapshot.session_id else {
            return;
        };
        let store = Arc::clone(&self.store);
        match tokio::task::spawn_blocking(move || save_snapshot(store.as_ref(), &snapshot)).await {
            Ok(Ok(Some(messages))) => tracing::debug!(session_id, messages, "session saved"),
            Ok(Ok(None)) => {}
            Ok(Err(e)) => tracing::warn!(session_id, error = %e, "could not save session"),
            Err(e) => tracing::warn!(session_id, error = %e, "session save task failed"),
        }
    }
}

/// Upsert `snapshot`, keeping the stored creation time. Returns the number of
/// messages written, or `None` when the snapshot has no session id.
fn save_snapshot(store: &dyn SessionStore, snapshot: &ConversationState) -> Result<Option<usize>, DebateError> {
    let Some(session_id) = snapshot.session_id else {
        return Ok(None);
    };
    let previous = match store.load(session_id) {
        Ok(previous) => previous,
        Err(e) => {
            tracing::warn!(session_id, error = %e, "could not read stored session");
            None
        }
    };
    let Some(record) = StoredSession::from_state(snapshot, previous.as_ref()) else {
        return Ok(None);
    };
    store.save(&record)?;
    Ok(Some(record.messages.len()))
}
