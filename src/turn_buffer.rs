//! # Turn Buffer & Paced Reveal
//!
//! ## Responsibility
//! Holds incoming text fragments per turn and decides when they move into the
//! visible transcript.
//!
//! ## Guarantees
//! - Fragments of one turn are revealed in arrival order, never interleaved.
//! - A turn's first reveal waits until `dwell` has passed since `begin_turn`.
//!   Everything pushed during the dwell is revealed together in one flush.
//! - `first_reveal_done` is set only after the caller's `apply` has consumed
//!   the batch (flush, then flag).
//! - At most one flush deadline is armed at a time, shared by all turns.
//!
//! ## NOT Responsible For
//! - Sleeping. The owner waits on [`TurnBuffer::next_flush`] and calls
//!   [`TurnBuffer::flush_due`] when it passes.
//! - Mutating the transcript. Reveals are handed to the caller.

use std::time::Duration;

use tokio::time::Instant;

/// Default minimum hidden time for a turn's first text.
pub const DEFAULT_DWELL: Duration = Duration::from_millis(180);

/// Default spacing between reveals once a turn is visible (one display frame).
pub const DEFAULT_FRAME: Duration = Duration::from_millis(16);

/// Reveal cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingConfig {
    pub dwell: Duration,
    pub frame: Duration,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self { dwell: DEFAULT_DWELL, frame: DEFAULT_FRAME }
    }
}

/// Text moved out of the buffer for one turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reveal {
    pub turn_id: i64,
    pub text: String,
}

#[derive(Debug)]
struct TurnBufferEntry {
    turn_id: i64,
    pending: String,
    first_reveal_done: bool,
    started_at: Instant,
}

impl TurnBufferEntry {
    fn dwell_ends(&self, pacing: &PacingConfig) -> Instant {
        self.started_at + pacing.dwell
    }
}

/// Per-turn pending text plus the single coalesced flush deadline.
#[derive(Debug, Default)]
pub struct TurnBuffer {
    pacing: PacingConfig,
    // Few live turns at once; a Vec keeps turn start order for batch output.
    entries: Vec<TurnBufferEntry>,
    scheduled: Option<Instant>,
}

impl TurnBuffer {
    pub fn new(pacing: PacingConfig) -> Self {
        Self { pacing, entries: Vec::new(), scheduled: None }
    }

    pub fn pacing(&self) -> PacingConfig {
        self.pacing
    }

    /// Start the dwell clock for `turn_id`. Repeated calls keep the first start.
    pub fn begin_turn(&mut self, turn_id: i64, now: Instant) {
        if self.entry(turn_id).is_none() {
            self.entries.push(TurnBufferEntry {
                turn_id,
                pending: String::new(),
                first_reveal_done: false,
                started_at: now,
            });
        }
    }

    /// Append a fragment and make sure a flush is scheduled.
    ///
    /// A fragment for a turn that never had `begin_turn` starts its dwell now.
    pub fn push(&mut self, turn_id: i64, text: &str, now: Instant) {
        if text.is_empty() {
            return;
        }
        self.begin_turn(turn_id, now);
        if let Some(entry) = self.entry_mut(turn_id) {
            entry.pending.push_str(text);
        }
        self.schedule(now + self.pacing.frame);
    }

    /// When the owner should call [`flush_due`](Self::flush_due) next.
    pub fn next_flush(&self) -> Option<Instant> {
        self.scheduled
    }

    /// Run the scheduled flush.
    ///
    /// Every turn that has pending text and is either already visible or past
    /// its dwell is handed to `apply` in a single batch. Turns still inside
    /// their dwell keep their text and the deadline is re-armed for the
    /// earliest dwell expiry. Returns the number of turns revealed.
    pub fn flush_due<F>(&mut self, now: Instant, apply: F) -> usize
    where
        F: FnOnce(&[Reveal]),
    {
        self.scheduled = None;
        let pacing = self.pacing;
        let mut batch = Vec::new();
        let mut rearm: Option<Instant> = None;

        for entry in self.entries.iter_mut().filter(|e| !e.pending.is_empty()) {
            if entry.first_reveal_done || now >= entry.dwell_ends(&pacing) {
                batch.push(Reveal { turn_id: entry.turn_id, text: std::mem::take(&mut entry.pending) });
            } else {
                let at = entry.dwell_ends(&pacing);
                rearm = Some(rearm.map_or(at, |r| r.min(at)));
            }
        }

        if let Some(at) = rearm {
            tracing::trace!(wait_ms = at.saturating_duration_since(now).as_millis() as u64, "flush deferred by dwell");
            self.schedule(at);
        }
        if batch.is_empty() {
            return 0;
        }

        apply(&batch);

        for reveal in &batch {
            if let Some(entry) = self.entry_mut(reveal.turn_id) {
                entry.first_reveal_done = true;
            }
        }
        batch.len()
    }

    /// Flush `turn_id` unconditionally and forget it.
    ///
    /// `apply` is called only when there is text left. Calling this for an
    /// empty or unknown turn does nothing.
    pub fn end_turn<F>(&mut self, turn_id: i64, apply: F)
    where
        F: FnOnce(&Reveal),
    {
        let Some(pos) = self.entries.iter().position(|e| e.turn_id == turn_id) else {
            return;
        };
        let entry = self.entries.remove(pos);
        if !entry.pending.is_empty() {
            apply(&Reveal { turn_id, text: entry.pending });
        }
        if !self.entries.iter().any(|e| !e.pending.is_empty()) {
            self.scheduled = None;
        }
    }

    /// Flush every turn unconditionally and empty the buffer.
    pub fn drain_all<F>(&mut self, apply: F)
    where
        F: FnOnce(&[Reveal]),
    {
        let batch: Vec<Reveal> = self
            .entries
            .drain(..)
            .filter(|e| !e.pending.is_empty())
            .map(|e| Reveal { turn_id: e.turn_id, text: e.pending })
            .collect();
        self.scheduled = None;
        if !batch.is_empty() {
            apply(&batch);
        }
    }

    /// Drop all pending text, dwell clocks, reveal flags and the deadline.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.scheduled = None;
    }

    pub fn is_revealed(&self, turn_id: i64) -> bool {
        self.entry(turn_id).is_some_and(|e| e.first_reveal_done)
    }

    pub fn pending(&self, turn_id: i64) -> Option<&str> {
        self.entry(turn_id).map(|e| e.pending.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn schedule(&mut self, at: Instant) {
        self.scheduled = Some(self.scheduled.map_or(at, |s| s.min(at)));
    }

    fn entry(&self, turn_id: i64) -> Option<&TurnBufferEntry> {
        self.entries.iter().find(|e| e.turn_id == turn_id)
    }

    fn entry_mut(&mut self, turn_id: i64) -> Option<&mut TurnBufferEntry> {
        self.entries.iter_mut().find(|e| e.turn_id == turn_id)
    }
}
