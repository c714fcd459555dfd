//! Incremental consumer for a debate backend's NDJSON event stream.
//!
//! Bytes come in through a [`transport::DebateTransport`], are split into JSON
//! records by [`decoder`], interpreted into conversation changes by
//! [`interpreter`], and revealed to the UI on a paced cadence by
//! [`turn_buffer`]. [`session::DebateSession`] ties it together and exposes the
//! imperative entry points plus a watch channel of [`ConversationState`]
//! snapshots.

pub mod audio;
pub mod cli;
pub mod config;
pub mod conversation;
pub mod decoder;
pub mod error;
pub mod events;
pub mod interpreter;
pub mod render;
pub mod session;
pub mod store;
pub mod transport;
pub mod turn_buffer;

pub use config::DebateConfig;
pub use conversation::{ConversationState, ConversationTurn, Message};
pub use error::DebateError;
pub use events::{DeltaPayload, SourceItem, StreamEvent};
pub use session::{DebateSession, StreamEnd};
pub use transport::{DebateRequest, DebateTransport, FileTransport, HttpTransport};
pub use turn_buffer::{PacingConfig, TurnBuffer};
