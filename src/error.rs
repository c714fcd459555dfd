//! Crate-level error type.

/// Everything that can go wrong while talking to the debate backend or the
/// session store.
///
/// Malformed stream records never show up here: the decoder drops them.
#[derive(Debug, thiserror::Error)]
pub enum DebateError {
    /// The backend replied with a non-2xx status. `body` is the response text.
    #[error("HTTP {status} from {url}: {body}")]
    Http { status: u16, url: String, body: String },

    /// Connection, TLS or body-read failure inside reqwest.
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("stream read failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("session store: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("config: {0}")]
    Config(#[from] toml::de::Error),

    #[error("no turn {0} in the conversation")]
    UnknownTurn(i64),
}

impl DebateError {
    /// True for failures of the HTTP exchange itself (status or network).
    pub fn is_transport(&self) -> bool {
        matches!(self, DebateError::Http { .. } | DebateError::Request(_) | DebateError::Io(_))
    }
}
