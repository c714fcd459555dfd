//! Transports: where the NDJSON bytes and TTS audio come from.

use std::future::Future;
use std::path::PathBuf;

use bytes::Bytes;
use futures_util::stream::{BoxStream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use crate::error::DebateError;

/// Raw response body chunks.
pub type ByteStream = BoxStream<'static, Result<Bytes, DebateError>>;

pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

// -- Request types ----------------------------------------------------------

/// Body of a debate stream request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum DebateRequest {
    /// Open a new debate on `topic` between `participants`.
    Start { topic: String, participants: Vec<String> },
    /// Add a user message to an existing debate.
    Inject { session_id: i64, text: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeechRequest {
    pub text: String,
    pub speaker: String,
}

#[derive(Debug, Deserialize)]
struct SpeechResponse {
    #[serde(alias = "url", alias = "audio_url")]
    audio: String,
}

// -- Transport trait --------------------------------------------------------

/// A backend that can stream debate events and synthesize speech.
pub trait DebateTransport: Send + Sync {
    /// Open the event stream. A non-success response must fail here, before
    /// any bytes are handed out.
    fn open_stream(
        &self,
        request: &DebateRequest,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<ByteStream, DebateError>> + Send;

    /// Fetch audio for `request`, returning a filename or URL.
    fn synthesize(
        &self,
        request: &SpeechRequest,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Option<String>, DebateError>> + Send;
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

/// reqwest-backed transport talking to `{base_url}/debate/stream` and `{base_url}/tts`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self { client, base_url: base_url.into().trim_end_matches('/').to_string() }
    }

    pub fn stream_url(&self) -> String {
        format!("{}/debate/stream", self.base_url)
    }

    pub fn tts_url(&self) -> String {
        format!("{}/tts", self.base_url)
    }

    async fn post_json<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        accept: &str,
    ) -> Result<reqwest::Response, DebateError> {
        let response = self
            .client
            .post(url)
            .header("Accept", accept)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(DebateError::Http { status, url: url.to_string(), body });
        }
        Ok(response)
    }
}

impl DebateTransport for HttpTransport {
    async fn open_stream(
        &self,
        request: &DebateRequest,
        cancel: &CancellationToken,
    ) -> Result<ByteStream, DebateError> {
        let url = self.stream_url();
        tracing::debug!(%url, ?request, "opening debate stream");
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(futures_util::stream::empty().boxed()),
            r = self.post_json(&url, request, NDJSON_CONTENT_TYPE) => r?,
        };
        Ok(response.bytes_stream().map(|chunk| chunk.map_err(DebateError::from)).boxed())
    }

    async fn synthesize(
        &self,
        request: &SpeechRequest,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, DebateError> {
        let url = self.tts_url();
        let fetch = async {
            let response = self.post_json(&url, request, "application/json").await?;
            let parsed: SpeechResponse = response.json().await?;
            Ok::<_, DebateError>(parsed.audio)
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(None),
            audio = fetch => audio.map(Some),
        }
    }
}

// ---------------------------------------------------------------------------
// File replay
// ---------------------------------------------------------------------------

/// Replays a captured NDJSON file as if it were a response body.
///
/// Ignores the request. Speech synthesis is unavailable.
#[derive(Debug, Clone)]
pub struct FileTransport {
    path: PathBuf,
    chunk_size: usize,
}

impl FileTransport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), chunk_size: 4096 }
    }

    /// Read the file in chunks of `chunk_size` bytes (minimum 1).
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }
}

impl DebateTransport for FileTransport {
    async fn open_stream(
        &self,
        _request: &DebateRequest,
        _cancel: &CancellationToken,
    ) -> Result<ByteStream, DebateError> {
        let file = tokio::fs::File::open(&self.path).await?;
        tracing::debug!(path = %self.path.display(), "replaying stream from file");
        let reader = ReaderStream::with_capacity(file, self.chunk_size);
        Ok(reader.map(|chunk| chunk.map_err(DebateError::from)).boxed())
    }

    async fn synthesize(
        &self,
        _request: &SpeechRequest,
        _cancel: &CancellationToken,
    ) -> Result<Option<String>, DebateError> {
        Ok(None)
    }
}
