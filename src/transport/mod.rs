// Re-export all public items from the transport modules
pub use http_transport::HttpTransport;
pub use memory_transport::InMemoryTransport;

pub mod http_transport;
pub mod memory_transport;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("server error: http {0}")]
    Http(u16),
    #[error("authentication required: http {0}")]
    Auth(u16),
    #[error("request rejected: http {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("push channel not available")]
    PushUnavailable,
    #[error("push channel closed")]
    Closed,
}

impl TransportError {
    /// Auth failures are fatal for the session; everything else is retried.
    pub fn is_auth(&self) -> bool {
        matches!(self, TransportError::Auth(_))
    }
}

/// One page of raw records from the backend, plus the cursor to resume from.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct FetchPage {
    pub items: Vec<Value>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// Result of a mutation submission.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ActionOutcome {
    pub status: String,
    #[serde(default)]
    pub record: Option<Value>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ActionOutcome {
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
            record: None,
            message: None,
        }
    }

    pub fn ok_with_record(record: Value) -> Self {
        Self {
            status: "ok".to_string(),
            record: Some(record),
            message: None,
        }
    }

    pub fn error(message: &str) -> Self {
        Self {
            status: "error".to_string(),
            record: None,
            message: Some(message.to_string()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// A message from the backend's event channel. Event names the client does
/// not recognize are skipped, so backends can add events without breaking
/// older clients.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PushMessage {
    pub event: String,
    pub kind: String,
    pub id: String,
    pub payload: Value,
}

const RECOGNIZED_EVENTS: &[&str] = &["created", "updated", "resolved"];

impl PushMessage {
    pub fn is_recognized(&self) -> bool {
        RECOGNIZED_EVENTS.contains(&self.event.as_str())
    }
}

/// Blocking receive side of an open event channel.
pub trait PushChannel: Send {
    /// Ok(None) means no message arrived within the timeout; the channel is
    /// still healthy. Err means the channel is gone and the caller should
    /// fall back to polling.
    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<PushMessage>, TransportError>;
}

/// The seam between the sync engine and a concrete backend. Implementations
/// are blocking; the transport manager calls them from its worker thread.
pub trait SyncTransport: Send + Sync {
    fn fetch(
        &self,
        kind: &str,
        since: Option<&str>,
        limit: usize,
    ) -> Result<FetchPage, TransportError>;

    fn submit(
        &self,
        kind: &str,
        id: &str,
        action: &str,
        params: &Map<String, Value>,
    ) -> Result<ActionOutcome, TransportError>;

    fn open_push(&self, kinds: &[String]) -> Result<Box<dyn PushChannel>, TransportError> {
        let _ = kinds;
        Err(TransportError::PushUnavailable)
    }
}

// SyncTransport trait wrapper to allow Arc<dyn SyncTransport> to implement SyncTransport
#[derive(Clone)]
pub struct ArcTransport {
    inner: Arc<dyn SyncTransport>,
}

impl ArcTransport {
    pub fn new(inner: Arc<dyn SyncTransport>) -> Self {
        Self { inner }
    }
}

impl SyncTransport for ArcTransport {
    fn fetch(
        &self,
        kind: &str,
        since: Option<&str>,
        limit: usize,
    ) -> Result<FetchPage, TransportError> {
        self.inner.fetch(kind, since, limit)
    }

    fn submit(
        &self,
        kind: &str,
        id: &str,
        action: &str,
        params: &Map<String, Value>,
    ) -> Result<ActionOutcome, TransportError> {
        self.inner.submit(kind, id, action, params)
    }

    fn open_push(&self, kinds: &[String]) -> Result<Box<dyn PushChannel>, TransportError> {
        self.inner.open_push(kinds)
    }
}
