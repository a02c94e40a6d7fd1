use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Where a record came from. Push is assumed lowest latency, so it wins
/// timestamp ties over poll data, which in turn wins over optimistic local
/// state.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Origin {
    Poll,
    Push,
    OptimisticLocal,
}

impl Origin {
    pub(crate) fn priority(&self) -> u8 {
        match self {
            Origin::Push => 2,
            Origin::Poll => 1,
            Origin::OptimisticLocal => 0,
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            Origin::Poll => 0,
            Origin::Push => 1,
            Origin::OptimisticLocal => 2,
        }
    }
}

/// A versioned snapshot of a remote entity as last seen by this client.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct EntityRecord {
    pub kind: String,
    pub id: String,
    pub payload: Map<String, Value>,
    /// Client-assigned receipt time in epoch milliseconds. Server timestamps
    /// are not trusted on their own because server and client clocks skew.
    pub observed_at: i64,
    /// Per-origin monotonic counter, breaks ties within one source.
    pub source_seq: u64,
    pub origin: Origin,
}

impl EntityRecord {
    /// Total order over records for one id: later receipt wins, then origin
    /// priority, then sequence. Returns true iff self should replace other.
    pub fn supersedes(&self, other: &EntityRecord) -> bool {
        if self.observed_at != other.observed_at {
            return self.observed_at > other.observed_at;
        }
        if self.origin.priority() != other.origin.priority() {
            return self.origin.priority() > other.origin.priority();
        }
        self.source_seq > other.source_seq
    }
}

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum IngestReason {
    /// No previous record for this id.
    Inserted,
    /// Replaced an older record.
    Replaced,
    /// Not newer than the current record under the ordering rule.
    Stale,
    /// No schema registered for the record's kind.
    UnknownKind,
    /// Payload failed schema validation.
    Invalid,
}

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct IngestOutcome {
    pub accepted: bool,
    pub reason: IngestReason,
}

impl IngestOutcome {
    pub(crate) fn accepted(reason: IngestReason) -> Self {
        Self {
            accepted: true,
            reason,
        }
    }

    pub(crate) fn dropped(reason: IngestReason) -> Self {
        Self {
            accepted: false,
            reason,
        }
    }
}

pub(crate) fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
