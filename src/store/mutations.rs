use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::types::EntityRecord;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum MutationState {
    Pending,
    Confirmed,
    Rejected,
    /// Unconfirmed past the timeout. Displayed like Rejected but logged
    /// separately for diagnostics.
    Expired,
}

/// A local write awaiting server confirmation.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PendingMutation {
    pub handle: String,
    pub kind: String,
    pub entity_id: String,
    pub expected_changes: Map<String, Value>,
    pub submitted_at: i64,
    pub state: MutationState,
}

/// Tracks in-flight optimistic writes, at most one pending per entity id.
/// The tracker never mutates the canonical store; it only supplies override
/// values for projection until each mutation settles.
#[derive(Clone)]
pub struct MutationTracker {
    entries: Arc<RwLock<HashMap<(String, String), PendingMutation>>>,
}

impl MutationTracker {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Records intent for an entity and returns the mutation handle. A second
    /// begin for the same entity while one is pending replaces it: the user
    /// only cares about their latest action.
    pub fn begin(
        &self,
        kind: &str,
        entity_id: &str,
        expected_changes: Map<String, Value>,
    ) -> Result<String> {
        let mutation = PendingMutation {
            handle: Uuid::now_v7().to_string(),
            kind: kind.to_string(),
            entity_id: entity_id.to_string(),
            expected_changes,
            submitted_at: super::types::now_millis(),
            state: MutationState::Pending,
        };
        let handle = mutation.handle.clone();
        let mut entries = self
            .entries
            .write()
            .map_err(|_| anyhow::anyhow!("Failed to acquire write lock on mutations"))?;
        if let Some(previous) = entries.insert(
            (kind.to_string(), entity_id.to_string()),
            mutation,
        ) {
            if previous.state == MutationState::Pending {
                log::debug!(
                    "MUTATION REPLACED: kind='{}' id='{}' handle='{}'",
                    kind,
                    entity_id,
                    previous.handle
                );
            }
        }
        Ok(handle)
    }

    /// Settles a pending mutation against a just-ingested authoritative
    /// record. All expected fields present and equal confirms; any expected
    /// field present with a different value rejects; fields absent leave the
    /// mutation pending. Returns the new state when a transition happened.
    pub fn settle(
        &self,
        kind: &str,
        entity_id: &str,
        record: &EntityRecord,
    ) -> Result<Option<MutationState>> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| anyhow::anyhow!("Failed to acquire write lock on mutations"))?;
        let entry = match entries.get_mut(&(kind.to_string(), entity_id.to_string())) {
            Some(entry) if entry.state == MutationState::Pending => entry,
            _ => return Ok(None),
        };

        let mut all_matched = true;
        for (field, expected) in &entry.expected_changes {
            match record.payload.get(field) {
                Some(actual) if actual == expected => {}
                Some(_) => {
                    entry.state = MutationState::Rejected;
                    log::info!(
                        "MUTATION REJECTED: kind='{}' id='{}' field '{}' contradicted",
                        kind,
                        entity_id,
                        field
                    );
                    return Ok(Some(MutationState::Rejected));
                }
                None => all_matched = false,
            }
        }
        if all_matched {
            entry.state = MutationState::Confirmed;
            log::debug!("MUTATION CONFIRMED: kind='{}' id='{}'", kind, entity_id);
            return Ok(Some(MutationState::Confirmed));
        }
        Ok(None)
    }

    /// Explicit rejection from an authoritative error response.
    pub fn reject(&self, kind: &str, entity_id: &str) -> Result<bool> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| anyhow::anyhow!("Failed to acquire write lock on mutations"))?;
        match entries.get_mut(&(kind.to_string(), entity_id.to_string())) {
            Some(entry) if entry.state == MutationState::Pending => {
                entry.state = MutationState::Rejected;
                log::info!("MUTATION REJECTED: kind='{}' id='{}'", kind, entity_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Sweeps pending entries older than the timeout to Expired and returns
    /// the affected (kind, entity id) pairs so observers can be re-notified.
    pub fn expire_stale(&self, now: i64, timeout: Duration) -> Result<Vec<(String, String)>> {
        let cutoff = now - timeout.as_millis() as i64;
        let mut expired = Vec::new();
        let mut entries = self
            .entries
            .write()
            .map_err(|_| anyhow::anyhow!("Failed to acquire write lock on mutations"))?;
        for ((kind, entity_id), entry) in entries.iter_mut() {
            if entry.state == MutationState::Pending && entry.submitted_at < cutoff {
                entry.state = MutationState::Expired;
                log::warn!(
                    "MUTATION EXPIRED: kind='{}' id='{}' handle='{}' unconfirmed after {:?}",
                    kind,
                    entity_id,
                    entry.handle,
                    timeout
                );
                expired.push((kind.clone(), entity_id.clone()));
            }
        }
        Ok(expired)
    }

    /// Override values for projection. Only a still-pending mutation
    /// contributes; once settled the canonical record is authoritative.
    pub fn pending_overrides(&self, kind: &str, entity_id: &str) -> Option<Map<String, Value>> {
        self.entries.read().ok().and_then(|entries| {
            entries
                .get(&(kind.to_string(), entity_id.to_string()))
                .filter(|entry| entry.state == MutationState::Pending)
                .map(|entry| entry.expected_changes.clone())
        })
    }

    pub fn pending_mutation(&self, kind: &str, entity_id: &str) -> Option<PendingMutation> {
        self.entries.read().ok().and_then(|entries| {
            entries
                .get(&(kind.to_string(), entity_id.to_string()))
                .cloned()
        })
    }

    pub fn state_for_entity(&self, kind: &str, entity_id: &str) -> Option<MutationState> {
        self.pending_mutation(kind, entity_id).map(|m| m.state)
    }

    /// Looks a mutation up by its handle. Returns None once the entry has
    /// been replaced by a newer begin for the same entity.
    pub fn state_of(&self, handle: &str) -> Option<MutationState> {
        self.entries.read().ok().and_then(|entries| {
            entries
                .values()
                .find(|entry| entry.handle == handle)
                .map(|entry| entry.state)
        })
    }

    pub fn pending_count(&self) -> usize {
        self.entries
            .read()
            .ok()
            .map(|entries| {
                entries
                    .values()
                    .filter(|e| e.state == MutationState::Pending)
                    .count()
            })
            .unwrap_or(0)
    }
}

impl Default for MutationTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::types::Origin;
    use serde_json::json;

    fn changes(value: serde_json::Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn authoritative(id: &str, payload: serde_json::Value) -> EntityRecord {
        EntityRecord {
            kind: "alert".to_string(),
            id: id.to_string(),
            payload: payload.as_object().cloned().unwrap(),
            observed_at: 1_000,
            source_seq: 1,
            origin: Origin::Poll,
        }
    }

    #[test]
    fn matching_record_confirms() -> Result<()> {
        let tracker = MutationTracker::new();
        tracker.begin("alert", "A1", changes(json!({"status": "RESOLVED"})))?;
        let record = authoritative("A1", json!({"id": "A1", "status": "RESOLVED"}));
        let settled = tracker.settle("alert", "A1", &record)?;
        assert_eq!(settled, Some(MutationState::Confirmed));
        assert!(tracker.pending_overrides("alert", "A1").is_none());
        Ok(())
    }

    #[test]
    fn contradicting_record_rejects() -> Result<()> {
        let tracker = MutationTracker::new();
        tracker.begin("alert", "A1", changes(json!({"status": "RESOLVED"})))?;
        let record = authoritative("A1", json!({"id": "A1", "status": "OPEN"}));
        let settled = tracker.settle("alert", "A1", &record)?;
        assert_eq!(settled, Some(MutationState::Rejected));
        assert!(tracker.pending_overrides("alert", "A1").is_none());
        Ok(())
    }

    #[test]
    fn absent_fields_stay_pending() -> Result<()> {
        let tracker = MutationTracker::new();
        tracker.begin("alert", "A1", changes(json!({"status": "RESOLVED"})))?;
        let record = authoritative("A1", json!({"id": "A1", "severity": "high"}));
        assert_eq!(tracker.settle("alert", "A1", &record)?, None);
        assert!(tracker.pending_overrides("alert", "A1").is_some());
        Ok(())
    }

    #[test]
    fn second_begin_replaces_first() -> Result<()> {
        let tracker = MutationTracker::new();
        let first = tracker.begin("alert", "A1", changes(json!({"status": "ACKED"})))?;
        let second = tracker.begin("alert", "A1", changes(json!({"status": "RESOLVED"})))?;
        assert_ne!(first, second);
        assert_eq!(tracker.state_of(&first), None);
        assert_eq!(tracker.state_of(&second), Some(MutationState::Pending));
        let overrides = tracker.pending_overrides("alert", "A1").unwrap();
        assert_eq!(overrides.get("status"), Some(&json!("RESOLVED")));
        assert_eq!(tracker.pending_count(), 1);
        Ok(())
    }

    #[test]
    fn stale_entries_expire() -> Result<()> {
        let tracker = MutationTracker::new();
        tracker.begin("alert", "A1", changes(json!({"status": "RESOLVED"})))?;
        let submitted = tracker.pending_mutation("alert", "A1").unwrap().submitted_at;

        let too_soon = tracker.expire_stale(submitted + 5_000, Duration::from_secs(10))?;
        assert!(too_soon.is_empty());

        let expired = tracker.expire_stale(submitted + 11_000, Duration::from_secs(10))?;
        assert_eq!(expired, vec![("alert".to_string(), "A1".to_string())]);
        assert_eq!(
            tracker.state_for_entity("alert", "A1"),
            Some(MutationState::Expired)
        );
        assert!(tracker.pending_overrides("alert", "A1").is_none());
        Ok(())
    }

    #[test]
    fn settle_ignores_settled_entries() -> Result<()> {
        let tracker = MutationTracker::new();
        tracker.begin("alert", "A1", changes(json!({"status": "RESOLVED"})))?;
        tracker.reject("alert", "A1")?;
        let record = authoritative("A1", json!({"id": "A1", "status": "RESOLVED"}));
        assert_eq!(tracker.settle("alert", "A1", &record)?, None);
        assert_eq!(
            tracker.state_for_entity("alert", "A1"),
            Some(MutationState::Rejected)
        );
        Ok(())
    }
}
