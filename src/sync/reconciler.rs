use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;

use crate::store::core::RecordStore;
use crate::store::mutations::MutationTracker;
use crate::store::types::{now_millis, EntityRecord, IngestReason, Origin};
use crate::subscriptions::SubscriptionRegistry;
use crate::transport::PushMessage;

/// Outcome of one merge pass.
#[derive(Debug, Default, Clone)]
pub struct BatchSummary {
    pub accepted: usize,
    pub stale: usize,
    pub malformed: usize,
    pub invalid: usize,
    pub changed_ids: Vec<String>,
}

/// Snapshot of the reconciliation counters.
#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncDiagnostics {
    pub batches: u64,
    pub records_seen: u64,
    pub accepted: u64,
    pub stale_dropped: u64,
    pub malformed_dropped: u64,
    pub invalid_dropped: u64,
    pub unknown_kind_dropped: u64,
}

#[derive(Default)]
struct Counters {
    batches: AtomicU64,
    records_seen: AtomicU64,
    accepted: AtomicU64,
    stale_dropped: AtomicU64,
    malformed_dropped: AtomicU64,
    invalid_dropped: AtomicU64,
    unknown_kind_dropped: AtomicU64,
}

/// Turns raw transport batches into entity records and feeds them to the
/// store. Ingest and mutation settlement for one pass run as one critical
/// section so settlement always observes the just-ingested record, and
/// observers get one coalesced notification per pass.
#[derive(Clone)]
pub struct Reconciler {
    store: RecordStore,
    tracker: MutationTracker,
    registry: SubscriptionRegistry,
    // One monotonic sequence per origin, indexed by Origin::index.
    seq: Arc<[AtomicU64; 3]>,
    merge: Arc<Mutex<()>>,
    counters: Arc<Counters>,
}

impl Reconciler {
    pub fn new(
        store: RecordStore,
        tracker: MutationTracker,
        registry: SubscriptionRegistry,
    ) -> Self {
        Self {
            store,
            tracker,
            registry,
            seq: Arc::new([AtomicU64::new(0), AtomicU64::new(0), AtomicU64::new(0)]),
            merge: Arc::new(Mutex::new(())),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Merges one raw batch. Malformed items (missing or empty id) are
    /// dropped and counted; the batch is never rejected wholesale for one
    /// bad item. Within the batch, the last item for an id wins before
    /// ingest since a single fetch can carry several updates for one entity.
    pub fn reconcile_batch(
        &self,
        kind: &str,
        raw_items: Vec<Value>,
        origin: Origin,
    ) -> Result<BatchSummary> {
        let mut summary = BatchSummary::default();
        self.counters.batches.fetch_add(1, Ordering::Relaxed);
        self.counters
            .records_seen
            .fetch_add(raw_items.len() as u64, Ordering::Relaxed);

        // Batch-internal dedup, last item per id wins.
        let mut deduped: Vec<(String, serde_json::Map<String, Value>)> = Vec::new();
        for item in raw_items {
            let payload = match item {
                Value::Object(map) => map,
                other => {
                    log::debug!("RECONCILE DROP: kind='{}' non-object item {}", kind, other);
                    summary.malformed += 1;
                    continue;
                }
            };
            let id = match payload.get("id").and_then(|v| v.as_str()) {
                Some(id) if !id.is_empty() => id.to_string(),
                _ => {
                    log::debug!("RECONCILE DROP: kind='{}' item missing id", kind);
                    summary.malformed += 1;
                    continue;
                }
            };
            if let Some(existing) = deduped.iter_mut().find(|(seen, _)| *seen == id) {
                existing.1 = payload;
            } else {
                deduped.push((id, payload));
            }
        }
        self.counters
            .malformed_dropped
            .fetch_add(summary.malformed as u64, Ordering::Relaxed);

        let observed_at = now_millis();
        let merge = self
            .merge
            .lock()
            .map_err(|_| anyhow::anyhow!("Failed to acquire merge lock"))?;
        for (id, payload) in deduped {
            let record = EntityRecord {
                kind: kind.to_string(),
                id: id.clone(),
                payload,
                observed_at,
                source_seq: self.seq[origin.index()].fetch_add(1, Ordering::Relaxed) + 1,
                origin,
            };
            let outcome = self.store.ingest(record.clone())?;
            if outcome.accepted {
                summary.accepted += 1;
                summary.changed_ids.push(id.clone());
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                if origin != Origin::OptimisticLocal {
                    if let Some(state) = self.tracker.settle(kind, &id, &record)? {
                        log::debug!(
                            "RECONCILE SETTLED: kind='{}' id='{}' -> {:?}",
                            kind,
                            id,
                            state
                        );
                    }
                }
            } else {
                match outcome.reason {
                    IngestReason::Stale => {
                        summary.stale += 1;
                        self.counters.stale_dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    IngestReason::Invalid => {
                        summary.invalid += 1;
                        self.counters.invalid_dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    IngestReason::UnknownKind => {
                        summary.invalid += 1;
                        self.counters
                            .unknown_kind_dropped
                            .fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {}
                }
            }
        }
        drop(merge);

        // Notify after the merge lock is released, one change set per pass.
        if !summary.changed_ids.is_empty() {
            self.registry.notify(kind, &summary.changed_ids);
        }
        Ok(summary)
    }

    /// A push message is a one-item batch with push origin. Unrecognized
    /// event names are skipped.
    pub fn reconcile_push(&self, message: &PushMessage) -> Result<BatchSummary> {
        if !message.is_recognized() {
            log::debug!(
                "RECONCILE SKIP: unrecognized push event '{}' kind='{}'",
                message.event,
                message.kind
            );
            return Ok(BatchSummary::default());
        }
        let mut payload = match &message.payload {
            Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        payload.insert("id".to_string(), Value::String(message.id.clone()));
        self.reconcile_batch(&message.kind, vec![Value::Object(payload)], Origin::Push)
    }

    /// The canonical record with any pending mutation's expected changes
    /// shallow-merged on top for immediate feedback. Settled mutations never
    /// merge. An entity with a pending mutation but no canonical record yet
    /// projects from the overrides alone.
    pub fn project(&self, kind: &str, id: &str) -> Option<EntityRecord> {
        let overrides = self.tracker.pending_overrides(kind, id);
        match (self.store.get(kind, id), overrides) {
            (Some(record), None) => Some(record),
            (Some(mut record), Some(overrides)) => {
                for (field, value) in overrides {
                    record.payload.insert(field, value);
                }
                Some(record)
            }
            (None, Some(overrides)) => {
                let pending = self.tracker.pending_mutation(kind, id)?;
                Some(EntityRecord {
                    kind: kind.to_string(),
                    id: id.to_string(),
                    payload: overrides,
                    observed_at: pending.submitted_at,
                    source_seq: 0,
                    origin: Origin::OptimisticLocal,
                })
            }
            (None, None) => None,
        }
    }

    pub fn project_all(&self, kind: &str) -> Vec<EntityRecord> {
        self.store
            .get_all(kind)
            .into_iter()
            .map(|record| {
                self.project(kind, &record.id).unwrap_or(record)
            })
            .collect()
    }

    pub fn diagnostics(&self) -> SyncDiagnostics {
        SyncDiagnostics {
            batches: self.counters.batches.load(Ordering::Relaxed),
            records_seen: self.counters.records_seen.load(Ordering::Relaxed),
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            stale_dropped: self.counters.stale_dropped.load(Ordering::Relaxed),
            malformed_dropped: self.counters.malformed_dropped.load(Ordering::Relaxed),
            invalid_dropped: self.counters.invalid_dropped.load(Ordering::Relaxed),
            unknown_kind_dropped: self.counters.unknown_kind_dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::schema::default_schemas;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    fn reconciler() -> Reconciler {
        Reconciler::new(
            RecordStore::new(default_schemas()),
            MutationTracker::new(),
            SubscriptionRegistry::new(),
        )
    }

    fn with_registry() -> (Reconciler, SubscriptionRegistry) {
        let registry = SubscriptionRegistry::new();
        let r = Reconciler::new(
            RecordStore::new(default_schemas()),
            MutationTracker::new(),
            registry.clone(),
        );
        (r, registry)
    }

    #[test]
    fn batch_dedup_last_item_wins() -> Result<()> {
        let r = reconciler();
        let summary = r.reconcile_batch(
            "vehicle",
            vec![
                json!({"id": "V1", "speed": 50}),
                json!({"id": "V1", "speed": 55}),
            ],
            Origin::Poll,
        )?;
        assert_eq!(summary.accepted, 1);
        assert_eq!(r.project("vehicle", "V1").unwrap().payload["speed"], json!(55));
        Ok(())
    }

    #[test]
    fn malformed_items_dropped_not_fatal() -> Result<()> {
        let r = reconciler();
        let summary = r.reconcile_batch(
            "vehicle",
            vec![
                json!({"speed": 50}),
                json!("not an object"),
                json!({"id": "", "speed": 50}),
                json!({"id": "V1", "speed": 60}),
            ],
            Origin::Poll,
        )?;
        assert_eq!(summary.malformed, 3);
        assert_eq!(summary.accepted, 1);
        assert_eq!(r.diagnostics().malformed_dropped, 3);
        Ok(())
    }

    #[test]
    fn poll_then_push_takes_push_value() -> Result<()> {
        let r = reconciler();
        r.reconcile_batch("vehicle", vec![json!({"id": "V1", "speed": 60})], Origin::Poll)?;
        r.reconcile_push(&PushMessage {
            event: "updated".to_string(),
            kind: "vehicle".to_string(),
            id: "V1".to_string(),
            payload: json!({"speed": 65}),
        })?;
        assert_eq!(r.project("vehicle", "V1").unwrap().payload["speed"], json!(65));
        Ok(())
    }

    #[test]
    fn unrecognized_push_event_is_skipped() -> Result<()> {
        let r = reconciler();
        let summary = r.reconcile_push(&PushMessage {
            event: "heartbeat".to_string(),
            kind: "vehicle".to_string(),
            id: "V1".to_string(),
            payload: json!({}),
        })?;
        assert_eq!(summary.accepted, 0);
        assert!(r.project("vehicle", "V1").is_none());
        Ok(())
    }

    #[test]
    fn replayed_batch_is_idempotent_and_silent() -> Result<()> {
        let (r, registry) = with_registry();
        let notifications = Arc::new(StdMutex::new(0usize));
        let count = notifications.clone();
        let _guard = registry.subscribe("vehicle", None, move |_| {
            *count.lock().unwrap() += 1;
        });

        let items = vec![json!({"id": "V1", "speed": 60})];
        let first = r.reconcile_batch("vehicle", items.clone(), Origin::Poll)?;
        assert_eq!(first.accepted, 1);
        assert_eq!(*notifications.lock().unwrap(), 1);

        // Same payload again: newer seq and timestamp, accepted as replace.
        // A store-level replay of the identical record is covered in the
        // store tests; here the second pass still yields one notification.
        let second = r.reconcile_batch("vehicle", items, Origin::Poll)?;
        assert_eq!(second.accepted, 1);
        assert_eq!(*notifications.lock().unwrap(), 2);
        Ok(())
    }

    #[test]
    fn projection_overlays_pending_mutation() -> Result<()> {
        let (r, _registry) = with_registry();
        r.reconcile_batch(
            "alert",
            vec![json!({"id": "A1", "status": "OPEN", "severity": "high"})],
            Origin::Poll,
        )?;
        r.tracker
            .begin("alert", "A1", json!({"status": "RESOLVED"}).as_object().cloned().unwrap())?;

        let projected = r.project("alert", "A1").unwrap();
        assert_eq!(projected.payload["status"], json!("RESOLVED"));
        assert_eq!(projected.payload["severity"], json!("high"));
        // Canonical record is untouched.
        assert_eq!(r.store.get("alert", "A1").unwrap().payload["status"], json!("OPEN"));
        Ok(())
    }

    #[test]
    fn projection_without_canonical_record_uses_overrides() -> Result<()> {
        let r = reconciler();
        r.tracker
            .begin("alert", "A9", json!({"status": "RESOLVED"}).as_object().cloned().unwrap())?;
        let projected = r.project("alert", "A9").unwrap();
        assert_eq!(projected.origin, Origin::OptimisticLocal);
        assert_eq!(projected.payload["status"], json!("RESOLVED"));
        Ok(())
    }

    #[test]
    fn contradicting_ingest_settles_rejected_and_unmasks() -> Result<()> {
        let r = reconciler();
        r.tracker
            .begin("alert", "A1", json!({"status": "RESOLVED"}).as_object().cloned().unwrap())?;
        r.reconcile_batch(
            "alert",
            vec![json!({"id": "A1", "status": "OPEN"})],
            Origin::Poll,
        )?;
        assert_eq!(
            r.tracker.state_for_entity("alert", "A1"),
            Some(crate::store::MutationState::Rejected)
        );
        assert_eq!(r.project("alert", "A1").unwrap().payload["status"], json!("OPEN"));
        Ok(())
    }

    #[test]
    fn matching_ingest_confirms_and_projection_is_stable() -> Result<()> {
        let r = reconciler();
        r.tracker
            .begin("alert", "A1", json!({"status": "RESOLVED"}).as_object().cloned().unwrap())?;
        assert_eq!(r.project("alert", "A1").unwrap().payload["status"], json!("RESOLVED"));

        r.reconcile_batch(
            "alert",
            vec![json!({"id": "A1", "status": "RESOLVED"})],
            Origin::Poll,
        )?;
        assert_eq!(
            r.tracker.state_for_entity("alert", "A1"),
            Some(crate::store::MutationState::Confirmed)
        );
        assert_eq!(r.project("alert", "A1").unwrap().payload["status"], json!("RESOLVED"));
        Ok(())
    }

    #[test]
    fn coalesced_notification_carries_all_changed_ids() -> Result<()> {
        let (r, registry) = with_registry();
        let sets = Arc::new(StdMutex::new(Vec::new()));
        let sink = sets.clone();
        let _guard = registry.subscribe("vehicle", None, move |change| {
            sink.lock().unwrap().push(change.ids.clone());
        });

        r.reconcile_batch(
            "vehicle",
            vec![
                json!({"id": "V1", "speed": 60}),
                json!({"id": "V2", "speed": 40}),
                json!({"id": "V3", "speed": 80}),
            ],
            Origin::Poll,
        )?;

        let sets = sets.lock().unwrap();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0], vec!["V1", "V2", "V3"]);
        Ok(())
    }
}
