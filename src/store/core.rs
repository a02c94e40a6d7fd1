use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::Result;

use super::schema::KindSchema;
use super::types::{EntityRecord, IngestOutcome, IngestReason};

/// Holds the latest known record per (kind, id). `ingest` is the single merge
/// entry point: a record replaces the current one iff it is newer under the
/// ordering rule, so calling it with duplicates or out-of-order batches is
/// safe and idempotent.
#[derive(Clone)]
pub struct RecordStore {
    records: Arc<RwLock<HashMap<String, HashMap<String, EntityRecord>>>>,
    schemas: Arc<HashMap<String, KindSchema>>,
}

impl RecordStore {
    pub fn new(schemas: Vec<KindSchema>) -> Self {
        let schemas = schemas
            .into_iter()
            .map(|s| (s.kind.clone(), s))
            .collect::<HashMap<_, _>>();
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            schemas: Arc::new(schemas),
        }
    }

    pub fn ingest(&self, record: EntityRecord) -> Result<IngestOutcome> {
        let schema = match self.schemas.get(&record.kind) {
            Some(schema) => schema,
            None => {
                log::debug!("STORE INGEST DROP: unknown kind '{}'", record.kind);
                return Ok(IngestOutcome::dropped(IngestReason::UnknownKind));
            }
        };
        if let Err(violation) = schema.validate(&record.payload) {
            log::debug!(
                "STORE INGEST DROP: kind='{}' id='{}' invalid: {}",
                record.kind,
                record.id,
                violation
            );
            return Ok(IngestOutcome::dropped(IngestReason::Invalid));
        }

        let mut records = self
            .records
            .write()
            .map_err(|_| anyhow::anyhow!("Failed to acquire write lock on records"))?;
        let by_id = records.entry(record.kind.clone()).or_default();
        match by_id.get(&record.id) {
            Some(current) if !record.supersedes(current) => {
                Ok(IngestOutcome::dropped(IngestReason::Stale))
            }
            Some(_) => {
                by_id.insert(record.id.clone(), record);
                Ok(IngestOutcome::accepted(IngestReason::Replaced))
            }
            None => {
                by_id.insert(record.id.clone(), record);
                Ok(IngestOutcome::accepted(IngestReason::Inserted))
            }
        }
    }

    pub fn get(&self, kind: &str, id: &str) -> Option<EntityRecord> {
        self.records
            .read()
            .ok()
            .and_then(|records| records.get(kind).and_then(|by_id| by_id.get(id).cloned()))
    }

    /// All records of a kind, newest first under the ordering rule.
    pub fn get_all(&self, kind: &str) -> Vec<EntityRecord> {
        let mut results: Vec<EntityRecord> = self
            .records
            .read()
            .ok()
            .and_then(|records| records.get(kind).map(|by_id| by_id.values().cloned().collect()))
            .unwrap_or_default();
        results.sort_by(|a, b| {
            b.observed_at
                .cmp(&a.observed_at)
                .then(b.origin.priority().cmp(&a.origin.priority()))
                .then(b.source_seq.cmp(&a.source_seq))
        });
        results
    }

    pub fn len(&self, kind: &str) -> usize {
        self.records
            .read()
            .ok()
            .and_then(|records| records.get(kind).map(|by_id| by_id.len()))
            .unwrap_or(0)
    }

    pub fn clear(&self) -> Result<()> {
        let mut records = self
            .records
            .write()
            .map_err(|_| anyhow::anyhow!("Failed to acquire write lock on records"))?;
        records.clear();
        Ok(())
    }
}
