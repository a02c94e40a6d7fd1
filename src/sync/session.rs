use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::Result;
use serde_json::{Map, Value};

use crate::store::core::RecordStore;
use crate::store::mutations::{MutationState, MutationTracker};
use crate::store::schema::{default_schemas, KindSchema};
use crate::store::types::{EntityRecord, Origin};
use crate::subscriptions::{ChangeSet, SubscriptionGuard, SubscriptionRegistry};
use crate::sync::manager::{SyncConfig, SyncStatus, TransportManager};
use crate::sync::reconciler::{Reconciler, SyncDiagnostics};
use crate::transport::{ArcTransport, SyncTransport, TransportError};

/// One application session's view of the remote fleet. Owns the record
/// store, the mutation tracker, the observer registry, and one transport
/// manager per watched kind; everything is torn down together by dispose()
/// or drop. State is memory only and rebuilt from the backend on each
/// application start.
pub struct SyncSession {
    store: RecordStore,
    tracker: MutationTracker,
    registry: SubscriptionRegistry,
    reconciler: Reconciler,
    transport: ArcTransport,
    config: SyncConfig,
    managers: Mutex<HashMap<String, Arc<TransportManager>>>,
    disposed: AtomicBool,
}

impl SyncSession {
    pub fn builder() -> SyncSessionBuilder {
        SyncSessionBuilder::default()
    }

    /// Starts the acquisition loop for a kind. Watching an already-running
    /// kind is a no-op; a kind stopped by unwatch() or a failed
    /// authentication starts a fresh cycle.
    pub fn watch(&self, kind: &str) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            anyhow::bail!("session is disposed");
        }
        let manager = self.manager(kind)?;
        if !manager.is_running() {
            manager.start();
        }
        Ok(())
    }

    pub fn unwatch(&self, kind: &str) -> Result<()> {
        let managers = self
            .managers
            .lock()
            .map_err(|_| anyhow::anyhow!("Failed to acquire lock on managers"))?;
        if let Some(manager) = managers.get(kind) {
            manager.stop();
        }
        Ok(())
    }

    /// Stops every acquisition loop. In-flight responses are discarded via
    /// their stale generation tokens.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        if let Ok(managers) = self.managers.lock() {
            for manager in managers.values() {
                manager.stop();
            }
        }
    }

    /// Submits an action optimistically: observers immediately see the
    /// expected changes through projection, while a background worker sends
    /// the action to the backend. The mutation settles against the response
    /// record, a later authoritative record, or the expiry sweep.
    pub fn submit_action(
        &self,
        kind: &str,
        id: &str,
        action: &str,
        expected_changes: Map<String, Value>,
    ) -> Result<String> {
        if self.disposed.load(Ordering::SeqCst) {
            anyhow::bail!("session is disposed");
        }
        let handle = self.tracker.begin(kind, id, expected_changes.clone())?;
        self.registry.notify(kind, &[id.to_string()]);

        let manager = self.manager(kind)?;
        let token = manager.token();
        let transport = self.transport.clone();
        let reconciler = self.reconciler.clone();
        let tracker = self.tracker.clone();
        let registry = self.registry.clone();
        let kind = kind.to_string();
        let id = id.to_string();
        let action = action.to_string();

        thread::spawn(move || {
            let result = transport.submit(&kind, &id, &action, &expected_changes);
            let applied = manager.run_gated(token, || match &result {
                Ok(outcome) if outcome.is_ok() => {
                    if let Some(record) = &outcome.record {
                        // The response body is an authoritative read; merging
                        // it settles the mutation without waiting for the
                        // next poll.
                        if let Err(e) =
                            reconciler.reconcile_batch(&kind, vec![record.clone()], Origin::Poll)
                        {
                            log::error!("ACTION RECONCILE FAILED: kind='{}' id='{}' {}", kind, id, e);
                        }
                    }
                }
                Ok(outcome) => {
                    log::info!(
                        "ACTION REJECTED: kind='{}' id='{}' action='{}' {}",
                        kind,
                        id,
                        action,
                        outcome.message.as_deref().unwrap_or("no message")
                    );
                    if let Ok(true) = tracker.reject(&kind, &id) {
                        registry.notify(&kind, &[id.clone()]);
                    }
                }
                Err(TransportError::Rejected { status, message }) => {
                    log::info!(
                        "ACTION REJECTED: kind='{}' id='{}' action='{}' http {}: {}",
                        kind,
                        id,
                        action,
                        status,
                        message
                    );
                    if let Ok(true) = tracker.reject(&kind, &id) {
                        registry.notify(&kind, &[id.clone()]);
                    }
                }
                Err(e) if e.is_auth() => {
                    // Handled below, outside the gate, since it bumps the
                    // generation itself.
                }
                Err(e) => {
                    // Transient failure. The mutation stays pending and the
                    // expiry sweep will settle it if no confirmation comes.
                    log::warn!(
                        "ACTION SUBMIT FAILED: kind='{}' id='{}' action='{}' {}",
                        kind,
                        id,
                        action,
                        e
                    );
                }
            });
            if applied {
                if let Err(e) = &result {
                    if e.is_auth() {
                        manager.note_auth_failure();
                    }
                }
            } else {
                log::debug!("ACTION RESULT DISCARDED: kind='{}' id='{}' stale generation", kind, id);
            }
        });
        Ok(handle)
    }

    /// Seeds local records, e.g. a cached snapshot rendered before the first
    /// poll completes. Seeded data loses every conflict with fresh poll or
    /// push data.
    pub fn prime(&self, kind: &str, items: Vec<Value>) -> Result<()> {
        self.reconciler
            .reconcile_batch(kind, items, Origin::OptimisticLocal)?;
        Ok(())
    }

    pub fn project(&self, kind: &str, id: &str) -> Option<EntityRecord> {
        self.reconciler.project(kind, id)
    }

    pub fn project_all(&self, kind: &str) -> Vec<EntityRecord> {
        self.reconciler.project_all(kind)
    }

    /// The canonical record without optimistic overrides.
    pub fn record(&self, kind: &str, id: &str) -> Option<EntityRecord> {
        self.store.get(kind, id)
    }

    pub fn subscribe(
        &self,
        kind: &str,
        id_filter: Option<&str>,
        callback: impl Fn(&ChangeSet) + Send + Sync + 'static,
    ) -> SubscriptionGuard {
        self.registry.subscribe(kind, id_filter, callback)
    }

    pub fn status(&self, kind: &str) -> SyncStatus {
        self.managers
            .lock()
            .ok()
            .and_then(|managers| managers.get(kind).map(|m| m.status()))
            .unwrap_or(SyncStatus::Idle)
    }

    pub fn status_observer(&self, kind: &str) -> Result<Receiver<SyncStatus>> {
        Ok(self.manager(kind)?.status_observer())
    }

    pub fn observe_status(
        &self,
        kind: &str,
        callback: impl FnMut(SyncStatus) + Send + 'static,
    ) -> Result<()> {
        self.manager(kind)?.observe_status(callback);
        Ok(())
    }

    pub fn mutation_state(&self, kind: &str, id: &str) -> Option<MutationState> {
        self.tracker.state_for_entity(kind, id)
    }

    pub fn diagnostics(&self) -> SyncDiagnostics {
        self.reconciler.diagnostics()
    }

    fn manager(&self, kind: &str) -> Result<Arc<TransportManager>> {
        let mut managers = self
            .managers
            .lock()
            .map_err(|_| anyhow::anyhow!("Failed to acquire lock on managers"))?;
        if let Some(manager) = managers.get(kind) {
            return Ok(manager.clone());
        }
        let manager = Arc::new(TransportManager::new(
            kind,
            self.transport.clone(),
            self.reconciler.clone(),
            self.tracker.clone(),
            self.registry.clone(),
            self.config.clone(),
        ));
        managers.insert(kind.to_string(), manager.clone());
        Ok(manager)
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[derive(Default)]
pub struct SyncSessionBuilder {
    transport: Option<Arc<dyn SyncTransport>>,
    config: Option<SyncConfig>,
    extra_schemas: Vec<KindSchema>,
}

impl SyncSessionBuilder {
    /// Uses a fresh scriptable in-memory transport. Mostly useful for demos;
    /// tests usually construct their own InMemoryTransport and pass a clone
    /// through transport() to keep a scripting handle.
    pub fn in_memory(mut self) -> Self {
        self.transport = Some(Arc::new(crate::transport::InMemoryTransport::new()));
        self
    }

    pub fn http(mut self, base_url: &str, bearer_token: &str) -> Result<Self> {
        let timeout = self
            .config
            .as_ref()
            .map(|c| c.request_timeout)
            .unwrap_or_else(|| SyncConfig::default().request_timeout);
        self.transport = Some(Arc::new(crate::transport::HttpTransport::with_timeout(
            base_url,
            bearer_token,
            timeout,
        )?));
        Ok(self)
    }

    pub fn transport(mut self, transport: impl SyncTransport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Registers a schema beyond the built-in vehicle and alert kinds.
    pub fn schema(mut self, schema: KindSchema) -> Self {
        self.extra_schemas.push(schema);
        self
    }

    pub fn build(self) -> Result<SyncSession> {
        let transport = self
            .transport
            .ok_or_else(|| anyhow::anyhow!("a transport is required to build a session"))?;
        let mut schemas = default_schemas();
        schemas.extend(self.extra_schemas);

        let store = RecordStore::new(schemas);
        let tracker = MutationTracker::new();
        let registry = SubscriptionRegistry::new();
        let reconciler = Reconciler::new(store.clone(), tracker.clone(), registry.clone());
        Ok(SyncSession {
            store,
            tracker,
            registry,
            reconciler,
            transport: ArcTransport::new(transport),
            config: self.config.unwrap_or_default(),
            managers: Mutex::new(HashMap::new()),
            disposed: AtomicBool::new(false),
        })
    }
}
