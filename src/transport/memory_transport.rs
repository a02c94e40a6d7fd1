use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Map, Value};

use super::{
    ActionOutcome, FetchPage, PushChannel, PushMessage, SyncTransport, TransportError,
};

/// Scriptable in-process transport for tests and demos. Clones share state,
/// so a test can keep a handle for seeding pages and injecting push messages
/// while the session owns another.
#[derive(Clone)]
pub struct InMemoryTransport {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Clone, Debug)]
pub struct Submission {
    pub kind: String,
    pub id: String,
    pub action: String,
    pub params: Map<String, Value>,
}

struct Inner {
    pages: HashMap<String, VecDeque<FetchPage>>,
    action_results: VecDeque<Result<ActionOutcome, TransportError>>,
    fail_next: u32,
    auth_failed: bool,
    push_rx: Option<Receiver<PushMessage>>,
    fetch_calls: u64,
    submit_calls: u64,
    submissions: Vec<Submission>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues one fetch page for a kind. Once the queue drains, fetches
    /// return empty pages.
    pub fn seed_page(&self, kind: &str, items: Vec<Value>) {
        self.seed_page_with_cursor(kind, items, None);
    }

    pub fn seed_page_with_cursor(&self, kind: &str, items: Vec<Value>, next_cursor: Option<&str>) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.pages.entry(kind.to_string()).or_default().push_back(FetchPage {
                items,
                next_cursor: next_cursor.map(|s| s.to_string()),
            });
        }
    }

    /// The next n fetches fail with a timeout.
    pub fn fail_next(&self, n: u32) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.fail_next = n;
        }
    }

    /// Every subsequent call fails with 401.
    pub fn fail_auth(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.auth_failed = true;
        }
    }

    pub fn queue_action_result(&self, result: Result<ActionOutcome, TransportError>) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.action_results.push_back(result);
        }
    }

    pub fn queue_action_outcome(&self, outcome: ActionOutcome) {
        self.queue_action_result(Ok(outcome));
    }

    /// Arms the push side and returns the sender used to inject messages.
    /// Dropping the sender closes the channel, which sends the manager back
    /// to polling.
    pub fn push_sender(&self) -> Sender<PushMessage> {
        let (tx, rx) = channel();
        if let Ok(mut inner) = self.inner.lock() {
            inner.push_rx = Some(rx);
        }
        tx
    }

    pub fn fetch_count(&self) -> u64 {
        self.inner.lock().map(|inner| inner.fetch_calls).unwrap_or(0)
    }

    pub fn submit_count(&self) -> u64 {
        self.inner.lock().map(|inner| inner.submit_calls).unwrap_or(0)
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.inner
            .lock()
            .map(|inner| inner.submissions.clone())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, TransportError> {
        self.inner
            .lock()
            .map_err(|_| TransportError::Connection("transport lock poisoned".to_string()))
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                pages: HashMap::new(),
                action_results: VecDeque::new(),
                fail_next: 0,
                auth_failed: false,
                push_rx: None,
                fetch_calls: 0,
                submit_calls: 0,
                submissions: Vec::new(),
            })),
        }
    }
}

impl SyncTransport for InMemoryTransport {
    fn fetch(
        &self,
        kind: &str,
        since: Option<&str>,
        limit: usize,
    ) -> Result<FetchPage, TransportError> {
        log::debug!(
            "TRANSPORT FETCH: kind='{}' since={:?} limit={}",
            kind,
            since,
            limit
        );
        let mut inner = self.lock()?;
        inner.fetch_calls += 1;
        if inner.auth_failed {
            return Err(TransportError::Auth(401));
        }
        if inner.fail_next > 0 {
            inner.fail_next -= 1;
            return Err(TransportError::Timeout);
        }
        let page = inner
            .pages
            .get_mut(kind)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_default();
        log::debug!("TRANSPORT FETCH RESULT: kind='{}' {} items", kind, page.items.len());
        Ok(page)
    }

    fn submit(
        &self,
        kind: &str,
        id: &str,
        action: &str,
        params: &Map<String, Value>,
    ) -> Result<ActionOutcome, TransportError> {
        log::debug!("TRANSPORT SUBMIT: kind='{}' id='{}' action='{}'", kind, id, action);
        let mut inner = self.lock()?;
        inner.submit_calls += 1;
        inner.submissions.push(Submission {
            kind: kind.to_string(),
            id: id.to_string(),
            action: action.to_string(),
            params: params.clone(),
        });
        if inner.auth_failed {
            return Err(TransportError::Auth(401));
        }
        inner
            .action_results
            .pop_front()
            .unwrap_or_else(|| Ok(ActionOutcome::ok()))
    }

    fn open_push(&self, kinds: &[String]) -> Result<Box<dyn PushChannel>, TransportError> {
        log::debug!("TRANSPORT OPEN PUSH: kinds={:?}", kinds);
        let mut inner = self.lock()?;
        if inner.auth_failed {
            return Err(TransportError::Auth(401));
        }
        match inner.push_rx.take() {
            Some(rx) => Ok(Box::new(InMemoryPushChannel { rx })),
            None => Err(TransportError::PushUnavailable),
        }
    }
}

struct InMemoryPushChannel {
    rx: Receiver<PushMessage>,
}

impl PushChannel for InMemoryPushChannel {
    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<PushMessage>, TransportError> {
        match self.rx.recv_timeout(timeout) {
            Ok(message) => Ok(Some(message)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Closed),
        }
    }
}
