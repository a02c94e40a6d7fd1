use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use fleetsync::sync::{SyncConfig, SyncSession};
use fleetsync::transport::{
    FetchPage, InMemoryTransport, PushMessage, SyncTransport, TransportError,
};
use fleetsync::SyncStatus;
use serde_json::{json, Map, Value};

fn init_logging() {
    let _ = env_logger::Builder::from_default_env()
        .is_test(true)
        .try_init();
}

fn fast_config() -> SyncConfig {
    SyncConfig {
        poll_interval: Duration::from_millis(25),
        backoff_base: Duration::from_millis(10),
        backoff_cap: Duration::from_millis(40),
        backoff_jitter: 0.0,
        degraded_after: 3,
        push_retry_interval: Duration::from_millis(50),
        streaming_poll_interval: None,
        mutation_timeout: Duration::from_millis(500),
        ..SyncConfig::default()
    }
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[test]
fn consecutive_failures_degrade_then_recover() -> anyhow::Result<()> {
    init_logging();
    let transport = InMemoryTransport::new();
    transport.fail_next(3);
    transport.seed_page("alert", vec![json!({"id": "A1", "status": "OPEN"})]);

    let session = SyncSession::builder()
        .transport(transport.clone())
        .config(fast_config())
        .build()?;
    let statuses = Arc::new(Mutex::new(Vec::new()));
    let sink = statuses.clone();
    session.observe_status("alert", move |status| {
        sink.lock().unwrap().push(status);
    })?;
    session.watch("alert")?;

    assert!(wait_until(Duration::from_secs(2), || {
        session.record("alert", "A1").is_some()
    }));
    assert_eq!(session.status("alert"), SyncStatus::Polling);

    let seen = statuses.lock().unwrap().clone();
    let degraded_at = seen.iter().position(|s| *s == SyncStatus::Degraded);
    let polling_at = seen.iter().rposition(|s| *s == SyncStatus::Polling);
    assert!(degraded_at.is_some(), "expected a degraded phase, saw {:?}", seen);
    assert!(polling_at.unwrap() > degraded_at.unwrap());
    Ok(())
}

#[test]
fn auth_failure_stops_the_loop() -> anyhow::Result<()> {
    init_logging();
    let transport = InMemoryTransport::new();
    transport.fail_auth();

    let session = SyncSession::builder()
        .transport(transport.clone())
        .config(fast_config())
        .build()?;
    session.watch("alert")?;

    assert!(wait_until(Duration::from_secs(2), || {
        session.status("alert") == SyncStatus::AuthFailed
    }));

    // The loop is gone: no further fetches happen.
    let count = transport.fetch_count();
    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(transport.fetch_count(), count);
    Ok(())
}

#[test]
fn losing_the_push_channel_falls_back_to_polling() -> anyhow::Result<()> {
    init_logging();
    let transport = InMemoryTransport::new();
    let push = transport.push_sender();

    let session = SyncSession::builder()
        .transport(transport.clone())
        .config(fast_config())
        .build()?;
    session.watch("vehicle")?;

    assert!(wait_until(Duration::from_secs(2), || {
        session.status("vehicle") == SyncStatus::Streaming
    }));
    push.send(PushMessage {
        event: "updated".to_string(),
        kind: "vehicle".to_string(),
        id: "V1".to_string(),
        payload: json!({"speed": 80}),
    })?;
    assert!(wait_until(Duration::from_secs(2), || {
        session.record("vehicle", "V1").is_some()
    }));

    // Closing the channel sends the manager back to polling, where seeded
    // pages get picked up again.
    drop(push);
    assert!(wait_until(Duration::from_secs(2), || {
        session.status("vehicle") == SyncStatus::Polling
    }));
    transport.seed_page("vehicle", vec![json!({"id": "V2", "speed": 30})]);
    assert!(wait_until(Duration::from_secs(2), || {
        session.record("vehicle", "V2").is_some()
    }));
    Ok(())
}

#[test]
fn unwatch_stops_fetching() -> anyhow::Result<()> {
    init_logging();
    let transport = InMemoryTransport::new();
    let session = SyncSession::builder()
        .transport(transport.clone())
        .config(fast_config())
        .build()?;
    session.watch("vehicle")?;
    assert!(wait_until(Duration::from_secs(2), || transport.fetch_count() > 2));

    session.unwatch("vehicle")?;
    assert_eq!(session.status("vehicle"), SyncStatus::Idle);
    let count = transport.fetch_count();
    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(transport.fetch_count(), count);
    Ok(())
}

/// Transport whose fetches block until the test releases them, so a response
/// can be made to complete only after the session stopped.
#[derive(Clone)]
struct BlockingTransport {
    release_rx: Arc<Mutex<Receiver<FetchPage>>>,
}

impl BlockingTransport {
    fn new() -> (Self, Sender<FetchPage>) {
        let (tx, rx) = channel();
        (
            Self {
                release_rx: Arc::new(Mutex::new(rx)),
            },
            tx,
        )
    }
}

impl SyncTransport for BlockingTransport {
    fn fetch(
        &self,
        _kind: &str,
        _since: Option<&str>,
        _limit: usize,
    ) -> Result<FetchPage, TransportError> {
        let rx = self
            .release_rx
            .lock()
            .map_err(|_| TransportError::Connection("lock poisoned".to_string()))?;
        rx.recv().map_err(|_| TransportError::Closed)
    }

    fn submit(
        &self,
        _kind: &str,
        _id: &str,
        _action: &str,
        _params: &Map<String, Value>,
    ) -> Result<fleetsync::transport::ActionOutcome, TransportError> {
        Err(TransportError::Connection("not supported".to_string()))
    }
}

#[test]
fn response_after_dispose_is_discarded() -> anyhow::Result<()> {
    init_logging();
    let (transport, release) = BlockingTransport::new();
    let session = SyncSession::builder()
        .transport(transport)
        .config(fast_config())
        .build()?;
    session.watch("vehicle")?;

    // The worker is now blocked inside fetch. Stop the session, then let the
    // response complete: it carries a stale generation and must not land.
    std::thread::sleep(Duration::from_millis(50));
    session.dispose();
    release.send(FetchPage {
        items: vec![json!({"id": "V1", "speed": 99})],
        next_cursor: None,
    })?;

    std::thread::sleep(Duration::from_millis(100));
    assert!(session.record("vehicle", "V1").is_none());
    assert!(session.project_all("vehicle").is_empty());
    Ok(())
}

#[test]
fn restart_after_stop_uses_a_fresh_generation() -> anyhow::Result<()> {
    init_logging();
    let transport = InMemoryTransport::new();
    let session = SyncSession::builder()
        .transport(transport.clone())
        .config(fast_config())
        .build()?;

    session.watch("vehicle")?;
    assert!(wait_until(Duration::from_secs(2), || transport.fetch_count() > 0));
    session.unwatch("vehicle")?;

    transport.seed_page("vehicle", vec![json!({"id": "V7", "speed": 12})]);
    session.watch("vehicle")?;
    assert!(wait_until(Duration::from_secs(2), || {
        session.record("vehicle", "V7").is_some()
    }));
    Ok(())
}
