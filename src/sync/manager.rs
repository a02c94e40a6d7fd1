use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Serialize;

use crate::notifier::Notifier;
use crate::store::mutations::MutationTracker;
use crate::store::types::{now_millis, Origin};
use crate::subscriptions::SubscriptionRegistry;
use crate::sync::reconciler::Reconciler;
use crate::transport::{ArcTransport, PushChannel, SyncTransport, TransportError};

/// How long a streaming worker blocks on the push channel before checking
/// for teardown and housekeeping.
const PUSH_RECV_SLICE: Duration = Duration::from_millis(250);

#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub poll_interval: Duration,
    /// Per-request timeout applied by transports, independent of the polling
    /// interval.
    pub request_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Fractional jitter applied to backoff delays, e.g. 0.2 for ±20%.
    pub backoff_jitter: f64,
    /// Consecutive poll failures before the subscription is reported
    /// degraded. It keeps retrying either way.
    pub degraded_after: u32,
    /// How often to reattempt the push channel while polling.
    pub push_retry_interval: Duration,
    /// Safety-net poll cadence while streaming. None disables it.
    pub streaming_poll_interval: Option<Duration>,
    /// Pending mutations unconfirmed for longer than this expire.
    pub mutation_timeout: Duration,
    pub fetch_limit: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            request_timeout: Duration::from_secs(8),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
            backoff_jitter: 0.2,
            degraded_after: 5,
            push_retry_interval: Duration::from_secs(30),
            streaming_poll_interval: Some(Duration::from_secs(60)),
            mutation_timeout: Duration::from_secs(10),
            fetch_limit: 500,
        }
    }
}

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SyncStatus {
    Idle,
    Connecting,
    Streaming,
    Polling,
    Degraded,
    AuthFailed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Connecting => "connecting",
            SyncStatus::Streaming => "streaming",
            SyncStatus::Polling => "polling",
            SyncStatus::Degraded => "degraded",
            SyncStatus::AuthFailed => "auth-failed",
        }
    }
}

struct Shared {
    /// Bumped on every start/stop cycle. In-flight work re-checks it under
    /// the gate before touching the store or the status, so a slow response
    /// from a previous cycle can never resurrect old data.
    generation: AtomicU64,
    gate: Mutex<()>,
    status: Mutex<SyncStatus>,
    notifier: Notifier<SyncStatus>,
    sleep_lock: Mutex<()>,
    wake: Condvar,
}

impl Shared {
    fn set_status(&self, kind: &str, status: SyncStatus) {
        if let Ok(mut current) = self.status.lock() {
            if *current != status {
                *current = status;
                log::info!("SYNC STATUS: kind='{}' {}", kind, status.as_str());
                self.notifier.notify(status);
            }
        }
    }
}

/// Owns the data-acquisition loop for one entity kind and hides the
/// poll-versus-push choice from the rest of the system. All observers of a
/// kind share this one loop, so a dashboard with five alert widgets still
/// polls once.
pub struct TransportManager {
    kind: String,
    transport: ArcTransport,
    reconciler: Reconciler,
    tracker: MutationTracker,
    registry: SubscriptionRegistry,
    config: SyncConfig,
    shared: Arc<Shared>,
}

impl TransportManager {
    pub fn new(
        kind: &str,
        transport: ArcTransport,
        reconciler: Reconciler,
        tracker: MutationTracker,
        registry: SubscriptionRegistry,
        config: SyncConfig,
    ) -> Self {
        Self {
            kind: kind.to_string(),
            transport,
            reconciler,
            tracker,
            registry,
            config,
            shared: Arc::new(Shared {
                generation: AtomicU64::new(0),
                gate: Mutex::new(()),
                status: Mutex::new(SyncStatus::Idle),
                notifier: Notifier::new(),
                sleep_lock: Mutex::new(()),
                wake: Condvar::new(),
            }),
        }
    }

    /// Starts (or restarts) the acquisition loop under a fresh generation.
    pub fn start(&self) {
        let my_gen = {
            let _gate = self.shared.gate.lock();
            self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1
        };
        self.shared.set_status(&self.kind, SyncStatus::Connecting);
        let worker = Worker {
            kind: self.kind.clone(),
            transport: self.transport.clone(),
            reconciler: self.reconciler.clone(),
            tracker: self.tracker.clone(),
            registry: self.registry.clone(),
            config: self.config.clone(),
            shared: self.shared.clone(),
            my_gen,
        };
        thread::Builder::new()
            .name(format!("fleetsync-{}", self.kind))
            .spawn(move || worker.run())
            .map(|_| ())
            .unwrap_or_else(|e| {
                log::error!("SYNC WORKER SPAWN FAILED: kind='{}' {}", self.kind, e);
                self.shared.set_status(&self.kind, SyncStatus::Idle);
            });
    }

    /// Tears the loop down. Any response still in flight carries the old
    /// generation and is discarded; once this returns, no further store
    /// mutation or status callback can come from the stopped cycle.
    pub fn stop(&self) {
        {
            let _gate = self.shared.gate.lock();
            self.shared.generation.fetch_add(1, Ordering::SeqCst);
        }
        self.shared.set_status(&self.kind, SyncStatus::Idle);
        // Taking the sleep lock pairs the wakeup with the generation bump:
        // a worker about to wait has either seen the bump or is already
        // waiting and gets notified.
        drop(self.shared.sleep_lock.lock());
        self.shared.wake.notify_all();
    }

    /// Auth failures are fatal for the session: the loop stops and the
    /// status is distinct from degraded so the UI can redirect to
    /// re-authentication.
    pub fn note_auth_failure(&self) {
        {
            let _gate = self.shared.gate.lock();
            self.shared.generation.fetch_add(1, Ordering::SeqCst);
        }
        self.shared.set_status(&self.kind, SyncStatus::AuthFailed);
        drop(self.shared.sleep_lock.lock());
        self.shared.wake.notify_all();
    }

    pub fn status(&self) -> SyncStatus {
        self.shared
            .status
            .lock()
            .map(|status| *status)
            .unwrap_or(SyncStatus::Idle)
    }

    pub fn is_running(&self) -> bool {
        !matches!(self.status(), SyncStatus::Idle | SyncStatus::AuthFailed)
    }

    pub fn status_observer(&self) -> Receiver<SyncStatus> {
        self.shared.notifier.observer()
    }

    pub fn observe_status(&self, callback: impl FnMut(SyncStatus) + Send + 'static) {
        self.shared.notifier.observe(callback);
    }

    /// Current generation token; pair with run_gated to tag in-flight work.
    pub(crate) fn token(&self) -> u64 {
        self.shared.generation.load(Ordering::SeqCst)
    }

    /// Runs f only if token is still the live generation, serialized against
    /// stop(). Returns false when the work was discarded as stale.
    pub(crate) fn run_gated(&self, token: u64, f: impl FnOnce()) -> bool {
        let Ok(_gate) = self.shared.gate.lock() else {
            return false;
        };
        if self.shared.generation.load(Ordering::SeqCst) != token {
            return false;
        }
        f();
        true
    }
}

enum TickOutcome {
    Applied,
    Failed,
    AuthFailed,
    Stale,
}

enum StreamExit {
    ChannelLost,
    AuthFailed,
    Stale,
}

struct Worker {
    kind: String,
    transport: ArcTransport,
    reconciler: Reconciler,
    tracker: MutationTracker,
    registry: SubscriptionRegistry,
    config: SyncConfig,
    shared: Arc<Shared>,
    my_gen: u64,
}

impl Worker {
    fn run(self) {
        let mut cursor: Option<String> = None;
        let mut failures: u32 = 0;
        let mut next_push_attempt = Instant::now();

        loop {
            if self.stale() {
                break;
            }

            if Instant::now() >= next_push_attempt {
                match self.transport.open_push(&[self.kind.clone()]) {
                    Ok(channel) => {
                        failures = 0;
                        self.set_status(SyncStatus::Streaming);
                        match self.run_streaming(channel, &mut cursor) {
                            StreamExit::Stale => break,
                            StreamExit::AuthFailed => {
                                self.fail_auth();
                                break;
                            }
                            StreamExit::ChannelLost => {
                                // Fall back to polling with an immediate
                                // tick, no waiting out the normal interval.
                                self.set_status(SyncStatus::Polling);
                            }
                        }
                    }
                    Err(e) if e.is_auth() => {
                        self.fail_auth();
                        break;
                    }
                    Err(TransportError::PushUnavailable) => {
                        log::debug!("SYNC PUSH UNAVAILABLE: kind='{}'", self.kind);
                    }
                    Err(e) => {
                        log::warn!("SYNC PUSH OPEN FAILED: kind='{}' {}", self.kind, e);
                    }
                }
                next_push_attempt = Instant::now() + self.config.push_retry_interval;
            }

            // Connecting resolves to Polling as soon as the push attempt has
            // not attached; later push retries never disturb the status.
            let connecting = self
                .shared
                .status
                .lock()
                .map(|s| *s == SyncStatus::Connecting)
                .unwrap_or(false);
            if connecting {
                self.set_status(SyncStatus::Polling);
            }

            match self.poll_once(&mut cursor) {
                TickOutcome::Applied => {
                    failures = 0;
                    self.set_status(SyncStatus::Polling);
                    self.expire_mutations();
                    self.sleep(self.config.poll_interval);
                }
                TickOutcome::Failed => {
                    failures += 1;
                    if failures >= self.config.degraded_after {
                        self.set_status(SyncStatus::Degraded);
                    }
                    self.expire_mutations();
                    self.sleep(backoff_delay(&self.config, failures));
                }
                TickOutcome::AuthFailed => {
                    self.fail_auth();
                    break;
                }
                TickOutcome::Stale => break,
            }
        }
        log::debug!("SYNC WORKER EXIT: kind='{}'", self.kind);
    }

    fn run_streaming(
        &self,
        mut channel: Box<dyn PushChannel>,
        cursor: &mut Option<String>,
    ) -> StreamExit {
        let mut last_safety_poll = Instant::now();
        loop {
            if self.stale() {
                return StreamExit::Stale;
            }
            match channel.recv_timeout(PUSH_RECV_SLICE) {
                Ok(Some(message)) => {
                    if message.kind != self.kind {
                        log::debug!(
                            "SYNC PUSH SKIP: kind='{}' got message for '{}'",
                            self.kind,
                            message.kind
                        );
                    } else {
                        let applied = self.run_gated(|| {
                            if let Err(e) = self.reconciler.reconcile_push(&message) {
                                log::error!(
                                    "SYNC PUSH RECONCILE FAILED: kind='{}' {}",
                                    self.kind,
                                    e
                                );
                            }
                        });
                        if !applied {
                            return StreamExit::Stale;
                        }
                    }
                }
                Ok(None) => {}
                Err(e) if e.is_auth() => return StreamExit::AuthFailed,
                Err(e) => {
                    log::warn!("SYNC PUSH CHANNEL LOST: kind='{}' {}", self.kind, e);
                    return StreamExit::ChannelLost;
                }
            }

            if let Some(interval) = self.config.streaming_poll_interval {
                if last_safety_poll.elapsed() >= interval {
                    last_safety_poll = Instant::now();
                    match self.poll_once(cursor) {
                        TickOutcome::Stale => return StreamExit::Stale,
                        TickOutcome::AuthFailed => return StreamExit::AuthFailed,
                        TickOutcome::Applied => {}
                        TickOutcome::Failed => {
                            // The push channel is still healthy; a missed
                            // safety poll is not a degradation signal.
                            log::warn!("SYNC SAFETY POLL FAILED: kind='{}'", self.kind);
                        }
                    }
                }
            }
            self.expire_mutations();
        }
    }

    fn poll_once(&self, cursor: &mut Option<String>) -> TickOutcome {
        let result = self
            .transport
            .fetch(&self.kind, cursor.as_deref(), self.config.fetch_limit);
        match result {
            Ok(page) => {
                let next_cursor = page.next_cursor.clone();
                let applied = self.run_gated(|| {
                    match self
                        .reconciler
                        .reconcile_batch(&self.kind, page.items, Origin::Poll)
                    {
                        Ok(summary) => {
                            if summary.accepted > 0 || summary.malformed > 0 {
                                log::debug!(
                                    "SYNC POLL MERGED: kind='{}' accepted={} stale={} malformed={}",
                                    self.kind,
                                    summary.accepted,
                                    summary.stale,
                                    summary.malformed
                                );
                            }
                        }
                        Err(e) => {
                            log::error!("SYNC POLL RECONCILE FAILED: kind='{}' {}", self.kind, e)
                        }
                    }
                });
                if !applied {
                    return TickOutcome::Stale;
                }
                if next_cursor.is_some() {
                    *cursor = next_cursor;
                }
                TickOutcome::Applied
            }
            Err(e) if e.is_auth() => TickOutcome::AuthFailed,
            Err(e) => {
                log::warn!("SYNC POLL FAILED: kind='{}' {}", self.kind, e);
                TickOutcome::Failed
            }
        }
    }

    fn expire_mutations(&self) {
        self.run_gated(|| {
            match self
                .tracker
                .expire_stale(now_millis(), self.config.mutation_timeout)
            {
                Ok(expired) => {
                    if expired.is_empty() {
                        return;
                    }
                    let mut by_kind: HashMap<String, Vec<String>> = HashMap::new();
                    for (kind, entity_id) in expired {
                        by_kind.entry(kind).or_default().push(entity_id);
                    }
                    for (kind, ids) in by_kind {
                        self.registry.notify(&kind, &ids);
                    }
                }
                Err(e) => log::error!("SYNC EXPIRE SWEEP FAILED: kind='{}' {}", self.kind, e),
            }
        });
    }

    fn set_status(&self, status: SyncStatus) {
        self.run_gated(|| self.shared.set_status(&self.kind, status));
    }

    fn fail_auth(&self) {
        {
            let _gate = self.shared.gate.lock();
            // Only this generation may declare the session dead; a stale
            // worker racing a restart must not clobber the new cycle.
            if self.shared.generation.load(Ordering::SeqCst) != self.my_gen {
                return;
            }
            self.shared.generation.fetch_add(1, Ordering::SeqCst);
        }
        self.shared.set_status(&self.kind, SyncStatus::AuthFailed);
        self.shared.wake.notify_all();
    }

    fn stale(&self) -> bool {
        self.shared.generation.load(Ordering::SeqCst) != self.my_gen
    }

    fn run_gated(&self, f: impl FnOnce()) -> bool {
        let Ok(_gate) = self.shared.gate.lock() else {
            return false;
        };
        if self.stale() {
            return false;
        }
        f();
        true
    }

    fn sleep(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        let Ok(mut guard) = self.shared.sleep_lock.lock() else {
            return;
        };
        while !self.stale() {
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            match self.shared.wake.wait_timeout(guard, deadline - now) {
                Ok((g, timeout)) => {
                    guard = g;
                    if timeout.timed_out() {
                        return;
                    }
                }
                Err(_) => return,
            }
        }
    }
}

fn backoff_delay(config: &SyncConfig, failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(10);
    let base = config.backoff_base.as_secs_f64() * (1u64 << exp) as f64;
    let capped = base.min(config.backoff_cap.as_secs_f64());
    let jitter = if config.backoff_jitter > 0.0 {
        1.0 + rand::thread_rng().gen_range(-config.backoff_jitter..=config.backoff_jitter)
    } else {
        1.0
    };
    Duration::from_secs_f64((capped * jitter).max(0.05))
}
