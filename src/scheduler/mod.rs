//! Scheduler module for running probes on their configured intervals.
//!
//! Endpoints sharing an interval share one timer. Each tick hands every member
//! endpoint to a bounded worker pool, staggered within the interval. An
//! endpoint whose previous run has not finished skips the tick.

mod pipeline;

pub use pipeline::*;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::{Endpoint, Snapshot};
use crate::probe::{ProbeContext, ProbeRegistry, TestStatus};

/// Scheduler errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchedulerError {
    #[error("scheduler is already running")]
    AlreadyRunning,
    #[error("scheduler is not running")]
    NotRunning,
    #[error("rejected configuration: {0}")]
    InvalidSnapshot(String),
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Maximum number of scheduled probes in flight.
    pub workers: usize,
    /// Spread endpoint starts over the interval instead of firing together.
    pub stagger: bool,
    /// How long `stop` waits for in-flight probes before cancelling them.
    pub shutdown_grace: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            workers: 10,
            stagger: true,
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// Per-endpoint lifecycle. `Cancelled` is terminal and only reached on stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointState {
    Idle,
    Pending,
    Running,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    EndpointAdded { endpoint_id: String },
    EndpointRemoved { endpoint_id: String },
    ProbeStarted { endpoint_id: String },
    ProbeFinished { endpoint_id: String, status: TestStatus },
    TickSkipped { endpoint_id: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub interval_seconds: f64,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub active_tests: usize,
    pub completed_tests: u64,
    pub skipped_ticks: u64,
    pub endpoints: usize,
}

/// What changed when a snapshot was applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<String>,
}

struct Slot {
    id: String,
    endpoint: ArcSwap<Endpoint>,
    state: Mutex<EndpointState>,
    retired: AtomicBool,
}

impl Slot {
    fn set_state(&self, next: EndpointState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        // Cancelled is terminal
        if *state != EndpointState::Cancelled {
            *state = next;
        }
    }

    fn state(&self) -> EndpointState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_busy(&self) -> bool {
        matches!(self.state(), EndpointState::Pending | EndpointState::Running)
    }

    /// Move Idle → Pending. False when a previous run is still pending or running.
    fn try_claim(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == EndpointState::Idle {
            *state = EndpointState::Pending;
            true
        } else {
            false
        }
    }
}

#[derive(Clone)]
struct Member {
    slot: Arc<Slot>,
    offset: Duration,
}

type Members = Arc<RwLock<Vec<Member>>>;

struct Group {
    members: Members,
    next_tick: Arc<Mutex<Option<DateTime<Utc>>>>,
    stop: CancellationToken,
}

/// State shared with the timer and dispatch tasks.
struct Shared {
    registry: Arc<ProbeRegistry>,
    pipeline: ResultPipeline,
    pool: Arc<Semaphore>,
    tracker: TaskTracker,
    events: broadcast::Sender<SchedulerEvent>,
    active: AtomicUsize,
    completed: AtomicU64,
    skipped: AtomicU64,
    last_run: Mutex<Option<DateTime<Utc>>>,
}

impl Shared {
    fn emit(&self, event: SchedulerEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

#[derive(Default)]
struct Inner {
    running: bool,
    interval_seconds: f64,
    slots: HashMap<String, Arc<Slot>>,
    /// Removed slots whose last run is still pending or running.
    retiring: HashMap<String, Arc<Slot>>,
    /// Endpoint id → interval key of the group it belongs to.
    memberships: HashMap<String, u64>,
    groups: HashMap<u64, Group>,
    /// Stops timers and pending dispatches.
    shutdown: CancellationToken,
    /// Cancels probes still running once the shutdown grace expires.
    abort: CancellationToken,
}

/// Periodic test driver with an explicit start/stop lifecycle.
pub struct Scheduler {
    shared: Arc<Shared>,
    inner: Mutex<Inner>,
    options: SchedulerOptions,
}

impl Scheduler {
    pub fn new(registry: Arc<ProbeRegistry>, pipeline: ResultPipeline, options: SchedulerOptions) -> Self {
        let (events, _) = broadcast::channel(256);
        let shared = Shared {
            registry,
            pipeline,
            pool: Arc::new(Semaphore::new(options.workers.max(1))),
            tracker: TaskTracker::new(),
            events,
            active: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            last_run: Mutex::new(None),
        };
        Self {
            shared: Arc::new(shared),
            inner: Mutex::new(Inner::default()),
            options,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.shared.events.subscribe()
    }

    /// Start scheduling every endpoint in `snapshot`.
    pub fn start(&self, snapshot: &Snapshot) -> Result<SnapshotDiff, SchedulerError> {
        snapshot
            .validate()
            .map_err(|e| SchedulerError::InvalidSnapshot(e.to_string()))?;

        {
            let mut inner = self.lock();
            if inner.running {
                return Err(SchedulerError::AlreadyRunning);
            }
            inner.running = true;
            inner.shutdown = CancellationToken::new();
            inner.abort = CancellationToken::new();
            inner.slots.clear();
            inner.retiring.clear();
            inner.memberships.clear();
            inner.groups.clear();
        }
        self.shared.tracker.reopen();

        tracing::info!("Starting scheduler with {} endpoints", snapshot.endpoints().count());
        self.apply_snapshot(snapshot)
    }

    /// Diff the active endpoint set against `snapshot` and adjust timers.
    ///
    /// A snapshot that fails validation is rejected as a whole and the
    /// previous configuration stays active.
    pub fn apply_snapshot(&self, snapshot: &Snapshot) -> Result<SnapshotDiff, SchedulerError> {
        if let Err(e) = snapshot.validate() {
            tracing::error!("Rejecting configuration snapshot: {}", e);
            return Err(SchedulerError::InvalidSnapshot(e.to_string()));
        }

        let mut inner = self.lock();
        if !inner.running {
            return Err(SchedulerError::NotRunning);
        }
        inner.interval_seconds = snapshot.settings.test_interval_seconds;

        let desired: HashMap<&str, &Endpoint> = snapshot.endpoints().map(|e| (e.id.as_str(), e)).collect();
        let mut diff = SnapshotDiff::default();

        let removed: Vec<String> = inner
            .slots
            .keys()
            .filter(|id| !desired.contains_key(id.as_str()))
            .cloned()
            .collect();
        inner.retiring.retain(|_, slot| slot.is_busy());
        for id in removed {
            if let Some(slot) = inner.slots.remove(&id) {
                slot.retired.store(true, Ordering::SeqCst);
                if slot.is_busy() {
                    inner.retiring.insert(id.clone(), slot);
                }
            }
            self.leave_group(&mut inner, &id);
            tracing::info!("Scheduler: Removed endpoint {}", id);
            self.shared.emit(SchedulerEvent::EndpointRemoved { endpoint_id: id.clone() });
            diff.removed.push(id);
        }

        for (id, endpoint) in desired {
            let interval = endpoint.interval(&snapshot.settings);
            let key = interval.to_bits();

            match inner.slots.get(id).cloned() {
                Some(slot) => {
                    let changed = **slot.endpoint.load() != *endpoint;
                    if changed {
                        slot.endpoint.store(Arc::new(endpoint.clone()));
                        diff.modified.push(id.to_string());
                    }
                    if inner.memberships.get(id) != Some(&key) {
                        self.leave_group(&mut inner, id);
                        self.join_group(&mut inner, slot, interval);
                    }
                }
                None => {
                    // A re-added id takes over its old slot so an in-flight
                    // run still blocks the next one
                    let slot = match inner.retiring.remove(id) {
                        Some(slot) => {
                            slot.endpoint.store(Arc::new(endpoint.clone()));
                            slot.retired.store(false, Ordering::SeqCst);
                            slot
                        }
                        None => Arc::new(Slot {
                            id: id.to_string(),
                            endpoint: ArcSwap::from_pointee(endpoint.clone()),
                            state: Mutex::new(EndpointState::Idle),
                            retired: AtomicBool::new(false),
                        }),
                    };
                    inner.slots.insert(id.to_string(), slot.clone());
                    self.join_group(&mut inner, slot, interval);
                    tracing::info!("Scheduler: Adding endpoint {} every {}s", id, interval);
                    self.shared.emit(SchedulerEvent::EndpointAdded {
                        endpoint_id: id.to_string(),
                    });
                    diff.added.push(id.to_string());
                }
            }
        }

        diff.added.sort();
        diff.removed.sort();
        diff.modified.sort();
        Ok(diff)
    }

    /// Stop all timers and wait for in-flight probes.
    ///
    /// Probes still running after the grace period are cancelled; their
    /// cancelled results are not published.
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        let (shutdown, abort, slots) = {
            let mut inner = self.lock();
            if !inner.running {
                return Err(SchedulerError::NotRunning);
            }
            inner.running = false;
            inner.groups.clear();
            inner.memberships.clear();
            (inner.shutdown.clone(), inner.abort.clone(), inner.slots.values().cloned().collect::<Vec<_>>())
        };

        tracing::info!("Stopping scheduler");
        shutdown.cancel();
        self.shared.tracker.close();

        if tokio::time::timeout(self.options.shutdown_grace, self.shared.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                "Timeout waiting for {} active tests to complete, cancelling them",
                self.shared.active.load(Ordering::SeqCst)
            );
            abort.cancel();
            self.shared.tracker.wait().await;
        }

        for slot in slots {
            let mut state = slot.state.lock().unwrap_or_else(|e| e.into_inner());
            *state = EndpointState::Cancelled;
        }
        tracing::info!("Scheduler stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    pub fn status(&self) -> SchedulerStatus {
        let inner = self.lock();
        let next_run = inner
            .groups
            .values()
            .filter_map(|g| *g.next_tick.lock().unwrap_or_else(|e| e.into_inner()))
            .min();
        SchedulerStatus {
            running: inner.running,
            interval_seconds: inner.interval_seconds,
            last_run: *self.shared.last_run.lock().unwrap_or_else(|e| e.into_inner()),
            next_run,
            active_tests: self.shared.active.load(Ordering::SeqCst),
            completed_tests: self.shared.completed.load(Ordering::SeqCst),
            skipped_ticks: self.shared.skipped.load(Ordering::SeqCst),
            endpoints: inner.slots.len(),
        }
    }

    /// Current state of every scheduled endpoint, sorted by id.
    pub fn endpoint_states(&self) -> Vec<(String, EndpointState)> {
        let inner = self.lock();
        let mut states: Vec<_> = inner.slots.values().map(|s| (s.id.clone(), s.state())).collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn join_group(&self, inner: &mut Inner, slot: Arc<Slot>, interval_seconds: f64) {
        let key = interval_seconds.to_bits();
        let interval = Duration::from_secs_f64(interval_seconds);
        let offset = if self.options.stagger {
            stagger_offset(&slot.id, interval)
        } else {
            Duration::ZERO
        };
        inner.memberships.insert(slot.id.clone(), key);

        if let Some(group) = inner.groups.get(&key) {
            group
                .members
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .push(Member { slot, offset });
            return;
        }

        let group = Group {
            members: Arc::new(RwLock::new(vec![Member { slot, offset }])),
            next_tick: Arc::new(Mutex::new(None)),
            stop: inner.shutdown.child_token(),
        };
        let shared = self.shared.clone();
        let members = group.members.clone();
        let next_tick = group.next_tick.clone();
        let stop = group.stop.clone();
        let shutdown = inner.shutdown.clone();
        let abort = inner.abort.clone();
        self.shared
            .tracker
            .spawn(run_timer(interval, members, next_tick, shared, stop, shutdown, abort));
        inner.groups.insert(key, group);
    }

    fn leave_group(&self, inner: &mut Inner, id: &str) {
        let Some(key) = inner.memberships.remove(id) else {
            return;
        };
        let empty = match inner.groups.get(&key) {
            Some(group) => {
                let mut members = group.members.write().unwrap_or_else(|e| e.into_inner());
                members.retain(|m| m.slot.id != id);
                members.is_empty()
            }
            None => false,
        };
        if empty {
            if let Some(group) = inner.groups.remove(&key) {
                group.stop.cancel();
            }
        }
    }
}

/// Deterministic start offset within `interval`, from the FNV-1a hash of the id.
pub fn stagger_offset(endpoint_id: &str, interval: Duration) -> Duration {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let window = interval.as_millis() as u64;
    if window == 0 {
        return Duration::ZERO;
    }
    let hash = endpoint_id
        .bytes()
        .fold(FNV_OFFSET, |h, b| (h ^ b as u64).wrapping_mul(FNV_PRIME));
    Duration::from_millis(hash % window)
}

/// Timer loop for one interval group.
async fn run_timer(
    period: Duration,
    members: Members,
    next_tick: Arc<Mutex<Option<DateTime<Utc>>>>,
    shared: Arc<Shared>,
    stop: CancellationToken,
    shutdown: CancellationToken,
    abort: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let next_delta = chrono::Duration::from_std(period).unwrap_or_else(|_| chrono::Duration::zero());

    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                break;
            }
            _ = interval.tick() => {
                *next_tick.lock().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now() + next_delta);
                let current: Vec<Member> = members.read().unwrap_or_else(|e| e.into_inner()).clone();
                for member in current {
                    dispatch(&shared, member, &shutdown, &abort);
                }
            }
        }
    }
}

/// Start the member's run for this tick, shifted by its stagger offset.
///
/// The slot stays idle during the offset, so only a run that is still pending
/// or running at the endpoint's own tick causes a skip.
fn dispatch(shared: &Arc<Shared>, member: Member, shutdown: &CancellationToken, abort: &CancellationToken) {
    let Member { slot, offset } = member;
    if offset.is_zero() {
        claim(shared, slot, shutdown, abort);
        return;
    }

    let delayed = shared.clone();
    let shutdown = shutdown.clone();
    let abort = abort.clone();
    shared.tracker.spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(offset) => {}
            _ = shutdown.cancelled() => return,
        }
        claim(&delayed, slot, &shutdown, &abort);
    });
}

/// Claim the endpoint and hand it to the pool, or record a skip.
fn claim(shared: &Arc<Shared>, slot: Arc<Slot>, shutdown: &CancellationToken, abort: &CancellationToken) {
    if slot.retired.load(Ordering::SeqCst) || shutdown.is_cancelled() {
        return;
    }

    if !slot.try_claim() {
        shared.skipped.fetch_add(1, Ordering::SeqCst);
        tracing::warn!("Skipping tick for {}: previous run still in progress", slot.id);
        shared.emit(SchedulerEvent::TickSkipped {
            endpoint_id: slot.id.clone(),
        });
        return;
    }

    shared
        .tracker
        .spawn(run_endpoint(shared.clone(), slot, shutdown.clone(), abort.clone()));
}

async fn run_endpoint(
    shared: Arc<Shared>,
    slot: Arc<Slot>,
    shutdown: CancellationToken,
    abort: CancellationToken,
) {
    // Wait for a worker rather than spawning unbounded probes
    let permit = tokio::select! {
        permit = shared.pool.clone().acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => {
                slot.set_state(EndpointState::Cancelled);
                return;
            }
        },
        _ = shutdown.cancelled() => {
            slot.set_state(EndpointState::Cancelled);
            return;
        }
    };

    if slot.retired.load(Ordering::SeqCst) {
        slot.set_state(EndpointState::Idle);
        return;
    }

    let endpoint = slot.endpoint.load_full();
    let config = endpoint.test_config();
    if let Err(e) = shared.registry.validate(&config) {
        tracing::error!("Skipping invalid endpoint {}: {}", slot.id, e);
        slot.set_state(EndpointState::Idle);
        return;
    }

    slot.set_state(EndpointState::Running);
    shared.active.fetch_add(1, Ordering::SeqCst);
    shared.emit(SchedulerEvent::ProbeStarted {
        endpoint_id: slot.id.clone(),
    });

    let ctx = ProbeContext::with_cancellation(abort.child_token());
    let result = shared.registry.execute(&ctx, &config).await;

    drop(permit);
    shared.active.fetch_sub(1, Ordering::SeqCst);
    shared.completed.fetch_add(1, Ordering::SeqCst);

    if result.status == TestStatus::Cancelled && abort.is_cancelled() {
        slot.set_state(EndpointState::Cancelled);
        return;
    }

    if !result.status.is_success() {
        tracing::debug!(
            "Probe for {} finished with {}: {}",
            slot.id,
            result.status,
            result.message.as_deref().unwrap_or("")
        );
    }

    *shared.last_run.lock().unwrap_or_else(|e| e.into_inner()) = Some(result.timestamp);
    shared.emit(SchedulerEvent::ProbeFinished {
        endpoint_id: slot.id.clone(),
        status: result.status,
    });
    let _ = shared.pipeline.publish(result).await;
    slot.set_state(EndpointState::Idle);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::Aggregator;
    use crate::config::Region;
    use crate::probe::{
        PhaseLog, Probe, ProbeError, Protocol, TestConfig, TestResult,
    };
    use async_trait::async_trait;
    use tokio::sync::{mpsc, Notify};

    /// TCP stand-in that blocks until released and tracks concurrency.
    #[derive(Default)]
    struct GateProbe {
        started: AtomicUsize,
        current: AtomicUsize,
        peak: AtomicUsize,
        release: Notify,
    }

    #[async_trait]
    impl Probe for GateProbe {
        fn protocol(&self) -> Protocol {
            Protocol::Tcp
        }

        fn validate(&self, _config: &TestConfig) -> Result<(), ProbeError> {
            Ok(())
        }

        async fn run(&self, config: &TestConfig, _deadline: tokio::time::Instant, _phases: &mut PhaseLog) -> TestResult {
            self.started.fetch_add(1, Ordering::SeqCst);
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.release.notified().await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            TestResult::new(config, Utc::now(), TestStatus::Success).with_latency(Duration::from_millis(1))
        }
    }

    /// Takes a fixed time and records when each endpoint started.
    struct SleepProbe {
        run_for: Duration,
        starts: Mutex<Vec<(String, tokio::time::Instant)>>,
    }

    impl SleepProbe {
        fn new(run_for: Duration) -> Self {
            Self {
                run_for,
                starts: Mutex::new(Vec::new()),
            }
        }

        fn first_start(&self, id: &str) -> Option<tokio::time::Instant> {
            let starts = self.starts.lock().unwrap();
            starts.iter().find(|(e, _)| e == id).map(|(_, t)| *t)
        }
    }

    #[async_trait]
    impl Probe for SleepProbe {
        fn protocol(&self) -> Protocol {
            Protocol::Tcp
        }

        fn validate(&self, _config: &TestConfig) -> Result<(), ProbeError> {
            Ok(())
        }

        async fn run(&self, config: &TestConfig, _deadline: tokio::time::Instant, _phases: &mut PhaseLog) -> TestResult {
            self.starts
                .lock()
                .unwrap()
                .push((config.endpoint_id.clone(), tokio::time::Instant::now()));
            tokio::time::sleep(self.run_for).await;
            TestResult::new(config, Utc::now(), TestStatus::Success).with_latency(self.run_for)
        }
    }

    fn staggered(probe: Arc<SleepProbe>) -> (Scheduler, mpsc::Receiver<crate::sink::ResultRecord>) {
        let mut registry = ProbeRegistry::new();
        registry.register(probe);
        let (tx, rx) = mpsc::channel(1024);
        let pipeline = ResultPipeline::new(Arc::new(Aggregator::new()), tx);
        let options = SchedulerOptions {
            workers: 4,
            stagger: true,
            shutdown_grace: Duration::from_secs(1),
        };
        (Scheduler::new(Arc::new(registry), pipeline, options), rx)
    }

    fn snapshot(ids: &[&str], interval: f64) -> Snapshot {
        let endpoints = ids
            .iter()
            .map(|id| {
                let mut e = Endpoint::new(*id, Protocol::Tcp, "127.0.0.1:9");
                e.id = id.to_string();
                e.timeout_ms = 60_000;
                e
            })
            .collect();
        let mut snapshot = Snapshot::default();
        snapshot.regions.clear();
        snapshot.regions.insert(
            "Test".into(),
            Region {
                endpoints,
                ..Default::default()
            },
        );
        snapshot.settings.test_interval_seconds = interval;
        snapshot
    }

    fn scheduler(probe: Arc<GateProbe>, options: SchedulerOptions) -> (Scheduler, mpsc::Receiver<crate::sink::ResultRecord>) {
        let mut registry = ProbeRegistry::new();
        registry.register(probe);
        let (tx, rx) = mpsc::channel(1024);
        let pipeline = ResultPipeline::new(Arc::new(Aggregator::new()), tx);
        (Scheduler::new(Arc::new(registry), pipeline, options), rx)
    }

    fn no_stagger(workers: usize) -> SchedulerOptions {
        SchedulerOptions {
            workers,
            stagger: false,
            shutdown_grace: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_stagger_offset_is_deterministic_and_bounded() {
        let interval = Duration::from_secs(60);
        let a = stagger_offset("NA-East-Web", interval);
        assert_eq!(a, stagger_offset("NA-East-Web", interval));
        assert!(a < interval);
        assert_ne!(a, stagger_offset("NA-East-DNS", interval));
        assert_eq!(stagger_offset("x", Duration::ZERO), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_if_running() {
        let probe = Arc::new(GateProbe::default());
        let (scheduler, _rx) = scheduler(probe.clone(), no_stagger(4));
        let mut events = scheduler.subscribe();

        scheduler.start(&snapshot(&["x"], 0.1)).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(probe.started.load(Ordering::SeqCst), 1);
        assert_eq!(probe.peak.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.status().skipped_ticks, 1);

        let mut skipped = 0;
        while let Ok(event) = events.try_recv() {
            if event == (SchedulerEvent::TickSkipped { endpoint_id: "x".into() }) {
                skipped += 1;
            }
        }
        assert_eq!(skipped, 1);

        probe.release.notify_waiters();
        scheduler.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stagger_spreads_first_runs() {
        let probe = Arc::new(SleepProbe::new(Duration::from_millis(5)));
        let (scheduler, _rx) = staggered(probe.clone());
        let ids = ["a", "b", "c", "d", "e"];
        let interval = Duration::from_secs(10);

        let started = tokio::time::Instant::now();
        scheduler.start(&snapshot(&ids, 10.0)).unwrap();
        tokio::time::sleep(interval + Duration::from_millis(1)).await;

        let mut offsets = Vec::new();
        for id in ids {
            let first = probe.first_start(id).unwrap() - started;
            let expected = stagger_offset(id, interval);
            assert!(first >= expected && first < expected + Duration::from_millis(5), "{id}: {first:?} vs {expected:?}");
            assert!(first < interval);
            offsets.push(expected);
        }
        offsets.sort();
        offsets.dedup();
        assert!(offsets.len() > 1);

        scheduler.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stagger_offset_does_not_cause_skips() {
        let run_for = Duration::from_millis(200);
        let interval = Duration::from_secs(1);
        // Offset plus run time exceeds the interval, the run alone does not
        assert!(stagger_offset("ep1", interval) + run_for > interval);

        let probe = Arc::new(SleepProbe::new(run_for));
        let (scheduler, _rx) = staggered(probe.clone());
        scheduler.start(&snapshot(&["ep1"], 1.0)).unwrap();
        tokio::time::sleep(Duration::from_millis(10_050)).await;

        let status = scheduler.status();
        assert_eq!(status.skipped_ticks, 0);
        assert!(status.completed_tests >= 9, "completed {}", status.completed_tests);
        scheduler.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_readded_endpoint_waits_for_its_inflight_run() {
        let probe = Arc::new(GateProbe::default());
        let (scheduler, _rx) = scheduler(probe.clone(), no_stagger(4));

        scheduler.start(&snapshot(&["a"], 0.1)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(probe.started.load(Ordering::SeqCst), 1);

        let diff = scheduler.apply_snapshot(&snapshot(&[], 0.1)).unwrap();
        assert_eq!(diff.removed, vec!["a".to_string()]);
        let diff = scheduler.apply_snapshot(&snapshot(&["a"], 0.1)).unwrap();
        assert_eq!(diff.added, vec!["a".to_string()]);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(probe.started.load(Ordering::SeqCst), 1);
        assert_eq!(probe.peak.load(Ordering::SeqCst), 1);
        assert!(scheduler.status().skipped_ticks >= 1);

        // Once the old run finishes the endpoint is scheduled again
        probe.release.notify_waiters();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(probe.started.load(Ordering::SeqCst), 2);
        assert_eq!(probe.peak.load(Ordering::SeqCst), 1);

        probe.release.notify_waiters();
        scheduler.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_bounds_concurrency() {
        let probe = Arc::new(GateProbe::default());
        let (scheduler, _rx) = scheduler(probe.clone(), no_stagger(2));

        scheduler.start(&snapshot(&["a", "b", "c", "d", "e"], 10.0)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(probe.started.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.status().active_tests, 2);

        // Releasing lets the waiting endpoints through, still two at a time
        for _ in 0..3 {
            probe.release.notify_waiters();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(probe.started.load(Ordering::SeqCst), 5);
        assert_eq!(probe.peak.load(Ordering::SeqCst), 2);

        probe.release.notify_waiters();
        scheduler.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_are_published() {
        let probe = Arc::new(GateProbe::default());
        let (scheduler, mut rx) = scheduler(probe.clone(), no_stagger(4));

        scheduler.start(&snapshot(&["a"], 10.0)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        probe.release.notify_waiters();

        let record = rx.recv().await.unwrap();
        assert_eq!(record.result().endpoint_id, "a");
        assert_eq!(record.result().status, TestStatus::Success);

        let status = scheduler.status();
        assert_eq!(status.completed_tests, 1);
        assert!(status.last_run.is_some());
        assert!(status.next_run.is_some());
        scheduler.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_snapshot_diffs_endpoints() {
        let probe = Arc::new(GateProbe::default());
        let (scheduler, _rx) = scheduler(probe.clone(), no_stagger(4));

        let diff = scheduler.start(&snapshot(&["a", "b"], 10.0)).unwrap();
        assert_eq!(diff.added, vec!["a".to_string(), "b".to_string()]);

        let mut next = snapshot(&["b", "c"], 10.0);
        next.regions.get_mut("Test").unwrap().endpoints[0].address = "127.0.0.1:10".into();
        let diff = scheduler.apply_snapshot(&next).unwrap();
        assert_eq!(diff.added, vec!["c".to_string()]);
        assert_eq!(diff.removed, vec!["a".to_string()]);
        assert_eq!(diff.modified, vec!["b".to_string()]);

        let ids: Vec<String> = scheduler.endpoint_states().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["b".to_string(), "c".to_string()]);

        probe.release.notify_waiters();
        scheduler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_snapshot_keeps_previous() {
        let probe = Arc::new(GateProbe::default());
        let (scheduler, _rx) = scheduler(probe.clone(), no_stagger(4));
        scheduler.start(&snapshot(&["a"], 10.0)).unwrap();

        let mut bad = snapshot(&["a", "b"], 10.0);
        bad.regions.get_mut("Test").unwrap().endpoints[1].interval_seconds = Some(0.0);
        assert!(matches!(
            scheduler.apply_snapshot(&bad),
            Err(SchedulerError::InvalidSnapshot(_))
        ));
        assert_eq!(scheduler.status().endpoints, 1);

        probe.release.notify_waiters();
        scheduler.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_overrunning_probes() {
        let probe = Arc::new(GateProbe::default());
        let (scheduler, mut rx) = scheduler(probe.clone(), no_stagger(4));
        scheduler.start(&snapshot(&["slow"], 10.0)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(scheduler.status().active_tests, 1);

        // Never released: the grace period expires and the probe is cancelled
        scheduler.stop().await.unwrap();
        assert!(!scheduler.is_running());
        assert_eq!(scheduler.endpoint_states(), vec![("slow".to_string(), EndpointState::Cancelled)]);
        assert!(rx.try_recv().is_err());

        assert_eq!(scheduler.stop().await, Err(SchedulerError::NotRunning));
    }
}
