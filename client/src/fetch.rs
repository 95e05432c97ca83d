use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::time::Duration;

use gridclaim_shared::{GridGeometry, RawCell, WorldRect};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::chunks::{ChunkDirectory, ChunkKey, LoadState, chunk_rect, covering_keys};
use crate::error::FetchError;

pub type FetchFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Vec<RawCell>, FetchError>> + Send + 'a>>;

/// The range-query collaborator. Must be safe to call again for the same range.
pub trait RangeSource: Send + Sync + 'static {
    fn fetch_range<'a>(&'a self, rect: WorldRect) -> FetchFuture<'a>;
}

/// Receives busy/idle transitions. Driven by the owner of the scheduler's
/// event stream, so calls arrive in the order the transitions happened.
pub trait LoadingSink: Send + Sync + 'static {
    fn set_loading(&self, loading: bool);
}

#[derive(Debug)]
pub struct FetchOutcome {
    pub key: ChunkKey,
    pub result: Result<Vec<RawCell>, FetchError>,
}

/// Messages posted back to the owner of the chunk directory.
///
/// `Busy` and `Idle` are sent while the load tracker is locked, so they
/// strictly alternate on the channel starting with `Busy`.
#[derive(Debug)]
pub enum SchedulerEvent {
    /// First fetch accepted while idle.
    Busy,
    Completed(FetchOutcome),
    /// Nothing queued and no fetch running.
    Idle,
}

impl SchedulerEvent {
    /// Forward a busy/idle transition to `sink`. Other events are ignored.
    pub fn notify(&self, sink: &dyn LoadingSink) {
        match self {
            Self::Busy => sink.set_loading(true),
            Self::Idle => sink.set_loading(false),
            Self::Completed(_) => {}
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerLimits {
    pub max_concurrent: usize,
    pub timeout: Duration,
}

#[derive(Default)]
struct LoadTracker {
    /// Accepted fetches not yet completed, queued or running.
    outstanding: usize,
    busy: bool,
}

struct Shared {
    tracker: Mutex<LoadTracker>,
    permits: Arc<Semaphore>,
    dispatch: OnceLock<mpsc::UnboundedSender<ChunkKey>>,
    source: Arc<dyn RangeSource>,
    events: mpsc::UnboundedSender<SchedulerEvent>,
    geometry: GridGeometry,
    limits: SchedulerLimits,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, LoadTracker> {
        // The tracker holds plain counters; a poisoned lock is still usable.
        self.tracker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Bounded-concurrency FIFO of chunk fetches.
///
/// Accepted keys go through a single dispatcher task that takes a semaphore
/// permit per fetch, so at most `max_concurrent` run at once and they start
/// in request order. Chunk states and cells belong to the owner and are only
/// touched through [`SchedulerEvent`]s.
#[derive(Clone)]
pub struct FetchScheduler {
    shared: Arc<Shared>,
}

impl FetchScheduler {
    pub fn new(
        geometry: GridGeometry,
        source: Arc<dyn RangeSource>,
        limits: SchedulerLimits,
    ) -> (Self, mpsc::UnboundedReceiver<SchedulerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let limits = SchedulerLimits {
            max_concurrent: limits.max_concurrent.max(1),
            ..limits
        };
        let shared = Arc::new(Shared {
            tracker: Mutex::new(LoadTracker::default()),
            permits: Arc::new(Semaphore::new(limits.max_concurrent)),
            dispatch: OnceLock::new(),
            source,
            events,
            geometry,
            limits,
        });
        (Self { shared }, rx)
    }

    /// Resolve the chunks covering `rect` and queue a fetch for each one that
    /// is neither loaded, pending nor waiting out a retry backoff. Chunks
    /// entirely outside the world already count as loaded and are skipped.
    /// Returns the number of fetches queued.
    pub fn request_range(
        &self,
        directory: &mut ChunkDirectory,
        rect: &WorldRect,
        now: Instant,
    ) -> usize {
        let mut accepted = Vec::new();
        for key in covering_keys(&self.shared.geometry, rect) {
            if !directory.needs_fetch(key, now) {
                continue;
            }
            directory.mark_pending(key);
            accepted.push(key);
        }
        if accepted.is_empty() {
            return 0;
        }

        let count = accepted.len();
        {
            let mut tracker = self.shared.lock();
            tracker.outstanding += count;
            if !std::mem::replace(&mut tracker.busy, true) {
                let _ = self.shared.events.send(SchedulerEvent::Busy);
            }
        }
        let dispatch = self.dispatcher();
        for key in accepted {
            if dispatch.send(key).is_err() {
                warn!(cx = key.cx, cy = key.cy, "fetch dispatcher stopped; chunk not fetched");
                let result = Err(FetchError::Worker("fetch dispatcher stopped".to_string()));
                let _ = self
                    .shared
                    .events
                    .send(SchedulerEvent::Completed(FetchOutcome { key, result }));
                finish(&self.shared);
            }
        }
        count
    }

    /// Fetches currently holding a permit.
    pub fn in_flight(&self) -> usize {
        self.shared.limits.max_concurrent - self.shared.permits.available_permits()
    }

    /// Accepted fetches still waiting for a permit.
    pub fn queued(&self) -> usize {
        self.shared.lock().outstanding.saturating_sub(self.in_flight())
    }

    pub fn is_idle(&self) -> bool {
        self.shared.lock().outstanding == 0
    }

    /// Sender into the dispatcher task, started on first use so the scheduler
    /// can be built outside a runtime.
    fn dispatcher(&self) -> &mpsc::UnboundedSender<ChunkKey> {
        self.shared.dispatch.get_or_init(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(dispatch_loop(
                Arc::downgrade(&self.shared),
                self.shared.permits.clone(),
                rx,
            ));
            tx
        })
    }
}

/// Hands queued keys to fetch tasks in FIFO order, one permit each. Ends once
/// the scheduler is dropped.
async fn dispatch_loop(
    shared: Weak<Shared>,
    permits: Arc<Semaphore>,
    mut keys: mpsc::UnboundedReceiver<ChunkKey>,
) {
    while let Some(key) = keys.recv().await {
        let permit = match permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        let Some(shared) = shared.upgrade() else {
            return;
        };
        spawn_fetch(shared, key, permit);
    }
}

fn spawn_fetch(shared: Arc<Shared>, key: ChunkKey, permit: OwnedSemaphorePermit) {
    tokio::spawn(async move {
        let _permit = permit;
        let rect = chunk_rect(&shared.geometry, key);
        let source = shared.source.clone();
        let timeout = shared.limits.timeout;
        let attempt = tokio::spawn(async move {
            tokio::time::timeout(timeout, source.fetch_range(rect)).await
        });
        let result = match attempt.await {
            Ok(Ok(result)) => result,
            Ok(Err(_elapsed)) => Err(FetchError::Timeout(timeout)),
            Err(e) => Err(FetchError::Worker(e.to_string())),
        };
        if let Err(e) = &result {
            warn!(cx = key.cx, cy = key.cy, error = %e, "chunk fetch failed");
        }

        let _ = shared
            .events
            .send(SchedulerEvent::Completed(FetchOutcome { key, result }));
        finish(&shared);
    });
}

fn finish(shared: &Shared) {
    let mut tracker = shared.lock();
    tracker.outstanding = tracker.outstanding.saturating_sub(1);
    if tracker.outstanding == 0 && tracker.busy {
        tracker.busy = false;
        let _ = shared.events.send(SchedulerEvent::Idle);
    }
}

/// Apply the owner-side state transition for a finished fetch.
pub fn settle(
    directory: &mut ChunkDirectory,
    outcome: &FetchOutcome,
    now: Instant,
    retry_base: Duration,
    retry_max: Duration,
) {
    match &outcome.result {
        Ok(_) => directory.mark_loaded(outcome.key),
        Err(_) => {
            let (failures, backoff) =
                directory.mark_failed(outcome.key, now, retry_base, retry_max);
            debug!(
                cx = outcome.key.cx,
                cy = outcome.key.cy,
                failures,
                backoff_ms = backoff.as_millis() as u64,
                "chunk returned to unloaded"
            );
        }
    }
    debug_assert_ne!(directory.state(outcome.key), LoadState::Pending);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Source that sleeps, tracks concurrency and fails selected chunks once.
    struct ScriptedSource {
        delay: Duration,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        calls: Mutex<HashMap<(i64, i64), usize>>,
        fail_once: Mutex<Vec<(i64, i64)>>,
    }

    impl ScriptedSource {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                calls: Mutex::new(HashMap::new()),
                fail_once: Mutex::new(Vec::new()),
            }
        }

        fn calls_for(&self, min: (i64, i64)) -> usize {
            self.calls.lock().expect("calls").get(&min).copied().unwrap_or(0)
        }

        fn total_calls(&self) -> usize {
            self.calls.lock().expect("calls").values().sum()
        }
    }

    impl RangeSource for ScriptedSource {
        fn fetch_range<'a>(&'a self, rect: WorldRect) -> FetchFuture<'a> {
            Box::pin(async move {
                let origin = (rect.min_x as i64, rect.min_y as i64);
                *self.calls.lock().expect("calls").entry(origin).or_default() += 1;
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(self.delay).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);

                let mut failing = self.fail_once.lock().expect("fail list");
                if let Some(pos) = failing.iter().position(|o| *o == origin) {
                    failing.remove(pos);
                    return Err(FetchError::Status(503));
                }
                Ok(Vec::new())
            })
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        loading: AtomicBool,
        log: Mutex<Vec<bool>>,
    }

    impl RecordingSink {
        fn log(&self) -> Vec<bool> {
            self.log.lock().expect("sink log").clone()
        }
    }

    impl LoadingSink for RecordingSink {
        fn set_loading(&self, loading: bool) {
            self.loading.store(loading, Ordering::SeqCst);
            self.log.lock().expect("sink log").push(loading);
        }
    }

    struct Harness {
        scheduler: FetchScheduler,
        events: mpsc::UnboundedReceiver<SchedulerEvent>,
        directory: ChunkDirectory,
        source: Arc<ScriptedSource>,
        sink: Arc<RecordingSink>,
    }

    fn harness(max_concurrent: usize, delay: Duration, timeout: Duration) -> Harness {
        let geometry = GridGeometry::default();
        let source = Arc::new(ScriptedSource::new(delay));
        let sink = Arc::new(RecordingSink::default());
        let (scheduler, events) = FetchScheduler::new(
            geometry,
            source.clone(),
            SchedulerLimits {
                max_concurrent,
                timeout,
            },
        );
        Harness {
            scheduler,
            events,
            directory: ChunkDirectory::new(geometry),
            source,
            sink,
        }
    }

    /// Drain events until the scheduler reports idle, settling each outcome.
    async fn run_until_idle(h: &mut Harness) -> Vec<FetchOutcome> {
        let mut outcomes = Vec::new();
        while let Some(event) = h.events.recv().await {
            event.notify(h.sink.as_ref());
            match event {
                SchedulerEvent::Busy => {}
                SchedulerEvent::Completed(outcome) => {
                    settle(
                        &mut h.directory,
                        &outcome,
                        Instant::now(),
                        Duration::from_millis(500),
                        Duration::from_secs(10),
                    );
                    outcomes.push(outcome);
                }
                SchedulerEvent::Idle => break,
            }
        }
        outcomes
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_concurrency_limit() {
        let mut h = harness(6, Duration::from_millis(100), Duration::from_secs(10));
        let rect = WorldRect::new(0.0, 0.0, 5000.0, 4000.0);
        let queued = h.scheduler.request_range(&mut h.directory, &rect, Instant::now());
        assert_eq!(queued, 20);
        assert!(h.scheduler.in_flight() <= 6);

        let outcomes = run_until_idle(&mut h).await;
        assert_eq!(outcomes.len(), 20);
        assert_eq!(h.source.peak.load(Ordering::SeqCst), 6);
        assert!(h.scheduler.is_idle());
        assert_eq!(h.directory.count_in_state(LoadState::Loaded), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_requests_do_not_duplicate_pending_fetches() {
        let mut h = harness(6, Duration::from_millis(100), Duration::from_secs(10));
        let now = Instant::now();
        let first = h
            .scheduler
            .request_range(&mut h.directory, &WorldRect::new(0.0, 0.0, 2000.0, 2000.0), now);
        let second = h
            .scheduler
            .request_range(&mut h.directory, &WorldRect::new(1000.0, 1000.0, 3000.0, 3000.0), now);
        assert_eq!(first, 4);
        assert_eq!(second, 3);

        run_until_idle(&mut h).await;
        assert_eq!(h.source.total_calls(), 7);
        assert_eq!(h.source.calls_for((1000, 1000)), 1);

        // loaded chunks are never refetched
        let again = h.scheduler.request_range(
            &mut h.directory,
            &WorldRect::new(0.0, 0.0, 3000.0, 3000.0),
            Instant::now(),
        );
        assert_eq!(again, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_chunk_is_refetched_exactly_once() {
        let mut h = harness(6, Duration::from_millis(10), Duration::from_secs(10));
        h.source.fail_once.lock().expect("fail list").push((5000, 5000));
        let key = ChunkKey::new(5, 5);
        let rect = WorldRect::new(5000.0, 5000.0, 5500.0, 5500.0);

        assert_eq!(h.scheduler.request_range(&mut h.directory, &rect, Instant::now()), 1);
        let outcomes = run_until_idle(&mut h).await;
        assert!(outcomes[0].result.is_err());
        assert_eq!(h.directory.state(key), LoadState::Unloaded);

        tokio::time::advance(Duration::from_millis(600)).await;
        let now = Instant::now();
        assert_eq!(h.scheduler.request_range(&mut h.directory, &rect, now), 1);
        assert_eq!(h.scheduler.request_range(&mut h.directory, &rect, now), 0);
        run_until_idle(&mut h).await;

        assert_eq!(h.source.calls_for((5000, 5000)), 2);
        assert_eq!(h.directory.state(key), LoadState::Loaded);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_waits_for_backoff() {
        let mut h = harness(6, Duration::from_millis(10), Duration::from_secs(10));
        h.source.fail_once.lock().expect("fail list").push((0, 0));
        let rect = WorldRect::new(0.0, 0.0, 10.0, 10.0);

        h.scheduler.request_range(&mut h.directory, &rect, Instant::now());
        run_until_idle(&mut h).await;
        assert_eq!(h.scheduler.request_range(&mut h.directory, &rect, Instant::now()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_fetch_times_out_as_failure() {
        let mut h = harness(2, Duration::from_secs(30), Duration::from_secs(1));
        let rect = WorldRect::new(0.0, 0.0, 10.0, 10.0);
        h.scheduler.request_range(&mut h.directory, &rect, Instant::now());

        let outcomes = run_until_idle(&mut h).await;
        assert!(matches!(outcomes[0].result, Err(FetchError::Timeout(_))));
        assert_eq!(h.directory.state(ChunkKey::new(0, 0)), LoadState::Unloaded);
    }

    #[tokio::test(start_paused = true)]
    async fn loading_sink_sees_busy_then_idle() {
        let mut h = harness(6, Duration::from_millis(10), Duration::from_secs(10));
        let rect = WorldRect::new(0.0, 0.0, 1500.0, 10.0);
        h.scheduler.request_range(&mut h.directory, &rect, Instant::now());
        assert!(!h.scheduler.is_idle());

        run_until_idle(&mut h).await;
        assert!(!h.sink.loading.load(Ordering::SeqCst));
        assert_eq!(h.sink.log(), vec![true, false]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn busy_and_idle_alternate_under_racing_requests() {
        let mut h = harness(2, Duration::ZERO, Duration::from_secs(10));
        let mut completed = 0;
        fn drain(h: &mut Harness, completed: &mut usize) {
            while let Ok(event) = h.events.try_recv() {
                event.notify(h.sink.as_ref());
                if let SchedulerEvent::Completed(outcome) = event {
                    h.directory.mark_loaded(outcome.key);
                    *completed += 1;
                }
            }
        }

        // Single-chunk requests that finish immediately keep flipping the
        // scheduler between busy and idle while new work arrives.
        for i in 0..40_i32 {
            let x = f64::from(i) * 1000.0;
            let rect = WorldRect::new(x, 0.0, x + 10.0, 10.0);
            assert_eq!(h.scheduler.request_range(&mut h.directory, &rect, Instant::now()), 1);
            if i % 3 == 0 {
                tokio::task::yield_now().await;
            }
            drain(&mut h, &mut completed);
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while completed < 40 || !h.scheduler.is_idle() || h.sink.loading.load(Ordering::SeqCst) {
                tokio::task::yield_now().await;
                drain(&mut h, &mut completed);
            }
        })
        .await
        .expect("scheduler settles");

        let log = h.sink.log();
        assert_eq!(completed, 40);
        assert_eq!(log.first(), Some(&true));
        assert_eq!(log.last(), Some(&false));
        for pair in log.windows(2) {
            assert_ne!(pair[0], pair[1], "loading transitions out of order: {log:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn chunks_outside_world_are_loaded_without_fetch() {
        let mut h = harness(6, Duration::from_millis(10), Duration::from_secs(10));
        let rect = WorldRect::new(-500.0, -500.0, -10.0, -10.0);
        assert_eq!(h.scheduler.request_range(&mut h.directory, &rect, Instant::now()), 0);
        assert_eq!(h.directory.state(ChunkKey::new(-1, -1)), LoadState::Loaded);
        assert_eq!(h.directory.tracked_count(), 0);
        assert_eq!(h.source.total_calls(), 0);
        assert!(h.scheduler.is_idle());
        assert!(h.events.try_recv().is_err());
    }
}
