//! Crawl worker runtime.
//!
//! A [`Worker`] wraps one [`CrawlJob`] and gives it:
//!   - a long-lived loop task (`start` / `stop`) running the job every
//!     `interval`, or after `error_cooldown` when a run fails outright;
//!   - on-demand runs (`run_once`, `trigger_once`) sharing the loop's
//!     single-flight guard, so at most one run is in flight per worker;
//!   - a [`RunState`] that status queries read as a snapshot copy.
//!
//! Cancellation is cooperative: the job checks [`RunContext::is_cancelled`]
//! between units of work and its politeness pauses wake early on stop.
//! `shutdown` waits for spawned on-demand runs as well as the loop, so a
//! cancelled run still gets to save what it collected.

pub mod price;
pub mod report;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Local, NaiveDateTime};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// How long `stop` and `shutdown` wait for in-flight runs.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

// ── Run state ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum RunPhase {
    #[default]
    Idle,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunOutcome {
    CompletedOk,
    CompletedWithErrors,
    Cancelled,
    /// Another run was already in flight; nothing was done.
    Skipped,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunState {
    /// The periodic loop is active.
    pub is_running: bool,
    /// Whether a run (periodic or on-demand) is executing right now.
    pub phase: RunPhase,
    pub started_at: Option<NaiveDateTime>,
    pub items_crawled: u64,
    pub errors_count: u64,
    pub last_run_started_at: Option<NaiveDateTime>,
    pub last_run_finished_at: Option<NaiveDateTime>,
    pub last_outcome: Option<RunOutcome>,
    pub last_error: Option<String>,
}

type SharedState = Arc<Mutex<RunState>>;

fn lock(state: &Mutex<RunState>) -> MutexGuard<'_, RunState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Run context ───────────────────────────────────────────────────────────────

/// Per-run knobs supplied by the caller of an on-demand run.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Overrides the report worker's configured `full_crawl` for one run.
    pub full_crawl: Option<bool>,
}

/// Handed to [`CrawlJob::run`]: cancellation, counters, pauses.
pub struct RunContext {
    cancel: CancellationToken,
    state: SharedState,
    errors: AtomicU64,
    options: RunOptions,
}

impl RunContext {
    fn new(cancel: CancellationToken, state: SharedState, options: RunOptions) -> Self {
        Self {
            cancel,
            state,
            errors: AtomicU64::new(0),
            options,
        }
    }

    /// A context not attached to any worker.
    #[cfg(test)]
    pub fn detached(options: RunOptions) -> Self {
        Self::new(CancellationToken::new(), SharedState::default(), options)
    }

    pub fn options(&self) -> RunOptions {
        self.options
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    #[cfg(test)]
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Count one failed unit of work (a market, a province, a report page...).
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        lock(&self.state).errors_count += 1;
    }

    /// Count records produced by this run, as they are accepted.
    pub fn record_items(&self, n: usize) {
        lock(&self.state).items_crawled += n as u64;
    }

    pub fn errors_this_run(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Sleep for `d`, waking early on cancellation. Returns `false` when cancelled.
    pub async fn pause(&self, d: Duration) -> bool {
        if d.is_zero() {
            return !self.is_cancelled();
        }
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(d) => true,
        }
    }

    /// Politeness delay: `base` plus up to `jitter` of random extra.
    pub async fn polite_pause(&self, base: Duration, jitter: Duration) -> bool {
        let extra = match jitter.as_millis() as u64 {
            0 => 0,
            max => rand::random_range(0..=max),
        };
        self.pause(base + Duration::from_millis(extra)).await
    }
}

// ── Job trait ─────────────────────────────────────────────────────────────────

/// One kind of crawl. A run enumerates its units sequentially, reports
/// progress through the context and persists its batch once at the end.
/// An `Err` means the run failed as a whole (e.g. the batch could not be
/// saved); unit failures are counted with [`RunContext::record_error`].
#[async_trait]
pub trait CrawlJob: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Whether the scheduler should trigger this job periodically.
    fn enabled(&self) -> bool {
        true
    }

    fn interval(&self) -> Duration;

    fn error_cooldown(&self) -> Duration;

    async fn run(&self, ctx: &RunContext) -> Result<()>;
}

// ── Worker ────────────────────────────────────────────────────────────────────

struct LoopHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner<J> {
    job: J,
    state: SharedState,
    run_guard: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
    loop_handle: Mutex<Option<LoopHandle>>,
    on_demand: TaskTracker,
    stop_timeout: Duration,
}

pub struct Worker<J> {
    inner: Arc<Inner<J>>,
}

impl<J> Clone for Worker<J> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<J: CrawlJob> Worker<J> {
    pub fn new(job: J) -> Self {
        Self::with_shutdown(job, CancellationToken::new())
    }

    /// All loop and on-demand runs are cancelled when `shutdown` is.
    pub fn with_shutdown(job: J, shutdown: CancellationToken) -> Self {
        Self {
            inner: Arc::new(Inner {
                job,
                state: SharedState::default(),
                run_guard: tokio::sync::Mutex::new(()),
                shutdown,
                loop_handle: Mutex::new(None),
                on_demand: TaskTracker::new(),
                stop_timeout: STOP_TIMEOUT,
            }),
        }
    }

    #[cfg(test)]
    fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.stop_timeout = timeout;
        }
        self
    }

    pub fn job(&self) -> &J {
        &self.inner.job
    }

    pub fn status(&self) -> RunState {
        lock(&self.inner.state).clone()
    }

    /// A run is executing, periodic or on-demand.
    pub fn is_busy(&self) -> bool {
        self.inner.run_guard.try_lock().is_err()
    }

    /// Start the periodic loop. A no-op (returning `false`) when it is
    /// already running; counters are only reset on an actual start.
    pub fn start(&self) -> bool {
        let mut slot = self
            .inner
            .loop_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|h| !h.task.is_finished()) {
            info!("{} crawler already running", self.inner.job.name());
            return false;
        }

        {
            let mut s = lock(&self.inner.state);
            s.is_running = true;
            s.started_at = Some(now());
            s.items_crawled = 0;
            s.errors_count = 0;
        }

        let token = self.inner.shutdown.child_token();
        let task = tokio::spawn(run_loop(Arc::clone(&self.inner), token.clone()));
        *slot = Some(LoopHandle { token, task });
        info!("{} crawler started", self.inner.job.name());
        true
    }

    /// Stop the periodic loop, waiting up to 10 s for the current run to
    /// notice. Returns `false` when the loop was not running.
    pub async fn stop(&self) -> bool {
        let handle = self
            .inner
            .loop_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(LoopHandle { token, mut task }) = handle else {
            return false;
        };

        token.cancel();
        match tokio::time::timeout(self.inner.stop_timeout, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("{} crawler task failed: {}", self.inner.job.name(), e),
            Err(_) => {
                warn!(
                    "{} crawler did not stop within {:?}, aborting",
                    self.inner.job.name(),
                    self.inner.stop_timeout
                );
                task.abort();
                // The aborted run never reached its own bookkeeping.
                let mut s = lock(&self.inner.state);
                if s.phase == RunPhase::Running {
                    s.phase = RunPhase::Idle;
                    s.last_run_finished_at = Some(now());
                    s.last_outcome = Some(RunOutcome::Cancelled);
                }
            }
        }

        lock(&self.inner.state).is_running = false;
        info!("{} crawler stopped", self.inner.job.name());
        true
    }

    /// Run once now, in the caller's task. Skipped when a run is in flight.
    pub async fn run_once(&self) -> RunOutcome {
        self.run_once_with(RunOptions::default()).await
    }

    pub async fn run_once_with(&self, options: RunOptions) -> RunOutcome {
        let Ok(_guard) = self.inner.run_guard.try_lock() else {
            info!("{} run already in progress, skipping", self.inner.job.name());
            return RunOutcome::Skipped;
        };
        let (outcome, _) = execute(&self.inner, self.inner.shutdown.child_token(), options).await;
        outcome
    }

    /// Spawn a one-off run and return immediately. `false` when a run is in flight.
    pub fn trigger_once(&self, options: RunOptions) -> bool {
        if self.is_busy() {
            info!("{} run already in progress, not triggering", self.inner.job.name());
            return false;
        }
        let worker = self.clone();
        self.inner.on_demand.spawn(async move {
            worker.run_once_with(options).await;
        });
        true
    }

    /// Cancel every run of this worker, stop the loop and wait for spawned
    /// on-demand runs to save and finish.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.stop().await;

        let tracker = &self.inner.on_demand;
        tracker.close();
        if tokio::time::timeout(self.inner.stop_timeout, tracker.wait()).await.is_err() {
            warn!(
                "{} on-demand run did not finish within {:?}",
                self.inner.job.name(),
                self.inner.stop_timeout
            );
        }
    }
}

fn now() -> NaiveDateTime {
    Local::now().naive_local()
}

/// Execute one run with bookkeeping. The caller holds the run guard.
/// The returned flag is set when the run failed as a whole.
async fn execute<J: CrawlJob>(
    inner: &Inner<J>,
    token: CancellationToken,
    options: RunOptions,
) -> (RunOutcome, bool) {
    let name = inner.job.name();
    {
        let mut s = lock(&inner.state);
        s.phase = RunPhase::Running;
        s.last_run_started_at = Some(now());
    }
    info!("{} crawl run starting", name);

    let ctx = RunContext::new(token, Arc::clone(&inner.state), options);
    let result = inner.job.run(&ctx).await;

    let failed = result.is_err();
    let outcome = match &result {
        _ if ctx.is_cancelled() => RunOutcome::Cancelled,
        Err(_) => RunOutcome::CompletedWithErrors,
        Ok(()) if ctx.errors_this_run() > 0 => RunOutcome::CompletedWithErrors,
        Ok(()) => RunOutcome::CompletedOk,
    };

    if let Err(e) = &result {
        error!("{} crawl run failed: {:#}", name, e);
        ctx.record_error();
    }

    let mut s = lock(&inner.state);
    s.phase = RunPhase::Idle;
    s.last_run_finished_at = Some(now());
    s.last_outcome = Some(outcome);
    s.last_error = result.err().map(|e| format!("{e:#}"));
    info!(
        "{} crawl run finished: {:?} ({} errors this run)",
        name,
        outcome,
        ctx.errors_this_run()
    );
    (outcome, failed)
}

async fn run_loop<J: CrawlJob>(inner: Arc<Inner<J>>, token: CancellationToken) {
    let name = inner.job.name();
    while !token.is_cancelled() {
        let wait = match inner.run_guard.try_lock() {
            Ok(_guard) => match execute(&inner, token.clone(), RunOptions::default()).await {
                (RunOutcome::Cancelled, _) => break,
                (_, true) => inner.job.error_cooldown(),
                (_, false) => inner.job.interval(),
            },
            Err(_) => {
                debug!("{} on-demand run in flight, loop waits", name);
                inner.job.interval()
            }
        };

        debug!("{} crawler sleeping {:?}", name, wait);
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }

    lock(&inner.state).is_running = false;
    info!("{} crawler loop exited", name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Counts runs, optionally blocking each one until cancelled.
    struct CountingJob {
        runs: Arc<AtomicUsize>,
        block: bool,
        fail: bool,
    }

    #[async_trait]
    impl CrawlJob for CountingJob {
        fn name(&self) -> &'static str {
            "test"
        }
        fn interval(&self) -> Duration {
            Duration::from_secs(3600)
        }
        fn error_cooldown(&self) -> Duration {
            Duration::from_secs(60)
        }
        async fn run(&self, ctx: &RunContext) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            ctx.record_items(2);
            if self.block {
                ctx.pause(Duration::from_secs(3600)).await;
            }
            if self.fail {
                anyhow::bail!("disk full");
            }
            Ok(())
        }
    }

    fn worker(block: bool, fail: bool) -> (Worker<CountingJob>, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        let job = CountingJob {
            runs: Arc::clone(&runs),
            block,
            fail,
        };
        (Worker::new(job), runs)
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn start_twice_is_a_noop_that_keeps_counters() {
        let (w, runs) = worker(true, false);

        assert!(w.start());
        wait_for(|| w.status().phase == RunPhase::Running).await;
        let started_at = w.status().started_at;

        assert!(!w.start());
        let s = w.status();
        assert!(s.is_running);
        assert_eq!(s.started_at, started_at);
        assert_eq!(s.items_crawled, 2);
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        assert!(w.stop().await);
        let s = w.status();
        assert!(!s.is_running);
        assert_eq!(s.last_outcome, Some(RunOutcome::Cancelled));
        assert!(!w.stop().await);
    }

    #[tokio::test]
    async fn on_demand_run_is_skipped_while_another_is_in_flight() {
        let (w, runs) = worker(true, false);

        assert!(w.trigger_once(RunOptions::default()));
        wait_for(|| w.is_busy()).await;

        assert_eq!(w.run_once().await, RunOutcome::Skipped);
        assert!(!w.trigger_once(RunOptions::default()));
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        w.shutdown().await;
        assert!(!w.is_busy());
        assert_eq!(w.status().last_outcome, Some(RunOutcome::Cancelled));
    }

    #[tokio::test]
    async fn failed_run_is_counted_and_recorded() {
        let (w, _) = worker(false, true);

        assert_eq!(w.run_once().await, RunOutcome::CompletedWithErrors);
        let s = w.status();
        assert_eq!(s.errors_count, 1);
        assert_eq!(s.phase, RunPhase::Idle);
        assert_eq!(s.last_error.as_deref(), Some("disk full"));
        assert!(s.last_run_finished_at.is_some());
    }

    #[tokio::test]
    async fn run_once_does_not_reset_counters() {
        let (w, _) = worker(false, false);
        assert_eq!(w.run_once().await, RunOutcome::CompletedOk);
        assert_eq!(w.run_once().await, RunOutcome::CompletedOk);
        assert_eq!(w.status().items_crawled, 4);
        assert!(!w.status().is_running);
    }

    /// Never looks at the cancellation token.
    struct StubbornJob;

    #[async_trait]
    impl CrawlJob for StubbornJob {
        fn name(&self) -> &'static str {
            "stubborn"
        }
        fn interval(&self) -> Duration {
            Duration::from_secs(3600)
        }
        fn error_cooldown(&self) -> Duration {
            Duration::from_secs(60)
        }
        async fn run(&self, _ctx: &RunContext) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn aborted_loop_is_recorded_as_cancelled() {
        let w = Worker::new(StubbornJob).with_stop_timeout(Duration::from_millis(50));

        assert!(w.start());
        wait_for(|| w.status().phase == RunPhase::Running).await;
        assert!(w.stop().await);

        let s = w.status();
        assert!(!s.is_running);
        assert_eq!(s.phase, RunPhase::Idle);
        assert_eq!(s.last_outcome, Some(RunOutcome::Cancelled));
        assert!(s.last_run_finished_at.is_some());
        wait_for(|| !w.is_busy()).await;
    }

    #[tokio::test]
    async fn pause_wakes_on_cancel() {
        let ctx = RunContext::detached(RunOptions::default());
        ctx.cancel();
        let started = std::time::Instant::now();
        assert!(!ctx.pause(Duration::from_secs(30)).await);
        assert!(!ctx.polite_pause(Duration::ZERO, Duration::from_millis(5)).await);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
