pub mod scaling;

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use self::scaling::{AdaptiveScaler, Adjustment, EtaSmoother};
use crate::capture::{Status, StoryOutcome};
use crate::config::RunConfig;
use crate::report::EventSink;
use crate::storybook::Story;

/// Cooperative cancellation flag shared between the pool and its workers.
/// Workers observe it at the capture state machine's checkpoints.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.load(Ordering::Relaxed)
    }
}

/// The per-story work the pool dispatches. Implemented by `PageCapturer`;
/// tests substitute fakes.
pub trait StoryExecutor: Send + Sync + 'static {
    fn run_story(
        &self,
        story: Story,
        cancel: CancelToken,
        first_wave: bool,
    ) -> BoxFuture<'_, StoryOutcome>;
}

/// Snapshot handed to `EventSink::on_progress` after every outcome.
#[derive(Debug, Clone)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub stories_per_minute: f64,
    pub eta_seconds: Option<f64>,
    pub workers: usize,
    pub cpu_percent: f32,
}

/// Final tally returned by `WorkerPool::run`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolResult {
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
}

impl PoolResult {
    pub fn total(&self) -> usize {
        self.passed + self.failed + self.skipped + self.cancelled
    }
}

/// Adaptive concurrent scheduler: dispatches stories to worker tasks,
/// applies retry/cancel/max-failures semantics, and resizes concurrency
/// from CPU and throughput signals.
pub struct WorkerPool {
    config: Arc<RunConfig>,
    cancel: CancelToken,
    /// Hard ceiling on workers: 2x logical cores unless fixed.
    limit: usize,
}

impl WorkerPool {
    pub fn new(config: Arc<RunConfig>) -> Self {
        let cores = num_cpus::get().max(1);
        let limit = match config.workers {
            Some(n) => n.max(1),
            None => (cores * 2).max(1),
        };
        Self {
            config,
            cancel: CancelToken::new(),
            limit,
        }
    }

    /// Token workers poll at their cancellation checkpoints; also handed to
    /// the SIGINT handler.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Run every story to exactly one outcome. Resolves once all stories
    /// have completed or the pool was cancelled and in-flight workers have
    /// drained.
    pub async fn run(
        &self,
        stories: Vec<Story>,
        executor: Arc<dyn StoryExecutor>,
        sink: Arc<dyn EventSink>,
    ) -> PoolResult {
        let total = stories.len();
        let mut queue: VecDeque<Story> = stories.into();
        let mut result = PoolResult::default();
        let mut seen: HashSet<String> = HashSet::with_capacity(total);

        let fixed = self.config.workers;
        let mut max_workers = match fixed {
            Some(n) => clamp_workers(n, self.limit),
            None => clamp_workers(num_cpus::get().max(1), self.limit),
        };
        let initial_wave = max_workers;

        let mut scaler = AdaptiveScaler::new();
        let mut eta = EtaSmoother::new();
        let mut max_failures_reached = false;
        let mut dispatched = 0usize;
        let started = Instant::now();

        let mut workers: JoinSet<StoryOutcome> = JoinSet::new();
        let mut interval = tokio::time::interval(scaling::CPU_SAMPLE_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(total, workers = max_workers, adaptive = fixed.is_none(), "pool starting");

        loop {
            // Anything still queued after cancellation becomes a cancelled
            // outcome immediately.
            if self.cancel.is_cancelled() {
                while let Some(story) = queue.pop_front() {
                    let outcome = StoryOutcome::cancelled(&story.id, &story.display_name());
                    self.record(
                        outcome, &mut result, &mut seen, &mut eta, total, started,
                        max_workers, &scaler, &sink,
                    );
                }
            }

            // Dispatch while there is capacity and work.
            while workers.len() < max_workers
                && !queue.is_empty()
                && !self.cancel.is_cancelled()
                && !max_failures_reached
            {
                let story = queue.pop_front().expect("queue checked non-empty");
                let first_wave = dispatched < initial_wave;
                dispatched += 1;
                sink.on_story_start(&story.id, &story.display_name());

                let executor = executor.clone();
                let cancel = self.cancel.clone();
                workers.spawn(async move {
                    let id = story.id.clone();
                    let display = story.display_name();
                    match std::panic::AssertUnwindSafe(
                        executor.run_story(story, cancel, first_wave),
                    )
                    .catch_unwind()
                    .await
                    {
                        Ok(outcome) => outcome,
                        Err(_) => {
                            warn!(story = %id, "worker panicked");
                            let mut outcome = StoryOutcome::cancelled(&id, &display);
                            outcome.status = Status::Failed;
                            outcome.action = crate::capture::Action::Failed;
                            outcome.error = Some("worker panicked".to_string());
                            outcome
                        }
                    }
                });
            }

            if workers.is_empty() && queue.is_empty() {
                break;
            }

            tokio::select! {
                joined = workers.join_next(), if !workers.is_empty() => {
                    let Some(joined) = joined else { continue };
                    let outcome = match joined {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            // catch_unwind upstream makes this unreachable in
                            // practice; losing the outcome would break the
                            // exactly-once invariant, so surface loudly.
                            warn!(error = %e, "worker task join failed");
                            continue;
                        }
                    };

                    if outcome.status == Status::Failed
                        && let Some(max) = self.config.max_failures
                        && result.failed + 1 >= max
                        && !max_failures_reached
                    {
                        max_failures_reached = true;
                        warn!(max, "max failures reached, cancelling run");
                        self.cancel.cancel();
                    }

                    self.record(
                        outcome, &mut result, &mut seen, &mut eta, total, started,
                        max_workers, &scaler, &sink,
                    );

                    if fixed.is_none()
                        && let Some(adj) = scaler.on_completion(
                            Instant::now(),
                            result.total(),
                            max_workers,
                            queue.len(),
                            workers.len(),
                            max_workers >= self.limit,
                        )
                    {
                        max_workers = self.apply(adj, max_workers);
                    }
                }
                _ = interval.tick() => {
                    if fixed.is_none()
                        && let Some(adj) = scaler.on_tick(queue.len(), max_workers)
                    {
                        max_workers = self.apply(adj, max_workers);
                    }
                }
            }
        }

        debug!(
            passed = result.passed,
            failed = result.failed,
            skipped = result.skipped,
            cancelled = result.cancelled,
            "pool drained"
        );
        result
    }

    fn apply(&self, adjustment: Adjustment, max_workers: usize) -> usize {
        let next = match adjustment {
            Adjustment::Up => max_workers + 1,
            Adjustment::Down => max_workers.saturating_sub(1),
        };
        let clamped = clamp_workers(next, self.limit);
        if clamped != max_workers {
            debug!(from = max_workers, to = clamped, "resizing worker pool");
        }
        clamped
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        outcome: StoryOutcome,
        result: &mut PoolResult,
        seen: &mut HashSet<String>,
        eta: &mut EtaSmoother,
        total: usize,
        started: Instant,
        workers: usize,
        scaler: &AdaptiveScaler,
        sink: &Arc<dyn EventSink>,
    ) {
        if !seen.insert(outcome.story_id.clone()) {
            warn!(story = %outcome.story_id, "duplicate outcome suppressed");
            return;
        }

        match outcome.status {
            Status::Passed => result.passed += 1,
            Status::Failed => result.failed += 1,
            Status::Skipped => result.skipped += 1,
            Status::Cancelled => result.cancelled += 1,
        }

        sink.on_result(&outcome);
        sink.on_story_complete(&outcome);

        let completed = result.total();
        let elapsed = started.elapsed().as_secs_f64();
        let stories_per_minute = if elapsed > 0.0 {
            completed as f64 * 60.0 / elapsed
        } else {
            0.0
        };
        if completed > 0 {
            eta.push((total - completed) as f64 * (elapsed / completed as f64));
        }

        sink.on_progress(&Progress {
            completed,
            total,
            passed: result.passed,
            failed: result.failed,
            skipped: result.skipped,
            cancelled: result.cancelled,
            stories_per_minute,
            eta_seconds: eta.smoothed(),
            workers,
            cpu_percent: scaler.cpu_percent(),
        });
    }
}

/// Clamp a requested worker count to `[1, limit]`.
fn clamp_workers(n: usize, limit: usize) -> usize {
    n.clamp(1, limit.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::Action;
    use std::sync::Mutex;
    use std::time::Duration;

    fn story(id: &str) -> Story {
        Story {
            id: id.to_string(),
            title: "T".into(),
            name: id.to_string(),
            url: String::new(),
            snapshot_rel_path: format!("{id}.png"),
            viewport: None,
            parameters: None,
            tags: Vec::new(),
        }
    }

    fn config(workers: Option<usize>, max_failures: Option<usize>) -> Arc<RunConfig> {
        Arc::new(RunConfig {
            mode: crate::config::RunMode::Test,
            url: String::new(),
            snapshot_path: "baseline".into(),
            results_path: "results".into(),
            threshold: 0.0,
            full_page: false,
            missing_only: false,
            failed_only: false,
            include: Vec::new(),
            exclude: Vec::new(),
            grep: None,
            retries: 0,
            max_failures,
            workers,
            test_timeout: Duration::from_secs(60),
            story_load_delay: None,
            disable_animations: true,
            fix_date: crate::config::FixDate::Enabled(false),
            viewports: Default::default(),
            default_viewport: None,
            per_story: Default::default(),
            quiet: true,
            show_progress: false,
            summary: false,
        })
    }

    /// Sink that records everything it sees.
    #[derive(Default)]
    struct RecordingSink {
        outcomes: Mutex<Vec<StoryOutcome>>,
        progress: Mutex<Vec<Progress>>,
        started: Mutex<Vec<String>>,
    }

    impl EventSink for RecordingSink {
        fn on_story_start(&self, story_id: &str, _display_name: &str) {
            self.started.lock().unwrap().push(story_id.to_string());
        }
        fn on_result(&self, outcome: &StoryOutcome) {
            self.outcomes.lock().unwrap().push(outcome.clone());
        }
        fn on_story_complete(&self, _outcome: &StoryOutcome) {}
        fn on_progress(&self, progress: &Progress) {
            self.progress.lock().unwrap().push(progress.clone());
        }
    }

    /// Executor whose behavior is a function of the story id.
    struct FakeExecutor {
        delay: Duration,
        fail_ids: Vec<String>,
    }

    impl FakeExecutor {
        fn passing() -> Self {
            Self {
                delay: Duration::from_millis(5),
                fail_ids: Vec::new(),
            }
        }

        fn failing(ids: &[&str]) -> Self {
            Self {
                delay: Duration::from_millis(5),
                fail_ids: ids.iter().map(|s| s.to_string()).collect(),
            }
        }
    }

    impl StoryExecutor for FakeExecutor {
        fn run_story(
            &self,
            story: Story,
            cancel: CancelToken,
            _first_wave: bool,
        ) -> BoxFuture<'_, StoryOutcome> {
            async move {
                tokio::time::sleep(self.delay).await;
                if cancel.is_cancelled() {
                    return StoryOutcome::cancelled(&story.id, &story.display_name());
                }
                let failed = self.fail_ids.contains(&story.id);
                StoryOutcome {
                    story_id: story.id.clone(),
                    display_name: story.display_name(),
                    url: None,
                    status: if failed { Status::Failed } else { Status::Passed },
                    action: if failed { Action::Failed } else { Action::Pass },
                    duration: self.delay,
                    error: failed.then(|| "boom".to_string()),
                    diff_path: None,
                    expected_path: None,
                    actual_path: None,
                }
            }
            .boxed()
        }
    }

    fn stories(n: usize) -> Vec<Story> {
        (0..n).map(|i| story(&format!("s--{i}"))).collect()
    }

    #[tokio::test]
    async fn every_story_gets_exactly_one_outcome() {
        let pool = WorkerPool::new(config(Some(4), None));
        let sink = Arc::new(RecordingSink::default());
        let result = pool
            .run(stories(25), Arc::new(FakeExecutor::passing()), sink.clone())
            .await;

        assert_eq!(result.total(), 25);
        assert_eq!(result.passed, 25);
        let outcomes = sink.outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 25);
        let mut ids: Vec<_> = outcomes.iter().map(|o| o.story_id.clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 25);
    }

    #[tokio::test]
    async fn counters_always_sum_to_total() {
        let pool = WorkerPool::new(config(Some(3), None));
        let sink = Arc::new(RecordingSink::default());
        let result = pool
            .run(
                stories(12),
                Arc::new(FakeExecutor::failing(&["s--2", "s--7"])),
                sink.clone(),
            )
            .await;

        assert_eq!(result.total(), 12);
        assert_eq!(result.failed, 2);
        assert_eq!(result.passed, 10);
        for p in sink.progress.lock().unwrap().iter() {
            assert_eq!(
                p.passed + p.failed + p.skipped + p.cancelled,
                p.completed,
                "progress counters must be conserved"
            );
        }
    }

    #[tokio::test]
    async fn max_failures_cancels_the_remainder() {
        // Serial execution so failures land before the rest dispatches.
        let pool = WorkerPool::new(config(Some(1), Some(2)));
        let sink = Arc::new(RecordingSink::default());
        let result = pool
            .run(
                stories(10),
                Arc::new(FakeExecutor::failing(&["s--0", "s--1"])),
                sink.clone(),
            )
            .await;

        assert_eq!(result.failed, 2);
        assert_eq!(result.cancelled, 8);
        assert_eq!(result.passed, 0);
        assert_eq!(result.total(), 10);
        // No story beyond the second failure was ever dispatched.
        assert_eq!(sink.started.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn cancel_before_run_cancels_everything() {
        let pool = WorkerPool::new(config(Some(4), None));
        pool.cancel();
        let sink = Arc::new(RecordingSink::default());
        let result = pool
            .run(stories(6), Arc::new(FakeExecutor::passing()), sink.clone())
            .await;

        assert_eq!(result.cancelled, 6);
        assert_eq!(result.total(), 6);
        assert!(sink.started.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn mid_run_cancel_drains_in_flight_only() {
        let pool = WorkerPool::new(config(Some(2), None));
        let token = pool.cancel_token();
        let sink = Arc::new(RecordingSink::default());

        let slow = Arc::new(FakeExecutor {
            delay: Duration::from_millis(50),
            fail_ids: Vec::new(),
        });
        let cancel_task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            token.cancel();
        });

        let result = pool.run(stories(50), slow, sink).await;
        cancel_task.await.unwrap();

        assert_eq!(result.total(), 50);
        assert!(result.cancelled > 0, "late stories must be cancelled");
        assert!(result.passed > 0, "early stories completed before cancel");
        assert_eq!(result.failed, 0);
    }

    #[tokio::test]
    async fn fixed_worker_count_reports_constant_workers() {
        let pool = WorkerPool::new(config(Some(3), None));
        let sink = Arc::new(RecordingSink::default());
        pool.run(stories(9), Arc::new(FakeExecutor::passing()), sink.clone())
            .await;

        for p in sink.progress.lock().unwrap().iter() {
            assert_eq!(p.workers, 3);
        }
    }

    #[tokio::test]
    async fn empty_story_set_resolves_immediately() {
        let pool = WorkerPool::new(config(None, None));
        let sink = Arc::new(RecordingSink::default());
        let result = pool
            .run(Vec::new(), Arc::new(FakeExecutor::passing()), sink)
            .await;
        assert_eq!(result.total(), 0);
    }

    #[test]
    fn worker_clamp_bounds() {
        assert_eq!(clamp_workers(0, 8), 1);
        assert_eq!(clamp_workers(5, 8), 5);
        assert_eq!(clamp_workers(20, 8), 8);
        assert_eq!(clamp_workers(3, 0), 1);
    }
}
