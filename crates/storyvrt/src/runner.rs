use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::artifacts::ArtifactManager;
use crate::capture::{Action, PageCapturer, Status, StoryOutcome};
use crate::config::{RunConfig, RunMode};
use crate::pool::WorkerPool;
use crate::report::{EventSink, TerminalSink, terminal};
use crate::storybook::{Story, StoryFilter, StoryIndex, ViewportResolver};

/// Exit code for a run interrupted by SIGINT.
const EXIT_SIGINT: i32 = 130;

/// Everything a run shares: the resolved config and the artifact manager.
/// Built once here; components receive it instead of reaching for globals.
pub struct RunContext {
    pub config: Arc<RunConfig>,
    pub artifacts: Arc<ArtifactManager>,
    pub index: Arc<StoryIndex>,
}

impl RunContext {
    pub fn new(config: RunConfig) -> Result<Self> {
        let artifacts = Arc::new(ArtifactManager::new(
            &config.snapshot_path,
            &config.results_path,
            config.is_update(),
        ));
        let project_root = std::env::current_dir().context("Cannot determine working directory")?;
        let index = Arc::new(StoryIndex::new(&config.url, &project_root));
        Ok(Self {
            config: Arc::new(config),
            artifacts,
            index,
        })
    }
}

/// Discover, filter, capture, compare, report. Returns the process exit
/// code: 0 all passed, 1 at least one failure, 130 on SIGINT.
pub async fn run(config: RunConfig) -> Result<i32> {
    let ctx = RunContext::new(config)?;
    let config = &ctx.config;
    let started = Instant::now();

    // Discover. An unreachable or empty index is terminal before any
    // browser launches.
    let mut stories = ctx.index.load().await?;
    info!(count = stories.len(), url = %config.url, "stories discovered");

    // Orphan cleanup compares against everything discovered, not the
    // filtered subset, so a filtered update never deletes other stories.
    if let RunMode::Update { clean: true } = config.mode {
        let valid: BTreeSet<String> = stories
            .iter()
            .map(|s| s.snapshot_rel_path.clone())
            .collect();
        ctx.artifacts.clean_orphans(&valid);
    }

    ViewportResolver::new(config).resolve_all(&mut stories);

    let filter = StoryFilter::from_config(config)?;
    let stories = filter.apply(stories, &ctx.artifacts);
    if stories.is_empty() {
        info!("no stories to run");
        return Ok(0);
    }

    // In test mode, stories without a baseline are skipped up front rather
    // than spending a browser on them.
    let (runnable, missing): (Vec<Story>, Vec<Story>) = if config.is_update() {
        (stories, Vec::new())
    } else {
        stories
            .into_iter()
            .partition(|s| ctx.artifacts.expected_path(&s.snapshot_rel_path).exists())
    };
    if !missing.is_empty() {
        info!(
            count = missing.len(),
            "stories skipped: no baseline (run update to create them)"
        );
    }

    let sink: Arc<dyn EventSink> =
        Arc::new(TerminalSink::new(config.show_progress, config.quiet));

    for story in &missing {
        let outcome = StoryOutcome {
            story_id: story.id.clone(),
            display_name: story.display_name(),
            url: Some(story.url.clone()),
            status: Status::Skipped,
            action: Action::Skipped,
            duration: std::time::Duration::ZERO,
            error: Some("missing baseline: run update to create it".to_string()),
            diff_path: None,
            expected_path: Some(ctx.artifacts.expected_path(&story.snapshot_rel_path)),
            actual_path: None,
        };
        sink.on_result(&outcome);
        sink.on_story_complete(&outcome);
    }

    let pool = WorkerPool::new(config.clone());

    // SIGINT cancels the pool; in-flight workers abort at their next
    // checkpoint and the run exits 130.
    let interrupted = Arc::new(AtomicBool::new(false));
    let sigint_flag = interrupted.clone();
    let sigint_token = pool.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            sigint_flag.store(true, Ordering::Relaxed);
            sigint_token.cancel();
        }
    });

    let executor = Arc::new(PageCapturer::new(
        config.clone(),
        ctx.artifacts.clone(),
        ctx.index.clone(),
    )?);

    let mut result = pool.run(runnable, executor, sink).await;
    result.skipped += missing.len();

    // Directory cleanup only after the pool has drained: no worker is about
    // to write into a directory being removed.
    if !config.is_update() {
        ctx.artifacts.sweep_empty_dirs();
    }

    let elapsed = started.elapsed();
    let stories_per_minute = if elapsed.as_secs_f64() > 0.0 {
        result.total() as f64 * 60.0 / elapsed.as_secs_f64()
    } else {
        0.0
    };
    if config.summary || !config.quiet {
        terminal::print_summary(&result, stories_per_minute, elapsed);
    }

    if interrupted.load(Ordering::Relaxed) {
        return Ok(EXIT_SIGINT);
    }
    Ok(if result.failed > 0 { 1 } else { 0 })
}
