use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use super::{CaptureConfig, FixDate, StoryOverride, Viewport, load, validate_threshold};

/// Which kind of run the config drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Compare captures against baselines.
    Test,
    /// Write captures as baselines; `clean` also removes orphaned artifacts.
    Update { clean: bool },
}

impl RunMode {
    pub fn is_update(&self) -> bool {
        matches!(self, Self::Update { .. })
    }
}

/// Values extracted from the CLI that participate in the merge.
#[derive(Default)]
pub struct CliOverrides {
    pub url: Option<String>,
    pub snapshot_path: Option<PathBuf>,
    pub results_path: Option<PathBuf>,
    pub threshold: Option<f64>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub grep: Option<String>,
    pub missing_only: bool,
    pub failed_only: bool,
    pub quiet: bool,
    pub no_progress: bool,
    pub summary: bool,
    pub capture: CaptureConfig,
}

/// Fully resolved run configuration after CLI > env > file > defaults merge.
/// Immutable for the duration of a run; shared read-only by all workers.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub mode: RunMode,
    pub url: String,
    pub snapshot_path: PathBuf,
    pub results_path: PathBuf,
    pub threshold: f64,
    pub full_page: bool,
    pub missing_only: bool,
    pub failed_only: bool,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub grep: Option<String>,
    pub retries: u32,
    pub max_failures: Option<usize>,
    /// Fixed worker count; `None` enables adaptive scaling.
    pub workers: Option<usize>,
    pub test_timeout: Duration,
    pub story_load_delay: Option<Duration>,
    pub disable_animations: bool,
    pub fix_date: FixDate,
    pub viewports: BTreeMap<String, Viewport>,
    pub default_viewport: Option<String>,
    pub per_story: BTreeMap<String, StoryOverride>,
    pub quiet: bool,
    pub show_progress: bool,
    pub summary: bool,
}

impl RunConfig {
    pub fn resolve(mode: RunMode, cli: CliOverrides) -> Result<Self> {
        // 1. File layer
        let file_config = load().context("Run `storyvrt init` first")?;

        // 2. Env layer
        let env_url = std::env::var("STORYVRT_URL").ok();
        let env_threshold: Option<f64> = std::env::var("STORYVRT_THRESHOLD")
            .ok()
            .map(|v| v.parse::<f64>())
            .transpose()
            .context("STORYVRT_THRESHOLD must be a valid float")?;

        // 3. CLI > env > file (highest priority first)
        let url = cli
            .url
            .or(env_url)
            .unwrap_or_else(|| file_config.storybook.url.clone());

        let threshold = cli
            .threshold
            .or(env_threshold)
            .unwrap_or(file_config.diff.threshold);
        validate_threshold(threshold).map_err(|e| anyhow::anyhow!("{e}"))?;

        let snapshot_path = cli
            .snapshot_path
            .unwrap_or_else(|| file_config.storybook.snapshot_path.clone());
        let results_path = cli
            .results_path
            .unwrap_or_else(|| file_config.storybook.results_path.clone());

        // 4. Merge capture: file base, then CLI overlay
        let mut capture = file_config.capture;
        capture.merge(&cli.capture);

        Ok(Self {
            mode,
            url: url.trim_end_matches('/').to_string(),
            snapshot_path,
            results_path,
            threshold,
            full_page: capture.full_page.unwrap_or(false),
            missing_only: cli.missing_only,
            failed_only: cli.failed_only,
            include: cli.include,
            exclude: cli.exclude,
            grep: cli.grep,
            retries: capture.retries.unwrap_or(0),
            max_failures: capture.max_failures,
            workers: capture.workers,
            test_timeout: capture.test_timeout(),
            story_load_delay: capture.story_load_delay(),
            disable_animations: !capture.keep_animations.unwrap_or(false),
            fix_date: capture.fix_date.clone().unwrap_or_default(),
            viewports: file_config.viewport,
            default_viewport: file_config.storybook.default_viewport.clone(),
            per_story: file_config.story,
            quiet: cli.quiet,
            show_progress: !cli.no_progress && !cli.quiet,
            summary: cli.summary,
        })
    }

    pub fn is_update(&self) -> bool {
        self.mode.is_update()
    }

    /// Per-story threshold override, falling back to the run threshold.
    pub fn threshold_for(&self, story_id: &str) -> f64 {
        self.per_story
            .get(story_id)
            .and_then(|o| o.threshold)
            .unwrap_or(self.threshold)
    }
}
