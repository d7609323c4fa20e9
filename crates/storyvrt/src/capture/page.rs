use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use super::animations::AnimationSuppressor;
use super::clock::ClockFixer;
use super::{Action, CaptureError, Status, StoryOutcome, dumps, is_crash, scripts};
use crate::artifacts::ArtifactManager;
use crate::cdp::{CdpConnection, Chrome};
use crate::compare::{ImageComparator, Verdict};
use crate::config::RunConfig;
use crate::pool::{CancelToken, StoryExecutor};
use crate::storybook::{Story, StoryIndex};

/// Bound on waiting for the main-document response after commit.
const NAV_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);
/// Bound on the DOMContentLoaded wait before readyState polling kicks in.
const DCL_TIMEOUT: Duration = Duration::from_secs(10);
/// Bound on waiting for `#storybook-root` to appear.
const ROOT_WAIT_TIMEOUT: Duration = Duration::from_secs(5);
/// Cap on `document.fonts.ready`.
const FONTS_TIMEOUT: Duration = Duration::from_secs(5);
/// DOM-settle quiet period and total cap.
const SETTLE_QUIET: Duration = Duration::from_millis(300);
const SETTLE_MAX: Duration = Duration::from_millis(2000);
/// Polling interval for readyState / content-readiness fallbacks.
const POLL_INTERVAL: Duration = Duration::from_millis(200);
/// Pause between attempts of the same story.
const RETRY_PAUSE: Duration = Duration::from_millis(100);
/// First-wave launches are staggered by `hash(story_id) % 50` ms.
const STAGGER_WINDOW_MS: u64 = 50;
/// Grace on top of the per-story budget before the backstop timeout fires.
const ATTEMPT_GRACE: Duration = Duration::from_secs(5);

/// Drives one browser page through the capture state machine:
/// launch, navigate, wait for readiness, settle, screenshot, compare.
pub struct PageCapturer {
    config: Arc<RunConfig>,
    artifacts: Arc<ArtifactManager>,
    clock: ClockFixer,
    animations: AnimationSuppressor,
    index: Arc<StoryIndex>,
}

struct Session {
    chrome: Chrome,
    conn: CdpConnection,
    target_id: String,
}

impl Session {
    /// Close the page, then the browser. Best-effort on the tab: the
    /// process kill on drop supersedes it.
    async fn close(self) {
        let Session {
            chrome,
            conn,
            target_id,
        } = self;
        drop(conn);
        if let Err(e) = chrome.close_tab(&target_id).await {
            debug!(error = %format!("{e:#}"), "tab close failed (browser exiting anyway)");
        }
        drop(chrome);
    }
}

impl PageCapturer {
    pub fn new(
        config: Arc<RunConfig>,
        artifacts: Arc<ArtifactManager>,
        index: Arc<StoryIndex>,
    ) -> Result<Self> {
        let clock = ClockFixer::from_config(&config.fix_date)?;
        let animations = AnimationSuppressor::new(config.disable_animations);
        Ok(Self {
            config,
            artifacts,
            clock,
            animations,
            index,
        })
    }

    /// Run one story to a terminal outcome, retrying failed attempts up to
    /// the configured limit. Never panics the worker: every error path
    /// collapses into a `StoryOutcome`.
    pub async fn capture(
        &self,
        story: &Story,
        cancel: &CancelToken,
        first_wave: bool,
    ) -> StoryOutcome {
        let started = Instant::now();

        if first_wave {
            let delay = stagger_delay(&story.id);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        let attempts = self.config.retries + 1;
        let mut last_error: Option<CaptureError> = None;

        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return StoryOutcome::cancelled(&story.id, &story.display_name());
            }

            let budget = self.config.test_timeout + ATTEMPT_GRACE;
            let result = match tokio::time::timeout(budget, self.attempt(story, cancel)).await {
                Ok(r) => r,
                Err(_) => Err(CaptureError::Timeout(format!(
                    "attempt exceeded {}s",
                    budget.as_secs()
                ))),
            };

            match result {
                Ok(outcome) => {
                    return StoryOutcome {
                        duration: started.elapsed(),
                        ..outcome
                    };
                }
                Err(CaptureError::Cancelled) => {
                    return StoryOutcome::cancelled(&story.id, &story.display_name());
                }
                Err(e) => {
                    warn!(
                        story = %story.id,
                        attempt,
                        attempts,
                        error = %e,
                        "capture attempt failed"
                    );
                    last_error = Some(e);
                    if attempt < attempts {
                        self.artifacts.clean_retry_artifacts(&story.snapshot_rel_path);
                        tokio::time::sleep(RETRY_PAUSE).await;
                    }
                }
            }
        }

        let error = last_error.expect("at least one attempt ran");
        StoryOutcome {
            story_id: story.id.clone(),
            display_name: story.display_name(),
            url: Some(story.url.clone()),
            status: Status::Failed,
            action: Action::Failed,
            duration: started.elapsed(),
            error: Some(error.to_string()),
            diff_path: None,
            expected_path: Some(self.artifacts.expected_path(&story.snapshot_rel_path)),
            actual_path: None,
        }
    }

    /// One full pass of the state machine. Cancellation is checked between
    /// stages; every wait is bounded by what remains of the story budget.
    async fn attempt(
        &self,
        story: &Story,
        cancel: &CancelToken,
    ) -> Result<StoryOutcome, CaptureError> {
        let deadline = Instant::now() + self.config.test_timeout;

        // Launched
        let mut session = self.launch(story).await?;

        if cancel.is_cancelled() {
            session.close().await;
            return Err(CaptureError::Cancelled);
        }

        // Navigated .. Settled
        match self.drive_to_settled(&mut session, story, cancel, deadline).await {
            Ok(()) => {}
            Err(e) => {
                if e.wants_dump() {
                    dumps::write_dumps(&mut session.conn, story, &self.artifacts, &e.to_string())
                        .await;
                }
                session.close().await;
                return Err(e);
            }
        }

        if cancel.is_cancelled() {
            session.close().await;
            return Err(CaptureError::Cancelled);
        }

        // Captured + Compared
        let result = self.capture_and_compare(&mut session, story, deadline).await;
        match result {
            Ok(outcome) => {
                session.close().await;
                Ok(outcome)
            }
            Err(e) => {
                if e.wants_dump() {
                    dumps::write_dumps(&mut session.conn, story, &self.artifacts, &e.to_string())
                        .await;
                }
                session.close().await;
                Err(e)
            }
        }
    }

    /// Launch the browser, open a tab, install init scripts, set the
    /// viewport.
    async fn launch(&self, story: &Story) -> Result<Session, CaptureError> {
        let chrome = Chrome::launch().await.map_err(CaptureError::from_anyhow)?;
        let (target_id, ws_url) = chrome
            .create_tab()
            .await
            .map_err(CaptureError::from_anyhow)?;
        let mut conn = CdpConnection::connect(&ws_url)
            .await
            .map_err(CaptureError::from_anyhow)?;
        conn.enable_domains()
            .await
            .map_err(CaptureError::from_anyhow)?;

        if let Some(script) = self.clock.init_script() {
            conn.add_init_script(&script)
                .await
                .map_err(CaptureError::from_anyhow)?;
        }
        if let Some(script) = self.animations.init_script() {
            conn.add_init_script(&script)
                .await
                .map_err(CaptureError::from_anyhow)?;
        }

        if let Some(ref vp) = story.viewport {
            debug!(
                story = %story.id,
                viewport = vp.name.as_deref().unwrap_or("custom"),
                width = vp.width,
                height = vp.height,
                "viewport set"
            );
            conn.set_viewport(vp.width, vp.height)
                .await
                .map_err(CaptureError::from_anyhow)?;
        }

        Ok(Session {
            chrome,
            conn,
            target_id,
        })
    }

    /// Navigated → DomReady → ContentReady → Settled.
    async fn drive_to_settled(
        &self,
        session: &mut Session,
        story: &Story,
        cancel: &CancelToken,
        deadline: Instant,
    ) -> Result<(), CaptureError> {
        let conn = &mut session.conn;

        // Navigated: commit, then check the document response status. A
        // non-2xx primary URL gets one shot at the secondary form.
        self.navigate_with_fallback(conn, story, deadline).await?;

        // DOMContentLoaded, falling back to readyState polling.
        let dcl_budget = DCL_TIMEOUT.min(remaining(deadline, "page load")?);
        let fired = conn
            .wait_dom_content_loaded(dcl_budget)
            .await
            .map_err(|e| promote_crash(conn, e))?;
        if !fired {
            self.poll_ready_state(conn, deadline).await?;
        }

        // Verify the pinned clock took effect.
        if let Some(pinned) = self.clock.pinned_ms()
            && let Ok(result) = conn.eval(scripts::DATE_NOW_JS).await
        {
            let now = result["result"]["value"].as_i64().unwrap_or(-1);
            if now != pinned {
                debug!(story = %story.id, pinned, reported = now, "Date.now() mismatch");
            }
        }

        if cancel.is_cancelled() {
            return Err(CaptureError::Cancelled);
        }

        // DomReady: bounded short wait for the explorer root element.
        let root_budget = ROOT_WAIT_TIMEOUT.min(remaining(deadline, "root wait")?);
        let wait_root = scripts::WAIT_FOR_ROOT_JS_TEMPLATE
            .replace("__TIMEOUT_MS__", &root_budget.as_millis().to_string());
        eval_bounded(conn, &wait_root, root_budget, "#storybook-root wait").await?;

        // ContentReady: fast page-side predicate over 80% of the remaining
        // budget, then 200ms polling for the rest.
        self.wait_for_content(conn, deadline).await?;

        // Settled: fonts, DOM stability, then the optional fixed delay.
        let fonts_budget = FONTS_TIMEOUT.min(remaining(deadline, "fonts")?);
        let wait_fonts = scripts::WAIT_FONTS_JS_TEMPLATE
            .replace("__TIMEOUT_MS__", &fonts_budget.as_millis().to_string());
        eval_bounded(conn, &wait_fonts, fonts_budget, "fonts").await?;

        let settle_max = SETTLE_MAX.min(remaining(deadline, "DOM settle")?);
        let settle = scripts::DOM_SETTLE_JS_TEMPLATE
            .replace("__QUIET_MS__", &SETTLE_QUIET.as_millis().to_string())
            .replace("__MAX_MS__", &settle_max.as_millis().to_string());
        eval_bounded(conn, &settle, settle_max, "DOM settle").await?;

        if let Some(delay) = self.config.story_load_delay {
            let delay = delay.min(remaining(deadline, "story load delay")?);
            tokio::time::sleep(delay).await;
        }

        self.animations
            .reinforce(conn)
            .await
            .map_err(|e| promote_crash(conn, e))?;

        Ok(())
    }

    async fn navigate_with_fallback(
        &self,
        conn: &mut CdpConnection,
        story: &Story,
        deadline: Instant,
    ) -> Result<(), CaptureError> {
        let budget = NAV_RESPONSE_TIMEOUT.min(remaining(deadline, "navigation")?);
        let status = conn
            .navigate(&story.url, budget)
            .await
            .map_err(|e| navigation_error(conn, e))?;

        match status {
            Some(s) if !(200..300).contains(&s) => {
                let fallback = self.index.story_url_fallback(&story.id);
                warn!(story = %story.id, status = s, url = %fallback, "retrying with path-form URL");
                let budget = NAV_RESPONSE_TIMEOUT.min(remaining(deadline, "navigation")?);
                let status = conn
                    .navigate(&fallback, budget)
                    .await
                    .map_err(|e| navigation_error(conn, e))?;
                match status {
                    Some(s) if !(200..300).contains(&s) => Err(CaptureError::Navigation(
                        format!("server returned HTTP {s}"),
                    )),
                    _ => Ok(()),
                }
            }
            _ => Ok(()),
        }
    }

    /// Poll `document.readyState` until interactive/complete or the budget
    /// runs out.
    async fn poll_ready_state(
        &self,
        conn: &mut CdpConnection,
        deadline: Instant,
    ) -> Result<(), CaptureError> {
        loop {
            remaining(deadline, "document readyState")?;
            let result = conn
                .eval(scripts::READY_STATE_JS)
                .await
                .map_err(|e| promote_crash(conn, e))?;
            let state = result["result"]["value"].as_str().unwrap_or("");
            if state == "interactive" || state == "complete" {
                return Ok(());
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Content-readiness: fast in-page wait for up to 80% of the remaining
    /// budget, then 200ms polling of the one-shot predicate.
    async fn wait_for_content(
        &self,
        conn: &mut CdpConnection,
        deadline: Instant,
    ) -> Result<(), CaptureError> {
        let total = remaining(deadline, "story content")?;
        let fast_budget = total.mul_f64(0.8);
        let wait = scripts::CONTENT_READY_WAIT_JS_TEMPLATE
            .replace("__TIMEOUT_MS__", &fast_budget.as_millis().to_string());

        match eval_bounded(conn, &wait, fast_budget, "story content").await {
            Ok(()) => return Ok(()),
            Err(CaptureError::Crash) => return Err(CaptureError::Crash),
            Err(e) => {
                debug!(error = %e, "fast content wait failed, polling");
            }
        }

        loop {
            remaining(deadline, "story content")?;
            let result = conn
                .eval(scripts::CONTENT_READY_CHECK_JS)
                .await
                .map_err(|e| promote_crash(conn, e))?;
            if result["result"]["value"].as_bool() == Some(true) {
                return Ok(());
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Captured + Compared: write the PNG where the mode dictates, then map
    /// the comparison outcome.
    async fn capture_and_compare(
        &self,
        session: &mut Session,
        story: &Story,
        deadline: Instant,
    ) -> Result<StoryOutcome, CaptureError> {
        remaining(deadline, "screenshot")?;
        let rel = &story.snapshot_rel_path;
        let expected = self.artifacts.expected_path(rel);
        let actual = self.artifacts.actual_path(rel);
        let update = self.config.is_update();
        let baseline_existed = expected.exists();

        let target_dir = actual
            .parent()
            .ok_or_else(|| CaptureError::Screenshot(format!("{} has no parent", actual.display())))?
            .to_path_buf();
        self.artifacts
            .ensure_directory(&target_dir)
            .await
            .map_err(|e| CaptureError::Screenshot(format!("{e:#}")))?;

        let png = session
            .conn
            .capture_screenshot(self.config.full_page)
            .await
            .map_err(|e| {
                if session.conn.crashed() || is_crash(&e) {
                    CaptureError::Crash
                } else {
                    CaptureError::Screenshot(format!("{e:#}"))
                }
            })?;

        std::fs::write(&actual, &png)
            .with_context(|| format!("Failed to write {}", actual.display()))
            .map_err(|e| screenshot_error_with_diagnostics(e, &actual))?;
        if !actual.exists() {
            return Err(screenshot_error_with_diagnostics(
                anyhow::anyhow!("file missing after write"),
                &actual,
            ));
        }

        if update {
            let action = if baseline_existed {
                Action::UpdatedBaseline
            } else {
                Action::CreatedBaseline
            };
            return Ok(self.outcome(story, Status::Passed, action, None, None, Some(actual)));
        }

        if !baseline_existed {
            // The runner drops baseline-less stories before dispatch; this
            // covers a baseline vanishing mid-run.
            return Ok(self.outcome(
                story,
                Status::Skipped,
                Action::Skipped,
                Some("missing baseline: run update to create it".to_string()),
                None,
                Some(actual),
            ));
        }

        let diff_path = self.artifacts.diff_path(rel);
        let comparator = ImageComparator::new(self.config.threshold_for(&story.id));
        match comparator
            .compare_files(&expected, &actual, &diff_path)
            .await?
        {
            Verdict::Match => {
                self.artifacts.clean_passing(rel);
                Ok(self.outcome(story, Status::Passed, Action::Pass, None, None, None))
            }
            Verdict::Differ {
                diff_pixels,
                diff_percentage,
                dimension_mismatch,
            } => {
                let reason = match dimension_mismatch {
                    Some((bw, bh, aw, ah)) => format!(
                        "visual difference: dimensions changed {bw}x{bh} -> {aw}x{ah}, see {}",
                        diff_path.display()
                    ),
                    None => format!(
                        "visual difference: {diff_pixels} pixels ({:.4}%), see {}",
                        diff_percentage * 100.0,
                        diff_path.display()
                    ),
                };
                Ok(self.outcome(
                    story,
                    Status::Failed,
                    Action::Failed,
                    Some(reason),
                    Some(diff_path),
                    Some(actual),
                ))
            }
        }
    }

    fn outcome(
        &self,
        story: &Story,
        status: Status,
        action: Action,
        error: Option<String>,
        diff_path: Option<PathBuf>,
        actual_path: Option<PathBuf>,
    ) -> StoryOutcome {
        StoryOutcome {
            story_id: story.id.clone(),
            display_name: story.display_name(),
            url: Some(story.url.clone()),
            status,
            action,
            duration: Duration::ZERO, // stamped by capture()
            error,
            diff_path,
            expected_path: Some(self.artifacts.expected_path(&story.snapshot_rel_path)),
            actual_path,
        }
    }
}

impl StoryExecutor for PageCapturer {
    fn run_story(
        &self,
        story: Story,
        cancel: CancelToken,
        first_wave: bool,
    ) -> futures::future::BoxFuture<'_, StoryOutcome> {
        use futures::FutureExt;
        async move { self.capture(&story, &cancel, first_wave).await }.boxed()
    }
}

/// Time left before `deadline`, or the stage's timeout error.
fn remaining(deadline: Instant, stage: &str) -> Result<Duration, CaptureError> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        Err(CaptureError::Timeout(format!("no budget left for {stage}")))
    } else {
        Ok(left)
    }
}

/// Run a promise-returning script with a Rust-side backstop slightly above
/// its in-page timeout, classifying failures.
async fn eval_bounded(
    conn: &mut CdpConnection,
    script: &str,
    budget: Duration,
    stage: &str,
) -> Result<(), CaptureError> {
    let backstop = budget + Duration::from_secs(2);
    match tokio::time::timeout(backstop, conn.eval_async(script)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => {
            if conn.crashed() || is_crash(&e) {
                Err(CaptureError::Crash)
            } else {
                Err(CaptureError::Timeout(format!("{stage}: {e:#}")))
            }
        }
        Err(_) => {
            if conn.crashed() {
                Err(CaptureError::Crash)
            } else {
                Err(CaptureError::Timeout(format!(
                    "{stage} did not answer within {}ms",
                    backstop.as_millis()
                )))
            }
        }
    }
}

fn promote_crash(conn: &CdpConnection, err: anyhow::Error) -> CaptureError {
    if conn.crashed() || is_crash(&err) {
        CaptureError::Crash
    } else {
        CaptureError::from_anyhow(err)
    }
}

fn navigation_error(conn: &CdpConnection, err: anyhow::Error) -> CaptureError {
    if conn.crashed() || is_crash(&err) {
        CaptureError::Crash
    } else {
        CaptureError::Navigation(format!("{err:#}"))
    }
}

/// Filesystem diagnostics appended to screenshot failures.
fn screenshot_error_with_diagnostics(err: anyhow::Error, actual: &Path) -> CaptureError {
    let dir = actual.parent();
    let dir_exists = dir.is_some_and(Path::exists);
    let parent_exists = dir.and_then(Path::parent).is_some_and(Path::exists);
    let writable = dir.is_some_and(|d| tempfile::tempfile_in(d).is_ok());
    CaptureError::Screenshot(format!(
        "{err:#} (target dir exists: {dir_exists}, writable: {writable}, parent exists: {parent_exists})"
    ))
}

/// Deterministic first-wave stagger so concurrent browser launches don't
/// land on the same instant.
fn stagger_delay(story_id: &str) -> Duration {
    let mut hasher = DefaultHasher::new();
    story_id.hash(&mut hasher);
    Duration::from_millis(hasher.finish() % STAGGER_WINDOW_MS)
}
