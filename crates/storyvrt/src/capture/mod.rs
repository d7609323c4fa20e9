pub mod animations;
pub mod clock;
pub mod dumps;
pub mod page;
pub mod scripts;

use std::path::PathBuf;
use std::time::Duration;

pub use self::page::PageCapturer;

/// Terminal status of one story.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Passed,
    Failed,
    Skipped,
    Cancelled,
}

/// What the run did with the story.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Pass,
    CreatedBaseline,
    UpdatedBaseline,
    Failed,
    Skipped,
    Cancelled,
}

/// The immutable per-story record produced exactly once per run.
#[derive(Debug, Clone)]
pub struct StoryOutcome {
    pub story_id: String,
    pub display_name: String,
    pub url: Option<String>,
    pub status: Status,
    pub action: Action,
    pub duration: Duration,
    pub error: Option<String>,
    pub diff_path: Option<PathBuf>,
    pub expected_path: Option<PathBuf>,
    pub actual_path: Option<PathBuf>,
}

impl StoryOutcome {
    pub fn cancelled(story_id: &str, display_name: &str) -> Self {
        Self {
            story_id: story_id.to_string(),
            display_name: display_name.to_string(),
            url: None,
            status: Status::Cancelled,
            action: Action::Cancelled,
            duration: Duration::ZERO,
            error: None,
            diff_path: None,
            expected_path: None,
            actual_path: None,
        }
    }
}

/// Failure kinds inside one capture attempt. Everything except `Cancelled`
/// is retried while attempts remain.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("failed to load story: {0}")]
    Navigation(String),
    #[error("operation timed out: {0}")]
    Timeout(String),
    #[error("browser crashed")]
    Crash,
    #[error("screenshot failed: {0}")]
    Screenshot(String),
    #[error("image comparison failed: {0}")]
    Comparator(String),
    #[error("baseline corrupted: {0}")]
    BaselineCorrupted(String),
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CaptureError {
    pub fn retryable(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }

    /// Timeouts and crashes leave diagnostic dumps behind.
    pub fn wants_dump(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Crash)
    }

    /// Classify a plumbing error, promoting crash signatures.
    pub fn from_anyhow(err: anyhow::Error) -> Self {
        if is_crash(&err) {
            Self::Crash
        } else {
            Self::Other(err)
        }
    }
}

/// Crash signatures surfaced by CDP error strings.
pub(crate) fn is_crash(err: &anyhow::Error) -> bool {
    let msg = format!("{err:#}").to_lowercase();
    msg.contains("target crashed") || msg.contains("page crashed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_is_not_retryable() {
        assert!(!CaptureError::Cancelled.retryable());
        assert!(CaptureError::Crash.retryable());
        assert!(CaptureError::Timeout("x".into()).retryable());
    }

    #[test]
    fn crash_signatures_promoted() {
        let err = anyhow::anyhow!("CDP error: Target crashed during navigation");
        assert!(matches!(CaptureError::from_anyhow(err), CaptureError::Crash));
        let err = anyhow::anyhow!("connection refused");
        assert!(matches!(
            CaptureError::from_anyhow(err),
            CaptureError::Other(_)
        ));
    }

    #[test]
    fn only_timeouts_and_crashes_dump() {
        assert!(CaptureError::Crash.wants_dump());
        assert!(CaptureError::Timeout("x".into()).wants_dump());
        assert!(!CaptureError::Navigation("x".into()).wants_dump());
        assert!(!CaptureError::Cancelled.wants_dump());
    }
}
