pub mod terminal;

pub use self::terminal::TerminalSink;

use crate::capture::StoryOutcome;
use crate::pool::Progress;

/// Where run events go. The pool and runner talk only to this trait; the
/// terminal renderer is the in-tree implementation, IDE bridges live
/// elsewhere.
pub trait EventSink: Send + Sync {
    /// A story was dispatched to a worker.
    fn on_story_start(&self, story_id: &str, display_name: &str);
    /// A story produced its outcome. Fires exactly once per story, as soon
    /// as the outcome exists.
    fn on_result(&self, outcome: &StoryOutcome);
    /// The pool folded the outcome into its counters.
    fn on_story_complete(&self, outcome: &StoryOutcome);
    /// Aggregate counters after each outcome.
    fn on_progress(&self, progress: &Progress);
}
