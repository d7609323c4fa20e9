use std::io::Write;
use std::time::Duration;

use super::EventSink;
use crate::capture::{Action, Status, StoryOutcome};
use crate::pool::{PoolResult, Progress};

/// ANSI terminal renderer: one result line per story, detail blocks for
/// failures, an in-place progress line, and a final summary.
pub struct TerminalSink {
    show_progress: bool,
    quiet: bool,
}

impl TerminalSink {
    pub fn new(show_progress: bool, quiet: bool) -> Self {
        Self {
            show_progress,
            quiet,
        }
    }
}

impl EventSink for TerminalSink {
    fn on_story_start(&self, _story_id: &str, _display_name: &str) {}

    fn on_result(&self, outcome: &StoryOutcome) {
        if self.quiet && !matches!(outcome.status, Status::Failed) {
            return;
        }
        print_result_line(outcome);
        if matches!(outcome.status, Status::Failed) {
            print_failure_detail(outcome);
        }
    }

    fn on_story_complete(&self, _outcome: &StoryOutcome) {}

    fn on_progress(&self, progress: &Progress) {
        if !self.show_progress || progress.completed >= progress.total {
            return;
        }
        let mut counts = format!(
            "\x1b[32m{}\x1b[0m/\x1b[31m{}\x1b[0m",
            progress.passed, progress.failed
        );
        if progress.skipped > 0 {
            counts.push_str(&format!("/\x1b[33m{}\x1b[0m", progress.skipped));
        }
        if progress.cancelled > 0 {
            counts.push_str(&format!("/\x1b[2m{}\x1b[0m", progress.cancelled));
        }
        print!(
            "\r\x1b[2K  [{}/{}]  {counts}  {:.0}/min  {} workers  cpu {:>3.0}%{}",
            progress.completed,
            progress.total,
            progress.stories_per_minute,
            progress.workers,
            progress.cpu_percent,
            progress
                .eta_seconds
                .map(|s| format!("  eta {}", format_duration(Duration::from_secs_f64(s.max(0.0)))))
                .unwrap_or_default(),
        );
        let _ = std::io::stdout().flush();
    }
}

/// Clear the current terminal line (wipes the progress indicator).
pub fn clear_line() {
    print!("\r\x1b[2K");
}

pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms < 1000 {
        format!("{ms}ms")
    } else if ms < 60_000 {
        format!("{:.1}s", d.as_secs_f64())
    } else {
        let secs = d.as_secs();
        format!("{}m{:02}s", secs / 60, secs % 60)
    }
}

fn print_result_line(outcome: &StoryOutcome) {
    clear_line();
    let time = format!("  \x1b[2m{}\x1b[0m", format_duration(outcome.duration));
    let name = &outcome.display_name;

    match (outcome.status, outcome.action) {
        (Status::Passed, Action::CreatedBaseline) => {
            println!("  \x1b[33m NEW\x1b[0m  {name}  (baseline created){time}");
        }
        (Status::Passed, Action::UpdatedBaseline) => {
            println!("  \x1b[36m UPD\x1b[0m  {name}  (baseline updated){time}");
        }
        (Status::Passed, _) => {
            println!("  \x1b[32mPASS\x1b[0m  {name}{time}");
        }
        (Status::Failed, _) => {
            println!("  \x1b[31mFAIL\x1b[0m  {name}{time}");
        }
        (Status::Skipped, _) => {
            let reason = outcome.error.as_deref().unwrap_or("skipped");
            println!("  \x1b[33mSKIP\x1b[0m  {name}  ({reason}){time}");
        }
        (Status::Cancelled, _) => {
            println!("  \x1b[2mSTOP\x1b[0m  \x1b[2m{name}  (cancelled)\x1b[0m");
        }
    }
}

fn print_failure_detail(outcome: &StoryOutcome) {
    if let Some(ref reason) = outcome.error {
        println!("        reason:   {reason}");
    }
    if let Some(ref url) = outcome.url {
        println!("        url:      {url}");
    }
    if let Some(ref expected) = outcome.expected_path {
        println!("        baseline: {}", expected.display());
    }
    if let Some(ref actual) = outcome.actual_path {
        println!("        actual:   {}", actual.display());
    }
    match outcome.diff_path {
        Some(ref diff) => println!("        diff:     {}", diff.display()),
        None => println!("        diff:     not generated"),
    }
}

/// Final one-line summary plus follow-up hints.
pub fn print_summary(result: &PoolResult, stories_per_minute: f64, elapsed: Duration) {
    clear_line();
    println!();
    print!(
        "Stories:  {} total, \x1b[32m{} passed\x1b[0m, \x1b[31m{} failed\x1b[0m",
        result.total(),
        result.passed,
        result.failed,
    );
    if result.skipped > 0 {
        print!(", \x1b[33m{} skipped\x1b[0m", result.skipped);
    }
    if result.cancelled > 0 {
        print!(", \x1b[2m{} cancelled\x1b[0m", result.cancelled);
    }
    println!();
    println!(
        "Time:     {}  ({stories_per_minute:.0} stories/min)",
        format_duration(elapsed)
    );

    if result.failed > 0 || result.skipped > 0 {
        println!();
        if result.failed > 0 {
            println!("{} story(ies) have visual differences.", result.failed);
        }
        if result.skipped > 0 {
            println!(
                "{} story(ies) have no baseline. Run `storyvrt update` to create them.",
                result.skipped
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_format_by_magnitude() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.5s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m05s");
    }
}
