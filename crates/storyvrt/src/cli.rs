use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config;
use crate::config::{CaptureConfig, CliOverrides};

fn parse_threshold(s: &str) -> Result<f64, String> {
    let v: f64 = s.parse().map_err(|e| format!("{e}"))?;
    config::validate_threshold(v)
}

#[derive(Parser)]
#[command(
    name = "storyvrt",
    about = "Visual regression testing for Storybook component catalogs"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// Flags shared by `test` and `update`.
#[derive(Args)]
pub struct RunArgs {
    /// Storybook URL (overrides config)
    #[arg(long)]
    pub url: Option<String>,
    /// Baseline tree root (overrides config)
    #[arg(long)]
    pub snapshot_path: Option<PathBuf>,
    /// Results tree root (overrides config)
    #[arg(long)]
    pub results_path: Option<PathBuf>,
    /// Max differing-pixel fraction (0.0-1.0) for a story to still pass
    #[arg(long, value_parser = parse_threshold)]
    pub threshold: Option<f64>,
    /// Only run stories matching PATTERN (glob or substring; repeatable)
    #[arg(long, short = 'i')]
    pub include: Vec<String>,
    /// Skip stories matching PATTERN (glob or substring; repeatable)
    #[arg(long, short = 'x')]
    pub exclude: Vec<String>,
    /// Only run stories whose id or name matches this regex
    #[arg(long, short = 'g')]
    pub grep: Option<String>,
    /// Only run stories that have no baseline yet
    #[arg(long)]
    pub missing_only: bool,
    /// Only run stories that failed in the previous run
    #[arg(long)]
    pub failed_only: bool,
    /// Log level for diagnostics on stderr (error, warn, info, debug, trace)
    #[arg(long)]
    pub log_level: Option<String>,
    /// Only print failures and the final summary
    #[arg(long, short = 'q')]
    pub quiet: bool,
    /// Disable the in-place progress line
    #[arg(long)]
    pub no_progress: bool,
    /// Print the final summary even in quiet mode
    #[arg(long)]
    pub summary: bool,
    #[command(flatten)]
    pub capture: CaptureConfig,
}

impl RunArgs {
    /// The stderr log filter this invocation asked for, if any.
    pub fn log_filter(&self) -> Option<String> {
        if let Some(ref level) = self.log_level {
            return Some(format!("storyvrt={level}"));
        }
        self.quiet.then(|| "storyvrt=warn".to_string())
    }
}

impl From<RunArgs> for CliOverrides {
    fn from(args: RunArgs) -> Self {
        Self {
            url: args.url,
            snapshot_path: args.snapshot_path,
            results_path: args.results_path,
            threshold: args.threshold,
            include: args.include,
            exclude: args.exclude,
            grep: args.grep,
            missing_only: args.missing_only,
            failed_only: args.failed_only,
            quiet: args.quiet,
            no_progress: args.no_progress,
            summary: args.summary,
            capture: args.capture,
        }
    }
}

#[derive(Subcommand)]
pub enum Command {
    /// Create .storyvrt/config.toml with default settings
    Init {
        /// Storybook URL
        #[arg(long, default_value = "http://localhost:6006")]
        url: String,
        /// Overwrite existing config and gitignore
        #[arg(long, short = 'f')]
        force: bool,
    },

    /// Capture stories and compare against baselines (exit 0/1, 130 on ^C)
    Test {
        #[command(flatten)]
        args: RunArgs,
    },

    /// Capture stories and write them as baselines
    Update {
        #[command(flatten)]
        args: RunArgs,
        /// Also delete baselines and results no longer matching any story
        #[arg(long)]
        clean: bool,
    },
}
