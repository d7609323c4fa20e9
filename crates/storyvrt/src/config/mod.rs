pub mod resolve;
pub mod template;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

pub use self::resolve::{CliOverrides, RunConfig, RunMode};
pub use self::template::{config_file_exists, write_gitignore, write_template};

pub(crate) const CONFIG_DIR: &str = ".storyvrt";
const CONFIG_FILE: &str = "config.toml";

/// Default pinned wall-clock time injected into every page.
pub const DEFAULT_FIXED_DATE: &str = "2024-02-02T10:00:00Z";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// Per-story viewport override: either a registered name or inline
/// dimensions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ViewportSpec {
    Name(String),
    Size(Viewport),
}

/// Per-story overrides keyed by story id under `[story."<id>"]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoryOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewport: Option<ViewportSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
}

/// Pinned-clock configuration. A bool enables/disables the default date; a
/// string is ISO-8601; a number is an epoch timestamp (values below the
/// year-2000 threshold are seconds).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FixDate {
    Enabled(bool),
    Iso(String),
    Epoch(i64),
}

impl Default for FixDate {
    fn default() -> Self {
        Self::Enabled(true)
    }
}

pub fn validate_threshold(v: f64) -> Result<f64, String> {
    if !(0.0..=1.0).contains(&v) {
        return Err(format!("threshold must be between 0.0 and 1.0, got {v}"));
    }
    Ok(v)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
    pub storybook: StorybookConfig,
    #[serde(default = "default_viewports")]
    pub viewport: BTreeMap<String, Viewport>,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub diff: DiffConfig,
    #[serde(default)]
    pub story: BTreeMap<String, StoryOverride>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StorybookConfig {
    pub url: String,
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: PathBuf,
    #[serde(default = "default_results_path")]
    pub results_path: PathBuf,
    /// Name of the viewport applied to stories that declare none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_viewport: Option<String>,
}

/// Capture tuning shared by the config file (`[capture]`) and the CLI
/// (flattened `clap::Args`). `None` means "use default".
#[derive(Clone, Debug, Default, clap::Args, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Capture the full page height instead of the viewport
    #[arg(long)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_page: Option<bool>,

    /// Retries per story after the first failed attempt
    #[arg(long)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,

    /// Cancel the run once this many stories have failed
    #[arg(long)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_failures: Option<usize>,

    /// Fixed worker count (disables adaptive scaling)
    #[arg(long, short = 'w')]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    /// Per-story timeout in milliseconds
    #[arg(long)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_timeout_ms: Option<u64>,

    /// Fixed delay after the story settles, in milliseconds
    #[arg(long)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story_load_delay_ms: Option<u64>,

    /// Keep CSS animations running (disables the suppressor)
    #[arg(long)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_animations: Option<bool>,

    /// Pinned clock: true/false, an ISO-8601 date, or an epoch timestamp
    #[arg(long, value_parser = parse_fix_date)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix_date: Option<FixDate>,
}

impl CaptureConfig {
    /// Overlay non-None fields from `other` onto self.
    pub fn merge(&mut self, other: &CaptureConfig) {
        if other.full_page.is_some() {
            self.full_page = other.full_page;
        }
        if other.retries.is_some() {
            self.retries = other.retries;
        }
        if other.max_failures.is_some() {
            self.max_failures = other.max_failures;
        }
        if other.workers.is_some() {
            self.workers = other.workers;
        }
        if other.test_timeout_ms.is_some() {
            self.test_timeout_ms = other.test_timeout_ms;
        }
        if other.story_load_delay_ms.is_some() {
            self.story_load_delay_ms = other.story_load_delay_ms;
        }
        if other.keep_animations.is_some() {
            self.keep_animations = other.keep_animations;
        }
        if other.fix_date.is_some() {
            self.fix_date = other.fix_date.clone();
        }
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_millis(self.test_timeout_ms.unwrap_or(60_000))
    }

    pub fn story_load_delay(&self) -> Option<Duration> {
        self.story_load_delay_ms.map(Duration::from_millis)
    }
}

fn parse_fix_date(s: &str) -> Result<FixDate, String> {
    if let Ok(b) = s.parse::<bool>() {
        return Ok(FixDate::Enabled(b));
    }
    if let Ok(n) = s.parse::<i64>() {
        return Ok(FixDate::Epoch(n));
    }
    Ok(FixDate::Iso(s.to_string()))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiffConfig {
    /// Maximum fraction of differing pixels (0.0-1.0) for a comparison to
    /// still count as a match.
    #[serde(default)]
    pub threshold: f64,
}

impl Config {
    /// Validate semantic constraints that serde cannot express.
    fn validate(&self) -> Result<()> {
        for (name, vp) in &self.viewport {
            if vp.width == 0 || vp.height == 0 {
                bail!(
                    "Viewport '{name}' has invalid dimensions ({}x{}). \
                     Both width and height must be > 0",
                    vp.width,
                    vp.height,
                );
            }
        }

        if let Some(ref default) = self.storybook.default_viewport
            && !self.viewport.contains_key(default)
        {
            let defined: Vec<&str> = self.viewport.keys().map(|k| k.as_str()).collect();
            bail!(
                "default_viewport '{default}' is not defined. Defined viewports: {}",
                defined.join(", "),
            );
        }

        for (id, story) in &self.story {
            match &story.viewport {
                Some(ViewportSpec::Name(name)) if !self.viewport.contains_key(name) => {
                    let defined: Vec<&str> = self.viewport.keys().map(|k| k.as_str()).collect();
                    bail!(
                        "Story '{id}' references viewport '{name}', but it is not defined. \
                         Defined viewports: {}",
                        defined.join(", "),
                    );
                }
                Some(ViewportSpec::Size(vp)) if vp.width == 0 || vp.height == 0 => {
                    bail!(
                        "Story '{id}' has an invalid viewport ({}x{})",
                        vp.width,
                        vp.height
                    );
                }
                _ => {}
            }
            if let Some(t) = story.threshold {
                validate_threshold(t).map_err(|e| anyhow::anyhow!("story '{id}': {e}"))?;
            }
        }

        Ok(())
    }
}

fn default_viewports() -> BTreeMap<String, Viewport> {
    let mut m = BTreeMap::new();
    m.insert(
        "laptop".to_string(),
        Viewport {
            width: 1366,
            height: 768,
        },
    );
    m
}

fn default_snapshot_path() -> PathBuf {
    Path::new(CONFIG_DIR).join("baseline").to_path_buf()
}

fn default_results_path() -> PathBuf {
    Path::new(CONFIG_DIR).join("results").to_path_buf()
}

pub fn load() -> Result<Config> {
    let path = Path::new(CONFIG_DIR).join(CONFIG_FILE);
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let config: Config =
        toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))?;
    validate_threshold(config.diff.threshold).map_err(|e| anyhow::anyhow!("diff.{e}"))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_bounds_enforced() {
        assert!(validate_threshold(0.0).is_ok());
        assert!(validate_threshold(1.0).is_ok());
        assert!(validate_threshold(-0.1).is_err());
        assert!(validate_threshold(1.1).is_err());
    }

    #[test]
    fn zero_size_viewport_rejected() {
        let config: Config = toml::from_str(
            r#"
            [storybook]
            url = "http://localhost:6006"
            [viewport.broken]
            width = 0
            height = 768
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn undefined_default_viewport_rejected() {
        let config: Config = toml::from_str(
            r#"
            [storybook]
            url = "http://localhost:6006"
            default_viewport = "tablet"
            [viewport.laptop]
            width = 1366
            height = 768
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn story_override_parses_named_and_inline_viewports() {
        let config: Config = toml::from_str(
            r#"
            [storybook]
            url = "http://localhost:6006"
            [viewport.mobile]
            width = 375
            height = 667
            [story."components-button--primary"]
            viewport = "mobile"
            [story."components-hero--wide"]
            viewport = { width = 1920, height = 1080 }
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert!(matches!(
            config.story["components-button--primary"].viewport,
            Some(ViewportSpec::Name(_))
        ));
        assert!(matches!(
            config.story["components-hero--wide"].viewport,
            Some(ViewportSpec::Size(_))
        ));
    }

    #[test]
    fn fix_date_accepts_bool_number_and_string() {
        assert!(matches!(parse_fix_date("true"), Ok(FixDate::Enabled(true))));
        assert!(matches!(parse_fix_date("1700000000"), Ok(FixDate::Epoch(_))));
        assert!(matches!(
            parse_fix_date("2024-02-02T10:00:00Z"),
            Ok(FixDate::Iso(_))
        ));
    }

    #[test]
    fn capture_merge_overlays_only_set_fields() {
        let mut base = CaptureConfig {
            retries: Some(2),
            workers: Some(4),
            ..Default::default()
        };
        let overlay = CaptureConfig {
            retries: Some(0),
            ..Default::default()
        };
        base.merge(&overlay);
        assert_eq!(base.retries, Some(0));
        assert_eq!(base.workers, Some(4));
    }
}
