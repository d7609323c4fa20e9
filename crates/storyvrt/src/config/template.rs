use std::path::Path;

use anyhow::{Context, Result};

use super::{CONFIG_DIR, CONFIG_FILE};

/// Hand-crafted config template with commented-out keys.
/// Used by `storyvrt init` instead of `toml::to_string_pretty()` so that
/// users can see the available knobs without uncommenting section headers.
const CONFIG_TEMPLATE: &str = r#"[storybook]
url = "{url}"
# snapshot_path = ".storyvrt/baseline"
# results_path = ".storyvrt/results"
# default_viewport = "laptop"       # applied to stories that declare none

[viewport.laptop]
width = 1366
height = 768

# ─────────────────────────────────────────────────────────
# Capture pipeline — all fields optional.
# ─────────────────────────────────────────────────────────
[capture]
# full_page = false                 # capture the full page height
# retries = 0                       # extra attempts per story
# max_failures = 10                 # cancel the run after this many failures
# workers = 4                       # fixed worker count (disables adaptive scaling)
# test_timeout_ms = 60000
# story_load_delay_ms = 0           # extra settle delay before the screenshot
# keep_animations = false
# fix_date = "2024-02-02T10:00:00Z" # true/false, ISO-8601, or epoch timestamp

# ─────────────────────────────────────────────────────────
# Comparison — all fields optional.
# ─────────────────────────────────────────────────────────
[diff]
# threshold = 0.0                   # max differing-pixel fraction (0.0 = exact, 0.01 = 1%)

# Per-story overrides:
# [story."components-button--primary"]
# viewport = "laptop"               # or { width = 375, height = 667 }
# threshold = 0.05
"#;

pub fn config_file_exists() -> bool {
    Path::new(CONFIG_DIR).join(CONFIG_FILE).exists()
}

pub fn write_gitignore(force: bool) -> Result<()> {
    let path = Path::new(CONFIG_DIR).join(".gitignore");
    if !force && path.exists() {
        return Ok(());
    }
    std::fs::write(&path, "results/\n")
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Write the hand-crafted config template (with commented-out sections).
pub fn write_template(url: &str) -> Result<()> {
    let dir = Path::new(CONFIG_DIR);
    std::fs::create_dir_all(dir).context("Failed to create .storyvrt directory")?;
    let path = dir.join(CONFIG_FILE);
    let content = CONFIG_TEMPLATE.replace("{url}", url);
    std::fs::write(&path, content)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}
