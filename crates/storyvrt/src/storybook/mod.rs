pub mod discovery;
pub mod filter;
pub mod viewport;

pub use self::discovery::StoryIndex;
pub use self::filter::StoryFilter;
pub use self::viewport::{ResolvedViewport, ViewportResolver};

/// A discovered story ready for capture.
#[derive(Debug, Clone)]
pub struct Story {
    /// Stable slug, e.g. `components-button--primary`.
    pub id: String,
    /// Hierarchy title, e.g. `Components/Button`.
    pub title: String,
    /// Story name within the title, e.g. `Primary`.
    pub name: String,
    /// Iframe URL the worker navigates to.
    pub url: String,
    /// Filesystem-safe path relative to the snapshot/results roots, ends `.png`.
    pub snapshot_rel_path: String,
    /// Viewport resolved before dispatch; `None` lets the page size itself.
    pub viewport: Option<ResolvedViewport>,
    /// Raw parameter bag from the index entry, when present.
    pub parameters: Option<serde_json::Value>,
    pub tags: Vec<String>,
}

impl Story {
    /// Human-facing name shown in result lines and tested by filters.
    pub fn display_name(&self) -> String {
        format!("{} / {}", self.title, self.name)
    }

    /// Check if this story should be skipped (tagged `storyvrt-skip`).
    pub fn is_skipped(&self) -> bool {
        self.tags.iter().any(|t| t == "storyvrt-skip")
    }

    /// Id reduced to characters safe in a dump filename.
    pub fn safe_id(&self) -> String {
        self.id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }
}
