use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, warn};

use super::Story;

const INDEX_TIMEOUT: Duration = Duration::from_secs(10);

/// Directory of a static Storybook export, tried when the server is down.
const STATIC_EXPORT_DIR: &str = "storybook-static";

/// Index reachable but useless: terminal before any browser is launched.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("index contains no stories")]
    EmptyIndex,
}

#[derive(Deserialize)]
struct IndexResponse {
    #[allow(dead_code)]
    pub v: u32,
    pub entries: HashMap<String, StoryEntry>,
}

#[derive(Deserialize)]
struct StoryEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub entry_type: String,
    pub name: String,
    pub title: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
}

/// The list of runnable stories, loaded from a Storybook instance or a
/// static export.
pub struct StoryIndex {
    base_url: String,
    static_index: PathBuf,
}

impl StoryIndex {
    pub fn new(base_url: &str, project_root: &Path) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            static_index: project_root.join(STATIC_EXPORT_DIR).join("index.json"),
        }
    }

    /// Primary iframe URL for a story.
    pub fn story_url(&self, story_id: &str) -> String {
        format!(
            "{}/iframe.html?id={story_id}&viewMode=story",
            self.base_url
        )
    }

    /// Secondary iframe URL form, tried when the primary yields a non-2xx
    /// response.
    pub fn story_url_fallback(&self, story_id: &str) -> String {
        format!("{}/iframe.html?path=/story/{story_id}", self.base_url)
    }

    /// Fetch `index.json` and return all stories, sorted by id.
    ///
    /// Falls back to the static export when the server is unreachable or
    /// serves something that is not JSON. Filters out non-story entries
    /// (docs) and stories tagged for skipping.
    pub async fn load(&self) -> Result<Vec<Story>> {
        let index = match self.fetch_index().await {
            Ok(index) => index,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "index fetch failed, trying static export");
                self.read_static_index()
                    .with_context(|| format!("{e:#}; static export fallback also failed"))?
            }
        };

        let mut stories: Vec<Story> = index
            .entries
            .into_values()
            .filter(|entry| entry.entry_type == "story")
            .map(|entry| self.story_from_entry(entry))
            .filter(|story| !story.is_skipped())
            .collect();

        if stories.is_empty() {
            return Err(DiscoveryError::EmptyIndex.into());
        }

        stories.sort_by(|a, b| a.id.cmp(&b.id));
        debug!(count = stories.len(), "stories discovered");
        Ok(stories)
    }

    async fn fetch_index(&self) -> Result<IndexResponse> {
        let index_url = format!("{}/index.json", self.base_url);
        let response = reqwest::Client::builder()
            .timeout(INDEX_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?
            .get(&index_url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch {index_url}"))?
            .error_for_status()
            .with_context(|| format!("{index_url} returned an error status"))?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !content_type.contains("json") {
            anyhow::bail!("{index_url} served '{content_type}', expected JSON");
        }

        response
            .json()
            .await
            .with_context(|| format!("Failed to parse {index_url}"))
    }

    fn read_static_index(&self) -> Result<IndexResponse> {
        let content = std::fs::read_to_string(&self.static_index)
            .with_context(|| format!("Failed to read {}", self.static_index.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", self.static_index.display()))
    }

    fn story_from_entry(&self, entry: StoryEntry) -> Story {
        let snapshot_rel_path = snapshot_rel_path(&entry.title, &entry.name, &entry.id);
        Story {
            url: self.story_url(&entry.id),
            id: entry.id,
            title: entry.title,
            name: entry.name,
            snapshot_rel_path,
            viewport: None,
            parameters: entry.parameters,
            tags: entry.tags,
        }
    }
}

/// Derive the filesystem-safe snapshot path for a story.
///
/// The combined `"{title} / {name}"` display form is split on the literal
/// `" / "` delimiter (space-slash-space); leading segments become
/// directories and the last becomes the basename. A bare `/` never matches
/// the delimiter and sanitizes to `-` inside its segment. Falls back to
/// `{id}.png` when sanitization leaves nothing usable.
pub fn snapshot_rel_path(title: &str, name: &str, id: &str) -> String {
    let combined = format!("{title} / {name}");
    let segments: Vec<String> = combined
        .split(" / ")
        .map(sanitize_segment)
        .filter(|s| !s.is_empty())
        .collect();

    if segments.is_empty() {
        return format!("{id}.png");
    }

    format!("{}.png", segments.join("/"))
}

/// Make one path segment filesystem-safe: reserved characters and whitespace
/// become dashes, `..` and dash runs collapse, and leading/trailing
/// space/dot/dash are trimmed.
fn sanitize_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for ch in segment.chars() {
        if matches!(ch, '<' | '>' | ':' | '"' | '|' | '?' | '*' | '\\' | '/') || ch.is_whitespace()
        {
            out.push('-');
        } else {
            out.push(ch);
        }
    }

    while out.contains("..") {
        out = out.replace("..", ".");
    }
    while out.contains("--") {
        out = out.replace("--", "-");
    }

    out.trim_matches([' ', '.', '-']).to_string()
}
