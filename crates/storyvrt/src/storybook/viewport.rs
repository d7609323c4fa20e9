use std::collections::BTreeMap;

use tracing::warn;

use super::Story;
use crate::config::{RunConfig, StoryOverride, Viewport, ViewportSpec};

/// A viewport pinned to a story before dispatch.
#[derive(Debug, Clone)]
pub struct ResolvedViewport {
    /// Registered name, when the viewport came from the registry.
    pub name: Option<String>,
    pub width: u32,
    pub height: u32,
}

/// Pre-computes the viewport for each story.
///
/// Precedence: per-story config override, then the viewport the story
/// declares via parameters, then the default viewport. Stories resolving to
/// none let the page size itself.
pub struct ViewportResolver<'a> {
    registry: &'a BTreeMap<String, Viewport>,
    per_story: &'a BTreeMap<String, StoryOverride>,
    default_viewport: Option<&'a str>,
}

impl<'a> ViewportResolver<'a> {
    pub fn new(config: &'a RunConfig) -> Self {
        Self {
            registry: &config.viewports,
            per_story: &config.per_story,
            default_viewport: config.default_viewport.as_deref(),
        }
    }

    /// Attach resolved viewports to every story.
    pub fn resolve_all(&self, stories: &mut [Story]) {
        for story in stories {
            story.viewport = self.resolve(story);
        }
    }

    fn resolve(&self, story: &Story) -> Option<ResolvedViewport> {
        if let Some(spec) = self
            .per_story
            .get(&story.id)
            .and_then(|o| o.viewport.as_ref())
        {
            match spec {
                ViewportSpec::Name(name) => {
                    if let Some(vp) = self.lookup(name, &story.id) {
                        return Some(vp);
                    }
                }
                ViewportSpec::Size(size) => {
                    return Some(ResolvedViewport {
                        name: None,
                        width: size.width,
                        height: size.height,
                    });
                }
            }
        }

        if let Some(name) = declared_viewport_name(story)
            && let Some(vp) = self.lookup(&name, &story.id)
        {
            return Some(vp);
        }

        self.default_viewport
            .and_then(|name| self.lookup(name, &story.id))
    }

    fn lookup(&self, name: &str, story_id: &str) -> Option<ResolvedViewport> {
        match self.registry.get(name) {
            Some(vp) => Some(ResolvedViewport {
                name: Some(name.to_string()),
                width: vp.width,
                height: vp.height,
            }),
            None => {
                warn!(story = story_id, viewport = name, "unknown viewport name");
                None
            }
        }
    }
}

/// Viewport name a story declares through its parameter bag
/// (`parameters.viewport.defaultViewport`).
fn declared_viewport_name(story: &Story) -> Option<String> {
    story
        .parameters
        .as_ref()?
        .get("viewport")?
        .get("defaultViewport")?
        .as_str()
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FixDate, RunMode};
    use serde_json::json;

    fn config() -> RunConfig {
        let mut viewports = BTreeMap::new();
        viewports.insert(
            "laptop".to_string(),
            Viewport {
                width: 1366,
                height: 768,
            },
        );
        viewports.insert(
            "mobile".to_string(),
            Viewport {
                width: 375,
                height: 667,
            },
        );
        RunConfig {
            mode: RunMode::Test,
            url: "http://localhost:6006".into(),
            snapshot_path: ".storyvrt/baseline".into(),
            results_path: ".storyvrt/results".into(),
            threshold: 0.0,
            full_page: false,
            missing_only: false,
            failed_only: false,
            include: Vec::new(),
            exclude: Vec::new(),
            grep: None,
            retries: 0,
            max_failures: None,
            workers: None,
            test_timeout: std::time::Duration::from_secs(60),
            story_load_delay: None,
            disable_animations: true,
            fix_date: FixDate::Enabled(true),
            viewports,
            default_viewport: Some("laptop".into()),
            per_story: BTreeMap::new(),
            quiet: false,
            show_progress: true,
            summary: false,
        }
    }

    fn story(id: &str) -> Story {
        Story {
            id: id.to_string(),
            title: "Components/Button".into(),
            name: "Primary".into(),
            url: String::new(),
            snapshot_rel_path: "Components/Button/Primary.png".into(),
            viewport: None,
            parameters: None,
            tags: Vec::new(),
        }
    }

    #[test]
    fn default_viewport_applies_when_story_declares_none() {
        let cfg = config();
        let resolver = ViewportResolver::new(&cfg);
        let vp = resolver.resolve(&story("a--b")).unwrap();
        assert_eq!(vp.name.as_deref(), Some("laptop"));
        assert_eq!((vp.width, vp.height), (1366, 768));
    }

    #[test]
    fn story_declared_viewport_beats_default() {
        let cfg = config();
        let resolver = ViewportResolver::new(&cfg);
        let mut s = story("a--b");
        s.parameters = Some(json!({"viewport": {"defaultViewport": "mobile"}}));
        let vp = resolver.resolve(&s).unwrap();
        assert_eq!(vp.name.as_deref(), Some("mobile"));
    }

    #[test]
    fn per_story_override_beats_declared_viewport() {
        let mut cfg = config();
        cfg.per_story.insert(
            "a--b".to_string(),
            StoryOverride {
                viewport: Some(ViewportSpec::Size(Viewport {
                    width: 1920,
                    height: 1080,
                })),
                threshold: None,
            },
        );
        let resolver = ViewportResolver::new(&cfg);
        let mut s = story("a--b");
        s.parameters = Some(json!({"viewport": {"defaultViewport": "mobile"}}));
        let vp = resolver.resolve(&s).unwrap();
        assert_eq!(vp.name, None);
        assert_eq!((vp.width, vp.height), (1920, 1080));
    }

    #[test]
    fn unknown_declared_name_falls_back_to_default() {
        let cfg = config();
        let resolver = ViewportResolver::new(&cfg);
        let mut s = story("a--b");
        s.parameters = Some(json!({"viewport": {"defaultViewport": "cinema"}}));
        let vp = resolver.resolve(&s).unwrap();
        assert_eq!(vp.name.as_deref(), Some("laptop"));
    }

    #[test]
    fn no_default_leaves_viewport_unset() {
        let mut cfg = config();
        cfg.default_viewport = None;
        let resolver = ViewportResolver::new(&cfg);
        assert!(resolver.resolve(&story("a--b")).is_none());
    }
}
