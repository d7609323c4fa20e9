use anyhow::{Context, Result};
use regex::RegexBuilder;
use tracing::debug;

use super::Story;
use crate::artifacts::ArtifactManager;
use crate::config::RunConfig;

/// Reduces the discovered story list to the runnable set.
///
/// Applied in order: include patterns (OR), exclude patterns (AND-NOT),
/// grep regex, `missing-only`, `failed-only`. All matching is
/// case-insensitive and tested against both the story id and the
/// `title / name` display form.
pub struct StoryFilter {
    include: Vec<Matcher>,
    exclude: Vec<Matcher>,
    grep: Option<regex::Regex>,
    missing_only: bool,
    failed_only: bool,
}

/// A single include/exclude pattern. Patterns containing glob
/// metacharacters compile as globs; anything else matches as a literal
/// substring.
enum Matcher {
    Glob(glob::Pattern),
    Substring(String),
}

const GLOB_META: [char; 6] = ['*', '?', '[', ']', '{', '}'];

impl Matcher {
    fn parse(pattern: &str) -> Result<Self> {
        if pattern.contains(GLOB_META) {
            let compiled = glob::Pattern::new(pattern)
                .with_context(|| format!("Invalid pattern '{pattern}'"))?;
            Ok(Self::Glob(compiled))
        } else {
            Ok(Self::Substring(pattern.to_lowercase()))
        }
    }

    fn matches(&self, candidate: &str) -> bool {
        match self {
            Self::Glob(p) => p.matches_with(
                candidate,
                glob::MatchOptions {
                    case_sensitive: false,
                    require_literal_separator: false,
                    require_literal_leading_dot: false,
                },
            ),
            Self::Substring(s) => candidate.to_lowercase().contains(s),
        }
    }
}

impl StoryFilter {
    pub fn from_config(config: &RunConfig) -> Result<Self> {
        let include = config
            .include
            .iter()
            .map(|p| Matcher::parse(p))
            .collect::<Result<Vec<_>>>()?;
        let exclude = config
            .exclude
            .iter()
            .map(|p| Matcher::parse(p))
            .collect::<Result<Vec<_>>>()?;
        let grep = config
            .grep
            .as_deref()
            .map(|pattern| {
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .with_context(|| format!("Invalid grep regex '{pattern}'"))
            })
            .transpose()?;

        Ok(Self {
            include,
            exclude,
            grep,
            missing_only: config.missing_only,
            failed_only: config.failed_only,
        })
    }

    /// Pattern/grep verdict for one story, ignoring the filesystem-backed
    /// modes.
    fn matches_patterns(&self, story: &Story) -> bool {
        let id = &story.id;
        let display = story.display_name();

        if !self.include.is_empty()
            && !self
                .include
                .iter()
                .any(|m| m.matches(id) || m.matches(&display))
        {
            return false;
        }

        if self
            .exclude
            .iter()
            .any(|m| m.matches(id) || m.matches(&display))
        {
            return false;
        }

        if let Some(ref grep) = self.grep
            && !(grep.is_match(id) || grep.is_match(&display))
        {
            return false;
        }

        true
    }

    /// Apply every filter stage and return the runnable set.
    pub fn apply(&self, stories: Vec<Story>, artifacts: &ArtifactManager) -> Vec<Story> {
        let before = stories.len();
        let filtered: Vec<Story> = stories
            .into_iter()
            .filter(|story| self.matches_patterns(story))
            .filter(|story| {
                !self.missing_only || !artifacts.expected_path(&story.snapshot_rel_path).exists()
            })
            .filter(|story| {
                !self.failed_only || artifacts.has_failure_artifact(&story.snapshot_rel_path)
            })
            .collect();
        debug!(before, after = filtered.len(), "stories filtered");
        filtered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn story(id: &str, title: &str, name: &str) -> Story {
        Story {
            id: id.to_string(),
            title: title.to_string(),
            name: name.to_string(),
            url: String::new(),
            snapshot_rel_path: format!("{id}.png"),
            viewport: None,
            parameters: None,
            tags: Vec::new(),
        }
    }

    fn filter(include: &[&str], exclude: &[&str], grep: Option<&str>) -> StoryFilter {
        StoryFilter {
            include: include.iter().map(|p| Matcher::parse(p).unwrap()).collect(),
            exclude: exclude.iter().map(|p| Matcher::parse(p).unwrap()).collect(),
            grep: grep.map(|p| {
                RegexBuilder::new(p)
                    .case_insensitive(true)
                    .build()
                    .unwrap()
            }),
            missing_only: false,
            failed_only: false,
        }
    }

    #[test]
    fn literal_pattern_is_substring_match() {
        let f = filter(&["button"], &[], None);
        assert!(f.matches_patterns(&story("components-button--primary", "Components/Button", "Primary")));
        assert!(!f.matches_patterns(&story("components-card--basic", "Components/Card", "Basic")));
    }

    #[test]
    fn literal_match_is_case_insensitive() {
        let f = filter(&["BUTTON"], &[], None);
        assert!(f.matches_patterns(&story("components-button--primary", "Components/Button", "Primary")));
    }

    #[test]
    fn glob_pattern_matches_whole_candidate() {
        let f = filter(&["components-*--primary"], &[], None);
        assert!(f.matches_patterns(&story("components-button--primary", "Components/Button", "Primary")));
        assert!(!f.matches_patterns(&story("components-button--hover", "Components/Button", "Hover")));
    }

    #[test]
    fn display_name_is_also_tested() {
        let f = filter(&["Components/Button *"], &[], None);
        assert!(f.matches_patterns(&story("components-button--primary", "Components/Button", "Primary")));
    }

    #[test]
    fn include_patterns_are_or_combined() {
        let f = filter(&["button", "card"], &[], None);
        assert!(f.matches_patterns(&story("components-card--basic", "Components/Card", "Basic")));
    }

    #[test]
    fn exclude_wins_over_include() {
        let f = filter(&["components"], &["card"], None);
        assert!(f.matches_patterns(&story("components-button--primary", "Components/Button", "Primary")));
        assert!(!f.matches_patterns(&story("components-card--basic", "Components/Card", "Basic")));
    }

    #[test]
    fn grep_narrows_the_set() {
        let f = filter(&[], &[], Some(r"--(primary|hover)$"));
        assert!(f.matches_patterns(&story("components-button--primary", "Components/Button", "Primary")));
        assert!(!f.matches_patterns(&story("components-button--disabled", "Components/Button", "Disabled")));
    }

    #[test]
    fn empty_include_matches_everything() {
        let f = filter(&[], &[], None);
        assert!(f.matches_patterns(&story("anything", "Any", "Thing")));
    }
}
