use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{debug, warn};

/// Timeout/crash dumps live under this directory inside the results tree
/// and are never swept by artifact cleanup.
pub const TIMEOUT_DUMPS_DIR: &str = "timeout-dumps";

const ENSURE_DIR_ATTEMPTS: u32 = 5;
const ENSURE_DIR_BACKOFF: Duration = Duration::from_millis(10);

/// Computes artifact paths and owns their lifecycle: directory creation
/// under parallel-worker races, retry-artifact cleanup, pass-time removal,
/// and empty-directory pruning.
pub struct ArtifactManager {
    snapshot_root: PathBuf,
    results_root: PathBuf,
    update: bool,
}

impl ArtifactManager {
    pub fn new(snapshot_root: &Path, results_root: &Path, update: bool) -> Self {
        Self {
            snapshot_root: snapshot_root.to_path_buf(),
            results_root: results_root.to_path_buf(),
            update,
        }
    }

    /// Baseline PNG for a story.
    pub fn expected_path(&self, rel: &str) -> PathBuf {
        join_contained(&self.snapshot_root, rel)
    }

    /// Where the capture is written. Update mode writes straight over the
    /// baseline; the results tree is untouched for that story.
    pub fn actual_path(&self, rel: &str) -> PathBuf {
        if self.update {
            self.expected_path(rel)
        } else {
            join_contained(&self.results_root, rel)
        }
    }

    /// Diff mask, sibling of the non-update actual: `X.png` -> `X.diff.png`.
    pub fn diff_path(&self, rel: &str) -> PathBuf {
        join_contained(&self.results_root, rel).with_extension("diff.png")
    }

    /// Stale error marker some earlier revision may have left behind:
    /// `X.png` -> `X-error.png`.
    fn error_marker_path(&self, rel: &str) -> PathBuf {
        let actual = join_contained(&self.results_root, rel);
        sibling_with_suffix(&actual, "-error.png")
    }

    /// Whether the previous run left a diff or error artifact for this
    /// story (the `failed-only` filter).
    pub fn has_failure_artifact(&self, rel: &str) -> bool {
        self.diff_path(rel).exists() || self.error_marker_path(rel).exists()
    }

    /// Directory where timeout/crash dumps for a story are written.
    pub fn dump_dir(&self) -> PathBuf {
        self.results_root.join(TIMEOUT_DUMPS_DIR)
    }

    /// Create `dir` (and parents), absorbing races with parallel workers.
    ///
    /// Concurrent `create_dir_all` calls over shared prefixes can surface
    /// EEXIST, ENOENT, or EINVAL transiently; those retry with exponential
    /// backoff. A final probe confirms the directory is actually writable.
    pub async fn ensure_directory(&self, dir: &Path) -> Result<()> {
        let mut backoff = ENSURE_DIR_BACKOFF;
        for attempt in 1..=ENSURE_DIR_ATTEMPTS {
            match std::fs::create_dir_all(dir) {
                Ok(()) => break,
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::AlreadyExists | ErrorKind::NotFound | ErrorKind::InvalidInput
                    ) =>
                {
                    // Racy kinds on the last attempt fall through to the
                    // probe below, which reports the real state.
                    if attempt == ENSURE_DIR_ATTEMPTS {
                        break;
                    }
                    debug!(
                        dir = %dir.display(),
                        attempt,
                        kind = ?e.kind(),
                        "create_dir_all raced, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to create {}", dir.display()));
                }
            }
        }

        if !dir.is_dir() {
            bail!("{} exists but is not a directory", dir.display());
        }
        tempfile::tempfile_in(dir)
            .with_context(|| format!("{} is not writable", dir.display()))?;
        Ok(())
    }

    /// Between attempts of the same story, delete only numbered retry
    /// artifacts (`<stem>-<n>-actual.png`, `<stem>-<n>-diff.png`,
    /// `<stem>-<n>-expected.png`, `test-failed-<n>.png`). Authoritative
    /// failure artifacts survive until the story passes.
    pub fn clean_retry_artifacts(&self, rel: &str) {
        let actual = join_contained(&self.results_root, rel);
        let Some(dir) = actual.parent() else {
            return;
        };
        let Some(stem) = actual.file_stem().and_then(|s| s.to_str()) else {
            return;
        };
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if is_retry_artifact(stem, name) {
                let _ = std::fs::remove_file(entry.path());
            }
        }
    }

    /// A story just passed: its actual, diff, and any stale error marker go
    /// away, then empty directories are pruned up to the results root.
    pub fn clean_passing(&self, rel: &str) {
        let actual = join_contained(&self.results_root, rel);
        let _ = std::fs::remove_file(&actual);
        let _ = std::fs::remove_file(self.diff_path(rel));
        let _ = std::fs::remove_file(self.error_marker_path(rel));
        // Legacy diff naming from earlier revisions.
        let _ = std::fs::remove_file(sibling_with_suffix(&actual, "-diff.png"));
        if let Some(dir) = actual.parent() {
            self.remove_empty_dirs_up(dir);
        }
    }

    /// Walk up from `dir`, removing directories as long as they are empty,
    /// stopping at (and never removing) the results root.
    pub fn remove_empty_dirs_up(&self, dir: &Path) {
        let root = &self.results_root;
        let mut current = Some(dir);
        while let Some(d) = current {
            if !is_contained(root, d) || d == root.as_path() {
                break;
            }
            if std::fs::read_dir(d).map_or(true, |mut e| e.next().is_none()) {
                let _ = std::fs::remove_dir(d);
                current = d.parent();
            } else {
                break;
            }
        }
    }

    /// End-of-run sweep: depth-first removal of every directory under the
    /// results root that has become empty. Runs only after the pool drains.
    pub fn sweep_empty_dirs(&self) {
        remove_empty_dirs_depth_first(&self.results_root, &self.results_root);
    }

    /// Remove baselines and result artifacts whose snapshot-relative path no
    /// longer corresponds to any discovered story (`update --clean`).
    pub fn clean_orphans(&self, valid_rel_paths: &BTreeSet<String>) {
        let mut removed = 0usize;
        for root in [&self.snapshot_root, &self.results_root] {
            let mut files = Vec::new();
            collect_files(root, root, &mut files);
            for rel in files {
                if rel.starts_with(TIMEOUT_DUMPS_DIR) {
                    continue;
                }
                let owner = owning_rel_path(&rel);
                if !valid_rel_paths.contains(owner.as_ref()) {
                    let path = root.join(&rel);
                    debug!(path = %path.display(), "removing orphaned artifact");
                    let _ = std::fs::remove_file(&path);
                    removed += 1;
                }
            }
            remove_empty_dirs_depth_first(root, root);
        }
        if removed > 0 {
            warn!(removed, "orphaned artifacts removed");
        }
    }
}

/// Join `rel` under `root`, lexically dropping anything that would escape
/// (`..`, absolute prefixes). Containment holds by construction.
fn join_contained(root: &Path, rel: &str) -> PathBuf {
    let mut out = root.to_path_buf();
    for component in Path::new(rel).components() {
        if let Component::Normal(part) = component {
            out.push(part);
        }
    }
    out
}

/// Path-prefix containment over normalized absolute paths: equal to the
/// root, or extending it at a separator boundary.
pub fn is_contained(root: &Path, path: &Path) -> bool {
    let Ok(root) = std::path::absolute(root) else {
        return false;
    };
    let Ok(path) = std::path::absolute(path) else {
        return false;
    };
    path == root || path.starts_with(&root)
}

/// `X.png` + suffix -> `X<suffix>` next to the original.
fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    path.with_file_name(format!("{stem}{suffix}"))
}

/// Numbered artifacts produced by a retried attempt.
fn is_retry_artifact(stem: &str, name: &str) -> bool {
    if let Some(rest) = name.strip_prefix("test-failed-") {
        return rest
            .strip_suffix(".png")
            .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()));
    }

    let Some(rest) = name.strip_prefix(stem).and_then(|r| r.strip_prefix('-')) else {
        return false;
    };
    for kind in ["actual", "diff", "expected"] {
        if let Some(n) = rest.strip_suffix(&format!("-{kind}.png"))
            && !n.is_empty()
            && n.chars().all(|c| c.is_ascii_digit())
        {
            return true;
        }
    }
    false
}

/// Recursively collect files under `dir` as root-relative path strings.
fn collect_files(root: &Path, dir: &Path, out: &mut Vec<String>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out);
        } else if let Ok(rel) = path.strip_prefix(root) {
            out.push(rel.to_string_lossy().replace('\\', "/"));
        }
    }
}

/// Map an artifact file back to the snapshot-relative path that owns it:
/// `X.diff.png` and `X-error.png` belong to `X.png`.
fn owning_rel_path(rel: &str) -> std::borrow::Cow<'_, str> {
    if let Some(base) = rel.strip_suffix(".diff.png") {
        return format!("{base}.png").into();
    }
    if let Some(base) = rel.strip_suffix("-error.png") {
        return format!("{base}.png").into();
    }
    rel.into()
}

/// Postorder removal of empty directories; `root` itself is kept.
fn remove_empty_dirs_depth_first(root: &Path, dir: &Path) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            remove_empty_dirs_depth_first(root, &path);
        }
    }
    if dir != root && std::fs::read_dir(dir).map_or(false, |mut e| e.next().is_none()) {
        let _ = std::fs::remove_dir(dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(dir: &Path, update: bool) -> ArtifactManager {
        ArtifactManager::new(&dir.join("baseline"), &dir.join("results"), update)
    }

    #[test]
    fn paths_are_rooted_per_mode() {
        let tmp = tempfile::tempdir().unwrap();
        let m = manager(tmp.path(), false);
        let rel = "Components/Button/Primary.png";
        assert_eq!(
            m.expected_path(rel),
            tmp.path().join("baseline/Components/Button/Primary.png")
        );
        assert_eq!(
            m.actual_path(rel),
            tmp.path().join("results/Components/Button/Primary.png")
        );
        assert_eq!(
            m.diff_path(rel),
            tmp.path().join("results/Components/Button/Primary.diff.png")
        );
    }

    #[test]
    fn update_mode_actual_is_the_baseline() {
        let tmp = tempfile::tempdir().unwrap();
        let m = manager(tmp.path(), true);
        let rel = "Button/Primary.png";
        assert_eq!(m.actual_path(rel), m.expected_path(rel));
    }

    #[test]
    fn traversal_components_cannot_escape_the_root() {
        let tmp = tempfile::tempdir().unwrap();
        let m = manager(tmp.path(), false);
        let escaped = m.expected_path("../../../etc/passwd.png");
        assert!(is_contained(&tmp.path().join("baseline"), &escaped));
    }

    #[test]
    fn containment_requires_a_separator_boundary() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("results");
        assert!(is_contained(&root, &root));
        assert!(is_contained(&root, &root.join("a/b.png")));
        let sneaky = tmp.path().join("results-evil/b.png");
        assert!(!is_contained(&root, &sneaky));
    }

    #[test]
    fn retry_artifact_names_recognized() {
        assert!(is_retry_artifact("Primary", "Primary-1-actual.png"));
        assert!(is_retry_artifact("Primary", "Primary-2-diff.png"));
        assert!(is_retry_artifact("Primary", "Primary-3-expected.png"));
        assert!(is_retry_artifact("Primary", "test-failed-1.png"));
        // Authoritative artifacts are never retry artifacts.
        assert!(!is_retry_artifact("Primary", "Primary.png"));
        assert!(!is_retry_artifact("Primary", "Primary-diff.png"));
        assert!(!is_retry_artifact("Primary", "Primary-error.png"));
        assert!(!is_retry_artifact("Primary", "Primary.diff.png"));
        // Other stories' artifacts in the same directory are untouched.
        assert!(!is_retry_artifact("Primary", "Hover-1-actual.png"));
    }

    #[test]
    fn clean_retry_artifacts_spares_authoritative_files() {
        let tmp = tempfile::tempdir().unwrap();
        let m = manager(tmp.path(), false);
        let dir = tmp.path().join("results/Button");
        std::fs::create_dir_all(&dir).unwrap();
        for name in [
            "Primary.png",
            "Primary.diff.png",
            "Primary-error.png",
            "Primary-1-actual.png",
            "Primary-1-diff.png",
            "test-failed-2.png",
        ] {
            std::fs::write(dir.join(name), b"png").unwrap();
        }

        m.clean_retry_artifacts("Button/Primary.png");

        assert!(dir.join("Primary.png").exists());
        assert!(dir.join("Primary.diff.png").exists());
        assert!(dir.join("Primary-error.png").exists());
        assert!(!dir.join("Primary-1-actual.png").exists());
        assert!(!dir.join("Primary-1-diff.png").exists());
        assert!(!dir.join("test-failed-2.png").exists());
    }

    #[test]
    fn clean_passing_removes_artifacts_and_prunes_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let m = manager(tmp.path(), false);
        let dir = tmp.path().join("results/Components/Button");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("Primary.png"), b"png").unwrap();
        std::fs::write(dir.join("Primary.diff.png"), b"png").unwrap();
        std::fs::write(dir.join("Primary-error.png"), b"png").unwrap();

        m.clean_passing("Components/Button/Primary.png");

        assert!(!dir.exists());
        assert!(!tmp.path().join("results/Components").exists());
        assert!(tmp.path().join("results").exists());
    }

    #[test]
    fn clean_passing_keeps_directories_with_other_stories() {
        let tmp = tempfile::tempdir().unwrap();
        let m = manager(tmp.path(), false);
        let dir = tmp.path().join("results/Button");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("Primary.png"), b"png").unwrap();
        std::fs::write(dir.join("Hover.png"), b"png").unwrap();

        m.clean_passing("Button/Primary.png");

        assert!(dir.exists());
        assert!(dir.join("Hover.png").exists());
    }

    #[test]
    fn sweep_removes_nested_empty_dirs_but_not_the_root() {
        let tmp = tempfile::tempdir().unwrap();
        let m = manager(tmp.path(), false);
        std::fs::create_dir_all(tmp.path().join("results/a/b/c")).unwrap();
        std::fs::create_dir_all(tmp.path().join("results/d")).unwrap();
        std::fs::write(tmp.path().join("results/d/kept.png"), b"png").unwrap();

        m.sweep_empty_dirs();

        assert!(!tmp.path().join("results/a").exists());
        assert!(tmp.path().join("results/d/kept.png").exists());
        assert!(tmp.path().join("results").exists());
    }

    #[test]
    fn orphan_cleanup_respects_the_valid_set_and_dumps() {
        let tmp = tempfile::tempdir().unwrap();
        let m = manager(tmp.path(), true);
        let baseline = tmp.path().join("baseline");
        let results = tmp.path().join("results");
        std::fs::create_dir_all(baseline.join("Button")).unwrap();
        std::fs::create_dir_all(results.join("Card")).unwrap();
        std::fs::create_dir_all(results.join(TIMEOUT_DUMPS_DIR)).unwrap();
        std::fs::write(baseline.join("Button/Primary.png"), b"png").unwrap();
        std::fs::write(baseline.join("Button/Gone.png"), b"png").unwrap();
        std::fs::write(results.join("Card/Gone.png"), b"png").unwrap();
        std::fs::write(results.join("Card/Gone.diff.png"), b"png").unwrap();
        std::fs::write(results.join(TIMEOUT_DUMPS_DIR).join("x.html"), b"<html>").unwrap();

        let valid: BTreeSet<String> = ["Button/Primary.png".to_string()].into();
        m.clean_orphans(&valid);

        assert!(baseline.join("Button/Primary.png").exists());
        assert!(!baseline.join("Button/Gone.png").exists());
        assert!(!results.join("Card").exists());
        assert!(results.join(TIMEOUT_DUMPS_DIR).join("x.html").exists());
    }

    #[tokio::test]
    async fn ensure_directory_creates_and_probes() {
        let tmp = tempfile::tempdir().unwrap();
        let m = manager(tmp.path(), false);
        let dir = tmp.path().join("results/deep/nested");
        m.ensure_directory(&dir).await.unwrap();
        assert!(dir.is_dir());
        // Second call over an existing directory is fine.
        m.ensure_directory(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn ensure_directory_rejects_a_file_in_the_way() {
        let tmp = tempfile::tempdir().unwrap();
        let m = manager(tmp.path(), false);
        let path = tmp.path().join("blocked");
        std::fs::write(&path, b"file").unwrap();
        assert!(m.ensure_directory(&path).await.is_err());
    }
}
