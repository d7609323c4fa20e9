pub mod diff;

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use tracing::debug;

use self::diff::DiffError;
use crate::capture::CaptureError;

/// Hard cap on one image comparison, including decode and mask encode.
const COMPARE_TIMEOUT: Duration = Duration::from_secs(30);

/// Verdict of a baseline-vs-actual comparison.
#[derive(Debug)]
pub enum Verdict {
    Match,
    Differ {
        diff_pixels: u64,
        /// Fraction of differing pixels in [0,1].
        diff_percentage: f64,
        dimension_mismatch: Option<(u32, u32, u32, u32)>,
    },
}

/// Wraps the pure pixel-diff with file I/O, the run threshold, a diff-mask
/// artifact, and a hard timeout.
pub struct ImageComparator {
    threshold: f64,
}

impl ImageComparator {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    /// Compare `expected` against `actual`, writing the diff mask to
    /// `diff_path` when they differ beyond the threshold.
    ///
    /// The caller guarantees `expected` exists; a file that exists but
    /// cannot be decoded maps to `BaselineCorrupted`.
    pub async fn compare_files(
        &self,
        expected: &Path,
        actual: &Path,
        diff_path: &Path,
    ) -> Result<Verdict, CaptureError> {
        let expected_png = std::fs::read(expected)
            .with_context(|| format!("Failed to read {}", expected.display()))
            .map_err(|e| CaptureError::BaselineCorrupted(format!("{e:#}")))?;
        let actual_png = std::fs::read(actual)
            .with_context(|| format!("Failed to read {}", actual.display()))
            .map_err(|e| CaptureError::Comparator(format!("{e:#}")))?;

        let result = tokio::time::timeout(
            COMPARE_TIMEOUT,
            tokio::task::spawn_blocking(move || diff::compare(&expected_png, &actual_png)),
        )
        .await
        .map_err(|_| {
            CaptureError::Comparator(format!(
                "comparison exceeded {}s",
                COMPARE_TIMEOUT.as_secs()
            ))
        })?
        .map_err(|e| CaptureError::Comparator(format!("comparison task panicked: {e}")))?;

        let pixel_diff = match result {
            Ok(d) => d,
            Err(e @ DiffError::BadBaseline(_)) => {
                return Err(CaptureError::BaselineCorrupted(e.to_string()));
            }
            Err(e) => return Err(CaptureError::Comparator(e.to_string())),
        };

        // A dimension change always fails, regardless of threshold: the
        // magenta padding would otherwise be averaged away on large images.
        let matches = pixel_diff.dimension_mismatch.is_none()
            && pixel_diff.score <= self.threshold;

        if matches {
            debug!(
                score = pixel_diff.score,
                threshold = self.threshold,
                total_pixels = pixel_diff.total_pixels,
                "comparison matched"
            );
            return Ok(Verdict::Match);
        }

        if let Some(ref mask) = pixel_diff.diff_image {
            let mut encoded = Vec::new();
            mask.write_to(&mut std::io::Cursor::new(&mut encoded), image::ImageFormat::Png)
                .map_err(|e| CaptureError::Comparator(format!("failed to encode diff: {e}")))?;
            std::fs::write(diff_path, encoded)
                .with_context(|| format!("Failed to write {}", diff_path.display()))
                .map_err(|e| CaptureError::Comparator(format!("{e:#}")))?;
        }

        Ok(Verdict::Differ {
            diff_pixels: pixel_diff.diff_pixels,
            diff_percentage: pixel_diff.score,
            dimension_mismatch: pixel_diff.dimension_mismatch,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn write_png(path: &Path, w: u32, h: u32, color: Rgba<u8>) {
        let img = RgbaImage::from_pixel(w, h, color);
        img.save(path).unwrap();
    }

    #[tokio::test]
    async fn identical_files_match() {
        let dir = tempfile::tempdir().unwrap();
        let expected = dir.path().join("expected.png");
        let actual = dir.path().join("actual.png");
        let diff = dir.path().join("actual.diff.png");
        write_png(&expected, 20, 20, Rgba([10, 20, 30, 255]));
        write_png(&actual, 20, 20, Rgba([10, 20, 30, 255]));

        let comparator = ImageComparator::new(0.0);
        let verdict = comparator.compare_files(&expected, &actual, &diff).await.unwrap();
        assert!(matches!(verdict, Verdict::Match));
        assert!(!diff.exists());
    }

    #[tokio::test]
    async fn differing_files_write_a_mask() {
        let dir = tempfile::tempdir().unwrap();
        let expected = dir.path().join("expected.png");
        let actual = dir.path().join("actual.png");
        let diff = dir.path().join("actual.diff.png");
        write_png(&expected, 20, 20, Rgba([255, 0, 0, 255]));
        write_png(&actual, 20, 20, Rgba([0, 0, 255, 255]));

        let comparator = ImageComparator::new(0.0);
        let verdict = comparator.compare_files(&expected, &actual, &diff).await.unwrap();
        match verdict {
            Verdict::Differ { diff_percentage, .. } => assert!(diff_percentage > 0.9),
            other => panic!("expected Differ, got {other:?}"),
        }
        assert!(diff.exists());
    }

    #[tokio::test]
    async fn threshold_tolerates_small_differences() {
        let dir = tempfile::tempdir().unwrap();
        let expected = dir.path().join("expected.png");
        let actual = dir.path().join("actual.png");
        let diff = dir.path().join("actual.diff.png");
        write_png(&expected, 100, 100, Rgba([200, 200, 200, 255]));
        // One fully different pixel out of 10,000.
        let mut img = RgbaImage::from_pixel(100, 100, Rgba([200, 200, 200, 255]));
        img.put_pixel(50, 50, Rgba([0, 0, 0, 255]));
        img.save(&actual).unwrap();

        let comparator = ImageComparator::new(0.01);
        let verdict = comparator.compare_files(&expected, &actual, &diff).await.unwrap();
        assert!(matches!(verdict, Verdict::Match));
    }

    #[tokio::test]
    async fn dimension_change_fails_even_under_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let expected = dir.path().join("expected.png");
        let actual = dir.path().join("actual.png");
        let diff = dir.path().join("actual.diff.png");
        write_png(&expected, 100, 100, Rgba([200, 200, 200, 255]));
        write_png(&actual, 100, 101, Rgba([200, 200, 200, 255]));

        let comparator = ImageComparator::new(0.5);
        let verdict = comparator.compare_files(&expected, &actual, &diff).await.unwrap();
        match verdict {
            Verdict::Differ {
                dimension_mismatch, ..
            } => assert_eq!(dimension_mismatch, Some((100, 100, 100, 101))),
            other => panic!("expected Differ, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn corrupt_baseline_maps_to_baseline_corrupted() {
        let dir = tempfile::tempdir().unwrap();
        let expected = dir.path().join("expected.png");
        let actual = dir.path().join("actual.png");
        let diff = dir.path().join("actual.diff.png");
        std::fs::write(&expected, b"truncated garbage").unwrap();
        write_png(&actual, 20, 20, Rgba([0, 0, 0, 255]));

        let comparator = ImageComparator::new(0.0);
        let err = comparator
            .compare_files(&expected, &actual, &diff)
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::BaselineCorrupted(_)));
    }
}
