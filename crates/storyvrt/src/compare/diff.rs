use image::RgbaImage;

/// Maximum possible delta in YIQ color space (used by dify internally).
const MAX_YIQ_POSSIBLE_DELTA: f32 = 35215.0;

/// Per-pixel YIQ threshold: MAX_YIQ_POSSIBLE_DELTA * 0.1 * 0.1
const PIXEL_THRESHOLD: f32 = MAX_YIQ_POSSIBLE_DELTA * 0.1 * 0.1;

/// Why a comparison could not run. The baseline variant maps to the
/// "baseline corrupted" outcome; everything else is a generic comparator
/// failure.
#[derive(Debug, thiserror::Error)]
pub enum DiffError {
    #[error("could not load base image: {0}")]
    BadBaseline(String),
    #[error("could not load captured image: {0}")]
    BadCandidate(String),
}

pub struct PixelDiff {
    pub diff_pixels: u64,
    pub total_pixels: u64,
    /// Fraction of differing pixels in [0,1].
    pub score: f64,
    pub diff_image: Option<RgbaImage>,
    /// `Some((base_w, base_h, cand_w, cand_h))` when dimensions differ.
    pub dimension_mismatch: Option<(u32, u32, u32, u32)>,
}

impl PixelDiff {
    fn identical() -> Self {
        Self {
            diff_pixels: 0,
            total_pixels: 0,
            score: 0.0,
            diff_image: None,
            dimension_mismatch: None,
        }
    }
}

/// Two-phase comparison:
/// 1. Byte-identical check (memcmp)
/// 2. Perceptual diff via dify
///
/// Runs synchronously — call via `spawn_blocking`.
pub fn compare(baseline_png: &[u8], candidate_png: &[u8]) -> Result<PixelDiff, DiffError> {
    // Phase 1: byte-identical
    if baseline_png == candidate_png {
        return Ok(PixelDiff::identical());
    }

    // Phase 2: decode and diff
    let base = image::load_from_memory(baseline_png)
        .map_err(|e| DiffError::BadBaseline(e.to_string()))?
        .to_rgba8();

    let cand = image::load_from_memory(candidate_png)
        .map_err(|e| DiffError::BadCandidate(e.to_string()))?
        .to_rgba8();

    let dimension_mismatch = if base.dimensions() != cand.dimensions() {
        Some((base.width(), base.height(), cand.width(), cand.height()))
    } else {
        None
    };

    // Pad both images to the same canvas size if dimensions differ.
    // Fill colour is magenta (#FF00FF) so the size delta is obvious in the
    // diff overlay.
    let (base, cand) = if dimension_mismatch.is_some() {
        let max_w = base.width().max(cand.width());
        let max_h = base.height().max(cand.height());
        (pad_to(&base, max_w, max_h), pad_to(&cand, max_w, max_h))
    } else {
        (base, cand)
    };

    let total_pixels = (base.width() as u64) * (base.height() as u64);

    let output_base = Some(dify::cli::OutputImageBase::LeftImage);
    let block_out: Option<std::collections::HashSet<(u32, u32)>> = None;

    match dify::diff::get_results(
        base,
        cand,
        PIXEL_THRESHOLD,
        true, // detect anti-aliased
        Some(0.1),
        &output_base,
        &block_out,
    ) {
        Some((diff_count, diff_image)) => {
            let diff_pixels = diff_count.max(0) as u64;
            let score = if total_pixels > 0 {
                diff_pixels as f64 / total_pixels as f64
            } else {
                0.0
            };
            Ok(PixelDiff {
                diff_pixels,
                total_pixels,
                score,
                diff_image: Some(diff_image),
                dimension_mismatch,
            })
        }
        None => Ok(PixelDiff {
            diff_pixels: 0,
            total_pixels,
            score: 0.0,
            diff_image: None,
            dimension_mismatch,
        }),
    }
}

/// Paste `src` onto a magenta canvas of `w x h`, anchored at top-left.
fn pad_to(src: &RgbaImage, w: u32, h: u32) -> RgbaImage {
    let mut canvas = RgbaImage::from_pixel(w, h, image::Rgba([255, 0, 255, 255]));
    image::imageops::overlay(&mut canvas, src, 0, 0);
    canvas
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    /// Create a small test PNG with a solid fill.
    fn solid_png(w: u32, h: u32, color: Rgba<u8>) -> Vec<u8> {
        let img = RgbaImage::from_pixel(w, h, color);
        let mut buf = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    /// Decode, flip `n` scattered pixels to red, re-encode.
    fn with_pixel_diffs(png: &[u8], n: u32) -> Vec<u8> {
        let mut img = image::load_from_memory(png).unwrap().to_rgba8();
        let (w, h) = img.dimensions();
        for i in 0..n {
            let x = ((i as u64 * 7919) % w as u64) as u32;
            let y = ((i as u64 * 6271) % h as u64) as u32;
            img.put_pixel(x, y, Rgba([255, 0, 0, 255]));
        }
        let mut buf = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    #[test]
    fn identical_bytes_skip_decoding() {
        let png = solid_png(100, 100, Rgba([200, 200, 200, 255]));
        let r = compare(&png, &png).unwrap();
        assert_eq!(r.diff_pixels, 0);
        assert!(r.diff_image.is_none());
        assert!(r.dimension_mismatch.is_none());
    }

    #[test]
    fn pixel_diffs_detected_with_mask() {
        let baseline = solid_png(100, 100, Rgba([200, 200, 200, 255]));
        let candidate = with_pixel_diffs(&baseline, 50);
        let r = compare(&baseline, &candidate).unwrap();
        assert!(r.diff_pixels > 0);
        assert!(r.score > 0.0);
        assert!(r.diff_image.is_some());
    }

    #[test]
    fn score_is_ratio_of_diff_to_total() {
        let baseline = solid_png(100, 100, Rgba([200, 200, 200, 255]));
        let candidate = with_pixel_diffs(&baseline, 20);
        let r = compare(&baseline, &candidate).unwrap();
        let expected = r.diff_pixels as f64 / r.total_pixels as f64;
        assert!((r.score - expected).abs() < 1e-9);
    }

    #[test]
    fn sub_threshold_nudge_is_clean() {
        let a = solid_png(50, 50, Rgba([128, 128, 128, 255]));
        let mut img = image::load_from_memory(&a).unwrap().to_rgba8();
        // Nudge one pixel by 1 — below the YIQ threshold.
        img.put_pixel(0, 0, Rgba([129, 128, 128, 255]));
        let mut b = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut b), image::ImageFormat::Png)
            .unwrap();
        let r = compare(&a, &b).unwrap();
        assert_eq!(r.diff_pixels, 0);
    }

    #[test]
    fn dimension_mismatch_reported_and_padded() {
        let a = solid_png(10, 10, Rgba([200, 200, 200, 255]));
        let b = solid_png(10, 12, Rgba([200, 200, 200, 255]));
        let r = compare(&a, &b).unwrap();
        assert_eq!(r.dimension_mismatch, Some((10, 10, 10, 12)));
        // The 2-row padding area (magenta vs grey) produces diff pixels.
        assert!(r.diff_pixels > 0);
        assert_eq!(r.total_pixels, 120);
    }

    #[test]
    fn corrupt_baseline_is_a_typed_error() {
        let good = solid_png(10, 10, Rgba([0, 0, 0, 255]));
        let garbage = b"not a png".to_vec();
        assert!(matches!(
            compare(&garbage, &good),
            Err(DiffError::BadBaseline(_))
        ));
        assert!(matches!(
            compare(&good, &garbage),
            Err(DiffError::BadCandidate(_))
        ));
    }
}
