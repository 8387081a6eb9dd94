//! Bitmap enhancement applied before decoding rasterized pages.
//!
//! Embedded images skip this stage: they are usually print quality already, and thresholding
//! can damage the fine modules of dense 2-D symbols.

use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, Luma};
use imageproc::contrast::otsu_level;
use imageproc::edges::canny;
use imageproc::filter::gaussian_blur_f32;
use imageproc::geometric_transformations::{rotate_about_center, Interpolation};
use imageproc::hough::{detect_lines, LineDetectionOptions};

/// Skew below this angle (degrees) is left alone
pub const SKEW_THRESHOLD_DEGREES: f32 = 0.5;

/// Lines tilted further than this from horizontal are not page rules or text baselines
const MAX_SKEW_DEGREES: u32 = 15;

/// Skew is estimated on a copy no wider than this
const SKEW_ESTIMATE_MAX_SIDE: u32 = 1000;

const UNSHARP_SIGMA: f32 = 1.0;
const UNSHARP_AMOUNT: f32 = 0.5;

/// Grayscale, Otsu binarization, light unsharp mask, then deskew.
pub fn enhance(bitmap: &DynamicImage) -> GrayImage {
    let gray = bitmap.to_luma8();
    let binary = binarize(&gray);
    let sharpened = unsharp_mask(&binary, UNSHARP_SIGMA, UNSHARP_AMOUNT);

    match estimate_skew(&gray) {
        Some(angle) if angle.abs() > SKEW_THRESHOLD_DEGREES => {
            log::debug!("[Preprocess] correcting {:.1}° skew", angle);
            deskew(&sharpened, angle)
        }
        _ => sharpened,
    }
}

/// Global threshold at the Otsu level
pub fn binarize(gray: &GrayImage) -> GrayImage {
    let level = otsu_level(gray);
    let mut out = gray.clone();
    for pixel in out.pixels_mut() {
        pixel.0[0] = if pixel.0[0] > level { 255 } else { 0 };
    }
    out
}

/// `original + amount * (original - blurred)`, clamped
pub fn unsharp_mask(gray: &GrayImage, sigma: f32, amount: f32) -> GrayImage {
    let blurred = gaussian_blur_f32(gray, sigma);
    let mut out = gray.clone();
    for (pixel, soft) in out.pixels_mut().zip(blurred.pixels()) {
        let original = pixel.0[0] as f32;
        let value = original + amount * (original - soft.0[0] as f32);
        pixel.0[0] = value.round().clamp(0.0, 255.0) as u8;
    }
    out
}

/// Estimate page skew in degrees from near-horizontal lines.
///
/// Positive means content slopes down to the right. Returns `None` when no usable lines are
/// found.
pub fn estimate_skew(gray: &GrayImage) -> Option<f32> {
    let (width, height) = gray.dimensions();
    if width < 16 || height < 16 {
        return None;
    }

    let longest = width.max(height);
    let small = if longest > SKEW_ESTIMATE_MAX_SIDE {
        let scale = SKEW_ESTIMATE_MAX_SIDE as f32 / longest as f32;
        let w = ((width as f32 * scale).round() as u32).max(1);
        let h = ((height as f32 * scale).round() as u32).max(1);
        imageops::resize(gray, w, h, FilterType::Triangle)
    } else {
        gray.clone()
    };

    let edges = canny(&small, 50.0, 100.0);
    let options = LineDetectionOptions {
        vote_threshold: (small.width() / 3).max(10),
        suppression_radius: 8,
    };

    // Hough angles are those of the line normal; a horizontal line has a 90° normal
    let mut skews: Vec<f32> = detect_lines(&edges, options)
        .into_iter()
        .filter(|line| line.angle_in_degrees.abs_diff(90) <= MAX_SKEW_DEGREES)
        .map(|line| line.angle_in_degrees as f32 - 90.0)
        .collect();

    if skews.is_empty() {
        return None;
    }
    skews.sort_by(f32::total_cmp);
    Some(skews[skews.len() / 2])
}

/// Rotate so that content sloping by `skew_degrees` becomes level
pub fn deskew(gray: &GrayImage, skew_degrees: f32) -> GrayImage {
    rotate_about_center(
        gray,
        -skew_degrees.to_radians(),
        Interpolation::Bilinear,
        Luma([255]),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_with_rules(width: u32, height: u32) -> GrayImage {
        let mut img = GrayImage::from_pixel(width, height, Luma([230]));
        for y in (40..height - 40).step_by(60) {
            for dy in 0..4 {
                for x in 20..width - 20 {
                    img.put_pixel(x, y + dy, Luma([20]));
                }
            }
        }
        img
    }

    #[test]
    fn binarize_produces_two_levels() {
        let mut img = GrayImage::from_pixel(20, 20, Luma([200]));
        for x in 0..10 {
            for y in 0..20 {
                img.put_pixel(x, y, Luma([40]));
            }
        }
        let out = binarize(&img);
        assert!(out.pixels().all(|p| p.0[0] == 0 || p.0[0] == 255));
        assert_eq!(out.get_pixel(0, 0).0[0], 0);
        assert_eq!(out.get_pixel(19, 19).0[0], 255);
    }

    #[test]
    fn unsharp_mask_keeps_flat_regions() {
        let img = GrayImage::from_pixel(12, 12, Luma([128]));
        let out = unsharp_mask(&img, 1.0, 0.5);
        assert!(out.pixels().all(|p| p.0[0] == 128));
    }

    #[test]
    fn level_page_needs_no_rotation() {
        let img = page_with_rules(400, 400);
        let skew = estimate_skew(&img).unwrap_or(0.0);
        assert!(skew.abs() <= SKEW_THRESHOLD_DEGREES, "skew {skew}");
    }

    #[test]
    fn rotated_page_is_leveled() {
        for tilt in [3.0_f32, -3.0] {
            let tilted = deskew(&page_with_rules(400, 400), -tilt);
            let before = estimate_skew(&tilted).unwrap_or(0.0);
            assert!(before.abs() > SKEW_THRESHOLD_DEGREES, "tilt {tilt}: measured {before}");

            let leveled = enhance(&DynamicImage::ImageLuma8(tilted));
            let after = estimate_skew(&leveled).unwrap_or(0.0);
            assert!(after.abs() <= SKEW_THRESHOLD_DEGREES, "tilt {tilt}: {before} -> {after}");
        }
    }

    #[test]
    fn blank_page_has_no_skew_estimate() {
        let img = GrayImage::from_pixel(300, 300, Luma([255]));
        assert_eq!(estimate_skew(&img), None);
    }

    #[test]
    fn enhance_is_deterministic_and_keeps_dimensions() {
        let img = DynamicImage::ImageLuma8(page_with_rules(320, 240));
        let a = enhance(&img);
        let b = enhance(&img);
        assert_eq!(a.dimensions(), (320, 240));
        assert_eq!(a, b);
    }

    #[test]
    fn deskew_keeps_dimensions() {
        let img = page_with_rules(200, 150);
        assert_eq!(deskew(&img, 3.0).dimensions(), (200, 150));
    }
}
