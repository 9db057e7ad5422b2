//! Pixel-level helpers shared by the detectors.
//!
//! All routines work on `GrayImage` (8-bit luminance). Ink masks use 255 for
//! ink and 0 for background.

use std::path::Path;

use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, Luma};

use super::error::{DecodeFailure, VerificationError};
use super::segmenter::BoundingBox;

/// Largest page we are willing to decode (A3 at 600 dpi is ~70 MP).
const MAX_PAGE_PIXELS: u64 = 80_000_000;

// ═══════════════════════════════════════════════════════════
// Decoding
// ═══════════════════════════════════════════════════════════

/// Decode a scanned page from disk.
///
/// Only decoder limit failures are transient. Oversized and unreadable pages
/// are skippable.
pub fn decode_page(path: &Path) -> Result<DynamicImage, VerificationError> {
    let (w, h) = image::image_dimensions(path).map_err(|e| decode_error(path, e))?;
    check_page_budget(path, w, h)?;
    image::open(path).map_err(|e| decode_error(path, e))
}

fn check_page_budget(path: &Path, w: u32, h: u32) -> Result<(), VerificationError> {
    if u64::from(w) * u64::from(h) > MAX_PAGE_PIXELS {
        return Err(VerificationError::ImageDecode {
            path: path.to_path_buf(),
            kind: DecodeFailure::Oversized,
            reason: format!("{w}x{h} exceeds the page pixel budget"),
        });
    }
    Ok(())
}

fn decode_error(path: &Path, err: image::ImageError) -> VerificationError {
    let kind = match &err {
        image::ImageError::Limits(_) => DecodeFailure::Limits,
        _ => DecodeFailure::Unreadable,
    };
    VerificationError::ImageDecode {
        path: path.to_path_buf(),
        kind,
        reason: err.to_string(),
    }
}

// ═══════════════════════════════════════════════════════════
// Masks
// ═══════════════════════════════════════════════════════════

/// Mark every pixel darker than `threshold` as ink.
pub fn ink_mask(gray: &GrayImage, threshold: u8) -> GrayImage {
    let mut mask = GrayImage::new(gray.width(), gray.height());
    for (x, y, p) in gray.enumerate_pixels() {
        if p.0[0] < threshold {
            mask.put_pixel(x, y, Luma([255]));
        }
    }
    mask
}

/// Keep only the part of `mask` below `vertical` (fraction of height) and
/// between `start` and `end` (fractions of width). Everything else is cleared.
pub fn band_mask(mask: &GrayImage, vertical: f64, start: f64, end: f64) -> GrayImage {
    let (w, h) = mask.dimensions();
    let top = (f64::from(h) * vertical) as u32;
    let left = (f64::from(w) * start) as u32;
    let right = ((f64::from(w) * end) as u32).min(w);
    let mut out = GrayImage::new(w, h);
    for y in top.min(h)..h {
        for x in left.min(right)..right {
            out.put_pixel(x, y, *mask.get_pixel(x, y));
        }
    }
    out
}

/// Paint everything above `vertical` and left of `horizontal` white.
pub fn whiten_outside_corner(gray: &GrayImage, horizontal: f64, vertical: f64) -> GrayImage {
    let (w, h) = gray.dimensions();
    let top = (f64::from(h) * vertical) as u32;
    let left = (f64::from(w) * horizontal) as u32;
    let mut out = gray.clone();
    for (x, y, p) in out.enumerate_pixels_mut() {
        if y < top || x < left {
            *p = Luma([255]);
        }
    }
    out
}

/// Copy `bbox` grown by `margin` out of `mask`. Out-of-bounds pixels are 0.
pub fn crop_with_margin(mask: &GrayImage, bbox: &BoundingBox, margin: u32) -> GrayImage {
    let m = margin as i32;
    let out_w = (bbox.w.max(0) + 2 * m) as u32;
    let out_h = (bbox.h.max(0) + 2 * m) as u32;
    let mut out = GrayImage::new(out_w, out_h);
    let (mw, mh) = (mask.width() as i32, mask.height() as i32);
    for oy in 0..out_h as i32 {
        let sy = bbox.y - m + oy;
        if sy < 0 || sy >= mh {
            continue;
        }
        for ox in 0..out_w as i32 {
            let sx = bbox.x - m + ox;
            if sx < 0 || sx >= mw {
                continue;
            }
            out.put_pixel(ox as u32, oy as u32, *mask.get_pixel(sx as u32, sy as u32));
        }
    }
    out
}

// ═══════════════════════════════════════════════════════════
// Connected components
// ═══════════════════════════════════════════════════════════

/// One 8-connected blob of ink.
#[derive(Debug, Clone, PartialEq)]
pub struct Component {
    pub label: u32,
    pub bbox: BoundingBox,
    pub area: u32,
}

/// Label the 8-connected ink components of `mask`.
///
/// Returns the label image (0 = background) and one `Component` per label,
/// in raster discovery order.
pub fn label_components(mask: &GrayImage) -> (Vec<u32>, Vec<Component>) {
    let (w, h) = (mask.width() as usize, mask.height() as usize);
    let mut labels = vec![0u32; w * h];
    let mut components = Vec::new();
    let mut stack: Vec<usize> = Vec::new();

    for start in 0..w * h {
        if labels[start] != 0 || mask.as_raw()[start] == 0 {
            continue;
        }
        let label = components.len() as u32 + 1;
        labels[start] = label;
        stack.push(start);

        let (mut min_x, mut min_y, mut max_x, mut max_y) = (w, h, 0usize, 0usize);
        let mut area = 0u32;

        while let Some(idx) = stack.pop() {
            let (x, y) = (idx % w, idx / w);
            area += 1;
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);

            for dy in -1i64..=1 {
                for dx in -1i64..=1 {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    let nx = x as i64 + dx;
                    let ny = y as i64 + dy;
                    if nx < 0 || ny < 0 || nx >= w as i64 || ny >= h as i64 {
                        continue;
                    }
                    let n = ny as usize * w + nx as usize;
                    if labels[n] == 0 && mask.as_raw()[n] != 0 {
                        labels[n] = label;
                        stack.push(n);
                    }
                }
            }
        }

        components.push(Component {
            label,
            bbox: BoundingBox::new(
                min_x as i32,
                min_y as i32,
                (max_x - min_x + 1) as i32,
                (max_y - min_y + 1) as i32,
            ),
            area,
        });
    }

    (labels, components)
}

/// Rebuild a mask keeping only components whose label passes `keep`.
pub fn mask_from_labels(
    width: u32,
    height: u32,
    labels: &[u32],
    keep: impl Fn(u32) -> bool,
) -> GrayImage {
    let mut out = GrayImage::new(width, height);
    for (i, &label) in labels.iter().enumerate() {
        if label != 0 && keep(label) {
            let x = (i % width as usize) as u32;
            let y = (i / width as usize) as u32;
            out.put_pixel(x, y, Luma([255]));
        }
    }
    out
}

// ═══════════════════════════════════════════════════════════
// Geometry
// ═══════════════════════════════════════════════════════════

/// Rotate around the image centre (nearest neighbour), filling with `fill`.
pub fn rotate_about_center(gray: &GrayImage, degrees: f64, fill: u8) -> GrayImage {
    if degrees == 0.0 {
        return gray.clone();
    }
    let (w, h) = gray.dimensions();
    let (cx, cy) = (f64::from(w) / 2.0, f64::from(h) / 2.0);
    let (sin, cos) = degrees.to_radians().sin_cos();
    let mut out = GrayImage::from_pixel(w, h, Luma([fill]));
    for y in 0..h {
        for x in 0..w {
            let dx = f64::from(x) - cx;
            let dy = f64::from(y) - cy;
            // Inverse mapping: where does this output pixel come from?
            let sx = cos * dx + sin * dy + cx;
            let sy = -sin * dx + cos * dy + cy;
            if sx >= 0.0 && sy >= 0.0 && sx < f64::from(w) && sy < f64::from(h) {
                out.put_pixel(x, y, *gray.get_pixel(sx as u32, sy as u32));
            }
        }
    }
    out
}

/// Shrink by an integer factor. Factor 1 returns a copy.
pub fn downscale(gray: &GrayImage, factor: u32) -> GrayImage {
    if factor <= 1 {
        return gray.clone();
    }
    let w = (gray.width() / factor).max(1);
    let h = (gray.height() / factor).max(1);
    image::imageops::resize(gray, w, h, FilterType::Triangle)
}

/// Best zero-mean normalised cross-correlation of `template` over `page`.
///
/// Returns a score in [-1, 1]; `None` when the template does not fit or is flat.
pub fn best_correlation(page: &GrayImage, template: &GrayImage) -> Option<f64> {
    best_match(page, template).map(|(score, _, _)| score)
}

/// Like `best_correlation`, with the top-left corner of the best window.
pub fn best_match(page: &GrayImage, template: &GrayImage) -> Option<(f64, u32, u32)> {
    let (pw, ph) = page.dimensions();
    let (tw, th) = template.dimensions();
    if tw == 0 || th == 0 || tw > pw || th > ph {
        return None;
    }

    let n = f64::from(tw * th);
    let t_mean = template.pixels().map(|p| f64::from(p.0[0])).sum::<f64>() / n;
    let t_dev: Vec<f64> = template.pixels().map(|p| f64::from(p.0[0]) - t_mean).collect();
    let t_norm = t_dev.iter().map(|d| d * d).sum::<f64>().sqrt();
    if t_norm == 0.0 {
        return None;
    }

    let mut best: Option<(f64, u32, u32)> = None;
    for oy in 0..=(ph - th) {
        for ox in 0..=(pw - tw) {
            let mut sum = 0.0;
            for ty in 0..th {
                for tx in 0..tw {
                    sum += f64::from(page.get_pixel(ox + tx, oy + ty).0[0]);
                }
            }
            let p_mean = sum / n;
            let mut cross = 0.0;
            let mut p_sq = 0.0;
            for ty in 0..th {
                for tx in 0..tw {
                    let p = f64::from(page.get_pixel(ox + tx, oy + ty).0[0]) - p_mean;
                    cross += p * t_dev[(ty * tw + tx) as usize];
                    p_sq += p * p;
                }
            }
            if p_sq == 0.0 {
                continue;
            }
            let score = cross / (p_sq.sqrt() * t_norm);
            if best.map_or(true, |(b, _, _)| score > b) {
                best = Some((score, ox, oy));
            }
        }
    }
    best
}

/// Paint the `w` x `h` window at (`x`, `y`) white, clamped to the image.
pub fn whiten_rect(gray: &mut GrayImage, x: u32, y: u32, w: u32, h: u32) {
    let x1 = x.saturating_add(w).min(gray.width());
    let y1 = y.saturating_add(h).min(gray.height());
    for yy in y.min(y1)..y1 {
        for xx in x.min(x1)..x1 {
            gray.put_pixel(xx, yy, Luma([255]));
        }
    }
}

/// Percentage of pixels at or below `threshold` inside `bbox` (clamped).
pub fn dark_pixel_percentage(gray: &GrayImage, bbox: &BoundingBox, threshold: u8) -> f64 {
    let x0 = bbox.x.max(0) as u32;
    let y0 = bbox.y.max(0) as u32;
    let x1 = ((bbox.x + bbox.w).max(0) as u32).min(gray.width());
    let y1 = ((bbox.y + bbox.h).max(0) as u32).min(gray.height());
    if x1 <= x0 || y1 <= y0 {
        return 0.0;
    }
    let mut dark = 0u64;
    for y in y0..y1 {
        for x in x0..x1 {
            if gray.get_pixel(x, y).0[0] <= threshold {
                dark += 1;
            }
        }
    }
    let total = u64::from(x1 - x0) * u64::from(y1 - y0);
    dark as f64 / total as f64 * 100.0
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// White page with dark filled rectangles `(x, y, w, h)`.
    pub(crate) fn page_with_blocks(w: u32, h: u32, blocks: &[(u32, u32, u32, u32)]) -> GrayImage {
        let mut img = GrayImage::from_pixel(w, h, Luma([255]));
        for &(bx, by, bw, bh) in blocks {
            for y in by..by + bh {
                for x in bx..bx + bw {
                    img.put_pixel(x, y, Luma([20]));
                }
            }
        }
        img
    }

    #[test]
    fn ink_mask_marks_dark_pixels() {
        let page = page_with_blocks(10, 10, &[(2, 2, 3, 3)]);
        let mask = ink_mask(&page, 210);
        assert_eq!(mask.get_pixel(3, 3).0[0], 255);
        assert_eq!(mask.get_pixel(0, 0).0[0], 0);
        assert_eq!(mask.pixels().filter(|p| p.0[0] == 255).count(), 9);
    }

    #[test]
    fn components_found_with_boxes() {
        let page = page_with_blocks(50, 50, &[(1, 1, 5, 4), (20, 30, 10, 10)]);
        let (labels, comps) = label_components(&ink_mask(&page, 128));
        assert_eq!(comps.len(), 2);
        assert_eq!(comps[0].bbox, BoundingBox::new(1, 1, 5, 4));
        assert_eq!(comps[0].area, 20);
        assert_eq!(comps[1].bbox, BoundingBox::new(20, 30, 10, 10));
        assert_eq!(labels.iter().filter(|&&l| l == 2).count(), 100);
    }

    #[test]
    fn diagonal_pixels_are_connected() {
        let mut mask = GrayImage::new(4, 4);
        mask.put_pixel(0, 0, Luma([255]));
        mask.put_pixel(1, 1, Luma([255]));
        mask.put_pixel(2, 2, Luma([255]));
        let (_, comps) = label_components(&mask);
        assert_eq!(comps.len(), 1);
        assert_eq!(comps[0].bbox, BoundingBox::new(0, 0, 3, 3));
    }

    #[test]
    fn band_mask_clears_outside() {
        let mask = ink_mask(&page_with_blocks(100, 100, &[(0, 0, 100, 100)]), 128);
        let band = band_mask(&mask, 0.5, 0.2, 0.6);
        assert_eq!(band.get_pixel(30, 70).0[0], 255);
        assert_eq!(band.get_pixel(30, 10).0[0], 0);
        assert_eq!(band.get_pixel(10, 70).0[0], 0);
        assert_eq!(band.get_pixel(70, 70).0[0], 0);
    }

    #[test]
    fn crop_with_margin_pads_outside() {
        let mask = ink_mask(&page_with_blocks(20, 20, &[(0, 0, 5, 5)]), 128);
        let crop = crop_with_margin(&mask, &BoundingBox::new(0, 0, 5, 5), 3);
        assert_eq!(crop.dimensions(), (11, 11));
        assert_eq!(crop.get_pixel(0, 0).0[0], 0);
        assert_eq!(crop.get_pixel(3, 3).0[0], 255);
    }

    #[test]
    fn rotation_by_zero_is_identity() {
        let page = page_with_blocks(20, 10, &[(2, 2, 4, 4)]);
        assert_eq!(rotate_about_center(&page, 0.0, 255), page);
    }

    #[test]
    fn rotation_by_180_moves_block_to_opposite_corner() {
        let page = page_with_blocks(20, 20, &[(0, 0, 4, 4)]);
        let rotated = rotate_about_center(&page, 180.0, 255);
        assert_eq!(rotated.get_pixel(18, 18).0[0], 20);
        assert_eq!(rotated.get_pixel(1, 1).0[0], 255);
    }

    #[test]
    fn correlation_finds_exact_template() {
        let page = page_with_blocks(40, 40, &[(10, 12, 6, 3), (25, 25, 2, 8)]);
        let template = image::imageops::crop_imm(&page, 8, 10, 10, 7).to_image();
        let score = best_correlation(&page, &template).unwrap();
        assert!(score > 0.99, "score {score}");
    }

    #[test]
    fn best_match_reports_window_origin() {
        let page = page_with_blocks(40, 40, &[(10, 12, 6, 3), (25, 25, 2, 8)]);
        let template = image::imageops::crop_imm(&page, 8, 10, 10, 7).to_image();
        let (_, x, y) = best_match(&page, &template).unwrap();
        assert_eq!((x, y), (8, 10));
    }

    #[test]
    fn whiten_rect_is_clamped() {
        let mut page = page_with_blocks(10, 10, &[(0, 0, 10, 10)]);
        whiten_rect(&mut page, 8, 8, 5, 5);
        assert_eq!(page.get_pixel(9, 9).0[0], 255);
        assert_eq!(page.get_pixel(7, 7).0[0], 20);
    }

    #[test]
    fn correlation_rejects_oversized_or_flat_template() {
        let page = page_with_blocks(10, 10, &[]);
        assert!(best_correlation(&page, &GrayImage::new(20, 2)).is_none());
        assert!(best_correlation(&page, &GrayImage::new(3, 3)).is_none());
    }

    #[test]
    fn dark_percentage_inside_box() {
        let page = page_with_blocks(10, 10, &[(0, 0, 5, 10)]);
        let pct = dark_pixel_percentage(&page, &BoundingBox::new(0, 0, 10, 10), 220);
        assert!((pct - 50.0).abs() < 1e-9);
    }

    #[test]
    fn whiten_outside_corner_keeps_bottom_right() {
        let page = page_with_blocks(10, 10, &[(0, 0, 10, 10)]);
        let out = whiten_outside_corner(&page, 0.5, 0.5);
        assert_eq!(out.get_pixel(7, 7).0[0], 20);
        assert_eq!(out.get_pixel(2, 7).0[0], 255);
        assert_eq!(out.get_pixel(7, 2).0[0], 255);
    }

    #[test]
    fn decode_missing_file_is_decode_error() {
        let err = decode_page(Path::new("/definitely/not/here.jpg")).unwrap_err();
        assert!(matches!(
            err,
            VerificationError::ImageDecode { kind: DecodeFailure::Unreadable, .. }
        ));
        assert!(!err.is_transient());
    }

    #[test]
    fn page_over_pixel_budget_is_skippable() {
        let err = check_page_budget(Path::new("big.jpg"), 20_000, 20_000).unwrap_err();
        assert!(matches!(
            err,
            VerificationError::ImageDecode { kind: DecodeFailure::Oversized, .. }
        ));
        assert!(!err.is_transient());
        assert!(check_page_budget(Path::new("a4.jpg"), 2480, 3508).is_ok());
    }
}
