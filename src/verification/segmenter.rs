//! Region segmentation: fold candidate ink boxes into signature regions.
//!
//! Input is a binary mask (255 = ink). Output is a list of merged regions,
//! each with its own crop of the mask. Stateless; nothing outlives a call.

use image::GrayImage;
use serde::{Deserialize, Serialize};

use super::config::CropperConfig;
use super::imaging;

/// Candidate boxes at or above this area are page furniture, not signatures.
const MAX_REGION_AREA: i64 = 100_000;

/// Candidate boxes must be taller than this.
const MIN_REGION_HEIGHT: i32 = 30;

// ═══════════════════════════════════════════
// Geometry
// ═══════════════════════════════════════════

/// Axis-aligned box. Coordinates may go negative after margin growth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl BoundingBox {
    pub fn new(x: i32, y: i32, w: i32, h: i32) -> Self {
        Self { x, y, w, h }
    }

    pub fn area(&self) -> i64 {
        i64::from(self.w) * i64::from(self.h)
    }

    /// Inclusive overlap test: touching edges count as intersecting.
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        !(self.y > other.y + other.h
            || self.y + self.h < other.y
            || self.x > other.x + other.w
            || self.x + self.w < other.x)
    }

    /// Inclusive overlap of the x-spans only.
    pub fn shares_x_span(&self, other: &BoundingBox) -> bool {
        !(self.x > other.x + other.w || self.x + self.w < other.x)
    }

    /// Smallest box covering both.
    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        let w = self
            .w
            .max(other.w)
            .max(other.x + other.w - self.x)
            .max(self.x + self.w - other.x);
        let h = self
            .h
            .max(other.h)
            .max(other.y + other.h - self.y)
            .max(self.y + self.h - other.y);
        BoundingBox::new(x, y, w, h)
    }

    /// Shift the origin in by `floor(min(w, h) * ratio)` and shrink by the same.
    pub fn inset(&self, ratio: f64) -> BoundingBox {
        let border = (f64::from(self.w.min(self.h)) * ratio).floor() as i32;
        BoundingBox::new(
            self.x + border,
            self.y + border,
            self.w - border,
            self.h - border,
        )
    }

    /// Grow origin out by `margin` and size by `margin`.
    pub fn grow(&self, margin: i32) -> BoundingBox {
        BoundingBox::new(self.x - margin, self.y - margin, self.w + margin, self.h + margin)
    }
}

/// A merged signature candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    pub id: usize,
    pub bbox: BoundingBox,
    /// Crop of the input mask around `bbox`, padded by the crop margin.
    pub mask: GrayImage,
}

// ═══════════════════════════════════════════
// Segmenter
// ═══════════════════════════════════════════

#[derive(Debug, Clone, Default)]
pub struct RegionSegmenter {
    config: CropperConfig,
}

impl RegionSegmenter {
    pub fn new(config: CropperConfig) -> Self {
        Self { config }
    }

    /// Find, merge and crop the signature regions of `mask`.
    pub fn segment(&self, mask: &GrayImage) -> Vec<Region> {
        let boxes = self.candidate_boxes(mask);
        let mut regions = self.merge_boxes(&boxes);
        if self.config.clean_y_axis {
            regions = keep_one_per_lane(regions);
        }

        regions
            .into_iter()
            .map(|(id, bbox)| Region {
                id,
                bbox,
                mask: imaging::crop_with_margin(mask, &bbox, self.config.crop_margin),
            })
            .collect()
    }

    /// Bounding boxes of the ink components that could be signatures,
    /// largest first.
    pub fn candidate_boxes(&self, mask: &GrayImage) -> Vec<BoundingBox> {
        let (img_w, img_h) = (mask.width() as i32, mask.height() as i32);
        let min_area = i64::from(self.config.min_region_size);
        let margin = self.config.increase_box_margin as i32;

        let (_, components) = imaging::label_components(mask);
        let mut boxes: Vec<BoundingBox> = components
            .into_iter()
            .map(|c| c.bbox)
            .filter(|b| {
                let area = b.area();
                area > min_area
                    && area < MAX_REGION_AREA
                    && b.h < img_h
                    && b.w < img_w
                    && b.h > MIN_REGION_HEIGHT
            })
            .map(|b| b.grow(margin))
            .collect();

        boxes.sort_by(|a, b| b.area().cmp(&a.area()));
        boxes
    }

    /// Fold boxes into regions in order. A box merges into the first region
    /// it touches; otherwise it opens a new region. Every merge, and every
    /// region opened after the first, is inset by the border ratio.
    pub fn merge_boxes(&self, boxes: &[BoundingBox]) -> Vec<(usize, BoundingBox)> {
        let ratio = self.config.border_ratio;
        let mut regions: Vec<(usize, BoundingBox)> = Vec::with_capacity(boxes.len());

        for bbox in boxes {
            if regions.is_empty() {
                regions.push((0, *bbox));
                continue;
            }
            match regions.iter_mut().find(|(_, r)| bbox.intersects(r)) {
                Some((_, region)) => *region = region.union(bbox).inset(ratio),
                None => {
                    let id = regions.len();
                    regions.push((id, bbox.inset(ratio)));
                }
            }
        }
        regions
    }
}

/// Keep the largest region of every group sharing an x-span ("lane").
///
/// Greedy: take the first remaining region as the lane holder, sweep the rest,
/// swap in any larger region that shares its span, and drop every region the
/// sweep touched.
pub fn keep_one_per_lane(regions: Vec<(usize, BoundingBox)>) -> Vec<(usize, BoundingBox)> {
    let mut pending: Vec<(usize, BoundingBox)> = regions.clone();
    let mut keep: Vec<usize> = Vec::new();

    while !pending.is_empty() {
        let mut holder = pending.remove(0);
        pending.retain(|candidate| {
            if !candidate.1.shares_x_span(&holder.1) {
                return true;
            }
            if candidate.1.area() > holder.1.area() {
                holder = *candidate;
            }
            false
        });
        keep.push(holder.0);
    }

    regions
        .into_iter()
        .filter(|(id, _)| keep.contains(id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verification::imaging::tests::page_with_blocks;
    use image::Luma;
    use proptest::prelude::*;

    fn segmenter() -> RegionSegmenter {
        RegionSegmenter::new(CropperConfig::default())
    }

    fn mask_of(w: u32, h: u32, blocks: &[(u32, u32, u32, u32)]) -> GrayImage {
        imaging::ink_mask(&page_with_blocks(w, h, blocks), 128)
    }

    #[test]
    fn touching_boxes_intersect() {
        let a = BoundingBox::new(0, 0, 10, 10);
        let b = BoundingBox::new(10, 10, 5, 5);
        let c = BoundingBox::new(11, 0, 5, 5);
        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
    }

    #[test]
    fn union_covers_both() {
        let a = BoundingBox::new(0, 0, 10, 10);
        let b = BoundingBox::new(5, 8, 20, 4);
        assert_eq!(a.union(&b), BoundingBox::new(0, 0, 25, 12));
        assert_eq!(b.union(&a), BoundingBox::new(0, 0, 25, 12));
    }

    #[test]
    fn inset_uses_floor_of_short_side() {
        let b = BoundingBox::new(10, 10, 100, 50);
        assert_eq!(b.inset(0.1), BoundingBox::new(15, 15, 95, 45));
        assert_eq!(b.inset(0.0), b);
    }

    #[test]
    fn candidate_filter_applies_size_and_height() {
        // 60x40 ok; 200x20 too flat; 20x20 too small; 400x300 too large.
        let mask = mask_of(
            1000,
            1000,
            &[(10, 10, 60, 40), (100, 100, 200, 20), (400, 400, 20, 20), (500, 500, 400, 300)],
        );
        let boxes = segmenter().candidate_boxes(&mask);
        assert_eq!(boxes, vec![BoundingBox::new(10, 10, 60, 40)]);
    }

    #[test]
    fn candidates_sorted_by_area_descending() {
        let mask = mask_of(1000, 1000, &[(10, 10, 40, 40), (200, 200, 100, 50)]);
        let boxes = segmenter().candidate_boxes(&mask);
        assert_eq!(boxes[0], BoundingBox::new(200, 200, 100, 50));
        assert_eq!(boxes[1], BoundingBox::new(10, 10, 40, 40));
    }

    #[test]
    fn overlapping_boxes_merge_into_first_region() {
        let boxes = vec![
            BoundingBox::new(0, 0, 100, 50),
            BoundingBox::new(500, 0, 40, 40),
            BoundingBox::new(90, 10, 30, 60),
        ];
        let regions = segmenter().merge_boxes(&boxes);
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0], (0, BoundingBox::new(0, 0, 120, 70)));
        assert_eq!(regions[1], (1, BoundingBox::new(500, 0, 40, 40)));
    }

    #[test]
    fn first_region_is_not_inset() {
        let seg = RegionSegmenter::new(CropperConfig {
            border_ratio: 0.1,
            ..CropperConfig::default()
        });
        let boxes = vec![BoundingBox::new(0, 0, 100, 100), BoundingBox::new(300, 0, 50, 50)];
        let regions = seg.merge_boxes(&boxes);
        assert_eq!(regions[0].1, BoundingBox::new(0, 0, 100, 100));
        assert_eq!(regions[1].1, BoundingBox::new(305, 5, 45, 45));
    }

    #[test]
    fn lane_cleaning_keeps_largest_in_span() {
        let regions = vec![
            (0, BoundingBox::new(0, 0, 100, 40)),
            (1, BoundingBox::new(20, 200, 150, 60)),
            (2, BoundingBox::new(400, 0, 50, 50)),
        ];
        let kept = keep_one_per_lane(regions);
        assert_eq!(
            kept,
            vec![
                (1, BoundingBox::new(20, 200, 150, 60)),
                (2, BoundingBox::new(400, 0, 50, 50)),
            ]
        );
    }

    #[test]
    fn segment_crops_with_margin() {
        let mask = mask_of(1000, 1000, &[(300, 300, 120, 60)]);
        let regions = segmenter().segment(&mask);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].id, 0);
        assert_eq!(regions[0].bbox, BoundingBox::new(300, 300, 120, 60));
        assert_eq!(regions[0].mask.dimensions(), (220, 160));
        assert_eq!(regions[0].mask.get_pixel(50, 50), &Luma([255]));
        assert_eq!(regions[0].mask.get_pixel(10, 10), &Luma([0]));
    }

    #[test]
    fn segment_without_lane_cleaning_keeps_stacked_regions() {
        let mask = mask_of(1000, 1000, &[(100, 100, 100, 40), (110, 500, 100, 40)]);
        let cleaned = segmenter().segment(&mask);
        assert_eq!(cleaned.len(), 1);

        let seg = RegionSegmenter::new(CropperConfig {
            clean_y_axis: false,
            ..CropperConfig::default()
        });
        assert_eq!(seg.segment(&mask).len(), 2);
    }

    #[test]
    fn empty_mask_has_no_regions() {
        assert!(segmenter().segment(&GrayImage::new(100, 100)).is_empty());
    }

    fn arb_box() -> impl Strategy<Value = BoundingBox> {
        (0i32..500, 0i32..500, 1i32..200, 1i32..200)
            .prop_map(|(x, y, w, h)| BoundingBox::new(x, y, w, h))
    }

    proptest! {
        #[test]
        fn union_never_shrinks(a in arb_box(), b in arb_box()) {
            let u = a.union(&b);
            prop_assert!(u.area() >= a.area());
            prop_assert!(u.area() >= b.area());
        }

        #[test]
        fn merge_never_adds_regions(boxes in prop::collection::vec(arb_box(), 0..30)) {
            let regions = segmenter().merge_boxes(&boxes);
            prop_assert!(regions.len() <= boxes.len());
            let cleaned = keep_one_per_lane(regions.clone());
            prop_assert!(cleaned.len() <= regions.len());
        }
    }
}
