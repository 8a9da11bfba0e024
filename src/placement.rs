//! Placement estimation for non-terrain segments: normalized position,
//! area-derived scale, principal-axis rotation, and a plausibility-penalized
//! confidence score.

use nalgebra::Matrix2;
use serde_json::json;
use tracing::debug;

use crate::classify::AnalyzedSegment;
use crate::raster::Raster;
use crate::types::PlacementConfig;

pub struct PlacementEstimator<'a> {
    cfg: &'a PlacementConfig,
}

impl<'a> PlacementEstimator<'a> {
    pub fn new(cfg: &'a PlacementConfig) -> Self {
        Self { cfg }
    }

    pub fn estimate(&self, img_w: usize, img_h: usize, analyzed: &mut AnalyzedSegment) {
        let bbox = &analyzed.segment.bounding_box;
        let (cx, cy) = bbox.center();
        analyzed.normalized_position = (
            (cx / img_w.max(1) as f32).clamp(0.0, 1.0),
            (cy / img_h.max(1) as f32).clamp(0.0, 1.0),
        );

        let image_area = (img_w * img_h).max(1) as f32;
        let area_ratio = (bbox.area() / image_area).clamp(0.0, 1.0);
        analyzed.estimated_scale = self.scale_from_area(area_ratio);

        let (rotation, elongation) = principal_axis_rotation(&analyzed.segment.mask);
        analyzed.estimated_rotation = rotation;
        analyzed.features.insert("elongation".to_string(), elongation);

        let area_factor = self.area_plausibility(area_ratio);
        let aspect_factor = aspect_plausibility(bbox.aspect_ratio());
        analyzed.placement_confidence = (analyzed.segment.confidence
            * analyzed.classification_confidence
            * area_factor
            * aspect_factor)
            .clamp(0.0, 1.0);

        analyzed
            .metadata
            .insert("area_factor".to_string(), json!(area_factor));
        analyzed
            .metadata
            .insert("aspect_factor".to_string(), json!(aspect_factor));

        debug!(
            segment = analyzed.segment.id,
            rotation,
            scale = analyzed.estimated_scale,
            confidence = analyzed.placement_confidence,
            "placement estimated"
        );
    }

    /// Monotonic map from area ratio to scale, linear between the configured
    /// bounds; larger boxes map to larger scale, never unbounded.
    fn scale_from_area(&self, area_ratio: f32) -> f32 {
        let t = (area_ratio / self.cfg.reference_area_ratio).clamp(0.0, 1.0);
        self.cfg.min_scale + (self.cfg.max_scale - self.cfg.min_scale) * t
    }

    /// Penalizes boxes whose area is orders of magnitude away from the
    /// reference; one-decade deviation costs a third of the factor.
    fn area_plausibility(&self, area_ratio: f32) -> f32 {
        if area_ratio <= 0.0 {
            return 0.0;
        }
        let r = area_ratio / self.cfg.reference_area_ratio;
        (1.0 - r.log10().abs() / 3.0).clamp(0.0, 1.0)
    }
}

/// Penalizes boxes far from square: 1.0 for a square, 0.5 at aspect 3:1.
fn aspect_plausibility(aspect_ratio: f32) -> f32 {
    if aspect_ratio <= 0.0 {
        return 0.0;
    }
    let a = aspect_ratio.max(1.0 / aspect_ratio);
    (2.0 / (a + 1.0)).clamp(0.0, 1.0)
}

/// Orientation of the mask's foreground pixel set via eigen-decomposition of
/// the 2x2 position covariance. Returns (degrees in [-90, 90), elongation =
/// sqrt of the eigenvalue ratio). Fewer than 2 foreground pixels yields 0.
pub fn principal_axis_rotation(mask: &Raster) -> (f32, f32) {
    let mut n = 0usize;
    let mut sum_x = 0.0f64;
    let mut sum_y = 0.0f64;
    for y in 0..mask.height {
        for x in 0..mask.width {
            if mask.get(x, y) >= 0.5 {
                n += 1;
                sum_x += x as f64;
                sum_y += y as f64;
            }
        }
    }
    if n < 2 {
        return (0.0, 1.0);
    }

    let mean_x = sum_x / n as f64;
    let mean_y = sum_y / n as f64;
    let mut sxx = 0.0f64;
    let mut sxy = 0.0f64;
    let mut syy = 0.0f64;
    for y in 0..mask.height {
        for x in 0..mask.width {
            if mask.get(x, y) >= 0.5 {
                let dx = x as f64 - mean_x;
                let dy = y as f64 - mean_y;
                sxx += dx * dx;
                sxy += dx * dy;
                syy += dy * dy;
            }
        }
    }
    sxx /= n as f64;
    sxy /= n as f64;
    syy /= n as f64;

    let eigen = Matrix2::new(sxx, sxy, sxy, syy).symmetric_eigen();
    let (major, minor) = if eigen.eigenvalues[0] >= eigen.eigenvalues[1] {
        (0, 1)
    } else {
        (1, 0)
    };
    let axis = eigen.eigenvectors.column(major);
    let mut angle = (axis[1].atan2(axis[0])).to_degrees();
    // Principal axes are undirected; fold into [-90, 90).
    while angle >= 90.0 {
        angle -= 180.0;
    }
    while angle < -90.0 {
        angle += 180.0;
    }

    let l_major = eigen.eigenvalues[major].max(1e-9);
    let l_minor = eigen.eigenvalues[minor].max(1e-9);
    let elongation = (l_major / l_minor).sqrt() as f32;
    (angle as f32, elongation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::BoundingBox;
    use crate::segment::{rect_mask, ImageSegment};
    use std::collections::HashMap;

    fn analyzed_with_box(x: f32, y: f32, w: f32, h: f32) -> AnalyzedSegment {
        let bbox = BoundingBox::new(x, y, w, h);
        AnalyzedSegment::new(ImageSegment {
            id: 0,
            mask: rect_mask(&bbox),
            bounding_box: bbox,
            confidence: 0.9,
            class_name: "tree".to_string(),
            class_id: 0,
            area: w * h,
            is_terrain: false,
            metadata: HashMap::new(),
        })
    }

    #[test]
    fn normalized_position_is_box_center_over_image_size() {
        let cfg = PlacementConfig::default();
        let mut analyzed = analyzed_with_box(10.0, 10.0, 20.0, 20.0);
        PlacementEstimator::new(&cfg).estimate(64, 64, &mut analyzed);
        let (nx, ny) = analyzed.normalized_position;
        assert!((nx - 20.0 / 64.0).abs() < 1e-5);
        assert!((ny - 20.0 / 64.0).abs() < 1e-5);
    }

    #[test]
    fn scale_is_monotonic_and_bounded() {
        let cfg = PlacementConfig::default();
        let est = PlacementEstimator::new(&cfg);
        let small = est.scale_from_area(0.001);
        let mid = est.scale_from_area(0.02);
        let huge = est.scale_from_area(0.9);
        assert!(small < mid);
        assert!(mid < huge);
        assert!((huge - cfg.max_scale).abs() < 1e-6);
        assert!(small >= cfg.min_scale);
    }

    #[test]
    fn diagonal_mask_rotates_to_45_degrees() {
        let mut mask = Raster::zeros(16, 16);
        for i in 0..16 {
            mask.set(i, i, 1.0);
        }
        let (angle, elongation) = principal_axis_rotation(&mask);
        assert!((angle.abs() - 45.0).abs() < 1.0);
        assert!(elongation > 3.0);
    }

    #[test]
    fn rotation_is_invariant_under_180_degree_flip() {
        let mut mask = Raster::zeros(16, 16);
        for i in 0..16 {
            mask.set(i, i / 2, 1.0);
        }
        let mut flipped = Raster::zeros(16, 16);
        for y in 0..16 {
            for x in 0..16 {
                if mask.get(x, y) >= 0.5 {
                    flipped.set(15 - x, 15 - y, 1.0);
                }
            }
        }
        let (a, _) = principal_axis_rotation(&mask);
        let (b, _) = principal_axis_rotation(&flipped);
        let diff = (a - b).abs() % 180.0;
        assert!(diff < 1e-3 || (180.0 - diff) < 1e-3);
    }

    #[test]
    fn too_few_foreground_pixels_give_zero_rotation() {
        let mut mask = Raster::zeros(8, 8);
        mask.set(3, 3, 1.0);
        let (angle, _) = principal_axis_rotation(&mask);
        assert_eq!(angle, 0.0);
    }

    #[test]
    fn confidence_is_penalized_for_extreme_boxes() {
        let cfg = PlacementConfig::default();
        let est = PlacementEstimator::new(&cfg);

        // typical box
        let mut typical = analyzed_with_box(20.0, 20.0, 14.0, 14.0);
        typical.classification_confidence = 1.0;
        est.estimate(64, 64, &mut typical);

        // one-pixel sliver
        let mut sliver = analyzed_with_box(0.0, 0.0, 64.0, 1.0);
        sliver.classification_confidence = 1.0;
        est.estimate(64, 64, &mut sliver);

        assert!(typical.placement_confidence > sliver.placement_confidence);
        assert!(sliver.placement_confidence >= 0.0);
        assert!(typical.placement_confidence <= 1.0);
    }
}
