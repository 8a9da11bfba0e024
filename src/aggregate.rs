//! Result aggregation: the colored segmentation raster and the final
//! `AnalysisResults` with terrain modifications and object placements.

use std::collections::HashMap;

use serde::Serialize;

use crate::classify::AnalyzedSegment;
use crate::geometry::BoundingBox;
use crate::raster::{Raster, RgbRaster};
use crate::segment::ImageSegment;
use crate::types::HeightConfig;

/// Hue step between consecutive segment colors (golden ratio conjugate).
const GOLDEN_RATIO_CONJUGATE: f32 = 0.618_033_99;
const SEGMENT_ALPHA: f32 = 0.8;
/// Earth tone terrain colors are blended toward.
const EARTH_TONE: [f32; 3] = [139.0, 115.0, 85.0];

/// Read-only terrain view derived from a terrain segment.
#[derive(Debug, Clone, Serialize)]
pub struct TerrainModification {
    pub bounds: BoundingBox,
    #[serde(skip)]
    pub height_map: Raster,
    pub base_height: f32,
    pub terrain_type: String,
    pub description: String,
    pub blend_radius: f32,
    pub slope: f32,
    pub roughness: f32,
}

/// Read-only placement view derived from a non-terrain segment.
/// `position` holds normalized map coordinates plus the estimated elevation.
#[derive(Debug, Clone, Serialize)]
pub struct ObjectPlacement {
    pub object_type: String,
    pub position: [f32; 3],
    pub rotation: f32,
    pub scale: f32,
    pub confidence: f32,
    pub bounding_box: BoundingBox,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Final pipeline output, immutable once returned.
#[derive(Debug)]
pub struct AnalysisResults {
    pub height_map: Raster,
    pub segmentation_map: RgbRaster,
    pub segments: Vec<ImageSegment>,
    pub terrain_modifications: Vec<TerrainModification>,
    pub object_placements: Vec<ObjectPlacement>,
    pub metadata: HashMap<String, serde_json::Value>,
}

pub fn terrain_modification(analyzed: &AnalyzedSegment, cfg: &HeightConfig) -> TerrainModification {
    let field = analyzed
        .height_map
        .clone()
        .unwrap_or_else(|| Raster::zeros(1, 1));
    TerrainModification {
        bounds: analyzed.segment.bounding_box.clone(),
        height_map: field,
        base_height: analyzed.estimated_height,
        terrain_type: analyzed.detailed_classification.clone(),
        description: describe(analyzed),
        blend_radius: cfg.blend_radius,
        slope: *analyzed.topology_features.get("slope").unwrap_or(&0.0),
        roughness: *analyzed.topology_features.get("roughness").unwrap_or(&0.0),
    }
}

pub fn object_placement(analyzed: &AnalyzedSegment) -> ObjectPlacement {
    let (nx, ny) = analyzed.normalized_position;
    ObjectPlacement {
        object_type: analyzed.object_type.clone(),
        position: [nx, ny, analyzed.estimated_height],
        rotation: analyzed.estimated_rotation,
        scale: analyzed.estimated_scale,
        confidence: analyzed.placement_confidence,
        bounding_box: analyzed.segment.bounding_box.clone(),
        metadata: analyzed.metadata.clone(),
    }
}

/// Human-readable segment description; the enhanced text replaces this when
/// the enhancement service answered in time.
pub fn describe(analyzed: &AnalyzedSegment) -> String {
    analyzed.enhanced_description.clone().unwrap_or_else(|| {
        let (nx, ny) = analyzed.normalized_position;
        format!(
            "{} at ({:.2}, {:.2}), confidence {:.2}",
            analyzed.detailed_classification, nx, ny, analyzed.classification_confidence
        )
    })
}

/// Paint every segment's box region with a unique golden-ratio-stepped color.
/// Overlapping regions are overwritten by later segments, not blended.
pub fn segmentation_map(width: usize, height: usize, segments: &[AnalyzedSegment]) -> RgbRaster {
    let mut map = RgbRaster::zeros(width, height);
    for (index, analyzed) in segments.iter().enumerate() {
        let color = segment_color(index, analyzed.is_terrain);
        let bbox = &analyzed.segment.bounding_box;
        let x0 = bbox.x.max(0.0) as usize;
        let y0 = bbox.y.max(0.0) as usize;
        let x1 = (bbox.right().ceil().max(0.0) as usize).min(width);
        let y1 = (bbox.bottom().ceil().max(0.0) as usize).min(height);
        for y in y0..y1 {
            for x in x0..x1 {
                let existing = map.get(x, y);
                let mut px = [0u8; 3];
                for c in 0..3 {
                    px[c] = (color[c] * SEGMENT_ALPHA + existing[c] as f32 * (1.0 - SEGMENT_ALPHA))
                        .round()
                        .clamp(0.0, 255.0) as u8;
                }
                map.set(x, y, px);
            }
        }
    }
    map
}

/// Unique hue per index; terrain colors pull 30% toward an earth tone.
pub fn segment_color(index: usize, is_terrain: bool) -> [f32; 3] {
    let hue = (index as f32 * GOLDEN_RATIO_CONJUGATE).fract();
    let mut rgb = hsv_to_rgb(hue, 0.7, 0.9);
    if is_terrain {
        for c in 0..3 {
            rgb[c] = rgb[c] * 0.7 + EARTH_TONE[c] * 0.3;
        }
    }
    rgb
}

fn hsv_to_rgb(h: f32, s: f32, v: f32) -> [f32; 3] {
    let i = (h * 6.0).floor();
    let f = h * 6.0 - i;
    let p = v * (1.0 - s);
    let q = v * (1.0 - f * s);
    let t = v * (1.0 - (1.0 - f) * s);
    let (r, g, b) = match (i as i32).rem_euclid(6) {
        0 => (v, t, p),
        1 => (q, v, p),
        2 => (p, v, t),
        3 => (p, q, v),
        4 => (t, p, v),
        _ => (v, p, q),
    };
    [r * 255.0, g * 255.0, b * 255.0]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::rect_mask;

    fn analyzed(x: f32, y: f32, w: f32, h: f32, is_terrain: bool) -> AnalyzedSegment {
        let bbox = BoundingBox::new(x, y, w, h);
        let mut a = AnalyzedSegment::new(ImageSegment {
            id: 0,
            mask: rect_mask(&bbox),
            bounding_box: bbox,
            confidence: 0.9,
            class_name: "tree".to_string(),
            class_id: 0,
            area: w * h,
            is_terrain,
            metadata: HashMap::new(),
        });
        a.normalized_position = (0.5, 0.5);
        a
    }

    #[test]
    fn consecutive_segment_colors_differ() {
        let a = segment_color(0, false);
        let b = segment_color(1, false);
        let diff: f32 = (0..3).map(|c| (a[c] - b[c]).abs()).sum();
        assert!(diff > 10.0);
    }

    #[test]
    fn hue_stepping_wraps_into_unit_interval() {
        for i in 0..100 {
            let hue = (i as f32 * GOLDEN_RATIO_CONJUGATE).fract();
            assert!((0.0..1.0).contains(&hue));
        }
    }

    #[test]
    fn later_segment_overwrites_overlap_region() {
        let segments = vec![
            analyzed(0.0, 0.0, 16.0, 16.0, false),
            analyzed(8.0, 8.0, 16.0, 16.0, false),
        ];
        let map = segmentation_map(32, 32, &segments);

        // a pixel only the second segment covers
        let second_only = map.get(20, 20);
        // an overlap pixel carries the second segment's color over the first
        let overlap = map.get(10, 10);
        let first_only = map.get(2, 2);
        assert_ne!(overlap, first_only);
        // overlap matches second-only up to the residual alpha contribution
        for c in 0..3 {
            assert!((overlap[c] as i32 - second_only[c] as i32).abs() <= 60);
        }
    }

    #[test]
    fn uncovered_pixels_stay_background() {
        let segments = vec![analyzed(0.0, 0.0, 4.0, 4.0, false)];
        let map = segmentation_map(32, 32, &segments);
        assert_eq!(map.get(20, 20), [0, 0, 0]);
    }

    #[test]
    fn placement_carries_pose_and_elevation() {
        let mut a = analyzed(10.0, 10.0, 20.0, 20.0, false);
        a.estimated_height = 3.5;
        a.estimated_rotation = 30.0;
        a.estimated_scale = 1.2;
        a.placement_confidence = 0.6;
        let p = object_placement(&a);
        assert_eq!(p.position, [0.5, 0.5, 3.5]);
        assert_eq!(p.rotation, 30.0);
        assert_eq!(p.scale, 1.2);
    }

    #[test]
    fn terrain_modification_copies_topology() {
        let mut a = analyzed(0.0, 0.0, 16.0, 16.0, true);
        a.detailed_classification = "mountain".to_string();
        a.estimated_height = 70.0;
        a.topology_features.insert("slope".to_string(), 12.0);
        a.topology_features.insert("roughness".to_string(), 4.0);
        a.height_map = Some(Raster::filled(8, 8, 0.7));

        let cfg = HeightConfig::default();
        let m = terrain_modification(&a, &cfg);
        assert_eq!(m.terrain_type, "mountain");
        assert_eq!(m.base_height, 70.0);
        assert_eq!(m.slope, 12.0);
        assert_eq!(m.blend_radius, cfg.blend_radius);
        assert!(m.description.contains("mountain"));
    }
}
