//! Terrain height estimation and the global height raster.
//!
//! Terrain segments get a normalized per-pixel height field from the
//! regression model, or a coherent-noise field layered on a per-type base
//! height when no model is loaded. Slope and roughness derive from the field;
//! all terrain fields then blend into one global raster with a max-combine
//! rule, so later segments only ever raise already-written terrain.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::classify::AnalyzedSegment;
use crate::engine::{AnalysisError, InferenceEngine, ModelKind};
use crate::geometry::BoundingBox;
use crate::raster::{Raster, RgbRaster};
use crate::types::HeightConfig;

pub struct HeightEstimator<'a, E> {
    engine: &'a E,
    cfg: &'a HeightConfig,
    /// Square resolution of per-segment height fields.
    field_size: usize,
}

impl<'a, E: InferenceEngine> HeightEstimator<'a, E> {
    pub fn new(engine: &'a E, cfg: &'a HeightConfig, field_size: usize) -> Self {
        Self {
            engine,
            cfg,
            field_size,
        }
    }

    /// Attach a height field, absolute height and topology features to a
    /// terrain segment. Returns true when the heuristic fallback produced
    /// the field.
    pub async fn estimate(&self, image: &RgbRaster, analyzed: &mut AnalyzedSegment) -> bool {
        let (field, estimated_height, fallback) = match self.model_field(image, analyzed).await {
            Ok(field) => {
                let height = field.mean() * self.cfg.max_terrain_height;
                (field, height, false)
            }
            Err(err) => {
                if !matches!(err, AnalysisError::ModelUnavailable(_)) {
                    warn!(segment = analyzed.segment.id, %err, "height regression failed, using heuristic field");
                }
                let (field, height) = self.heuristic_field(analyzed);
                (field, height, true)
            }
        };

        let slope = self.mean_slope_degrees(&field);
        let roughness = self.mean_roughness(&field);

        analyzed.topology_features = HashMap::from([
            ("slope".to_string(), slope),
            ("roughness".to_string(), roughness),
            ("elevation".to_string(), estimated_height),
        ]);
        analyzed.estimated_height = estimated_height;
        analyzed.height_map = Some(field);

        debug!(
            segment = analyzed.segment.id,
            estimated_height, slope, roughness, fallback, "terrain height estimated"
        );
        fallback
    }

    async fn model_field(
        &self,
        image: &RgbRaster,
        analyzed: &AnalyzedSegment,
    ) -> Result<Raster, AnalysisError> {
        if !self.engine.is_available(ModelKind::HeightRegression) {
            return Err(AnalysisError::ModelUnavailable(ModelKind::HeightRegression));
        }

        let crop = image.crop(&analyzed.segment.bounding_box);
        if crop.is_empty() {
            return Err(AnalysisError::SegmentExtractionFailure(format!(
                "segment {} box lies outside the image",
                analyzed.segment.id
            )));
        }
        let input = crop
            .resize(self.field_size, self.field_size)
            .to_tensor()
            .into_dyn();
        let outputs = self.engine.infer(ModelKind::HeightRegression, &[input]).await?;
        let tensor = outputs
            .first()
            .ok_or_else(|| AnalysisError::InferenceFailure("height model returned no tensors".into()))?;

        let shape = tensor.shape().to_vec();
        if tensor.ndim() != 3 || shape[0] != 1 || shape[1] == 0 || shape[2] == 0 {
            return Err(AnalysisError::TensorShapeMismatch {
                expected: "[1, h, w]".to_string(),
                got: shape,
            });
        }
        let (h, w) = (shape[1], shape[2]);
        let mut field = Raster::from_vec(w, h, tensor.iter().copied().collect()).ok_or_else(|| {
            AnalysisError::InferenceFailure("height tensor element count does not match its shape".into())
        })?;
        field.clamp_values(0.0, 1.0);
        Ok(field)
    }

    /// Per-type base height with bounded jitter, plus 2-octave value noise.
    /// Deterministic in structure for a given segment id.
    fn heuristic_field(&self, analyzed: &AnalyzedSegment) -> (Raster, f32) {
        let seed = (analyzed.segment.id as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
        let base = base_height_for(&analyzed.detailed_classification);
        let jitter = (hash_unit(seed, 0, 0) - 0.5) * 0.2; // +-10%
        let height = base * (1.0 + jitter);

        let base_norm = (height / self.cfg.max_terrain_height).clamp(0.0, 1.0);
        let n = self.field_size.max(2);
        let mut field = Raster::zeros(n, n);
        for y in 0..n {
            for x in 0..n {
                let fx = x as f32 / n as f32;
                let fy = y as f32 / n as f32;
                let noise = value_noise(fx * 4.0, fy * 4.0, seed) * 0.2
                    + value_noise(fx * 8.0, fy * 8.0, seed ^ 0xA5A5) * 0.1;
                field.set(x, y, (base_norm + noise - 0.15).clamp(0.0, 1.0));
            }
        }
        (field, height)
    }

    /// Mean arctangent of adjacent-pixel height differences, in degrees.
    /// Heights scale by the vertical size, the step by meters-per-pixel.
    fn mean_slope_degrees(&self, field: &Raster) -> f32 {
        if field.width < 2 || field.height < 2 {
            return 0.0;
        }
        let meters_per_px = self.cfg.terrain_size / field.width as f32;
        let mut sum = 0.0f32;
        let mut count = 0usize;
        for y in 0..field.height {
            for x in 0..field.width {
                if x + 1 < field.width {
                    let dz = (field.get(x + 1, y) - field.get(x, y)).abs() * self.cfg.max_terrain_height;
                    sum += (dz / meters_per_px).atan();
                    count += 1;
                }
                if y + 1 < field.height {
                    let dz = (field.get(x, y + 1) - field.get(x, y)).abs() * self.cfg.max_terrain_height;
                    sum += (dz / meters_per_px).atan();
                    count += 1;
                }
            }
        }
        if count == 0 {
            0.0
        } else {
            (sum / count as f32).to_degrees()
        }
    }

    /// Mean absolute second-neighbor difference scaled by the vertical size.
    fn mean_roughness(&self, field: &Raster) -> f32 {
        if field.width < 3 || field.height < 3 {
            return 0.0;
        }
        let mut sum = 0.0f32;
        let mut count = 0usize;
        for y in 0..field.height {
            for x in 0..field.width {
                if x + 2 < field.width {
                    sum += (field.get(x + 2, y) - field.get(x, y)).abs();
                    count += 1;
                }
                if y + 2 < field.height {
                    sum += (field.get(x, y + 2) - field.get(x, y)).abs();
                    count += 1;
                }
            }
        }
        if count == 0 {
            0.0
        } else {
            sum / count as f32 * self.cfg.max_terrain_height
        }
    }
}

/// Fixed base heights (meters) per terrain type for the no-model fallback.
fn base_height_for(terrain_type: &str) -> f32 {
    let lower = terrain_type.to_ascii_lowercase();
    if lower.contains("mountain") {
        75.0
    } else if lower.contains("rock") {
        30.0
    } else if lower.contains("hill") {
        20.0
    } else if lower.contains("forest") || lower.contains("tree") {
        10.0
    } else if lower.contains("water") || lower.contains("lake") || lower.contains("river") {
        -2.0
    } else if lower.contains("sand") || lower.contains("desert") {
        4.0
    } else if lower.contains("grass") || lower.contains("plain") || lower.contains("terrain") {
        3.0
    } else {
        2.5
    }
}

/// Global height raster with max-combine writes.
pub struct HeightBlender {
    raster: Raster,
}

impl HeightBlender {
    /// Start from a low flat base.
    pub fn new(width: usize, height: usize, base_level: f32) -> Self {
        Self {
            raster: Raster::filled(width, height, base_level),
        }
    }

    /// Write a segment's field into the raster at its box offset. Existing
    /// terrain is only ever raised (`combined = max(existing, segment)`);
    /// out-of-bounds pixels are clipped.
    pub fn blend(&mut self, field: &Raster, bbox: &BoundingBox) {
        let w = bbox.width.round().max(1.0) as usize;
        let h = bbox.height.round().max(1.0) as usize;
        let resized = field.resize(w, h);

        let x0 = bbox.x.round() as i64;
        let y0 = bbox.y.round() as i64;
        for sy in 0..h {
            let ty = y0 + sy as i64;
            if ty < 0 || ty >= self.raster.height as i64 {
                continue;
            }
            for sx in 0..w {
                let tx = x0 + sx as i64;
                if tx < 0 || tx >= self.raster.width as i64 {
                    continue;
                }
                let existing = self.raster.get(tx as usize, ty as usize);
                let value = resized.get(sx, sy);
                if value > existing {
                    self.raster.set(tx as usize, ty as usize, value);
                }
            }
        }
    }

    pub fn into_raster(self) -> Raster {
        self.raster
    }
}

/// 2D value noise in [0, 1]: hashed lattice values with smoothstep blending.
fn value_noise(x: f32, y: f32, seed: u64) -> f32 {
    let xi = x.floor() as i64;
    let yi = y.floor() as i64;
    let tx = smoothstep(x - xi as f32);
    let ty = smoothstep(y - yi as f32);

    let v00 = hash_unit(seed, xi, yi);
    let v10 = hash_unit(seed, xi + 1, yi);
    let v01 = hash_unit(seed, xi, yi + 1);
    let v11 = hash_unit(seed, xi + 1, yi + 1);

    let top = v00 * (1.0 - tx) + v10 * tx;
    let bot = v01 * (1.0 - tx) + v11 * tx;
    top * (1.0 - ty) + bot * ty
}

fn smoothstep(t: f32) -> f32 {
    t * t * (3.0 - 2.0 * t)
}

fn hash_unit(seed: u64, x: i64, y: i64) -> f32 {
    let mut h = seed
        .wrapping_add((x as u64).wrapping_mul(0x8DA6_B343))
        .wrapping_add((y as u64).wrapping_mul(0xD816_3841));
    h ^= h >> 33;
    h = h.wrapping_mul(0xFF51_AFD7_ED55_8CCD);
    h ^= h >> 33;
    ((h >> 33) & 0x7FFF_FFFF) as f32 / (0x8000_0000u32 as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::NullEngine;
    use crate::segment::{rect_mask, ImageSegment};

    fn terrain_segment(id: usize, class_name: &str) -> AnalyzedSegment {
        let bbox = BoundingBox::new(4.0, 4.0, 16.0, 16.0);
        let mut analyzed = AnalyzedSegment::new(ImageSegment {
            id,
            mask: rect_mask(&bbox),
            bounding_box: bbox,
            confidence: 0.8,
            class_name: class_name.to_string(),
            class_id: 0,
            area: 256.0,
            is_terrain: true,
            metadata: HashMap::new(),
        });
        analyzed.detailed_classification = class_name.to_string();
        analyzed
    }

    #[tokio::test(flavor = "current_thread")]
    async fn fallback_field_is_deterministic_and_bounded() {
        let cfg = HeightConfig::default();
        let estimator = HeightEstimator::new(&NullEngine, &cfg, 32);
        let image = RgbRaster::filled(64, 64, [100, 100, 100]);

        let mut a = terrain_segment(3, "mountain");
        let mut b = terrain_segment(3, "mountain");
        assert!(estimator.estimate(&image, &mut a).await);
        assert!(estimator.estimate(&image, &mut b).await);

        let fa = a.height_map.as_ref().unwrap();
        let fb = b.height_map.as_ref().unwrap();
        assert_eq!(fa, fb);
        for &v in fa.data() {
            assert!((0.0..=1.0).contains(&v));
        }
        // mountain base 75 with +-10% jitter
        assert!(a.estimated_height > 67.0 && a.estimated_height < 83.0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn water_fallback_height_is_negative() {
        let cfg = HeightConfig::default();
        let estimator = HeightEstimator::new(&NullEngine, &cfg, 16);
        let image = RgbRaster::filled(64, 64, [0, 0, 200]);

        let mut seg = terrain_segment(1, "water");
        estimator.estimate(&image, &mut seg).await;
        assert!(seg.estimated_height < 0.0);
        assert_eq!(seg.topology_features["elevation"], seg.estimated_height);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn topology_features_are_populated() {
        let cfg = HeightConfig::default();
        let estimator = HeightEstimator::new(&NullEngine, &cfg, 32);
        let image = RgbRaster::filled(64, 64, [100, 100, 100]);

        let mut seg = terrain_segment(0, "hill");
        estimator.estimate(&image, &mut seg).await;
        assert!(seg.topology_features.contains_key("slope"));
        assert!(seg.topology_features.contains_key("roughness"));
        assert!(seg.topology_features["slope"] >= 0.0);
    }

    #[test]
    fn flat_field_has_zero_slope_and_roughness() {
        let cfg = HeightConfig::default();
        let estimator = HeightEstimator::new(&NullEngine, &cfg, 16);
        let field = Raster::filled(16, 16, 0.4);
        assert_eq!(estimator.mean_slope_degrees(&field), 0.0);
        assert_eq!(estimator.mean_roughness(&field), 0.0);
    }

    #[test]
    fn blend_never_lowers_written_terrain() {
        let mut blender = HeightBlender::new(32, 32, 0.05);
        let high = Raster::filled(8, 8, 0.8);
        let low = Raster::filled(8, 8, 0.3);

        blender.blend(&high, &BoundingBox::new(4.0, 4.0, 8.0, 8.0));
        blender.blend(&low, &BoundingBox::new(4.0, 4.0, 8.0, 8.0));

        let raster = blender.into_raster();
        for y in 4..12 {
            for x in 4..12 {
                assert!((raster.get(x, y) - 0.8).abs() < 1e-6);
            }
        }
        // untouched pixels stay at the base level
        assert!((raster.get(0, 0) - 0.05).abs() < 1e-6);
    }

    #[test]
    fn blend_covers_each_segment_at_least_to_its_own_height() {
        let mut blender = HeightBlender::new(32, 32, 0.05);
        let a = Raster::filled(8, 8, 0.6);
        let b = Raster::filled(8, 8, 0.4);
        blender.blend(&a, &BoundingBox::new(0.0, 0.0, 8.0, 8.0));
        blender.blend(&b, &BoundingBox::new(4.0, 4.0, 8.0, 8.0));
        let raster = blender.into_raster();

        // overlap pixels hold the max of both covering segments
        assert!((raster.get(5, 5) - 0.6).abs() < 1e-6);
        // b-only pixels hold b's height
        assert!((raster.get(10, 10) - 0.4).abs() < 1e-6);
    }

    #[test]
    fn blend_clips_out_of_bounds_pixels() {
        let mut blender = HeightBlender::new(16, 16, 0.0);
        let field = Raster::filled(8, 8, 1.0);
        blender.blend(&field, &BoundingBox::new(12.0, 12.0, 8.0, 8.0));
        let raster = blender.into_raster();
        assert_eq!(raster.get(15, 15), 1.0);
        assert_eq!(raster.get(0, 0), 0.0);
    }

    #[test]
    fn value_noise_is_bounded() {
        for i in 0..50 {
            let v = value_noise(i as f32 * 0.37, i as f32 * 0.91, 42);
            assert!((0.0..=1.0).contains(&v));
        }
    }
}
