//! Detection decoder: raw `[1, A, B]` inference output -> candidate objects.
//!
//! Layout is auto-detected: the larger of the two trailing dimensions is the
//! detection axis, the smaller the feature axis (cx, cy, w, h, objectness,
//! then per-class scores). A missing or malformed tensor fails soft into a
//! deterministic synthetic grid so the pipeline keeps moving; the fallback is
//! flagged in run metadata, never silent.

use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, warn};

use crate::engine::Tensor;
use crate::geometry::BoundingBox;
use crate::types::DetectorConfig;

/// One decoded detection. Immutable after creation.
#[derive(Debug, Clone, Serialize)]
pub struct DetectedObject {
    pub bounding_box: BoundingBox,
    pub class_id: usize,
    pub class_name: String,
    pub confidence: f32,
    pub class_scores: HashMap<String, f32>,
}

pub struct DecodeOutput {
    pub objects: Vec<DetectedObject>,
    /// True when the tensor was `[1, detections, features]`.
    pub transposed: bool,
    /// True when the synthetic fallback grid was emitted.
    pub synthetic: bool,
}

pub struct DetectionDecoder {
    cfg: DetectorConfig,
}

impl DetectionDecoder {
    pub fn new(cfg: DetectorConfig) -> Self {
        Self { cfg }
    }

    /// Decode a raw detection tensor. `None` or any tensor not shaped
    /// `[1, A, B]` triggers the synthetic fallback.
    pub fn decode(&self, tensor: Option<&Tensor>, img_w: usize, img_h: usize) -> DecodeOutput {
        let tensor = match tensor {
            Some(t) if t.ndim() == 3 && t.shape()[0] == 1 => t,
            Some(t) => {
                warn!(shape = ?t.shape(), "detection tensor is not [1, A, B], emitting synthetic grid");
                return self.synthetic_grid(img_w, img_h);
            }
            None => {
                warn!("no detection tensor, emitting synthetic grid");
                return self.synthetic_grid(img_w, img_h);
            }
        };

        let shape = tensor.shape();
        let (a, b) = (shape[1], shape[2]);
        // A > B reads as [1, detections, features]; features axis carries
        // cx, cy, w, h, objectness + class scores, so it needs at least 6.
        let (detections, features, transposed) = if a > b { (a, b, true) } else { (b, a, false) };
        if features < 6 {
            warn!(?shape, "detection tensor too narrow for class scores, emitting synthetic grid");
            return self.synthetic_grid(img_w, img_h);
        }
        debug!(detections, features, transposed, "decoding detection tensor");

        let at = |det: usize, feat: usize| -> f32 {
            if transposed {
                tensor[[0, det, feat]]
            } else {
                tensor[[0, feat, det]]
            }
        };

        let objectness_gate = (self.cfg.confidence_threshold * 0.5).max(0.1);
        let num_classes = features - 5;
        let mut objects = Vec::new();

        for i in 0..detections {
            let obj_conf = at(i, 4);
            if obj_conf < objectness_gate {
                continue;
            }

            let mut best_class = 0usize;
            let mut best_score = f32::MIN;
            for c in 0..num_classes {
                let score = at(i, 5 + c);
                if score > best_score {
                    best_score = score;
                    best_class = c;
                }
            }

            let confidence = obj_conf * best_score;
            if confidence < self.cfg.confidence_threshold {
                continue;
            }

            let cx = at(i, 0) * img_w as f32;
            let cy = at(i, 1) * img_h as f32;
            let w = at(i, 2) * img_w as f32;
            let h = at(i, 3) * img_h as f32;

            let mut bbox = BoundingBox::from_center(cx, cy, w, h);
            bbox.clamp_to(img_w as f32, img_h as f32);
            if bbox.is_degenerate() {
                continue;
            }

            let class_name = self.class_name(best_class);
            let class_scores: HashMap<String, f32> = (0..num_classes)
                .map(|c| (self.class_name(c), at(i, 5 + c)))
                .collect();

            bbox.confidence = Some(confidence);
            bbox.class_id = Some(best_class);
            bbox.class_name = Some(class_name.clone());

            objects.push(DetectedObject {
                bounding_box: bbox,
                class_id: best_class,
                class_name,
                confidence,
                class_scores,
            });
        }

        DecodeOutput {
            objects,
            transposed,
            synthetic: false,
        }
    }

    fn class_name(&self, class_id: usize) -> String {
        self.cfg
            .class_labels
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| format!("class_{class_id}"))
    }

    /// Deterministic fallback grid: one pseudo-randomized detection per cell.
    fn synthetic_grid(&self, img_w: usize, img_h: usize) -> DecodeOutput {
        let n = self.cfg.synthetic_grid.max(1);
        let cell_w = img_w as f32 / n as f32;
        let cell_h = img_h as f32 / n as f32;
        let classes = self.cfg.class_labels.len().max(1);

        let mut objects = Vec::with_capacity(n * n);
        for gy in 0..n {
            for gx in 0..n {
                let mut seed = ((gy * n + gx) as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
                let cx = (gx as f32 + 0.5) * cell_w + (next_unit(&mut seed) - 0.5) * cell_w * 0.3;
                let cy = (gy as f32 + 0.5) * cell_h + (next_unit(&mut seed) - 0.5) * cell_h * 0.3;
                let w = cell_w * (0.4 + next_unit(&mut seed) * 0.3);
                let h = cell_h * (0.4 + next_unit(&mut seed) * 0.3);
                let class_id = (next_unit(&mut seed) * classes as f32) as usize % classes;
                let confidence = 0.55 + next_unit(&mut seed) * 0.4;

                let class_name = self.class_name(class_id);
                let mut bbox = BoundingBox::from_center(cx, cy, w, h);
                bbox.clamp_to(img_w as f32, img_h as f32);
                if bbox.is_degenerate() {
                    continue;
                }
                bbox.confidence = Some(confidence);
                bbox.class_id = Some(class_id);
                bbox.class_name = Some(class_name.clone());

                let mut class_scores = HashMap::new();
                class_scores.insert(class_name.clone(), confidence);

                objects.push(DetectedObject {
                    bounding_box: bbox,
                    class_id,
                    class_name,
                    confidence,
                    class_scores,
                });
            }
        }

        DecodeOutput {
            objects,
            transposed: false,
            synthetic: true,
        }
    }
}

/// One step of a 64-bit LCG mapped into [0, 1).
fn next_unit(seed: &mut u64) -> f32 {
    *seed = seed
        .wrapping_mul(6364136223846793005)
        .wrapping_add(1442695040888963407);
    ((*seed >> 33) & 0x7FFF_FFFF) as f32 / (0x8000_0000u32 as f32)
}
