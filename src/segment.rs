//! Segment builder: one mask-bearing segment per surviving detection.
//!
//! Masks come from the segmentation model, prompted with the box center; when
//! the model is unavailable or segmentation is disabled the whole bounding
//! box is marked foreground instead.

use std::collections::HashMap;

use ndarray::ArrayD;
use serde_json::json;
use tracing::{debug, warn};

use crate::decode::DetectedObject;
use crate::engine::{AnalysisError, InferenceEngine, ModelKind, Tensor};
use crate::geometry::BoundingBox;
use crate::raster::{Raster, RgbRaster};
use crate::types::matches_terrain_keyword;

/// Square crop size fed to the segmentation model.
const SEG_INPUT_SIZE: usize = 64;
/// Foreground threshold applied to model mask output.
const MASK_THRESHOLD: f32 = 0.5;

/// A detected region with its foreground mask. Read-only downstream.
#[derive(Debug, Clone)]
pub struct ImageSegment {
    pub id: usize,
    pub bounding_box: BoundingBox,
    /// Single-channel raster with the bounding box dimensions; values >= 0.5
    /// indicate foreground membership.
    pub mask: Raster,
    pub confidence: f32,
    pub class_name: String,
    pub class_id: usize,
    /// Foreground pixel count.
    pub area: f32,
    pub is_terrain: bool,
    pub metadata: HashMap<String, serde_json::Value>,
}

pub struct SegmentBuilder<'a, E> {
    engine: &'a E,
    use_segmentation: bool,
}

pub struct SegmentOutput {
    pub segments: Vec<ImageSegment>,
    pub mask_fallbacks: usize,
}

impl<'a, E: InferenceEngine> SegmentBuilder<'a, E> {
    pub fn new(engine: &'a E, use_segmentation: bool) -> Self {
        Self {
            engine,
            use_segmentation,
        }
    }

    /// Build one segment per detection, same count and order as the input.
    pub async fn build(&self, image: &RgbRaster, detections: &[DetectedObject]) -> SegmentOutput {
        let mut segments = Vec::with_capacity(detections.len());
        let mut mask_fallbacks = 0usize;

        for (id, det) in detections.iter().enumerate() {
            let (mask, from_model) = self.mask_for(image, det).await;
            if !from_model {
                mask_fallbacks += 1;
            }

            let area = mask.count_above(MASK_THRESHOLD) as f32;
            let mut metadata = HashMap::new();
            metadata.insert(
                "mask_source".to_string(),
                json!(if from_model { "model" } else { "bbox_fallback" }),
            );

            segments.push(ImageSegment {
                id,
                bounding_box: det.bounding_box.clone(),
                mask,
                confidence: det.confidence,
                class_name: det.class_name.clone(),
                class_id: det.class_id,
                area,
                // Keyword check is the only pre-classification terrain
                // decision; the classifier refines it later.
                is_terrain: matches_terrain_keyword(&det.class_name),
                metadata,
            });
        }

        debug!(
            segments = segments.len(),
            mask_fallbacks, "segment building complete"
        );
        SegmentOutput {
            segments,
            mask_fallbacks,
        }
    }

    async fn mask_for(&self, image: &RgbRaster, det: &DetectedObject) -> (Raster, bool) {
        let bbox = &det.bounding_box;
        if self.use_segmentation && self.engine.is_available(ModelKind::Segmentation) {
            match self.model_mask(image, bbox).await {
                Ok(mask) => return (mask, true),
                Err(err) => {
                    warn!(segment_class = %det.class_name, %err, "segmentation failed, using rectangular mask");
                }
            }
        }
        (rect_mask(bbox), false)
    }

    async fn model_mask(&self, image: &RgbRaster, bbox: &BoundingBox) -> Result<Raster, AnalysisError> {
        let crop = image.crop(bbox);
        if crop.is_empty() {
            return Err(AnalysisError::SegmentExtractionFailure(
                "bounding box lies outside the image".to_string(),
            ));
        }
        let input = crop
            .resize(SEG_INPUT_SIZE, SEG_INPUT_SIZE)
            .to_tensor()
            .into_dyn();

        // Box center as a point prompt, normalized image coordinates.
        let (cx, cy) = bbox.center();
        let mut prompt = ArrayD::<f32>::zeros(vec![1, 1, 2]);
        prompt[[0, 0, 0]] = cx / image.width.max(1) as f32;
        prompt[[0, 0, 1]] = cy / image.height.max(1) as f32;

        let outputs = self
            .engine
            .infer(ModelKind::Segmentation, &[input, prompt])
            .await?;
        let mask_tensor = outputs
            .first()
            .ok_or_else(|| AnalysisError::InferenceFailure("segmentation returned no tensors".into()))?;

        decode_mask(mask_tensor, bbox)
    }
}

/// Entire bounding box marked foreground.
pub fn rect_mask(bbox: &BoundingBox) -> Raster {
    let w = bbox.width.round().max(1.0) as usize;
    let h = bbox.height.round().max(1.0) as usize;
    Raster::filled(w, h, 1.0)
}

/// Resize a `[1, h, w]` model mask to the bounding box and binarize it.
fn decode_mask(tensor: &Tensor, bbox: &BoundingBox) -> Result<Raster, AnalysisError> {
    let shape = tensor.shape().to_vec();
    if tensor.ndim() != 3 || shape[0] != 1 || shape[1] == 0 || shape[2] == 0 {
        return Err(AnalysisError::TensorShapeMismatch {
            expected: "[1, h, w]".to_string(),
            got: shape,
        });
    }

    let (h, w) = (shape[1], shape[2]);
    let data: Vec<f32> = tensor.iter().copied().collect();
    let raw = Raster::from_vec(w, h, data).ok_or_else(|| AnalysisError::InferenceFailure(
        "mask tensor element count does not match its shape".to_string(),
    ))?;

    let out_w = bbox.width.round().max(1.0) as usize;
    let out_h = bbox.height.round().max(1.0) as usize;
    let mut mask = raw.resize(out_w, out_h);
    for y in 0..mask.height {
        for x in 0..mask.width {
            let v = if mask.get(x, y) >= MASK_THRESHOLD { 1.0 } else { 0.0 };
            mask.set(x, y, v);
        }
    }
    Ok(mask)
}
