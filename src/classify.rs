//! Segment classifier: terrain/non-terrain refinement plus detailed class.
//!
//! Both sub-steps crop the segment's box from the source image, resize to the
//! classifier input size and run the respective model; each has a documented
//! fallback so a missing model never aborts the run.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::engine::{AnalysisError, InferenceEngine, ModelKind, Tensor};
use crate::raster::{Raster, RgbRaster};
use crate::segment::ImageSegment;
use crate::types::ClassifierConfig;

/// A segment with everything later stages attach: classification, terrain
/// topology, height field, placement pose. Mutated incrementally by the
/// classifier and the height/placement estimators, finalized before the
/// aggregator reads it.
#[derive(Debug, Clone)]
pub struct AnalyzedSegment {
    pub segment: ImageSegment,
    pub is_terrain: bool,
    pub classification_confidence: f32,
    pub object_type: String,
    pub detailed_classification: String,
    pub features: HashMap<String, f32>,
    /// `slope`, `roughness`, `elevation` for terrain segments.
    pub topology_features: HashMap<String, f32>,
    /// Normalized height field, terrain segments only.
    pub height_map: Option<Raster>,
    /// Meters: mean terrain height for terrain segments, ground elevation
    /// under the box center for objects.
    pub estimated_height: f32,
    /// Box center divided by image size, both components in [0, 1].
    pub normalized_position: (f32, f32),
    /// Degrees about the vertical axis, normalized to [-90, 90).
    pub estimated_rotation: f32,
    pub estimated_scale: f32,
    pub placement_confidence: f32,
    pub enhanced_description: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl AnalyzedSegment {
    pub fn new(segment: ImageSegment) -> Self {
        let is_terrain = segment.is_terrain;
        let confidence = segment.confidence;
        let object_type = segment.class_name.clone();
        Self {
            segment,
            is_terrain,
            classification_confidence: confidence,
            detailed_classification: object_type.clone(),
            object_type,
            features: HashMap::new(),
            topology_features: HashMap::new(),
            height_map: None,
            estimated_height: 0.0,
            normalized_position: (0.0, 0.0),
            estimated_rotation: 0.0,
            estimated_scale: 1.0,
            placement_confidence: 0.0,
            enhanced_description: None,
            metadata: HashMap::new(),
        }
    }
}

pub struct ClassifyOutcome {
    pub analyzed: AnalyzedSegment,
    pub used_fallback: bool,
}

pub struct SegmentClassifier<'a, E> {
    engine: &'a E,
    cfg: &'a ClassifierConfig,
}

impl<'a, E: InferenceEngine> SegmentClassifier<'a, E> {
    pub fn new(engine: &'a E, cfg: &'a ClassifierConfig) -> Self {
        Self { engine, cfg }
    }

    pub async fn classify(&self, image: &RgbRaster, segment: &ImageSegment) -> ClassifyOutcome {
        let mut analyzed = AnalyzedSegment::new(segment.clone());
        let mut used_fallback = false;

        match self.refine_terrain_flag(image, segment).await {
            Ok((is_terrain, confidence)) => {
                analyzed.is_terrain = is_terrain;
                analyzed.classification_confidence = confidence;
            }
            Err(err) => {
                // Keep the keyword decision and the detection confidence.
                if !matches!(err, AnalysisError::ModelUnavailable(_)) {
                    warn!(segment = segment.id, %err, "terrain refinement failed, keeping keyword flag");
                }
                used_fallback = true;
            }
        }

        match self.detailed_classification(image, segment, analyzed.is_terrain).await {
            Ok((label, features)) => {
                analyzed.detailed_classification = label.clone();
                analyzed.object_type = label;
                analyzed.features = features;
            }
            Err(err) => {
                // Detection class name serves as both labels.
                if !matches!(err, AnalysisError::ModelUnavailable(_)) {
                    warn!(segment = segment.id, %err, "detailed classification failed, reusing detection class");
                }
                used_fallback = true;
            }
        }

        debug!(
            segment = segment.id,
            is_terrain = analyzed.is_terrain,
            class = %analyzed.detailed_classification,
            "segment classified"
        );
        ClassifyOutcome {
            analyzed,
            used_fallback,
        }
    }

    /// Binary terrain/non-terrain model: two outputs, `(terrain, non_terrain)`.
    async fn refine_terrain_flag(
        &self,
        image: &RgbRaster,
        segment: &ImageSegment,
    ) -> Result<(bool, f32), AnalysisError> {
        if !self.engine.is_available(ModelKind::TerrainBinary) {
            return Err(AnalysisError::ModelUnavailable(ModelKind::TerrainBinary));
        }

        let input = self.crop_input(image, segment, self.cfg.binary_input_size)?;
        let outputs = self.engine.infer(ModelKind::TerrainBinary, &[input]).await?;
        let scores = flatten_output(outputs.first(), 2)?;

        let (terrain_score, non_terrain_score) = (scores[0], scores[1]);
        Ok((
            terrain_score > non_terrain_score,
            terrain_score.max(non_terrain_score),
        ))
    }

    /// Multi-class model: argmax over the first N outputs, where N depends on
    /// the terrain flag. A second output tensor, when present, supplies the
    /// auxiliary feature slice (`f0..`).
    async fn detailed_classification(
        &self,
        image: &RgbRaster,
        segment: &ImageSegment,
        is_terrain: bool,
    ) -> Result<(String, HashMap<String, f32>), AnalysisError> {
        if !self.engine.is_available(ModelKind::DetailedClass) {
            return Err(AnalysisError::ModelUnavailable(ModelKind::DetailedClass));
        }

        let input = self.crop_input(image, segment, self.cfg.detailed_input_size)?;
        let outputs = self.engine.infer(ModelKind::DetailedClass, &[input]).await?;

        let class_count = if is_terrain {
            self.cfg.terrain_class_count()
        } else {
            self.cfg.object_class_count()
        };
        let scores = flatten_output(outputs.first(), class_count.max(1))?;
        let best = scores[..class_count.min(scores.len())]
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(i, _)| i)
            .unwrap_or(0);

        let label = if is_terrain {
            self.cfg
                .terrain_labels
                .get(best)
                .cloned()
                .unwrap_or_else(|| format!("terrain_{best}"))
        } else {
            self.cfg
                .object_labels
                .get(best)
                .cloned()
                .unwrap_or_else(|| format!("object_{best}"))
        };

        let mut features = HashMap::new();
        if let Some(aux) = outputs.get(1) {
            for (i, v) in aux.iter().take(self.cfg.feature_count).enumerate() {
                features.insert(format!("f{i}"), *v);
            }
        }

        Ok((label, features))
    }

    fn crop_input(
        &self,
        image: &RgbRaster,
        segment: &ImageSegment,
        size: usize,
    ) -> Result<Tensor, AnalysisError> {
        let crop = image.crop(&segment.bounding_box);
        if crop.is_empty() {
            return Err(AnalysisError::SegmentExtractionFailure(format!(
                "segment {} box lies outside the image",
                segment.id
            )));
        }
        Ok(crop.resize(size, size).to_tensor().into_dyn())
    }
}

/// Flatten the first output tensor and require at least `min_len` values.
fn flatten_output(tensor: Option<&Tensor>, min_len: usize) -> Result<Vec<f32>, AnalysisError> {
    let tensor = tensor
        .ok_or_else(|| AnalysisError::InferenceFailure("classifier returned no tensors".into()))?;
    let values: Vec<f32> = tensor.iter().copied().collect();
    if values.len() < min_len {
        return Err(AnalysisError::TensorShapeMismatch {
            expected: format!("at least {min_len} values"),
            got: tensor.shape().to_vec(),
        });
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::NullEngine;
    use crate::geometry::BoundingBox;
    use crate::segment::rect_mask;
    use ndarray::ArrayD;

    fn seg(class_name: &str, is_terrain: bool) -> ImageSegment {
        let bbox = BoundingBox::new(8.0, 8.0, 16.0, 16.0);
        ImageSegment {
            id: 0,
            mask: rect_mask(&bbox),
            bounding_box: bbox,
            confidence: 0.8,
            class_name: class_name.to_string(),
            class_id: 0,
            area: 256.0,
            is_terrain,
            metadata: HashMap::new(),
        }
    }

    /// Engine answering both classifier models with fixed tensors.
    struct FixedClassifier {
        binary: Vec<f32>,
        detailed: Vec<f32>,
        aux: Option<Vec<f32>>,
    }

    impl InferenceEngine for FixedClassifier {
        fn is_available(&self, model: ModelKind) -> bool {
            matches!(model, ModelKind::TerrainBinary | ModelKind::DetailedClass)
        }

        async fn infer(
            &self,
            model: ModelKind,
            _inputs: &[Tensor],
        ) -> Result<Vec<Tensor>, AnalysisError> {
            let to_tensor = |v: &Vec<f32>| {
                ArrayD::from_shape_vec(vec![1, v.len()], v.clone()).expect("shape")
            };
            match model {
                ModelKind::TerrainBinary => Ok(vec![to_tensor(&self.binary)]),
                ModelKind::DetailedClass => {
                    let mut out = vec![to_tensor(&self.detailed)];
                    if let Some(aux) = &self.aux {
                        out.push(to_tensor(aux));
                    }
                    Ok(out)
                }
                other => Err(AnalysisError::ModelUnavailable(other)),
            }
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn fallback_keeps_keyword_flag_and_detection_confidence() {
        let cfg = ClassifierConfig::default();
        let classifier = SegmentClassifier::new(&NullEngine, &cfg);
        let image = RgbRaster::filled(64, 64, [50, 50, 50]);

        let outcome = classifier.classify(&image, &seg("mountain", true)).await;
        assert!(outcome.used_fallback);
        assert!(outcome.analyzed.is_terrain);
        assert!((outcome.analyzed.classification_confidence - 0.8).abs() < 1e-6);
        assert_eq!(outcome.analyzed.object_type, "mountain");
        assert_eq!(outcome.analyzed.detailed_classification, "mountain");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn binary_classifier_overrides_keyword_flag() {
        let cfg = ClassifierConfig::default();
        let engine = FixedClassifier {
            binary: vec![0.2, 0.9], // non-terrain wins
            detailed: vec![0.1, 0.7, 0.2, 0.0, 0.0, 0.0, 0.0, 0.0],
            aux: None,
        };
        let classifier = SegmentClassifier::new(&engine, &cfg);
        let image = RgbRaster::filled(64, 64, [50, 50, 50]);

        let outcome = classifier.classify(&image, &seg("mountain", true)).await;
        assert!(!outcome.used_fallback);
        assert!(!outcome.analyzed.is_terrain);
        assert!((outcome.analyzed.classification_confidence - 0.9).abs() < 1e-6);
        // argmax index 1 in the object label table
        assert_eq!(outcome.analyzed.detailed_classification, "rock");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn terrain_argmax_uses_terrain_label_table() {
        let cfg = ClassifierConfig::default();
        let engine = FixedClassifier {
            binary: vec![0.9, 0.1],
            detailed: vec![0.0, 0.8, 0.1, 0.0, 0.0, 0.0, 0.0, 0.0],
            aux: Some(vec![0.5; 16]),
        };
        let classifier = SegmentClassifier::new(&engine, &cfg);
        let image = RgbRaster::filled(64, 64, [50, 50, 50]);

        let outcome = classifier.classify(&image, &seg("water", true)).await;
        assert_eq!(outcome.analyzed.detailed_classification, "mountain");
        assert_eq!(outcome.analyzed.features.len(), cfg.feature_count);
        assert!(outcome.analyzed.features.contains_key("f0"));
        assert!(outcome.analyzed.features.contains_key("f9"));
    }
}
