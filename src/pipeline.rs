//! The map analyzer: a strict hand-off chain of suspendable stages.
//!
//! image -> decode -> NMS -> segment build -> classify -> {height | placement}
//! -> aggregate. Stage boundaries are strictly ordered; per-segment analysis
//! is batched with a concurrency cap. Only `AlreadyInProgress`,
//! `InvalidInput` and cancellation abort a run; every model failure recovers
//! through its stage's documented fallback and is recorded in run metadata.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::aggregate::{object_placement, segmentation_map, terrain_modification, AnalysisResults};
use crate::classify::{AnalyzedSegment, SegmentClassifier};
use crate::decode::{DecodeOutput, DetectionDecoder};
use crate::engine::{AnalysisError, InferenceEngine, ModelKind, NoEnhancer, TextEnhancer};
use crate::height::{HeightBlender, HeightEstimator};
use crate::nms::non_max_suppression;
use crate::placement::PlacementEstimator;
use crate::raster::RgbRaster;
use crate::segment::SegmentBuilder;
use crate::types::AnalysisConfig;

/// Progress callback: `(stage_label, fraction in [0, 1])`.
pub type ProgressFn = Arc<dyn Fn(&str, f32) + Send + Sync>;

/// Cooperative cancellation signal, checked between stages and between
/// per-segment iterations; no stage is interrupted mid-computation. The flag
/// is cleared when the next run starts, so it only ever stops the run that is
/// in flight when `cancel` fires.
#[derive(Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One analyzer instance runs one pipeline at a time; a second call while
/// busy fails fast instead of queuing.
pub struct MapAnalyzer<E, T = NoEnhancer> {
    engine: E,
    enhancer: Option<T>,
    cfg: AnalysisConfig,
    busy: AtomicBool,
    progress: Option<ProgressFn>,
    cancel: CancelHandle,
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl<E: InferenceEngine> MapAnalyzer<E, NoEnhancer> {
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            enhancer: None,
            cfg: AnalysisConfig::default(),
            busy: AtomicBool::new(false),
            progress: None,
            cancel: CancelHandle::new(),
        }
    }
}

impl<E: InferenceEngine, T: TextEnhancer> MapAnalyzer<E, T> {
    pub fn with_config(mut self, cfg: AnalysisConfig) -> Self {
        self.cfg = cfg;
        self
    }

    pub fn with_enhancer<T2: TextEnhancer>(self, enhancer: T2) -> MapAnalyzer<E, T2> {
        MapAnalyzer {
            engine: self.engine,
            enhancer: Some(enhancer),
            cfg: self.cfg,
            busy: AtomicBool::new(false),
            progress: self.progress,
            cancel: self.cancel,
        }
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.cfg
    }

    /// Handle for cancelling the in-flight run from elsewhere.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Run the full pipeline on one image.
    pub async fn analyze(&self, image: &RgbRaster) -> Result<AnalysisResults, AnalysisError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AnalysisError::AlreadyInProgress);
        }
        let _guard = BusyGuard(&self.busy);
        // a leftover cancellation from an earlier run must not poison this one
        self.cancel.reset();

        if image.is_empty() {
            return Err(AnalysisError::InvalidInput("empty image".to_string()));
        }

        let start = Instant::now();
        let (img_w, img_h) = (image.width, image.height);
        info!(img_w, img_h, "map analysis started");

        // Detection
        self.report("detection", 0.1);
        let decoded = self.run_detection(image).await;
        self.check_cancel()?;

        let kept = non_max_suppression(decoded.objects, self.cfg.detector.nms_threshold);
        debug!(kept = kept.len(), "detections after NMS");

        // Segmentation
        self.report("segmentation", 0.2);
        let builder = SegmentBuilder::new(&self.engine, self.cfg.use_segmentation);
        let seg_out = builder.build(image, &kept).await;
        self.check_cancel()?;

        // Per-segment classification, batched with the concurrency cap.
        let classifier = SegmentClassifier::new(&self.engine, &self.cfg.classifier);
        let total = seg_out.segments.len().max(1);
        let mut analyzed: Vec<AnalyzedSegment> = Vec::with_capacity(seg_out.segments.len());
        let mut classify_fallbacks = 0usize;
        for chunk in seg_out.segments.chunks(self.cfg.max_concurrent_segments.max(1)) {
            self.check_cancel()?;
            let outcomes = join_all(chunk.iter().map(|seg| classifier.classify(image, seg))).await;
            for outcome in outcomes {
                if outcome.used_fallback {
                    classify_fallbacks += 1;
                }
                let mut item = outcome.analyzed;
                let (cx, cy) = item.segment.bounding_box.center();
                item.normalized_position = (
                    (cx / img_w as f32).clamp(0.0, 1.0),
                    (cy / img_h as f32).clamp(0.0, 1.0),
                );
                analyzed.push(item);
            }
            let fraction = 0.3 + 0.3 * (analyzed.len() as f32 / total as f32);
            self.report("segment analysis", fraction);
            tokio::task::yield_now().await;
        }

        // Description enhancement, optional and timeout-bounded.
        self.report("enhancement", 0.6);
        let enhance_fallbacks = self.enhance_descriptions(&mut analyzed).await?;

        // Terrain height
        self.report("terrain", 0.7);
        let estimator = HeightEstimator::new(
            &self.engine,
            &self.cfg.height,
            self.cfg.quality.height_field_size(),
        );
        let mut blender = HeightBlender::new(img_w, img_h, self.cfg.height.base_level);
        let mut height_fallbacks = 0usize;
        let mut processed = 0usize;
        for item in analyzed.iter_mut().filter(|a| a.is_terrain) {
            self.check_cancel()?;
            if estimator.estimate(image, item).await {
                height_fallbacks += 1;
            }
            if let Some(field) = &item.height_map {
                blender.blend(field, &item.segment.bounding_box);
            }
            processed += 1;
            if processed % self.cfg.yield_every.max(1) == 0 {
                tokio::task::yield_now().await;
            }
        }

        let height_map = blender.into_raster();

        // Object placement
        self.report("placement", 0.8);
        let placement = PlacementEstimator::new(&self.cfg.placement);
        for item in analyzed.iter_mut().filter(|a| !a.is_terrain) {
            placement.estimate(img_w, img_h, item);
            // Objects rest on whatever terrain was blended beneath them.
            let (cx, cy) = item.segment.bounding_box.center();
            let x = (cx.round().max(0.0) as usize).min(img_w - 1);
            let y = (cy.round().max(0.0) as usize).min(img_h - 1);
            item.estimated_height = height_map.get(x, y) * self.cfg.height.max_terrain_height;
        }
        self.check_cancel()?;

        // Finalize
        self.report("finalize", 0.9);
        let seg_map = segmentation_map(img_w, img_h, &analyzed);
        let terrain_modifications: Vec<_> = analyzed
            .iter()
            .filter(|a| a.is_terrain)
            .map(|a| terrain_modification(a, &self.cfg.height))
            .collect();
        let object_placements: Vec<_> = analyzed
            .iter()
            .filter(|a| !a.is_terrain)
            .map(object_placement)
            .collect();

        let terrain_count = terrain_modifications.len();
        let object_count = object_placements.len();
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        let mut metadata: HashMap<String, serde_json::Value> = HashMap::new();
        metadata.insert("image_width".into(), json!(img_w));
        metadata.insert("image_height".into(), json!(img_h));
        metadata.insert("total_segments".into(), json!(analyzed.len()));
        metadata.insert("terrain_segments".into(), json!(terrain_count));
        metadata.insert("object_segments".into(), json!(object_count));
        metadata.insert(
            "confidence_threshold".into(),
            json!(self.cfg.detector.confidence_threshold),
        );
        metadata.insert("quality".into(), json!(self.cfg.quality.label()));
        metadata.insert("synthetic_detections".into(), json!(decoded.synthetic));
        metadata.insert("detection_transposed".into(), json!(decoded.transposed));
        metadata.insert("mask_fallbacks".into(), json!(seg_out.mask_fallbacks));
        metadata.insert("classify_fallbacks".into(), json!(classify_fallbacks));
        metadata.insert("height_fallbacks".into(), json!(height_fallbacks));
        metadata.insert("enhance_fallbacks".into(), json!(enhance_fallbacks));
        metadata.insert("elapsed_ms".into(), json!(elapsed_ms));
        if let Ok(settings) = serde_json::to_value(&self.cfg) {
            metadata.insert("settings".into(), settings);
        }

        self.report("done", 1.0);
        info!(
            total = analyzed.len(),
            terrain = terrain_count,
            objects = object_count,
            elapsed_ms,
            "map analysis finished"
        );

        Ok(AnalysisResults {
            height_map,
            segmentation_map: seg_map,
            segments: analyzed.into_iter().map(|a| a.segment).collect(),
            terrain_modifications,
            object_placements,
            metadata,
        })
    }

    async fn run_detection(&self, image: &RgbRaster) -> DecodeOutput {
        let decoder = DetectionDecoder::new(self.cfg.detector.clone());
        if !self.engine.is_available(ModelKind::Detection) {
            return decoder.decode(None, image.width, image.height);
        }
        let input = image.to_tensor().into_dyn();
        match self.engine.infer(ModelKind::Detection, &[input]).await {
            Ok(outputs) => decoder.decode(outputs.first(), image.width, image.height),
            Err(err) => {
                warn!(%err, "detection inference failed");
                decoder.decode(None, image.width, image.height)
            }
        }
    }

    /// Ask the enhancement service for better descriptions. A timeout or
    /// service error keeps the locally assembled text; without a configured
    /// enhancer the whole pass is skipped.
    async fn enhance_descriptions(
        &self,
        analyzed: &mut [AnalyzedSegment],
    ) -> Result<usize, AnalysisError> {
        let Some(enhancer) = &self.enhancer else {
            return Ok(0);
        };

        let timeout = Duration::from_secs_f32(self.cfg.enhancement.timeout_secs.max(0.1));
        let mut fallbacks = 0usize;
        for (i, item) in analyzed.iter_mut().enumerate() {
            self.check_cancel()?;
            let (nx, ny) = item.normalized_position;
            let kind = if item.is_terrain { "terrain" } else { "object" };
            let prompt = format!(
                "Describe the {} {} at map position ({:.2}, {:.2})",
                item.detailed_classification, kind, nx, ny
            );
            match tokio::time::timeout(timeout, enhancer.enhance(&prompt)).await {
                Ok(Ok(text)) => item.enhanced_description = Some(text),
                Ok(Err(err)) => {
                    warn!(segment = item.segment.id, %err, "enhancement failed, keeping local description");
                    fallbacks += 1;
                }
                Err(_) => {
                    let err = AnalysisError::ExternalServiceTimeout(timeout.as_secs_f32());
                    warn!(segment = item.segment.id, %err, "keeping local description");
                    fallbacks += 1;
                }
            }
            if (i + 1) % self.cfg.yield_every.max(1) == 0 {
                tokio::task::yield_now().await;
            }
        }
        Ok(fallbacks)
    }

    fn report(&self, stage: &str, fraction: f32) {
        debug!(stage, fraction, "pipeline progress");
        if let Some(progress) = &self.progress {
            progress(stage, fraction);
        }
    }

    fn check_cancel(&self) -> Result<(), AnalysisError> {
        if self.cancel.is_cancelled() {
            Err(AnalysisError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::NullEngine;

    #[tokio::test(flavor = "current_thread")]
    async fn empty_image_is_invalid_input() {
        let analyzer = MapAnalyzer::new(NullEngine);
        let image = RgbRaster::zeros(0, 0);
        assert!(matches!(
            analyzer.analyze(&image).await,
            Err(AnalysisError::InvalidInput(_))
        ));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn cancel_during_run_aborts_between_stages() {
        let analyzer = MapAnalyzer::new(NullEngine);
        let handle = analyzer.cancel_handle();
        let analyzer = analyzer.with_progress(Arc::new(move |stage, _| {
            if stage == "detection" {
                handle.cancel();
            }
        }));
        let image = RgbRaster::filled(32, 32, [90, 120, 90]);
        assert!(matches!(
            analyzer.analyze(&image).await,
            Err(AnalysisError::Cancelled)
        ));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn stale_cancellation_is_cleared_on_next_run() {
        let analyzer = MapAnalyzer::new(NullEngine);
        analyzer.cancel_handle().cancel();
        let image = RgbRaster::filled(32, 32, [90, 120, 90]);
        assert!(analyzer.analyze(&image).await.is_ok());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn null_engine_run_still_produces_results() {
        let analyzer = MapAnalyzer::new(NullEngine);
        let image = RgbRaster::filled(96, 96, [90, 120, 90]);
        let results = analyzer.analyze(&image).await.unwrap();

        // synthetic grid fallback keeps the pipeline alive
        assert_eq!(results.metadata["synthetic_detections"], json!(true));
        assert!(!results.segments.is_empty());
        assert_eq!(results.height_map.width, 96);
        assert_eq!(results.segmentation_map.height, 96);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn progress_reaches_done() {
        use std::sync::Mutex;
        let stages: Arc<Mutex<Vec<(String, f32)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = stages.clone();
        let analyzer = MapAnalyzer::new(NullEngine).with_progress(Arc::new(move |label, frac| {
            sink.lock().unwrap().push((label.to_string(), frac));
        }));

        let image = RgbRaster::filled(48, 48, [100, 100, 100]);
        analyzer.analyze(&image).await.unwrap();

        let stages = stages.lock().unwrap();
        assert_eq!(stages.first().unwrap().0, "detection");
        let (last_label, last_frac) = stages.last().unwrap();
        assert_eq!(last_label, "done");
        assert_eq!(*last_frac, 1.0);
        for window in stages.windows(2) {
            assert!(window[0].1 <= window[1].1);
        }
    }
}
