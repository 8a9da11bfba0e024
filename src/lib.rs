//! # TerraLens - Map Image Analysis Library
//!
//! TerraLens turns a single raster map image into structured terrain and
//! object data: a global height map, a colorized segmentation overlay,
//! terrain modification descriptors, and placeable object descriptors.
//!
//! ## Features
//!
//! - **Model or fallback**: every stage degrades gracefully when a model is
//!   missing or fails; a run aborts only on invalid input or re-entry
//! - **Pluggable inference**: bring your own backend via [`InferenceEngine`]
//! - **Cooperative async**: single logical thread, explicit yield points,
//!   cancellation between stages, progress events per stage
//! - **Deterministic fallbacks**: heuristic masks, heights and placements are
//!   reproducible for a given input
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use terralens::{MapAnalyzer, NullEngine, RgbRaster};
//!
//! # fn main() -> Result<(), terralens::AnalysisError> {
//! let analyzer = MapAnalyzer::new(NullEngine);
//! let image = RgbRaster::filled(256, 256, [96, 128, 96]);
//!
//! let rt = tokio::runtime::Builder::new_current_thread()
//!     .enable_time()
//!     .build()
//!     .unwrap();
//! let results = rt.block_on(analyzer.analyze(&image))?;
//!
//! println!(
//!     "{} segments, {} terrain mods, {} placements",
//!     results.segments.len(),
//!     results.terrain_modifications.len(),
//!     results.object_placements.len()
//! );
//! # Ok(())
//! # }
//! ```

// Core modules
mod aggregate;
mod classify;
mod decode;
mod engine;
mod geometry;
mod height;
mod nms;
mod placement;
mod pipeline;
mod raster;
mod segment;
mod types;

// Public API exports
pub use crate::aggregate::{AnalysisResults, ObjectPlacement, TerrainModification};
pub use crate::classify::AnalyzedSegment;
pub use crate::decode::{DetectedObject, DetectionDecoder};
pub use crate::engine::{
    AnalysisError, InferenceEngine, ModelKind, NoEnhancer, NullEngine, Tensor, TextEnhancer,
};
pub use crate::geometry::BoundingBox;
pub use crate::nms::non_max_suppression;
pub use crate::pipeline::{CancelHandle, MapAnalyzer, ProgressFn};
pub use crate::raster::{Raster, RgbRaster};
pub use crate::segment::ImageSegment;
pub use crate::types::{
    AnalysisConfig, ClassifierConfig, DetectorConfig, EnhancementConfig, HeightConfig,
    PlacementConfig, QualityPreset,
};

use std::path::Path;

/// Load a map image from disk into the pipeline's raster form.
pub fn load_map_image<P: AsRef<Path>>(path: P) -> Result<RgbRaster, AnalysisError> {
    let img = image::ImageReader::open(path.as_ref())
        .map_err(|e| AnalysisError::InvalidInput(e.to_string()))?
        .decode()
        .map_err(|e| AnalysisError::InvalidInput(e.to_string()))?;
    Ok(RgbRaster::from(&img))
}
