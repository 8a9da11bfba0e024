//! Collaborator boundary: inference engine and text-enhancement service.
//!
//! The pipeline never loads models or manages sessions itself; it consumes a
//! narrow `InferenceEngine` and treats every failure behind that boundary as
//! locally recoverable (see the per-stage fallbacks).

use ndarray::ArrayD;

/// Float tensor at the collaborator boundary. Detection uses shape
/// `[1, dim1, dim2]`; classification/height crops are fixed square NCHW.
pub type Tensor = ArrayD<f32>;

#[derive(thiserror::Error, Debug)]
pub enum AnalysisError {
    #[error("model not available: {0:?}")]
    ModelUnavailable(ModelKind),

    #[error("tensor shape mismatch: expected {expected}, got {got:?}")]
    TensorShapeMismatch { expected: String, got: Vec<usize> },

    #[error("inference failure: {0}")]
    InferenceFailure(String),

    #[error("segment extraction failure: {0}")]
    SegmentExtractionFailure(String),

    #[error("external service timed out after {0:.1}s")]
    ExternalServiceTimeout(f32),

    #[error("external service failure: {0}")]
    ExternalServiceFailure(String),

    #[error("analysis already in progress")]
    AlreadyInProgress,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("analysis cancelled")]
    Cancelled,
}

/// Which model a given inference call addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ModelKind {
    Detection,
    Segmentation,
    TerrainBinary,
    DetailedClass,
    HeightRegression,
}

/// Inference collaborator. One call per model invocation, tensors in,
/// tensors out. Segmentation receives `[crop, point_prompt]`; every other
/// model receives a single input tensor.
#[allow(async_fn_in_trait)]
pub trait InferenceEngine {
    /// Whether a model is loaded. Unavailable models route the calling stage
    /// straight to its documented fallback without an inference attempt.
    fn is_available(&self, model: ModelKind) -> bool;

    async fn infer(&self, model: ModelKind, inputs: &[Tensor]) -> Result<Vec<Tensor>, AnalysisError>;
}

/// Text-enhancement collaborator: prompt in, enhanced string out.
#[allow(async_fn_in_trait)]
pub trait TextEnhancer {
    async fn enhance(&self, prompt: &str) -> Result<String, AnalysisError>;
}

/// Engine with nothing loaded. Every stage falls back: synthetic detections,
/// rectangular masks, keyword classification, heuristic height/placement.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEngine;

impl InferenceEngine for NullEngine {
    fn is_available(&self, _model: ModelKind) -> bool {
        false
    }

    async fn infer(&self, model: ModelKind, _inputs: &[Tensor]) -> Result<Vec<Tensor>, AnalysisError> {
        Err(AnalysisError::ModelUnavailable(model))
    }
}

/// Placeholder enhancer type for analyzers built without an enhancement
/// service; the pipeline skips the call entirely when none is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoEnhancer;

impl TextEnhancer for NoEnhancer {
    async fn enhance(&self, _prompt: &str) -> Result<String, AnalysisError> {
        Err(AnalysisError::ExternalServiceFailure(
            "no enhancement service configured".to_string(),
        ))
    }
}
