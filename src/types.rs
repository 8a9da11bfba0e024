use serde::Serialize;

/// Class names a detection class is checked against to decide terrain vs
/// placeable object before the classifier refines it. Matched as a
/// case-insensitive substring of the class name.
pub const TERRAIN_KEYWORDS: &[&str] = &[
    "mountain", "hill", "water", "lake", "river", "forest", "grass", "terrain", "sand", "rock",
    "snow", "swamp",
];

pub fn matches_terrain_keyword(class_name: &str) -> bool {
    let lower = class_name.to_ascii_lowercase();
    TERRAIN_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

/// Output quality preset, recorded into run metadata.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum QualityPreset {
    Draft,
    Standard,
    High,
}

impl QualityPreset {
    pub fn label(self) -> &'static str {
        match self {
            QualityPreset::Draft => "draft",
            QualityPreset::Standard => "standard",
            QualityPreset::High => "high",
        }
    }

    /// Square resolution of per-segment height fields.
    pub fn height_field_size(self) -> usize {
        match self {
            QualityPreset::Draft => 16,
            QualityPreset::Standard => 32,
            QualityPreset::High => 64,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct DetectorConfig {
    /// Final confidence threshold after class weighting. The objectness gate
    /// sits at `max(0.1, confidence_threshold / 2)`.
    pub confidence_threshold: f32,
    pub nms_threshold: f32,
    /// Class id -> name table; ids past the end synthesize `class_{i}`.
    pub class_labels: Vec<String>,
    /// Side length of the synthetic detection grid emitted when the
    /// detection tensor is absent or malformed.
    pub synthetic_grid: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            nms_threshold: 0.45,
            class_labels: [
                "mountain", "hill", "water", "lake", "river", "forest", "tree", "grass", "rock",
                "sand", "snow", "building", "house", "tower", "bridge", "road", "wall", "ruin",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            synthetic_grid: 3,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ClassifierConfig {
    /// Square crop size fed to the terrain/non-terrain binary classifier.
    pub binary_input_size: usize,
    /// Square crop size fed to the detailed multi-class classifier.
    pub detailed_input_size: usize,
    pub terrain_labels: Vec<String>,
    pub object_labels: Vec<String>,
    /// Number of auxiliary feature-vector values copied into `features`.
    pub feature_count: usize,
}

impl ClassifierConfig {
    pub fn terrain_class_count(&self) -> usize {
        self.terrain_labels.len()
    }

    pub fn object_class_count(&self) -> usize {
        self.object_labels.len()
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            binary_input_size: 64,
            detailed_input_size: 96,
            terrain_labels: ["plain", "mountain", "hill", "valley", "water", "forest", "desert", "swamp"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            object_labels: ["tree", "rock", "building", "house", "tower", "bridge", "wall", "ruin"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            feature_count: 10,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct HeightConfig {
    /// World-space height in meters that a normalized field value 1.0 maps to.
    pub max_terrain_height: f32,
    /// World-space side length in meters covered by the source map image.
    pub terrain_size: f32,
    /// Flat base level of the combined raster, normalized.
    pub base_level: f32,
    /// Blend radius (pixels) recorded on each terrain modification.
    pub blend_radius: f32,
}

impl Default for HeightConfig {
    fn default() -> Self {
        Self {
            max_terrain_height: 100.0,
            terrain_size: 512.0,
            base_level: 0.05,
            blend_radius: 8.0,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct PlacementConfig {
    pub min_scale: f32,
    pub max_scale: f32,
    /// Box-area / image-area ratio considered "typical"; both the scale
    /// mapping and the area-plausibility penalty are relative to it.
    pub reference_area_ratio: f32,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            min_scale: 0.5,
            max_scale: 3.0,
            reference_area_ratio: 0.05,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct EnhancementConfig {
    /// Timeout for one text-enhancement call, seconds.
    pub timeout_secs: f32,
}

impl Default for EnhancementConfig {
    fn default() -> Self {
        Self { timeout_secs: 10.0 }
    }
}

/// Full settings snapshot for one analyzer. A copy is recorded into run
/// metadata so results stay interpretable after the fact.
#[derive(Clone, Debug, Serialize)]
pub struct AnalysisConfig {
    pub detector: DetectorConfig,
    pub classifier: ClassifierConfig,
    pub height: HeightConfig,
    pub placement: PlacementConfig,
    pub enhancement: EnhancementConfig,
    pub quality: QualityPreset,
    /// Whether the segmentation model is consulted for masks. When false,
    /// every segment gets the rectangular bounding-box mask.
    pub use_segmentation: bool,
    /// Segments analyzed per in-flight batch.
    pub max_concurrent_segments: usize,
    /// Cooperative yield cadence inside per-segment loops.
    pub yield_every: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            detector: DetectorConfig::default(),
            classifier: ClassifierConfig::default(),
            height: HeightConfig::default(),
            placement: PlacementConfig::default(),
            enhancement: EnhancementConfig::default(),
            quality: QualityPreset::Standard,
            use_segmentation: true,
            max_concurrent_segments: 4,
            yield_every: 4,
        }
    }
}

impl AnalysisConfig {
    pub fn class_name(&self, class_id: usize) -> String {
        self.detector
            .class_labels
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| format!("class_{class_id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terrain_keywords_match_substrings() {
        assert!(matches_terrain_keyword("mountain"));
        assert!(matches_terrain_keyword("Snowy Mountain"));
        assert!(matches_terrain_keyword("riverbed"));
        assert!(!matches_terrain_keyword("tree"));
        assert!(!matches_terrain_keyword("building"));
    }

    #[test]
    fn class_name_falls_back_to_synthetic_label() {
        let cfg = AnalysisConfig::default();
        assert_eq!(cfg.class_name(0), "mountain");
        assert_eq!(cfg.class_name(999), "class_999");
    }
}
