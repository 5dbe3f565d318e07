use serde::{Deserialize, Serialize};

/// Dimensionality of the ArcFace embeddings produced by the detection
/// service and indexed by the recognition registry.
pub const EMBEDDING_DIM: usize = 512;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x_min: i32,
    pub y_min: i32,
    pub x_max: i32,
    pub y_max: i32,
}

impl BoundingBox {
    pub fn new(x_min: i32, y_min: i32, x_max: i32, y_max: i32) -> Self {
        Self { x_min, y_min, x_max, y_max }
    }
    pub fn width(&self) -> i32 { (self.x_max - self.x_min).max(0) }
    pub fn height(&self) -> i32 { (self.y_max - self.y_min).max(0) }
    pub fn max_dim(&self) -> i32 { self.width().max(self.height()) }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityComponents {
    pub size: f64,
    pub pose: f64,
    pub occlusion: f64,
    pub sharpness: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityScores {
    pub composite: f64,
    #[serde(default)]
    pub components: QualityComponents,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Demographics {
    pub age: i32,
    pub gender: String,
    pub emotion: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Detection {
    pub frame_index: i64,
    pub timestamp: f64,
    pub bbox: BoundingBox,
    pub confidence: f64,
    pub quality_score: f64,
    pub quality: Option<QualityScores>,
    pub enhanced: bool,
    pub occluded: bool,
    pub occlusion_probability: f64,
}

/// One physical face as clustered by the detection service. All of its
/// detections are kept, but only `representative_detection` (the best
/// quality instance) is used downstream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Face {
    pub face_id: String,
    #[serde(default)]
    pub embedding: Vec<f64>,
    #[serde(default)]
    pub demographics: Option<Demographics>,
    #[serde(default)]
    pub detections: Vec<Detection>,
    pub representative_detection: Detection,
}

impl Face {
    pub fn representative(&self) -> &Detection {
        &self.representative_detection
    }

    /// Embedding usable for registry lookup, if its length matches the
    /// registry's dimensionality.
    pub fn usable_embedding(&self) -> Option<&[f64]> {
        if self.embedding.len() == EMBEDDING_DIM {
            Some(&self.embedding)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enhancement {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub quality_trigger: f64,
    #[serde(default)]
    pub model: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub fidelity_weight: f64,
}

impl Enhancement {
    pub fn codeformer(quality_trigger: f64) -> Self {
        Self { enabled: true, quality_trigger, model: "codeformer".to_string(), fidelity_weight: 0.25 }
    }
}

fn is_zero(v: &f64) -> bool { *v == 0.0 }

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultMetadata {
    pub source: String,
    pub total_frames: i64,
    pub frames_processed: i64,
    pub unique_faces: i64,
    pub total_detections: i64,
    pub processing_time_seconds: f64,
    pub method: String,
    pub model: String,
    pub frame_enhancement: Option<Enhancement>,
}

impl ResultMetadata {
    pub fn used_sprites(&self) -> bool {
        self.method == "sprites"
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FacesResult {
    pub faces: Vec<Face>,
    pub metadata: ResultMetadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzeResults {
    pub job_id: String,
    pub status: String,
    pub faces: Option<FacesResult>,
}

impl AnalyzeResults {
    pub fn into_faces(self) -> FacesResult {
        self.faces.unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FacesParameters {
    pub face_min_confidence: f64,
    pub face_min_quality: f64,
    pub max_faces: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling_interval: Option<f64>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub use_sprites: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sprite_vtt_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sprite_image_url: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub enable_deduplication: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_similarity_threshold: Option<f64>,
    pub detect_demographics: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_duration: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enhancement: Option<Enhancement>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacesModule {
    pub enabled: bool,
    pub parameters: FacesParameters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Modules {
    pub faces: FacesModule,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzeRequest {
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scene_id: Option<String>,
    pub processing_mode: String,
    pub modules: Modules,
}

impl AnalyzeRequest {
    fn faces(source: &str, parameters: FacesParameters) -> Self {
        Self {
            source: source.to_string(),
            source_type: None,
            source_id: None,
            scene_id: None,
            // Sequential keeps the GPU free of competing frames
            processing_mode: "sequential".to_string(),
            modules: Modules { faces: FacesModule { enabled: true, parameters } },
        }
    }

    pub fn for_image(path: &str, image_id: &str, parameters: FacesParameters) -> Self {
        let mut req = Self::faces(path, parameters);
        req.source_type = Some("image".to_string());
        req.source_id = Some(image_id.to_string());
        req
    }

    pub fn for_scene(path: &str, scene_id: &str, parameters: FacesParameters) -> Self {
        let mut req = Self::faces(path, parameters);
        req.scene_id = Some(scene_id.to_string());
        req
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobResponse {
    pub job_id: String,
    pub status: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobStatus {
    pub job_id: String,
    pub status: String,
    pub progress: f64,
    pub stage: Option<String>,
    pub message: Option<String>,
    pub error: Option<String>,
}
