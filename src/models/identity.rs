use serde::{Deserialize, Serialize};

use super::vision::BoundingBox;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformerData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub age: i32,
    pub gender: String,
}

/// Outcome of identifying one face of a single image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FaceIdentity {
    pub image_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bounding_box: Option<BoundingBox>,
    pub performer: PerformerData,
    /// Match confidence in percent; 0 when no identity was linked.
    pub confidence: Option<f64>,
}

impl FaceIdentity {
    pub fn is_linked(&self) -> bool {
        self.performer.id.as_deref().map_or(false, |id| !id.is_empty())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentifyResponse {
    pub result: Vec<FaceIdentity>,
}
