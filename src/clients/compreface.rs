//! Recognition registry over the CompreFace REST API.

use std::time::Duration;

use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{AddedSubject, RecognitionService, RecognizedFace, SubjectMatch};
use crate::error::{PipelineError, Result};
use crate::models::vision::{BoundingBox, EMBEDDING_DIM};

const SERVICE: &str = "compreface";
const NO_FACE_CODE: i64 = 28;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireBox {
    x_min: i32,
    y_min: i32,
    x_max: i32,
    y_max: i32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireAge {
    low: i32,
    high: i32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireGender {
    value: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireRecognition {
    #[serde(rename = "box")]
    bbox: WireBox,
    subjects: Vec<SubjectMatch>,
    age: Option<WireAge>,
    gender: Option<WireGender>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RecognitionResponse {
    result: Vec<WireRecognition>,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    embeddings: [&'a [f64]; 1],
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EmbeddingResult {
    similarities: Vec<SubjectMatch>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EmbeddingResponse {
    result: Vec<EmbeddingResult>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AddSubjectResponse {
    image_id: String,
    subject: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SubjectListResponse {
    subjects: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ErrorBody {
    message: String,
    code: i64,
}

impl From<WireRecognition> for RecognizedFace {
    fn from(w: WireRecognition) -> Self {
        let mut subjects = w.subjects;
        subjects.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        RecognizedFace {
            bbox: BoundingBox::new(w.bbox.x_min, w.bbox.y_min, w.bbox.x_max, w.bbox.y_max),
            subjects,
            age: w.age.map(|a| (a.low + a.high) / 2),
            gender: w.gender.map(|g| g.value).filter(|g| !g.is_empty()),
        }
    }
}

pub struct CompreFaceClient {
    base_url: String,
    recognition_key: String,
    http: Client,
}

impl CompreFaceClient {
    pub fn new(base_url: &str, recognition_key: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(recognition_key)
            .map_err(|e| PipelineError::Configuration(format!("invalid recognition API key: {}", e)))?;
        headers.insert("x-api-key", key);
        let http = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| PipelineError::Configuration(format!("failed to build compreface HTTP client: {}", e)))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            recognition_key: recognition_key.to_string(),
            http,
        })
    }

    fn image_form(image: &[u8]) -> Result<Form> {
        let part = Part::bytes(image.to_vec())
            .file_name("face.jpg")
            .mime_str("image/jpeg")?;
        Ok(Form::new().part("file", part))
    }

    fn check(resp: Response) -> Result<Response> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status().as_u16();
        let body = resp.text().unwrap_or_default();
        Err(classify_error(status, &body))
    }
}

/// Map an error answer to the taxonomy. The "no face" answer is not a
/// service failure.
fn classify_error(status: u16, body: &str) -> PipelineError {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    if parsed.code == NO_FACE_CODE || body.contains("No face is found") {
        return PipelineError::NoDetection(if parsed.message.is_empty() {
            "No face is found in the given image".to_string()
        } else {
            parsed.message
        });
    }
    PipelineError::transient(SERVICE, format!("API error {}: {}", status, body.trim()))
}

impl RecognitionService for CompreFaceClient {
    fn recognize_embedding(&self, embedding: &[f64]) -> Result<Vec<SubjectMatch>> {
        if embedding.len() != EMBEDDING_DIM {
            return Err(PipelineError::InvalidArgument(format!(
                "embedding has {} dimensions, expected {}",
                embedding.len(),
                EMBEDDING_DIM
            )));
        }
        let url = format!("{}/api/v1/recognition/embeddings/recognize?prediction_count=1", self.base_url);
        let resp = self.http.post(url).json(&EmbeddingRequest { embeddings: [embedding] }).send()?;
        let parsed: EmbeddingResponse = Self::check(resp)?.json()?;
        let mut matches = parsed.result.into_iter().next().map(|r| r.similarities).unwrap_or_default();
        matches.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        debug!("Embedding query returned {} candidate(s)", matches.len());
        Ok(matches)
    }

    fn recognize_image(&self, image: &[u8]) -> Result<Vec<RecognizedFace>> {
        let url = format!(
            "{}/api/v1/recognition/recognize?face_plugins={}",
            self.base_url,
            urlencoding::encode("age,gender")
        );
        let resp = self.http.post(url).multipart(Self::image_form(image)?).send()?;
        let parsed: RecognitionResponse = Self::check(resp)?.json()?;
        if parsed.result.is_empty() {
            return Err(PipelineError::NoDetection("recognition returned no faces".to_string()));
        }
        debug!("Image query found {} face(s)", parsed.result.len());
        Ok(parsed.result.into_iter().map(RecognizedFace::from).collect())
    }

    fn add_subject(&self, subject: &str, image: &[u8]) -> Result<AddedSubject> {
        let url = format!("{}/api/v1/recognition/faces?subject={}", self.base_url, urlencoding::encode(subject));
        let resp = self.http.post(url).multipart(Self::image_form(image)?).send()?;
        let parsed: AddSubjectResponse = Self::check(resp)?.json()?;
        info!("Added subject '{}' (image_id {})", parsed.subject, parsed.image_id);
        Ok(AddedSubject { subject: parsed.subject, image_id: parsed.image_id })
    }

    fn list_subjects(&self) -> Result<Vec<String>> {
        let resp = self.http.get(format!("{}/api/v1/recognition/subjects", self.base_url)).send()?;
        let parsed: SubjectListResponse = Self::check(resp)?.json()?;
        Ok(parsed.subjects)
    }

    fn subject_image_url(&self, image_id: &str) -> String {
        format!("{}/api/v1/static/{}/images/{}", self.base_url, self.recognition_key, image_id)
    }
}
