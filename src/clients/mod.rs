//! Seams to the three external services.
//!
//! Every call is synchronous. Implementations over HTTP live in the
//! submodules; tests substitute in-memory fakes.

pub mod compreface;
pub mod labels;
pub mod stash;
pub mod vision;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::media::{Gallery, ItemFilter, MediaItem, MediaKind, NewPerformer, Paged, Performer, PerformerFilter};
use crate::models::vision::{AnalyzeRequest, AnalyzeResults, BoundingBox, Enhancement, JobResponse, JobStatus};

/// The host's catalog: items, labels, identity records and raw media.
pub trait MetadataStore: Send + Sync {
    /// `per_page < 0` returns every match in one page.
    fn find_items(&self, kind: MediaKind, filter: &ItemFilter, page: usize, per_page: i64) -> Result<Paged<MediaItem>>;
    fn get_item(&self, kind: MediaKind, id: &str) -> Result<MediaItem>;
    /// No-op when the label is already present.
    fn add_label(&self, kind: MediaKind, item_id: &str, label_id: &str) -> Result<()>;
    /// No-op when the label is absent.
    fn remove_label(&self, kind: MediaKind, item_id: &str, label_id: &str) -> Result<()>;
    fn set_performers(&self, kind: MediaKind, item_id: &str, performer_ids: &[String]) -> Result<()>;

    fn find_label(&self, name: &str) -> Result<Option<String>>;
    fn create_label(&self, name: &str) -> Result<String>;

    fn find_performers(&self, filter: &PerformerFilter, page: usize, per_page: i64) -> Result<Paged<Performer>>;
    /// Performer whose name or one of whose aliases equals `subject`.
    fn find_performer_by_subject(&self, subject: &str) -> Result<Option<Performer>>;
    fn create_performer(&self, performer: &NewPerformer) -> Result<String>;
    fn update_performer_aliases(&self, performer_id: &str, aliases: &[String]) -> Result<()>;
    fn add_performer_label(&self, performer_id: &str, label_id: &str) -> Result<()>;

    fn get_gallery(&self, gallery_id: &str) -> Result<Gallery>;
    /// Raw bytes behind a host URL, fetched with the session credentials.
    fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>>;
    fn trigger_metadata_scan(&self) -> Result<()>;
}

/// Face detection and quality scoring, run as asynchronous jobs.
pub trait DetectionService: Send + Sync {
    fn health_check(&self) -> Result<()>;
    fn submit_job(&self, request: &AnalyzeRequest) -> Result<JobResponse>;
    fn job_status(&self, job_id: &str) -> Result<JobStatus>;
    fn job_results(&self, job_id: &str) -> Result<AnalyzeResults>;
    fn extract_frame(&self, video_path: &str, timestamp: f64, enhancement: Option<&Enhancement>) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectMatch {
    pub subject: String,
    pub similarity: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecognizedFace {
    pub bbox: BoundingBox,
    /// Ranked by similarity, best first.
    pub subjects: Vec<SubjectMatch>,
    pub age: Option<i32>,
    pub gender: Option<String>,
}

impl RecognizedFace {
    pub fn best(&self) -> Option<&SubjectMatch> {
        self.subjects.first()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AddedSubject {
    pub subject: String,
    pub image_id: String,
}

/// The identity registry: subjects with reference face images.
pub trait RecognitionService: Send + Sync {
    /// Ranked candidates for one embedding, best first.
    fn recognize_embedding(&self, embedding: &[f64]) -> Result<Vec<SubjectMatch>>;
    /// One entry per face found in `image`. Zero faces is
    /// `PipelineError::NoDetection`.
    fn recognize_image(&self, image: &[u8]) -> Result<Vec<RecognizedFace>>;
    fn add_subject(&self, subject: &str, image: &[u8]) -> Result<AddedSubject>;
    fn list_subjects(&self) -> Result<Vec<String>>;
    fn subject_image_url(&self, image_id: &str) -> String;
}
