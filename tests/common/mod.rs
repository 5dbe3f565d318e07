#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use facebridge::clients::labels::LabelCache;
use facebridge::clients::vision::JobPolling;
use facebridge::clients::{AddedSubject, DetectionService, MetadataStore, RecognitionService, RecognizedFace, SubjectMatch};
use facebridge::error::{PipelineError, Result};
use facebridge::models::media::{
    Gallery, ItemFilter, MediaItem, MediaKind, NewPerformer, Paged, Performer, PerformerFilter,
};
use facebridge::models::vision::{
    AnalyzeRequest, AnalyzeResults, BoundingBox, Demographics, Detection, Enhancement, Face, FacesResult, JobResponse,
    JobStatus, QualityComponents, QualityScores, EMBEDDING_DIM,
};
use facebridge::orchestrator::CancelToken;
use facebridge::pipeline::completion::StatusLabels;
use facebridge::pipeline::quality::QualityPolicy;
use facebridge::pipeline::resolver::ResolverSettings;
use facebridge::pipeline::{Pipeline, PipelineSettings, Services};
use facebridge::utils::config::{Config, LabelNames};
use image::{DynamicImage, ImageOutputFormat, Rgb, RgbImage};
use parking_lot::Mutex;

fn page<T: Clone>(all: Vec<T>, page: usize, per_page: i64) -> Paged<T> {
    let total = all.len();
    if per_page < 0 {
        return Paged { total, items: all };
    }
    let per_page = per_page as usize;
    let items = all.into_iter().skip(page.saturating_sub(1) * per_page).take(per_page).collect();
    Paged { total, items }
}

#[derive(Default)]
struct StoreState {
    items: Vec<MediaItem>,
    labels: Vec<(String, String)>,
    performers: Vec<Performer>,
    created: Vec<NewPerformer>,
    galleries: HashMap<String, (Gallery, Vec<String>)>,
    blobs: HashMap<String, Vec<u8>>,
    next_id: usize,
}

impl StoreState {
    fn next_id(&mut self) -> String {
        self.next_id += 1;
        format!("{}", 1000 + self.next_id)
    }

    fn item_mut(&mut self, kind: MediaKind, id: &str) -> Result<&mut MediaItem> {
        self.items
            .iter_mut()
            .find(|i| i.kind == kind && i.id == id)
            .ok_or_else(|| PipelineError::NotFound(format!("{} {}", kind, id)))
    }

    fn performer_mut(&mut self, id: &str) -> Result<&mut Performer> {
        self.performers
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| PipelineError::NotFound(format!("performer {}", id)))
    }
}

/// In-memory catalog standing in for the host.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
    pub metadata_scans: AtomicUsize,
    pub label_writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_item(&self, kind: MediaKind, id: &str, path: &str) {
        self.state.lock().items.push(MediaItem::new(kind, id, path));
    }

    pub fn update_item(&self, kind: MediaKind, id: &str, f: impl FnOnce(&mut MediaItem)) {
        let mut state = self.state.lock();
        if let Ok(item) = state.item_mut(kind, id) {
            f(item);
        }
    }

    pub fn item(&self, kind: MediaKind, id: &str) -> MediaItem {
        self.get_item(kind, id).unwrap()
    }

    /// Names of the labels on an item, sorted.
    pub fn label_names(&self, kind: MediaKind, id: &str) -> Vec<String> {
        let state = self.state.lock();
        let item = state.items.iter().find(|i| i.kind == kind && i.id == id).unwrap();
        let mut names: Vec<String> = item
            .label_ids
            .iter()
            .filter_map(|lid| state.labels.iter().find(|(l, _)| l == lid).map(|(_, n)| n.clone()))
            .collect();
        names.sort();
        names
    }

    pub fn label_count(&self) -> usize {
        self.state.lock().labels.len()
    }

    pub fn label_id(&self, name: &str) -> String {
        self.find_label(name).unwrap().unwrap_or_else(|| self.create_label(name).unwrap())
    }

    pub fn add_performer(&self, name: &str, aliases: &[&str], image_path: Option<&str>) -> String {
        let mut state = self.state.lock();
        let id = state.next_id();
        state.performers.push(Performer {
            id: id.clone(),
            name: name.to_string(),
            alias_list: aliases.iter().map(|a| a.to_string()).collect(),
            image_path: image_path.map(String::from),
            label_ids: Vec::new(),
        });
        id
    }

    pub fn performer(&self, id: &str) -> Performer {
        self.state.lock().performers.iter().find(|p| p.id == id).cloned().unwrap()
    }

    pub fn performer_count(&self) -> usize {
        self.state.lock().performers.len()
    }

    pub fn created_performers(&self) -> Vec<NewPerformer> {
        self.state.lock().created.clone()
    }

    pub fn add_gallery(&self, id: &str, title: &str, image_ids: &[&str]) {
        let gallery = Gallery { id: id.to_string(), title: Some(title.to_string()), image_count: image_ids.len() };
        let ids = image_ids.iter().map(|s| s.to_string()).collect();
        self.state.lock().galleries.insert(id.to_string(), (gallery, ids));
    }

    pub fn put_blob(&self, url: &str, bytes: Vec<u8>) {
        self.state.lock().blobs.insert(url.to_string(), bytes);
    }
}

impl MetadataStore for MemoryStore {
    fn find_items(&self, kind: MediaKind, filter: &ItemFilter, page_no: usize, per_page: i64) -> Result<Paged<MediaItem>> {
        let state = self.state.lock();
        let gallery_ids = filter.gallery.as_ref().map(|g| state.galleries.get(g).map(|(_, ids)| ids.clone()).unwrap_or_default());
        let matching: Vec<MediaItem> = state
            .items
            .iter()
            .filter(|i| i.kind == kind && filter.matches(i))
            .filter(|i| gallery_ids.as_ref().map_or(true, |ids| ids.contains(&i.id)))
            .cloned()
            .collect();
        Ok(page(matching, page_no, per_page))
    }

    fn get_item(&self, kind: MediaKind, id: &str) -> Result<MediaItem> {
        self.state.lock().item_mut(kind, id).map(|i| i.clone())
    }

    fn add_label(&self, kind: MediaKind, item_id: &str, label_id: &str) -> Result<()> {
        self.label_writes.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        let item = state.item_mut(kind, item_id)?;
        if !item.has_label(label_id) {
            item.label_ids.push(label_id.to_string());
        }
        Ok(())
    }

    fn remove_label(&self, kind: MediaKind, item_id: &str, label_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.item_mut(kind, item_id)?.label_ids.retain(|l| l != label_id);
        Ok(())
    }

    fn set_performers(&self, kind: MediaKind, item_id: &str, performer_ids: &[String]) -> Result<()> {
        let mut state = self.state.lock();
        state.item_mut(kind, item_id)?.performer_ids = performer_ids.to_vec();
        Ok(())
    }

    fn find_label(&self, name: &str) -> Result<Option<String>> {
        Ok(self.state.lock().labels.iter().find(|(_, n)| n == name).map(|(id, _)| id.clone()))
    }

    fn create_label(&self, name: &str) -> Result<String> {
        let mut state = self.state.lock();
        let id = state.next_id();
        state.labels.push((id.clone(), name.to_string()));
        Ok(id)
    }

    fn find_performers(&self, filter: &PerformerFilter, page_no: usize, per_page: i64) -> Result<Paged<Performer>> {
        let state = self.state.lock();
        let matching: Vec<Performer> = state
            .performers
            .iter()
            .filter(|p| !filter.exclude_labels.iter().any(|l| p.label_ids.contains(l)))
            .filter(|p| !filter.require_image || p.image_path.is_some())
            .cloned()
            .collect();
        Ok(page(matching, page_no, per_page))
    }

    fn find_performer_by_subject(&self, subject: &str) -> Result<Option<Performer>> {
        Ok(self
            .state
            .lock()
            .performers
            .iter()
            .find(|p| p.name == subject || p.alias_list.iter().any(|a| a == subject))
            .cloned())
    }

    fn create_performer(&self, performer: &NewPerformer) -> Result<String> {
        let mut state = self.state.lock();
        let id = state.next_id();
        state.performers.push(Performer {
            id: id.clone(),
            name: performer.name.clone(),
            alias_list: performer.alias_list.clone(),
            image_path: performer.image.clone(),
            label_ids: Vec::new(),
        });
        state.created.push(performer.clone());
        Ok(id)
    }

    fn update_performer_aliases(&self, performer_id: &str, aliases: &[String]) -> Result<()> {
        self.state.lock().performer_mut(performer_id)?.alias_list = aliases.to_vec();
        Ok(())
    }

    fn add_performer_label(&self, performer_id: &str, label_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        let performer = state.performer_mut(performer_id)?;
        if !performer.label_ids.iter().any(|l| l == label_id) {
            performer.label_ids.push(label_id.to_string());
        }
        Ok(())
    }

    fn get_gallery(&self, gallery_id: &str) -> Result<Gallery> {
        self.state
            .lock()
            .galleries
            .get(gallery_id)
            .map(|(g, _)| g.clone())
            .ok_or_else(|| PipelineError::NotFound(format!("gallery {}", gallery_id)))
    }

    fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        self.state.lock().blobs.get(url).cloned().ok_or_else(|| PipelineError::NotFound(url.to_string()))
    }

    fn trigger_metadata_scan(&self) -> Result<()> {
        self.metadata_scans.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Registry fake. Crops registered through `add_subject` are recognized
/// again when the exact same bytes come back; anything else gets
/// `image_answer`, or "no face" when that is empty.
#[derive(Default)]
pub struct FakeRecognition {
    embedding_answers: Mutex<HashMap<u64, Vec<SubjectMatch>>>,
    pub image_answer: Mutex<Vec<RecognizedFace>>,
    subjects: Mutex<Vec<(String, Vec<u8>)>>,
    pub embedding_calls: AtomicUsize,
    pub image_calls: AtomicUsize,
    pub fail_embeddings: AtomicBool,
}

impl FakeRecognition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer embedding lookups whose first component is `seed`.
    pub fn on_embedding(&self, seed: f64, subject: &str, similarity: f64) {
        self.embedding_answers
            .lock()
            .insert(seed.to_bits(), vec![SubjectMatch { subject: subject.to_string(), similarity }]);
    }

    pub fn answer_images_with(&self, faces: Vec<RecognizedFace>) {
        *self.image_answer.lock() = faces;
    }

    pub fn register(&self, subject: &str) {
        self.subjects.lock().push((subject.to_string(), Vec::new()));
    }

    pub fn subject_names(&self) -> Vec<String> {
        self.subjects.lock().iter().map(|(s, _)| s.clone()).collect()
    }
}

impl RecognitionService for FakeRecognition {
    fn recognize_embedding(&self, embedding: &[f64]) -> Result<Vec<SubjectMatch>> {
        self.embedding_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_embeddings.load(Ordering::SeqCst) {
            return Err(PipelineError::transient("compreface", "embedding endpoint down"));
        }
        let key = embedding.first().copied().unwrap_or_default().to_bits();
        Ok(self.embedding_answers.lock().get(&key).cloned().unwrap_or_default())
    }

    fn recognize_image(&self, image: &[u8]) -> Result<Vec<RecognizedFace>> {
        self.image_calls.fetch_add(1, Ordering::SeqCst);
        if let Some((subject, _)) = self.subjects.lock().iter().find(|(_, bytes)| !bytes.is_empty() && bytes == image) {
            return Ok(vec![RecognizedFace {
                subjects: vec![SubjectMatch { subject: subject.clone(), similarity: 0.99 }],
                ..Default::default()
            }]);
        }
        let answer = self.image_answer.lock().clone();
        if answer.is_empty() {
            return Err(PipelineError::NoDetection("No face is found in the given image".to_string()));
        }
        Ok(answer)
    }

    fn add_subject(&self, subject: &str, image: &[u8]) -> Result<AddedSubject> {
        let mut subjects = self.subjects.lock();
        subjects.push((subject.to_string(), image.to_vec()));
        Ok(AddedSubject { subject: subject.to_string(), image_id: format!("img-{}", subjects.len()) })
    }

    fn list_subjects(&self) -> Result<Vec<String>> {
        Ok(self.subject_names())
    }

    fn subject_image_url(&self, image_id: &str) -> String {
        format!("http://registry/images/{}", image_id)
    }
}

/// Detection fake. Jobs complete immediately with the result configured
/// for the item id; unknown items have no faces.
#[derive(Default)]
pub struct FakeDetection {
    results: Mutex<HashMap<String, FacesResult>>,
    pub requests: Mutex<Vec<AnalyzeRequest>>,
    pub frame: Mutex<Vec<u8>>,
    pub frame_calls: Mutex<Vec<(f64, bool)>>,
    pub unhealthy: AtomicBool,
    pub failing: Mutex<Vec<String>>,
    cancel_after: Mutex<Option<(usize, CancelToken)>>,
}

impl FakeDetection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_result(&self, item_id: &str, result: FacesResult) {
        self.results.lock().insert(item_id.to_string(), result);
    }

    pub fn set_faces(&self, item_id: &str, faces: Vec<Face>) {
        self.set_result(item_id, FacesResult { faces, ..Default::default() });
    }

    pub fn fail_for(&self, item_id: &str) {
        self.failing.lock().push(item_id.to_string());
    }

    /// Cancel `token` when the `n`th job is submitted.
    pub fn cancel_on_submission(&self, n: usize, token: CancelToken) {
        *self.cancel_after.lock() = Some((n, token));
    }

    pub fn submissions(&self) -> usize {
        self.requests.lock().len()
    }
}

impl DetectionService for FakeDetection {
    fn health_check(&self) -> Result<()> {
        if self.unhealthy.load(Ordering::SeqCst) {
            return Err(PipelineError::transient("vision", "service unavailable"));
        }
        Ok(())
    }

    fn submit_job(&self, request: &AnalyzeRequest) -> Result<JobResponse> {
        let id = request.source_id.clone().or_else(|| request.scene_id.clone()).unwrap_or_default();
        let count = {
            let mut requests = self.requests.lock();
            requests.push(request.clone());
            requests.len()
        };
        if let Some((n, token)) = self.cancel_after.lock().as_ref() {
            if *n == count {
                token.cancel();
            }
        }
        if self.failing.lock().contains(&id) {
            return Err(PipelineError::transient("vision", format!("job for {} rejected", id)));
        }
        Ok(JobResponse { job_id: id, status: "queued".to_string() })
    }

    fn job_status(&self, job_id: &str) -> Result<JobStatus> {
        Ok(JobStatus { job_id: job_id.to_string(), status: "completed".to_string(), progress: 1.0, ..Default::default() })
    }

    fn job_results(&self, job_id: &str) -> Result<AnalyzeResults> {
        let faces = self.results.lock().get(job_id).cloned().unwrap_or_default();
        Ok(AnalyzeResults { job_id: job_id.to_string(), status: "completed".to_string(), faces: Some(faces) })
    }

    fn extract_frame(&self, _video_path: &str, timestamp: f64, enhancement: Option<&Enhancement>) -> Result<Vec<u8>> {
        self.frame_calls.lock().push((timestamp, enhancement.is_some()));
        Ok(self.frame.lock().clone())
    }
}

/// A JPEG with a gradient so that different regions encode differently.
pub fn jpeg(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8]));
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img).write_to(&mut out, ImageOutputFormat::Jpeg(95)).unwrap();
    out.into_inner()
}

pub fn write_jpeg(dir: &Path, name: &str, width: u32, height: u32) -> String {
    let path = dir.join(name);
    std::fs::write(&path, jpeg(width, height)).unwrap();
    path.to_string_lossy().to_string()
}

pub fn face(id: &str, bbox: BoundingBox, composite: f64, embedding_seed: Option<f64>) -> Face {
    let detection = Detection {
        bbox,
        confidence: 0.99,
        quality: Some(QualityScores {
            composite,
            components: QualityComponents { size: composite, pose: composite, occlusion: composite, sharpness: composite },
        }),
        ..Default::default()
    };
    Face {
        face_id: id.to_string(),
        embedding: embedding_seed.map(|s| vec![s; EMBEDDING_DIM]).unwrap_or_default(),
        demographics: Some(Demographics { age: 30, gender: "female".to_string(), emotion: None }),
        detections: vec![detection.clone()],
        representative_detection: detection,
    }
}

pub fn settings() -> PipelineSettings {
    PipelineSettings {
        resolver: ResolverSettings {
            min_similarity: 0.81,
            processing_quality: QualityPolicy::Composite(0.2),
            creation_quality: QualityPolicy::Composite(0.65),
        },
        min_confidence: 0.7,
        min_face_size: 64,
        enhance_quality_trigger: 0.5,
        polling: JobPolling { interval: Duration::from_millis(1), timeout: Duration::from_secs(5) },
        host_url: None,
    }
}

pub fn status_labels(store: &MemoryStore) -> StatusLabels {
    StatusLabels::resolve(store, &LabelCache::new(), &LabelNames::default()).unwrap()
}

pub fn pipeline<'a>(
    store: &'a MemoryStore,
    detection: Option<&'a FakeDetection>,
    recognition: &'a FakeRecognition,
) -> Pipeline<'a> {
    let services = Services {
        store,
        detection: detection.map(|d| d as &dyn DetectionService),
        recognition,
    };
    Pipeline::new(services, settings(), status_labels(store))
}

/// Config with credentials and a detection URL set and no waiting.
pub fn config(batch_size: usize) -> Config {
    let mut cfg = Config::from_env();
    cfg.recognition_api_key = "recognition-key".to_string();
    cfg.detection_api_key = "detection-key".to_string();
    cfg.vision_service_url = Some("http://vision-api:5010".to_string());
    cfg.max_batch_size = batch_size;
    cfg.poll_interval = Duration::from_millis(1);
    cfg.cooldown = Duration::from_secs(10);
    cfg.min_similarity = 0.81;
    cfg.processing_quality = QualityPolicy::Composite(0.2);
    cfg.creation_quality = QualityPolicy::Composite(0.65);
    cfg.stash_host_url = None;
    cfg.labels = LabelNames::default();
    cfg
}

pub fn no_sleep(_d: Duration) {}

pub fn sorted(names: &[&str]) -> Vec<String> {
    let mut v: Vec<String> = names.iter().map(|s| s.to_string()).collect();
    v.sort();
    v
}
