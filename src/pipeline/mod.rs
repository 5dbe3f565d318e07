pub mod completion;
pub mod extract;
pub mod images;
pub mod orientation;
pub mod quality;
pub mod registry;
pub mod resolver;
pub mod scenes;
pub mod sprite;

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::clients::vision::{analyze, JobPolling};
use crate::clients::{DetectionService, MetadataStore, RecognitionService};
use crate::error::{PipelineError, Result};
use crate::models::media::{merge_ids, MediaItem, MediaKind};
use crate::models::vision::{AnalyzeRequest, Enhancement, Face, FacesParameters, FacesResult};
use crate::orchestrator::thread_sleep;
use crate::utils::config::Config;
use completion::{apply_completion, CompletionState, StatusLabels};
use quality::QualityPolicy;
use extract::FrameExtractor;
use resolver::{ResolveOptions, Resolution, Resolver, ResolverSettings};

/// Crop padding for still images.
pub const IMAGE_PADDING: i32 = 20;
/// Crop padding for video frames and sprite tiles.
pub const SCENE_PADDING: i32 = 10;

pub const IMAGE_MAX_FACES: u32 = 10;
pub const SCENE_MAX_FACES: u32 = 50;
pub const SCENE_SAMPLING_INTERVAL: f64 = 2.0;
pub const SCENE_DEDUP_THRESHOLD: f64 = 0.6;
pub const SCENE_CACHE_SECONDS: u32 = 3600;

/// The three external collaborators of one task.
#[derive(Clone, Copy)]
pub struct Services<'a> {
    pub store: &'a dyn MetadataStore,
    pub detection: Option<&'a dyn DetectionService>,
    pub recognition: &'a dyn RecognitionService,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub resolver: ResolverSettings,
    pub min_confidence: f64,
    /// Smallest face side the registry fallback will register.
    pub min_face_size: i32,
    pub enhance_quality_trigger: f64,
    pub polling: JobPolling,
    /// Replaces bind-all addresses in host-published URLs.
    pub host_url: Option<String>,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            resolver: ResolverSettings {
                min_similarity: config.min_similarity,
                processing_quality: config.processing_quality,
                creation_quality: config.creation_quality,
            },
            min_confidence: config.min_confidence,
            min_face_size: config.min_face_size,
            enhance_quality_trigger: config.enhance_quality_trigger,
            polling: JobPolling { interval: config.poll_interval, timeout: config.job_timeout },
            host_url: config.stash_host_url.clone(),
        }
    }

    fn quality_floor(&self) -> f64 {
        match self.resolver.processing_quality {
            QualityPolicy::Composite(floor) => floor,
            QualityPolicy::Components(_) => 0.0,
        }
    }

    pub fn image_parameters(&self) -> FacesParameters {
        FacesParameters {
            face_min_confidence: self.min_confidence,
            face_min_quality: self.quality_floor(),
            max_faces: IMAGE_MAX_FACES,
            detect_demographics: true,
            enhancement: Some(Enhancement::codeformer(self.enhance_quality_trigger)),
            ..Default::default()
        }
    }

    pub fn scene_parameters(&self, sprite: Option<(String, String)>) -> FacesParameters {
        let (sprite_image_url, sprite_vtt_url) = match sprite {
            Some((image, vtt)) => (Some(image), Some(vtt)),
            None => (None, None),
        };
        FacesParameters {
            face_min_confidence: self.min_confidence,
            face_min_quality: self.quality_floor(),
            max_faces: SCENE_MAX_FACES,
            sampling_interval: Some(SCENE_SAMPLING_INTERVAL),
            use_sprites: sprite_image_url.is_some(),
            sprite_vtt_url,
            sprite_image_url,
            enable_deduplication: true,
            embedding_similarity_threshold: Some(SCENE_DEDUP_THRESHOLD),
            detect_demographics: true,
            cache_duration: Some(SCENE_CACHE_SECONDS),
            enhancement: Some(Enhancement::codeformer(self.enhance_quality_trigger)),
        }
    }

    pub fn normalize_url(&self, url: &str) -> String {
        match &self.host_url {
            Some(host) => crate::utils::url::normalize_host(url, host),
            None => url.to_string(),
        }
    }
}

/// Counts for one processed item.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemOutcome {
    pub detected: usize,
    pub resolved: usize,
    pub created: usize,
    pub state: CompletionState,
}

/// Per-task processing context shared by the image and scene flows.
pub struct Pipeline<'a> {
    pub services: Services<'a>,
    pub settings: PipelineSettings,
    pub labels: StatusLabels,
    /// Waits between detection job polls.
    pub sleep: &'a dyn Fn(Duration),
}

impl<'a> Pipeline<'a> {
    pub fn new(services: Services<'a>, settings: PipelineSettings, labels: StatusLabels) -> Self {
        Self { services, settings, labels, sleep: &thread_sleep }
    }

    pub fn with_sleep(mut self, sleep: &'a dyn Fn(Duration)) -> Self {
        self.sleep = sleep;
        self
    }

    pub fn resolver(&self) -> Resolver<'a> {
        Resolver::new(self.services.store, self.services.recognition, self.settings.resolver)
    }

    fn detection(&self) -> Result<&'a dyn DetectionService> {
        self.services
            .detection
            .ok_or_else(|| PipelineError::Configuration("vision service is not configured".to_string()))
    }

    /// Run a detection job. A service-side "no faces" answer is an empty
    /// result, not an error.
    fn run_detection(&self, request: &AnalyzeRequest) -> Result<FacesResult> {
        match analyze(self.detection()?, request, self.settings.polling, self.sleep) {
            Err(PipelineError::NoDetection(msg)) => {
                debug!("No faces in {}: {}", request.source, msg);
                Ok(FacesResult::default())
            }
            other => other,
        }
    }

    /// Resolve faces one by one. A failing face is logged and left
    /// unresolved; it never fails the item.
    fn resolve_faces(
        &self,
        resolver: &Resolver<'_>,
        faces: &[&Face],
        frames: &FrameExtractor<'_>,
        source_id: &str,
        options: ResolveOptions,
    ) -> Vec<Resolution> {
        let mut resolutions = Vec::with_capacity(faces.len());
        for (i, face) in faces.iter().enumerate() {
            debug!("Resolving face {}/{} ({}) of {}", i + 1, faces.len(), face.face_id, source_id);
            match resolver.resolve(face, frames, source_id, options) {
                Ok(resolution) => {
                    if let Resolution::Skipped(reason) = &resolution {
                        debug!("Face {} unresolved: {}", face.face_id, reason);
                    }
                    resolutions.push(resolution);
                }
                Err(e) => warn!("Failed to process face {} of {}: {}", face.face_id, source_id, e),
            }
        }
        resolutions
    }

    /// Link performers, then write Scanned, Matched and the completion label.
    /// `performer_ids` has one entry per resolved face.
    fn record(&self, item: &MediaItem, performer_ids: &[String], detected: usize) -> Result<CompletionState> {
        let store = self.services.store;
        store.add_label(item.kind, &item.id, &self.labels.scanned)?;

        let resolved = performer_ids.len();
        if resolved > 0 {
            let merged = merge_ids(&item.performer_ids, performer_ids);
            if merged != item.performer_ids {
                store.set_performers(item.kind, &item.id, &merged)?;
            }
            store.add_label(item.kind, &item.id, &self.labels.matched)?;
            info!("{} {}: {} face(s) linked to performers", item.kind, item.id, resolved);
        }

        apply_completion(store, &self.labels, item.kind, &item.id, detected, resolved)
    }

    fn record_resolutions(&self, item: &MediaItem, resolutions: &[Resolution], detected: usize) -> Result<ItemOutcome> {
        let performer_ids: Vec<String> =
            resolutions.iter().filter_map(|r| r.performer_id().map(str::to_string)).collect();
        let created = resolutions.iter().filter(|r| matches!(r, Resolution::Created { .. })).count();
        let state = self.record(item, &performer_ids, detected)?;
        Ok(ItemOutcome { detected, resolved: performer_ids.len(), created, state })
    }

    /// Remove Scanned from an item that has it without Matched.
    pub fn reset_unmatched(&self, kind: MediaKind, item_id: &str) -> Result<()> {
        self.services.store.remove_label(kind, item_id, &self.labels.scanned)?;
        info!("Reset scanned label on {} {}", kind, item_id);
        Ok(())
    }

    /// Ask the host to rescan its library. Failure is not fatal.
    pub fn request_metadata_scan(&self) {
        match self.services.store.trigger_metadata_scan() {
            Ok(()) => info!("Requested metadata scan"),
            Err(e) => warn!("Failed to trigger metadata scan: {}", e),
        }
    }
}
