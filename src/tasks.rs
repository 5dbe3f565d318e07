//! Host task surface: argument parsing and dispatch.

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::clients::labels::LabelCache;
use crate::error::{PipelineError, Result};
use crate::models::identity::IdentifyResponse;
use crate::models::media::{ItemFilter, MediaItem, MediaKind, PerformerFilter};
use crate::orchestrator::{BatchOptions, BatchResult, BatchRunner, CancelToken, PageMode};
use crate::pipeline::completion::StatusLabels;
use crate::pipeline::registry::{RegistrySync, SyncOutcome};
use crate::pipeline::{Pipeline, PipelineSettings, Services};
use crate::utils::config::Config;
use crate::utils::logging::ProgressSink;

#[derive(Debug, Clone, PartialEq)]
pub enum Task {
    SynchronizePerformers { limit: Option<usize> },
    RecognizeImages { limit: Option<usize> },
    IdentifyImages { new_only: bool, limit: Option<usize> },
    ResetUnmatched { kind: MediaKind, limit: Option<usize> },
    RecognizeScenes { new_only: bool, use_sprites: bool, limit: Option<usize> },
    IdentifyImage { image_id: String, create: bool, associate: bool },
    CreatePerformerFromImage { image_id: String, face_index: usize },
    IdentifyGallery { gallery_id: String, create: bool, limit: Option<usize> },
}

/// JSON numbers may arrive as floats; accept them when they are whole.
fn as_whole(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0 && f.fract() == 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn arg_count(args: &Value, key: &str) -> Result<Option<usize>> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(v) => match as_whole(v) {
            Some(n) => Ok(Some(n as usize)),
            None => Err(PipelineError::InvalidArgument(format!("{} must be a non-negative integer, got {}", key, v))),
        },
    }
}

/// A positive limit, or none for "no limit".
fn arg_limit(args: &Value) -> Result<Option<usize>> {
    Ok(arg_count(args, "limit")?.filter(|n| *n > 0))
}

fn arg_id(args: &Value, key: &str) -> Result<String> {
    match args.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Some(v @ Value::Number(_)) => as_whole(v)
            .map(|n| n.to_string())
            .ok_or_else(|| PipelineError::InvalidArgument(format!("{} must be an integer id, got {}", key, v))),
        _ => Err(PipelineError::InvalidArgument(format!("{} is required", key))),
    }
}

fn arg_flag(args: &Value, key: &str) -> bool {
    match args.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
        Some(v @ Value::Number(_)) => as_whole(v).map_or(false, |n| n != 0),
        _ => false,
    }
}

impl Task {
    pub fn from_args(args: &Value) -> Result<Self> {
        let mode = args.get("mode").and_then(Value::as_str).unwrap_or_default();
        let task = match mode {
            "synchronizePerformers" => Task::SynchronizePerformers { limit: arg_limit(args)? },
            "recognizeImages" => Task::RecognizeImages { limit: arg_limit(args)? },
            "identifyImagesAll" => Task::IdentifyImages { new_only: false, limit: arg_limit(args)? },
            "identifyImagesNew" => Task::IdentifyImages { new_only: true, limit: arg_limit(args)? },
            "resetUnmatchedImages" => Task::ResetUnmatched { kind: MediaKind::Image, limit: arg_limit(args)? },
            "resetUnmatchedScenes" => Task::ResetUnmatched { kind: MediaKind::Scene, limit: arg_limit(args)? },
            "recognizeNewScenes" => {
                Task::RecognizeScenes { new_only: true, use_sprites: false, limit: arg_limit(args)? }
            }
            "recognizeAllScenes" => {
                Task::RecognizeScenes { new_only: false, use_sprites: false, limit: arg_limit(args)? }
            }
            "recognizeNewSceneSprites" => {
                Task::RecognizeScenes { new_only: true, use_sprites: true, limit: arg_limit(args)? }
            }
            "recognizeAllSceneSprites" => {
                Task::RecognizeScenes { new_only: false, use_sprites: true, limit: arg_limit(args)? }
            }
            "identifyImage" => Task::IdentifyImage {
                image_id: arg_id(args, "imageId")?,
                create: arg_flag(args, "createPerformer"),
                associate: arg_flag(args, "associateExisting"),
            },
            "createPerformerFromImage" => Task::CreatePerformerFromImage {
                image_id: arg_id(args, "imageId")?,
                face_index: arg_count(args, "faceIndex")?.unwrap_or(0),
            },
            "identifyGallery" => Task::IdentifyGallery {
                gallery_id: arg_id(args, "galleryId")?,
                create: arg_flag(args, "createPerformer"),
                limit: arg_limit(args)?,
            },
            other => return Err(PipelineError::InvalidArgument(format!("unknown mode: '{}'", other))),
        };
        Ok(task)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Task::SynchronizePerformers { .. } => "performer sync",
            Task::RecognizeImages { .. } => "image recognition",
            Task::IdentifyImages { .. } => "image identification",
            Task::ResetUnmatched { .. } => "reset unmatched",
            Task::RecognizeScenes { use_sprites: false, .. } => "scene recognition",
            Task::RecognizeScenes { use_sprites: true, .. } => "scene sprite recognition",
            Task::IdentifyImage { .. } => "identify image",
            Task::CreatePerformerFromImage { .. } => "create performer from image",
            Task::IdentifyGallery { .. } => "gallery identification",
        }
    }

    /// Tasks that cannot run without the detection service.
    pub fn needs_detection(&self) -> bool {
        matches!(self, Task::RecognizeImages { .. } | Task::RecognizeScenes { .. })
    }

    /// Whether the task talks to the recognition service at all.
    fn needs_recognition(&self) -> bool {
        !matches!(self, Task::ResetUnmatched { .. })
    }

    /// Human-readable completion message for the host.
    pub fn summary(&self) -> &'static str {
        match self {
            Task::SynchronizePerformers { .. } => "Performer synchronization completed",
            Task::RecognizeImages { .. } => "Image recognition completed",
            Task::IdentifyImages { new_only: false, .. } => "Image identification completed",
            Task::IdentifyImages { new_only: true, .. } => "New image identification completed",
            Task::ResetUnmatched { kind: MediaKind::Image, .. } => "Unmatched images reset",
            Task::ResetUnmatched { kind: MediaKind::Scene, .. } => "Unmatched scenes reset",
            Task::RecognizeScenes { use_sprites: false, .. } => "Scene recognition completed",
            Task::RecognizeScenes { use_sprites: true, .. } => "Scene sprite recognition completed",
            Task::IdentifyImage { .. } => "Image identification completed",
            Task::CreatePerformerFromImage { .. } => "Performer created from image",
            Task::IdentifyGallery { .. } => "Gallery identification completed",
        }
    }
}

/// What a task hands back to the host.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum TaskOutput {
    Batch(BatchResult),
    Identities(IdentifyResponse),
}

/// Runs tasks against one set of services.
pub struct TaskRunner<'a> {
    config: &'a Config,
    services: Services<'a>,
    labels: LabelCache,
    progress: &'a dyn ProgressSink,
    cancel: CancelToken,
    sleep: &'a dyn Fn(Duration),
}

impl<'a> TaskRunner<'a> {
    pub fn new(
        config: &'a Config,
        services: Services<'a>,
        progress: &'a dyn ProgressSink,
        cancel: CancelToken,
        sleep: &'a dyn Fn(Duration),
    ) -> Self {
        Self { config, services, labels: LabelCache::new(), progress, cancel, sleep }
    }

    pub fn label_cache(&self) -> &LabelCache {
        &self.labels
    }

    /// Checks that must pass before any item is touched.
    fn preflight(&self, task: &Task) -> Result<()> {
        if task.needs_recognition() {
            self.config.validate()?;
        }
        if task.needs_detection() {
            self.config.require_vision_url()?;
            let detection = self
                .services
                .detection
                .ok_or_else(|| PipelineError::Configuration("vision service client is not available".to_string()))?;
            detection.health_check()?;
        }
        Ok(())
    }

    fn pipeline(&self) -> Result<Pipeline<'a>> {
        let labels = StatusLabels::resolve(self.services.store, &self.labels, &self.config.labels)?;
        let settings = PipelineSettings::from_config(self.config);
        Ok(Pipeline::new(self.services, settings, labels).with_sleep(self.sleep))
    }

    fn runner(&self, limit: Option<usize>, mode: PageMode, cooldown: Duration) -> BatchRunner<'_> {
        let options = BatchOptions { batch_size: self.config.max_batch_size, limit, cooldown, mode };
        BatchRunner::new(options, self.progress, &self.cancel, self.sleep)
    }

    /// Batch over media items matching `filter`.
    fn run_items<P>(
        &self,
        runner: BatchRunner<'_>,
        task: &Task,
        kind: MediaKind,
        filter: &ItemFilter,
        process: P,
    ) -> Result<BatchResult>
    where
        P: FnMut(&MediaItem) -> Result<()>,
    {
        let store = self.services.store;
        runner.run(task.name(), |page, per_page| store.find_items(kind, filter, page, per_page as i64), process)
    }

    pub fn run(&self, task: &Task) -> Result<TaskOutput> {
        info!("Starting {} ({:?})", task.name(), task);
        self.preflight(task)?;
        let cooldown = self.config.cooldown;

        let output = match task {
            Task::SynchronizePerformers { limit } => TaskOutput::Batch(self.synchronize_performers(*limit)?),

            Task::RecognizeImages { limit } => {
                let pipeline = self.pipeline()?;
                let labels = &pipeline.labels;
                let filter = ItemFilter::excluding(&[labels.scanned.as_str(), labels.complete.as_str()]);
                let runner = self.runner(*limit, PageMode::Shrinking, cooldown);
                TaskOutput::Batch(self.run_items(runner, task, MediaKind::Image, &filter, |item| {
                    pipeline.recognize_image(&item.id).map(|_| ())
                })?)
            }

            Task::IdentifyImages { new_only, limit } => {
                let pipeline = self.pipeline()?;
                let (filter, mode) = if *new_only {
                    (ItemFilter::excluding(&[pipeline.labels.scanned.as_str()]), PageMode::Shrinking)
                } else {
                    (ItemFilter::all(), PageMode::Stable)
                };
                let runner = self.runner(*limit, mode, cooldown);
                TaskOutput::Batch(self.run_items(runner, task, MediaKind::Image, &filter, |item| {
                    pipeline.identify_image(&item.id, false, true, None).map(|_| ())
                })?)
            }

            Task::ResetUnmatched { kind, limit } => {
                let pipeline = self.pipeline()?;
                let filter =
                    ItemFilter::including(&pipeline.labels.scanned).and_excluding(&pipeline.labels.matched);
                let runner = self.runner(*limit, PageMode::Shrinking, Duration::ZERO);
                TaskOutput::Batch(self.run_items(runner, task, *kind, &filter, |item| {
                    pipeline.reset_unmatched(*kind, &item.id)
                })?)
            }

            Task::RecognizeScenes { new_only, use_sprites, limit } => {
                let pipeline = self.pipeline()?;
                let (filter, mode) = if *new_only {
                    (ItemFilter::excluding(&[pipeline.labels.scanned.as_str()]), PageMode::Shrinking)
                } else {
                    (ItemFilter::all(), PageMode::Stable)
                };
                let runner = self.runner(*limit, mode, cooldown);
                let result = self.run_items(runner, task, MediaKind::Scene, &filter, |item| {
                    pipeline.recognize_scene(&item.id, *use_sprites).map(|_| ())
                });
                pipeline.request_metadata_scan();
                TaskOutput::Batch(result?)
            }

            Task::IdentifyImage { image_id, create, associate } => {
                let pipeline = self.pipeline()?;
                let result = pipeline.identify_image(image_id, *create, *associate, None)?;
                TaskOutput::Identities(IdentifyResponse { result })
            }

            Task::CreatePerformerFromImage { image_id, face_index } => {
                let pipeline = self.pipeline()?;
                let result = pipeline.identify_image(image_id, true, true, Some(*face_index))?;
                TaskOutput::Identities(IdentifyResponse { result })
            }

            Task::IdentifyGallery { gallery_id, create, limit } => {
                let gallery = self.services.store.get_gallery(gallery_id)?;
                if gallery.image_count == 0 {
                    info!("Gallery {} has no images", gallery_id);
                    return Ok(TaskOutput::Batch(BatchResult::empty()));
                }
                info!(
                    "Gallery '{}' has {} image(s)",
                    gallery.title.as_deref().unwrap_or(gallery_id),
                    gallery.image_count
                );
                let pipeline = self.pipeline()?;
                let filter = ItemFilter::in_gallery(gallery_id);
                let runner = self.runner(*limit, PageMode::Stable, cooldown);
                TaskOutput::Batch(self.run_items(runner, task, MediaKind::Image, &filter, |item| {
                    pipeline.identify_image(&item.id, *create, true, None).map(|_| ())
                })?)
            }
        };
        info!("{}", task.summary());
        Ok(output)
    }

    fn synchronize_performers(&self, limit: Option<usize>) -> Result<BatchResult> {
        let store = self.services.store;
        let synced = self.labels.find_or_create(store, &self.config.labels.synced)?;
        let mut registry = RegistrySync::load(store, self.services.recognition)?;
        let filter = PerformerFilter { exclude_labels: vec![synced.clone()], require_image: true };

        let mut registered = 0usize;
        let result = self.runner(limit, PageMode::Shrinking, self.config.cooldown).run(
            "performer sync",
            |page, per_page| store.find_performers(&filter, page, per_page as i64),
            |performer| {
                match registry.sync(performer, &synced)? {
                    SyncOutcome::Registered(subject) => {
                        registered += 1;
                        info!("Registered performer {} as {}", performer.name, subject);
                    }
                    SyncOutcome::AlreadyRegistered(subject) => {
                        info!("Performer {} already registered as {}", performer.name, subject);
                    }
                }
                Ok(())
            },
        )?;
        if result.failed > 0 {
            warn!("{} performer(s) could not be synchronized", result.failed);
        }
        info!("Registered {} new subject(s)", registered);
        Ok(result)
    }
}
