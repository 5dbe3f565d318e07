//! Scene recognition over sprite mosaics or pulled video frames.

use tracing::{debug, info, warn};

use super::extract::{FrameExtractor, FrameSource};
use super::resolver::ResolveOptions;
use super::{ItemOutcome, Pipeline, SCENE_PADDING};
use crate::error::Result;
use crate::models::media::{MediaItem, MediaKind};
use crate::models::vision::{AnalyzeRequest, Face, ResultMetadata};

/// Sprite sheet and cue list URLs of a scene, if it has both.
fn sprite_urls(item: &MediaItem) -> Option<(String, String)> {
    match (&item.sprite.sprite, &item.sprite.vtt) {
        (Some(sprite), Some(vtt)) if !sprite.is_empty() && !vtt.is_empty() => Some((sprite.clone(), vtt.clone())),
        _ => None,
    }
}

/// Where face crops come from: the sprite sheet when detection ran on it,
/// otherwise frames pulled from the video.
fn frame_source(path: &str, sprite: Option<(String, String)>, metadata: &ResultMetadata) -> FrameSource {
    match sprite {
        Some((sprite_url, vtt_url)) if metadata.used_sprites() => FrameSource::Sprite { sprite_url, vtt_url },
        _ => FrameSource::Video { path: path.to_string(), enhancement: metadata.frame_enhancement.clone() },
    }
}

impl<'a> Pipeline<'a> {
    /// Detect, resolve and label the unique faces of one scene. With
    /// `use_sprites` the detection service samples the scene's sprite sheet
    /// instead of decoding the video.
    pub fn recognize_scene(&self, scene_id: &str, use_sprites: bool) -> Result<ItemOutcome> {
        let item = self.services.store.get_item(MediaKind::Scene, scene_id)?;
        let path = item.primary_file()?.to_string();

        let sprite = if use_sprites {
            let urls = sprite_urls(&item);
            if urls.is_none() {
                warn!("Scene {} has no sprite, analyzing the video instead", item.id);
            }
            urls
        } else {
            None
        };
        let published = sprite
            .as_ref()
            .map(|(image, vtt)| (self.settings.normalize_url(image), self.settings.normalize_url(vtt)));
        info!("Recognizing scene {} ({}, sprites: {})", item.id, path, published.is_some());

        let request = AnalyzeRequest::for_scene(&path, &item.id, self.settings.scene_parameters(published));
        let result = self.run_detection(&request)?;
        let metadata = &result.metadata;
        debug!(
            "Scene {}: {} unique face(s) from {} detection(s) over {} frame(s) via {} in {:.1}s",
            item.id,
            metadata.unique_faces,
            metadata.total_detections,
            metadata.frames_processed,
            metadata.method,
            metadata.processing_time_seconds
        );
        if result.faces.is_empty() {
            info!("No faces detected in scene {}", item.id);
            return self.record_resolutions(&item, &[], 0);
        }

        let resolver = self.resolver();
        let faces: Vec<&Face> = result.faces.iter().filter(|f| resolver.worth_processing(f)).collect();
        let frames =
            FrameExtractor::new(self.services.store, self.services.detection, frame_source(&path, sprite, metadata));
        let options = ResolveOptions { allow_create: true, padding: SCENE_PADDING };
        let resolutions = self.resolve_faces(&resolver, &faces, &frames, &item.id, options);
        self.record_resolutions(&item, &resolutions, faces.len())
    }
}
