//! Pixel sources for face crops: a still image already in memory, a sprite
//! mosaic tile, or a frame pulled from the video on demand.

use std::path::Path;

use once_cell::sync::OnceCell;
use tracing::{debug, warn};

use super::orientation::{encode_jpeg, normalize_orientation};
use super::sprite::{parse_vtt, SpriteSheet};
use crate::clients::{DetectionService, MetadataStore};
use crate::error::{PipelineError, Result};
use crate::models::vision::{BoundingBox, Detection, Enhancement};

pub const SPRITE_JPEG_QUALITY: u8 = 95;
pub const CROP_JPEG_QUALITY: u8 = 90;
pub const STILL_JPEG_QUALITY: u8 = 95;

/// Padding floor as a fraction of the larger bounding box side.
const ADAPTIVE_PADDING: f64 = 0.15;

#[derive(Debug, Clone)]
pub enum FrameSource {
    Still(Vec<u8>),
    Sprite { sprite_url: String, vtt_url: String },
    Video { path: String, enhancement: Option<Enhancement> },
}

/// Hands out frame bytes for detections of one item. The sprite sheet is
/// fetched on first use and reused for every later detection.
pub struct FrameExtractor<'a> {
    store: &'a dyn MetadataStore,
    detection: Option<&'a dyn DetectionService>,
    source: FrameSource,
    sheet: OnceCell<SpriteSheet>,
}

impl<'a> FrameExtractor<'a> {
    pub fn new(store: &'a dyn MetadataStore, detection: Option<&'a dyn DetectionService>, source: FrameSource) -> Self {
        Self { store, detection, source, sheet: OnceCell::new() }
    }

    pub fn source(&self) -> &FrameSource {
        &self.source
    }

    fn sprite_sheet(&self, sprite_url: &str, vtt_url: &str) -> Result<&SpriteSheet> {
        self.sheet.get_or_try_init(|| {
            let vtt = self.store.fetch_bytes(vtt_url)?;
            let cues = parse_vtt(&String::from_utf8_lossy(&vtt));
            if cues.is_empty() {
                return Err(PipelineError::Extraction(format!("sprite cue list {} has no cues", vtt_url)));
            }
            let image_bytes = self.store.fetch_bytes(sprite_url)?;
            let image = image::load_from_memory(&image_bytes)
                .map_err(|e| PipelineError::Extraction(format!("failed to decode sprite {}: {}", sprite_url, e)))?;
            debug!("Loaded sprite {}x{} with {} cue(s)", image.width(), image.height(), cues.len());
            Ok(SpriteSheet::new(image, cues))
        })
    }

    /// Bytes of the frame holding `det`.
    pub fn frame_for(&self, det: &Detection) -> Result<Vec<u8>> {
        match &self.source {
            FrameSource::Still(bytes) => Ok(bytes.clone()),
            FrameSource::Sprite { sprite_url, vtt_url } => {
                let tile = self.sprite_sheet(sprite_url, vtt_url)?.tile_at(det.timestamp)?;
                Ok(encode_jpeg(&tile, SPRITE_JPEG_QUALITY)?)
            }
            FrameSource::Video { path, enhancement } => {
                let detection = self
                    .detection
                    .ok_or_else(|| PipelineError::Configuration("frame extraction needs the vision service".to_string()))?;
                let hint = enhancement.as_ref().filter(|_| det.enhanced);
                let bytes = detection.extract_frame(path, det.timestamp, hint)?;
                if image::guess_format(&bytes).is_err() {
                    return Err(PipelineError::Extraction(format!(
                        "frame at {:.2}s is not an image ({} bytes)",
                        det.timestamp,
                        bytes.len()
                    )));
                }
                Ok(bytes)
            }
        }
    }
}

/// Read an image from disk with its orientation applied, re-encoded as JPEG.
pub fn load_image_bytes(path: impl AsRef<Path>) -> Result<Vec<u8>> {
    let path = path.as_ref();
    let raw = std::fs::read(path)?;
    let normalized = normalize_orientation(&raw);
    let img = image::load_from_memory(&normalized)?;
    Ok(encode_jpeg(&img, STILL_JPEG_QUALITY)?)
}

/// Padding actually applied around `bbox`.
pub fn effective_padding(bbox: &BoundingBox, padding: i32) -> i32 {
    padding.max((bbox.max_dim() as f64 * ADAPTIVE_PADDING) as i32)
}

/// Crop `bbox` plus padding out of an encoded frame, clamped to the frame.
pub fn crop_face(frame: &[u8], bbox: &BoundingBox, padding: i32) -> Result<Vec<u8>> {
    let img = image::load_from_memory(frame)?;
    let (w, h) = (img.width() as i32, img.height() as i32);
    let pad = effective_padding(bbox, padding);

    let x0 = (bbox.x_min - pad).clamp(0, w);
    let y0 = (bbox.y_min - pad).clamp(0, h);
    let x1 = (bbox.x_max + pad).clamp(0, w);
    let y1 = (bbox.y_max + pad).clamp(0, h);
    if x1 <= x0 || y1 <= y0 {
        return Err(PipelineError::Extraction(format!(
            "face box ({},{})-({},{}) lies outside the {}x{} frame",
            bbox.x_min, bbox.y_min, bbox.x_max, bbox.y_max, w, h
        )));
    }

    let cropped = img.crop_imm(x0 as u32, y0 as u32, (x1 - x0) as u32, (y1 - y0) as u32);
    Ok(encode_jpeg(&cropped, CROP_JPEG_QUALITY)?)
}

/// Like `crop_face` but falls back to the whole frame.
pub fn crop_or_frame(frame: Vec<u8>, bbox: &BoundingBox, padding: i32, face_id: &str) -> Vec<u8> {
    match crop_face(&frame, bbox, padding) {
        Ok(crop) => crop,
        Err(e) => {
            warn!("Using uncropped frame for face {}: {}", face_id, e);
            frame
        }
    }
}
