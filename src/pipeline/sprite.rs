//! Sprite mosaic cue lists (WebVTT thumbnails tracks).

use image::DynamicImage;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{PipelineError, Result};

static TIME_RANGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d+):(\d+):(\d+(?:\.\d+)?)\s*-->\s*(\d+):(\d+):(\d+(?:\.\d+)?)").unwrap()
});
static REGION: Lazy<Regex> = Lazy::new(|| Regex::new(r"xywh=(\d+),(\d+),(\d+),(\d+)").unwrap());

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpriteCue {
    pub start: f64,
    pub end: f64,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl SpriteCue {
    /// Cues cover `[start, end)`.
    pub fn contains(&self, t: f64) -> bool {
        t >= self.start && t < self.end
    }
}

fn seconds(h: &str, m: &str, s: &str) -> f64 {
    let h: f64 = h.parse().unwrap_or(0.0);
    let m: f64 = m.parse().unwrap_or(0.0);
    let s: f64 = s.parse().unwrap_or(0.0);
    h * 3600.0 + m * 60.0 + s
}

pub fn parse_vtt(content: &str) -> Vec<SpriteCue> {
    let mut cues = Vec::new();
    let mut pending: Option<(f64, f64)> = None;

    for line in content.lines().map(str::trim) {
        if line.is_empty() || line.starts_with("WEBVTT") {
            continue;
        }
        if let Some(c) = TIME_RANGE.captures(line) {
            pending = Some((seconds(&c[1], &c[2], &c[3]), seconds(&c[4], &c[5], &c[6])));
        }
        let Some((start, end)) = pending else { continue };
        if let Some(c) = REGION.captures(line) {
            let n = |i: usize| c[i].parse::<u32>().unwrap_or(0);
            cues.push(SpriteCue { start, end, x: n(1), y: n(2), width: n(3), height: n(4) });
            pending = None;
        }
    }
    cues
}

pub fn find_cue(cues: &[SpriteCue], timestamp: f64) -> Result<&SpriteCue> {
    cues.iter()
        .find(|c| c.contains(timestamp))
        .ok_or_else(|| PipelineError::Extraction(format!("no sprite cue covers timestamp {:.2}s", timestamp)))
}

/// A decoded sprite mosaic together with its cue list.
pub struct SpriteSheet {
    pub image: DynamicImage,
    pub cues: Vec<SpriteCue>,
}

impl SpriteSheet {
    pub fn new(image: DynamicImage, cues: Vec<SpriteCue>) -> Self {
        Self { image, cues }
    }

    /// Cut the tile covering `timestamp`. A region reaching outside the
    /// mosaic is an error, never a clipped tile.
    pub fn tile_at(&self, timestamp: f64) -> Result<DynamicImage> {
        let cue = find_cue(&self.cues, timestamp)?;
        let (w, h) = (self.image.width(), self.image.height());
        let fits = cue.width > 0
            && cue.height > 0
            && cue.x.checked_add(cue.width).map_or(false, |r| r <= w)
            && cue.y.checked_add(cue.height).map_or(false, |b| b <= h);
        if !fits {
            return Err(PipelineError::Extraction(format!(
                "sprite region {}x{}+{}+{} exceeds mosaic {}x{}",
                cue.width, cue.height, cue.x, cue.y, w, h
            )));
        }
        Ok(self.image.crop_imm(cue.x, cue.y, cue.width, cue.height))
    }
}
