use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Scene,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Scene => "scene",
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sprite mosaic and its cue list, published by the host for scenes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpritePaths {
    pub sprite: Option<String>,
    pub vtt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaItem {
    pub id: String,
    pub kind: MediaKind,
    pub files: Vec<String>,
    #[serde(default)]
    pub performer_ids: Vec<String>,
    #[serde(default)]
    pub label_ids: Vec<String>,
    #[serde(default)]
    pub sprite: SpritePaths,
}

impl MediaItem {
    pub fn new(kind: MediaKind, id: impl Into<String>, file: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            files: vec![file.into()],
            performer_ids: Vec::new(),
            label_ids: Vec::new(),
            sprite: SpritePaths::default(),
        }
    }

    pub fn primary_file(&self) -> Result<&str> {
        self.files
            .first()
            .map(String::as_str)
            .ok_or_else(|| PipelineError::NotFound(format!("{} {} has no files", self.kind, self.id)))
    }

    pub fn has_label(&self, label_id: &str) -> bool {
        self.label_ids.iter().any(|l| l == label_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Performer {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub alias_list: Vec<String>,
    #[serde(default)]
    pub image_path: Option<String>,
    #[serde(default)]
    pub label_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewPerformer {
    pub name: String,
    pub alias_list: Vec<String>,
    pub gender: Option<String>,
    pub birthdate: Option<String>,
    pub image: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Gallery {
    pub id: String,
    pub title: Option<String>,
    pub image_count: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Paged<T> {
    pub total: usize,
    pub items: Vec<T>,
}

impl<T> Paged<T> {
    pub fn empty() -> Self {
        Self { total: 0, items: Vec::new() }
    }
}

/// Label-based item query. All included labels must be present and no
/// excluded label may be present.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemFilter {
    pub include_labels: Vec<String>,
    pub exclude_labels: Vec<String>,
    pub gallery: Option<String>,
}

impl ItemFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn excluding(labels: &[&str]) -> Self {
        Self { exclude_labels: labels.iter().map(|s| s.to_string()).collect(), ..Self::default() }
    }

    pub fn including(label: &str) -> Self {
        Self { include_labels: vec![label.to_string()], ..Self::default() }
    }

    pub fn and_excluding(mut self, label: &str) -> Self {
        self.exclude_labels.push(label.to_string());
        self
    }

    pub fn in_gallery(gallery_id: &str) -> Self {
        Self { gallery: Some(gallery_id.to_string()), ..Self::default() }
    }

    pub fn matches(&self, item: &MediaItem) -> bool {
        self.include_labels.iter().all(|l| item.has_label(l))
            && !self.exclude_labels.iter().any(|l| item.has_label(l))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PerformerFilter {
    pub exclude_labels: Vec<String>,
    pub require_image: bool,
}

/// Merge `added` into `existing`, keeping first-seen order and dropping
/// duplicates.
pub fn merge_ids(existing: &[String], added: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(existing.len() + added.len());
    for id in existing.iter().chain(added.iter()) {
        if !out.contains(id) {
            out.push(id.clone());
        }
    }
    out
}
