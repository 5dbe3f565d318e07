//! Per-face recognition strategy.
//!
//! Strategies run in a fixed order and the first one that settles the face
//! wins:
//!
//! 1. registry lookup by embedding, when the embedding has the registry's
//!    dimensionality
//! 2. registry lookup by a padded crop of the face
//! 3. registration of a new identity, gated by the creation quality floor
//!
//! Only the top candidate of a lookup is considered, and only at or above
//! the similarity threshold.

use chrono::{Datelike, Utc};
use tracing::{debug, info, warn};

use super::extract::{crop_or_frame, FrameExtractor};
use super::quality::{assess, QualityPolicy};
use super::registry::create_subject_name;
use crate::clients::{MetadataStore, RecognitionService, SubjectMatch};
use crate::error::{PipelineError, Result};
use crate::models::media::NewPerformer;
use crate::models::vision::{Demographics, Face};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchSource {
    Embedding,
    Image,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Below a quality floor; carries the failing check.
    Quality(String),
    /// The registry matched a subject no local identity is linked to.
    UnlinkedSubject(String),
    CreationDisabled,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::Quality(reason) => write!(f, "quality: {}", reason),
            SkipReason::UnlinkedSubject(subject) => write!(f, "subject '{}' has no performer", subject),
            SkipReason::CreationDisabled => f.write_str("no match and creation disabled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Matched { performer_id: String, performer_name: String, subject: String, similarity: f64, source: MatchSource },
    Created { performer_id: String, subject: String },
    Skipped(SkipReason),
}

impl Resolution {
    pub fn performer_id(&self) -> Option<&str> {
        match self {
            Resolution::Matched { performer_id, .. } | Resolution::Created { performer_id, .. } => Some(performer_id),
            Resolution::Skipped(_) => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.performer_id().is_some()
    }

    /// Confidence in percent: the similarity for a match, 100 for a new
    /// identity, none for a skip.
    pub fn confidence(&self) -> Option<f64> {
        match self {
            Resolution::Matched { similarity, .. } => Some(similarity * 100.0),
            Resolution::Created { .. } => Some(100.0),
            Resolution::Skipped(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolverSettings {
    pub min_similarity: f64,
    pub processing_quality: QualityPolicy,
    pub creation_quality: QualityPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolveOptions {
    pub allow_create: bool,
    /// Minimum crop padding in pixels.
    pub padding: i32,
}

pub struct Resolver<'a> {
    store: &'a dyn MetadataStore,
    recognition: &'a dyn RecognitionService,
    settings: ResolverSettings,
}

/// `YYYY-01-01` for someone estimated to be `age` years old today.
pub fn birthdate_from_age(age: i32) -> Option<String> {
    if age <= 0 {
        return None;
    }
    Some(format!("{:04}-01-01", Utc::now().year() - age))
}

impl<'a> Resolver<'a> {
    pub fn new(store: &'a dyn MetadataStore, recognition: &'a dyn RecognitionService, settings: ResolverSettings) -> Self {
        Self { store, recognition, settings }
    }

    pub fn settings(&self) -> &ResolverSettings {
        &self.settings
    }

    /// Whether the face clears the floor for attempting recognition at all.
    pub fn worth_processing(&self, face: &Face) -> bool {
        assess(face.representative().quality.as_ref(), &self.settings.processing_quality).acceptable
    }

    fn top_match<'m>(&self, candidates: &'m [SubjectMatch]) -> Option<&'m SubjectMatch> {
        candidates.first().filter(|m| m.similarity >= self.settings.min_similarity)
    }

    fn by_embedding(&self, face: &Face) -> Option<Resolution> {
        let embedding = face.usable_embedding()?;
        let candidates = match self.recognition.recognize_embedding(embedding) {
            Ok(c) => c,
            Err(e) => {
                warn!("Embedding lookup failed for face {}: {}", face.face_id, e);
                return None;
            }
        };
        let best = self.top_match(&candidates)?;
        match self.store.find_performer_by_subject(&best.subject) {
            Ok(Some(performer)) => {
                info!(
                    "Matched face {} to performer {} via embedding (subject {}, similarity {:.2})",
                    face.face_id, performer.name, best.subject, best.similarity
                );
                Some(Resolution::Matched {
                    performer_id: performer.id,
                    performer_name: performer.name,
                    subject: best.subject.clone(),
                    similarity: best.similarity,
                    source: MatchSource::Embedding,
                })
            }
            Ok(None) => {
                warn!("Subject {} exists in registry but no performer is linked to it", best.subject);
                None
            }
            Err(e) => {
                warn!("Performer lookup for subject {} failed: {}", best.subject, e);
                None
            }
        }
    }

    fn by_image(&self, face: &Face, crop: &[u8]) -> Result<Option<Resolution>> {
        let recognized = match self.recognition.recognize_image(crop) {
            Ok(faces) => faces,
            Err(PipelineError::NoDetection(msg)) => {
                debug!("Registry found no face in crop of {}: {}", face.face_id, msg);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let Some(best) = recognized.first().and_then(|r| self.top_match(&r.subjects)) else {
            return Ok(None);
        };

        match self.store.find_performer_by_subject(&best.subject)? {
            Some(performer) => {
                info!(
                    "Matched face {} to performer {} (subject {}, similarity {:.2})",
                    face.face_id, performer.name, best.subject, best.similarity
                );
                Ok(Some(Resolution::Matched {
                    performer_id: performer.id,
                    performer_name: performer.name,
                    subject: best.subject.clone(),
                    similarity: best.similarity,
                    source: MatchSource::Image,
                }))
            }
            None => {
                warn!("Subject {} exists in registry but no performer is linked to it", best.subject);
                Ok(Some(Resolution::Skipped(SkipReason::UnlinkedSubject(best.subject.clone()))))
            }
        }
    }

    fn create(&self, face: &Face, crop: &[u8], source_id: &str) -> Result<Resolution> {
        let det = face.representative();
        let gate = assess(det.quality.as_ref(), &self.settings.creation_quality);
        if !gate.acceptable {
            let reason = gate.reason.unwrap_or_default();
            debug!("Not creating identity for face {}: {}", face.face_id, reason);
            return Ok(Resolution::Skipped(SkipReason::Quality(reason)));
        }

        let subject = create_subject_name(source_id);
        let added = self.recognition.add_subject(&subject, crop)?;
        let demographics = face.demographics.clone().unwrap_or_default();
        let performer = new_performer(&added.subject, &demographics, self.recognition.subject_image_url(&added.image_id));
        let performer_id = self.store.create_performer(&performer)?;
        info!(
            "Created performer {} for unknown face {} (subject {}, age {}, gender {})",
            performer_id, face.face_id, added.subject, demographics.age, demographics.gender
        );
        Ok(Resolution::Created { performer_id, subject: added.subject })
    }

    /// Settle one face. Errors are per face; the caller decides whether
    /// they fail the item.
    pub fn resolve(
        &self,
        face: &Face,
        frames: &FrameExtractor<'_>,
        source_id: &str,
        options: ResolveOptions,
    ) -> Result<Resolution> {
        let det = face.representative();
        let gate = assess(det.quality.as_ref(), &self.settings.processing_quality);
        debug!(
            "Face {}: t={:.2}s confidence={:.2} composite={:.2} size={:.2} pose={:.2} occlusion={:.2} sharpness={:.2} enhanced={}",
            face.face_id,
            det.timestamp,
            det.confidence,
            gate.composite,
            gate.size,
            gate.pose,
            gate.occlusion,
            gate.sharpness,
            det.enhanced
        );
        if !gate.acceptable {
            let reason = gate.reason.unwrap_or_default();
            debug!("Skipping face {}: {}", face.face_id, reason);
            return Ok(Resolution::Skipped(SkipReason::Quality(reason)));
        }

        if let Some(matched) = self.by_embedding(face) {
            return Ok(matched);
        }

        let frame = frames.frame_for(det)?;
        let crop = crop_or_frame(frame, &det.bbox, options.padding, &face.face_id);

        if let Some(resolution) = self.by_image(face, &crop)? {
            return Ok(resolution);
        }

        if !options.allow_create {
            return Ok(Resolution::Skipped(SkipReason::CreationDisabled));
        }
        self.create(face, &crop, source_id)
    }
}

pub fn new_performer(subject: &str, demographics: &Demographics, image_url: String) -> NewPerformer {
    NewPerformer {
        name: subject.to_string(),
        alias_list: vec![subject.to_string()],
        gender: Some(demographics.gender.clone()).filter(|g| !g.is_empty()),
        birthdate: birthdate_from_age(demographics.age),
        image: Some(image_url),
    }
}
