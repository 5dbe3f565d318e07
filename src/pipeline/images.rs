//! Still-image flows: batch recognition and interactive identification.

use tracing::{debug, info, warn};

use super::extract::{crop_or_frame, load_image_bytes, FrameExtractor, FrameSource};
use super::registry::create_subject_name;
use super::resolver::{new_performer, ResolveOptions, Resolution};
use super::{ItemOutcome, Pipeline, IMAGE_PADDING};
use crate::clients::RecognizedFace;
use crate::error::{PipelineError, Result};
use crate::models::identity::{FaceIdentity, PerformerData};
use crate::models::media::{MediaItem, MediaKind};
use crate::models::vision::{AnalyzeRequest, BoundingBox, Demographics, Face};

/// Faces identified in one image plus the count used for completion.
struct Identified {
    identities: Vec<FaceIdentity>,
    detected: usize,
}

fn select<T>(items: Vec<T>, face_index: Option<usize>) -> Result<Vec<T>> {
    match face_index {
        None => Ok(items),
        Some(i) if i < items.len() => Ok(items.into_iter().skip(i).take(1).collect()),
        Some(i) => Err(PipelineError::InvalidArgument(format!(
            "face index {} out of range ({} face(s) detected)",
            i,
            items.len()
        ))),
    }
}

fn unlinked(image_id: &str, face: &Face) -> FaceIdentity {
    let demographics = face.demographics.clone().unwrap_or_default();
    unlinked_at(image_id, face.representative().bbox, demographics)
}

/// A face no identity is linked to: generated name, confidence 0.
fn unlinked_at(image_id: &str, bbox: BoundingBox, demographics: Demographics) -> FaceIdentity {
    FaceIdentity {
        image_id: image_id.to_string(),
        bounding_box: Some(bbox),
        performer: PerformerData {
            id: None,
            name: create_subject_name(image_id),
            age: demographics.age,
            gender: demographics.gender,
        },
        confidence: Some(0.0),
    }
}

impl<'a> Pipeline<'a> {
    /// Detect, resolve and label every face of one image. New identities
    /// are created for unmatched faces that clear the creation floor.
    pub fn recognize_image(&self, image_id: &str) -> Result<ItemOutcome> {
        let item = self.services.store.get_item(MediaKind::Image, image_id)?;
        let path = item.primary_file()?.to_string();
        info!("Recognizing image {} ({})", item.id, path);

        let request = AnalyzeRequest::for_image(&path, &item.id, self.settings.image_parameters());
        let result = self.run_detection(&request)?;
        if result.faces.is_empty() {
            info!("No faces detected in image {}", item.id);
            return self.record_resolutions(&item, &[], 0);
        }

        let resolver = self.resolver();
        let faces: Vec<&Face> = result.faces.iter().filter(|f| resolver.worth_processing(f)).collect();
        debug!("Image {}: {} of {} face(s) worth processing", item.id, faces.len(), result.faces.len());

        let resolutions = if faces.is_empty() {
            Vec::new()
        } else {
            let frames = FrameExtractor::new(
                self.services.store,
                self.services.detection,
                FrameSource::Still(load_image_bytes(&path)?),
            );
            let options = ResolveOptions { allow_create: true, padding: IMAGE_PADDING };
            self.resolve_faces(&resolver, &faces, &frames, &item.id, options)
        };
        self.record_resolutions(&item, &resolutions, faces.len())
    }

    /// Identify the faces of one image and report who they are.
    ///
    /// Uses the detection service when it is configured and healthy, else
    /// the recognition service's own whole-image detection. `face_index`
    /// picks a single face from the detected list. With `associate` the
    /// image's performers and status labels are updated as in
    /// [`Pipeline::recognize_image`].
    pub fn identify_image(
        &self,
        image_id: &str,
        create: bool,
        associate: bool,
        face_index: Option<usize>,
    ) -> Result<Vec<FaceIdentity>> {
        let item = self.services.store.get_item(MediaKind::Image, image_id)?;
        let path = item.primary_file()?.to_string();

        let identified = if self.healthy_detection() {
            match self.identify_with_detection(&item, &path, create, face_index) {
                Ok(identified) => identified,
                Err(e @ PipelineError::InvalidArgument(_)) => return Err(e),
                Err(e) => {
                    warn!("Detection service failed for image {}, using registry detection: {}", item.id, e);
                    self.identify_with_registry(&item, &path, create, face_index)?
                }
            }
        } else {
            self.identify_with_registry(&item, &path, create, face_index)?
        };

        if associate {
            let performer_ids: Vec<String> =
                identified.identities.iter().filter_map(|i| i.performer.id.clone()).filter(|id| !id.is_empty()).collect();
            self.record(&item, &performer_ids, identified.detected)?;
            info!("Processed image {} ({} performer(s) linked)", item.id, performer_ids.len());
        } else {
            info!(
                "Identified {} face(s) in image {} ({} detected, association skipped)",
                identified.identities.len(),
                item.id,
                identified.detected
            );
        }
        Ok(identified.identities)
    }

    fn healthy_detection(&self) -> bool {
        let Some(detection) = self.services.detection else {
            return false;
        };
        match detection.health_check() {
            Ok(()) => true,
            Err(e) => {
                warn!("Detection service unhealthy: {}", e);
                false
            }
        }
    }

    fn identify_with_detection(
        &self,
        item: &MediaItem,
        path: &str,
        create: bool,
        face_index: Option<usize>,
    ) -> Result<Identified> {
        let request = AnalyzeRequest::for_image(path, &item.id, self.settings.image_parameters());
        let result = self.run_detection(&request)?;
        if result.faces.is_empty() {
            info!("No faces detected in image {}", item.id);
            return Ok(Identified { identities: Vec::new(), detected: 0 });
        }

        let resolver = self.resolver();
        let detected = result.faces.iter().filter(|f| resolver.worth_processing(f)).count();
        let selected = select(result.faces.iter().collect(), face_index)?;
        let frames =
            FrameExtractor::new(self.services.store, self.services.detection, FrameSource::Still(load_image_bytes(path)?));
        let options = ResolveOptions { allow_create: create, padding: IMAGE_PADDING };

        let mut identities = Vec::with_capacity(selected.len());
        for face in selected {
            if !resolver.worth_processing(face) {
                debug!("Face {} of image {} below processing quality, omitted", face.face_id, item.id);
                continue;
            }
            let resolution = match resolver.resolve(face, &frames, &item.id, options) {
                Ok(r) => r,
                Err(e) => {
                    warn!("Failed to process face {} of image {}: {}", face.face_id, item.id, e);
                    continue;
                }
            };
            let demographics = face.demographics.clone().unwrap_or_default();
            let confidence = resolution.confidence();
            let identity = match resolution {
                Resolution::Matched { performer_id, performer_name, .. } => {
                    linked(&item.id, face, performer_id, performer_name, &demographics, confidence)
                }
                Resolution::Created { performer_id, subject } => {
                    linked(&item.id, face, performer_id, subject, &demographics, confidence)
                }
                Resolution::Skipped(reason) => {
                    debug!("Face {} of image {} not linked: {}", face.face_id, item.id, reason);
                    unlinked(&item.id, face)
                }
            };
            identities.push(identity);
        }
        info!("Image {}: identified {} face(s)", item.id, identities.len());
        Ok(Identified { identities, detected })
    }

    fn identify_with_registry(
        &self,
        item: &MediaItem,
        path: &str,
        create: bool,
        face_index: Option<usize>,
    ) -> Result<Identified> {
        let image = load_image_bytes(path)?;
        let faces = match self.services.recognition.recognize_image(&image) {
            Ok(faces) => faces,
            Err(PipelineError::NoDetection(msg)) => {
                info!("No faces found in image {}: {}", item.id, msg);
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        let detected = faces.len();
        info!("Registry found {} face(s) in image {}", detected, item.id);

        let mut identities = Vec::new();
        for (i, face) in select(faces.into_iter().enumerate().collect(), face_index)? {
            match self.registry_identity(item, &image, i, &face, create) {
                Ok(identity) => identities.push(identity),
                Err(e) => warn!("Failed to identify face {} of image {}: {}", i, item.id, e),
            }
        }
        Ok(Identified { identities, detected })
    }

    fn registry_identity(
        &self,
        item: &MediaItem,
        image: &[u8],
        index: usize,
        face: &RecognizedFace,
        create: bool,
    ) -> Result<FaceIdentity> {
        let store = self.services.store;
        let demographics = Demographics {
            age: face.age.unwrap_or_default(),
            gender: face.gender.clone().unwrap_or_default(),
            emotion: None,
        };

        if let Some(best) = face.best().filter(|m| m.similarity >= self.settings.resolver.min_similarity) {
            let Some(performer) = store.find_performer_by_subject(&best.subject)? else {
                warn!("Subject {} exists in registry but no performer is linked to it", best.subject);
                return Ok(unlinked_at(&item.id, face.bbox, demographics));
            };
            info!("Face {} of image {} matched {} ({:.2})", index, item.id, performer.name, best.similarity);
            return Ok(FaceIdentity {
                image_id: item.id.clone(),
                bounding_box: Some(face.bbox),
                performer: PerformerData {
                    id: Some(performer.id),
                    name: performer.name,
                    age: demographics.age,
                    gender: demographics.gender,
                },
                confidence: Some(best.similarity * 100.0),
            });
        }

        let min_side = face.bbox.width().min(face.bbox.height());
        if !create || min_side < self.settings.min_face_size {
            if create {
                debug!("Face {} of image {} too small to register ({} px)", index, item.id, min_side);
            }
            return Ok(unlinked_at(&item.id, face.bbox, demographics));
        }

        let crop = crop_or_frame(image.to_vec(), &face.bbox, IMAGE_PADDING, &index.to_string());
        let subject = create_subject_name(&item.id);
        let added = self.services.recognition.add_subject(&subject, &crop)?;
        let performer =
            new_performer(&added.subject, &demographics, self.services.recognition.subject_image_url(&added.image_id));
        let performer_id = store.create_performer(&performer)?;
        info!("Created performer {} ({}) for face {} of image {}", performer_id, added.subject, index, item.id);
        Ok(FaceIdentity {
            image_id: item.id.clone(),
            bounding_box: Some(face.bbox),
            performer: PerformerData {
                id: Some(performer_id),
                name: added.subject,
                age: demographics.age,
                gender: demographics.gender,
            },
            confidence: Some(100.0),
        })
    }
}

fn linked(
    image_id: &str,
    face: &Face,
    performer_id: String,
    name: String,
    demographics: &Demographics,
    confidence: Option<f64>,
) -> FaceIdentity {
    FaceIdentity {
        image_id: image_id.to_string(),
        bounding_box: Some(face.representative().bbox),
        performer: PerformerData {
            id: Some(performer_id),
            name,
            age: demographics.age,
            gender: demographics.gender.clone(),
        },
        confidence,
    }
}
