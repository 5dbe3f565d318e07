mod common;

use common::*;
use facebridge::models::media::{MediaKind, SpritePaths};
use facebridge::models::vision::{BoundingBox, Enhancement, Face, FacesResult, ResultMetadata};
use facebridge::pipeline::completion::CompletionState;

const SPRITE_URL: &str = "http://0.0.0.0:9999/scene/21/sprite";
const VTT_URL: &str = "http://0.0.0.0:9999/scene/21/vtt/thumbs";

const VTT: &str = "WEBVTT\n\n\
    00:00:00.000 --> 00:00:05.000\n\
    sprite.jpg#xywh=0,0,160,90\n\n\
    00:00:05.000 --> 00:00:10.000\n\
    sprite.jpg#xywh=160,0,160,90\n\n\
    00:00:10.000 --> 00:00:15.000\n\
    sprite.jpg#xywh=0,90,160,90\n";

fn at(mut face: Face, timestamp: f64, enhanced: bool) -> Face {
    face.representative_detection.timestamp = timestamp;
    face.representative_detection.enhanced = enhanced;
    face.detections = vec![face.representative_detection.clone()];
    face
}

fn sprite_scene(store: &MemoryStore) {
    store.add_item(MediaKind::Scene, "21", "/media/scenes/21.mp4");
    store.update_item(MediaKind::Scene, "21", |item| {
        item.sprite = SpritePaths { sprite: Some(SPRITE_URL.to_string()), vtt: Some(VTT_URL.to_string()) };
    });
    store.put_blob(VTT_URL, VTT.as_bytes().to_vec());
    store.put_blob(SPRITE_URL, jpeg(320, 180));
}

#[test]
fn test_sprite_scene_crops_from_mosaic() {
    let store = MemoryStore::new();
    sprite_scene(&store);
    let detection = FakeDetection::new();
    detection.set_result(
        "21",
        FacesResult {
            faces: vec![
                at(face("face_0", BoundingBox::new(40, 20, 120, 80), 0.9, None), 6.0, false),
                at(face("face_1", BoundingBox::new(30, 10, 110, 85), 0.8, None), 12.5, false),
            ],
            metadata: ResultMetadata { method: "sprites".into(), unique_faces: 2, ..Default::default() },
        },
    );
    let recognition = FakeRecognition::new();
    let mut pipeline = pipeline(&store, Some(&detection), &recognition);
    pipeline.settings.host_url = Some("http://host.docker.internal:9999".to_string());

    let outcome = pipeline.recognize_scene("21", true).unwrap();
    assert_eq!(outcome.detected, 2);
    assert_eq!(outcome.created, 2);
    assert_eq!(outcome.state, CompletionState::Complete);

    let requests = detection.requests.lock();
    let params = &requests[0].modules.faces.parameters;
    assert!(params.use_sprites);
    assert_eq!(params.sprite_image_url.as_deref(), Some("http://host.docker.internal:9999/scene/21/sprite"));
    assert_eq!(params.sprite_vtt_url.as_deref(), Some("http://host.docker.internal:9999/scene/21/vtt/thumbs"));
    assert_eq!(params.max_faces, 50);
    assert_eq!(params.sampling_interval, Some(2.0));
    assert!(params.enable_deduplication);
    assert_eq!(params.cache_duration, Some(3600));
    assert_eq!(requests[0].scene_id.as_deref(), Some("21"));

    assert!(detection.frame_calls.lock().is_empty());
    assert_eq!(store.item(MediaKind::Scene, "21").performer_ids.len(), 2);
    assert_eq!(
        store.label_names(MediaKind::Scene, "21"),
        sorted(&["Compreface Scanned", "Compreface Matched", "Compreface Complete"])
    );
    for created in store.created_performers() {
        assert!(created.name.starts_with("Person 21 "));
    }
}

#[test]
fn test_sprite_tile_outside_cues_leaves_face_unresolved() {
    let store = MemoryStore::new();
    sprite_scene(&store);
    let detection = FakeDetection::new();
    detection.set_result(
        "21",
        FacesResult {
            faces: vec![at(face("face_0", BoundingBox::new(40, 20, 120, 80), 0.9, None), 99.0, false)],
            metadata: ResultMetadata { method: "sprites".into(), ..Default::default() },
        },
    );
    let recognition = FakeRecognition::new();
    let pipeline = pipeline(&store, Some(&detection), &recognition);

    let outcome = pipeline.recognize_scene("21", true).unwrap();
    assert_eq!(outcome.detected, 1);
    assert_eq!(outcome.resolved, 0);
    assert_eq!(outcome.state, CompletionState::Partial);
    assert!(recognition.subject_names().is_empty());
}

#[test]
fn test_video_scene_extracts_frames_with_enhancement_hint() {
    let store = MemoryStore::new();
    store.add_item(MediaKind::Scene, "30", "/media/scenes/30.mp4");
    let alice = store.add_performer("Alice", &["Person 4 AAAAAAAAAAAAAAAA"], None);

    let detection = FakeDetection::new();
    *detection.frame.lock() = jpeg(640, 360);
    detection.set_result(
        "30",
        FacesResult {
            faces: vec![
                at(face("face_0", BoundingBox::new(100, 80, 220, 230), 0.9, Some(0.3)), 14.0, true),
                at(face("face_1", BoundingBox::new(400, 90, 520, 250), 0.9, None), 42.0, false),
            ],
            metadata: ResultMetadata {
                method: "frames".into(),
                frame_enhancement: Some(Enhancement::codeformer(0.5)),
                ..Default::default()
            },
        },
    );
    let recognition = FakeRecognition::new();
    recognition.on_embedding(0.3, "Person 4 AAAAAAAAAAAAAAAA", 0.9);
    let pipeline = pipeline(&store, Some(&detection), &recognition);

    let outcome = pipeline.recognize_scene("30", false).unwrap();
    assert_eq!(outcome.resolved, 2);
    assert_eq!(outcome.created, 1);

    // The embedding match needs no frame; only the unknown face is extracted.
    assert_eq!(*detection.frame_calls.lock(), vec![(42.0, false)]);
    let requests = detection.requests.lock();
    assert!(!requests[0].modules.faces.parameters.use_sprites);
    assert!(requests[0].modules.faces.parameters.sprite_image_url.is_none());
    assert!(store.item(MediaKind::Scene, "30").performer_ids.contains(&alice));
}

#[test]
fn test_enhanced_detection_passes_hint_to_extraction() {
    let store = MemoryStore::new();
    store.add_item(MediaKind::Scene, "31", "/media/scenes/31.mp4");
    let detection = FakeDetection::new();
    *detection.frame.lock() = jpeg(640, 360);
    detection.set_result(
        "31",
        FacesResult {
            faces: vec![at(face("face_0", BoundingBox::new(100, 80, 220, 230), 0.9, None), 8.0, true)],
            metadata: ResultMetadata {
                method: "frames".into(),
                frame_enhancement: Some(Enhancement::codeformer(0.5)),
                ..Default::default()
            },
        },
    );
    let recognition = FakeRecognition::new();
    let pipeline = pipeline(&store, Some(&detection), &recognition);

    pipeline.recognize_scene("31", false).unwrap();
    assert_eq!(*detection.frame_calls.lock(), vec![(8.0, true)]);
}

#[test]
fn test_sprite_request_without_sprite_uses_video() {
    let store = MemoryStore::new();
    store.add_item(MediaKind::Scene, "40", "/media/scenes/40.mp4");
    let detection = FakeDetection::new();
    let recognition = FakeRecognition::new();
    let pipeline = pipeline(&store, Some(&detection), &recognition);

    let outcome = pipeline.recognize_scene("40", true).unwrap();
    assert_eq!(outcome.detected, 0);
    assert_eq!(outcome.state, CompletionState::Complete);
    let requests = detection.requests.lock();
    assert_eq!(requests.len(), 1);
    assert!(!requests[0].modules.faces.parameters.use_sprites);
    assert_eq!(
        store.label_names(MediaKind::Scene, "40"),
        sorted(&["Compreface Scanned", "Compreface Complete"])
    );
}

#[test]
fn test_scene_rerun_matches_created_identities() {
    let store = MemoryStore::new();
    store.add_item(MediaKind::Scene, "50", "/media/scenes/50.mp4");
    let detection = FakeDetection::new();
    *detection.frame.lock() = jpeg(640, 360);
    detection.set_faces("50", vec![at(face("face_0", BoundingBox::new(100, 80, 220, 230), 0.9, None), 3.0, false)]);
    let recognition = FakeRecognition::new();
    let pipeline = pipeline(&store, Some(&detection), &recognition);

    let first = pipeline.recognize_scene("50", false).unwrap();
    assert_eq!(first.created, 1);
    let second = pipeline.recognize_scene("50", false).unwrap();
    assert_eq!(second.created, 0);
    assert_eq!(second.resolved, 1);
    assert_eq!(store.performer_count(), 1);
    assert_eq!(store.item(MediaKind::Scene, "50").performer_ids.len(), 1);
}
