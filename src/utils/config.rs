use std::env;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info};

use crate::error::{PipelineError, Result};
use crate::pipeline::quality::QualityPolicy;
use crate::utils::url::resolve_service_url;

pub const DEFAULT_COMPREFACE_HOST: &str = "compreface";
pub const DEFAULT_COMPREFACE_PORT: u16 = 8000;
pub const DEFAULT_VISION_HOST: &str = "vision-api";
pub const DEFAULT_VISION_PORT: u16 = 5010;
pub const DEFAULT_STASH_HOST: &str = "host.docker.internal";
pub const DEFAULT_STASH_PORT: u16 = 9999;
pub const DEFAULT_FRAME_SERVER: &str = "http://vision-frame-server:5001";

#[derive(Clone, Debug, PartialEq)]
pub struct LabelNames {
    pub scanned: String,
    pub matched: String,
    pub partial: String,
    pub complete: String,
    pub synced: String,
}

impl Default for LabelNames {
    fn default() -> Self {
        Self {
            scanned: "Compreface Scanned".to_string(),
            matched: "Compreface Matched".to_string(),
            partial: "Compreface Partial".to_string(),
            complete: "Compreface Complete".to_string(),
            synced: "Compreface Synced".to_string(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub compreface_url: String,
    pub recognition_api_key: String,
    /// Key of the registry's detection service. Required by `validate` so a
    /// half-configured registry fails before any item; no client sends it.
    pub detection_api_key: String,
    /// Detection service; unset disables every Vision-backed flow.
    pub vision_service_url: Option<String>,
    pub frame_server_url: String,
    /// Where the host's own media URLs are reachable from the services.
    pub stash_host_url: Option<String>,
    pub cooldown: Duration,
    pub max_batch_size: usize,
    pub min_similarity: f64,
    pub min_face_size: i32,
    pub min_confidence: f64,
    pub processing_quality: QualityPolicy,
    pub creation_quality: QualityPolicy,
    pub enhance_quality_trigger: f64,
    pub poll_interval: Duration,
    pub job_timeout: Duration,
    pub labels: LabelNames,
}

fn env_policy(key: &str, default: f64) -> QualityPolicy {
    env::var(key)
        .ok()
        .and_then(|v| QualityPolicy::parse(&v))
        .unwrap_or(QualityPolicy::Composite(default))
}

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    pub fn from_env() -> Self {
        let compreface_url = env::var("FACEID_COMPREFACE_URL").unwrap_or_default();
        let recognition_api_key = env::var("FACEID_RECOGNITION_API_KEY").unwrap_or_default();
        let detection_api_key = env::var("FACEID_DETECTION_API_KEY").unwrap_or_default();
        let vision_service_url = env_string("FACEID_VISION_URL");
        let frame_server_url =
            env::var("FACEID_FRAME_SERVER_URL").unwrap_or_else(|_| DEFAULT_FRAME_SERVER.to_string());
        let stash_host_url = env_string("FACEID_STASH_HOST_URL");
        let cooldown_secs: u64 = env::var("FACEID_COOLDOWN_SECONDS").ok().and_then(|v| v.parse().ok()).unwrap_or(10);
        let max_batch_size = env::var("FACEID_MAX_BATCH_SIZE").ok().and_then(|v| v.parse().ok()).unwrap_or(20);
        let min_similarity = env::var("FACEID_MIN_SIMILARITY").ok().and_then(|v| v.parse().ok()).unwrap_or(0.81);
        let min_face_size = env::var("FACEID_MIN_FACE_SIZE").ok().and_then(|v| v.parse().ok()).unwrap_or(64);
        let min_confidence = env::var("FACEID_MIN_CONFIDENCE").ok().and_then(|v| v.parse().ok()).unwrap_or(0.7);
        let processing_quality = env_policy("FACEID_MIN_PROCESSING_QUALITY", 0.2);
        let creation_quality = env_policy("FACEID_MIN_QUALITY", 0.65);
        let enhance_quality_trigger =
            env::var("FACEID_ENHANCE_TRIGGER").ok().and_then(|v| v.parse().ok()).unwrap_or(0.5);
        let poll_secs: u64 = env::var("FACEID_POLL_INTERVAL_SECONDS").ok().and_then(|v| v.parse().ok()).unwrap_or(2);
        let timeout_secs: u64 = env::var("FACEID_JOB_TIMEOUT_SECONDS").ok().and_then(|v| v.parse().ok()).unwrap_or(3600);

        let mut labels = LabelNames::default();
        if let Some(v) = env_string("FACEID_SCANNED_LABEL") {
            labels.scanned = v;
        }
        if let Some(v) = env_string("FACEID_MATCHED_LABEL") {
            labels.matched = v;
        }
        if let Some(v) = env_string("FACEID_PARTIAL_LABEL") {
            labels.partial = v;
        }
        if let Some(v) = env_string("FACEID_COMPLETE_LABEL") {
            labels.complete = v;
        }
        if let Some(v) = env_string("FACEID_SYNCED_LABEL") {
            labels.synced = v;
        }

        Self {
            compreface_url,
            recognition_api_key,
            detection_api_key,
            vision_service_url,
            frame_server_url,
            stash_host_url,
            cooldown: Duration::from_secs(cooldown_secs),
            max_batch_size,
            min_similarity,
            min_face_size,
            min_confidence,
            processing_quality,
            creation_quality,
            enhance_quality_trigger,
            poll_interval: Duration::from_secs(poll_secs),
            job_timeout: Duration::from_secs(timeout_secs),
            labels,
        }
    }

    /// Overlay the host's plugin settings. Empty strings and non-positive
    /// numbers keep the current value.
    pub fn apply_settings(&mut self, settings: &Value) {
        let Some(map) = settings.as_object() else {
            debug!("Plugin settings are not an object, keeping defaults");
            return;
        };
        debug!("Applying {} plugin setting(s)", map.len());

        let text = |key: &str| map.get(key).and_then(Value::as_str).map(str::trim).filter(|s| !s.is_empty());
        let number = |key: &str| map.get(key).and_then(setting_number).filter(|n| *n > 0.0);

        if let Some(v) = text("comprefaceUrl") {
            self.compreface_url = v.to_string();
        }
        if let Some(v) = text("recognitionApiKey") {
            self.recognition_api_key = v.to_string();
        }
        if let Some(v) = text("detectionApiKey") {
            self.detection_api_key = v.to_string();
        }
        if let Some(v) = text("visionServiceUrl") {
            self.vision_service_url = Some(v.to_string());
        }
        if let Some(v) = text("stashHostUrl") {
            self.stash_host_url = Some(v.to_string());
        }
        if let Some(v) = number("cooldownSeconds") {
            self.cooldown = Duration::from_secs(v as u64);
        }
        if let Some(v) = number("maxBatchSize") {
            self.max_batch_size = (v as usize).max(1);
        }
        if let Some(v) = number("minSimilarity") {
            self.min_similarity = v;
        }
        if let Some(v) = number("minFaceSize") {
            self.min_face_size = v as i32;
        }
        if let Some(v) = number("minConfidenceScore") {
            self.min_confidence = v;
        }
        if let Some(v) = number("enhanceQualityScoreTrigger") {
            self.enhance_quality_trigger = v;
        }
        if let Some(policy) = map.get("minQualityScore").and_then(setting_policy) {
            self.creation_quality = policy;
        }
        if let Some(policy) = map.get("minProcessingQualityScore").and_then(setting_policy) {
            self.processing_quality = policy;
        }
        if let Some(v) = text("scannedTagName") {
            self.labels.scanned = v.to_string();
        }
        if let Some(v) = text("matchedTagName") {
            self.labels.matched = v.to_string();
        }
        if let Some(v) = text("partialTagName") {
            self.labels.partial = v.to_string();
        }
        if let Some(v) = text("completeTagName") {
            self.labels.complete = v.to_string();
        }
        if let Some(v) = text("syncedTagName") {
            self.labels.synced = v.to_string();
        }
    }

    /// Fill in service URL defaults. `server_url` is the host's own address
    /// and stands in for an unset host URL.
    pub fn resolve_urls(&mut self, server_url: &str) {
        self.compreface_url = resolve_service_url(&self.compreface_url, DEFAULT_COMPREFACE_HOST, DEFAULT_COMPREFACE_PORT);
        match self.vision_service_url.take() {
            Some(url) => {
                let url = resolve_service_url(&url, DEFAULT_VISION_HOST, DEFAULT_VISION_PORT);
                info!("Vision service configured at {}", url);
                self.vision_service_url = Some(url);
            }
            None => info!("Vision service not configured, video recognition disabled"),
        }
        self.stash_host_url = match self.stash_host_url.take() {
            Some(url) => Some(resolve_service_url(&url, DEFAULT_STASH_HOST, DEFAULT_STASH_PORT)),
            None if !server_url.is_empty() => Some(server_url.trim_end_matches('/').to_string()),
            None => None,
        };
    }

    pub fn validate(&self) -> Result<()> {
        if self.recognition_api_key.trim().is_empty() {
            return Err(PipelineError::Configuration("recognition API key is required".to_string()));
        }
        if self.detection_api_key.trim().is_empty() {
            return Err(PipelineError::Configuration("detection API key is required".to_string()));
        }
        if self.max_batch_size == 0 {
            return Err(PipelineError::Configuration("batch size must be positive".to_string()));
        }
        Ok(())
    }

    pub fn require_vision_url(&self) -> Result<&str> {
        self.vision_service_url
            .as_deref()
            .ok_or_else(|| PipelineError::Configuration("vision service URL is not configured".to_string()))
    }
}

/// Settings arrive as JSON numbers, booleans, or numeric strings.
fn setting_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn setting_policy(value: &Value) -> Option<QualityPolicy> {
    match value {
        Value::String(s) if !s.trim().is_empty() => QualityPolicy::parse(s),
        Value::String(_) | Value::Null => None,
        other => setting_number(other).map(QualityPolicy::from_floor),
    }
}
