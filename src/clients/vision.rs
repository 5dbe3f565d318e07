//! Detection service: asynchronous face analysis jobs and on-demand frame
//! extraction.

use std::time::{Duration, Instant};

use reqwest::blocking::{Client, Response};
use reqwest::StatusCode;
use tracing::{debug, info};

use super::DetectionService;
use crate::error::{PipelineError, Result};
use crate::models::vision::{AnalyzeRequest, AnalyzeResults, Enhancement, FacesResult, JobResponse, JobStatus};

const SERVICE: &str = "vision";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

pub struct VisionClient {
    base_url: String,
    frame_server_url: String,
    http: Client,
}

impl VisionClient {
    pub fn new(base_url: &str, frame_server_url: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| PipelineError::Configuration(format!("failed to build vision HTTP client: {}", e)))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            frame_server_url: frame_server_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn require_status(&self, resp: Response, expected: &[StatusCode]) -> Result<Response> {
        let status = resp.status();
        if expected.contains(&status) {
            return Ok(resp);
        }
        let body = resp.text().unwrap_or_default();
        Err(PipelineError::transient(SERVICE, format!("unexpected status {}: {}", status.as_u16(), body.trim())))
    }
}

impl DetectionService for VisionClient {
    fn health_check(&self) -> Result<()> {
        let resp = self.http.get(format!("{}/health", self.base_url)).send()?;
        let resp = self.require_status(resp, &[StatusCode::OK])?;
        let health: serde_json::Value = resp.json()?;
        debug!("Vision service health: {}", health);
        Ok(())
    }

    fn submit_job(&self, request: &AnalyzeRequest) -> Result<JobResponse> {
        let url = format!("{}/vision/analyze", self.base_url);
        debug!("Submitting vision job to {}: source={}", url, request.source);
        let resp = self.http.post(&url).json(request).send()?;
        let resp = self.require_status(resp, &[StatusCode::ACCEPTED, StatusCode::OK])?;
        let job: JobResponse = resp.json()?;
        info!("Vision job submitted: job_id={}", job.job_id);
        Ok(job)
    }

    fn job_status(&self, job_id: &str) -> Result<JobStatus> {
        let url = format!("{}/vision/jobs/{}/status", self.base_url, urlencoding::encode(job_id));
        let resp = self.require_status(self.http.get(url).send()?, &[StatusCode::OK])?;
        Ok(resp.json()?)
    }

    fn job_results(&self, job_id: &str) -> Result<AnalyzeResults> {
        let url = format!("{}/vision/jobs/{}/results", self.base_url, urlencoding::encode(job_id));
        let resp = self.http.get(url).send()?;
        if resp.status() == StatusCode::CONFLICT {
            return Err(PipelineError::transient(SERVICE, format!("job {} not completed yet", job_id)));
        }
        let resp = self.require_status(resp, &[StatusCode::OK])?;
        Ok(resp.json()?)
    }

    fn extract_frame(&self, video_path: &str, timestamp: f64, enhancement: Option<&Enhancement>) -> Result<Vec<u8>> {
        let url = frame_url(&self.frame_server_url, video_path, timestamp, enhancement);
        debug!("Extracting frame: {}", url);
        let resp = self.http.get(&url).send()?;
        let resp = self.require_status(resp, &[StatusCode::OK])?;
        let bytes = resp.bytes()?;
        if bytes.is_empty() {
            return Err(PipelineError::Extraction(format!("frame server returned no data for {:.2}s", timestamp)));
        }
        Ok(bytes.to_vec())
    }
}

/// Frame server request URL. Enhancement parameters are only sent for an
/// enabled enhancement.
pub fn frame_url(frame_server: &str, video_path: &str, timestamp: f64, enhancement: Option<&Enhancement>) -> String {
    let mut url = format!(
        "{}/extract-frame?video_path={}&timestamp={:.2}&output_format=jpeg&quality=95",
        frame_server.trim_end_matches('/'),
        urlencoding::encode(video_path),
        timestamp
    );
    if let Some(e) = enhancement.filter(|e| e.enabled) {
        url.push_str(&format!("&enhance=1&model={}&fidelity_weight={}", urlencoding::encode(&e.model), e.fidelity_weight));
    }
    url
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JobPolling {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for JobPolling {
    fn default() -> Self {
        Self { interval: Duration::from_secs(2), timeout: Duration::from_secs(3600) }
    }
}

/// Submit a job and block until it completes, fails or times out. `sleep`
/// waits between polls; time spent in it counts toward the timeout.
pub fn analyze(
    service: &dyn DetectionService,
    request: &AnalyzeRequest,
    polling: JobPolling,
    sleep: &dyn Fn(Duration),
) -> Result<FacesResult> {
    let job = service.submit_job(request)?;
    if job.job_id.is_empty() {
        return Err(PipelineError::transient(SERVICE, "job submission returned no job id"));
    }
    let started = Instant::now();
    let mut waited = Duration::ZERO;
    info!("Waiting for vision job {} to complete", job.job_id);

    loop {
        let status = service.job_status(&job.job_id)?;
        match status.stage.as_deref() {
            Some(stage) => debug!(
                "Job {}: status={}, stage={}, progress={:.1}%",
                job.job_id,
                status.status,
                stage,
                status.progress * 100.0
            ),
            None => debug!("Job {}: status={}, progress={:.1}%", job.job_id, status.status, status.progress * 100.0),
        }

        match status.status.as_str() {
            "completed" => {
                info!("Vision job {} completed", job.job_id);
                let faces = service.job_results(&job.job_id)?.into_faces();
                return Ok(faces);
            }
            "failed" => {
                let reason = status.error.or(status.message).unwrap_or_else(|| "unknown error".to_string());
                return Err(PipelineError::transient(SERVICE, format!("job {} failed: {}", job.job_id, reason)));
            }
            _ => {}
        }

        if started.elapsed().max(waited) >= polling.timeout {
            return Err(PipelineError::transient(
                SERVICE,
                format!("job {} timed out after {}s", job.job_id, polling.timeout.as_secs()),
            ));
        }
        sleep(polling.interval);
        waited += polling.interval;
    }
}
