use std::io::{Read, Write};

use anyhow::Context;
use facebridge::clients::compreface::CompreFaceClient;
use facebridge::clients::stash::{ServerConnection, StashClient};
use facebridge::clients::vision::VisionClient;
use facebridge::clients::DetectionService;
use facebridge::orchestrator::{thread_sleep, CancelToken};
use facebridge::pipeline::Services;
use facebridge::tasks::{Task, TaskOutput, TaskRunner};
use facebridge::utils::config::Config;
use facebridge::utils::logging::{self, HostProgress};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

const PLUGIN_ID: &str = "compreface-rpc";

#[derive(Debug, Deserialize)]
struct PluginInput {
    #[serde(default)]
    server_connection: ServerConnection,
    #[serde(default)]
    args: Value,
}

fn run(input: PluginInput) -> anyhow::Result<TaskOutput> {
    let task = Task::from_args(&input.args).context("invalid task arguments")?;

    let stash = StashClient::new(input.server_connection).context("failed to build metadata store client")?;
    let mut cfg = Config::from_env();
    match stash.plugin_settings(PLUGIN_ID) {
        Ok(settings) => cfg.apply_settings(&settings),
        Err(e) => warn!("Could not load plugin settings, using defaults: {}", e),
    }
    cfg.resolve_urls(&stash.connection().base_url());

    let recognition = CompreFaceClient::new(&cfg.compreface_url, &cfg.recognition_api_key)
        .context("failed to build recognition client")?;
    let vision = match cfg.vision_service_url.as_deref() {
        Some(url) => Some(VisionClient::new(url, &cfg.frame_server_url).context("failed to build vision client")?),
        None => None,
    };

    let services = Services {
        store: &stash,
        detection: vision.as_ref().map(|v| v as &dyn DetectionService),
        recognition: &recognition,
    };
    let progress = HostProgress;
    let runner = TaskRunner::new(&cfg, services, &progress, CancelToken::new(), &thread_sleep);
    info!("Running {} against {}", task.name(), stash.connection().base_url());
    Ok(runner.run(&task)?)
}

fn main() -> anyhow::Result<()> {
    logging::init();

    let mut raw = String::new();
    std::io::stdin().read_to_string(&mut raw).context("failed to read plugin input")?;
    let input: PluginInput = serde_json::from_str(&raw).context("failed to parse plugin input")?;

    let response = match run(input) {
        Ok(output) => json!({ "output": output }),
        Err(e) => {
            error!("Task failed: {:#}", e);
            json!({ "error": format!("{:#}", e) })
        }
    };

    let mut out = std::io::stdout().lock();
    serde_json::to_writer(&mut out, &response)?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}
