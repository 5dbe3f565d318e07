pub mod error;
pub mod utils;
pub mod stats;
pub mod models;
pub mod clients;
pub mod pipeline;
pub mod orchestrator;
pub mod tasks;

pub use error::{PipelineError, Result};
