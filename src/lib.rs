pub mod agent;
pub mod config;
pub mod errors;
pub mod events;
pub mod logging;
pub mod orchestrator;
pub mod plan;
pub mod publish;
pub mod retry;
pub mod store;
pub mod ui;
pub mod util;

pub use orchestrator::{BuildService, BuildStatusReport, CancelToken, Pipeline, PipelineSettings};
