pub mod artifacts;
pub mod config;
pub mod errors;
pub mod events;
pub mod executor;
pub mod logging;
pub mod orchestrator;
pub mod process;
pub mod resolver;
pub mod stage;
pub mod task;
pub mod tracker;
pub mod validation;
pub mod workflow_config;
