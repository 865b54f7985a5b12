//! hangar library
//!
//! Core functionality for the runner autoscaling daemon: configuration,
//! the upstream Actions service client, the compute engines, and the
//! reconciliation state machine.

pub mod config;
pub mod engine;
pub mod github;
pub mod scaler;
pub mod telemetry;

// Re-export commonly used types
pub use config::Configuration;
pub use engine::{EngineError, RunnerEngine};
pub use scaler::Scaler;
