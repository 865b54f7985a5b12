//! Compute engine module
//!
//! A runner engine materializes ephemeral runners on a compute substrate.
//! Backends are selected by configuration at process start-up.

mod docker;
mod gcp;
mod traits;

pub use docker::DockerEngine;
pub use gcp::GcpEngine;
pub use traits::{EngineError, EngineResult, RunnerEngine, JIT_CONFIG_ENV};

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::config::{Configuration, EngineKind};

/// Build the engine selected by the configuration
pub async fn build(
    ctx: &CancellationToken,
    config: &Configuration,
) -> Result<Arc<dyn RunnerEngine>> {
    match config.engine.enabled_engine()? {
        EngineKind::Docker => {
            let engine = DockerEngine::new(ctx, config.engine.docker.clone()).await?;
            Ok(Arc::new(engine))
        }
        EngineKind::Gcp => {
            let engine = GcpEngine::new(config.engine.gcp.clone()).await?;
            Ok(Arc::new(engine))
        }
    }
}
