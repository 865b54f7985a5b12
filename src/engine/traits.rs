//! Runner engine trait definitions

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Environment variable a runner process reads its registration blob from
pub const JIT_CONFIG_ENV: &str = "ACTIONS_RUNNER_INPUT_JITCONFIG";

/// Error type for engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Image pull failed: {0}")]
    ImagePull(String),

    #[error("Failed to start runner {name}: {message}")]
    StartFailed { name: String, message: String },

    #[error("{0}")]
    Operation(String),

    #[error("Operation cancelled")]
    Cancelled,
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Trait abstracting the compute backend that materializes runners.
///
/// Every runner executes exactly one job and is then destroyed; there is
/// no stop or pause. Implementations track every started resource so
/// `shutdown` can tear down whatever was not individually destroyed.
#[async_trait]
pub trait RunnerEngine: Send + Sync {
    /// Launch a runner named `name` with `jit_config` exposed to the
    /// runner process as [`JIT_CONFIG_ENV`]. Returns the backend id the
    /// resource is destroyed by. On failure no resource is left behind
    /// and nothing is tracked.
    async fn start(
        &self,
        ctx: CancellationToken,
        name: &str,
        jit_config: &str,
    ) -> EngineResult<String>;

    /// Destroy the resource behind `backend_id` and clear its tracking.
    /// Destroying a resource that is already gone is not an error.
    async fn destroy(&self, ctx: CancellationToken, backend_id: &str) -> EngineResult<()>;

    /// Destroy every tracked resource. All entries are attempted and the
    /// inventory is cleared regardless of failures; the first error
    /// encountered is returned.
    async fn shutdown(&self, ctx: CancellationToken) -> EngineResult<()>;
}
