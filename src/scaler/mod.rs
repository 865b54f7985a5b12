//! Runner reconciliation module
//!
//! The scaler binds upstream lifecycle events to engine operations: it
//! tracks the idle/busy runner inventory, provisions runners when demand
//! grows, and destroys each runner when its single job completes.

mod metrics;
mod scaler;

pub use metrics::ScalerMetrics;
pub use scaler::{Scaler, ScalerError};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::github::ApiResult;

/// Source of just-in-time registration configs for named runners.
///
/// Implemented by the upstream client; a runner process must receive the
/// returned blob in its environment before it will register.
#[async_trait]
pub trait JitConfigSource: Send + Sync {
    async fn generate_jit_config(
        &self,
        ctx: &CancellationToken,
        name: &str,
        scale_set_id: i64,
    ) -> ApiResult<String>;
}
