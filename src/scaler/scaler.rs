//! Reconciliation state machine

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::{EngineError, RunnerEngine};
use crate::github::ApiError;

use super::{JitConfigSource, ScalerMetrics};

/// Errors surfaced from scaler operations. The upstream listener decides
/// whether a failed reconciliation tick is retried; nothing is retried
/// here.
#[derive(Debug, thiserror::Error)]
pub enum ScalerError {
    #[error("JIT config request failed: {0}")]
    Jit(#[from] ApiError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Runner inventory, keyed by runner name, valued by backend id.
///
/// A name appears in at most one of the two maps. Runners enter `idle`
/// on start, move to `busy` when their job starts, and leave the
/// inventory when the job completes.
#[derive(Default)]
struct Inventory {
    idle: HashMap<String, String>,
    busy: HashMap<String, String>,
}

impl Inventory {
    fn total(&self) -> usize {
        self.idle.len() + self.busy.len()
    }
}

/// The scaler maps upstream lifecycle events onto engine operations.
///
/// Every operation is safe to call concurrently; the inventory mutex is
/// only held for map reads and writes, never across engine or upstream
/// calls.
pub struct Scaler {
    jit: Arc<dyn JitConfigSource>,
    engine: Arc<dyn RunnerEngine>,
    scale_set_id: i64,
    min_runners: usize,
    max_runners: usize,
    inventory: Mutex<Inventory>,
    metrics: ScalerMetrics,
}

impl Scaler {
    pub fn new(
        jit: Arc<dyn JitConfigSource>,
        engine: Arc<dyn RunnerEngine>,
        scale_set_id: i64,
        min_runners: usize,
        max_runners: usize,
        metrics: ScalerMetrics,
    ) -> Self {
        Self {
            jit,
            engine,
            scale_set_id,
            min_runners,
            max_runners,
            inventory: Mutex::new(Inventory::default()),
            metrics,
        }
    }

    /// Current `(idle, busy)` inventory sizes
    pub fn counts(&self) -> (usize, usize) {
        let inventory = self.inventory.lock();
        (inventory.idle.len(), inventory.busy.len())
    }

    /// Reconcile the inventory against a new desired runner count.
    ///
    /// The target is `min(max_runners, min_runners + desired)`. Growth is
    /// provisioned immediately; excess supply is never destroyed here and
    /// instead drains as jobs complete, because actively removing idle
    /// runners would race the next job assignment.
    pub async fn handle_desired_runner_count(
        &self,
        ctx: &CancellationToken,
        desired: usize,
    ) -> Result<usize, ScalerError> {
        let target = self.max_runners.min(self.min_runners + desired);

        let (current, delta) = {
            let inventory = self.inventory.lock();
            let current = inventory.total();
            (current, target.saturating_sub(current))
        };

        if delta > 0 {
            info!(desired, target, current, delta, "Scaling up");
            self.metrics.scale_event("up");

            for _ in 0..delta {
                // A failed start aborts the batch; runners already
                // started stay in inventory
                let name = self.start_one(ctx).await?;
                debug!(runner = %name, "Provisioned runner");
            }
        } else if target < current {
            info!(desired, target, current, "Scale-down signalled; waiting for jobs to drain");
            self.metrics.scale_event("down");
        } else {
            debug!(desired, target, current, "Inventory already at target");
            self.metrics.scale_event("none");
        }

        let inventory = self.inventory.lock();
        self.metrics
            .set_inventory(inventory.idle.len(), inventory.busy.len());
        Ok(inventory.total())
    }

    /// Mark a runner as busy. Unknown names and duplicate starts are
    /// no-ops: the event may be a redelivery, or may refer to a runner
    /// already destroyed by an earlier completion.
    pub fn handle_job_started(&self, runner_name: &str) {
        let mut inventory = self.inventory.lock();

        match inventory.idle.remove(runner_name) {
            Some(backend_id) => {
                inventory.busy.insert(runner_name.to_string(), backend_id);
                debug!(runner = runner_name, "Runner is now busy");
            }
            None => {
                warn!(
                    runner = runner_name,
                    known = inventory.busy.contains_key(runner_name),
                    "Job started for a runner not in idle inventory"
                );
            }
        }

        self.metrics
            .set_inventory(inventory.idle.len(), inventory.busy.len());
    }

    /// Remove a completed runner from the inventory and destroy its
    /// backend resource. The runner leaves the inventory before the
    /// destroy call: even if destruction fails, this scaler no longer
    /// owns the runner and the next reconciliation provisions a
    /// replacement when demand persists.
    pub async fn handle_job_completed(
        &self,
        ctx: &CancellationToken,
        runner_name: &str,
        result: &str,
    ) -> Result<(), ScalerError> {
        let backend_id = {
            let mut inventory = self.inventory.lock();

            // Prefer busy; fall back to idle to tolerate a missed
            // job-started event
            let removed = inventory
                .busy
                .remove(runner_name)
                .or_else(|| inventory.idle.remove(runner_name));

            self.metrics
                .set_inventory(inventory.idle.len(), inventory.busy.len());
            removed
        };

        let Some(backend_id) = backend_id else {
            debug!(runner = runner_name, "Completion for an untracked runner");
            return Ok(());
        };

        info!(runner = runner_name, result, "Job completed, destroying runner");
        self.metrics.job_completed(result);

        self.engine
            .destroy(ctx.clone(), &backend_id)
            .await
            .map_err(|e| {
                error!(runner = runner_name, backend_id = %backend_id, error = %e, "Failed to destroy runner");
                e
            })?;

        self.metrics.runner_destroyed();
        Ok(())
    }

    /// Tear down every tracked runner. Errors are logged, never
    /// surfaced; the caller runs this under a detached cancellation
    /// signal so cleanup is not truncated.
    pub async fn shutdown(&self, ctx: &CancellationToken) {
        if let Err(e) = self.engine.shutdown(ctx.clone()).await {
            error!(error = %e, "Engine shutdown reported an error");
        }

        let mut inventory = self.inventory.lock();
        inventory.idle.clear();
        inventory.busy.clear();
        self.metrics.set_inventory(0, 0);
    }

    /// Provision a single runner: name it, obtain a JIT config bound to
    /// the name, start the backend resource, and admit it as idle
    async fn start_one(&self, ctx: &CancellationToken) -> Result<String, ScalerError> {
        let name = generate_runner_name();
        let started_at = Instant::now();

        // Engine is not called when the JIT request fails
        let jit_config = self
            .jit
            .generate_jit_config(ctx, &name, self.scale_set_id)
            .await?;

        let backend_id = self.engine.start(ctx.clone(), &name, &jit_config).await?;

        {
            let mut inventory = self.inventory.lock();
            inventory.idle.insert(name.clone(), backend_id);
            self.metrics
                .set_inventory(inventory.idle.len(), inventory.busy.len());
        }

        self.metrics
            .runner_started(started_at.elapsed().as_secs_f64());
        Ok(name)
    }
}

/// `runner-` plus 8 random hex characters
fn generate_runner_name() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("runner-{}", &id[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runner_name_shape() {
        let name = generate_runner_name();
        assert_eq!(name.len(), "runner-".len() + 8);
        assert!(name.starts_with("runner-"));
        assert!(name["runner-".len()..]
            .chars()
            .all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_runner_names_are_unique() {
        let a = generate_runner_name();
        let b = generate_runner_name();
        assert_ne!(a, b);
    }
}
