//! Scaler behaviour tests against an in-memory engine

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use hangar::engine::{EngineError, EngineResult, RunnerEngine};
use hangar::github::{ApiError, ApiResult};
use hangar::scaler::{JitConfigSource, Scaler, ScalerError, ScalerMetrics};

/// In-memory engine that tracks starts and destroys and can inject
/// failures
#[derive(Default)]
struct MockEngine {
    next_id: AtomicUsize,
    start_calls: AtomicUsize,
    shutdown_calls: AtomicUsize,

    /// Outstanding backend ids, keyed by runner name
    inventory: Mutex<HashMap<String, String>>,

    /// Every backend id a destroy was issued for
    destroyed: Mutex<Vec<String>>,

    /// Destroys issued for ids that were not outstanding
    duplicate_destroys: AtomicUsize,

    /// Start calls fail once this many have succeeded
    fail_starts_after: Option<usize>,

    /// Destroys of these backend ids fail
    fail_destroy_ids: Mutex<HashSet<String>>,
}

impl MockEngine {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn failing_starts_after(successes: usize) -> Arc<Self> {
        Arc::new(Self {
            fail_starts_after: Some(successes),
            ..Self::default()
        })
    }

    fn fail_destroy_of(&self, backend_id: &str) {
        self.fail_destroy_ids.lock().insert(backend_id.to_string());
    }

    fn started(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    fn outstanding(&self) -> usize {
        self.inventory.lock().len()
    }

    fn destroyed_ids(&self) -> Vec<String> {
        self.destroyed.lock().clone()
    }

    fn backend_id_of(&self, name: &str) -> Option<String> {
        self.inventory.lock().get(name).cloned()
    }
}

#[async_trait]
impl RunnerEngine for MockEngine {
    async fn start(
        &self,
        _ctx: CancellationToken,
        name: &str,
        jit_config: &str,
    ) -> EngineResult<String> {
        assert!(!jit_config.is_empty());

        let attempt = self.start_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(limit) = self.fail_starts_after {
            if attempt >= limit {
                return Err(EngineError::StartFailed {
                    name: name.to_string(),
                    message: "injected".to_string(),
                });
            }
        }

        let backend_id = format!("mock-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.inventory
            .lock()
            .insert(name.to_string(), backend_id.clone());
        Ok(backend_id)
    }

    async fn destroy(&self, _ctx: CancellationToken, backend_id: &str) -> EngineResult<()> {
        self.destroyed.lock().push(backend_id.to_string());

        if self.fail_destroy_ids.lock().contains(backend_id) {
            return Err(EngineError::Operation(format!(
                "Error 500: injected failure for {}",
                backend_id
            )));
        }

        let mut inventory = self.inventory.lock();
        let known = inventory.iter().any(|(_, id)| id == backend_id);
        if !known {
            self.duplicate_destroys.fetch_add(1, Ordering::SeqCst);
        }
        inventory.retain(|_, id| id != backend_id);
        Ok(())
    }

    async fn shutdown(&self, ctx: CancellationToken) -> EngineResult<()> {
        self.shutdown_calls.fetch_add(1, Ordering::SeqCst);

        let snapshot: Vec<String> = self.inventory.lock().values().cloned().collect();
        let mut first_error = None;

        for backend_id in snapshot {
            if let Err(e) = self.destroy(ctx.clone(), &backend_id).await {
                first_error.get_or_insert(e);
            }
        }

        self.inventory.lock().clear();
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// JIT issuer that records the names it minted configs for
#[derive(Default)]
struct MockJit {
    names: Mutex<Vec<String>>,
    fail: bool,
}

impl MockJit {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Self::default()
        })
    }

    fn minted(&self) -> Vec<String> {
        self.names.lock().clone()
    }
}

#[async_trait]
impl JitConfigSource for MockJit {
    async fn generate_jit_config(
        &self,
        _ctx: &CancellationToken,
        name: &str,
        scale_set_id: i64,
    ) -> ApiResult<String> {
        assert_eq!(scale_set_id, SCALE_SET_ID);
        if self.fail {
            return Err(ApiError::Timeout);
        }
        self.names.lock().push(name.to_string());
        Ok(format!("jit-{}", name))
    }
}

const SCALE_SET_ID: i64 = 17;

fn scaler(
    jit: Arc<MockJit>,
    engine: Arc<MockEngine>,
    min_runners: usize,
    max_runners: usize,
) -> Scaler {
    Scaler::new(
        jit,
        engine,
        SCALE_SET_ID,
        min_runners,
        max_runners,
        ScalerMetrics::disabled(),
    )
}

#[tokio::test]
async fn test_single_runner_lifecycle() {
    let ctx = CancellationToken::new();
    let jit = MockJit::new();
    let engine = MockEngine::new();
    let scaler = scaler(jit.clone(), engine.clone(), 0, 10);

    let count = scaler.handle_desired_runner_count(&ctx, 1).await.unwrap();
    assert_eq!(count, 1);
    assert_eq!(engine.started(), 1);
    assert_eq!(scaler.counts(), (1, 0));

    let name = jit.minted().pop().unwrap();
    assert!(name.starts_with("runner-"));

    scaler.handle_job_started(&name);
    assert_eq!(scaler.counts(), (0, 1));

    scaler
        .handle_job_completed(&ctx, &name, "succeeded")
        .await
        .unwrap();
    assert_eq!(scaler.counts(), (0, 0));
    assert_eq!(engine.destroyed_ids().len(), 1);
    assert_eq!(engine.outstanding(), 0);
}

#[tokio::test]
async fn test_min_runners_floor_and_no_active_scale_down() {
    let ctx = CancellationToken::new();
    let jit = MockJit::new();
    let engine = MockEngine::new();
    let scaler = scaler(jit.clone(), engine.clone(), 2, 10);

    // target = min(10, 2 + 3) = 5
    let count = scaler.handle_desired_runner_count(&ctx, 3).await.unwrap();
    assert_eq!(count, 5);
    assert_eq!(engine.started(), 5);

    // target = 2 < current = 5: supply drains by attrition, nothing is
    // destroyed
    let count = scaler.handle_desired_runner_count(&ctx, 0).await.unwrap();
    assert_eq!(count, 5);
    assert_eq!(engine.destroyed_ids().len(), 0);
    assert_eq!(scaler.counts(), (5, 0));
}

#[tokio::test]
async fn test_max_runners_ceiling() {
    let ctx = CancellationToken::new();
    let jit = MockJit::new();
    let engine = MockEngine::new();
    let scaler = scaler(jit.clone(), engine.clone(), 0, 5);

    let count = scaler.handle_desired_runner_count(&ctx, 20).await.unwrap();
    assert_eq!(count, 5);
    assert_eq!(engine.started(), 5);
}

#[tokio::test]
async fn test_target_formula() {
    // (min, max, desired, expected starts)
    let cases = [
        (0, 10, 0, 0),
        (0, 10, 4, 4),
        (3, 10, 0, 3),
        (3, 10, 4, 7),
        (3, 5, 9, 5),
        (5, 5, 1, 5),
    ];

    for (min, max, desired, expected) in cases {
        let ctx = CancellationToken::new();
        let jit = MockJit::new();
        let engine = MockEngine::new();
        let scaler = scaler(jit.clone(), engine.clone(), min, max);

        let count = scaler
            .handle_desired_runner_count(&ctx, desired)
            .await
            .unwrap();
        assert_eq!(count, expected, "min={} max={} desired={}", min, max, desired);
        assert_eq!(engine.started(), expected);

        // Repeating the same desired count is a no-op
        scaler
            .handle_desired_runner_count(&ctx, desired)
            .await
            .unwrap();
        assert_eq!(engine.started(), expected);
    }
}

#[tokio::test]
async fn test_lifecycle_events_are_idempotent() {
    let ctx = CancellationToken::new();
    let jit = MockJit::new();
    let engine = MockEngine::new();
    let scaler = scaler(jit.clone(), engine.clone(), 0, 10);

    scaler.handle_desired_runner_count(&ctx, 1).await.unwrap();
    let name = jit.minted().pop().unwrap();

    scaler.handle_job_started(&name);
    scaler.handle_job_started(&name);
    assert_eq!(scaler.counts(), (0, 1));

    // A start for an unknown runner is also a no-op
    scaler.handle_job_started("runner-deadbeef");
    assert_eq!(scaler.counts(), (0, 1));

    scaler
        .handle_job_completed(&ctx, &name, "succeeded")
        .await
        .unwrap();
    scaler
        .handle_job_completed(&ctx, &name, "succeeded")
        .await
        .unwrap();

    // The second completion found nothing to destroy
    assert_eq!(engine.destroyed_ids().len(), 1);
    assert_eq!(engine.duplicate_destroys.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_completion_without_start_falls_back_to_idle() {
    let ctx = CancellationToken::new();
    let jit = MockJit::new();
    let engine = MockEngine::new();
    let scaler = scaler(jit.clone(), engine.clone(), 0, 10);

    scaler.handle_desired_runner_count(&ctx, 1).await.unwrap();
    let name = jit.minted().pop().unwrap();

    // job-completed without job-started: the runner is found in idle
    scaler
        .handle_job_completed(&ctx, &name, "cancelled")
        .await
        .unwrap();
    assert_eq!(scaler.counts(), (0, 0));
    assert_eq!(engine.destroyed_ids().len(), 1);
}

#[tokio::test]
async fn test_one_destroy_per_start_with_distinct_ids() {
    let ctx = CancellationToken::new();
    let jit = MockJit::new();
    let engine = MockEngine::new();
    let scaler = scaler(jit.clone(), engine.clone(), 0, 10);

    scaler.handle_desired_runner_count(&ctx, 3).await.unwrap();
    assert_eq!(engine.started(), 3);

    for name in jit.minted() {
        scaler.handle_job_started(&name);
        scaler
            .handle_job_completed(&ctx, &name, "succeeded")
            .await
            .unwrap();
    }

    let destroyed = engine.destroyed_ids();
    assert_eq!(destroyed.len(), 3);
    let distinct: HashSet<&String> = destroyed.iter().collect();
    assert_eq!(distinct.len(), 3);
    assert_eq!(engine.outstanding(), 0);
}

#[tokio::test]
async fn test_partial_scale_up_keeps_started_runners() {
    let ctx = CancellationToken::new();
    let jit = MockJit::new();
    let engine = MockEngine::failing_starts_after(2);
    let scaler = scaler(jit.clone(), engine.clone(), 0, 10);

    let result = scaler.handle_desired_runner_count(&ctx, 5).await;
    assert!(matches!(
        result,
        Err(ScalerError::Engine(EngineError::StartFailed { .. }))
    ));

    // Two succeeded, the third failed, the remaining two were never
    // attempted
    assert_eq!(engine.started(), 3);
    assert_eq!(scaler.counts(), (2, 0));
}

#[tokio::test]
async fn test_jit_failure_short_circuits_engine() {
    let ctx = CancellationToken::new();
    let jit = MockJit::failing();
    let engine = MockEngine::new();
    let scaler = scaler(jit.clone(), engine.clone(), 0, 10);

    let result = scaler.handle_desired_runner_count(&ctx, 2).await;
    assert!(matches!(result, Err(ScalerError::Jit(ApiError::Timeout))));
    assert_eq!(engine.started(), 0);
    assert_eq!(scaler.counts(), (0, 0));
}

#[tokio::test]
async fn test_destroy_failure_still_removes_from_inventory() {
    let ctx = CancellationToken::new();
    let jit = MockJit::new();
    let engine = MockEngine::new();
    let scaler = scaler(jit.clone(), engine.clone(), 0, 10);

    scaler.handle_desired_runner_count(&ctx, 1).await.unwrap();
    let name = jit.minted().pop().unwrap();
    let backend_id = engine.backend_id_of(&name).unwrap();
    engine.fail_destroy_of(&backend_id);

    let result = scaler.handle_job_completed(&ctx, &name, "succeeded").await;
    assert!(matches!(result, Err(ScalerError::Engine(_))));

    // The runner left the inventory before the destroy was attempted;
    // the next reconciliation provisions a replacement
    assert_eq!(scaler.counts(), (0, 0));
    let count = scaler.handle_desired_runner_count(&ctx, 1).await.unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn test_shutdown_tears_down_everything() {
    let ctx = CancellationToken::new();
    let jit = MockJit::new();
    let engine = MockEngine::new();
    let scaler = scaler(jit.clone(), engine.clone(), 0, 10);

    scaler.handle_desired_runner_count(&ctx, 4).await.unwrap();
    let name = jit.minted().pop().unwrap();
    scaler.handle_job_started(&name);

    scaler.shutdown(&ctx).await;

    assert_eq!(engine.shutdown_calls.load(Ordering::SeqCst), 1);
    assert_eq!(engine.outstanding(), 0);
    assert_eq!(scaler.counts(), (0, 0));
}

#[tokio::test]
async fn test_shutdown_with_failing_destroy_still_clears() {
    let ctx = CancellationToken::new();
    let jit = MockJit::new();
    let engine = MockEngine::new();
    let scaler = scaler(jit.clone(), engine.clone(), 0, 10);

    scaler.handle_desired_runner_count(&ctx, 3).await.unwrap();
    let victim = jit.minted()[0].clone();
    let backend_id = engine.backend_id_of(&victim).unwrap();
    engine.fail_destroy_of(&backend_id);

    // Scaler shutdown never fails; the engine error is logged, every
    // entry is attempted, and both inventories end empty
    scaler.shutdown(&ctx).await;

    assert_eq!(engine.destroyed_ids().len(), 3);
    assert_eq!(engine.outstanding(), 0);
    assert_eq!(scaler.counts(), (0, 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_events_destroy_each_runner_once() {
    let ctx = CancellationToken::new();
    let jit = MockJit::new();
    let engine = MockEngine::new();
    let scaler = Arc::new(scaler(jit.clone(), engine.clone(), 0, 50));

    // Concurrent reconciliation storm
    let mut handles = Vec::new();
    for _ in 0..100 {
        let scaler = scaler.clone();
        let ctx = ctx.clone();
        handles.push(tokio::spawn(async move {
            scaler.handle_desired_runner_count(&ctx, 30).await.unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let names = jit.minted();
    assert!(!names.is_empty());

    // Duplicate started and completed events for every runner, all
    // racing each other
    let mut handles = Vec::new();
    for name in &names {
        for _ in 0..2 {
            let scaler = scaler.clone();
            let name = name.clone();
            handles.push(tokio::spawn(async move {
                scaler.handle_job_started(&name);
            }));
        }
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let mut handles = Vec::new();
    for name in &names {
        for _ in 0..2 {
            let scaler = scaler.clone();
            let ctx = ctx.clone();
            let name = name.clone();
            handles.push(tokio::spawn(async move {
                scaler
                    .handle_job_completed(&ctx, &name, "succeeded")
                    .await
                    .unwrap();
            }));
        }
    }
    for handle in handles {
        handle.await.unwrap();
    }

    // Exactly one destroy per started runner, never two for one backend
    // id, nothing left behind
    assert_eq!(engine.duplicate_destroys.load(Ordering::SeqCst), 0);
    assert_eq!(engine.destroyed_ids().len(), names.len());
    assert_eq!(engine.outstanding(), 0);
    assert_eq!(scaler.counts(), (0, 0));
}
