//! Main daemon command - registers the scale set and runs the listener

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hangar::config::Configuration;
use hangar::engine;
use hangar::github::{ActionsClient, ApiError, MessageSession, JOB_COMPLETED, JOB_STARTED};
use hangar::scaler::{Scaler, ScalerMetrics};
use hangar::telemetry::Telemetry;

/// Pause after a failed message poll so a broken session does not spin
const POLL_FAILURE_DELAY: Duration = Duration::from_secs(5);

/// Run the daemon
pub async fn run(config: Configuration) -> Result<()> {
    info!("  github: {}", config.github.url);
    info!(
        "  scale set: {} ({}..={} runners)",
        config.scaleset.name, config.scaleset.min_runners, config.scaleset.max_runners
    );

    // Cancelled by the signal handler; everything request-scoped hangs
    // off this token
    let ctx = CancellationToken::new();

    let signal_ctx = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Received shutdown signal, draining...");
            signal_ctx.cancel();
        }
    });

    let client = Arc::new(
        ActionsClient::connect(&config.github)
            .await
            .context("Failed to authenticate with the Actions service")?,
    );

    let runner_group_id = client
        .get_runner_group_id(&ctx, &config.scaleset.runner_group)
        .await
        .context("Failed to resolve runner group")?;
    info!(group = %config.scaleset.runner_group, id = runner_group_id, "Resolved runner group");

    let scale_set = client
        .create_runner_scale_set(
            &ctx,
            &config.scaleset.name,
            runner_group_id,
            &config.scaleset.labels,
        )
        .await
        .context("Failed to register runner scale set")?;
    info!(id = scale_set.id, name = %scale_set.name, "Registered runner scale set");

    let result = run_scaler(&config, client.clone(), scale_set.id, &ctx).await;

    // The scale set must be deleted even when we got here through
    // cancellation, so the delete runs under a detached token
    let detached = CancellationToken::new();
    if let Err(e) = client.delete_runner_scale_set(&detached, scale_set.id).await {
        error!(id = scale_set.id, error = %e, "Failed to delete runner scale set");
    } else {
        info!(id = scale_set.id, "Deleted runner scale set");
    }

    result
}

/// Wire engine, session, and scaler together and pump messages until
/// cancellation
async fn run_scaler(
    config: &Configuration,
    client: Arc<ActionsClient>,
    scale_set_id: i64,
    ctx: &CancellationToken,
) -> Result<()> {
    let engine = engine::build(ctx, config)
        .await
        .context("Failed to construct engine")?;

    let owner = session_owner();
    let session = MessageSession::open(ctx, client.clone(), scale_set_id, &owner)
        .await
        .context("Failed to open message session")?;
    info!(session_id = %session.session_id(), owner = %owner, "Opened message session");

    let telemetry = Telemetry::new(config.telemetry.clone());
    telemetry.serve(ctx);

    let scaler = Scaler::new(
        client.clone(),
        engine,
        scale_set_id,
        config.scaleset.min_runners,
        config.scaleset.max_runners,
        ScalerMetrics::new(telemetry.registry()),
    );

    listen(ctx, &session, &scaler).await;

    // Shutdown ordering: listener is closed, then runners are destroyed
    // under a detached token, then the session goes away
    let detached = CancellationToken::new();
    scaler.shutdown(&detached).await;

    if let Err(e) = session.close(&detached).await {
        warn!(error = %e, "Failed to close message session");
    }

    info!("Scaler stopped");
    Ok(())
}

/// Pump session messages into the scaler until cancellation
async fn listen(ctx: &CancellationToken, session: &MessageSession, scaler: &Scaler) {
    loop {
        let message = tokio::select! {
            _ = ctx.cancelled() => break,
            message = session.next_message(ctx) => message,
        };

        match message {
            Ok(Some(message)) => dispatch(ctx, session, scaler, message).await,
            Ok(None) => continue,
            Err(ApiError::Cancelled) => break,
            Err(e) => {
                error!(error = %e, "Failed to poll message queue");
                tokio::select! {
                    _ = ctx.cancelled() => break,
                    _ = tokio::time::sleep(POLL_FAILURE_DELAY) => {}
                }
            }
        }
    }
}

async fn dispatch(
    ctx: &CancellationToken,
    session: &MessageSession,
    scaler: &Scaler,
    message: hangar::github::RunnerScaleSetMessage,
) {
    debug!(
        message_id = message.message_id,
        message_type = %message.message_type,
        "Dispatching message"
    );

    if let Some(statistics) = &message.statistics {
        let desired = statistics.total_assigned_jobs.max(0) as usize;
        match scaler.handle_desired_runner_count(ctx, desired).await {
            Ok(count) => debug!(desired, count, "Reconciled runner count"),
            Err(e) => error!(desired, error = %e, "Reconciliation failed"),
        }
    }

    for job in MessageSession::job_messages(&message) {
        let Some(runner_name) = job.runner_name.as_deref() else {
            debug!(message_type = %job.message_type, "Job event without a runner name");
            continue;
        };

        match job.message_type.as_str() {
            JOB_STARTED => scaler.handle_job_started(runner_name),
            JOB_COMPLETED => {
                let result = job.result.as_deref().unwrap_or("unknown");
                if let Err(e) = scaler.handle_job_completed(ctx, runner_name, result).await {
                    error!(runner = runner_name, error = %e, "Failed to retire runner");
                }
            }
            other => debug!(message_type = other, "Ignoring job event"),
        }
    }

    if let Err(e) = session.acknowledge(ctx, message.message_id).await {
        warn!(message_id = message.message_id, error = %e, "Failed to acknowledge message");
    }
}

/// Sessions are keyed by owner so the service can tell reconnects from
/// competing listeners
fn session_owner() -> String {
    sysinfo::System::host_name()
        .unwrap_or_else(|| format!("hangar-{}", uuid::Uuid::new_v4().simple()))
}
