//! Docker runner engine
//!
//! Runners are launched as containers on the local daemon. The runner
//! image is pulled to completion at construction time so `start` never
//! races an incomplete pull.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{Config, CreateContainerOptions, RemoveContainerOptions};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use dashmap::DashMap;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DockerEngineConfiguration;

use super::traits::{EngineError, EngineResult, RunnerEngine, JIT_CONFIG_ENV};

/// Entry point the runner image executes
const RUN_COMMAND: &str = "/home/runner/run.sh";

/// Host daemon socket, bind-mounted into privileged runners
const DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// Docker implementation of [`RunnerEngine`]
pub struct DockerEngine {
    client: Docker,
    config: DockerEngineConfiguration,

    /// Runner name -> container id, for shutdown teardown
    inventory: DashMap<String, String>,
}

impl DockerEngine {
    /// Connect to the local daemon and pull the runner image to
    /// completion. An incomplete pull is a construction failure.
    pub async fn new(
        ctx: &CancellationToken,
        config: DockerEngineConfiguration,
    ) -> EngineResult<Self> {
        let client = Docker::connect_with_local_defaults().map_err(EngineError::Docker)?;

        pull_image(ctx, &client, &config.image).await?;

        Ok(Self {
            client,
            config,
            inventory: DashMap::new(),
        })
    }

    /// Get the Docker client
    pub fn docker(&self) -> &Docker {
        &self.client
    }
}

#[async_trait]
impl RunnerEngine for DockerEngine {
    async fn start(
        &self,
        ctx: CancellationToken,
        name: &str,
        jit_config: &str,
    ) -> EngineResult<String> {
        let container_config = container_config(&self.config, jit_config);
        let options = CreateContainerOptions {
            name,
            platform: None,
        };

        let created = tokio::select! {
            _ = ctx.cancelled() => return Err(EngineError::Cancelled),
            res = self.client.create_container(Some(options), container_config) => {
                res.map_err(|e| create_error(name, e))?
            }
        };

        let start_result = tokio::select! {
            _ = ctx.cancelled() => return Err(EngineError::Cancelled),
            res = self.client.start_container::<String>(&created.id, None) => res,
        };

        if let Err(e) = start_result {
            // The container exists but never ran; remove it so a failed
            // start leaves nothing behind
            let options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            if let Err(remove_err) = self.client.remove_container(&created.id, Some(options)).await
            {
                warn!(
                    runner = name,
                    container = %created.id,
                    error = %remove_err,
                    "Failed to remove container after failed start"
                );
            }

            return Err(EngineError::StartFailed {
                name: name.to_string(),
                message: e.to_string(),
            });
        }

        info!(runner = name, container = %created.id, "Started runner container");
        self.inventory.insert(name.to_string(), created.id.clone());
        Ok(created.id)
    }

    async fn destroy(&self, ctx: CancellationToken, backend_id: &str) -> EngineResult<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        let result = tokio::select! {
            _ = ctx.cancelled() => return Err(EngineError::Cancelled),
            res = self.client.remove_container(backend_id, Some(options)) => res,
        };

        match result {
            Ok(_) => {
                info!(container = backend_id, "Destroyed runner container");
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container = backend_id, "Container already gone");
            }
            Err(e) => return Err(EngineError::Docker(e)),
        }

        self.inventory.retain(|_, id| id != backend_id);
        Ok(())
    }

    async fn shutdown(&self, ctx: CancellationToken) -> EngineResult<()> {
        let snapshot: Vec<(String, String)> = self
            .inventory
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut first_error: Option<EngineError> = None;

        for (name, container_id) in snapshot {
            if let Err(e) = self.destroy(ctx.clone(), &container_id).await {
                warn!(runner = %name, container = %container_id, error = %e, "Failed to destroy container during shutdown");
                first_error.get_or_insert(e);
            }
        }

        self.inventory.clear();

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Assemble the container spec for one runner
fn container_config(
    config: &DockerEngineConfiguration,
    jit_config: &str,
) -> Config<String> {
    let mut env = vec![format!("{}={}", JIT_CONFIG_ENV, jit_config)];

    // Privileged runners talk to the host daemon through the mounted
    // socket, and run as root because socket ownership differs between
    // native Linux and desktop virtualized daemons
    let (user, binds) = if config.privileged {
        env.push(format!("DOCKER_HOST=unix://{}", DOCKER_SOCKET));
        env.push("RUNNER_ALLOW_RUNASROOT=1".to_string());
        (
            "root".to_string(),
            Some(vec![format!("{}:{}", DOCKER_SOCKET, DOCKER_SOCKET)]),
        )
    } else {
        ("runner".to_string(), None)
    };

    let mut labels = HashMap::new();
    labels.insert("Service".to_string(), "hangar".to_string());

    Config {
        image: Some(config.image.clone()),
        user: Some(user),
        cmd: Some(vec![RUN_COMMAND.to_string()]),
        env: Some(env),
        labels: Some(labels),
        host_config: Some(HostConfig {
            binds,
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Map a container creation failure, distinguishing a 409 name
/// collision from a stale container left by a previous run
fn create_error(name: &str, error: bollard::errors::Error) -> EngineError {
    match error {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 409, ..
        } => EngineError::StartFailed {
            name: name.to_string(),
            message: format!("container name {} already in use", name),
        },
        e => EngineError::StartFailed {
            name: name.to_string(),
            message: e.to_string(),
        },
    }
}

/// Pull the runner image, draining the stream to completion
async fn pull_image(ctx: &CancellationToken, client: &Docker, image: &str) -> EngineResult<()> {
    let options = CreateImageOptions {
        from_image: image,
        ..Default::default()
    };

    let mut stream = client.create_image(Some(options), None, None);

    loop {
        let next = tokio::select! {
            _ = ctx.cancelled() => return Err(EngineError::Cancelled),
            next = stream.next() => next,
        };

        match next {
            Some(Ok(progress)) => {
                if let Some(status) = progress.status {
                    debug!(image, "Pull: {}", status);
                }
            }
            Some(Err(e)) => return Err(EngineError::ImagePull(e.to_string())),
            None => break,
        }
    }

    info!(image, "Runner image ready");
    Ok(())
}
