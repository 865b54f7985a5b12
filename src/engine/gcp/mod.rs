//! GCP runner engine
//!
//! Runners are launched as Compute Engine instances through the REST API.
//! Instance creation and deletion are long-running operations that are
//! waited to completion before the call returns.

mod auth;
mod types;

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::GcpEngineConfiguration;

use self::auth::TokenProvider;
use self::types::*;

use super::traits::{EngineError, EngineResult, RunnerEngine, JIT_CONFIG_ENV};

const COMPUTE_BASE: &str = "https://compute.googleapis.com/compute/v1";

/// Scope granted to instances with an attached service account
const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// GCP implementation of [`RunnerEngine`].
///
/// The instance name doubles as the backend id.
pub struct GcpEngine {
    http: Client,
    tokens: TokenProvider,
    config: GcpEngineConfiguration,

    /// Runner name -> instance name, for shutdown teardown
    inventory: DashMap<String, String>,
}

impl GcpEngine {
    /// Build the engine and verify API credentials
    pub async fn new(config: GcpEngineConfiguration) -> EngineResult<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(180))
            .connect_timeout(std::time::Duration::from_secs(10))
            .user_agent(concat!("hangar/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(EngineError::Http)?;

        let tokens = TokenProvider::new(http.clone(), config.credentials_file.as_deref())?;

        // Fail fast on unusable credentials
        tokens.token().await?;

        Ok(Self {
            http,
            tokens,
            config,
            inventory: DashMap::new(),
        })
    }

    fn zone_url(&self, suffix: &str) -> String {
        format!(
            "{}/projects/{}/zones/{}/{}",
            COMPUTE_BASE, self.config.project, self.config.zone, suffix
        )
    }

    /// Build the instance resource for one runner
    fn instance_resource(&self, name: &str, jit_config: &str) -> Instance {
        let region = region_of_zone(&self.config.zone);

        let access_configs = if self.config.public_ip {
            Some(vec![AccessConfig {
                kind: "ONE_TO_ONE_NAT".to_string(),
                name: "External NAT".to_string(),
            }])
        } else {
            None
        };

        let service_accounts = self.config.service_account.as_ref().map(|email| {
            vec![ServiceAccount {
                email: email.clone(),
                scopes: vec![CLOUD_PLATFORM_SCOPE.to_string()],
            }]
        });

        Instance {
            name: name.to_string(),
            machine_type: format!(
                "zones/{}/machineTypes/{}",
                self.config.zone, self.config.machine_type
            ),
            disks: vec![AttachedDisk {
                boot: true,
                auto_delete: true,
                initialize_params: InitializeParams {
                    source_image: self.config.image.clone(),
                    disk_size_gb: self.config.disk_size_gb.to_string(),
                    disk_type: format!("zones/{}/diskTypes/pd-ssd", self.config.zone),
                },
            }],
            network_interfaces: vec![NetworkInterface {
                network: format!("global/networks/{}", self.config.network),
                subnetwork: self
                    .config
                    .subnetwork
                    .as_ref()
                    .map(|s| format!("regions/{}/subnetworks/{}", region, s)),
                access_configs,
            }],
            metadata: Metadata {
                items: vec![MetadataItem {
                    key: JIT_CONFIG_ENV.to_string(),
                    value: jit_config.to_string(),
                }],
            },
            service_accounts,
        }
    }

    /// Issue a compute API request and classify error responses
    async fn api_request<T: DeserializeOwned>(
        &self,
        ctx: &CancellationToken,
        method: Method,
        url: &str,
        body: Option<&Instance>,
    ) -> EngineResult<T> {
        let token = self.tokens.token().await?;

        let mut request = self.http.request(method, url).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = tokio::select! {
            _ = ctx.cancelled() => return Err(EngineError::Cancelled),
            res = request.send() => res.map_err(EngineError::Http)?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(api_error(status, response).await);
        }

        let value = response.json::<T>().await.map_err(EngineError::Http)?;
        Ok(value)
    }

    /// Poll a zonal operation until it reaches DONE
    async fn wait_operation(
        &self,
        ctx: &CancellationToken,
        operation: Operation,
    ) -> EngineResult<()> {
        let url = self.zone_url(&format!("operations/{}/wait", operation.name));
        let mut current = operation;

        loop {
            if current.status == "DONE" {
                if let Some(error) = current.error {
                    return Err(EngineError::Operation(error.to_message()));
                }
                return Ok(());
            }

            debug!(operation = %current.name, status = %current.status, "Waiting for operation");
            current = self
                .api_request(ctx, Method::POST, &url, None)
                .await?;
        }
    }
}

#[async_trait]
impl RunnerEngine for GcpEngine {
    async fn start(
        &self,
        ctx: CancellationToken,
        name: &str,
        jit_config: &str,
    ) -> EngineResult<String> {
        let instance = self.instance_resource(name, jit_config);
        let url = self.zone_url("instances");

        let operation: Operation = self
            .api_request(&ctx, Method::POST, &url, Some(&instance))
            .await
            .map_err(|e| EngineError::StartFailed {
                name: name.to_string(),
                message: e.to_string(),
            })?;

        if let Err(e) = self.wait_operation(&ctx, operation).await {
            // The insert may have materialized an instance that never
            // became usable; try to remove it before reporting failure
            let delete_url = self.zone_url(&format!("instances/{}", name));
            match self
                .api_request::<Operation>(&ctx, Method::DELETE, &delete_url, None)
                .await
            {
                Ok(_) => {}
                Err(cleanup) if is_already_gone(&cleanup.to_string()) => {}
                Err(cleanup) => {
                    warn!(runner = name, error = %cleanup, "Failed to clean up instance after failed start");
                }
            }

            return Err(EngineError::StartFailed {
                name: name.to_string(),
                message: e.to_string(),
            });
        }

        info!(runner = name, zone = %self.config.zone, "Started runner instance");
        self.inventory.insert(name.to_string(), name.to_string());
        Ok(name.to_string())
    }

    async fn destroy(&self, ctx: CancellationToken, backend_id: &str) -> EngineResult<()> {
        let url = self.zone_url(&format!("instances/{}", backend_id));

        let result = match self
            .api_request::<Operation>(&ctx, Method::DELETE, &url, None)
            .await
        {
            Ok(operation) => self.wait_operation(&ctx, operation).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                info!(instance = backend_id, "Destroyed runner instance");
            }
            Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
            Err(e) if is_already_gone(&e.to_string()) => {
                debug!(instance = backend_id, "Instance already gone");
            }
            Err(e) => return Err(e),
        }

        self.inventory.remove(backend_id);
        Ok(())
    }

    async fn shutdown(&self, ctx: CancellationToken) -> EngineResult<()> {
        let snapshot: Vec<String> = self.inventory.iter().map(|e| e.value().clone()).collect();

        let mut first_error: Option<EngineError> = None;

        for instance in snapshot {
            if let Err(e) = self.destroy(ctx.clone(), &instance).await {
                warn!(instance = %instance, error = %e, "Failed to destroy instance during shutdown");
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

/// Format an error response the way API errors surface from the service,
/// so that classification by message stays stable
async fn api_error(status: StatusCode, response: Response) -> EngineError {
    let message = match response.json::<ApiErrorBody>().await {
        Ok(body) => body.error.message,
        Err(_) => "unreadable error body".to_string(),
    };

    EngineError::Operation(format!("Error {}: {}", status.as_u16(), message))
}

/// Classify "the resource is already gone" by message. Substring match
/// survives wrapping layers that would defeat a typed check.
fn is_already_gone(message: &str) -> bool {
    message.contains("Error 404")
        || message.contains("code = NotFound")
        || message.contains("notFound")
}

/// `europe-west1-b` -> `europe-west1`
fn region_of_zone(zone: &str) -> String {
    match zone.rsplit_once('-') {
        Some((region, _)) => region.to_string(),
        None => zone.to_string(),
    }
}
