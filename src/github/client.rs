//! HTTP client with retry logic for the Actions service

use std::time::{Duration, Instant};

use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::errors::{ApiError, ApiResult};
use super::types::*;
use crate::config::{GithubAppConfiguration, GithubConfiguration};

/// Maximum number of retry attempts
const MAX_RETRIES: u32 = 3;

/// Base delay between retries (will be exponentially increased)
const BASE_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Maximum delay between retries
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Admin tokens live for an hour; refresh well before that
const ADMIN_TOKEN_LIFETIME: Duration = Duration::from_secs(50 * 60);

/// API version the Actions service endpoints are pinned to
const API_VERSION: &str = "6.0-preview";

/// Credential material for the GitHub REST API
enum Credential {
    Pat(String),
    App {
        client_id: String,
        installation_id: u64,
        key: jsonwebtoken::EncodingKey,
    },
}

struct CachedConnection {
    connection: AdminConnection,
    acquired_at: Instant,
}

/// Client for the GitHub Actions service.
///
/// Wraps two surfaces: the public REST API (registration tokens,
/// installation tokens) and the per-organization Actions service reached
/// through the runner-registration exchange (scale sets, sessions, JIT
/// configs).
pub struct ActionsClient {
    client: Client,
    github_url: String,
    api_base: String,
    scope_path: String,
    credential: Credential,
    admin: RwLock<Option<CachedConnection>>,
}

impl ActionsClient {
    /// Create a client and verify credentials by acquiring an admin
    /// connection to the Actions service
    pub async fn connect(config: &GithubConfiguration) -> ApiResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .user_agent(concat!("hangar/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(ApiError::Request)?;

        let url = url::Url::parse(config.url.trim_end_matches('/'))
            .map_err(|_| ApiError::InvalidUrl(config.url.clone()))?;

        let host = url
            .host_str()
            .ok_or_else(|| ApiError::InvalidUrl(config.url.clone()))?;

        // github.com uses a dedicated API host, GHES nests it under the
        // instance origin
        let api_base = if host == "github.com" {
            "https://api.github.com".to_string()
        } else {
            format!("{}://{}/api/v3", url.scheme(), host)
        };

        let scope_path = url.path().trim_matches('/').to_string();
        if scope_path.is_empty() {
            return Err(ApiError::InvalidUrl(
                "github.url must name an organization or repository".into(),
            ));
        }

        let credential = match (&config.token, &config.app) {
            (Some(token), _) => Credential::Pat(token.clone()),
            (None, Some(app)) => Self::app_credential(app)?,
            (None, None) => {
                return Err(ApiError::Authentication(
                    "no github credentials configured".into(),
                ))
            }
        };

        let actions = Self {
            client,
            github_url: config.url.trim_end_matches('/').to_string(),
            api_base,
            scope_path,
            credential,
            admin: RwLock::new(None),
        };

        // Fail fast on bad credentials
        actions.ensure_admin_connection().await?;
        Ok(actions)
    }

    fn app_credential(app: &GithubAppConfiguration) -> ApiResult<Credential> {
        let pem = app
            .private_key_pem()
            .map_err(|e| ApiError::Authentication(e.to_string()))?;

        let key = jsonwebtoken::EncodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|e| ApiError::Authentication(format!("invalid app private key: {}", e)))?;

        Ok(Credential::App {
            client_id: app.client_id.clone(),
            installation_id: app.installation_id,
            key,
        })
    }

    // ========================================================================
    // Credential resolution
    // ========================================================================

    /// Resolve a bearer token for the public REST API
    async fn rest_bearer(&self) -> ApiResult<String> {
        match &self.credential {
            Credential::Pat(token) => Ok(token.clone()),
            Credential::App {
                client_id,
                installation_id,
                key,
            } => {
                let jwt = Self::app_jwt(client_id, key)?;

                let url = format!(
                    "{}/app/installations/{}/access_tokens",
                    self.api_base, installation_id
                );
                let request = self
                    .client
                    .post(&url)
                    .bearer_auth(jwt)
                    .header("Accept", "application/vnd.github+json");

                let response = self.execute_request(request).await?;
                let token: InstallationToken = self.parse_response(response).await?;
                Ok(token.token)
            }
        }
    }

    fn app_jwt(client_id: &str, key: &jsonwebtoken::EncodingKey) -> ApiResult<String> {
        #[derive(Serialize)]
        struct Claims<'a> {
            iat: i64,
            exp: i64,
            iss: &'a str,
        }

        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            // Clock drift allowance
            iat: now - 60,
            exp: now + 9 * 60,
            iss: client_id,
        };

        jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256),
            &claims,
            key,
        )
        .map_err(|e| ApiError::Authentication(format!("failed to sign app JWT: {}", e)))
    }

    /// Mint a runner registration token for the configured scope
    async fn registration_token(&self) -> ApiResult<String> {
        let path = if self.scope_path.contains('/') {
            format!("repos/{}", self.scope_path)
        } else {
            format!("orgs/{}", self.scope_path)
        };

        let url = format!("{}/{}/actions/runners/registration-token", self.api_base, path);
        let bearer = self.rest_bearer().await?;

        let request = self
            .client
            .post(&url)
            .bearer_auth(bearer)
            .header("Accept", "application/vnd.github+json");

        let response = self.execute_request(request).await?;
        let token: RegistrationToken = self.parse_response(response).await?;
        Ok(token.token)
    }

    /// Exchange a registration token for an Actions service connection
    async fn acquire_admin_connection(&self) -> ApiResult<AdminConnection> {
        let registration_token = self.registration_token().await?;

        let url = format!("{}/api/actions/runner-registration", self.origin());
        let request = self
            .client
            .post(&url)
            .header("Authorization", format!("RemoteAuth {}", registration_token))
            .json(&serde_json::json!({
                "url": self.github_url,
                "runner_event": "register",
            }));

        let response = self.execute_request(request).await?;
        let connection: AdminConnection = self.parse_response(response).await?;

        debug!(url = %connection.url, "Acquired Actions service connection");
        Ok(connection)
    }

    fn origin(&self) -> String {
        // github.com registration exchange also lives on the main origin
        match url::Url::parse(&self.github_url) {
            Ok(u) => format!("{}://{}", u.scheme(), u.host_str().unwrap_or("github.com")),
            Err(_) => self.github_url.clone(),
        }
    }

    /// Return a fresh admin connection, re-acquiring when the cached
    /// token is near expiry
    async fn ensure_admin_connection(&self) -> ApiResult<AdminConnection> {
        {
            let cached = self.admin.read().await;
            if let Some(c) = cached.as_ref() {
                if c.acquired_at.elapsed() < ADMIN_TOKEN_LIFETIME {
                    return Ok(c.connection.clone());
                }
            }
        }

        let connection = self.acquire_admin_connection().await?;
        let mut cached = self.admin.write().await;
        *cached = Some(CachedConnection {
            connection: connection.clone(),
            acquired_at: Instant::now(),
        });
        Ok(connection)
    }

    // ========================================================================
    // Actions service plumbing
    // ========================================================================

    fn service_url(&self, connection: &AdminConnection, path: &str) -> String {
        format!(
            "{}/_apis/runtime/{}?api-version={}",
            connection.url.trim_end_matches('/'),
            path.trim_start_matches('/'),
            API_VERSION
        )
    }

    /// Make an Actions service request with automatic retry on transient
    /// failures
    async fn service_request(
        &self,
        ctx: &CancellationToken,
        method: Method,
        path: &str,
        body: Option<&impl Serialize>,
    ) -> ApiResult<Response> {
        let mut last_error: Option<ApiError> = None;

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let delay = calculate_backoff(attempt);
                debug!(path, attempt, ?delay, "Retrying Actions service request");
                tokio::select! {
                    _ = ctx.cancelled() => return Err(ApiError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let connection = self.ensure_admin_connection().await?;
            let url = self.service_url(&connection, path);

            let mut request = self
                .client
                .request(method.clone(), &url)
                .bearer_auth(&connection.token)
                .header("Accept", "application/json");

            if let Some(body) = body {
                request = request.json(body);
            }

            let result = tokio::select! {
                _ = ctx.cancelled() => return Err(ApiError::Cancelled),
                res = self.execute_request(request) => res,
            };

            match result {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt < MAX_RETRIES => {
                    warn!(path, attempt, error = %e, "Actions service request failed");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(ApiError::RetryExhausted(
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "Unknown error".to_string()),
        ))
    }

    /// Execute a single request and classify the response status
    async fn execute_request(&self, request: RequestBuilder) -> ApiResult<Response> {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ApiError::Timeout
            } else {
                ApiError::Request(e)
            }
        })?;

        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok());

            return Err(ApiError::RateLimited { retry_after });
        }

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ApiError::Authentication(format!(
                "credentials rejected ({})",
                status
            )));
        }

        if status == StatusCode::NOT_FOUND {
            return Err(ApiError::NotFound("Resource not found".to_string()));
        }

        if status.is_server_error() || status.is_client_error() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());

            return Err(ApiError::Server {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response)
    }

    /// Parse a successful response body
    async fn parse_response<T: DeserializeOwned>(&self, response: Response) -> ApiResult<T> {
        let text = response.text().await.map_err(ApiError::Request)?;

        serde_json::from_str(&text).map_err(|e| {
            error!("Failed to parse response: {} - Body: {}", e, text);
            ApiError::Parse(e)
        })
    }

    // ========================================================================
    // Scale set management
    // ========================================================================

    /// Resolve the id of a runner group by name. The default group is
    /// always id 1 and is not queried.
    pub async fn get_runner_group_id(
        &self,
        ctx: &CancellationToken,
        name: &str,
    ) -> ApiResult<i64> {
        if name.eq_ignore_ascii_case("default") {
            return Ok(1);
        }

        let response = self
            .service_request(ctx, Method::GET, "runnergroups", None::<&()>)
            .await?;
        let groups: ServiceList<RunnerGroup> = self.parse_response(response).await?;

        groups
            .value
            .into_iter()
            .find(|g| g.name.eq_ignore_ascii_case(name))
            .map(|g| g.id)
            .ok_or_else(|| ApiError::NotFound(format!("runner group {:?}", name)))
    }

    /// Register a new runner scale set
    pub async fn create_runner_scale_set(
        &self,
        ctx: &CancellationToken,
        name: &str,
        runner_group_id: i64,
        labels: &[String],
    ) -> ApiResult<RunnerScaleSet> {
        let body = RunnerScaleSetRequest {
            name: name.to_string(),
            runner_group_id,
            labels: labels.iter().map(|l| Label::user(l)).collect(),
            runner_setting: RunnerSetting {
                ephemeral: true,
                disable_update: true,
            },
        };

        let response = self
            .service_request(ctx, Method::POST, "runnerscalesets", Some(&body))
            .await?;
        self.parse_response(response).await
    }

    /// Delete a runner scale set
    pub async fn delete_runner_scale_set(
        &self,
        ctx: &CancellationToken,
        scale_set_id: i64,
    ) -> ApiResult<()> {
        self.service_request(
            ctx,
            Method::DELETE,
            &format!("runnerscalesets/{}", scale_set_id),
            None::<&()>,
        )
        .await?;
        Ok(())
    }

    /// Mint a just-in-time registration config for a named runner
    pub async fn generate_jit_config(
        &self,
        ctx: &CancellationToken,
        name: &str,
        scale_set_id: i64,
    ) -> ApiResult<String> {
        let body = serde_json::json!({
            "name": name,
            "workFolder": "_work",
        });

        let response = self
            .service_request(
                ctx,
                Method::POST,
                &format!("runnerscalesets/{}/generatejitconfig", scale_set_id),
                Some(&body),
            )
            .await?;

        let config: JitRunnerConfig = self.parse_response(response).await?;
        debug!(runner = %config.runner.name, "Generated JIT config");
        Ok(config.encoded_jit_config)
    }

    // ========================================================================
    // Message sessions
    // ========================================================================

    /// Open a message session for a scale set, keyed by an owner name
    pub async fn create_message_session(
        &self,
        ctx: &CancellationToken,
        scale_set_id: i64,
        owner: &str,
    ) -> ApiResult<RunnerScaleSetSession> {
        let body = serde_json::json!({ "ownerName": owner });

        let response = self
            .service_request(
                ctx,
                Method::POST,
                &format!("runnerscalesets/{}/sessions", scale_set_id),
                Some(&body),
            )
            .await?;
        self.parse_response(response).await
    }

    /// Close a message session
    pub async fn delete_message_session(
        &self,
        ctx: &CancellationToken,
        scale_set_id: i64,
        session_id: &str,
    ) -> ApiResult<()> {
        self.service_request(
            ctx,
            Method::DELETE,
            &format!("runnerscalesets/{}/sessions/{}", scale_set_id, session_id),
            None::<&()>,
        )
        .await?;
        Ok(())
    }

    /// Acknowledge a processed message so the queue does not redeliver it
    pub async fn delete_message(
        &self,
        ctx: &CancellationToken,
        scale_set_id: i64,
        session_id: &str,
        message_id: i64,
    ) -> ApiResult<()> {
        self.service_request(
            ctx,
            Method::DELETE,
            &format!(
                "runnerscalesets/{}/sessions/{}/messages/{}",
                scale_set_id, session_id, message_id
            ),
            None::<&()>,
        )
        .await?;
        Ok(())
    }

    pub(super) fn http(&self) -> &Client {
        &self.client
    }
}

#[async_trait::async_trait]
impl crate::scaler::JitConfigSource for ActionsClient {
    async fn generate_jit_config(
        &self,
        ctx: &CancellationToken,
        name: &str,
        scale_set_id: i64,
    ) -> ApiResult<String> {
        ActionsClient::generate_jit_config(self, ctx, name, scale_set_id).await
    }
}

/// Calculate exponential backoff delay
fn calculate_backoff(attempt: u32) -> Duration {
    let delay = BASE_RETRY_DELAY * 2u32.pow(attempt - 1);
    std::cmp::min(delay, MAX_RETRY_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_bounded() {
        assert_eq!(calculate_backoff(1), Duration::from_millis(500));
        assert_eq!(calculate_backoff(2), Duration::from_secs(1));
        assert_eq!(calculate_backoff(3), Duration::from_secs(2));
        assert!(calculate_backoff(12) <= MAX_RETRY_DELAY);
    }
}
