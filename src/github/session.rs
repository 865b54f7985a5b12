//! Long-poll message session for a runner scale set

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::client::ActionsClient;
use super::errors::{ApiError, ApiResult};
use super::types::{
    JobMessage, RunnerScaleSetMessage, RunnerScaleSetSession, MESSAGE_TYPE_JOB_MESSAGES,
};

/// The service parks long-poll requests for up to 50 seconds; give the
/// request twice that before treating it as an empty pop
const POLL_TIMEOUT: Duration = Duration::from_secs(100);

/// An open message session.
///
/// Messages are popped with [`next_message`](Self::next_message) and must
/// be acknowledged with [`acknowledge`](Self::acknowledge) after dispatch,
/// otherwise the queue redelivers them.
pub struct MessageSession {
    client: Arc<ActionsClient>,
    scale_set_id: i64,
    session: RunnerScaleSetSession,
}

impl MessageSession {
    /// Open a session for the scale set, keyed by `owner`
    pub async fn open(
        ctx: &CancellationToken,
        client: Arc<ActionsClient>,
        scale_set_id: i64,
        owner: &str,
    ) -> ApiResult<Self> {
        let session = client
            .create_message_session(ctx, scale_set_id, owner)
            .await?;

        debug!(session_id = %session.session_id, owner, "Opened message session");
        Ok(Self {
            client,
            scale_set_id,
            session,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session.session_id
    }

    /// Block until the queue delivers a message, the poll times out
    /// (`Ok(None)`), or the caller cancels
    pub async fn next_message(
        &self,
        ctx: &CancellationToken,
    ) -> ApiResult<Option<RunnerScaleSetMessage>> {
        let request = self
            .client
            .http()
            .get(&self.session.message_queue_url)
            .bearer_auth(&self.session.message_queue_access_token)
            .header("Accept", "application/json")
            .timeout(POLL_TIMEOUT);

        let result = tokio::select! {
            _ = ctx.cancelled() => return Err(ApiError::Cancelled),
            res = request.send() => res,
        };

        let response = match result {
            Ok(response) => response,
            // An idle long poll surfaces as a timeout; treat it as an
            // empty pop
            Err(e) if e.is_timeout() => return Ok(None),
            Err(e) => return Err(ApiError::Request(e)),
        };

        match response.status() {
            StatusCode::OK => {}
            StatusCode::NO_CONTENT | StatusCode::ACCEPTED => return Ok(None),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(ApiError::Authentication(
                    "message queue token rejected".into(),
                ))
            }
            status => {
                let message = response.text().await.unwrap_or_default();
                return Err(ApiError::Server {
                    status: status.as_u16(),
                    message,
                });
            }
        }

        let text = response.text().await.map_err(ApiError::Request)?;
        if text.trim().is_empty() {
            return Ok(None);
        }

        let message: RunnerScaleSetMessage = serde_json::from_str(&text)?;
        Ok(Some(message))
    }

    /// Acknowledge a processed message
    pub async fn acknowledge(&self, ctx: &CancellationToken, message_id: i64) -> ApiResult<()> {
        self.client
            .delete_message(ctx, self.scale_set_id, &self.session.session_id, message_id)
            .await
    }

    /// Close the session on the service side
    pub async fn close(&self, ctx: &CancellationToken) -> ApiResult<()> {
        self.client
            .delete_message_session(ctx, self.scale_set_id, &self.session.session_id)
            .await
    }

    /// Decode the job events carried by a message, if any
    pub fn job_messages(message: &RunnerScaleSetMessage) -> Vec<JobMessage> {
        if message.message_type != MESSAGE_TYPE_JOB_MESSAGES {
            return Vec::new();
        }

        let Some(body) = message.body.as_deref() else {
            return Vec::new();
        };

        match serde_json::from_str(body) {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(message_id = message.message_id, error = %e, "Undecodable job message body");
                Vec::new()
            }
        }
    }
}
