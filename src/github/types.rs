//! Actions service request and response types

use serde::{Deserialize, Serialize};

/// Connection details for the Actions service, obtained by exchanging a
/// runner registration token
#[derive(Debug, Clone, Deserialize)]
pub struct AdminConnection {
    /// Base URL of the Actions service for this organization
    pub url: String,

    /// Short-lived admin bearer token
    pub token: String,
}

/// Registration token for the configured organization or repository
#[derive(Debug, Deserialize)]
pub struct RegistrationToken {
    pub token: String,
}

/// Installation access token minted for a GitHub App
#[derive(Debug, Deserialize)]
pub struct InstallationToken {
    pub token: String,
}

/// A runner group as reported by the Actions service
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerGroup {
    pub id: i64,
    pub name: String,
}

/// Paginated list envelope used by the Actions service
#[derive(Debug, Deserialize)]
pub struct ServiceList<T> {
    pub count: i64,
    pub value: Vec<T>,
}

/// Label attached to a scale set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Label {
    pub name: String,

    #[serde(rename = "type")]
    pub kind: String,
}

impl Label {
    pub fn user(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: "User".to_string(),
        }
    }
}

/// A registered runner scale set
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerScaleSet {
    pub id: i64,
    pub name: String,
    pub runner_group_id: i64,

    #[serde(default)]
    pub labels: Vec<Label>,
}

/// Body for scale set creation
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerScaleSetRequest {
    pub name: String,
    pub runner_group_id: i64,
    pub labels: Vec<Label>,
    pub runner_setting: RunnerSetting,
}

/// Runner behaviour settings carried by a scale set
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerSetting {
    /// Every runner accepts exactly one job and is then deregistered
    pub ephemeral: bool,

    pub disable_update: bool,
}

/// An open message session bound to a scale set
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerScaleSetSession {
    pub session_id: String,
    pub owner_name: String,
    pub message_queue_url: String,
    pub message_queue_access_token: String,
}

/// Aggregate job statistics delivered with each message
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerScaleSetStatistic {
    #[serde(default)]
    pub total_available_jobs: i64,

    #[serde(default)]
    pub total_acquired_jobs: i64,

    /// Jobs currently assigned to this scale set; drives the desired
    /// runner count
    #[serde(default)]
    pub total_assigned_jobs: i64,

    #[serde(default)]
    pub total_running_jobs: i64,

    #[serde(default)]
    pub total_registered_runners: i64,

    #[serde(default)]
    pub total_busy_runners: i64,

    #[serde(default)]
    pub total_idle_runners: i64,
}

/// A message popped from the session queue. The body is a JSON-encoded
/// list of job events when `message_type` is `RunnerScaleSetJobMessages`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerScaleSetMessage {
    pub message_id: i64,
    pub message_type: String,

    #[serde(default)]
    pub statistics: Option<RunnerScaleSetStatistic>,

    #[serde(default)]
    pub body: Option<String>,
}

/// Message type carrying job lifecycle events and statistics
pub const MESSAGE_TYPE_JOB_MESSAGES: &str = "RunnerScaleSetJobMessages";

/// A single job lifecycle event
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMessage {
    pub message_type: String,

    #[serde(default)]
    pub runner_name: Option<String>,

    #[serde(default)]
    pub result: Option<String>,
}

pub const JOB_STARTED: &str = "JobStarted";
pub const JOB_COMPLETED: &str = "JobCompleted";

/// Response from the just-in-time config endpoint
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JitRunnerConfig {
    pub runner: RunnerReference,
    pub encoded_jit_config: String,
}

/// Minimal reference to a registered runner
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerReference {
    pub id: i64,
    pub name: String,
}
