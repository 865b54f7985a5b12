//! Compute API request and response types

use serde::{Deserialize, Serialize};

/// Instance resource submitted to the insert endpoint
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub name: String,
    pub machine_type: String,
    pub disks: Vec<AttachedDisk>,
    pub network_interfaces: Vec<NetworkInterface>,
    pub metadata: Metadata,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_accounts: Option<Vec<ServiceAccount>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachedDisk {
    pub boot: bool,
    pub auto_delete: bool,
    pub initialize_params: InitializeParams,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub source_image: String,

    /// int64 fields travel as strings in the REST API
    pub disk_size_gb: String,

    pub disk_type: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    pub network: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub subnetwork: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_configs: Option<Vec<AccessConfig>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccessConfig {
    #[serde(rename = "type")]
    pub kind: String,

    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Metadata {
    pub items: Vec<MetadataItem>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetadataItem {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceAccount {
    pub email: String,
    pub scopes: Vec<String>,
}

/// A zonal long-running operation
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub name: String,

    /// PENDING, RUNNING, or DONE
    pub status: String,

    #[serde(default)]
    pub error: Option<OperationErrors>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OperationErrors {
    #[serde(default)]
    pub errors: Vec<OperationErrorDetail>,
}

impl OperationErrors {
    /// Flatten the error list into one diagnostic message
    pub fn to_message(&self) -> String {
        if self.errors.is_empty() {
            return "operation failed".to_string();
        }
        self.errors
            .iter()
            .map(|e| format!("{}: {}", e.code, e.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OperationErrorDetail {
    #[serde(default)]
    pub code: String,

    #[serde(default)]
    pub message: String,
}

/// Error envelope returned by non-2xx responses
#[derive(Debug, Deserialize)]
pub struct ApiErrorBody {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
pub struct ApiErrorDetail {
    #[serde(default)]
    pub code: i64,

    #[serde(default)]
    pub message: String,
}
