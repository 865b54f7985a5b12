//! Configuration structures and loading

use anyhow::{Context, Result};
use serde::Deserialize;
use thiserror::Error;

/// Errors produced by configuration validation. All of these are fatal
/// at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("github.url is required")]
    MissingGithubUrl,

    #[error("invalid github.url: {0}")]
    InvalidGithubUrl(String),

    #[error("exactly one of github.token or github.app must be set")]
    AmbiguousCredentials,

    #[error("github.app requires exactly one of private_key or private_key_path")]
    AmbiguousAppKey,

    #[error("scaleset.name is required")]
    MissingScaleSetName,

    #[error("scaleset.min_runners ({min}) must not exceed scaleset.max_runners ({max})")]
    RunnerBounds { min: usize, max: usize },

    #[error("exactly one engine must be enabled, found {0}")]
    EngineCount(usize),

    #[error("engine.{0} is not supported by this build")]
    UnsupportedEngine(&'static str),

    #[error("engine.docker.image is required when engine.docker is enabled")]
    MissingDockerImage,

    #[error("engine.gcp.{0} is required when engine.gcp is enabled")]
    MissingGcpField(&'static str),

    #[error("logging.level must be one of debug, info, warn, error (got {0:?})")]
    InvalidLogLevel(String),

    #[error("logging.format must be text or json (got {0:?})")]
    InvalidLogFormat(String),

    #[error("invalid telemetry.push_endpoint: {0}")]
    InvalidPushEndpoint(String),
}

/// Main daemon configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Configuration {
    /// Enable debug mode
    #[serde(default)]
    pub debug: bool,

    /// Upstream GitHub configuration
    pub github: GithubConfiguration,

    /// Runner scale set parameters
    pub scaleset: ScaleSetConfiguration,

    /// Compute engine selection and backend settings
    #[serde(default)]
    pub engine: EngineConfiguration,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfiguration,

    /// Telemetry configuration
    #[serde(default)]
    pub telemetry: TelemetryConfiguration,
}

impl Configuration {
    /// Load configuration from a TOML file and validate it
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: Configuration = toml::from_str(&content)
            .with_context(|| "Failed to parse configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration, returning the first violation found
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.github.validate()?;
        self.scaleset.validate()?;
        self.engine.validate()?;
        self.logging.validate()?;
        self.telemetry.validate()?;
        Ok(())
    }
}

/// Upstream GitHub configuration
#[derive(Debug, Clone, Deserialize)]
pub struct GithubConfiguration {
    /// Organization, enterprise, or repository URL the runners register
    /// against (e.g. `https://github.com/my-org`)
    pub url: String,

    /// Personal access token
    #[serde(default)]
    pub token: Option<String>,

    /// GitHub App credentials, mutually exclusive with `token`
    #[serde(default)]
    pub app: Option<GithubAppConfiguration>,
}

impl GithubConfiguration {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::MissingGithubUrl);
        }
        if url::Url::parse(&self.url).is_err() {
            return Err(ConfigError::InvalidGithubUrl(self.url.clone()));
        }
        match (&self.token, &self.app) {
            (Some(_), None) | (None, Some(_)) => {}
            _ => return Err(ConfigError::AmbiguousCredentials),
        }
        if let Some(app) = &self.app {
            app.validate()?;
        }
        Ok(())
    }
}

/// GitHub App credentials
#[derive(Debug, Clone, Deserialize)]
pub struct GithubAppConfiguration {
    /// App client id (also accepts the numeric app id)
    pub client_id: String,

    /// Installation id for the target organization
    pub installation_id: u64,

    /// PEM-encoded private key
    #[serde(default)]
    pub private_key: Option<String>,

    /// Path to a PEM-encoded private key file
    #[serde(default)]
    pub private_key_path: Option<String>,
}

impl GithubAppConfiguration {
    fn validate(&self) -> Result<(), ConfigError> {
        match (&self.private_key, &self.private_key_path) {
            (Some(_), None) | (None, Some(_)) => Ok(()),
            _ => Err(ConfigError::AmbiguousAppKey),
        }
    }

    /// Resolve the private key material, reading the file if needed
    pub fn private_key_pem(&self) -> Result<String> {
        if let Some(key) = &self.private_key {
            return Ok(key.clone());
        }
        let path = self
            .private_key_path
            .as_deref()
            .context("github.app has no private key configured")?;
        std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read private key: {}", path))
    }
}

/// Runner scale set parameters
#[derive(Debug, Clone, Deserialize)]
pub struct ScaleSetConfiguration {
    /// Scale set name registered with the upstream service
    pub name: String,

    /// Labels jobs must request to land on these runners
    #[serde(default = "default_labels")]
    pub labels: Vec<String>,

    /// Runner group the scale set belongs to
    #[serde(default = "default_runner_group")]
    pub runner_group: String,

    /// Floor of provisioned runners, added on top of demand
    #[serde(default)]
    pub min_runners: usize,

    /// Ceiling of provisioned runners
    #[serde(default = "default_max_runners")]
    pub max_runners: usize,
}

impl ScaleSetConfiguration {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::MissingScaleSetName);
        }
        if self.min_runners > self.max_runners {
            return Err(ConfigError::RunnerBounds {
                min: self.min_runners,
                max: self.max_runners,
            });
        }
        Ok(())
    }
}

fn default_labels() -> Vec<String> {
    vec!["self-hosted".into()]
}

fn default_runner_group() -> String {
    "Default".into()
}

fn default_max_runners() -> usize {
    10
}

/// Which compute backend materializes runners
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Docker,
    Gcp,
}

/// Compute engine selection. Exactly one backend must be enabled.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfiguration {
    #[serde(default)]
    pub docker: DockerEngineConfiguration,

    #[serde(default)]
    pub gcp: GcpEngineConfiguration,

    #[serde(default)]
    pub aws: StubEngineConfiguration,

    #[serde(default)]
    pub azure: StubEngineConfiguration,
}

impl EngineConfiguration {
    /// Return the single enabled backend
    pub fn enabled_engine(&self) -> Result<EngineKind, ConfigError> {
        let enabled = [
            self.docker.enable,
            self.gcp.enable,
            self.aws.enable,
            self.azure.enable,
        ]
        .iter()
        .filter(|e| **e)
        .count();

        if enabled != 1 {
            return Err(ConfigError::EngineCount(enabled));
        }
        if self.aws.enable {
            return Err(ConfigError::UnsupportedEngine("aws"));
        }
        if self.azure.enable {
            return Err(ConfigError::UnsupportedEngine("azure"));
        }
        if self.docker.enable {
            Ok(EngineKind::Docker)
        } else {
            Ok(EngineKind::Gcp)
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self.enabled_engine()? {
            EngineKind::Docker => self.docker.validate(),
            EngineKind::Gcp => self.gcp.validate(),
        }
    }
}

/// Docker backend settings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DockerEngineConfiguration {
    #[serde(default)]
    pub enable: bool,

    /// Runner container image
    #[serde(default)]
    pub image: String,

    /// Grant runners access to the host Docker socket. Containers run as
    /// root in this mode so socket ownership works on both native Linux
    /// and desktop virtualized daemons.
    #[serde(default)]
    pub privileged: bool,
}

impl DockerEngineConfiguration {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.image.trim().is_empty() {
            return Err(ConfigError::MissingDockerImage);
        }
        Ok(())
    }
}

/// GCP backend settings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GcpEngineConfiguration {
    #[serde(default)]
    pub enable: bool,

    /// Project id instances are created in
    #[serde(default)]
    pub project: String,

    /// Zone instances are created in (e.g. `europe-west1-b`)
    #[serde(default)]
    pub zone: String,

    /// Machine type name
    #[serde(default = "default_machine_type")]
    pub machine_type: String,

    /// Source image for the boot disk
    #[serde(default)]
    pub image: String,

    /// Boot disk size in GiB
    #[serde(default = "default_disk_size_gb")]
    pub disk_size_gb: i64,

    /// VPC network name
    #[serde(default = "default_network")]
    pub network: String,

    /// Optional subnetwork name
    #[serde(default)]
    pub subnetwork: Option<String>,

    /// Attach an ephemeral public IP to each instance
    #[serde(default = "default_true")]
    pub public_ip: bool,

    /// Service account email attached to instances; grants the
    /// cloud-platform scope when set
    #[serde(default)]
    pub service_account: Option<String>,

    /// Path to a service account key file used for API authentication.
    /// Falls back to the instance metadata server when unset.
    #[serde(default)]
    pub credentials_file: Option<String>,
}

impl GcpEngineConfiguration {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.project.trim().is_empty() {
            return Err(ConfigError::MissingGcpField("project"));
        }
        if self.zone.trim().is_empty() {
            return Err(ConfigError::MissingGcpField("zone"));
        }
        if self.image.trim().is_empty() {
            return Err(ConfigError::MissingGcpField("image"));
        }
        Ok(())
    }
}

fn default_machine_type() -> String {
    "e2-medium".into()
}

fn default_disk_size_gb() -> i64 {
    50
}

fn default_network() -> String {
    "default".into()
}

fn default_true() -> bool {
    true
}

/// Recognized-but-unsupported backend section
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StubEngineConfiguration {
    #[serde(default)]
    pub enable: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfiguration {
    /// Log level: debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfiguration {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl LoggingConfiguration {
    fn validate(&self) -> Result<(), ConfigError> {
        match self.level.as_str() {
            "debug" | "info" | "warn" | "error" => {}
            other => return Err(ConfigError::InvalidLogLevel(other.to_string())),
        }
        match self.format.as_str() {
            "text" | "json" => Ok(()),
            other => Err(ConfigError::InvalidLogFormat(other.to_string())),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}

/// Telemetry configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelemetryConfiguration {
    /// Port the Prometheus scrape endpoint listens on; 0 disables it
    #[serde(default)]
    pub prometheus_port: u16,

    /// Optional endpoint the text exposition is pushed to periodically
    #[serde(default)]
    pub push_endpoint: Option<String>,
}

impl TelemetryConfiguration {
    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(endpoint) = &self.push_endpoint {
            if url::Url::parse(endpoint).is_err() {
                return Err(ConfigError::InvalidPushEndpoint(endpoint.clone()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config(engine: &str) -> Configuration {
        let content = format!(
            r#"
            [github]
            url = "https://github.com/acme"
            token = "ghp_test"

            [scaleset]
            name = "acme-runners"

            {engine}
            "#
        );
        toml::from_str(&content).unwrap()
    }

    #[test]
    fn test_docker_config_valid() {
        let config = base_config("[engine.docker]\nenable = true\nimage = \"runner:latest\"");
        assert!(config.validate().is_ok());
        assert_eq!(config.engine.enabled_engine().unwrap(), EngineKind::Docker);
    }

    #[test]
    fn test_no_engine_enabled() {
        let config = base_config("");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::EngineCount(0))
        ));
    }

    #[test]
    fn test_two_engines_enabled() {
        let config = base_config(
            "[engine.docker]\nenable = true\nimage = \"runner:latest\"\n\n[engine.gcp]\nenable = true",
        );
        assert!(matches!(
            config.validate(),
            Err(ConfigError::EngineCount(2))
        ));
    }

    #[test]
    fn test_unsupported_engine() {
        let config = base_config("[engine.aws]\nenable = true");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnsupportedEngine("aws"))
        ));
    }

    #[test]
    fn test_gcp_defaults() {
        let config = base_config(
            "[engine.gcp]\nenable = true\nproject = \"p\"\nzone = \"us-central1-a\"\nimage = \"projects/p/global/images/runner\"",
        );
        assert!(config.validate().is_ok());
        assert_eq!(config.engine.gcp.machine_type, "e2-medium");
        assert_eq!(config.engine.gcp.disk_size_gb, 50);
        assert!(config.engine.gcp.public_ip);
        assert_eq!(config.engine.gcp.network, "default");
    }

    #[test]
    fn test_runner_bounds() {
        let mut config = base_config("[engine.docker]\nenable = true\nimage = \"runner:latest\"");
        config.scaleset.min_runners = 5;
        config.scaleset.max_runners = 2;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::RunnerBounds { min: 5, max: 2 })
        ));
    }

    #[test]
    fn test_both_credentials_rejected() {
        let content = r#"
            [github]
            url = "https://github.com/acme"
            token = "ghp_test"

            [github.app]
            client_id = "Iv1.abc"
            installation_id = 42
            private_key = "key"

            [scaleset]
            name = "acme-runners"

            [engine.docker]
            enable = true
            image = "runner:latest"
        "#;
        let config: Configuration = toml::from_str(content).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::AmbiguousCredentials)
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hangar.toml");
        std::fs::write(
            &path,
            r#"
            [github]
            url = "https://github.com/acme"
            token = "ghp_test"

            [scaleset]
            name = "acme-runners"
            labels = ["self-hosted", "linux"]
            min_runners = 1
            max_runners = 4

            [engine.docker]
            enable = true
            image = "ghcr.io/acme/runner:latest"

            [logging]
            level = "debug"
            format = "json"

            [telemetry]
            prometheus_port = 9090
            "#,
        )
        .unwrap();

        let config = Configuration::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.scaleset.labels, vec!["self-hosted", "linux"]);
        assert_eq!(config.scaleset.min_runners, 1);
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.telemetry.prometheus_port, 9090);
    }

    #[test]
    fn test_load_missing_file() {
        assert!(Configuration::load("/nonexistent/hangar.toml").is_err());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = base_config("[engine.docker]\nenable = true\nimage = \"runner:latest\"");
        config.logging.level = "verbose".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel(_))
        ));
    }
}
