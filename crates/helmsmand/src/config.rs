//! helmsman.toml configuration parser.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use helmsman_api::StaticConfigurationService;
use helmsman_coordination::ConsumerOptions;
use helmsman_engine::EngineConfig;
use helmsman_remote::RemoteConfig;
use helmsman_store::Parameters;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HelmsmanConfig {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub coordination: CoordinationConfig,
    pub queue: QueueConfig,
    pub remote: RemoteSettings,
    pub deploy: DeployConfig,
    pub applications: ApplicationsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/helmsman"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Key prefix for coordination entries.
    pub prefix: String,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            prefix: "helmsman".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub threads: usize,
    /// Per-message invisibility lease in milliseconds.
    pub lock_ms: u64,
    /// End-of-queue backoff in milliseconds.
    pub backoff_ms: u64,
    /// Throttle between messages in milliseconds.
    pub throttle_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            threads: 1,
            lock_ms: 60_000,
            backoff_ms: 200,
            throttle_ms: 200,
        }
    }
}

impl QueueConfig {
    pub fn consumer_options(&self) -> ConsumerOptions {
        ConsumerOptions {
            lock: Duration::from_millis(self.lock_ms),
            backoff: Duration::from_millis(self.backoff_ms),
            throttle: Duration::from_millis(self.throttle_ms),
            threads: self.threads,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteSettings {
    /// Environment name → ASG service base URL.
    pub environments: HashMap<String, String>,
    /// Environment name → VPC id.
    pub vpc_ids: HashMap<String, String>,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            environments: HashMap::new(),
            vpc_ids: HashMap::new(),
            connect_timeout_ms: 5_000,
            request_timeout_ms: 15_000,
        }
    }
}

impl RemoteSettings {
    pub fn remote_config(&self) -> RemoteConfig {
        RemoteConfig {
            environments: self.environments.clone(),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    /// Poll budget per remote task.
    pub task_retries: u32,
    /// Interval between polls in milliseconds.
    pub poll_interval_ms: u64,
    pub instance_health_port: u16,
    pub instance_health_path: String,
    /// SSH key applied when an application configures none.
    pub default_key_name: String,
    /// Security groups appended to every deployment's selection.
    pub required_security_groups: Vec<String>,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            task_retries: 3600,
            poll_interval_ms: 1_000,
            instance_health_port: 8080,
            instance_health_path: "/healthcheck".to_string(),
            default_key_name: "helmsman".to_string(),
            required_security_groups: Vec::new(),
        }
    }
}

impl DeployConfig {
    pub fn engine_config(&self, remote: &RemoteSettings) -> EngineConfig {
        EngineConfig {
            task_retries: self.task_retries,
            health_poll_interval: Duration::from_millis(self.poll_interval_ms),
            instance_health_port: self.instance_health_port,
            instance_health_path: self.instance_health_path.clone(),
            required_security_groups: self.required_security_groups.clone(),
            vpc_ids: remote.vpc_ids.clone(),
        }
    }
}

/// Static configuration-service entries for single-box setups.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ApplicationsConfig {
    /// AMI → application name.
    pub images: HashMap<String, String>,
    /// `{application}-{environment}` → configuration revision.
    pub hashes: HashMap<String, String>,
    /// `{application}-{environment}-{region}` → default parameters.
    pub parameters: HashMap<String, Parameters>,
}

impl HelmsmanConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: HelmsmanConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Build the static configuration service from the `[applications]`
    /// tables, applying the default SSH key where none is configured.
    pub fn config_service(&self) -> StaticConfigurationService {
        let mut service = StaticConfigurationService::new();
        for (ami, application) in &self.applications.images {
            service = service.with_image(ami, application);
        }
        for (key, hash) in &self.applications.hashes {
            if let Some((application, environment)) = key.rsplit_once('-') {
                service = service.with_hash(application, environment, hash);
            }
        }
        for (key, parameters) in &self.applications.parameters {
            let mut parameters = parameters.clone();
            if parameters.str_value("key_name").is_none() {
                parameters.set("key_name", self.deploy.default_key_name.clone());
            }
            // Key layout: {application}-{environment}-{region}, where the
            // region itself contains dashes.
            let mut split = key.splitn(3, '-');
            if let (Some(application), Some(environment), Some(region)) =
                (split.next(), split.next(), split.next())
            {
                service = service.with_parameters(application, environment, region, parameters);
            }
        }
        service
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = HelmsmanConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.queue.threads, 1);
        assert_eq!(config.queue.lock_ms, 60_000);
        assert_eq!(config.queue.backoff_ms, 200);
        assert_eq!(config.queue.throttle_ms, 200);
        assert_eq!(config.deploy.task_retries, 3600);
        assert_eq!(config.deploy.poll_interval_ms, 1_000);
        assert_eq!(config.remote.connect_timeout_ms, 5_000);
        assert_eq!(config.remote.request_timeout_ms, 15_000);
        assert_eq!(config.coordination.prefix, "helmsman");
    }

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
[server]
port = 9090

[store]
data_dir = "/tmp/helmsman"

[coordination]
prefix = "deploys"

[queue]
threads = 4
lock_ms = 30000

[remote]
connect_timeout_ms = 2000

[remote.environments]
prod = "http://asgard.example.com:8080"

[remote.vpc_ids]
prod = "vpc-abc123"

[deploy]
task_retries = 100
required_security_groups = ["healthcheck", "monitoring"]

[applications.images]
"ami-1" = "foo"

[applications.hashes]
"foo-prod" = "abc123"

[applications.parameters."foo-prod-eu-west-1"]
min = 1
max = 2
health_check_type = "ELB"
selected_load_balancers = ["foo-frontend"]
"#;
        let config: HelmsmanConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.queue.threads, 4);
        assert_eq!(config.queue.lock_ms, 30_000);
        assert_eq!(config.queue.throttle_ms, 200); // default survives
        assert_eq!(
            config.remote.environments.get("prod").map(String::as_str),
            Some("http://asgard.example.com:8080")
        );
        assert_eq!(config.deploy.task_retries, 100);

        let engine = config.deploy.engine_config(&config.remote);
        assert_eq!(engine.task_retries, 100);
        assert_eq!(
            engine.vpc_ids.get("prod").map(String::as_str),
            Some("vpc-abc123")
        );
        assert_eq!(
            engine.required_security_groups,
            vec!["healthcheck".to_string(), "monitoring".to_string()]
        );
    }

    #[tokio::test]
    async fn config_service_carries_default_key_name() {
        use helmsman_api::ConfigurationService;

        let toml_str = r#"
[applications.parameters."foo-prod-eu-west-1"]
min = 1
"#;
        let config: HelmsmanConfig = toml::from_str(toml_str).unwrap();
        let service = config.config_service();
        let params = service
            .deployment_parameters("foo", "prod", "eu-west-1")
            .await
            .unwrap();
        assert_eq!(params.min(), Some(1));
        assert_eq!(params.str_value("key_name"), Some("helmsman"));
    }
}
