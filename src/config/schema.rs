//! TOML configuration schema.
//!
//! Deserialized once at process start via [`serde`]; cross-field validation that can't be
//! expressed as a plain deserialize constraint (runtime/ingress compatibility, the wildcard
//! gateway-address shape) runs immediately afterward in [`AppConfig::validate`].

use serde::{Deserialize, Serialize};

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_ready_timeout_secs() -> u64 {
    30
}

fn default_ready_poll_interval_ms() -> u64 {
    200
}

fn default_ready_probe_deadline_ms() -> u64 {
    5_000
}

fn default_watch_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            api_key: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Which container runtime backs sandbox workloads. Exactly one is live per process,
/// selected at startup and never switched at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RuntimeConfig {
    LocalDaemon {
        agent_image: String,
        #[serde(default)]
        network_mode: LocalNetworkMode,
    },
    ClusterPod {
        agent_image: String,
    },
    ClusterCr {
        agent_image: String,
        template_file: String,
    },
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LocalNetworkMode {
    #[default]
    Host,
    Bridge,
}

/// How `(sandbox_id, port)` is turned into an addressable URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum IngressConfig {
    Direct,
    Gateway {
        address: String,
        route: GatewayRouteConfig,
    },
}

impl Default for IngressConfig {
    fn default() -> Self {
        IngressConfig::Direct
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayRouteConfig {
    pub mode: GatewayRouteMode,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GatewayRouteMode {
    Wildcard,
    Uri,
    Header,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub service_account: Option<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self { namespace: default_namespace(), service_account: None }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub allowed_host_paths: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,
    #[serde(default = "default_ready_poll_interval_ms")]
    pub ready_poll_interval_ms: u64,
    /// Per-probe deadline, strictly shorter than the service-wide request deadline so a
    /// paused sandbox's frozen health endpoint fails fast rather than hanging the poll.
    #[serde(default = "default_ready_probe_deadline_ms")]
    pub ready_probe_deadline_ms: u64,
    #[serde(default = "default_watch_timeout_secs")]
    pub watch_timeout_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            ready_timeout_secs: default_ready_timeout_secs(),
            ready_poll_interval_ms: default_ready_poll_interval_ms(),
            ready_probe_deadline_ms: default_ready_probe_deadline_ms(),
            watch_timeout_secs: default_watch_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub ingress: IngressConfig,
    #[serde(default)]
    pub cluster: Option<ClusterConfig>,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub timing: TimingConfig,
}

impl AppConfig {
    /// Cross-field validation that a plain `#[derive(Deserialize)]` can't express.
    pub fn validate(&self) -> Result<(), String> {
        let is_local_daemon = matches!(self.runtime, RuntimeConfig::LocalDaemon { .. });
        let is_gateway = matches!(self.ingress, IngressConfig::Gateway { .. });

        if is_local_daemon && is_gateway {
            return Err("local-daemon runtime cannot be combined with gateway ingress".to_string());
        }

        if let IngressConfig::Gateway { address, route } = &self.ingress {
            if route.mode == GatewayRouteMode::Wildcard && !address.starts_with("*.") {
                return Err(format!(
                    "gateway address '{address}' must start with '*.' in wildcard route mode"
                ));
            }
        }

        let is_cluster = matches!(self.runtime, RuntimeConfig::ClusterPod { .. } | RuntimeConfig::ClusterCr { .. });
        if is_cluster && self.cluster.is_none() {
            return Err("cluster runtime requires a [cluster] configuration table".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_daemon_with_gateway_ingress_is_rejected() {
        let toml = r#"
            [runtime]
            type = "local-daemon"
            agent_image = "opensandbox/agent:latest"

            [ingress]
            mode = "gateway"
            address = "https://gw.example.com"

            [ingress.route]
            mode = "uri"
        "#;
        let config: AppConfig = toml::from_str(toml).expect("deserializes");
        assert!(config.validate().is_err());
    }

    #[test]
    fn wildcard_route_requires_wildcard_address() {
        let toml = r#"
            [runtime]
            type = "cluster-pod"
            agent_image = "opensandbox/agent:latest"

            [cluster]
            namespace = "sandboxes"

            [ingress]
            mode = "gateway"
            address = "gw.example.com"

            [ingress.route]
            mode = "wildcard"
        "#;
        let config: AppConfig = toml::from_str(toml).expect("deserializes");
        assert!(config.validate().is_err());
    }

    #[test]
    fn cluster_runtime_without_cluster_table_is_rejected() {
        let toml = r#"
            [runtime]
            type = "cluster-pod"
            agent_image = "opensandbox/agent:latest"
        "#;
        let config: AppConfig = toml::from_str(toml).expect("deserializes");
        assert!(config.validate().is_err());
    }

    #[test]
    fn minimal_local_daemon_config_is_valid() {
        let toml = r#"
            [runtime]
            type = "local-daemon"
            agent_image = "opensandbox/agent:latest"
        "#;
        let config: AppConfig = toml::from_str(toml).expect("deserializes");
        assert!(config.validate().is_ok());
        assert_eq!(config.server.port, 8080);
    }
}
