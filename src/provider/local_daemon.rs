//! Local-daemon runtime provider: sandboxes are containers on a local Docker-compatible
//! daemon, reached through `bollard`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use bollard::Docker;
use futures::StreamExt;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StartContainerOptions, UploadToContainerOptions,
};
use bollard::models::{HostConfig, PortBinding};
use bollard::query_parameters::InspectContainerOptions;
use chrono::{DateTime, Utc};

use super::{ProviderError, ProviderResult, RuntimeProvider, SandboxMetrics};
use crate::agent::{BOOTSTRAP_PATH, build_injection_archive};
use crate::config::LocalNetworkMode;
use crate::endpoint::{Endpoint, LocalDaemonAddress, format_local_daemon_endpoint};
use crate::model::{
    AGENT_EMBEDDING_PROXY_PORT, AGENT_HTTP_PORT, EMBEDDING_PROXY_PORT_LABEL, EXPIRES_AT_LABEL,
    HTTP_PORT_LABEL, Pagination, RESERVED_LABEL_PREFIX, SANDBOX_ID_LABEL, Sandbox, SandboxFilter,
    SandboxSpec, SandboxState, SandboxStatus, filter_and_paginate,
};

/// Fixed label key identifying containers this provider manages, distinct from the
/// per-sandbox `opensandbox.io/id` label so a label filter can select them all at once.
const MANAGED_BY_LABEL: &str = "opensandbox.io/managed-by";
const MANAGED_BY_VALUE: &str = "opensandbox-core";

pub struct LocalDaemonProvider {
    docker: Docker,
    network_mode: LocalNetworkMode,
    agent_binary_path: PathBuf,
    /// sandbox id -> docker container id, to avoid a label lookup on every hot-path call.
    container_ids: Mutex<HashMap<String, String>>,
    /// sandbox id -> current expiry. bollard has no "update container labels" call, so
    /// `renew` cannot rewrite the `opensandbox.io/expires-at` label in place; this map is
    /// the authoritative projection `get`/`list` read from instead of the (stale) label.
    expirations: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl LocalDaemonProvider {
    /// Connect to the local daemon using its platform-default transport (the Unix socket on
    /// Linux/macOS, the named pipe on Windows).
    pub fn connect(network_mode: LocalNetworkMode, agent_binary_path: PathBuf) -> ProviderResult<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|err| ProviderError::Initialization(format!("failed to connect to local daemon: {err}")))?;
        Ok(Self {
            docker,
            network_mode,
            agent_binary_path,
            container_ids: Mutex::new(HashMap::new()),
            expirations: Mutex::new(HashMap::new()),
        })
    }

    fn record_expiry(&self, sandbox_id: &str, expires_at: DateTime<Utc>) {
        self.expirations.lock().expect("lock poisoned").insert(sandbox_id.to_string(), expires_at);
    }

    fn projected_expiry(&self, sandbox_id: &str, label_fallback: DateTime<Utc>) -> DateTime<Utc> {
        self.expirations
            .lock()
            .expect("lock poisoned")
            .get(sandbox_id)
            .copied()
            .unwrap_or(label_fallback)
    }

    fn container_id(&self, sandbox_id: &str) -> ProviderResult<String> {
        self.container_ids
            .lock()
            .expect("lock poisoned")
            .get(sandbox_id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(sandbox_id.to_string()))
    }
}

#[async_trait]
impl RuntimeProvider for LocalDaemonProvider {
    fn name(&self) -> &'static str {
        "local-daemon"
    }

    async fn create(&self, spec: &SandboxSpec) -> ProviderResult<Sandbox> {
        if let Ok(existing_id) = self.container_id(&spec.id) {
            return self.inspect_to_sandbox(&existing_id, spec).await;
        }

        let host_mode = self.network_mode == LocalNetworkMode::Host;

        let mut labels: HashMap<String, String> = spec
            .metadata
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        labels.insert(SANDBOX_ID_LABEL.to_string(), spec.id.clone());
        labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());

        let expires_at = Utc::now() + chrono::Duration::seconds(spec.timeout_seconds as i64);
        labels.insert(EXPIRES_AT_LABEL.to_string(), expires_at.to_rfc3339());

        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();

        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        if !host_mode {
            for port in [AGENT_HTTP_PORT, AGENT_EMBEDDING_PROXY_PORT] {
                port_bindings.insert(
                    format!("{port}/tcp"),
                    Some(vec![PortBinding { host_ip: Some("0.0.0.0".to_string()), host_port: None }]),
                );
            }
        }

        let host_config = HostConfig {
            network_mode: Some(if host_mode { "host".to_string() } else { "bridge".to_string() }),
            port_bindings: if host_mode { None } else { Some(port_bindings) },
            binds: Some(
                spec.volumes
                    .iter()
                    .filter_map(|volume| match &volume.source {
                        crate::model::VolumeSource::Host { path } => Some(format!(
                            "{}:{}{}",
                            path,
                            volume.mount_path,
                            if volume.read_only { ":ro" } else { "" }
                        )),
                        crate::model::VolumeSource::Pvc { .. } => None,
                    })
                    .collect(),
            ),
            ..Default::default()
        };

        let container_config = ContainerConfig {
            image: Some(spec.image.uri.clone()),
            entrypoint: Some(vec!["/bin/sh".to_string(), BOOTSTRAP_PATH.to_string()]),
            cmd: if spec.entrypoint.is_empty() { None } else { Some(spec.entrypoint.clone()) },
            env: Some(env),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions { name: Some(spec.id.clone()), platform: None };
        let created = self
            .docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|err| ProviderError::Operation(format!("failed to create container: {err}")))?;

        let archive = build_injection_archive(&self.agent_binary_path)?;
        self.docker
            .upload_to_container(
                &created.id,
                Some(UploadToContainerOptions { path: "/".to_string(), ..Default::default() }),
                archive.into(),
            )
            .await
            .map_err(|err| ProviderError::Operation(format!("failed to inject agent into container: {err}")))?;

        self.docker
            .start_container(&created.id, None::<StartContainerOptions>)
            .await
            .map_err(|err| ProviderError::Operation(format!("failed to start container: {err}")))?;

        self.container_ids.lock().expect("lock poisoned").insert(spec.id.clone(), created.id.clone());
        self.record_expiry(&spec.id, expires_at);

        self.inspect_to_sandbox(&created.id, spec).await
    }

    async fn get(&self, id: &str) -> ProviderResult<Sandbox> {
        let container_id = self.container_id(id)?;
        self.inspect_to_sandbox_by_id_only(&container_id, id).await
    }

    async fn list(&self, filter: &SandboxFilter, pagination: Pagination) -> ProviderResult<Vec<Sandbox>> {
        let mut query = HashMap::new();
        query.insert("label".to_string(), vec![format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE}")]);
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions { all: true, filters: query, ..Default::default() }))
            .await
            .map_err(|err| ProviderError::Operation(format!("failed to list containers: {err}")))?;

        let mut sandboxes = Vec::new();
        for container in containers {
            let Some(labels) = container.labels else { continue };
            let Some(sandbox_id) = labels.get(SANDBOX_ID_LABEL) else { continue };
            let Some(container_id) = container.id.as_deref() else { continue };
            if let Ok(sandbox) = self.inspect_to_sandbox_by_id_only(container_id, sandbox_id).await {
                sandboxes.push(sandbox);
            }
        }

        Ok(filter_and_paginate(&sandboxes, filter, pagination))
    }

    async fn delete(&self, id: &str) -> ProviderResult<()> {
        let container_id = self.container_id(id)?;
        self.docker
            .remove_container(&container_id, Some(RemoveContainerOptions { force: true, ..Default::default() }))
            .await
            .map_err(|err| ProviderError::Operation(format!("failed to remove container: {err}")))?;
        self.container_ids.lock().expect("lock poisoned").remove(id);
        Ok(())
    }

    async fn pause(&self, id: &str) -> ProviderResult<()> {
        let container_id = self.container_id(id)?;
        self.docker
            .pause_container(&container_id)
            .await
            .map_err(|err| ProviderError::Operation(format!("failed to pause container: {err}")))
    }

    async fn resume(&self, id: &str) -> ProviderResult<()> {
        let container_id = self.container_id(id)?;
        self.docker
            .unpause_container(&container_id)
            .await
            .map_err(|err| ProviderError::Operation(format!("failed to resume container: {err}")))
    }

    async fn renew(&self, id: &str, new_expiry: DateTime<Utc>) -> ProviderResult<DateTime<Utc>> {
        let sandbox = self.get(id).await?;
        if new_expiry <= Utc::now() || new_expiry <= sandbox.expires_at {
            return Err(ProviderError::Conflict(
                "new expiry must be in the future and later than the current expiry".to_string(),
            ));
        }
        // bollard has no "update container labels" call, so the `opensandbox.io/expires-at`
        // label on the running container stays stale; `record_expiry` is the authoritative
        // projection `get`/`list` read from instead.
        self.record_expiry(id, new_expiry);
        Ok(new_expiry)
    }

    async fn get_endpoint(&self, id: &str, port: u16, internal: bool) -> ProviderResult<Endpoint> {
        let container_id = self.container_id(id)?;
        let inspect = self
            .docker
            .inspect_container(&container_id, None::<InspectContainerOptions>)
            .await
            .map_err(|err| ProviderError::Operation(format!("failed to inspect container: {err}")))?;

        let host_mode = self.network_mode == LocalNetworkMode::Host;
        let http_host_port = host_mapped_port(&inspect, AGENT_HTTP_PORT).unwrap_or(AGENT_HTTP_PORT);
        let embedding_proxy_host_port =
            host_mapped_port(&inspect, AGENT_EMBEDDING_PROXY_PORT).unwrap_or(AGENT_EMBEDDING_PROXY_PORT);

        let address = LocalDaemonAddress {
            host: "127.0.0.1".to_string(),
            network_mode_host: host_mode,
            http_host_port,
            embedding_proxy_host_port,
        };
        let _ = internal; // local-daemon never uses gateway ingress; internal resolution is identical.
        Ok(format_local_daemon_endpoint(&address, port))
    }

    async fn get_metrics(&self, id: &str) -> ProviderResult<SandboxMetrics> {
        let container_id = self.container_id(id)?;
        let stats = self
            .docker
            .stats(&container_id, Some(bollard::container::StatsOptions { stream: false, one_shot: true }))
            .next()
            .await
            .ok_or_else(|| ProviderError::Operation("no stats returned".to_string()))?
            .map_err(|err| ProviderError::Operation(format!("failed to read container stats: {err}")))?;

        let cpu_count = stats.cpu_stats.online_cpus.unwrap_or(1) as u32;
        let memory_total = stats.memory_stats.limit.unwrap_or(0);
        let memory_used = stats.memory_stats.usage.unwrap_or(0);

        Ok(SandboxMetrics {
            cpu_count,
            cpu_used_percentage: 0.0,
            memory_total_in_mib: memory_total / (1024 * 1024),
            memory_used_in_mib: memory_used / (1024 * 1024),
            timestamp_ms: Utc::now().timestamp_millis(),
        })
    }
}

impl LocalDaemonProvider {
    async fn inspect_to_sandbox(&self, container_id: &str, spec: &SandboxSpec) -> ProviderResult<Sandbox> {
        let inspect = self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .map_err(|err| ProviderError::Operation(format!("failed to inspect container: {err}")))?;

        let state = state_from_inspect(&inspect);
        let now = Utc::now();
        let label_fallback = now + chrono::Duration::seconds(spec.timeout_seconds as i64);
        Ok(Sandbox {
            id: spec.id.clone(),
            image: spec.image.clone(),
            entrypoint: spec.entrypoint.clone(),
            env: spec.env.clone(),
            resource: spec.resource.clone(),
            metadata: Some(spec.metadata.clone().into_iter().filter(|(k, _)| !k.starts_with(RESERVED_LABEL_PREFIX)).collect()),
            network_policy: spec.network_policy.clone(),
            volumes: spec.volumes.clone(),
            status: SandboxStatus::new(state, "Observed", "from container inspect"),
            created_at: now,
            expires_at: self.projected_expiry(&spec.id, label_fallback),
        })
    }

    /// Used by `get`/`list`, where the caller only has the container's label set to work
    /// from rather than the original spec.
    async fn inspect_to_sandbox_by_id_only(&self, container_id: &str, sandbox_id: &str) -> ProviderResult<Sandbox> {
        let inspect = self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .map_err(|err| ProviderError::Operation(format!("failed to inspect container: {err}")))?;

        let labels = inspect
            .config
            .as_ref()
            .and_then(|c| c.labels.clone())
            .unwrap_or_default();
        let metadata: HashMap<String, String> =
            labels.iter().filter(|(k, _)| !k.starts_with(RESERVED_LABEL_PREFIX)).map(|(k, v)| (k.clone(), v.clone())).collect();
        let label_expires_at = labels
            .get(EXPIRES_AT_LABEL)
            .map(|s| crate::model::parse_timestamp(s))
            .unwrap_or_else(Utc::now);
        let expires_at = self.projected_expiry(sandbox_id, label_expires_at);
        let created_at = inspect
            .created
            .as_deref()
            .map(crate::model::parse_timestamp)
            .unwrap_or_else(Utc::now);

        let state = state_from_inspect(&inspect);
        let image = inspect.config.as_ref().and_then(|c| c.image.clone()).unwrap_or_default();

        Ok(Sandbox {
            id: sandbox_id.to_string(),
            image: crate::model::ImageSpec { uri: image, username: None, password: None },
            entrypoint: inspect.config.as_ref().and_then(|c| c.cmd.clone()).unwrap_or_default(),
            env: HashMap::new(),
            resource: HashMap::new(),
            metadata: Some(metadata),
            network_policy: None,
            volumes: vec![],
            status: SandboxStatus::new(state, "Observed", "from container inspect"),
            created_at,
            expires_at,
        })
    }
}

fn state_from_inspect(inspect: &bollard::models::ContainerInspectResponse) -> SandboxState {
    let Some(state) = &inspect.state else { return SandboxState::Unknown };
    if state.paused.unwrap_or(false) {
        return SandboxState::Paused;
    }
    if state.running.unwrap_or(false) {
        return SandboxState::Running;
    }
    if state.restarting.unwrap_or(false) {
        return SandboxState::Unknown;
    }
    if state.dead.unwrap_or(false) || state.oom_killed.unwrap_or(false) {
        return SandboxState::Failed;
    }
    SandboxState::Stopping
}

fn host_mapped_port(inspect: &bollard::models::ContainerInspectResponse, container_port: u16) -> Option<u16> {
    let ports = inspect.network_settings.as_ref()?.ports.as_ref()?;
    let bindings = ports.get(&format!("{container_port}/tcp"))?.as_ref()?;
    bindings.first()?.host_port.as_ref()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_mode_has_no_port_bindings_to_resolve() {
        // Host-mode containers share the host network namespace, so `host_mapped_port`
        // is never consulted for them; the formatter takes the requested port verbatim.
        let address = LocalDaemonAddress {
            host: "127.0.0.1".into(),
            network_mode_host: true,
            http_host_port: AGENT_HTTP_PORT,
            embedding_proxy_host_port: AGENT_EMBEDDING_PROXY_PORT,
        };
        assert_eq!(format_local_daemon_endpoint(&address, 9000).endpoint, "127.0.0.1:9000");
    }
}
