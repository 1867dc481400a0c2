//! Cluster-pod runtime provider: sandboxes are bare `Pod` objects on a plain Kubernetes
//! (or compatible) cluster, tracked through a [`WorkloadInformer`].

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, Pod, PodSpec, ResourceRequirements, Volume as K8sVolume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, DeleteParams, ObjectMeta, PostParams};
use kube::{Client, ResourceExt};

use super::{ProviderError, ProviderResult, RuntimeProvider, SandboxMetrics};
use crate::agent::{BOOTSTRAP_PATH, EXECD_BIN_PATH};
use crate::endpoint::{Endpoint, format_runtime_direct_endpoint};
use crate::informer::WorkloadInformer;
use crate::model::{
    EXPIRES_AT_LABEL, RESERVED_LABEL_PREFIX, SANDBOX_ID_LABEL, Sandbox, SandboxFilter, SandboxSpec,
    SandboxState, SandboxStatus, VolumeSource, filter_and_paginate,
};

pub struct ClusterPodProvider {
    client: Client,
    namespace: String,
    agent_image: String,
    service_account: Option<String>,
    informer: WorkloadInformer<Pod>,
}

impl ClusterPodProvider {
    pub async fn connect(
        namespace: String,
        agent_image: String,
        service_account: Option<String>,
        watch_timeout: Duration,
    ) -> ProviderResult<Self> {
        let client = Client::try_default()
            .await
            .map_err(|err| ProviderError::Initialization(format!("failed to build Kubernetes client: {err}")))?;

        let api: Api<Pod> = Api::namespaced(client.clone(), &namespace);
        let informer = WorkloadInformer::spawn(api, Some(watch_timeout), Duration::from_secs(30));

        Ok(Self { client, namespace, agent_image, service_account, informer })
    }

    fn api(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

#[async_trait]
impl RuntimeProvider for ClusterPodProvider {
    fn name(&self) -> &'static str {
        "cluster-pod"
    }

    async fn create(&self, spec: &SandboxSpec) -> ProviderResult<Sandbox> {
        if let Some(existing) = self.informer.get(&spec.id) {
            return Ok(pod_to_sandbox(&existing, spec));
        }

        let expires_at = Utc::now() + chrono::Duration::seconds(spec.timeout_seconds as i64);

        let mut labels: BTreeMap<String, String> =
            spec.metadata.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        labels.insert(SANDBOX_ID_LABEL.to_string(), spec.id.clone());
        labels.insert(EXPIRES_AT_LABEL.to_string(), expires_at.to_rfc3339());

        let resource_requirements = build_resource_requirements(&spec.resource);

        let volumes: Vec<K8sVolume> = spec
            .volumes
            .iter()
            .filter_map(|v| match &v.source {
                VolumeSource::Host { path } => Some(K8sVolume {
                    name: v.name.clone(),
                    host_path: Some(k8s_openapi::api::core::v1::HostPathVolumeSource {
                        path: path.clone(),
                        type_: None,
                    }),
                    ..Default::default()
                }),
                VolumeSource::Pvc { claim_name } => Some(K8sVolume {
                    name: v.name.clone(),
                    persistent_volume_claim: Some(
                        k8s_openapi::api::core::v1::PersistentVolumeClaimVolumeSource {
                            claim_name: claim_name.clone(),
                            read_only: Some(v.read_only),
                        },
                    ),
                    ..Default::default()
                }),
            })
            .collect();

        let volume_mounts: Vec<VolumeMount> = spec
            .volumes
            .iter()
            .map(|v| VolumeMount {
                name: v.name.clone(),
                mount_path: v.mount_path.clone(),
                read_only: Some(v.read_only),
                sub_path: v.sub_path.clone(),
                ..Default::default()
            })
            .collect();

        let env: Vec<EnvVar> = spec
            .env
            .iter()
            .map(|(k, v)| EnvVar { name: k.clone(), value: Some(v.clone()), value_from: None })
            .collect();

        let container = Container {
            name: "sandbox".to_string(),
            image: Some(spec.image.uri.clone()),
            command: Some(vec!["/bin/sh".to_string(), BOOTSTRAP_PATH.to_string()]),
            args: if spec.entrypoint.is_empty() { None } else { Some(spec.entrypoint.clone()) },
            env: Some(env),
            resources: Some(resource_requirements),
            volume_mounts: Some(volume_mounts),
            ..Default::default()
        };

        // The agent binary and bootstrap script are injected as an init container writing
        // to a shared `emptyDir`, mirroring the local-daemon provider's upload-then-exec
        // sequence but expressed as a Kubernetes volume rather than a tar upload.
        let init_container = Container {
            name: "install-agent".to_string(),
            image: Some(self.agent_image.clone()),
            command: Some(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                format!("mkdir -p $(dirname {EXECD_BIN_PATH}) && cp /execd {EXECD_BIN_PATH}"),
            ]),
            volume_mounts: Some(vec![VolumeMount {
                name: "opensandbox-agent".to_string(),
                mount_path: "/opt/opensandbox".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        };

        let pod = Pod {
            metadata: ObjectMeta {
                name: Some(spec.id.clone()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(PodSpec {
                init_containers: Some(vec![init_container]),
                containers: vec![container],
                volumes: Some(
                    volumes
                        .into_iter()
                        .chain(std::iter::once(K8sVolume {
                            name: "opensandbox-agent".to_string(),
                            empty_dir: Some(Default::default()),
                            ..Default::default()
                        }))
                        .collect(),
                ),
                service_account_name: self.service_account.clone(),
                restart_policy: Some("Never".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let created = self
            .api()
            .create(&PostParams::default(), &pod)
            .await
            .map_err(|err| ProviderError::Operation(format!("failed to create pod: {err}")))?;

        Ok(pod_to_sandbox(&created, spec))
    }

    async fn get(&self, id: &str) -> ProviderResult<Sandbox> {
        let pod = self.informer.get(id).ok_or_else(|| ProviderError::NotFound(id.to_string()))?;
        Ok(pod_to_sandbox_from_labels(&pod))
    }

    async fn list(&self, filter: &SandboxFilter, pagination: crate::model::Pagination) -> ProviderResult<Vec<Sandbox>> {
        let sandboxes: Vec<Sandbox> = self.informer.list().iter().map(pod_to_sandbox_from_labels).collect();
        Ok(filter_and_paginate(&sandboxes, filter, pagination))
    }

    async fn delete(&self, id: &str) -> ProviderResult<()> {
        self.api()
            .delete(id, &DeleteParams::default())
            .await
            .map_err(|err| ProviderError::Operation(format!("failed to delete pod: {err}")))?;
        Ok(())
    }

    async fn pause(&self, id: &str) -> ProviderResult<()> {
        self.signal_main_process(id, "STOP").await
    }

    async fn resume(&self, id: &str) -> ProviderResult<()> {
        self.signal_main_process(id, "CONT").await
    }

    async fn renew(&self, id: &str, new_expiry: DateTime<Utc>) -> ProviderResult<DateTime<Utc>> {
        let sandbox = self.get(id).await?;
        if new_expiry <= Utc::now() || new_expiry <= sandbox.expires_at {
            return Err(ProviderError::Conflict(
                "new expiry must be in the future and later than the current expiry".to_string(),
            ));
        }
        let patch = serde_json::json!({
            "metadata": { "labels": { EXPIRES_AT_LABEL: new_expiry.to_rfc3339() } }
        });
        self.api()
            .patch(id, &kube::api::PatchParams::default(), &kube::api::Patch::Merge(patch))
            .await
            .map_err(|err| ProviderError::Operation(format!("failed to patch expiration label: {err}")))?;
        Ok(new_expiry)
    }

    async fn get_endpoint(&self, id: &str, port: u16, _internal: bool) -> ProviderResult<Endpoint> {
        let pod = self.informer.get(id).ok_or_else(|| ProviderError::NotFound(id.to_string()))?;
        let pod_ip = pod
            .status
            .as_ref()
            .and_then(|s| s.pod_ip.clone())
            .ok_or_else(|| ProviderError::Operation(format!("pod '{id}' has no assigned IP yet")))?;
        Ok(format_runtime_direct_endpoint(&pod_ip, port))
    }

    async fn get_metrics(&self, id: &str) -> ProviderResult<SandboxMetrics> {
        let pod = self.informer.get(id).ok_or_else(|| ProviderError::NotFound(id.to_string()))?;
        let (cpu_nano, memory_bytes) = pod
            .spec
            .as_ref()
            .and_then(|spec| spec.containers.first())
            .and_then(|c| c.resources.as_ref())
            .map(resource_requirements_totals)
            .unwrap_or((0, 0));

        Ok(SandboxMetrics {
            cpu_count: ((cpu_nano as f64 / 1_000_000_000.0).ceil() as u32).max(1),
            // Actual utilization requires the cluster's metrics API (metrics.k8s.io), which
            // is a separate, optionally-installed aggregated API server; this provider
            // reports requested capacity and leaves utilization at zero when unavailable.
            cpu_used_percentage: 0.0,
            memory_total_in_mib: memory_bytes / (1024 * 1024),
            memory_used_in_mib: 0,
            timestamp_ms: Utc::now().timestamp_millis(),
        })
    }
}

impl ClusterPodProvider {
    async fn signal_main_process(&self, id: &str, signal: &str) -> ProviderResult<()> {
        use futures::StreamExt;
        use kube::api::AttachParams;

        let attach_params = AttachParams::default().container("sandbox").stdout(true).stderr(true);
        let mut process = self
            .api()
            .exec(id, vec!["kill", &format!("-{signal}"), "1"], &attach_params)
            .await
            .map_err(|err| ProviderError::Operation(format!("failed to send SIG{signal} to pod '{id}': {err}")))?;

        if let Some(mut stdout) = process.stdout() {
            while stdout.next().await.is_some() {}
        }
        process
            .join()
            .await
            .map_err(|err| ProviderError::Operation(format!("exec session for pod '{id}' failed: {err}")))?;
        Ok(())
    }
}

fn build_resource_requirements(resource: &std::collections::HashMap<String, String>) -> ResourceRequirements {
    let mut limits = BTreeMap::new();
    if let Some(cpu) = resource.get("cpu") {
        limits.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = resource.get("memory") {
        limits.insert("memory".to_string(), Quantity(memory.clone()));
    }
    ResourceRequirements { limits: Some(limits.clone()), requests: Some(limits), claims: None }
}

fn resource_requirements_totals(resources: &ResourceRequirements) -> (i64, i64) {
    let cpu = resources
        .limits
        .as_ref()
        .and_then(|l| l.get("cpu"))
        .and_then(|q| crate::model::parse_cpu(&q.0))
        .unwrap_or(0);
    let memory = resources
        .limits
        .as_ref()
        .and_then(|l| l.get("memory"))
        .and_then(|q| crate::model::parse_memory(&q.0))
        .unwrap_or(0);
    (cpu, memory)
}

fn pod_to_sandbox(pod: &Pod, spec: &SandboxSpec) -> Sandbox {
    let state = pod_state(pod);
    let now = Utc::now();
    Sandbox {
        id: spec.id.clone(),
        image: spec.image.clone(),
        entrypoint: spec.entrypoint.clone(),
        env: spec.env.clone(),
        resource: spec.resource.clone(),
        metadata: Some(spec.metadata.clone()),
        network_policy: spec.network_policy.clone(),
        volumes: spec.volumes.clone(),
        status: SandboxStatus::new(state, "Observed", "from pod status"),
        created_at: now,
        expires_at: now + chrono::Duration::seconds(spec.timeout_seconds as i64),
    }
}

fn pod_to_sandbox_from_labels(pod: &Pod) -> Sandbox {
    let labels = pod.labels();
    let sandbox_id = labels.get(SANDBOX_ID_LABEL).cloned().unwrap_or_else(|| pod.name_any());
    let metadata: std::collections::HashMap<String, String> = labels
        .iter()
        .filter(|(k, _)| !k.starts_with(RESERVED_LABEL_PREFIX))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let expires_at = labels
        .get(EXPIRES_AT_LABEL)
        .map(|s| crate::model::parse_timestamp(s))
        .unwrap_or_else(Utc::now);
    let created_at = pod
        .meta()
        .creation_timestamp
        .as_ref()
        .map(|t| t.0)
        .unwrap_or_else(Utc::now);

    let image = pod
        .spec
        .as_ref()
        .and_then(|s| s.containers.first())
        .and_then(|c| c.image.clone())
        .unwrap_or_default();

    Sandbox {
        id: sandbox_id,
        image: crate::model::ImageSpec { uri: image, username: None, password: None },
        entrypoint: pod
            .spec
            .as_ref()
            .and_then(|s| s.containers.first())
            .and_then(|c| c.args.clone())
            .unwrap_or_default(),
        env: std::collections::HashMap::new(),
        resource: std::collections::HashMap::new(),
        metadata: Some(metadata),
        network_policy: None,
        volumes: vec![],
        status: SandboxStatus::new(pod_state(pod), "Observed", "from pod status"),
        created_at,
        expires_at,
    }
}

fn pod_state(pod: &Pod) -> SandboxState {
    let Some(status) = &pod.status else { return SandboxState::Creating };
    let Some(phase) = status.phase.as_deref() else { return SandboxState::Unknown };
    match phase {
        "Pending" => SandboxState::Creating,
        "Running" => SandboxState::Running,
        "Succeeded" | "Failed" => SandboxState::Failed,
        "Unknown" => SandboxState::Unknown,
        _ => SandboxState::Unknown,
    }
}
