//! Cluster-CR runtime provider: sandboxes are instances of an operator-owned custom resource,
//! rendered from a [`Template`] and reconciled by a controller this core does not own. This
//! provider only issues the CR's desired state and reads back whatever the controller reports
//! in `status`; it never runs a reconcile loop itself.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, GroupVersionKind};
use kube::{Client, ResourceExt};
use serde_yaml::Value;

use super::{ProviderError, ProviderResult, RuntimeProvider, SandboxMetrics};
use crate::endpoint::{Endpoint, format_runtime_direct_endpoint};
use crate::informer::WorkloadInformer;
use crate::model::{
    EXPIRES_AT_LABEL, Pagination, RESERVED_LABEL_PREFIX, SANDBOX_ID_LABEL, Sandbox, SandboxFilter,
    SandboxSpec, SandboxState, SandboxStatus, filter_and_paginate,
};
use crate::template::Template;

pub struct ClusterCrProvider {
    client: Client,
    namespace: String,
    resource: ApiResource,
    template: Template,
    informer: WorkloadInformer<DynamicObject>,
}

impl ClusterCrProvider {
    pub async fn connect(
        namespace: String,
        group: String,
        version: String,
        kind: String,
        template: Template,
        watch_timeout: Duration,
    ) -> ProviderResult<Self> {
        let client = Client::try_default()
            .await
            .map_err(|err| ProviderError::Initialization(format!("failed to build Kubernetes client: {err}")))?;

        let gvk = GroupVersionKind::gvk(&group, &version, &kind);
        let resource = ApiResource::from_gvk(&gvk);
        let api: Api<DynamicObject> = Api::namespaced_with(client.clone(), &namespace, &resource);
        let informer = WorkloadInformer::spawn(api, Some(watch_timeout), Duration::from_secs(30));

        Ok(Self { client, namespace, resource, template, informer })
    }

    fn api(&self) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), &self.namespace, &self.resource)
    }

    /// Build the overlay rendered on top of the cached template for a new sandbox.
    fn overlay_for(&self, spec: &SandboxSpec, expires_at: DateTime<Utc>) -> Value {
        let mut labels = serde_yaml::Mapping::new();
        for (key, value) in &spec.metadata {
            labels.insert(Value::String(key.clone()), Value::String(value.clone()));
        }
        labels.insert(Value::String(SANDBOX_ID_LABEL.to_string()), Value::String(spec.id.clone()));
        labels.insert(Value::String(EXPIRES_AT_LABEL.to_string()), Value::String(expires_at.to_rfc3339()));

        let mut metadata = serde_yaml::Mapping::new();
        metadata.insert(Value::String("name".to_string()), Value::String(spec.id.clone()));
        metadata.insert(Value::String("labels".to_string()), Value::Mapping(labels));

        let mut spec_overlay = serde_yaml::Mapping::new();
        spec_overlay.insert(Value::String("image".to_string()), Value::String(spec.image.uri.clone()));
        if !spec.entrypoint.is_empty() {
            spec_overlay.insert(
                Value::String("entrypoint".to_string()),
                Value::Sequence(spec.entrypoint.iter().cloned().map(Value::String).collect()),
            );
        }
        if !spec.env.is_empty() {
            let mut env = serde_yaml::Mapping::new();
            for (k, v) in &spec.env {
                env.insert(Value::String(k.clone()), Value::String(v.clone()));
            }
            spec_overlay.insert(Value::String("env".to_string()), Value::Mapping(env));
        }
        if !spec.resource.is_empty() {
            let mut resources = serde_yaml::Mapping::new();
            for (k, v) in &spec.resource {
                resources.insert(Value::String(k.clone()), Value::String(v.clone()));
            }
            spec_overlay.insert(Value::String("resources".to_string()), Value::Mapping(resources));
        }
        spec_overlay.insert(Value::String("suspend".to_string()), Value::Bool(false));

        let mut root = serde_yaml::Mapping::new();
        root.insert(Value::String("metadata".to_string()), Value::Mapping(metadata));
        root.insert(Value::String("spec".to_string()), Value::Mapping(spec_overlay));
        Value::Mapping(root)
    }
}

#[async_trait]
impl RuntimeProvider for ClusterCrProvider {
    fn name(&self) -> &'static str {
        "cluster-cr"
    }

    async fn create(&self, spec: &SandboxSpec) -> ProviderResult<Sandbox> {
        if let Some(existing) = self.informer.get(&spec.id) {
            return Ok(dynamic_object_to_sandbox(&existing, spec));
        }

        let expires_at = Utc::now() + chrono::Duration::seconds(spec.timeout_seconds as i64);
        let rendered = self.template.render(&self.overlay_for(spec, expires_at));

        let manifest: serde_json::Value = serde_yaml::from_value(rendered)
            .map_err(|err| ProviderError::Operation(format!("rendered template for '{}' is not valid JSON: {err}", spec.id)))?;
        let object: DynamicObject = serde_json::from_value(manifest)
            .map_err(|err| ProviderError::Operation(format!("rendered template for '{}' did not deserialize into a custom resource: {err}", spec.id)))?;

        let created = self
            .api()
            .create(&PostParams::default(), &object)
            .await
            .map_err(|err| ProviderError::Operation(format!("failed to create custom resource '{}': {err}", spec.id)))?;

        Ok(dynamic_object_to_sandbox(&created, spec))
    }

    async fn get(&self, id: &str) -> ProviderResult<Sandbox> {
        let object = self.informer.get(id).ok_or_else(|| ProviderError::NotFound(id.to_string()))?;
        Ok(dynamic_object_to_sandbox_from_labels(&object))
    }

    async fn list(&self, filter: &SandboxFilter, pagination: Pagination) -> ProviderResult<Vec<Sandbox>> {
        let sandboxes: Vec<Sandbox> =
            self.informer.list().iter().map(dynamic_object_to_sandbox_from_labels).collect();
        Ok(filter_and_paginate(&sandboxes, filter, pagination))
    }

    async fn delete(&self, id: &str) -> ProviderResult<()> {
        self.api()
            .delete(id, &DeleteParams::default())
            .await
            .map_err(|err| ProviderError::Operation(format!("failed to delete custom resource '{id}': {err}")))?;
        Ok(())
    }

    async fn pause(&self, id: &str) -> ProviderResult<()> {
        self.patch_spec_suspend(id, true).await
    }

    async fn resume(&self, id: &str) -> ProviderResult<()> {
        self.patch_spec_suspend(id, false).await
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
            .patch(id, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|err| ProviderError::Operation(format!("failed to patch expiration label on '{id}': {err}")))?;
        Ok(new_expiry)
    }

    async fn get_endpoint(&self, id: &str, port: u16, _internal: bool) -> ProviderResult<Endpoint> {
        let object = self.informer.get(id).ok_or_else(|| ProviderError::NotFound(id.to_string()))?;
        let address = object
            .data
            .get("status")
            .and_then(|status| status.get("address"))
            .and_then(|address| address.as_str())
            .ok_or_else(|| ProviderError::Operation(format!("custom resource '{id}' has no address reported yet")))?;
        Ok(format_runtime_direct_endpoint(address, port))
    }

    async fn get_metrics(&self, id: &str) -> ProviderResult<SandboxMetrics> {
        let object = self.informer.get(id).ok_or_else(|| ProviderError::NotFound(id.to_string()))?;
        let cpu_count = object
            .data
            .get("spec")
            .and_then(|s| s.get("resources"))
            .and_then(|r| r.get("cpu"))
            .and_then(|c| c.as_str())
            .and_then(crate::model::parse_cpu)
            .map(|nanos| ((nanos as f64 / 1_000_000_000.0).ceil() as u32).max(1))
            .unwrap_or(1);
        let memory_total_in_mib = object
            .data
            .get("spec")
            .and_then(|s| s.get("resources"))
            .and_then(|r| r.get("memory"))
            .and_then(|m| m.as_str())
            .and_then(crate::model::parse_memory)
            .map(|bytes| bytes / (1024 * 1024))
            .unwrap_or(0);

        Ok(SandboxMetrics {
            cpu_count,
            // Like the cluster-pod provider, actual utilization needs the cluster's metrics
            // API; this provider reports requested capacity only.
            cpu_used_percentage: 0.0,
            memory_total_in_mib,
            memory_used_in_mib: 0,
            timestamp_ms: Utc::now().timestamp_millis(),
        })
    }
}

impl ClusterCrProvider {
    async fn patch_spec_suspend(&self, id: &str, suspend: bool) -> ProviderResult<()> {
        let patch = serde_json::json!({ "spec": { "suspend": suspend } });
        self.api()
            .patch(id, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|err| ProviderError::Operation(format!("failed to patch suspend={suspend} on '{id}': {err}")))?;
        Ok(())
    }
}

fn dynamic_object_to_sandbox(object: &DynamicObject, spec: &SandboxSpec) -> Sandbox {
    let state = dynamic_object_state(object);
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
        status: SandboxStatus::new(state, "Observed", "from custom resource status"),
        created_at: now,
        expires_at: now + chrono::Duration::seconds(spec.timeout_seconds as i64),
    }
}

fn dynamic_object_to_sandbox_from_labels(object: &DynamicObject) -> Sandbox {
    let labels = object.labels();
    let sandbox_id = labels.get(SANDBOX_ID_LABEL).cloned().unwrap_or_else(|| object.name_any());
    let metadata: std::collections::HashMap<String, String> = labels
        .iter()
        .filter(|(k, _)| !k.starts_with(RESERVED_LABEL_PREFIX))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let expires_at = labels
        .get(EXPIRES_AT_LABEL)
        .map(|s| crate::model::parse_timestamp(s))
        .unwrap_or_else(Utc::now);
    let created_at = object
        .meta()
        .creation_timestamp
        .as_ref()
        .map(|t| t.0)
        .unwrap_or_else(Utc::now);
    let image = object
        .data
        .get("spec")
        .and_then(|s| s.get("image"))
        .and_then(|i| i.as_str())
        .unwrap_or_default()
        .to_string();

    Sandbox {
        id: sandbox_id,
        image: crate::model::ImageSpec { uri: image, username: None, password: None },
        entrypoint: vec![],
        env: std::collections::HashMap::new(),
        resource: std::collections::HashMap::new(),
        metadata: Some(metadata),
        network_policy: None,
        volumes: vec![],
        status: SandboxStatus::new(dynamic_object_state(object), "Observed", "from custom resource status"),
        created_at,
        expires_at,
    }
}

fn dynamic_object_state(object: &DynamicObject) -> SandboxState {
    let Some(phase) = object.data.get("status").and_then(|s| s.get("phase")).and_then(|p| p.as_str()) else {
        return SandboxState::Creating;
    };
    match phase {
        "Pending" => SandboxState::Creating,
        "Running" => SandboxState::Running,
        "Paused" => SandboxState::Paused,
        "Succeeded" | "Failed" => SandboxState::Failed,
        "Terminated" => SandboxState::Terminated,
        _ => SandboxState::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::{ObjectMeta, TypeMeta};

    fn object_with_phase(phase: &str) -> DynamicObject {
        DynamicObject {
            types: Some(TypeMeta { api_version: "opensandbox.io/v1".into(), kind: "AgentSandbox".into() }),
            metadata: ObjectMeta::default(),
            data: serde_json::json!({ "status": { "phase": phase } }),
        }
    }

    #[test]
    fn phase_running_maps_to_running_state() {
        assert_eq!(dynamic_object_state(&object_with_phase("Running")), SandboxState::Running);
    }

    #[test]
    fn missing_status_maps_to_creating() {
        let object = DynamicObject {
            types: None,
            metadata: ObjectMeta::default(),
            data: serde_json::json!({}),
        };
        assert_eq!(dynamic_object_state(&object), SandboxState::Creating);
    }

    #[test]
    fn phase_paused_maps_to_paused_state() {
        assert_eq!(dynamic_object_state(&object_with_phase("Paused")), SandboxState::Paused);
    }
}
