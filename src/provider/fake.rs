//! An in-memory provider satisfying [`RuntimeProvider`], used by the service façade's own
//! test suite to exercise state-transition, filtering, and renewal semantics without a real
//! container runtime.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{ProviderError, ProviderResult, RuntimeProvider, SandboxMetrics};
use crate::endpoint::Endpoint;
use crate::model::{Pagination, Sandbox, SandboxFilter, SandboxState, SandboxStatus, filter_and_paginate};

pub struct FakeProvider {
    sandboxes: Mutex<HashMap<String, Sandbox>>,
    /// When true, `create` leaves the sandbox in `Creating` instead of advancing it to
    /// `Running`, letting tests exercise the readiness poll against a fake.
    auto_ready: bool,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self { sandboxes: Mutex::new(HashMap::new()), auto_ready: true }
    }

    pub fn without_auto_ready() -> Self {
        Self { sandboxes: Mutex::new(HashMap::new()), auto_ready: false }
    }

    /// Advance a sandbox's status directly, simulating a runtime-observed event.
    pub fn observe(&self, id: &str, state: SandboxState, reason: &str, message: &str) -> bool {
        let mut sandboxes = self.sandboxes.lock().expect("lock poisoned");
        match sandboxes.get_mut(id) {
            Some(sandbox) => sandbox.status.transition(state, reason, message),
            None => false,
        }
    }
}

impl Default for FakeProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RuntimeProvider for FakeProvider {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn create(&self, spec: &crate::model::SandboxSpec) -> ProviderResult<Sandbox> {
        let mut sandboxes = self.sandboxes.lock().expect("lock poisoned");
        if let Some(existing) = sandboxes.get(&spec.id) {
            return Ok(existing.clone());
        }
        let now = Utc::now();
        let state = if self.auto_ready { SandboxState::Running } else { SandboxState::Creating };
        let sandbox = Sandbox {
            id: spec.id.clone(),
            image: spec.image.clone(),
            entrypoint: spec.entrypoint.clone(),
            env: spec.env.clone(),
            resource: spec.resource.clone(),
            metadata: Some(spec.metadata.clone()),
            network_policy: spec.network_policy.clone(),
            volumes: spec.volumes.clone(),
            status: SandboxStatus::new(state, "Scheduled", "fake provider"),
            created_at: now,
            expires_at: now + chrono::Duration::seconds(spec.timeout_seconds as i64),
        };
        sandboxes.insert(spec.id.clone(), sandbox.clone());
        Ok(sandbox)
    }

    async fn get(&self, id: &str) -> ProviderResult<Sandbox> {
        self.sandboxes
            .lock()
            .expect("lock poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(id.to_string()))
    }

    async fn list(&self, filter: &SandboxFilter, pagination: Pagination) -> ProviderResult<Vec<Sandbox>> {
        let sandboxes = self.sandboxes.lock().expect("lock poisoned");
        let all: Vec<Sandbox> = sandboxes.values().cloned().collect();
        Ok(filter_and_paginate(&all, filter, pagination))
    }

    async fn delete(&self, id: &str) -> ProviderResult<()> {
        let mut sandboxes = self.sandboxes.lock().expect("lock poisoned");
        let sandbox = sandboxes.get_mut(id).ok_or_else(|| ProviderError::NotFound(id.to_string()))?;
        sandbox.status.transition(SandboxState::Stopping, "DeleteRequested", "");
        sandbox.status.transition(SandboxState::Terminated, "Deleted", "");
        Ok(())
    }

    async fn pause(&self, id: &str) -> ProviderResult<()> {
        let mut sandboxes = self.sandboxes.lock().expect("lock poisoned");
        let sandbox = sandboxes.get_mut(id).ok_or_else(|| ProviderError::NotFound(id.to_string()))?;
        if !sandbox.status.transition(SandboxState::Pausing, "PauseRequested", "") {
            return Err(ProviderError::Conflict(format!("cannot pause from {:?}", sandbox.status.state)));
        }
        sandbox.status.transition(SandboxState::Paused, "Paused", "");
        Ok(())
    }

    async fn resume(&self, id: &str) -> ProviderResult<()> {
        let mut sandboxes = self.sandboxes.lock().expect("lock poisoned");
        let sandbox = sandboxes.get_mut(id).ok_or_else(|| ProviderError::NotFound(id.to_string()))?;
        if !sandbox.status.transition(SandboxState::Resuming, "ResumeRequested", "") {
            return Err(ProviderError::Conflict(format!("cannot resume from {:?}", sandbox.status.state)));
        }
        sandbox.status.transition(SandboxState::Running, "Running", "");
        Ok(())
    }

    async fn renew(&self, id: &str, new_expiry: DateTime<Utc>) -> ProviderResult<DateTime<Utc>> {
        let mut sandboxes = self.sandboxes.lock().expect("lock poisoned");
        let sandbox = sandboxes.get_mut(id).ok_or_else(|| ProviderError::NotFound(id.to_string()))?;
        if new_expiry <= Utc::now() || new_expiry <= sandbox.expires_at {
            return Err(ProviderError::Conflict("new expiry must be in the future and later than the current expiry".into()));
        }
        sandbox.expires_at = new_expiry;
        Ok(sandbox.expires_at)
    }

    async fn get_endpoint(&self, id: &str, port: u16, _internal: bool) -> ProviderResult<Endpoint> {
        self.get(id).await?;
        Ok(Endpoint { endpoint: format!("127.0.0.1:{port}"), headers: Vec::new() })
    }

    async fn get_metrics(&self, id: &str) -> ProviderResult<SandboxMetrics> {
        self.get(id).await?;
        Ok(SandboxMetrics {
            cpu_count: 1,
            cpu_used_percentage: 0.0,
            memory_total_in_mib: 512,
            memory_used_in_mib: 64,
            timestamp_ms: Utc::now().timestamp_millis(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ImageSpec, SandboxSpec};
    use std::collections::HashMap;

    fn spec(id: &str) -> SandboxSpec {
        SandboxSpec {
            id: id.to_string(),
            image: ImageSpec { uri: "busybox:latest".into(), username: None, password: None },
            entrypoint: vec![],
            env: HashMap::new(),
            resource: HashMap::new(),
            metadata: HashMap::new(),
            network_policy: None,
            volumes: vec![],
            timeout_seconds: 120,
            skip_health_check: true,
        }
    }

    #[tokio::test]
    async fn create_is_idempotent_on_id_collision() {
        let provider = FakeProvider::new();
        let first = provider.create(&spec("sb-1")).await.unwrap();
        let second = provider.create(&spec("sb-1")).await.unwrap();
        assert_eq!(first.created_at, second.created_at);
    }

    #[tokio::test]
    async fn pause_then_resume_round_trips_state() {
        let provider = FakeProvider::new();
        provider.create(&spec("sb-1")).await.unwrap();
        provider.pause("sb-1").await.unwrap();
        assert_eq!(provider.get("sb-1").await.unwrap().status.state, SandboxState::Paused);
        provider.resume("sb-1").await.unwrap();
        assert_eq!(provider.get("sb-1").await.unwrap().status.state, SandboxState::Running);
    }

    #[tokio::test]
    async fn renew_rejects_non_increasing_expiry() {
        let provider = FakeProvider::new();
        let sandbox = provider.create(&spec("sb-1")).await.unwrap();
        assert!(provider.renew("sb-1", sandbox.expires_at).await.is_err());
    }

    #[tokio::test]
    async fn delete_is_terminal() {
        let provider = FakeProvider::new();
        provider.create(&spec("sb-1")).await.unwrap();
        provider.delete("sb-1").await.unwrap();
        assert!(provider.pause("sb-1").await.is_err());
    }
}
