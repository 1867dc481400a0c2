//! The runtime-neutral sandbox entity: its shape, its status state machine, and the
//! invariants the façade and every provider must uphold.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Label namespace reserved for system-owned keys. Callers may never set a metadata key
/// under this prefix; the reservation is enforced at the write boundary in
/// [`SandboxSpec::validate`], not by reclassifying keys on read.
pub const RESERVED_LABEL_PREFIX: &str = "opensandbox.io/";

pub const SANDBOX_ID_LABEL: &str = "opensandbox.io/id";
pub const EXPIRES_AT_LABEL: &str = "opensandbox.io/expires-at";
pub const HTTP_PORT_LABEL: &str = "opensandbox.io/http-port";
pub const EMBEDDING_PROXY_PORT_LABEL: &str = "opensandbox.io/embedding-proxy-port";

/// The agent's HTTP port inside the container.
pub const AGENT_HTTP_PORT: u16 = 8080;
/// The agent's embedding-proxy port inside the container.
pub const AGENT_EMBEDDING_PROXY_PORT: u16 = 44772;

/// A container image reference with optional pull credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSpec {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Source of a volume mount: exactly one of a host path or a PVC claim name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeSource {
    Host { path: String },
    Pvc { claim_name: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    pub mount_path: String,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_path: Option<String>,
    pub source: VolumeSource,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NetworkAction {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkEgressRule {
    pub action: NetworkAction,
    pub target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkPolicy {
    pub default_action: NetworkAction,
    #[serde(default)]
    pub egress: Vec<NetworkEgressRule>,
}

/// Closed set of lifecycle states. See [`SandboxState::can_transition_to`] for the legal
/// transition table.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "PascalCase")]
pub enum SandboxState {
    Creating,
    Running,
    Pausing,
    Paused,
    Resuming,
    Stopping,
    Terminated,
    Failed,
    Unknown,
}

impl SandboxState {
    /// Whether a transition from `self` to `target` is permitted by the state model.
    ///
    /// This governs runtime-observed transitions (informer events), not client intents:
    /// a client intent is checked separately against the *mutability* of the current state
    /// (see [`SandboxState::is_terminal`]) before it is ever translated into a runtime call.
    pub fn can_transition_to(self, target: SandboxState) -> bool {
        use SandboxState::*;
        matches!(
            (self, target),
            (Creating, Running | Failed | Terminated)
                | (Running, Pausing | Stopping | Failed | Unknown)
                | (Pausing, Paused | Failed | Running)
                | (Paused, Resuming | Stopping | Failed)
                | (Resuming, Running | Failed | Paused)
                | (Stopping, Terminated | Failed)
                | (Unknown, Running | Stopping | Failed | Terminated)
        )
    }

    /// Terminal states are read-only: every mutating operation against them fails with a
    /// conflict error and never reaches the provider.
    pub fn is_terminal(self) -> bool {
        matches!(self, SandboxState::Terminated | SandboxState::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxStatus {
    pub state: SandboxState,
    pub reason: String,
    pub message: String,
    pub last_transition_at: DateTime<Utc>,
}

impl SandboxStatus {
    pub fn new(state: SandboxState, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            state,
            reason: reason.into(),
            message: message.into(),
            last_transition_at: Utc::now(),
        }
    }

    /// Apply an observed transition, recording the new `last_transition_at`.
    ///
    /// Returns `false` (and leaves `self` unchanged) if the transition is not legal; callers
    /// that receive `false` for a runtime-observed event should log and fall back to `Unknown`
    /// rather than silently drop the observation.
    pub fn transition(&mut self, target: SandboxState, reason: impl Into<String>, message: impl Into<String>) -> bool {
        if !self.state.can_transition_to(target) {
            return false;
        }
        self.state = target;
        self.reason = reason.into();
        self.message = message.into();
        self.last_transition_at = Utc::now();
        true
    }
}

/// The authoritative logical sandbox entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sandbox {
    pub id: String,
    pub image: ImageSpec,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub resource: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_policy: Option<NetworkPolicy>,
    #[serde(default)]
    pub volumes: Vec<Volume>,
    pub status: SandboxStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Client-supplied request to create a sandbox. Distinct from [`Sandbox`] because it carries
/// no status or timestamps — those are assigned by the service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSpec {
    pub id: String,
    pub image: ImageSpec,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub resource: HashMap<String, String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub network_policy: Option<NetworkPolicy>,
    #[serde(default)]
    pub volumes: Vec<Volume>,
    /// Initial lifetime; converted to an absolute `expires_at` at creation time.
    pub timeout_seconds: u64,
    /// Skip the post-create readiness poll and return the sandbox as-soon-as-scheduled.
    /// The returned endpoint is then best-effort: see `endpoint::is_best_effort`.
    #[serde(default)]
    pub skip_health_check: bool,
}

impl SandboxSpec {
    /// Validate fields that can be checked without consulting the runtime: reserved metadata
    /// prefixes and volume host paths against the configured allow-list.
    pub fn validate(&self, allowed_host_paths: &[String]) -> Result<(), String> {
        if self.timeout_seconds == 0 {
            return Err("timeout_seconds must be greater than zero: an invalid expiration would make expires_at equal created_at".to_string());
        }
        for key in self.metadata.keys() {
            if key.starts_with(RESERVED_LABEL_PREFIX) {
                return Err(format!("metadata key '{key}' uses the reserved prefix '{RESERVED_LABEL_PREFIX}'"));
            }
        }
        for volume in &self.volumes {
            if let VolumeSource::Host { path } = &volume.source {
                let allowed = allowed_host_paths.iter().any(|prefix| path.starts_with(prefix.as_str()));
                if !allowed {
                    return Err(format!("host path '{path}' is not under an allowed host path prefix"));
                }
            }
        }
        Ok(())
    }
}
