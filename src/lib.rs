//! # opensandbox-core
//!
//! A runtime-neutral lifecycle engine for sandboxed code-execution environments: create,
//! observe, pause/resume, renew, and tear down isolated workloads across a local Docker-
//! compatible daemon, bare Kubernetes pods, or an operator-owned custom resource — behind
//! one capability interface selected once at process start.
//!
//! ## Architecture
//!
//! ### Data model ([`model`])
//!
//! The runtime-neutral sandbox entity, its lifecycle state machine, and the list
//! filtering/pagination applied over it:
//!
//! - [`model::Sandbox`] / [`model::SandboxSpec`] — the entity and the client-supplied intent
//!   that creates one
//! - [`model::SandboxState`] — the closed set of lifecycle states and their legal transitions
//! - [`model::SandboxFilter`] / [`model::Pagination`] — `list` selection and windowing
//!
//! ### Providers ([`provider`])
//!
//! Exactly one [`provider::RuntimeProvider`] is constructed at startup and held behind
//! `Arc<dyn RuntimeProvider>`:
//!
//! - [`provider::local_daemon::LocalDaemonProvider`] — containers on a local daemon via
//!   `bollard`
//! - [`provider::cluster_pod::ClusterPodProvider`] — bare pods on a Kubernetes-compatible
//!   cluster, tracked through a [`informer::WorkloadInformer`]
//! - [`provider::cluster_cr::ClusterCrProvider`] — an operator-owned custom resource,
//!   rendered from a [`template::Template`]
//!
//! ### Service façade ([`service`])
//!
//! [`service::SandboxService`] is the single runtime-neutral entry point: it validates what
//! it can without the runtime, serializes mutating calls per sandbox id, and otherwise
//! delegates straight through to the live provider.
//!
//! ### Ambient concerns
//!
//! - [`config`] — TOML configuration schema and cross-field validation
//! - [`error`] — the stable error taxonomy surfaced to clients
//! - [`endpoint`] — turning `(ingress config, sandbox_id, port)` into an addressable URL
//! - [`proxy`] — the reverse-proxy header/body forwarding rules the outer HTTP layer applies
//! - [`readiness`] — health polling of the in-container agent
//! - [`agent`] — embedding and packaging of the in-container bootstrap script
//!
//! The web framework, auth middleware, and metrics exporter that would sit in front of
//! [`service::SandboxService`] in a full deployment are outside this crate's scope; it
//! exposes the calls they would dispatch to, not the dispatch itself.

pub mod agent;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod informer;
pub mod model;
pub mod provider;
pub mod proxy;
pub mod readiness;
pub mod service;
pub mod template;

pub use config::{AppConfig, load_config};
pub use error::{ServiceError, ServiceResult};
pub use model::{Sandbox, SandboxSpec, SandboxState};
pub use provider::RuntimeProvider;
pub use service::SandboxService;
