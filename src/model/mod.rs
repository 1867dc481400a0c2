//! The runtime-neutral sandbox data model: the entity itself, its status state machine,
//! quantity/timestamp parsing, and list filtering.

pub mod filter;
pub mod sandbox;
pub mod units;

pub use filter::{Pagination, SandboxFilter, filter_and_paginate, matches_filter};
pub use sandbox::{
    AGENT_EMBEDDING_PROXY_PORT, AGENT_HTTP_PORT, EMBEDDING_PROXY_PORT_LABEL, EXPIRES_AT_LABEL,
    HTTP_PORT_LABEL, ImageSpec, NetworkAction, NetworkEgressRule, NetworkPolicy,
    RESERVED_LABEL_PREFIX, SANDBOX_ID_LABEL, Sandbox, SandboxSpec, SandboxState, SandboxStatus,
    Volume, VolumeSource,
};
pub use units::{parse_cpu, parse_memory, parse_timestamp};
