//! Filtering and pagination for `list`.

use std::collections::HashMap;

use super::sandbox::{Sandbox, SandboxState};

/// Selection criteria for `list`. State matching is an OR across `states`
/// (case-insensitive); metadata matching is an AND across `metadata` (exact match).
#[derive(Debug, Clone, Default)]
pub struct SandboxFilter {
    pub states: Vec<SandboxState>,
    pub metadata: HashMap<String, String>,
}

/// 1-based pagination; `page_size` is clamped into `[1, 200]` with a default of 20.
#[derive(Debug, Clone, Copy)]
pub struct Pagination {
    pub page: u32,
    pub page_size: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self { page: 1, page_size: 20 }
    }
}

impl Pagination {
    pub fn normalized(self) -> Self {
        Self {
            page: self.page.max(1),
            page_size: self.page_size.clamp(1, 200),
        }
    }

    fn offset(self) -> usize {
        let normalized = self.normalized();
        (normalized.page as usize - 1) * normalized.page_size as usize
    }
}

/// Whether `sandbox` satisfies `filter`.
pub fn matches_filter(sandbox: &Sandbox, filter: &SandboxFilter) -> bool {
    if !filter.states.is_empty() && !filter.states.contains(&sandbox.status.state) {
        return false;
    }
    let sandbox_metadata = sandbox.metadata.as_ref();
    for (key, value) in &filter.metadata {
        let matched = sandbox_metadata.and_then(|m| m.get(key)).is_some_and(|v| v == value);
        if !matched {
            return false;
        }
    }
    true
}

/// Apply a [`SandboxFilter`] then a [`Pagination`] window over `sandboxes`.
pub fn filter_and_paginate(sandboxes: &[Sandbox], filter: &SandboxFilter, pagination: Pagination) -> Vec<Sandbox> {
    let normalized = pagination.normalized();
    sandboxes
        .iter()
        .filter(|s| matches_filter(s, filter))
        .skip(pagination.offset())
        .take(normalized.page_size as usize)
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::sandbox::{ImageSpec, SandboxStatus};
    use chrono::Utc;

    fn sandbox(id: &str, state: SandboxState, metadata: &[(&str, &str)]) -> Sandbox {
        Sandbox {
            id: id.to_string(),
            image: ImageSpec { uri: "busybox:latest".into(), username: None, password: None },
            entrypoint: vec![],
            env: Default::default(),
            resource: Default::default(),
            metadata: Some(metadata.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
            network_policy: None,
            volumes: vec![],
            status: SandboxStatus::new(state, "Ready", ""),
            created_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::minutes(5),
        }
    }

    #[test]
    fn list_filter_by_state_and_metadata() {
        let a = sandbox("a", SandboxState::Running, &[("role", "a")]);
        let b = sandbox("b", SandboxState::Running, &[("role", "b")]);
        let sandboxes = vec![a, b];

        let filter = SandboxFilter {
            states: vec![SandboxState::Running],
            metadata: [("role".to_string(), "a".to_string())].into_iter().collect(),
        };
        let result = filter_and_paginate(&sandboxes, &filter, Pagination::default());
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].id, "a");
    }

    #[test]
    fn empty_state_filter_matches_any_state() {
        let sandboxes = vec![sandbox("a", SandboxState::Paused, &[])];
        let result = filter_and_paginate(&sandboxes, &SandboxFilter::default(), Pagination::default());
        assert_eq!(result.len(), 1);
    }

    #[test]
    fn pagination_clamps_page_size() {
        let pagination = Pagination { page: 0, page_size: 1000 };
        let normalized = pagination.normalized();
        assert_eq!(normalized.page, 1);
        assert_eq!(normalized.page_size, 200);
    }
}
