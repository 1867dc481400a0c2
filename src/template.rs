//! Generic YAML template loading and deep-merge, used by the cluster-CR provider.
//!
//! The source this core replaces carried two near-duplicate template managers, one per CR
//! kind; this is the one generic deep-merge operator that replaces both, parameterized only
//! by a `kind` label used in error messages.

use std::path::Path;

use serde_yaml::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("failed to read template file {path}: {source}")]
    Read { path: String, #[source] source: std::io::Error },

    #[error("failed to parse template file {path} as YAML: {source}")]
    Parse { path: String, #[source] source: serde_yaml::Error },

    #[error("template root for kind '{kind}' must be a mapping")]
    NotAMapping { kind: String },
}

/// A parsed workload template: the base shape of a custom-resource manifest.
#[derive(Debug, Clone)]
pub struct Template {
    kind: String,
    root: Value,
}

impl Template {
    /// Load a template from `path`, validating that its root is a YAML mapping.
    ///
    /// Failing to find or parse the file is a startup-time failure for the cluster-CR
    /// provider: there is no fallback to an empty template.
    pub fn load(path: &Path, kind: impl Into<String>) -> Result<Self, TemplateError> {
        let kind = kind.into();
        let content = std::fs::read_to_string(path)
            .map_err(|source| TemplateError::Read { path: path.display().to_string(), source })?;
        let root: Value = serde_yaml::from_str(&content)
            .map_err(|source| TemplateError::Parse { path: path.display().to_string(), source })?;
        if !matches!(root, Value::Mapping(_)) {
            return Err(TemplateError::NotAMapping { kind });
        }
        Ok(Self { kind, root })
    }

    /// Deep-merge `overlay` on top of this template and return the resulting manifest. The
    /// cached template itself is never mutated: both the template and the overlay are
    /// deep-copied before merging.
    pub fn render(&self, overlay: &Value) -> Value {
        deep_merge(self.root.clone(), overlay.clone())
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }
}

/// Deep-merge `overlay` on top of `base`: maps merge key-by-key, lists are replaced
/// wholesale, and a `null` in the overlay means "keep the base value."
fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Mapping(mut base_map), Value::Mapping(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                match base_map.get(&key).cloned() {
                    Some(base_value) => {
                        base_map.insert(key, deep_merge(base_value, overlay_value));
                    }
                    None => {
                        base_map.insert(key, overlay_value);
                    }
                }
            }
            Value::Mapping(base_map)
        }
        (base, Value::Null) => base,
        (_, overlay) => overlay,
    }
}
