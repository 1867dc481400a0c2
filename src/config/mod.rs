//! Configuration loading and schema definitions.

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result, bail};

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    load_config_str(&content).with_context(|| format!("failed to load config file: {}", path.display()))
}

/// Load and validate configuration from a string.
pub fn load_config_str(content: &str) -> Result<AppConfig> {
    let config: AppConfig = toml::from_str(content).context("failed to parse config")?;
    if let Err(reason) = config.validate() {
        bail!("invalid configuration: {reason}");
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_cross_field_combination() {
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
        assert!(load_config_str(toml).is_err());
    }

    #[test]
    fn loads_minimal_valid_config() {
        let toml = r#"
            [runtime]
            type = "local-daemon"
            agent_image = "opensandbox/agent:latest"
        "#;
        let config = load_config_str(toml).expect("valid config");
        assert_eq!(config.server.port, 8080);
    }
}
