//! Endpoint formatting: turning `(ingress config, sandbox_id, container port)` into an
//! addressable URL or host:port string.

use serde::{Deserialize, Serialize};

use crate::config::{GatewayRouteMode, IngressConfig};
use crate::model::{AGENT_HTTP_PORT, SandboxState};

/// An addressable representation of `(sandbox_id, container_port)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<(String, String)>,
}

impl Endpoint {
    fn plain(endpoint: impl Into<String>) -> Self {
        Self { endpoint: endpoint.into(), headers: Vec::new() }
    }
}

/// The host-port pair the local-daemon provider resolved for a sandbox, used only for
/// direct-mode formatting.
#[derive(Debug, Clone, Copy)]
pub struct LocalDaemonAddress {
    pub host: String,
    pub network_mode_host: bool,
    pub http_host_port: u16,
    pub embedding_proxy_host_port: u16,
}

/// Format an [`Endpoint`] for a local-daemon-backed sandbox in `direct` mode.
///
/// Host-mode sandboxes share the host network namespace, so the requested container port is
/// also the host port. Bridge-mode sandboxes only expose the two system ports on the host;
/// any other port is reached through the in-container embedding proxy via a `/proxy/<port>`
/// path suffix on the embedding-proxy's own host port.
pub fn format_local_daemon_endpoint(address: &LocalDaemonAddress, port: u16) -> Endpoint {
    if address.network_mode_host {
        return Endpoint::plain(format!("{}:{}", address.host, port));
    }
    if port == AGENT_HTTP_PORT {
        Endpoint::plain(format!("{}:{}", address.host, address.http_host_port))
    } else {
        Endpoint::plain(format!(
            "{}:{}/proxy/{}",
            address.host, address.embedding_proxy_host_port, port
        ))
    }
}

/// Format an [`Endpoint`] from a generic runtime-reported `host:port` pair (cluster
/// providers in `direct` mode).
pub fn format_runtime_direct_endpoint(host: &str, port: u16) -> Endpoint {
    Endpoint::plain(format!("{host}:{port}"))
}

/// Format an [`Endpoint`] according to the configured ingress mode. `internal` selects the
/// service's own reverse-proxy resolution path, which always bypasses gateway rewriting.
pub fn format_endpoint(
    ingress: &IngressConfig,
    sandbox_id: &str,
    port: u16,
    internal: bool,
    direct: Endpoint,
) -> Result<Endpoint, String> {
    if internal {
        return Ok(direct);
    }
    match ingress {
        IngressConfig::Direct => Ok(direct),
        IngressConfig::Gateway { address, route } => match route.mode {
            GatewayRouteMode::Wildcard => {
                let base = address
                    .strip_prefix("*.")
                    .ok_or_else(|| format!("gateway address '{address}' is not a wildcard address"))?;
                Ok(Endpoint::plain(format!("{sandbox_id}-{port}.{base}")))
            }
            GatewayRouteMode::Uri => Ok(Endpoint::plain(format!("{address}/{sandbox_id}/{port}"))),
            GatewayRouteMode::Header => Ok(Endpoint {
                endpoint: address.clone(),
                headers: vec![("X-OpenSandbox-Ingress".to_string(), format!("{sandbox_id}-{port}"))],
            }),
        },
    }
}

/// Whether a "best-effort" endpoint is appropriate for the current sandbox state. When
/// readiness was skipped at create time, the returned endpoint is formed from the runtime
/// address regardless of whether the agent has actually become reachable; see the open
/// question on `skip_health_check` — callers should not assume the endpoint is immediately
/// usable in that case.
pub fn is_best_effort(state: SandboxState) -> bool {
    !matches!(state, SandboxState::Running)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayRouteConfig;

    fn local_host_mode() -> LocalDaemonAddress {
        LocalDaemonAddress {
            host: "127.0.0.1".into(),
            network_mode_host: true,
            http_host_port: AGENT_HTTP_PORT,
            embedding_proxy_host_port: 44772,
        }
    }

    fn local_bridge_mode() -> LocalDaemonAddress {
        LocalDaemonAddress {
            host: "127.0.0.1".into(),
            network_mode_host: false,
            http_host_port: 32768,
            embedding_proxy_host_port: 32769,
        }
    }

    #[test]
    fn host_mode_returns_host_colon_requested_port() {
        let endpoint = format_local_daemon_endpoint(&local_host_mode(), 44772);
        assert_eq!(endpoint.endpoint, "127.0.0.1:44772");
    }

    #[test]
    fn bridge_mode_agent_port_uses_http_host_port() {
        let endpoint = format_local_daemon_endpoint(&local_bridge_mode(), AGENT_HTTP_PORT);
        assert_eq!(endpoint.endpoint, "127.0.0.1:32768");
    }

    #[test]
    fn bridge_mode_other_port_uses_proxy_suffix() {
        let endpoint = format_local_daemon_endpoint(&local_bridge_mode(), 9000);
        assert_eq!(endpoint.endpoint, "127.0.0.1:32769/proxy/9000");
    }

    #[test]
    fn wildcard_mode_strips_leading_star_dot() {
        let ingress = IngressConfig::Gateway {
            address: "*.sandboxes.example.com".into(),
            route: GatewayRouteConfig { mode: GatewayRouteMode::Wildcard },
        };
        let endpoint =
            format_endpoint(&ingress, "sb-1", 9000, false, Endpoint::plain("10.0.0.1:9000")).unwrap();
        assert_eq!(endpoint.endpoint, "sb-1-9000.sandboxes.example.com");
    }

    #[test]
    fn uri_mode_joins_address_id_and_port() {
        let ingress = IngressConfig::Gateway {
            address: "https://gw.example.com".into(),
            route: GatewayRouteConfig { mode: GatewayRouteMode::Uri },
        };
        let endpoint =
            format_endpoint(&ingress, "sb-1", 9000, false, Endpoint::plain("10.0.0.1:9000")).unwrap();
        assert_eq!(endpoint.endpoint, "https://gw.example.com/sb-1/9000");
    }

    #[test]
    fn header_mode_returns_address_with_routing_header() {
        let ingress = IngressConfig::Gateway {
            address: "https://gw.example.com".into(),
            route: GatewayRouteConfig { mode: GatewayRouteMode::Header },
        };
        let endpoint =
            format_endpoint(&ingress, "sb-1", 9000, false, Endpoint::plain("10.0.0.1:9000")).unwrap();
        assert_eq!(endpoint.endpoint, "https://gw.example.com");
        assert_eq!(endpoint.headers, vec![("X-OpenSandbox-Ingress".to_string(), "sb-1-9000".to_string())]);
    }

    #[test]
    fn internal_resolution_bypasses_gateway_rewriting() {
        let ingress = IngressConfig::Gateway {
            address: "*.sandboxes.example.com".into(),
            route: GatewayRouteConfig { mode: GatewayRouteMode::Wildcard },
        };
        let direct = Endpoint::plain("10.0.0.1:9000");
        let endpoint = format_endpoint(&ingress, "sb-1", 9000, true, direct.clone()).unwrap();
        assert_eq!(endpoint, direct);
    }
}
