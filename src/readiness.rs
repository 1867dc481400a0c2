//! Readiness polling and health probing of the in-container agent.

use std::time::Duration;

/// A single boolean health check against the agent's health endpoint.
///
/// The probe's own deadline is expected to be strictly shorter than the service-wide
/// request deadline, so that a frozen (paused) sandbox's probe fails fast rather than
/// exhausting the caller's whole budget.
pub async fn is_healthy(client: &reqwest::Client, health_url: &str, probe_deadline: Duration) -> bool {
    let request = client.get(health_url).timeout(probe_deadline).send();
    match tokio::time::timeout(probe_deadline, request).await {
        Ok(Ok(response)) => response.status().is_success(),
        _ => false,
    }
}

/// Poll `health_url` until it answers healthy or `ready_timeout` elapses.
///
/// Returns `true` once healthy, `false` on timeout. Callers that pass `skip` short-circuit
/// immediately and return `true` without ever probing: the sandbox is handed back
/// as-soon-as-scheduled, and whether its endpoint is actually usable yet is best-effort
/// (see the open question on `skip_health_check`).
pub async fn wait_until_ready(
    client: &reqwest::Client,
    health_url: &str,
    poll_interval: Duration,
    ready_timeout: Duration,
    probe_deadline: Duration,
    skip: bool,
) -> bool {
    if skip {
        return true;
    }

    let deadline = tokio::time::Instant::now() + ready_timeout;
    loop {
        if is_healthy(client, health_url, probe_deadline).await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(poll_interval).await;
    }
}
