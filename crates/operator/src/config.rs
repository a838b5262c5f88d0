//! Operator settings: requeue cadence, apply field manager, endpoint shape.

use std::time::Duration;

/// Type of the network endpoint created for a workspace.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointType {
    ClusterIp,
    LoadBalancer,
}

impl EndpointType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointType::ClusterIp => "ClusterIP",
            EndpointType::LoadBalancer => "LoadBalancer",
        }
    }
}

/// Tunables for the reconcilers. `from_env` overlays `ATELIER_*` variables
/// on the defaults.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Field manager name used for server-side apply.
    pub field_manager: String,
    /// Delay while polling partial bring-up or teardown.
    pub requeue_interval: Duration,
    /// Delay after a transient failure.
    pub error_requeue: Duration,
    /// Delay for low-urgency rechecks (unknown desired status, failed
    /// compliance).
    pub long_requeue: Duration,
    /// Cadence of the idle-shutdown sub-loop.
    pub idle_check_interval: Duration,
    /// Delay before the companion loop re-examines a blocked template
    /// deletion.
    pub template_requeue: Duration,
    /// Service type for workspace endpoints.
    pub endpoint_type: EndpointType,
    /// Timeout of a single idle-detection HTTP probe.
    pub probe_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            field_manager: "atelier-operator".to_string(),
            requeue_interval: Duration::from_secs(10),
            error_requeue: Duration::from_secs(30),
            long_requeue: Duration::from_secs(300),
            idle_check_interval: Duration::from_secs(60),
            template_requeue: Duration::from_secs(30),
            endpoint_type: EndpointType::ClusterIp,
            probe_timeout: Duration::from_secs(5),
        }
    }
}

impl Settings {
    /// Load settings from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let mut settings = Self::default();

        if let Some(secs) = env_seconds("ATELIER_REQUEUE_SECONDS") {
            settings.requeue_interval = secs;
        }
        if let Some(secs) = env_seconds("ATELIER_ERROR_REQUEUE_SECONDS") {
            settings.error_requeue = secs;
        }
        if let Some(secs) = env_seconds("ATELIER_LONG_REQUEUE_SECONDS") {
            settings.long_requeue = secs;
        }
        if let Some(secs) = env_seconds("ATELIER_IDLE_CHECK_SECONDS") {
            settings.idle_check_interval = secs;
        }
        if let Some(secs) = env_seconds("ATELIER_PROBE_TIMEOUT_SECONDS") {
            settings.probe_timeout = secs;
        }
        if let Ok(endpoint) = std::env::var("ATELIER_ENDPOINT_TYPE") {
            if endpoint.eq_ignore_ascii_case("loadbalancer") {
                settings.endpoint_type = EndpointType::LoadBalancer;
            }
        }

        settings
    }
}

fn env_seconds(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let settings = Settings::default();
        assert!(settings.requeue_interval < settings.error_requeue);
        assert!(settings.error_requeue < settings.long_requeue);
        assert_eq!(settings.endpoint_type, EndpointType::ClusterIp);
    }
}
