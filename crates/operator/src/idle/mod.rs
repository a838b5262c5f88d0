//! Idle detection for running workspaces.
//!
//! The checker locates a ready pod for the workspace and delegates to the
//! detection strategy from the resolved idle-shutdown configuration. Failures
//! are classified: a missing workload or a malformed strategy permanently
//! disables the sub-loop, while probe failures keep the caller polling.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use tracing::debug;

use crate::crd::{IdleDetection, Workspace, WORKSPACE_NAME_LABEL};
use crate::error::{Error, Result};

/// Resolved idle-shutdown configuration for one workspace.
#[derive(Clone, Debug, PartialEq)]
pub struct IdleShutdownConfig {
    pub enabled: bool,
    pub timeout_seconds: i64,
    pub detection: IdleDetection,
}

impl IdleShutdownConfig {
    pub const DEFAULT_TIMEOUT_SECONDS: i64 = 1800;

    pub fn default_detection() -> IdleDetection {
        IdleDetection::HttpActivity {
            port: 8888,
            path: "/api/status".to_string(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.max(0) as u64)
    }
}

/// Verdict of one idle check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdleCheck {
    pub idle: bool,
}

/// Failure of an idle check, split by whether the caller should keep
/// polling.
#[derive(Debug, thiserror::Error)]
pub enum IdleError {
    /// No ready workload process was found; idle checking is pointless
    /// until the workspace transitions through Running again.
    #[error("no ready pod found for workspace {workspace}")]
    WorkloadNotFound { workspace: String },

    /// The detection strategy cannot be constructed from its descriptor.
    #[error("idle detection misconfigured: {0}")]
    Misconfigured(String),

    /// The detector ran but failed transiently (timeout, connection reset,
    /// malformed response while the workload warms up).
    #[error("idle probe failed: {0}")]
    Probe(String),

    /// Listing pods failed at the API server.
    #[error(transparent)]
    Api(#[from] Error),
}

impl IdleError {
    /// Whether the caller should keep polling. `false` permanently disables
    /// idle checking for the object until its next Running transition.
    pub fn should_retry(&self) -> bool {
        match self {
            IdleError::WorkloadNotFound { .. } | IdleError::Misconfigured(_) => false,
            IdleError::Probe(_) | IdleError::Api(_) => true,
        }
    }
}

/// Pod lookup and idle probing, mockable for state-machine tests.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IdleOps: Send + Sync {
    /// Number of ready pods currently backing the workspace.
    async fn ready_pod_count(&self, workspace: &Workspace) -> Result<usize>;

    /// Run the configured detection strategy against the workspace.
    async fn check_idle(
        &self,
        workspace: &Workspace,
        config: &IdleShutdownConfig,
    ) -> std::result::Result<IdleCheck, IdleError>;
}

/// Production checker probing the workload over HTTP.
pub struct IdleChecker {
    client: Client,
    http: reqwest::Client,
}

impl IdleChecker {
    pub fn new(client: Client, probe_timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(probe_timeout)
            .build()
            .unwrap_or_default();
        Self { client, http }
    }

    async fn pods_for(&self, workspace: &Workspace) -> Result<Vec<Pod>> {
        let namespace = workspace.namespace().ok_or(Error::MissingNamespace)?;
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
        let params = ListParams::default()
            .labels(&format!("{}={}", WORKSPACE_NAME_LABEL, workspace.name_any()));
        Ok(api.list(&params).await?.items)
    }
}

/// A pod counts as a usable process once it reports Running and every
/// container is ready.
fn pod_is_ready(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    if status.phase.as_deref() != Some("Running") {
        return false;
    }
    status
        .container_statuses
        .as_ref()
        .map(|cs| !cs.is_empty() && cs.iter().all(|c| c.ready))
        .unwrap_or(false)
}

/// Response shape of the in-workload activity endpoint.
#[derive(Debug, Deserialize)]
struct ActivityReport {
    last_activity: String,
}

/// Pure idle decision: has the reported activity timestamp aged past the
/// threshold?
fn idle_since(last_activity: DateTime<Utc>, now: DateTime<Utc>, timeout: Duration) -> bool {
    now.signed_duration_since(last_activity).num_seconds() >= timeout.as_secs() as i64
}

#[async_trait]
impl IdleOps for IdleChecker {
    async fn ready_pod_count(&self, workspace: &Workspace) -> Result<usize> {
        Ok(self
            .pods_for(workspace)
            .await?
            .iter()
            .filter(|p| pod_is_ready(p))
            .count())
    }

    async fn check_idle(
        &self,
        workspace: &Workspace,
        config: &IdleShutdownConfig,
    ) -> std::result::Result<IdleCheck, IdleError> {
        let pods = self.pods_for(workspace).await?;
        let pod = pods
            .iter()
            .find(|p| pod_is_ready(p))
            .ok_or_else(|| IdleError::WorkloadNotFound {
                workspace: workspace.name_any(),
            })?;

        let IdleDetection::HttpActivity { port, path } = &config.detection;
        if *port == 0 || !path.starts_with('/') {
            return Err(IdleError::Misconfigured(format!(
                "http activity probe needs a port and an absolute path, got port {} path {:?}",
                port, path
            )));
        }

        let pod_ip = pod
            .status
            .as_ref()
            .and_then(|s| s.pod_ip.as_deref())
            .ok_or_else(|| IdleError::Probe("ready pod has no ip yet".to_string()))?;

        let url = format!("http://{}:{}{}", pod_ip, port, path);
        debug!(workspace = %workspace.name_any(), %url, "probing workload activity");

        let report: ActivityReport = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| IdleError::Probe(e.to_string()))?
            .error_for_status()
            .map_err(|e| IdleError::Probe(e.to_string()))?
            .json()
            .await
            .map_err(|e| IdleError::Probe(e.to_string()))?;

        let last_activity = DateTime::parse_from_rfc3339(&report.last_activity)
            .map_err(|e| IdleError::Probe(format!("bad last_activity timestamp: {}", e)))?
            .with_timezone(&Utc);

        Ok(IdleCheck {
            idle: idle_since(last_activity, Utc::now(), config.timeout()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn locate_and_config_failures_disable_the_loop() {
        assert!(!IdleError::WorkloadNotFound {
            workspace: "ws".into()
        }
        .should_retry());
        assert!(!IdleError::Misconfigured("port 0".into()).should_retry());
    }

    #[test]
    fn probe_failures_keep_polling() {
        assert!(IdleError::Probe("timed out".into()).should_retry());
        assert!(IdleError::Api(Error::Infrastructure {
            message: "conflict".into()
        })
        .should_retry());
    }

    #[test]
    fn idle_decision_uses_the_configured_threshold() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let active = Utc.with_ymd_and_hms(2024, 5, 1, 11, 45, 0).unwrap();
        let timeout = Duration::from_secs(30 * 60);
        assert!(!idle_since(active, now, timeout));

        let stale = Utc.with_ymd_and_hms(2024, 5, 1, 11, 15, 0).unwrap();
        assert!(idle_since(stale, now, timeout));
    }

    #[test]
    fn pods_without_ready_containers_are_not_usable() {
        let pod: Pod = serde_json::from_value(serde_json::json!({
            "status": {
                "phase": "Running",
                "containerStatuses": [{"name": "main", "ready": false, "image": "i", "imageID": "", "restartCount": 0}]
            }
        }))
        .unwrap();
        assert!(!pod_is_ready(&pod));

        let ready: Pod = serde_json::from_value(serde_json::json!({
            "status": {
                "phase": "Running",
                "containerStatuses": [{"name": "main", "ready": true, "image": "i", "imageID": "", "restartCount": 0}]
            }
        }))
        .unwrap();
        assert!(pod_is_ready(&ready));
    }
}
