//! Workspace CRD - a user-facing compute session driven by the reconciler.

use std::collections::BTreeMap;
use std::fmt;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Workspace is the primary resource of the platform. The spec carries the
/// user's declared intent (desired status plus configuration overrides); the
/// status sub-document is written exclusively by the reconciler.
#[derive(CustomResource, Clone, Debug, Deserialize, JsonSchema, Serialize)]
#[kube(
    group = "atelier.dev",
    version = "v1alpha1",
    kind = "Workspace",
    namespaced,
    status = "WorkspaceStatus",
    shortname = "ws",
    printcolumn = r#"{"name":"Desired", "type":"string", "jsonPath":".spec.desiredStatus"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Template", "type":"string", "jsonPath":".spec.templateRef.name"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceSpec {
    /// Target lifecycle state. The idle-shutdown loop may rewrite this to
    /// Stopped on the user's behalf.
    #[serde(default)]
    pub desired_status: DesiredStatus,

    /// Template supplying defaults and bounds for this workspace.
    /// When absent, `image` must be set and the spec is used as-is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_ref: Option<TemplateRef>,

    /// Container image override. Checked against the template allowlist.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Compute resource overrides, checked against template bounds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<WorkspaceResources>,

    /// Primary storage override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<WorkspaceStorage>,

    /// Idle-shutdown override. Honored only when the template allows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_shutdown: Option<IdleShutdownSpec>,

    /// Node placement constraints for the workload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,

    /// Container entrypoint overrides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerConfig>,

    /// Additional volumes, gated by the template's secondary-storage policy.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<SecondaryVolume>,

    /// Strategy describing the access resources rendered for this workspace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_strategy: Option<AccessStrategyRef>,
}

/// User-declared target lifecycle state.
///
/// Unrecognized values deserialize to `Unknown` so a malformed intent lands
/// in the Error arm of the state machine instead of failing decode.
#[derive(Clone, Copy, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
pub enum DesiredStatus {
    #[default]
    Running,
    Stopped,
    #[serde(other, skip_serializing)]
    #[schemars(skip)]
    Unknown,
}

impl fmt::Display for DesiredStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DesiredStatus::Running => write!(f, "Running"),
            DesiredStatus::Stopped => write!(f, "Stopped"),
            DesiredStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Reference to a cluster-scoped WorkspaceTemplate.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateRef {
    pub name: String,
}

/// Reference to a WorkspaceAccessStrategy. The namespace defaults to the
/// workspace's own namespace.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessStrategyRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Compute requests and limits expressed as Kubernetes quantity strings.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceResources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<ResourceList>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceList>,
}

/// Quantities per resource type (e.g. "500m", "2Gi", "1").
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceList {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<String>,
}

/// Primary storage override.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceStorage {
    /// Requested size (e.g. "10Gi"). A missing or non-numeric size means
    /// "no override requested".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
}

/// Idle-shutdown override carried on the workspace.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdleShutdownSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    /// Inactivity threshold in seconds before the workspace is stopped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detection: Option<IdleDetection>,
}

/// Detection strategy used to decide whether a running workspace is idle.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum IdleDetection {
    /// Probe an HTTP endpoint inside the workload that reports the last
    /// activity timestamp.
    #[serde(rename_all = "camelCase")]
    HttpActivity { port: u16, path: String },
}

/// Container entrypoint overrides.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<super::EnvVarSpec>,
}

/// Additional volume mounted into the workload.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecondaryVolume {
    pub name: String,
    pub size: String,
    pub mount_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
}

/// Observed state of a Workspace. Written only by the reconciler.
///
/// Every field serializes explicitly (no skips) so a merge patch can clear
/// child names and shrink the access-resource list.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceStatus {
    #[serde(default)]
    pub phase: WorkspacePhase,

    #[serde(default)]
    pub conditions: Vec<WorkspaceCondition>,

    /// Name of the compute workload owned by this workspace.
    #[serde(default)]
    pub deployment_name: Option<String>,

    /// Name of the network endpoint owned by this workspace.
    #[serde(default)]
    pub service_name: Option<String>,

    /// Name of the primary volume claim, when storage is configured.
    #[serde(default)]
    pub volume_claim_name: Option<String>,

    /// Dynamically-typed child resources tracked by this workspace. This
    /// list is the only record of those objects; an entry is removed solely
    /// on confirmed deletion.
    #[serde(default)]
    pub access_resources: Vec<AccessResourceStatus>,
}

/// Human-facing lifecycle phase, derived from desired status and readiness.
#[derive(Clone, Copy, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
pub enum WorkspacePhase {
    #[default]
    Pending,
    Starting,
    Running,
    Stopping,
    Stopped,
    Terminating,
    Error,
    Invalid,
}

impl fmt::Display for WorkspacePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkspacePhase::Pending => "Pending",
            WorkspacePhase::Starting => "Starting",
            WorkspacePhase::Running => "Running",
            WorkspacePhase::Stopping => "Stopping",
            WorkspacePhase::Stopped => "Stopped",
            WorkspacePhase::Terminating => "Terminating",
            WorkspacePhase::Error => "Error",
            WorkspacePhase::Invalid => "Invalid",
        };
        write!(f, "{}", s)
    }
}

/// Status of a single typed condition.
#[derive(Clone, Copy, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

/// A typed status condition. Merged idempotently: a write is skipped unless
/// status, reason, or message actually changed.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub last_transition_time: String,
}

/// Condition type names used by the status manager.
pub mod condition_types {
    pub const AVAILABLE: &str = "Available";
    pub const PROGRESSING: &str = "Progressing";
    pub const DEGRADED: &str = "Degraded";
    pub const TEMPLATE_COMPLIANT: &str = "TemplateCompliant";
}

/// Record of a dynamically-typed child resource owned by a workspace.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessResourceStatus {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: String,
}

impl Workspace {
    /// Template name referenced by the spec, if any.
    pub fn template_name(&self) -> Option<&str> {
        self.spec.template_ref.as_ref().map(|r| r.name.as_str())
    }

    /// Whether the stop currently converging was triggered by preemption.
    pub fn stopped_by_preemption(&self) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(super::STOP_REASON_ANNOTATION))
            .map(|v| v == super::STOP_REASON_PREEMPTION)
            .unwrap_or(false)
    }

    /// Whether the compliance-recheck label is present.
    pub fn needs_compliance_recheck(&self) -> bool {
        self.metadata
            .labels
            .as_ref()
            .map(|l| l.contains_key(super::RECHECK_LABEL))
            .unwrap_or(false)
    }
}
