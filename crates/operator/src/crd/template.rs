//! WorkspaceTemplate CRD - cluster-scoped policy for a fleet of workspaces.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::workspace::IdleDetection;

/// WorkspaceTemplate supplies defaults and declares the bounds a workspace
/// override may not exceed. Templates are referenced, never copied: the only
/// identifying information on a Workspace is the template name plus the
/// mirror label used for reverse lookup.
#[derive(CustomResource, Clone, Debug, Deserialize, JsonSchema, Serialize)]
#[kube(
    group = "atelier.dev",
    version = "v1alpha1",
    kind = "WorkspaceTemplate",
    status = "WorkspaceTemplateStatus",
    shortname = "wst",
    printcolumn = r#"{"name":"Default Image", "type":"string", "jsonPath":".spec.defaultImage"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceTemplateSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    /// Image used when the workspace does not override one. Required for a
    /// usable template.
    pub default_image: String,

    /// Images a workspace may select. An empty list permits only the
    /// default image (secure by default).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_images: Vec<String>,

    /// Resources applied when the workspace does not override them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_resources: Option<super::workspace::WorkspaceResources>,

    /// Per-resource-type bounds on workspace requests, independent of the
    /// defaults above.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_bounds: Option<ResourceBounds>,

    /// Primary storage defaults and bounds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_storage: Option<StoragePolicy>,

    /// Environment applied to every workspace using this template.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub environment_variables: Vec<EnvVarSpec>,

    /// Idle-shutdown policy, with a flag controlling whether workspaces may
    /// override it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_shutdown: Option<TemplateIdlePolicy>,

    /// Whether workspaces may attach secondary volumes.
    #[serde(default)]
    pub allow_secondary_storages: bool,
}

/// Min/max bounds for one resource type, as quantity strings.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuantityRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<String>,
}

/// Bounds per resource type. A missing entry means unbounded.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceBounds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<QuantityRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<QuantityRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<QuantityRange>,
}

/// Primary storage policy: default plus optional bounds.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoragePolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
}

/// Environment variable applied to the workload container.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvVarSpec {
    pub name: String,
    pub value: String,
}

/// Template-level idle-shutdown policy.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateIdlePolicy {
    #[serde(default)]
    pub enabled: bool,
    /// Inactivity threshold in seconds.
    pub timeout_seconds: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detection: Option<IdleDetection>,
    /// Whether a workspace may override this policy.
    #[serde(default)]
    pub override_allowed: bool,
}

/// Observed state of a WorkspaceTemplate. The companion loop uses the
/// observed generation to detect bounds/policy mutation.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceTemplateStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl WorkspaceTemplateSpec {
    /// The effective image allowlist: an empty `allowed_images` list is
    /// equivalent to an allowlist containing exactly the default image.
    pub fn effective_allowlist(&self) -> Vec<String> {
        if self.allowed_images.is_empty() {
            vec![self.default_image.clone()]
        } else {
            self.allowed_images.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_spec(default_image: &str) -> WorkspaceTemplateSpec {
        serde_json::from_value(serde_json::json!({ "defaultImage": default_image })).unwrap()
    }

    #[test]
    fn empty_allowlist_permits_only_the_default_image() {
        let spec = minimal_spec("img:v1");
        assert_eq!(spec.effective_allowlist(), vec!["img:v1".to_string()]);
    }

    #[test]
    fn explicit_allowlist_is_used_verbatim() {
        let mut spec = minimal_spec("img:v1");
        spec.allowed_images = vec!["img:v2".into(), "img:v3".into()];
        assert_eq!(spec.effective_allowlist(), spec.allowed_images);
    }
}
