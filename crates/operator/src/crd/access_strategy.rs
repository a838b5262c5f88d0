//! WorkspaceAccessStrategy CRD - templates for dynamically-typed access
//! resources (e.g. an ingress route) rendered per workspace.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A set of access-resource templates. Each entry is rendered once per
/// workspace, with a deterministic name derived from the prefix and the
/// workspace name.
#[derive(CustomResource, Clone, Debug, Deserialize, JsonSchema, Serialize)]
#[kube(
    group = "atelier.dev",
    version = "v1alpha1",
    kind = "WorkspaceAccessStrategy",
    namespaced,
    shortname = "wsas"
)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceAccessStrategySpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub templates: Vec<AccessResourceTemplate>,
}

/// One dynamically-typed resource template. The body is a YAML document
/// interpolated with `{{workspaceName}}`, `{{workspaceNamespace}}`,
/// `{{serviceName}}` and `{{servicePort}}` before being submitted.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessResourceTemplate {
    /// Rendered resources are named `<namePrefix>-<workspaceName>`.
    pub name_prefix: String,
    pub api_version: String,
    pub kind: String,
    /// YAML body of the resource (metadata is managed by the operator).
    pub body: String,
}

impl AccessResourceTemplate {
    /// Deterministic name of the resource rendered for `workspace_name`.
    pub fn resource_name(&self, workspace_name: &str) -> String {
        format!("{}-{}", self.name_prefix, workspace_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_name_is_prefix_dash_workspace() {
        let template = AccessResourceTemplate {
            name_prefix: "route".into(),
            api_version: "networking.k8s.io/v1".into(),
            kind: "Ingress".into(),
            body: String::new(),
        };
        assert_eq!(template.resource_name("alice-dev"), "route-alice-dev");
    }
}
