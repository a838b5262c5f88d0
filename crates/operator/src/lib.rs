//! Atelier Operator - Kubernetes-native workspace orchestration.
//!
//! Drives Workspace resources through provisioning, readiness tracking, idle
//! detection and teardown by reconciling declared intent against the live
//! state of their child resources. A companion loop protects
//! WorkspaceTemplates still in use and triggers asynchronous compliance
//! rechecks when a template's bounds change.

pub mod client;
pub mod config;
pub mod crd;
pub mod error;
pub mod events;
pub mod idle;
pub mod quantity;
pub mod reconcile;
pub mod resources;
pub mod status;
pub mod template;

pub use error::{Error, Result};

#[cfg(test)]
pub(crate) mod testing {
    //! Shared fixtures for unit tests.

    use crate::crd::{Workspace, WorkspaceSpec, WorkspaceTemplate, WorkspaceTemplateSpec};
    use crate::template::ResolvedTemplate;

    pub fn workspace_with_uid(name: &str, namespace: &str) -> Workspace {
        let spec: WorkspaceSpec = serde_json::from_str("{}").unwrap();
        let mut workspace = Workspace::new(name, spec);
        workspace.metadata.namespace = Some(namespace.to_string());
        workspace.metadata.uid = Some(format!("uid-{}", name));
        workspace
    }

    pub fn template_named(name: &str, default_image: &str) -> WorkspaceTemplate {
        let spec: WorkspaceTemplateSpec =
            serde_json::from_value(serde_json::json!({ "defaultImage": default_image })).unwrap();
        WorkspaceTemplate::new(name, spec)
    }

    pub fn resolved_template(image: &str) -> ResolvedTemplate {
        ResolvedTemplate {
            template_name: "small".to_string(),
            image: image.to_string(),
            resources: Default::default(),
            storage_size: None,
            storage_class: None,
            environment: Vec::new(),
            idle_shutdown: None,
        }
    }
}
