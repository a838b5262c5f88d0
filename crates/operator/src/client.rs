//! Control-plane operations issued by the reconcilers.
//!
//! Everything the state machine and the companion loop read or write on the
//! Atelier resources themselves goes through [`WorkspaceClient`], so tests
//! can run the loops against a mock while production wraps a kube client.
//! Child-resource CRUD lives in [`crate::resources`].

use async_trait::async_trait;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
#[cfg(test)]
use mockall::automock;
use serde_json::json;

use crate::crd::{
    DesiredStatus, Workspace, WorkspaceStatus, WorkspaceTemplate, TEMPLATE_FINALIZER,
    TEMPLATE_LABEL, WORKSPACE_FINALIZER,
};
use crate::error::{Error, Result};

/// Reads and writes against the Atelier resources.
///
/// All mutations go through the control plane's conflict-checked write path;
/// a conflict surfaces as a retryable [`Error::Kube`] and is healed by the
/// next requeue.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkspaceClient: Send + Sync {
    /// Fetch a cluster-scoped template by name. `None` when it does not
    /// exist; any other failure propagates.
    async fn get_template(&self, name: &str) -> Result<Option<WorkspaceTemplate>>;

    /// Raw label-indexed listing of workspaces carrying the template mirror
    /// label. Callers apply the deletion and skew filters.
    async fn list_workspaces_by_template_label(&self, template: &str) -> Result<Vec<Workspace>>;

    /// Persist a workspace status sub-document.
    async fn patch_workspace_status(
        &self,
        namespace: &str,
        name: &str,
        status: &WorkspaceStatus,
    ) -> Result<()>;

    /// Rewrite the workspace's declared intent. Distinct from a status
    /// write: this re-triggers reconciliation of the object.
    async fn patch_desired_status(
        &self,
        namespace: &str,
        name: &str,
        desired: DesiredStatus,
    ) -> Result<()>;

    /// Add (`Some`) or remove (`None`) a label on a workspace.
    async fn set_workspace_label(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: Option<String>,
    ) -> Result<()>;

    /// Ensure the workspace teardown finalizer is present or absent.
    async fn set_workspace_finalizer(
        &self,
        namespace: &str,
        name: &str,
        present: bool,
    ) -> Result<()>;

    /// Ensure the template in-use finalizer is present or absent.
    async fn set_template_finalizer(&self, name: &str, present: bool) -> Result<()>;

    /// Record the template generation the companion loop has acted on.
    async fn patch_template_observed_generation(&self, name: &str, generation: i64) -> Result<()>;
}

/// Production implementation over a kube [`Client`].
#[derive(Clone)]
pub struct KubeWorkspaceClient {
    client: Client,
    field_manager: String,
}

impl KubeWorkspaceClient {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    fn patch_params(&self) -> PatchParams {
        PatchParams::apply(&self.field_manager)
    }

    fn workspaces(&self, namespace: &str) -> Api<Workspace> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn templates(&self) -> Api<WorkspaceTemplate> {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl WorkspaceClient for KubeWorkspaceClient {
    async fn get_template(&self, name: &str) -> Result<Option<WorkspaceTemplate>> {
        match self.templates().get(name).await {
            Ok(template) => Ok(Some(template)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_workspaces_by_template_label(&self, template: &str) -> Result<Vec<Workspace>> {
        let api: Api<Workspace> = Api::all(self.client.clone());
        let params = ListParams::default().labels(&format!("{}={}", TEMPLATE_LABEL, template));
        Ok(api.list(&params).await?.items)
    }

    async fn patch_workspace_status(
        &self,
        namespace: &str,
        name: &str,
        status: &WorkspaceStatus,
    ) -> Result<()> {
        self.workspaces(namespace)
            .patch_status(
                name,
                &self.patch_params(),
                &Patch::Merge(json!({ "status": status })),
            )
            .await?;
        Ok(())
    }

    async fn patch_desired_status(
        &self,
        namespace: &str,
        name: &str,
        desired: DesiredStatus,
    ) -> Result<()> {
        if desired == DesiredStatus::Unknown {
            return Err(Error::Infrastructure {
                message: "refusing to write Unknown desired status".to_string(),
            });
        }
        self.workspaces(namespace)
            .patch(
                name,
                &self.patch_params(),
                &Patch::Merge(json!({ "spec": { "desiredStatus": desired.to_string() } })),
            )
            .await?;
        Ok(())
    }

    async fn set_workspace_label(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: Option<String>,
    ) -> Result<()> {
        self.workspaces(namespace)
            .patch(
                name,
                &self.patch_params(),
                &Patch::Merge(json!({ "metadata": { "labels": { (key): value } } })),
            )
            .await?;
        Ok(())
    }

    async fn set_workspace_finalizer(
        &self,
        namespace: &str,
        name: &str,
        present: bool,
    ) -> Result<()> {
        let api = self.workspaces(namespace);
        let workspace = match api.get(name).await {
            Ok(ws) => ws,
            Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if let Some(finalizers) = edited_finalizers(workspace.finalizers(), WORKSPACE_FINALIZER, present)
        {
            api.patch(
                name,
                &self.patch_params(),
                &Patch::Merge(json!({ "metadata": { "finalizers": finalizers } })),
            )
            .await?;
        }
        Ok(())
    }

    async fn set_template_finalizer(&self, name: &str, present: bool) -> Result<()> {
        let api = self.templates();
        let template = match api.get(name).await {
            Ok(template) => template,
            Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if let Some(finalizers) = edited_finalizers(template.finalizers(), TEMPLATE_FINALIZER, present)
        {
            api.patch(
                name,
                &self.patch_params(),
                &Patch::Merge(json!({ "metadata": { "finalizers": finalizers } })),
            )
            .await?;
        }
        Ok(())
    }

    async fn patch_template_observed_generation(&self, name: &str, generation: i64) -> Result<()> {
        self.templates()
            .patch_status(
                name,
                &self.patch_params(),
                &Patch::Merge(json!({ "status": { "observedGeneration": generation } })),
            )
            .await?;
        Ok(())
    }
}

/// New finalizer list when toggling `finalizer`, or `None` when the list is
/// already in the requested state.
fn edited_finalizers(current: &[String], finalizer: &str, present: bool) -> Option<Vec<String>> {
    let has = current.iter().any(|f| f == finalizer);
    match (has, present) {
        (true, true) | (false, false) => None,
        (false, true) => {
            let mut next = current.to_vec();
            next.push(finalizer.to_string());
            Some(next)
        }
        (true, false) => Some(current.iter().filter(|f| *f != finalizer).cloned().collect()),
    }
}
