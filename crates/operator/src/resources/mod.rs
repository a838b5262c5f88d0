//! Child-resource management for workspaces.
//!
//! Every `ensure_*` operation is non-blocking and idempotent: it guarantees
//! only that the create/update/delete request was accepted by the control
//! plane. Completion is observed on a later reconciliation pass through the
//! pure availability predicates.

pub mod access;
pub mod builders;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
#[cfg(test)]
use mockall::automock;
use std::sync::Arc;
use tracing::debug;

use crate::config::Settings;
use crate::crd::{AccessResourceStatus, Workspace, WorkspaceAccessStrategy};
use crate::error::{Error, Result};
use crate::template::ResolvedTemplate;

pub use access::{access_resources_deleted, DynamicApi, KubeDynamicApi};
pub use builders::storage_configured;

/// Create/update/delete operations on a workspace's child resources.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceOps: Send + Sync {
    async fn ensure_deployment(
        &self,
        workspace: &Workspace,
        resolved: &Option<ResolvedTemplate>,
    ) -> Result<Deployment>;

    async fn ensure_deployment_deleted(&self, workspace: &Workspace) -> Result<Option<Deployment>>;

    async fn ensure_service(&self, workspace: &Workspace) -> Result<Service>;

    async fn ensure_service_deleted(&self, workspace: &Workspace) -> Result<Option<Service>>;

    async fn ensure_volume_claim(
        &self,
        workspace: &Workspace,
        resolved: &Option<ResolvedTemplate>,
    ) -> Result<PersistentVolumeClaim>;

    /// Resolve the workspace's access-strategy reference, defaulting the
    /// namespace to the workspace's own.
    async fn access_strategy_for(
        &self,
        workspace: &Workspace,
    ) -> Result<Option<WorkspaceAccessStrategy>>;

    async fn ensure_access_resources(
        &self,
        workspace: &Workspace,
        strategy: &WorkspaceAccessStrategy,
        tracked: &mut Vec<AccessResourceStatus>,
    ) -> Result<()>;

    async fn ensure_access_resources_deleted(
        &self,
        workspace: &Workspace,
        tracked: &mut Vec<AccessResourceStatus>,
    ) -> Result<()>;
}

/// Whether the object is absent or already on its way out. A resource with
/// a deletion timestamp is "gone" for dependency purposes.
pub fn missing_or_deleting(meta: Option<&ObjectMeta>) -> bool {
    match meta {
        None => true,
        Some(meta) => meta.deletion_timestamp.is_some(),
    }
}

/// Compute workload availability: trust the control-plane condition, and
/// fall back to replica counts when the condition is stale or absent.
pub fn deployment_available(deployment: &Deployment) -> bool {
    let Some(status) = deployment.status.as_ref() else {
        return false;
    };
    let condition_available = status
        .conditions
        .as_ref()
        .and_then(|conditions| conditions.iter().find(|c| c.type_ == "Available"))
        .map(|c| c.status == "True");
    if let Some(available) = condition_available {
        return available;
    }
    let desired = deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    status.ready_replicas.unwrap_or(0) >= desired
}

/// Endpoint availability: a load-balanced endpoint needs an externally
/// assigned address; any other type is available as soon as it exists.
pub fn service_available(service: &Service) -> bool {
    let is_load_balancer = service
        .spec
        .as_ref()
        .and_then(|s| s.type_.as_deref())
        .map(|t| t == "LoadBalancer")
        .unwrap_or(false);
    if !is_load_balancer {
        return true;
    }
    service
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .map(|ingress| !ingress.is_empty())
        .unwrap_or(false)
}

/// Production resource manager over a kube [`Client`].
pub struct ResourceManager {
    client: Client,
    settings: Settings,
    dynamic: Arc<dyn DynamicApi>,
}

impl ResourceManager {
    pub fn new(client: Client, settings: Settings) -> Self {
        let dynamic = Arc::new(KubeDynamicApi::new(
            client.clone(),
            settings.field_manager.clone(),
        ));
        Self {
            client,
            settings,
            dynamic,
        }
    }

    fn patch_params(&self) -> PatchParams {
        PatchParams::apply(&self.settings.field_manager).force()
    }

    fn namespace_of(&self, workspace: &Workspace) -> Result<String> {
        workspace.namespace().ok_or(Error::MissingNamespace)
    }

    async fn apply<K>(&self, api: &Api<K>, name: &str, desired: &K) -> Result<K>
    where
        K: kube::Resource + Clone + std::fmt::Debug + serde::Serialize + serde::de::DeserializeOwned,
    {
        debug!(%name, "applying child resource");
        Ok(api
            .patch(name, &self.patch_params(), &Patch::Apply(desired))
            .await?)
    }

    async fn get_opt<K>(&self, api: &Api<K>, name: &str) -> Result<Option<K>>
    where
        K: Clone + std::fmt::Debug + serde::de::DeserializeOwned,
    {
        match api.get(name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Request deletion and return the object as observed afterwards.
    /// Non-blocking: the object usually survives the call with a deletion
    /// timestamp set, which the predicates count as "gone".
    async fn request_deletion<K>(&self, api: &Api<K>, name: &str) -> Result<Option<K>>
    where
        K: kube::Resource + Clone + std::fmt::Debug + serde::de::DeserializeOwned,
    {
        let Some(live) = self.get_opt(api, name).await? else {
            return Ok(None);
        };
        if live.meta().deletion_timestamp.is_none() {
            match api.delete(name, &DeleteParams::default()).await {
                Ok(_) => {}
                Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(None),
                Err(e) => return Err(e.into()),
            }
            return self.get_opt(api, name).await;
        }
        Ok(Some(live))
    }
}

#[async_trait]
impl ResourceOps for ResourceManager {
    async fn ensure_deployment(
        &self,
        workspace: &Workspace,
        resolved: &Option<ResolvedTemplate>,
    ) -> Result<Deployment> {
        let namespace = self.namespace_of(workspace)?;
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &namespace);
        let desired = builders::build_deployment(workspace, resolved.as_ref())?;
        self.apply(&api, &builders::deployment_name(workspace), &desired)
            .await
    }

    async fn ensure_deployment_deleted(&self, workspace: &Workspace) -> Result<Option<Deployment>> {
        let namespace = self.namespace_of(workspace)?;
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &namespace);
        self.request_deletion(&api, &builders::deployment_name(workspace))
            .await
    }

    async fn ensure_service(&self, workspace: &Workspace) -> Result<Service> {
        let namespace = self.namespace_of(workspace)?;
        let api: Api<Service> = Api::namespaced(self.client.clone(), &namespace);
        let desired = builders::build_service(workspace, self.settings.endpoint_type)?;
        self.apply(&api, &builders::service_name(workspace), &desired)
            .await
    }

    async fn ensure_service_deleted(&self, workspace: &Workspace) -> Result<Option<Service>> {
        let namespace = self.namespace_of(workspace)?;
        let api: Api<Service> = Api::namespaced(self.client.clone(), &namespace);
        self.request_deletion(&api, &builders::service_name(workspace))
            .await
    }

    async fn ensure_volume_claim(
        &self,
        workspace: &Workspace,
        resolved: &Option<ResolvedTemplate>,
    ) -> Result<PersistentVolumeClaim> {
        let namespace = self.namespace_of(workspace)?;
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), &namespace);

        for volume in &workspace.spec.volumes {
            let claim = builders::build_secondary_claim(workspace, volume)?;
            let name = builders::secondary_claim_name(workspace, &volume.name);
            // Claims are immutable once bound; only create missing ones.
            if self.get_opt(&api, &name).await?.is_none() {
                self.apply(&api, &name, &claim).await?;
            }
        }

        let name = builders::volume_claim_name(workspace);
        if let Some(existing) = self.get_opt(&api, &name).await? {
            return Ok(existing);
        }
        let desired = builders::build_volume_claim(workspace, resolved.as_ref())?;
        self.apply(&api, &name, &desired).await
    }

    async fn access_strategy_for(
        &self,
        workspace: &Workspace,
    ) -> Result<Option<WorkspaceAccessStrategy>> {
        let Some(reference) = workspace.spec.access_strategy.as_ref() else {
            return Ok(None);
        };
        let namespace = reference
            .namespace
            .clone()
            .unwrap_or(self.namespace_of(workspace)?);
        let api: Api<WorkspaceAccessStrategy> = Api::namespaced(self.client.clone(), &namespace);
        match api.get(&reference.name).await {
            Ok(strategy) => Ok(Some(strategy)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Err(Error::Infrastructure {
                message: format!(
                    "access strategy {}/{} not found",
                    namespace, reference.name
                ),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn ensure_access_resources(
        &self,
        workspace: &Workspace,
        strategy: &WorkspaceAccessStrategy,
        tracked: &mut Vec<AccessResourceStatus>,
    ) -> Result<()> {
        access::ensure_access_resources(self.dynamic.as_ref(), workspace, strategy, tracked).await
    }

    async fn ensure_access_resources_deleted(
        &self,
        _workspace: &Workspace,
        tracked: &mut Vec<AccessResourceStatus>,
    ) -> Result<()> {
        access::ensure_access_resources_deleted(self.dynamic.as_ref(), tracked).await
    }
}
