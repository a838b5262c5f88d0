//! Dynamically-typed access resources.
//!
//! Arbitrary kinds (e.g. an ingress route) are rendered per workspace from a
//! strategy's templates and handled as a tagged payload plus a minimal
//! generic client capability set. The workspace's tracked status list is the
//! only record of these objects, so every flow below mutates it in lockstep
//! with confirmed control-plane changes.

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams, TypeMeta};
use kube::core::{ApiResource, GroupVersionKind};
use kube::{Client, Resource, ResourceExt};
#[cfg(test)]
use mockall::automock;
use serde_json::Value;
use tracing::debug;

use super::builders::{child_labels, service_name, WORKSPACE_PORT};
use crate::crd::{AccessResourceStatus, AccessResourceTemplate, Workspace, WorkspaceAccessStrategy};
use crate::error::{Error, Result};

/// Identity of one dynamically-typed resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessResourceKey {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: String,
}

impl AccessResourceKey {
    pub fn status_entry(&self) -> AccessResourceStatus {
        AccessResourceStatus {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            name: self.name.clone(),
            namespace: self.namespace.clone(),
        }
    }

    pub fn from_status(entry: &AccessResourceStatus) -> Self {
        Self {
            api_version: entry.api_version.clone(),
            kind: entry.kind.clone(),
            name: entry.name.clone(),
            namespace: entry.namespace.clone(),
        }
    }
}

/// A rendered resource ready for submission: identity plus the body fields
/// (everything except apiVersion/kind/metadata, which the operator manages).
#[derive(Clone, Debug, PartialEq)]
pub struct AccessResourcePayload {
    pub key: AccessResourceKey,
    pub body: Value,
}

/// Minimal generic client over tagged payloads.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DynamicApi: Send + Sync {
    async fn get(&self, key: &AccessResourceKey) -> Result<Option<DynamicObject>>;
    async fn create(&self, payload: &AccessResourcePayload, owner: &Workspace) -> Result<()>;
    async fn update(&self, payload: &AccessResourcePayload) -> Result<()>;
    async fn delete(&self, key: &AccessResourceKey) -> Result<()>;
}

/// Render a strategy template for one workspace.
///
/// The body is YAML with `{{workspaceName}}`, `{{workspaceNamespace}}`,
/// `{{serviceName}}` and `{{servicePort}}` placeholders. A body that fails
/// to parse is a permanent configuration error.
pub fn render_payload(
    template: &AccessResourceTemplate,
    workspace: &Workspace,
) -> Result<AccessResourcePayload> {
    let workspace_name = workspace.name_any();
    let namespace = workspace.namespace().ok_or(Error::MissingNamespace)?;

    let rendered = template
        .body
        .replace("{{workspaceName}}", &workspace_name)
        .replace("{{workspaceNamespace}}", &namespace)
        .replace("{{serviceName}}", &service_name(workspace))
        .replace("{{servicePort}}", &WORKSPACE_PORT.to_string());

    let mut body: Value = if rendered.trim().is_empty() {
        Value::Object(Default::default())
    } else {
        serde_yaml::from_str(&rendered).map_err(|e| Error::InvalidAccessTemplate {
            name: template.name_prefix.clone(),
            message: e.to_string(),
        })?
    };

    // The operator owns identity and metadata; drop any the template carried.
    if let Value::Object(map) = &mut body {
        map.remove("apiVersion");
        map.remove("kind");
        map.remove("metadata");
    } else {
        return Err(Error::InvalidAccessTemplate {
            name: template.name_prefix.clone(),
            message: "body must be a YAML mapping".to_string(),
        });
    }

    Ok(AccessResourcePayload {
        key: AccessResourceKey {
            api_version: template.api_version.clone(),
            kind: template.kind.clone(),
            name: template.resource_name(&workspace_name),
            namespace,
        },
        body,
    })
}

/// Ensure every access resource of the strategy exists and is tracked.
///
/// Processing is fail-fast: the first resource whose creation fails stops
/// the pass with already-succeeded entries recorded and the failing one
/// unrecorded, so a retry resumes where it left off.
pub async fn ensure_access_resources(
    api: &dyn DynamicApi,
    workspace: &Workspace,
    strategy: &WorkspaceAccessStrategy,
    tracked: &mut Vec<AccessResourceStatus>,
) -> Result<()> {
    for template in &strategy.spec.templates {
        let payload = render_payload(template, workspace)?;
        let entry = payload.key.status_entry();

        let already_tracked = tracked
            .iter()
            .any(|t| t.name == entry.name && t.kind == entry.kind);
        if already_tracked {
            if api.get(&payload.key).await?.is_some() {
                continue;
            }
            // Tracked but gone from the cluster: fall through and recreate.
            debug!(name = %entry.name, kind = %entry.kind, "tracked access resource missing, recreating");
        }

        match api.create(&payload, workspace).await {
            Ok(()) => {}
            Err(e) if is_already_exists(&e) => {
                // Lost a race with a previous reconciliation or an external
                // actor: adopt the existing object.
                match api.get(&payload.key).await? {
                    Some(_) => api.update(&payload).await?,
                    None => {
                        return Err(Error::Infrastructure {
                            message: format!(
                                "access resource {} vanished between create and get",
                                entry.name
                            ),
                        });
                    }
                }
            }
            Err(e) => return Err(e),
        }

        upsert_entry(tracked, entry);
    }
    Ok(())
}

/// Request deletion of every tracked access resource.
///
/// A not-found get counts as already removed. On any failure the remaining,
/// un-removed entries are preserved in the tracked list so a retry is
/// idempotent.
pub async fn ensure_access_resources_deleted(
    api: &dyn DynamicApi,
    tracked: &mut Vec<AccessResourceStatus>,
) -> Result<()> {
    let entries = std::mem::take(tracked);
    for (index, entry) in entries.iter().enumerate() {
        let key = AccessResourceKey::from_status(entry);
        let outcome = async {
            if api.get(&key).await?.is_some() {
                api.delete(&key).await?;
            }
            Ok::<(), Error>(())
        }
        .await;

        if let Err(e) = outcome {
            tracked.extend_from_slice(&entries[index..]);
            return Err(e);
        }
    }
    Ok(())
}

/// Pure predicate: all access resources are gone once nothing is tracked.
pub fn access_resources_deleted(tracked: &[AccessResourceStatus]) -> bool {
    tracked.is_empty()
}

fn upsert_entry(tracked: &mut Vec<AccessResourceStatus>, entry: AccessResourceStatus) {
    match tracked
        .iter_mut()
        .find(|t| t.name == entry.name && t.kind == entry.kind)
    {
        Some(existing) => *existing = entry,
        None => tracked.push(entry),
    }
}

fn is_already_exists(error: &Error) -> bool {
    matches!(error, Error::Kube(kube::Error::Api(ae)) if ae.code == 409)
}

/// Production implementation resolving an [`Api`] per payload.
#[derive(Clone)]
pub struct KubeDynamicApi {
    client: Client,
    field_manager: String,
}

impl KubeDynamicApi {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    fn api_for(&self, key: &AccessResourceKey) -> Api<DynamicObject> {
        let (group, version) = match key.api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", key.api_version.as_str()),
        };
        let gvk = GroupVersionKind::gvk(group, version, &key.kind);
        let resource = ApiResource::from_gvk(&gvk);
        Api::namespaced_with(self.client.clone(), &key.namespace, &resource)
    }
}

#[async_trait]
impl DynamicApi for KubeDynamicApi {
    async fn get(&self, key: &AccessResourceKey) -> Result<Option<DynamicObject>> {
        match self.api_for(key).get(&key.name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create(&self, payload: &AccessResourcePayload, owner: &Workspace) -> Result<()> {
        let owner_ref = owner
            .controller_owner_ref(&())
            .ok_or_else(|| Error::Infrastructure {
                message: format!("workspace {} has no uid yet", owner.name_any()),
            })?;

        let mut object = DynamicObject {
            types: Some(TypeMeta {
                api_version: payload.key.api_version.clone(),
                kind: payload.key.kind.clone(),
            }),
            metadata: Default::default(),
            data: payload.body.clone(),
        };
        object.metadata.name = Some(payload.key.name.clone());
        object.metadata.namespace = Some(payload.key.namespace.clone());
        object.metadata.labels = Some(child_labels(owner));
        object.metadata.owner_references = Some(vec![owner_ref]);

        self.api_for(&payload.key)
            .create(&PostParams::default(), &object)
            .await?;
        Ok(())
    }

    async fn update(&self, payload: &AccessResourcePayload) -> Result<()> {
        self.api_for(&payload.key)
            .patch(
                &payload.key.name,
                &PatchParams::apply(&self.field_manager),
                &Patch::Merge(&payload.body),
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &AccessResourceKey) -> Result<()> {
        match self.api_for(key).delete(&key.name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::WorkspaceAccessStrategySpec;
    use crate::testing::workspace_with_uid;
    use kube::api::ObjectMeta;

    fn strategy(prefixes: &[&str]) -> WorkspaceAccessStrategy {
        WorkspaceAccessStrategy {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("team-a".to_string()),
                ..Default::default()
            },
            spec: WorkspaceAccessStrategySpec {
                templates: prefixes
                    .iter()
                    .map(|prefix| AccessResourceTemplate {
                        name_prefix: prefix.to_string(),
                        api_version: "networking.k8s.io/v1".to_string(),
                        kind: "Ingress".to_string(),
                        body: "spec:\n  rules:\n    - host: {{workspaceName}}.example.com\n"
                            .to_string(),
                    })
                    .collect(),
            },
        }
    }

    fn dynamic_object() -> DynamicObject {
        DynamicObject {
            types: None,
            metadata: Default::default(),
            data: serde_json::json!({}),
        }
    }

    fn api_conflict() -> Error {
        Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "already exists".to_string(),
            reason: "AlreadyExists".to_string(),
            code: 409,
        }))
    }

    fn api_boom() -> Error {
        Error::Infrastructure {
            message: "api unavailable".to_string(),
        }
    }

    #[test]
    fn rendering_interpolates_workspace_identity() {
        let workspace = workspace_with_uid("alice-dev", "team-a");
        let template = &strategy(&["route"]).spec.templates[0];
        let payload = render_payload(template, &workspace).unwrap();
        assert_eq!(payload.key.name, "route-alice-dev");
        assert_eq!(payload.key.namespace, "team-a");
        assert_eq!(
            payload.body["spec"]["rules"][0]["host"],
            "alice-dev.example.com"
        );
    }

    #[test]
    fn rendering_rejects_unparsable_bodies() {
        let workspace = workspace_with_uid("alice-dev", "team-a");
        let template = AccessResourceTemplate {
            name_prefix: "route".to_string(),
            api_version: "v1".to_string(),
            kind: "ConfigMap".to_string(),
            body: ": not yaml :".to_string(),
        };
        let err = render_payload(&template, &workspace).unwrap_err();
        assert!(matches!(err, Error::InvalidAccessTemplate { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn first_ensure_creates_and_tracks_one_entry() {
        let workspace = workspace_with_uid("alice-dev", "team-a");
        let strategy = strategy(&["route"]);
        let mut tracked = Vec::new();

        let mut api = MockDynamicApi::new();
        api.expect_create().times(1).returning(|_, _| Ok(()));
        api.expect_get().never();

        ensure_access_resources(&api, &workspace, &strategy, &mut tracked)
            .await
            .unwrap();
        assert_eq!(tracked.len(), 1);
        assert_eq!(tracked[0].name, "route-alice-dev");
    }

    #[tokio::test]
    async fn second_ensure_gets_instead_of_creating() {
        let workspace = workspace_with_uid("alice-dev", "team-a");
        let strategy = strategy(&["route"]);
        let mut tracked = vec![AccessResourceStatus {
            api_version: "networking.k8s.io/v1".to_string(),
            kind: "Ingress".to_string(),
            name: "route-alice-dev".to_string(),
            namespace: "team-a".to_string(),
        }];

        let mut api = MockDynamicApi::new();
        api.expect_get()
            .times(1)
            .returning(|_| Ok(Some(dynamic_object())));
        api.expect_create().never();

        ensure_access_resources(&api, &workspace, &strategy, &mut tracked)
            .await
            .unwrap();
        assert_eq!(tracked.len(), 1);
    }

    #[tokio::test]
    async fn create_failure_is_fail_fast_with_partial_recording() {
        // Three templates; the second create fails. Exactly one entry must
        // be recorded and the error must surface.
        let workspace = workspace_with_uid("alice-dev", "team-a");
        let strategy = strategy(&["a", "b", "c"]);
        let mut tracked = Vec::new();

        let mut api = MockDynamicApi::new();
        api.expect_create()
            .withf(|payload, _| payload.key.name.starts_with("a-"))
            .returning(|_, _| Ok(()));
        api.expect_create()
            .withf(|payload, _| payload.key.name.starts_with("b-"))
            .returning(|_, _| Err(api_boom()));

        let err = ensure_access_resources(&api, &workspace, &strategy, &mut tracked)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Infrastructure { .. }));
        assert_eq!(tracked.len(), 1);
        assert_eq!(tracked[0].name, "a-alice-dev");
    }

    #[tokio::test]
    async fn already_exists_falls_back_to_get_then_update() {
        let workspace = workspace_with_uid("alice-dev", "team-a");
        let strategy = strategy(&["route"]);
        let mut tracked = Vec::new();

        let mut api = MockDynamicApi::new();
        api.expect_create().times(1).returning(|_, _| Err(api_conflict()));
        api.expect_get()
            .times(1)
            .returning(|_| Ok(Some(dynamic_object())));
        api.expect_update().times(1).returning(|_| Ok(()));

        ensure_access_resources(&api, &workspace, &strategy, &mut tracked)
            .await
            .unwrap();
        assert_eq!(tracked.len(), 1);
    }

    #[tokio::test]
    async fn deletion_preserves_unremoved_entries_on_failure() {
        let entries: Vec<AccessResourceStatus> = ["a", "b"]
            .iter()
            .map(|n| AccessResourceStatus {
                api_version: "v1".to_string(),
                kind: "ConfigMap".to_string(),
                name: n.to_string(),
                namespace: "team-a".to_string(),
            })
            .collect();
        let mut tracked = entries.clone();

        let mut api = MockDynamicApi::new();
        api.expect_get()
            .withf(|key| key.name == "a")
            .returning(|_| Ok(Some(dynamic_object())));
        api.expect_delete()
            .withf(|key| key.name == "a")
            .returning(|_| Ok(()));
        api.expect_get()
            .withf(|key| key.name == "b")
            .returning(|_| Err(api_boom()));

        let err = ensure_access_resources_deleted(&api, &mut tracked)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Infrastructure { .. }));
        assert_eq!(tracked.len(), 1);
        assert_eq!(tracked[0].name, "b");
    }

    #[tokio::test]
    async fn deletion_treats_not_found_as_already_removed() {
        let mut tracked = vec![AccessResourceStatus {
            api_version: "v1".to_string(),
            kind: "ConfigMap".to_string(),
            name: "a".to_string(),
            namespace: "team-a".to_string(),
        }];

        let mut api = MockDynamicApi::new();
        api.expect_get().returning(|_| Ok(None));
        api.expect_delete().never();

        ensure_access_resources_deleted(&api, &mut tracked).await.unwrap();
        assert!(access_resources_deleted(&tracked));
    }
}
