//! WorkspaceTemplate companion loop.
//!
//! Two concerns, both driven by the label-indexed reverse lookup: a
//! finalizer that blocks deletion of a template still in use, and an
//! asynchronous compliance handshake that marks referencing workspaces for
//! re-validation whenever the template's bounds or policy change. The two
//! reconcilers never call each other; they communicate only through the
//! recheck label.

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, error, info};

use crate::client::WorkspaceClient;
use crate::config::Settings;
use crate::crd::{WorkspaceTemplate, RECHECK_LABEL};
use crate::error::{Error, Result};
use crate::template::TemplateResolver;

/// Shared state for the template controller.
pub struct TemplateContext {
    pub client: Arc<dyn WorkspaceClient>,
    pub resolver: TemplateResolver,
    pub settings: Settings,
}

impl TemplateContext {
    pub fn new(client: Arc<dyn WorkspaceClient>, settings: Settings) -> Self {
        Self {
            resolver: TemplateResolver::new(client.clone()),
            client,
            settings,
        }
    }
}

/// Reconcile one template.
pub async fn reconcile_template(
    template: Arc<WorkspaceTemplate>,
    ctx: Arc<TemplateContext>,
) -> Result<Action> {
    let name = template.name_any();
    debug!(template = %name, "reconciling template");

    let users = ctx.resolver.workspaces_using_template(&name).await?;

    if template.metadata.deletion_timestamp.is_some() {
        if users.is_empty() {
            info!(template = %name, "template unused, releasing finalizer");
            ctx.client.set_template_finalizer(&name, false).await?;
            return Ok(Action::await_change());
        }
        // A deletion-in-progress workspace no longer counts as a user, so
        // re-check on a timer until the last reference drains.
        info!(
            template = %name,
            users = users.len(),
            "deletion blocked, template still in use"
        );
        return Ok(Action::requeue(ctx.settings.template_requeue));
    }

    ctx.client
        .set_template_finalizer(&name, !users.is_empty())
        .await?;

    // Bounds/policy mutation: mark every referencing workspace for a
    // compliance recheck by the primary loop, then record the generation.
    let generation = template.metadata.generation.unwrap_or(0);
    let observed = template
        .status
        .as_ref()
        .and_then(|s| s.observed_generation)
        .unwrap_or(0);
    if generation != observed {
        // First observation of a template carries no previous bounds to have
        // drifted from; just record it.
        if observed != 0 {
            for workspace in &users {
                let namespace = workspace.namespace().ok_or(Error::MissingNamespace)?;
                ctx.client
                    .set_workspace_label(
                        &namespace,
                        &workspace.name_any(),
                        RECHECK_LABEL,
                        Some("true".to_string()),
                    )
                    .await?;
            }
            info!(
                template = %name,
                marked = users.len(),
                "template changed, marked workspaces for compliance recheck"
            );
        }
        ctx.client
            .patch_template_observed_generation(&name, generation)
            .await?;
    }

    Ok(Action::await_change())
}

/// Requeue policy for the template controller.
pub fn template_error_policy(
    template: Arc<WorkspaceTemplate>,
    error: &Error,
    ctx: Arc<TemplateContext>,
) -> Action {
    error!(template = %template.name_any(), %error, "template reconciliation failed");
    Action::requeue(ctx.settings.template_requeue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockWorkspaceClient;
    use crate::crd::{TemplateRef, WorkspaceTemplateStatus};
    use crate::testing::{template_named, workspace_with_uid};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn referencing_workspace(name: &str, template: &str) -> crate::crd::Workspace {
        let mut workspace = workspace_with_uid(name, "team-a");
        workspace.spec.template_ref = Some(TemplateRef {
            name: template.to_string(),
        });
        workspace
            .metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert(crate::crd::TEMPLATE_LABEL.to_string(), template.to_string());
        workspace
    }

    fn context(client: MockWorkspaceClient) -> Arc<TemplateContext> {
        Arc::new(TemplateContext::new(Arc::new(client), Settings::default()))
    }

    #[tokio::test]
    async fn deletion_is_blocked_while_a_workspace_references_the_template() {
        let mut template = template_named("small", "img:v1");
        template.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        template.metadata.finalizers = Some(vec![crate::crd::TEMPLATE_FINALIZER.to_string()]);

        let mut client = MockWorkspaceClient::new();
        client
            .expect_list_workspaces_by_template_label()
            .returning(|_| Ok(vec![referencing_workspace("alice-dev", "small")]));
        client.expect_set_template_finalizer().never();

        let action = reconcile_template(Arc::new(template), context(client))
            .await
            .unwrap();
        // The finalizer stays; the object persists with its deletion
        // timestamp until the workspace goes away.
        assert_eq!(action, Action::requeue(Settings::default().template_requeue));
    }

    #[tokio::test]
    async fn deletion_proceeds_once_the_reverse_lookup_drains() {
        let mut template = template_named("small", "img:v1");
        template.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        template.metadata.finalizers = Some(vec![crate::crd::TEMPLATE_FINALIZER.to_string()]);

        let mut client = MockWorkspaceClient::new();
        // The last referencing workspace is itself being deleted, which no
        // longer counts as a dependency.
        client.expect_list_workspaces_by_template_label().returning(|_| {
            let mut workspace = referencing_workspace("alice-dev", "small");
            workspace.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
            Ok(vec![workspace])
        });
        client
            .expect_set_template_finalizer()
            .withf(|_, present| !present)
            .times(1)
            .returning(|_, _| Ok(()));

        let action = reconcile_template(Arc::new(template), context(client))
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn label_spec_skew_is_dropped_from_the_reverse_lookup() {
        let mut template = template_named("small", "img:v1");
        template.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));

        let mut client = MockWorkspaceClient::new();
        // Labeled for "small" but the spec now references another template.
        client.expect_list_workspaces_by_template_label().returning(|_| {
            let mut workspace = referencing_workspace("alice-dev", "small");
            workspace.spec.template_ref = Some(TemplateRef {
                name: "large".to_string(),
            });
            Ok(vec![workspace])
        });
        client
            .expect_set_template_finalizer()
            .withf(|_, present| !present)
            .times(1)
            .returning(|_, _| Ok(()));

        let action = reconcile_template(Arc::new(template), context(client))
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn generation_change_marks_users_for_recheck() {
        let mut template = template_named("small", "img:v1");
        template.metadata.generation = Some(4);
        template.status = Some(WorkspaceTemplateStatus {
            observed_generation: Some(3),
        });

        let mut client = MockWorkspaceClient::new();
        client
            .expect_list_workspaces_by_template_label()
            .returning(|_| Ok(vec![referencing_workspace("alice-dev", "small")]));
        client
            .expect_set_template_finalizer()
            .withf(|_, present| *present)
            .times(1)
            .returning(|_, _| Ok(()));
        client
            .expect_set_workspace_label()
            .withf(|_, name, key, value| {
                name == "alice-dev" && key == RECHECK_LABEL && value.as_deref() == Some("true")
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        client
            .expect_patch_template_observed_generation()
            .withf(|_, generation| *generation == 4)
            .times(1)
            .returning(|_, _| Ok(()));

        let action = reconcile_template(Arc::new(template), context(client))
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn first_observation_records_generation_without_marking() {
        let mut template = template_named("small", "img:v1");
        template.metadata.generation = Some(1);

        let mut client = MockWorkspaceClient::new();
        client
            .expect_list_workspaces_by_template_label()
            .returning(|_| Ok(vec![referencing_workspace("alice-dev", "small")]));
        client
            .expect_set_template_finalizer()
            .returning(|_, _| Ok(()));
        client.expect_set_workspace_label().never();
        client
            .expect_patch_template_observed_generation()
            .times(1)
            .returning(|_, _| Ok(()));

        reconcile_template(Arc::new(template), context(client))
            .await
            .unwrap();
    }
}
