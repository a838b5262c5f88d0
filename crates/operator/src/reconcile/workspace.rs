//! The workspace reconciliation state machine.
//!
//! Level-triggered and single-pass: each call runs to completion with a
//! snapshot of status taken at entry, converges the declared intent one step
//! through idempotent child-resource operations, and returns a computed
//! requeue delay instead of blocking on external state.

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use tracing::{debug, error, info, warn};

use crate::client::WorkspaceClient;
use crate::config::Settings;
use crate::crd::{
    DesiredStatus, Workspace, WorkspacePhase, WorkspaceStatus, RECHECK_LABEL, TEMPLATE_LABEL,
};
use crate::error::{Error, Result};
use crate::events::{actions, reasons, EventPublisher};
use crate::idle::{IdleCheck, IdleOps};
use crate::resources::{
    access_resources_deleted, deployment_available, missing_or_deleting, service_available,
    storage_configured, ResourceOps,
};
use crate::status::{ChildNames, RunningReadiness, StatusManager, StoppingReadiness};
use crate::template::{effective_idle_config, TemplateResolver};

/// Delay before re-reconciling after the idle loop rewrites desired status,
/// so the stop takes effect promptly.
const INTENT_FLIP_REQUEUE: Duration = Duration::from_millis(50);

/// Shared state for the workspace controller.
pub struct Context {
    pub client: Arc<dyn WorkspaceClient>,
    pub resources: Arc<dyn ResourceOps>,
    pub idle: Arc<dyn IdleOps>,
    pub events: Arc<dyn EventPublisher>,
    pub status: StatusManager,
    pub resolver: TemplateResolver,
    pub settings: Settings,
}

impl Context {
    pub fn new(
        client: Arc<dyn WorkspaceClient>,
        resources: Arc<dyn ResourceOps>,
        idle: Arc<dyn IdleOps>,
        events: Arc<dyn EventPublisher>,
        settings: Settings,
    ) -> Self {
        Self {
            status: StatusManager::new(client.clone()),
            resolver: TemplateResolver::new(client.clone()),
            client,
            resources,
            idle,
            events,
            settings,
        }
    }

    #[cfg(test)]
    pub fn for_testing(
        client: Arc<dyn WorkspaceClient>,
        resources: Arc<dyn ResourceOps>,
        idle: Arc<dyn IdleOps>,
    ) -> Arc<Self> {
        Arc::new(Self::new(
            client,
            resources,
            idle,
            Arc::new(crate::events::NoopEventPublisher),
            Settings::default(),
        ))
    }
}

/// Reconcile one workspace. Invoked by the controller runtime on every spec,
/// status, child-resource or mapped-template event.
pub async fn reconcile(workspace: Arc<Workspace>, ctx: Arc<Context>) -> Result<Action> {
    let name = workspace.name_any();
    let namespace = workspace.namespace().ok_or(Error::MissingNamespace)?;
    debug!(workspace = %name, desired = %workspace.spec.desired_status, "reconciling");

    // Snapshot at entry: every status write diffs against this.
    let baseline = workspace.status.clone().unwrap_or_default();

    if workspace.metadata.deletion_timestamp.is_some() {
        return converge_stopped(&workspace, &ctx, &baseline, true).await;
    }

    ctx.client
        .set_workspace_finalizer(&namespace, &name, true)
        .await?;
    sync_template_label(&workspace, &ctx).await?;

    let mut baseline = baseline;
    if workspace.needs_compliance_recheck() {
        match recheck_compliance(&workspace, &ctx, &baseline).await? {
            RecheckOutcome::Compliant(updated) => baseline = updated,
            RecheckOutcome::NonCompliant => {
                return Ok(Action::requeue(ctx.settings.long_requeue));
            }
        }
    }

    match workspace.spec.desired_status {
        DesiredStatus::Stopped => converge_stopped(&workspace, &ctx, &baseline, false).await,
        DesiredStatus::Running => converge_running(&workspace, &ctx, &baseline).await,
        DesiredStatus::Unknown => {
            warn!(workspace = %name, "unknown desired status");
            ctx.status
                .set_error(
                    &workspace,
                    &baseline,
                    "UnknownDesiredStatus",
                    "desired status is not one of Running, Stopped",
                    &baseline.access_resources,
                )
                .await?;
            Ok(Action::requeue(ctx.settings.long_requeue))
        }
    }
}

/// Requeue policy when [`reconcile`] returns an error: transient failures
/// retry at a bounded delay, permanent ones wait for a spec change.
pub fn error_policy(workspace: Arc<Workspace>, error: &Error, ctx: Arc<Context>) -> Action {
    error!(
        workspace = %workspace.name_any(),
        %error,
        retryable = error.is_retryable(),
        "reconciliation failed"
    );
    if error.is_retryable() {
        Action::requeue(ctx.settings.error_requeue)
    } else {
        Action::await_change()
    }
}

/// Mirror the template reference into the reverse-lookup label. The label is
/// owned exclusively by this controller.
async fn sync_template_label(workspace: &Workspace, ctx: &Context) -> Result<()> {
    let namespace = workspace.namespace().ok_or(Error::MissingNamespace)?;
    let desired = workspace.template_name();
    let current = workspace
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(TEMPLATE_LABEL))
        .map(String::as_str);
    if desired != current {
        ctx.client
            .set_workspace_label(
                &namespace,
                &workspace.name_any(),
                TEMPLATE_LABEL,
                desired.map(str::to_string),
            )
            .await?;
    }
    Ok(())
}

enum RecheckOutcome {
    /// Validation passed; carries the status as updated by the compliance
    /// write so later writes in the same pass do not clobber it.
    Compliant(WorkspaceStatus),
    NonCompliant,
}

/// Re-validate a workspace flagged by the template companion loop. The
/// recheck label is removed regardless of the outcome to avoid checking
/// loops; a system error keeps the label so the retry re-enters here.
async fn recheck_compliance(
    workspace: &Workspace,
    ctx: &Context,
    baseline: &WorkspaceStatus,
) -> Result<RecheckOutcome> {
    let name = workspace.name_any();
    let namespace = workspace.namespace().ok_or(Error::MissingNamespace)?;
    info!(workspace = %name, "re-validating against changed template");

    let validation = ctx.resolver.validate_and_resolve(workspace).await?;
    let updated = ctx
        .status
        .set_template_compliance(workspace, baseline, &validation)
        .await?;
    ctx.client
        .set_workspace_label(&namespace, &name, RECHECK_LABEL, None)
        .await?;

    if validation.valid {
        ctx.events
            .publish(
                workspace,
                EventType::Normal,
                reasons::COMPLIANT,
                actions::VALIDATING,
                "workspace complies with its template".to_string(),
            )
            .await;
        Ok(RecheckOutcome::Compliant(updated))
    } else {
        ctx.events
            .publish(
                workspace,
                EventType::Warning,
                reasons::NON_COMPLIANT,
                actions::VALIDATING,
                validation.summary(),
            )
            .await;
        Ok(RecheckOutcome::NonCompliant)
    }
}

/// Converge towards Stopped: access resources first (best effort), then
/// non-blocking deletion of compute and endpoint, then observe what is gone.
/// With `terminating` the same convergence gates removal of the workspace
/// finalizer instead of writing a terminal Stopped status.
async fn converge_stopped(
    workspace: &Workspace,
    ctx: &Context,
    baseline: &WorkspaceStatus,
    terminating: bool,
) -> Result<Action> {
    let name = workspace.name_any();
    let namespace = workspace.namespace().ok_or(Error::MissingNamespace)?;

    let mut tracked = baseline.access_resources.clone();
    // Best effort: a failure here is remembered but must not block deletion
    // of the other child resources.
    let access_result = ctx
        .resources
        .ensure_access_resources_deleted(workspace, &mut tracked)
        .await;

    let deployment = match ctx.resources.ensure_deployment_deleted(workspace).await {
        Ok(deployment) => deployment,
        Err(e) => {
            ctx.status
                .set_error(workspace, baseline, e.reason(), &e.to_string(), &tracked)
                .await?;
            return Err(e);
        }
    };
    let service = match ctx.resources.ensure_service_deleted(workspace).await {
        Ok(service) => service,
        Err(e) => {
            ctx.status
                .set_error(workspace, baseline, e.reason(), &e.to_string(), &tracked)
                .await?;
            return Err(e);
        }
    };

    let readiness = StoppingReadiness {
        deployment_stopped: missing_or_deleting(deployment.as_ref().map(|d| &d.metadata)),
        service_stopped: missing_or_deleting(service.as_ref().map(|s| &s.metadata)),
        access_resources_stopped: access_resources_deleted(&tracked),
    };

    if readiness.deployment_stopped && readiness.service_stopped {
        if let Err(e) = access_result {
            ctx.status
                .set_error(workspace, baseline, e.reason(), &e.to_string(), &tracked)
                .await?;
            return Err(e);
        }
        if !readiness.access_resources_stopped {
            ctx.status
                .update_stopping(workspace, baseline, readiness, &tracked, terminating)
                .await?;
            return Ok(Action::requeue(ctx.settings.requeue_interval));
        }
        if terminating {
            // Everything owned and tracked is gone: allow finalization.
            ctx.client
                .set_workspace_finalizer(&namespace, &name, false)
                .await?;
            return Ok(Action::await_change());
        }
        let newly_stopped = baseline.phase != WorkspacePhase::Stopped;
        ctx.status
            .update_stopped(workspace, baseline, &tracked)
            .await?;
        if newly_stopped {
            if workspace.stopped_by_preemption() {
                ctx.events
                    .publish(
                        workspace,
                        EventType::Warning,
                        reasons::PREEMPTED,
                        actions::STOPPING,
                        format!("Workspace {} was stopped by preemption", name),
                    )
                    .await;
            } else {
                ctx.events
                    .publish(
                        workspace,
                        EventType::Normal,
                        reasons::STOPPED,
                        actions::STOPPING,
                        format!("Workspace {} stopped", name),
                    )
                    .await;
            }
        }
        return Ok(Action::await_change());
    }

    if readiness.deployment_stopped || readiness.service_stopped {
        ctx.status
            .update_stopping(workspace, baseline, readiness, &tracked, terminating)
            .await?;
        return Ok(Action::requeue(ctx.settings.requeue_interval));
    }

    // Both deletion requests were accepted yet neither object reports gone
    // or deleting. Cluster semantics should make this unreachable.
    warn!(workspace = %name, "stop convergence observed no deletion progress");
    ctx.status
        .set_error(
            workspace,
            baseline,
            "StopConvergence",
            "child resources report neither deleted nor deleting after a deletion request",
            &tracked,
        )
        .await?;
    Ok(Action::requeue(ctx.settings.requeue_interval))
}

/// Converge towards Running: validate fail-closed, then storage, compute and
/// endpoint in order, then access resources once both are ready.
async fn converge_running(
    workspace: &Workspace,
    ctx: &Context,
    baseline: &WorkspaceStatus,
) -> Result<Action> {
    let name = workspace.name_any();

    // An invalid configuration must never reach resource creation.
    let validation = match ctx.resolver.validate_and_resolve(workspace).await {
        Ok(validation) => validation,
        Err(e) => {
            ctx.status
                .set_error(
                    workspace,
                    baseline,
                    e.reason(),
                    &e.to_string(),
                    &baseline.access_resources,
                )
                .await?;
            return Err(e);
        }
    };
    if !validation.valid {
        ctx.events
            .publish(
                workspace,
                EventType::Warning,
                reasons::VALIDATION_FAILED,
                actions::VALIDATING,
                validation.summary(),
            )
            .await;
        ctx.status.set_invalid(workspace, baseline, &validation).await?;
        // Policy rejection is terminal for this cycle: the object sits
        // inert until its spec changes or a compliance recheck flags it.
        return Ok(Action::await_change());
    }
    let resolved = &validation.resolved;

    // The template is in use by a live workspace; guard it against deletion.
    if let Some(template) = workspace.template_name() {
        ctx.client.set_template_finalizer(template, true).await?;
    }

    let mut names = ChildNames::default();
    if storage_configured(workspace, resolved.as_ref()) {
        match ctx.resources.ensure_volume_claim(workspace, resolved).await {
            Ok(claim) => names.volume_claim = claim.metadata.name.clone(),
            Err(e) => {
                ctx.status
                    .set_error(
                        workspace,
                        baseline,
                        e.reason(),
                        &e.to_string(),
                        &baseline.access_resources,
                    )
                    .await?;
                return Err(e);
            }
        }
    }

    let deployment = match ctx.resources.ensure_deployment(workspace, resolved).await {
        Ok(deployment) => deployment,
        Err(e) => {
            ctx.status
                .set_error(
                    workspace,
                    baseline,
                    e.reason(),
                    &e.to_string(),
                    &baseline.access_resources,
                )
                .await?;
            return Err(e);
        }
    };
    names.deployment = deployment.metadata.name.clone();

    let service = match ctx.resources.ensure_service(workspace).await {
        Ok(service) => service,
        Err(e) => {
            ctx.status
                .set_error(
                    workspace,
                    baseline,
                    e.reason(),
                    &e.to_string(),
                    &baseline.access_resources,
                )
                .await?;
            return Err(e);
        }
    };
    names.service = service.metadata.name.clone();

    let readiness = RunningReadiness {
        deployment_ready: deployment_available(&deployment),
        service_ready: service_available(&service),
    };

    if !(readiness.deployment_ready && readiness.service_ready) {
        ctx.status
            .update_starting(
                workspace,
                baseline,
                readiness,
                &names,
                &baseline.access_resources,
                resolved.is_some(),
            )
            .await?;
        return Ok(Action::requeue(ctx.settings.requeue_interval));
    }

    let mut tracked = baseline.access_resources.clone();
    match ctx.resources.access_strategy_for(workspace).await {
        Ok(Some(strategy)) => {
            if let Err(e) = ctx
                .resources
                .ensure_access_resources(workspace, &strategy, &mut tracked)
                .await
            {
                // Partial progress stays recorded so the retry resumes.
                ctx.status
                    .set_error(workspace, baseline, e.reason(), &e.to_string(), &tracked)
                    .await?;
                return Err(e);
            }
        }
        Ok(None) => {}
        Err(e) => {
            ctx.status
                .set_error(workspace, baseline, e.reason(), &e.to_string(), &tracked)
                .await?;
            return Err(e);
        }
    }

    let newly_running = baseline.phase != WorkspacePhase::Running;
    ctx.status
        .update_running(workspace, baseline, &names, &tracked, resolved.is_some())
        .await?;
    if newly_running {
        info!(workspace = %name, "workspace is running");
        ctx.events
            .publish(
                workspace,
                EventType::Normal,
                reasons::RUNNING,
                actions::RECONCILING,
                format!("Workspace {} is running", name),
            )
            .await;
    }

    idle_shutdown_pass(workspace, ctx).await
}

/// The idle-shutdown sub-loop, entered only from the Running-and-ready path.
async fn idle_shutdown_pass(workspace: &Workspace, ctx: &Context) -> Result<Action> {
    let name = workspace.name_any();
    let namespace = workspace.namespace().ok_or(Error::MissingNamespace)?;

    // Merged view of an already-admitted object; validation results are not
    // re-derived here.
    let resolved = ctx.resolver.resolve(workspace).await?;
    let Some(config) = effective_idle_config(&workspace.spec, resolved.as_ref()) else {
        return Ok(Action::await_change());
    };
    if !config.enabled {
        return Ok(Action::await_change());
    }

    // Without a ready process there is nothing to probe yet.
    if ctx.idle.ready_pod_count(workspace).await? == 0 {
        return Ok(Action::requeue(ctx.settings.idle_check_interval));
    }

    match ctx.idle.check_idle(workspace, &config).await {
        Ok(IdleCheck { idle: true }) => {
            info!(workspace = %name, timeout_seconds = config.timeout_seconds, "idle threshold exceeded, stopping");
            // Intent update, not a status write: the next reconciliation's
            // Stopped branch acts on it.
            ctx.client
                .patch_desired_status(&namespace, &name, DesiredStatus::Stopped)
                .await?;
            ctx.events
                .publish(
                    workspace,
                    EventType::Normal,
                    reasons::IDLE_SHUTDOWN,
                    actions::STOPPING,
                    format!(
                        "Workspace {} idle for more than {}s, stopping",
                        name, config.timeout_seconds
                    ),
                )
                .await;
            Ok(Action::requeue(INTENT_FLIP_REQUEUE))
        }
        Ok(IdleCheck { idle: false }) => Ok(Action::requeue(ctx.settings.idle_check_interval)),
        Err(e) if e.should_retry() => {
            warn!(workspace = %name, error = %e, "idle check failed, will retry");
            Ok(Action::requeue(ctx.settings.idle_check_interval))
        }
        Err(e) => {
            // Permanent operational failure: disable the sub-loop until the
            // next Running transition, leaving the workspace running.
            warn!(workspace = %name, error = %e, "idle checking disabled");
            Ok(Action::await_change())
        }
    }
}
