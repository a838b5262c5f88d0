//! Status computation and persistence.
//!
//! The reconciler snapshots status at entry; every write here rebuilds a
//! proposed status from that baseline and persists only when something
//! actually changed. Condition merges preserve the last transition time
//! whenever status, reason, and message are all unchanged.

use std::sync::Arc;

use chrono::Utc;
use kube::ResourceExt;

use crate::client::WorkspaceClient;
use crate::crd::workspace::condition_types;
use crate::crd::{
    AccessResourceStatus, ConditionStatus, Workspace, WorkspaceCondition, WorkspacePhase,
    WorkspaceStatus,
};
use crate::error::{Error, Result};
use crate::template::TemplateValidationResult;

/// Readiness snapshot of a workspace converging towards Running. Computed
/// fresh each pass and projected into conditions, never persisted directly.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunningReadiness {
    pub deployment_ready: bool,
    pub service_ready: bool,
}

/// Teardown snapshot of a workspace converging towards Stopped.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoppingReadiness {
    pub deployment_stopped: bool,
    pub service_stopped: bool,
    pub access_resources_stopped: bool,
}

/// Child-resource names recorded on the status.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChildNames {
    pub deployment: Option<String>,
    pub service: Option<String>,
    pub volume_claim: Option<String>,
}

/// Merge one condition into the list. Returns whether anything changed; an
/// unchanged condition keeps its previous transition time.
pub fn upsert_condition(
    conditions: &mut Vec<WorkspaceCondition>,
    type_: &str,
    status: ConditionStatus,
    reason: &str,
    message: &str,
) -> bool {
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) {
        if existing.status == status && existing.reason == reason && existing.message == message {
            return false;
        }
        existing.status = status;
        existing.reason = reason.to_string();
        existing.message = message.to_string();
        existing.last_transition_time = Utc::now().to_rfc3339();
        return true;
    }
    conditions.push(WorkspaceCondition {
        type_: type_.to_string(),
        status,
        reason: reason.to_string(),
        message: message.to_string(),
        last_transition_time: Utc::now().to_rfc3339(),
    });
    true
}

/// Computes and idempotently persists workspace status transitions.
#[derive(Clone)]
pub struct StatusManager {
    client: Arc<dyn WorkspaceClient>,
}

impl StatusManager {
    pub fn new(client: Arc<dyn WorkspaceClient>) -> Self {
        Self { client }
    }

    /// Persist `proposed` unless it matches the baseline. Returns the
    /// now-current status either way.
    async fn persist(
        &self,
        workspace: &Workspace,
        baseline: &WorkspaceStatus,
        proposed: WorkspaceStatus,
    ) -> Result<WorkspaceStatus> {
        if proposed == *baseline {
            return Ok(proposed);
        }
        let namespace = workspace.namespace().ok_or(Error::MissingNamespace)?;
        self.client
            .patch_workspace_status(&namespace, &workspace.name_any(), &proposed)
            .await?;
        Ok(proposed)
    }

    pub async fn update_starting(
        &self,
        workspace: &Workspace,
        baseline: &WorkspaceStatus,
        readiness: RunningReadiness,
        names: &ChildNames,
        access: &[AccessResourceStatus],
        template_validated: bool,
    ) -> Result<WorkspaceStatus> {
        let mut proposed = baseline.clone();
        proposed.phase = WorkspacePhase::Starting;
        apply_names(&mut proposed, names);
        proposed.access_resources = access.to_vec();
        let detail = format!(
            "deployment ready: {}, service ready: {}",
            readiness.deployment_ready, readiness.service_ready
        );
        upsert_condition(
            &mut proposed.conditions,
            condition_types::AVAILABLE,
            ConditionStatus::False,
            "Starting",
            &detail,
        );
        upsert_condition(
            &mut proposed.conditions,
            condition_types::PROGRESSING,
            ConditionStatus::True,
            "Provisioning",
            &detail,
        );
        clear_degraded(&mut proposed.conditions);
        if template_validated {
            mark_compliant(&mut proposed.conditions);
        }
        self.persist(workspace, baseline, proposed).await
    }

    pub async fn update_running(
        &self,
        workspace: &Workspace,
        baseline: &WorkspaceStatus,
        names: &ChildNames,
        access: &[AccessResourceStatus],
        template_validated: bool,
    ) -> Result<WorkspaceStatus> {
        let mut proposed = baseline.clone();
        proposed.phase = WorkspacePhase::Running;
        apply_names(&mut proposed, names);
        proposed.access_resources = access.to_vec();
        upsert_condition(
            &mut proposed.conditions,
            condition_types::AVAILABLE,
            ConditionStatus::True,
            "Running",
            "workspace is ready",
        );
        upsert_condition(
            &mut proposed.conditions,
            condition_types::PROGRESSING,
            ConditionStatus::False,
            "Ready",
            "",
        );
        clear_degraded(&mut proposed.conditions);
        if template_validated {
            mark_compliant(&mut proposed.conditions);
        }
        self.persist(workspace, baseline, proposed).await
    }

    pub async fn update_stopping(
        &self,
        workspace: &Workspace,
        baseline: &WorkspaceStatus,
        readiness: StoppingReadiness,
        access: &[AccessResourceStatus],
        terminating: bool,
    ) -> Result<WorkspaceStatus> {
        let mut proposed = baseline.clone();
        proposed.phase = if terminating {
            WorkspacePhase::Terminating
        } else {
            WorkspacePhase::Stopping
        };
        proposed.access_resources = access.to_vec();
        let detail = format!(
            "deployment gone: {}, service gone: {}, access resources gone: {}",
            readiness.deployment_stopped,
            readiness.service_stopped,
            readiness.access_resources_stopped
        );
        upsert_condition(
            &mut proposed.conditions,
            condition_types::AVAILABLE,
            ConditionStatus::False,
            "Stopping",
            &detail,
        );
        upsert_condition(
            &mut proposed.conditions,
            condition_types::PROGRESSING,
            ConditionStatus::True,
            "Stopping",
            &detail,
        );
        clear_degraded(&mut proposed.conditions);
        self.persist(workspace, baseline, proposed).await
    }

    pub async fn update_stopped(
        &self,
        workspace: &Workspace,
        baseline: &WorkspaceStatus,
        access: &[AccessResourceStatus],
    ) -> Result<WorkspaceStatus> {
        let mut proposed = baseline.clone();
        proposed.phase = WorkspacePhase::Stopped;
        proposed.deployment_name = None;
        proposed.service_name = None;
        proposed.access_resources = access.to_vec();
        upsert_condition(
            &mut proposed.conditions,
            condition_types::AVAILABLE,
            ConditionStatus::False,
            "Stopped",
            "workspace is stopped",
        );
        upsert_condition(
            &mut proposed.conditions,
            condition_types::PROGRESSING,
            ConditionStatus::False,
            "Stopped",
            "",
        );
        clear_degraded(&mut proposed.conditions);
        self.persist(workspace, baseline, proposed).await
    }

    /// Surface a system error. The phase flips to Error and Degraded turns
    /// true; everything else, the tracked access list included, is carried.
    pub async fn set_error(
        &self,
        workspace: &Workspace,
        baseline: &WorkspaceStatus,
        reason: &str,
        message: &str,
        access: &[AccessResourceStatus],
    ) -> Result<WorkspaceStatus> {
        let mut proposed = baseline.clone();
        proposed.phase = WorkspacePhase::Error;
        proposed.access_resources = access.to_vec();
        upsert_condition(
            &mut proposed.conditions,
            condition_types::DEGRADED,
            ConditionStatus::True,
            reason,
            message,
        );
        self.persist(workspace, baseline, proposed).await
    }

    /// Surface a policy rejection. Distinct from Error: no resources were
    /// touched and the object sits inert until its spec changes.
    pub async fn set_invalid(
        &self,
        workspace: &Workspace,
        baseline: &WorkspaceStatus,
        validation: &TemplateValidationResult,
    ) -> Result<WorkspaceStatus> {
        let summary = validation.summary();
        let mut proposed = baseline.clone();
        proposed.phase = WorkspacePhase::Invalid;
        upsert_condition(
            &mut proposed.conditions,
            condition_types::AVAILABLE,
            ConditionStatus::False,
            "Invalid",
            "workspace configuration violates its template",
        );
        upsert_condition(
            &mut proposed.conditions,
            condition_types::PROGRESSING,
            ConditionStatus::False,
            "Blocked",
            "",
        );
        upsert_condition(
            &mut proposed.conditions,
            condition_types::TEMPLATE_COMPLIANT,
            ConditionStatus::False,
            "TemplateViolation",
            &summary,
        );
        self.persist(workspace, baseline, proposed).await
    }

    /// Record the outcome of an asynchronous compliance recheck without
    /// touching the phase.
    pub async fn set_template_compliance(
        &self,
        workspace: &Workspace,
        baseline: &WorkspaceStatus,
        validation: &TemplateValidationResult,
    ) -> Result<WorkspaceStatus> {
        let mut proposed = baseline.clone();
        if validation.valid {
            mark_compliant(&mut proposed.conditions);
        } else {
            upsert_condition(
                &mut proposed.conditions,
                condition_types::TEMPLATE_COMPLIANT,
                ConditionStatus::False,
                "TemplateViolation",
                &validation.summary(),
            );
        }
        self.persist(workspace, baseline, proposed).await
    }
}

fn apply_names(status: &mut WorkspaceStatus, names: &ChildNames) {
    if names.deployment.is_some() {
        status.deployment_name = names.deployment.clone();
    }
    if names.service.is_some() {
        status.service_name = names.service.clone();
    }
    if names.volume_claim.is_some() {
        status.volume_claim_name = names.volume_claim.clone();
    }
}

fn clear_degraded(conditions: &mut Vec<WorkspaceCondition>) {
    upsert_condition(
        conditions,
        condition_types::DEGRADED,
        ConditionStatus::False,
        "AsExpected",
        "",
    );
}

fn mark_compliant(conditions: &mut Vec<WorkspaceCondition>) {
    upsert_condition(
        conditions,
        condition_types::TEMPLATE_COMPLIANT,
        ConditionStatus::True,
        "Validated",
        "",
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockWorkspaceClient;
    use crate::testing::workspace_with_uid;

    #[test]
    fn unchanged_condition_keeps_its_transition_time() {
        let mut conditions = Vec::new();
        assert!(upsert_condition(
            &mut conditions,
            condition_types::AVAILABLE,
            ConditionStatus::True,
            "Running",
            "ready"
        ));
        let stamp = conditions[0].last_transition_time.clone();

        assert!(!upsert_condition(
            &mut conditions,
            condition_types::AVAILABLE,
            ConditionStatus::True,
            "Running",
            "ready"
        ));
        assert_eq!(conditions[0].last_transition_time, stamp);

        assert!(upsert_condition(
            &mut conditions,
            condition_types::AVAILABLE,
            ConditionStatus::False,
            "Stopping",
            "going down"
        ));
        assert_eq!(conditions.len(), 1);
    }

    #[tokio::test]
    async fn identical_status_skips_the_write() {
        let workspace = workspace_with_uid("alice-dev", "team-a");

        let mut client = MockWorkspaceClient::new();
        client
            .expect_patch_workspace_status()
            .times(1)
            .returning(|_, _, _| Ok(()));
        let manager = StatusManager::new(Arc::new(client));

        let baseline = WorkspaceStatus::default();
        let written = manager
            .update_stopped(&workspace, &baseline, &[])
            .await
            .unwrap();

        // Re-proposing the identical status must not patch again; the mock
        // above only permits a single write.
        let again = manager
            .update_stopped(&workspace, &written, &[])
            .await
            .unwrap();
        assert_eq!(written, again);
        assert_eq!(written.phase, WorkspacePhase::Stopped);
        assert_eq!(written.deployment_name, None);
    }

    #[tokio::test]
    async fn error_write_carries_the_tracked_access_list() {
        let workspace = workspace_with_uid("alice-dev", "team-a");
        let mut client = MockWorkspaceClient::new();
        client
            .expect_patch_workspace_status()
            .withf(|_, _, status| status.access_resources.len() == 1)
            .times(1)
            .returning(|_, _, _| Ok(()));
        let manager = StatusManager::new(Arc::new(client));

        let tracked = vec![AccessResourceStatus {
            api_version: "v1".to_string(),
            kind: "ConfigMap".to_string(),
            name: "route-alice-dev".to_string(),
            namespace: "team-a".to_string(),
        }];
        let written = manager
            .set_error(
                &workspace,
                &WorkspaceStatus::default(),
                "ApiFailure",
                "boom",
                &tracked,
            )
            .await
            .unwrap();
        assert_eq!(written.phase, WorkspacePhase::Error);
        assert_eq!(written.access_resources, tracked);
    }
}
