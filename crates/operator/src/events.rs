//! Lifecycle event publishing.
//!
//! Events are observability signals, not control inputs: publication
//! failures are logged and swallowed so they never perturb reconciliation.

use async_trait::async_trait;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};
use tracing::warn;

use crate::crd::Workspace;

/// Event reasons emitted by the reconcilers.
pub mod reasons {
    pub const RUNNING: &str = "WorkspaceRunning";
    pub const STOPPED: &str = "WorkspaceStopped";
    pub const PREEMPTED: &str = "WorkspacePreempted";
    pub const IDLE_SHUTDOWN: &str = "IdleShutdown";
    pub const VALIDATION_FAILED: &str = "TemplateValidationFailed";
    pub const COMPLIANT: &str = "TemplateCompliant";
    pub const NON_COMPLIANT: &str = "TemplateNonCompliant";
}

/// Event actions emitted by the reconcilers.
pub mod actions {
    pub const RECONCILING: &str = "Reconciling";
    pub const VALIDATING: &str = "Validating";
    pub const STOPPING: &str = "Stopping";
}

/// Publishes human-readable lifecycle events for a workspace.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(
        &self,
        workspace: &Workspace,
        type_: EventType,
        reason: &str,
        action: &str,
        message: String,
    );
}

/// Publisher backed by the Kubernetes events API.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    pub fn new(client: Client, controller: &str) -> Self {
        let reporter = Reporter {
            controller: controller.to_string(),
            instance: std::env::var("HOSTNAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        workspace: &Workspace,
        type_: EventType,
        reason: &str,
        action: &str,
        message: String,
    ) {
        let reference = workspace.object_ref(&());
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(message),
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, &reference).await {
            warn!(error = %e, reason, "failed to publish event");
        }
    }
}

/// Publisher that drops everything. Used in tests.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _workspace: &Workspace,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _message: String,
    ) {
    }
}
