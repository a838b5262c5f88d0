//! Custom resource definitions for the Atelier API group.

pub mod access_strategy;
pub mod template;
pub mod workspace;

pub use access_strategy::{
    AccessResourceTemplate, WorkspaceAccessStrategy, WorkspaceAccessStrategySpec,
};
pub use template::{
    EnvVarSpec, QuantityRange, ResourceBounds, StoragePolicy, TemplateIdlePolicy,
    WorkspaceTemplate, WorkspaceTemplateSpec, WorkspaceTemplateStatus,
};
pub use workspace::{
    AccessResourceStatus, AccessStrategyRef, ConditionStatus, ContainerConfig, DesiredStatus,
    IdleDetection, IdleShutdownSpec, ResourceList, SecondaryVolume, TemplateRef, Workspace,
    WorkspaceCondition, WorkspacePhase, WorkspaceResources, WorkspaceSpec, WorkspaceStatus,
    WorkspaceStorage,
};

/// API group shared by all Atelier resources.
pub const API_GROUP: &str = "atelier.dev";

/// Label mirroring the workspace's template reference, used for reverse
/// lookup from a template to the workspaces consuming it.
pub const TEMPLATE_LABEL: &str = "atelier.dev/template";

/// Label marking a workspace for an asynchronous compliance recheck after
/// its template's bounds or policy changed.
pub const RECHECK_LABEL: &str = "atelier.dev/recheck-template";

/// Label applied to every child resource, keyed by the owning workspace name.
pub const WORKSPACE_NAME_LABEL: &str = "atelier.dev/workspace";

/// Label identifying resources managed by this operator.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value for [`MANAGED_BY_LABEL`].
pub const MANAGED_BY: &str = "atelier-operator";

/// Annotation carrying the reason a workspace was asked to stop. Used only
/// to phrase lifecycle events.
pub const STOP_REASON_ANNOTATION: &str = "atelier.dev/stop-reason";

/// [`STOP_REASON_ANNOTATION`] value written by the preemption path.
pub const STOP_REASON_PREEMPTION: &str = "preemption";

/// Finalizer on a Workspace: teardown must observe every owned and access
/// resource gone before the object may be purged.
pub const WORKSPACE_FINALIZER: &str = "atelier.dev/teardown-protection";

/// Finalizer on a WorkspaceTemplate while any live workspace references it.
pub const TEMPLATE_FINALIZER: &str = "atelier.dev/template-in-use";
