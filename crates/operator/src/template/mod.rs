//! Template resolution: merging workspace overrides onto template defaults
//! and, on the validating path, checking every override against the bounds
//! the template declares.
//!
//! The merge and validation cores are pure functions over the two specs;
//! [`TemplateResolver`] adds the fetch and the label-indexed reverse lookup.

use std::sync::Arc;

use crate::client::WorkspaceClient;
use crate::crd::{
    EnvVarSpec, ResourceList, Workspace, WorkspaceResources, WorkspaceSpec, WorkspaceTemplateSpec,
};
use crate::error::{Error, Result};
use crate::idle::IdleShutdownConfig;
use crate::quantity;

/// Request-scoped product of merging one workspace's overrides onto its
/// template's defaults. Never persisted; recomputed every reconciliation.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedTemplate {
    pub template_name: String,
    pub image: String,
    pub resources: WorkspaceResources,
    pub storage_size: Option<String>,
    pub storage_class: Option<String>,
    pub environment: Vec<EnvVarSpec>,
    pub idle_shutdown: Option<IdleShutdownConfig>,
}

/// Category of a policy violation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViolationKind {
    ImageNotAllowed,
    ResourceExceeded,
    StorageExceeded,
    VolumesNotAllowed,
}

/// One bounds or allowlist violation, naming the offending field, the range
/// or set that is permitted, and the value actually supplied.
#[derive(Clone, Debug, PartialEq)]
pub struct TemplateViolation {
    pub kind: ViolationKind,
    pub field: String,
    pub message: String,
    pub allowed: String,
    pub actual: String,
}

/// Outcome of validating resolution. A resolved template is only ever
/// exposed when validation succeeded; the constructors enforce this.
#[derive(Clone, Debug)]
pub struct TemplateValidationResult {
    pub valid: bool,
    pub violations: Vec<TemplateViolation>,
    pub resolved: Option<ResolvedTemplate>,
}

impl TemplateValidationResult {
    fn valid(resolved: ResolvedTemplate) -> Self {
        Self {
            valid: true,
            violations: Vec::new(),
            resolved: Some(resolved),
        }
    }

    /// Trivially-valid result for a workspace without a template reference:
    /// the spec is used as-is.
    fn valid_without_template() -> Self {
        Self {
            valid: true,
            violations: Vec::new(),
            resolved: None,
        }
    }

    fn invalid(violations: Vec<TemplateViolation>) -> Self {
        Self {
            valid: false,
            violations,
            resolved: None,
        }
    }

    /// One-line summary of every violation, for conditions and events.
    pub fn summary(&self) -> String {
        self.violations
            .iter()
            .map(|v| format!("{}: {} (allowed {}, got {})", v.field, v.message, v.allowed, v.actual))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Fetching front-end over the pure merge/validation core.
#[derive(Clone)]
pub struct TemplateResolver {
    client: Arc<dyn WorkspaceClient>,
}

impl TemplateResolver {
    pub fn new(client: Arc<dyn WorkspaceClient>) -> Self {
        Self { client }
    }

    /// Resolve and validate the workspace's configuration.
    ///
    /// Fetch failures and a template without a default image are system
    /// errors and propagate as [`Error`]; policy violations come back as
    /// data inside an invalid result.
    pub async fn validate_and_resolve(&self, workspace: &Workspace) -> Result<TemplateValidationResult> {
        let Some(template_name) = workspace.template_name() else {
            if workspace.spec.image.as_deref().map(str::trim).unwrap_or("").is_empty() {
                return Err(Error::MissingImage);
            }
            return Ok(TemplateValidationResult::valid_without_template());
        };

        let template = self.fetch_usable_template(template_name).await?;
        let (resolved, violations) = validate_spec(&workspace.spec, &template, template_name);
        if violations.is_empty() {
            Ok(TemplateValidationResult::valid(resolved))
        } else {
            Ok(TemplateValidationResult::invalid(violations))
        }
    }

    /// The non-validating twin: the identical merge without bounds checks.
    /// Used by paths that need the merged view of an already-admitted
    /// workspace without re-deriving validation results.
    pub async fn resolve(&self, workspace: &Workspace) -> Result<Option<ResolvedTemplate>> {
        let Some(template_name) = workspace.template_name() else {
            return Ok(None);
        };
        let template = self.fetch_usable_template(template_name).await?;
        Ok(Some(resolve_spec(&workspace.spec, &template, template_name)))
    }

    /// Workspaces currently depending on `template`: label-indexed lookup,
    /// excluding workspaces already marked for deletion and dropping entries
    /// whose spec reference no longer matches the label.
    pub async fn workspaces_using_template(&self, template: &str) -> Result<Vec<Workspace>> {
        let labeled = self.client.list_workspaces_by_template_label(template).await?;
        Ok(labeled
            .into_iter()
            .filter(|ws| ws.metadata.deletion_timestamp.is_none())
            .filter(|ws| ws.template_name() == Some(template))
            .collect())
    }

    async fn fetch_usable_template(&self, name: &str) -> Result<WorkspaceTemplateSpec> {
        let template = self
            .client
            .get_template(name)
            .await?
            .ok_or_else(|| Error::TemplateNotFound { name: name.to_string() })?;
        if template.spec.default_image.trim().is_empty() {
            return Err(Error::TemplateMissingDefaultImage { name: name.to_string() });
        }
        Ok(template.spec)
    }
}

/// Merge with every override applied and no checks performed.
pub fn resolve_spec(
    workspace: &WorkspaceSpec,
    template: &WorkspaceTemplateSpec,
    template_name: &str,
) -> ResolvedTemplate {
    let mut resolved = base_resolution(template, template_name);

    if let Some(image) = non_empty(&workspace.image) {
        resolved.image = image.to_string();
    }
    apply_resource_overrides(&mut resolved.resources, workspace.resources.as_ref(), |_| true);
    if let Some(size) = workspace.storage.as_ref().and_then(|s| s.size.clone()) {
        resolved.storage_size = Some(size);
    }
    if let Some(class) = workspace.storage.as_ref().and_then(|s| s.storage_class.clone()) {
        resolved.storage_class = Some(class);
    }
    apply_env_overrides(&mut resolved.environment, workspace);
    apply_idle_override(&mut resolved.idle_shutdown, template, workspace);

    resolved
}

/// Merge plus bounds validation. Violating overrides are reported and the
/// template default is left in place for that field; all violations are
/// accumulated so the caller can report every problem in one pass.
pub fn validate_spec(
    workspace: &WorkspaceSpec,
    template: &WorkspaceTemplateSpec,
    template_name: &str,
) -> (ResolvedTemplate, Vec<TemplateViolation>) {
    let mut resolved = base_resolution(template, template_name);
    let mut violations = Vec::new();

    // Image allowlist, with the default implicitly permitted when the list
    // is empty.
    if let Some(image) = non_empty(&workspace.image) {
        let allowlist = template.effective_allowlist();
        if allowlist.iter().any(|a| a == image) {
            resolved.image = image.to_string();
        } else {
            violations.push(TemplateViolation {
                kind: ViolationKind::ImageNotAllowed,
                field: "spec.image".to_string(),
                message: "image is not in the template allowlist".to_string(),
                allowed: format!("{:?}", allowlist),
                actual: image.to_string(),
            });
        }
    }

    let resource_violations = check_resources(workspace.resources.as_ref(), template);
    let violating_types: Vec<&'static str> = resource_violations.iter().map(|(t, _)| *t).collect();
    violations.extend(resource_violations.into_iter().map(|(_, v)| v));
    apply_resource_overrides(&mut resolved.resources, workspace.resources.as_ref(), |t| {
        !violating_types.contains(&t)
    });

    // Storage size: a missing or non-numeric size is "no override
    // requested", never a violation.
    if let Some(size) = workspace.storage.as_ref().and_then(|s| s.size.as_deref()) {
        if quantity::parse(size).is_some() {
            match check_storage(size, template) {
                Some(violation) => violations.push(violation),
                None => resolved.storage_size = Some(size.to_string()),
            }
        }
    }
    if let Some(class) = workspace.storage.as_ref().and_then(|s| s.storage_class.clone()) {
        resolved.storage_class = Some(class);
    }

    if !workspace.volumes.is_empty() && !template.allow_secondary_storages {
        violations.push(TemplateViolation {
            kind: ViolationKind::VolumesNotAllowed,
            field: "spec.volumes".to_string(),
            message: "template does not allow secondary storages".to_string(),
            allowed: "no secondary volumes".to_string(),
            actual: format!("{} volume(s)", workspace.volumes.len()),
        });
    }

    apply_env_overrides(&mut resolved.environment, workspace);
    apply_idle_override(&mut resolved.idle_shutdown, template, workspace);

    (resolved, violations)
}

/// The effective idle-shutdown configuration for a workspace: the resolved
/// template policy when one exists, otherwise the workspace's own spec.
pub fn effective_idle_config(
    spec: &WorkspaceSpec,
    resolved: Option<&ResolvedTemplate>,
) -> Option<IdleShutdownConfig> {
    match resolved {
        Some(resolved) => resolved.idle_shutdown.clone(),
        None => spec.idle_shutdown.as_ref().map(|override_| IdleShutdownConfig {
            enabled: override_.enabled.unwrap_or(false),
            timeout_seconds: override_.timeout_seconds.unwrap_or(IdleShutdownConfig::DEFAULT_TIMEOUT_SECONDS),
            detection: override_.detection.clone().unwrap_or_else(IdleShutdownConfig::default_detection),
        }),
    }
}

fn base_resolution(template: &WorkspaceTemplateSpec, template_name: &str) -> ResolvedTemplate {
    ResolvedTemplate {
        template_name: template_name.to_string(),
        image: template.default_image.clone(),
        resources: template.default_resources.clone().unwrap_or_default(),
        storage_size: template.primary_storage.as_ref().and_then(|s| s.default_size.clone()),
        storage_class: template.primary_storage.as_ref().and_then(|s| s.storage_class.clone()),
        environment: template.environment_variables.clone(),
        idle_shutdown: template.idle_shutdown.as_ref().map(|policy| IdleShutdownConfig {
            enabled: policy.enabled,
            timeout_seconds: policy.timeout_seconds,
            detection: policy
                .detection
                .clone()
                .unwrap_or_else(IdleShutdownConfig::default_detection),
        }),
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

const RESOURCE_TYPES: [&str; 3] = ["cpu", "memory", "gpu"];

fn list_entry<'a>(list: Option<&'a ResourceList>, type_: &str) -> Option<&'a String> {
    let list = list?;
    match type_ {
        "cpu" => list.cpu.as_ref(),
        "memory" => list.memory.as_ref(),
        "gpu" => list.gpu.as_ref(),
        _ => None,
    }
}

fn set_entry(list: &mut ResourceList, type_: &str, value: String) {
    match type_ {
        "cpu" => list.cpu = Some(value),
        "memory" => list.memory = Some(value),
        "gpu" => list.gpu = Some(value),
        _ => {}
    }
}

/// Apply request/limit overrides per resource type, skipping any type the
/// predicate rejects (the validating path withholds violating types so the
/// template defaults stay in place).
fn apply_resource_overrides(
    target: &mut WorkspaceResources,
    overrides: Option<&WorkspaceResources>,
    mut accept: impl FnMut(&'static str) -> bool,
) {
    let Some(overrides) = overrides else { return };
    for type_ in RESOURCE_TYPES {
        if !accept(type_) {
            continue;
        }
        if let Some(request) = list_entry(overrides.requests.as_ref(), type_) {
            set_entry(target.requests.get_or_insert_with(Default::default), type_, request.clone());
        }
        if let Some(limit) = list_entry(overrides.limits.as_ref(), type_) {
            set_entry(target.limits.get_or_insert_with(Default::default), type_, limit.clone());
        }
    }
}

/// Bounds and limit/request coherence checks, tagged with the resource type
/// that produced each violation.
fn check_resources(
    overrides: Option<&WorkspaceResources>,
    template: &WorkspaceTemplateSpec,
) -> Vec<(&'static str, TemplateViolation)> {
    let mut violations = Vec::new();
    let Some(overrides) = overrides else {
        return violations;
    };

    for type_ in RESOURCE_TYPES {
        let request = list_entry(overrides.requests.as_ref(), type_);
        let limit = list_entry(overrides.limits.as_ref(), type_);

        // limit >= request is enforced independently of bounds.
        if let (Some(request), Some(limit)) = (request, limit) {
            if quantity::less_than(limit, request) == Some(true) {
                violations.push((
                    type_,
                    TemplateViolation {
                        kind: ViolationKind::ResourceExceeded,
                        field: format!("spec.resources.limits.{}", type_),
                        message: format!("{} limit is below the request", type_),
                        allowed: format!("limit >= request ({})", request),
                        actual: limit.clone(),
                    },
                ));
            }
        }

        let Some(request) = request else { continue };
        let bounds = template.resource_bounds.as_ref().and_then(|b| match type_ {
            "cpu" => b.cpu.as_ref(),
            "memory" => b.memory.as_ref(),
            "gpu" => b.gpu.as_ref(),
            _ => None,
        });
        let Some(bounds) = bounds else { continue };

        if let Some(min) = bounds.min.as_deref() {
            if quantity::less_than(request, min) == Some(true) {
                violations.push((
                    type_,
                    TemplateViolation {
                        kind: ViolationKind::ResourceExceeded,
                        field: format!("spec.resources.requests.{}", type_),
                        message: format!("{} request is below the template minimum", type_),
                        allowed: format!("min: {}", min),
                        actual: request.clone(),
                    },
                ));
            }
        }
        if let Some(max) = bounds.max.as_deref() {
            if quantity::greater_than(request, max) == Some(true) {
                violations.push((
                    type_,
                    TemplateViolation {
                        kind: ViolationKind::ResourceExceeded,
                        field: format!("spec.resources.requests.{}", type_),
                        message: format!("{} request exceeds the template maximum", type_),
                        allowed: format!("max: {}", max),
                        actual: request.clone(),
                    },
                ));
            }
        }
    }

    violations
}

fn check_storage(size: &str, template: &WorkspaceTemplateSpec) -> Option<TemplateViolation> {
    let policy = template.primary_storage.as_ref()?;
    if let Some(min) = policy.min_size.as_deref() {
        if quantity::less_than(size, min) == Some(true) {
            return Some(TemplateViolation {
                kind: ViolationKind::StorageExceeded,
                field: "spec.storage.size".to_string(),
                message: "storage size is below the template minimum".to_string(),
                allowed: format!("min: {}", min),
                actual: size.to_string(),
            });
        }
    }
    if let Some(max) = policy.max_size.as_deref() {
        if quantity::greater_than(size, max) == Some(true) {
            return Some(TemplateViolation {
                kind: ViolationKind::StorageExceeded,
                field: "spec.storage.size".to_string(),
                message: "storage size exceeds the template maximum".to_string(),
                allowed: format!("max: {}", max),
                actual: size.to_string(),
            });
        }
    }
    None
}

/// Template environment first, workspace entries overriding by name.
fn apply_env_overrides(environment: &mut Vec<EnvVarSpec>, workspace: &WorkspaceSpec) {
    let Some(container) = workspace.container.as_ref() else { return };
    for override_ in &container.env {
        match environment.iter_mut().find(|e| e.name == override_.name) {
            Some(existing) => existing.value = override_.value.clone(),
            None => environment.push(override_.clone()),
        }
    }
}

fn apply_idle_override(
    target: &mut Option<IdleShutdownConfig>,
    template: &WorkspaceTemplateSpec,
    workspace: &WorkspaceSpec,
) {
    let override_allowed = template
        .idle_shutdown
        .as_ref()
        .map(|p| p.override_allowed)
        .unwrap_or(true);
    if !override_allowed {
        return;
    }
    let Some(override_) = workspace.idle_shutdown.as_ref() else { return };

    let config = target.get_or_insert_with(|| IdleShutdownConfig {
        enabled: false,
        timeout_seconds: IdleShutdownConfig::DEFAULT_TIMEOUT_SECONDS,
        detection: IdleShutdownConfig::default_detection(),
    });
    if let Some(enabled) = override_.enabled {
        config.enabled = enabled;
    }
    if let Some(timeout) = override_.timeout_seconds {
        config.timeout_seconds = timeout;
    }
    if let Some(detection) = override_.detection.clone() {
        config.detection = detection;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockWorkspaceClient;
    use crate::crd::{
        IdleShutdownSpec, QuantityRange, ResourceBounds, SecondaryVolume, StoragePolicy,
        TemplateIdlePolicy, WorkspaceStorage,
    };
    use crate::testing::{template_named, workspace_with_uid};

    fn template(default_image: &str) -> WorkspaceTemplateSpec {
        serde_json::from_value(serde_json::json!({ "defaultImage": default_image })).unwrap()
    }

    fn workspace_spec() -> WorkspaceSpec {
        serde_json::from_str("{}").unwrap()
    }

    fn requests(cpu: &str) -> WorkspaceResources {
        WorkspaceResources {
            requests: Some(ResourceList {
                cpu: Some(cpu.to_string()),
                ..Default::default()
            }),
            limits: None,
        }
    }

    #[test]
    fn image_outside_allowlist_is_a_single_violation() {
        // Template allows exactly img:v1; the workspace asks for img:v2.
        let mut tpl = template("img:v1");
        tpl.allowed_images = vec!["img:v1".to_string()];
        let mut ws = workspace_spec();
        ws.image = Some("img:v2".to_string());

        let (resolved, violations) = validate_spec(&ws, &tpl, "t");
        assert_eq!(violations.len(), 1);
        let violation = &violations[0];
        assert_eq!(violation.kind, ViolationKind::ImageNotAllowed);
        assert_eq!(violation.field, "spec.image");
        assert_eq!(violation.allowed, r#"["img:v1"]"#);
        assert_eq!(violation.actual, "img:v2");
        // The default stays in place for the violating field.
        assert_eq!(resolved.image, "img:v1");
    }

    #[test]
    fn empty_allowlist_admits_the_default_image_override() {
        let tpl = template("img:v1");
        let mut ws = workspace_spec();
        ws.image = Some("img:v1".to_string());
        let (resolved, violations) = validate_spec(&ws, &tpl, "t");
        assert!(violations.is_empty());
        assert_eq!(resolved.image, "img:v1");
    }

    #[test]
    fn cpu_request_above_template_max_is_reported_with_the_bound() {
        let mut tpl = template("img:v1");
        tpl.resource_bounds = Some(ResourceBounds {
            cpu: Some(QuantityRange {
                min: Some("50m".to_string()),
                max: Some("2".to_string()),
            }),
            ..Default::default()
        });
        let mut ws = workspace_spec();
        ws.resources = Some(requests("5"));

        let (_, violations) = validate_spec(&ws, &tpl, "t");
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].kind, ViolationKind::ResourceExceeded);
        assert_eq!(violations[0].field, "spec.resources.requests.cpu");
        assert_eq!(violations[0].allowed, "max: 2");
        assert_eq!(violations[0].actual, "5");
    }

    #[test]
    fn cpu_request_below_template_min_is_reported() {
        let mut tpl = template("img:v1");
        tpl.resource_bounds = Some(ResourceBounds {
            cpu: Some(QuantityRange {
                min: Some("50m".to_string()),
                max: Some("2".to_string()),
            }),
            ..Default::default()
        });
        let mut ws = workspace_spec();
        ws.resources = Some(requests("10m"));

        let (_, violations) = validate_spec(&ws, &tpl, "t");
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].allowed, "min: 50m");
    }

    #[test]
    fn limit_below_request_violates_independent_of_bounds() {
        let tpl = template("img:v1");
        let mut ws = workspace_spec();
        ws.resources = Some(WorkspaceResources {
            requests: Some(ResourceList {
                memory: Some("2Gi".to_string()),
                ..Default::default()
            }),
            limits: Some(ResourceList {
                memory: Some("1Gi".to_string()),
                ..Default::default()
            }),
        });

        let (_, violations) = validate_spec(&ws, &tpl, "t");
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].field, "spec.resources.limits.memory");
        assert_eq!(violations[0].actual, "1Gi");
    }

    #[test]
    fn violations_are_accumulated_not_short_circuited() {
        let mut tpl = template("img:v1");
        tpl.allowed_images = vec!["img:v1".to_string()];
        tpl.resource_bounds = Some(ResourceBounds {
            cpu: Some(QuantityRange {
                min: None,
                max: Some("2".to_string()),
            }),
            ..Default::default()
        });
        let mut ws = workspace_spec();
        ws.image = Some("img:v2".to_string());
        ws.resources = Some(requests("5"));

        let (_, violations) = validate_spec(&ws, &tpl, "t");
        assert_eq!(violations.len(), 2);
    }

    #[test]
    fn storage_override_outside_bounds_is_a_violation() {
        let mut tpl = template("img:v1");
        tpl.primary_storage = Some(StoragePolicy {
            default_size: Some("10Gi".to_string()),
            min_size: Some("1Gi".to_string()),
            max_size: Some("100Gi".to_string()),
            storage_class: None,
        });
        let mut ws = workspace_spec();
        ws.storage = Some(WorkspaceStorage {
            size: Some("200Gi".to_string()),
            storage_class: None,
        });

        let (resolved, violations) = validate_spec(&ws, &tpl, "t");
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].kind, ViolationKind::StorageExceeded);
        // Default stays in place for the violating override.
        assert_eq!(resolved.storage_size.as_deref(), Some("10Gi"));
    }

    #[test]
    fn non_numeric_storage_size_is_no_override_not_a_violation() {
        let mut tpl = template("img:v1");
        tpl.primary_storage = Some(StoragePolicy {
            default_size: Some("10Gi".to_string()),
            min_size: Some("1Gi".to_string()),
            max_size: Some("100Gi".to_string()),
            storage_class: None,
        });
        let mut ws = workspace_spec();
        ws.storage = Some(WorkspaceStorage {
            size: Some("plenty".to_string()),
            storage_class: None,
        });

        let (resolved, violations) = validate_spec(&ws, &tpl, "t");
        assert!(violations.is_empty());
        assert_eq!(resolved.storage_size.as_deref(), Some("10Gi"));
    }

    #[test]
    fn secondary_volumes_require_template_permission() {
        let tpl = template("img:v1");
        let mut ws = workspace_spec();
        ws.volumes = vec![SecondaryVolume {
            name: "scratch".to_string(),
            size: "5Gi".to_string(),
            mount_path: "/scratch".to_string(),
            storage_class: None,
        }];

        let (_, violations) = validate_spec(&ws, &tpl, "t");
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].kind, ViolationKind::VolumesNotAllowed);
    }

    #[test]
    fn plain_resolve_applies_out_of_bounds_overrides_without_error() {
        // The non-validating merge must return a result on the same inputs
        // that the validator rejects.
        let mut tpl = template("img:v1");
        tpl.resource_bounds = Some(ResourceBounds {
            cpu: Some(QuantityRange {
                min: None,
                max: Some("2".to_string()),
            }),
            ..Default::default()
        });
        let mut ws = workspace_spec();
        ws.resources = Some(requests("5"));

        let resolved = resolve_spec(&ws, &tpl, "t");
        assert_eq!(
            resolved.resources.requests.as_ref().and_then(|r| r.cpu.as_deref()),
            Some("5")
        );

        let (validated, violations) = validate_spec(&ws, &tpl, "t");
        assert!(!violations.is_empty());
        // The validating path keeps the default in place instead.
        assert_eq!(
            validated.resources.requests.as_ref().and_then(|r| r.cpu.as_deref()),
            None
        );
    }

    #[test]
    fn workspace_idle_override_is_ignored_unless_allowed() {
        let mut tpl = template("img:v1");
        tpl.idle_shutdown = Some(TemplateIdlePolicy {
            enabled: true,
            timeout_seconds: 3600,
            detection: None,
            override_allowed: false,
        });
        let mut ws = workspace_spec();
        ws.idle_shutdown = Some(IdleShutdownSpec {
            enabled: Some(false),
            timeout_seconds: Some(60),
            detection: None,
        });

        let resolved = resolve_spec(&ws, &tpl, "t");
        let idle = resolved.idle_shutdown.unwrap();
        assert!(idle.enabled);
        assert_eq!(idle.timeout_seconds, 3600);
    }

    #[test]
    fn workspace_idle_override_applies_when_allowed() {
        let mut tpl = template("img:v1");
        tpl.idle_shutdown = Some(TemplateIdlePolicy {
            enabled: true,
            timeout_seconds: 3600,
            detection: None,
            override_allowed: true,
        });
        let mut ws = workspace_spec();
        ws.idle_shutdown = Some(IdleShutdownSpec {
            enabled: None,
            timeout_seconds: Some(1800),
            detection: None,
        });

        let resolved = resolve_spec(&ws, &tpl, "t");
        let idle = resolved.idle_shutdown.unwrap();
        assert!(idle.enabled);
        assert_eq!(idle.timeout_seconds, 1800);
    }

    #[tokio::test]
    async fn workspace_without_template_or_image_is_a_system_error() {
        // Not a violation: nothing can be resolved at all.
        let resolver = TemplateResolver::new(Arc::new(MockWorkspaceClient::new()));
        let workspace = workspace_with_uid("alice-dev", "team-a");
        let err = resolver.validate_and_resolve(&workspace).await.unwrap_err();
        assert!(matches!(err, Error::MissingImage));
    }

    #[tokio::test]
    async fn workspace_without_template_resolves_to_spec_as_is() {
        let resolver = TemplateResolver::new(Arc::new(MockWorkspaceClient::new()));
        let mut workspace = workspace_with_uid("alice-dev", "team-a");
        workspace.spec.image = Some("img:v1".to_string());

        let result = resolver.validate_and_resolve(&workspace).await.unwrap();
        assert!(result.valid);
        assert!(result.resolved.is_none());
    }

    #[tokio::test]
    async fn missing_template_propagates_as_a_system_error() {
        let mut client = MockWorkspaceClient::new();
        client.expect_get_template().returning(|_| Ok(None));
        let resolver = TemplateResolver::new(Arc::new(client));

        let mut workspace = workspace_with_uid("alice-dev", "team-a");
        workspace.spec.template_ref = Some(crate::crd::TemplateRef {
            name: "small".to_string(),
        });

        let err = resolver.validate_and_resolve(&workspace).await.unwrap_err();
        assert!(matches!(err, Error::TemplateNotFound { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn template_without_default_image_is_a_config_error() {
        let mut client = MockWorkspaceClient::new();
        client
            .expect_get_template()
            .returning(|_| Ok(Some(template_named("small", ""))));
        let resolver = TemplateResolver::new(Arc::new(client));

        let mut workspace = workspace_with_uid("alice-dev", "team-a");
        workspace.spec.template_ref = Some(crate::crd::TemplateRef {
            name: "small".to_string(),
        });

        let err = resolver.validate_and_resolve(&workspace).await.unwrap_err();
        assert!(matches!(err, Error::TemplateMissingDefaultImage { .. }));
    }

    #[tokio::test]
    async fn valid_resolution_always_carries_the_resolved_template() {
        let mut client = MockWorkspaceClient::new();
        client
            .expect_get_template()
            .returning(|_| Ok(Some(template_named("small", "img:v1"))));
        let resolver = TemplateResolver::new(Arc::new(client));

        let mut workspace = workspace_with_uid("alice-dev", "team-a");
        workspace.spec.template_ref = Some(crate::crd::TemplateRef {
            name: "small".to_string(),
        });

        let result = resolver.validate_and_resolve(&workspace).await.unwrap();
        assert!(result.valid);
        let resolved = result.resolved.expect("valid result must carry a resolution");
        assert_eq!(resolved.image, "img:v1");
    }

    #[tokio::test]
    async fn reverse_lookup_filters_deleting_and_skewed_workspaces() {
        let mut client = MockWorkspaceClient::new();
        client.expect_list_workspaces_by_template_label().returning(|_| {
            let live = {
                let mut ws = workspace_with_uid("live", "team-a");
                ws.spec.template_ref = Some(crate::crd::TemplateRef {
                    name: "small".to_string(),
                });
                ws
            };
            let deleting = {
                let mut ws = workspace_with_uid("deleting", "team-a");
                ws.spec.template_ref = Some(crate::crd::TemplateRef {
                    name: "small".to_string(),
                });
                ws.metadata.deletion_timestamp =
                    Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                        chrono::Utc::now(),
                    ));
                ws
            };
            let skewed = {
                // Labeled for "small" but the spec moved on.
                let mut ws = workspace_with_uid("skewed", "team-a");
                ws.spec.template_ref = Some(crate::crd::TemplateRef {
                    name: "large".to_string(),
                });
                ws
            };
            Ok(vec![live, deleting, skewed])
        });
        let resolver = TemplateResolver::new(Arc::new(client));

        let users = resolver.workspaces_using_template("small").await.unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].metadata.name.as_deref(), Some("live"));
    }

    #[test]
    fn template_env_is_overlaid_by_workspace_entries() {
        let mut tpl = template("img:v1");
        tpl.environment_variables = vec![
            EnvVarSpec {
                name: "SHELL".to_string(),
                value: "/bin/bash".to_string(),
            },
            EnvVarSpec {
                name: "TZ".to_string(),
                value: "UTC".to_string(),
            },
        ];
        let mut ws = workspace_spec();
        ws.container = Some(crate::crd::ContainerConfig {
            command: None,
            args: None,
            env: vec![EnvVarSpec {
                name: "TZ".to_string(),
                value: "Europe/Madrid".to_string(),
            }],
        });

        let resolved = resolve_spec(&ws, &tpl, "t");
        assert_eq!(resolved.environment.len(), 2);
        assert_eq!(
            resolved.environment.iter().find(|e| e.name == "TZ").unwrap().value,
            "Europe/Madrid"
        );
    }
}
