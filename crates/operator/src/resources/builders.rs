//! Manifest builders: map a workspace plus its resolved template onto
//! concrete child-resource payloads.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec, Service, ServicePort, ServiceSpec,
    Volume, VolumeMount, VolumeResourceRequirements,
    ResourceRequirements as K8sResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};

use crate::config::EndpointType;
use crate::crd::{ResourceList, Workspace, MANAGED_BY, MANAGED_BY_LABEL, WORKSPACE_NAME_LABEL};
use crate::error::{Error, Result};
use crate::template::ResolvedTemplate;

/// Port the workspace process listens on.
pub const WORKSPACE_PORT: i32 = 8888;

/// Mount point of the primary storage volume.
const PRIMARY_MOUNT_PATH: &str = "/home/workspace";

pub fn deployment_name(workspace: &Workspace) -> String {
    workspace.name_any()
}

pub fn service_name(workspace: &Workspace) -> String {
    workspace.name_any()
}

pub fn volume_claim_name(workspace: &Workspace) -> String {
    format!("{}-home", workspace.name_any())
}

pub fn secondary_claim_name(workspace: &Workspace, volume: &str) -> String {
    format!("{}-{}", workspace.name_any(), volume)
}

/// Labels shared by every child resource of a workspace. They double as the
/// pod selector.
pub fn child_labels(workspace: &Workspace) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(WORKSPACE_NAME_LABEL.to_string(), workspace.name_any());
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string());
    labels
}

fn owner_reference(workspace: &Workspace) -> Result<OwnerReference> {
    workspace
        .controller_owner_ref(&())
        .ok_or_else(|| Error::Infrastructure {
            message: format!("workspace {} has no uid yet", workspace.name_any()),
        })
}

fn child_metadata(workspace: &Workspace, name: String) -> Result<ObjectMeta> {
    Ok(ObjectMeta {
        name: Some(name),
        namespace: workspace.namespace(),
        labels: Some(child_labels(workspace)),
        owner_references: Some(vec![owner_reference(workspace)?]),
        ..Default::default()
    })
}

/// Effective image: the resolved template's, or the workspace's own when no
/// template is referenced. Validation guarantees one of them is set.
fn effective_image(workspace: &Workspace, resolved: Option<&ResolvedTemplate>) -> Result<String> {
    resolved
        .map(|r| r.image.clone())
        .or_else(|| workspace.spec.image.clone())
        .filter(|image| !image.trim().is_empty())
        .ok_or(Error::MissingImage)
}

fn quantities(list: &ResourceList) -> BTreeMap<String, Quantity> {
    let mut map = BTreeMap::new();
    if let Some(cpu) = &list.cpu {
        map.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = &list.memory {
        map.insert("memory".to_string(), Quantity(memory.clone()));
    }
    if let Some(gpu) = &list.gpu {
        map.insert("nvidia.com/gpu".to_string(), Quantity(gpu.clone()));
    }
    map
}

fn container_resources(
    workspace: &Workspace,
    resolved: Option<&ResolvedTemplate>,
) -> Option<K8sResourceRequirements> {
    let merged = resolved
        .map(|r| r.resources.clone())
        .or_else(|| workspace.spec.resources.clone())?;
    Some(K8sResourceRequirements {
        requests: merged.requests.as_ref().map(quantities),
        limits: merged.limits.as_ref().map(quantities),
        ..Default::default()
    })
}

fn environment(workspace: &Workspace, resolved: Option<&ResolvedTemplate>) -> Option<Vec<EnvVar>> {
    let vars: Vec<EnvVar> = match resolved {
        Some(resolved) => resolved
            .environment
            .iter()
            .map(|e| EnvVar {
                name: e.name.clone(),
                value: Some(e.value.clone()),
                value_from: None,
            })
            .collect(),
        None => workspace
            .spec
            .container
            .as_ref()
            .map(|c| {
                c.env
                    .iter()
                    .map(|e| EnvVar {
                        name: e.name.clone(),
                        value: Some(e.value.clone()),
                        value_from: None,
                    })
                    .collect()
            })
            .unwrap_or_default(),
    };
    if vars.is_empty() { None } else { Some(vars) }
}

/// Whether any storage has been configured for this workspace.
pub fn storage_configured(workspace: &Workspace, resolved: Option<&ResolvedTemplate>) -> bool {
    resolved
        .map(|r| r.storage_size.is_some())
        .unwrap_or_else(|| {
            workspace
                .spec
                .storage
                .as_ref()
                .map(|s| s.size.is_some())
                .unwrap_or(false)
        })
}

/// Compute workload for a workspace.
pub fn build_deployment(
    workspace: &Workspace,
    resolved: Option<&ResolvedTemplate>,
) -> Result<Deployment> {
    let image = effective_image(workspace, resolved)?;
    let labels = child_labels(workspace);
    let container_config = workspace.spec.container.as_ref();

    let mut volumes = Vec::new();
    let mut mounts = Vec::new();
    if storage_configured(workspace, resolved) {
        volumes.push(Volume {
            name: "home".to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: volume_claim_name(workspace),
                read_only: None,
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: "home".to_string(),
            mount_path: PRIMARY_MOUNT_PATH.to_string(),
            ..Default::default()
        });
    }
    for volume in &workspace.spec.volumes {
        volumes.push(Volume {
            name: volume.name.clone(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: secondary_claim_name(workspace, &volume.name),
                read_only: None,
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: volume.name.clone(),
            mount_path: volume.mount_path.clone(),
            ..Default::default()
        });
    }

    let container = Container {
        name: "workspace".to_string(),
        image: Some(image),
        command: container_config.and_then(|c| c.command.clone()),
        args: container_config.and_then(|c| c.args.clone()),
        env: environment(workspace, resolved),
        ports: Some(vec![ContainerPort {
            container_port: WORKSPACE_PORT,
            name: Some("http".to_string()),
            ..Default::default()
        }]),
        resources: container_resources(workspace, resolved),
        volume_mounts: if mounts.is_empty() { None } else { Some(mounts) },
        ..Default::default()
    };

    Ok(Deployment {
        metadata: child_metadata(workspace, deployment_name(workspace))?,
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                match_expressions: None,
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    node_selector: workspace.spec.node_selector.clone(),
                    volumes: if volumes.is_empty() { None } else { Some(volumes) },
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    })
}

/// Network endpoint for a workspace.
pub fn build_service(workspace: &Workspace, endpoint_type: EndpointType) -> Result<Service> {
    Ok(Service {
        metadata: child_metadata(workspace, service_name(workspace))?,
        spec: Some(ServiceSpec {
            type_: Some(endpoint_type.as_str().to_string()),
            selector: Some(child_labels(workspace)),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: WORKSPACE_PORT,
                target_port: Some(IntOrString::Int(WORKSPACE_PORT)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    })
}

/// Primary storage claim. Callers must check [`storage_configured`] first.
pub fn build_volume_claim(
    workspace: &Workspace,
    resolved: Option<&ResolvedTemplate>,
) -> Result<PersistentVolumeClaim> {
    let size = resolved
        .and_then(|r| r.storage_size.clone())
        .or_else(|| workspace.spec.storage.as_ref().and_then(|s| s.size.clone()))
        .ok_or_else(|| Error::Infrastructure {
            message: "volume claim requested without a storage size".to_string(),
        })?;
    let storage_class = resolved
        .and_then(|r| r.storage_class.clone())
        .or_else(|| {
            workspace
                .spec
                .storage
                .as_ref()
                .and_then(|s| s.storage_class.clone())
        });

    build_claim(workspace, volume_claim_name(workspace), size, storage_class)
}

/// Claim for one secondary volume.
pub fn build_secondary_claim(
    workspace: &Workspace,
    volume: &crate::crd::SecondaryVolume,
) -> Result<PersistentVolumeClaim> {
    build_claim(
        workspace,
        secondary_claim_name(workspace, &volume.name),
        volume.size.clone(),
        volume.storage_class.clone(),
    )
}

fn build_claim(
    workspace: &Workspace,
    name: String,
    size: String,
    storage_class: Option<String>,
) -> Result<PersistentVolumeClaim> {
    let mut requests = BTreeMap::new();
    requests.insert("storage".to_string(), Quantity(size));

    Ok(PersistentVolumeClaim {
        metadata: child_metadata(workspace, name)?,
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: storage_class,
            resources: Some(VolumeResourceRequirements {
                requests: Some(requests),
                limits: None,
            }),
            ..Default::default()
        }),
        status: None,
    })
}
