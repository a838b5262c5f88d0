//! Atelier Operator - Main Entry Point

use std::sync::Arc;

use anyhow::{Context as AnyhowContext, Result};
use clap::{Parser, ValueEnum};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Service};
use kube::api::Api;
use kube::runtime::controller::Controller;
use kube::runtime::reflector::{self, ObjectRef};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, ResourceExt};
use tracing::{debug, info, level_filters::LevelFilter, warn};
use tracing_subscriber::EnvFilter;

use atelier_operator::client::KubeWorkspaceClient;
use atelier_operator::config::{EndpointType, Settings};
use atelier_operator::crd::{Workspace, WorkspaceTemplate};
use atelier_operator::events::KubeEventPublisher;
use atelier_operator::idle::IdleChecker;
use atelier_operator::reconcile::{
    error_policy, reconcile, reconcile_template, template_error_policy, Context, TemplateContext,
};
use atelier_operator::resources::ResourceManager;

/// Atelier Kubernetes Operator
#[derive(Parser, Debug)]
#[command(name = "atelier-operator")]
#[command(version = "0.1.0")]
#[command(about = "Kubernetes operator for Atelier workspaces", long_about = None)]
struct Args {
    /// Expose workspaces through LoadBalancer services instead of ClusterIP
    #[arg(long)]
    pub load_balancer: bool,

    /// Log level
    #[arg(long, value_enum, default_value = "info")]
    pub log_level: LogLevel,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = match args.log_level {
        LogLevel::Trace => LevelFilter::TRACE,
        LogLevel::Debug => LevelFilter::DEBUG,
        LogLevel::Info => LevelFilter::INFO,
        LogLevel::Warn => LevelFilter::WARN,
        LogLevel::Error => LevelFilter::ERROR,
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    let mut settings = Settings::from_env();
    if args.load_balancer {
        settings.endpoint_type = EndpointType::LoadBalancer;
    }

    info!("Starting Atelier Operator");
    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    info!("Connected to Kubernetes");

    let workspace_client = Arc::new(KubeWorkspaceClient::new(
        client.clone(),
        settings.field_manager.clone(),
    ));
    let resources = Arc::new(ResourceManager::new(client.clone(), settings.clone()));
    let idle = Arc::new(IdleChecker::new(client.clone(), settings.probe_timeout));
    let events = Arc::new(KubeEventPublisher::new(
        client.clone(),
        "atelier-workspace-controller",
    ));

    let context = Arc::new(Context::new(
        workspace_client.clone(),
        resources,
        idle,
        events,
        settings.clone(),
    ));
    let template_context = Arc::new(TemplateContext::new(workspace_client, settings));

    let workspaces: Api<Workspace> = Api::all(client.clone());
    let templates: Api<WorkspaceTemplate> = Api::all(client.clone());
    let deployments: Api<Deployment> = Api::all(client.clone());
    let services: Api<Service> = Api::all(client.clone());
    let claims: Api<PersistentVolumeClaim> = Api::all(client.clone());

    // A template mutation must fan out to every workspace referencing it.
    // The mapper reads from a workspace reflector kept warm alongside the
    // controller.
    let (store, writer) = reflector::store::<Workspace>();
    let workspace_cache = reflector::reflector(
        writer,
        watcher(workspaces.clone(), watcher::Config::default()),
    );
    tokio::spawn(async move {
        let mut stream = workspace_cache.default_backoff().touched_objects().boxed();
        while let Some(next) = stream.next().await {
            if let Err(e) = next {
                warn!(error = %e, "workspace cache watch error");
            }
        }
    });

    let workspace_controller = Controller::new(workspaces, watcher::Config::default())
        .owns(deployments, watcher::Config::default())
        .owns(services, watcher::Config::default())
        .owns(claims, watcher::Config::default())
        .watches(
            templates.clone(),
            watcher::Config::default(),
            move |template: WorkspaceTemplate| {
                let name = template.name_any();
                store
                    .state()
                    .into_iter()
                    .filter(|ws| {
                        ws.spec
                            .template_ref
                            .as_ref()
                            .map(|r| r.name == name)
                            .unwrap_or(false)
                    })
                    .map(|ws| ObjectRef::from_obj(&*ws))
                    .collect::<Vec<_>>()
            },
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .for_each(|result| async move {
            match result {
                Ok((workspace, action)) => {
                    debug!(workspace = %workspace.name, ?action, "reconciled")
                }
                Err(e) => warn!(error = %e, "workspace reconciliation error"),
            }
        });
    info!("Workspace controller started");

    let template_controller = Controller::new(templates, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile_template, template_error_policy, template_context)
        .for_each(|result| async move {
            match result {
                Ok((template, action)) => {
                    debug!(template = %template.name, ?action, "reconciled")
                }
                Err(e) => warn!(error = %e, "template reconciliation error"),
            }
        });
    info!("Template controller started");

    tokio::join!(workspace_controller, template_controller);
    info!("Shutting down");
    Ok(())
}
