//! Manage-agent loop: keeps a fleet-agent Bundle in every namespace with clusters
//!
//! The agent Bundle targets every cluster in its namespace and installs into
//! the agent namespace. It exists only while the published controller
//! configuration asks for managed agents, so a configuration change
//! re-reconciles every namespace.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::DynamicObject;
use kube::runtime::controller::Action;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::Controller;
use kube::{Api, ResourceExt};
use tracing::debug;

use fleet_common::crd::{Bundle, BundleSpec, BundleTarget, Cluster};
use fleet_common::kube_utils::to_dynamic;
use fleet_common::{Error, MANAGED_LABEL};

use super::{error_policy, log_reconcile_result, watcher_config, ReconcileError, WAIT_REQUEUE};
use crate::apply::Applier;
use crate::config::ConfigHandle;
use crate::informer::LoopInstaller;

/// Loop name
pub const NAME: &str = "manage-agent";

/// Prefix of every agent Bundle name
pub const AGENT_NAME: &str = "fleet-agent";

/// What the manage-agent loop may touch
pub struct ManageAgentView {
    /// Scoped to Bundle
    pub applier: Applier,
    /// Every Namespace
    pub namespaces: Api<Namespace>,
    /// Cached Clusters
    pub clusters: Store<Cluster>,
    /// Published controller configuration
    pub config: ConfigHandle,
    /// Namespace agents are installed into on downstream clusters
    pub agent_namespace: String,
    /// Core factory installer
    pub installer: LoopInstaller,
}

struct Context {
    applier: Applier,
    clusters: Store<Cluster>,
    config: ConfigHandle,
    agent_namespace: String,
}

/// Install the loop
pub async fn register(view: ManageAgentView) -> Result<(), Error> {
    let clusters: Api<Cluster> = Api::all(view.namespaces.clone().into_client());
    let config_changes = futures::stream::unfold(view.config.subscribe(), |mut rx| async move {
        rx.changed().await.ok().map(|_| ((), rx))
    });
    let ctx = Arc::new(Context {
        applier: view.applier,
        clusters: view.clusters,
        config: view.config,
        agent_namespace: view.agent_namespace,
    });

    view.installer.install(
        NAME,
        Controller::new(view.namespaces, watcher_config())
            .watches(clusters, watcher_config(), |cluster| {
                cluster
                    .namespace()
                    .map(|ns| ObjectRef::<Namespace>::new(&ns))
            })
            .reconcile_all_on(config_changes)
            .run(reconcile, error_policy, ctx)
            .for_each(log_reconcile_result("ManageAgent")),
    );
    Ok(())
}

/// Name of the agent Bundle in namespace `ns`
pub fn agent_bundle_name(ns: &str) -> String {
    format!("{AGENT_NAME}-{ns}")
}

async fn reconcile(ns: Arc<Namespace>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    let name = ns.name_any();
    let Some(config) = ctx.config.current() else {
        debug!(namespace = %name, "no controller config published yet");
        return Ok(Action::requeue(WAIT_REQUEUE));
    };

    let has_clusters = ctx
        .clusters
        .state()
        .iter()
        .any(|c| c.namespace().as_deref() == Some(name.as_str()));
    let objects = if has_clusters && config.manage_agent {
        vec![agent_bundle(&name, &ctx.agent_namespace)?]
    } else {
        Vec::new()
    };

    ctx.applier.apply(&format!("{NAME}-{name}"), objects).await?;
    Ok(Action::await_change())
}

fn agent_bundle(namespace: &str, agent_namespace: &str) -> Result<DynamicObject, ReconcileError> {
    let mut bundle = Bundle::new(
        &agent_bundle_name(namespace),
        BundleSpec {
            default_namespace: Some(agent_namespace.to_string()),
            targets: vec![BundleTarget {
                name: Some("all".to_string()),
                cluster_selector: Some(LabelSelector::default()),
                ..Default::default()
            }],
            ..Default::default()
        },
    );
    bundle.metadata.namespace = Some(namespace.to_string());
    bundle.metadata.labels = Some(BTreeMap::from([(
        MANAGED_LABEL.to_string(),
        "true".to_string(),
    )]));
    Ok(to_dynamic(&bundle)?)
}
