//! Bootstrap loop: registers the management cluster with itself
//!
//! Driven by the controller ConfigMap. Creates the bootstrap namespace, the
//! `local` Cluster, the `default` ClusterGroup and, when configured, a
//! bootstrap GitRepo. An empty bootstrap namespace removes everything the
//! loop created.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::DynamicObject;
use kube::runtime::controller::Action;
use kube::runtime::Controller;
use kube::{Api, ResourceExt};
use tracing::info;

use fleet_common::crd::{
    BundleTarget, Cluster, ClusterGroup, ClusterGroupSpec, ClusterSpec, GitRepo, GitRepoSpec,
};
use fleet_common::kube_utils::to_dynamic;
use fleet_common::Error;

use super::resources::namespace;
use super::{error_policy, log_reconcile_result, watcher_config, ReconcileError};
use crate::apply::Applier;
use crate::config::{FleetConfig, CONFIG_MAP_NAME};
use crate::informer::LoopInstaller;

/// Loop name
pub const NAME: &str = "bootstrap";

/// Object-set id for everything the loop creates
pub const SET_ID: &str = "fleet-bootstrap";

/// Name of the Cluster representing the management cluster
pub const LOCAL_CLUSTER: &str = "local";

/// Name of the ClusterGroup created in the bootstrap namespace
pub const DEFAULT_GROUP: &str = "default";

/// Name of the bootstrap GitRepo
pub const BOOTSTRAP_REPO: &str = "bootstrap";

/// What the bootstrap loop may touch
pub struct BootstrapView {
    /// Scoped to GitRepo, Cluster, ClusterGroup, Namespace, Secret
    pub applier: Applier,
    /// ConfigMaps in the system namespace
    pub config_maps: Api<ConfigMap>,
    /// Core factory installer
    pub installer: LoopInstaller,
}

struct Context {
    applier: Applier,
}

/// Install the loop
pub async fn register(view: BootstrapView) -> Result<(), Error> {
    let ctx = Arc::new(Context {
        applier: view.applier,
    });
    let cfg = watcher_config().fields(&format!("metadata.name={CONFIG_MAP_NAME}"));
    view.installer.install(
        NAME,
        Controller::new(view.config_maps, cfg)
            .run(reconcile, error_policy, ctx)
            .for_each(log_reconcile_result("Bootstrap")),
    );
    Ok(())
}

async fn reconcile(cm: Arc<ConfigMap>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    if cm.name_any() != CONFIG_MAP_NAME {
        return Ok(Action::await_change());
    }
    let config = FleetConfig::from_config_map(&cm)?;
    let report = ctx.applier.apply(SET_ID, desired_objects(&config)?).await?;
    info!(
        applied = report.applied.len(),
        pruned = report.pruned.len(),
        "bootstrap objects applied"
    );
    Ok(Action::await_change())
}

/// Split the configured bootstrap paths on commas and whitespace
fn split_paths(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

fn desired_objects(config: &FleetConfig) -> Result<Vec<DynamicObject>, ReconcileError> {
    let bootstrap = &config.bootstrap;
    if bootstrap.namespace.is_empty() {
        return Ok(Vec::new());
    }
    let ns = bootstrap.namespace.as_str();

    let mut objects = vec![namespace(ns, BTreeMap::new())?];

    let mut cluster = Cluster::new(
        LOCAL_CLUSTER,
        ClusterSpec {
            agent_namespace: Some(bootstrap.agent_namespace.clone()).filter(|n| !n.is_empty()),
            ..Default::default()
        },
    );
    cluster.metadata.namespace = Some(ns.to_string());
    cluster.metadata.labels = Some(BTreeMap::from([(
        "name".to_string(),
        LOCAL_CLUSTER.to_string(),
    )]));
    objects.push(to_dynamic(&cluster)?);

    let mut group = ClusterGroup::new(
        DEFAULT_GROUP,
        ClusterGroupSpec {
            selector: Some(LabelSelector::default()),
        },
    );
    group.metadata.namespace = Some(ns.to_string());
    objects.push(to_dynamic(&group)?);

    if !bootstrap.repo.is_empty() {
        let mut repo = GitRepo::new(
            BOOTSTRAP_REPO,
            GitRepoSpec {
                repo: bootstrap.repo.clone(),
                branch: Some(bootstrap.branch.clone()).filter(|b| !b.is_empty()),
                paths: split_paths(&bootstrap.paths),
                client_secret_name: Some(bootstrap.secret.clone()).filter(|s| !s.is_empty()),
                targets: vec![BundleTarget {
                    cluster_name: Some(LOCAL_CLUSTER.to_string()),
                    ..Default::default()
                }],
                ..Default::default()
            },
        );
        repo.metadata.namespace = Some(ns.to_string());
        objects.push(to_dynamic(&repo)?);
    }
    Ok(objects)
}
