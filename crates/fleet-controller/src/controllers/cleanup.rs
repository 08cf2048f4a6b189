//! Cleanup loop: removes namespaces issued for clusters that no longer exist
//!
//! Managed per-cluster namespaces whose cluster is gone are pruned from the
//! cluster loop's set by applying it empty. The loop never creates anything.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Namespace;
use kube::runtime::controller::Action;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::Controller;
use kube::{Api, ResourceExt};
use tracing::info;

use fleet_common::crd::Cluster;
use fleet_common::{Error, CLUSTER_LABEL, CLUSTER_NAMESPACE_LABEL, MANAGED_LABEL};

use super::cluster;
use super::{error_policy, log_reconcile_result, watcher_config, ReconcileError, WAIT_REQUEUE};
use crate::apply::Applier;
use crate::informer::LoopInstaller;

/// Loop name
pub const NAME: &str = "cleanup";

/// Minimum age before an orphaned namespace is removed
pub const ORPHAN_GRACE: Duration = Duration::from_secs(60);

/// What the cleanup loop may touch
pub struct CleanupView {
    /// Scoped to every kind issued for a cluster
    pub applier: Applier,
    /// Cached Clusters
    pub clusters: Store<Cluster>,
    /// Every Namespace
    pub namespaces: Api<Namespace>,
    /// Fleet factory installer
    pub installer: LoopInstaller,
}

struct Context {
    applier: Applier,
    clusters: Store<Cluster>,
}

/// Install the sweep over managed namespaces
pub async fn register(view: CleanupView) -> Result<(), Error> {
    let ctx = Arc::new(Context {
        applier: view.applier,
        clusters: view.clusters,
    });
    view.installer.install(
        NAME,
        Controller::new(
            view.namespaces,
            watcher_config().labels(&format!("{MANAGED_LABEL}=true")),
        )
        .run(reconcile, error_policy, ctx)
        .for_each(log_reconcile_result("NamespaceCleanup")),
    );
    Ok(())
}

/// Cluster (namespace, name) a managed namespace was created for, if that cluster is gone
fn orphaned_namespace_owner(
    ns: &Namespace,
    clusters: &Store<Cluster>,
) -> Option<(String, String)> {
    let labels = ns.labels();
    if labels.get(MANAGED_LABEL).map(String::as_str) != Some("true") {
        return None;
    }
    let name = labels.get(CLUSTER_LABEL)?;
    let namespace = labels.get(CLUSTER_NAMESPACE_LABEL)?;
    let exists = clusters
        .get(&ObjectRef::new(name).within(namespace))
        .is_some();
    (!exists).then(|| (namespace.clone(), name.clone()))
}

async fn reconcile(ns: Arc<Namespace>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    let Some((owner_ns, owner)) = orphaned_namespace_owner(&ns, &ctx.clusters) else {
        return Ok(Action::await_change());
    };

    let age = ns
        .creation_timestamp()
        .and_then(|t| (Utc::now() - t.0).to_std().ok())
        .unwrap_or_default();
    if age < ORPHAN_GRACE {
        return Ok(Action::requeue(WAIT_REQUEUE));
    }

    let report = ctx
        .applier
        .apply(&cluster::set_id(&owner_ns, &owner), Vec::new())
        .await?;
    info!(
        namespace = %ns.name_any(),
        cluster = %owner,
        pruned = report.pruned.len(),
        "removed namespace of deleted cluster"
    );
    Ok(Action::await_change())
}
