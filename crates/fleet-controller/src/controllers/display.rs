//! Display loop: human-readable status columns
//!
//! Renders the summaries other loops maintain into the `display` fields
//! shown by `kubectl get` for Bundles and Clusters.

use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::controller::Action;
use kube::runtime::Controller;
use kube::{Api, ResourceExt};
use tracing::debug;

use fleet_common::crd::{Bundle, BundleDisplay, Cluster, ClusterDisplay};
use fleet_common::kube_utils::patch_status;
use fleet_common::Error;

use super::{
    error_policy, log_reconcile_result, namespace_of, scoped, watcher_config, ReconcileError,
};
use crate::informer::LoopInstaller;

/// Loop name
pub const NAME: &str = "display";

/// What the display loop may touch
pub struct DisplayView {
    /// Bundles in every namespace
    pub bundles: Api<Bundle>,
    /// Clusters in every namespace
    pub clusters: Api<Cluster>,
    /// Fleet factory installer
    pub installer: LoopInstaller,
}

struct Context {
    bundles: Api<Bundle>,
    clusters: Api<Cluster>,
}

/// Install one controller per displayed kind
pub async fn register(view: DisplayView) -> Result<(), Error> {
    let ctx = Arc::new(Context {
        bundles: view.bundles.clone(),
        clusters: view.clusters.clone(),
    });
    view.installer.install(
        NAME,
        Controller::new(view.bundles, watcher_config())
            .run(reconcile_bundle, error_policy, ctx.clone())
            .for_each(log_reconcile_result("BundleDisplay")),
    );
    view.installer.install(
        "display-clusters",
        Controller::new(view.clusters, watcher_config())
            .run(reconcile_cluster, error_policy, ctx)
            .for_each(log_reconcile_result("ClusterDisplay")),
    );
    Ok(())
}

/// Display columns for `bundle`, if they differ from what it shows
fn bundle_display(bundle: &Bundle) -> Option<BundleDisplay> {
    let status = bundle.status.clone().unwrap_or_default();
    let wanted = BundleDisplay {
        ready_clusters: status.summary.ratio(),
    };
    (status.display.as_ref() != Some(&wanted)).then_some(wanted)
}

/// Display columns for `cluster`, if they differ from what it shows
fn cluster_display(cluster: &Cluster) -> Option<ClusterDisplay> {
    let status = cluster.status.clone().unwrap_or_default();
    let wanted = ClusterDisplay {
        ready_bundles: status.summary.ratio(),
    };
    (status.display.as_ref() != Some(&wanted)).then_some(wanted)
}

async fn reconcile_bundle(
    bundle: Arc<Bundle>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    let Some(wanted) = bundle_display(&bundle) else {
        return Ok(Action::await_change());
    };
    let namespace = namespace_of(bundle.as_ref())?;
    let name = bundle.name_any();
    let status = serde_json::json!({ "display": wanted });
    patch_status(&scoped(&ctx.bundles, &namespace), &name, &status).await?;
    debug!(bundle = %name, ready = %wanted.ready_clusters, "bundle display updated");
    Ok(Action::await_change())
}

async fn reconcile_cluster(
    cluster: Arc<Cluster>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    let Some(wanted) = cluster_display(&cluster) else {
        return Ok(Action::await_change());
    };
    let namespace = namespace_of(cluster.as_ref())?;
    let name = cluster.name_any();
    let status = serde_json::json!({ "display": wanted });
    patch_status(&scoped(&ctx.clusters, &namespace), &name, &status).await?;
    debug!(cluster = %name, ready = %wanted.ready_bundles, "cluster display updated");
    Ok(Action::await_change())
}
