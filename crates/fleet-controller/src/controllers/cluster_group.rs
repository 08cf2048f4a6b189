//! ClusterGroup loop: counts the clusters each group selects

use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::controller::Action;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::Controller;
use kube::{Api, ResourceExt};
use tracing::debug;

use fleet_common::crd::{Cluster, ClusterGroup, ClusterGroupDisplay, ClusterGroupStatus};
use fleet_common::kube_utils::patch_status;
use fleet_common::selector::matches_opt;
use fleet_common::Error;

use super::{
    error_policy, log_reconcile_result, namespace_of, scoped, watcher_config, ReconcileError,
};
use crate::informer::LoopInstaller;

/// Loop name
pub const NAME: &str = "cluster-group";

/// What the cluster group loop may touch
pub struct ClusterGroupView {
    /// ClusterGroups in every namespace
    pub groups: Api<ClusterGroup>,
    /// Cached ClusterGroups, to map cluster changes to groups
    pub group_cache: Store<ClusterGroup>,
    /// Cached Clusters
    pub clusters: Store<Cluster>,
    /// Fleet factory installer
    pub installer: LoopInstaller,
}

struct Context {
    groups: Api<ClusterGroup>,
    clusters: Store<Cluster>,
}

/// Install the loop; cluster changes requeue every group in the same namespace
pub async fn register(view: ClusterGroupView) -> Result<(), Error> {
    let clusters: Api<Cluster> = Api::all(view.groups.clone().into_client());
    let group_cache = view.group_cache;
    let ctx = Arc::new(Context {
        groups: view.groups.clone(),
        clusters: view.clusters,
    });
    view.installer.install(
        NAME,
        Controller::new(view.groups, watcher_config())
            .watches(clusters, watcher_config(), move |cluster| {
                groups_in_namespace(&group_cache, cluster.namespace().as_deref())
            })
            .run(reconcile, error_policy, ctx)
            .for_each(log_reconcile_result("ClusterGroup")),
    );
    Ok(())
}

fn groups_in_namespace(
    groups: &Store<ClusterGroup>,
    namespace: Option<&str>,
) -> Vec<ObjectRef<ClusterGroup>> {
    groups
        .state()
        .iter()
        .filter(|g| g.namespace().as_deref() == namespace)
        .map(|g| ObjectRef::from_obj(g.as_ref()))
        .collect()
}

/// Counts for `group` over the cached clusters in its namespace
fn group_status(group: &ClusterGroup, clusters: &Store<Cluster>) -> ClusterGroupStatus {
    let namespace = group.namespace();
    let selected: Vec<Arc<Cluster>> = clusters
        .state()
        .into_iter()
        .filter(|c| c.namespace() == namespace)
        .filter(|c| matches_opt(group.spec.selector.as_ref(), c.labels()))
        .collect();

    let total = i32::try_from(selected.len()).unwrap_or(i32::MAX);
    let ready = i32::try_from(selected.iter().filter(|c| c.bundles_ready()).count())
        .unwrap_or(i32::MAX);
    ClusterGroupStatus {
        cluster_count: total,
        non_ready_cluster_count: total - ready,
        display: Some(ClusterGroupDisplay {
            ready_clusters: format!("{ready}/{total}"),
        }),
    }
}

async fn reconcile(group: Arc<ClusterGroup>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    let namespace = namespace_of(group.as_ref())?;
    let name = group.name_any();
    let status = group_status(&group, &ctx.clusters);
    if group.status.as_ref() == Some(&status) {
        return Ok(Action::await_change());
    }
    patch_status(&scoped(&ctx.groups, &namespace), &name, &status).await?;
    debug!(group = %name, clusters = status.cluster_count, "cluster group status updated");
    Ok(Action::await_change())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::tests::{cluster, store_of};
    use fleet_common::crd::{BundleSummary, ClusterGroupSpec, ClusterStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
    use std::collections::BTreeMap;

    fn group(ns: &str, name: &str, env: &str) -> ClusterGroup {
        let mut g = ClusterGroup::new(
            name,
            ClusterGroupSpec {
                selector: Some(LabelSelector {
                    match_labels: Some(BTreeMap::from([("env".to_string(), env.to_string())])),
                    ..Default::default()
                }),
            },
        );
        g.metadata.namespace = Some(ns.to_string());
        g
    }

    #[test]
    fn counts_selected_clusters_and_readiness() {
        let mut lagging = cluster("fleet-default", "b", &[("env", "prod")]);
        lagging.status = Some(ClusterStatus {
            summary: BundleSummary {
                desired_ready: 2,
                ready: 1,
                ..Default::default()
            },
            ..Default::default()
        });
        let clusters = store_of(vec![
            cluster("fleet-default", "a", &[("env", "prod")]),
            lagging,
            cluster("fleet-default", "c", &[("env", "dev")]),
            cluster("other", "d", &[("env", "prod")]),
        ]);

        let status = group_status(&group("fleet-default", "prod", "prod"), &clusters);
        assert_eq!(status.cluster_count, 2);
        assert_eq!(status.non_ready_cluster_count, 1);
        assert_eq!(status.display.unwrap().ready_clusters, "1/2");
    }

    #[test]
    fn cluster_events_fan_out_to_groups_in_namespace() {
        let groups = store_of(vec![
            group("fleet-default", "prod", "prod"),
            group("fleet-default", "dev", "dev"),
            group("other", "prod", "prod"),
        ]);
        let mut refs: Vec<String> = groups_in_namespace(&groups, Some("fleet-default"))
            .into_iter()
            .map(|r| r.name)
            .collect();
        refs.sort();
        assert_eq!(refs, vec!["dev".to_string(), "prod".to_string()]);
    }
}
