//! Cluster loop: per-cluster namespace and deployment roll-up
//!
//! Every Cluster gets a namespace in the management cluster that holds its
//! BundleDeployments. The loop keeps that namespace applied and rolls the
//! readiness of the deployments inside it up into the cluster's status.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Namespace;
use kube::runtime::controller::Action;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::Controller;
use kube::{Api, ResourceExt};
use serde_json::json;
use tracing::{debug, info};

use fleet_common::crd::{summarize, BundleDeployment, BundleSummary, Cluster};
use fleet_common::kube_utils::{deterministic_hash, patch_status};
use fleet_common::{Error, CLUSTER_LABEL, CLUSTER_NAMESPACE_LABEL, MANAGED_LABEL};

use super::resources;
use super::{
    error_policy, log_reconcile_result, namespace_of, scoped, watcher_config, ReconcileError,
};
use crate::apply::Applier;
use crate::informer::LoopInstaller;

/// Loop name
pub const NAME: &str = "cluster";

const MAX_NAME_LEN: usize = 63;

/// What the cluster loop may touch
pub struct ClusterView {
    /// Scoped to Namespace
    pub applier: Applier,
    /// Clusters in every namespace
    pub clusters: Api<Cluster>,
    /// Every BundleDeployment
    pub deployments: Store<BundleDeployment>,
    /// Every Namespace, to map deployments back to clusters
    pub namespaces: Store<Namespace>,
    /// Fleet factory installer
    pub installer: LoopInstaller,
}

struct Context {
    applier: Applier,
    clusters: Api<Cluster>,
    deployments: Store<BundleDeployment>,
}

/// Install the loop; deployment changes requeue the owning cluster
pub async fn register(view: ClusterView) -> Result<(), Error> {
    let deployments: Api<BundleDeployment> = Api::all(view.clusters.clone().into_client());
    let namespaces = view.namespaces.clone();
    let ctx = Arc::new(Context {
        applier: view.applier,
        clusters: view.clusters.clone(),
        deployments: view.deployments,
    });

    view.installer.install(
        NAME,
        Controller::new(view.clusters, watcher_config())
            .watches(deployments, watcher_config(), move |bd| {
                cluster_for_namespace(&namespaces, bd.namespace().as_deref()?)
            })
            .run(reconcile, error_policy, ctx)
            .for_each(log_reconcile_result("Cluster")),
    );
    Ok(())
}

/// Object-set id for the namespace of one cluster
pub fn set_id(namespace: &str, name: &str) -> String {
    format!("{NAME}-{namespace}-{name}")
}

/// Name of the namespace holding the deployments of cluster `namespace/name`
pub fn cluster_namespace_name(namespace: &str, name: &str) -> String {
    let hash = deterministic_hash(&format!("{namespace}/{name}"));
    let suffix = &hash[..8];
    let prefix = format!("cluster-{namespace}-{name}");
    let room = MAX_NAME_LEN - suffix.len() - 1;
    let prefix = if prefix.len() > room {
        prefix[..room].trim_end_matches('-')
    } else {
        prefix.as_str()
    };
    format!("{prefix}-{suffix}")
}

fn cluster_for_namespace(
    namespaces: &Store<Namespace>,
    ns: &str,
) -> Option<ObjectRef<Cluster>> {
    let namespace = namespaces.get(&ObjectRef::new(ns))?;
    let labels = namespace.labels();
    let name = labels.get(CLUSTER_LABEL)?;
    let cluster_ns = labels.get(CLUSTER_NAMESPACE_LABEL)?;
    Some(ObjectRef::new(name).within(cluster_ns))
}

async fn reconcile(cluster: Arc<Cluster>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    let namespace = namespace_of(cluster.as_ref())?;
    let name = cluster.name_any();
    let target_ns = cluster_namespace_name(&namespace, &name);

    let labels = BTreeMap::from([
        (MANAGED_LABEL.to_string(), "true".to_string()),
        (CLUSTER_LABEL.to_string(), name.clone()),
        (CLUSTER_NAMESPACE_LABEL.to_string(), namespace.clone()),
    ]);
    ctx.applier
        .apply(
            &set_id(&namespace, &name),
            vec![resources::namespace(&target_ns, labels)?],
        )
        .await?;

    let summary = summarize_namespace(&ctx.deployments, &target_ns);
    let current = cluster.status.clone().unwrap_or_default();
    if current.namespace.as_deref() == Some(target_ns.as_str()) && current.summary == summary {
        debug!(cluster = %name, "status unchanged");
        return Ok(Action::await_change());
    }

    let status = json!({ "namespace": target_ns, "summary": summary });
    patch_status(&scoped(&ctx.clusters, &namespace), &name, &status).await?;
    info!(cluster = %name, namespace = %target_ns, ready = summary.ready, "cluster status updated");
    Ok(Action::await_change())
}

/// Readiness of every deployment in `namespace`
fn summarize_namespace(
    deployments: &Store<BundleDeployment>,
    namespace: &str,
) -> BundleSummary {
    let in_namespace: Vec<Arc<BundleDeployment>> = deployments
        .state()
        .into_iter()
        .filter(|bd| bd.namespace().as_deref() == Some(namespace))
        .collect();
    summarize(in_namespace.len(), in_namespace.iter().map(|bd| bd.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::tests::store_of;
    use fleet_common::crd::{BundleDeploymentSpec, BundleDeploymentStatus};

    fn deployment(ns: &str, name: &str, ready: bool) -> BundleDeployment {
        let mut bd = BundleDeployment::new(
            name,
            BundleDeploymentSpec {
                deployment_id: "s-1".to_string(),
                ..Default::default()
            },
        );
        bd.metadata.namespace = Some(ns.to_string());
        bd.status = Some(BundleDeploymentStatus {
            applied_deployment_id: Some("s-1".to_string()),
            ready,
            non_modified: true,
        });
        bd
    }

    #[test]
    fn namespace_names_are_stable_and_bounded() {
        let short = cluster_namespace_name("fleet-default", "prod");
        assert!(short.starts_with("cluster-fleet-default-prod-"));
        assert_eq!(short, cluster_namespace_name("fleet-default", "prod"));
        assert_ne!(short, cluster_namespace_name("fleet-local", "prod"));

        let long = cluster_namespace_name("fleet-default", &"x".repeat(80));
        assert!(long.len() <= MAX_NAME_LEN);
    }

    #[test]
    fn summary_counts_only_the_cluster_namespace() {
        let deployments = store_of(vec![
            deployment("cluster-a", "one", true),
            deployment("cluster-a", "two", false),
            deployment("cluster-b", "three", true),
        ]);
        let summary = summarize_namespace(&deployments, "cluster-a");
        assert_eq!(summary.desired_ready, 2);
        assert_eq!(summary.ready, 1);
        assert_eq!(summary.not_ready, 1);
    }

    #[test]
    fn deployment_events_map_to_owning_cluster() {
        let mut ns = Namespace::default();
        ns.metadata.name = Some("cluster-fleet-default-prod-1234".to_string());
        ns.metadata.labels = Some(BTreeMap::from([
            (CLUSTER_LABEL.to_string(), "prod".to_string()),
            (CLUSTER_NAMESPACE_LABEL.to_string(), "fleet-default".to_string()),
        ]));
        let mut plain = Namespace::default();
        plain.metadata.name = Some("kube-system".to_string());
        let namespaces = store_of(vec![ns, plain]);

        let owner = cluster_for_namespace(&namespaces, "cluster-fleet-default-prod-1234").unwrap();
        assert_eq!(owner.name, "prod");
        assert_eq!(owner.namespace.as_deref(), Some("fleet-default"));
        assert!(cluster_for_namespace(&namespaces, "kube-system").is_none());
        assert!(cluster_for_namespace(&namespaces, "missing").is_none());
    }
}
