//! Cluster registration loop
//!
//! Turns an agent's ClusterRegistration into a Cluster and grants the
//! registration once that Cluster has been applied. A client id seen before
//! keeps the Cluster it was first given.

use std::sync::Arc;

use futures::StreamExt;
use kube::api::DynamicObject;
use kube::runtime::controller::Action;
use kube::runtime::reflector::Store;
use kube::runtime::Controller;
use kube::{Api, ResourceExt};
use tracing::info;

use fleet_common::crd::{Cluster, ClusterRegistration, ClusterRegistrationStatus, ClusterSpec};
use fleet_common::kube_utils::{deterministic_hash, patch_status, to_dynamic};
use fleet_common::Error;

use super::{
    error_policy, log_reconcile_result, namespace_of, scoped, watcher_config, ReconcileError,
};
use crate::apply::Applier;
use crate::informer::LoopInstaller;

/// Loop name
pub const NAME: &str = "cluster-registration";

/// What the cluster registration loop may touch
pub struct ClusterRegistrationView {
    /// Scoped to the objects issued for a registration
    pub applier: Applier,
    /// Existing clusters, to reuse a name for a known client id
    pub clusters: Store<Cluster>,
    /// ClusterRegistrations in every namespace
    pub registrations: Api<ClusterRegistration>,
    /// Fleet factory installer
    pub installer: LoopInstaller,
}

struct Context {
    applier: Applier,
    clusters: Store<Cluster>,
    registrations: Api<ClusterRegistration>,
}

/// Install the loop
pub async fn register(view: ClusterRegistrationView) -> Result<(), Error> {
    let ctx = Arc::new(Context {
        applier: view.applier,
        clusters: view.clusters,
        registrations: view.registrations.clone(),
    });
    view.installer.install(
        NAME,
        Controller::new(view.registrations, watcher_config())
            .run(reconcile, error_policy, ctx)
            .for_each(log_reconcile_result("ClusterRegistration")),
    );
    Ok(())
}

/// Object-set id for the objects created for one registration
pub fn set_id(namespace: &str, name: &str) -> String {
    format!("{NAME}-{namespace}-{name}")
}

/// Name given to a cluster first seen through `client_id`
pub fn cluster_name_for(client_id: &str) -> String {
    format!("c-{}", deterministic_hash(client_id))
}

async fn reconcile(
    reg: Arc<ClusterRegistration>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    let namespace = namespace_of(reg.as_ref())?;
    let name = reg.name_any();

    if reg.spec.client_id.is_empty() {
        return Err(ReconcileError::rejected(
            "ClusterRegistration",
            name,
            "clientID is empty",
        ));
    }
    if reg.is_granted() {
        return Ok(Action::await_change());
    }

    let cluster_name = find_cluster(&ctx.clusters, &namespace, &reg.spec.client_id)
        .map(|c| c.name_any())
        .unwrap_or_else(|| cluster_name_for(&reg.spec.client_id));
    let cluster = desired_cluster(&reg, &cluster_name)?;
    ctx.applier
        .apply(&set_id(&namespace, &name), vec![cluster])
        .await?;

    let status = ClusterRegistrationStatus {
        cluster_name: Some(cluster_name.clone()),
        granted: true,
    };
    patch_status(&scoped(&ctx.registrations, &namespace), &name, &status).await?;
    info!(registration = %name, cluster = %cluster_name, "registration granted");
    Ok(Action::await_change())
}

fn find_cluster(
    clusters: &Store<Cluster>,
    namespace: &str,
    client_id: &str,
) -> Option<Arc<Cluster>> {
    clusters.state().into_iter().find(|c| {
        c.namespace().as_deref() == Some(namespace)
            && c.spec.client_id.as_deref() == Some(client_id)
    })
}

/// The Cluster a registration asks for, carrying its labels
fn desired_cluster(
    reg: &ClusterRegistration,
    cluster_name: &str,
) -> Result<DynamicObject, ReconcileError> {
    let mut cluster = Cluster::new(
        cluster_name,
        ClusterSpec {
            client_id: Some(reg.spec.client_id.clone()),
            ..Default::default()
        },
    );
    cluster.metadata.namespace = Some(namespace_of(reg)?);
    if !reg.spec.cluster_labels.is_empty() {
        cluster.metadata.labels = Some(reg.spec.cluster_labels.clone());
    }
    Ok(to_dynamic(&cluster)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::testing::MemoryApplyBackend;
    use crate::target::tests::{cluster, store_of};
    use fleet_common::crd::ClusterRegistrationSpec;
    use fleet_common::ResourceKind;
    use std::collections::BTreeMap;

    fn registration(ns: &str, name: &str, client_id: &str) -> ClusterRegistration {
        let mut reg = ClusterRegistration::new(
            name,
            ClusterRegistrationSpec {
                client_id: client_id.to_string(),
                client_random: "r".to_string(),
                cluster_labels: BTreeMap::from([("env".to_string(), "prod".to_string())]),
            },
        );
        reg.metadata.namespace = Some(ns.to_string());
        reg
    }

    #[test]
    fn known_client_id_reuses_cluster() {
        let mut known = cluster("fleet-default", "prod-east", &[]);
        known.spec.client_id = Some("abc".to_string());
        let other = cluster("other", "prod-west", &[]);
        let clusters = store_of(vec![known, other]);

        let found = find_cluster(&clusters, "fleet-default", "abc").unwrap();
        assert_eq!(found.name_any(), "prod-east");
        assert!(find_cluster(&clusters, "other", "abc").is_none());
    }

    #[test]
    fn new_client_gets_stable_generated_name() {
        assert_eq!(cluster_name_for("abc"), cluster_name_for("abc"));
        assert!(cluster_name_for("abc").starts_with("c-"));
        assert_ne!(cluster_name_for("abc"), cluster_name_for("abd"));
    }

    #[test]
    fn cluster_carries_client_id_and_labels() {
        let reg = registration("fleet-default", "reg-1", "abc");
        let obj = desired_cluster(&reg, "c-1").unwrap();
        assert_eq!(obj.types.as_ref().unwrap().kind, "Cluster");
        assert_eq!(obj.metadata.namespace.as_deref(), Some("fleet-default"));
        assert_eq!(obj.data["spec"]["clientID"], "abc");
        assert_eq!(obj.metadata.labels.as_ref().unwrap()["env"], "prod");
    }

    #[tokio::test]
    async fn story_reregistration_keeps_a_single_cluster() {
        let backend = Arc::new(MemoryApplyBackend::default());
        let applier = Applier::new(backend.clone())
            .with_cache_types([ResourceKind::ClusterRegistration, ResourceKind::Cluster]);
        let reg = registration("fleet-default", "reg-1", "abc");
        let set = set_id("fleet-default", "reg-1");

        let name = cluster_name_for("abc");
        applier
            .apply(&set, vec![desired_cluster(&reg, &name).unwrap()])
            .await
            .unwrap();
        let report = applier
            .apply(&set, vec![desired_cluster(&reg, &name).unwrap()])
            .await
            .unwrap();

        assert!(report.pruned.is_empty());
        assert_eq!(backend.names(ResourceKind::Cluster), vec![name]);
    }
}
