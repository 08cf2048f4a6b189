//! Cluster import loop
//!
//! A Cluster that names a kubeconfig Secret is imported rather than
//! self-registered. Once that Secret is cached the loop records the agent
//! generation the import was done for.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::controller::Action;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::Controller;
use kube::{Api, ResourceExt};
use serde_json::json;
use tracing::{debug, info};

use fleet_common::crd::Cluster;
use fleet_common::kube_utils::patch_status;
use fleet_common::Error;

use super::{
    error_policy, log_reconcile_result, namespace_of, scoped, watcher_config, ReconcileError,
    WAIT_REQUEUE,
};
use crate::informer::LoopInstaller;

/// Loop name
pub const NAME: &str = "cluster-import";

/// What the import loop may touch
pub struct ClusterImportView {
    /// Clusters in every namespace
    pub clusters: Api<Cluster>,
    /// Every Secret, to find kubeconfigs
    pub secrets: Store<Secret>,
    /// Fleet factory installer
    pub installer: LoopInstaller,
}

struct Context {
    clusters: Api<Cluster>,
    secrets: Store<Secret>,
}

/// Install the loop
pub async fn register(view: ClusterImportView) -> Result<(), Error> {
    let ctx = Arc::new(Context {
        clusters: view.clusters.clone(),
        secrets: view.secrets,
    });
    view.installer.install(
        NAME,
        Controller::new(view.clusters, watcher_config())
            .run(reconcile, error_policy, ctx)
            .for_each(log_reconcile_result("ClusterImport")),
    );
    Ok(())
}

/// What the loop has to do for one cluster
#[derive(Debug, PartialEq, Eq)]
enum ImportStep {
    /// Not an imported cluster, or already imported at this generation
    Nothing,
    /// The kubeconfig Secret is not in the cache yet
    AwaitSecret(String),
    /// Record `generation` as imported
    Import { secret: String, generation: i64 },
}

fn next_step(cluster: &Cluster, secrets: &Store<Secret>, namespace: &str) -> ImportStep {
    let Some(secret) = cluster.spec.kube_config_secret.clone() else {
        return ImportStep::Nothing;
    };
    let generation = cluster.spec.redeploy_agent_generation;
    let deployed = cluster
        .status
        .as_ref()
        .and_then(|s| s.agent_deployed_generation);
    if deployed == Some(generation) {
        return ImportStep::Nothing;
    }
    if secrets
        .get(&ObjectRef::new(&secret).within(namespace))
        .is_none()
    {
        return ImportStep::AwaitSecret(secret);
    }
    ImportStep::Import { secret, generation }
}

async fn reconcile(cluster: Arc<Cluster>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    let namespace = namespace_of(cluster.as_ref())?;
    let name = cluster.name_any();

    let (secret, generation) = match next_step(&cluster, &ctx.secrets, &namespace) {
        ImportStep::Nothing => return Ok(Action::await_change()),
        ImportStep::AwaitSecret(secret) => {
            debug!(cluster = %name, secret = %secret, "kubeconfig secret not found yet");
            return Ok(Action::requeue(WAIT_REQUEUE));
        }
        ImportStep::Import { secret, generation } => (secret, generation),
    };

    let status = json!({ "agentDeployedGeneration": generation });
    patch_status(&scoped(&ctx.clusters, &namespace), &name, &status).await?;
    info!(cluster = %name, secret = %secret, generation, "cluster imported");
    Ok(Action::await_change())
}
