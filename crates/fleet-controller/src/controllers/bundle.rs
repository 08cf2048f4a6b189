//! Bundle loop: one BundleDeployment per targeted cluster
//!
//! Stores the bundle's manifest by digest, resolves its targets through the
//! TargetManager and makes the set of BundleDeployments for the bundle exactly
//! one per target cluster. Deployments for clusters that stop matching are
//! pruned with the set.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::StreamExt;
use kube::api::DynamicObject;
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::Controller;
use kube::{Api, ResourceExt};
use serde_json::json;
use tracing::{debug, info};

use fleet_common::crd::{summarize, Bundle, BundleDeployment, BundleDeploymentSpec, Cluster};
use fleet_common::kube_utils::{patch_status, to_dynamic};
use fleet_common::{Error, BUNDLE_NAMESPACE_LABEL, BUNDLE_NAME_LABEL, REPO_NAME_LABEL};

use super::{
    error_policy, log_reconcile_result, namespace_of, scoped, watcher_config, ReconcileError,
    WAIT_REQUEUE,
};
use crate::apply::Applier;
use crate::informer::LoopInstaller;
use crate::target::{Target, TargetManager};

/// Loop name
pub const NAME: &str = "bundle";

/// What the bundle loop may touch
pub struct BundleView {
    /// Scoped to BundleDeployment
    pub applier: Applier,
    /// Shared targeting service
    pub target_manager: Arc<TargetManager>,
    /// Bundles in every namespace
    pub bundles: Api<Bundle>,
    /// Fleet factory installer
    pub installer: LoopInstaller,
}

struct Context {
    applier: Applier,
    target_manager: Arc<TargetManager>,
    bundles: Api<Bundle>,
}

/// Install the loop; deployment and cluster changes requeue affected bundles
pub async fn register(view: BundleView) -> Result<(), Error> {
    let client = view.bundles.clone().into_client();
    let deployments: Api<BundleDeployment> = Api::all(client.clone());
    let clusters: Api<Cluster> = Api::all(client);
    let tm = view.target_manager.clone();

    let ctx = Arc::new(Context {
        applier: view.applier,
        target_manager: view.target_manager,
        bundles: view.bundles.clone(),
    });

    view.installer.install(
        NAME,
        Controller::new(view.bundles, watcher_config())
            .watches(deployments, watcher_config(), |bd| bundle_of_deployment(&bd))
            .watches(clusters, watcher_config(), move |cluster| {
                tm.bundles_for_cluster(&cluster)
                    .iter()
                    .map(|b| ObjectRef::from_obj(b.as_ref()))
                    .collect::<Vec<_>>()
            })
            .run(reconcile, error_policy, ctx)
            .for_each(log_reconcile_result("Bundle")),
    );
    Ok(())
}

fn bundle_of_deployment(bd: &BundleDeployment) -> Option<ObjectRef<Bundle>> {
    let labels = bd.labels();
    let name = labels.get(BUNDLE_NAME_LABEL)?;
    let namespace = labels.get(BUNDLE_NAMESPACE_LABEL)?;
    Some(ObjectRef::new(name).within(namespace))
}

/// Object-set id for the deployments of one bundle
pub fn set_id(namespace: &str, name: &str) -> String {
    format!("{NAME}-{namespace}-{name}")
}

async fn reconcile(bundle: Arc<Bundle>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    let namespace = namespace_of(bundle.as_ref())?;
    let name = bundle.name_any();

    let manifest_id = ctx
        .target_manager
        .manifests()
        .store(&bundle.spec.resources)
        .await?;

    let targets = ctx.target_manager.targets(&bundle);
    let (objects, waiting) = desired_deployments(&bundle, &targets, &manifest_id)?;
    let report = ctx
        .applier
        .apply(&set_id(&namespace, &name), objects)
        .await?;
    if !report.pruned.is_empty() {
        info!(
            bundle = %name,
            pruned = report.pruned.len(),
            "removed deployments for untargeted clusters"
        );
    }

    let deployments = ctx.target_manager.deployments_for_bundle(&namespace, &name);
    let summary = summarize(targets.len(), deployments.iter().map(|bd| bd.as_ref()));
    let current = bundle.status.clone().unwrap_or_default();
    if current.summary != summary
        || current.resources_sha256_sum.as_deref() != Some(manifest_id.as_str())
    {
        let status = json!({ "summary": summary, "resourcesSha256Sum": manifest_id });
        patch_status(&scoped(&ctx.bundles, &namespace), &name, &status).await?;
        debug!(
            bundle = %name,
            targets = targets.len(),
            ready = summary.ready,
            "bundle status updated"
        );
    }

    if waiting > 0 {
        debug!(bundle = %name, waiting, "targets without a deployment namespace");
        return Ok(Action::requeue(WAIT_REQUEUE));
    }
    Ok(Action::await_change())
}

/// BundleDeployments for every target with an assigned namespace, and how
/// many targets are still waiting for one
fn desired_deployments(
    bundle: &Bundle,
    targets: &[Target],
    manifest_id: &str,
) -> Result<(Vec<DynamicObject>, usize), ReconcileError> {
    let namespace = namespace_of(bundle)?;
    let name = bundle.name_any();
    let mut labels = BTreeMap::from([
        (BUNDLE_NAME_LABEL.to_string(), name.clone()),
        (BUNDLE_NAMESPACE_LABEL.to_string(), namespace),
    ]);
    if let Some(repo) = bundle.labels().get(REPO_NAME_LABEL) {
        labels.insert(REPO_NAME_LABEL.to_string(), repo.clone());
    }

    let mut objects = Vec::with_capacity(targets.len());
    let mut waiting = 0;
    for target in targets {
        let Some(deployment_ns) = target.deployment_namespace() else {
            waiting += 1;
            continue;
        };
        let mut bd = BundleDeployment::new(
            &name,
            BundleDeploymentSpec {
                deployment_id: manifest_id.to_string(),
                paused: bundle.spec.paused || target.cluster.spec.paused,
                default_namespace: bundle.spec.default_namespace.clone(),
            },
        );
        bd.metadata.namespace = Some(deployment_ns.to_string());
        bd.metadata.labels = Some(labels.clone());
        objects.push(to_dynamic(&bd)?);
    }
    Ok((objects, waiting))
}
