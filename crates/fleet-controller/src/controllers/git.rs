//! Git loop: keeps a GitJob following each GitRepo
//!
//! The GitJob carries the repo's URL, branch, revision and credentials and
//! shares the repo's name. The commit the job last ran against is copied
//! back into the repo's status.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::StreamExt;
use kube::api::DynamicObject;
use kube::runtime::controller::Action;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::Controller;
use kube::{Api, ResourceExt};
use serde_json::json;
use tracing::{debug, info};

use fleet_common::crd::{GitInfo, GitJob, GitJobSpec, GitRepo};
use fleet_common::kube_utils::{patch_status, to_dynamic};
use fleet_common::{Error, REPO_NAME_LABEL};

use super::{
    error_policy, log_reconcile_result, namespace_of, scoped, watcher_config, ReconcileError,
};
use crate::apply::Applier;
use crate::informer::LoopInstaller;

/// Loop name
pub const NAME: &str = "git";

/// What the git loop may touch
pub struct GitView {
    /// Scoped to Role, RoleBinding, GitJob, ConfigMap, ServiceAccount
    pub applier: Applier,
    /// GitRepos in every namespace
    pub repos: Api<GitRepo>,
    /// Cached GitJobs, for the last synced commit
    pub jobs: Store<GitJob>,
    /// Fleet factory installer
    pub installer: LoopInstaller,
}

struct Context {
    applier: Applier,
    repos: Api<GitRepo>,
    jobs: Store<GitJob>,
}

/// Install the loop; GitJob changes requeue the repo of the same name
pub async fn register(view: GitView) -> Result<(), Error> {
    let jobs: Api<GitJob> = Api::all(view.repos.clone().into_client());
    let ctx = Arc::new(Context {
        applier: view.applier,
        repos: view.repos.clone(),
        jobs: view.jobs,
    });
    view.installer.install(
        NAME,
        Controller::new(view.repos, watcher_config())
            .watches(jobs, watcher_config(), |job| {
                job.namespace()
                    .map(|ns| ObjectRef::<GitRepo>::new(&job.name_any()).within(&ns))
            })
            .run(reconcile, error_policy, ctx)
            .for_each(log_reconcile_result("GitRepo")),
    );
    Ok(())
}

/// Object-set id for the job of one repo
pub fn set_id(namespace: &str, name: &str) -> String {
    format!("{NAME}-{namespace}-{name}")
}

fn desired_job(repo: &GitRepo) -> Result<DynamicObject, ReconcileError> {
    let name = repo.name_any();
    let mut job = GitJob::new(
        &name,
        GitJobSpec {
            git: GitInfo {
                repo: repo.spec.repo.clone(),
                branch: repo.spec.branch.clone(),
                revision: repo.spec.revision.clone(),
                credential_secret_name: repo.spec.client_secret_name.clone(),
            },
            service_account: repo.spec.service_account.clone(),
            force_update_generation: 0,
        },
    );
    job.metadata.namespace = Some(namespace_of(repo)?);
    job.metadata.labels = Some(BTreeMap::from([(REPO_NAME_LABEL.to_string(), name)]));
    Ok(to_dynamic(&job)?)
}

/// Commit the cached job for `namespace/name` last ran against
fn synced_commit(jobs: &Store<GitJob>, namespace: &str, name: &str) -> Option<String> {
    jobs.get(&ObjectRef::new(name).within(namespace))
        .and_then(|job| job.status.as_ref()?.commit.clone())
}

async fn reconcile(repo: Arc<GitRepo>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    let namespace = namespace_of(repo.as_ref())?;
    let name = repo.name_any();

    ctx.applier
        .apply(&set_id(&namespace, &name), vec![desired_job(&repo)?])
        .await?;

    let commit = synced_commit(&ctx.jobs, &namespace, &name);
    let current = repo.status.as_ref().and_then(|s| s.commit.clone());
    if commit.is_none() || commit == current {
        debug!(repo = %name, "commit unchanged");
        return Ok(Action::await_change());
    }
    patch_status(
        &scoped(&ctx.repos, &namespace),
        &name,
        &json!({ "commit": commit }),
    )
    .await?;
    info!(repo = %name, commit = ?commit, "git repo synced");
    Ok(Action::await_change())
}
