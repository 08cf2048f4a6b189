//! Control loops registered by the fleet controller
//!
//! Each loop receives a narrow view built by the registry: the caches it
//! reads, typed clients for the objects whose status it writes, an applier
//! scoped to the kinds it owns, and the installer of the factory that owns
//! its primary kind. `register` installs a kube-runtime Controller on that
//! factory; the controller runs once the factory is started.

pub mod bootstrap;
pub mod bundle;
pub mod cleanup;
pub mod cluster;
pub mod cluster_group;
pub mod cluster_import;
pub mod cluster_registration;
pub mod cluster_registration_token;
pub mod config;
pub mod display;
pub mod git;
pub mod manage_agent;
pub mod resources;

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::NamespaceResourceScope;
use kube::runtime::controller::Action;
use kube::runtime::watcher;
use kube::{Api, Resource, ResourceExt};
use tracing::warn;

use crate::informer::WATCH_TIMEOUT_SECS;

/// Requeue delay after a transient failure
pub const RETRY_REQUEUE: Duration = Duration::from_secs(10);

/// Requeue delay after a failure that needs outside intervention
pub const BACKOFF_REQUEUE: Duration = Duration::from_secs(300);

/// Requeue delay while waiting on state another loop produces
pub const WAIT_REQUEUE: Duration = Duration::from_secs(30);

/// Errors from a single reconciliation
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Error from shared fleet services
    #[error("{0}")]
    Common(#[from] fleet_common::Error),

    /// The object has no namespace but the loop needs one
    #[error("{0} has no namespace")]
    MissingNamespace(String),

    /// The object is invalid and will not be acted on until it changes
    #[error("{kind} {name} rejected: {reason}")]
    Rejected {
        /// Kind of the rejected object
        kind: &'static str,
        /// Name of the rejected object
        name: String,
        /// Why it was rejected
        reason: String,
    },
}

impl ReconcileError {
    /// Whether the failure may clear up on its own
    pub fn is_retryable(&self) -> bool {
        match self {
            ReconcileError::Kube(kube::Error::Api(ae)) => {
                !((400..500).contains(&ae.code) && ae.code != 409 && ae.code != 429)
            }
            ReconcileError::Kube(_) => true,
            ReconcileError::Common(e) => e.is_retryable(),
            ReconcileError::Serialization(_)
            | ReconcileError::MissingNamespace(_)
            | ReconcileError::Rejected { .. } => false,
        }
    }

    pub(crate) fn rejected(
        kind: &'static str,
        name: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        ReconcileError::Rejected {
            kind,
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// Requeue policy shared by every loop
pub fn error_policy<K: ResourceExt, C>(
    obj: Arc<K>,
    error: &ReconcileError,
    _ctx: Arc<C>,
) -> Action {
    let retryable = error.is_retryable();
    warn!(
        ?error,
        object = %obj.name_any(),
        namespace = obj.namespace().as_deref().unwrap_or(""),
        retryable,
        "reconciliation failed"
    );
    if retryable {
        Action::requeue(RETRY_REQUEUE)
    } else {
        Action::requeue(BACKOFF_REQUEUE)
    }
}

/// Watch configuration used by every controller
pub fn watcher_config() -> watcher::Config {
    watcher::Config::default().timeout(WATCH_TIMEOUT_SECS)
}

pub(crate) fn log_reconcile_result<T: Debug, E: Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}

pub(crate) fn namespace_of<K: ResourceExt>(obj: &K) -> Result<String, ReconcileError> {
    obj.namespace()
        .ok_or_else(|| ReconcileError::MissingNamespace(obj.name_any()))
}

/// Namespaced client for the same kind as `api`
pub(crate) fn scoped<K>(api: &Api<K>, namespace: &str) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope> + Clone,
    K::DynamicType: Default,
{
    Api::namespaced(api.clone().into_client(), namespace)
}

pub(crate) fn object_meta(name: impl Into<String>, namespace: Option<&str>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.into()),
        namespace: namespace.map(str::to_string),
        ..Default::default()
    }
}
