//! Ordered controller registration
//!
//! Control loops are registered in phases. Later phases may depend on what
//! earlier ones establish (configuration before cluster identity, identity
//! before bundle delivery), so the registry refuses a step whose phase is
//! lower than the one pushed before it. Registration installs loops on the
//! informer factories; nothing runs until the factories are started.

use std::future::Future;
use std::pin::Pin;

use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret};
use kube::Api;
use tracing::{debug, info};

use fleet_common::crd::{
    BundleDeployment, Cluster, ClusterGroup, ClusterRegistration, ClusterRegistrationToken, GitJob,
};
use fleet_common::{Error, Namespaces, ResourceKind};

use crate::capabilities::CapabilityContext;
use crate::controllers::{
    bootstrap, bundle, cleanup, cluster, cluster_group, cluster_import, cluster_registration,
    cluster_registration_token, config, display, git, manage_agent,
};

/// Registration stage; steps must be pushed in non-decreasing phase order
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    /// Runtime configuration is watched and published
    Configuration,
    /// Clusters, their namespaces, groups and registration credentials
    ClusterIdentity,
    /// Bundles are turned into per-cluster deployments
    BundleDelivery,
    /// Status roll-ups and the local bootstrap
    Aggregation,
}

/// Future returned by a registration step
pub type RegisterFuture = Pin<Box<dyn Future<Output = Result<(), Error>> + Send>>;

type RegisterFn = Box<dyn FnOnce(&CapabilityContext, &Namespaces) -> RegisterFuture + Send>;

/// One control loop's registration
pub struct Registration {
    name: &'static str,
    phase: Phase,
    register: RegisterFn,
}

impl Registration {
    /// A step that builds its view from the context and installs its loop
    pub fn new<F>(name: &'static str, phase: Phase, register: F) -> Self
    where
        F: FnOnce(&CapabilityContext, &Namespaces) -> RegisterFuture + Send + 'static,
    {
        Self {
            name,
            phase,
            register: Box::new(register),
        }
    }

    /// Loop name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Phase the step belongs to
    pub fn phase(&self) -> Phase {
        self.phase
    }
}

/// Registration steps in the order they will run
#[derive(Default)]
pub struct ControllerRegistry {
    steps: Vec<Registration>,
}

impl ControllerRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step
    ///
    /// Fails if the step's phase is lower than the last step's, or if a step
    /// with the same name was already pushed.
    pub fn push(&mut self, step: Registration) -> Result<(), Error> {
        if let Some(last) = self.steps.last() {
            if step.phase < last.phase {
                return Err(Error::registration(
                    step.name,
                    format!(
                        "phase {:?} registered after {} in phase {:?}",
                        step.phase, last.name, last.phase
                    ),
                ));
            }
        }
        if self.steps.iter().any(|s| s.name == step.name) {
            return Err(Error::registration(step.name, "registered twice"));
        }
        self.steps.push(step);
        Ok(())
    }

    /// Step names in registration order
    pub fn names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name).collect()
    }

    /// `(name, phase)` of every step in registration order
    pub fn plan(&self) -> Vec<(&'static str, Phase)> {
        self.steps.iter().map(|s| (s.name, s.phase)).collect()
    }

    /// Run every step in order, stopping at the first failure
    ///
    /// Returns the names of the registered loops.
    pub async fn register_all(
        self,
        ctx: &CapabilityContext,
        namespaces: &Namespaces,
    ) -> Result<Vec<&'static str>, Error> {
        let mut registered = Vec::with_capacity(self.steps.len());
        for step in self.steps {
            debug!(controller = step.name, phase = ?step.phase, "registering");
            (step.register)(ctx, namespaces)
                .await
                .map_err(|e| match e {
                    Error::Registration { .. } => e,
                    other => Error::registration(step.name, other.to_string()),
                })?;
            registered.push(step.name);
        }
        info!(count = registered.len(), "controllers registered");
        Ok(registered)
    }
}

/// The fleet controller's registration table
pub fn fleet_registry() -> Result<ControllerRegistry, Error> {
    let mut registry = ControllerRegistry::new();
    for step in fleet_steps() {
        registry.push(step)?;
    }
    Ok(registry)
}

fn fleet_steps() -> Vec<Registration> {
    use Phase::*;
    use ResourceKind as K;

    vec![
        Registration::new(config::NAME, Configuration, |ctx, ns| {
            let view = config::ConfigView {
                config_maps: Api::<ConfigMap>::namespaced(ctx.client().clone(), ns.system()),
                handle: ctx.config(),
                installer: ctx.core().installer(),
            };
            Box::pin(config::register(view))
        }),
        Registration::new(cluster_registration::NAME, ClusterIdentity, |ctx, _| {
            let view = cluster_registration::ClusterRegistrationView {
                applier: ctx.applier().with_cache_types([
                    K::ServiceAccount,
                    K::Secret,
                    K::Role,
                    K::RoleBinding,
                    K::ClusterRole,
                    K::ClusterRoleBinding,
                    K::ClusterRegistration,
                    K::Cluster,
                ]),
                clusters: ctx.fleet().cache::<Cluster>(),
                registrations: Api::<ClusterRegistration>::all(ctx.client().clone()),
                installer: ctx.fleet().installer(),
            };
            Box::pin(cluster_registration::register(view))
        }),
        Registration::new(cluster::NAME, ClusterIdentity, |ctx, _| {
            let view = cluster::ClusterView {
                applier: ctx.applier().with_cache_types([K::Namespace]),
                clusters: Api::<Cluster>::all(ctx.client().clone()),
                deployments: ctx.fleet().cache::<BundleDeployment>(),
                namespaces: ctx.core().cache::<Namespace>(),
                installer: ctx.fleet().installer(),
            };
            Box::pin(cluster::register(view))
        }),
        Registration::new(cluster_import::NAME, ClusterIdentity, |ctx, _| {
            let view = cluster_import::ClusterImportView {
                clusters: Api::<Cluster>::all(ctx.client().clone()),
                secrets: ctx.core().cache::<Secret>(),
                installer: ctx.fleet().installer(),
            };
            Box::pin(cluster_import::register(view))
        }),
        Registration::new(cluster_group::NAME, ClusterIdentity, |ctx, _| {
            let view = cluster_group::ClusterGroupView {
                groups: Api::<ClusterGroup>::all(ctx.client().clone()),
                group_cache: ctx.fleet().cache::<ClusterGroup>(),
                clusters: ctx.fleet().cache::<Cluster>(),
                installer: ctx.fleet().installer(),
            };
            Box::pin(cluster_group::register(view))
        }),
        Registration::new(cluster_registration_token::NAME, ClusterIdentity, |ctx, _| {
            let view = cluster_registration_token::ClusterRegistrationTokenView {
                applier: ctx
                    .applier()
                    .with_cache_types([K::Secret, K::ServiceAccount, K::Role, K::RoleBinding]),
                tokens: Api::<ClusterRegistrationToken>::all(ctx.client().clone()),
                secrets: ctx.core().cache::<Secret>(),
                installer: ctx.fleet().installer(),
            };
            Box::pin(cluster_registration_token::register(view))
        }),
        Registration::new(bundle::NAME, BundleDelivery, |ctx, _| {
            let view = bundle::BundleView {
                applier: ctx.applier().with_cache_types([K::BundleDeployment]),
                target_manager: ctx.target_manager(),
                bundles: Api::all(ctx.client().clone()),
                installer: ctx.fleet().installer(),
            };
            Box::pin(bundle::register(view))
        }),
        Registration::new(cleanup::NAME, BundleDelivery, |ctx, _| {
            let view = cleanup::CleanupView {
                applier: ctx.applier().with_cache_types([
                    K::Secret,
                    K::ServiceAccount,
                    K::Role,
                    K::RoleBinding,
                    K::ClusterRole,
                    K::ClusterRoleBinding,
                    K::ClusterRegistrationToken,
                    K::ClusterRegistration,
                    K::ClusterGroup,
                    K::Cluster,
                    K::Namespace,
                ]),
                clusters: ctx.fleet().cache::<Cluster>(),
                namespaces: Api::<Namespace>::all(ctx.client().clone()),
                installer: ctx.fleet().installer(),
            };
            Box::pin(cleanup::register(view))
        }),
        Registration::new(manage_agent::NAME, BundleDelivery, |ctx, ns| {
            let view = manage_agent::ManageAgentView {
                applier: ctx.applier().with_cache_types([K::Bundle]),
                namespaces: Api::<Namespace>::all(ctx.client().clone()),
                clusters: ctx.fleet().cache::<Cluster>(),
                config: ctx.config(),
                agent_namespace: ns.system().to_string(),
                installer: ctx.core().installer(),
            };
            Box::pin(manage_agent::register(view))
        }),
        Registration::new(git::NAME, BundleDelivery, |ctx, _| {
            let view = git::GitView {
                applier: ctx.applier().with_cache_types([
                    K::Role,
                    K::RoleBinding,
                    K::GitJob,
                    K::ConfigMap,
                    K::ServiceAccount,
                ]),
                repos: Api::all(ctx.client().clone()),
                jobs: ctx.gitjob().cache::<GitJob>(),
                installer: ctx.fleet().installer(),
            };
            Box::pin(git::register(view))
        }),
        Registration::new(bootstrap::NAME, Aggregation, |ctx, ns| {
            let view = bootstrap::BootstrapView {
                applier: ctx.applier().with_cache_types([
                    K::GitRepo,
                    K::Cluster,
                    K::ClusterGroup,
                    K::Namespace,
                    K::Secret,
                ]),
                config_maps: Api::<ConfigMap>::namespaced(ctx.client().clone(), ns.system()),
                installer: ctx.core().installer(),
            };
            Box::pin(bootstrap::register(view))
        }),
        Registration::new(display::NAME, Aggregation, |ctx, _| {
            let view = display::DisplayView {
                bundles: Api::all(ctx.client().clone()),
                clusters: Api::all(ctx.client().clone()),
                installer: ctx.fleet().installer(),
            };
            Box::pin(display::register(view))
        }),
    ]
}
