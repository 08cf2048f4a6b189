//! Capability context: every client, cache factory and shared service the
//! control loops are wired from
//!
//! Built once per process, before leadership is contended. Construction is
//! all-or-nothing: if any resource domain is not served, no context is
//! returned and nothing has been started.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use kube::Client;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use fleet_common::crd::{Bundle, BundleDeployment, BundleNamespaceMapping, Cluster, ClusterGroup};
use fleet_common::kube_utils::{create_client, resolve_config, ConnectionConfig};
use fleet_common::{Error, ResourceDomain};

use crate::apply::Applier;
use crate::config::ConfigHandle;
use crate::informer::InformerFactory;
use crate::manifest::ManifestStore;
use crate::starter::Starter;
use crate::target::TargetManager;

/// Confirms that a resource domain is served by the API server
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DomainCheck: Send + Sync {
    /// Succeeds if the domain's group/version is served
    async fn check(&self, domain: ResourceDomain) -> Result<(), Error>;
}

/// Check using API discovery
pub struct DiscoveryCheck {
    client: Client,
}

impl DiscoveryCheck {
    /// Check over `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DomainCheck for DiscoveryCheck {
    async fn check(&self, domain: ResourceDomain) -> Result<(), Error> {
        let gv = domain.group_version();
        let result = match domain {
            ResourceDomain::Core => self.client.list_core_api_resources(gv).await.map(|_| ()),
            _ => self.client.list_api_group_resources(gv).await.map(|_| ()),
        };
        result.map_err(|e| Error::connection(domain.name(), format!("{gv} is not served: {e}")))
    }
}

/// Everything the control loops are built from
pub struct CapabilityContext {
    client: Client,
    cluster_url: String,
    core: Arc<InformerFactory>,
    apps: Arc<InformerFactory>,
    fleet: Arc<InformerFactory>,
    rbac: Arc<InformerFactory>,
    gitjob: Arc<InformerFactory>,
    applier: Applier,
    target_manager: Arc<TargetManager>,
    config: ConfigHandle,
    starters: Vec<Arc<dyn Starter>>,
}

impl CapabilityContext {
    /// Connect to the API server and build the context
    pub async fn build(connection: &ConnectionConfig) -> Result<Self, Error> {
        let config = resolve_config(connection).await?;
        let cluster_url = config.cluster_url.to_string();
        let client = create_client(config)?;
        let check = DiscoveryCheck::new(client.clone());
        Self::build_with(client, cluster_url, &check).await
    }

    /// Build the context over an existing client, checking domains with `check`
    pub async fn build_with(
        client: Client,
        cluster_url: String,
        check: &dyn DomainCheck,
    ) -> Result<Self, Error> {
        let core = factory(&client, check, ResourceDomain::Core).await?;
        let fleet = factory(&client, check, ResourceDomain::Fleet).await?;
        let rbac = factory(&client, check, ResourceDomain::Rbac).await?;
        let apps = factory(&client, check, ResourceDomain::Apps).await?;
        let gitjob = factory(&client, check, ResourceDomain::GitJob).await?;

        let applier = Applier::for_client(client.clone()).with_set_owner_reference(false, false);

        let target_manager = Arc::new(TargetManager::new(
            fleet.cache::<Cluster>(),
            fleet.cache::<ClusterGroup>(),
            fleet.cache::<Bundle>(),
            fleet.cache::<BundleNamespaceMapping>(),
            core.cache::<Namespace>(),
            ManifestStore::new(client.clone()),
            fleet.cache::<BundleDeployment>(),
        ));

        let starters: Vec<Arc<dyn Starter>> = vec![
            core.clone(),
            apps.clone(),
            fleet.clone(),
            rbac.clone(),
            gitjob.clone(),
        ];

        info!(cluster = %cluster_url, "capability context built");
        Ok(Self {
            client,
            cluster_url,
            core,
            apps,
            fleet,
            rbac,
            gitjob,
            applier,
            target_manager,
            config: ConfigHandle::new(),
            starters,
        })
    }

    /// Client for ad-hoc API access
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// URL of the API server the controller talks to
    pub fn cluster_url(&self) -> &str {
        &self.cluster_url
    }

    /// Factory for core resources
    pub fn core(&self) -> &Arc<InformerFactory> {
        &self.core
    }

    /// Factory for workload resources
    pub fn apps(&self) -> &Arc<InformerFactory> {
        &self.apps
    }

    /// Factory for fleet resources
    pub fn fleet(&self) -> &Arc<InformerFactory> {
        &self.fleet
    }

    /// Factory for access-control resources
    pub fn rbac(&self) -> &Arc<InformerFactory> {
        &self.rbac
    }

    /// Factory for git job resources
    pub fn gitjob(&self) -> &Arc<InformerFactory> {
        &self.gitjob
    }

    /// Root applier; owner references are not stamped
    pub fn applier(&self) -> &Applier {
        &self.applier
    }

    /// Shared bundle targeting service
    pub fn target_manager(&self) -> Arc<TargetManager> {
        Arc::clone(&self.target_manager)
    }

    /// Handle to the published controller configuration
    pub fn config(&self) -> ConfigHandle {
        self.config.clone()
    }

    /// Starters in start order: core, apps, fleet, rbac, gitjob
    pub fn starters(&self) -> &[Arc<dyn Starter>] {
        &self.starters
    }
}

async fn factory(
    client: &Client,
    check: &dyn DomainCheck,
    domain: ResourceDomain,
) -> Result<Arc<InformerFactory>, Error> {
    check.check(domain).await?;
    debug!(domain = %domain, group_version = domain.group_version(), "domain served");
    Ok(Arc::new(InformerFactory::new(domain, client.clone())))
}

/// Client pointing at an address nothing listens on; never used for I/O in tests
#[cfg(test)]
pub(crate) fn offline_client() -> Client {
    let config = kube::Config::new("http://127.0.0.1:9".parse().unwrap());
    Client::try_from(config).unwrap()
}

/// Context whose every domain check succeeds
#[cfg(test)]
pub(crate) async fn offline_context() -> CapabilityContext {
    let mut check = MockDomainCheck::new();
    check.expect_check().returning(|_| Ok(()));
    CapabilityContext::build_with(offline_client(), "http://127.0.0.1:9".to_string(), &check)
        .await
        .unwrap()
}
