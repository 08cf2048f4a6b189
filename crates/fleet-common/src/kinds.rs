//! Resource domains and the resource kinds the controller reads or writes
//!
//! Each kind belongs to exactly one domain. A domain maps to one API
//! group/version served by the API server and to one informer factory in
//! the controller.

use std::fmt;

use kube::discovery::ApiResource;

/// A family of resource kinds served under one API group/version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceDomain {
    /// Core Kubernetes resources (namespaces, secrets, config maps, service accounts)
    Core,
    /// Workload resources (apps/v1)
    Apps,
    /// Fleet resources (fleet.cattle.io)
    Fleet,
    /// Access-control resources (rbac.authorization.k8s.io)
    Rbac,
    /// Git job resources (gitjob.cattle.io)
    GitJob,
}

impl ResourceDomain {
    /// Group/version checked to confirm the domain is served
    pub fn group_version(&self) -> &'static str {
        match self {
            Self::Core => "v1",
            Self::Apps => "apps/v1",
            Self::Fleet => "fleet.cattle.io/v1alpha1",
            Self::Rbac => "rbac.authorization.k8s.io/v1",
            Self::GitJob => "gitjob.cattle.io/v1",
        }
    }

    /// Short name used in logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            Self::Core => "core",
            Self::Apps => "apps",
            Self::Fleet => "fleet",
            Self::Rbac => "rbac",
            Self::GitJob => "gitjob",
        }
    }
}

impl fmt::Display for ResourceDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Resource kinds known to the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    /// Namespace (v1)
    Namespace,
    /// ConfigMap (v1)
    ConfigMap,
    /// Secret (v1)
    Secret,
    /// ServiceAccount (v1)
    ServiceAccount,
    /// Role (rbac.authorization.k8s.io)
    Role,
    /// RoleBinding (rbac.authorization.k8s.io)
    RoleBinding,
    /// ClusterRole (rbac.authorization.k8s.io)
    ClusterRole,
    /// ClusterRoleBinding (rbac.authorization.k8s.io)
    ClusterRoleBinding,
    /// Cluster (fleet.cattle.io)
    Cluster,
    /// ClusterGroup (fleet.cattle.io)
    ClusterGroup,
    /// ClusterRegistration (fleet.cattle.io)
    ClusterRegistration,
    /// ClusterRegistrationToken (fleet.cattle.io)
    ClusterRegistrationToken,
    /// Bundle (fleet.cattle.io)
    Bundle,
    /// BundleDeployment (fleet.cattle.io)
    BundleDeployment,
    /// BundleNamespaceMapping (fleet.cattle.io)
    BundleNamespaceMapping,
    /// Content (fleet.cattle.io)
    Content,
    /// GitRepo (fleet.cattle.io)
    GitRepo,
    /// GitRepoRestriction (fleet.cattle.io)
    GitRepoRestriction,
    /// GitJob (gitjob.cattle.io)
    GitJob,
}

/// All ResourceKind variants for iteration.
pub const ALL_RESOURCE_KINDS: &[ResourceKind] = &[
    ResourceKind::Namespace,
    ResourceKind::ConfigMap,
    ResourceKind::Secret,
    ResourceKind::ServiceAccount,
    ResourceKind::Role,
    ResourceKind::RoleBinding,
    ResourceKind::ClusterRole,
    ResourceKind::ClusterRoleBinding,
    ResourceKind::Cluster,
    ResourceKind::ClusterGroup,
    ResourceKind::ClusterRegistration,
    ResourceKind::ClusterRegistrationToken,
    ResourceKind::Bundle,
    ResourceKind::BundleDeployment,
    ResourceKind::BundleNamespaceMapping,
    ResourceKind::Content,
    ResourceKind::GitRepo,
    ResourceKind::GitRepoRestriction,
    ResourceKind::GitJob,
];

impl ResourceKind {
    /// Domain (and therefore informer factory) the kind belongs to
    pub fn domain(&self) -> ResourceDomain {
        match self {
            Self::Namespace | Self::ConfigMap | Self::Secret | Self::ServiceAccount => {
                ResourceDomain::Core
            }
            Self::Role | Self::RoleBinding | Self::ClusterRole | Self::ClusterRoleBinding => {
                ResourceDomain::Rbac
            }
            Self::GitJob => ResourceDomain::GitJob,
            _ => ResourceDomain::Fleet,
        }
    }

    /// Kubernetes Kind string
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::Namespace => "Namespace",
            Self::ConfigMap => "ConfigMap",
            Self::Secret => "Secret",
            Self::ServiceAccount => "ServiceAccount",
            Self::Role => "Role",
            Self::RoleBinding => "RoleBinding",
            Self::ClusterRole => "ClusterRole",
            Self::ClusterRoleBinding => "ClusterRoleBinding",
            Self::Cluster => "Cluster",
            Self::ClusterGroup => "ClusterGroup",
            Self::ClusterRegistration => "ClusterRegistration",
            Self::ClusterRegistrationToken => "ClusterRegistrationToken",
            Self::Bundle => "Bundle",
            Self::BundleDeployment => "BundleDeployment",
            Self::BundleNamespaceMapping => "BundleNamespaceMapping",
            Self::Content => "Content",
            Self::GitRepo => "GitRepo",
            Self::GitRepoRestriction => "GitRepoRestriction",
            Self::GitJob => "GitJob",
        }
    }

    /// Lowercase plural used in API paths
    pub fn plural(&self) -> String {
        match self {
            Self::Namespace => "namespaces".to_string(),
            other => format!("{}s", other.kind_str().to_ascii_lowercase()),
        }
    }

    /// Whether objects of this kind live in a namespace
    pub fn namespaced(&self) -> bool {
        !matches!(
            self,
            Self::Namespace | Self::ClusterRole | Self::ClusterRoleBinding | Self::Content
        )
    }

    /// API group ("" for core)
    pub fn group(&self) -> &'static str {
        match self.domain().group_version().split_once('/') {
            Some((group, _)) => group,
            None => "",
        }
    }

    /// API version without the group
    pub fn version(&self) -> &'static str {
        let gv = self.domain().group_version();
        gv.rsplit('/').next().unwrap_or(gv)
    }

    /// Full apiVersion string (group/version, or just version for core)
    pub fn api_version(&self) -> &'static str {
        self.domain().group_version()
    }

    /// ApiResource for dynamic clients
    pub fn api_resource(&self) -> ApiResource {
        ApiResource {
            group: self.group().to_string(),
            version: self.version().to_string(),
            api_version: self.api_version().to_string(),
            kind: self.kind_str().to_string(),
            plural: self.plural(),
        }
    }

    /// Resolve a kind from an object's apiVersion and kind fields
    pub fn from_type_meta(api_version: &str, kind: &str) -> Option<Self> {
        ALL_RESOURCE_KINDS
            .iter()
            .copied()
            .find(|k| k.api_version() == api_version && k.kind_str() == kind)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_round_trips_through_type_meta() {
        for kind in ALL_RESOURCE_KINDS {
            assert_eq!(
                ResourceKind::from_type_meta(kind.api_version(), kind.kind_str()),
                Some(*kind)
            );
        }
    }

    #[test]
    fn core_kinds_have_empty_group() {
        let ar = ResourceKind::Secret.api_resource();
        assert_eq!(ar.group, "");
        assert_eq!(ar.version, "v1");
        assert_eq!(ar.api_version, "v1");
        assert_eq!(ar.plural, "secrets");
    }

    #[test]
    fn fleet_kinds_resolve_group_and_plural() {
        let ar = ResourceKind::BundleDeployment.api_resource();
        assert_eq!(ar.group, "fleet.cattle.io");
        assert_eq!(ar.version, "v1alpha1");
        assert_eq!(ar.plural, "bundledeployments");
        assert_eq!(ResourceKind::GitJob.api_resource().group, "gitjob.cattle.io");
    }

    #[test]
    fn unknown_type_meta_is_rejected() {
        assert_eq!(ResourceKind::from_type_meta("apps/v1", "Deployment"), None);
        assert_eq!(ResourceKind::from_type_meta("v1", "Cluster"), None);
    }

    #[test]
    fn cluster_scoped_kinds() {
        assert!(!ResourceKind::Namespace.namespaced());
        assert!(!ResourceKind::ClusterRole.namespaced());
        assert!(!ResourceKind::Content.namespaced());
        assert!(ResourceKind::Bundle.namespaced());
    }

    #[test]
    fn kinds_map_to_domains() {
        assert_eq!(ResourceKind::ConfigMap.domain(), ResourceDomain::Core);
        assert_eq!(ResourceKind::RoleBinding.domain(), ResourceDomain::Rbac);
        assert_eq!(ResourceKind::GitRepo.domain(), ResourceDomain::Fleet);
        assert_eq!(ResourceKind::GitJob.domain(), ResourceDomain::GitJob);
    }
}
