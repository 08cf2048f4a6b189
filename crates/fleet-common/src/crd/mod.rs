//! Custom Resource Definitions read and written by the fleet controller
//!
//! Only the fields the controller acts on are modelled; unknown fields on
//! objects read from the API server are ignored.

mod bundle;
mod cluster;
mod content;
mod gitjob;
mod gitrepo;
mod registration;
mod types;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::CustomResourceExt;

pub use bundle::{
    summarize, Bundle, BundleDeployment, BundleDeploymentSpec, BundleDeploymentStatus,
    BundleDisplay, BundleNamespaceMapping, BundleNamespaceMappingSpec, BundleResource, BundleSpec,
    BundleStatus, BundleTarget,
};
pub use cluster::{
    Cluster, ClusterDisplay, ClusterGroup, ClusterGroupDisplay, ClusterGroupSpec,
    ClusterGroupStatus, ClusterSpec, ClusterStatus,
};
pub use content::Content;
pub use gitjob::{GitInfo, GitJob, GitJobSpec, GitJobStatus};
pub use gitrepo::{
    GitRepo, GitRepoRestriction, GitRepoRestrictionSpec, GitRepoSpec, GitRepoStatus, GitTarget,
};
pub use registration::{
    ClusterRegistration, ClusterRegistrationSpec, ClusterRegistrationStatus,
    ClusterRegistrationToken, ClusterRegistrationTokenSpec, ClusterRegistrationTokenStatus,
};
pub use types::BundleSummary;

/// Definitions of the fleet.cattle.io kinds modelled here
///
/// Content is hand-modelled and GitJob belongs to the git job controller, so
/// neither is included.
pub fn fleet_crds() -> Vec<CustomResourceDefinition> {
    vec![
        Cluster::crd(),
        ClusterGroup::crd(),
        ClusterRegistration::crd(),
        ClusterRegistrationToken::crd(),
        Bundle::crd(),
        BundleDeployment::crd(),
        BundleNamespaceMapping::crd(),
        GitRepo::crd(),
        GitRepoRestriction::crd(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fleet_crds_share_the_fleet_group() {
        let crds = fleet_crds();
        assert_eq!(crds.len(), 9);
        for crd in &crds {
            assert_eq!(crd.spec.group, crate::FLEET_GROUP);
        }
        let names: Vec<_> = crds.iter().map(|c| c.spec.names.kind.as_str()).collect();
        assert!(names.contains(&"ClusterRegistrationToken"));
    }
}
