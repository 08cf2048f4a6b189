//! Cluster-wide objects every registration depends on
//!
//! Applied once at startup, before any control loop is registered: the
//! registration namespace agents create their ClusterRegistrations in, and
//! the ClusterRoles handed to each registered cluster's account.

use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::rbac::v1::ClusterRole;
use kube::api::DynamicObject;
use tracing::info;

use fleet_common::kube_utils::to_dynamic;
use fleet_common::{Error, Namespaces, ResourceKind, FLEET_GROUP, MANAGED_LABEL};

use crate::apply::{Applier, ApplyReport};
use crate::controllers::object_meta;
use crate::controllers::resources::{rule, BUNDLE_DEPLOYMENT_ROLE, CONTENT_ROLE};

/// Set id of the seeded objects
pub const SET_ID: &str = "fleet-bootstrap-data";

/// Objects seeded for `namespaces`
pub fn bootstrap_objects(namespaces: &Namespaces) -> Result<Vec<DynamicObject>, Error> {
    let mut registration = object_meta(namespaces.registration(), None);
    registration.labels = Some([(MANAGED_LABEL.to_string(), "true".to_string())].into());

    let bundle_deployments = ClusterRole {
        metadata: object_meta(BUNDLE_DEPLOYMENT_ROLE, None),
        rules: Some(vec![
            rule(FLEET_GROUP, &["bundledeployments"], &["get", "list", "watch"]),
            rule(FLEET_GROUP, &["bundledeployments/status"], &["update", "patch"]),
        ]),
        ..Default::default()
    };
    let content = ClusterRole {
        metadata: object_meta(CONTENT_ROLE, None),
        rules: Some(vec![rule(FLEET_GROUP, &["contents"], &["get"])]),
        ..Default::default()
    };

    Ok(vec![
        to_dynamic(&Namespace {
            metadata: registration,
            ..Default::default()
        })?,
        to_dynamic(&bundle_deployments)?,
        to_dynamic(&content)?,
    ])
}

/// Apply the seeded objects through a scope derived from `root`
///
/// Namespaces are never pruned by this set, so shrinking it cannot delete
/// the registration namespace out from under registered clusters.
pub async fn seed(root: &Applier, namespaces: &Namespaces) -> Result<ApplyReport, Error> {
    let applier = root
        .with_cache_types([ResourceKind::ClusterRole, ResourceKind::Namespace])
        .with_no_prune([ResourceKind::Namespace]);
    let report = applier.apply(SET_ID, bootstrap_objects(namespaces)?).await?;
    info!(
        registration_namespace = %namespaces.registration(),
        applied = report.applied.len(),
        "bootstrap data seeded"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::testing::MemoryApplyBackend;
    use crate::apply::ApplyBackend;
    use std::sync::Arc;

    #[tokio::test]
    async fn seeds_registration_namespace_and_agent_roles() {
        let backend = Arc::new(MemoryApplyBackend::default());
        let root = Applier::new(backend.clone() as Arc<dyn ApplyBackend>);
        let namespaces = Namespaces::new("cattle-fleet-system");

        let report = seed(&root, &namespaces).await.unwrap();

        assert_eq!(report.applied.len(), 3);
        assert!(report.skipped.is_empty());
        assert_eq!(
            backend.names(ResourceKind::Namespace),
            vec!["cattle-fleet-clusters-system".to_string()]
        );
        let mut roles = backend.names(ResourceKind::ClusterRole);
        roles.sort();
        assert_eq!(roles, vec![BUNDLE_DEPLOYMENT_ROLE, CONTENT_ROLE]);
    }

    #[test]
    fn bundle_deployment_role_can_patch_status() {
        let objects = bootstrap_objects(&Namespaces::new("fleet-system")).unwrap();
        let role = objects
            .iter()
            .find(|o| o.metadata.name.as_deref() == Some(BUNDLE_DEPLOYMENT_ROLE))
            .unwrap();
        let rules = role.data["rules"].as_array().unwrap();
        assert_eq!(rules[1]["resources"][0], "bundledeployments/status");
        assert_eq!(rules[1]["verbs"], serde_json::json!(["update", "patch"]));
    }

    /// Story: reseeding after a rename leaves the old namespace in place
    #[tokio::test]
    async fn story_namespaces_survive_reseeding() {
        let backend = Arc::new(MemoryApplyBackend::default());
        let root = Applier::new(backend.clone() as Arc<dyn ApplyBackend>);

        seed(&root, &Namespaces::new("old-system")).await.unwrap();
        let report = seed(&root, &Namespaces::new("new-system")).await.unwrap();

        assert!(report.pruned.is_empty());
        let mut names = backend.names(ResourceKind::Namespace);
        names.sort();
        assert_eq!(names, vec!["new-clusters-system", "old-clusters-system"]);
    }
}
