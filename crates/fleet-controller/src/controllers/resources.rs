//! Builders for the core objects and policy rules several loops share

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Namespace, Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::PolicyRule;
use kube::api::DynamicObject;

use fleet_common::kube_utils::to_dynamic;

use super::{object_meta, ReconcileError};

/// Annotation tying a token Secret to its ServiceAccount
pub const SERVICE_ACCOUNT_NAME_ANNOTATION: &str = "kubernetes.io/service-account.name";

/// Secret type populated by the token controller
pub const SERVICE_ACCOUNT_TOKEN_TYPE: &str = "kubernetes.io/service-account-token";

/// ClusterRole granting agents access to their BundleDeployments
pub const BUNDLE_DEPLOYMENT_ROLE: &str = "fleet-bundle-deployment";

/// ClusterRole granting agents read access to manifests
pub const CONTENT_ROLE: &str = "fleet-content";

pub(crate) fn namespace(
    name: &str,
    labels: BTreeMap<String, String>,
) -> Result<DynamicObject, ReconcileError> {
    let mut meta = object_meta(name, None);
    meta.labels = Some(labels);
    Ok(to_dynamic(&Namespace {
        metadata: meta,
        ..Default::default()
    })?)
}

pub(crate) fn service_account(
    namespace: &str,
    name: &str,
) -> Result<DynamicObject, ReconcileError> {
    Ok(to_dynamic(&ServiceAccount {
        metadata: object_meta(name, Some(namespace)),
        ..Default::default()
    })?)
}

/// Secret the token controller fills with a token for `service_account`
pub(crate) fn token_secret(
    namespace: &str,
    name: &str,
    service_account: &str,
) -> Result<DynamicObject, ReconcileError> {
    let mut meta = object_meta(name, Some(namespace));
    meta.annotations = Some(BTreeMap::from([(
        SERVICE_ACCOUNT_NAME_ANNOTATION.to_string(),
        service_account.to_string(),
    )]));
    Ok(to_dynamic(&Secret {
        metadata: meta,
        type_: Some(SERVICE_ACCOUNT_TOKEN_TYPE.to_string()),
        ..Default::default()
    })?)
}

pub(crate) fn rule(api_group: &str, resources: &[&str], verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec![api_group.to_string()]),
        resources: Some(resources.iter().map(|r| r.to_string()).collect()),
        verbs: verbs.iter().map(|v| v.to_string()).collect(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_lists_group_resources_and_verbs() {
        let r = rule("fleet.cattle.io", &["contents"], &["get"]);
        assert_eq!(r.api_groups, Some(vec!["fleet.cattle.io".to_string()]));
        assert_eq!(r.resources, Some(vec!["contents".to_string()]));
        assert_eq!(r.verbs, vec!["get".to_string()]);
    }

    #[test]
    fn token_secret_is_annotated_for_the_token_controller() {
        let obj = token_secret("ns", "tok", "sa").unwrap();
        assert_eq!(obj.data["type"], SERVICE_ACCOUNT_TOKEN_TYPE);
        assert_eq!(
            obj.metadata.annotations.unwrap()[SERVICE_ACCOUNT_NAME_ANNOTATION],
            "sa"
        );
    }
}
