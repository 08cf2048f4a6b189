//! Bundle, BundleDeployment and BundleNamespaceMapping CRDs
//!
//! A Bundle is a set of manifests plus the targets it should reach. The
//! bundle control loop turns each (bundle, target cluster) pair into a
//! BundleDeployment in the cluster's namespace.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::BundleSummary;

/// Manifests to deliver plus the clusters they should reach
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "fleet.cattle.io",
    version = "v1alpha1",
    kind = "Bundle",
    namespaced,
    status = "BundleStatus",
    printcolumn = r#"{"name":"Bundledeployments-Ready","type":"string","jsonPath":".status.display.readyClusters"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BundleSpec {
    /// Stop creating or updating deployments
    #[serde(default)]
    pub paused: bool,

    /// Namespace resources are deployed to when they name none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_namespace: Option<String>,

    /// Manifests making up the bundle
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<BundleResource>,

    /// Target rules; a cluster gets the bundle if any rule matches
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<BundleTarget>,
}

/// One manifest file in a bundle
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BundleResource {
    /// File name the manifest came from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Manifest text (or encoded bytes, see `encoding`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    /// Encoding of `content` ("base64+gz" or empty for plain text)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
}

/// Rule selecting clusters for a bundle
///
/// Every criterion that is set must match. A rule with no criteria matches
/// nothing.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BundleTarget {
    /// Name reported for deployments created by this rule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Exact cluster name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,

    /// Selector over cluster labels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_selector: Option<LabelSelector>,

    /// Exact cluster group name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_group: Option<String>,

    /// Selector over cluster group labels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_group_selector: Option<LabelSelector>,
}

impl BundleTarget {
    /// Whether the rule names at least one criterion
    pub fn has_criteria(&self) -> bool {
        self.cluster_name.is_some()
            || self.cluster_selector.is_some()
            || self.cluster_group.is_some()
            || self.cluster_group_selector.is_some()
    }
}

/// Observed state of a Bundle
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BundleStatus {
    /// Rolled-up deployment counts
    #[serde(default)]
    pub summary: BundleSummary,

    /// Manifest id of the current resources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources_sha256_sum: Option<String>,

    /// Human-readable columns
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<BundleDisplay>,
}

/// Display columns for a Bundle
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BundleDisplay {
    /// "ready/desired" deployment count
    #[serde(default)]
    pub ready_clusters: String,
}

/// One bundle destined for one cluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "fleet.cattle.io",
    version = "v1alpha1",
    kind = "BundleDeployment",
    namespaced,
    status = "BundleDeploymentStatus",
    printcolumn = r#"{"name":"Deployed","type":"string","jsonPath":".status.appliedDeploymentID"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BundleDeploymentSpec {
    /// Manifest id the agent should deploy
    #[serde(default, rename = "deploymentID")]
    pub deployment_id: String,

    /// Stop the agent from applying changes
    #[serde(default)]
    pub paused: bool,

    /// Namespace resources are deployed to when they name none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_namespace: Option<String>,
}

/// State reported by the agent
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BundleDeploymentStatus {
    /// Manifest id the agent last applied
    #[serde(default, rename = "appliedDeploymentID", skip_serializing_if = "Option::is_none")]
    pub applied_deployment_id: Option<String>,

    /// Every deployed resource is ready
    #[serde(default)]
    pub ready: bool,

    /// No deployed resource drifted from its manifest
    #[serde(default)]
    pub non_modified: bool,
}

impl BundleDeployment {
    /// Whether the agent has applied the current manifest and reports ready
    pub fn is_ready(&self) -> bool {
        match &self.status {
            Some(status) => {
                status.ready
                    && status.applied_deployment_id.as_deref() == Some(&self.spec.deployment_id)
            }
            None => false,
        }
    }

    /// Whether the agent has not applied the current manifest yet
    pub fn is_pending(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.applied_deployment_id.as_deref())
            != Some(self.spec.deployment_id.as_str())
    }
}

/// Summarize a set of deployments against the number expected
pub fn summarize<'a>(
    desired: usize,
    deployments: impl IntoIterator<Item = &'a BundleDeployment>,
) -> BundleSummary {
    let mut summary = BundleSummary {
        desired_ready: i32::try_from(desired).unwrap_or(i32::MAX),
        ..Default::default()
    };
    for bd in deployments {
        if bd.is_ready() {
            summary.ready += 1;
        } else if bd.is_pending() {
            summary.pending += 1;
        } else {
            summary.not_ready += 1;
        }
    }
    summary
}

/// Shares bundles in one namespace with clusters in other namespaces
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "fleet.cattle.io",
    version = "v1alpha1",
    kind = "BundleNamespaceMapping",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct BundleNamespaceMappingSpec {
    /// Bundles in the mapping's namespace that are shared
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_selector: Option<LabelSelector>,

    /// Namespaces whose clusters may receive the shared bundles
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<LabelSelector>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment(id: &str, applied: Option<&str>, ready: bool) -> BundleDeployment {
        let mut bd = BundleDeployment::new(
            "app",
            BundleDeploymentSpec {
                deployment_id: id.to_string(),
                ..Default::default()
            },
        );
        bd.status = Some(BundleDeploymentStatus {
            applied_deployment_id: applied.map(str::to_string),
            ready,
            non_modified: true,
        });
        bd
    }

    #[test]
    fn ready_requires_current_manifest() {
        assert!(deployment("s-1", Some("s-1"), true).is_ready());
        assert!(!deployment("s-2", Some("s-1"), true).is_ready());
        assert!(deployment("s-2", Some("s-1"), true).is_pending());
    }

    #[test]
    fn summary_counts_each_state() {
        let bds = [
            deployment("s-1", Some("s-1"), true),
            deployment("s-1", None, false),
            deployment("s-1", Some("s-1"), false),
        ];
        let summary = summarize(4, bds.iter());
        assert_eq!(summary.desired_ready, 4);
        assert_eq!(summary.ready, 1);
        assert_eq!(summary.pending, 1);
        assert_eq!(summary.not_ready, 1);
    }

    #[test]
    fn target_without_criteria_is_flagged() {
        assert!(!BundleTarget::default().has_criteria());
        let target = BundleTarget {
            cluster_group: Some("prod".to_string()),
            ..Default::default()
        };
        assert!(target.has_criteria());
    }
}
