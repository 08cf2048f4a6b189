//! Cluster and ClusterGroup CRDs
//!
//! A Cluster represents one downstream cluster running a fleet agent. Each
//! cluster gets its own namespace in the management cluster where its
//! BundleDeployments are written.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::BundleSummary;

/// A downstream cluster managed by fleet
///
/// Example:
/// ```yaml
/// apiVersion: fleet.cattle.io/v1alpha1
/// kind: Cluster
/// metadata:
///   name: prod-east
///   namespace: fleet-default
///   labels:
///     env: prod
/// spec:
///   kubeConfigSecret: prod-east-kubeconfig
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "fleet.cattle.io",
    version = "v1alpha1",
    kind = "Cluster",
    namespaced,
    status = "ClusterStatus",
    printcolumn = r#"{"name":"Bundles-Ready","type":"string","jsonPath":".status.display.readyBundles"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Stop delivering new bundle versions to this cluster
    #[serde(default)]
    pub paused: bool,

    /// Identifier the agent registered with
    #[serde(default, rename = "clientID", skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// Secret holding a kubeconfig used to import the cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube_config_secret: Option<String>,

    /// Bump to force the agent to be redeployed
    #[serde(default)]
    pub redeploy_agent_generation: i64,

    /// Namespace the agent runs in on the downstream cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_namespace: Option<String>,
}

/// Observed state of a Cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Namespace in the management cluster holding this cluster's deployments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Agent generation last imported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_deployed_generation: Option<i64>,

    /// Rolled-up deployment counts
    #[serde(default)]
    pub summary: BundleSummary,

    /// Human-readable columns
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<ClusterDisplay>,
}

/// Display columns for a Cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDisplay {
    /// "ready/desired" bundle count
    #[serde(default)]
    pub ready_bundles: String,
}

/// A named set of clusters selected by label
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "fleet.cattle.io",
    version = "v1alpha1",
    kind = "ClusterGroup",
    namespaced,
    status = "ClusterGroupStatus",
    printcolumn = r#"{"name":"Clusters-Ready","type":"string","jsonPath":".status.display.readyClusters"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterGroupSpec {
    /// Clusters in the group's namespace matching this selector are members.
    /// A missing selector selects nothing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
}

/// Observed state of a ClusterGroup
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterGroupStatus {
    /// Number of member clusters
    #[serde(default)]
    pub cluster_count: i32,

    /// Number of member clusters with bundles not ready
    #[serde(default)]
    pub non_ready_cluster_count: i32,

    /// Human-readable columns
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<ClusterGroupDisplay>,
}

/// Display columns for a ClusterGroup
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterGroupDisplay {
    /// "ready/total" cluster count
    #[serde(default)]
    pub ready_clusters: String,
}

impl Cluster {
    /// Labels used for selector matching
    pub fn labels_or_empty(&self) -> BTreeMap<String, String> {
        self.metadata.labels.clone().unwrap_or_default()
    }

    /// Namespace holding this cluster's deployments, once assigned
    pub fn deployment_namespace(&self) -> Option<&str> {
        self.status.as_ref()?.namespace.as_deref()
    }

    /// Whether every bundle targeted at this cluster is ready
    pub fn bundles_ready(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| s.summary.is_ready())
            .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_spec_uses_fleet_field_names() {
        let spec = ClusterSpec {
            client_id: Some("abc".to_string()),
            kube_config_secret: Some("kc".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["clientID"], "abc");
        assert_eq!(json["kubeConfigSecret"], "kc");
    }

    #[test]
    fn deployment_namespace_comes_from_status() {
        let mut cluster = Cluster::new("c1", ClusterSpec::default());
        assert_eq!(cluster.deployment_namespace(), None);
        cluster.status = Some(ClusterStatus {
            namespace: Some("cluster-fleet-default-c1-abc".to_string()),
            ..Default::default()
        });
        assert_eq!(
            cluster.deployment_namespace(),
            Some("cluster-fleet-default-c1-abc")
        );
    }
}
