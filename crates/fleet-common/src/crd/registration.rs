//! ClusterRegistration and ClusterRegistrationToken CRDs
//!
//! Agents create a ClusterRegistration in the registration namespace using
//! credentials handed out through a ClusterRegistrationToken.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Request from an agent to join the fleet
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "fleet.cattle.io",
    version = "v1alpha1",
    kind = "ClusterRegistration",
    namespaced,
    status = "ClusterRegistrationStatus",
    printcolumn = r#"{"name":"Cluster-Name","type":"string","jsonPath":".status.clusterName"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRegistrationSpec {
    /// Stable identifier of the registering agent
    #[serde(default, rename = "clientID")]
    pub client_id: String,

    /// Per-attempt random value; a new one creates a new registration
    #[serde(default)]
    pub client_random: String,

    /// Labels to put on the Cluster created for this agent
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub cluster_labels: BTreeMap<String, String>,
}

/// Outcome of a registration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRegistrationStatus {
    /// Cluster the agent was assigned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,

    /// Credentials have been issued
    #[serde(default)]
    pub granted: bool,
}

impl ClusterRegistration {
    /// Whether credentials were issued for this registration
    pub fn is_granted(&self) -> bool {
        self.status.as_ref().map(|s| s.granted).unwrap_or(false)
    }
}

/// Token agents present to create a ClusterRegistration
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "fleet.cattle.io",
    version = "v1alpha1",
    kind = "ClusterRegistrationToken",
    namespaced,
    status = "ClusterRegistrationTokenStatus",
    printcolumn = r#"{"name":"Secret-Name","type":"string","jsonPath":".status.secretName"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRegistrationTokenSpec {
    /// Token lifetime as a duration string ("12h"); unset means no expiry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,
}

/// Where the issued token can be found
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRegistrationTokenStatus {
    /// Secret holding the token values
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
}
