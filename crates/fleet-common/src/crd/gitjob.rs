//! GitJob CRD (gitjob.cattle.io)
//!
//! Written by the git control loop; a separate job runner clones the repo
//! and produces bundles.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Job that syncs a git repository into bundles
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "gitjob.cattle.io",
    version = "v1",
    kind = "GitJob",
    namespaced,
    status = "GitJobStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct GitJobSpec {
    /// Repository to follow
    pub git: GitInfo,

    /// Service account the job runs as
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,

    /// Bump to force a re-sync
    #[serde(default)]
    pub force_update_generation: i64,
}

/// Git source for a GitJob
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GitInfo {
    /// Repository URL
    pub repo: String,

    /// Branch to follow
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,

    /// Fixed revision
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,

    /// Secret with git credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_secret_name: Option<String>,
}

/// Observed state of a GitJob
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GitJobStatus {
    /// Commit the last job ran against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
}
