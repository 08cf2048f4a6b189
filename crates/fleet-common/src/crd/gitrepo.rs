//! GitRepo and GitRepoRestriction CRDs

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::bundle::BundleTarget;
use super::types::BundleSummary;

/// A git repository whose paths are turned into bundles
///
/// Example:
/// ```yaml
/// apiVersion: fleet.cattle.io/v1alpha1
/// kind: GitRepo
/// metadata:
///   name: apps
///   namespace: fleet-default
/// spec:
///   repo: https://github.com/example/apps
///   branch: main
///   paths: [web, db]
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "fleet.cattle.io",
    version = "v1alpha1",
    kind = "GitRepo",
    namespaced,
    status = "GitRepoStatus",
    printcolumn = r#"{"name":"Repo","type":"string","jsonPath":".spec.repo"}"#,
    printcolumn = r#"{"name":"Commit","type":"string","jsonPath":".status.commit"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct GitRepoSpec {
    /// Repository URL
    pub repo: String,

    /// Branch to follow
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,

    /// Fixed revision; overrides branch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,

    /// Directories scanned for bundles
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<String>,

    /// Secret with git credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret_name: Option<String>,

    /// Service account the bundle writer runs as
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,

    /// Targets applied to every bundle produced from this repo
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<GitTarget>,
}

/// Target rule attached to a GitRepo
pub type GitTarget = BundleTarget;

/// Observed state of a GitRepo
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GitRepoStatus {
    /// Commit last processed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,

    /// Rolled-up counts over the repo's bundle deployments
    #[serde(default)]
    pub summary: BundleSummary,
}

/// Limits what GitRepos in a namespace may use
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "fleet.cattle.io",
    version = "v1alpha1",
    kind = "GitRepoRestriction",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct GitRepoRestrictionSpec {
    /// Service account used when a GitRepo names none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_service_account: Option<String>,

    /// Service accounts GitRepos may name; empty allows any
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_service_accounts: Vec<String>,

    /// Repository URL patterns GitRepos may use; empty allows any.
    /// A trailing `*` matches any suffix.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_repo_patterns: Vec<String>,
}
