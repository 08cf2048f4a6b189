//! Shared status types

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Deployment counts rolled up from BundleDeployments
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BundleSummary {
    /// Number of deployments that should exist
    #[serde(default)]
    pub desired_ready: i32,
    /// Number of deployments reporting ready
    #[serde(default)]
    pub ready: i32,
    /// Number of deployments not yet applied by their agent
    #[serde(default)]
    pub pending: i32,
    /// Number of deployments applied but not ready
    #[serde(default)]
    pub not_ready: i32,
}

impl BundleSummary {
    /// Whether every desired deployment is ready
    pub fn is_ready(&self) -> bool {
        self.ready >= self.desired_ready
    }

    /// "ready/desired" as shown in display columns
    pub fn ratio(&self) -> String {
        format!("{}/{}", self.ready, self.desired_ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_summary_is_ready() {
        assert!(BundleSummary::default().is_ready());
        assert_eq!(BundleSummary::default().ratio(), "0/0");
    }

    #[test]
    fn partial_summary_is_not_ready() {
        let summary = BundleSummary {
            desired_ready: 3,
            ready: 2,
            pending: 1,
            not_ready: 0,
        };
        assert!(!summary.is_ready());
        assert_eq!(summary.ratio(), "2/3");
    }
}
