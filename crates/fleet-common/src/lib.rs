//! Common types for the fleet controller: resource kinds, CRDs, errors, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod kinds;
pub mod kube_utils;
pub mod leader_election;
pub mod namespace;
pub mod selector;
pub mod telemetry;

pub use error::Error;
pub use kinds::{ResourceDomain, ResourceKind};
pub use namespace::{registration_namespace, Namespaces};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// System namespace the controller runs in when none is configured
pub const DEFAULT_SYSTEM_NAMESPACE: &str = "cattle-fleet-system";

/// Name of the lease used to elect the active controller replica
pub const CONTROLLER_LOCK_NAME: &str = "fleet-controller-lock";

/// API group of the fleet resources
pub const FLEET_GROUP: &str = "fleet.cattle.io";

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "fleet-controller";

/// Label carrying the name of the bundle a BundleDeployment was created for
pub const BUNDLE_NAME_LABEL: &str = "fleet.cattle.io/bundle-name";

/// Label carrying the namespace of the bundle a BundleDeployment was created for
pub const BUNDLE_NAMESPACE_LABEL: &str = "fleet.cattle.io/bundle-namespace";

/// Label carrying the GitRepo a bundle was produced from
pub const REPO_NAME_LABEL: &str = "fleet.cattle.io/repo-name";

/// Label marking namespaces created for a registered cluster
pub const MANAGED_LABEL: &str = "fleet.cattle.io/managed";

/// Label carrying the cluster name on its per-cluster namespace
pub const CLUSTER_LABEL: &str = "fleet.cattle.io/cluster";

/// Label carrying the cluster's own namespace on its per-cluster namespace
pub const CLUSTER_NAMESPACE_LABEL: &str = "fleet.cattle.io/cluster-namespace";
