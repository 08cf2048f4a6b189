//! Process-wide controller configuration
//!
//! Read from the `fleet-controller` ConfigMap in the system namespace. The
//! config loop publishes every parsed version through a [`ConfigHandle`];
//! loops that depend on it (manage-agent, bootstrap) read the latest value.

use std::sync::Arc;

use k8s_openapi::api::core::v1::ConfigMap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use fleet_common::Error;

/// Name of the ConfigMap holding the controller configuration
pub const CONFIG_MAP_NAME: &str = "fleet-controller";

/// Key within the ConfigMap holding the JSON document
pub const CONFIG_KEY: &str = "config";

/// Default namespace for the local cluster and its bootstrap objects
pub const DEFAULT_BOOTSTRAP_NAMESPACE: &str = "fleet-local";

/// Controller configuration document
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FleetConfig {
    /// Image used for agents deployed to downstream clusters
    #[serde(default)]
    pub agent_image: String,

    /// Pull policy for the agent image
    #[serde(default)]
    pub agent_image_pull_policy: String,

    /// API server URL handed to agents; defaults to the controller's own
    #[serde(default, rename = "apiServerURL")]
    pub api_server_url: String,

    /// Base64 CA bundle for the API server
    #[serde(default, rename = "apiServerCA")]
    pub api_server_ca: String,

    /// How often agents check in ("15m")
    #[serde(default, rename = "agentCheckinInterval", skip_serializing_if = "Option::is_none")]
    pub agent_checkin_interval: Option<String>,

    /// Whether the controller manages agent bundles
    #[serde(default = "default_true")]
    pub manage_agent: bool,

    /// Local cluster bootstrap settings
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
}

/// Settings for registering the management cluster itself
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapConfig {
    /// Namespace for the local cluster; empty disables bootstrap
    #[serde(default = "default_bootstrap_namespace")]
    pub namespace: String,

    /// Namespace the local agent runs in
    #[serde(default)]
    pub agent_namespace: String,

    /// Optional git repository applied to the local cluster
    #[serde(default)]
    pub repo: String,

    /// Branch of the bootstrap repository
    #[serde(default)]
    pub branch: String,

    /// Paths within the bootstrap repository
    #[serde(default)]
    pub paths: String,

    /// Secret with credentials for the bootstrap repository
    #[serde(default)]
    pub secret: String,
}

fn default_true() -> bool {
    true
}

fn default_bootstrap_namespace() -> String {
    DEFAULT_BOOTSTRAP_NAMESPACE.to_string()
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            namespace: default_bootstrap_namespace(),
            agent_namespace: String::new(),
            repo: String::new(),
            branch: String::new(),
            paths: String::new(),
            secret: String::new(),
        }
    }
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            agent_image: String::new(),
            agent_image_pull_policy: String::new(),
            api_server_url: String::new(),
            api_server_ca: String::new(),
            agent_checkin_interval: None,
            manage_agent: true,
            bootstrap: BootstrapConfig::default(),
        }
    }
}

impl FleetConfig {
    /// Parse the configuration from a ConfigMap; a missing key yields defaults
    pub fn from_config_map(cm: &ConfigMap) -> Result<Self, Error> {
        match cm.data.as_ref().and_then(|d| d.get(CONFIG_KEY)) {
            Some(raw) if !raw.trim().is_empty() => Self::parse(raw),
            _ => Ok(Self::default()),
        }
    }

    /// Parse a JSON configuration document
    pub fn parse(raw: &str) -> Result<Self, Error> {
        serde_json::from_str(raw)
            .map_err(|e| Error::serialization(format!("invalid {CONFIG_MAP_NAME} config: {e}")))
    }
}

/// Shared, observable handle to the current configuration
#[derive(Clone)]
pub struct ConfigHandle {
    tx: Arc<watch::Sender<Option<Arc<FleetConfig>>>>,
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigHandle {
    /// Handle with no configuration published yet
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Publish a new configuration; returns whether it differs from the previous one
    pub fn publish(&self, config: FleetConfig) -> bool {
        self.tx.send_if_modified(|current| {
            if current.as_deref() == Some(&config) {
                return false;
            }
            *current = Some(Arc::new(config));
            true
        })
    }

    /// Latest configuration, if one has been published
    pub fn current(&self) -> Option<Arc<FleetConfig>> {
        self.tx.borrow().clone()
    }

    /// Receiver notified on every change
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<FleetConfig>>> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn config_map(raw: Option<&str>) -> ConfigMap {
        ConfigMap {
            data: raw.map(|r| BTreeMap::from([(CONFIG_KEY.to_string(), r.to_string())])),
            ..Default::default()
        }
    }

    #[test]
    fn missing_data_yields_defaults() {
        let cfg = FleetConfig::from_config_map(&config_map(None)).unwrap();
        assert!(cfg.manage_agent);
        assert_eq!(cfg.bootstrap.namespace, DEFAULT_BOOTSTRAP_NAMESPACE);
    }

    #[test]
    fn parses_fleet_field_names() {
        let raw = r#"{
            "agentImage": "rancher/fleet-agent:v0.9",
            "apiServerURL": "https://example:6443",
            "manageAgent": false,
            "bootstrap": {"namespace": "", "repo": "https://git/x"}
        }"#;
        let cfg = FleetConfig::from_config_map(&config_map(Some(raw))).unwrap();
        assert_eq!(cfg.agent_image, "rancher/fleet-agent:v0.9");
        assert_eq!(cfg.api_server_url, "https://example:6443");
        assert!(!cfg.manage_agent);
        assert_eq!(cfg.bootstrap.namespace, "");
        assert_eq!(cfg.bootstrap.repo, "https://git/x");
    }

    #[test]
    fn malformed_config_is_a_serialization_error() {
        let err = FleetConfig::from_config_map(&config_map(Some("{not json"))).unwrap_err();
        assert!(matches!(err, Error::Serialization { .. }));
    }

    #[tokio::test]
    async fn handle_publishes_only_changes() {
        let handle = ConfigHandle::new();
        let mut rx = handle.subscribe();
        assert!(handle.current().is_none());

        assert!(handle.publish(FleetConfig::default()));
        rx.changed().await.unwrap();
        assert!(rx.borrow().is_some());

        assert!(!handle.publish(FleetConfig::default()));
        let changed = FleetConfig {
            agent_image: "img".to_string(),
            ..Default::default()
        };
        assert!(handle.publish(changed));
        assert_eq!(handle.current().unwrap().agent_image, "img");
    }
}
