//! Config loop: keeps the published controller configuration current
//!
//! Registration reads the ConfigMap once so loops registered later see a
//! configuration before any informer is started.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::controller::Action;
use kube::runtime::Controller;
use kube::{Api, ResourceExt};
use tracing::{debug, info};

use fleet_common::Error;

use super::{error_policy, log_reconcile_result, watcher_config, ReconcileError};
use crate::config::{ConfigHandle, FleetConfig, CONFIG_MAP_NAME};
use crate::informer::LoopInstaller;

/// Loop name
pub const NAME: &str = "config";

/// What the config loop may touch
pub struct ConfigView {
    /// ConfigMaps in the system namespace
    pub config_maps: Api<ConfigMap>,
    /// Where parsed configurations are published
    pub handle: ConfigHandle,
    /// Core factory installer
    pub installer: LoopInstaller,
}

struct Context {
    handle: ConfigHandle,
}

/// Load the current configuration and install the loop
pub async fn register(view: ConfigView) -> Result<(), Error> {
    let initial = view
        .config_maps
        .get_opt(CONFIG_MAP_NAME)
        .await
        .map_err(|e| Error::registration(NAME, format!("reading {CONFIG_MAP_NAME}: {e}")))?;

    let config = match initial {
        Some(cm) => FleetConfig::from_config_map(&cm)
            .map_err(|e| Error::registration(NAME, e.to_string()))?,
        None => {
            info!(config_map = CONFIG_MAP_NAME, "no controller config found, using defaults");
            FleetConfig::default()
        }
    };
    view.handle.publish(config);

    let ctx = Arc::new(Context {
        handle: view.handle,
    });
    let cfg = watcher_config().fields(&format!("metadata.name={CONFIG_MAP_NAME}"));
    view.installer.install(
        NAME,
        Controller::new(view.config_maps, cfg)
            .run(reconcile, error_policy, ctx)
            .for_each(log_reconcile_result("ConfigMap")),
    );
    Ok(())
}

async fn reconcile(cm: Arc<ConfigMap>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    if cm.name_any() != CONFIG_MAP_NAME {
        return Ok(Action::await_change());
    }
    apply_config_map(&ctx.handle, &cm)?;
    Ok(Action::await_change())
}

fn apply_config_map(handle: &ConfigHandle, cm: &ConfigMap) -> Result<bool, ReconcileError> {
    let config = FleetConfig::from_config_map(cm)?;
    let changed = handle.publish(config);
    if changed {
        info!(config_map = CONFIG_MAP_NAME, "controller config updated");
    } else {
        debug!(config_map = CONFIG_MAP_NAME, "controller config unchanged");
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CONFIG_KEY;
    use std::collections::BTreeMap;

    fn config_map(raw: &str) -> ConfigMap {
        ConfigMap {
            metadata: super::super::object_meta(CONFIG_MAP_NAME, Some("cattle-fleet-system")),
            data: Some(BTreeMap::from([(CONFIG_KEY.to_string(), raw.to_string())])),
            ..Default::default()
        }
    }

    #[test]
    fn story_config_edits_are_published_once() {
        let handle = ConfigHandle::new();
        let mut rx = handle.subscribe();

        let cm = config_map(r#"{"agentImage":"rancher/fleet-agent:v1"}"#);
        assert!(apply_config_map(&handle, &cm).unwrap());
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        // same content again: no notification
        assert!(!apply_config_map(&handle, &cm).unwrap());
        assert!(!rx.has_changed().unwrap());

        let current = handle.current().unwrap();
        assert_eq!(current.agent_image, "rancher/fleet-agent:v1");
    }

    #[test]
    fn malformed_config_keeps_previous_value() {
        let handle = ConfigHandle::new();
        apply_config_map(&handle, &config_map(r#"{"agentImage":"a"}"#)).unwrap();

        let err = apply_config_map(&handle, &config_map("{not json")).unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(handle.current().unwrap().agent_image, "a");
    }

    #[tokio::test]
    async fn register_fails_when_api_server_is_unreachable() {
        let ctx = crate::capabilities::offline_context().await;
        let view = ConfigView {
            config_maps: Api::namespaced(ctx.client().clone(), "cattle-fleet-system"),
            handle: ctx.config(),
            installer: ctx.core().installer(),
        };
        let err = register(view).await.unwrap_err();
        assert!(matches!(err, Error::Registration { controller, .. } if controller == NAME));
        assert!(ctx.core().installed_loops().is_empty());
    }
}
