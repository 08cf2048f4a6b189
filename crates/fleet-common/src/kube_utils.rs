//! Shared Kubernetes utilities using kube-rs

use std::fmt::Write;
use std::path::PathBuf;
use std::time::Duration;

use kube::api::{Api, DynamicObject, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde::Serialize;

use crate::Error;

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Where and how to reach the API server
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Explicit kubeconfig file; falls back to in-cluster or `$KUBECONFIG`
    pub kubeconfig: Option<PathBuf>,
    /// Kubeconfig context to use instead of the current one
    pub context: Option<String>,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Per-request read timeout
    pub read_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            kubeconfig: None,
            context: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

/// Resolve a client configuration from an explicit kubeconfig, a context, or the environment
///
/// kube-rs applies no client-side request throttling, so nothing needs to be
/// switched off for the controller's burst of initial list/watch calls.
pub async fn resolve_config(connection: &ConnectionConfig) -> Result<Config, Error> {
    let options = KubeConfigOptions {
        context: connection.context.clone(),
        ..Default::default()
    };

    let mut config = match (&connection.kubeconfig, &connection.context) {
        (Some(path), _) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::connection("config", format!("failed to read kubeconfig: {e}"))
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &options)
                .await
                .map_err(|e| {
                    Error::connection("config", format!("failed to load kubeconfig: {e}"))
                })?
        }
        (None, Some(_)) => Config::from_kubeconfig(&options)
            .await
            .map_err(|e| Error::connection("config", format!("failed to load kubeconfig: {e}")))?,
        (None, None) => Config::infer()
            .await
            .map_err(|e| Error::connection("config", format!("failed to infer config: {e}")))?,
    };

    config.connect_timeout = Some(connection.connect_timeout);
    config.read_timeout = Some(connection.read_timeout);
    Ok(config)
}

/// Build a client from a resolved configuration
pub fn create_client(config: Config) -> Result<Client, Error> {
    Client::try_from(config)
        .map_err(|e| Error::connection("config", format!("failed to create client: {e}")))
}

/// Compute a deterministic hash of the input string, returning a 16-char hex digest.
///
/// Uses truncated SHA-256 so the value is stable across toolchains; it is
/// persisted in labels and object names.
pub fn deterministic_hash(input: &str) -> String {
    hex(&sha256(input.as_bytes())[..8])
}

/// Full SHA-256 of `bytes` as lowercase hex
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex(&sha256(bytes))
}

fn sha256(bytes: &[u8]) -> Vec<u8> {
    use aws_lc_rs::digest;
    digest::digest(&digest::SHA256, bytes).as_ref().to_vec()
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
            let _ = write!(s, "{:02x}", b);
            s
        })
}

/// Convert a typed object (which serializes its apiVersion and kind) into a DynamicObject
pub fn to_dynamic(object: &impl Serialize) -> Result<DynamicObject, Error> {
    let value = serde_json::to_value(object)?;
    Ok(serde_json::from_value(value)?)
}

/// Merge-patch the status sub-resource of a namespaced object.
///
/// Returns `kube::Error` so callers can map to their own error type.
pub async fn patch_status<K>(
    api: &Api<K>,
    name: &str,
    status: &impl Serialize,
) -> std::result::Result<(), kube::Error>
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    let patch = serde_json::json!({ "status": status });
    api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Secret;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    #[test]
    fn deterministic_hash_is_stable_and_short() {
        let a = deterministic_hash("bundle-fleet-default-app");
        assert_eq!(a.len(), 16);
        assert_eq!(a, deterministic_hash("bundle-fleet-default-app"));
        assert_ne!(a, deterministic_hash("bundle-fleet-default-other"));
    }

    #[test]
    fn sha256_hex_matches_known_digest() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn typed_objects_convert_to_dynamic() {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some("token".to_string()),
                namespace: Some("fleet-default".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let obj = to_dynamic(&secret).unwrap();
        let types = obj.types.unwrap();
        assert_eq!(types.api_version, "v1");
        assert_eq!(types.kind, "Secret");
        assert_eq!(obj.metadata.name.as_deref(), Some("token"));
    }

    #[test]
    fn default_connection_uses_standard_timeouts() {
        let connection = ConnectionConfig::default();
        assert_eq!(connection.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(connection.read_timeout, DEFAULT_READ_TIMEOUT);
        assert!(connection.kubeconfig.is_none());
    }
}
