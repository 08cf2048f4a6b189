//! Content-addressed manifest storage
//!
//! A bundle's resources are serialized and stored once in a cluster-scoped
//! Content object named after their digest. BundleDeployments reference the
//! digest, so identical manifests are shared and never rewritten.

use kube::api::{Api, PostParams};
use kube::Client;
use tracing::debug;

use fleet_common::crd::{BundleResource, Content};
use fleet_common::kube_utils::sha256_hex;
use fleet_common::Error;

/// Prefix of every manifest id
pub const MANIFEST_ID_PREFIX: &str = "s-";

/// Stores and loads bundle manifests by digest
#[derive(Clone)]
pub struct ManifestStore {
    contents: Api<Content>,
}

impl ManifestStore {
    /// Store writing Content objects through `client`
    pub fn new(client: Client) -> Self {
        Self {
            contents: Api::all(client),
        }
    }

    /// Serialize resources into the stored byte form
    pub fn encode(resources: &[BundleResource]) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(resources)?)
    }

    /// Digest-based id of a manifest
    pub fn manifest_id(resources: &[BundleResource]) -> Result<String, Error> {
        let bytes = Self::encode(resources)?;
        Ok(format!("{MANIFEST_ID_PREFIX}{}", sha256_hex(&bytes)))
    }

    /// Store `resources` if not already present and return their id
    pub async fn store(&self, resources: &[BundleResource]) -> Result<String, Error> {
        let bytes = Self::encode(resources)?;
        let id = format!("{MANIFEST_ID_PREFIX}{}", sha256_hex(&bytes));

        if self.contents.get_opt(&id).await?.is_some() {
            return Ok(id);
        }

        match self
            .contents
            .create(&PostParams::default(), &Content::new(&id, bytes))
            .await
        {
            Ok(_) => debug!(manifest = %id, "manifest stored"),
            Err(kube::Error::Api(e)) if e.code == 409 => {}
            Err(e) => return Err(e.into()),
        }
        Ok(id)
    }

    /// Load the resources stored under `id`
    pub async fn get(&self, id: &str) -> Result<Option<Vec<BundleResource>>, Error> {
        match self.contents.get_opt(id).await? {
            Some(content) => Ok(Some(serde_json::from_slice(content.bytes())?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(name: &str, body: &str) -> BundleResource {
        BundleResource {
            name: Some(name.to_string()),
            content: Some(body.to_string()),
            encoding: None,
        }
    }

    #[test]
    fn identical_manifests_share_an_id() {
        let a = vec![resource("cm.yaml", "kind: ConfigMap")];
        let b = vec![resource("cm.yaml", "kind: ConfigMap")];
        assert_eq!(
            ManifestStore::manifest_id(&a).unwrap(),
            ManifestStore::manifest_id(&b).unwrap()
        );
    }

    #[test]
    fn any_change_changes_the_id() {
        let a = ManifestStore::manifest_id(&[resource("cm.yaml", "v1")]).unwrap();
        let b = ManifestStore::manifest_id(&[resource("cm.yaml", "v2")]).unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with(MANIFEST_ID_PREFIX));
        assert_eq!(a.len(), MANIFEST_ID_PREFIX.len() + 64);
    }

    #[test]
    fn encoded_bytes_round_trip() {
        let resources = vec![resource("a.yaml", "x"), resource("b.yaml", "y")];
        let bytes = ManifestStore::encode(&resources).unwrap();
        let decoded: Vec<BundleResource> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, resources);
    }
}
