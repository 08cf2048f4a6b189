//! Content resource: content-addressed manifest storage
//!
//! Content has no spec/status split, so it implements `kube::Resource` by
//! hand instead of going through the CustomResource derive.

use std::borrow::Cow;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::Resource;
use serde::{Deserialize, Serialize};

const GROUP: &str = "fleet.cattle.io";
const VERSION: &str = "v1alpha1";
const KIND: &str = "Content";

/// Cluster-scoped blob holding a serialized bundle manifest
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    /// Always `fleet.cattle.io/v1alpha1`
    #[serde(default)]
    pub api_version: String,
    /// Always `Content`
    #[serde(default)]
    pub kind: String,
    /// Standard object metadata; the name is the manifest id
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Serialized manifest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<ByteString>,
}

impl Content {
    /// Build a Content object holding `bytes` under `name`
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            api_version: format!("{GROUP}/{VERSION}"),
            kind: KIND.to_string(),
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..Default::default()
            },
            content: Some(ByteString(bytes)),
        }
    }

    /// Stored bytes, empty if none
    pub fn bytes(&self) -> &[u8] {
        self.content.as_ref().map(|b| b.0.as_slice()).unwrap_or(&[])
    }
}

impl Resource for Content {
    type DynamicType = ();
    type Scope = k8s_openapi::ClusterResourceScope;

    fn kind(_: &()) -> Cow<'_, str> {
        Cow::Borrowed(KIND)
    }

    fn group(_: &()) -> Cow<'_, str> {
        Cow::Borrowed(GROUP)
    }

    fn version(_: &()) -> Cow<'_, str> {
        Cow::Borrowed(VERSION)
    }

    fn plural(_: &()) -> Cow<'_, str> {
        Cow::Borrowed("contents")
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_serializes_with_type_meta_and_base64() {
        let content = Content::new("s-abc", b"hello".to_vec());
        let json = serde_json::to_value(&content).unwrap();
        assert_eq!(json["apiVersion"], "fleet.cattle.io/v1alpha1");
        assert_eq!(json["kind"], "Content");
        assert_eq!(json["metadata"]["name"], "s-abc");
        assert_eq!(json["content"], "aGVsbG8=");
    }

    #[test]
    fn resource_metadata_matches_fleet_group() {
        assert_eq!(Content::api_version(&()), "fleet.cattle.io/v1alpha1");
        assert_eq!(Content::plural(&()), "contents");
    }
}
