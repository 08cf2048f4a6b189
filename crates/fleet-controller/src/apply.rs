//! Declarative object-set applier
//!
//! A control loop hands the applier the complete desired state for a set
//! id. Every object is server-side applied and stamped with the set's hash
//! label; objects previously applied under the same set id that are no
//! longer desired are deleted. An applier only ever writes, lists or deletes
//! kinds in its [`CacheTypeSet`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::Client;
use tracing::{debug, info, warn};

use fleet_common::kube_utils::deterministic_hash;
use fleet_common::{Error, ResourceKind, FIELD_MANAGER};

/// Label holding the hash of the set id an object was applied under
pub const SET_HASH_LABEL: &str = "objectset.rio.cattle.io/hash";

/// Annotation holding the readable set id
pub const SET_ID_ANNOTATION: &str = "objectset.rio.cattle.io/id";

/// The kinds an applier may write, list or delete
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheTypeSet(BTreeSet<ResourceKind>);

impl CacheTypeSet {
    /// Set of the given kinds
    pub fn new(kinds: impl IntoIterator<Item = ResourceKind>) -> Self {
        Self(kinds.into_iter().collect())
    }

    /// Whether `kind` is in the set
    pub fn contains(&self, kind: ResourceKind) -> bool {
        self.0.contains(&kind)
    }

    /// Kinds in a stable order
    pub fn iter(&self) -> impl Iterator<Item = ResourceKind> + '_ {
        self.0.iter().copied()
    }

    /// Number of kinds
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<ResourceKind> for CacheTypeSet {
    fn from_iter<I: IntoIterator<Item = ResourceKind>>(iter: I) -> Self {
        Self::new(iter)
    }
}

/// Identity of one object touched by an apply
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    /// Kind string
    pub kind: String,
    /// Namespace, `None` for cluster-scoped objects
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// What one apply call did
#[derive(Debug, Default)]
pub struct ApplyReport {
    /// Objects written
    pub applied: Vec<ObjectKey>,
    /// Objects deleted because they left the desired set
    pub pruned: Vec<ObjectKey>,
    /// Desired objects refused because their kind is outside the applier's scope
    pub skipped: Vec<ObjectKey>,
}

/// Object storage the applier writes through
#[async_trait]
pub trait ApplyBackend: Send + Sync {
    /// Server-side apply one object
    async fn apply(&self, kind: ResourceKind, object: &DynamicObject) -> Result<(), Error>;

    /// List objects of `kind` in all namespaces matching `label_selector`
    async fn list(
        &self,
        kind: ResourceKind,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>, Error>;

    /// Delete one object; deleting a missing object succeeds
    async fn delete(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), Error>;
}

/// Backend writing to the API server
pub struct KubeApplyBackend {
    client: Client,
    params: PatchParams,
}

impl KubeApplyBackend {
    /// Backend using server-side apply with the controller's field manager
    pub fn new(client: Client) -> Self {
        Self {
            client,
            params: PatchParams::apply(FIELD_MANAGER).force(),
        }
    }

    fn api(&self, kind: ResourceKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = kind.api_resource();
        match namespace {
            Some(ns) if kind.namespaced() => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        }
    }
}

#[async_trait]
impl ApplyBackend for KubeApplyBackend {
    async fn apply(&self, kind: ResourceKind, object: &DynamicObject) -> Result<(), Error> {
        let name = object.metadata.name.as_deref().unwrap_or_default();
        self.api(kind, object.metadata.namespace.as_deref())
            .patch(name, &self.params, &Patch::Apply(object))
            .await
            .map_err(|e| Error::apply(kind.kind_str(), name, e.to_string()))?;
        Ok(())
    }

    async fn list(
        &self,
        kind: ResourceKind,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>, Error> {
        let list = self
            .api(kind, None)
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(list.items)
    }

    async fn delete(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), Error> {
        match self
            .api(kind, namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(Error::apply(kind.kind_str(), name, e.to_string())),
        }
    }
}

/// Declarative applier scoped to a set of kinds
///
/// `with_*` methods derive a new applier and leave the receiver unchanged.
/// A freshly constructed applier has an empty scope and writes nothing.
#[derive(Clone)]
pub struct Applier {
    backend: Arc<dyn ApplyBackend>,
    cache_types: CacheTypeSet,
    no_prune: CacheTypeSet,
    owner: Option<OwnerReference>,
    set_owner_reference: bool,
    block_owner_deletion: bool,
}

impl Applier {
    /// Root applier over `backend`
    pub fn new(backend: Arc<dyn ApplyBackend>) -> Self {
        Self {
            backend,
            cache_types: CacheTypeSet::default(),
            no_prune: CacheTypeSet::default(),
            owner: None,
            set_owner_reference: true,
            block_owner_deletion: false,
        }
    }

    /// Root applier writing to the API server
    pub fn for_client(client: Client) -> Self {
        Self::new(Arc::new(KubeApplyBackend::new(client)))
    }

    /// Derive an applier whose scope is exactly `kinds`
    pub fn with_cache_types(&self, kinds: impl IntoIterator<Item = ResourceKind>) -> Self {
        Self {
            cache_types: CacheTypeSet::new(kinds),
            ..self.clone()
        }
    }

    /// Derive an applier that never deletes objects of `kinds`
    pub fn with_no_prune(&self, kinds: impl IntoIterator<Item = ResourceKind>) -> Self {
        Self {
            no_prune: CacheTypeSet::new(kinds),
            ..self.clone()
        }
    }

    /// Derive an applier that stamps owner references (if enabled)
    pub fn with_owner(&self, owner: OwnerReference) -> Self {
        Self {
            owner: Some(owner),
            ..self.clone()
        }
    }

    /// Derive an applier with owner-reference stamping switched on or off
    pub fn with_set_owner_reference(&self, set: bool, block_owner_deletion: bool) -> Self {
        Self {
            set_owner_reference: set,
            block_owner_deletion,
            ..self.clone()
        }
    }

    /// Kinds this applier may touch
    pub fn cache_types(&self) -> &CacheTypeSet {
        &self.cache_types
    }

    /// Make the objects under `set_id` exactly `objects`
    ///
    /// Objects whose kind is outside the scope are skipped with a warning.
    /// After applying, every in-scope kind is listed by the set's hash label
    /// and objects not in the desired set are deleted.
    pub async fn apply(
        &self,
        set_id: &str,
        mut objects: Vec<DynamicObject>,
    ) -> Result<ApplyReport, Error> {
        let hash = deterministic_hash(set_id);
        let selector = format!("{SET_HASH_LABEL}={hash}");
        let mut report = ApplyReport::default();
        let mut desired = BTreeSet::new();

        objects.sort_by_key(|o| kind_priority(object_kind(o)));

        for mut object in objects {
            let name = object.metadata.name.clone().unwrap_or_default();
            let kind = match object_kind(&object) {
                Some(kind) if self.cache_types.contains(kind) => kind,
                other => {
                    let key = ObjectKey {
                        kind: other
                            .map(|k| k.kind_str().to_string())
                            .or_else(|| object.types.as_ref().map(|t| t.kind.clone()))
                            .unwrap_or_default(),
                        namespace: object.metadata.namespace.clone(),
                        name,
                    };
                    warn!(set = %set_id, object = %key, "kind outside applier scope, skipping");
                    report.skipped.push(key);
                    continue;
                }
            };
            if name.is_empty() {
                return Err(Error::apply(kind.kind_str(), "<unnamed>", "object has no name"));
            }
            if !kind.namespaced() {
                object.metadata.namespace = None;
            }

            object
                .metadata
                .labels
                .get_or_insert_with(BTreeMap::new)
                .insert(SET_HASH_LABEL.to_string(), hash.clone());
            object
                .metadata
                .annotations
                .get_or_insert_with(BTreeMap::new)
                .insert(SET_ID_ANNOTATION.to_string(), set_id.to_string());
            if let (true, Some(owner)) = (self.set_owner_reference, &self.owner) {
                let mut owner = owner.clone();
                owner.block_owner_deletion = Some(self.block_owner_deletion);
                object.metadata.owner_references = Some(vec![owner]);
            }

            self.backend.apply(kind, &object).await?;
            let key = object_key(kind, &object);
            debug!(set = %set_id, object = %key, "applied");
            desired.insert(key.clone());
            report.applied.push(key);
        }

        for kind in self.cache_types.iter() {
            if self.no_prune.contains(kind) {
                continue;
            }
            for existing in self.backend.list(kind, &selector).await? {
                let key = object_key(kind, &existing);
                if desired.contains(&key) {
                    continue;
                }
                self.backend
                    .delete(kind, key.namespace.as_deref(), &key.name)
                    .await?;
                info!(set = %set_id, object = %key, "pruned");
                report.pruned.push(key);
            }
        }

        Ok(report)
    }
}

fn object_kind(object: &DynamicObject) -> Option<ResourceKind> {
    let types = object.types.as_ref()?;
    ResourceKind::from_type_meta(&types.api_version, &types.kind)
}

fn object_key(kind: ResourceKind, object: &DynamicObject) -> ObjectKey {
    ObjectKey {
        kind: kind.kind_str().to_string(),
        namespace: if kind.namespaced() {
            object.metadata.namespace.clone()
        } else {
            None
        },
        name: object.metadata.name.clone().unwrap_or_default(),
    }
}

/// Namespaces and identities before the objects that reference them
fn kind_priority(kind: Option<ResourceKind>) -> u8 {
    match kind {
        Some(ResourceKind::Namespace) => 0,
        Some(ResourceKind::ServiceAccount | ResourceKind::Role | ResourceKind::ClusterRole) => 1,
        Some(ResourceKind::RoleBinding | ResourceKind::ClusterRoleBinding) => 2,
        _ => 3,
    }
}

/// In-memory backend for exercising appliers without an API server
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    type Key = (ResourceKind, Option<String>, String);

    #[derive(Default)]
    pub(crate) struct MemoryApplyBackend {
        objects: Mutex<BTreeMap<Key, DynamicObject>>,
        pub(crate) listed: Mutex<Vec<ResourceKind>>,
    }

    impl MemoryApplyBackend {
        pub(crate) fn insert(&self, kind: ResourceKind, object: DynamicObject) {
            let key = (
                kind,
                object.metadata.namespace.clone(),
                object.metadata.name.clone().unwrap_or_default(),
            );
            self.objects.lock().insert(key, object);
        }

        pub(crate) fn get(
            &self,
            kind: ResourceKind,
            namespace: Option<&str>,
            name: &str,
        ) -> Option<DynamicObject> {
            self.objects
                .lock()
                .get(&(kind, namespace.map(str::to_string), name.to_string()))
                .cloned()
        }

        pub(crate) fn names(&self, kind: ResourceKind) -> Vec<String> {
            self.objects
                .lock()
                .keys()
                .filter(|(k, _, _)| *k == kind)
                .map(|(_, _, name)| name.clone())
                .collect()
        }
    }

    #[async_trait]
    impl ApplyBackend for MemoryApplyBackend {
        async fn apply(&self, kind: ResourceKind, object: &DynamicObject) -> Result<(), Error> {
            self.insert(kind, object.clone());
            Ok(())
        }

        async fn list(
            &self,
            kind: ResourceKind,
            label_selector: &str,
        ) -> Result<Vec<DynamicObject>, Error> {
            self.listed.lock().push(kind);
            let (key, value) = label_selector.split_once('=').unwrap_or((label_selector, ""));
            Ok(self
                .objects
                .lock()
                .iter()
                .filter(|((k, _, _), _)| *k == kind)
                .filter(|(_, o)| {
                    o.metadata
                        .labels
                        .as_ref()
                        .and_then(|l| l.get(key))
                        .is_some_and(|v| v == value)
                })
                .map(|(_, o)| o.clone())
                .collect())
        }

        async fn delete(
            &self,
            kind: ResourceKind,
            namespace: Option<&str>,
            name: &str,
        ) -> Result<(), Error> {
            self.objects
                .lock()
                .remove(&(kind, namespace.map(str::to_string), name.to_string()));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MemoryApplyBackend;
    use super::*;
    use fleet_common::kube_utils::to_dynamic;
    use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn meta(ns: Option<&str>, name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: ns.map(str::to_string),
            ..Default::default()
        }
    }

    fn secret(ns: &str, name: &str) -> DynamicObject {
        to_dynamic(&Secret {
            metadata: meta(Some(ns), name),
            ..Default::default()
        })
        .unwrap()
    }

    fn config_map(ns: &str, name: &str) -> DynamicObject {
        to_dynamic(&ConfigMap {
            metadata: meta(Some(ns), name),
            ..Default::default()
        })
        .unwrap()
    }

    fn labelled(mut object: DynamicObject, set_id: &str) -> DynamicObject {
        object.metadata.labels = Some(BTreeMap::from([(
            SET_HASH_LABEL.to_string(),
            deterministic_hash(set_id),
        )]));
        object
    }

    fn applier(backend: &Arc<MemoryApplyBackend>) -> Applier {
        Applier::new(backend.clone() as Arc<dyn ApplyBackend>)
    }

    #[tokio::test]
    async fn out_of_scope_kinds_are_skipped_not_written() {
        let backend = Arc::new(MemoryApplyBackend::default());
        let scoped = applier(&backend).with_cache_types([ResourceKind::Secret]);

        let report = scoped
            .apply("set", vec![secret("ns", "a"), config_map("ns", "b")])
            .await
            .unwrap();

        assert_eq!(report.applied.len(), 1);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].kind, "ConfigMap");
        assert!(backend.get(ResourceKind::Secret, Some("ns"), "a").is_some());
        assert!(backend.get(ResourceKind::ConfigMap, Some("ns"), "b").is_none());
    }

    #[tokio::test]
    async fn prune_never_lists_kinds_outside_scope() {
        let backend = Arc::new(MemoryApplyBackend::default());
        backend.insert(ResourceKind::ConfigMap, labelled(config_map("ns", "c"), "set"));
        backend.insert(ResourceKind::Secret, labelled(secret("ns", "old"), "set"));
        let scoped = applier(&backend).with_cache_types([ResourceKind::Secret]);

        let report = scoped.apply("set", vec![secret("ns", "a")]).await.unwrap();

        assert_eq!(report.pruned.len(), 1);
        assert_eq!(report.pruned[0].name, "old");
        assert!(backend.get(ResourceKind::ConfigMap, Some("ns"), "c").is_some());
        assert_eq!(*backend.listed.lock(), vec![ResourceKind::Secret]);
    }

    #[tokio::test]
    async fn other_sets_are_left_alone() {
        let backend = Arc::new(MemoryApplyBackend::default());
        backend.insert(ResourceKind::Secret, labelled(secret("ns", "theirs"), "other-set"));
        let scoped = applier(&backend).with_cache_types([ResourceKind::Secret]);

        let report = scoped.apply("set", vec![]).await.unwrap();

        assert!(report.pruned.is_empty());
        assert!(backend.get(ResourceKind::Secret, Some("ns"), "theirs").is_some());
    }

    #[tokio::test]
    async fn applied_objects_carry_set_label_and_annotation() {
        let backend = Arc::new(MemoryApplyBackend::default());
        let scoped = applier(&backend).with_cache_types([ResourceKind::Secret]);

        scoped.apply("bundle-x", vec![secret("ns", "a")]).await.unwrap();

        let stored = backend.get(ResourceKind::Secret, Some("ns"), "a").unwrap();
        let labels = stored.metadata.labels.unwrap();
        assert_eq!(labels[SET_HASH_LABEL], deterministic_hash("bundle-x"));
        assert_eq!(stored.metadata.annotations.unwrap()[SET_ID_ANNOTATION], "bundle-x");
    }

    #[tokio::test]
    async fn no_prune_kinds_survive_removal() {
        let backend = Arc::new(MemoryApplyBackend::default());
        let ns = to_dynamic(&Namespace {
            metadata: meta(None, "keep"),
            ..Default::default()
        })
        .unwrap();
        backend.insert(ResourceKind::Namespace, labelled(ns, "set"));
        let scoped = applier(&backend)
            .with_cache_types([ResourceKind::Namespace])
            .with_no_prune([ResourceKind::Namespace]);

        let report = scoped.apply("set", vec![]).await.unwrap();

        assert!(report.pruned.is_empty());
        assert_eq!(backend.names(ResourceKind::Namespace), vec!["keep".to_string()]);
    }

    #[tokio::test]
    async fn root_applier_writes_nothing() {
        let backend = Arc::new(MemoryApplyBackend::default());

        let report = applier(&backend).apply("set", vec![secret("ns", "a")]).await.unwrap();

        assert!(report.applied.is_empty());
        assert_eq!(report.skipped.len(), 1);
        assert!(backend.names(ResourceKind::Secret).is_empty());
    }

    #[tokio::test]
    async fn deriving_leaves_parent_scope_unchanged() {
        let backend = Arc::new(MemoryApplyBackend::default());
        let root = applier(&backend);
        let child = root.with_cache_types([ResourceKind::Secret, ResourceKind::Role]);

        assert!(root.cache_types().is_empty());
        assert_eq!(child.cache_types().len(), 2);
        assert!(child.cache_types().contains(ResourceKind::Role));
    }

    #[tokio::test]
    async fn owner_references_follow_the_switch() {
        let backend = Arc::new(MemoryApplyBackend::default());
        let owner = OwnerReference {
            api_version: "fleet.cattle.io/v1alpha1".to_string(),
            kind: "Bundle".to_string(),
            name: "app".to_string(),
            uid: "uid-1".to_string(),
            ..Default::default()
        };
        let base = applier(&backend)
            .with_cache_types([ResourceKind::Secret])
            .with_owner(owner);

        base.with_set_owner_reference(false, false)
            .apply("off", vec![secret("ns", "a")])
            .await
            .unwrap();
        base.with_set_owner_reference(true, true)
            .apply("on", vec![secret("ns", "b")])
            .await
            .unwrap();

        let a = backend.get(ResourceKind::Secret, Some("ns"), "a").unwrap();
        assert!(a.metadata.owner_references.is_none());
        let b = backend.get(ResourceKind::Secret, Some("ns"), "b").unwrap();
        let refs = b.metadata.owner_references.unwrap();
        assert_eq!(refs[0].name, "app");
        assert_eq!(refs[0].block_owner_deletion, Some(true));
    }
}
