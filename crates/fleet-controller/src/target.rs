//! Bundle targeting
//!
//! Answers which clusters a bundle should reach and which bundles reach a
//! cluster, using the shared caches only. A bundle is visible to clusters in
//! its own namespace plus any namespace selected by a matching
//! BundleNamespaceMapping.

use std::collections::BTreeSet;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Namespace;
use kube::runtime::reflector::Store;
use kube::ResourceExt;

use fleet_common::crd::{
    Bundle, BundleDeployment, BundleNamespaceMapping, BundleTarget, Cluster, ClusterGroup,
};
use fleet_common::selector::matches_opt;
use fleet_common::{BUNDLE_NAMESPACE_LABEL, BUNDLE_NAME_LABEL};

use crate::manifest::ManifestStore;

/// One cluster a bundle should be deployed to
#[derive(Clone, Debug)]
pub struct Target {
    /// The matched cluster
    pub cluster: Arc<Cluster>,
    /// Name of the target rule that matched, if it has one
    pub target_name: Option<String>,
}

impl Target {
    /// Namespace the cluster's deployments live in, once assigned
    pub fn deployment_namespace(&self) -> Option<&str> {
        self.cluster.deployment_namespace()
    }
}

/// Resolves bundle/cluster relationships from the shared caches
pub struct TargetManager {
    clusters: Store<Cluster>,
    cluster_groups: Store<ClusterGroup>,
    bundles: Store<Bundle>,
    mappings: Store<BundleNamespaceMapping>,
    namespaces: Store<Namespace>,
    manifests: ManifestStore,
    deployments: Store<BundleDeployment>,
}

impl TargetManager {
    /// Manager over the given caches and manifest store
    pub fn new(
        clusters: Store<Cluster>,
        cluster_groups: Store<ClusterGroup>,
        bundles: Store<Bundle>,
        mappings: Store<BundleNamespaceMapping>,
        namespaces: Store<Namespace>,
        manifests: ManifestStore,
        deployments: Store<BundleDeployment>,
    ) -> Self {
        Self {
            clusters,
            cluster_groups,
            bundles,
            mappings,
            namespaces,
            manifests,
            deployments,
        }
    }

    /// Manifest storage shared with the bundle loop
    pub fn manifests(&self) -> &ManifestStore {
        &self.manifests
    }

    /// Namespaces whose clusters may receive `bundle`
    pub fn target_namespaces(&self, bundle: &Bundle) -> BTreeSet<String> {
        let bundle_ns = bundle.namespace().unwrap_or_default();
        let mut namespaces = BTreeSet::from([bundle_ns.clone()]);

        let bundle_labels = bundle.labels();
        for mapping in self.mappings.state() {
            if mapping.namespace().as_deref() != Some(bundle_ns.as_str()) {
                continue;
            }
            if !matches_opt(mapping.spec.bundle_selector.as_ref(), bundle_labels) {
                continue;
            }
            for ns in self.namespaces.state() {
                if matches_opt(mapping.spec.namespace_selector.as_ref(), ns.labels()) {
                    namespaces.insert(ns.name_any());
                }
            }
        }
        namespaces
    }

    /// Clusters `bundle` should be deployed to; each cluster appears once
    pub fn targets(&self, bundle: &Bundle) -> Vec<Target> {
        let namespaces = self.target_namespaces(bundle);
        let mut clusters: Vec<Arc<Cluster>> = self
            .clusters
            .state()
            .into_iter()
            .filter(|c| namespaces.contains(&c.namespace().unwrap_or_default()))
            .collect();
        clusters.sort_by_key(|c| (c.namespace(), c.name_any()));

        clusters
            .into_iter()
            .filter_map(|cluster| {
                let groups = self.cluster_groups_for_cluster(&cluster);
                bundle
                    .spec
                    .targets
                    .iter()
                    .find(|t| target_matches(t, &cluster, &groups))
                    .map(|t| Target {
                        cluster: cluster.clone(),
                        target_name: t.name.clone(),
                    })
            })
            .collect()
    }

    /// Groups in the cluster's namespace whose selector matches it
    pub fn cluster_groups_for_cluster(&self, cluster: &Cluster) -> Vec<Arc<ClusterGroup>> {
        let ns = cluster.namespace();
        self.cluster_groups
            .state()
            .into_iter()
            .filter(|g| g.namespace() == ns)
            .filter(|g| matches_opt(g.spec.selector.as_ref(), cluster.labels()))
            .collect()
    }

    /// Bundles that target `cluster`
    pub fn bundles_for_cluster(&self, cluster: &Cluster) -> Vec<Arc<Bundle>> {
        let key = (cluster.namespace(), cluster.name_any());
        self.bundles
            .state()
            .into_iter()
            .filter(|bundle| {
                self.targets(bundle)
                    .iter()
                    .any(|t| (t.cluster.namespace(), t.cluster.name_any()) == key)
            })
            .collect()
    }

    /// Deployments created for the bundle `namespace/name`
    pub fn deployments_for_bundle(
        &self,
        namespace: &str,
        name: &str,
    ) -> Vec<Arc<BundleDeployment>> {
        self.deployments
            .state()
            .into_iter()
            .filter(|bd| {
                let labels = bd.labels();
                labels.get(BUNDLE_NAMESPACE_LABEL).map(String::as_str) == Some(namespace)
                    && labels.get(BUNDLE_NAME_LABEL).map(String::as_str) == Some(name)
            })
            .collect()
    }
}

/// Every criterion a rule sets must match; a rule with none matches nothing
fn target_matches(
    target: &BundleTarget,
    cluster: &Cluster,
    groups: &[Arc<ClusterGroup>],
) -> bool {
    if !target.has_criteria() {
        return false;
    }
    if let Some(name) = &target.cluster_name {
        if *name != cluster.name_any() {
            return false;
        }
    }
    if let Some(selector) = &target.cluster_selector {
        if !matches_opt(Some(selector), cluster.labels()) {
            return false;
        }
    }
    if let Some(group) = &target.cluster_group {
        if !groups.iter().any(|g| g.name_any() == *group) {
            return false;
        }
    }
    if let Some(selector) = &target.cluster_group_selector {
        if !groups.iter().any(|g| matches_opt(Some(selector), g.labels())) {
            return false;
        }
    }
    true
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::capabilities::offline_client;
    use fleet_common::crd::{
        BundleDeploymentSpec, BundleNamespaceMappingSpec, BundleSpec, ClusterGroupSpec,
        ClusterSpec,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
    use kube::runtime::reflector::{self, store::Writer};
    use kube::runtime::watcher::Event;
    use std::collections::BTreeMap;

    pub(crate) fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    pub(crate) fn selector(pairs: &[(&str, &str)]) -> Option<LabelSelector> {
        Some(LabelSelector {
            match_labels: Some(labels(pairs)),
            ..Default::default()
        })
    }

    pub(crate) fn store_of<K>(objects: Vec<K>) -> Store<K>
    where
        K: kube::Resource<DynamicType = ()> + Clone + 'static,
    {
        let (reader, mut writer): (Store<K>, Writer<K>) = reflector::store();
        for obj in objects {
            writer.apply_watcher_event(&Event::Apply(obj));
        }
        reader
    }

    pub(crate) fn cluster(ns: &str, name: &str, l: &[(&str, &str)]) -> Cluster {
        let mut c = Cluster::new(name, ClusterSpec::default());
        c.metadata.namespace = Some(ns.to_string());
        c.metadata.labels = Some(labels(l));
        c
    }

    fn group(ns: &str, name: &str, sel: &[(&str, &str)], l: &[(&str, &str)]) -> ClusterGroup {
        let mut g = ClusterGroup::new(
            name,
            ClusterGroupSpec {
                selector: selector(sel),
            },
        );
        g.metadata.namespace = Some(ns.to_string());
        g.metadata.labels = Some(labels(l));
        g
    }

    pub(crate) fn bundle(ns: &str, name: &str, targets: Vec<BundleTarget>) -> Bundle {
        let mut b = Bundle::new(
            name,
            BundleSpec {
                targets,
                ..Default::default()
            },
        );
        b.metadata.namespace = Some(ns.to_string());
        b
    }

    fn namespace(name: &str, l: &[(&str, &str)]) -> Namespace {
        Namespace {
            metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels(l)),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub(crate) fn manager(
        clusters: Vec<Cluster>,
        groups: Vec<ClusterGroup>,
        bundles: Vec<Bundle>,
        mappings: Vec<BundleNamespaceMapping>,
        namespaces: Vec<Namespace>,
        deployments: Vec<BundleDeployment>,
    ) -> TargetManager {
        TargetManager::new(
            store_of(clusters),
            store_of(groups),
            store_of(bundles),
            store_of(mappings),
            store_of(namespaces),
            ManifestStore::new(offline_client()),
            store_of(deployments),
        )
    }

    fn names(targets: &[Target]) -> Vec<String> {
        targets.iter().map(|t| t.cluster.name_any()).collect()
    }

    #[tokio::test]
    async fn selector_targets_only_matching_clusters_in_namespace() {
        let tm = manager(
            vec![
                cluster("fleet-default", "prod-1", &[("env", "prod")]),
                cluster("fleet-default", "dev-1", &[("env", "dev")]),
                cluster("other", "prod-2", &[("env", "prod")]),
            ],
            vec![],
            vec![],
            vec![],
            vec![],
            vec![],
        );
        let b = bundle(
            "fleet-default",
            "app",
            vec![BundleTarget {
                cluster_selector: selector(&[("env", "prod")]),
                ..Default::default()
            }],
        );

        assert_eq!(names(&tm.targets(&b)), vec!["prod-1"]);
    }

    #[tokio::test]
    async fn group_targets_resolve_through_membership() {
        let tm = manager(
            vec![
                cluster("fleet-default", "a", &[("tier", "edge")]),
                cluster("fleet-default", "b", &[("tier", "core")]),
            ],
            vec![group("fleet-default", "edge", &[("tier", "edge")], &[("kind", "edge")])],
            vec![],
            vec![],
            vec![],
            vec![],
        );
        let by_name = bundle(
            "fleet-default",
            "by-name",
            vec![BundleTarget {
                name: Some("edge".to_string()),
                cluster_group: Some("edge".to_string()),
                ..Default::default()
            }],
        );
        let by_selector = bundle(
            "fleet-default",
            "by-selector",
            vec![BundleTarget {
                cluster_group_selector: selector(&[("kind", "edge")]),
                ..Default::default()
            }],
        );

        let targets = tm.targets(&by_name);
        assert_eq!(names(&targets), vec!["a"]);
        assert_eq!(targets[0].target_name.as_deref(), Some("edge"));
        assert_eq!(names(&tm.targets(&by_selector)), vec!["a"]);
    }

    #[tokio::test]
    async fn rule_without_criteria_matches_nothing() {
        let tm = manager(
            vec![cluster("fleet-default", "a", &[])],
            vec![],
            vec![],
            vec![],
            vec![],
            vec![],
        );
        let b = bundle("fleet-default", "app", vec![BundleTarget::default()]);
        assert!(tm.targets(&b).is_empty());
    }

    #[tokio::test]
    async fn namespace_mapping_extends_reach() {
        let mut mapping = BundleNamespaceMapping::new(
            "share",
            BundleNamespaceMappingSpec {
                bundle_selector: selector(&[("shared", "true")]),
                namespace_selector: selector(&[("team", "blue")]),
            },
        );
        mapping.metadata.namespace = Some("fleet-default".to_string());

        let mut b = bundle(
            "fleet-default",
            "app",
            vec![BundleTarget {
                cluster_selector: Some(LabelSelector::default()),
                ..Default::default()
            }],
        );
        b.metadata.labels = Some(labels(&[("shared", "true")]));

        let tm = manager(
            vec![
                cluster("fleet-default", "local", &[]),
                cluster("blue", "remote", &[]),
                cluster("red", "ignored", &[]),
            ],
            vec![],
            vec![b.clone()],
            vec![mapping],
            vec![namespace("blue", &[("team", "blue")]), namespace("red", &[])],
            vec![],
        );

        assert_eq!(names(&tm.targets(&b)), vec!["remote", "local"]);
        let remote = cluster("blue", "remote", &[]);
        assert_eq!(tm.bundles_for_cluster(&remote).len(), 1);
        let ignored = cluster("red", "ignored", &[]);
        assert!(tm.bundles_for_cluster(&ignored).is_empty());
    }

    #[tokio::test]
    async fn deployments_are_found_by_bundle_labels() {
        let mut bd = BundleDeployment::new("app", BundleDeploymentSpec::default());
        bd.metadata.namespace = Some("cluster-ns".to_string());
        bd.metadata.labels = Some(labels(&[
            (BUNDLE_NAME_LABEL, "app"),
            (BUNDLE_NAMESPACE_LABEL, "fleet-default"),
        ]));
        let tm = manager(vec![], vec![], vec![], vec![], vec![], vec![bd]);

        assert_eq!(tm.deployments_for_bundle("fleet-default", "app").len(), 1);
        assert!(tm.deployments_for_bundle("fleet-default", "other").is_empty());
    }
}
