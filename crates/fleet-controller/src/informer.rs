//! Per-domain informer factories
//!
//! An [`InformerFactory`] owns the shared caches for one resource domain and
//! the control loops installed on it. Nothing talks to the API server until
//! the factory is started: `sync` launches one watch per requested cache and
//! waits for each initial list, `start` then launches the installed loops.

use std::any::Any;
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use kube::runtime::reflector::{self, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, Resource};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fleet_common::{Error, ResourceDomain};

use crate::starter::Starter;

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
///
/// Forces the API server to close idle watches before the client times out.
pub const WATCH_TIMEOUT_SECS: u32 = 25;

type LoopFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type ReadyFuture = Pin<Box<dyn Future<Output = Result<(), Error>> + Send>>;

struct PendingWatch {
    key: String,
    watch: LoopFuture,
    ready: ReadyFuture,
}

struct InstalledLoop {
    name: String,
    run: LoopFuture,
}

#[derive(Default)]
struct FactoryState {
    caches: HashMap<String, Box<dyn Any + Send + Sync>>,
    watches: Vec<PendingWatch>,
    loops: Vec<InstalledLoop>,
    loop_names: Vec<String>,
    sync_token: Option<CancellationToken>,
    start_token: Option<CancellationToken>,
}

/// Shared caches and installed control loops for one resource domain
pub struct InformerFactory {
    domain: ResourceDomain,
    client: Client,
    state: Mutex<FactoryState>,
}

impl InformerFactory {
    /// Factory for `domain` using `client`; starts nothing
    pub fn new(domain: ResourceDomain, client: Client) -> Self {
        Self {
            domain,
            client,
            state: Mutex::new(FactoryState::default()),
        }
    }

    /// Domain this factory serves
    pub fn domain(&self) -> ResourceDomain {
        self.domain
    }

    /// Client scoped to this factory's domain
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Shared cache of every object of kind `K`
    ///
    /// The first request for a kind creates the cache; later requests get the
    /// same store. Requesting a cache after the factory started syncing
    /// launches its watch immediately.
    pub fn cache<K>(&self) -> Store<K>
    where
        K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    {
        let key = cache_key::<K>();
        let mut state = self.state.lock();

        if let Some(existing) = state.caches.get(&key) {
            if let Some(store) = (**existing).downcast_ref::<Store<K>>() {
                return store.clone();
            }
        }

        let (reader, writer) = reflector::store::<K>();
        let api: Api<K> = Api::all(self.client.clone());
        let watch_key = key.clone();
        let watch: LoopFuture = Box::pin(
            watcher(api, watcher::Config::default().timeout(WATCH_TIMEOUT_SECS))
                .default_backoff()
                .reflect(writer)
                .for_each(move |event| {
                    if let Err(e) = event {
                        warn!(cache = %watch_key, error = %e, "watch error");
                    }
                    std::future::ready(())
                }),
        );

        let ready_reader = reader.clone();
        let ready_key = key.clone();
        let domain = self.domain;
        let ready: ReadyFuture = Box::pin(async move {
            ready_reader.wait_until_ready().await.map_err(|_| {
                Error::startup(
                    domain.name(),
                    format!("cache {ready_key} closed before initial sync"),
                )
            })
        });

        state.caches.insert(key.clone(), Box::new(reader.clone()));
        debug!(domain = %self.domain, cache = %key, "cache requested");

        match state.sync_token.clone() {
            Some(token) => spawn_watch(token, key, watch),
            None => state.watches.push(PendingWatch { key, watch, ready }),
        }
        reader
    }

    /// Install a control loop to run once the factory is started
    pub fn install(&self, name: &str, run: impl Future<Output = ()> + Send + 'static) {
        let mut state = self.state.lock();
        state.loop_names.push(name.to_string());
        let run: LoopFuture = Box::pin(run);
        match state.start_token.clone() {
            Some(token) => spawn_loop(token, name.to_string(), run),
            None => state.loops.push(InstalledLoop {
                name: name.to_string(),
                run,
            }),
        }
    }

    /// Installer handle exposing only loop installation
    pub fn installer(self: &Arc<Self>) -> LoopInstaller {
        LoopInstaller {
            factory: Arc::clone(self),
        }
    }

    /// Keys ("apiVersion/Kind") of every cache requested so far
    pub fn cached_kinds(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.state.lock().caches.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Names of every loop installed so far, in installation order
    pub fn installed_loops(&self) -> Vec<String> {
        self.state.lock().loop_names.clone()
    }
}

#[async_trait]
impl Starter for InformerFactory {
    fn name(&self) -> &str {
        self.domain.name()
    }

    async fn sync(&self, token: CancellationToken) -> Result<(), Error> {
        let watches = {
            let mut state = self.state.lock();
            if state.sync_token.is_some() {
                return Ok(());
            }
            state.sync_token = Some(token.clone());
            std::mem::take(&mut state.watches)
        };

        let count = watches.len();
        let mut ready = Vec::with_capacity(count);
        for pending in watches {
            spawn_watch(token.clone(), pending.key, pending.watch);
            ready.push(pending.ready);
        }

        // A cancelled watch drops its writer, so a closed cache is only a
        // startup failure while the token is still live.
        let synced = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(Error::Cancelled),
            res = futures::future::try_join_all(ready) => res,
        };
        if let Err(e) = synced {
            return Err(if token.is_cancelled() { Error::Cancelled } else { e });
        }

        info!(domain = %self.domain, caches = count, "caches synced");
        Ok(())
    }

    fn start(&self, token: CancellationToken) {
        let loops = {
            let mut state = self.state.lock();
            if state.start_token.is_some() {
                return;
            }
            state.start_token = Some(token.clone());
            std::mem::take(&mut state.loops)
        };

        let count = loops.len();
        for installed in loops {
            spawn_loop(token.clone(), installed.name, installed.run);
        }
        debug!(domain = %self.domain, loops = count, "control loops started");
    }
}

/// Handle given to a control loop's registration to install its work
#[derive(Clone)]
pub struct LoopInstaller {
    factory: Arc<InformerFactory>,
}

impl LoopInstaller {
    /// Install a control loop on the underlying factory
    pub fn install(&self, name: &str, run: impl Future<Output = ()> + Send + 'static) {
        self.factory.install(name, run);
    }

    /// Domain of the underlying factory
    pub fn domain(&self) -> ResourceDomain {
        self.factory.domain()
    }
}

fn cache_key<K: Resource<DynamicType = ()>>() -> String {
    format!("{}/{}", K::api_version(&()), K::kind(&()))
}

fn spawn_watch(token: CancellationToken, key: String, watch: LoopFuture) {
    tokio::spawn(async move {
        tokio::select! {
            _ = watch => warn!(cache = %key, "watch stream ended"),
            _ = token.cancelled() => debug!(cache = %key, "watch stopped"),
        }
    });
}

fn spawn_loop(token: CancellationToken, name: String, run: LoopFuture) {
    tokio::spawn(async move {
        tokio::select! {
            _ = run => warn!(controller = %name, "control loop exited"),
            _ = token.cancelled() => debug!(controller = %name, "control loop stopped"),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::offline_client;
    use fleet_common::crd::{Bundle, Cluster};
    use k8s_openapi::api::core::v1::Namespace;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn cache_is_shared_per_kind() {
        let factory = InformerFactory::new(ResourceDomain::Fleet, offline_client());
        let a = factory.cache::<Cluster>();
        let _b = factory.cache::<Cluster>();
        let _bundles = factory.cache::<Bundle>();

        assert_eq!(
            factory.cached_kinds(),
            vec![
                "fleet.cattle.io/v1alpha1/Bundle".to_string(),
                "fleet.cattle.io/v1alpha1/Cluster".to_string()
            ]
        );
        assert!(a.state().is_empty());
    }

    #[tokio::test]
    async fn loops_run_only_after_start() {
        let factory = Arc::new(InformerFactory::new(ResourceDomain::Core, offline_client()));
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        factory.installer().install("noop", async move {
            flag.store(true, Ordering::SeqCst);
        });

        tokio::task::yield_now().await;
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(factory.installed_loops(), vec!["noop".to_string()]);

        let token = CancellationToken::new();
        factory.start(token.clone());
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(ran.load(Ordering::SeqCst));
        token.cancel();
    }

    #[tokio::test]
    async fn factory_without_caches_syncs_immediately() {
        let factory = InformerFactory::new(ResourceDomain::Apps, offline_client());
        factory.sync(CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn sync_is_cancellable() {
        let factory = InformerFactory::new(ResourceDomain::Core, offline_client());
        let _namespaces = factory.cache::<Namespace>();
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let err = factory.sync(token).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn repeated_cancellation_is_never_a_startup_failure() {
        for _ in 0..20 {
            let factory = InformerFactory::new(ResourceDomain::Core, offline_client());
            let _namespaces = factory.cache::<Namespace>();
            let _clusters = factory.cache::<Cluster>();
            let token = CancellationToken::new();
            let cancel = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                cancel.cancel();
            });

            let err = factory.sync(token).await.unwrap_err();
            assert!(matches!(err, Error::Cancelled), "got {err:?}");
        }
    }
}
