//! Leader election using Kubernetes Leases
//!
//! Only the replica holding the `coordination.k8s.io/v1` Lease runs control
//! loops. Every write to the lease carries the resourceVersion that was read,
//! so two replicas racing for an expired lease cannot both win: the loser's
//! write fails with 409 Conflict and it goes back to waiting.
//!
//! Lease access goes through [`LeaseStore`] so the election logic can be
//! exercised without an API server.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

// Timing constants
const LEASE_DURATION: Duration = Duration::from_secs(30);
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Leader election errors
#[derive(Debug, Error)]
pub enum LeaderElectionError {
    /// Kubernetes API error
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// The lease read back from the store had no resourceVersion
    #[error("lease {0} has no resourceVersion")]
    MissingResourceVersion(String),
}

/// Storage for the single lease object
///
/// `create` and `replace` return `Ok(false)` when another writer got there
/// first (409 Conflict) rather than an error.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Read the lease, `None` if it does not exist
    async fn get(&self) -> Result<Option<Lease>, LeaderElectionError>;

    /// Create the lease; false if it already exists
    async fn create(&self, lease: &Lease) -> Result<bool, LeaderElectionError>;

    /// Replace the lease guarded by its resourceVersion; false on conflict
    async fn replace(&self, lease: &Lease) -> Result<bool, LeaderElectionError>;
}

#[async_trait]
impl<T: LeaseStore + ?Sized> LeaseStore for Arc<T> {
    async fn get(&self) -> Result<Option<Lease>, LeaderElectionError> {
        (**self).get().await
    }

    async fn create(&self, lease: &Lease) -> Result<bool, LeaderElectionError> {
        (**self).create(lease).await
    }

    async fn replace(&self, lease: &Lease) -> Result<bool, LeaderElectionError> {
        (**self).replace(lease).await
    }
}

/// Lease store backed by the API server
pub struct KubeLeaseStore {
    api: Api<Lease>,
    name: String,
}

impl KubeLeaseStore {
    /// Store for lease `name` in `namespace`
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl LeaseStore for KubeLeaseStore {
    async fn get(&self) -> Result<Option<Lease>, LeaderElectionError> {
        Ok(self.api.get_opt(&self.name).await?)
    }

    async fn create(&self, lease: &Lease) -> Result<bool, LeaderElectionError> {
        match self.api.create(&PostParams::default(), lease).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn replace(&self, lease: &Lease) -> Result<bool, LeaderElectionError> {
        match self
            .api
            .replace(&self.name, &PostParams::default(), lease)
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Leader elector using Kubernetes Leases
pub struct LeaderElector<S = KubeLeaseStore> {
    store: S,
    lease_name: String,
    namespace: String,
    identity: String,
    lease_duration: Duration,
    renew_interval: Duration,
    retry_interval: Duration,
    is_leader: Arc<AtomicBool>,
}

impl LeaderElector<KubeLeaseStore> {
    /// Elector for lease `lease_name` in `namespace` backed by the API server
    pub fn for_client(client: Client, lease_name: &str, namespace: &str, identity: &str) -> Self {
        Self::new(
            KubeLeaseStore::new(client, namespace, lease_name),
            lease_name,
            namespace,
            identity,
        )
    }
}

impl<S: LeaseStore + 'static> LeaderElector<S> {
    /// Create a new leader elector with default timing (30s lease, 10s renew, 5s retry)
    pub fn new(store: S, lease_name: &str, namespace: &str, identity: &str) -> Self {
        Self {
            store,
            lease_name: lease_name.to_string(),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
            lease_duration: LEASE_DURATION,
            renew_interval: RENEW_INTERVAL,
            retry_interval: RETRY_INTERVAL,
            is_leader: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Override the lease timing
    ///
    /// The lease duration is stored in whole seconds, at least one.
    pub fn with_timing(mut self, lease: Duration, renew: Duration, retry: Duration) -> Self {
        self.lease_duration = Duration::from_secs(lease.as_secs().max(1));
        self.renew_interval = renew;
        self.retry_interval = retry;
        self
    }

    /// Identity written into the lease when this replica holds it
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Whether this replica currently holds the lease
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Block until leadership is acquired, then return a guard
    ///
    /// The guard keeps renewing the lease. When a renewal fails, misses the
    /// renew deadline, or another holder shows up, `lost()` resolves.
    pub async fn acquire(self: Arc<Self>) -> Result<LeaderGuard<S>, LeaderElectionError> {
        info!(
            identity = %self.identity,
            lease = %self.lease_name,
            namespace = %self.namespace,
            "Waiting for leadership..."
        );

        loop {
            let attempt = Instant::now();
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(identity = %self.identity, "Leadership acquired");
                    self.is_leader.store(true, Ordering::SeqCst);
                    return Ok(self.create_guard(attempt));
                }
                Ok(false) => {
                    debug!(
                        identity = %self.identity,
                        retry_ms = self.retry_interval.as_millis() as u64,
                        "Lease held by another, waiting..."
                    );
                }
                Err(e) => {
                    warn!(
                        identity = %self.identity,
                        error = %e,
                        retry_ms = self.retry_interval.as_millis() as u64,
                        "Failed to acquire lease, retrying..."
                    );
                }
            }
            tokio::time::sleep(self.retry_interval).await;
        }
    }

    fn create_guard(self: &Arc<Self>, renewed_at: Instant) -> LeaderGuard<S> {
        let (lost_tx, lost_rx) = oneshot::channel();
        let elector = Arc::clone(self);
        let renewal_task = tokio::spawn(async move {
            elector.renewal_loop(renewed_at, lost_tx).await;
        });

        LeaderGuard {
            elector: Arc::clone(self),
            renewal_task,
            lost_rx: Some(lost_rx),
        }
    }

    /// Try to acquire or renew the lease atomically
    async fn try_acquire_or_renew(&self) -> Result<bool, LeaderElectionError> {
        let now = Utc::now();

        let Some(lease) = self.store.get().await? else {
            return self.create_lease(now).await;
        };

        let spec = lease.spec.as_ref();
        let holder = spec.and_then(|s| s.holder_identity.as_ref());

        if holder == Some(&self.identity) {
            return self.renew_lease(&lease, now).await;
        }

        if holder.is_none() || is_expired(spec, now) {
            let transitions = spec.and_then(|s| s.lease_transitions).unwrap_or(0);
            return self.take_over_lease(&lease, now, transitions).await;
        }

        Ok(false)
    }

    fn lease_spec(&self, now: DateTime<Utc>, transitions: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(self.lease_duration.as_secs() as i32),
            acquire_time: Some(MicroTime(now)),
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(transitions),
            ..Default::default()
        }
    }

    async fn create_lease(&self, now: DateTime<Utc>) -> Result<bool, LeaderElectionError> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(self.lease_spec(now, 0)),
        };

        let created = self.store.create(&lease).await?;
        if created {
            info!(identity = %self.identity, "Created new lease");
        } else {
            debug!(identity = %self.identity, "Lease creation conflict, will retry");
        }
        Ok(created)
    }

    async fn renew_lease(
        &self,
        existing: &Lease,
        now: DateTime<Utc>,
    ) -> Result<bool, LeaderElectionError> {
        if existing.metadata.resource_version.is_none() {
            return Err(LeaderElectionError::MissingResourceVersion(
                self.lease_name.clone(),
            ));
        }

        let mut updated = existing.clone();
        if let Some(ref mut spec) = updated.spec {
            spec.renew_time = Some(MicroTime(now));
        }

        let renewed = self.store.replace(&updated).await?;
        if renewed {
            debug!(identity = %self.identity, "Lease renewed");
        } else {
            warn!(identity = %self.identity, "Lease renewal conflict - lost leadership");
        }
        Ok(renewed)
    }

    async fn take_over_lease(
        &self,
        existing: &Lease,
        now: DateTime<Utc>,
        transitions: i32,
    ) -> Result<bool, LeaderElectionError> {
        let rv = existing
            .metadata
            .resource_version
            .clone()
            .ok_or_else(|| LeaderElectionError::MissingResourceVersion(self.lease_name.clone()))?;

        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version: Some(rv),
                ..Default::default()
            },
            spec: Some(self.lease_spec(now, transitions + 1)),
        };

        let taken = self.store.replace(&lease).await?;
        if taken {
            info!(
                identity = %self.identity,
                transitions = transitions + 1,
                "Took over expired lease"
            );
        } else {
            debug!(identity = %self.identity, "Lease takeover conflict, will retry");
        }
        Ok(taken)
    }

    /// Longest a holder keeps leading without a successful renewal
    ///
    /// Two thirds of the lease, measured from before the last successful
    /// write, so the holder steps down before a standby can see the lease
    /// expire.
    fn renew_deadline(&self) -> Duration {
        self.lease_duration * 2 / 3
    }

    /// Renewal loop that runs while we hold leadership
    ///
    /// Any failed or conflicting renewal ends leadership, as does a renewal
    /// still pending when the renew deadline passes.
    async fn renewal_loop(&self, mut renewed_at: Instant, lost_tx: oneshot::Sender<()>) {
        loop {
            tokio::time::sleep(self.renew_interval).await;

            let attempt = Instant::now();
            let deadline = renewed_at + self.renew_deadline();
            match tokio::time::timeout_at(deadline, self.try_acquire_or_renew()).await {
                Ok(Ok(true)) => renewed_at = attempt,
                Ok(Ok(false)) => break,
                Ok(Err(e)) => {
                    warn!(identity = %self.identity, error = %e, "Lease renewal failed");
                    break;
                }
                Err(_) => {
                    warn!(identity = %self.identity, "Lease renewal deadline exceeded");
                    break;
                }
            }
        }

        warn!(identity = %self.identity, "Leadership lost");
        self.is_leader.store(false, Ordering::SeqCst);
        let _ = lost_tx.send(());
    }

    /// Release the lease by clearing the holder identity
    ///
    /// Lets a standby acquire leadership immediately instead of waiting for
    /// the lease to expire.
    async fn release_lease(&self) -> Result<(), LeaderElectionError> {
        let Some(lease) = self.store.get().await? else {
            debug!(identity = %self.identity, "Lease not found, nothing to release");
            return Ok(());
        };

        let holder = lease.spec.as_ref().and_then(|s| s.holder_identity.as_ref());
        if holder != Some(&self.identity) {
            debug!(identity = %self.identity, "Not the lease holder, nothing to release");
            return Ok(());
        }

        let past = Utc::now() - chrono::Duration::seconds(60);
        let mut released = lease.clone();
        if let Some(ref mut spec) = released.spec {
            spec.holder_identity = None;
            spec.renew_time = Some(MicroTime(past));
        }

        if self.store.replace(&released).await? {
            info!(identity = %self.identity, "Lease released for fast failover");
        } else {
            debug!(identity = %self.identity, "Lease changed before release");
        }
        Ok(())
    }
}

fn is_expired(spec: Option<&LeaseSpec>, now: DateTime<Utc>) -> bool {
    let renew_time = spec.and_then(|s| s.renew_time.as_ref());
    let duration_secs = spec.and_then(|s| s.lease_duration_seconds);
    match (renew_time, duration_secs) {
        (Some(rt), Some(duration)) => now > rt.0 + chrono::Duration::seconds(duration as i64),
        _ => true,
    }
}

/// Guard that maintains leadership
///
/// While this guard exists the elector keeps renewing the lease. The
/// renewal task is aborted when the guard is dropped.
pub struct LeaderGuard<S: LeaseStore + 'static = KubeLeaseStore> {
    elector: Arc<LeaderElector<S>>,
    renewal_task: JoinHandle<()>,
    lost_rx: Option<oneshot::Receiver<()>>,
}

impl<S: LeaseStore + 'static> LeaderGuard<S> {
    /// Wait until leadership is lost
    ///
    /// Cancel-safe: can be polled repeatedly from a `select!` loop. Once
    /// loss has been observed, later calls return immediately.
    pub async fn lost(&mut self) {
        if let Some(rx) = self.lost_rx.as_mut() {
            let _ = rx.await;
            self.lost_rx = None;
        }
    }

    /// Identity holding the lease
    pub fn identity(&self) -> &str {
        self.elector.identity()
    }

    /// Stop renewing and release leadership by clearing the lease holder
    ///
    /// Call during graceful shutdown so the standby takes over immediately.
    pub async fn release_leadership(&self) -> Result<(), LeaderElectionError> {
        self.renewal_task.abort();
        self.elector.is_leader.store(false, Ordering::SeqCst);
        self.elector.release_lease().await
    }
}

impl<S: LeaseStore + 'static> Drop for LeaderGuard<S> {
    fn drop(&mut self) {
        self.elector.is_leader.store(false, Ordering::SeqCst);
        self.renewal_task.abort();
        info!(identity = %self.elector.identity, "Leadership released");
    }
}

/// In-memory lease store with API server conflict semantics
#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Lease store holding a single lease in memory
    ///
    /// Writes bump the resourceVersion; writes carrying a stale one are
    /// rejected the way the API server rejects them.
    #[derive(Default)]
    pub struct MemoryLeaseStore {
        lease: Mutex<Option<Lease>>,
        version: Mutex<u64>,
    }

    impl MemoryLeaseStore {
        /// Empty store
        pub fn new() -> Self {
            Self::default()
        }

        /// Current holder identity
        pub fn holder(&self) -> Option<String> {
            self.lease
                .lock()
                .as_ref()
                .and_then(|l| l.spec.as_ref())
                .and_then(|s| s.holder_identity.clone())
        }

        /// Overwrite the holder as if another replica had taken the lease
        pub fn steal(&self, identity: &str) {
            let mut guard = self.lease.lock();
            let mut lease = guard.clone().unwrap_or_default();
            let spec = lease.spec.get_or_insert_with(Default::default);
            spec.holder_identity = Some(identity.to_string());
            spec.renew_time = Some(MicroTime(Utc::now()));
            spec.lease_duration_seconds = Some(3600);
            lease.metadata.resource_version = Some(self.bump());
            *guard = Some(lease);
        }

        fn bump(&self) -> String {
            let mut version = self.version.lock();
            *version += 1;
            version.to_string()
        }
    }

    #[async_trait]
    impl LeaseStore for MemoryLeaseStore {
        async fn get(&self) -> Result<Option<Lease>, LeaderElectionError> {
            Ok(self.lease.lock().clone())
        }

        async fn create(&self, lease: &Lease) -> Result<bool, LeaderElectionError> {
            let mut guard = self.lease.lock();
            if guard.is_some() {
                return Ok(false);
            }
            let mut stored = lease.clone();
            stored.metadata.resource_version = Some(self.bump());
            *guard = Some(stored);
            Ok(true)
        }

        async fn replace(&self, lease: &Lease) -> Result<bool, LeaderElectionError> {
            let mut guard = self.lease.lock();
            let current = guard.as_ref().and_then(|l| l.metadata.resource_version.clone());
            if current.is_none() || current != lease.metadata.resource_version {
                return Ok(false);
            }
            let mut stored = lease.clone();
            stored.metadata.resource_version = Some(self.bump());
            *guard = Some(stored);
            Ok(true)
        }
    }
}
