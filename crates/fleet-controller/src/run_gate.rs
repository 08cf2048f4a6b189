//! Leader-gated execution of the controller body
//!
//! Only the replica holding the controller lease runs control loops. The
//! body gets a cancellation token that is cancelled as soon as leadership is
//! lost or shutdown is requested; losing the lease is reported as an error so
//! the process restarts with empty caches instead of re-contending.

use std::future::Future;
use std::sync::Arc;

use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use fleet_common::leader_election::{KubeLeaseStore, LeaderElector, LeaderGuard, LeaseStore};
use fleet_common::{Error, Namespaces, CONTROLLER_LOCK_NAME};

/// Runs a body only while holding the controller lease
pub struct RunGate<S: LeaseStore + 'static = KubeLeaseStore> {
    elector: Arc<LeaderElector<S>>,
}

enum Outcome {
    Started,
    Failed(Error),
    Lost,
    Shutdown,
}

impl RunGate<KubeLeaseStore> {
    /// Gate on the controller lock in the system namespace
    pub fn new(client: Client, namespaces: &Namespaces, identity: &str) -> Self {
        Self::with_elector(LeaderElector::for_client(
            client,
            CONTROLLER_LOCK_NAME,
            namespaces.system(),
            identity,
        ))
    }
}

impl<S: LeaseStore + 'static> RunGate<S> {
    /// Gate on an existing elector
    pub fn with_elector(elector: LeaderElector<S>) -> Self {
        Self {
            elector: Arc::new(elector),
        }
    }

    /// Identity contending for the lease
    pub fn identity(&self) -> &str {
        self.elector.identity()
    }

    /// Wait for leadership, run `body`, then keep leading until shutdown
    ///
    /// - `body` fails: its token is cancelled, the lease released, the error
    ///   returned.
    /// - leadership lost: the token is cancelled and `Error::LeadershipLost`
    ///   returned.
    /// - `shutdown` cancelled: the token is cancelled, the lease released and
    ///   `Ok(())` returned.
    pub async fn run<F, Fut>(&self, shutdown: CancellationToken, body: F) -> Result<(), Error>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<(), Error>>,
    {
        let identity = self.identity().to_string();
        let acquired = tokio::select! {
            res = Arc::clone(&self.elector).acquire() => res,
            _ = shutdown.cancelled() => {
                info!(identity = %identity, "shutdown before leadership was acquired");
                return Ok(());
            }
        };
        let mut guard = acquired.map_err(|e| {
            Error::internal_with_context("leader election", e.to_string())
        })?;

        let token = shutdown.child_token();
        let outcome = {
            let body = body(token.clone());
            tokio::pin!(body);
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => Outcome::Shutdown,
                _ = guard.lost() => Outcome::Lost,
                res = &mut body => match res {
                    Ok(()) => Outcome::Started,
                    // the body saw its token cancelled by shutdown
                    Err(_) if shutdown.is_cancelled() => Outcome::Shutdown,
                    Err(e) => Outcome::Failed(e),
                },
            }
        };

        let outcome = match outcome {
            Outcome::Started => {
                info!(identity = %identity, "controllers running as leader");
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => Outcome::Shutdown,
                    _ = guard.lost() => Outcome::Lost,
                }
            }
            other => other,
        };

        token.cancel();
        match outcome {
            Outcome::Failed(e) => {
                warn!(identity = %identity, error = %e, "controller body failed");
                release(&guard).await;
                Err(e)
            }
            Outcome::Lost => {
                warn!(identity = %identity, "leadership lost, stopping controllers");
                Err(Error::leadership_lost(identity))
            }
            Outcome::Shutdown | Outcome::Started => {
                info!(identity = %identity, "shutting down");
                release(&guard).await;
                Ok(())
            }
        }
    }
}

async fn release<S: LeaseStore + 'static>(guard: &LeaderGuard<S>) {
    if let Err(e) = guard.release_leadership().await {
        warn!(identity = %guard.identity(), error = %e, "failed to release lease");
    }
}
