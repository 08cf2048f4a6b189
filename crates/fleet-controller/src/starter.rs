//! Bounded-concurrency startup of every watch engine
//!
//! Starting is two-phase. Every starter first syncs its caches, at most
//! `concurrency` at a time; only once all of them hold a full initial list
//! are the control loops launched, so no loop acts on a half-filled cache.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use fleet_common::Error;

/// Upper bound on starters syncing at once
pub const DEFAULT_START_CONCURRENCY: usize = 50;

/// A watch engine that can be started once
#[async_trait]
pub trait Starter: Send + Sync {
    /// Name used in logs and startup errors
    fn name(&self) -> &str;

    /// Launch watches and wait until every cache holds its initial list
    async fn sync(&self, token: CancellationToken) -> Result<(), Error>;

    /// Launch the installed control loops; they stop when `token` is cancelled
    fn start(&self, token: CancellationToken);
}

/// Sync every starter with at most `concurrency` in flight, then start them all
///
/// The first sync failure aborts the remaining syncs and is returned as a
/// startup error naming the starter. Cancellation returns `Error::Cancelled`.
pub async fn start_all(
    token: CancellationToken,
    concurrency: usize,
    starters: &[Arc<dyn Starter>],
) -> Result<(), Error> {
    let limit = concurrency.max(1);
    debug!(count = starters.len(), limit, "syncing starters");

    let mut syncs = stream::iter(starters.iter().cloned())
        .map(|starter| {
            let token = token.clone();
            async move {
                let result = starter.sync(token).await;
                (starter, result)
            }
        })
        .buffer_unordered(limit);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => return Err(Error::Cancelled),
            next = syncs.next() => match next {
                Some((_, Ok(()))) => {}
                Some((_, Err(_))) if token.is_cancelled() => return Err(Error::Cancelled),
                Some((starter, Err(e))) => {
                    error!(starter = %starter.name(), error = %e, "starter failed to sync");
                    return Err(match e {
                        Error::Startup { .. } | Error::Cancelled => e,
                        other => Error::startup(starter.name(), other.to_string()),
                    });
                }
                None => break,
            },
        }
    }

    for starter in starters {
        starter.start(token.clone());
    }

    info!(count = starters.len(), "all starters synced and started");
    Ok(())
}
