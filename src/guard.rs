// Resource gate: the acquire -> open -> renew -> teardown sequence a session
// manager runs around one exclusive external connection.

use crate::engine::{AcquireOutcome, ClusterLock, Holder};
use crate::lease::Owner;
use crate::renewal::{LossReason, RenewalHandle, RenewalScheduler, StopOutcome};
use crate::{Error, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

pub enum GateOutcome<T> {
    Opened(GatedResource<T>),
    /// Someone else holds the key; try again after `retry_after`
    Busy { holder: Holder, retry_after: Duration },
}

/// An open resource together with the lease that protects it.
///
/// Dropping it stops renewal and releases the lease in the background.
pub struct GatedResource<T> {
    resource: T,
    renewal: RenewalHandle,
    lost_rx: watch::Receiver<bool>,
}

impl<T> GatedResource<T> {
    pub fn resource(&self) -> &T {
        &self.resource
    }

    pub fn resource_mut(&mut self) -> &mut T {
        &mut self.resource
    }

    pub fn key(&self) -> &str {
        self.renewal.key()
    }

    /// Current fencing token; pass it along with writes the resource makes
    pub fn token(&self) -> u64 {
        self.renewal.fencing_token()
    }

    pub fn is_lost(&self) -> bool {
        *self.lost_rx.borrow()
    }

    /// Resolves once the lease is lost. The resource must be torn down right
    /// away: another node may already believe it owns it.
    pub async fn lost(&mut self) {
        // Sender lives in the renewal task's callback; if it is gone the loop
        // has ended, which also means the lease is no longer ours.
        let _ = self.lost_rx.wait_for(|lost| *lost).await;
    }

    /// Stop renewing, release the lease and hand the resource back for closing
    pub async fn close(self) -> (T, StopOutcome) {
        let outcome = self.renewal.stop().await;
        (self.resource, outcome)
    }
}

pub struct ResourceGate;

impl ResourceGate {
    /// Acquire `key`, open the resource with the fencing token, then keep the
    /// lease renewed while the resource is held.
    ///
    /// `opener` runs only after the lease is ours. If it fails, the lease is
    /// released and the error returned.
    pub async fn open<T, O, Fut>(
        engine: Arc<ClusterLock>,
        key: &str,
        owner: &Owner,
        ttl: Duration,
        opener: O,
    ) -> Result<GateOutcome<T>>
    where
        O: FnOnce(u64) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut lease = match engine.try_acquire(key, owner, ttl).await? {
            AcquireOutcome::Acquired(lease) => lease,
            AcquireOutcome::Held(holder) => {
                let retry_after = match &holder {
                    Holder::Owner(value) => value.remaining(engine.now_nanos()),
                    Holder::Corrupt => engine.config().corrupt_grace(ttl),
                }
                .max(engine.config().acquire_backoff_initial());
                debug!(key, ?holder, ?retry_after, "resource busy");
                return Ok(GateOutcome::Busy {
                    holder,
                    retry_after,
                });
            }
        };

        let resource = match opener(lease.fencing_token()).await {
            Ok(resource) => resource,
            Err(e) => {
                warn!(key, error = %e, "opening resource failed, releasing lease");
                if let Err(release_err) = engine.release(&mut lease).await {
                    warn!(key, error = %release_err, "release after failed open also failed");
                }
                return Err(Error::Other(e));
            }
        };

        let (lost_tx, lost_rx) = watch::channel(false);
        let renewal = RenewalScheduler::start(engine, lease, move |reason: LossReason| {
            debug!(?reason, "gated resource lost its lease");
            let _ = lost_tx.send(true);
        });

        Ok(GateOutcome::Opened(GatedResource {
            resource,
            renewal,
            lost_rx,
        }))
    }
}
