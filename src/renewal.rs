// Lease renewal loop
//
// One background task per held lease renews it every `ttl / renew_fraction`.
// Losing the lease (or failing to renew it after the configured retries)
// fires `on_lost` once and ends the loop; stopping the handle ends it with a
// best-effort release. A shared single-use flag makes sure only one of those
// two teardown paths ever runs.

use crate::backoff::jittered;
use crate::engine::{ClusterLock, HeldLease, ReleaseOutcome, RenewOutcome};
use crate::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Why a renewal loop gave up its lease
#[derive(Debug)]
pub enum LossReason {
    /// Another owner holds the key now
    Superseded,
    /// The store kept failing through every retry
    RenewFailed(Error),
}

/// How `RenewalHandle::stop` left the lease
#[derive(Debug)]
pub enum StopOutcome {
    Released,
    /// The lease was already lost or taken over
    NotHeld,
    /// The release call itself failed; the lease will expire on its own
    ReleaseFailed(Error),
}

enum Step {
    Renewed,
    Lost(LossReason),
    Stop { release: bool },
}

#[derive(Debug)]
pub struct RenewalHandle {
    key: String,
    stop_tx: Option<oneshot::Sender<bool>>,
    task: Option<JoinHandle<StopOutcome>>,
    token_rx: watch::Receiver<u64>,
    torn_down: Arc<AtomicBool>,
}

impl RenewalHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Fencing token of the most recent successful write
    pub fn fencing_token(&self) -> u64 {
        *self.token_rx.borrow()
    }

    /// Whether the loop has ended, through loss or stop
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Cancel the loop and release the lease once, without retrying.
    ///
    /// An in-flight renew is allowed to finish first. Once `stop` has been
    /// called, `on_lost` will not fire.
    pub async fn stop(mut self) -> StopOutcome {
        let release = self.claim_teardown();
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(release);
        }
        match self.task.take() {
            Some(task) => task.await.unwrap_or_else(|e| {
                StopOutcome::ReleaseFailed(Error::Other(anyhow::anyhow!(
                    "renewal task failed: {e}"
                )))
            }),
            None => StopOutcome::NotHeld,
        }
    }

    /// End the loop without releasing; the lease is left to expire as if
    /// this process had crashed
    pub async fn abandon(mut self) {
        self.claim_teardown();
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(false);
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    fn claim_teardown(&self) -> bool {
        !self.torn_down.swap(true, Ordering::SeqCst)
    }
}

impl Drop for RenewalHandle {
    fn drop(&mut self) {
        // Dropped without stop(): the task still releases in the background
        if let Some(tx) = self.stop_tx.take() {
            let release = self.claim_teardown();
            let _ = tx.send(release);
        }
    }
}

pub struct RenewalScheduler;

impl RenewalScheduler {
    /// Spawn the renewal loop for `lease` on the current tokio runtime
    pub fn start<F>(engine: Arc<ClusterLock>, lease: HeldLease, on_lost: F) -> RenewalHandle
    where
        F: FnOnce(LossReason) + Send + 'static,
    {
        let key = lease.key().to_string();
        let (stop_tx, stop_rx) = oneshot::channel();
        let (token_tx, token_rx) = watch::channel(lease.fencing_token());
        let torn_down = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(run(
            engine,
            lease,
            stop_rx,
            token_tx,
            Arc::clone(&torn_down),
            on_lost,
        ));

        RenewalHandle {
            key,
            stop_tx: Some(stop_tx),
            task: Some(task),
            token_rx,
            torn_down,
        }
    }
}

async fn run<F>(
    engine: Arc<ClusterLock>,
    mut lease: HeldLease,
    mut stop_rx: oneshot::Receiver<bool>,
    token_tx: watch::Sender<u64>,
    torn_down: Arc<AtomicBool>,
    on_lost: F,
) -> StopOutcome
where
    F: FnOnce(LossReason) + Send + 'static,
{
    let period = engine
        .config()
        .renew_interval(lease.ttl())
        .max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(key = lease.key(), ?period, "renewal loop started");

    loop {
        let step = tokio::select! {
            biased;
            signal = &mut stop_rx => Step::Stop { release: signal.unwrap_or(false) },
            _ = ticker.tick() => renew_with_retries(&engine, &mut lease, &mut stop_rx).await,
        };

        match step {
            Step::Renewed => {
                token_tx.send_replace(lease.fencing_token());
            }
            Step::Lost(reason) => {
                if !torn_down.swap(true, Ordering::SeqCst) {
                    warn!(key = lease.key(), ?reason, "lease lost, tearing down");
                    on_lost(reason);
                }
                return StopOutcome::NotHeld;
            }
            Step::Stop { release: false } => return StopOutcome::NotHeld,
            Step::Stop { release: true } => {
                debug!(key = lease.key(), "renewal loop stopped, releasing");
                return match engine.release(&mut lease).await {
                    Ok(ReleaseOutcome::Released) => StopOutcome::Released,
                    Ok(ReleaseOutcome::AlreadyLost) => StopOutcome::NotHeld,
                    Err(e) => {
                        warn!(key = lease.key(), error = %e, "release failed, lease left to expire");
                        StopOutcome::ReleaseFailed(e)
                    }
                };
            }
        }
    }
}

async fn renew_with_retries(
    engine: &ClusterLock,
    lease: &mut HeldLease,
    stop_rx: &mut oneshot::Receiver<bool>,
) -> Step {
    let retries = engine.config().renew_retries;
    let mut backoff = engine.config().retry_backoff();
    let mut attempt = 0;

    loop {
        match engine.renew(lease).await {
            Ok(RenewOutcome::Renewed) => return Step::Renewed,
            Ok(RenewOutcome::LostOwnership) => return Step::Lost(LossReason::Superseded),
            Err(e) if attempt < retries => {
                attempt += 1;
                warn!(key = lease.key(), attempt, error = %e, "lease renew failed, retrying");
                tokio::select! {
                    biased;
                    signal = &mut *stop_rx => return Step::Stop { release: signal.unwrap_or(false) },
                    () = tokio::time::sleep(jittered(backoff)) => {}
                }
                backoff *= 2;
            }
            Err(e) => return Step::Lost(LossReason::RenewFailed(e)),
        }
    }
}
