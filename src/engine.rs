// Cluster lock engine - acquire, renew, release and reclaim of per-key leases
//
// Every mutation is a CAS against the value this node last observed. The
// engine never serialises callers itself; concurrent acquirers are sorted out
// by the store's atomic primitives.

use crate::backoff::Backoff;
use crate::clock::{Clock, SystemClock};
use crate::config::LockConfig;
use crate::lease::{decode, encode, Decoded, LeaseValue, Owner};
use crate::liveness::LivenessOracle;
use crate::store::{CasOutcome, LeaseStore, Versioned};
use crate::{clock, Error, Result};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Who is in the way of an acquisition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Holder {
    Owner(LeaseValue),
    /// The key holds an undecodable value still inside its grace period
    Corrupt,
}

#[derive(Debug)]
pub enum AcquireOutcome {
    Acquired(HeldLease),
    Held(Holder),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewOutcome {
    Renewed,
    /// Someone else owns the key now; stop using the resource immediately
    LostOwnership,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    AlreadyLost,
}

/// Read-only view of a key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseView {
    Owned(LeaseValue),
    Unowned,
    Corrupt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HoldState {
    Held,
    Lost,
    Released,
}

/// A lease this process acquired.
///
/// Carries the exact stored value last written for it; renew and release
/// compare against that value, so a holder that has been superseded can
/// never write again.
#[derive(Debug)]
pub struct HeldLease {
    key: String,
    value: LeaseValue,
    observed: Versioned,
    /// Writes whose outcome is unknown because the store call errored
    pending: Vec<Vec<u8>>,
    state: HoldState,
}

impl HeldLease {
    fn new(key: &str, value: LeaseValue, observed: Versioned) -> Self {
        Self {
            key: key.to_string(),
            value,
            observed,
            pending: Vec::new(),
            state: HoldState::Held,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn owner(&self) -> &Owner {
        &self.value.owner
    }

    pub fn ttl(&self) -> Duration {
        self.value.ttl()
    }

    /// The value as last written by this holder
    pub fn value(&self) -> &LeaseValue {
        &self.value
    }

    /// Store version of the last successful write. Grows with every renew
    /// and is larger than any token a previous holder of the key saw.
    pub fn fencing_token(&self) -> u64 {
        self.observed.version
    }

    pub fn is_lost(&self) -> bool {
        self.state == HoldState::Lost
    }

    pub fn is_released(&self) -> bool {
        self.state == HoldState::Released
    }
}

#[derive(Debug, Clone, Copy)]
struct CorruptSighting {
    version: u64,
    first_seen_nanos: u64,
}

enum Verdict {
    Valid,
    Reclaimable,
}

#[derive(Debug)]
pub struct ClusterLock {
    store: Arc<dyn LeaseStore>,
    oracle: Option<Arc<dyn LivenessOracle>>,
    clock: Arc<dyn Clock>,
    config: LockConfig,
    /// When this node first saw each corrupt value, by key
    corrupt_sightings: DashMap<String, CorruptSighting>,
}

impl ClusterLock {
    pub fn new(store: Arc<dyn LeaseStore>, config: LockConfig) -> Self {
        Self {
            store,
            oracle: None,
            clock: Arc::new(SystemClock::new()),
            config,
            corrupt_sightings: DashMap::new(),
        }
    }

    pub fn with_oracle(mut self, oracle: Arc<dyn LivenessOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    pub fn now_nanos(&self) -> u64 {
        self.clock.now_nanos()
    }

    /// Try once to become the owner of `key`.
    ///
    /// Absent keys are created; expired leases whose owner is confirmed dead
    /// (and corrupt values past their grace period) are reclaimed by CAS
    /// against the value that was read. A live lease is reported as `Held`
    /// without writing anything.
    pub async fn try_acquire(
        &self,
        key: &str,
        owner: &Owner,
        ttl: Duration,
    ) -> Result<AcquireOutcome> {
        check_ttl(ttl)?;
        let attempts = self.config.max_cas_attempts.max(1);

        for _ in 0..attempts {
            let Some(current) = self.store.get(key).await? else {
                let (value, bytes) = self.stamp(owner, ttl);
                match self.store.cas_create(key, bytes.clone()).await? {
                    CasOutcome::Applied { version } => {
                        debug!(key, node = %owner.node, session = %owner.session, token = version, "lease acquired");
                        let observed = Versioned { value: bytes, version };
                        return Ok(AcquireOutcome::Acquired(HeldLease::new(key, value, observed)));
                    }
                    // Lost the create race; look at the winner
                    CasOutcome::Conflict => continue,
                }
            };

            let decoded = decode(&current.value);
            if matches!(decoded, Decoded::Value(_)) {
                self.corrupt_sightings.remove(key);
            }

            let reclaiming = match decoded {
                Decoded::Value(existing) if existing.is_held_by(owner) => {
                    debug!(key, node = %owner.node, session = %owner.session, "refreshing lease already held by this owner");
                    None
                }
                Decoded::Value(existing) => match self.judge(key, &existing).await? {
                    Verdict::Valid => return Ok(AcquireOutcome::Held(Holder::Owner(existing))),
                    Verdict::Reclaimable => Some(existing.owner),
                },
                Decoded::Corrupt => {
                    if !self.corrupt_grace_elapsed(key, &current, ttl) {
                        return Ok(AcquireOutcome::Held(Holder::Corrupt));
                    }
                    warn!(key, token = current.version, "reclaiming corrupt lease value");
                    None
                }
            };

            if let Some(held) = self.install(key, &current, owner, ttl).await? {
                self.corrupt_sightings.remove(key);
                if let Some(previous) = reclaiming {
                    info!(
                        key,
                        node = %owner.node,
                        session = %owner.session,
                        previous = %previous,
                        token = held.fencing_token(),
                        "lease reclaimed"
                    );
                }
                return Ok(AcquireOutcome::Acquired(held));
            }
            // Someone changed the key between our read and write
        }

        Err(Error::Contended {
            key: key.to_string(),
            attempts,
        })
    }

    /// Retry `try_acquire` with jittered exponential backoff until `timeout`.
    ///
    /// Retryable errors are absorbed like `Held`; anything else is returned
    /// immediately.
    pub async fn acquire(
        &self,
        key: &str,
        owner: &Owner,
        ttl: Duration,
        timeout: Duration,
    ) -> Result<HeldLease> {
        let start = tokio::time::Instant::now();
        let deadline = start + timeout;
        let mut backoff = Backoff::new(
            self.config.acquire_backoff_initial(),
            self.config.acquire_backoff_max(),
        );

        loop {
            match self.try_acquire(key, owner, ttl).await {
                Ok(AcquireOutcome::Acquired(held)) => return Ok(held),
                Ok(AcquireOutcome::Held(holder)) => {
                    debug!(key, ?holder, "lease held, backing off");
                }
                Err(e) if e.is_retryable() => {
                    debug!(key, error = %e, "acquire attempt failed, backing off");
                }
                Err(e) => return Err(e),
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(Error::AcquireTimeout {
                    key: key.to_string(),
                    waited: now - start,
                });
            }
            let delay = backoff.next_delay().min(deadline - now);
            tokio::time::sleep(delay).await;
        }
    }

    /// Extend a held lease with a fresh timestamp.
    ///
    /// `LostOwnership` is final for this `HeldLease`: every later renew or
    /// release on it reports loss without touching the store. A store error
    /// leaves the lease held but records the attempted write, so a retry can
    /// tell "my write landed" apart from "someone else took over".
    pub async fn renew(&self, lease: &mut HeldLease) -> Result<RenewOutcome> {
        if lease.state != HoldState::Held {
            return Ok(RenewOutcome::LostOwnership);
        }

        let (value, bytes) = self.stamp(&lease.value.owner, lease.value.ttl());
        let mut expected = lease.observed.clone();

        loop {
            let outcome = match self.store.cas_replace(&lease.key, &expected, bytes.clone()).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    lease.pending.push(bytes);
                    return Err(e);
                }
            };

            match outcome {
                CasOutcome::Applied { version } => {
                    lease.observed = Versioned { value: bytes, version };
                    lease.value = value;
                    lease.pending.clear();
                    debug!(key = %lease.key, token = version, "lease renewed");
                    return Ok(RenewOutcome::Renewed);
                }
                CasOutcome::Conflict => match self.adopt_pending(lease).await? {
                    Some(current) => expected = current,
                    None => {
                        lease.state = HoldState::Lost;
                        warn!(
                            key = %lease.key,
                            node = %lease.value.owner.node,
                            session = %lease.value.owner.session,
                            "lease ownership lost"
                        );
                        return Ok(RenewOutcome::LostOwnership);
                    }
                },
            }
        }
    }

    /// Delete the lease if this holder still owns it. Calling it again, or on
    /// a lease that was taken over, reports `AlreadyLost`.
    pub async fn release(&self, lease: &mut HeldLease) -> Result<ReleaseOutcome> {
        if lease.state != HoldState::Held {
            return Ok(ReleaseOutcome::AlreadyLost);
        }

        let mut expected = lease.observed.clone();
        loop {
            if self.store.cas_delete(&lease.key, &expected).await? {
                lease.state = HoldState::Released;
                debug!(key = %lease.key, token = expected.version, "lease released");
                return Ok(ReleaseOutcome::Released);
            }
            match self.adopt_pending(lease).await? {
                Some(current) => expected = current,
                None => {
                    lease.state = HoldState::Lost;
                    debug!(key = %lease.key, "release found lease already gone");
                    return Ok(ReleaseOutcome::AlreadyLost);
                }
            }
        }
    }

    /// Current state of `key`; never writes
    pub async fn peek(&self, key: &str) -> Result<LeaseView> {
        Ok(match self.store.get(key).await? {
            None => LeaseView::Unowned,
            Some(current) => match decode(&current.value) {
                Decoded::Value(value) => LeaseView::Owned(value),
                Decoded::Corrupt => LeaseView::Corrupt,
            },
        })
    }

    fn stamp(&self, owner: &Owner, ttl: Duration) -> (LeaseValue, Vec<u8>) {
        let value = LeaseValue::new(owner.clone(), self.clock.now_nanos(), ttl);
        let bytes = encode(&value);
        (value, bytes)
    }

    /// CAS a fresh lease for `owner` over `current`
    async fn install(
        &self,
        key: &str,
        current: &Versioned,
        owner: &Owner,
        ttl: Duration,
    ) -> Result<Option<HeldLease>> {
        let (value, bytes) = self.stamp(owner, ttl);
        Ok(match self.store.cas_replace(key, current, bytes.clone()).await? {
            CasOutcome::Applied { version } => {
                let observed = Versioned { value: bytes, version };
                Some(HeldLease::new(key, value, observed))
            }
            CasOutcome::Conflict => None,
        })
    }

    /// Decide whether someone else's lease may be taken over.
    ///
    /// Local TTL arithmetic comes first and short-circuits without any
    /// network call. Only an expired lease is put to the liveness oracle,
    /// since clock skew means expiry alone doesn't prove the owner is gone.
    async fn judge(&self, key: &str, existing: &LeaseValue) -> Result<Verdict> {
        let now = self.clock.now_nanos();
        if !existing.is_expired(now) {
            return Ok(Verdict::Valid);
        }

        let multiplier = self.config.skew_grace_multiplier;
        let hard_expired = existing.is_expired_with_grace(now, multiplier);

        let Some(oracle) = &self.oracle else {
            if hard_expired {
                return Ok(Verdict::Reclaimable);
            }
            debug!(key, owner = %existing.owner, "lease expired but inside skew grace");
            return Ok(Verdict::Valid);
        };

        match oracle.is_alive(&existing.owner).await {
            Ok(true) => {
                debug!(key, owner = %existing.owner, "lease expired but owner still alive");
                Ok(Verdict::Valid)
            }
            Ok(false) => Ok(Verdict::Reclaimable),
            Err(e) if hard_expired => {
                warn!(
                    key,
                    owner = %existing.owner,
                    error = %e,
                    multiplier,
                    "liveness unknown, reclaiming lease past skew grace"
                );
                Ok(Verdict::Reclaimable)
            }
            Err(e) => Err(e),
        }
    }

    /// Track a corrupt value and report whether it has sat unchanged for
    /// the grace period
    fn corrupt_grace_elapsed(&self, key: &str, current: &Versioned, ttl: Duration) -> bool {
        let now = self.clock.now_nanos();
        let fresh = CorruptSighting {
            version: current.version,
            first_seen_nanos: now,
        };

        let mut sighting = self
            .corrupt_sightings
            .entry(key.to_string())
            .or_insert(fresh);
        if sighting.version != current.version {
            *sighting = fresh;
        }
        if sighting.first_seen_nanos == now {
            warn!(key, token = current.version, "corrupt lease value observed");
        }

        clock::age(now, sighting.first_seen_nanos) >= self.config.corrupt_grace(ttl)
    }

    /// After a CAS conflict, check whether the stored value is one of our own
    /// writes whose acknowledgement got lost. If so, adopt it.
    async fn adopt_pending(&self, lease: &mut HeldLease) -> Result<Option<Versioned>> {
        if lease.pending.is_empty() {
            return Ok(None);
        }

        let current = self.store.get(&lease.key).await?;
        let pending = std::mem::take(&mut lease.pending);
        Ok(match current {
            Some(current) if pending.contains(&current.value) => {
                debug!(key = %lease.key, token = current.version, "adopting write with unknown outcome");
                if let Decoded::Value(value) = decode(&current.value) {
                    lease.value = value;
                }
                lease.observed = current.clone();
                Some(current)
            }
            _ => None,
        })
    }
}

/// Lease values store the ttl in whole milliseconds
fn check_ttl(ttl: Duration) -> Result<()> {
    let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
    if millis == 0 || Duration::from_millis(millis) != ttl {
        return Err(Error::Config(format!(
            "lease ttl must be a positive whole number of milliseconds, got {ttl:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::lease::{NodeId, SessionId};
    use crate::liveness::SessionRegistry;
    use crate::store::InMemoryStore;

    const TTL: Duration = Duration::from_secs(10);

    fn owner(node: &str, session: &str) -> Owner {
        Owner::new(NodeId::new(node), SessionId::new(session))
    }

    struct Fixture {
        store: Arc<InMemoryStore>,
        registry: Arc<SessionRegistry>,
        clock: Arc<ManualClock>,
        lock: ClusterLock,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let registry = Arc::new(SessionRegistry::new());
        let clock = Arc::new(ManualClock::new(1_000_000_000));
        let lock = ClusterLock::new(store.clone(), LockConfig::default())
            .with_oracle(registry.clone())
            .with_clock(clock.clone());
        Fixture {
            store,
            registry,
            clock,
            lock,
        }
    }

    fn acquired(outcome: AcquireOutcome) -> HeldLease {
        match outcome {
            AcquireOutcome::Acquired(held) => held,
            AcquireOutcome::Held(holder) => panic!("expected Acquired, got Held({holder:?})"),
        }
    }

    #[tokio::test]
    async fn test_acquire_absent_key() {
        let f = fixture();
        let a = owner("node1", "a");

        let held = acquired(f.lock.try_acquire("mbox:42", &a, TTL).await.unwrap());
        assert_eq!(held.key(), "mbox:42");
        assert_eq!(held.owner(), &a);
        assert_eq!(held.ttl(), TTL);
        assert!(held.fencing_token() > 0);

        match f.lock.peek("mbox:42").await.unwrap() {
            LeaseView::Owned(value) => assert!(value.is_held_by(&a)),
            other => panic!("unexpected view {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_live_lease_is_held_without_oracle_call() {
        let f = fixture();
        let a = owner("node1", "a");
        let b = owner("node2", "b");
        acquired(f.lock.try_acquire("k", &a, TTL).await.unwrap());

        // An unreachable oracle proves it is never consulted for fresh leases
        f.registry.set_available(false);
        match f.lock.try_acquire("k", &b, TTL).await.unwrap() {
            AcquireOutcome::Held(Holder::Owner(value)) => assert!(value.is_held_by(&a)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_expired_lease_with_live_owner_is_held() {
        let f = fixture();
        let a = owner("node1", "a");
        let b = owner("node2", "b");
        f.registry.register(&a);
        acquired(f.lock.try_acquire("k", &a, TTL).await.unwrap());

        f.clock.advance(TTL * 5);
        assert!(matches!(
            f.lock.try_acquire("k", &b, TTL).await.unwrap(),
            AcquireOutcome::Held(Holder::Owner(_))
        ));
    }

    #[tokio::test]
    async fn test_expired_lease_with_dead_owner_is_reclaimed() {
        let f = fixture();
        let a = owner("node1", "a");
        let b = owner("node2", "b");
        let held_a = acquired(f.lock.try_acquire("k", &a, TTL).await.unwrap());

        f.clock.advance(TTL + Duration::from_millis(1));
        let held_b = acquired(f.lock.try_acquire("k", &b, TTL).await.unwrap());
        assert!(held_b.fencing_token() > held_a.fencing_token());
    }

    #[tokio::test]
    async fn test_exactly_ttl_old_is_not_expired() {
        let f = fixture();
        let a = owner("node1", "a");
        acquired(f.lock.try_acquire("k", &a, TTL).await.unwrap());

        f.clock.advance(TTL);
        assert!(matches!(
            f.lock.try_acquire("k", &owner("node2", "b"), TTL).await.unwrap(),
            AcquireOutcome::Held(_)
        ));
    }

    #[tokio::test]
    async fn test_oracle_unavailable_defers_then_falls_back() {
        let f = fixture();
        let a = owner("node1", "a");
        let b = owner("node2", "b");
        acquired(f.lock.try_acquire("k", &a, TTL).await.unwrap());
        f.registry.set_available(false);

        f.clock.advance(TTL + Duration::from_secs(1));
        let err = f.lock.try_acquire("k", &b, TTL).await.unwrap_err();
        assert!(matches!(err, Error::OracleUnavailable { .. }));

        // Past skew_grace_multiplier * ttl the lease is reclaimed on TTL alone
        f.clock.advance(TTL);
        acquired(f.lock.try_acquire("k", &b, TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_without_oracle_reclaim_waits_for_skew_grace() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let lock = ClusterLock::new(store, LockConfig::default()).with_clock(clock.clone());
        let a = owner("node1", "a");
        let b = owner("node2", "b");
        acquired(lock.try_acquire("k", &a, TTL).await.unwrap());

        clock.advance(TTL * 2);
        assert!(matches!(
            lock.try_acquire("k", &b, TTL).await.unwrap(),
            AcquireOutcome::Held(_)
        ));

        clock.advance(Duration::from_millis(1));
        acquired(lock.try_acquire("k", &b, TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_holder_ttl_governs_expiry() {
        let f = fixture();
        let a = owner("node1", "a");
        acquired(f.lock.try_acquire("k", &a, Duration::from_secs(60)).await.unwrap());

        // The contender's short ttl doesn't shorten the holder's window
        f.clock.advance(Duration::from_secs(30));
        assert!(matches!(
            f.lock.try_acquire("k", &owner("node2", "b"), Duration::from_secs(1)).await.unwrap(),
            AcquireOutcome::Held(_)
        ));
    }

    #[tokio::test]
    async fn test_same_owner_reacquire_refreshes() {
        let f = fixture();
        let a = owner("node1", "a");
        let first = acquired(f.lock.try_acquire("k", &a, TTL).await.unwrap());

        let second = acquired(f.lock.try_acquire("k", &a, TTL).await.unwrap());
        assert!(second.fencing_token() > first.fencing_token());
    }

    #[tokio::test]
    async fn test_renew_extends_and_bumps_token() {
        let f = fixture();
        let a = owner("node1", "a");
        let mut held = acquired(f.lock.try_acquire("k", &a, TTL).await.unwrap());
        let token = held.fencing_token();

        f.clock.advance(Duration::from_secs(8));
        assert_eq!(f.lock.renew(&mut held).await.unwrap(), RenewOutcome::Renewed);
        assert!(held.fencing_token() > token);

        // Eight seconds after renewing, the lease is still fresh
        f.clock.advance(Duration::from_secs(8));
        assert!(matches!(
            f.lock.try_acquire("k", &owner("node2", "b"), TTL).await.unwrap(),
            AcquireOutcome::Held(_)
        ));
    }

    #[tokio::test]
    async fn test_renew_after_reclaim_is_lost_for_good() {
        let f = fixture();
        let a = owner("node1", "a");
        let b = owner("node2", "b");
        let mut held_a = acquired(f.lock.try_acquire("k", &a, TTL).await.unwrap());

        f.clock.advance(TTL * 2);
        let held_b = acquired(f.lock.try_acquire("k", &b, TTL).await.unwrap());

        assert_eq!(f.lock.renew(&mut held_a).await.unwrap(), RenewOutcome::LostOwnership);
        assert!(held_a.is_lost());
        assert_eq!(f.lock.renew(&mut held_a).await.unwrap(), RenewOutcome::LostOwnership);
        assert_eq!(f.lock.release(&mut held_a).await.unwrap(), ReleaseOutcome::AlreadyLost);

        // B is untouched
        match f.lock.peek("k").await.unwrap() {
            LeaseView::Owned(value) => assert!(value.is_held_by(held_b.owner())),
            other => panic!("unexpected view {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let f = fixture();
        let a = owner("node1", "a");
        let mut held = acquired(f.lock.try_acquire("k", &a, TTL).await.unwrap());

        assert_eq!(f.lock.release(&mut held).await.unwrap(), ReleaseOutcome::Released);
        assert!(held.is_released());
        assert_eq!(f.lock.release(&mut held).await.unwrap(), ReleaseOutcome::AlreadyLost);
        assert_eq!(f.lock.peek("k").await.unwrap(), LeaseView::Unowned);
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn test_store_error_surfaces() {
        let f = fixture();
        let a = owner("node1", "a");
        let mut held = acquired(f.lock.try_acquire("k", &a, TTL).await.unwrap());

        f.store.set_available(false);
        assert!(matches!(
            f.lock.try_acquire("k", &owner("node2", "b"), TTL).await,
            Err(Error::StoreUnavailable { .. })
        ));
        assert!(matches!(f.lock.renew(&mut held).await, Err(Error::StoreUnavailable { .. })));
        assert!(matches!(f.lock.peek("k").await, Err(Error::StoreUnavailable { .. })));
        assert!(!held.is_lost());

        f.store.set_available(true);
        assert_eq!(f.lock.renew(&mut held).await.unwrap(), RenewOutcome::Renewed);
    }

    #[tokio::test]
    async fn test_renew_adopts_write_that_landed_despite_error() {
        let f = fixture();
        let a = owner("node1", "a");
        let mut held = acquired(f.lock.try_acquire("k", &a, TTL).await.unwrap());

        // Simulate a renew whose write applied but whose reply was lost
        f.store.set_available(false);
        assert!(f.lock.renew(&mut held).await.is_err());
        f.store.set_available(true);
        let landed = held.pending[0].clone();
        let current = f.store.get("k").await.unwrap().unwrap();
        f.store.cas_replace("k", &current, landed).await.unwrap();

        assert_eq!(f.lock.renew(&mut held).await.unwrap(), RenewOutcome::Renewed);
        assert!(held.pending.is_empty());
        assert_eq!(f.lock.release(&mut held).await.unwrap(), ReleaseOutcome::Released);
    }

    #[tokio::test]
    async fn test_corrupt_value_reclaimable_after_grace() {
        let f = fixture();
        let b = owner("node2", "b");
        f.store.put_raw("k", b"garbage".to_vec());

        assert_eq!(f.lock.peek("k").await.unwrap(), LeaseView::Corrupt);
        assert!(matches!(
            f.lock.try_acquire("k", &b, TTL).await.unwrap(),
            AcquireOutcome::Held(Holder::Corrupt)
        ));

        f.clock.advance(TTL - Duration::from_millis(1));
        assert!(matches!(
            f.lock.try_acquire("k", &b, TTL).await.unwrap(),
            AcquireOutcome::Held(Holder::Corrupt)
        ));

        f.clock.advance(Duration::from_millis(1));
        acquired(f.lock.try_acquire("k", &b, TTL).await.unwrap());
        assert!(f.lock.corrupt_sightings.is_empty());
    }

    #[tokio::test]
    async fn test_rewritten_corrupt_value_restarts_grace() {
        let f = fixture();
        let b = owner("node2", "b");
        f.store.put_raw("k", b"garbage".to_vec());
        assert!(matches!(
            f.lock.try_acquire("k", &b, TTL).await.unwrap(),
            AcquireOutcome::Held(Holder::Corrupt)
        ));

        f.clock.advance(TTL);
        // A writer touched the key meanwhile: new version, new grace window
        f.store.put_raw("k", b"still garbage".to_vec());
        assert!(matches!(
            f.lock.try_acquire("k", &b, TTL).await.unwrap(),
            AcquireOutcome::Held(Holder::Corrupt)
        ));
    }

    #[tokio::test]
    async fn test_ttl_below_millisecond_precision_rejected() {
        let f = fixture();
        let a = owner("node1", "a");

        for ttl in [Duration::ZERO, Duration::from_micros(500), Duration::from_micros(1500)] {
            let err = f.lock.try_acquire("k", &a, ttl).await.unwrap_err();
            assert!(matches!(err, Error::Config(_)), "ttl {ttl:?}");
        }
        assert!(f.store.is_empty());

        let held = acquired(f.lock.try_acquire("k", &a, Duration::from_millis(1)).await.unwrap());
        assert_eq!(held.ttl(), Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_does_not_retry_invalid_ttl() {
        let f = fixture();
        let start = tokio::time::Instant::now();

        let err = f
            .lock
            .acquire("k", &owner("node1", "a"), Duration::from_micros(10), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_corrupt_sighting_forgotten_once_key_is_valid_again() {
        let f = fixture();
        let a = owner("node1", "a");
        let b = owner("node2", "b");
        f.registry.register(&a);
        f.store.put_raw("k", b"garbage".to_vec());
        assert!(matches!(
            f.lock.try_acquire("k", &b, TTL).await.unwrap(),
            AcquireOutcome::Held(Holder::Corrupt)
        ));
        assert_eq!(f.lock.corrupt_sightings.len(), 1);

        // Another writer repairs the key behind this node's back
        let repaired = LeaseValue::new(a.clone(), f.clock.now_nanos(), TTL);
        f.store.put_raw("k", encode(&repaired));

        match f.lock.try_acquire("k", &b, TTL).await.unwrap() {
            AcquireOutcome::Held(Holder::Owner(value)) => assert!(value.is_held_by(&a)),
            other => panic!("unexpected {other:?}"),
        }
        assert!(f.lock.corrupt_sightings.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out_while_held() {
        let f = fixture();
        let a = owner("node1", "a");
        acquired(f.lock.try_acquire("k", &a, TTL).await.unwrap());

        let err = f
            .lock
            .acquire("k", &owner("node2", "b"), TTL, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AcquireTimeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_release() {
        let f = Arc::new(fixture());
        let a = owner("node1", "a");
        let mut held = acquired(f.lock.try_acquire("k", &a, TTL).await.unwrap());

        let f2 = f.clone();
        let waiter = tokio::spawn(async move {
            f2.lock
                .acquire("k", &owner("node2", "b"), TTL, Duration::from_secs(30))
                .await
        });

        tokio::time::sleep(Duration::from_millis(500)).await;
        f.lock.release(&mut held).await.unwrap();

        let held_b = waiter.await.unwrap().unwrap();
        assert_eq!(held_b.owner(), &owner("node2", "b"));
    }
}
