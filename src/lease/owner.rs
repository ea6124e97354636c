// Lease ownership records

use crate::clock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Identifies a cluster member
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Random node id, for processes without a configured identity
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies the session that asked for a lease; looked up by the liveness oracle
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lease holder identity. Two owners are the same holder iff node and
/// session match; timestamps never take part in identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Owner {
    pub node: NodeId,
    pub session: SessionId,
}

impl Owner {
    pub fn new(node: NodeId, session: SessionId) -> Self {
        Self { node, session }
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node, self.session)
    }
}

/// What the store holds for a leased key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseValue {
    pub owner: Owner,
    /// Writer's clock at the last acquire or renew
    pub acquired_at_nanos: u64,
    /// Validity window the holder asked for
    pub ttl_millis: u64,
}

impl LeaseValue {
    pub fn new(owner: Owner, acquired_at_nanos: u64, ttl: Duration) -> Self {
        Self {
            owner,
            acquired_at_nanos,
            ttl_millis: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_millis)
    }

    pub fn age(&self, now_nanos: u64) -> Duration {
        clock::age(now_nanos, self.acquired_at_nanos)
    }

    /// Expired once strictly more than ttl has passed since the last write
    pub fn is_expired(&self, now_nanos: u64) -> bool {
        self.age(now_nanos) > self.ttl()
    }

    /// Expired even allowing `multiplier` windows of clock skew
    pub fn is_expired_with_grace(&self, now_nanos: u64, multiplier: u32) -> bool {
        self.age(now_nanos) > self.ttl().saturating_mul(multiplier)
    }

    /// Time left before the value expires, zero if it already has
    pub fn remaining(&self, now_nanos: u64) -> Duration {
        self.ttl().saturating_sub(self.age(now_nanos))
    }

    pub fn is_held_by(&self, owner: &Owner) -> bool {
        &self.owner == owner
    }

    pub fn acquired_at(&self) -> chrono::DateTime<chrono::Utc> {
        let nanos = i64::try_from(self.acquired_at_nanos).unwrap_or(i64::MAX);
        chrono::DateTime::from_timestamp_nanos(nanos)
    }
}

impl fmt::Display for LeaseValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} since {} (ttl {}ms)",
            self.owner,
            self.acquired_at().to_rfc3339(),
            self.ttl_millis
        )
    }
}
