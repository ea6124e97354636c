// Owner liveness checks
//
// The oracle is consulted only after a lease has expired by local TTL
// arithmetic. A `false` answer permits reclaim; it never stops a holder from
// renewing its own lease.

use crate::lease::{NodeId, Owner, SessionId};
use crate::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};

#[async_trait]
pub trait LivenessOracle: Send + Sync + std::fmt::Debug {
    /// Whether `owner` still represents a live, connected session
    async fn is_alive(&self, owner: &Owner) -> Result<bool>;
}

/// In-process registry of live sessions
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, NodeId>,
    available: AtomicBool,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    pub fn register(&self, owner: &Owner) {
        self.sessions
            .insert(owner.session.clone(), owner.node.clone());
    }

    pub fn unregister(&self, session: &SessionId) -> bool {
        self.sessions.remove(session).is_some()
    }

    /// Drop every session hosted on `node`, e.g. when it leaves the cluster
    pub fn evict_node(&self, node: &NodeId) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, host| host != node);
        before - self.sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Simulate the registry being unreachable
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LivenessOracle for SessionRegistry {
    async fn is_alive(&self, owner: &Owner) -> Result<bool> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(Error::OracleUnavailable {
                session: owner.session.to_string(),
                reason: "session registry unreachable".to_string(),
            });
        }
        // A session id reused on another node is not the owner we asked about
        Ok(self
            .sessions
            .get(&owner.session)
            .is_some_and(|host| *host == owner.node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(node: &str, session: &str) -> Owner {
        Owner::new(NodeId::new(node), SessionId::new(session))
    }

    #[tokio::test]
    async fn test_registered_session_is_alive() {
        let registry = SessionRegistry::new();
        let a = owner("node1", "s1");

        assert!(!registry.is_alive(&a).await.unwrap());
        registry.register(&a);
        assert!(registry.is_alive(&a).await.unwrap());

        assert!(registry.unregister(&a.session));
        assert!(!registry.is_alive(&a).await.unwrap());
        assert!(!registry.unregister(&a.session));
    }

    #[tokio::test]
    async fn test_session_on_other_node_is_not_owner() {
        let registry = SessionRegistry::new();
        registry.register(&owner("node2", "s1"));

        assert!(!registry.is_alive(&owner("node1", "s1")).await.unwrap());
    }

    #[tokio::test]
    async fn test_evict_node() {
        let registry = SessionRegistry::new();
        registry.register(&owner("node1", "s1"));
        registry.register(&owner("node1", "s2"));
        registry.register(&owner("node2", "s3"));

        assert_eq!(registry.evict_node(&NodeId::new("node1")), 2);
        assert_eq!(registry.len(), 1);
        assert!(registry.is_alive(&owner("node2", "s3")).await.unwrap());
    }

    #[tokio::test]
    async fn test_unavailable_registry() {
        let registry = SessionRegistry::new();
        registry.set_available(false);

        let err = registry.is_alive(&owner("node1", "s1")).await.unwrap_err();
        assert!(matches!(err, Error::OracleUnavailable { .. }));
    }
}
