use std::fmt;

/// Store key for a protected resource.
///
/// Keys are opaque to the lock; this type only gives the common shapes a
/// single spelling so every node derives the same key for the same mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey(String);

impl ResourceKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Listen connection for one mailbox of one user
    pub fn mailbox(context_id: u32, user_id: u32, account_id: u32) -> Self {
        Self(format!("mbox:{context_id}:{user_id}:{account_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for ResourceKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}
