//! Per-identity mutual exclusion
//!
//! Two reconciliations of the same load balancer identity would race their
//! diffs against a moving snapshot, so they are serialized. Different
//! identities never contend. The registry only holds weak references; a
//! lock disappears once nobody holds or waits for it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::OwnedMutexGuard;

/// Process-scoped registry of per-identity locks
#[derive(Debug, Default)]
pub struct LockRegistry {
    locks: Mutex<HashMap<String, Weak<tokio::sync::Mutex<()>>>>,
}

/// Held for the duration of one reconciliation of an identity
#[derive(Debug)]
pub struct IdentityGuard {
    identity: String,
    _guard: OwnedMutexGuard<()>,
}

impl IdentityGuard {
    /// The identity this guard excludes
    pub fn identity(&self) -> &str {
        &self.identity
    }
}

impl LockRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until `identity` is free and take it
    pub async fn acquire(&self, identity: &str) -> IdentityGuard {
        let lock = self.lock_for(identity);
        IdentityGuard {
            identity: identity.to_string(),
            _guard: lock.lock_owned().await,
        }
    }

    /// Take `identity` if nobody holds it
    pub fn try_acquire(&self, identity: &str) -> Option<IdentityGuard> {
        let lock = self.lock_for(identity);
        lock.try_lock_owned().ok().map(|guard| IdentityGuard {
            identity: identity.to_string(),
            _guard: guard,
        })
    }

    /// Number of identities currently locked or awaited
    pub fn active(&self) -> usize {
        let locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.values().filter(|weak| weak.strong_count() > 0).count()
    }

    fn lock_for(&self, identity: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.retain(|_, weak| weak.strong_count() > 0);

        if let Some(lock) = locks.get(identity).and_then(Weak::upgrade) {
            return lock;
        }

        let lock = Arc::new(tokio::sync::Mutex::new(()));
        locks.insert(identity.to_string(), Arc::downgrade(&lock));
        lock
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_identity_is_exclusive() {
        let registry = LockRegistry::new();

        let guard = registry.acquire("lb-a").await;
        assert_eq!(guard.identity(), "lb-a");
        assert!(registry.try_acquire("lb-a").is_none());

        drop(guard);
        assert!(registry.try_acquire("lb-a").is_some());
    }

    #[tokio::test]
    async fn different_identities_do_not_contend() {
        let registry = LockRegistry::new();

        let _a = registry.acquire("lb-a").await;
        let b = registry.try_acquire("lb-b");
        assert!(b.is_some());
        assert_eq!(registry.active(), 2);
    }

    #[tokio::test]
    async fn released_identities_are_pruned() {
        let registry = LockRegistry::new();

        drop(registry.acquire("lb-a").await);
        drop(registry.acquire("lb-b").await);
        assert_eq!(registry.active(), 0);

        let _c = registry.acquire("lb-c").await;
        assert_eq!(registry.locks.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn waiter_proceeds_after_release() {
        let registry = Arc::new(LockRegistry::new());
        let guard = registry.acquire("lb-a").await;

        let contender = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.acquire("lb-a").await.identity().to_string() })
        };

        tokio::task::yield_now().await;
        assert!(!contender.is_finished());

        drop(guard);
        assert_eq!(contender.await.unwrap(), "lb-a");
    }
}
