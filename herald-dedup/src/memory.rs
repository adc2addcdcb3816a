use std::collections::HashSet;

use async_trait::async_trait;
use herald_models::IdempotencyKey;
use parking_lot::Mutex;

use crate::{DedupError, DedupGuard};

/// Single-process guard. The lock is held only for the set insert or remove.
/// Held keys do not survive a restart, which frees them.
#[derive(Default)]
pub struct InMemoryDedupGuard {
    held: Mutex<HashSet<IdempotencyKey>>,
}

impl InMemoryDedupGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, key: &IdempotencyKey) -> bool {
        self.held.lock().contains(key)
    }

    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }
}

#[async_trait]
impl DedupGuard for InMemoryDedupGuard {
    async fn acquire(&self, key: &IdempotencyKey) -> Result<bool, DedupError> {
        Ok(self.held.lock().insert(key.clone()))
    }

    async fn release(&self, key: &IdempotencyKey) -> Result<(), DedupError> {
        self.held.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn key(value: &str) -> IdempotencyKey {
        IdempotencyKey::new(value).unwrap()
    }

    #[tokio::test]
    async fn second_acquire_fails_until_release() {
        let guard = InMemoryDedupGuard::new();

        assert!(guard.acquire(&key("s1")).await.unwrap());
        assert!(!guard.acquire(&key("s1")).await.unwrap());
        assert!(guard.acquire(&key("s2")).await.unwrap());

        guard.release(&key("s1")).await.unwrap();
        assert!(!guard.is_held(&key("s1")));
        assert!(guard.acquire(&key("s1")).await.unwrap());
    }

    #[tokio::test]
    async fn releasing_an_unknown_key_is_a_no_op() {
        let guard = InMemoryDedupGuard::new();
        guard.release(&key("never")).await.unwrap();
        assert_eq!(guard.held_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn exactly_one_concurrent_caller_wins() {
        let guard = Arc::new(InMemoryDedupGuard::new());
        let attempts = (0..32).map(|_| {
            let guard = Arc::clone(&guard);
            tokio::spawn(async move { guard.acquire(&key("contended")).await.unwrap() })
        });

        let results = futures_util::future::join_all(attempts).await;
        let winners = results.into_iter().filter(|won| *won.as_ref().unwrap()).count();
        assert_eq!(winners, 1);
    }
}
