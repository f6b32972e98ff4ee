use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Dedupe store making redelivery safe for effectful handlers.
///
/// Check-then-act protocol: `try_begin` claims a business key, `complete`
/// records the side effect as durably done, `release` gives the claim back
/// after a failure so a later redelivery can retry.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Claims the key. Returns false when the key is already claimed or
    /// completed; the caller must then skip its side effect.
    async fn try_begin(&self, key: &str) -> bool;

    /// Marks the key's side effect as done. Later `try_begin` calls for the
    /// same key return false.
    async fn complete(&self, key: &str);

    /// Releases an in-flight claim after a failure. A completed key stays
    /// completed.
    async fn release(&self, key: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyState {
    InFlight,
    Completed,
}

/// Process-local idempotency store.
///
/// Sufficient for a single consumer instance; a shared deployment would back
/// this trait with a database unique constraint instead.
#[derive(Default)]
pub struct InMemoryIdempotencyStore {
    keys: Mutex<HashMap<String, KeyState>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the key's side effect has been recorded as done.
    pub fn is_completed(&self, key: &str) -> bool {
        self.keys.lock().get(key).copied() == Some(KeyState::Completed)
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn try_begin(&self, key: &str) -> bool {
        let mut keys = self.keys.lock();
        if keys.contains_key(key) {
            return false;
        }
        keys.insert(key.to_owned(), KeyState::InFlight);
        true
    }

    async fn complete(&self, key: &str) {
        self.keys.lock().insert(key.to_owned(), KeyState::Completed);
    }

    async fn release(&self, key: &str) {
        let mut keys = self.keys.lock();
        if keys.get(key) == Some(&KeyState::InFlight) {
            keys.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_begin_for_the_same_key_is_refused() {
        let store = InMemoryIdempotencyStore::new();
        assert!(store.try_begin("monthly-report:U1:2024-03").await);
        assert!(!store.try_begin("monthly-report:U1:2024-03").await);
    }

    #[tokio::test]
    async fn release_allows_a_retry() {
        let store = InMemoryIdempotencyStore::new();
        assert!(store.try_begin("k").await);
        store.release("k").await;
        assert!(store.try_begin("k").await);
    }

    #[tokio::test]
    async fn completed_key_stays_claimed_even_after_release() {
        let store = InMemoryIdempotencyStore::new();
        assert!(store.try_begin("k").await);
        store.complete("k").await;
        store.release("k").await;
        assert!(!store.try_begin("k").await);
        assert!(store.is_completed("k"));
    }

    #[tokio::test]
    async fn distinct_keys_are_independent() {
        let store = InMemoryIdempotencyStore::new();
        assert!(store.try_begin("monthly-report:U1:2024-03").await);
        assert!(store.try_begin("monthly-report:U1:2024-04").await);
        assert!(store.try_begin("monthly-report:U2:2024-03").await);
    }
}
