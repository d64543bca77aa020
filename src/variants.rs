//! Variant Version Allocator
//!
//! Optimistic allocation of per-turn variant versions. The read-max,
//! check-exists sequence only narrows the race window; the store's unique
//! `(parent, version)` constraint is what actually prevents duplicates, and a
//! write that loses the race is reported as `VariantVersionConflict`.

use crate::constants::{
    VARIANT_BACKOFF_BASE_MS, VARIANT_BACKOFF_STEP_MS, VARIANT_FETCH_ATTEMPTS,
    VARIANT_FETCH_BASE_DELAY_MS, VARIANT_MAX_ATTEMPTS,
};
use crate::hardening::RetryPolicy;
use crate::store::ConversationStore;
use crate::types::{ObservedError, RelayError, Result, TurnId, Variant};
use std::sync::Arc;

#[derive(Clone)]
pub struct VariantAllocator {
    store: Arc<dyn ConversationStore>,
    policy: RetryPolicy,
    fetch_policy: RetryPolicy,
}

fn is_race(e: &ObservedError) -> bool {
    matches!(
        e.inner,
        RelayError::VersionRace { .. } | RelayError::VariantVersionConflict { .. }
    )
}

impl VariantAllocator {
    pub fn new(store: Arc<dyn ConversationStore>) -> Self {
        Self::with_attempts(store, VARIANT_MAX_ATTEMPTS)
    }

    pub fn with_attempts(store: Arc<dyn ConversationStore>, max_attempts: u32) -> Self {
        Self::with_policy(
            store,
            RetryPolicy::linear(max_attempts, VARIANT_BACKOFF_BASE_MS, VARIANT_BACKOFF_STEP_MS),
        )
    }

    pub fn with_policy(store: Arc<dyn ConversationStore>, policy: RetryPolicy) -> Self {
        Self {
            store,
            policy,
            fetch_policy: RetryPolicy::exponential(
                VARIANT_FETCH_ATTEMPTS,
                VARIANT_FETCH_BASE_DELAY_MS,
            ),
        }
    }

    /// One read-max/check-exists round.
    async fn try_candidate(store: &dyn ConversationStore, parent: &TurnId) -> Result<u32> {
        let current = store.max_variant_version(parent).await?;
        let candidate = current + 1;
        if store.variant_exists(parent, candidate).await? {
            tracing::debug!(
                parent = %parent,
                candidate,
                "Variant version taken between read and check"
            );
            return Err(RelayError::VersionRace {
                parent: parent.clone(),
                version: candidate,
            }
            .into());
        }
        Ok(candidate)
    }

    fn exhausted(&self, parent: &TurnId, err: ObservedError) -> ObservedError {
        match err.inner {
            RelayError::VersionRace { .. } => {
                tracing::warn!(
                    parent = %parent,
                    attempts = self.policy.max_attempts,
                    "Variant version allocation exhausted its retries"
                );
                RelayError::VersionAllocationFailed {
                    parent: parent.clone(),
                    attempts: self.policy.max_attempts,
                }
                .into()
            }
            _ => err,
        }
    }

    /// Next free version for `parent`. Does not reserve it.
    pub async fn allocate_version(&self, parent: &TurnId) -> Result<u32> {
        let store = self.store.as_ref();
        self.policy
            .execute_when(
                move |_| Self::try_candidate(store, parent),
                |e| matches!(e.inner, RelayError::VersionRace { .. }),
            )
            .await
            .map_err(|e| self.exhausted(parent, e))
    }

    /// Persists a variant at an already allocated version.
    pub async fn create_variant(
        &self,
        parent: &TurnId,
        version: u32,
        content: &str,
    ) -> Result<Variant> {
        self.store.insert_variant(parent, version, content).await
    }

    /// Allocates and writes in one retried unit, so a write-time conflict
    /// restarts from a fresh read.
    pub async fn allocate_and_create(&self, parent: &TurnId, content: &str) -> Result<Variant> {
        let store = self.store.as_ref();
        let variant = self
            .policy
            .execute_when(
                move |attempt| async move {
                    let version = Self::try_candidate(store, parent).await?;
                    let created = store.insert_variant(parent, version, content).await;
                    if let Err(e) = &created {
                        if matches!(e.inner, RelayError::VariantVersionConflict { .. }) {
                            tracing::debug!(
                                parent = %parent,
                                version,
                                attempt,
                                "Variant write lost a race"
                            );
                        }
                    }
                    created
                },
                is_race,
            )
            .await
            .map_err(|e| self.exhausted(parent, e))?;

        tracing::info!(parent = %parent, version = variant.version, "Created variant");
        Ok(variant)
    }

    /// Makes `version` the single active variant of `parent`.
    pub async fn activate(&self, parent: &TurnId, version: u32) -> Result<()> {
        self.store.activate_variant(parent, version).await
    }

    /// Lists variants, retrying transient store failures with jittered backoff.
    pub async fn fetch_variants(&self, parent: &TurnId) -> Result<Vec<Variant>> {
        let store = self.store.as_ref();
        self.fetch_policy
            .execute_with_retry(move |_| store.list_variants(parent))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{NewSession, Role, SessionId};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(store: Arc<dyn ConversationStore>, attempts: u32) -> VariantAllocator {
        VariantAllocator::with_policy(store, RetryPolicy::linear(attempts, 1, 0))
    }

    #[tokio::test]
    async fn test_versions_start_at_one_and_increase() {
        let store: Arc<dyn ConversationStore> = Arc::new(MemoryStore::new());
        let allocator = fast(store, 3);
        let parent = TurnId("p".to_string());

        for expected in 1..=3 {
            match allocator.allocate_and_create(&parent, "text").await {
                Ok(v) => assert_eq!(v.version, expected),
                Err(e) => panic!("allocation failed: {}", e),
            }
        }
    }

    /// A store whose existence check reports every candidate as taken.
    struct AlwaysRacing {
        inner: MemoryStore,
        checks: AtomicU32,
    }

    #[async_trait]
    impl ConversationStore for AlwaysRacing {
        async fn create_session(&self, new: NewSession) -> Result<crate::types::Session> {
            self.inner.create_session(new).await
        }
        async fn get_session(&self, id: &SessionId) -> Result<Option<crate::types::Session>> {
            self.inner.get_session(id).await
        }
        async fn touch_session(&self, id: &SessionId) -> Result<()> {
            self.inner.touch_session(id).await
        }
        async fn list_turns(&self, s: &SessionId) -> Result<Vec<crate::types::TurnRecord>> {
            self.inner.list_turns(s).await
        }
        async fn get_turn(&self, id: &TurnId) -> Result<Option<crate::types::TurnRecord>> {
            self.inner.get_turn(id).await
        }
        async fn latest_turn(&self, s: &SessionId) -> Result<Option<crate::types::TurnRecord>> {
            self.inner.latest_turn(s).await
        }
        async fn create_turn(
            &self,
            s: &SessionId,
            role: Role,
            content: &str,
        ) -> Result<crate::types::TurnRecord> {
            self.inner.create_turn(s, role, content).await
        }
        async fn append_to_turn(
            &self,
            id: &TurnId,
            addition: &str,
        ) -> Result<crate::types::TurnRecord> {
            self.inner.append_to_turn(id, addition).await
        }
        async fn delete_turn(&self, id: &TurnId) -> Result<bool> {
            self.inner.delete_turn(id).await
        }
        async fn save_stream_checkpoint(
            &self,
            s: &SessionId,
            r: &crate::types::RequestId,
            p: &str,
        ) -> Result<()> {
            self.inner.save_stream_checkpoint(s, r, p).await
        }
        async fn get_stream_checkpoint(
            &self,
            s: &SessionId,
            r: &crate::types::RequestId,
        ) -> Result<Option<String>> {
            self.inner.get_stream_checkpoint(s, r).await
        }
        async fn save_debug_snapshot(&self, s: &SessionId, v: &Value) -> Result<()> {
            self.inner.save_debug_snapshot(s, v).await
        }
        async fn get_debug_snapshot(&self, s: &SessionId) -> Result<Option<Value>> {
            self.inner.get_debug_snapshot(s).await
        }
        async fn max_variant_version(&self, parent: &TurnId) -> Result<u32> {
            self.inner.max_variant_version(parent).await
        }
        async fn variant_exists(&self, _parent: &TurnId, _version: u32) -> Result<bool> {
            self.checks.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
        async fn insert_variant(&self, p: &TurnId, v: u32, c: &str) -> Result<Variant> {
            self.inner.insert_variant(p, v, c).await
        }
        async fn list_variants(&self, p: &TurnId) -> Result<Vec<Variant>> {
            self.inner.list_variants(p).await
        }
        async fn activate_variant(&self, p: &TurnId, v: u32) -> Result<()> {
            self.inner.activate_variant(p, v).await
        }
        async fn ping(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_exhaustion_reports_allocation_failed() {
        let racing = Arc::new(AlwaysRacing {
            inner: MemoryStore::new(),
            checks: AtomicU32::new(0),
        });
        let allocator = fast(racing.clone(), 3);
        let parent = TurnId("p".to_string());

        match allocator.allocate_version(&parent).await {
            Err(e) => {
                assert!(matches!(
                    e.inner,
                    RelayError::VersionAllocationFailed { attempts: 3, .. }
                ));
                assert!(e.inner.is_retryable());
            }
            Ok(v) => panic!("allocation should fail, got {}", v),
        }
        assert_eq!(racing.checks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_create_at_taken_version_is_conflict() {
        let store: Arc<dyn ConversationStore> = Arc::new(MemoryStore::new());
        let allocator = fast(store, 3);
        let parent = TurnId("p".to_string());

        if let Err(e) = allocator.create_variant(&parent, 1, "a").await {
            panic!("create failed: {}", e);
        }
        match allocator.create_variant(&parent, 1, "b").await {
            Err(e) => assert!(matches!(
                e.inner,
                RelayError::VariantVersionConflict { version: 1, .. }
            )),
            Ok(_) => panic!("duplicate version accepted"),
        }
    }

    #[tokio::test]
    async fn test_concurrent_allocations_are_distinct() {
        let store: Arc<dyn ConversationStore> = Arc::new(MemoryStore::with_interleaving());
        let n = 8;
        let allocator = Arc::new(fast(store, n));
        let parent = TurnId("shared".to_string());

        let mut handles = Vec::new();
        for i in 0..n {
            let allocator = allocator.clone();
            let parent = parent.clone();
            handles.push(tokio::spawn(async move {
                allocator
                    .allocate_and_create(&parent, &format!("variant {}", i))
                    .await
            }));
        }

        let mut versions = Vec::new();
        for h in handles {
            match h.await {
                Ok(Ok(v)) => versions.push(v.version),
                Ok(Err(e)) => panic!("allocation failed: {}", e),
                Err(e) => panic!("task panicked: {}", e),
            }
        }
        versions.sort_unstable();
        assert_eq!(versions, (1..=n).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_activate_and_fetch() {
        let store: Arc<dyn ConversationStore> = Arc::new(MemoryStore::new());
        let allocator = fast(store, 3);
        let parent = TurnId("p".to_string());
        for _ in 0..2 {
            if let Err(e) = allocator.allocate_and_create(&parent, "x").await {
                panic!("allocation failed: {}", e);
            }
        }
        if let Err(e) = allocator.activate(&parent, 2).await {
            panic!("activate failed: {}", e);
        }
        let variants = match allocator.fetch_variants(&parent).await {
            Ok(v) => v,
            Err(e) => panic!("fetch failed: {}", e),
        };
        assert_eq!(variants.len(), 2);
        assert!(!variants[0].is_active);
        assert!(variants[1].is_active);
    }
}
