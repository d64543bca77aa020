//! Conversation store port.
//!
//! The relay and the variant allocator only talk to storage through
//! [`ConversationStore`]. [`MemoryStore`] is a complete in-process
//! implementation used by tests and by `--database :memory:`-style setups that
//! do not want SQLite; it enforces the same `(parent, version)` uniqueness the
//! SQLite schema does.

use crate::types::{
    NewSession, RelayError, RequestId, Result, Role, Session, SessionId, TurnId, TurnRecord,
    Variant,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

pub fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create_session(&self, new: NewSession) -> Result<Session>;
    async fn get_session(&self, id: &SessionId) -> Result<Option<Session>>;
    /// Bumps the session's liveness timestamp.
    async fn touch_session(&self, id: &SessionId) -> Result<()>;

    /// All turns of a session in creation order.
    async fn list_turns(&self, session: &SessionId) -> Result<Vec<TurnRecord>>;
    async fn get_turn(&self, id: &TurnId) -> Result<Option<TurnRecord>>;
    async fn latest_turn(&self, session: &SessionId) -> Result<Option<TurnRecord>>;
    async fn create_turn(&self, session: &SessionId, role: Role, content: &str)
        -> Result<TurnRecord>;
    /// Concatenates `addition` onto an existing turn's content.
    async fn append_to_turn(&self, id: &TurnId, addition: &str) -> Result<TurnRecord>;
    /// Returns whether a turn was actually removed.
    async fn delete_turn(&self, id: &TurnId) -> Result<bool>;

    async fn save_stream_checkpoint(
        &self,
        session: &SessionId,
        request: &RequestId,
        partial: &str,
    ) -> Result<()>;
    async fn get_stream_checkpoint(
        &self,
        session: &SessionId,
        request: &RequestId,
    ) -> Result<Option<String>>;
    async fn save_debug_snapshot(&self, session: &SessionId, snapshot: &Value) -> Result<()>;
    async fn get_debug_snapshot(&self, session: &SessionId) -> Result<Option<Value>>;

    /// Highest version recorded for `parent`, or 0.
    async fn max_variant_version(&self, parent: &TurnId) -> Result<u32>;
    async fn variant_exists(&self, parent: &TurnId, version: u32) -> Result<bool>;
    /// Fails with `VariantVersionConflict` when `(parent, version)` is taken.
    async fn insert_variant(&self, parent: &TurnId, version: u32, content: &str)
        -> Result<Variant>;
    async fn list_variants(&self, parent: &TurnId) -> Result<Vec<Variant>>;
    /// Deactivates every sibling and activates `version` as one unit.
    async fn activate_variant(&self, parent: &TurnId, version: u32) -> Result<()>;

    async fn ping(&self) -> Result<()>;
}

#[derive(Default)]
struct MemoryState {
    sessions: HashMap<SessionId, Session>,
    turns: Vec<TurnRecord>,
    next_sequence: i64,
    checkpoints: HashMap<(SessionId, RequestId), String>,
    snapshots: HashMap<SessionId, Value>,
    variants: HashMap<TurnId, Vec<Variant>>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    yield_between_ops: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Yields to the scheduler before every variant read, so concurrent
    /// allocators interleave the way they would against a real database.
    pub fn with_interleaving() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            yield_between_ops: true,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| RelayError::internal("memory store lock poisoned").into())
    }

    async fn maybe_yield(&self) {
        if self.yield_between_ops {
            tokio::task::yield_now().await;
        }
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn create_session(&self, new: NewSession) -> Result<Session> {
        let session = Session {
            id: SessionId::generate(),
            title: new.title,
            summary: new.summary,
            last_active_at: Some(now_timestamp()),
        };
        self.lock()?
            .sessions
            .insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn get_session(&self, id: &SessionId) -> Result<Option<Session>> {
        Ok(self.lock()?.sessions.get(id).cloned())
    }

    async fn touch_session(&self, id: &SessionId) -> Result<()> {
        let mut state = self.lock()?;
        match state.sessions.get_mut(id) {
            Some(session) => {
                session.last_active_at = Some(now_timestamp());
                Ok(())
            }
            None => Err(RelayError::NotFound(format!("session {}", id)).into()),
        }
    }

    async fn list_turns(&self, session: &SessionId) -> Result<Vec<TurnRecord>> {
        Ok(self
            .lock()?
            .turns
            .iter()
            .filter(|t| &t.session_id == session)
            .cloned()
            .collect())
    }

    async fn get_turn(&self, id: &TurnId) -> Result<Option<TurnRecord>> {
        Ok(self.lock()?.turns.iter().find(|t| &t.id == id).cloned())
    }

    async fn latest_turn(&self, session: &SessionId) -> Result<Option<TurnRecord>> {
        Ok(self
            .lock()?
            .turns
            .iter()
            .rev()
            .find(|t| &t.session_id == session)
            .cloned())
    }

    async fn create_turn(
        &self,
        session: &SessionId,
        role: Role,
        content: &str,
    ) -> Result<TurnRecord> {
        let mut state = self.lock()?;
        if !state.sessions.contains_key(session) {
            return Err(RelayError::NotFound(format!("session {}", session)).into());
        }
        state.next_sequence += 1;
        let turn = TurnRecord {
            id: TurnId::generate(),
            session_id: session.clone(),
            role,
            content: content.to_string(),
            sequence: state.next_sequence,
            created_at: now_timestamp(),
        };
        state.turns.push(turn.clone());
        Ok(turn)
    }

    async fn append_to_turn(&self, id: &TurnId, addition: &str) -> Result<TurnRecord> {
        let mut state = self.lock()?;
        match state.turns.iter_mut().find(|t| &t.id == id) {
            Some(turn) => {
                turn.content.push_str(addition);
                Ok(turn.clone())
            }
            None => Err(RelayError::NotFound(format!("turn {}", id)).into()),
        }
    }

    async fn delete_turn(&self, id: &TurnId) -> Result<bool> {
        let mut state = self.lock()?;
        let before = state.turns.len();
        state.turns.retain(|t| &t.id != id);
        let removed = state.turns.len() != before;
        if removed {
            state.variants.remove(id);
        }
        Ok(removed)
    }

    async fn save_stream_checkpoint(
        &self,
        session: &SessionId,
        request: &RequestId,
        partial: &str,
    ) -> Result<()> {
        self.lock()?
            .checkpoints
            .insert((session.clone(), request.clone()), partial.to_string());
        Ok(())
    }

    async fn get_stream_checkpoint(
        &self,
        session: &SessionId,
        request: &RequestId,
    ) -> Result<Option<String>> {
        Ok(self
            .lock()?
            .checkpoints
            .get(&(session.clone(), request.clone()))
            .cloned())
    }

    async fn save_debug_snapshot(&self, session: &SessionId, snapshot: &Value) -> Result<()> {
        self.lock()?
            .snapshots
            .insert(session.clone(), snapshot.clone());
        Ok(())
    }

    async fn get_debug_snapshot(&self, session: &SessionId) -> Result<Option<Value>> {
        Ok(self.lock()?.snapshots.get(session).cloned())
    }

    async fn max_variant_version(&self, parent: &TurnId) -> Result<u32> {
        self.maybe_yield().await;
        Ok(self
            .lock()?
            .variants
            .get(parent)
            .and_then(|vs| vs.iter().map(|v| v.version).max())
            .unwrap_or(0))
    }

    async fn variant_exists(&self, parent: &TurnId, version: u32) -> Result<bool> {
        self.maybe_yield().await;
        Ok(self
            .lock()?
            .variants
            .get(parent)
            .is_some_and(|vs| vs.iter().any(|v| v.version == version)))
    }

    async fn insert_variant(
        &self,
        parent: &TurnId,
        version: u32,
        content: &str,
    ) -> Result<Variant> {
        self.maybe_yield().await;
        let mut state = self.lock()?;
        let siblings = state.variants.entry(parent.clone()).or_default();
        if siblings.iter().any(|v| v.version == version) {
            return Err(RelayError::VariantVersionConflict {
                parent: parent.clone(),
                version,
            }
            .into());
        }
        let variant = Variant {
            parent_turn_id: parent.clone(),
            version,
            content: content.to_string(),
            is_active: false,
            created_at: now_timestamp(),
        };
        siblings.push(variant.clone());
        Ok(variant)
    }

    async fn list_variants(&self, parent: &TurnId) -> Result<Vec<Variant>> {
        let mut variants = self
            .lock()?
            .variants
            .get(parent)
            .cloned()
            .unwrap_or_default();
        variants.sort_by_key(|v| v.version);
        Ok(variants)
    }

    async fn activate_variant(&self, parent: &TurnId, version: u32) -> Result<()> {
        let mut state = self.lock()?;
        let siblings = state.variants.get_mut(parent);
        let Some(siblings) = siblings.filter(|vs| vs.iter().any(|v| v.version == version)) else {
            return Err(
                RelayError::NotFound(format!("variant {} of turn {}", version, parent)).into(),
            );
        };
        for v in siblings.iter_mut() {
            v.is_active = v.version == version;
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.lock().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with_session() -> (MemoryStore, SessionId) {
        let store = MemoryStore::new();
        let session = match store.create_session(NewSession::default()).await {
            Ok(s) => s,
            Err(e) => panic!("create_session failed: {}", e),
        };
        (store, session.id)
    }

    #[tokio::test]
    async fn test_turns_keep_creation_order() {
        let (store, sid) = store_with_session().await;
        for (role, text) in [(Role::User, "a"), (Role::Assistant, "b"), (Role::User, "c")] {
            if let Err(e) = store.create_turn(&sid, role, text).await {
                panic!("create_turn failed: {}", e);
            }
        }
        let turns = match store.list_turns(&sid).await {
            Ok(t) => t,
            Err(e) => panic!("list_turns failed: {}", e),
        };
        let contents: Vec<_> = turns.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["a", "b", "c"]);
        assert!(turns.windows(2).all(|w| w[0].sequence < w[1].sequence));

        match store.latest_turn(&sid).await {
            Ok(Some(t)) => assert_eq!(t.content, "c"),
            other => panic!("unexpected latest turn: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_duplicate_variant_version_conflicts() {
        let store = MemoryStore::new();
        let parent = TurnId("p".to_string());
        if let Err(e) = store.insert_variant(&parent, 1, "one").await {
            panic!("first insert failed: {}", e);
        }
        match store.insert_variant(&parent, 1, "again").await {
            Err(e) => assert!(matches!(
                e.inner,
                RelayError::VariantVersionConflict { version: 1, .. }
            )),
            Ok(_) => panic!("duplicate version was accepted"),
        }
    }

    #[tokio::test]
    async fn test_activation_is_exclusive() {
        let store = MemoryStore::new();
        let parent = TurnId("p".to_string());
        for v in 1..=3 {
            if let Err(e) = store.insert_variant(&parent, v, "x").await {
                panic!("insert failed: {}", e);
            }
        }
        for v in [2, 3] {
            if let Err(e) = store.activate_variant(&parent, v).await {
                panic!("activate failed: {}", e);
            }
        }
        let variants = match store.list_variants(&parent).await {
            Ok(v) => v,
            Err(e) => panic!("list failed: {}", e),
        };
        let active: Vec<_> = variants.iter().filter(|v| v.is_active).map(|v| v.version).collect();
        assert_eq!(active, vec![3]);

        assert!(store.activate_variant(&parent, 9).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_turn_reports_whether_removed() {
        let (store, sid) = store_with_session().await;
        let turn = match store.create_turn(&sid, Role::User, "hi").await {
            Ok(t) => t,
            Err(e) => panic!("create_turn failed: {}", e),
        };
        assert!(matches!(store.delete_turn(&turn.id).await, Ok(true)));
        assert!(matches!(store.delete_turn(&turn.id).await, Ok(false)));
    }
}
