//! System prompt assembly.
//!
//! The relay treats the system text as opaque. Assembly results are memoized in
//! a [`TtlCache`] owned by the application state, never in a global.

use crate::types::{Session, SessionId};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub trait PromptAssembler: Send + Sync {
    fn assemble(&self, session: &Session) -> String;
}

/// Persona text followed by the session's running summary, if any.
pub struct PersonaPromptAssembler {
    persona: String,
}

impl PersonaPromptAssembler {
    pub fn new(persona: impl Into<String>) -> Self {
        Self {
            persona: persona.into(),
        }
    }
}

impl PromptAssembler for PersonaPromptAssembler {
    fn assemble(&self, session: &Session) -> String {
        match session.summary.as_deref().map(str::trim) {
            Some(summary) if !summary.is_empty() => format!(
                "{}\n\nSummary of the conversation so far:\n{}",
                self.persona, summary
            ),
            _ => self.persona.clone(),
        }
    }
}

/// Small map whose entries expire `ttl` after insertion.
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: Mutex<HashMap<K, (Instant, V)>>,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock().ok()?;
        let expired = match entries.get(key) {
            Some((stored_at, value)) if stored_at.elapsed() < self.ttl => {
                return Some(value.clone())
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.remove(key);
        }
        None
    }

    pub fn insert(&self, key: K, value: V) {
        if let Ok(mut entries) = self.entries.lock() {
            // Opportunistic sweep so abandoned keys do not pile up.
            let ttl = self.ttl;
            entries.retain(|_, (stored_at, _)| stored_at.elapsed() < ttl);
            entries.insert(key, (Instant::now(), value));
        }
    }

    pub fn invalidate(&self, key: &K) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct CachedPromptAssembler {
    inner: Arc<dyn PromptAssembler>,
    cache: TtlCache<SessionId, String>,
}

impl CachedPromptAssembler {
    pub fn new(inner: Arc<dyn PromptAssembler>, ttl: Duration) -> Self {
        Self {
            inner,
            cache: TtlCache::new(ttl),
        }
    }

    pub fn system_prompt(&self, session: &Session) -> String {
        if let Some(hit) = self.cache.get(&session.id) {
            return hit;
        }
        let prompt = self.inner.assemble(session);
        self.cache.insert(session.id.clone(), prompt.clone());
        prompt
    }

    pub fn invalidate(&self, session: &SessionId) {
        self.cache.invalidate(session);
    }
}

/// Hex SHA-256 of a prompt, recorded in diagnostics instead of the text itself.
pub fn fingerprint(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}
