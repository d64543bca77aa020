//! Saving generated content and undoing speculative turns.
//!
//! One [`ResponsePersister`] exists per relayed request. Its save and rollback
//! are each guarded so they run at most once, whichever exit path reaches them
//! first.

use crate::constants::ASSISTANT_APPEND_SEPARATOR;
use crate::store::ConversationStore;
use crate::types::{ChatRequest, RequestId, Result, Role, SessionId, TurnId, TurnRecord};
use std::sync::Arc;

/// Whether new content may extend the latest assistant turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendPolicy {
    /// Regeneration without new input, or a continuation directive.
    ExtendAssistant,
    AlwaysNew,
}

impl AppendPolicy {
    pub fn for_request(req: &ChatRequest) -> Self {
        let pure_regeneration = req.regenerate && req.user_input().is_none();
        if pure_regeneration || req.continue_generation {
            AppendPolicy::ExtendAssistant
        } else {
            AppendPolicy::AlwaysNew
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    Appended(TurnRecord),
    Created(TurnRecord),
    /// Nothing to save, or already saved.
    Skipped,
}

pub struct ResponsePersister {
    store: Arc<dyn ConversationStore>,
    session_id: SessionId,
    request_id: RequestId,
    speculative_turn: Option<TurnId>,
    policy: AppendPolicy,
    save_initiated: bool,
    message_saved: bool,
    rollback_done: bool,
}

impl ResponsePersister {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        session_id: SessionId,
        request_id: RequestId,
        speculative_turn: Option<TurnId>,
        policy: AppendPolicy,
    ) -> Self {
        Self {
            store,
            session_id,
            request_id,
            speculative_turn,
            policy,
            save_initiated: false,
            message_saved: false,
            rollback_done: false,
        }
    }

    pub fn save_initiated(&self) -> bool {
        self.save_initiated
    }

    pub fn message_saved(&self) -> bool {
        self.message_saved
    }

    pub fn speculative_turn(&self) -> Option<&TurnId> {
        self.speculative_turn.as_ref()
    }

    /// Persists `content`, deciding append-vs-new against the store as it is now.
    pub async fn save(&mut self, content: &str) -> Result<SaveOutcome> {
        if self.save_initiated || content.is_empty() {
            return Ok(SaveOutcome::Skipped);
        }
        self.save_initiated = true;

        let latest = self.store.latest_turn(&self.session_id).await?;
        let outcome = match latest {
            Some(turn)
                if turn.role == Role::Assistant
                    && self.policy == AppendPolicy::ExtendAssistant =>
            {
                let addition = format!("{}{}", ASSISTANT_APPEND_SEPARATOR, content);
                let updated = self.store.append_to_turn(&turn.id, &addition).await?;
                tracing::debug!(
                    request_id = %self.request_id,
                    turn_id = %updated.id,
                    chars = content.chars().count(),
                    "Appended generated content to existing assistant turn"
                );
                SaveOutcome::Appended(updated)
            }
            _ => {
                let created = self
                    .store
                    .create_turn(&self.session_id, Role::Assistant, content)
                    .await?;
                tracing::debug!(
                    request_id = %self.request_id,
                    turn_id = %created.id,
                    chars = content.chars().count(),
                    "Saved generated content as new assistant turn"
                );
                SaveOutcome::Created(created)
            }
        };
        self.message_saved = true;
        Ok(outcome)
    }

    /// Deletes the speculative user turn when nothing was generated. Returns
    /// whether a turn was removed.
    pub async fn rollback_if_empty(&mut self, content: &str) -> Result<bool> {
        if self.rollback_done || !content.is_empty() || self.message_saved {
            return Ok(false);
        }
        let Some(turn_id) = self.speculative_turn.clone() else {
            return Ok(false);
        };
        self.rollback_done = true;

        let removed = self.store.delete_turn(&turn_id).await?;
        if removed {
            tracing::info!(
                request_id = %self.request_id,
                turn_id = %turn_id,
                "Rolled back speculative user turn after empty response"
            );
        }
        Ok(removed)
    }
}
