use crate::constants::CONTINUATION_DIRECTIVE;
use crate::history_pruning::{apply_truncation_marker, truncate};
use crate::persistence::AppendPolicy;
use crate::prompt::{fingerprint, CachedPromptAssembler};
use crate::provider_config::{ConfigResolver, UpstreamConfig, UpstreamRequest};
use crate::store::ConversationStore;
use crate::types::*;
use std::sync::Arc;

/// A request that has been validated, recorded, and turned into an upstream payload.
pub struct TurnOperation {
    pub session: Session,
    pub request_id: RequestId,
    /// User turn persisted before the answer exists; rolled back if nothing comes.
    pub speculative_turn: Option<TurnId>,
    pub policy: AppendPolicy,
    pub config: UpstreamConfig,
    pub payload: UpstreamRequest,
    pub was_truncated: bool,
    pub removed_count: usize,
    pub prompt_fingerprint: String,
}

/// Payload for regenerating one assistant turn as a variant.
pub struct VariantOperation {
    pub parent: TurnRecord,
    pub config: UpstreamConfig,
    pub payload: UpstreamRequest,
}

const MAX_MESSAGE_CHARS: usize = 200_000;

pub struct ChatEngine {
    store: Arc<dyn ConversationStore>,
    prompts: Arc<CachedPromptAssembler>,
    resolver: Arc<dyn ConfigResolver>,
    history_char_limit: usize,
}

impl ChatEngine {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        prompts: Arc<CachedPromptAssembler>,
        resolver: Arc<dyn ConfigResolver>,
        history_char_limit: usize,
    ) -> Self {
        Self {
            store,
            prompts,
            resolver,
            history_char_limit,
        }
    }

    pub fn validate_request(req: &ChatRequest) -> Result<()> {
        if req.user_input().is_none() && !req.regenerate && !req.continue_generation {
            return Err(RelayError::InvalidRequest(
                "message is required unless regenerating or continuing".into(),
            )
            .into());
        }
        if let Some(text) = req.user_input() {
            if text.chars().count() > MAX_MESSAGE_CHARS {
                return Err(RelayError::InvalidRequest(format!(
                    "message exceeds limit of {} characters",
                    MAX_MESSAGE_CHARS
                ))
                .into());
            }
        }
        if let Some(t) = req.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(RelayError::InvalidRequest(format!(
                    "temperature {} is outside 0.0..=2.0",
                    t
                ))
                .into());
            }
        }
        Ok(())
    }

    /// INIT phase: bump liveness, record the user's input, build the payload.
    pub async fn prepare(
        &self,
        session_id: &SessionId,
        request_id: RequestId,
        req: &ChatRequest,
    ) -> Result<TurnOperation> {
        Self::validate_request(req)?;

        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| RelayError::NotFound(format!("session {}", session_id)))?;
        self.store.touch_session(session_id).await?;

        let speculative_turn = match req.user_input() {
            Some(text) => Some(self.store.create_turn(session_id, Role::User, text).await?.id),
            None => None,
        };

        match self.assemble(&session, req, request_id.clone()).await {
            Ok(mut op) => {
                op.speculative_turn = speculative_turn;
                Ok(op)
            }
            Err(e) => {
                if let Some(turn_id) = &speculative_turn {
                    if let Err(del) = self.store.delete_turn(turn_id).await {
                        tracing::error!("Failed to undo speculative turn {}: {}", turn_id, del);
                    }
                }
                Err(e)
            }
        }
    }

    async fn assemble(
        &self,
        session: &Session,
        req: &ChatRequest,
        request_id: RequestId,
    ) -> Result<TurnOperation> {
        let turns = self.store.list_turns(&session.id).await?;
        let system = self.prompts.system_prompt(session);
        let prompt_fingerprint = fingerprint(&system);

        let mut messages = Vec::with_capacity(turns.len() + 2);
        messages.push(ChatMessage::new(Role::System, system));
        messages.extend(
            turns
                .iter()
                .filter(|t| t.role != Role::System)
                .map(ChatMessage::from),
        );
        if req.continue_generation {
            // Transient; never stored.
            messages.push(ChatMessage::new(Role::User, CONTINUATION_DIRECTIVE));
        }

        let mut outcome = truncate(&messages, self.history_char_limit);
        apply_truncation_marker(&mut outcome);
        if outcome.was_truncated {
            tracing::info!(
                request_id = %request_id,
                removed = outcome.removed_count,
                limit = self.history_char_limit,
                "Truncated conversation history"
            );
        }

        let config = self.resolver.resolve(req.model.as_deref());
        let payload = UpstreamRequest::build(
            &config,
            outcome.turns,
            req.stream,
            req.temperature,
            req.max_tokens,
        );

        Ok(TurnOperation {
            session: session.clone(),
            request_id,
            speculative_turn: None,
            policy: AppendPolicy::for_request(req),
            config,
            payload,
            was_truncated: outcome.was_truncated,
            removed_count: outcome.removed_count,
            prompt_fingerprint,
        })
    }

    /// Context for an alternate answer: everything before the parent turn.
    pub async fn prepare_variant(
        &self,
        parent_id: &TurnId,
        req: &VariantRequest,
    ) -> Result<VariantOperation> {
        let parent = self
            .store
            .get_turn(parent_id)
            .await?
            .ok_or_else(|| RelayError::NotFound(format!("turn {}", parent_id)))?;
        if parent.role != Role::Assistant {
            return Err(RelayError::InvalidRequest(
                "variants can only be generated for assistant turns".into(),
            )
            .into());
        }
        let session = self
            .store
            .get_session(&parent.session_id)
            .await?
            .ok_or_else(|| RelayError::NotFound(format!("session {}", parent.session_id)))?;

        let turns = self.store.list_turns(&session.id).await?;
        let mut messages = vec![ChatMessage::new(
            Role::System,
            self.prompts.system_prompt(&session),
        )];
        messages.extend(
            turns
                .iter()
                .filter(|t| t.sequence < parent.sequence && t.role != Role::System)
                .map(ChatMessage::from),
        );

        let mut outcome = truncate(&messages, self.history_char_limit);
        apply_truncation_marker(&mut outcome);

        let config = self.resolver.resolve(req.model.as_deref());
        let payload =
            UpstreamRequest::build(&config, outcome.turns, false, req.temperature, req.max_tokens);
        Ok(VariantOperation {
            parent,
            config,
            payload,
        })
    }
}
