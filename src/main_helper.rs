use crate::constants::*;
use crate::engine::ChatEngine;
use crate::prompt::{CachedPromptAssembler, PersonaPromptAssembler};
use crate::provider_config::StaticConfigResolver;
use crate::store::ConversationStore;
use crate::streaming::{Relay, RelaySettings};
use crate::types::*;
use crate::upstream::UpstreamClient;
use crate::variants::VariantAllocator;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(long, default_value_t = 8080)]
    pub port: u16,
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, default_value = "turnstream.db")]
    pub database: String,
    #[arg(long, default_value = DEFAULT_UPSTREAM_URL)]
    pub upstream_url: String,
    #[arg(long, default_value = DEFAULT_MODEL)]
    pub model: String,
    /// Forces the name of the output-token limit field for every model.
    #[arg(long)]
    pub max_tokens_field: Option<String>,
    #[arg(long, default_value = DEFAULT_PERSONA)]
    pub persona: String,
    #[arg(long, default_value_t = DEFAULT_HISTORY_CHAR_LIMIT)]
    pub history_char_limit: usize,
    #[arg(long, default_value_t = UPSTREAM_INACTIVITY_TIMEOUT_SECS)]
    pub inactivity_timeout_secs: u64,
    #[arg(long, default_value_t = UPSTREAM_CONNECT_TIMEOUT_SECS)]
    pub connect_timeout_secs: u64,
    #[arg(long, default_value_t = HEARTBEAT_INTERVAL_SECS)]
    pub heartbeat_interval_secs: u64,
    #[arg(long, default_value_t = CHECKPOINT_INTERVAL_MS)]
    pub checkpoint_interval_ms: u64,
    #[arg(long, default_value_t = VARIANT_MAX_ATTEMPTS)]
    pub variant_attempts: u32,
    #[arg(long, default_value_t = PROMPT_CACHE_TTL_SECS)]
    pub prompt_cache_ttl_secs: u64,
    #[arg(long, default_value_t = 10 * 1024 * 1024)]
    pub max_body_size: usize,
}

impl Args {
    pub fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs.max(1)),
            inactivity_timeout: Duration::from_secs(self.inactivity_timeout_secs.max(1)),
            checkpoint_interval: Duration::from_millis(self.checkpoint_interval_ms),
            ..RelaySettings::default()
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ConversationStore>,
    pub engine: Arc<ChatEngine>,
    pub prompts: Arc<CachedPromptAssembler>,
    pub upstream: UpstreamClient,
    pub relay: Relay,
    pub allocator: Arc<VariantAllocator>,
    pub health: Arc<UpstreamHealth>,
    pub args: Arc<Args>,
}

impl AppState {
    /// Wires every component from the parsed arguments.
    pub fn new(
        args: Args,
        store: Arc<dyn ConversationStore>,
        http: reqwest::Client,
        api_key: String,
    ) -> Self {
        let prompts = Arc::new(CachedPromptAssembler::new(
            Arc::new(PersonaPromptAssembler::new(args.persona.clone())),
            Duration::from_secs(args.prompt_cache_ttl_secs),
        ));
        let resolver = Arc::new(
            StaticConfigResolver::new(args.upstream_url.clone(), args.model.clone(), api_key)
                .with_max_tokens_field(args.max_tokens_field.clone()),
        );
        let engine = Arc::new(ChatEngine::new(
            store.clone(),
            prompts.clone(),
            resolver,
            args.history_char_limit,
        ));
        let upstream = UpstreamClient::new(
            http,
            Duration::from_secs(args.inactivity_timeout_secs.max(1)),
        );
        let health = Arc::new(UpstreamHealth::default());
        let relay = Relay::new(
            store.clone(),
            upstream.clone(),
            health.clone(),
            args.relay_settings(),
        );
        let allocator = Arc::new(VariantAllocator::with_attempts(
            store.clone(),
            args.variant_attempts,
        ));

        Self {
            store,
            engine,
            prompts,
            upstream,
            relay,
            allocator,
            health,
            args: Arc::new(args),
        }
    }
}
