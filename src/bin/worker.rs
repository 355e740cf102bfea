//! Process entry point: wires `Settings` into every collaborator and runs
//! one worker until a shutdown signal drains it (SPEC_FULL.md §4.2).

use mobility_agent::agent::AgentLoop;
use mobility_agent::chat::InfobipChatGateway;
use mobility_agent::config::Settings;
use mobility_agent::context::ContextStore;
use mobility_agent::gateway::{OAuth2Config, ToolGateway};
use mobility_agent::kv::RedisStore;
use mobility_agent::llm::LlmClient;
use mobility_agent::logging;
use mobility_agent::metrics::{self, Metrics};
use mobility_agent::registry::{DEFAULT_RELOAD_INTERVAL_SECS, OpenApiSource, ToolRegistry};
use mobility_agent::worker::{AnonymousIdentityResolver, Worker};
use std::path::PathBuf;
use std::sync::Arc;

/// Local fallback source consulted when `SWAGGER_URL` is unset
/// (SPEC_FULL.md §10).
const DEFAULT_OPENAPI_PATH: &str = "openapi.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::from_env()?;
    logging::init(settings.app_env);

    tracing::info!(app_env = ?settings.app_env, "starting worker");

    if let Err(error) = metrics::install_prometheus_exporter() {
        tracing::warn!(%error, "prometheus exporter failed to install; continuing without a metrics endpoint");
    }

    let store = Arc::new(RedisStore::connect(&settings.redis_url).await?);

    let llm = Arc::new(LlmClient::new(
        "https://api.openai.com/v1",
        settings.openai_api_key.clone(),
        settings.openai_model.clone(),
    ));

    let registry = Arc::new(ToolRegistry::new(store.clone(), llm.clone()));
    let context = Arc::new(ContextStore::new(store.clone(), llm.clone()));
    let gateway = Arc::new(ToolGateway::new(
        settings.mobility_api_url.clone(),
        settings.mobility_api_token.clone(),
        OAuth2Config::from_settings(&settings),
    ));
    let agent = Arc::new(AgentLoop::new(context.clone(), registry.clone(), llm.clone(), gateway.clone()));

    let chat = Arc::new(InfobipChatGateway::new(
        settings.infobip_base_url.clone(),
        settings.infobip_api_key.clone(),
        settings.infobip_sender_number.clone(),
    ));

    let metrics = Arc::new(Metrics::new());
    let identity = Arc::new(AnonymousIdentityResolver);

    let worker = Arc::new(Worker::new(store, registry.clone(), context, agent, chat, identity, metrics));

    let source = match &settings.swagger_url {
        Some(url) => OpenApiSource::Url(url.clone()),
        None => OpenApiSource::File(PathBuf::from(DEFAULT_OPENAPI_PATH)),
    };

    worker.startup(&source).await?;

    if settings.swagger_url.is_some() {
        registry.spawn_hot_reload(source, DEFAULT_RELOAD_INTERVAL_SECS);
    }

    worker.run().await?;

    tracing::info!("worker exited cleanly");
    Ok(())
}
