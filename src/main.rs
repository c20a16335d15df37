use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use secrecy::SecretString;
use tokio::sync::broadcast;

use confab_core::ids::OrganizationId;
use confab_core::provider::ReplyGenerator;
use confab_engine::{AgentDirectory, AgentPool, ContextSources, ConversationManager, JsonFileContextLoader, PoolConfig};
use confab_llm::{AnthropicConfig, AnthropicGenerator, MockGenerator};
use confab_server::{EngineOrchestrator, ServerConfig, Services};
use confab_settings::{ConfabSettings, GeneratorSettings};
use confab_store::{Database, SqliteStore};

/// Multi-agent conversation server.
#[derive(Debug, Parser)]
#[command(name = "confab", version)]
struct Cli {
    /// Settings file. Defaults to ~/.confab/settings.json.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the listen port.
    #[arg(long)]
    port: Option<u16>,

    /// Use the offline echo generator instead of a hosted model.
    #[arg(long)]
    offline: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => confab_settings::load_settings_from_path(path),
        None => confab_settings::load_settings(),
    }
    .context("failed to load settings")?;
    if let Some(port) = cli.port {
        settings.server.port = port;
    }

    let _ = confab_telemetry::init_telemetry((&settings.logging).into());
    tracing::info!("starting confab server");

    let db = Database::open(Path::new(&settings.storage.database_path))
        .with_context(|| format!("failed to open database {}", settings.storage.database_path))?;
    tracing::info!(path = %db.path().display(), "database opened");

    let store = Arc::new(SqliteStore::new(db.clone()));
    let (event_tx, event_rx) = broadcast::channel(settings.engine.event_capacity);
    let directory = Arc::new(AgentDirectory::new(store.clone()));
    let conversations = Arc::new(ConversationManager::new(store, event_tx));

    let organization = std::env::var("CONFAB_ORG").unwrap_or_else(|_| "org_default".to_string());
    let seeded = directory
        .seed_builtins(&OrganizationId::from_raw(organization.as_str()))
        .context("failed to seed built-in agents")?;
    tracing::info!(organization = %organization, agents = seeded.len(), "built-in agents ready");

    let generator = build_generator(&settings.generator, cli.offline)?;
    let generator_name = generator.name().to_string();

    let pool = Arc::new(AgentPool::new(
        directory.clone(),
        conversations.clone(),
        ContextSources::uniform(Arc::new(JsonFileContextLoader::new(&settings.context.data_dir))),
        generator,
        pool_config(&settings),
    ));

    let services = Services {
        orchestrator: Arc::new(EngineOrchestrator::new(conversations, directory.clone(), pool)),
        directory,
        db,
        generator: generator_name,
        events: event_rx,
    };
    let handle = confab_server::start(server_config(&settings), services)
        .await
        .context("failed to start server")?;
    tracing::info!(port = handle.port, "confab server ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}

fn build_generator(settings: &GeneratorSettings, offline: bool) -> anyhow::Result<Arc<dyn ReplyGenerator>> {
    let key = std::env::var(&settings.api_key_env).ok().filter(|k| !k.is_empty());
    match key {
        Some(key) if !offline && settings.provider == "anthropic" => {
            let config = AnthropicConfig {
                model: settings.model.clone(),
                base_url: settings.base_url.clone(),
                max_tokens: settings.max_tokens,
            };
            let generator = AnthropicGenerator::new(SecretString::from(key), config)
                .context("failed to build generator")?;
            tracing::info!(model = %settings.model, "using hosted generator");
            Ok(Arc::new(generator))
        }
        _ => {
            tracing::warn!(
                env = %settings.api_key_env,
                offline,
                "no hosted generator configured, agents will echo"
            );
            Ok(Arc::new(MockGenerator::echo()))
        }
    }
}

fn pool_config(settings: &ConfabSettings) -> PoolConfig {
    PoolConfig {
        invocation_timeout: Duration::from_millis(settings.engine.invocation_timeout_ms),
        history_window: settings.engine.history_window,
    }
}

fn server_config(settings: &ConfabSettings) -> ServerConfig {
    let heartbeat = Duration::from_millis(settings.server.heartbeat_interval_ms);
    ServerConfig {
        host: settings.server.host.clone(),
        port: settings.server.port,
        max_send_queue: settings.server.max_send_queue,
        heartbeat,
        client_timeout: heartbeat * 3,
        unread_window: settings.engine.unread_window,
    }
}
