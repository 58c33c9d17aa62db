mod gateway;
mod registry;
mod server;

use aviary_core::{
    config,
    traits::{Channel, Completion, Membership},
};
use aviary_memory::{ConsentStore, SessionStore};
use aviary_providers::OpenAiCompletion;
use aviary_telegram::TelegramApi;
use clap::{Parser, Subcommand};
use gateway::BotHandler;
use registry::{BotEntry, BotRegistry};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "aviary",
    version,
    about = "Aviary — multi-bot Telegram webhook gateway"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file.
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Register webhooks and serve updates for every configured bot.
    Start,
    /// Check configuration and completion-service availability.
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_missing = !std::path::Path::new(&cli.config).exists();
    let cfg = config::load(&cli.config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.gateway.log_level)),
        )
        .init();

    if config_missing {
        warn!("config file not found at {}, using defaults", cli.config);
    }

    match cli.command {
        Commands::Start => start(cfg).await,
        Commands::Status => status(&cli.config, cfg).await,
    }
}

async fn start(cfg: config::Config) -> anyhow::Result<()> {
    if cfg.bots.is_empty() {
        anyhow::bail!("no bots configured. Add at least one [[bots]] entry to config.toml.");
    }
    if cfg.gateway.base_url.is_empty() {
        anyhow::bail!("gateway.base_url is empty. Telegram needs a public HTTPS callback URL.");
    }

    let provider: Arc<dyn Completion> = Arc::new(OpenAiCompletion::from_config(&cfg.provider));
    if !provider.is_available().await {
        anyhow::bail!("completion provider '{}' is not available", provider.name());
    }

    // Consent store failure at startup is fatal: serving without the
    // eligibility gate is not an option.
    let consent = ConsentStore::new(&cfg.consent, cfg.access.policy_version).await?;
    let sessions = Arc::new(SessionStore::new(cfg.reply.max_turns));

    let mut registry = BotRegistry::new();
    for bot in &cfg.bots {
        let api = Arc::new(TelegramApi::new(&bot.token));
        let handler = BotHandler::new(
            bot,
            &cfg.access,
            &cfg.reply,
            api.clone() as Arc<dyn Channel>,
            api.clone() as Arc<dyn Membership>,
            consent.clone(),
            sessions.clone(),
            provider.clone(),
        );
        let queue = gateway::spawn_pipeline(Arc::new(handler));
        registry.register(BotEntry {
            id: bot.id.clone(),
            secret: bot.secret.clone(),
            api,
            queue,
        })?;
    }
    let registry = Arc::new(registry);

    let base_url = cfg.gateway.base_url.trim_end_matches('/');
    for entry in registry.entries() {
        let url = format!("{base_url}/webhook/{}", entry.id);
        entry
            .api
            .set_webhook(&url, &entry.secret, cfg.webhook.drop_pending)
            .await?;
        info!("[{}] registered webhook at {url}", entry.id);
    }

    server::serve(registry.clone(), &cfg.gateway.host, cfg.gateway.port).await?;

    // Best-effort teardown so Telegram stops posting to a dead endpoint.
    for entry in registry.entries() {
        if let Err(e) = entry.api.delete_webhook().await {
            warn!("[{}] failed to delete webhook: {e}", entry.id);
        }
    }
    Ok(())
}

async fn status(config_path: &str, cfg: config::Config) -> anyhow::Result<()> {
    println!("Aviary — Status Check\n");
    println!("Config: {config_path}");
    println!("Listen: {}:{}", cfg.gateway.host, cfg.gateway.port);
    println!(
        "Base URL: {}",
        if cfg.gateway.base_url.is_empty() {
            "(not set)"
        } else {
            &cfg.gateway.base_url
        }
    );
    println!(
        "Required channel: {}",
        if cfg.access.required_channel.is_empty() {
            "(not set)"
        } else {
            &cfg.access.required_channel
        }
    );
    println!();

    println!("Bots ({}):", cfg.bots.len());
    for bot in &cfg.bots {
        println!(
            "  {} — token {}, secret {}",
            bot.id,
            if bot.token.is_empty() { "missing" } else { "set" },
            if bot.secret.is_empty() { "missing" } else { "set" },
        );
    }
    println!();

    let provider = OpenAiCompletion::from_config(&cfg.provider);
    let available = provider.is_available().await;
    println!(
        "Provider {} ({}): {}",
        cfg.provider.model,
        cfg.provider.base_url,
        if available { "available" } else { "not reachable" }
    );
    Ok(())
}
