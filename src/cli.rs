//! CLI subcommands and service wiring.
//!
//! `mathtop run` starts the bot and the health endpoint; the remaining
//! commands operate on the database directly.

use anyhow::{Context, Result};
use clap::Subcommand;
use credit_ledger::{
    CompletionService, CreditLedger, MemoCache, MeteredCompletions, SqliteLedgerStore, UserId,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

use crate::api::ApiServer;
use crate::assistant::MathAssistant;
use crate::bot::Bot;
use crate::channels::{Gateway, TelegramGateway};
use crate::config::{Config, OPENAI_KEY_ENV};
use crate::openai::OpenAiClient;
use crate::videos::{self, SqliteVideoIndex, VideoIndex};

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Commands {
    /// Run the bot (default)
    Run,
    /// Create the database tables and exit
    InitDb,
    /// Embed and store videos from a `url,description` CSV
    ImportVideos {
        /// CSV file, one video per line
        csv: PathBuf,
    },
    /// Show a user's balance and usage log
    Usage {
        /// Messaging user id
        user_id: UserId,
    },
    /// Validate configuration and database access
    Check,
}

pub async fn handle_command(cmd: Commands, config: &Config) -> Result<()> {
    match cmd {
        Commands::Run => run_bot(config).await,
        Commands::InitDb => init_db(config),
        Commands::ImportVideos { csv } => import_videos(config, &csv).await,
        Commands::Usage { user_id } => show_usage(config, user_id).await,
        Commands::Check => check(config).await,
    }
}

fn open_ledger(config: &Config) -> Result<Arc<CreditLedger>> {
    let path = config.database_path();
    let store = SqliteLedgerStore::open(&path)
        .with_context(|| format!("Failed to open database {}", path.display()))?;
    Ok(Arc::new(CreditLedger::new(Arc::new(store))))
}

fn open_videos(config: &Config) -> Result<Arc<SqliteVideoIndex>> {
    let path = config.database_path();
    let index = SqliteVideoIndex::open(&path)
        .with_context(|| format!("Failed to open video catalogue {}", path.display()))?;
    Ok(Arc::new(index))
}

async fn run_bot(config: &Config) -> Result<()> {
    info!("Starting mathtop v{}", env!("CARGO_PKG_VERSION"));
    let (telegram_token, openai_key) = config.require_secrets()?;

    let ledger = open_ledger(config)?;
    let videos = open_videos(config)?;
    let service: Arc<dyn CompletionService> =
        Arc::new(OpenAiClient::new(&config.openai, openai_key)?);
    let gateway: Arc<dyn Gateway> =
        Arc::new(TelegramGateway::new(&config.telegram, telegram_token)?);

    let metered = MeteredCompletions::new(
        Arc::clone(&ledger),
        Arc::clone(&service),
        config.pricing_table(),
        MemoCache::new(config.cache.capacity),
    );
    let assistant = MathAssistant::new(config, metered, service, videos);
    let bot = Arc::new(Bot::new(config, gateway, assistant));

    if config.api.enabled {
        let api_server = ApiServer::new(config.api.bind.clone());
        let ledger = Arc::clone(&ledger);
        tokio::spawn(async move {
            if let Err(e) = api_server.start(ledger).await {
                error!("API server error: {e:#}");
            }
        });
    }

    tokio::select! {
        _ = bot.run() => {}
        result = wait_for_shutdown() => {
            result?;
            info!("Received shutdown signal, stopping bot...");
        }
    }

    Ok(())
}

fn init_db(config: &Config) -> Result<()> {
    open_ledger(config)?;
    open_videos(config)?;
    println!("✓ Database ready at {}", config.database.path);
    Ok(())
}

async fn import_videos(config: &Config, csv: &Path) -> Result<()> {
    let key = config
        .openai
        .api_key
        .as_deref()
        .with_context(|| format!("Missing OpenAI API key (set {OPENAI_KEY_ENV})"))?;
    let service = OpenAiClient::new(&config.openai, key)?;
    let index = open_videos(config)?;

    let imported =
        videos::import_csv(csv, index.as_ref(), &service, &config.models.embedding).await?;
    println!(
        "✓ Imported {imported} videos ({} in catalogue)",
        index.count().await?
    );
    Ok(())
}

async fn show_usage(config: &Config, user_id: UserId) -> Result<()> {
    let ledger = open_ledger(config)?;
    let Some(balance) = ledger.balance(user_id).await? else {
        println!("No usage recorded for user {user_id}");
        return Ok(());
    };

    println!("User {user_id}");
    println!("  Available tokens: {}", balance.available());
    println!("  Net token delta:  {}", balance.tokens);
    println!("  Total cost:       ${:.4}", balance.cost);
    println!();
    for entry in ledger.entries(user_id).await? {
        println!(
            "  {}  {:<22} {:>10}  ${:.6}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.model,
            entry.tokens,
            entry.cost
        );
    }
    Ok(())
}

async fn check(config: &Config) -> Result<()> {
    println!("Checking configuration...");
    config.validate()?;
    println!("✓ Configuration is valid");

    match config.require_secrets() {
        Ok(_) => println!("✓ API keys are set"),
        Err(e) => println!("⚠ {e}"),
    }

    let ledger = open_ledger(config)?;
    if !ledger.is_reachable().await {
        anyhow::bail!("Database {} is not reachable", config.database.path);
    }
    let videos = open_videos(config)?;
    println!(
        "✓ Database connection successful ({} videos in catalogue)",
        videos.count().await?
    );

    println!("\nmathtop is ready to run with these settings.");
    Ok(())
}

pub async fn wait_for_shutdown() -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C");
        }
    }

    Ok(())
}
