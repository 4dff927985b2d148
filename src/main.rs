use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use conversation_service::channels::web::{GatewayState, start_server};
use conversation_service::config::Config;
use conversation_service::db::{self, libsql_migrations};
use conversation_service::upstream::{AiCoreClient, ChatUpstream};

#[derive(Parser, Debug)]
#[command(name = "conversation-service", version, about)]
struct Cli {
    /// TOML settings file; environment variables override it.
    #[arg(long, env = "CONVERSATION_SETTINGS")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API (default).
    Serve,
    /// Inspect or move the database schema.
    Migrate {
        #[command(subcommand)]
        action: MigrateAction,
    },
}

#[derive(Subcommand, Debug)]
enum MigrateAction {
    /// Apply pending steps.
    Up {
        /// Stop after this step instead of going to head.
        #[arg(long)]
        target: Option<String>,
    },
    /// Revert applied steps newer than the target.
    Down {
        #[arg(long, required_unless_present = "all", conflicts_with = "all")]
        target: Option<String>,
        /// Revert every step.
        #[arg(long)]
        all: bool,
    },
    /// List steps and whether each is applied.
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    init_tracing(&config);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Migrate { action } => migrate(&config, action).await,
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if config.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let db = db::connect_from_config(&config.database)
        .await
        .context("opening database")?;

    let upstream: Arc<dyn ChatUpstream> = Arc::new(
        AiCoreClient::new(&config.upstream.url, config.upstream.timeout)
            .context("building AI Core client")?,
    );

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| {
            format!(
                "invalid listen address {}:{}",
                config.server.host, config.server.port
            )
        })?;

    let state = Arc::new(GatewayState::new(db, Arc::clone(&upstream), &config));
    let (bound, server) = start_server(addr, Arc::clone(&state), &config.server.cors_origins).await?;

    tracing::info!(
        addr = %bound,
        upstream = %config.upstream.url,
        database = %config.database.path.display(),
        "conversation-service started"
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("Shutdown requested");

    state.shutdown().await;
    if let Err(e) = server.await {
        tracing::error!(error = %e, "HTTP server task panicked");
    }
    upstream.close().await;
    tracing::info!("conversation-service stopped");
    Ok(())
}

async fn migrate(config: &Config, action: MigrateAction) -> anyhow::Result<()> {
    let backend = db::open_from_config(&config.database)
        .await
        .context("opening database")?;
    let conn = backend.connect().await?;

    match action {
        MigrateAction::Up { target } => {
            let applied = libsql_migrations::migrate_up(&conn, target.as_deref()).await?;
            if applied.is_empty() {
                println!("Schema already up to date");
            }
            for id in applied {
                println!("applied  {id}");
            }
        }
        MigrateAction::Down { target, all } => {
            let target = if all { None } else { target.as_deref() };
            let reverted = libsql_migrations::migrate_down(&conn, target).await?;
            if reverted.is_empty() {
                println!("Nothing to revert");
            }
            for id in reverted {
                println!("reverted {id}");
            }
        }
        MigrateAction::Status => {
            for step in libsql_migrations::status(&conn).await? {
                let mark = if step.applied { "applied" } else { "pending" };
                println!("{mark:<8} {:<28} {}", step.id, step.description);
            }
        }
    }
    Ok(())
}
