use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tower_http::cors::CorsLayer;
use tower_http::trace::{MakeSpan, TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

use session_gateway::config::{FileConfig, GatewayConfig, load_config};
use session_gateway::loopback::{self, LoopbackEngine};
use session_gateway::{AppState, router};
use session_manager::{CredentialStore, SessionManager, phone_from_account_id};

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "gateway")]
#[command(about = "Multi-instance chat session gateway")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom data directory (defaults to ~/.wagateway)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway server in the foreground
    Serve(ServeArgs),

    /// List stored instances without starting any session
    List(ListArgs),
}

#[derive(Parser)]
struct ServeArgs {
    /// Port for the web server (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to (overrides config)
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Skip resuming stored sessions on startup
    #[arg(long)]
    no_resume: bool,
}

#[derive(Parser)]
struct ListArgs {
    /// Output as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = GatewayConfig::new(cli.data_dir.clone())?;
    let file_config: FileConfig = load_config(&config.data_dir)
        .extract()
        .with_context(|| format!("Invalid configuration in {:?}", config.config_toml_path()))?;

    match cli.command {
        Commands::Serve(args) => run_server(args, config, file_config).await,
        Commands::List(args) => list_command(&config, &file_config, args.json).await,
    }
}

async fn run_server(args: ServeArgs, config: GatewayConfig, file_config: FileConfig) -> Result<()> {
    // Setup logging
    let default_directive = if args.debug {
        "gateway=debug,session_gateway=debug,session_manager=debug,tower_http=debug,info"
    } else {
        "gateway=info,session_gateway=info,session_manager=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    info!("Starting session gateway");

    let auth_dir = config.auth_dir(&file_config.sessions);
    std::fs::create_dir_all(&auth_dir)
        .with_context(|| format!("Failed to create auth directory: {:?}", auth_dir))?;
    info!("Credential folders: {}", auth_dir.display());

    let engine = Arc::new(LoopbackEngine::new());
    let manager = SessionManager::new(
        engine.clone(),
        CredentialStore::new(&auth_dir),
        file_config.sessions.manager_config(),
    );

    if args.no_resume {
        info!("Skipping session resume");
    } else {
        match manager.resurrect().await {
            Ok(resumed) => info!("Resumed {} paired sessions", resumed.len()),
            Err(e) => warn!("Failed to scan stored sessions: {}", e),
        }
    }

    let max_body_bytes = file_config.server.max_body_mb * 1024 * 1024;
    let app = router(AppState::new(manager.clone()), max_body_bytes)
        .merge(loopback::routes(engine))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive());

    let host = args.host.unwrap_or(file_config.server.host);
    let port = args.port.unwrap_or(file_config.server.port);
    let addr = format!("{}:{}", host, port)
        .parse::<SocketAddr>()
        .with_context(|| format!("Invalid listen address {}:{}", host, port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let actual_addr = listener.local_addr()?;

    info!("Gateway listening on http://{}", actual_addr);
    info!("API endpoints:");
    info!("  GET    /api/instances                 - List all instances");
    info!("  POST   /api/instances                 - Initialize an instance");
    info!("  POST   /api/instances/{{id}}/restart    - Restart (clears pairing limit)");
    info!("  GET    /api/instances/{{id}}/status     - Connection and pairing status");
    info!("  POST   /api/instances/{{id}}/logout     - Unlink and forget");
    info!("  DELETE /api/instances/{{id}}            - Delete instance and credentials");
    info!("  POST   /api/instances/{{id}}/messages   - Send text, media or document");
    info!("  POST   /api/instances/{{id}}/receipts   - Send a batch of documents");
    info!("  POST   /api/instances/{{id}}/pair       - Complete loopback pairing");

    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, cleaning up...");
    };

    let server_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error");

    info!("Closing sessions...");
    manager.shutdown().await;

    info!("Shutdown complete");
    server_result
}

async fn list_command(config: &GatewayConfig, file_config: &FileConfig, json: bool) -> Result<()> {
    let store = CredentialStore::new(config.auth_dir(&file_config.sessions));
    let ids = store
        .list_ids()
        .await
        .with_context(|| format!("Failed to read {:?}", store.root()))?;

    let mut rows = Vec::with_capacity(ids.len());
    for id in ids {
        let metadata = store.read_metadata(&id).await.ok().flatten();
        let account = store.resolve_account_identifier(&id).await.ok().flatten();
        rows.push(serde_json::json!({
            "id": id,
            "name": metadata.as_ref().map(|m| m.name.clone()),
            "createdAt": metadata.as_ref().map(|m| m.created_at),
            "phoneNumber": account.as_deref().map(phone_from_account_id),
            "paired": account.is_some(),
        }));
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if rows.is_empty() {
        println!("No stored instances in {}", store.root().display());
        return Ok(());
    }

    println!("{:<24} {:<24} {:<16} PAIRED", "ID", "NAME", "PHONE");
    for row in &rows {
        println!(
            "{:<24} {:<24} {:<16} {}",
            row["id"].as_str().unwrap_or_default(),
            row["name"].as_str().unwrap_or("-"),
            row["phoneNumber"].as_str().unwrap_or("-"),
            if row["paired"].as_bool().unwrap_or(false) {
                "yes"
            } else {
                "no"
            },
        );
    }
    Ok(())
}
