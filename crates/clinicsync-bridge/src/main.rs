use std::sync::Arc;

use clap::{Parser, Subcommand};
use clinicsync_bridge::config::BridgeConfig;
use clinicsync_bridge::{app_router, bootstrap_schema, AppState};
use clinicsync_core::models::SyncSchema;
use clinicsync_core::remote::LibSqlRemote;

#[derive(Debug, Parser)]
#[command(name = "clinicsync-bridge", version, about = "HTTP bridge for the clinicsync store")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the bridge (default)
    Serve,
    /// Manage bearer tokens
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },
}

#[derive(Debug, Subcommand)]
enum TokenAction {
    /// Issue a new token and print it once
    Issue {
        /// Free-form label, e.g. the device or clinic branch
        #[arg(short, long)]
        label: Option<String>,
        /// Days until the token expires; never expires when omitted
        #[arg(long)]
        ttl_days: Option<i64>,
    },
    /// Revoke a token by id
    Revoke { token_id: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Only load .env in development; production uses platform-native env injection.
    #[cfg(debug_assertions)]
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("clinicsync_bridge=info".parse().expect("valid directive")),
        )
        .init();

    let cli = Cli::parse();
    let config = Arc::new(BridgeConfig::from_env()?);
    let store = Arc::new(
        LibSqlRemote::connect(&config.database_url, config.database_auth_token.clone()).await?,
    );
    let schema = match &config.schema_path {
        Some(path) => SyncSchema::from_json_file(path)?,
        None => SyncSchema::clinic(),
    };

    let state = AppState::new(config.clone(), store.clone(), &schema);
    state.tokens().ensure_schema().await?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            tracing::info!("Starting clinicsync-bridge with config: {:?}", config);
            if config.bootstrap_schema {
                bootstrap_schema(&store).await?;
            }

            let bind_addr = config.bind_addr.clone();
            let router = app_router(state);
            let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
            tracing::info!("clinicsync-bridge listening on {}", bind_addr);
            axum::serve(listener, router).await?;
        }
        Command::Token {
            action: TokenAction::Issue { label, ttl_days },
        } => {
            let issued = state
                .tokens()
                .issue(label, ttl_days.map(chrono::Duration::days))
                .await?;
            println!("{}", serde_json::to_string_pretty(&issued)?);
        }
        Command::Token {
            action: TokenAction::Revoke { token_id },
        } => {
            if !state.tokens().revoke(&token_id).await? {
                return Err(format!("No live token with id {token_id}").into());
            }
            println!("Revoked {token_id}");
        }
    }
    Ok(())
}
