//! Chat gateway: keeps one connection alive and exposes the send API.
//!
//! Run with: cargo run -p gateway-demo
//!
//! Then send a message:
//! `curl -XPOST localhost:3000/send/text -H 'content-type: application/json'
//!  -d '{"jid":"15550001111@s.whatsapp.net","message":"hi"}'`

mod event_logger;
mod loopback;

use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, bail};
use chat_bridge_core::MessageSender;
use chat_bridge_reconnect::ReconnectConfig;
use chat_bridge_store::{
    ConnectionSupervisor, StoreConfig, SupervisorConfig, SupervisorStatus, open_store,
};
use clap::{Parser, ValueEnum};
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::{event_logger::EventLogger, loopback::LoopbackConnector};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    Memory,
    Mongo,
    Postgres,
}

#[derive(Debug, Parser)]
#[command(name = "gateway", about = "Resilient chat gateway with an HTTP send API")]
struct Args {
    /// Where credentials are stored.
    #[arg(long, env = "STORE_BACKEND", value_enum, default_value = "memory")]
    store_backend: Backend,

    #[arg(long, env = "MONGO_URL", default_value = "mongodb://localhost:27017")]
    mongo_url: String,

    #[arg(long, env = "MONGO_DB_NAME", default_value = "whatsapp_api")]
    mongo_db_name: String,

    #[arg(long, env = "POSTGRES_URL")]
    postgres_url: Option<String>,

    #[arg(long, env = "POSTGRES_SCHEMA", default_value = "public")]
    postgres_schema: String,

    /// Collection or table holding the auth state.
    #[arg(long, env = "AUTH_TABLE", default_value = "baileys_auth_state")]
    auth_table: String,

    #[arg(long, env = "PORT", default_value_t = 3000)]
    port: u16,

    #[arg(long, env = "MAX_RECONNECT_RETRIES", default_value_t = 10)]
    max_reconnect_retries: u32,

    /// Clear stored credentials after this many failed retries (0 = never).
    #[arg(long, env = "WIPE_AFTER_FAILURES", default_value_t = 5)]
    wipe_after_failures: u32,

    /// POST every batch of received messages to this URL.
    #[arg(long, env = "EVENT_LOGGER_URL")]
    event_logger_url: Option<String>,

    /// Connects the loopback connector refuses before accepting.
    #[arg(long, env = "LOOPBACK_FAILURES", default_value_t = 0)]
    loopback_failures: u32,
}

impl Args {
    fn store_config(&self) -> anyhow::Result<StoreConfig> {
        Ok(match self.store_backend {
            Backend::Memory => StoreConfig::Memory,
            Backend::Mongo => StoreConfig::Mongo {
                url: self.mongo_url.clone(),
                database: self.mongo_db_name.clone(),
                collection: self.auth_table.clone(),
            },
            Backend::Postgres => {
                let Some(url) = self.postgres_url.clone() else {
                    bail!("POSTGRES_URL is required for the postgres backend");
                };
                StoreConfig::Postgres {
                    url,
                    schema: self.postgres_schema.clone(),
                    table: self.auth_table.clone(),
                }
            }
        })
    }

    fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            reconnect: ReconnectConfig {
                max_retries: self.max_reconnect_retries,
                ..ReconnectConfig::default()
            },
            wipe_after_failures: self.wipe_after_failures,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let store = open_store(&args.store_config()?)
        .await
        .context("failed to open credential store")?;

    let connector = Arc::new(LoopbackConnector::new(args.loopback_failures));
    let supervisor = ConnectionSupervisor::new(connector, store, args.supervisor_config());
    let status_task = tokio::spawn(follow_status(Arc::clone(&supervisor)));
    let logger_task = args
        .event_logger_url
        .clone()
        .map(|url| tokio::spawn(EventLogger::new(url).run(supervisor.incoming())));
    supervisor.start().await;

    let app = chat_bridge_transport::http::router(Arc::clone(&supervisor) as Arc<dyn MessageSender>)
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("API server listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    supervisor.shutdown().await;
    status_task.abort();
    if let Some(task) = logger_task {
        task.abort();
    }
    Ok(())
}

/// Log status changes and start over when the retry budget runs out.
async fn follow_status(supervisor: Arc<ConnectionSupervisor>) {
    let mut status = supervisor.status();
    while status.changed().await.is_ok() {
        let current = status.borrow_and_update().clone();
        match current {
            SupervisorStatus::RetriesExhausted { attempts } => {
                tracing::warn!(attempts, "reconnect attempts exhausted, starting over with fresh credentials");
                if let Err(e) = supervisor.restart_fresh().await {
                    tracing::error!(error = %e, "restart failed");
                }
            }
            SupervisorStatus::LoggedOut => {
                tracing::warn!("logged out; restart the gateway to pair again");
            }
            SupervisorStatus::Stopped => break,
            other => tracing::debug!(status = ?other, "connection status"),
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        return;
    }
    tracing::info!("shutting down");
}
