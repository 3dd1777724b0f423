//! The coagent HTTP bridge.
//!
//! Exposes a runtime's channel over HTTP: one-shot publishes, SSE streams
//! for multi-reply requests and subscriptions, and discovery queries.

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod routes;
mod state;

use state::AppState;

#[derive(Debug, Parser)]
#[command(name = "coagent-server", about = "HTTP bridge for a coagent broker")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:8000")]
    listen: String,

    /// NATS server URL(s), comma-separated.
    #[arg(long, default_value = "nats://localhost:4222")]
    server: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let runtime = coagent::Runtime::nats(args.server.clone());
    runtime
        .start()
        .await
        .with_context(|| format!("failed to start runtime against {}", args.server))?;

    let app = routes::router(AppState::new(runtime.clone()));
    let listener = tokio::net::TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    info!(listen = %args.listen, server = %args.server, "bridge ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    runtime.stop().await?;
    Ok(())
}
