//! Agent invocation service: `POST /invoke/{role}` runs one agent call
//! through the invocation runtime and returns the validated envelope.
//! `/circuits` lists and resets tripped circuit breakers.

mod error;
mod routes;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use forgeline::io::config::{DEFAULT_CONFIG_FILE, load_config};
use forgeline::io::generator::HttpGenerator;
use forgeline::logging;
use forgeline::runtime::InvocationRuntime;
use forgeline::runtime::breaker::{BreakerStore, InMemoryBreakerStore};

use crate::state::{AppState, GeneratorInfo};

#[derive(Parser)]
#[command(name = "forgeline-agents")]
#[command(about = "HTTP service running forgeline agent invocations")]
struct Args {
    /// Address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port to listen on
    #[arg(long, default_value = "8000")]
    port: u16,

    /// Config file; defaults apply when it does not exist.
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
}

fn main() -> anyhow::Result<()> {
    logging::init_with_default("forgeline_agents=info,forgeline=info");
    let args = Args::parse();

    let config = load_config(&args.config)?;
    let generator = HttpGenerator::from_config(&config.generator)?;
    if !generator.is_configured() {
        warn!("no generator API key; invocations will return FAIL envelopes");
    }
    let breakers: Arc<dyn BreakerStore> = Arc::new(InMemoryBreakerStore::new());
    let runtime = InvocationRuntime::new(generator, &config)?
        .with_breaker_store(breakers.clone());
    let info = GeneratorInfo::from_config(&config.generator);
    let state = AppState::new(Arc::new(runtime), info)
        .with_breakers(breakers, config.breaker.threshold);

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port)
        .parse()
        .context("parse bind address")?;

    // The runtime blocks on HTTP calls, so invocations run on the blocking pool.
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?
        .block_on(serve(addr, state))
}

async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = routes::router()
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state);

    info!(addr = %addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
            }
        })
        .await?;

    Ok(())
}
