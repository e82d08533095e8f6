//! Claudish daemon
//!
//! Binds the gateway to loopback and serves until killed. Credentials come
//! from the environment, optionally topped up from
//! `~/.claudish/credentials.env`.

use clap::Parser;
use claudish_proxy::config::Settings;
use claudish_proxy::handlers::HandlerDeps;
use claudish_proxy::health::HealthCache;
use claudish_proxy::middleware::{GeminiReasoningReplay, MiddlewareChain, ReasoningReplayCache};
use claudish_proxy::model_cache::ModelMetadataCache;
use claudish_proxy::registry::Registry;
use claudish_proxy::router::{ModelProfile, RouteMode, Router};
use claudish_proxy::server::{build_app, AppState};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "claudish", about = "Anthropic-API gateway for other model backends")]
struct Args {
    /// Port to bind on 127.0.0.1 (0 picks a free one).
    #[arg(long, default_value_t = 3180)]
    port: u16,

    /// Serve every request with this model, ignoring what the client asks
    /// for (e.g. "ollama/qwen3:8b", "or/deepseek/deepseek-r1").
    #[arg(long)]
    model: Option<String>,

    /// Observer mode: pass everything through to the real Anthropic API.
    #[arg(long, default_value_t = false)]
    observer: bool,

    /// Replacement model for opus-tier requests.
    #[arg(long)]
    opus: Option<String>,

    /// Replacement model for sonnet-tier requests.
    #[arg(long)]
    sonnet: Option<String>,

    /// Replacement model for haiku-tier requests.
    #[arg(long)]
    haiku: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("claudish=info")),
        )
        .init();

    // Optional credentials file; real env vars win.
    if let Some(home) = dirs::home_dir() {
        let _ = dotenvy::from_filename(home.join(".claudish").join("credentials.env"));
    }

    let args = Args::parse();

    let mode = if args.observer {
        RouteMode::Observer
    } else if let Some(model) = args.model.clone() {
        RouteMode::Override(model)
    } else {
        RouteMode::Auto
    };

    let profile = ModelProfile {
        opus: args.opus,
        sonnet: args.sonnet,
        haiku: args.haiku,
    };

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", args.port)).await?;
    let port = listener.local_addr()?.port();

    let settings = Arc::new(Settings::from_env());
    let registry = Registry::from_env(&settings);

    let mut middleware = MiddlewareChain::new();
    middleware.push(Arc::new(GeminiReasoningReplay::new(Arc::new(
        ReasoningReplayCache::new(),
    ))));

    let deps = HandlerDeps {
        http: reqwest::Client::new(),
        settings,
        middleware,
        health: Arc::new(HealthCache::new()),
        model_cache: Arc::new(ModelMetadataCache::open_default()),
        port,
    };

    let state = AppState {
        router: Arc::new(Router::new(registry, mode.clone(), profile, deps)),
        port,
    };

    match &mode {
        RouteMode::Observer => info!("claudish v{} observing on 127.0.0.1:{}", env!("CARGO_PKG_VERSION"), port),
        RouteMode::Override(m) => info!("claudish v{} serving {} on 127.0.0.1:{}", env!("CARGO_PKG_VERSION"), m, port),
        RouteMode::Auto => info!("claudish v{} routing on 127.0.0.1:{}", env!("CARGO_PKG_VERSION"), port),
    }

    axum::serve(listener, build_app(state)).await?;
    Ok(())
}
