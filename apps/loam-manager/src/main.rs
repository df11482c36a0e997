mod auth;
mod config;
mod routes;
mod state;
mod stores;
mod websocket;

use std::sync::Arc;

use channel_bus::{Bus, LocalBus, RedisBus};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::Config;
use crate::routes::build_router;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cfg = Config::from_env();

    let bus: Arc<dyn Bus> = match &cfg.redis_url {
        Some(url) => match RedisBus::connect(url).await {
            Ok(bus) => {
                info!("connected to redis at {url}");
                Arc::new(bus)
            }
            Err(err) => {
                warn!(error = %err, "failed to connect to redis, continuing with in-process delivery");
                Arc::new(LocalBus::new())
            }
        },
        None => {
            info!("REDIS_URL not set; using in-process delivery");
            Arc::new(LocalBus::new())
        }
    };

    let state = AppState::new(bus);
    let app = build_router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", cfg.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("loam manager listening on {addr}");
    axum::serve(listener, app).await?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}
