mod auth;
mod checkpoint;
mod cleanup;
mod collector;
mod config;
mod dispatch;
mod error;
mod handlers;
mod metrics;
mod model;
mod runner;
mod scoring;
mod session;
mod table;

use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rag_eval_server=info".parse().unwrap()),
        )
        .init();

    let config = Arc::new(config::Config::from_env());
    config.print_banner();

    let sessions = Arc::new(
        session::SessionRegistry::load_or_create(config.workspace_base.clone())
            .expect("Failed to create workspace directory"),
    );
    let metrics_store = metrics::Metrics::new();
    let runner = Arc::new(runner::Runner::new(
        config.clone(),
        sessions.clone(),
        metrics_store.clone(),
    ));

    let state = Arc::new(handlers::AppState {
        config: config.clone(),
        sessions: sessions.clone(),
        metrics: metrics_store,
        runner,
        started_at: chrono::Utc::now(),
    });

    let app = handlers::router(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive());
    let addr = format!("0.0.0.0:{}", config.port);

    // Session reaper
    let sessions_reaper = sessions.clone();
    let reap_interval = config.reap_interval_secs;
    let ttl_hours = config.session_ttl_hours;
    tokio::spawn(async move {
        sessions_reaper.reaper_loop(reap_interval, ttl_hours).await;
    });

    // Orphaned workspace reaper
    let workspace = config.workspace_base.clone();
    let max_age_secs = (config.session_ttl_hours.max(0) as u64) * 3600;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(reap_interval));
        loop {
            interval.tick().await;
            cleanup::reap_orphan_workspaces(&workspace, max_age_secs).await;
        }
    });

    info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();

    // Graceful shutdown on SIGTERM
    let shutdown = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C handler");
        info!("Shutdown signal received, draining...");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .unwrap();

    info!("Shutdown complete");
}
