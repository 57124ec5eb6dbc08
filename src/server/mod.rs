use axum::Router;
use axum::routing::{get, post, put};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::probe::{self, Detection};
use crate::router::KeyCycler;
use crate::transport::Transport;
use crate::{app, storage};

mod error;
pub(crate) mod handlers;
mod state;

pub use state::AppState;

fn build_app(state: AppState) -> Router {
    let public = Router::new()
        .route("/api/health", get(handlers::health::health))
        .route("/api/auth/login", post(handlers::auth::login));

    let admin = Router::new()
        .route(
            "/api/channels",
            get(handlers::channel::list_channels).post(handlers::channel::create_channel),
        )
        .route("/api/channels/import", post(handlers::channel::import_channels))
        .route("/api/channels/export", get(handlers::channel::export_channels))
        .route(
            "/api/channels/{id}",
            put(handlers::channel::update_channel).delete(handlers::channel::delete_channel),
        )
        .route("/api/channels/{id}/sync", post(handlers::channel::sync_channel))
        .route("/api/models", get(handlers::model::list_models))
        .route("/api/models/{id}/logs", get(handlers::model::model_logs))
        .route(
            "/api/proxy-keys",
            get(handlers::proxy_key::list_proxy_keys).post(handlers::proxy_key::create_proxy_key),
        )
        .route(
            "/api/proxy-keys/{id}",
            put(handlers::proxy_key::update_proxy_key)
                .delete(handlers::proxy_key::delete_proxy_key),
        )
        .route(
            "/api/proxy-keys/{id}/regenerate",
            post(handlers::proxy_key::regenerate_proxy_key),
        )
        .route(
            "/api/scheduler/config",
            get(handlers::scheduler::get_config).put(handlers::scheduler::update_config),
        )
        .route(
            "/api/detect",
            post(handlers::detect::trigger_detection)
                .delete(handlers::detect::stop_detection)
                .get(handlers::detect::detection_status),
        )
        .route("/api/sse/progress", get(handlers::detect::sse_progress))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            handlers::auth::require_admin,
        ));

    let relay = Router::new()
        .route("/v1/models", get(handlers::relay::list_models))
        .route("/v1/chat/completions", post(handlers::relay::chat_completions))
        .route("/v1/messages", post(handlers::relay::messages))
        .route("/v1/responses", post(handlers::relay::responses))
        .route(
            "/v1beta/models/{model_action}",
            post(handlers::relay::gemini_generate),
        );

    Router::new()
        .merge(public)
        .merge(admin)
        .merge(relay)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

pub async fn serve_with_listener(
    listener: tokio::net::TcpListener,
    db_path: PathBuf,
    data_dir: PathBuf,
    config: Config,
) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let transport = Arc::new(Transport::new(config.global_proxy.clone()));
    let detection = Arc::new(Detection::new(&config));
    let cycler = Arc::new(KeyCycler::new());
    let (scheduler_notify, scheduler_rx) = watch::channel(0u64);

    let defaults = config.scheduler_defaults();
    let seeded = storage::seed_scheduler_config(db_path.clone(), defaults.clone()).await?;
    tracing::info!(
        enabled = seeded.enabled,
        cron = %seeded.cron,
        "scheduler config loaded"
    );

    for _ in 0..config.max_global_concurrency.max(1) {
        tokio::spawn(probe::run_worker(
            db_path.clone(),
            transport.clone(),
            detection.clone(),
        ));
    }
    tokio::spawn(probe::cron_loop(
        db_path.clone(),
        transport.clone(),
        detection.clone(),
        defaults,
        scheduler_rx,
    ));
    tokio::spawn(probe::cleanup_loop(
        db_path.clone(),
        app::logs_dir(&data_dir),
        config.log_retention_days,
    ));

    let state = AppState {
        db_path: Arc::new(db_path),
        config,
        transport,
        detection,
        cycler,
        scheduler_notify,
    };

    let app = build_app(state);
    axum::serve(listener, app).await?;
    Ok(())
}

pub async fn serve(
    addr: SocketAddr,
    db_path: PathBuf,
    data_dir: PathBuf,
    config: Config,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    serve_with_listener(listener, db_path, data_dir, config).await
}
