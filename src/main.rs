use std::net::SocketAddr;
use std::path::Path;

use config::CONFIG;
use controller::create_router;
use cyder_tools::log::{error, info, LocalLogger};
use database::open_store;
use service::app_state::{create_state_router, AppState};
use service::bootstrap::BootstrapFile;

mod bridge;
mod config;
mod controller;
mod database;
mod dto;
mod relay;
mod schema;
mod service;
mod task;
mod utils;

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {}", err);
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => error!("failed to listen for SIGTERM: {}", err),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() {
    LocalLogger::init(&CONFIG.log_level);
    utils::i18n::init(&CONFIG.language);

    let store = open_store(&CONFIG.db_url).expect("failed to open the database");
    if let Some(path) = CONFIG.bootstrap_file.as_deref() {
        BootstrapFile::load(Path::new(path))
            .and_then(|seed| seed.apply(&store))
            .expect("failed to apply the bootstrap file");
    }
    let state = AppState::new((*CONFIG).clone(), store).expect("failed to build application state");
    state.start_background();

    let routes = create_router(&state);
    let app = if CONFIG.base_path.is_empty() || CONFIG.base_path == "/" {
        create_state_router().merge(routes)
    } else {
        create_state_router().nest(&CONFIG.base_path, routes)
    };

    let addr = format!("{}:{}", &CONFIG.host, CONFIG.port);
    info!("server start at {}", &addr);
    let listener = tokio::net::TcpListener::bind(&addr).await.expect("failed to bind the listen address");
    let served = axum::serve(
        listener,
        app.with_state(state.clone())
            .into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;
    if let Err(err) = served {
        error!("server error: {}", err);
    }
    state.shutdown().await;
    info!("server stopped");
}
