use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tracing_subscriber::EnvFilter;

use sparrow_dispatch::{
    handlers::{self, driver_handler, ride_handler, ws_handler},
    state::{AppConfig, AppState},
};

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_env().expect("invalid configuration");
    let state = Arc::new(
        AppState::new(config.clone())
            .await
            .expect("failed to initialise application state"),
    );

    // Background work: ride-request matching and publish replay.
    let _matching = state.matcher.start(&state.event_bus);
    let _replayer = state.event_bus.spawn_replayer();

    let app = Router::new()
        .route("/health", get(handlers::health))
        .route("/rides", post(ride_handler::create_ride))
        .route("/rides/{ride_id}/cancel", post(ride_handler::cancel_ride))
        .route("/rides/{ride_id}/start", post(driver_handler::start_ride))
        .route("/rides/{ride_id}/arrive", post(driver_handler::arrive_at_pickup))
        .route("/rides/{ride_id}/pickup", post(driver_handler::begin_trip))
        .route("/rides/{ride_id}/complete", post(driver_handler::complete_ride))
        .route("/drivers/online", post(driver_handler::go_online))
        .route("/drivers/offline", post(driver_handler::go_offline))
        .route("/drivers/location", post(driver_handler::update_location))
        .route("/ws/driver", get(ws_handler::driver_ws))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind(&state.config.listen_addr)
        .await
        .expect("failed to bind listener");
    tracing::info!("sparrow-dispatch listening on {}", state.config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
