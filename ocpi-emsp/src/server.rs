//! HTTP server for the receiver

use std::future::Future;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tracing::info;

use crate::observer::observe;
use crate::receiver::{cdrs, commands, locations, sessions, tariffs, tokens, SharedState};

/// Receiver routes under the configured base path, plus `/health`
pub fn router(state: SharedState) -> Router {
    let api = Router::new()
        .route(
            "/locations/:country_code/:party_id/:location_id",
            get(locations::get_location)
                .put(locations::put_location)
                .patch(locations::patch_location)
                .delete(locations::delete_location),
        )
        .route(
            "/locations/:country_code/:party_id/:location_id/:evse_uid",
            get(locations::get_evse)
                .put(locations::put_evse)
                .patch(locations::patch_evse),
        )
        .route(
            "/locations/:country_code/:party_id/:location_id/:evse_uid/:connector_id",
            get(locations::get_connector)
                .put(locations::put_connector)
                .patch(locations::patch_connector),
        )
        .route(
            "/tariffs/:country_code/:party_id/:tariff_id",
            get(tariffs::get_tariff)
                .put(tariffs::put_tariff)
                .patch(tariffs::patch_tariff)
                .delete(tariffs::delete_tariff),
        )
        .route(
            "/sessions/:country_code/:party_id/:session_id",
            get(sessions::get_session)
                .put(sessions::put_session)
                .patch(sessions::patch_session)
                .delete(sessions::delete_session),
        )
        .route("/cdrs", post(cdrs::post_cdr))
        .route("/cdrs/:country_code/:party_id/:cdr_id", get(cdrs::get_cdr))
        .route("/tokens", get(tokens::list_tokens))
        .route("/tokens/:token_uid/authorize", post(tokens::authorize_token))
        .route("/commands/:command_type/:command_id", post(commands::command_result));

    let app = if state.config.base_path.is_empty() {
        Router::new().merge(api)
    } else {
        Router::new().nest(&state.config.base_path, api)
    };

    app.route("/health", get(health_check))
        .layer(middleware::from_fn_with_state(state.clone(), observe))
        .with_state(state)
}

/// Serve on the configured listen address until `shutdown` resolves
pub async fn serve_with_shutdown<F>(state: SharedState, shutdown: F) -> Result<(), std::io::Error>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(state.config.listen_addr).await?;
    serve_listener(state, listener, shutdown).await
}

/// Serve on an already bound listener
pub async fn serve_listener<F>(state: SharedState, listener: TcpListener, shutdown: F) -> Result<(), std::io::Error>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!(
        "Receiver: Listening on {} ({}{})",
        listener.local_addr()?,
        state.config.public_url,
        state.config.base_path
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn health_check() -> &'static str {
    "OK"
}
