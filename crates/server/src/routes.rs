//! Route configuration.

use crate::auth::require_session;
use crate::handlers;
use crate::metrics::metrics_handler;
use crate::state::AppState;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    // Challenge, setup, and install endpoints are deliberately outside the
    // session gate; install URLs are public-by-UUID.
    let public_routes = Router::new()
        .route("/api/health", get(handlers::health_check))
        .route("/api/auth/status", get(handlers::auth::status))
        .route("/api/auth/challenge", get(handlers::auth::challenge))
        .route("/api/auth/setup", post(handlers::auth::setup))
        .route("/api/auth/login", post(handlers::auth::login))
        .route("/api/auth/logout", post(handlers::auth::logout))
        .route(
            "/api/auth/change-password",
            post(handlers::auth::change_password),
        )
        .route(
            "/api/install/{id}/manifest.plist",
            get(handlers::install::manifest),
        )
        .route(
            "/api/install/{id}/payload.ipa",
            get(handlers::install::payload),
        );

    let protected_routes = Router::new()
        .route(
            "/api/downloads",
            post(handlers::downloads::create).get(handlers::downloads::list),
        )
        .route(
            "/api/downloads/{id}",
            get(handlers::downloads::get_one).delete(handlers::downloads::delete),
        )
        .route(
            "/api/downloads/{id}/pause",
            post(handlers::downloads::pause),
        )
        .route(
            "/api/downloads/{id}/resume",
            post(handlers::downloads::resume),
        )
        .route("/api/packages", get(handlers::packages::list))
        .route("/api/packages/{id}/file", get(handlers::packages::file))
        .route(
            "/api/settings",
            get(handlers::settings::get).put(handlers::settings::put),
        )
        .route("/api/cleanup", post(handlers::settings::cleanup))
        .route("/api/tunnel", get(handlers::tunnel::upgrade))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_session,
        ));

    let mut router = Router::new().merge(public_routes).merge(protected_routes);

    if state.config.server.metrics_enabled {
        router = router.merge(Router::new().route("/metrics", get(metrics_handler)));
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}
