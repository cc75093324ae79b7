//! cutover-api — read-only HTTP status API.
//!
//! Serves the state store over JSON so dashboards and scripts can watch
//! rollouts without touching the controller. Nothing here mutates state.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/rollouts` | List in-flight rollouts |
//! | GET | `/api/v1/rollouts/{service}` | Active rollout of a service |
//! | GET | `/api/v1/services` | Stable environment of every service |
//! | GET | `/api/v1/services/{service}/stable` | Stable environment of a service |
//! | GET | `/api/v1/services/{service}/history` | Finished rollouts, newest first |
//! | GET | `/healthz` | Liveness |

pub mod handlers;

use axum::routing::get;
use axum::Router;

use cutover_state::StateStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
}

/// Build the status API router.
pub fn build_router(store: StateStore) -> Router {
    let api_state = ApiState { store };

    let api_routes = Router::new()
        .route("/rollouts", get(handlers::list_rollouts))
        .route("/rollouts/{service}", get(handlers::get_rollout))
        .route("/services", get(handlers::list_services))
        .route("/services/{service}/stable", get(handlers::get_stable))
        .route("/services/{service}/history", get(handlers::list_history))
        .with_state(api_state);

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/healthz", get(handlers::healthz))
}

/// Bind `addr` and serve the status API until `shutdown` resolves.
pub async fn serve(
    store: StateStore,
    addr: std::net::SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "status API listening");
    axum::serve(listener, build_router(store))
        .with_graceful_shutdown(shutdown)
        .await
}
