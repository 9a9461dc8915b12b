pub mod dev;
pub mod routes;
pub mod sse;
pub mod undo;

use axum::Router;

use crate::AppState;

/// Every HTTP route the overlay server exposes, without state applied.
pub fn router() -> Router<AppState> {
    routes::build_router()
        .merge(undo::build_router())
        .merge(dev::build_router())
}
