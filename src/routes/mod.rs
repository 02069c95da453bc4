pub mod charts;
pub mod columns;
pub mod export;
pub mod health;
pub mod load;

use axum::Router;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .nest(
            "/api",
            Router::new()
                .merge(columns::router())
                .merge(load::router())
                .merge(charts::router())
                .merge(export::router()),
        )
        .with_state(state)
}
