use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};

use crate::error::{AppError, AppResult};
use crate::services::acquire::{DataSource, LoadRequest, LoadStatus};
use crate::state::AppState;
use crate::time::TimeRange;

#[derive(Debug, Clone, serde::Deserialize, utoipa::ToSchema)]
pub struct LoadParams {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default)]
    pub source: Option<DataSource>,
    #[serde(default)]
    pub demo_fallback: bool,
}

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub struct LoadResponse {
    pub table: String,
    pub rows: u64,
}

#[utoipa::path(
    post,
    path = "/api/load",
    request_body = LoadParams,
    responses(
        (status = 200, description = "Load reached Ready", body = LoadResponse),
        (status = 404, description = "No data available for the selection"),
        (status = 502, description = "Remote fetch failed"),
        (status = 503, description = "Analytical engine unavailable"),
    )
)]
pub(crate) async fn start_load_handler(
    State(state): State<AppState>,
    Json(params): Json<LoadParams>,
) -> AppResult<Json<LoadResponse>> {
    let range = TimeRange::new(params.start, params.end, state.config.max_range_days)
        .map_err(|err| AppError::bad_request(err.to_string()))?;

    // Persist the selection before the load: export defaults should follow
    // the last thing the user asked for, even if this load fails.
    if let Err(err) = state.selection.save(&range) {
        tracing::warn!(error = %err, "failed to persist time-range selection");
    }

    let resolved = state
        .pipeline
        .load(LoadRequest {
            range,
            source: params.source.unwrap_or(DataSource::Auto),
            demo_fallback: params.demo_fallback,
        })
        .await?;

    Ok(Json(LoadResponse {
        table: resolved.table,
        rows: resolved.rows,
    }))
}

#[utoipa::path(
    get,
    path = "/api/load/status",
    responses((status = 200, description = "Current load status", body = LoadStatus))
)]
pub(crate) async fn load_status_handler(State(state): State<AppState>) -> Json<LoadStatus> {
    Json(state.pipeline.status())
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/load", post(start_load_handler))
        .route("/load/status", get(load_status_handler))
}
