use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};

use crate::error::{AppError, AppResult};
use crate::services::views::{ChartView, ViewRequest};
use crate::state::AppState;

const DEFAULT_HISTOGRAM_BINS: u32 = 40;
const MAX_HISTOGRAM_BINS: u32 = 500;
const DEFAULT_TOP_N: u32 = 10;
const MAX_TOP_N: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ChartKind {
    Line,
    Histogram,
    Categories,
}

#[derive(Debug, Clone, serde::Deserialize, utoipa::ToSchema)]
pub struct ChartViewParams {
    pub column: String,
    pub kind: ChartKind,
    #[serde(default)]
    pub bins: Option<u32>,
    #[serde(default)]
    pub top_n: Option<u32>,
}

#[utoipa::path(
    post,
    path = "/api/charts/view",
    request_body = ChartViewParams,
    responses(
        (status = 200, description = "Derived view built", body = ChartView),
        (status = 400, description = "Unknown column or invalid parameters"),
        (status = 409, description = "No table loaded yet"),
    )
)]
pub(crate) async fn chart_view_handler(
    State(state): State<AppState>,
    Json(params): Json<ChartViewParams>,
) -> AppResult<Json<ChartView>> {
    let resolved = state
        .pipeline
        .resolved()
        .ok_or_else(|| AppError::conflict("no table loaded; POST /api/load first"))?;

    let request = match params.kind {
        ChartKind::Line => ViewRequest::Aggregate,
        ChartKind::Histogram => ViewRequest::Histogram {
            bins: params
                .bins
                .unwrap_or(DEFAULT_HISTOGRAM_BINS)
                .clamp(1, MAX_HISTOGRAM_BINS),
        },
        ChartKind::Categories => ViewRequest::TopCategories {
            keep: params
                .top_n
                .unwrap_or(DEFAULT_TOP_N)
                .clamp(1, MAX_TOP_N),
        },
    };

    let chart = state
        .views
        .build(&resolved.table, &params.column, request)
        .await?;
    Ok(Json(chart))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/charts/view", post(chart_view_handler))
}
