use axum::routing::get;
use axum::{Json, Router};

use crate::services::schema;
use crate::state::AppState;

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub struct ColumnInfo {
    pub name: String,
    pub kind: String,
    pub label: String,
    pub outlier_trimmed: bool,
}

#[utoipa::path(
    get,
    path = "/api/columns",
    responses((status = 200, description = "Expected column catalog", body = [ColumnInfo]))
)]
pub(crate) async fn list_columns_handler() -> Json<Vec<ColumnInfo>> {
    let columns = schema::EXPECTED_COLUMNS
        .iter()
        .map(|spec| ColumnInfo {
            name: spec.name.to_string(),
            kind: spec.kind.as_str().to_string(),
            label: spec.label.to_string(),
            outlier_trimmed: spec.trim.is_some(),
        })
        .collect();
    Json(columns)
}

pub fn router() -> Router<AppState> {
    Router::new().route("/columns", get(list_columns_handler))
}
