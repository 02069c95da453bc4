use axum::extract::{Query, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;

use crate::error::{AppError, AppResult};
use crate::services::export::export_csv;
use crate::state::AppState;

#[derive(Debug, Clone, serde::Deserialize, utoipa::ToSchema)]
pub struct ExportQuery {
    /// Download name without extension; defaults to the persisted
    /// time-range selection.
    #[serde(default)]
    pub filename: Option<String>,
}

#[utoipa::path(
    get,
    path = "/api/export",
    params(("filename" = Option<String>, Query, description = "Download name without extension")),
    responses(
        (status = 200, description = "CSV attachment", body = String, content_type = "text/csv"),
        (status = 404, description = "No rows matched the export filter"),
        (status = 409, description = "No table loaded yet"),
    )
)]
pub(crate) async fn export_csv_handler(
    State(state): State<AppState>,
    Query(query): Query<ExportQuery>,
) -> AppResult<impl IntoResponse> {
    let resolved = state
        .pipeline
        .resolved()
        .ok_or_else(|| AppError::conflict("no table loaded; POST /api/load first"))?;

    // The persisted selection drives both the filter and the default
    // filename; without one the export covers the whole resolved table.
    let range = state.selection.load();
    let export = export_csv(&state.engine, &resolved.table, range).await?;

    let default_name = match range {
        Some(range) => format!("jobs_{}", range.slug()),
        None => "jobs".to_string(),
    };
    let filename = sanitize_filename(query.filename.as_deref().unwrap_or(&default_name));
    tracing::info!(rows = export.rows, filename = %filename, "csv export served");

    Ok((
        [
            (CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (
                CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}.csv\""),
            ),
        ],
        export.bytes,
    ))
}

/// Restricts download names to a filesystem- and header-safe alphabet.
fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches(['.', '_'].as_slice()).to_string();
    if trimmed.is_empty() {
        "jobs".to_string()
    } else {
        trimmed
    }
}

pub fn router() -> Router<AppState> {
    Router::new().route("/export", get(export_csv_handler))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_hostile_filenames() {
        assert_eq!(sanitize_filename("jobs_20230115"), "jobs_20230115");
        assert_eq!(sanitize_filename("../../etc/passwd"), "etc_passwd");
        assert_eq!(sanitize_filename("a b\"c"), "a_b_c");
        assert_eq!(sanitize_filename("..."), "jobs");
    }
}
