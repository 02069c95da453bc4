use crate::routes;
use crate::services::acquire::{DataSource, LoadPhase, LoadStatus};
use crate::services::views::{AggregateRow, CategoryRow, ChartView, HistogramRow, ViewRows};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(title = "jobdash", description = "HPC job telemetry dashboard API"),
    paths(
        routes::health::healthz_handler,
        routes::columns::list_columns_handler,
        routes::load::start_load_handler,
        routes::load::load_status_handler,
        routes::charts::chart_view_handler,
        routes::export::export_csv_handler,
    ),
    components(schemas(
        routes::health::HealthResponse,
        routes::columns::ColumnInfo,
        routes::load::LoadParams,
        routes::load::LoadResponse,
        routes::charts::ChartViewParams,
        routes::charts::ChartKind,
        routes::export::ExportQuery,
        LoadStatus,
        LoadPhase,
        DataSource,
        ChartView,
        ViewRows,
        AggregateRow,
        HistogramRow,
        CategoryRow,
    ))
)]
struct ApiDoc;

pub fn openapi_json() -> utoipa::openapi::OpenApi {
    ApiDoc::openapi()
}
