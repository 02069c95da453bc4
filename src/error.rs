use crate::services::acquire::LoadError;
use crate::services::export::ExportError;
use crate::services::views::ViewError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

impl From<LoadError> for AppError {
    fn from(err: LoadError) -> Self {
        let status = match &err {
            LoadError::Connection(_) => StatusCode::SERVICE_UNAVAILABLE,
            LoadError::NoDataAvailable | LoadError::EmptyResult(_) => StatusCode::NOT_FOUND,
            LoadError::RemoteFetch(_) => StatusCode::BAD_GATEWAY,
        };
        tracing::error!(error = %err, status = %status, "load error");
        let message = match &err {
            LoadError::NoDataAvailable | LoadError::EmptyResult(_) => {
                format!("{err}; retry with source=demo for synthetic data")
            }
            _ => err.to_string(),
        };
        Self::new(status, message)
    }
}

impl From<ViewError> for AppError {
    fn from(err: ViewError) -> Self {
        let status = match &err {
            ViewError::Engine(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        };
        tracing::error!(error = %err, status = %status, "chart view error");
        Self::new(status, err.to_string())
    }
}

impl From<ExportError> for AppError {
    fn from(err: ExportError) -> Self {
        let status = match &err {
            ExportError::NoDataToExport => StatusCode::NOT_FOUND,
            ExportError::UnknownTable(_) => StatusCode::BAD_REQUEST,
            ExportError::Engine(_) | ExportError::Serialize(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        tracing::error!(error = %err, status = %status, "export error");
        Self::new(status, err.to_string())
    }
}
