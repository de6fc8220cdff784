use {
    axum::{
        Json,
        http::StatusCode,
        response::{IntoResponse, Response},
    },
    burrow_common::Error,
};

/// The single place the error taxonomy maps to HTTP statuses. Every
/// handler returns `ApiResult<T>` and lets `?` do the translation.
pub struct ApiError(pub Error);

pub type ApiResult<T> = Result<T, ApiError>;

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Validation(_) | Error::Precondition(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) | Error::ModeConflict(_) => StatusCode::CONFLICT,
            Error::Runtime(_) | Error::Io(_) | Error::Database(_) | Error::Message(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            },
        };
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}
