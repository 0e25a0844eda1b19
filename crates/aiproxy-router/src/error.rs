use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use aiproxy_common::{ErrorBody, ProxyError};

/// Boundary adapter: the shared error taxonomy rendered as a JSON response
/// with its stable status code.
pub struct ApiError(pub ProxyError);

impl From<ProxyError> for ApiError {
    fn from(err: ProxyError) -> Self {
        ApiError(err)
    }
}

impl From<aiproxy_credential::manager::ManagerError> for ApiError {
    fn from(err: aiproxy_credential::manager::ManagerError) -> Self {
        use aiproxy_credential::manager::ManagerError;
        let mapped = match err {
            ManagerError::NotFound(id) => ProxyError::invalid(format!("credential not found: {id}")),
            ManagerError::NoToken => ProxyError::RefreshFailed,
            ManagerError::Refresh(_) => ProxyError::RefreshFailed,
            ManagerError::Store(err) => ProxyError::internal(err.to_string()),
        };
        ApiError(mapped)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = match &self.0 {
            // The executor contract: refresh failures surface as 400 with an
            // explicit reason.
            ProxyError::RefreshFailed => ErrorBody {
                status: "error",
                error: "auth token refresh failed".to_string(),
            },
            other => ErrorBody::from_error(other),
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
