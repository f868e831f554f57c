use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use restic_core::ResticError;
use serde::Serialize;
use tracing::error;

/// HTTP 层错误，统一转换为 `{"error": "..."}` 响应
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Core(#[from] ResticError),

    #[error("{0}")]
    BadRequest(String),

    #[error("未授权")]
    Unauthorized,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Core(e) if e.is_not_found() => StatusCode::NOT_FOUND,
            Self::Core(ResticError::LockContention { .. } | ResticError::LocationExists(_)) => {
                StatusCode::CONFLICT
            }
            Self::Core(ResticError::InvalidInput(_)) => StatusCode::BAD_REQUEST,
            Self::Core(ResticError::AccessDenied(_)) => StatusCode::FORBIDDEN,
            Self::Core(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self, "请求处理失败");
        }

        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
