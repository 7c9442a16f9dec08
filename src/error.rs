use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::utils::{error_codes, error_to_api_response};

#[derive(Debug, thiserror::Error)]
pub enum RadrError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("未授权访问")]
    Unauthorized,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Internal(String),
}

pub type RadrResult<T> = Result<T, RadrError>;

impl RadrError {
    pub fn validation(msg: impl Into<String>) -> Self {
        RadrError::Validation(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        RadrError::Forbidden(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        RadrError::NotFound(msg.into())
    }

    fn status_and_code(&self) -> (StatusCode, i32) {
        match self {
            RadrError::Validation(_) => (StatusCode::BAD_REQUEST, error_codes::VALIDATION_ERROR),
            RadrError::Forbidden(_) => (StatusCode::FORBIDDEN, error_codes::PERMISSION_DENIED),
            RadrError::NotFound(_) => (StatusCode::NOT_FOUND, error_codes::NOT_FOUND),
            RadrError::Unauthorized => (StatusCode::UNAUTHORIZED, error_codes::AUTH_FAILED),
            RadrError::Database(_) | RadrError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, error_codes::INTERNAL_ERROR)
            }
        }
    }
}

impl IntoResponse for RadrError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        // 数据库细节不返回给客户端
        let msg = match &self {
            RadrError::Database(e) => {
                tracing::error!("Database error: {}", e);
                "内部服务器错误".to_string()
            }
            other => other.to_string(),
        };

        (status, error_to_api_response::<()>(code, msg)).into_response()
    }
}
