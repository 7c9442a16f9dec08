use axum::{Json, http::StatusCode};
use serde::{Deserialize, Serialize};

use crate::error::RadrError;
use crate::utils::{ApiResponse, success_to_api_response};

pub mod arrival;
pub mod group;
pub mod message;
pub mod presence;

/// 所有处理函数统一的返回类型，错误由 RadrError 转成响应
pub type HandlerResult<T> = Result<(StatusCode, Json<ApiResponse<T>>), RadrError>;

/// 无数据返回时的结果
#[derive(Debug, Deserialize, Serialize)]
pub struct Done {
    pub message: String,
}

pub(crate) fn ok<T: Serialize>(data: T) -> (StatusCode, Json<ApiResponse<T>>) {
    (StatusCode::OK, success_to_api_response(data))
}

pub(crate) fn created<T: Serialize>(data: T) -> (StatusCode, Json<ApiResponse<T>>) {
    (StatusCode::CREATED, success_to_api_response(data))
}

pub(crate) fn done(message: &str) -> (StatusCode, Json<ApiResponse<Done>>) {
    ok(Done {
        message: message.to_string(),
    })
}
