//! # API 统一错误处理
//!
//! 将下层各 crate 的错误类型统一映射到 HTTP 状态码与 JSON 响应体。

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use souba_core::store::error::StoreError;
use thiserror::Error;

use crate::types::ApiErrorResponse;

/// API 层统一错误枚举
#[derive(Error, Debug)]
pub enum ApiError {
    /// 请求参数错误 (400)
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// 标识元组无法解析 (404)
    #[error("Not found: {0}")]
    NotFound(String),

    /// 依赖暂时不可用 (503)
    #[error("Service degraded: {0}")]
    Degraded(String),

    /// 下层业务错误 (500)
    #[error("Internal error: {0}")]
    Internal(String),
}

/// 将 `ApiError` 转换为 axum 的 HTTP 响应
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "validation", msg.clone()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "unknown_key", msg.clone()),
            ApiError::Degraded(msg) => {
                tracing::warn!("dependency degraded: {}", msg);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "degraded",
                    "dependency temporarily unavailable".to_string(),
                )
            }
            ApiError::Internal(msg) => {
                // 内部错误只记录日志，不向客户端透传细节
                tracing::error!("internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal",
                    "internal server error".to_string(),
                )
            }
        };

        let body = Json(ApiErrorResponse::new(code, message));
        (status, body).into_response()
    }
}

/// 从 `StoreError` 转换：校验 → 400，未找到 → 404，瞬时 → 503，其余 → 500。
impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match &err {
            StoreError::Validation(msg) => ApiError::BadRequest(msg.clone()),
            StoreError::NotFound => ApiError::NotFound("key does not resolve".to_string()),
            StoreError::Transient(msg) => ApiError::Degraded(msg.clone()),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}
