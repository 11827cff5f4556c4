use crate::server::AppState;
use crate::types::{HealthResponse, format_time};
use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use chrono::Utc;

/// 健康检查
///
/// 探测数据库连通性并汇报各采集器状态。任一依赖异常时整体降级为 503。
#[utoipa::path(
    get,
    path = "/health",
    tag = "系统 (System)",
    responses(
        (status = 200, description = "服务正常", body = HealthResponse),
        (status = 503, description = "依赖降级", body = HealthResponse)
    )
)]
pub async fn get_health(
    State(state): State<AppState>,
) -> (StatusCode, Json<HealthResponse>) {
    let database = match state.store.ping().await {
        Ok(()) => "ok".to_string(),
        Err(e) => format!("error: {}", e),
    };
    let healthy = database == "ok";

    let body = HealthResponse {
        status: if healthy { "ok" } else { "degraded" }.to_string(),
        timestamp: format_time(Utc::now()),
        database,
        collectors: (state.collector_states)(),
    };
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}
