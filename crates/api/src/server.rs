//! # API 服务启动器
//!
//! 组装 axum 路由、挂载 Swagger UI、配置 CORS 并绑定 TCP 端口对外提供服务。
//! 本模块不直接启动 `main()`, 而是由 `crates/app` 的 DI 容器持有并调用。

use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::routing::any;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use utoipa::OpenApi;
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;
use utoipa_swagger_ui::SwaggerUi;

use souba_core::config::AppConfig;
use souba_core::store::port::{SeriesResolver, TimeSeriesStore};

use crate::routes::{health, listings, market};
use crate::ws::registry::ConnectionRegistry;
use crate::ws::session;

/// 采集器状态提供者：采集进程内由监督者注入，纯 API 进程返回空表。
pub type CollectorStatusFn = Arc<dyn Fn() -> HashMap<String, String> + Send + Sync>;

// ============================================================
//  共享应用状态
// ============================================================

/// 全局应用状态，通过 axum 的 `State` 提取器注入到每个 Handler 中。
///
/// # Invariants
/// - 各端口实现在服务启动前由 DI 容器注入，生命周期与进程等同。
/// - `registry` 是进程内唯一的连接注册表，扇出任务与会话共享同一实例。
#[derive(Clone)]
pub struct AppState {
    /// 存储网关端口
    pub store: Arc<dyn TimeSeriesStore>,
    /// 参照解析器端口
    pub resolver: Arc<dyn SeriesResolver>,
    /// WebSocket 连接注册表
    pub registry: Arc<ConnectionRegistry>,
    /// 全局配置
    pub config: Arc<AppConfig>,
    /// 采集器状态提供者 (健康检查用)
    pub collector_states: CollectorStatusFn,
}

// ============================================================
//  OpenAPI 文档定义
// ============================================================

/// 全局 OpenAPI 文档结构
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Souba 行情管道 API",
        version = "0.1.0",
        description = "加密货币行情管道的只读查询网关。提供 K 线、资金费率、\
                       未平仓量的历史区间查询与序列枚举；实时推送经 /ws 端点订阅。",
        contact(name = "Souba Team"),
        license(name = "MIT")
    ),
    tags(
        (name = "行情 (Market)", description = "K 线 / 资金费率 / 未平仓量历史查询与序列枚举"),
        (name = "系统 (System)", description = "健康检查")
    )
)]
pub struct ApiDoc;

// ============================================================
//  服务构建与启动
// ============================================================

/// 构建完整的 axum 应用路由树（REST + Swagger UI + /ws）。
pub fn build_router(state: AppState) -> Router {
    // 1. REST 路由与自动收集的 OpenAPI Doc
    let (router, api) = OpenApiRouter::with_openapi(ApiDoc::openapi())
        .routes(routes!(market::get_candles))
        .routes(routes!(market::get_funding))
        .routes(routes!(market::get_open_interest))
        .routes(routes!(listings::get_starlistings))
        .routes(routes!(health::get_health))
        .with_state(state.clone())
        .split_for_parts();

    // 2. CORS (只读网关，允许所有来源)
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // 3. /ws 实时端点不进 OpenAPI，直接挂在最终路由树上
    router
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", api))
        .route("/ws", any(session::ws_handler).with_state(state))
        .layer(cors)
}

/// # Summary
/// 绑定端口并启动 HTTP 监听，直至关停信号。
///
/// # Arguments
/// * `state` - 由外部 DI 容器注入的共享状态
/// * `bind_addr` - 监听的地址与端口，如 `"0.0.0.0:8080"`
/// * `shutdown` - 关停信号接收端
pub async fn start_server(
    state: AppState,
    bind_addr: &str,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = build_router(state);

    tracing::info!("🚀 Souba API server listening on {}", bind_addr);
    tracing::info!("📖 Swagger UI: http://{}/swagger-ui/", bind_addr);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            // 关停信号或发送端整体消亡都触发优雅退出
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;

    Ok(())
}
