use souba_core::config::DatabaseConfig;
use souba_core::store::error::StoreError;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use std::str::FromStr;
use std::time::Duration;

pub use sqlx::postgres::PgPool;

/// # Summary
/// 按配置建立进程内唯一的 Postgres 连接池。
///
/// # Logic
/// 1. 解析连接串并注入服务器端 `statement_timeout`，兜底长查询。
/// 2. 池大小与获取超时来自配置；所有组件共享该池。
///
/// # Arguments
/// * `cfg`: 数据库配置（连接串、池大小、操作超时）。
///
/// # Returns
/// * `Result<PgPool, StoreError>` - 连接池或初始化错误。
pub async fn connect(cfg: &DatabaseConfig) -> Result<PgPool, StoreError> {
    let timeout_ms = cfg.op_timeout_secs.saturating_mul(1000).to_string();
    let options = PgConnectOptions::from_str(&cfg.url)
        .map_err(|e| StoreError::Init(format!("invalid database url: {}", e)))?
        .options([("statement_timeout", timeout_ms.as_str())]);

    PgPoolOptions::new()
        .max_connections(cfg.pool_size)
        .acquire_timeout(Duration::from_secs(cfg.op_timeout_secs))
        .connect_with(options)
        .await
        .map_err(|e| StoreError::Init(e.to_string()))
}
