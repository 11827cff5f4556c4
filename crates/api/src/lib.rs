//! # `souba-api` - HTTP / WebSocket 网关
//!
//! 本 crate 是 Souba 行情管道的对外服务入口。
//! 使用 `axum` 构建 REST 路由与 `/ws` 实时端点，通过 `utoipa` 自动生成
//! OpenAPI 3.0 Swagger 文档。
//!
//! ## 架构职责
//! - REST: 历史 K 线 / 资金费率 / 未平仓量区间查询、序列枚举、健康检查
//! - WebSocket: 连接注册表（订阅集合、有界出站队列、滞后驱逐、心跳）、
//!   客户端会话协议（订阅 / 退订 / ping、先历史后实时）
//! - 扇出: 消费存储层变更事件流，按主键读回完整行后广播给订阅连接

pub mod error;
pub mod routes;
pub mod server;
pub mod types;
pub mod ws;
