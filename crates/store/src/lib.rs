//! # `souba-store` - Postgres 存储层
//!
//! `souba-core` 中存储端口的 Postgres 实现。持有进程内唯一的连接池；
//! 其余组件一律向本 crate 借用连接，自己不开连接。
//!
//! ## 架构职责
//! - `pool` / `schema`: 连接池引导与内联 DDL 迁移（含通知触发器）
//! - `timeseries`: 三张时序表的批量合并写入与区间读取
//! - `reference`: 参照表同步与进程内解析器快照
//! - `listen`: LISTEN/NOTIFY 变更事件流
//! - `downtime`: 按键陈旧度查询

pub mod downtime;
pub mod listen;
pub mod pool;
pub mod reference;
mod retry;
pub mod schema;
pub mod timeseries;
