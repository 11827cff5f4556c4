//! # `souba-core` - 领域核心
//!
//! 本 crate 定义 Souba 行情管道的全部领域实体、端口 (Trait) 与错误类型。
//! 不包含任何具体基础设施实现：数据库、交易所连接、HTTP 服务均在
//! 外层 crate 中实现并通过 `Arc<dyn Trait>` 注入。
//!
//! ## 架构职责
//! - `common`: 序列/市场标识、数据种类、参照实体与时间对齐工具
//! - `market`: 行情实体 (Candle / FundingPoint / OpenInterestPoint) 与采集端口
//! - `store`: 存储网关端口、解析器端口、变更事件流端口
//! - `config`: 全局运行配置与参照配置文档结构

pub mod common;
pub mod config;
pub mod market;
pub mod store;
