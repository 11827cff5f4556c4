//! # `souba-collector` - 交易所采集层
//!
//! 每个受支持的交易所一个 WebSocket 适配器；通用运行器负责连接生命周期
//! （连接、订阅、读取、有界退避重连），适配器只负责帧的构造与解析。
//! 高基数的资金费率 / 未平仓量报文先进入分钟聚合缓冲，
//! 在每个挂钟分钟边界成批落库；K 线走直通批量合并写入。
//!
//! ## 架构职责
//! - `aggregator`: 分钟桶（桶内最新者胜出）与边界冲洗任务
//! - `adapters`: Hyperliquid / Binance 合约的帧编解码与历史 REST 源
//! - `runner`: 单交易所采集状态机 (Idle → Connecting → Subscribing → Running)
//! - `supervisor`: 采集任务的启动、冷却重启与优雅关停
//! - `backfill`: 按序列分页倒序回溯的历史回补引擎

pub mod adapters;
pub mod aggregator;
pub mod backfill;
pub mod runner;
pub mod supervisor;
