use crate::common::DataKind;
use crate::market::entity::{Candle, FundingTick, OpenInterestTick};
use crate::market::error::FeedError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// # Summary
/// 交易所推送帧解码后的统一事件。
/// 适配器只认识交易所自身的币种/周期标签，序列与市场标识的解析由运行器完成。
#[derive(Debug, Clone)]
pub enum FeedEvent {
    /// K 线更新
    Candle {
        // 交易所币种标签
        coin: String,
        // 交易所周期标签
        interval: String,
        // 解码后的 K 线 (time 已对齐到周期起点)
        candle: Candle,
    },
    /// 资金费率快照
    Funding {
        // 交易所币种标签
        coin: String,
        // 交易所上报时间戳
        ts: DateTime<Utc>,
        // 载荷
        tick: FundingTick,
    },
    /// 未平仓量快照
    OpenInterest {
        // 交易所币种标签
        coin: String,
        // 交易所上报时间戳
        ts: DateTime<Utc>,
        // 载荷
        tick: OpenInterestTick,
    },
    /// 订阅确认
    SubscriptionAck,
    /// 心跳帧
    Heartbeat,
    /// 可识别但无需处理的帧
    Ignored,
}

/// # Summary
/// 一条连接的订阅计划：需要订阅 K 线的 (币种, 周期) 组合，
/// 以及需要订阅市场数据 (资金费率/未平仓量) 的币种集合。
#[derive(Debug, Clone, Default)]
pub struct SubscribePlan {
    // K 线订阅: (交易所币种标签, 交易所周期标签)
    pub candles: Vec<(String, String)>,
    // 市场数据订阅: 交易所币种标签
    pub markets: Vec<String>,
}

/// # Summary
/// 交易所 WebSocket 适配器契约。
/// 每个受支持的交易所一个实现；通用运行器持有 `Arc<dyn ExchangeAdapter>`，
/// 负责连接生命周期，适配器只负责帧的构造与解析。
///
/// # Invariants
/// - `parse_frame` 必须无副作用：单帧解析失败返回错误，绝不 panic。
/// - 适配器实例在多任务间共享，必须 `Send + Sync`。
pub trait ExchangeAdapter: Send + Sync {
    /// # Summary
    /// 交易所规范名，与参照表中的 `exchange.name` 完全一致。
    fn name(&self) -> &'static str;

    /// # Summary
    /// WebSocket 入口地址。
    fn ws_url(&self) -> &str;

    /// # Summary
    /// 将内部 (基础资产, 计价资产) 映射为交易所侧市场标签。
    ///
    /// # Logic
    /// 1. 命名适配而非数值换算：交易所可能以另一种稳定币标注结算币
    ///    （固定别名按交易所配置），或完全不带计价后缀。
    /// 2. `parse_frame` 产出的 `coin` 字段必须与本方法的返回值一致，
    ///    运行器以该标签做序列/市场解析。
    ///
    /// # Arguments
    /// * `coin`: 参照表中的基础资产名。
    /// * `quote`: 参照表中的计价资产名。
    ///
    /// # Returns
    /// 交易所侧使用的市场标签。
    fn market_label(&self, coin: &str, quote: &str) -> String;

    /// # Summary
    /// 为订阅计划构造一组待发送的文本帧。
    ///
    /// # Arguments
    /// * `plan`: 本连接的订阅计划。
    ///
    /// # Returns
    /// 每个元素为一条完整的 JSON 文本帧。
    fn subscribe_frames(&self, plan: &SubscribePlan) -> Vec<String>;

    /// # Summary
    /// 解析一条入站文本帧。
    ///
    /// # Logic
    /// 1. 一条帧可能携带多个事件（部分交易所合并推送）。
    /// 2. 心跳与确认帧返回对应变体；无法识别的帧返回 Parse 错误，
    ///    由运行器记录（截断原始字节）并跳过。
    ///
    /// # Arguments
    /// * `raw`: 入站文本帧。
    ///
    /// # Returns
    /// 解码出的事件列表。
    fn parse_frame(&self, raw: &str) -> Result<Vec<FeedEvent>, FeedError>;
}

/// # Summary
/// 历史数据 REST 源契约，回补引擎的唯一上游。
///
/// # Invariants
/// - 返回的行以交易所上报时间为准，对齐由回补引擎完成。
/// - 实现必须遵守 `page_limit`，单次请求不超过该行数。
#[async_trait]
pub trait HistorySource: Send + Sync {
    /// 对应的交易所规范名。
    fn name(&self) -> &'static str;

    /// 单次请求的最大行数（交易所分页上限）。
    fn page_limit(&self) -> usize;

    /// 该源是否能提供指定数据种类的历史。
    fn supports(&self, kind: DataKind) -> bool;

    /// # Summary
    /// 拉取一页历史 K 线。
    ///
    /// # Arguments
    /// * `coin`: 交易所币种标签。
    /// * `quote`: 内部计价资产名（由实现做别名映射）。
    /// * `interval`: 交易所周期标签。
    /// * `start` / `end`: 闭区间查询窗口。
    ///
    /// # Returns
    /// 时间升序的 K 线列表，空列表表示窗口内无数据。
    async fn fetch_candles(
        &self,
        coin: &str,
        quote: &str,
        interval: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, FeedError>;

    /// # Summary
    /// 拉取一页历史资金费率。
    ///
    /// # Logic
    /// 1. 历史资金费率已知缺失价格列，引擎不得补造。
    ///
    /// # Returns
    /// (上报时间, 载荷) 列表，时间升序。
    async fn fetch_funding(
        &self,
        coin: &str,
        quote: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<(DateTime<Utc>, FundingTick)>, FeedError>;
}
