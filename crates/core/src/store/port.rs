use crate::common::{DataKind, MarketId, MarketKey, SeriesId, SeriesKey};
use crate::market::entity::{
    Candle, FundingPoint, MarketInfo, OpenInterestPoint, SeriesInfo,
};
use crate::store::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// # Summary
/// 时序存储网关契约：批量合并写入与区间读取。
///
/// # Invariants
/// - 每个批次原子提交；主键冲突时 K 线整列覆盖 (最后写入者胜出)，
///   资金费率与未平仓量按列 COALESCE (缺失入站列不覆盖既有值)。
/// - 所有写入的时间戳必须分钟对齐，由调用方保证、实现方校验。
#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    /// # Summary
    /// 批量落库单一序列的 K 线。
    ///
    /// # Logic
    /// 1. 逐行校验 OHLC 不变量，违反即返回 Validation 错误并放弃整批。
    /// 2. 单条多行 INSERT，冲突时以入站值整列覆盖。
    /// 3. 瞬时故障内部带抖动退避重试，预算耗尽后以 Transient 上抛。
    ///
    /// # Arguments
    /// * `series_id`: 目标序列。
    /// * `rows`: 分钟对齐的 K 线集合。
    ///
    /// # Returns
    /// 受影响的行数。
    async fn upsert_candles(
        &self,
        series_id: SeriesId,
        rows: &[Candle],
    ) -> Result<u64, StoreError>;

    /// # Summary
    /// 批量落库资金费率点（可跨市场）。冲突时按列 COALESCE。
    async fn upsert_funding(&self, rows: &[FundingPoint]) -> Result<u64, StoreError>;

    /// # Summary
    /// 批量落库未平仓量点（可跨市场）。冲突时按列 COALESCE。
    async fn upsert_open_interest(
        &self,
        rows: &[OpenInterestPoint],
    ) -> Result<u64, StoreError>;

    /// # Summary
    /// 区间读取 K 线，时间降序，limit 默认 1000 上限 5000。
    /// 无匹配返回空列表；不区分“序列不存在”与“区间无数据”。
    async fn candle_range(
        &self,
        series_id: SeriesId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: Option<i64>,
    ) -> Result<Vec<Candle>, StoreError>;

    /// 区间读取资金费率，语义同 `candle_range`。
    async fn funding_range(
        &self,
        market_id: MarketId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: Option<i64>,
    ) -> Result<Vec<FundingPoint>, StoreError>;

    /// 区间读取未平仓量，语义同 `candle_range`。
    async fn open_interest_range(
        &self,
        market_id: MarketId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: Option<i64>,
    ) -> Result<Vec<OpenInterestPoint>, StoreError>;

    /// 主键读回单根 K 线，供扇出监听器具体化通知。
    async fn candle_at(
        &self,
        series_id: SeriesId,
        time: DateTime<Utc>,
    ) -> Result<Option<Candle>, StoreError>;

    /// 主键读回单个资金费率点。
    async fn funding_at(
        &self,
        market_id: MarketId,
        time: DateTime<Utc>,
    ) -> Result<Option<FundingPoint>, StoreError>;

    /// 主键读回单个未平仓量点。
    async fn open_interest_at(
        &self,
        market_id: MarketId,
        time: DateTime<Utc>,
    ) -> Result<Option<OpenInterestPoint>, StoreError>;

    /// 轻量连通性探测，供健康检查使用。
    async fn ping(&self) -> Result<(), StoreError>;

    /// # Summary
    /// 查询某键某数据种类的最新行时间，供停机检测计算陈旧度。
    ///
    /// # Arguments
    /// * `kind`: 数据种类（决定查询的表）。
    /// * `key`: Candle 传 SeriesId，其余传 MarketId。
    ///
    /// # Returns
    /// 无任何行时返回 None。
    async fn latest_time(
        &self,
        kind: DataKind,
        key: i32,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;
}

/// # Summary
/// 活跃序列筛选条件，空条件表示全部。
#[derive(Debug, Clone, Default)]
pub struct SeriesFilter {
    // 按交易所名筛选
    pub exchange: Option<String>,
    // 按基础资产名筛选
    pub coin: Option<String>,
}

/// # Summary
/// 参照解析器契约：名称元组到内部标识的映射。
/// 进程内快照缓存，读取无锁争用；`refresh` 整体替换快照。
///
/// # Invariants
/// - 读者要么看到旧快照要么看到新快照，绝不出现混合视图。
/// - 未知元组必须返回 NotFound，调用方不得擅自发明标识。
#[async_trait]
pub trait SeriesResolver: Send + Sync {
    /// 解析序列键，未知返回 NotFound。
    fn resolve_series(&self, key: &SeriesKey) -> Result<SeriesInfo, StoreError>;

    /// 解析市场键，未知返回 NotFound。
    fn resolve_market(&self, key: &MarketKey) -> Result<MarketInfo, StoreError>;

    /// 按内部标识反查序列信息。
    fn series_by_id(&self, id: SeriesId) -> Option<SeriesInfo>;

    /// 按内部标识反查市场信息。
    fn market_by_id(&self, id: MarketId) -> Option<MarketInfo>;

    /// 列出匹配筛选条件的活跃序列。
    fn active_series(&self, filter: &SeriesFilter) -> Vec<SeriesInfo>;

    /// 枚举全部已知序列（含停用项），按序列标识升序。
    fn all_series(&self) -> Vec<SeriesInfo>;

    /// 列出匹配筛选条件的活跃市场。
    fn active_markets(&self, filter: &SeriesFilter) -> Vec<MarketInfo>;

    /// # Summary
    /// 重新加载参照表并原子替换快照。幂等，与并发读互不阻塞。
    async fn refresh(&self) -> Result<(), StoreError>;
}

/// # Summary
/// 数据库变更通知事件：触发器发布的最小载荷。
/// 载荷仅含键与时间，完整行由监听方通过主键读回。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeEvent {
    // 数据种类 (由通道名确定)
    pub kind: DataKind,
    // SeriesId (candle) 或 MarketId (funding / oi)
    pub key: i32,
    // 行的分钟对齐时间戳 (Unix 秒)
    pub time: i64,
}

impl ChangeEvent {
    /// 载荷时间转为 UTC 时间戳。
    pub fn time_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.time, 0)
    }
}

/// 变更事件异步流别名，使用动态分发。
pub type ChangeEventStream = Pin<Box<dyn Stream<Item = ChangeEvent> + Send>>;

/// # Summary
/// 变更事件订阅契约。进程内唯一的监听器实现持有数据库通知消费者，
/// 断线后自行重连并继续产出事件。
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// 订阅全部三个通道的合并事件流。
    async fn subscribe(&self) -> Result<ChangeEventStream, StoreError>;
}

/// # Summary
/// 单个键某数据种类的陈旧度报告条目。
#[derive(Debug, Clone, Serialize)]
pub struct StalenessEntry {
    // 数据种类
    pub kind: DataKind,
    // SeriesId 或 MarketId
    pub key: i32,
    // 人类可读键描述
    pub label: String,
    // 最新行时间，无行时为 None
    pub latest: Option<DateTime<Utc>>,
    // 距今秒数，无行时为 None
    pub age_seconds: Option<i64>,
}
