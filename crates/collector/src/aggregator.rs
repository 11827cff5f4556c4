use chrono::{DateTime, Utc};
use souba_core::common::MarketId;
use souba_core::common::time::{floor_to_minute, next_minute_boundary};
use souba_core::market::entity::{FundingPoint, FundingTick, OpenInterestPoint, OpenInterestTick};
use souba_core::store::port::TimeSeriesStore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// # Summary
/// 分钟聚合桶：每市场只保留当前分钟内最新一条报文。
///
/// # Invariants
/// - 容量以不同市场数为上界，与报文速率无关；单条摄入 O(1)。
/// - 同一市场按交易所上报时间比较，晚到但时间更早的报文被丢弃。
pub struct MinuteBucket<T> {
    // market_id -> (交易所上报时间, 载荷)
    entries: Mutex<HashMap<MarketId, (DateTime<Utc>, T)>>,
}

impl<T: Clone> MinuteBucket<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// # Summary
    /// 摄入一条报文：上报时间不早于持有条目时覆盖，否则丢弃。
    ///
    /// # Logic
    /// 1. 上游不保证顺序，桶内以交易所上报时间裁决最新者。
    /// 2. 相等时间也覆盖（同刻重发取后到的完整载荷）。
    ///
    /// # Arguments
    /// * `market_id`: 所属市场。
    /// * `ts`: 交易所上报时间。
    /// * `payload`: 报文载荷。
    pub fn ingest(&self, market_id: MarketId, ts: DateTime<Utc>, payload: T) {
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match entries.get(&market_id) {
            Some((held_ts, _)) if *held_ts > ts => {}
            _ => {
                entries.insert(market_id, (ts, payload));
            }
        }
    }

    /// # Summary
    /// 原子快照并清空：返回当前全部条目，桶复位为空。
    ///
    /// # Returns
    /// (market_id, 上报时间, 载荷) 列表。
    pub fn drain(&self) -> Vec<(MarketId, DateTime<Utc>, T)> {
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries
            .drain()
            .map(|(market_id, (ts, payload))| (market_id, ts, payload))
            .collect()
    }

    /// 当前桶内条目数（不同市场数）。
    pub fn len(&self) -> usize {
        match self.entries.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone> Default for MinuteBucket<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// # Summary
/// 一个交易所的聚合缓冲对：资金费率桶 + 未平仓量桶。
/// 采集任务写入，冲洗任务读取；两者通过桶内互斥量交接。
#[derive(Clone)]
pub struct AggregatorHandle {
    pub funding: Arc<MinuteBucket<FundingTick>>,
    pub open_interest: Arc<MinuteBucket<OpenInterestTick>>,
}

impl AggregatorHandle {
    pub fn new() -> Self {
        Self {
            funding: Arc::new(MinuteBucket::new()),
            open_interest: Arc::new(MinuteBucket::new()),
        }
    }
}

impl Default for AggregatorHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// # Summary
/// 将两个桶的快照以统一时间戳落库。
///
/// # Logic
/// 1. 持久化时间戳取冲洗开始时的分钟边界，而非各报文自身时间：
///    三类时序表的行在同一分钟上对齐，跨表联结无须对时。
/// 2. 每种数据各提交一次批量合并写入；空桶跳过。
///
/// # Arguments
/// * `store`: 存储网关。
/// * `agg`: 聚合缓冲对。
/// * `boundary`: 本次冲洗的分钟边界。
pub async fn flush_once(
    store: &Arc<dyn TimeSeriesStore>,
    agg: &AggregatorHandle,
    boundary: DateTime<Utc>,
) {
    let funding_rows: Vec<FundingPoint> = agg
        .funding
        .drain()
        .into_iter()
        .map(|(market_id, _ts, tick)| FundingPoint::from_tick(market_id, boundary, tick))
        .collect();
    if !funding_rows.is_empty() {
        match store.upsert_funding(&funding_rows).await {
            Ok(n) => debug!(rows = n, %boundary, "funding flush committed"),
            Err(e) => error!(error = %e, %boundary, "funding flush failed, batch dropped"),
        }
    }

    let oi_rows: Vec<OpenInterestPoint> = agg
        .open_interest
        .drain()
        .into_iter()
        .map(|(market_id, _ts, tick)| OpenInterestPoint::from_tick(market_id, boundary, tick))
        .collect();
    if !oi_rows.is_empty() {
        match store.upsert_open_interest(&oi_rows).await {
            Ok(n) => debug!(rows = n, %boundary, "open interest flush committed"),
            Err(e) => error!(error = %e, %boundary, "open interest flush failed, batch dropped"),
        }
    }
}

/// # Summary
/// 启动分钟边界冲洗任务。
///
/// # Logic
/// 1. 睡到下一个挂钟分钟边界后冲洗一次，循环往复。
/// 2. 冲洗串行执行、绝不堆叠：一次冲洗慢于一分钟时，后续边界顺延，
///    届时冲洗的是彼刻桶内的全部内容。
/// 3. 收到关停信号后同步冲洗一次残余缓冲再退出。
///
/// # Arguments
/// * `exchange`: 所属交易所名（日志用）。
/// * `store`: 存储网关。
/// * `agg`: 聚合缓冲对。
/// * `shutdown`: 关停信号。
///
/// # Returns
/// 冲洗任务句柄。
pub fn spawn_flusher(
    exchange: String,
    store: Arc<dyn TimeSeriesStore>,
    agg: AggregatorHandle,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(exchange, "minute flusher started");
        loop {
            let now = Utc::now();
            let boundary = next_minute_boundary(now);
            let wait = (boundary - now)
                .to_std()
                .unwrap_or_else(|_| std::time::Duration::from_secs(0));

            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    flush_once(&store, &agg, boundary).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        // 关停：以当前分钟边界冲洗残余缓冲
                        let final_boundary = floor_to_minute(Utc::now());
                        flush_once(&store, &agg, final_boundary).await;
                        info!(exchange, "minute flusher drained and stopped");
                        return;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).expect("valid timestamp")
    }

    #[test]
    fn test_latest_wins_within_minute() {
        // 同一分钟内三条报文，最后上报者胜出
        let bucket: MinuteBucket<FundingTick> = MinuteBucket::new();
        let base = 1_767_225_240; // 分钟边界
        bucket.ingest(
            1,
            ts(base + 3),
            FundingTick {
                funding_rate: Some(dec!(0.0001)),
                mark_price: Some(dec!(67500.00)),
                ..FundingTick::default()
            },
        );
        bucket.ingest(
            1,
            ts(base + 27),
            FundingTick {
                funding_rate: Some(dec!(0.00012)),
                mark_price: Some(dec!(67510.25)),
                ..FundingTick::default()
            },
        );
        bucket.ingest(
            1,
            ts(base + 58),
            FundingTick {
                funding_rate: Some(dec!(0.00011)),
                mark_price: Some(dec!(67508.75)),
                ..FundingTick::default()
            },
        );

        let drained = bucket.drain();
        assert_eq!(drained.len(), 1);
        let (market, held_ts, tick) = &drained[0];
        assert_eq!(*market, 1);
        assert_eq!(*held_ts, ts(base + 58));
        assert_eq!(tick.funding_rate, Some(dec!(0.00011)));
        assert_eq!(tick.mark_price, Some(dec!(67508.75)));
        // drain 后桶复位
        assert!(bucket.is_empty());
    }

    #[test]
    fn test_out_of_order_tick_discarded() {
        let bucket: MinuteBucket<OpenInterestTick> = MinuteBucket::new();
        bucket.ingest(
            2,
            ts(1_767_225_250),
            OpenInterestTick {
                open_interest: Some(dec!(12345.67)),
                ..OpenInterestTick::default()
            },
        );
        // 更早的上报时间不得覆盖
        bucket.ingest(
            2,
            ts(1_767_225_245),
            OpenInterestTick {
                open_interest: Some(dec!(99.0)),
                ..OpenInterestTick::default()
            },
        );
        let drained = bucket.drain();
        assert_eq!(drained[0].2.open_interest, Some(dec!(12345.67)));
    }

    #[test]
    fn test_equal_timestamp_overwrites() {
        let bucket: MinuteBucket<FundingTick> = MinuteBucket::new();
        let t = ts(1_767_225_250);
        bucket.ingest(3, t, FundingTick::default());
        bucket.ingest(
            3,
            t,
            FundingTick {
                premium: Some(dec!(0.00005)),
                ..FundingTick::default()
            },
        );
        assert_eq!(bucket.drain()[0].2.premium, Some(dec!(0.00005)));
    }

    #[test]
    fn test_bucket_capacity_is_market_count() {
        let bucket: MinuteBucket<FundingTick> = MinuteBucket::new();
        for i in 0..1000 {
            bucket.ingest(i % 10, ts(1_767_225_200 + i64::from(i)), FundingTick::default());
        }
        assert_eq!(bucket.len(), 10);
    }
}
