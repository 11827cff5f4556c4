use chrono::{DateTime, Duration as ChronoDuration, Utc};
use souba_core::common::DataKind;
use souba_core::common::time::{floor_to_bar, floor_to_minute};
use souba_core::market::entity::{Candle, FundingPoint, MarketInfo, SeriesInfo};
use souba_core::market::error::FeedError;
use souba_core::market::port::HistorySource;
use souba_core::store::port::{SeriesFilter, SeriesResolver, TimeSeriesStore};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

/// 单页请求的限速重试预算。
const FETCH_ATTEMPTS: u32 = 3;

/// 限速重试的基础等待。
const FETCH_RETRY_DELAY: Duration = Duration::from_secs(2);

/// 默认请求速率（每秒），遇 429 减半。
const DEFAULT_RATE_PER_SEC: f64 = 4.0;

/// 速率下限，避免退化到停摆。
const MIN_RATE_PER_SEC: f64 = 0.25;

/// # Summary
/// 一次回补请求：键筛选、数据种类与时间窗口。
#[derive(Debug, Clone)]
pub struct BackfillRequest {
    pub filter: SeriesFilter,
    pub kind: DataKind,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl BackfillRequest {
    /// 以“最近 N 天”构造时间窗口。
    pub fn last_days(filter: SeriesFilter, kind: DataKind, days: i64) -> Self {
        let end = Utc::now();
        Self {
            filter,
            kind,
            start: end - ChronoDuration::days(days),
            end,
        }
    }
}

/// 单键回补结果。
#[derive(Debug)]
pub enum KindOutcome {
    /// 正常完成：落库行数与翻页次数
    Completed { rows: u64, pages: u32 },
    /// 该种类无历史源（未平仓量）
    NotRecoverable,
    /// 该键失败（其余键继续）
    Failed(String),
}

/// 回补报告条目。
#[derive(Debug)]
pub struct BackfillEntry {
    pub label: String,
    pub kind: DataKind,
    pub outcome: KindOutcome,
}

// ============================================================
//  令牌桶限速
// ============================================================

struct LimiterState {
    rate_per_sec: f64,
    tokens: f64,
    last_refill: Instant,
}

/// # Summary
/// 每交易所令牌桶。容量与速率同值；429 等价响应将速率减半（有下限）。
struct RateLimiter {
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    fn new(rate_per_sec: f64) -> Self {
        Self {
            state: Mutex::new(LimiterState {
                rate_per_sec,
                tokens: rate_per_sec,
                last_refill: Instant::now(),
            }),
        }
    }

    /// 取走一个令牌，不足时睡到补满。
    async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let elapsed = state.last_refill.elapsed().as_secs_f64();
                state.tokens =
                    (state.tokens + elapsed * state.rate_per_sec).min(state.rate_per_sec);
                state.last_refill = Instant::now();
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - state.tokens) / state.rate_per_sec)
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// 上游限速信号：速率减半。
    async fn throttle(&self) {
        let mut state = self.state.lock().await;
        state.rate_per_sec = (state.rate_per_sec / 2.0).max(MIN_RATE_PER_SEC);
        warn!(rate = state.rate_per_sec, "rate limited, halving request rate");
    }
}

// ============================================================
//  回补引擎
// ============================================================

/// # Summary
/// 历史回补引擎：在实时路径之外，把 REST 历史数据灌进同一存储网关。
/// 网关的按列 COALESCE 让回补与并行的实时流可安全交错，重放收敛。
///
/// # Invariants
/// - 逐页倒序回溯：下一页以本页最旧时间戳为右端，空页或越过 start 即停。
/// - 历史资金费率缺失的价格列不补造。
/// - 同参数重复执行产生相同的最终存储状态。
pub struct BackfillEngine {
    store: Arc<dyn TimeSeriesStore>,
    resolver: Arc<dyn SeriesResolver>,
    sources: HashMap<String, Arc<dyn HistorySource>>,
    limiters: HashMap<String, Arc<RateLimiter>>,
}

impl BackfillEngine {
    /// # Summary
    /// 以历史源集合构造引擎，每个源配一个独立令牌桶。
    pub fn new(
        store: Arc<dyn TimeSeriesStore>,
        resolver: Arc<dyn SeriesResolver>,
        sources: Vec<Arc<dyn HistorySource>>,
    ) -> Self {
        let mut source_map = HashMap::new();
        let mut limiters = HashMap::new();
        for source in sources {
            limiters.insert(
                source.name().to_string(),
                Arc::new(RateLimiter::new(DEFAULT_RATE_PER_SEC)),
            );
            source_map.insert(source.name().to_string(), source);
        }
        Self {
            store,
            resolver,
            sources: source_map,
            limiters,
        }
    }

    /// # Summary
    /// 执行一次回补请求，逐键推进并汇总报告。
    ///
    /// # Logic
    /// 1. K 线按活跃序列展开，资金费率按活跃市场展开。
    /// 2. 未平仓量直接判 NotRecoverable（无历史源）。
    /// 3. 单键失败只记录该键，不中断整体。
    pub async fn run(&self, req: &BackfillRequest) -> Vec<BackfillEntry> {
        let mut report = Vec::new();

        match req.kind {
            DataKind::Candle => {
                for series in self.resolver.active_series(&req.filter) {
                    let label = format!(
                        "{}/{}/{}/{}/{}",
                        series.exchange,
                        series.coin,
                        series.quote,
                        series.market_type,
                        series.interval
                    );
                    let outcome = self
                        .backfill_series_candles(&series, req.start, req.end)
                        .await;
                    report.push(BackfillEntry {
                        label,
                        kind: DataKind::Candle,
                        outcome,
                    });
                }
            }
            DataKind::Funding => {
                for market in self.resolver.active_markets(&req.filter) {
                    let label = format!(
                        "{}/{}/{}/{}",
                        market.exchange, market.coin, market.quote, market.market_type
                    );
                    let outcome = self
                        .backfill_market_funding(&market, req.start, req.end)
                        .await;
                    report.push(BackfillEntry {
                        label,
                        kind: DataKind::Funding,
                        outcome,
                    });
                }
            }
            DataKind::OpenInterest => {
                for market in self.resolver.active_markets(&req.filter) {
                    report.push(BackfillEntry {
                        label: format!(
                            "{}/{}/{}/{}",
                            market.exchange, market.coin, market.quote, market.market_type
                        ),
                        kind: DataKind::OpenInterest,
                        outcome: KindOutcome::NotRecoverable,
                    });
                }
            }
        }

        report
    }

    fn source_for(&self, exchange: &str) -> Option<(&Arc<dyn HistorySource>, &Arc<RateLimiter>)> {
        Some((self.sources.get(exchange)?, self.limiters.get(exchange)?))
    }

    /// # Summary
    /// 单序列 K 线倒序回溯。
    ///
    /// # Logic
    /// 1. 以 end 为右端请求一页，页内升序。
    /// 2. 行按周期截断对齐后经网关落库。
    /// 3. 下一页右端取本页最旧时间戳减一秒；空页或最旧 ≤ start 即停。
    async fn backfill_series_candles(
        &self,
        series: &SeriesInfo,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> KindOutcome {
        let Some((source, limiter)) = self.source_for(&series.exchange) else {
            return KindOutcome::Failed(format!("no history source for {}", series.exchange));
        };
        if !source.supports(DataKind::Candle) {
            return KindOutcome::NotRecoverable;
        }

        let mut cursor_end = end;
        let mut rows_total: u64 = 0;
        let mut pages: u32 = 0;

        loop {
            let page = match fetch_candles_page(
                source, limiter, series, start, cursor_end,
            )
            .await
            {
                Ok(page) => page,
                Err(e) => return KindOutcome::Failed(e.to_string()),
            };
            if page.is_empty() {
                break;
            }
            pages += 1;

            let oldest = page[0].time;
            let aligned: Vec<Candle> = page
                .into_iter()
                .map(|mut c| {
                    c.time = floor_to_bar(c.time, series.interval_seconds);
                    c
                })
                .collect();

            match self.store.upsert_candles(series.series_id, &aligned).await {
                Ok(n) => rows_total += n,
                Err(e) => return KindOutcome::Failed(e.to_string()),
            }

            if oldest <= start {
                break;
            }
            cursor_end = oldest - ChronoDuration::seconds(1);
        }

        info!(
            series_id = series.series_id,
            rows = rows_total,
            pages,
            "candle backfill finished"
        );
        KindOutcome::Completed {
            rows: rows_total,
            pages,
        }
    }

    /// # Summary
    /// 单市场资金费率倒序回溯。历史行只含费率与溢价，价格列保持缺失，
    /// 落库经 COALESCE 不会覆盖实时流已写入的价格。
    async fn backfill_market_funding(
        &self,
        market: &MarketInfo,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> KindOutcome {
        let Some((source, limiter)) = self.source_for(&market.exchange) else {
            return KindOutcome::Failed(format!("no history source for {}", market.exchange));
        };
        if !source.supports(DataKind::Funding) {
            return KindOutcome::NotRecoverable;
        }

        let mut cursor_end = end;
        let mut rows_total: u64 = 0;
        let mut pages: u32 = 0;

        loop {
            limiter.acquire().await;
            let page = match fetch_with_retry(limiter, || {
                source.fetch_funding(&market.coin, &market.quote, start, cursor_end)
            })
            .await
            {
                Ok(page) => page,
                Err(e) => return KindOutcome::Failed(e.to_string()),
            };
            if page.is_empty() {
                break;
            }
            pages += 1;

            let oldest = page[0].0;
            let rows: Vec<FundingPoint> = page
                .into_iter()
                .map(|(ts, tick)| {
                    FundingPoint::from_tick(market.market_id, floor_to_minute(ts), tick)
                })
                .collect();

            match self.store.upsert_funding(&rows).await {
                Ok(n) => rows_total += n,
                Err(e) => return KindOutcome::Failed(e.to_string()),
            }

            if oldest <= start {
                break;
            }
            cursor_end = oldest - ChronoDuration::seconds(1);
        }

        info!(
            market_id = market.market_id,
            rows = rows_total,
            pages,
            "funding backfill finished"
        );
        KindOutcome::Completed {
            rows: rows_total,
            pages,
        }
    }
}

async fn fetch_candles_page(
    source: &Arc<dyn HistorySource>,
    limiter: &Arc<RateLimiter>,
    series: &SeriesInfo,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<Candle>, FeedError> {
    limiter.acquire().await;
    fetch_with_retry(limiter, || {
        source.fetch_candles(&series.coin, &series.quote, &series.interval, start, end)
    })
    .await
}

/// # Summary
/// 带限速退避的页请求：429 等价响应减半速率并重试，预算 FETCH_ATTEMPTS。
async fn fetch_with_retry<T, F, Fut>(
    limiter: &Arc<RateLimiter>,
    mut fetch: F,
) -> Result<T, FeedError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FeedError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match fetch().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < FETCH_ATTEMPTS => {
                if matches!(e, FeedError::RateLimited) {
                    limiter.throttle().await;
                }
                attempt += 1;
                tokio::time::sleep(FETCH_RETRY_DELAY.saturating_mul(attempt)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use souba_core::common::{MarketId, SeriesId};
    use souba_core::market::entity::{FundingTick, OpenInterestPoint};
    use souba_core::store::error::StoreError;
    use std::sync::Mutex as StdMutex;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).expect("valid timestamp")
    }

    fn candle_at(time: DateTime<Utc>) -> Candle {
        Candle {
            time,
            open: dec!(100),
            high: dec!(110),
            low: dec!(95),
            close: dec!(105),
            volume: dec!(1),
            trade_count: None,
        }
    }

    /// 预置分页数据的模拟历史源。
    struct MockSource {
        // 全量升序 K 线，fetch 按窗口与 page_limit 裁切
        candles: Vec<Candle>,
        calls: StdMutex<u32>,
    }

    #[async_trait]
    impl HistorySource for MockSource {
        fn name(&self) -> &'static str {
            "hyperliquid"
        }
        fn page_limit(&self) -> usize {
            3
        }
        fn supports(&self, kind: DataKind) -> bool {
            matches!(kind, DataKind::Candle | DataKind::Funding)
        }

        async fn fetch_candles(
            &self,
            _coin: &str,
            _quote: &str,
            _interval: &str,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> Result<Vec<Candle>, FeedError> {
            if let Ok(mut calls) = self.calls.lock() {
                *calls += 1;
            }
            // 窗口内最新的 page_limit 根（真实交易所的右端截断语义）
            let mut hits: Vec<Candle> = self
                .candles
                .iter()
                .filter(|c| c.time >= start && c.time <= end)
                .cloned()
                .collect();
            let excess = hits.len().saturating_sub(self.page_limit());
            hits.drain(..excess);
            Ok(hits)
        }

        async fn fetch_funding(
            &self,
            _coin: &str,
            _quote: &str,
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
        ) -> Result<Vec<(DateTime<Utc>, FundingTick)>, FeedError> {
            Ok(vec![])
        }
    }

    /// 记录落库行的模拟网关。
    #[derive(Default)]
    struct MockStore {
        candles: StdMutex<Vec<(SeriesId, Candle)>>,
    }

    #[async_trait]
    impl TimeSeriesStore for MockStore {
        async fn upsert_candles(
            &self,
            series_id: SeriesId,
            rows: &[Candle],
        ) -> Result<u64, StoreError> {
            let mut stored = self.candles.lock().unwrap_or_else(|e| e.into_inner());
            for row in rows {
                // 模拟整列覆盖 upsert
                stored.retain(|(sid, c)| !(*sid == series_id && c.time == row.time));
                stored.push((series_id, row.clone()));
            }
            Ok(rows.len() as u64)
        }
        async fn upsert_funding(&self, rows: &[FundingPoint]) -> Result<u64, StoreError> {
            Ok(rows.len() as u64)
        }
        async fn upsert_open_interest(
            &self,
            rows: &[OpenInterestPoint],
        ) -> Result<u64, StoreError> {
            Ok(rows.len() as u64)
        }
        async fn candle_range(
            &self,
            _: SeriesId,
            _: DateTime<Utc>,
            _: DateTime<Utc>,
            _: Option<i64>,
        ) -> Result<Vec<Candle>, StoreError> {
            Ok(vec![])
        }
        async fn funding_range(
            &self,
            _: MarketId,
            _: DateTime<Utc>,
            _: DateTime<Utc>,
            _: Option<i64>,
        ) -> Result<Vec<FundingPoint>, StoreError> {
            Ok(vec![])
        }
        async fn open_interest_range(
            &self,
            _: MarketId,
            _: DateTime<Utc>,
            _: DateTime<Utc>,
            _: Option<i64>,
        ) -> Result<Vec<OpenInterestPoint>, StoreError> {
            Ok(vec![])
        }
        async fn candle_at(
            &self,
            _: SeriesId,
            _: DateTime<Utc>,
        ) -> Result<Option<Candle>, StoreError> {
            Ok(None)
        }
        async fn funding_at(
            &self,
            _: MarketId,
            _: DateTime<Utc>,
        ) -> Result<Option<FundingPoint>, StoreError> {
            Ok(None)
        }
        async fn open_interest_at(
            &self,
            _: MarketId,
            _: DateTime<Utc>,
        ) -> Result<Option<OpenInterestPoint>, StoreError> {
            Ok(None)
        }
        async fn ping(&self) -> Result<(), StoreError> {
            Ok(())
        }
        async fn latest_time(
            &self,
            _: DataKind,
            _: i32,
        ) -> Result<Option<DateTime<Utc>>, StoreError> {
            Ok(None)
        }
    }

    /// 固定两条序列的模拟解析器。
    struct MockResolver {
        series: Vec<SeriesInfo>,
    }

    #[async_trait]
    impl SeriesResolver for MockResolver {
        fn resolve_series(
            &self,
            _: &souba_core::common::SeriesKey,
        ) -> Result<SeriesInfo, StoreError> {
            Err(StoreError::NotFound)
        }
        fn resolve_market(
            &self,
            _: &souba_core::common::MarketKey,
        ) -> Result<MarketInfo, StoreError> {
            Err(StoreError::NotFound)
        }
        fn series_by_id(&self, id: SeriesId) -> Option<SeriesInfo> {
            self.series.iter().find(|s| s.series_id == id).cloned()
        }
        fn market_by_id(&self, _: MarketId) -> Option<MarketInfo> {
            None
        }
        fn active_series(&self, _: &SeriesFilter) -> Vec<SeriesInfo> {
            self.series.clone()
        }
        fn all_series(&self) -> Vec<SeriesInfo> {
            self.series.clone()
        }
        fn active_markets(&self, _: &SeriesFilter) -> Vec<MarketInfo> {
            vec![MarketInfo {
                market_id: 1,
                exchange: "hyperliquid".into(),
                coin: "BTC".into(),
                quote: "USDC".into(),
                market_type: "perp".into(),
                active: true,
            }]
        }
        async fn refresh(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn btc_series() -> SeriesInfo {
        SeriesInfo {
            series_id: 42,
            market_id: 1,
            exchange: "hyperliquid".into(),
            coin: "BTC".into(),
            quote: "USDC".into(),
            market_type: "perp".into(),
            interval: "1m".into(),
            interval_seconds: 60,
            active: true,
        }
    }

    fn engine_with(
        source_candles: Vec<Candle>,
    ) -> (BackfillEngine, Arc<MockStore>) {
        let store = Arc::new(MockStore::default());
        let resolver = Arc::new(MockResolver {
            series: vec![btc_series()],
        });
        let source = Arc::new(MockSource {
            candles: source_candles,
            calls: StdMutex::new(0),
        });
        let engine = BackfillEngine::new(
            Arc::clone(&store) as Arc<dyn TimeSeriesStore>,
            resolver as Arc<dyn SeriesResolver>,
            vec![source as Arc<dyn HistorySource>],
        );
        (engine, store)
    }

    #[tokio::test]
    async fn test_reverse_walk_covers_window() {
        // 08:00 起 8 根 1 分钟 K 线，页上限 3 → 需要多页倒序回溯
        let base = 1_767_254_400;
        let candles: Vec<Candle> =
            (0..8).map(|i| candle_at(ts(base + i * 60))).collect();
        let (engine, store) = engine_with(candles);

        let req = BackfillRequest {
            filter: SeriesFilter::default(),
            kind: DataKind::Candle,
            start: ts(base),
            end: ts(base + 7 * 60),
        };
        let report = engine.run(&req).await;
        assert_eq!(report.len(), 1);
        match &report[0].outcome {
            KindOutcome::Completed { rows, pages } => {
                assert_eq!(*rows, 8);
                assert!(*pages >= 3);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        let stored = store.candles.lock().expect("lock");
        assert_eq!(stored.len(), 8);
    }

    #[tokio::test]
    async fn test_backfill_is_idempotent() {
        let base = 1_767_254_400;
        let candles: Vec<Candle> =
            (0..5).map(|i| candle_at(ts(base + i * 60))).collect();
        let (engine, store) = engine_with(candles);

        let req = BackfillRequest {
            filter: SeriesFilter::default(),
            kind: DataKind::Candle,
            start: ts(base),
            end: ts(base + 4 * 60),
        };
        engine.run(&req).await;
        let first: usize = store.candles.lock().expect("lock").len();
        engine.run(&req).await;
        let second: usize = store.candles.lock().expect("lock").len();
        // 同参数重复执行，存储状态不变
        assert_eq!(first, 5);
        assert_eq!(second, 5);
    }

    #[tokio::test]
    async fn test_open_interest_not_recoverable() {
        let (engine, _) = engine_with(vec![]);
        let req = BackfillRequest {
            filter: SeriesFilter::default(),
            kind: DataKind::OpenInterest,
            start: ts(0),
            end: ts(60),
        };
        let report = engine.run(&req).await;
        assert!(matches!(report[0].outcome, KindOutcome::NotRecoverable));
    }

    #[tokio::test]
    async fn test_empty_window_completes_with_zero_rows() {
        let (engine, _) = engine_with(vec![]);
        let req = BackfillRequest {
            filter: SeriesFilter::default(),
            kind: DataKind::Candle,
            start: ts(0),
            end: ts(3600),
        };
        let report = engine.run(&req).await;
        match &report[0].outcome {
            KindOutcome::Completed { rows, pages } => {
                assert_eq!(*rows, 0);
                assert_eq!(*pages, 0);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

}
