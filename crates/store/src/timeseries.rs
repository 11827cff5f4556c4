use crate::retry::{self, MAX_ATTEMPTS};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use souba_core::common::time::is_minute_aligned;
use souba_core::common::{DataKind, MarketId, SeriesId};
use souba_core::market::entity::{Candle, FundingPoint, OpenInterestPoint};
use souba_core::store::error::StoreError;
use souba_core::store::port::TimeSeriesStore;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::collections::BTreeMap;
use tracing::warn;

/// 区间读取默认行数。
const DEFAULT_LIMIT: i64 = 1000;
/// 区间读取行数硬上限。
const MAX_LIMIT: i64 = 5000;
/// 单条 INSERT 的最大行数，控制绑定参数总量。
const CHUNK_ROWS: usize = 500;

/// # Summary
/// TimeSeriesStore 的 Postgres 实现。
///
/// # Invariants
/// - 每个批次在单事务内提交。
/// - K 线冲突整列覆盖；资金费率与未平仓量按列 COALESCE，
///   缺失入站列永不覆盖既有值（回补与实时流可交错重放）。
pub struct PgTimeSeriesStore {
    pool: PgPool,
}

impl PgTimeSeriesStore {
    /// 以共享连接池构造网关。
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// # Summary
    /// 以瞬时错误重试预算执行一次批量操作。
    ///
    /// # Logic
    /// 1. 归类底层错误；瞬时类在抖动退避后重试，至多 MAX_ATTEMPTS 次。
    /// 2. 校验与非瞬时错误立即上抛。网关只记录结果，不记录调用方意图。
    async fn run_with_retry<T, Fut>(
        &self,
        op: &'static str,
        mut f: impl FnMut() -> Fut,
    ) -> Result<T, StoreError>
    where
        Fut: std::future::Future<Output = Result<T, sqlx::Error>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match f().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    let classified = retry::classify(e);
                    if classified.is_transient() && attempt < MAX_ATTEMPTS {
                        let delay = retry::backoff_delay(attempt);
                        warn!(op, attempt, delay_ms = delay.as_millis() as u64,
                            "transient store failure, retrying");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(classified);
                }
            }
        }
    }

    async fn exec_upsert_candles(
        &self,
        series_id: SeriesId,
        rows: &[Candle],
    ) -> Result<u64, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let mut affected = 0u64;
        for chunk in rows.chunks(CHUNK_ROWS) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO candles (time, series_id, open, high, low, close, volume, trade_count) ",
            );
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(row.time)
                    .push_bind(series_id)
                    .push_bind(row.open)
                    .push_bind(row.high)
                    .push_bind(row.low)
                    .push_bind(row.close)
                    .push_bind(row.volume)
                    .push_bind(row.trade_count);
            });
            // K 线冲突规则: 入站值整列覆盖 (K 线以来源为权威)
            qb.push(
                " ON CONFLICT (time, series_id) DO UPDATE SET \
                 open = EXCLUDED.open, high = EXCLUDED.high, low = EXCLUDED.low, \
                 close = EXCLUDED.close, volume = EXCLUDED.volume, \
                 trade_count = EXCLUDED.trade_count",
            );
            affected += qb.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(affected)
    }

    async fn exec_upsert_funding(&self, rows: &[FundingPoint]) -> Result<u64, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let mut affected = 0u64;
        for chunk in rows.chunks(CHUNK_ROWS) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO funding (time, market_id, funding_rate, premium, mark_price, \
                 index_price, oracle_price, mid_price, next_funding_time) ",
            );
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(row.time)
                    .push_bind(row.market_id)
                    .push_bind(row.funding_rate)
                    .push_bind(row.premium)
                    .push_bind(row.mark_price)
                    .push_bind(row.index_price)
                    .push_bind(row.oracle_price)
                    .push_bind(row.mid_price)
                    .push_bind(row.next_funding_time);
            });
            // 非对称合并: 入站列存在则胜出，缺失列保留既有值
            qb.push(
                " ON CONFLICT (time, market_id) DO UPDATE SET \
                 funding_rate = COALESCE(EXCLUDED.funding_rate, funding.funding_rate), \
                 premium = COALESCE(EXCLUDED.premium, funding.premium), \
                 mark_price = COALESCE(EXCLUDED.mark_price, funding.mark_price), \
                 index_price = COALESCE(EXCLUDED.index_price, funding.index_price), \
                 oracle_price = COALESCE(EXCLUDED.oracle_price, funding.oracle_price), \
                 mid_price = COALESCE(EXCLUDED.mid_price, funding.mid_price), \
                 next_funding_time = COALESCE(EXCLUDED.next_funding_time, funding.next_funding_time)",
            );
            affected += qb.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(affected)
    }

    async fn exec_upsert_open_interest(
        &self,
        rows: &[OpenInterestPoint],
    ) -> Result<u64, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let mut affected = 0u64;
        for chunk in rows.chunks(CHUNK_ROWS) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO open_interest (time, market_id, open_interest, notional_value, \
                 day_base_volume, day_notional_volume) ",
            );
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(row.time)
                    .push_bind(row.market_id)
                    .push_bind(row.open_interest)
                    .push_bind(row.notional_value)
                    .push_bind(row.day_base_volume)
                    .push_bind(row.day_notional_volume);
            });
            qb.push(
                " ON CONFLICT (time, market_id) DO UPDATE SET \
                 open_interest = COALESCE(EXCLUDED.open_interest, open_interest.open_interest), \
                 notional_value = COALESCE(EXCLUDED.notional_value, open_interest.notional_value), \
                 day_base_volume = COALESCE(EXCLUDED.day_base_volume, open_interest.day_base_volume), \
                 day_notional_volume = COALESCE(EXCLUDED.day_notional_volume, open_interest.day_notional_volume)",
            );
            affected += qb.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(affected)
    }
}

/// limit 参数归一：默认 1000，硬上限 5000。
fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

/// # Summary
/// 同批次内去重 K 线：同一时间戳保留最后一条。
/// 单条 INSERT 不允许对同一主键二次赋值，交易所偶发在一帧内重发同根 K 线。
fn dedup_candles(rows: &[Candle]) -> Vec<Candle> {
    let mut by_time: BTreeMap<DateTime<Utc>, Candle> = BTreeMap::new();
    for row in rows {
        by_time.insert(row.time, row.clone());
    }
    by_time.into_values().collect()
}

/// # Summary
/// 同批次内按列合并资金费率重复行，与数据库侧 COALESCE 规则一致：
/// 后到行的存在列胜出，缺失列沿用先前值。
fn merge_funding(rows: &[FundingPoint]) -> Vec<FundingPoint> {
    let mut by_key: BTreeMap<(DateTime<Utc>, MarketId), FundingPoint> = BTreeMap::new();
    for row in rows {
        by_key
            .entry((row.time, row.market_id))
            .and_modify(|held| {
                held.funding_rate = row.funding_rate.or(held.funding_rate);
                held.premium = row.premium.or(held.premium);
                held.mark_price = row.mark_price.or(held.mark_price);
                held.index_price = row.index_price.or(held.index_price);
                held.oracle_price = row.oracle_price.or(held.oracle_price);
                held.mid_price = row.mid_price.or(held.mid_price);
                held.next_funding_time = row.next_funding_time.or(held.next_funding_time);
            })
            .or_insert_with(|| row.clone());
    }
    by_key.into_values().collect()
}

/// 同批次内按列合并未平仓量重复行，规则同 `merge_funding`。
fn merge_open_interest(rows: &[OpenInterestPoint]) -> Vec<OpenInterestPoint> {
    let mut by_key: BTreeMap<(DateTime<Utc>, MarketId), OpenInterestPoint> = BTreeMap::new();
    for row in rows {
        by_key
            .entry((row.time, row.market_id))
            .and_modify(|held| {
                held.open_interest = row.open_interest.or(held.open_interest);
                held.notional_value = row.notional_value.or(held.notional_value);
                held.day_base_volume = row.day_base_volume.or(held.day_base_volume);
                held.day_notional_volume = row.day_notional_volume.or(held.day_notional_volume);
            })
            .or_insert_with(|| row.clone());
    }
    by_key.into_values().collect()
}

#[async_trait]
impl TimeSeriesStore for PgTimeSeriesStore {
    /// # Summary
    /// 批量落库单一序列的 K 线。
    ///
    /// # Logic
    /// 1. 逐行校验 OHLC 不变量与分钟对齐，违反即放弃整批 (调用方缺陷)。
    /// 2. 批内按时间去重后整事务写入。
    async fn upsert_candles(
        &self,
        series_id: SeriesId,
        rows: &[Candle],
    ) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        for row in rows {
            row.validate().map_err(StoreError::Validation)?;
            if !is_minute_aligned(row.time) {
                return Err(StoreError::Validation(format!(
                    "candle time not minute aligned: {}",
                    row.time
                )));
            }
        }
        let deduped = dedup_candles(rows);
        self.run_with_retry("upsert_candles", async || {
            self.exec_upsert_candles(series_id, &deduped).await
        })
        .await
    }

    async fn upsert_funding(&self, rows: &[FundingPoint]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        for row in rows {
            if !is_minute_aligned(row.time) {
                return Err(StoreError::Validation(format!(
                    "funding time not minute aligned: {}",
                    row.time
                )));
            }
        }
        let merged = merge_funding(rows);
        self.run_with_retry("upsert_funding", async || {
            self.exec_upsert_funding(&merged).await
        })
        .await
    }

    async fn upsert_open_interest(
        &self,
        rows: &[OpenInterestPoint],
    ) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        for row in rows {
            if !is_minute_aligned(row.time) {
                return Err(StoreError::Validation(format!(
                    "open interest time not minute aligned: {}",
                    row.time
                )));
            }
        }
        let merged = merge_open_interest(rows);
        self.run_with_retry("upsert_open_interest", async || {
            self.exec_upsert_open_interest(&merged).await
        })
        .await
    }

    /// # Summary
    /// 区间读取 K 线，时间降序。
    async fn candle_range(
        &self,
        series_id: SeriesId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: Option<i64>,
    ) -> Result<Vec<Candle>, StoreError> {
        let rows = sqlx::query_as::<
            _,
            (
                DateTime<Utc>,
                Decimal,
                Decimal,
                Decimal,
                Decimal,
                Decimal,
                Option<i64>,
            ),
        >(
            "SELECT time, open, high, low, close, volume, trade_count \
             FROM candles \
             WHERE series_id = $1 AND time >= $2 AND time <= $3 \
             ORDER BY time DESC LIMIT $4",
        )
        .bind(series_id)
        .bind(start)
        .bind(end)
        .bind(clamp_limit(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(retry::classify)?;

        Ok(rows
            .into_iter()
            .map(|r| Candle {
                time: r.0,
                open: r.1,
                high: r.2,
                low: r.3,
                close: r.4,
                volume: r.5,
                trade_count: r.6,
            })
            .collect())
    }

    async fn funding_range(
        &self,
        market_id: MarketId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: Option<i64>,
    ) -> Result<Vec<FundingPoint>, StoreError> {
        let rows = sqlx::query_as::<
            _,
            (
                DateTime<Utc>,
                Option<Decimal>,
                Option<Decimal>,
                Option<Decimal>,
                Option<Decimal>,
                Option<Decimal>,
                Option<Decimal>,
                Option<DateTime<Utc>>,
            ),
        >(
            "SELECT time, funding_rate, premium, mark_price, index_price, \
             oracle_price, mid_price, next_funding_time \
             FROM funding \
             WHERE market_id = $1 AND time >= $2 AND time <= $3 \
             ORDER BY time DESC LIMIT $4",
        )
        .bind(market_id)
        .bind(start)
        .bind(end)
        .bind(clamp_limit(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(retry::classify)?;

        Ok(rows
            .into_iter()
            .map(|r| FundingPoint {
                time: r.0,
                market_id,
                funding_rate: r.1,
                premium: r.2,
                mark_price: r.3,
                index_price: r.4,
                oracle_price: r.5,
                mid_price: r.6,
                next_funding_time: r.7,
            })
            .collect())
    }

    async fn open_interest_range(
        &self,
        market_id: MarketId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: Option<i64>,
    ) -> Result<Vec<OpenInterestPoint>, StoreError> {
        let rows = sqlx::query_as::<
            _,
            (
                DateTime<Utc>,
                Option<Decimal>,
                Option<Decimal>,
                Option<Decimal>,
                Option<Decimal>,
            ),
        >(
            "SELECT time, open_interest, notional_value, day_base_volume, day_notional_volume \
             FROM open_interest \
             WHERE market_id = $1 AND time >= $2 AND time <= $3 \
             ORDER BY time DESC LIMIT $4",
        )
        .bind(market_id)
        .bind(start)
        .bind(end)
        .bind(clamp_limit(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(retry::classify)?;

        Ok(rows
            .into_iter()
            .map(|r| OpenInterestPoint {
                time: r.0,
                market_id,
                open_interest: r.1,
                notional_value: r.2,
                day_base_volume: r.3,
                day_notional_volume: r.4,
            })
            .collect())
    }

    async fn candle_at(
        &self,
        series_id: SeriesId,
        time: DateTime<Utc>,
    ) -> Result<Option<Candle>, StoreError> {
        let row = sqlx::query_as::<
            _,
            (
                DateTime<Utc>,
                Decimal,
                Decimal,
                Decimal,
                Decimal,
                Decimal,
                Option<i64>,
            ),
        >(
            "SELECT time, open, high, low, close, volume, trade_count \
             FROM candles WHERE series_id = $1 AND time = $2",
        )
        .bind(series_id)
        .bind(time)
        .fetch_optional(&self.pool)
        .await
        .map_err(retry::classify)?;

        Ok(row.map(|r| Candle {
            time: r.0,
            open: r.1,
            high: r.2,
            low: r.3,
            close: r.4,
            volume: r.5,
            trade_count: r.6,
        }))
    }

    async fn funding_at(
        &self,
        market_id: MarketId,
        time: DateTime<Utc>,
    ) -> Result<Option<FundingPoint>, StoreError> {
        let mut rows = self
            .funding_range(market_id, time, time, Some(1))
            .await?;
        Ok(rows.pop())
    }

    async fn open_interest_at(
        &self,
        market_id: MarketId,
        time: DateTime<Utc>,
    ) -> Result<Option<OpenInterestPoint>, StoreError> {
        let mut rows = self
            .open_interest_range(market_id, time, time, Some(1))
            .await?;
        Ok(rows.pop())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(retry::classify)
    }

    async fn latest_time(
        &self,
        kind: DataKind,
        key: i32,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let sql = match kind {
            DataKind::Candle => "SELECT MAX(time) FROM candles WHERE series_id = $1",
            DataKind::Funding => "SELECT MAX(time) FROM funding WHERE market_id = $1",
            DataKind::OpenInterest => {
                "SELECT MAX(time) FROM open_interest WHERE market_id = $1"
            }
        };
        sqlx::query_scalar::<_, Option<DateTime<Utc>>>(sql)
            .bind(key)
            .fetch_one(&self.pool)
            .await
            .map_err(retry::classify)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).expect("valid timestamp")
    }

    #[test]
    fn test_clamp_limit_bounds() {
        assert_eq!(clamp_limit(None), 1000);
        assert_eq!(clamp_limit(Some(10)), 10);
        assert_eq!(clamp_limit(Some(9000)), 5000);
        assert_eq!(clamp_limit(Some(0)), 1);
        assert_eq!(clamp_limit(Some(-5)), 1);
    }

    #[test]
    fn test_dedup_candles_keeps_last_per_time() {
        let a = Candle {
            time: ts(1_767_225_240),
            open: dec!(1),
            high: dec!(2),
            low: dec!(1),
            close: dec!(1.5),
            volume: dec!(10),
            trade_count: None,
        };
        let mut b = a.clone();
        b.close = dec!(1.8);
        let out = dedup_candles(&[a, b.clone()]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].close, b.close);
    }

    #[test]
    fn test_merge_funding_later_present_wins_missing_preserved() {
        let earlier = FundingPoint {
            time: ts(1_767_225_600),
            market_id: 3,
            funding_rate: Some(dec!(0.0001)),
            premium: Some(dec!(0.00005)),
            mark_price: Some(dec!(67300)),
            index_price: None,
            oracle_price: None,
            mid_price: None,
            next_funding_time: None,
        };
        let later = FundingPoint {
            funding_rate: Some(dec!(0.00012)),
            mark_price: None,
            ..earlier.clone()
        };
        let out = merge_funding(&[earlier, later]);
        assert_eq!(out.len(), 1);
        // 后到的存在列胜出
        assert_eq!(out[0].funding_rate, Some(dec!(0.00012)));
        // 后到的缺失列不覆盖
        assert_eq!(out[0].mark_price, Some(dec!(67300)));
    }

    #[test]
    fn test_merge_open_interest_distinct_keys_untouched() {
        let a = OpenInterestPoint {
            time: ts(1_767_225_600),
            market_id: 1,
            open_interest: Some(dec!(12345.67)),
            notional_value: None,
            day_base_volume: None,
            day_notional_volume: None,
        };
        let mut b = a.clone();
        b.market_id = 2;
        let out = merge_open_interest(&[a, b]);
        assert_eq!(out.len(), 2);
    }
}
