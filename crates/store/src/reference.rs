use async_trait::async_trait;
use souba_core::common::{MarketId, MarketKey, SeriesId, SeriesKey};
use souba_core::config::{IntervalEntry, NamedEntry, ReferenceDoc};
use souba_core::market::entity::{MarketInfo, SeriesInfo};
use souba_core::store::error::StoreError;
use souba_core::store::port::{SeriesFilter, SeriesResolver};
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::info;

/// # Summary
/// 一次参照同步的行计数汇总，供 CLI 输出。
#[derive(Debug, Default, Clone, Copy)]
pub struct SyncReport {
    pub exchanges: usize,
    pub coins: usize,
    pub quotes: usize,
    pub market_types: usize,
    pub intervals: usize,
    pub markets: usize,
    pub series: usize,
}

/// # Summary
/// 将声明式参照文档同步进参照表。
///
/// # Logic
/// 1. 单事务执行：按名称插入或更新（display_name、active），永不删除。
/// 2. 序列条目先解析各组件名到 id，未知名称即校验错误并回滚。
/// 3. 市场行与序列行同样按唯一键 upsert；series → market 映射一经建立不再改写。
///
/// # Arguments
/// * `pool`: 连接池。
/// * `doc`: 解析后的参照配置文档。
///
/// # Returns
/// 各表受影响的行计数。
pub async fn sync_reference(pool: &PgPool, doc: &ReferenceDoc) -> Result<SyncReport, StoreError> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
    let mut report = SyncReport::default();

    report.exchanges = upsert_named(&mut tx, "exchanges", &doc.exchanges).await?;
    report.coins = upsert_named(&mut tx, "coins", &doc.coins).await?;
    report.quotes = upsert_named(&mut tx, "quotes", &doc.quotes).await?;
    report.market_types = upsert_named(&mut tx, "market_types", &doc.market_types).await?;
    report.intervals = upsert_intervals(&mut tx, &doc.intervals).await?;

    for entry in &doc.series {
        let exchange_id = lookup_id(&mut tx, "exchanges", &entry.exchange).await?;
        let coin_id = lookup_id(&mut tx, "coins", &entry.coin).await?;
        let quote_id = lookup_id(&mut tx, "quotes", &entry.quote).await?;
        let market_type_id = lookup_id(&mut tx, "market_types", &entry.market_type).await?;

        let market_id = sqlx::query_scalar::<_, i32>(
            "INSERT INTO markets (exchange_id, coin_id, quote_id, market_type_id, active) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (exchange_id, coin_id, quote_id, market_type_id) \
             DO UPDATE SET active = EXCLUDED.active \
             RETURNING id",
        )
        .bind(exchange_id)
        .bind(coin_id)
        .bind(quote_id)
        .bind(market_type_id)
        .bind(entry.active)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        report.markets += 1;

        for interval in &entry.intervals {
            let interval_id = lookup_id(&mut tx, "intervals", interval).await?;
            sqlx::query(
                "INSERT INTO series (market_id, interval_id, active) VALUES ($1, $2, $3) \
                 ON CONFLICT (market_id, interval_id) DO UPDATE SET active = EXCLUDED.active",
            )
            .bind(market_id)
            .bind(interval_id)
            .bind(entry.active)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
            report.series += 1;
        }
    }

    tx.commit()
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
    info!(
        markets = report.markets,
        series = report.series,
        "reference sync committed"
    );
    Ok(report)
}

/// 通用参照实体 upsert：名称唯一键，更新展示名与启用位。
async fn upsert_named(
    tx: &mut Transaction<'_, Postgres>,
    table: &str,
    entries: &[NamedEntry],
) -> Result<usize, StoreError> {
    for entry in entries {
        let display = entry.display_name.clone().unwrap_or_else(|| entry.name.clone());
        let sql = format!(
            "INSERT INTO {} (name, display_name, active) VALUES ($1, $2, $3) \
             ON CONFLICT (name) DO UPDATE SET \
             display_name = EXCLUDED.display_name, active = EXCLUDED.active",
            table
        );
        sqlx::query(&sql)
            .bind(&entry.name)
            .bind(&display)
            .bind(entry.active)
            .execute(&mut **tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
    }
    Ok(entries.len())
}

async fn upsert_intervals(
    tx: &mut Transaction<'_, Postgres>,
    entries: &[IntervalEntry],
) -> Result<usize, StoreError> {
    for entry in entries {
        if entry.seconds <= 0 {
            return Err(StoreError::Validation(format!(
                "interval '{}' has non-positive seconds",
                entry.name
            )));
        }
        sqlx::query(
            "INSERT INTO intervals (name, seconds, active) VALUES ($1, $2, $3) \
             ON CONFLICT (name) DO UPDATE SET \
             seconds = EXCLUDED.seconds, active = EXCLUDED.active",
        )
        .bind(&entry.name)
        .bind(entry.seconds)
        .bind(entry.active)
        .execute(&mut **tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
    }
    Ok(entries.len())
}

/// 按名称解析参照实体 id，未知名称视为配置缺陷。
async fn lookup_id(
    tx: &mut Transaction<'_, Postgres>,
    table: &str,
    name: &str,
) -> Result<i32, StoreError> {
    let sql = format!("SELECT id FROM {} WHERE name = $1", table);
    sqlx::query_scalar::<_, i32>(&sql)
        .bind(name)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
        .ok_or_else(|| {
            StoreError::Validation(format!("unknown {} name: '{}'", table, name))
        })
}

// ============================================================
//  解析器快照
// ============================================================

/// 不可变解析快照：一次加载，整体替换。
struct Snapshot {
    series_by_key: HashMap<SeriesKey, SeriesInfo>,
    market_by_key: HashMap<MarketKey, MarketInfo>,
    series_by_id: HashMap<SeriesId, SeriesInfo>,
    market_by_id: HashMap<MarketId, MarketInfo>,
}

impl Snapshot {
    fn empty() -> Self {
        Self {
            series_by_key: HashMap::new(),
            market_by_key: HashMap::new(),
            series_by_id: HashMap::new(),
            market_by_id: HashMap::new(),
        }
    }
}

/// # Summary
/// SeriesResolver 的 Postgres 实现：启动时加载参照表到进程内快照，
/// `refresh` 重新加载并原子替换。
///
/// # Invariants
/// - 读路径只摸快照，不触数据库。
/// - 写时复制：读者看到旧快照或新快照的整体，绝无混合视图。
pub struct PgSeriesResolver {
    pool: PgPool,
    snapshot: RwLock<Arc<Snapshot>>,
}

impl PgSeriesResolver {
    /// # Summary
    /// 构造并完成首次快照加载。
    pub async fn load(pool: PgPool) -> Result<Arc<Self>, StoreError> {
        let resolver = Arc::new(Self {
            pool,
            snapshot: RwLock::new(Arc::new(Snapshot::empty())),
        });
        resolver.refresh().await?;
        Ok(resolver)
    }

    fn current(&self) -> Arc<Snapshot> {
        // 锁只保护指针替换，读侧立即克隆 Arc 后释放
        match self.snapshot.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    async fn load_snapshot(&self) -> Result<Snapshot, StoreError> {
        let market_rows = sqlx::query_as::<_, (i32, String, String, String, String, bool)>(
            "SELECT m.id, e.name, c.name, q.name, mt.name, \
                    (m.active AND e.active AND c.active AND q.active AND mt.active) \
             FROM markets m \
             JOIN exchanges e ON e.id = m.exchange_id \
             JOIN coins c ON c.id = m.coin_id \
             JOIN quotes q ON q.id = m.quote_id \
             JOIN market_types mt ON mt.id = m.market_type_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        let series_rows = sqlx::query_as::<_, (i32, i32, String, i64, bool)>(
            "SELECT s.id, s.market_id, i.name, i.seconds, (s.active AND i.active) \
             FROM series s \
             JOIN intervals i ON i.id = s.interval_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        let mut snapshot = Snapshot::empty();
        for (id, exchange, coin, quote, market_type, active) in market_rows {
            let info = MarketInfo {
                market_id: id,
                exchange,
                coin,
                quote,
                market_type,
                active,
            };
            snapshot.market_by_key.insert(
                MarketKey {
                    exchange: info.exchange.clone(),
                    coin: info.coin.clone(),
                    quote: info.quote.clone(),
                    market_type: info.market_type.clone(),
                },
                info.clone(),
            );
            snapshot.market_by_id.insert(id, info);
        }

        for (id, market_id, interval, seconds, series_active) in series_rows {
            let Some(market) = snapshot.market_by_id.get(&market_id) else {
                // 序列指向未知市场，属迁移缺陷；跳过而非加载坏映射
                continue;
            };
            let info = SeriesInfo {
                series_id: id,
                market_id,
                exchange: market.exchange.clone(),
                coin: market.coin.clone(),
                quote: market.quote.clone(),
                market_type: market.market_type.clone(),
                interval: interval.clone(),
                interval_seconds: seconds,
                active: series_active && market.active,
            };
            snapshot.series_by_key.insert(
                SeriesKey {
                    exchange: info.exchange.clone(),
                    coin: info.coin.clone(),
                    quote: info.quote.clone(),
                    market_type: info.market_type.clone(),
                    interval,
                },
                info.clone(),
            );
            snapshot.series_by_id.insert(id, info);
        }

        Ok(snapshot)
    }
}

#[async_trait]
impl SeriesResolver for PgSeriesResolver {
    fn resolve_series(&self, key: &SeriesKey) -> Result<SeriesInfo, StoreError> {
        self.current()
            .series_by_key
            .get(key)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn resolve_market(&self, key: &MarketKey) -> Result<MarketInfo, StoreError> {
        self.current()
            .market_by_key
            .get(key)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn series_by_id(&self, id: SeriesId) -> Option<SeriesInfo> {
        self.current().series_by_id.get(&id).cloned()
    }

    fn market_by_id(&self, id: MarketId) -> Option<MarketInfo> {
        self.current().market_by_id.get(&id).cloned()
    }

    fn active_series(&self, filter: &SeriesFilter) -> Vec<SeriesInfo> {
        let snapshot = self.current();
        let mut out: Vec<SeriesInfo> = snapshot
            .series_by_id
            .values()
            .filter(|s| s.active)
            .filter(|s| filter.exchange.as_deref().is_none_or(|e| s.exchange == e))
            .filter(|s| filter.coin.as_deref().is_none_or(|c| s.coin == c))
            .cloned()
            .collect();
        out.sort_by_key(|s| s.series_id);
        out
    }

    fn all_series(&self) -> Vec<SeriesInfo> {
        let snapshot = self.current();
        let mut out: Vec<SeriesInfo> = snapshot.series_by_id.values().cloned().collect();
        out.sort_by_key(|s| s.series_id);
        out
    }

    fn active_markets(&self, filter: &SeriesFilter) -> Vec<MarketInfo> {
        let snapshot = self.current();
        let mut out: Vec<MarketInfo> = snapshot
            .market_by_id
            .values()
            .filter(|m| m.active)
            .filter(|m| filter.exchange.as_deref().is_none_or(|e| m.exchange == e))
            .filter(|m| filter.coin.as_deref().is_none_or(|c| m.coin == c))
            .cloned()
            .collect();
        out.sort_by_key(|m| m.market_id);
        out
    }

    /// # Summary
    /// 重新加载参照表并整体替换快照。幂等，与并发读互不阻塞。
    async fn refresh(&self) -> Result<(), StoreError> {
        let fresh = self.load_snapshot().await?;
        let count = fresh.series_by_id.len();
        match self.snapshot.write() {
            Ok(mut guard) => *guard = Arc::new(fresh),
            Err(poisoned) => *poisoned.into_inner() = Arc::new(fresh),
        }
        info!(series = count, "resolver snapshot refreshed");
        Ok(())
    }
}
