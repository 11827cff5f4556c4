use chrono::Utc;
use souba_core::common::DataKind;
use souba_core::store::error::StoreError;
use souba_core::store::port::{SeriesFilter, SeriesResolver, StalenessEntry, TimeSeriesStore};
use std::sync::Arc;

/// # Summary
/// 为全部活跃键生成陈旧度报告，供回补窗口决策。
///
/// # Logic
/// 1. 活跃序列逐一查询 K 线最新行时间。
/// 2. 活跃市场逐一查询资金费率与未平仓量最新行时间。
/// 3. 无任何行的键 latest 为 None（从未采集，而非停机）。
///
/// # Arguments
/// * `store`: 存储网关。
/// * `resolver`: 参照解析器。
/// * `filter`: 键筛选条件。
///
/// # Returns
/// 按种类与键排序的陈旧度条目列表。
pub async fn staleness_report(
    store: &Arc<dyn TimeSeriesStore>,
    resolver: &Arc<dyn SeriesResolver>,
    filter: &SeriesFilter,
) -> Result<Vec<StalenessEntry>, StoreError> {
    let now = Utc::now();
    let mut entries = Vec::new();

    for series in resolver.active_series(filter) {
        let latest = store.latest_time(DataKind::Candle, series.series_id).await?;
        entries.push(StalenessEntry {
            kind: DataKind::Candle,
            key: series.series_id,
            label: format!(
                "{}/{}/{}/{}/{}",
                series.exchange, series.coin, series.quote, series.market_type, series.interval
            ),
            latest,
            age_seconds: latest.map(|t| (now - t).num_seconds()),
        });
    }

    for market in resolver.active_markets(filter) {
        let label = format!(
            "{}/{}/{}/{}",
            market.exchange, market.coin, market.quote, market.market_type
        );
        for kind in [DataKind::Funding, DataKind::OpenInterest] {
            let latest = store.latest_time(kind, market.market_id).await?;
            entries.push(StalenessEntry {
                kind,
                key: market.market_id,
                label: label.clone(),
                latest,
                age_seconds: latest.map(|t| (now - t).num_seconds()),
            });
        }
    }

    Ok(entries)
}
