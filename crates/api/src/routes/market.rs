use crate::error::ApiError;
use crate::server::AppState;
use crate::types::{CandleDto, FundingDto, OpenInterestDto, RangeMetadata, RangeResponse};
use axum::Json;
use axum::extract::{Path, Query, State};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use souba_core::common::{MarketKey, SeriesKey};
use utoipa::ToSchema;

/// 区间查询参数。时间接受 RFC3339 或 Unix 秒；缺省覆盖全部历史。
#[derive(Debug, Deserialize, ToSchema)]
pub struct RangeQuery {
    /// 起始时间 (RFC3339 或 Unix 秒，含)
    pub start_time: Option<String>,
    /// 截止时间 (RFC3339 或 Unix 秒，含)
    pub end_time: Option<String>,
    /// 行数上限 (默认 1000，上限 5000)
    pub limit: Option<i64>,
}

/// 解析时间参数：RFC3339 优先，失败后按 Unix 秒解释。
fn parse_time(raw: &str) -> Result<DateTime<Utc>, ApiError> {
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Ok(t.with_timezone(&Utc));
    }
    raw.parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .ok_or_else(|| ApiError::BadRequest(format!("unparseable time: '{}'", raw)))
}

/// 把查询参数归一为 [start, end] 闭区间。
fn resolve_window(query: &RangeQuery) -> Result<(DateTime<Utc>, DateTime<Utc>), ApiError> {
    let start = match &query.start_time {
        Some(raw) => parse_time(raw)?,
        None => DateTime::<Utc>::UNIX_EPOCH,
    };
    let end = match &query.end_time {
        Some(raw) => parse_time(raw)?,
        None => Utc::now(),
    };
    if start > end {
        return Err(ApiError::BadRequest(
            "start_time must not exceed end_time".to_string(),
        ));
    }
    Ok((start, end))
}

/// 获取历史 K 线
///
/// 按 (交易所, 基础资产, 计价资产, 市场类型, 周期) 标识查询区间 K 线，
/// 返回时间降序。
#[utoipa::path(
    get,
    path = "/api/v1/candles/{exchange}/{coin}/{quote}/{market_type}/{interval}",
    tag = "行情 (Market)",
    params(
        ("exchange" = String, Path, description = "交易所名"),
        ("coin" = String, Path, description = "基础资产名"),
        ("quote" = String, Path, description = "计价资产名"),
        ("market_type" = String, Path, description = "市场类型名"),
        ("interval" = String, Path, description = "周期名 (e.g. 1m, 1h)"),
        ("start_time" = Option<String>, Query, description = "RFC3339 或 Unix 秒"),
        ("end_time" = Option<String>, Query, description = "RFC3339 或 Unix 秒"),
        ("limit" = Option<i64>, Query, description = "默认 1000，上限 5000")
    ),
    responses(
        (status = 200, description = "查询成功", body = RangeResponse<CandleDto>),
        (status = 400, description = "参数无效"),
        (status = 404, description = "标识无法解析"),
        (status = 503, description = "依赖暂时不可用")
    )
)]
pub async fn get_candles(
    State(state): State<AppState>,
    Path((exchange, coin, quote, market_type, interval)): Path<(
        String,
        String,
        String,
        String,
        String,
    )>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<RangeResponse<CandleDto>>, ApiError> {
    let key = SeriesKey {
        exchange,
        coin,
        quote,
        market_type,
        interval,
    };
    let series = state.resolver.resolve_series(&key)?;
    let (start, end) = resolve_window(&query)?;

    let rows = state
        .store
        .candle_range(series.series_id, start, end, query.limit)
        .await?;

    Ok(Json(RangeResponse {
        metadata: RangeMetadata {
            exchange: series.exchange,
            coin: series.coin,
            quote: series.quote,
            market_type: series.market_type,
            interval: Some(series.interval),
            count: rows.len(),
        },
        data: rows.iter().map(Into::into).collect(),
    }))
}

/// 获取历史资金费率
///
/// 按市场标识查询区间资金费率点，返回时间降序。缺失列不出现在响应中。
#[utoipa::path(
    get,
    path = "/api/v1/funding/{exchange}/{coin}/{quote}/{market_type}",
    tag = "行情 (Market)",
    params(
        ("exchange" = String, Path, description = "交易所名"),
        ("coin" = String, Path, description = "基础资产名"),
        ("quote" = String, Path, description = "计价资产名"),
        ("market_type" = String, Path, description = "市场类型名"),
        ("start_time" = Option<String>, Query, description = "RFC3339 或 Unix 秒"),
        ("end_time" = Option<String>, Query, description = "RFC3339 或 Unix 秒"),
        ("limit" = Option<i64>, Query, description = "默认 1000，上限 5000")
    ),
    responses(
        (status = 200, description = "查询成功", body = RangeResponse<FundingDto>),
        (status = 400, description = "参数无效"),
        (status = 404, description = "标识无法解析")
    )
)]
pub async fn get_funding(
    State(state): State<AppState>,
    Path((exchange, coin, quote, market_type)): Path<(String, String, String, String)>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<RangeResponse<FundingDto>>, ApiError> {
    let key = MarketKey {
        exchange,
        coin,
        quote,
        market_type,
    };
    let market = state.resolver.resolve_market(&key)?;
    let (start, end) = resolve_window(&query)?;

    let rows = state
        .store
        .funding_range(market.market_id, start, end, query.limit)
        .await?;

    Ok(Json(RangeResponse {
        metadata: RangeMetadata {
            exchange: market.exchange,
            coin: market.coin,
            quote: market.quote,
            market_type: market.market_type,
            interval: None,
            count: rows.len(),
        },
        data: rows.iter().map(Into::into).collect(),
    }))
}

/// 获取历史未平仓量
///
/// 按市场标识查询区间未平仓量点，返回时间降序。
#[utoipa::path(
    get,
    path = "/api/v1/open-interest/{exchange}/{coin}/{quote}/{market_type}",
    tag = "行情 (Market)",
    params(
        ("exchange" = String, Path, description = "交易所名"),
        ("coin" = String, Path, description = "基础资产名"),
        ("quote" = String, Path, description = "计价资产名"),
        ("market_type" = String, Path, description = "市场类型名"),
        ("start_time" = Option<String>, Query, description = "RFC3339 或 Unix 秒"),
        ("end_time" = Option<String>, Query, description = "RFC3339 或 Unix 秒"),
        ("limit" = Option<i64>, Query, description = "默认 1000，上限 5000")
    ),
    responses(
        (status = 200, description = "查询成功", body = RangeResponse<OpenInterestDto>),
        (status = 400, description = "参数无效"),
        (status = 404, description = "标识无法解析")
    )
)]
pub async fn get_open_interest(
    State(state): State<AppState>,
    Path((exchange, coin, quote, market_type)): Path<(String, String, String, String)>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<RangeResponse<OpenInterestDto>>, ApiError> {
    let key = MarketKey {
        exchange,
        coin,
        quote,
        market_type,
    };
    let market = state.resolver.resolve_market(&key)?;
    let (start, end) = resolve_window(&query)?;

    let rows = state
        .store
        .open_interest_range(market.market_id, start, end, query.limit)
        .await?;

    Ok(Json(RangeResponse {
        metadata: RangeMetadata {
            exchange: market.exchange,
            coin: market.coin,
            quote: market.quote,
            market_type: market.market_type,
            interval: None,
            count: rows.len(),
        },
        data: rows.iter().map(Into::into).collect(),
    }))
}
