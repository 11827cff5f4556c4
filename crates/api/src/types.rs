//! # DTO (Data Transfer Object) 层
//!
//! 将内部领域模型转化为面向客户端 JSON 输出的轻量结构体。
//! 数值一律以字符串编码（定点十进制原样传递），时间戳为带 `+00:00`
//! 偏移的 ISO 8601。所有 DTO 派生 `utoipa::ToSchema` 进入 Swagger 文档。

use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use souba_core::market::entity::{Candle, FundingPoint, OpenInterestPoint, SeriesInfo};
use utoipa::ToSchema;

/// 统一时间戳渲染：秒级精度，UTC 偏移写作 +00:00。
pub fn format_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, false)
}

fn decimal_str(v: &Decimal) -> String {
    v.to_string()
}

fn opt_decimal_str(v: &Option<Decimal>) -> Option<String> {
    v.as_ref().map(Decimal::to_string)
}

// ============================================================
//  响应信封
// ============================================================

/// 区间查询响应信封：数据 + 标识元数据。
#[derive(Debug, Serialize, ToSchema)]
pub struct RangeResponse<T: ToSchema> {
    pub data: Vec<T>,
    pub metadata: RangeMetadata,
}

/// 区间查询元数据
#[derive(Debug, Serialize, ToSchema)]
pub struct RangeMetadata {
    /// 交易所名
    #[schema(example = "hyperliquid")]
    pub exchange: String,
    /// 基础资产名
    #[schema(example = "BTC")]
    pub coin: String,
    /// 计价资产名
    #[schema(example = "USDC")]
    pub quote: String,
    /// 市场类型名
    #[schema(example = "perp")]
    pub market_type: String,
    /// 周期名 (仅 K 线查询)
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(example = "1m")]
    pub interval: Option<String>,
    /// 返回行数
    pub count: usize,
}

/// 统一错误响应体
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ApiErrorResponse {
    /// 稳定的错误码
    #[schema(example = "validation")]
    pub error: String,
    /// 人类可读信息
    pub message: String,
}

impl ApiErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: code.into(),
            message: message.into(),
        }
    }
}

// ============================================================
//  行情 DTO
// ============================================================

/// K 线 DTO
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CandleDto {
    /// 桶开始时间 (ISO 8601, +00:00)
    #[schema(example = "2026-03-01T12:34:00+00:00")]
    pub time: String,
    #[schema(example = "67500.00")]
    pub open: String,
    #[schema(example = "67510.25")]
    pub high: String,
    #[schema(example = "67490.10")]
    pub low: String,
    #[schema(example = "67508.75")]
    pub close: String,
    #[schema(example = "42.5")]
    pub volume: String,
    /// 成交笔数 (部分交易所提供)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trade_count: Option<i64>,
}

impl From<&Candle> for CandleDto {
    fn from(c: &Candle) -> Self {
        Self {
            time: format_time(c.time),
            open: decimal_str(&c.open),
            high: decimal_str(&c.high),
            low: decimal_str(&c.low),
            close: decimal_str(&c.close),
            volume: decimal_str(&c.volume),
            trade_count: c.trade_count,
        }
    }
}

/// 资金费率 DTO
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct FundingDto {
    #[schema(example = "2026-03-01T12:34:00+00:00")]
    pub time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(example = "0.0000125")]
    pub funding_rate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub premium: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mark_price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oracle_price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mid_price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_funding_time: Option<String>,
}

impl From<&FundingPoint> for FundingDto {
    fn from(p: &FundingPoint) -> Self {
        Self {
            time: format_time(p.time),
            funding_rate: opt_decimal_str(&p.funding_rate),
            premium: opt_decimal_str(&p.premium),
            mark_price: opt_decimal_str(&p.mark_price),
            index_price: opt_decimal_str(&p.index_price),
            oracle_price: opt_decimal_str(&p.oracle_price),
            mid_price: opt_decimal_str(&p.mid_price),
            next_funding_time: p.next_funding_time.map(format_time),
        }
    }
}

/// 未平仓量 DTO
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OpenInterestDto {
    #[schema(example = "2026-03-01T12:34:00+00:00")]
    pub time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(example = "12345.67")]
    pub open_interest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notional_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub day_base_volume: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub day_notional_volume: Option<String>,
}

impl From<&OpenInterestPoint> for OpenInterestDto {
    fn from(p: &OpenInterestPoint) -> Self {
        Self {
            time: format_time(p.time),
            open_interest: opt_decimal_str(&p.open_interest),
            notional_value: opt_decimal_str(&p.notional_value),
            day_base_volume: opt_decimal_str(&p.day_base_volume),
            day_notional_volume: opt_decimal_str(&p.day_notional_volume),
        }
    }
}

/// 序列枚举条目 DTO
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SeriesListingDto {
    /// 序列标识
    pub series_id: i32,
    /// 所属市场标识
    pub market_id: i32,
    #[schema(example = "hyperliquid")]
    pub exchange: String,
    #[schema(example = "BTC")]
    pub coin: String,
    #[schema(example = "USDC")]
    pub quote: String,
    #[schema(example = "perp")]
    pub market_type: String,
    #[schema(example = "1m")]
    pub interval: String,
    pub active: bool,
}

impl From<&SeriesInfo> for SeriesListingDto {
    fn from(s: &SeriesInfo) -> Self {
        Self {
            series_id: s.series_id,
            market_id: s.market_id,
            exchange: s.exchange.clone(),
            coin: s.coin.clone(),
            quote: s.quote.clone(),
            market_type: s.market_type.clone(),
            interval: s.interval.clone(),
            active: s.active,
        }
    }
}

/// 健康检查响应
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// "ok" 或 "degraded"
    #[schema(example = "ok")]
    pub status: String,
    /// 响应时刻
    pub timestamp: String,
    /// 数据库连通性
    #[schema(example = "ok")]
    pub database: String,
    /// 各采集器状态 (仅采集进程内非空)
    pub collectors: std::collections::HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_candle_dto_serializes_numbers_as_strings() {
        let candle = Candle {
            time: DateTime::from_timestamp(1_767_225_240, 0).expect("valid ts"),
            open: dec!(67500.00),
            high: dec!(67510.25),
            low: dec!(67490.10),
            close: dec!(67508.75),
            volume: dec!(42.5),
            trade_count: Some(218),
        };
        let dto = CandleDto::from(&candle);
        let json = serde_json::to_value(&dto).expect("serializes");
        assert_eq!(json["open"], "67500.00");
        assert_eq!(json["time"], "2025-12-31T23:54:00+00:00");
        assert_eq!(json["trade_count"], 218);
    }

    #[test]
    fn test_funding_dto_omits_missing_columns() {
        let point = FundingPoint {
            time: DateTime::from_timestamp(1_767_225_240, 0).expect("valid ts"),
            market_id: 1,
            funding_rate: Some(dec!(0.0001)),
            premium: None,
            mark_price: None,
            index_price: None,
            oracle_price: None,
            mid_price: None,
            next_funding_time: None,
        };
        let json = serde_json::to_value(FundingDto::from(&point)).expect("serializes");
        assert_eq!(json["funding_rate"], "0.0001");
        assert!(json.get("premium").is_none());
        assert!(json.get("mark_price").is_none());
    }
}
