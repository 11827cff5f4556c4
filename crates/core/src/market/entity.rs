use crate::common::{MarketId, SeriesId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// # Summary
/// 单根 K 线数据实体，记录特定周期内的行情波动。
/// 所有价格与成交量使用定点十进制，浮点数禁止用于持久化数值。
///
/// # Invariants
/// - `high >= max(open, close, low)` 且 `low <= min(open, high, close)`。
/// - `open/high/low/close > 0`，`volume >= 0`。
/// - `time` 必须对齐到所属周期的起点。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    // K 线开始时间 (周期起点)
    pub time: DateTime<Utc>,
    // 开盘价
    pub open: Decimal,
    // 最高价
    pub high: Decimal,
    // 最低价
    pub low: Decimal,
    // 收盘价
    pub close: Decimal,
    // 成交量 (基础资产计)
    pub volume: Decimal,
    // 成交笔数 (部分交易所提供)
    pub trade_count: Option<i64>,
}

impl Candle {
    /// # Summary
    /// 校验 OHLC 不变量。
    ///
    /// # Logic
    /// 1. 价格必须全部为正，成交量非负。
    /// 2. high 不低于其余三价，low 不高于其余三价。
    /// 3. 违反即视为调用方缺陷，由存储网关丢弃整批并计数。
    ///
    /// # Returns
    /// 合法返回 Ok，否则返回描述首个违规项的信息。
    pub fn validate(&self) -> Result<(), String> {
        if self.open <= Decimal::ZERO
            || self.high <= Decimal::ZERO
            || self.low <= Decimal::ZERO
            || self.close <= Decimal::ZERO
        {
            return Err(format!("non-positive price in candle at {}", self.time));
        }
        if self.volume < Decimal::ZERO {
            return Err(format!("negative volume in candle at {}", self.time));
        }
        let body_max = self.open.max(self.close).max(self.low);
        let body_min = self.open.min(self.close).min(self.high);
        if self.high < body_max {
            return Err(format!("high below open/close/low at {}", self.time));
        }
        if self.low > body_min {
            return Err(format!("low above open/close/high at {}", self.time));
        }
        Ok(())
    }
}

/// # Summary
/// 资金费率瞬时报文载荷，由采集器或历史回补源产出。
/// 除来源必填字段外，任何列都可能缺失；缺失列在落库时不会覆盖既有值。
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FundingTick {
    // 当期资金费率
    pub funding_rate: Option<Decimal>,
    // 溢价指数
    pub premium: Option<Decimal>,
    // 标记价格
    pub mark_price: Option<Decimal>,
    // 指数价格
    pub index_price: Option<Decimal>,
    // 预言机价格
    pub oracle_price: Option<Decimal>,
    // 中间价
    pub mid_price: Option<Decimal>,
    // 下一次资金费结算时间
    pub next_funding_time: Option<DateTime<Utc>>,
}

/// # Summary
/// 分钟对齐后的资金费率持久化行。
///
/// # Invariants
/// - (time, market_id) 唯一；time 秒与亚秒为零。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FundingPoint {
    // 分钟对齐时间戳
    pub time: DateTime<Utc>,
    // 所属市场标识
    pub market_id: MarketId,
    pub funding_rate: Option<Decimal>,
    pub premium: Option<Decimal>,
    pub mark_price: Option<Decimal>,
    pub index_price: Option<Decimal>,
    pub oracle_price: Option<Decimal>,
    pub mid_price: Option<Decimal>,
    pub next_funding_time: Option<DateTime<Utc>>,
}

impl FundingPoint {
    /// 由瞬时载荷构造持久化行，时间戳由调用方给定（聚合边界或对齐后的历史时间）。
    pub fn from_tick(market_id: MarketId, time: DateTime<Utc>, tick: FundingTick) -> Self {
        Self {
            time,
            market_id,
            funding_rate: tick.funding_rate,
            premium: tick.premium,
            mark_price: tick.mark_price,
            index_price: tick.index_price,
            oracle_price: tick.oracle_price,
            mid_price: tick.mid_price,
            next_funding_time: tick.next_funding_time,
        }
    }
}

/// # Summary
/// 未平仓量瞬时报文载荷。
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OpenInterestTick {
    // 未平仓合约量 (基础资产计)
    pub open_interest: Option<Decimal>,
    // 未平仓名义价值
    pub notional_value: Option<Decimal>,
    // 24 小时基础成交量
    pub day_base_volume: Option<Decimal>,
    // 24 小时名义成交量
    pub day_notional_volume: Option<Decimal>,
}

/// # Summary
/// 分钟对齐后的未平仓量持久化行。
///
/// # Invariants
/// - (time, market_id) 唯一；time 秒与亚秒为零。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OpenInterestPoint {
    // 分钟对齐时间戳
    pub time: DateTime<Utc>,
    // 所属市场标识
    pub market_id: MarketId,
    pub open_interest: Option<Decimal>,
    pub notional_value: Option<Decimal>,
    pub day_base_volume: Option<Decimal>,
    pub day_notional_volume: Option<Decimal>,
}

impl OpenInterestPoint {
    /// 由瞬时载荷构造持久化行。
    pub fn from_tick(market_id: MarketId, time: DateTime<Utc>, tick: OpenInterestTick) -> Self {
        Self {
            time,
            market_id,
            open_interest: tick.open_interest,
            notional_value: tick.notional_value,
            day_base_volume: tick.day_base_volume,
            day_notional_volume: tick.day_notional_volume,
        }
    }
}

/// # Summary
/// 解析后的序列信息：内部标识加全部参照名称与周期秒数。
/// 解析器快照中的只读条目，供采集器与 API 层使用。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesInfo {
    // 序列标识
    pub series_id: SeriesId,
    // 所属市场标识 (与周期无关)
    pub market_id: MarketId,
    // 交易所名
    pub exchange: String,
    // 基础资产名
    pub coin: String,
    // 计价资产名
    pub quote: String,
    // 市场类型名
    pub market_type: String,
    // 周期名
    pub interval: String,
    // 每根 K 线的秒数
    pub interval_seconds: i64,
    // 是否处于采集状态
    pub active: bool,
}

/// # Summary
/// 解析后的市场信息，资金费率与未平仓量数据挂靠的键。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketInfo {
    // 市场标识
    pub market_id: MarketId,
    // 交易所名
    pub exchange: String,
    // 基础资产名
    pub coin: String,
    // 计价资产名
    pub quote: String,
    // 市场类型名
    pub market_type: String,
    // 是否处于采集状态
    pub active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn candle() -> Candle {
        Candle {
            time: DateTime::from_timestamp(1_767_225_240, 0).unwrap_or_else(Utc::now),
            open: dec!(67500.00),
            high: dec!(67510.25),
            low: dec!(67490.10),
            close: dec!(67508.75),
            volume: dec!(12.5),
            trade_count: Some(42),
        }
    }

    #[test]
    fn test_valid_candle_passes() {
        assert!(candle().validate().is_ok());
    }

    #[test]
    fn test_high_below_close_rejected() {
        let mut c = candle();
        c.high = dec!(67000);
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_low_above_open_rejected() {
        let mut c = candle();
        c.low = dec!(67505.0);
        c.open = dec!(67500.0);
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_zero_price_rejected() {
        let mut c = candle();
        c.open = Decimal::ZERO;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_negative_volume_rejected() {
        let mut c = candle();
        c.volume = dec!(-1);
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_point_from_tick_carries_all_columns() {
        let tick = FundingTick {
            funding_rate: Some(dec!(0.0001)),
            mark_price: Some(dec!(67300.00)),
            ..FundingTick::default()
        };
        let time = DateTime::from_timestamp(1_767_225_600, 0).unwrap_or_else(Utc::now);
        let point = FundingPoint::from_tick(7, time, tick);
        assert_eq!(point.market_id, 7);
        assert_eq!(point.funding_rate, Some(dec!(0.0001)));
        assert_eq!(point.premium, None);
        assert_eq!(point.mark_price, Some(dec!(67300.00)));
    }
}
