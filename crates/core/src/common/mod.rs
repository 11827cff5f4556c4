use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod time;

/// 序列标识符的数据库内部表示（稠密小整数）。
pub type SeriesId = i32;

/// 市场标识符的数据库内部表示（稠密小整数）。
pub type MarketId = i32;

/// # Summary
/// 时序数据种类枚举，对应三张时序表及各自的通知通道。
///
/// # Invariants
/// - `Candle` 以 SeriesId 为键，`Funding` 与 `OpenInterest` 以 MarketId 为键。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    // K 线 (OHLCV)
    Candle,
    // 资金费率
    Funding,
    // 未平仓合约量
    OpenInterest,
}

impl DataKind {
    /// # Summary
    /// 返回该数据种类对应的数据库通知通道名。
    ///
    /// # Logic
    /// 1. 通道名为固定常量，迁移脚本中的触发器与监听端必须使用同一组值。
    ///
    /// # Returns
    /// 通道名静态字符串。
    pub fn channel(&self) -> &'static str {
        match self {
            DataKind::Candle => "souba_candle",
            DataKind::Funding => "souba_funding",
            DataKind::OpenInterest => "souba_oi",
        }
    }

    /// # Summary
    /// 从通道名反查数据种类。
    ///
    /// # Arguments
    /// * `channel`: 通知通道名。
    ///
    /// # Returns
    /// 匹配则返回对应种类，否则返回 None。
    pub fn from_channel(channel: &str) -> Option<Self> {
        match channel {
            "souba_candle" => Some(DataKind::Candle),
            "souba_funding" => Some(DataKind::Funding),
            "souba_oi" => Some(DataKind::OpenInterest),
            _ => None,
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataKind::Candle => write!(f, "candle"),
            DataKind::Funding => write!(f, "funding"),
            DataKind::OpenInterest => write!(f, "oi"),
        }
    }
}

impl FromStr for DataKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "candle" | "candles" => Ok(DataKind::Candle),
            "funding" => Ok(DataKind::Funding),
            "oi" | "open_interest" | "open-interest" => Ok(DataKind::OpenInterest),
            _ => Err(format!("Unknown data kind: {}", s)),
        }
    }
}

/// # Summary
/// 市场标识元组：与周期无关的序列键，资金费率与未平仓量挂靠于此。
///
/// # Invariants
/// - (exchange, coin, quote, market_type) 组合在参照表中唯一。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MarketKey {
    // 交易所名 (例如: hyperliquid)
    pub exchange: String,
    // 基础资产 (例如: BTC)
    pub coin: String,
    // 计价资产 (例如: USDC)
    pub quote: String,
    // 市场类型 (例如: perp)
    pub market_type: String,
}

/// # Summary
/// 序列标识元组：K 线的唯一键，在市场键基础上增加周期维度。
///
/// # Invariants
/// - 每个序列键在参照表中恰好解析到一个市场键，该映射在配置同步后不再改写。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SeriesKey {
    // 交易所名
    pub exchange: String,
    // 基础资产
    pub coin: String,
    // 计价资产
    pub quote: String,
    // 市场类型
    pub market_type: String,
    // K 线周期名 (例如: 1m, 1h)
    pub interval: String,
}

impl SeriesKey {
    /// # Summary
    /// 剥离周期维度，得到该序列所属的市场键。
    ///
    /// # Returns
    /// 对应的 MarketKey。
    pub fn market(&self) -> MarketKey {
        MarketKey {
            exchange: self.exchange.clone(),
            coin: self.coin.clone(),
            quote: self.quote.clone(),
            market_type: self.market_type.clone(),
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}",
            self.exchange, self.coin, self.quote, self.market_type, self.interval
        )
    }
}

impl fmt::Display for MarketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.exchange, self.coin, self.quote, self.market_type
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_kind_channel_roundtrip() {
        for kind in [DataKind::Candle, DataKind::Funding, DataKind::OpenInterest] {
            assert_eq!(DataKind::from_channel(kind.channel()), Some(kind));
        }
        assert_eq!(DataKind::from_channel("souba_trades"), None);
    }

    #[test]
    fn test_data_kind_from_str() {
        assert_eq!("candles".parse::<DataKind>(), Ok(DataKind::Candle));
        assert_eq!("open-interest".parse::<DataKind>(), Ok(DataKind::OpenInterest));
        assert!("depth".parse::<DataKind>().is_err());
    }

    #[test]
    fn test_series_key_strips_interval() {
        let series = SeriesKey {
            exchange: "hyperliquid".into(),
            coin: "BTC".into(),
            quote: "USDC".into(),
            market_type: "perp".into(),
            interval: "1m".into(),
        };
        let market = series.market();
        assert_eq!(market.exchange, "hyperliquid");
        assert_eq!(market.to_string(), "hyperliquid/BTC/USDC/perp");
        assert_eq!(series.to_string(), "hyperliquid/BTC/USDC/perp/1m");
    }
}
