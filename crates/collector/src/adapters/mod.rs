use souba_core::market::port::{ExchangeAdapter, HistorySource};
use std::sync::Arc;

pub mod binance;
pub mod hyperliquid;

/// # Summary
/// 按交易所规范名构造 WebSocket 适配器。
/// 受支持的交易所是编译期封闭集合；未知名称返回 None，调用方据此报配置错误。
pub fn adapter_for(exchange: &str) -> Option<Arc<dyn ExchangeAdapter>> {
    match exchange {
        hyperliquid::EXCHANGE_NAME => Some(Arc::new(hyperliquid::HyperliquidAdapter::new())),
        binance::EXCHANGE_NAME => Some(Arc::new(binance::BinanceAdapter::new())),
        _ => None,
    }
}

/// # Summary
/// 按交易所规范名构造历史 REST 源。
pub fn history_for(exchange: &str) -> Option<Arc<dyn HistorySource>> {
    match exchange {
        hyperliquid::EXCHANGE_NAME => Some(Arc::new(hyperliquid::HyperliquidHistory::new())),
        binance::EXCHANGE_NAME => Some(Arc::new(binance::BinanceHistory::new())),
        _ => None,
    }
}
