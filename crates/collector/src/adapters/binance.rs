use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use souba_core::common::DataKind;
use souba_core::market::entity::{Candle, FundingTick};
use souba_core::market::error::FeedError;
use souba_core::market::port::{ExchangeAdapter, FeedEvent, HistorySource, SubscribePlan};
use std::collections::HashMap;
use std::time::Duration;

pub const EXCHANGE_NAME: &str = "binance";

const WS_URL: &str = "wss://fstream.binance.com/stream";
const REST_URL: &str = "https://fapi.binance.com";

/// Binance 合约 klines 单次请求行数上限（本采集器侧）。
const PAGE_LIMIT: usize = 1000;

fn ms_to_utc(ms: i64) -> Result<DateTime<Utc>, FeedError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| FeedError::Parse(format!("timestamp out of range: {}", ms)))
}

// ============================================================
//  入站帧形状
// ============================================================

/// 组合流外层：{"stream": "...", "data": {...}}；订阅确认为 {"result": null, "id": n}。
#[derive(Deserialize)]
struct WsEnvelope {
    #[serde(default)]
    stream: Option<String>,
    #[serde(default)]
    data: Option<serde_json::Value>,
    #[serde(default)]
    id: Option<i64>,
}

/// 事件内层判别。
#[derive(Deserialize)]
struct WsEventHead {
    /// 事件类型 ("kline" / "markPriceUpdate")
    e: String,
}

#[derive(Deserialize)]
struct WsKlineEvent {
    /// 交易对符号 (大写)
    s: String,
    k: WsKline,
}

#[derive(Deserialize)]
struct WsKline {
    /// 桶开始时间 (ms)
    t: i64,
    /// 周期标签
    i: String,
    o: Decimal,
    h: Decimal,
    l: Decimal,
    c: Decimal,
    v: Decimal,
    /// 成交笔数
    n: Option<i64>,
}

/// markPrice 流：资金费率、标记价与指数价合并推送。
#[derive(Deserialize)]
struct WsMarkPriceEvent {
    /// 事件时间 (ms)
    #[serde(rename = "E")]
    event_time: i64,
    /// 交易对符号 (大写)
    s: String,
    /// 标记价格
    p: Option<Decimal>,
    /// 指数价格
    i: Option<Decimal>,
    /// 资金费率
    r: Option<Decimal>,
    /// 下一次资金费结算时间 (ms)
    #[serde(rename = "T")]
    next_funding: Option<i64>,
}

// ============================================================
//  WebSocket 适配器
// ============================================================

/// # Summary
/// Binance USD-M 合约 WebSocket 适配器。
/// K 线订阅 `<symbol>@kline_<interval>`，资金数据订阅 `<symbol>@markPrice`。
///
/// # Invariants
/// - 交易对以 USDT 标注；配置中的 USD 计价经固定别名映射，仅改名不换算。
/// - Binance 无未平仓量推送流，本适配器不产出 OpenInterest 事件。
pub struct BinanceAdapter {
    ws_url: String,
    // 内部计价名 -> 交易所侧标注 (固定别名)
    quote_aliases: HashMap<String, String>,
}

impl BinanceAdapter {
    pub fn new() -> Self {
        let mut quote_aliases = HashMap::new();
        quote_aliases.insert("USD".to_string(), "USDT".to_string());
        Self {
            ws_url: WS_URL.to_string(),
            quote_aliases,
        }
    }

    /// 测试与镜像部署用：覆盖 WebSocket 入口地址。
    pub fn with_ws_url(mut self, url: impl Into<String>) -> Self {
        self.ws_url = url.into();
        self
    }

    fn quote_label(&self, quote: &str) -> String {
        self.quote_aliases
            .get(quote)
            .cloned()
            .unwrap_or_else(|| quote.to_string())
    }
}

impl Default for BinanceAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ExchangeAdapter for BinanceAdapter {
    fn name(&self) -> &'static str {
        EXCHANGE_NAME
    }

    fn ws_url(&self) -> &str {
        &self.ws_url
    }

    fn market_label(&self, coin: &str, quote: &str) -> String {
        format!("{}{}", coin, self.quote_label(quote)).to_uppercase()
    }

    /// # Summary
    /// 构造一条 SUBSCRIBE 帧覆盖全部流。
    fn subscribe_frames(&self, plan: &SubscribePlan) -> Vec<String> {
        let mut params = Vec::with_capacity(plan.candles.len() + plan.markets.len());
        for (symbol, interval) in &plan.candles {
            params.push(format!("{}@kline_{}", symbol.to_lowercase(), interval));
        }
        for symbol in &plan.markets {
            params.push(format!("{}@markPrice", symbol.to_lowercase()));
        }
        if params.is_empty() {
            return Vec::new();
        }
        vec![
            json!({ "method": "SUBSCRIBE", "params": params, "id": 1 }).to_string(),
        ]
    }

    /// # Summary
    /// 解析一条入站帧。
    ///
    /// # Logic
    /// 1. 带 id 无 stream 的帧是订阅确认。
    /// 2. kline 事件产出 K 线（含成形中的桶，重复落库由整列覆盖收敛）。
    /// 3. markPriceUpdate 事件产出资金费率载荷，时间取事件时间。
    fn parse_frame(&self, raw: &str) -> Result<Vec<FeedEvent>, FeedError> {
        let envelope: WsEnvelope =
            serde_json::from_str(raw).map_err(|e| FeedError::Parse(e.to_string()))?;

        let Some(data) = envelope.data else {
            if envelope.id.is_some() {
                return Ok(vec![FeedEvent::SubscriptionAck]);
            }
            return Err(FeedError::Parse("frame without data or id".to_string()));
        };
        if envelope.stream.is_none() {
            return Err(FeedError::Parse("data frame without stream tag".to_string()));
        }

        let head: WsEventHead = serde_json::from_value(data.clone())
            .map_err(|e| FeedError::Parse(e.to_string()))?;

        match head.e.as_str() {
            "kline" => {
                let event: WsKlineEvent = serde_json::from_value(data)
                    .map_err(|e| FeedError::Parse(e.to_string()))?;
                Ok(vec![FeedEvent::Candle {
                    coin: event.s.clone(),
                    interval: event.k.i.clone(),
                    candle: Candle {
                        time: ms_to_utc(event.k.t)?,
                        open: event.k.o,
                        high: event.k.h,
                        low: event.k.l,
                        close: event.k.c,
                        volume: event.k.v,
                        trade_count: event.k.n,
                    },
                }])
            }
            "markPriceUpdate" => {
                let event: WsMarkPriceEvent = serde_json::from_value(data)
                    .map_err(|e| FeedError::Parse(e.to_string()))?;
                let next_funding_time = match event.next_funding {
                    Some(ms) if ms > 0 => Some(ms_to_utc(ms)?),
                    _ => None,
                };
                Ok(vec![FeedEvent::Funding {
                    coin: event.s,
                    ts: ms_to_utc(event.event_time)?,
                    tick: FundingTick {
                        funding_rate: event.r,
                        premium: None,
                        mark_price: event.p,
                        index_price: event.i,
                        oracle_price: None,
                        mid_price: None,
                        next_funding_time,
                    },
                }])
            }
            other => Err(FeedError::Parse(format!("unknown event type: {}", other))),
        }
    }
}

// ============================================================
//  历史 REST 源
// ============================================================

/// fundingRate 端点响应行。历史资金费率已知缺失价格列（markPrice 偶发缺省）。
#[derive(Deserialize)]
struct FundingRateRow {
    #[serde(rename = "fundingRate")]
    funding_rate: Option<Decimal>,
    #[serde(rename = "fundingTime")]
    funding_time: i64,
    #[serde(rename = "markPrice")]
    mark_price: Option<Decimal>,
}

/// # Summary
/// Binance 合约历史数据源：`/fapi/v1/klines` 与 `/fapi/v1/fundingRate`。
///
/// # Invariants
/// - 单次请求不超过 1000 行。
/// - 未平仓量无历史源。
pub struct BinanceHistory {
    client: reqwest::Client,
    rest_url: String,
    quote_aliases: HashMap<String, String>,
}

impl BinanceHistory {
    pub fn new() -> Self {
        let mut quote_aliases = HashMap::new();
        quote_aliases.insert("USD".to_string(), "USDT".to_string());
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .unwrap_or_default(),
            rest_url: REST_URL.to_string(),
            quote_aliases,
        }
    }

    /// 测试与镜像部署用：覆盖 REST 端点地址。
    pub fn with_rest_url(mut self, url: impl Into<String>) -> Self {
        self.rest_url = url.into();
        self
    }

    fn symbol(&self, coin: &str, quote: &str) -> String {
        let quote_label = self
            .quote_aliases
            .get(quote)
            .cloned()
            .unwrap_or_else(|| quote.to_string());
        format!("{}{}", coin, quote_label).to_uppercase()
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, FeedError> {
        let resp = self
            .client
            .get(format!("{}{}", self.rest_url, path))
            .query(query)
            .send()
            .await
            .map_err(|e| FeedError::Network(e.to_string()))?;

        if resp.status().as_u16() == 429 || resp.status().as_u16() == 418 {
            return Err(FeedError::RateLimited);
        }
        if !resp.status().is_success() {
            return Err(FeedError::Network(format!("HTTP {}", resp.status())));
        }
        resp.json::<T>()
            .await
            .map_err(|e| FeedError::Parse(e.to_string()))
    }
}

impl Default for BinanceHistory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HistorySource for BinanceHistory {
    fn name(&self) -> &'static str {
        EXCHANGE_NAME
    }

    fn page_limit(&self) -> usize {
        PAGE_LIMIT
    }

    fn supports(&self, kind: DataKind) -> bool {
        matches!(kind, DataKind::Candle | DataKind::Funding)
    }

    /// # Summary
    /// 拉取一页历史 K 线。klines 以异构数组返回，按位置解码。
    async fn fetch_candles(
        &self,
        coin: &str,
        quote: &str,
        interval: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, FeedError> {
        let rows: Vec<Vec<serde_json::Value>> = self
            .get_json(
                "/fapi/v1/klines",
                &[
                    ("symbol", self.symbol(coin, quote)),
                    ("interval", interval.to_string()),
                    ("startTime", start.timestamp_millis().to_string()),
                    ("endTime", end.timestamp_millis().to_string()),
                    ("limit", PAGE_LIMIT.to_string()),
                ],
            )
            .await?;

        let mut candles = Vec::with_capacity(rows.len());
        for row in rows {
            candles.push(parse_kline_row(&row)?);
        }
        candles.sort_by_key(|c| c.time);
        Ok(candles)
    }

    async fn fetch_funding(
        &self,
        coin: &str,
        quote: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<(DateTime<Utc>, FundingTick)>, FeedError> {
        let rows: Vec<FundingRateRow> = self
            .get_json(
                "/fapi/v1/fundingRate",
                &[
                    ("symbol", self.symbol(coin, quote)),
                    ("startTime", start.timestamp_millis().to_string()),
                    ("endTime", end.timestamp_millis().to_string()),
                    ("limit", PAGE_LIMIT.to_string()),
                ],
            )
            .await?;

        let mut ticks = Vec::with_capacity(rows.len());
        for row in rows {
            ticks.push((
                ms_to_utc(row.funding_time)?,
                FundingTick {
                    funding_rate: row.funding_rate,
                    mark_price: row.mark_price,
                    ..FundingTick::default()
                },
            ));
        }
        ticks.sort_by_key(|(t, _)| *t);
        Ok(ticks)
    }
}

/// 按位置解码一行 klines 数组: [openTime, o, h, l, c, v, closeTime, _, trades, ...]。
fn parse_kline_row(row: &[serde_json::Value]) -> Result<Candle, FeedError> {
    fn decimal_at(row: &[serde_json::Value], idx: usize) -> Result<Decimal, FeedError> {
        row.get(idx)
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<Decimal>().ok())
            .ok_or_else(|| FeedError::Parse(format!("bad decimal at index {}", idx)))
    }

    let open_ms = row
        .first()
        .and_then(|v| v.as_i64())
        .ok_or_else(|| FeedError::Parse("missing open time".to_string()))?;

    Ok(Candle {
        time: ms_to_utc(open_ms)?,
        open: decimal_at(row, 1)?,
        high: decimal_at(row, 2)?,
        low: decimal_at(row, 3)?,
        close: decimal_at(row, 4)?,
        volume: decimal_at(row, 5)?,
        trade_count: row.get(8).and_then(|v| v.as_i64()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_kline_frame() {
        let raw = r#"{"stream":"btcusdt@kline_1m","data":{"e":"kline","E":1767225245123,"s":"BTCUSDT","k":{"t":1767225240000,"T":1767225299999,"s":"BTCUSDT","i":"1m","f":100,"L":200,"o":"67500.00","c":"67508.75","h":"67510.25","l":"67490.10","v":"42.5","n":218,"x":false,"q":"2870000.0"}}}"#;
        let adapter = BinanceAdapter::new();
        let events = adapter.parse_frame(raw).expect("kline frame parses");
        match &events[0] {
            FeedEvent::Candle { coin, interval, candle } => {
                assert_eq!(coin, "BTCUSDT");
                assert_eq!(interval, "1m");
                assert_eq!(candle.high, dec!(67510.25));
                assert_eq!(candle.time.timestamp(), 1_767_225_240);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_parse_mark_price_frame() {
        let raw = r#"{"stream":"btcusdt@markPrice","data":{"e":"markPriceUpdate","E":1767225245000,"s":"BTCUSDT","p":"67300.00","i":"67298.10","P":"67299.00","r":"0.00038167","T":1767232800000}}"#;
        let adapter = BinanceAdapter::new();
        let events = adapter.parse_frame(raw).expect("mark price frame parses");
        match &events[0] {
            FeedEvent::Funding { coin, ts, tick } => {
                assert_eq!(coin, "BTCUSDT");
                assert_eq!(ts.timestamp_millis(), 1_767_225_245_000);
                assert_eq!(tick.funding_rate, Some(dec!(0.00038167)));
                assert_eq!(tick.mark_price, Some(dec!(67300.00)));
                assert_eq!(tick.index_price, Some(dec!(67298.10)));
                assert!(tick.next_funding_time.is_some());
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_parse_subscription_ack() {
        let adapter = BinanceAdapter::new();
        let events = adapter
            .parse_frame(r#"{"result":null,"id":1}"#)
            .expect("ack parses");
        assert!(matches!(events[0], FeedEvent::SubscriptionAck));
    }

    #[test]
    fn test_quote_alias_applies_to_symbol() {
        let adapter = BinanceAdapter::new();
        assert_eq!(adapter.market_label("BTC", "USD"), "BTCUSDT");
        assert_eq!(adapter.market_label("BTC", "USDT"), "BTCUSDT");
        assert_eq!(adapter.market_label("eth", "USDT"), "ETHUSDT");
    }

    #[test]
    fn test_subscribe_frame_combines_streams() {
        let adapter = BinanceAdapter::new();
        let plan = SubscribePlan {
            candles: vec![("BTCUSDT".into(), "1m".into())],
            markets: vec!["BTCUSDT".into()],
        };
        let frames = adapter.subscribe_frames(&plan);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].contains("btcusdt@kline_1m"));
        assert!(frames[0].contains("btcusdt@markPrice"));
    }

    #[test]
    fn test_parse_kline_row_positional() {
        let row: Vec<serde_json::Value> = serde_json::from_str(
            r#"[1767225240000,"67500.00","67510.25","67490.10","67508.75","42.5",1767225299999,"2870000.0",218,"21.2","1430000.0","0"]"#,
        )
        .expect("row parses");
        let candle = parse_kline_row(&row).expect("kline row decodes");
        assert_eq!(candle.close, dec!(67508.75));
        assert_eq!(candle.trade_count, Some(218));
    }
}
