use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use souba_core::common::DataKind;
use souba_core::market::entity::{Candle, FundingTick, OpenInterestTick};
use souba_core::market::error::FeedError;
use souba_core::market::port::{ExchangeAdapter, FeedEvent, HistorySource, SubscribePlan};
use std::time::Duration;

pub const EXCHANGE_NAME: &str = "hyperliquid";

const WS_URL: &str = "wss://api.hyperliquid.xyz/ws";
const INFO_URL: &str = "https://api.hyperliquid.xyz/info";

/// Hyperliquid 单次 candleSnapshot 的行数上限。
const PAGE_LIMIT: usize = 5000;

// ============================================================
//  入站帧形状
// ============================================================

/// 入站帧外层：channel 判别 + 任意载荷。
#[derive(Deserialize)]
struct WsEnvelope {
    channel: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// K 线载荷。价格与成交量为字符串编码的定点十进制。
#[derive(Deserialize)]
struct WsCandle {
    /// 桶开始时间 (ms)
    t: i64,
    /// 币种标签
    s: String,
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

/// activeAssetCtx 载荷：一帧同时携带资金费率与未平仓量上下文。
#[derive(Deserialize)]
struct WsAssetCtxFrame {
    coin: String,
    ctx: WsAssetCtx,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WsAssetCtx {
    funding: Option<Decimal>,
    open_interest: Option<Decimal>,
    premium: Option<Decimal>,
    oracle_px: Option<Decimal>,
    mark_px: Option<Decimal>,
    mid_px: Option<Decimal>,
    day_ntl_vlm: Option<Decimal>,
    day_base_vlm: Option<Decimal>,
}

fn ms_to_utc(ms: i64) -> Result<DateTime<Utc>, FeedError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| FeedError::Parse(format!("timestamp out of range: {}", ms)))
}

// ============================================================
//  WebSocket 适配器
// ============================================================

/// # Summary
/// Hyperliquid WebSocket 适配器。
/// K 线订阅 `candle` 通道，资金费率 / 未平仓量订阅 `activeAssetCtx` 通道。
///
/// # Invariants
/// - 市场标签不带计价后缀：交易所公开接口以 USD 标注、以 USDC 结算，
///   配置中两种计价名解析到同一市场，不做数值换算。
pub struct HyperliquidAdapter {
    ws_url: String,
}

impl HyperliquidAdapter {
    pub fn new() -> Self {
        Self {
            ws_url: WS_URL.to_string(),
        }
    }

    /// 测试与镜像部署用：覆盖 WebSocket 入口地址。
    pub fn with_ws_url(mut self, url: impl Into<String>) -> Self {
        self.ws_url = url.into();
        self
    }
}

impl Default for HyperliquidAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ExchangeAdapter for HyperliquidAdapter {
    fn name(&self) -> &'static str {
        EXCHANGE_NAME
    }

    fn ws_url(&self) -> &str {
        &self.ws_url
    }

    fn market_label(&self, coin: &str, _quote: &str) -> String {
        // 永续标签只含币种，USD 与 USDC 计价落到同一标签
        coin.to_string()
    }

    /// # Summary
    /// 构造订阅帧：每个 (币种, 周期) 一条 candle 订阅，
    /// 每个市场一条 activeAssetCtx 订阅。
    fn subscribe_frames(&self, plan: &SubscribePlan) -> Vec<String> {
        let mut frames = Vec::with_capacity(plan.candles.len() + plan.markets.len());
        for (coin, interval) in &plan.candles {
            frames.push(
                json!({
                    "method": "subscribe",
                    "subscription": { "type": "candle", "coin": coin, "interval": interval }
                })
                .to_string(),
            );
        }
        for coin in &plan.markets {
            frames.push(
                json!({
                    "method": "subscribe",
                    "subscription": { "type": "activeAssetCtx", "coin": coin }
                })
                .to_string(),
            );
        }
        frames
    }

    /// # Summary
    /// 解析一条入站帧。
    ///
    /// # Logic
    /// 1. `candle` 帧产出一个 K 线事件，时间取桶开始时刻。
    /// 2. `activeAssetCtx` 帧同时产出资金费率与未平仓量两个事件；
    ///    帧内无上报时间，以接收时刻充当（分钟聚合只需分钟内可比序）。
    /// 3. 订阅确认与 pong 归类为对应变体，未知通道报解析错误。
    fn parse_frame(&self, raw: &str) -> Result<Vec<FeedEvent>, FeedError> {
        let envelope: WsEnvelope =
            serde_json::from_str(raw).map_err(|e| FeedError::Parse(e.to_string()))?;

        match envelope.channel.as_str() {
            "candle" => {
                let candle: WsCandle = serde_json::from_value(envelope.data)
                    .map_err(|e| FeedError::Parse(e.to_string()))?;
                Ok(vec![FeedEvent::Candle {
                    coin: candle.s.clone(),
                    interval: candle.i.clone(),
                    candle: Candle {
                        time: ms_to_utc(candle.t)?,
                        open: candle.o,
                        high: candle.h,
                        low: candle.l,
                        close: candle.c,
                        volume: candle.v,
                        trade_count: candle.n,
                    },
                }])
            }
            "activeAssetCtx" => {
                let frame: WsAssetCtxFrame = serde_json::from_value(envelope.data)
                    .map_err(|e| FeedError::Parse(e.to_string()))?;
                let ts = Utc::now();
                Ok(vec![
                    FeedEvent::Funding {
                        coin: frame.coin.clone(),
                        ts,
                        tick: FundingTick {
                            funding_rate: frame.ctx.funding,
                            premium: frame.ctx.premium,
                            mark_price: frame.ctx.mark_px,
                            index_price: None,
                            oracle_price: frame.ctx.oracle_px,
                            mid_price: frame.ctx.mid_px,
                            next_funding_time: None,
                        },
                    },
                    FeedEvent::OpenInterest {
                        coin: frame.coin,
                        ts,
                        tick: OpenInterestTick {
                            open_interest: frame.ctx.open_interest,
                            notional_value: None,
                            day_base_volume: frame.ctx.day_base_vlm,
                            day_notional_volume: frame.ctx.day_ntl_vlm,
                        },
                    },
                ])
            }
            "subscriptionResponse" => Ok(vec![FeedEvent::SubscriptionAck]),
            "pong" => Ok(vec![FeedEvent::Heartbeat]),
            other => Err(FeedError::Parse(format!("unknown channel: {}", other))),
        }
    }
}

// ============================================================
//  历史 REST 源
// ============================================================

/// candleSnapshot 请求体内层。
#[derive(serde::Serialize)]
struct CandleSnapshotReq<'a> {
    coin: &'a str,
    interval: &'a str,
    #[serde(rename = "startTime")]
    start_time: i64,
    #[serde(rename = "endTime")]
    end_time: i64,
}

/// fundingHistory 响应行。历史资金费率已知缺失全部价格列。
#[derive(Deserialize)]
struct FundingHistoryRow {
    #[serde(rename = "fundingRate")]
    funding_rate: Option<Decimal>,
    premium: Option<Decimal>,
    time: i64,
}

/// # Summary
/// Hyperliquid 历史数据源：`/info` 端点的 candleSnapshot 与 fundingHistory。
///
/// # Invariants
/// - 单次请求不超过 5000 行。
/// - 历史资金费率不含价格列，本源不补造。
pub struct HyperliquidHistory {
    client: reqwest::Client,
    info_url: String,
}

impl HyperliquidHistory {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .unwrap_or_default(),
            info_url: INFO_URL.to_string(),
        }
    }

    /// 测试与镜像部署用：覆盖 info 端点地址。
    pub fn with_info_url(mut self, url: impl Into<String>) -> Self {
        self.info_url = url.into();
        self
    }

    async fn post_info<T: serde::de::DeserializeOwned>(
        &self,
        body: serde_json::Value,
    ) -> Result<T, FeedError> {
        let resp = self
            .client
            .post(&self.info_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| FeedError::Network(e.to_string()))?;

        if resp.status().as_u16() == 429 {
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

impl Default for HyperliquidHistory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HistorySource for HyperliquidHistory {
    fn name(&self) -> &'static str {
        EXCHANGE_NAME
    }

    fn page_limit(&self) -> usize {
        PAGE_LIMIT
    }

    fn supports(&self, kind: DataKind) -> bool {
        // 未平仓量无历史源
        matches!(kind, DataKind::Candle | DataKind::Funding)
    }

    async fn fetch_candles(
        &self,
        coin: &str,
        _quote: &str,
        interval: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, FeedError> {
        let rows: Vec<WsCandle> = self
            .post_info(json!({
                "type": "candleSnapshot",
                "req": CandleSnapshotReq {
                    coin,
                    interval,
                    start_time: start.timestamp_millis(),
                    end_time: end.timestamp_millis(),
                }
            }))
            .await?;

        let mut candles = Vec::with_capacity(rows.len());
        for row in rows {
            candles.push(Candle {
                time: ms_to_utc(row.t)?,
                open: row.o,
                high: row.h,
                low: row.l,
                close: row.c,
                volume: row.v,
                trade_count: row.n,
            });
        }
        candles.sort_by_key(|c| c.time);
        Ok(candles)
    }

    async fn fetch_funding(
        &self,
        coin: &str,
        _quote: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<(DateTime<Utc>, FundingTick)>, FeedError> {
        let rows: Vec<FundingHistoryRow> = self
            .post_info(json!({
                "type": "fundingHistory",
                "coin": coin,
                "startTime": start.timestamp_millis(),
                "endTime": end.timestamp_millis(),
            }))
            .await?;

        let mut ticks = Vec::with_capacity(rows.len());
        for row in rows {
            ticks.push((
                ms_to_utc(row.time)?,
                FundingTick {
                    funding_rate: row.funding_rate,
                    premium: row.premium,
                    ..FundingTick::default()
                },
            ));
        }
        ticks.sort_by_key(|(t, _)| *t);
        Ok(ticks)
    }
}
