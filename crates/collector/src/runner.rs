use crate::aggregator::AggregatorHandle;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use rand::RngExt;
use souba_core::common::MarketId;
use souba_core::common::time::floor_to_bar;
use souba_core::config::CollectorConfig;
use souba_core::market::entity::SeriesInfo;
use souba_core::market::port::{ExchangeAdapter, FeedEvent, SubscribePlan};
use souba_core::store::error::StoreError;
use souba_core::store::port::{SeriesFilter, SeriesResolver, TimeSeriesStore};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};

/// 日志中原始帧的截断长度。
const RAW_LOG_LIMIT: usize = 256;

/// 退避乘数硬上限 (2^6)。
const MAX_BACKOFF_SHIFT: u32 = 6;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// # Summary
/// 采集器状态机状态。
///
/// ```text
/// Idle ──connect──► Connecting ──成功──► Subscribing ──订阅发出──► Running
///   ▲                  │错误                │错误                    │断开
///   └────退避──────────┴────────────────────┴────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorState {
    Idle,
    Connecting,
    Subscribing,
    Running,
}

impl fmt::Display for CollectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectorState::Idle => write!(f, "idle"),
            CollectorState::Connecting => write!(f, "connecting"),
            CollectorState::Subscribing => write!(f, "subscribing"),
            CollectorState::Running => write!(f, "running"),
        }
    }
}

/// 读循环退出原因，决定外层是否计入退避。
enum LoopExit {
    /// 对端关闭或读错误
    SocketLost,
    /// 空闲超时（健康检查失败）
    IdleTimeout,
    /// 存储瞬时故障预算耗尽，连接视为坏
    StoreDegraded,
    /// 收到关停信号
    Shutdown,
}

/// 一条连接的路由表：交易所标签到内部标识的映射，每次重连时重建。
struct RoutingPlan {
    plan: SubscribePlan,
    // (市场标签, 周期标签) -> 序列信息
    candle_routes: HashMap<(String, String), SeriesInfo>,
    // 市场标签 -> 市场标识
    market_routes: HashMap<String, MarketId>,
}

/// # Summary
/// 单交易所采集运行器：独占 WebSocket 句柄与聚合缓冲的写入端。
///
/// # Invariants
/// - 单帧解析失败绝不终止采集；记录（截断原始字节）并跳过。
/// - 存储瞬时故障（网关重试预算耗尽）视为连接坏死，回到 Idle 重连。
pub struct CollectorRunner {
    adapter: Arc<dyn ExchangeAdapter>,
    resolver: Arc<dyn SeriesResolver>,
    store: Arc<dyn TimeSeriesStore>,
    agg: AggregatorHandle,
    cfg: CollectorConfig,
    states: Arc<DashMap<String, CollectorState>>,
    shutdown: watch::Receiver<bool>,
    // 解析失败帧计数（进程生命周期内单调递增）
    parse_failures: u64,
}

impl CollectorRunner {
    pub fn new(
        adapter: Arc<dyn ExchangeAdapter>,
        resolver: Arc<dyn SeriesResolver>,
        store: Arc<dyn TimeSeriesStore>,
        agg: AggregatorHandle,
        cfg: CollectorConfig,
        states: Arc<DashMap<String, CollectorState>>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            adapter,
            resolver,
            store,
            agg,
            cfg,
            states,
            shutdown,
            parse_failures: 0,
        }
    }

    fn set_state(&self, state: CollectorState) {
        self.states.insert(self.adapter.name().to_string(), state);
    }

    /// # Summary
    /// 由解析器快照构建本连接的订阅计划与路由表。
    ///
    /// # Logic
    /// 1. 活跃序列逐一经适配器映射到交易所标签，形成 K 线订阅与反查路由。
    /// 2. 活跃市场同理形成市场数据订阅。
    /// 3. 每次重连重建，配置刷新后的新序列随下一次重连生效。
    fn build_routing(&self) -> RoutingPlan {
        let filter = SeriesFilter {
            exchange: Some(self.adapter.name().to_string()),
            coin: None,
        };
        let mut plan = SubscribePlan::default();
        let mut candle_routes = HashMap::new();
        let mut market_routes = HashMap::new();

        for series in self.resolver.active_series(&filter) {
            let label = self.adapter.market_label(&series.coin, &series.quote);
            plan.candles.push((label.clone(), series.interval.clone()));
            candle_routes.insert((label, series.interval.clone()), series);
        }
        for market in self.resolver.active_markets(&filter) {
            let label = self.adapter.market_label(&market.coin, &market.quote);
            plan.markets.push(label.clone());
            market_routes.insert(label, market.market_id);
        }

        RoutingPlan {
            plan,
            candle_routes,
            market_routes,
        }
    }

    /// # Summary
    /// 运行状态机直至收到关停信号。
    ///
    /// # Logic
    /// 1. Idle → Connecting → Subscribing → Running 正常推进。
    /// 2. 任何失败回到 Idle，按 `base · min(64, 2^attempt) · jitter` 退避，
    ///    硬上限 `max_backoff_secs`；Running 驻留 ≥ backoff_reset_secs 后计数归零。
    /// 3. 关停：停止接收新帧，残余聚合缓冲由冲洗任务负责。
    pub async fn run(mut self) {
        let exchange = self.adapter.name();
        info!(exchange, "collector starting");
        let mut attempt: u32 = 0;

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let routing = self.build_routing();
            if routing.plan.candles.is_empty() && routing.plan.markets.is_empty() {
                warn!(exchange, "no active series configured, collector idling");
            }

            self.set_state(CollectorState::Connecting);
            match connect_async(self.adapter.ws_url()).await {
                Ok((mut ws, _)) => {
                    self.set_state(CollectorState::Subscribing);
                    let mut subscribed = true;
                    for frame in self.adapter.subscribe_frames(&routing.plan) {
                        if let Err(e) = ws.send(Message::Text(frame.into())).await {
                            warn!(exchange, error = %e, "subscription send failed");
                            subscribed = false;
                            break;
                        }
                    }

                    if subscribed {
                        self.set_state(CollectorState::Running);
                        let running_since = Instant::now();
                        let exit = self.read_loop(&mut ws, &routing).await;
                        let _ = ws.close(None).await;

                        match exit {
                            LoopExit::Shutdown => break,
                            LoopExit::SocketLost => {
                                warn!(exchange, "socket lost, reconnecting")
                            }
                            LoopExit::IdleTimeout => {
                                warn!(exchange, "idle timeout, reconnecting")
                            }
                            LoopExit::StoreDegraded => {
                                warn!(exchange, "storage degraded, reconnecting")
                            }
                        }

                        if running_since.elapsed()
                            >= Duration::from_secs(self.cfg.backoff_reset_secs)
                        {
                            attempt = 0;
                        } else {
                            attempt = attempt.saturating_add(1);
                        }
                    } else {
                        attempt = attempt.saturating_add(1);
                    }
                }
                Err(e) => {
                    warn!(exchange, error = %e, "connect failed");
                    attempt = attempt.saturating_add(1);
                }
            }

            self.set_state(CollectorState::Idle);
            let delay = backoff_delay(&self.cfg, attempt);
            debug!(exchange, attempt, delay_ms = delay.as_millis() as u64, "backing off");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.changed() => {}
            }
        }

        self.set_state(CollectorState::Idle);
        info!(exchange, parse_failures = self.parse_failures, "collector stopped");
    }

    /// # Summary
    /// Running 态读循环：逐帧分发直至连接坏死、超时或关停。
    async fn read_loop(&mut self, ws: &mut WsStream, routing: &RoutingPlan) -> LoopExit {
        let idle = Duration::from_secs(self.cfg.idle_timeout_secs);
        let mut shutdown = self.shutdown.clone();
        loop {
            if *shutdown.borrow() {
                return LoopExit::Shutdown;
            }
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return LoopExit::Shutdown;
                    }
                }
                next = tokio::time::timeout(idle, ws.next()) => {
                    match next {
                        // 空闲超时: 连续 idle_timeout_secs 无任何帧（含心跳）
                        Err(_) => return LoopExit::IdleTimeout,
                        Ok(None) => return LoopExit::SocketLost,
                        Ok(Some(Err(e))) => {
                            warn!(exchange = self.adapter.name(), error = %e, "read error");
                            return LoopExit::SocketLost;
                        }
                        Ok(Some(Ok(Message::Text(text)))) => {
                            if let Some(exit) = self.dispatch_frame(text.as_str(), routing).await {
                                return exit;
                            }
                        }
                        Ok(Some(Ok(Message::Ping(payload)))) => {
                            let _ = ws.send(Message::Pong(payload)).await;
                        }
                        // 其余帧 (Pong / Binary / Close 前导) 计为活跃即可
                        Ok(Some(Ok(_))) => {}
                    }
                }
            }
        }
    }

    /// # Summary
    /// 分发一条文本帧。返回 Some 表示连接级失败，None 表示继续读取。
    ///
    /// # Logic
    /// 1. 解析失败：截断记录原始字节并跳过，计数递增。
    /// 2. K 线事件：路由到序列，按周期截断时间后单批落库；
    ///    校验失败是调用方缺陷，丢弃该批继续；瞬时耗尽则判连接坏。
    /// 3. 资金费率 / 未平仓量事件：带交易所上报时间交给分钟聚合桶。
    async fn dispatch_frame(&mut self, raw: &str, routing: &RoutingPlan) -> Option<LoopExit> {
        let events = match self.adapter.parse_frame(raw) {
            Ok(events) => events,
            Err(e) => {
                self.parse_failures += 1;
                let truncated: String = raw.chars().take(RAW_LOG_LIMIT).collect();
                warn!(
                    exchange = self.adapter.name(),
                    error = %e,
                    raw = truncated,
                    total = self.parse_failures,
                    "frame parse failed, skipping"
                );
                return None;
            }
        };

        for event in events {
            match event {
                FeedEvent::Candle { coin, interval, mut candle } => {
                    let Some(series) = routing.candle_routes.get(&(coin, interval)) else {
                        // 交易所推送了未配置的序列，忽略
                        continue;
                    };
                    candle.time = floor_to_bar(candle.time, series.interval_seconds);
                    match self.store.upsert_candles(series.series_id, &[candle]).await {
                        Ok(_) => {}
                        Err(StoreError::Validation(msg)) => {
                            // 程序员错误: 丢弃该批，进程继续
                            error!(
                                exchange = self.adapter.name(),
                                series_id = series.series_id,
                                error = msg,
                                "invalid candle dropped"
                            );
                        }
                        Err(e) if e.is_transient() => {
                            error!(exchange = self.adapter.name(), error = %e,
                                "store retries exhausted");
                            return Some(LoopExit::StoreDegraded);
                        }
                        Err(e) => {
                            error!(exchange = self.adapter.name(), error = %e,
                                "candle upsert failed");
                            return Some(LoopExit::StoreDegraded);
                        }
                    }
                }
                FeedEvent::Funding { coin, ts, tick } => {
                    if let Some(market_id) = routing.market_routes.get(&coin) {
                        self.agg.funding.ingest(*market_id, ts, tick);
                    }
                }
                FeedEvent::OpenInterest { coin, ts, tick } => {
                    if let Some(market_id) = routing.market_routes.get(&coin) {
                        self.agg.open_interest.ingest(*market_id, ts, tick);
                    }
                }
                FeedEvent::SubscriptionAck => {
                    debug!(exchange = self.adapter.name(), "subscription acknowledged");
                }
                FeedEvent::Heartbeat | FeedEvent::Ignored => {}
            }
        }
        None
    }
}

/// # Summary
/// 计算第 `attempt` 次重连前的退避时长。
///
/// # Logic
/// 1. `base · min(64, 2^attempt)`，乘以 [0.5, 1.5) 均匀抖动。
/// 2. 整体钳制在 `max_backoff_secs` 硬上限内。
pub(crate) fn backoff_delay(cfg: &CollectorConfig, attempt: u32) -> Duration {
    let mult = 1u64 << attempt.min(MAX_BACKOFF_SHIFT);
    let base = Duration::from_millis(cfg.base_backoff_ms.saturating_mul(mult));
    let jittered = base.mul_f64(rand::rng().random_range(0.5..1.5));
    jittered.min(Duration::from_secs(cfg.max_backoff_secs))
}
