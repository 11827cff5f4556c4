use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use rust_decimal_macros::dec;
use souba_api::server::{AppState, build_router};
use souba_api::ws::fanout::spawn_fanout;
use souba_api::ws::registry::ConnectionRegistry;
use souba_core::common::{DataKind, MarketId, MarketKey, SeriesId, SeriesKey};
use souba_core::config::AppConfig;
use souba_core::market::entity::{
    Candle, FundingPoint, MarketInfo, OpenInterestPoint, SeriesInfo,
};
use souba_core::store::error::StoreError;
use souba_core::store::port::{
    ChangeEvent, ChangeEventStream, ChangeFeed, SeriesFilter, SeriesResolver, TimeSeriesStore,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;

fn ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).expect("valid timestamp")
}

fn candle(time: DateTime<Utc>, close: &str) -> Candle {
    Candle {
        time,
        open: dec!(67000),
        high: dec!(67600),
        low: dec!(66900),
        close: close.parse().expect("valid decimal"),
        volume: dec!(10),
        trade_count: None,
    }
}

/// 预置 K 线数据的模拟存储网关。
struct MockStore {
    // series_id -> 升序 K 线
    candles: Mutex<HashMap<SeriesId, Vec<Candle>>>,
}

impl MockStore {
    fn with_candles(series_id: SeriesId, rows: Vec<Candle>) -> Arc<Self> {
        let mut map = HashMap::new();
        map.insert(series_id, rows);
        Arc::new(Self {
            candles: Mutex::new(map),
        })
    }

    fn insert(&self, series_id: SeriesId, row: Candle) {
        let mut map = self.candles.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(series_id).or_default().push(row);
    }
}

#[async_trait]
impl TimeSeriesStore for MockStore {
    async fn upsert_candles(&self, series_id: SeriesId, rows: &[Candle]) -> Result<u64, StoreError> {
        for row in rows {
            self.insert(series_id, row.clone());
        }
        Ok(rows.len() as u64)
    }
    async fn upsert_funding(&self, _: &[FundingPoint]) -> Result<u64, StoreError> {
        Ok(0)
    }
    async fn upsert_open_interest(&self, _: &[OpenInterestPoint]) -> Result<u64, StoreError> {
        Ok(0)
    }
    async fn candle_range(
        &self,
        series_id: SeriesId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: Option<i64>,
    ) -> Result<Vec<Candle>, StoreError> {
        let map = self.candles.lock().unwrap_or_else(|e| e.into_inner());
        let mut hits: Vec<Candle> = map
            .get(&series_id)
            .map(|rows| {
                rows.iter()
                    .filter(|c| c.time >= start && c.time <= end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        // 与真实网关一致: 时间降序 + limit 截断
        hits.sort_by_key(|c| std::cmp::Reverse(c.time));
        hits.truncate(usize::try_from(limit.unwrap_or(1000).clamp(1, 5000)).unwrap_or(1000));
        Ok(hits)
    }
    async fn funding_range(
        &self,
        _: MarketId,
        _: DateTime<Utc>,
        _: DateTime<Utc>,
        _: Option<i64>,
    ) -> Result<Vec<FundingPoint>, StoreError> {
        Ok(vec![])
    }
    async fn open_interest_range(
        &self,
        _: MarketId,
        _: DateTime<Utc>,
        _: DateTime<Utc>,
        _: Option<i64>,
    ) -> Result<Vec<OpenInterestPoint>, StoreError> {
        Ok(vec![])
    }
    async fn candle_at(
        &self,
        series_id: SeriesId,
        time: DateTime<Utc>,
    ) -> Result<Option<Candle>, StoreError> {
        let map = self.candles.lock().unwrap_or_else(|e| e.into_inner());
        Ok(map
            .get(&series_id)
            .and_then(|rows| rows.iter().find(|c| c.time == time).cloned()))
    }
    async fn funding_at(
        &self,
        _: MarketId,
        _: DateTime<Utc>,
    ) -> Result<Option<FundingPoint>, StoreError> {
        Ok(None)
    }
    async fn open_interest_at(
        &self,
        _: MarketId,
        _: DateTime<Utc>,
    ) -> Result<Option<OpenInterestPoint>, StoreError> {
        Ok(None)
    }
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
    async fn latest_time(&self, _: DataKind, _: i32) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(None)
    }
}

/// 单序列模拟解析器。
struct MockResolver {
    series: SeriesInfo,
}

#[async_trait]
impl SeriesResolver for MockResolver {
    fn resolve_series(&self, key: &SeriesKey) -> Result<SeriesInfo, StoreError> {
        if key.coin == self.series.coin && key.interval == self.series.interval {
            Ok(self.series.clone())
        } else {
            Err(StoreError::NotFound)
        }
    }
    fn resolve_market(&self, _: &MarketKey) -> Result<MarketInfo, StoreError> {
        Err(StoreError::NotFound)
    }
    fn series_by_id(&self, id: SeriesId) -> Option<SeriesInfo> {
        (id == self.series.series_id).then(|| self.series.clone())
    }
    fn market_by_id(&self, _: MarketId) -> Option<MarketInfo> {
        None
    }
    fn active_series(&self, _: &SeriesFilter) -> Vec<SeriesInfo> {
        vec![self.series.clone()]
    }
    fn all_series(&self) -> Vec<SeriesInfo> {
        vec![self.series.clone()]
    }
    fn active_markets(&self, _: &SeriesFilter) -> Vec<MarketInfo> {
        vec![]
    }
    async fn refresh(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// 由测试侧手动推送事件的模拟变更源。
struct MockFeed {
    rx: Mutex<Option<mpsc::Receiver<ChangeEvent>>>,
}

#[async_trait]
impl ChangeFeed for MockFeed {
    async fn subscribe(&self) -> Result<ChangeEventStream, StoreError> {
        let rx = self
            .rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| StoreError::Init("feed already consumed".to_string()))?;
        Ok(Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx)))
    }
}

fn btc_series() -> SeriesInfo {
    SeriesInfo {
        series_id: 42,
        market_id: 7,
        exchange: "hyperliquid".into(),
        coin: "BTC".into(),
        quote: "USDC".into(),
        market_type: "perp".into(),
        interval: "1m".into(),
        interval_seconds: 60,
        active: true,
    }
}

/// 在随机端口拉起完整服务 (REST + /ws + 扇出任务)，返回地址与测试把手。
async fn spawn_test_server(
    store: Arc<MockStore>,
) -> (String, mpsc::Sender<ChangeEvent>, watch::Sender<bool>) {
    let resolver = Arc::new(MockResolver {
        series: btc_series(),
    });
    let config = Arc::new(AppConfig::default());
    let registry = ConnectionRegistry::new(config.websocket.clone());

    let (event_tx, event_rx) = mpsc::channel(64);
    let feed = Arc::new(MockFeed {
        rx: Mutex::new(Some(event_rx)),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_fanout(
        feed as Arc<dyn ChangeFeed>,
        Arc::clone(&store) as Arc<dyn TimeSeriesStore>,
        Arc::clone(&registry),
        shutdown_rx,
    );

    let state = AppState {
        store: store as Arc<dyn TimeSeriesStore>,
        resolver: resolver as Arc<dyn SeriesResolver>,
        registry,
        config,
        collector_states: Arc::new(HashMap::new),
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind test port");
    let port = listener.local_addr().expect("local addr").port();
    let app = build_router(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    (format!("127.0.0.1:{}", port), event_tx, shutdown_tx)
}

async fn next_json(
    ws: &mut (impl StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin),
) -> serde_json::Value {
    loop {
        match ws.next().await.expect("frame present").expect("frame ok") {
            Message::Text(text) => {
                return serde_json::from_str(text.as_str()).expect("frame is json");
            }
            // 协议层心跳不属于线协议帧
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}

// 12:00 起五根分钟 K 线: 订阅 history=3 应回放 [12:02, 12:03, 12:04]
const BASE: i64 = 1_772_366_400;

#[tokio::test]
async fn test_subscribe_history_then_live_update() {
    let rows: Vec<Candle> = (0..5)
        .map(|i| candle(ts(BASE + i * 60), "67500"))
        .collect();
    let store = MockStore::with_candles(42, rows);
    let (addr, event_tx, _shutdown) = spawn_test_server(Arc::clone(&store)).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
        .await
        .expect("ws connects");

    ws.send(Message::Text(
        r#"{"action":"subscribe","kind":"candle","keys":[42],"history":3}"#.into(),
    ))
    .await
    .expect("subscribe sent");

    // 1. 历史回放: 恰好 3 行，时间升序，先于任何实时帧
    let historical = next_json(&mut ws).await;
    assert_eq!(historical["type"], "historical");
    assert_eq!(historical["key"], 42);
    let rows = historical["rows"].as_array().expect("rows array");
    assert_eq!(rows.len(), 3);
    let times: Vec<&str> = rows
        .iter()
        .map(|r| r["time"].as_str().expect("time string"))
        .collect();
    let mut sorted = times.clone();
    sorted.sort_unstable();
    assert_eq!(times, sorted, "historical rows must ascend in time");

    // 2. 订阅确认
    let success = next_json(&mut ws).await;
    assert_eq!(success["type"], "success");
    assert_eq!(success["action"], "subscribe");

    // 3. 采集器写入 12:05 K 线 → 触发器事件 → 扇出 → 客户端 update
    let live_time = ts(BASE + 5 * 60);
    store.insert(42, candle(live_time, "67555"));
    event_tx
        .send(ChangeEvent {
            kind: DataKind::Candle,
            key: 42,
            time: live_time.timestamp(),
        })
        .await
        .expect("event pushed");

    let update = next_json(&mut ws).await;
    assert_eq!(update["type"], "update");
    assert_eq!(update["kind"], "candle");
    assert_eq!(update["key"], 42);
    assert_eq!(update["row"]["close"], "67555");
}

#[tokio::test]
async fn test_subscribe_unknown_key_keeps_connection_open() {
    let store = MockStore::with_candles(42, vec![]);
    let (addr, _event_tx, _shutdown) = spawn_test_server(store).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
        .await
        .expect("ws connects");

    ws.send(Message::Text(
        r#"{"action":"subscribe","kind":"candle","keys":[999]}"#.into(),
    ))
    .await
    .expect("subscribe sent");

    let error = next_json(&mut ws).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["code"], "unknown_key");

    // 连接保持: 后续 ping 仍有应答
    ws.send(Message::Text(r#"{"action":"ping","id":9}"#.into()))
        .await
        .expect("ping sent");
    let pong = next_json(&mut ws).await;
    assert_eq!(pong["type"], "pong");
    assert_eq!(pong["id"], 9);
}

#[tokio::test]
async fn test_rest_health_and_unknown_series() {
    let store = MockStore::with_candles(42, vec![]);
    let (addr, _event_tx, _shutdown) = spawn_test_server(store).await;
    let client = reqwest::Client::new();

    let health: serde_json::Value = client
        .get(format!("http://{}/health", addr))
        .send()
        .await
        .expect("health reachable")
        .json()
        .await
        .expect("health is json");
    assert_eq!(health["status"], "ok");
    assert_eq!(health["database"], "ok");

    let missing = client
        .get(format!(
            "http://{}/api/v1/candles/hyperliquid/DOGE/USDC/perp/1m",
            addr
        ))
        .send()
        .await
        .expect("request completes");
    assert_eq!(missing.status().as_u16(), 404);
    let body: serde_json::Value = missing.json().await.expect("error body json");
    assert_eq!(body["error"], "unknown_key");
}
