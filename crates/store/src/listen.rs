use async_trait::async_trait;
use serde::Deserialize;
use souba_core::common::DataKind;
use souba_core::store::error::StoreError;
use souba_core::store::port::{ChangeEvent, ChangeEventStream, ChangeFeed};
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

/// 监听器断线后的重连间隔。
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// 触发器发布的最小载荷形状。
#[derive(Deserialize)]
struct NotifyPayload {
    key: i32,
    time: i64,
}

/// # Summary
/// ChangeFeed 的 Postgres 实现：进程内唯一的 LISTEN/NOTIFY 消费者。
///
/// # Invariants
/// - 一条监听连接覆盖全部三个通道，事件在流内多路合并。
/// - 消费者独占该连接；订阅方只拿到事件流，摸不到监听器本身。
pub struct PgChangeFeed {
    pool: PgPool,
}

impl PgChangeFeed {
    /// 以共享连接池构造监听器。
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChangeFeed for PgChangeFeed {
    /// # Summary
    /// 订阅三个通知通道的合并事件流。
    ///
    /// # Logic
    /// 1. 建立 PgListener 并 LISTEN 全部通道。
    /// 2. 后台任务循环收取通知：按通道名定种类，JSON 载荷解析失败仅告警跳过。
    /// 3. 连接中断时退避重连并重新 LISTEN；接收端关闭时任务退出。
    ///
    /// # Returns
    /// 变更事件异步流。
    async fn subscribe(&self) -> Result<ChangeEventStream, StoreError> {
        let channels = [
            DataKind::Candle.channel(),
            DataKind::Funding.channel(),
            DataKind::OpenInterest.channel(),
        ];

        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| StoreError::Init(e.to_string()))?;
        listener
            .listen_all(channels)
            .await
            .map_err(|e| StoreError::Init(e.to_string()))?;

        let (tx, rx) = tokio::sync::mpsc::channel(1024);
        let pool = self.pool.clone();

        tokio::spawn(async move {
            let mut listener = listener;
            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        let Some(kind) = DataKind::from_channel(notification.channel()) else {
                            warn!(channel = notification.channel(), "notification on unknown channel");
                            continue;
                        };
                        let payload: NotifyPayload =
                            match serde_json::from_str(notification.payload()) {
                                Ok(p) => p,
                                Err(e) => {
                                    warn!(error = %e, "malformed notification payload, skipping");
                                    continue;
                                }
                            };
                        let event = ChangeEvent {
                            kind,
                            key: payload.key,
                            time: payload.time,
                        };
                        if tx.send(event).await.is_err() {
                            debug!("change feed receiver dropped, listener task exiting");
                            return;
                        }
                    }
                    Err(e) => {
                        // PgListener 自身会重建连接；这里重建 LISTEN 注册
                        warn!(error = %e, "notification connection lost, re-listening");
                        tokio::time::sleep(RECONNECT_DELAY).await;
                        match PgListener::connect_with(&pool).await {
                            Ok(mut fresh) => {
                                if let Err(e) = fresh.listen_all(channels).await {
                                    warn!(error = %e, "re-listen failed, retrying");
                                    continue;
                                }
                                listener = fresh;
                            }
                            Err(e) => {
                                warn!(error = %e, "listener reconnect failed, retrying");
                            }
                        }
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}
