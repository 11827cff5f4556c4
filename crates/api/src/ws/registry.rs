use crate::ws::protocol::{
    CLOSE_HEARTBEAT_TIMEOUT, CLOSE_SLOW_CONSUMER, OutboundFrame,
};
use dashmap::DashMap;
use souba_core::common::DataKind;
use souba_core::config::WebSocketConfig;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// 连接标识（进程内单调递增）。
pub type ConnId = u64;

/// # Summary
/// 注册表操作错误，映射到协议层错误帧或连接级关闭。
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("connection limit reached")]
    ConnectionLimit,
    #[error("subscription limit reached")]
    SubscriptionLimit,
    #[error("unknown connection")]
    UnknownConnection,
}

/// # Summary
/// 驱逐关闭信号：注册表一侧设置关闭码，写循环在队列尽头读取并下发。
///
/// # Invariants
/// - 只能设置一次；后续设置无效（首个驱逐原因胜出）。
pub struct CloseSignal {
    code: OnceLock<(u16, &'static str)>,
}

impl CloseSignal {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            code: OnceLock::new(),
        })
    }

    fn set(&self, code: u16, reason: &'static str) {
        let _ = self.code.set((code, reason));
    }

    /// 写循环在出站队列排空后查询：Some 表示带码关闭。
    pub fn get(&self) -> Option<(u16, &'static str)> {
        self.code.get().copied()
    }
}

/// 单连接登记状态。
struct ConnHandle {
    // 出站有界队列发送端，注册表独占持有
    tx: mpsc::Sender<OutboundFrame>,
    // 订阅集合 (kind × key)
    subs: RwLock<HashSet<(DataKind, i32)>>,
    // 连续滞后广播计数
    lagging: AtomicU32,
    // 最近活性时刻 (协议 Pong 或任何入站帧)
    last_seen: Mutex<Instant>,
    // 驱逐关闭信号，与写循环共享
    close: Arc<CloseSignal>,
}

/// 新连接登记结果：会话持有队列接收端与关闭信号。
pub struct ConnectionSlot {
    pub id: ConnId,
    pub rx: mpsc::Receiver<OutboundFrame>,
    pub close: Arc<CloseSignal>,
}

/// # Summary
/// 连接注册表：订阅索引、每连接有界出站队列、滞后驱逐与心跳。
///
/// # Invariants
/// - 每条出站队列由注册表独占写入；会话之间互不触碰对方套接字。
/// - 同一 (kind, key) 对单连接的投递顺序与 broadcast 调用顺序一致。
/// - 驱逐单个滞后连接不影响其他连接的投递。
pub struct ConnectionRegistry {
    conns: DashMap<ConnId, ConnHandle>,
    next_id: AtomicU64,
    cfg: WebSocketConfig,
}

impl ConnectionRegistry {
    pub fn new(cfg: WebSocketConfig) -> Arc<Self> {
        Arc::new(Self {
            conns: DashMap::new(),
            next_id: AtomicU64::new(1),
            cfg,
        })
    }

    /// # Summary
    /// 登记一个新连接。
    ///
    /// # Logic
    /// 1. 达到进程级连接上限即拒绝。
    /// 2. 建立容量受配置约束的出站队列与关闭信号。
    ///
    /// # Returns
    /// 连接槽（id、队列接收端、关闭信号）。
    pub fn add(&self) -> Result<ConnectionSlot, RegistryError> {
        if self.conns.len() >= self.cfg.max_connections {
            return Err(RegistryError::ConnectionLimit);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.cfg.queue_capacity);
        let close = CloseSignal::new();
        self.conns.insert(
            id,
            ConnHandle {
                tx,
                subs: RwLock::new(HashSet::new()),
                lagging: AtomicU32::new(0),
                last_seen: Mutex::new(Instant::now()),
                close: Arc::clone(&close),
            },
        );
        debug!(conn = id, total = self.conns.len(), "connection registered");
        Ok(ConnectionSlot { id, rx, close })
    }

    /// 注销连接。幂等：重复调用无副作用。
    pub fn remove(&self, id: ConnId) {
        if self.conns.remove(&id).is_some() {
            debug!(conn = id, total = self.conns.len(), "connection removed");
        }
    }

    /// 当前连接数。
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// # Summary
    /// 为连接追加订阅键。键的存在性校验由会话层完成，此处只约束数量。
    pub fn subscribe(
        &self,
        id: ConnId,
        kind: DataKind,
        keys: &[i32],
    ) -> Result<(), RegistryError> {
        let handle = self.conns.get(&id).ok_or(RegistryError::UnknownConnection)?;
        let mut subs = match handle.subs.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let fresh = keys
            .iter()
            .filter(|k| !subs.contains(&(kind, **k)))
            .count();
        if subs.len() + fresh > self.cfg.max_subscriptions {
            return Err(RegistryError::SubscriptionLimit);
        }
        for key in keys {
            subs.insert((kind, *key));
        }
        Ok(())
    }

    /// 移除订阅键。
    pub fn unsubscribe(
        &self,
        id: ConnId,
        kind: DataKind,
        keys: &[i32],
    ) -> Result<(), RegistryError> {
        let handle = self.conns.get(&id).ok_or(RegistryError::UnknownConnection)?;
        let mut subs = match handle.subs.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for key in keys {
            subs.remove(&(kind, *key));
        }
        Ok(())
    }

    /// 直接向单个连接入队一帧（会话自身的应答、历史回放）。
    /// 队列满时返回 false；会话应答溢出不计入滞后驱逐。
    pub fn send_to(&self, id: ConnId, frame: OutboundFrame) -> bool {
        let Some(handle) = self.conns.get(&id) else {
            return false;
        };
        handle.tx.try_send(frame).is_ok()
    }

    /// 刷新连接活性（协议 Pong 或任何入站帧到达时调用）。
    pub fn record_activity(&self, id: ConnId) {
        if let Some(handle) = self.conns.get(&id) {
            let mut last_seen = match handle.last_seen.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            *last_seen = Instant::now();
        }
    }

    /// # Summary
    /// 向订阅了 (kind, key) 的全部连接广播一帧。
    ///
    /// # Logic
    /// 1. 队列有空位：入队并清零滞后计数。
    /// 2. 队列已满：丢弃该帧并累加滞后计数；连续滞后达到阈值即带码驱逐。
    /// 3. 驱逐在遍历结束后统一执行，不阻塞其他连接的投递。
    ///
    /// # Returns
    /// 实际入队的连接数。
    pub fn broadcast(&self, kind: DataKind, key: i32, frame: &OutboundFrame) -> usize {
        let mut delivered = 0usize;
        let mut to_evict = Vec::new();

        for entry in self.conns.iter() {
            let subscribed = {
                let subs = match entry.value().subs.read() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                subs.contains(&(kind, key))
            };
            if !subscribed {
                continue;
            }

            match entry.value().tx.try_send(frame.clone()) {
                Ok(()) => {
                    entry.value().lagging.store(0, Ordering::Relaxed);
                    delivered += 1;
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let streak = entry.value().lagging.fetch_add(1, Ordering::Relaxed) + 1;
                    if streak >= self.cfg.lagging_evict_after {
                        to_evict.push(*entry.key());
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // 会话已消亡但尚未注销
                    to_evict.push(*entry.key());
                }
            }
        }

        for id in to_evict {
            self.evict(id, CLOSE_SLOW_CONSUMER, "slow consumer");
        }
        delivered
    }

    /// # Summary
    /// 带码驱逐：设置关闭信号并从注册表摘除。
    /// 摘除使队列发送端落地，写循环排空残余帧后按关闭码收尾。
    pub fn evict(&self, id: ConnId, code: u16, reason: &'static str) {
        if let Some((_, handle)) = self.conns.remove(&id) {
            handle.close.set(code, reason);
            warn!(conn = id, code, reason, "connection evicted");
        }
    }

    /// # Summary
    /// 心跳一轮：向全部连接入队 Ping，驱逐超过两个心跳间隔无活性的连接。
    fn heartbeat_tick(&self) {
        let stale_after = Duration::from_secs(self.cfg.heartbeat_secs * 2);
        let mut to_evict = Vec::new();

        for entry in self.conns.iter() {
            let last_seen = {
                let guard = match entry.value().last_seen.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                *guard
            };
            if last_seen.elapsed() > stale_after {
                to_evict.push(*entry.key());
                continue;
            }
            // 心跳溢出不计入滞后: 队列满本身已由广播路径计数
            let _ = entry.value().tx.try_send(OutboundFrame::Ping);
        }

        for id in to_evict {
            self.evict(id, CLOSE_HEARTBEAT_TIMEOUT, "heartbeat timeout");
        }
    }

    /// 启动心跳循环任务。
    pub fn spawn_heartbeat(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            info!(
                interval_secs = registry.cfg.heartbeat_secs,
                "heartbeat loop started"
            );
            let mut ticker =
                tokio::time::interval(Duration::from_secs(registry.cfg.heartbeat_secs));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => registry.heartbeat_tick(),
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("heartbeat loop stopped");
                            return;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::protocol::ErrorCode;

    fn small_queue_cfg(queue: usize, evict_after: u32) -> WebSocketConfig {
        WebSocketConfig {
            queue_capacity: queue,
            lagging_evict_after: evict_after,
            ..WebSocketConfig::default()
        }
    }

    fn update_frame(key: i32, seq: usize) -> OutboundFrame {
        OutboundFrame::Error {
            code: ErrorCode::Internal,
            message: format!("{}:{}", key, seq),
        }
    }

    #[tokio::test]
    async fn test_connection_limit_enforced() {
        let cfg = WebSocketConfig {
            max_connections: 2,
            ..WebSocketConfig::default()
        };
        let registry = ConnectionRegistry::new(cfg);
        let _a = registry.add().expect("first connection");
        let _b = registry.add().expect("second connection");
        assert_eq!(
            registry.add().err(),
            Some(RegistryError::ConnectionLimit)
        );
    }

    #[tokio::test]
    async fn test_broadcast_only_reaches_subscribers() {
        let registry = ConnectionRegistry::new(WebSocketConfig::default());
        let mut sub = registry.add().expect("subscriber");
        let mut other = registry.add().expect("bystander");
        registry
            .subscribe(sub.id, DataKind::Candle, &[42])
            .expect("subscribe");

        let delivered = registry.broadcast(DataKind::Candle, 42, &update_frame(42, 0));
        assert_eq!(delivered, 1);
        assert!(sub.rx.try_recv().is_ok());
        assert!(other.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_lagging_consumer_evicted_others_unaffected() {
        // 场景: 队列 8，快消费者照收全部，慢消费者滞后 3 次后被驱逐
        let registry = ConnectionRegistry::new(small_queue_cfg(8, 3));
        let slow = registry.add().expect("slow consumer");
        let mut fast = registry.add().expect("fast consumer");
        registry
            .subscribe(slow.id, DataKind::Candle, &[42])
            .expect("subscribe slow");
        registry
            .subscribe(fast.id, DataKind::Candle, &[42])
            .expect("subscribe fast");

        let mut fast_received = 0;
        for seq in 0..16 {
            registry.broadcast(DataKind::Candle, 42, &update_frame(42, seq));
            // 快消费者持续排空
            while fast.rx.try_recv().is_ok() {
                fast_received += 1;
            }
        }

        // 慢消费者: 8 帧入队后队列满，第 11 帧时连续滞后 3 次被驱逐
        assert!(registry.conns.get(&slow.id).is_none());
        assert_eq!(
            slow.close.get(),
            Some((CLOSE_SLOW_CONSUMER, "slow consumer"))
        );
        // 快消费者收到全部 16 帧，不受驱逐影响
        assert_eq!(fast_received, 16);
    }

    #[tokio::test]
    async fn test_per_key_fifo_order_preserved() {
        let registry = ConnectionRegistry::new(WebSocketConfig::default());
        let mut slot = registry.add().expect("connection");
        registry
            .subscribe(slot.id, DataKind::Funding, &[7])
            .expect("subscribe");

        for seq in 0..10 {
            registry.broadcast(DataKind::Funding, 7, &update_frame(7, seq));
        }
        for seq in 0..10 {
            match slot.rx.try_recv().expect("frame present") {
                OutboundFrame::Error { message, .. } => {
                    assert_eq!(message, format!("7:{}", seq));
                }
                other => panic!("unexpected frame: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_subscription_limit() {
        let cfg = WebSocketConfig {
            max_subscriptions: 3,
            ..WebSocketConfig::default()
        };
        let registry = ConnectionRegistry::new(cfg);
        let slot = registry.add().expect("connection");
        registry
            .subscribe(slot.id, DataKind::Candle, &[1, 2, 3])
            .expect("within limit");
        assert_eq!(
            registry.subscribe(slot.id, DataKind::Candle, &[4]),
            Err(RegistryError::SubscriptionLimit)
        );
        // 重复订阅既有键不计入新增
        registry
            .subscribe(slot.id, DataKind::Candle, &[1, 2])
            .expect("re-subscribe is free");
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let registry = ConnectionRegistry::new(WebSocketConfig::default());
        let mut slot = registry.add().expect("connection");
        registry
            .subscribe(slot.id, DataKind::OpenInterest, &[5])
            .expect("subscribe");
        registry
            .unsubscribe(slot.id, DataKind::OpenInterest, &[5])
            .expect("unsubscribe");
        let delivered = registry.broadcast(DataKind::OpenInterest, 5, &update_frame(5, 0));
        assert_eq!(delivered, 0);
        assert!(slot.rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_evicts_silent_connection() {
        let cfg = WebSocketConfig {
            heartbeat_secs: 30,
            ..WebSocketConfig::default()
        };
        let registry = ConnectionRegistry::new(cfg);
        let silent = registry.add().expect("silent connection");
        let live = registry.add().expect("live connection");

        // 越过两个心跳间隔；live 连接中途刷新活性
        tokio::time::advance(Duration::from_secs(45)).await;
        registry.record_activity(live.id);
        tokio::time::advance(Duration::from_secs(20)).await;

        registry.heartbeat_tick();
        assert!(registry.conns.get(&silent.id).is_none());
        assert_eq!(
            silent.close.get(),
            Some((CLOSE_HEARTBEAT_TIMEOUT, "heartbeat timeout"))
        );
        assert!(registry.conns.get(&live.id).is_some());
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let registry = ConnectionRegistry::new(WebSocketConfig::default());
        let slot = registry.add().expect("connection");
        registry.remove(slot.id);
        registry.remove(slot.id);
        assert!(registry.is_empty());
    }
}
