use crate::adapters;
use crate::aggregator::{AggregatorHandle, spawn_flusher};
use crate::runner::{CollectorRunner, CollectorState};
use dashmap::DashMap;
use souba_core::config::CollectorConfig;
use souba_core::market::port::ExchangeAdapter;
use souba_core::store::port::{SeriesFilter, SeriesResolver, TimeSeriesStore};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// # Summary
/// 采集监督者：持有全部采集任务与冲洗任务，负责启动、冷却重启与优雅关停。
///
/// # Invariants
/// - 每个活跃交易所一个采集任务加一个冲洗任务。
/// - 非关停期间的任务退出（panic）在冷却后重启。
/// - 关停顺序：广播信号 → 宽限等待在途写入 → 强制中止残余任务。
pub struct Supervisor {
    shutdown_tx: watch::Sender<bool>,
    states: Arc<DashMap<String, CollectorState>>,
    tasks: Vec<JoinHandle<()>>,
    grace: Duration,
}

impl Supervisor {
    /// # Summary
    /// 启动全部活跃交易所的采集。
    ///
    /// # Logic
    /// 1. 由解析器快照提取活跃交易所集合。
    /// 2. 无适配器的交易所记警告并跳过（编译期封闭集合之外的配置）。
    /// 3. 每交易所：一个聚合缓冲对、一个边界冲洗任务、一个带重启环的采集任务。
    ///
    /// # Arguments
    /// * `resolver`: 参照解析器。
    /// * `store`: 存储网关。
    /// * `cfg`: 采集配置。
    ///
    /// # Returns
    /// 监督者实例，由调用方持有至进程退出。
    pub fn start(
        resolver: Arc<dyn SeriesResolver>,
        store: Arc<dyn TimeSeriesStore>,
        cfg: CollectorConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let states: Arc<DashMap<String, CollectorState>> = Arc::new(DashMap::new());
        let mut tasks = Vec::new();

        let exchanges: BTreeSet<String> = resolver
            .active_series(&SeriesFilter::default())
            .into_iter()
            .map(|s| s.exchange)
            .collect();

        for exchange in exchanges {
            let Some(adapter) = adapters::adapter_for(&exchange) else {
                warn!(exchange, "no adapter for configured exchange, skipping");
                continue;
            };

            let agg = AggregatorHandle::new();
            tasks.push(spawn_flusher(
                exchange.clone(),
                Arc::clone(&store),
                agg.clone(),
                shutdown_rx.clone(),
            ));

            states.insert(exchange.clone(), CollectorState::Idle);
            tasks.push(tokio::spawn(supervise_collector(
                adapter,
                Arc::clone(&resolver),
                Arc::clone(&store),
                agg,
                cfg.clone(),
                Arc::clone(&states),
                shutdown_rx.clone(),
            )));
        }

        info!(tasks = tasks.len(), "collector supervisor started");
        Self {
            shutdown_tx,
            states,
            tasks,
            grace: Duration::from_secs(cfg.shutdown_grace_secs),
        }
    }

    /// 当前各采集器状态快照，供健康检查输出。
    pub fn states(&self) -> HashMap<String, String> {
        self.states
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().to_string()))
            .collect()
    }

    /// # Summary
    /// 优雅关停：通知全部任务，宽限期内等待在途写入与缓冲冲洗，随后强制中止。
    ///
    /// # Logic
    /// 1. 广播关停信号；采集器停收新帧，冲洗任务同步冲洗残余缓冲。
    /// 2. 等待全部任务退出，至多 `shutdown_grace_secs`。
    /// 3. 宽限耗尽后逐一 abort 残余任务。
    pub async fn shutdown(self) {
        info!("collector supervisor shutting down");
        let _ = self.shutdown_tx.send(true);

        let aborts: Vec<_> = self.tasks.iter().map(|t| t.abort_handle()).collect();
        let drained =
            tokio::time::timeout(self.grace, futures_util::future::join_all(self.tasks)).await;

        match drained {
            Ok(_) => info!("all collector tasks drained"),
            Err(_) => {
                warn!("shutdown grace expired, aborting remaining tasks");
                for abort in aborts {
                    abort.abort();
                }
            }
        }
    }
}

/// # Summary
/// 单交易所监督环：运行器退出后（非关停）冷却重启。
///
/// # Logic
/// 1. 运行器在独立任务中执行，panic 被 JoinHandle 捕获而不波及监督环。
/// 2. 正常返回只发生在关停；其余退出记录后按冷却时长重启。
async fn supervise_collector(
    adapter: Arc<dyn ExchangeAdapter>,
    resolver: Arc<dyn SeriesResolver>,
    store: Arc<dyn TimeSeriesStore>,
    agg: AggregatorHandle,
    cfg: CollectorConfig,
    states: Arc<DashMap<String, CollectorState>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let exchange = adapter.name();
    loop {
        let runner = CollectorRunner::new(
            Arc::clone(&adapter),
            Arc::clone(&resolver),
            Arc::clone(&store),
            agg.clone(),
            cfg.clone(),
            Arc::clone(&states),
            shutdown.clone(),
        );
        let handle = tokio::spawn(runner.run());
        if let Err(e) = handle.await {
            warn!(exchange, error = %e, "collector task aborted abnormally");
        }

        if *shutdown.borrow() {
            return;
        }

        states.insert(exchange.to_string(), CollectorState::Idle);
        warn!(
            exchange,
            cooldown_secs = cfg.restart_cooldown_secs,
            "collector exited unexpectedly, restarting after cooldown"
        );
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(cfg.restart_cooldown_secs)) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}
