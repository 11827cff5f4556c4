use crate::types::{CandleDto, FundingDto, OpenInterestDto};
use crate::ws::protocol::{OutboundFrame, UpdateRow};
use crate::ws::registry::ConnectionRegistry;
use futures::StreamExt;
use souba_core::common::DataKind;
use souba_core::store::port::{ChangeEvent, ChangeFeed, TimeSeriesStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 事件流中断后的重订阅间隔。
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(2);

/// # Summary
/// 启动扇出监听任务：进程内唯一的变更事件消费者。
///
/// # Logic
/// 1. 订阅存储层合并事件流；流中断时退避重订阅。
/// 2. 每个事件按主键读回完整行（触发器载荷只含键与时间），
///    具体化为 DTO 后交给注册表广播。
/// 3. 单事件失败只记录并跳过，不影响后续事件。
///
/// # Arguments
/// * `feed`: 变更事件订阅端口。
/// * `store`: 存储网关（主键读回）。
/// * `registry`: 连接注册表。
/// * `shutdown`: 关停信号。
pub fn spawn_fanout(
    feed: Arc<dyn ChangeFeed>,
    store: Arc<dyn TimeSeriesStore>,
    registry: Arc<ConnectionRegistry>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("fan-out listener started");
        loop {
            if *shutdown.borrow() {
                return;
            }
            let mut stream = match feed.subscribe().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "change feed subscribe failed, retrying");
                    tokio::time::sleep(RESUBSCRIBE_DELAY).await;
                    continue;
                }
            };

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("fan-out listener stopped");
                            return;
                        }
                    }
                    event = stream.next() => {
                        match event {
                            Some(event) => deliver(&store, &registry, event).await,
                            None => {
                                warn!("change feed stream ended, resubscribing");
                                break;
                            }
                        }
                    }
                }
            }
            tokio::time::sleep(RESUBSCRIBE_DELAY).await;
        }
    })
}

/// # Summary
/// 具体化并广播单个变更事件。行已不存在（载荷滞后于后续写入）时静默跳过。
async fn deliver(
    store: &Arc<dyn TimeSeriesStore>,
    registry: &Arc<ConnectionRegistry>,
    event: ChangeEvent,
) {
    let Some(time) = event.time_utc() else {
        warn!(time = event.time, "event timestamp out of range, skipping");
        return;
    };

    let row = match event.kind {
        DataKind::Candle => match store.candle_at(event.key, time).await {
            Ok(Some(candle)) => UpdateRow::Candle(CandleDto::from(&candle)),
            Ok(None) => {
                debug!(key = event.key, "candle row vanished before read-back");
                return;
            }
            Err(e) => {
                warn!(key = event.key, error = %e, "candle read-back failed");
                return;
            }
        },
        DataKind::Funding => match store.funding_at(event.key, time).await {
            Ok(Some(point)) => UpdateRow::Funding(FundingDto::from(&point)),
            Ok(None) => return,
            Err(e) => {
                warn!(key = event.key, error = %e, "funding read-back failed");
                return;
            }
        },
        DataKind::OpenInterest => match store.open_interest_at(event.key, time).await {
            Ok(Some(point)) => UpdateRow::OpenInterest(OpenInterestDto::from(&point)),
            Ok(None) => return,
            Err(e) => {
                warn!(key = event.key, error = %e, "open interest read-back failed");
                return;
            }
        },
    };

    let frame = OutboundFrame::Update {
        kind: event.kind,
        key: event.key,
        row,
    };
    registry.broadcast(event.kind, event.key, &frame);
}
