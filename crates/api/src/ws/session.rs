use crate::server::AppState;
use crate::ws::protocol::{
    CLOSE_AUTH_FAILED, CLOSE_CONNECTION_LIMIT, ErrorCode, InboundFrame, OutboundFrame,
};
use crate::ws::registry::{CloseSignal, ConnId, ConnectionSlot};
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use souba_core::common::DataKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// 单键历史回放行数硬上限。
const HISTORY_CAP: i64 = 1000;

/// # Summary
/// `/ws` 升级入口。
///
/// # Logic
/// 1. 配置了鉴权令牌时校验 `Authorization: Bearer`；失败仍完成升级，
///    随即以专用关闭码收尾（客户端可见失败原因）。
/// 2. 入站消息字节上限来自配置，超限由协议栈关闭连接。
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    let auth_ok = match &state.config.server.auth_token {
        None => true,
        Some(expected) => headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|token| token == expected.as_str()),
    };

    ws.max_message_size(state.config.websocket.max_message_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state, auth_ok))
}

/// # Summary
/// 单连接会话：读任务解析入站动作，写任务排空出站队列，二者经
/// 注册表的有界队列通信。任一侧结束即注销连接，清理幂等。
async fn handle_socket(socket: WebSocket, state: AppState, auth_ok: bool) {
    let (mut sink, mut stream) = socket.split();

    if !auth_ok {
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_AUTH_FAILED,
                reason: "authentication failed".into(),
            })))
            .await;
        return;
    }

    let ConnectionSlot { id, rx, close } = match state.registry.add() {
        Ok(slot) => slot,
        Err(e) => {
            debug!(error = %e, "connection rejected");
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_CONNECTION_LIMIT,
                    reason: "connection limit reached".into(),
                })))
                .await;
            return;
        }
    };

    let write_task = tokio::spawn(write_loop(sink, rx, close));

    // 读循环: 任何入站帧都刷新活性
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                state.registry.record_activity(id);
                process_frame(&state, id, text.as_str()).await;
            }
            Ok(Message::Pong(_)) | Ok(Message::Ping(_)) => {
                state.registry.record_activity(id);
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    // 注销丢弃出站队列; 写任务排空后自行收尾
    state.registry.remove(id);
    let _ = write_task.await;
}

/// # Summary
/// 写循环：排空出站队列写入套接字；队列尽头按关闭信号带码收尾。
/// `Ping` 帧映射为协议层 Ping，其余帧序列化为 JSON 文本。
async fn write_loop(
    mut sink: futures::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<OutboundFrame>,
    close: Arc<CloseSignal>,
) {
    while let Some(frame) = rx.recv().await {
        let message = match &frame {
            OutboundFrame::Ping => Message::Ping(Vec::new().into()),
            other => match serde_json::to_string(other) {
                Ok(json) => Message::Text(json.into()),
                Err(e) => {
                    warn!(error = %e, "outbound frame serialization failed");
                    continue;
                }
            },
        };
        if sink.send(message).await.is_err() {
            return;
        }
    }

    if let Some((code, reason)) = close.get() {
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: reason.into(),
            })))
            .await;
    }
}

/// 向连接入队一帧，忽略满队（会话应答不计入滞后）。
fn reply(state: &AppState, id: ConnId, frame: OutboundFrame) {
    if !state.registry.send_to(id, frame) {
        debug!(conn = id, "reply dropped (queue full or connection gone)");
    }
}

fn reply_error(state: &AppState, id: ConnId, code: ErrorCode, message: impl Into<String>) {
    reply(
        state,
        id,
        OutboundFrame::Error {
            code,
            message: message.into(),
        },
    );
}

/// # Summary
/// 处理一条入站文本帧。
///
/// # Logic
/// 1. 解析失败是可恢复错误：回 validation 错误帧，连接保持。
/// 2. 订阅：先校验键可解析，再同步读历史（仅 K 线）入队，
///    随后才在注册表登记，因此历史严格先于任何同键实时帧。
/// 3. 退订与 ping 直接镜像应答。
async fn process_frame(state: &AppState, id: ConnId, raw: &str) {
    let frame: InboundFrame = match serde_json::from_str(raw) {
        Ok(frame) => frame,
        Err(e) => {
            reply_error(state, id, ErrorCode::Validation, format!("bad frame: {}", e));
            return;
        }
    };

    match frame {
        InboundFrame::Subscribe { kind, keys, history } => {
            handle_subscribe(state, id, kind, keys, history).await;
        }
        InboundFrame::Unsubscribe { kind, keys } => {
            match state.registry.unsubscribe(id, kind, &keys) {
                Ok(()) => reply(
                    state,
                    id,
                    OutboundFrame::Success {
                        action: "unsubscribe".to_string(),
                        kind,
                        keys,
                    },
                ),
                Err(e) => reply_error(state, id, ErrorCode::Internal, e.to_string()),
            }
        }
        InboundFrame::Ping { id: correlation } => {
            reply(state, id, OutboundFrame::Pong { id: correlation });
        }
    }
}

async fn handle_subscribe(
    state: &AppState,
    id: ConnId,
    kind: DataKind,
    keys: Vec<i32>,
    history: Option<i64>,
) {
    if keys.is_empty() {
        reply_error(state, id, ErrorCode::Validation, "keys must not be empty");
        return;
    }

    // 键必须解析到已知序列/市场，未知键不得擅自注册
    let unknown: Vec<i32> = keys
        .iter()
        .copied()
        .filter(|key| match kind {
            DataKind::Candle => state.resolver.series_by_id(*key).is_none(),
            DataKind::Funding | DataKind::OpenInterest => {
                state.resolver.market_by_id(*key).is_none()
            }
        })
        .collect();
    if !unknown.is_empty() {
        reply_error(
            state,
            id,
            ErrorCode::UnknownKey,
            format!("unknown keys: {:?}", unknown),
        );
        return;
    }

    // 历史回放仅支持 K 线，且必须先于实时注册完成
    if let Some(count) = history {
        if count > 0 && kind == DataKind::Candle {
            let capped = count.min(HISTORY_CAP);
            for key in &keys {
                if !send_history(state, id, *key, capped).await {
                    return;
                }
            }
        }
    }

    match state.registry.subscribe(id, kind, &keys) {
        Ok(()) => reply(
            state,
            id,
            OutboundFrame::Success {
                action: "subscribe".to_string(),
                kind,
                keys,
            },
        ),
        Err(e) => reply_error(state, id, ErrorCode::SubscriptionLimit, e.to_string()),
    }
}

/// # Summary
/// 读取并入队单键历史回放。行以时间升序发出。
///
/// # Returns
/// false 表示读取失败（错误帧已入队），调用方应放弃本次订阅。
async fn send_history(state: &AppState, id: ConnId, key: i32, limit: i64) -> bool {
    let timeout = Duration::from_secs(state.config.websocket.history_timeout_secs);
    let read = state.store.candle_range(
        key,
        DateTime::<Utc>::UNIX_EPOCH,
        Utc::now(),
        Some(limit),
    );

    match tokio::time::timeout(timeout, read).await {
        Ok(Ok(mut rows)) => {
            // 区间读取返回时间降序; 回放要求升序
            rows.reverse();
            let dtos = rows.iter().map(Into::into).collect();
            reply(state, id, OutboundFrame::Historical { key, rows: dtos });
            true
        }
        Ok(Err(e)) => {
            reply_error(state, id, ErrorCode::Internal, e.to_string());
            false
        }
        Err(_) => {
            reply_error(state, id, ErrorCode::Internal, "history read timed out");
            false
        }
    }
}
