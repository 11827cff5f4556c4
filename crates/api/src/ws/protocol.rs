//! # WebSocket 线协议
//!
//! 入站为带 `action` 判别的 JSON 文本帧，出站为带 `type` 判别的 JSON 文本帧。
//! 数值以字符串编码（经由 DTO 层），时间戳为 +00:00 偏移的 ISO 8601。
//!
//! 心跳采用单层机制：服务端按心跳间隔发送协议层 Ping，客户端栈自动回
//! Pong；任何入站帧同样刷新活性。应用层 `ping` 动作是客户端侧的延迟
//! 探测，服务端以携带相同关联 id 的 `pong` 帧应答。

use crate::types::{CandleDto, FundingDto, OpenInterestDto};
use serde::{Deserialize, Serialize};
use souba_core::common::DataKind;

/// 滞后消费者驱逐的关闭码。
pub const CLOSE_SLOW_CONSUMER: u16 = 4008;
/// 心跳超时驱逐的关闭码。
pub const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4009;
/// 鉴权失败的关闭码。
pub const CLOSE_AUTH_FAILED: u16 = 4401;
/// 连接数超限的关闭码。
pub const CLOSE_CONNECTION_LIMIT: u16 = 4429;

/// # Summary
/// 入站客户端动作。
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum InboundFrame {
    /// 订阅若干键；kind 为 candle 且给定 history 时先回放历史
    Subscribe {
        kind: DataKind,
        keys: Vec<i32>,
        #[serde(default)]
        history: Option<i64>,
    },
    /// 退订若干键
    Unsubscribe { kind: DataKind, keys: Vec<i32> },
    /// 延迟探测，id 原样回传
    Ping {
        #[serde(default)]
        id: Option<u64>,
    },
}

/// 出站错误码（连接保持打开的可恢复错误）。
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// 输入违反文档化约束
    Validation,
    /// 键无法解析
    UnknownKey,
    /// 订阅键数超限
    SubscriptionLimit,
    /// 内部故障
    Internal,
}

/// 实时更新行载荷，按数据种类取形。
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum UpdateRow {
    Candle(CandleDto),
    Funding(FundingDto),
    OpenInterest(OpenInterestDto),
}

/// # Summary
/// 出站服务端帧。
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    /// 动作确认
    Success {
        action: String,
        kind: DataKind,
        keys: Vec<i32>,
    },
    /// 可恢复错误（连接保持）
    Error { code: ErrorCode, message: String },
    /// 订阅时的历史回放，行时间升序，先于任何同键实时帧
    Historical { key: i32, rows: Vec<CandleDto> },
    /// 实时更新
    Update {
        kind: DataKind,
        key: i32,
        row: UpdateRow,
    },
    /// 服务端心跳（写循环映射为协议层 Ping）
    Ping,
    /// 应用层 ping 的应答
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_subscribe_parses() {
        let frame: InboundFrame = serde_json::from_str(
            r#"{"action":"subscribe","kind":"candle","keys":[42],"history":3}"#,
        )
        .expect("subscribe parses");
        match frame {
            InboundFrame::Subscribe { kind, keys, history } => {
                assert_eq!(kind, DataKind::Candle);
                assert_eq!(keys, vec![42]);
                assert_eq!(history, Some(3));
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_inbound_unknown_action_rejected() {
        let result = serde_json::from_str::<InboundFrame>(r#"{"action":"order","keys":[1]}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_outbound_update_shape() {
        let frame = OutboundFrame::Update {
            kind: DataKind::Candle,
            key: 42,
            row: UpdateRow::Candle(CandleDto {
                time: "2026-03-01T12:05:00+00:00".into(),
                open: "1".into(),
                high: "2".into(),
                low: "1".into(),
                close: "1.5".into(),
                volume: "10".into(),
                trade_count: None,
            }),
        };
        let json = serde_json::to_value(&frame).expect("serializes");
        assert_eq!(json["type"], "update");
        assert_eq!(json["kind"], "candle");
        assert_eq!(json["key"], 42);
        assert_eq!(json["row"]["close"], "1.5");
    }

    #[test]
    fn test_pong_carries_correlation_id() {
        let json =
            serde_json::to_value(OutboundFrame::Pong { id: Some(7) }).expect("serializes");
        assert_eq!(json["type"], "pong");
        assert_eq!(json["id"], 7);
    }
}
