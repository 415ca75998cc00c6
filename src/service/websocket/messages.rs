//! WebSocket 消息协议定义
//!
//! 客户端消息为 aid-based JSON 帧；服务端除 rtn_data（见 protocol/）外
//! 还有 welcome / 订阅确认 / error 三种帧，形态固定，直接构建 Value。

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// 客户端消息
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "aid", rename_all = "snake_case")]
pub enum MdClientMessage {
    /// 订阅行情，ins_list 为逗号分隔合约列表，如 "SHFE.cu1612,CFFEX.IF1701"
    SubscribeQuote { ins_list: String },

    /// 长轮询拉取下一帧快照
    PeekMessage,
}

/// 会话接入时的欢迎帧
pub fn welcome_frame(session_id: &str, ctp_connected: bool, timestamp_ms: i64) -> Value {
    json!({
        "type": "welcome",
        "message": "Connected to QuantAxis MarketData Server",
        "session_id": session_id,
        "ctp_connected": ctp_connected,
        "timestamp": timestamp_ms,
    })
}

/// 订阅确认帧
pub fn subscribe_ack_frame() -> Value {
    json!({
        "aid": "subscribe_quote",
        "status": "ok",
    })
}

/// 错误帧（协议错误不断开通道）
pub fn error_frame(message: &str, timestamp_ms: i64) -> Value {
    json!({
        "type": "error",
        "message": message,
        "timestamp": timestamp_ms,
    })
}
