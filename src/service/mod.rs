//! 对外服务层
//!
//! 基于 actix-web 的 WebSocket 接入，每个客户端通道一个会话 Actor。

pub mod websocket;
