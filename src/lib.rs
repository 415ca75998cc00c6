//! # QAMD-GATEWAY
//!
//! 高性能期货行情网关 - 多CTP前置连接池 + 增量快照推送
//!
//! ## 核心能力
//!
//! - **多前置连接池**: 多个CTP行情前置并行接入，健康检查 + 自动重启 (upstream/)
//! - **订阅分发**: 合约订阅轮询负载均衡、故障转移、定期重试 (dispatch/)
//! - **行情缓存**: 按合约分槽的 SeqLock 缓存，单写多读、版本号单调递增 (market/)
//! - **增量推送**: peek_message 长轮询 + 字段级差分快照 (service/websocket/)
//!
//! ## 架构设计
//!
//! ```text
//! CTP前置 x N (vendor回调线程)
//!     ↓ on_tick
//! CtpConnection (upstream/) ──→ QuoteCache [SeqLock] (market/)
//!     ↓ 订阅回报                      ↓ 唤醒通道 (crossbeam)
//! SubscriptionDispatcher (dispatch/)  SessionRegistry (service/websocket/)
//!                                      ↓ peek / rtn_data
//!                                 MdSession x M (actix ws actor)
//! ```
//!
//! ## 性能目标
//!
//! - 回调线程零锁：tick 路径只触碰 SeqLock 槽位与无锁通道
//! - 推送延迟: 行情落缓存 → 挂起会话收到差分帧 < 1ms (本机)
//! - 并发会话数: > 1,000

#![allow(dead_code)]

// ============================================================================
// 外部依赖
// ============================================================================

// Web 框架
pub use actix;
pub use actix_web;

// 异步运行时
pub use futures;
pub use tokio;

// 并发工具
pub use crossbeam;
pub use dashmap;
pub use parking_lot;

// 序列化
pub use serde;
pub use serde_json;

// 时间
pub use chrono;

// 日志
pub use log;

// 错误处理
pub use anyhow;
pub use thiserror;

// ============================================================================
// 内部模块
// ============================================================================

/// 行情数据模型与缓存 (Quote / SeqLock QuoteCache / 合约映射)
pub mod market;

/// 上游CTP连接 (单连接状态机 + 连接池 + 健康监控)
pub mod upstream;

/// 全局订阅分发器 (负载均衡 / 故障转移 / 重试)
pub mod dispatch;

/// 推送协议 (全量/差分快照 JSON 构建)
pub mod protocol;

/// 对外服务层 (WebSocket)
pub mod service;

/// 工具模块 (配置)
pub mod utils;

// ============================================================================
// 全局错误类型
// ============================================================================

/// 网关错误类型
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Subscription error: {0}")]
    SubscriptionError(String),

    #[error("Quote cache capacity exceeded: {0}")]
    CacheCapacity(String),

    #[error("Service error: {0}")]
    ServiceError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("IO error: {0}")]
    IOError(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

// ============================================================================
// 重导出常用类型
// ============================================================================

pub use dispatch::{SubscriptionDispatcher, SubscriptionStatus};
pub use market::cache::QuoteCache;
pub use market::directory::InstrumentDirectory;
pub use market::{DepthMarketData, Quote};
pub use upstream::pool::CtpConnectionPool;
pub use upstream::{CtpConnectionStatus, DispatcherEvents, MdApi, MdApiFactory, QuoteSink};
pub use utils::config::{CtpConnectionConfig, GatewayConfig};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = GatewayError::ConfigError("missing connections".to_string());
        assert_eq!(e.to_string(), "Configuration error: missing connections");
    }
}
