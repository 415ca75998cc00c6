//! 上游行情连接
//!
//! 一个 `CtpConnection` 对应一条行情前置会话：连接 → 登录 → 订阅 → 收行情。
//! `CtpConnectionPool` 持有全部连接并负责健康监控与重启。
//!
//! vendor 行情库只暴露窄接口（[`MdApi`] / [`MdApiFactory`]），回调事件由
//! 连接的 `on_*` 方法接收。连接对外的回报通过 [`DispatcherEvents`] 与
//! [`QuoteSink`] 两个窄回调面送出，避免连接层反向依赖分发器与缓存的具体类型。

pub mod connection;
pub mod pool;

use std::sync::{Arc, Weak};

use crate::market::Quote;

pub use connection::CtpConnection;

/// 连接状态机
///
/// DISCONNECTED → CONNECTING → CONNECTED → LOGGED_IN；任意状态传输断开
/// 回到 DISCONNECTED；累计错误过多时闩锁到 ERROR。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtpConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    LoggedIn,
    Error,
}

impl CtpConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CtpConnectionStatus::Disconnected => "DISCONNECTED",
            CtpConnectionStatus::Connecting => "CONNECTING",
            CtpConnectionStatus::Connected => "CONNECTED",
            CtpConnectionStatus::LoggedIn => "LOGGED_IN",
            CtpConnectionStatus::Error => "ERROR",
        }
    }
}

/// vendor 回报附带的错误信息
#[derive(Debug, Clone, Default)]
pub struct RspInfo {
    pub error_id: i32,
    pub error_msg: String,
}

impl RspInfo {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn error(error_id: i32, error_msg: &str) -> Self {
        Self {
            error_id,
            error_msg: error_msg.to_string(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error_id != 0
    }
}

/// vendor 行情 API 面（每连接一个实例）
///
/// 请求均为异步发起，结果经连接的 `on_*` 回调返回；返回值为发送层
/// 返回码，0 表示请求已送出。
pub trait MdApi: Send + Sync {
    /// 发起连接（结果经 `on_front_connected` 返回）
    fn connect(&self);

    /// 释放会话
    fn release(&self);

    /// 行情登录（仅需 broker_id，用户名密码为空）
    fn req_user_login(&self, broker_id: &str, request_id: i32) -> i32;

    fn subscribe_market_data(&self, instrument_id: &str) -> i32;

    fn unsubscribe_market_data(&self, instrument_id: &str) -> i32;
}

/// vendor API 工厂（连接启动时创建会话实例）
pub trait MdApiFactory: Send + Sync {
    fn create_md_api(
        &self,
        connection_id: &str,
        flow_path: &str,
        front_addr: &str,
        spi: Weak<CtpConnection>,
    ) -> crate::Result<Arc<dyn MdApi>>;
}

/// 连接 → 分发器的事件回调面
///
/// 实现方不得在调用线程上做阻塞操作：vendor 回调线程会直接进入这里。
pub trait DispatcherEvents: Send + Sync {
    fn on_subscription_success(&self, connection_id: &str, instrument_id: &str);
    fn on_subscription_failed(&self, connection_id: &str, instrument_id: &str);
    fn on_unsubscription_success(&self, connection_id: &str, instrument_id: &str);
    fn on_connection_failure(&self, connection_id: &str);
    fn on_connection_recovery(&self, connection_id: &str);
}

/// tick 路径的行情写入面
pub trait QuoteSink: Send + Sync {
    fn publish_quote(&self, raw_instrument: &str, quote: &Quote) -> crate::Result<()>;
}

impl QuoteSink for crate::market::cache::QuoteCache {
    fn publish_quote(&self, raw_instrument: &str, quote: &Quote) -> crate::Result<()> {
        self.publish(raw_instrument, quote)
    }
}

#[cfg(test)]
pub(crate) mod testkit {
    //! 单元测试共用的 vendor 桩实现

    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};

    pub struct MockMdApi {
        pub connected: AtomicBool,
        pub released: AtomicBool,
        /// subscribe/unsubscribe 的发送层返回码
        pub subscribe_ret: AtomicI32,
        pub unsubscribe_ret: AtomicI32,
        pub login_ret: AtomicI32,
        pub login_requests: AtomicU32,
        pub subscribes: Mutex<Vec<String>>,
        pub unsubscribes: Mutex<Vec<String>>,
    }

    impl MockMdApi {
        pub fn new() -> Self {
            Self {
                connected: AtomicBool::new(false),
                released: AtomicBool::new(false),
                subscribe_ret: AtomicI32::new(0),
                unsubscribe_ret: AtomicI32::new(0),
                login_ret: AtomicI32::new(0),
                login_requests: AtomicU32::new(0),
                subscribes: Mutex::new(Vec::new()),
                unsubscribes: Mutex::new(Vec::new()),
            }
        }
    }

    impl MdApi for MockMdApi {
        fn connect(&self) {
            self.connected.store(true, Ordering::SeqCst);
        }

        fn release(&self) {
            self.released.store(true, Ordering::SeqCst);
        }

        fn req_user_login(&self, _broker_id: &str, _request_id: i32) -> i32 {
            self.login_requests.fetch_add(1, Ordering::SeqCst);
            self.login_ret.load(Ordering::SeqCst)
        }

        fn subscribe_market_data(&self, instrument_id: &str) -> i32 {
            let ret = self.subscribe_ret.load(Ordering::SeqCst);
            if ret == 0 {
                self.subscribes.lock().push(instrument_id.to_string());
            }
            ret
        }

        fn unsubscribe_market_data(&self, instrument_id: &str) -> i32 {
            let ret = self.unsubscribe_ret.load(Ordering::SeqCst);
            if ret == 0 {
                self.unsubscribes.lock().push(instrument_id.to_string());
            }
            ret
        }
    }

    /// 按 connection_id 留存桩实例，便于测试驱动回调
    pub struct MockMdApiFactory {
        pub apis: Mutex<HashMap<String, Arc<MockMdApi>>>,
    }

    impl MockMdApiFactory {
        pub fn new() -> Self {
            Self {
                apis: Mutex::new(HashMap::new()),
            }
        }

        pub fn api_of(&self, connection_id: &str) -> Arc<MockMdApi> {
            self.apis.lock().get(connection_id).cloned().unwrap()
        }
    }

    impl MdApiFactory for MockMdApiFactory {
        fn create_md_api(
            &self,
            connection_id: &str,
            _flow_path: &str,
            _front_addr: &str,
            _spi: Weak<CtpConnection>,
        ) -> crate::Result<Arc<dyn MdApi>> {
            let api = Arc::new(MockMdApi::new());
            self.apis
                .lock()
                .insert(connection_id.to_string(), api.clone());
            Ok(api)
        }
    }

    /// 丢弃所有行情的写入面
    pub struct NullQuoteSink;

    impl QuoteSink for NullQuoteSink {
        fn publish_quote(&self, _raw: &str, _quote: &Quote) -> crate::Result<()> {
            Ok(())
        }
    }
}
