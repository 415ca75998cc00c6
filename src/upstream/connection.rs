//! 单条行情前置连接
//!
//! 持有一个 vendor 会话实例，维护状态机与已订阅集合。订阅集合以本结构
//! 为准（分发器侧只是反查索引）。vendor 回调线程直接进入 `on_*` 方法，
//! 这些方法只触碰本连接的状态、SeqLock 缓存与事件回调面，不得在其中
//! 等待任何分发器/会话锁。

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use super::{
    CtpConnectionStatus, DispatcherEvents, MdApi, MdApiFactory, QuoteSink, RspInfo,
};
use crate::market::{DepthMarketData, Quote};
use crate::market::directory::InstrumentDirectory;
use crate::utils::config::CtpConnectionConfig;

/// 累计错误超过该值后闩锁到 ERROR，交给健康监控重启
const ERROR_LATCH_THRESHOLD: u32 = 10;

/// restart 时 stop 与 start 之间的静默期
const RESTART_DELAY: Duration = Duration::from_secs(2);

/// tick 延迟统计输出周期（回调次数）
const TICK_STATS_PERIOD: u64 = 50_000;

pub struct CtpConnection {
    config: CtpConnectionConfig,

    status: RwLock<CtpConnectionStatus>,

    /// 已订阅合约（canonical，容量约束在此强制）
    subscribed: Mutex<BTreeSet<String>>,

    error_count: AtomicU32,
    request_id: AtomicI32,

    api: RwLock<Option<Arc<dyn MdApi>>>,
    factory: Arc<dyn MdApiFactory>,

    dispatcher: Weak<dyn DispatcherEvents>,
    quote_sink: Arc<dyn QuoteSink>,
    directory: Arc<InstrumentDirectory>,

    /// 服务器级运行标志，restart 期间观察
    running: Arc<AtomicBool>,

    /// flow 目录根（`<flow_base>/<connection_id>/`）
    flow_base: PathBuf,

    tick_total_ns: AtomicU64,
    tick_count: AtomicU64,
}

impl CtpConnection {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: CtpConnectionConfig,
        factory: Arc<dyn MdApiFactory>,
        dispatcher: Weak<dyn DispatcherEvents>,
        quote_sink: Arc<dyn QuoteSink>,
        directory: Arc<InstrumentDirectory>,
        running: Arc<AtomicBool>,
        flow_base: PathBuf,
    ) -> Self {
        Self {
            config,
            status: RwLock::new(CtpConnectionStatus::Disconnected),
            subscribed: Mutex::new(BTreeSet::new()),
            error_count: AtomicU32::new(0),
            request_id: AtomicI32::new(0),
            api: RwLock::new(None),
            factory,
            dispatcher,
            quote_sink,
            directory,
            running,
            flow_base,
            tick_total_ns: AtomicU64::new(0),
            tick_count: AtomicU64::new(0),
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.config.connection_id
    }

    pub fn config(&self) -> &CtpConnectionConfig {
        &self.config
    }

    pub fn status(&self) -> CtpConnectionStatus {
        *self.status.read()
    }

    pub fn error_count(&self) -> u32 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscribed.lock().len()
    }

    pub fn subscribed_instruments(&self) -> Vec<String> {
        self.subscribed.lock().iter().cloned().collect()
    }

    pub fn can_accept_more(&self) -> bool {
        if self.status() != CtpConnectionStatus::LoggedIn {
            return false;
        }
        self.subscribed.lock().len() < self.config.max_subscriptions
    }

    /// 发起连接：DISCONNECTED → CONNECTING
    ///
    /// 已越过 DISCONNECTED 时直接返回 false，不改变任何状态。
    pub fn start(self: Arc<Self>) -> bool {
        {
            let mut status = self.status.write();
            if *status != CtpConnectionStatus::Disconnected {
                return false;
            }
            *status = CtpConnectionStatus::Connecting;
        }

        let flow_path = self.flow_base.join(&self.config.connection_id);
        if let Err(e) = std::fs::create_dir_all(&flow_path) {
            log::warn!(
                "Failed to create flow directory {}: {}",
                flow_path.display(),
                e
            );
        }

        let api = match self.factory.create_md_api(
            &self.config.connection_id,
            &flow_path.to_string_lossy(),
            &self.config.front_addr,
            Arc::downgrade(&self),
        ) {
            Ok(api) => api,
            Err(e) => {
                log::error!(
                    "Failed to create MD API for connection {}: {}",
                    self.config.connection_id,
                    e
                );
                *self.status.write() = CtpConnectionStatus::Error;
                return false;
            }
        };

        // 先挂好 API 句柄再发起连接，回调到达时 login 可用
        *self.api.write() = Some(api.clone());
        api.connect();

        log::info!("CTP connection {} starting...", self.config.connection_id);
        true
    }

    /// 关闭会话，清空订阅集合，回到 DISCONNECTED
    pub fn stop(&self) {
        *self.status.write() = CtpConnectionStatus::Disconnected;

        if let Some(api) = self.api.write().take() {
            api.release();
        }

        self.subscribed.lock().clear();

        log::info!("CTP connection {} stopped", self.config.connection_id);
    }

    /// 停止后静默 2 秒再重启；服务器停机中则放弃
    pub fn restart(self: Arc<Self>) -> bool {
        log::info!("Restarting CTP connection: {}", self.config.connection_id);
        self.stop();
        std::thread::sleep(RESTART_DELAY);

        if !self.running.load(Ordering::Relaxed) {
            log::info!(
                "Server is stopping, cancelling restart of {}",
                self.config.connection_id
            );
            return false;
        }

        self.start()
    }

    /// 订阅一个合约（幂等：已订阅直接返回成功，不发网络请求）
    pub fn subscribe_instrument(&self, instrument_id: &str) -> bool {
        if self.status() != CtpConnectionStatus::LoggedIn {
            log::warn!(
                "CTP connection {} not ready for subscription",
                self.config.connection_id
            );
            return false;
        }

        let mut subscribed = self.subscribed.lock();

        if subscribed.contains(instrument_id) {
            log::warn!(
                "Instrument {} already subscribed on connection {}",
                instrument_id,
                self.config.connection_id
            );
            return true;
        }

        if subscribed.len() >= self.config.max_subscriptions {
            log::warn!(
                "Connection {} has reached max subscriptions limit",
                self.config.connection_id
            );
            return false;
        }

        let api = match self.api.read().clone() {
            Some(api) => api,
            None => return false,
        };

        let ret = api.subscribe_market_data(instrument_id);
        if ret == 0 {
            subscribed.insert(instrument_id.to_string());
            log::info!(
                "Subscribed to {} on connection {}",
                instrument_id,
                self.config.connection_id
            );
            true
        } else {
            log::error!(
                "Failed to subscribe to {} on connection {}, return code: {}",
                instrument_id,
                self.config.connection_id,
                ret
            );
            self.error_count.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// 退订一个合约（未订阅视为成功）
    pub fn unsubscribe_instrument(&self, instrument_id: &str) -> bool {
        if self.status() != CtpConnectionStatus::LoggedIn {
            return false;
        }

        let mut subscribed = self.subscribed.lock();

        if !subscribed.contains(instrument_id) {
            return true;
        }

        let api = match self.api.read().clone() {
            Some(api) => api,
            None => return false,
        };

        let ret = api.unsubscribe_market_data(instrument_id);
        if ret == 0 {
            subscribed.remove(instrument_id);
            log::info!(
                "Unsubscribed from {} on connection {}",
                instrument_id,
                self.config.connection_id
            );
            true
        } else {
            log::error!(
                "Failed to unsubscribe from {} on connection {}, return code: {}",
                instrument_id,
                self.config.connection_id,
                ret
            );
            self.error_count.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    // ------------------------------------------------------------------
    // vendor 回调入口（回调线程上下文）
    // ------------------------------------------------------------------

    /// 传输层就绪：CONNECTING → CONNECTED，随即发起登录
    pub fn on_front_connected(&self) {
        log::info!(
            "CTP connection {} front connected",
            self.config.connection_id
        );
        *self.status.write() = CtpConnectionStatus::Connected;
        self.login();
    }

    /// 传输层断开：任意状态 → DISCONNECTED，通知分发器故障转移
    pub fn on_front_disconnected(&self, reason: i32) {
        log::warn!(
            "CTP connection {} front disconnected, reason: {}",
            self.config.connection_id,
            reason
        );
        *self.status.write() = CtpConnectionStatus::Disconnected;
        self.error_count.fetch_add(1, Ordering::Relaxed);

        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.on_connection_failure(&self.config.connection_id);
        }
    }

    pub fn on_rsp_user_login(&self, rsp: &RspInfo) {
        if rsp.is_error() {
            log::error!(
                "CTP login failed on connection {}: {}",
                self.config.connection_id,
                rsp.error_msg
            );
            *self.status.write() = CtpConnectionStatus::Error;
            self.error_count.fetch_add(1, Ordering::Relaxed);
            return;
        }

        log::info!(
            "CTP login successful on connection {}",
            self.config.connection_id
        );
        *self.status.write() = CtpConnectionStatus::LoggedIn;

        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.on_connection_recovery(&self.config.connection_id);
        }
    }

    pub fn on_rsp_sub_market_data(&self, instrument_id: &str, rsp: &RspInfo) {
        if rsp.is_error() {
            log::error!(
                "Subscribe market data failed on connection {}: {}",
                self.config.connection_id,
                rsp.error_msg
            );
            // 上游拒绝，订阅集合回退，容量统计保持准确
            self.subscribed.lock().remove(instrument_id);
            self.error_count.fetch_add(1, Ordering::Relaxed);

            if let Some(dispatcher) = self.dispatcher.upgrade() {
                dispatcher.on_subscription_failed(&self.config.connection_id, instrument_id);
            }
            return;
        }

        log::info!(
            "Successfully subscribed to {} on connection {}",
            instrument_id,
            self.config.connection_id
        );
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.on_subscription_success(&self.config.connection_id, instrument_id);
        }
    }

    pub fn on_rsp_unsub_market_data(&self, instrument_id: &str, rsp: &RspInfo) {
        if rsp.is_error() {
            log::error!(
                "Unsubscribe market data failed on connection {}: {}",
                self.config.connection_id,
                rsp.error_msg
            );
            self.error_count.fetch_add(1, Ordering::Relaxed);
            return;
        }

        log::info!(
            "Successfully unsubscribed from {} on connection {}",
            instrument_id,
            self.config.connection_id
        );
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.on_unsubscription_success(&self.config.connection_id, instrument_id);
        }
    }

    /// 深度行情回调（热路径）
    ///
    /// 查映射、构建快照、写 SeqLock 缓存，全程无阻塞等待。
    pub fn on_tick(&self, depth: &DepthMarketData) {
        let start = Instant::now();
        let recv_time_ms = chrono::Utc::now().timestamp_millis() as u64;

        let display_instrument = self.directory.display_of(&depth.instrument_id);
        let quote = Quote::from_depth(depth, &display_instrument, recv_time_ms);

        if let Err(e) = self.quote_sink.publish_quote(&depth.instrument_id, &quote) {
            log::error!(
                "Failed to cache tick for {} on connection {}: {}",
                depth.instrument_id,
                self.config.connection_id,
                e
            );
        }

        let elapsed_ns = start.elapsed().as_nanos() as u64;
        self.tick_total_ns.fetch_add(elapsed_ns, Ordering::Relaxed);
        let count = self.tick_count.fetch_add(1, Ordering::Relaxed) + 1;
        if count % TICK_STATS_PERIOD == 0 {
            let avg_ns = self.tick_total_ns.load(Ordering::Relaxed) / count;
            log::info!(
                "Connection {} tick callback avg cost: {} ns ({} calls)",
                self.config.connection_id,
                avg_ns,
                count
            );
        }
    }

    pub fn on_rsp_error(&self, rsp: &RspInfo) {
        if rsp.is_error() {
            log::error!(
                "CTP error on connection {}: {}",
                self.config.connection_id,
                rsp.error_msg
            );
            let errors = self.error_count.fetch_add(1, Ordering::Relaxed) + 1;
            if errors > ERROR_LATCH_THRESHOLD {
                log::error!(
                    "Too many errors on connection {}, marking as failed",
                    self.config.connection_id
                );
                *self.status.write() = CtpConnectionStatus::Error;
            }
        }
    }

    fn login(&self) {
        let api = match self.api.read().clone() {
            Some(api) => api,
            None => return,
        };

        let request_id = self.request_id.fetch_add(1, Ordering::Relaxed) + 1;
        let ret = api.req_user_login(&self.config.broker_id, request_id);
        if ret != 0 {
            log::error!(
                "Failed to send login request on connection {}, return code: {}",
                self.config.connection_id,
                ret
            );
            *self.status.write() = CtpConnectionStatus::Error;
            self.error_count.fetch_add(1, Ordering::Relaxed);
        } else {
            log::info!(
                "Login request sent on connection {}",
                self.config.connection_id
            );
        }
    }
}
