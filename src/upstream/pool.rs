//! CTP连接池
//!
//! 独占持有全部 `CtpConnection`（对外只交出共享句柄做只读使用），
//! 并运行健康监控线程：处于 ERROR、或 DISCONNECTED 且错误数偏高的
//! 连接会被就地重启，重启按连接做最小 10 秒退避去重。

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::connection::CtpConnection;
use super::{CtpConnectionStatus, DispatcherEvents, MdApiFactory, QuoteSink};
use crate::market::directory::InstrumentDirectory;
use crate::utils::config::CtpConnectionConfig;

/// 单连接两次重启之间的最小间隔
const RESTART_BACKOFF: Duration = Duration::from_secs(10);

/// DISCONNECTED 连接触发重启的错误数阈值
const DISCONNECT_ERROR_THRESHOLD: u32 = 5;

pub struct CtpConnectionPool {
    /// connection_id -> 连接（BTreeMap 保证遍历顺序稳定）
    connections: Mutex<BTreeMap<String, Arc<CtpConnection>>>,

    factory: Arc<dyn MdApiFactory>,
    dispatcher: Weak<dyn DispatcherEvents>,
    quote_sink: Arc<dyn QuoteSink>,
    directory: Arc<InstrumentDirectory>,

    /// 服务器级运行标志
    running: Arc<AtomicBool>,

    health_check_interval: Duration,
    monitor_running: Arc<AtomicBool>,
    monitor_thread: Mutex<Option<JoinHandle<()>>>,

    /// connection_id -> 下次允许重启的时刻
    next_restart_allowed: Mutex<HashMap<String, Instant>>,

    flow_base: PathBuf,
}

impl CtpConnectionPool {
    pub fn new(
        factory: Arc<dyn MdApiFactory>,
        dispatcher: Weak<dyn DispatcherEvents>,
        quote_sink: Arc<dyn QuoteSink>,
        directory: Arc<InstrumentDirectory>,
        running: Arc<AtomicBool>,
        health_check_interval_secs: u64,
    ) -> Self {
        Self {
            connections: Mutex::new(BTreeMap::new()),
            factory,
            dispatcher,
            quote_sink,
            directory,
            running,
            health_check_interval: Duration::from_secs(health_check_interval_secs.max(1)),
            monitor_running: Arc::new(AtomicBool::new(false)),
            monitor_thread: Mutex::new(None),
            next_restart_allowed: Mutex::new(HashMap::new()),
            flow_base: PathBuf::from("./ctpflow"),
        }
    }

    /// 覆盖 flow 目录根（默认 `./ctpflow`）
    pub fn with_flow_base(mut self, flow_base: PathBuf) -> Self {
        self.flow_base = flow_base;
        self
    }

    pub fn add_connection(&self, config: CtpConnectionConfig) -> bool {
        let mut connections = self.connections.lock();

        if connections.contains_key(&config.connection_id) {
            log::error!("Connection {} already exists", config.connection_id);
            return false;
        }

        let connection_id = config.connection_id.clone();
        let front_addr = config.front_addr.clone();
        let conn = Arc::new(CtpConnection::new(
            config,
            self.factory.clone(),
            self.dispatcher.clone(),
            self.quote_sink.clone(),
            self.directory.clone(),
            self.running.clone(),
            self.flow_base.clone(),
        ));
        connections.insert(connection_id.clone(), conn);

        log::info!("Added CTP connection: {} -> {}", connection_id, front_addr);
        true
    }

    pub fn remove_connection(&self, connection_id: &str) -> bool {
        let mut connections = self.connections.lock();

        match connections.remove(connection_id) {
            Some(conn) => {
                conn.stop();
                log::info!("Removed CTP connection: {}", connection_id);
                true
            }
            None => false,
        }
    }

    /// 启动所有 DISCONNECTED 连接并拉起健康监控
    pub fn start_all(self: Arc<Self>) -> bool {
        let mut all_started = true;
        {
            let connections = self.connections.lock();
            for (id, conn) in connections.iter() {
                if conn.status() == CtpConnectionStatus::Disconnected && !conn.clone().start() {
                    log::error!("Failed to start connection: {}", id);
                    all_started = false;
                }
            }
            log::info!("Started {} CTP connections", connections.len());
        }

        self.start_health_monitor();
        all_started
    }

    pub fn stop_all(&self) {
        self.stop_health_monitor();

        let connections = self.connections.lock();
        for conn in connections.values() {
            conn.stop();
        }

        log::info!("Stopped all CTP connections");
    }

    pub fn get(&self, connection_id: &str) -> Option<Arc<CtpConnection>> {
        self.connections.lock().get(connection_id).cloned()
    }

    pub fn get_all(&self) -> Vec<Arc<CtpConnection>> {
        self.connections.lock().values().cloned().collect()
    }

    /// 可接受新订阅的连接集合（LOGGED_IN 且未到订阅上限），按ID序稳定
    pub fn get_available(&self) -> Vec<Arc<CtpConnection>> {
        self.connections
            .lock()
            .values()
            .filter(|c| c.status() == CtpConnectionStatus::LoggedIn && c.can_accept_more())
            .cloned()
            .collect()
    }

    pub fn total_connections(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn active_connections(&self) -> usize {
        self.connections
            .lock()
            .values()
            .filter(|c| c.status() == CtpConnectionStatus::LoggedIn)
            .count()
    }

    pub fn total_subscriptions(&self) -> usize {
        self.connections
            .lock()
            .values()
            .map(|c| c.subscription_count())
            .sum()
    }

    /// 是否有任一连接处于 LOGGED_IN（welcome 帧的 ctp_connected 字段）
    pub fn is_connected(&self) -> bool {
        self.active_connections() > 0
    }

    /// 人读连接状态行，如 `simnow_telecom: LOGGED_IN (42 subs)`
    pub fn connection_status(&self) -> Vec<String> {
        self.connections
            .lock()
            .values()
            .map(|conn| {
                let status = conn.status();
                match status {
                    CtpConnectionStatus::LoggedIn => format!(
                        "{}: {} ({} subs)",
                        conn.connection_id(),
                        status.as_str(),
                        conn.subscription_count()
                    ),
                    _ => format!("{}: {}", conn.connection_id(), status.as_str()),
                }
            })
            .collect()
    }

    pub fn start_health_monitor(self: Arc<Self>) {
        if self.monitor_running.swap(true, Ordering::SeqCst) {
            return;
        }

        let pool = self.clone();
        let handle = std::thread::Builder::new()
            .name("ctp-health-monitor".to_string())
            .spawn(move || pool.health_check_loop())
            .expect("failed to spawn health monitor thread");

        *self.monitor_thread.lock() = Some(handle);
        log::info!("Started CTP connection health monitor");
    }

    pub fn stop_health_monitor(&self) {
        self.monitor_running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.monitor_thread.lock().take() {
            let _ = handle.join();
        }
        log::info!("Stopped CTP connection health monitor");
    }

    fn health_check_loop(self: Arc<Self>) {
        while self.monitor_running.load(Ordering::SeqCst) && self.running.load(Ordering::Relaxed) {
            self.run_health_check();

            // 1 秒粒度可取消睡眠
            let ticks = self.health_check_interval.as_secs();
            for _ in 0..ticks {
                if !self.monitor_running.load(Ordering::SeqCst) {
                    return;
                }
                std::thread::sleep(Duration::from_secs(1));
            }
        }
    }

    /// 单轮健康检查：对不健康连接做带退避的就地重启
    pub fn run_health_check(&self) {
        let connections_to_check = self.get_all();

        for conn in connections_to_check {
            let status = conn.status();
            let unhealthy = status == CtpConnectionStatus::Error
                || (status == CtpConnectionStatus::Disconnected
                    && conn.error_count() > DISCONNECT_ERROR_THRESHOLD);
            if !unhealthy {
                continue;
            }

            let conn_id = conn.connection_id().to_string();
            let should_restart = {
                let mut next_allowed = self.next_restart_allowed.lock();
                let now = Instant::now();
                match next_allowed.get(&conn_id) {
                    Some(allowed) if now < *allowed => false,
                    _ => {
                        next_allowed.insert(conn_id.clone(), now + RESTART_BACKOFF);
                        true
                    }
                }
            };

            if should_restart {
                log::warn!("Connection {} is unhealthy, attempting restart", conn_id);
                // 就地重启，不另起线程
                conn.clone().restart();
            }
        }
    }
}
