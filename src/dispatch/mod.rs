//! 全局订阅分发器
//!
//! 维护 合约 → 连接 的全局订阅表，按轮询在可用连接间分配新订阅，
//! 连接故障时迁移受影响订阅，放置失败进入重试集合由维护线程定期
//! 消化。多个会话订阅同一合约只产生一次上游订阅（去重）。
//!
//! ## 锁次序
//!
//! 1. `global_subscriptions`
//! 2. `session_subscriptions`
//! 3. 连接池内部锁
//! 4. `retry_set`（恒为最后）
//!
//! 任何需要多把锁的路径都按该次序取锁。vendor 回调线程不直接进入
//! 本结构：连接回报经 [`DispatcherMailbox`] 投递，由事件线程消化，
//! 见 [`SubscriptionDispatcher::start_event_loop`]。

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam::channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};

use crate::upstream::connection::CtpConnection;
use crate::upstream::pool::CtpConnectionPool;
use crate::upstream::DispatcherEvents;
use crate::utils::config::GatewayConfig;

/// FAILED 记录的清理期限
const FAILED_CLEANUP_HORIZON_MINUTES: i64 = 10;

/// 订阅状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    /// 等待订阅
    Pending,
    /// 订阅请求已发出
    Subscribing,
    /// 已订阅
    Active,
    /// 订阅失败
    Failed,
    /// 已取消
    Cancelled,
}

/// 一个合约的全局订阅记录
#[derive(Debug, Clone)]
pub struct SubscriptionInfo {
    pub instrument_id: String,
    pub assigned_connection_id: String,
    pub status: SubscriptionStatus,
    /// 需要该合约的会话集合（记录存活期间恒非空）
    pub requesting_sessions: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub retry_count: u32,
}

impl SubscriptionInfo {
    fn new(instrument_id: &str) -> Self {
        let now = Utc::now();
        Self {
            instrument_id: instrument_id.to_string(),
            assigned_connection_id: String::new(),
            status: SubscriptionStatus::Pending,
            requesting_sessions: BTreeSet::new(),
            created_at: now,
            updated_at: now,
            retry_count: 0,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// 连接回报事件（回调线程 → 事件线程）
#[derive(Debug, Clone)]
pub enum DispatcherEvent {
    SubscriptionSuccess {
        connection_id: String,
        instrument_id: String,
    },
    SubscriptionFailed {
        connection_id: String,
        instrument_id: String,
    },
    UnsubscriptionSuccess {
        connection_id: String,
        instrument_id: String,
    },
    ConnectionFailure {
        connection_id: String,
    },
    ConnectionRecovery {
        connection_id: String,
    },
}

/// 回调线程侧的事件投递面
///
/// 只做无锁通道 send，不取任何分发器锁。
pub struct DispatcherMailbox {
    tx: Sender<DispatcherEvent>,
}

impl DispatcherMailbox {
    pub fn new(tx: Sender<DispatcherEvent>) -> Self {
        Self { tx }
    }
}

impl DispatcherEvents for DispatcherMailbox {
    fn on_subscription_success(&self, connection_id: &str, instrument_id: &str) {
        let _ = self.tx.send(DispatcherEvent::SubscriptionSuccess {
            connection_id: connection_id.to_string(),
            instrument_id: instrument_id.to_string(),
        });
    }

    fn on_subscription_failed(&self, connection_id: &str, instrument_id: &str) {
        let _ = self.tx.send(DispatcherEvent::SubscriptionFailed {
            connection_id: connection_id.to_string(),
            instrument_id: instrument_id.to_string(),
        });
    }

    fn on_unsubscription_success(&self, connection_id: &str, instrument_id: &str) {
        let _ = self.tx.send(DispatcherEvent::UnsubscriptionSuccess {
            connection_id: connection_id.to_string(),
            instrument_id: instrument_id.to_string(),
        });
    }

    fn on_connection_failure(&self, connection_id: &str) {
        let _ = self.tx.send(DispatcherEvent::ConnectionFailure {
            connection_id: connection_id.to_string(),
        });
    }

    fn on_connection_recovery(&self, connection_id: &str) {
        let _ = self.tx.send(DispatcherEvent::ConnectionRecovery {
            connection_id: connection_id.to_string(),
        });
    }
}

pub struct SubscriptionDispatcher {
    /// instrument_id -> 全局订阅记录（锁序 1）
    global_subscriptions: Mutex<HashMap<String, SubscriptionInfo>>,

    /// session_id -> 该会话订阅的合约（锁序 2）
    session_subscriptions: Mutex<HashMap<String, BTreeSet<String>>>,

    /// connection_id -> 已确认订阅的合约（反查索引，连接侧集合为准）
    connection_subscriptions: Mutex<HashMap<String, BTreeSet<String>>>,

    /// 连接池（启动时注入）
    pool: RwLock<Option<Arc<CtpConnectionPool>>>,

    round_robin_counter: AtomicUsize,

    /// 待重试合约（锁序 4，恒为最后）
    retry_set: Mutex<BTreeSet<String>>,

    max_retry_count: u32,
    auto_failover: bool,
    maintenance_interval: Duration,

    maintenance_running: Arc<AtomicBool>,
    maintenance_thread: Mutex<Option<JoinHandle<()>>>,
}

impl SubscriptionDispatcher {
    pub fn new(config: &GatewayConfig) -> Self {
        log::info!("SubscriptionDispatcher initialized with config:");
        log::info!(
            "  - Maintenance interval: {} seconds",
            config.maintenance_interval
        );
        log::info!("  - Max retry count: {}", config.max_retry_count);
        log::info!(
            "  - Auto failover: {}",
            if config.auto_failover {
                "enabled"
            } else {
                "disabled"
            }
        );

        Self {
            global_subscriptions: Mutex::new(HashMap::new()),
            session_subscriptions: Mutex::new(HashMap::new()),
            connection_subscriptions: Mutex::new(HashMap::new()),
            pool: RwLock::new(None),
            round_robin_counter: AtomicUsize::new(0),
            retry_set: Mutex::new(BTreeSet::new()),
            max_retry_count: config.max_retry_count,
            auto_failover: config.auto_failover,
            maintenance_interval: Duration::from_secs(config.maintenance_interval.max(1)),
            maintenance_running: Arc::new(AtomicBool::new(false)),
            maintenance_thread: Mutex::new(None),
        }
    }

    /// 注入连接池（分发器与连接池互为兄弟，由服务器根对象持有）
    pub fn attach_pool(&self, pool: Arc<CtpConnectionPool>) {
        *self.pool.write() = Some(pool);
    }

    fn pool(&self) -> Option<Arc<CtpConnectionPool>> {
        self.pool.read().clone()
    }

    // ------------------------------------------------------------------
    // 订阅管理（会话执行上下文）
    // ------------------------------------------------------------------

    /// 会话订阅一个合约
    ///
    /// 已有全局订阅时仅登记会话（不发上游请求）；否则创建记录并按
    /// 轮询挑选连接发起订阅。无可用连接时标记 FAILED 进入重试集合。
    pub fn add_subscription(&self, session_id: &str, instrument_id: &str) -> bool {
        let mut subs = self.global_subscriptions.lock();
        let mut sessions = self.session_subscriptions.lock();

        if let Some(info) = subs.get_mut(instrument_id) {
            info.requesting_sessions.insert(session_id.to_string());
            sessions
                .entry(session_id.to_string())
                .or_default()
                .insert(instrument_id.to_string());

            log::info!(
                "Added session {} to existing subscription: {}",
                session_id,
                instrument_id
            );
            return true;
        }

        let mut info = SubscriptionInfo::new(instrument_id);
        info.requesting_sessions.insert(session_id.to_string());
        sessions
            .entry(session_id.to_string())
            .or_default()
            .insert(instrument_id.to_string());

        let connection = self.select_connection_round_robin();
        let Some(connection) = connection else {
            log::error!("No available connection for subscription: {}", instrument_id);
            info.status = SubscriptionStatus::Failed;
            info.touch();
            let enqueue = info.retry_count < self.max_retry_count;
            subs.insert(instrument_id.to_string(), info);
            drop(sessions);
            drop(subs);
            if enqueue {
                self.retry_set.lock().insert(instrument_id.to_string());
            }
            return false;
        };

        info.assigned_connection_id = connection.connection_id().to_string();
        info.status = SubscriptionStatus::Subscribing;
        info.touch();

        let ok = connection.subscribe_instrument(instrument_id);
        if !ok {
            info.status = SubscriptionStatus::Failed;
            info.touch();
        }
        let enqueue = !ok && info.retry_count < self.max_retry_count;

        log::info!(
            "Added new subscription: {} on connection {}",
            instrument_id,
            connection.connection_id()
        );
        subs.insert(instrument_id.to_string(), info);
        drop(sessions);
        drop(subs);

        if enqueue {
            self.retry_set.lock().insert(instrument_id.to_string());
        }
        ok
    }

    /// 会话退订一个合约
    ///
    /// 会话集合清空时发上游退订并删除记录，否则保留。
    pub fn remove_subscription(&self, session_id: &str, instrument_id: &str) -> bool {
        let mut subs = self.global_subscriptions.lock();
        let mut sessions = self.session_subscriptions.lock();

        if let Some(set) = sessions.get_mut(session_id) {
            set.remove(instrument_id);
            if set.is_empty() {
                sessions.remove(session_id);
            }
        }

        let Some(info) = subs.get_mut(instrument_id) else {
            return true;
        };

        info.requesting_sessions.remove(session_id);

        if info.requesting_sessions.is_empty() {
            let connection_id = info.assigned_connection_id.clone();
            if self.execute_unsubscription(instrument_id, &connection_id) {
                log::info!(
                    "Removed subscription: {} from connection {}",
                    instrument_id,
                    connection_id
                );
            }
            subs.remove(instrument_id);
        } else {
            log::info!(
                "Kept subscription {} (still needed by {} sessions)",
                instrument_id,
                info.requesting_sessions.len()
            );
        }

        true
    }

    /// 会话断开时清理其全部订阅
    pub fn remove_all_for_session(&self, session_id: &str) {
        let instruments: Vec<String> = {
            let sessions = self.session_subscriptions.lock();
            sessions
                .get(session_id)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default()
        };

        for instrument_id in instruments {
            self.remove_subscription(session_id, &instrument_id);
        }

        log::info!("Removed all subscriptions for session: {}", session_id);
    }

    // ------------------------------------------------------------------
    // 查询
    // ------------------------------------------------------------------

    pub fn subscriptions_for_session(&self, session_id: &str) -> Vec<String> {
        self.session_subscriptions
            .lock()
            .get(session_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn sessions_for_instrument(&self, instrument_id: &str) -> Vec<String> {
        self.global_subscriptions
            .lock()
            .get(instrument_id)
            .map(|info| info.requesting_sessions.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn subscription_status(&self, instrument_id: &str) -> Option<SubscriptionStatus> {
        self.global_subscriptions
            .lock()
            .get(instrument_id)
            .map(|info| info.status)
    }

    pub fn assigned_connection(&self, instrument_id: &str) -> Option<String> {
        self.global_subscriptions
            .lock()
            .get(instrument_id)
            .map(|info| info.assigned_connection_id.clone())
    }

    pub fn total_subscriptions(&self) -> usize {
        self.global_subscriptions.lock().len()
    }

    pub fn retry_queue_len(&self) -> usize {
        self.retry_set.lock().len()
    }

    // ------------------------------------------------------------------
    // 连接回报（事件线程上下文）
    // ------------------------------------------------------------------

    pub fn dispatch_event(&self, event: DispatcherEvent) {
        match event {
            DispatcherEvent::SubscriptionSuccess {
                connection_id,
                instrument_id,
            } => self.on_subscription_success(&connection_id, &instrument_id),
            DispatcherEvent::SubscriptionFailed {
                connection_id,
                instrument_id,
            } => self.on_subscription_failed(&connection_id, &instrument_id),
            DispatcherEvent::UnsubscriptionSuccess {
                connection_id,
                instrument_id,
            } => self.on_unsubscription_success(&connection_id, &instrument_id),
            DispatcherEvent::ConnectionFailure { connection_id } => {
                self.handle_connection_failure(&connection_id)
            }
            DispatcherEvent::ConnectionRecovery { connection_id } => {
                self.handle_connection_recovery(&connection_id)
            }
        }
    }

    /// 拉起事件线程，消化连接回报直到停机
    pub fn start_event_loop(
        self: Arc<Self>,
        rx: Receiver<DispatcherEvent>,
        running: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        let dispatcher = self;
        std::thread::Builder::new()
            .name("dispatcher-events".to_string())
            .spawn(move || {
                while running.load(Ordering::Relaxed) {
                    match rx.recv_timeout(Duration::from_secs(1)) {
                        Ok(event) => dispatcher.dispatch_event(event),
                        Err(crossbeam::channel::RecvTimeoutError::Timeout) => continue,
                        Err(crossbeam::channel::RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .expect("failed to spawn dispatcher event thread")
    }

    pub fn on_subscription_success(&self, connection_id: &str, instrument_id: &str) {
        let mut subs = self.global_subscriptions.lock();
        let mut conn_subs = self.connection_subscriptions.lock();

        if let Some(info) = subs.get_mut(instrument_id) {
            info.status = SubscriptionStatus::Active;
            info.retry_count = 0;
            info.touch();

            conn_subs
                .entry(connection_id.to_string())
                .or_default()
                .insert(instrument_id.to_string());

            log::info!(
                "Subscription successful: {} on {}",
                instrument_id,
                connection_id
            );
        }
    }

    pub fn on_subscription_failed(&self, connection_id: &str, instrument_id: &str) {
        let mut enqueue = false;
        {
            let mut subs = self.global_subscriptions.lock();
            if let Some(info) = subs.get_mut(instrument_id) {
                info.status = SubscriptionStatus::Failed;
                info.retry_count += 1;
                info.touch();
                enqueue = info.retry_count < self.max_retry_count;

                log::error!(
                    "Subscription failed: {} on {} (retry: {})",
                    instrument_id,
                    connection_id,
                    info.retry_count
                );
            }
        }

        if enqueue {
            self.retry_set.lock().insert(instrument_id.to_string());
        }
    }

    pub fn on_unsubscription_success(&self, connection_id: &str, instrument_id: &str) {
        let mut conn_subs = self.connection_subscriptions.lock();

        if let Some(set) = conn_subs.get_mut(connection_id) {
            set.remove(instrument_id);
            if set.is_empty() {
                conn_subs.remove(connection_id);
            }
        }

        log::info!(
            "Unsubscription successful: {} on {}",
            instrument_id,
            connection_id
        );
    }

    /// 连接故障：其上 ACTIVE 订阅全部标记 FAILED 并迁移到其它可用连接，
    /// 迁移无门路时进入重试集合
    pub fn handle_connection_failure(&self, connection_id: &str) {
        log::warn!("Handling connection failure: {}", connection_id);

        let mut to_retry: Vec<String> = Vec::new();
        {
            let mut subs = self.global_subscriptions.lock();

            let affected: Vec<String> = subs
                .values_mut()
                .filter(|info| {
                    info.assigned_connection_id == connection_id
                        && info.status == SubscriptionStatus::Active
                })
                .map(|info| {
                    info.status = SubscriptionStatus::Failed;
                    info.touch();
                    info.instrument_id.clone()
                })
                .collect();

            for instrument_id in affected {
                if !self.auto_failover {
                    if let Some(info) = subs.get(&instrument_id) {
                        if info.retry_count < self.max_retry_count {
                            to_retry.push(instrument_id);
                        }
                    }
                    continue;
                }

                let new_connection = self.select_connection_round_robin();
                match new_connection {
                    Some(conn) if conn.connection_id() != connection_id => {
                        self.migrate_subscription(&mut subs, &instrument_id, connection_id, &conn, &mut to_retry);
                    }
                    _ => {
                        log::error!(
                            "No available connection to migrate subscription: {}",
                            instrument_id
                        );
                        if let Some(info) = subs.get(&instrument_id) {
                            if info.retry_count < self.max_retry_count {
                                to_retry.push(instrument_id);
                            }
                        }
                    }
                }
            }

            self.connection_subscriptions.lock().remove(connection_id);
        }

        if !to_retry.is_empty() {
            let mut retry = self.retry_set.lock();
            for instrument_id in to_retry {
                retry.insert(instrument_id);
            }
        }

        log::info!("Connection failure handling completed for: {}", connection_id);
    }

    /// 连接恢复：立即消化一轮重试集合
    pub fn handle_connection_recovery(&self, connection_id: &str) {
        log::info!("Connection recovered: {}", connection_id);
        self.process_pending_subscriptions();
    }

    // ------------------------------------------------------------------
    // 维护
    // ------------------------------------------------------------------

    /// 拉起维护线程：定期重试 + 清理过期 FAILED 记录
    pub fn start_maintenance(self: Arc<Self>, running: Arc<AtomicBool>) {
        if self.maintenance_running.swap(true, Ordering::SeqCst) {
            return;
        }

        let flag = self.maintenance_running.clone();
        let interval = self.maintenance_interval;
        let dispatcher = self.clone();
        let handle = std::thread::Builder::new()
            .name("dispatcher-maintenance".to_string())
            .spawn(move || {
                while flag.load(Ordering::SeqCst) && running.load(Ordering::Relaxed) {
                    dispatcher.process_pending_subscriptions();
                    dispatcher.cleanup_expired_subscriptions();

                    let ticks = interval.as_secs();
                    for _ in 0..ticks {
                        if !flag.load(Ordering::SeqCst) {
                            return;
                        }
                        std::thread::sleep(Duration::from_secs(1));
                    }
                }
            })
            .expect("failed to spawn maintenance thread");

        *self.maintenance_thread.lock() = Some(handle);
        log::info!("Started subscription maintenance timer");
    }

    pub fn stop_maintenance(&self) {
        self.maintenance_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.maintenance_thread.lock().take() {
            let _ = handle.join();
        }
        log::info!("Stopped subscription maintenance timer");
    }

    /// 消化重试集合：FAILED 记录按轮询重新放置，仍失败且未超限则回队
    pub fn process_pending_subscriptions(&self) {
        let current: Vec<String> = {
            let mut retry = self.retry_set.lock();
            let drained: Vec<String> = retry.iter().cloned().collect();
            retry.clear();
            drained
        };

        if current.is_empty() {
            return;
        }

        let mut failed_again: Vec<String> = Vec::new();

        for instrument_id in current {
            let mut subs = self.global_subscriptions.lock();
            let Some(info) = subs.get_mut(&instrument_id) else {
                continue;
            };
            if info.status != SubscriptionStatus::Failed {
                continue;
            }

            match self.select_connection_round_robin() {
                Some(conn) => {
                    info.assigned_connection_id = conn.connection_id().to_string();
                    info.status = SubscriptionStatus::Subscribing;
                    info.touch();

                    // wire 接受后由上游回报决定 ACTIVE / FAILED
                    if !conn.subscribe_instrument(&instrument_id) {
                        info.status = SubscriptionStatus::Failed;
                        info.retry_count += 1;
                        info.touch();
                        if info.retry_count < self.max_retry_count {
                            failed_again.push(instrument_id.clone());
                        }
                    }
                }
                None => {
                    if info.retry_count < self.max_retry_count {
                        failed_again.push(instrument_id.clone());
                    }
                }
            }
        }

        if !failed_again.is_empty() {
            let mut retry = self.retry_set.lock();
            for instrument_id in failed_again {
                retry.insert(instrument_id);
            }
        }
    }

    /// 清理停留在 FAILED 超过期限的记录
    pub fn cleanup_expired_subscriptions(&self) {
        let mut subs = self.global_subscriptions.lock();
        let now = Utc::now();

        let expired: Vec<String> = subs
            .values()
            .filter(|info| {
                info.status == SubscriptionStatus::Failed
                    && (now - info.updated_at)
                        > chrono::Duration::minutes(FAILED_CLEANUP_HORIZON_MINUTES)
            })
            .map(|info| info.instrument_id.clone())
            .collect();

        for instrument_id in expired {
            subs.remove(&instrument_id);
            log::info!("Cleaned up expired subscription: {}", instrument_id);
        }
    }

    // ------------------------------------------------------------------
    // 内部
    // ------------------------------------------------------------------

    /// 轮询挑选可用连接：单调计数器对可用集合大小取模，ID序打破平局
    fn select_connection_round_robin(&self) -> Option<Arc<CtpConnection>> {
        let pool = self.pool()?;
        let available = pool.get_available();
        if available.is_empty() {
            return None;
        }

        let index = self.round_robin_counter.fetch_add(1, Ordering::Relaxed) % available.len();
        Some(available[index].clone())
    }

    fn migrate_subscription(
        &self,
        subs: &mut HashMap<String, SubscriptionInfo>,
        instrument_id: &str,
        from_connection_id: &str,
        to_connection: &Arc<CtpConnection>,
        to_retry: &mut Vec<String>,
    ) {
        log::info!(
            "Migrating subscription {} from {} to {}",
            instrument_id,
            from_connection_id,
            to_connection.connection_id()
        );

        let Some(info) = subs.get_mut(instrument_id) else {
            return;
        };

        info.assigned_connection_id = to_connection.connection_id().to_string();
        info.status = SubscriptionStatus::Subscribing;
        info.retry_count = 0;
        info.touch();

        if to_connection.subscribe_instrument(instrument_id) {
            log::info!("Successfully migrated subscription: {}", instrument_id);
        } else {
            log::error!("Failed to migrate subscription: {}", instrument_id);
            info.status = SubscriptionStatus::Failed;
            info.touch();
            if info.retry_count < self.max_retry_count {
                to_retry.push(instrument_id.to_string());
            }
        }
    }

    fn execute_unsubscription(&self, instrument_id: &str, connection_id: &str) -> bool {
        let Some(pool) = self.pool() else {
            return false;
        };

        match pool.get(connection_id) {
            Some(connection) => connection.unsubscribe_instrument(instrument_id),
            // 连接已不存在，视为退订成功
            None => true,
        }
    }
}

impl Drop for SubscriptionDispatcher {
    fn drop(&mut self) {
        self.maintenance_running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::directory::InstrumentDirectory;
    use crate::upstream::testkit::{MockMdApiFactory, NullQuoteSink};
    use crate::upstream::RspInfo;
    use crossbeam::channel::unbounded;

    struct Fixture {
        dispatcher: Arc<SubscriptionDispatcher>,
        pool: Arc<CtpConnectionPool>,
        factory: Arc<MockMdApiFactory>,
        mailbox: Arc<DispatcherMailbox>,
        rx: Receiver<DispatcherEvent>,
    }

    impl Fixture {
        /// 搭建 n 条 LOGGED_IN 连接的分发器环境
        fn new(connection_count: usize, max_subscriptions: usize) -> Self {
            let config = GatewayConfig {
                connections: (0..connection_count)
                    .map(|i| crate::utils::config::CtpConnectionConfig {
                        connection_id: format!("c{}", i + 1),
                        front_addr: format!("tcp://127.0.0.1:1021{}", i),
                        broker_id: "9999".to_string(),
                        max_subscriptions,
                        priority: 1,
                        enabled: true,
                    })
                    .collect(),
                ..Default::default()
            };

            let dispatcher = Arc::new(SubscriptionDispatcher::new(&config));
            let (tx, rx) = unbounded();
            let mailbox = Arc::new(DispatcherMailbox::new(tx));
            let mailbox_dyn: Arc<dyn DispatcherEvents> = mailbox.clone();

            let factory = Arc::new(MockMdApiFactory::new());
            let pool = Arc::new(
                CtpConnectionPool::new(
                    factory.clone(),
                    Arc::downgrade(&mailbox_dyn),
                    Arc::new(NullQuoteSink),
                    Arc::new(InstrumentDirectory::new()),
                    Arc::new(AtomicBool::new(true)),
                    30,
                )
                .with_flow_base(std::env::temp_dir().join("qamd_test_flow")),
            );

            for conn_config in config.enabled_connections() {
                pool.add_connection(conn_config.clone());
            }
            dispatcher.attach_pool(pool.clone());

            for conn in pool.get_all() {
                conn.clone().start();
                conn.on_front_connected();
                conn.on_rsp_user_login(&RspInfo::ok());
            }

            let fixture = Self {
                dispatcher,
                pool,
                factory,
                mailbox,
                rx,
            };
            fixture.drain_events();
            fixture
        }

        /// 同步消化 mailbox 中积压的事件（测试中替代事件线程）
        fn drain_events(&self) {
            while let Ok(event) = self.rx.try_recv() {
                self.dispatcher.dispatch_event(event);
            }
        }

        /// 模拟上游订阅回报成功
        fn ack_subscription(&self, instrument_id: &str) {
            let conn_id = self.dispatcher.assigned_connection(instrument_id).unwrap();
            self.pool
                .get(&conn_id)
                .unwrap()
                .on_rsp_sub_market_data(instrument_id, &RspInfo::ok());
            self.drain_events();
        }
    }

    #[test]
    fn test_dedup_single_upstream_subscribe() {
        let f = Fixture::new(1, 10);

        assert!(f.dispatcher.add_subscription("session_a", "cu2501"));
        assert!(f.dispatcher.add_subscription("session_b", "cu2501"));

        // 只发一次上游订阅
        assert_eq!(f.factory.api_of("c1").subscribes.lock().len(), 1);
        assert_eq!(
            f.dispatcher.sessions_for_instrument("cu2501"),
            vec!["session_a".to_string(), "session_b".to_string()]
        );

        f.ack_subscription("cu2501");
        assert_eq!(
            f.dispatcher.subscription_status("cu2501"),
            Some(SubscriptionStatus::Active)
        );

        // A 断开后订阅保留
        f.dispatcher.remove_all_for_session("session_a");
        assert_eq!(
            f.dispatcher.subscription_status("cu2501"),
            Some(SubscriptionStatus::Active)
        );
        assert!(f.factory.api_of("c1").unsubscribes.lock().is_empty());

        // B 也断开后恰好发一次上游退订，记录删除
        f.dispatcher.remove_all_for_session("session_b");
        assert_eq!(f.factory.api_of("c1").unsubscribes.lock().len(), 1);
        assert_eq!(f.dispatcher.subscription_status("cu2501"), None);
        assert_eq!(f.dispatcher.total_subscriptions(), 0);
    }

    #[test]
    fn test_round_robin_distribution() {
        let f = Fixture::new(2, 100);

        for i in 0..10 {
            assert!(f
                .dispatcher
                .add_subscription("s1", &format!("ins{:02}", i)));
        }

        // 轮询均分 5/5
        assert_eq!(f.pool.get("c1").unwrap().subscription_count(), 5);
        assert_eq!(f.pool.get("c2").unwrap().subscription_count(), 5);
    }

    #[test]
    fn test_no_available_connection_marks_failed_and_enqueues() {
        let f = Fixture::new(1, 10);
        // 唯一连接下线
        f.pool.get("c1").unwrap().stop();

        assert!(!f.dispatcher.add_subscription("s1", "rb2501"));
        assert_eq!(
            f.dispatcher.subscription_status("rb2501"),
            Some(SubscriptionStatus::Failed)
        );
        assert_eq!(f.dispatcher.retry_queue_len(), 1);
    }

    #[test]
    fn test_capacity_overflow_third_subscription_fails() {
        let f = Fixture::new(1, 2);

        assert!(f.dispatcher.add_subscription("s1", "a"));
        assert!(f.dispatcher.add_subscription("s1", "b"));
        f.ack_subscription("a");
        f.ack_subscription("b");

        // 第三个合约：连接已满，无可用连接
        assert!(!f.dispatcher.add_subscription("s1", "c"));
        assert_eq!(
            f.dispatcher.subscription_status("c"),
            Some(SubscriptionStatus::Failed)
        );
        assert_eq!(f.dispatcher.retry_queue_len(), 1);

        // 容量约束不被突破
        assert_eq!(f.pool.get("c1").unwrap().subscription_count(), 2);
        assert_eq!(
            f.dispatcher.subscription_status("a"),
            Some(SubscriptionStatus::Active)
        );
    }

    #[test]
    fn test_failover_migrates_all_subscriptions() {
        let f = Fixture::new(2, 100);

        for i in 0..10 {
            f.dispatcher.add_subscription("s1", &format!("ins{:02}", i));
        }
        for i in 0..10 {
            f.ack_subscription(&format!("ins{:02}", i));
        }

        // c1 传输断开 → 挂在 c1 上的订阅全部迁走
        f.pool.get("c1").unwrap().on_front_disconnected(4097);
        f.drain_events();

        for i in 0..10 {
            let instrument = format!("ins{:02}", i);
            let assigned = f.dispatcher.assigned_connection(&instrument).unwrap();
            assert_ne!(assigned, "c1", "{} still assigned to failed c1", instrument);
            let status = f.dispatcher.subscription_status(&instrument).unwrap();
            assert!(
                status == SubscriptionStatus::Subscribing || status == SubscriptionStatus::Active,
                "{} in unexpected status {:?}",
                instrument,
                status
            );
        }
        assert_eq!(f.pool.get("c2").unwrap().subscription_count(), 10);
    }

    #[test]
    fn test_failover_enqueues_when_no_capacity() {
        let f = Fixture::new(2, 5);

        for i in 0..10 {
            f.dispatcher.add_subscription("s1", &format!("ins{:02}", i));
        }
        for i in 0..10 {
            f.ack_subscription(&format!("ins{:02}", i));
        }
        assert_eq!(f.pool.get("c1").unwrap().subscription_count(), 5);
        assert_eq!(f.pool.get("c2").unwrap().subscription_count(), 5);

        // c1 故障，c2 已满：5 条订阅全部进入重试集合
        f.pool.get("c1").unwrap().on_front_disconnected(4097);
        f.drain_events();

        assert_eq!(f.dispatcher.retry_queue_len(), 5);
        // 容量约束未被突破
        assert_eq!(f.pool.get("c2").unwrap().subscription_count(), 5);
    }

    #[test]
    fn test_recovery_drains_retry_queue() {
        let f = Fixture::new(1, 10);
        f.pool.get("c1").unwrap().stop();

        f.dispatcher.add_subscription("s1", "rb2501");
        assert_eq!(f.dispatcher.retry_queue_len(), 1);

        // 连接恢复
        let conn = f.pool.get("c1").unwrap();
        conn.clone().start();
        conn.on_front_connected();
        conn.on_rsp_user_login(&RspInfo::ok());
        f.drain_events();

        assert_eq!(f.dispatcher.retry_queue_len(), 0);
        assert_eq!(
            f.dispatcher.subscription_status("rb2501"),
            Some(SubscriptionStatus::Subscribing)
        );
        f.ack_subscription("rb2501");
        assert_eq!(
            f.dispatcher.subscription_status("rb2501"),
            Some(SubscriptionStatus::Active)
        );
    }

    #[test]
    fn test_retry_count_exhaustion_stops_requeue() {
        let f = Fixture::new(1, 10);
        f.pool.get("c1").unwrap().stop();

        f.dispatcher.add_subscription("s1", "rb2501");

        // 反复维护，retry_count 不随空集合推进（没有可用连接时只回队）
        for _ in 0..5 {
            f.dispatcher.process_pending_subscriptions();
        }
        assert_eq!(f.dispatcher.retry_queue_len(), 1);

        // 上游持续拒绝订阅：每次失败回报 retry_count + 1，超限后不再回队
        let conn = f.pool.get("c1").unwrap();
        conn.clone().start();
        conn.on_front_connected();
        conn.on_rsp_user_login(&RspInfo::ok());
        f.drain_events();

        for _round in 0..3 {
            // 每轮：wire 已接受（Subscribing），上游拒绝 → retry_count + 1
            assert_eq!(
                f.dispatcher.subscription_status("rb2501"),
                Some(SubscriptionStatus::Subscribing)
            );
            conn.on_rsp_sub_market_data("rb2501", &RspInfo::error(16, "rejected"));
            f.drain_events();
            f.dispatcher.process_pending_subscriptions();
        }

        // 第 3 次失败后 retry_count 达上限，不再回队，记录停留在 FAILED
        assert_eq!(f.dispatcher.retry_queue_len(), 0);
        assert_eq!(
            f.dispatcher.subscription_status("rb2501"),
            Some(SubscriptionStatus::Failed)
        );
    }

    #[test]
    fn test_cleanup_expired_failed_records() {
        let f = Fixture::new(1, 10);
        f.pool.get("c1").unwrap().stop();
        f.dispatcher.add_subscription("s1", "rb2501");

        // 将失败时间拨回 11 分钟前
        {
            let mut subs = f.dispatcher.global_subscriptions.lock();
            let info = subs.get_mut("rb2501").unwrap();
            info.updated_at = Utc::now() - chrono::Duration::minutes(11);
        }

        f.dispatcher.cleanup_expired_subscriptions();
        assert_eq!(f.dispatcher.subscription_status("rb2501"), None);
    }

    #[test]
    fn test_requesting_sessions_never_empty_while_record_lives() {
        let f = Fixture::new(1, 10);

        f.dispatcher.add_subscription("s1", "rb2501");
        f.dispatcher.add_subscription("s2", "rb2501");
        f.dispatcher.remove_subscription("s1", "rb2501");

        let sessions = f.dispatcher.sessions_for_instrument("rb2501");
        assert_eq!(sessions, vec!["s2".to_string()]);

        f.dispatcher.remove_subscription("s2", "rb2501");
        assert!(f.dispatcher.sessions_for_instrument("rb2501").is_empty());
        assert_eq!(f.dispatcher.total_subscriptions(), 0);
    }

    #[test]
    fn test_mailbox_event_loop() {
        let f = Fixture::new(1, 10);
        f.dispatcher.add_subscription("s1", "rb2501");

        let running = Arc::new(AtomicBool::new(true));
        let handle = f
            .dispatcher
            .clone()
            .start_event_loop(f.rx.clone(), running.clone());

        // 经 mailbox 投递订阅成功事件，由事件线程消化
        f.mailbox.on_subscription_success("c1", "rb2501");
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while std::time::Instant::now() < deadline {
            if f.dispatcher.subscription_status("rb2501") == Some(SubscriptionStatus::Active) {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(
            f.dispatcher.subscription_status("rb2501"),
            Some(SubscriptionStatus::Active)
        );

        running.store(false, Ordering::SeqCst);
        let _ = handle.join();
    }
}
