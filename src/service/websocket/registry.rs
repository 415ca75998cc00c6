//! 会话注册表与 peek 长轮询引擎
//!
//! 持有全部在线会话的发送端、合约订阅索引、每会话游标（上次发送的
//! 版本号与快照）以及挂起等待行情的会话集合。
//!
//! peek 算法：收集版本号推进的已订阅合约 → 无更新则挂起 → 首帧全量、
//! 之后字段级差分 → 更新游标。行情落缓存后经通知线程调用
//! [`SessionRegistry::notify_instrument`]，与挂起集合求交唤醒会话重跑 peek。
//!
//! ## 锁次序（本结构内）
//!
//! `subscribers` → `cursors` → `pending_peek`，全部短持有；
//! `sessions` 为 DashMap，不参与锁序。

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::Receiver;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::market::cache::QuoteCache;
use crate::market::directory::InstrumentDirectory;
use crate::market::Quote;
use crate::protocol::{quote_changed, quote_diff, quote_to_json, rtn_data_frame};

/// 会话出站帧的发送端
///
/// WebSocket 会话由 actix Addr 实现；测试中可用通道替身。
pub trait SessionSink: Send + Sync {
    fn send_frame(&self, frame: String);
}

/// 每会话游标：合约 -> 上次发送的版本与快照
#[derive(Default)]
struct SessionCursor {
    last_versions: HashMap<String, u64>,
    last_quotes: HashMap<String, Quote>,
}

/// 订阅索引（双向）
#[derive(Default)]
struct SubscriberMaps {
    /// session_id -> raw合约集合
    session_instruments: HashMap<String, BTreeSet<String>>,
    /// raw合约 -> session集合
    instrument_sessions: HashMap<String, BTreeSet<String>>,
}

pub struct SessionRegistry {
    cache: Arc<QuoteCache>,
    directory: Arc<InstrumentDirectory>,

    /// 在线会话发送端
    sessions: DashMap<String, Arc<dyn SessionSink>>,

    subscribers: Mutex<SubscriberMaps>,

    cursors: Mutex<HashMap<String, SessionCursor>>,

    /// 挂起等待行情更新的会话（peek 无可发内容时进入）
    pending_peek: Mutex<HashSet<String>>,
}

impl SessionRegistry {
    pub fn new(cache: Arc<QuoteCache>, directory: Arc<InstrumentDirectory>) -> Self {
        Self {
            cache,
            directory,
            sessions: DashMap::new(),
            subscribers: Mutex::new(SubscriberMaps::default()),
            cursors: Mutex::new(HashMap::new()),
            pending_peek: Mutex::new(HashSet::new()),
        }
    }

    pub fn register_session(&self, session_id: &str, sink: Arc<dyn SessionSink>) {
        self.sessions.insert(session_id.to_string(), sink);
        log::info!("WebSocket session registered: {}", session_id);
    }

    /// 会话关闭清理：发送端、订阅索引、游标、挂起集合
    pub fn remove_session(&self, session_id: &str) {
        self.sessions.remove(session_id);

        {
            let mut subs = self.subscribers.lock();
            if let Some(instruments) = subs.session_instruments.remove(session_id) {
                for raw in instruments {
                    if let Some(set) = subs.instrument_sessions.get_mut(&raw) {
                        set.remove(session_id);
                        if set.is_empty() {
                            subs.instrument_sessions.remove(&raw);
                        }
                    }
                }
            }
        }

        self.cursors.lock().remove(session_id);
        self.pending_peek.lock().remove(session_id);

        log::info!("Session removed: {}", session_id);
    }

    /// 登记会话对一个 raw 合约的订阅
    pub fn add_subscription(&self, session_id: &str, raw_instrument: &str) {
        let mut subs = self.subscribers.lock();
        subs.session_instruments
            .entry(session_id.to_string())
            .or_default()
            .insert(raw_instrument.to_string());
        subs.instrument_sessions
            .entry(raw_instrument.to_string())
            .or_default()
            .insert(session_id.to_string());
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending_peek.lock().len()
    }

    /// 处理一次 peek（客户端请求或行情唤醒后重入）
    pub fn handle_peek(&self, session_id: &str) {
        // 1. 快照订阅集合（拷贝后立即放锁）
        let subscriptions: Vec<String> = {
            let subs = self.subscribers.lock();
            match subs.session_instruments.get(session_id) {
                Some(set) if !set.is_empty() => set.iter().cloned().collect(),
                _ => return,
            }
        };

        // 2. 游标拷贝
        let (last_versions, last_quotes) = {
            let cursors = self.cursors.lock();
            match cursors.get(session_id) {
                Some(c) => (c.last_versions.clone(), c.last_quotes.clone()),
                None => (HashMap::new(), HashMap::new()),
            }
        };
        let has_snapshot = !last_quotes.is_empty();

        // 3. 收集版本号推进的合约（SeqLock 读，不阻塞写入方）
        let mut updates: Vec<(String, Quote, u64)> = Vec::with_capacity(subscriptions.len());
        for raw in &subscriptions {
            if let Some((quote, version)) = self.cache.read(raw) {
                let newer = last_versions.get(raw).map_or(true, |&last| version > last);
                if newer {
                    updates.push((raw.clone(), quote, version));
                }
            }
        }

        // 4. 无更新：挂起等待下一次 publish 唤醒
        if updates.is_empty() {
            self.pending_peek.lock().insert(session_id.to_string());
            return;
        }

        // 5. 构建帧：首帧全量，之后差分（无历史快照的合约单独全量）
        let frame = if !has_snapshot {
            let mut quotes = Map::new();
            for (raw, quote, _) in &updates {
                quotes.insert(self.display_key(raw, quote), quote_to_json(quote));
            }
            Some(rtn_data_frame(quotes))
        } else {
            let mut quotes = Map::new();
            for (raw, quote, _) in &updates {
                match last_quotes.get(raw) {
                    Some(old) => {
                        if quote_changed(old, quote) {
                            quotes.insert(
                                self.display_key(raw, quote),
                                Value::Object(quote_diff(old, quote)),
                            );
                        }
                    }
                    None => {
                        quotes.insert(self.display_key(raw, quote), quote_to_json(quote));
                    }
                }
            }
            if quotes.is_empty() {
                None
            } else {
                Some(rtn_data_frame(quotes))
            }
        };

        // 6. 发送；版本推进但字段全等时不发帧，重新挂起
        match frame {
            Some(frame) => {
                if let Some(sink) = self.sessions.get(session_id) {
                    sink.send_frame(frame.to_string());
                }
            }
            None => {
                self.pending_peek.lock().insert(session_id.to_string());
            }
        }

        // 7. 推进游标（包括未发送的全等更新，避免重复收集）
        let mut cursors = self.cursors.lock();
        let cursor = cursors.entry(session_id.to_string()).or_default();
        for (raw, quote, version) in updates {
            cursor.last_versions.insert(raw.clone(), version);
            cursor.last_quotes.insert(raw, quote);
        }
    }

    /// 行情更新唤醒：订阅该合约且处于挂起状态的会话重跑 peek
    pub fn notify_instrument(&self, raw_instrument: &str) {
        let to_wake: Vec<String> = {
            let subs = self.subscribers.lock();
            let Some(subscribers) = subs.instrument_sessions.get(raw_instrument) else {
                return;
            };

            let mut pending = self.pending_peek.lock();
            let mut woken = Vec::new();
            for session_id in subscribers {
                if pending.remove(session_id) {
                    woken.push(session_id.clone());
                }
            }
            woken
        };

        for session_id in to_wake {
            log::debug!(
                "Waking up pending session: {} due to market data update: {}",
                session_id,
                raw_instrument
            );
            self.handle_peek(&session_id);
        }
    }

    /// 拉起通知线程：消费缓存的 publish 唤醒通道
    pub fn start_notifier(
        self: Arc<Self>,
        rx: Receiver<String>,
        running: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        let registry = self;
        std::thread::Builder::new()
            .name("quote-notifier".to_string())
            .spawn(move || {
                while running.load(Ordering::Relaxed) {
                    match rx.recv_timeout(Duration::from_secs(1)) {
                        Ok(raw_instrument) => registry.notify_instrument(&raw_instrument),
                        Err(crossbeam::channel::RecvTimeoutError::Timeout) => continue,
                        Err(crossbeam::channel::RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .expect("failed to spawn quote notifier thread")
    }

    /// quotes 对象的键：快照内嵌展示ID，为空时回退映射表
    fn display_key(&self, raw_instrument: &str, quote: &Quote) -> String {
        let embedded = quote.instrument_id_str();
        if embedded.is_empty() {
            self.directory.display_of(raw_instrument)
        } else {
            embedded.to_string()
        }
    }
}
