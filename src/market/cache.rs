//! 行情快照缓存
//!
//! 固定容量的按合约分槽缓存。每个槽位用 SeqLock（奇偶序列号）保护：
//! 单写多读，写入为两次 release 存储夹一次整体拷贝，读取为 acquire
//! 校验序列号一致性，读到撕裂数据时重试。
//!
//! - 写入方: vendor回调线程（每个合约同一时刻只有一个连接在写）
//! - 读取方: 客户端会话 peek 路径，永不阻塞写入方
//! - 版本号: `seq / 2`，单调递增，作为会话差分推送的游标依据
//!
//! 槽位分配用读写锁保护的 `raw_id -> index` 映射：快路径读锁查找，
//! 慢路径写锁插入；容量用尽时 publish 返回错误并丢弃该笔行情。

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crossbeam::channel::Sender;
use parking_lot::RwLock;

use super::Quote;
use crate::{GatewayError, Result};

/// 默认缓存容量（合约槽位数）
pub const DEFAULT_CAPACITY: usize = 50_000;

/// SeqLock 读重试上限，超过则本轮跳过该合约
const READ_RETRY_LIMIT: u32 = 100;

/// 单个合约的 SeqLock 槽位
struct CacheSlot {
    /// 偶数=静止，奇数=写入中
    seq: AtomicU64,
    has_data: AtomicBool,
    data: UnsafeCell<Quote>,
}

// 读写协议由 seq 的 acquire/release 配对保证，Quote 为 POD 整体拷贝
unsafe impl Sync for CacheSlot {}

impl CacheSlot {
    fn new() -> Self {
        Self {
            seq: AtomicU64::new(0),
            has_data: AtomicBool::new(false),
            data: UnsafeCell::new(Quote::default()),
        }
    }

    fn write(&self, quote: &Quote) {
        let seq = self.seq.load(Ordering::Relaxed);
        self.seq.store(seq + 1, Ordering::Release);

        unsafe {
            *self.data.get() = *quote;
        }
        self.has_data.store(true, Ordering::Release);

        self.seq.store(seq + 2, Ordering::Release);
    }

    fn read(&self) -> Option<(Quote, u64)> {
        if !self.has_data.load(Ordering::Acquire) {
            return None;
        }

        let mut retries = 0u32;
        loop {
            let seq_start = self.seq.load(Ordering::Acquire);
            if seq_start & 1 == 1 {
                retries += 1;
                if retries > READ_RETRY_LIMIT {
                    return None;
                }
                std::thread::yield_now();
                continue;
            }

            let snapshot = unsafe { *self.data.get() };

            let seq_end = self.seq.load(Ordering::Acquire);
            if seq_start == seq_end {
                return Some((snapshot, seq_end / 2));
            }

            retries += 1;
            if retries > READ_RETRY_LIMIT {
                return None;
            }
        }
    }
}

/// 行情快照缓存（单写多读）
pub struct QuoteCache {
    slots: Box<[CacheSlot]>,

    /// raw合约ID -> 槽位下标
    index: RwLock<HashMap<String, usize>>,

    /// 每次成功 publish 后向通知线程投递 raw合约ID
    notify_tx: Sender<String>,

    /// 容量耗尽只告警一次
    capacity_warned: AtomicBool,
}

impl QuoteCache {
    pub fn new(capacity: usize, notify_tx: Sender<String>) -> Self {
        let slots: Vec<CacheSlot> = (0..capacity).map(|_| CacheSlot::new()).collect();
        Self {
            slots: slots.into_boxed_slice(),
            index: RwLock::new(HashMap::new()),
            notify_tx,
            capacity_warned: AtomicBool::new(false),
        }
    }

    pub fn with_default_capacity(notify_tx: Sender<String>) -> Self {
        Self::new(DEFAULT_CAPACITY, notify_tx)
    }

    /// 发布一笔行情快照
    ///
    /// 热路径：SeqLock 写入 + 无锁通道投递唤醒，不做任何阻塞操作。
    /// 容量耗尽时丢弃本笔并返回错误。
    pub fn publish(&self, raw_instrument: &str, quote: &Quote) -> Result<()> {
        let index = self.get_or_create_index(raw_instrument)?;

        self.slots[index].write(quote);

        // 唤醒交给通知线程处理，保持回调线程无锁
        let _ = self.notify_tx.send(raw_instrument.to_string());

        Ok(())
    }

    /// 原子读取一笔快照及其版本号
    ///
    /// 读取不阻塞写入方；连续撕裂超过重试上限时返回 None（本轮跳过）。
    pub fn read(&self, raw_instrument: &str) -> Option<(Quote, u64)> {
        let index = self.index_of(raw_instrument)?;
        self.slots[index].read()
    }

    /// 查找槽位下标，不存在时不创建
    pub fn index_of(&self, raw_instrument: &str) -> Option<usize> {
        self.index.read().get(raw_instrument).copied()
    }

    /// 已分配槽位数
    pub fn instrument_count(&self) -> usize {
        self.index.read().len()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn get_or_create_index(&self, raw_instrument: &str) -> Result<usize> {
        // 快路径：读锁查找
        if let Some(&index) = self.index.read().get(raw_instrument) {
            return Ok(index);
        }

        // 慢路径：写锁插入，二次检查防止并发重复分配
        let mut map = self.index.write();
        if let Some(&index) = map.get(raw_instrument) {
            return Ok(index);
        }

        let index = map.len();
        if index >= self.slots.len() {
            if !self.capacity_warned.swap(true, Ordering::Relaxed) {
                log::error!(
                    "Quote cache capacity exceeded ({}), dropping further new instruments",
                    self.slots.len()
                );
            }
            return Err(GatewayError::CacheCapacity(format!(
                "capacity {} exhausted, cannot cache {}",
                self.slots.len(),
                raw_instrument
            )));
        }

        map.insert(raw_instrument.to_string(), index);
        Ok(index)
    }
}
