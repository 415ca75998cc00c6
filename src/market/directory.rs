//! 合约ID映射表
//!
//! 客户端以带交易所前缀的展示形式订阅（`SHFE.rb2501`），上游通信用
//! 原始形式（`rb2501`）。映射由订阅请求逐步填充，进程级共享，
//! 追加为主：写用写锁，读用读锁。

use std::collections::HashMap;

use parking_lot::RwLock;

/// raw合约ID -> 展示形式合约ID
pub struct InstrumentDirectory {
    map: RwLock<HashMap<String, String>>,
}

impl InstrumentDirectory {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }

    /// 登记一条映射（来自客户端订阅请求）
    pub fn insert(&self, raw: &str, display: &str) {
        self.map
            .write()
            .insert(raw.to_string(), display.to_string());
    }

    /// 查找展示形式；未登记时回退为 raw 本身
    pub fn display_of(&self, raw: &str) -> String {
        self.map
            .read()
            .get(raw)
            .cloned()
            .unwrap_or_else(|| raw.to_string())
    }

    /// 从展示形式拆出 raw ID（去掉 `EXCHANGE.` 前缀）
    pub fn strip_exchange_prefix(display: &str) -> &str {
        match display.find('.') {
            Some(pos) => &display[pos + 1..],
            None => display,
        }
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

impl Default for InstrumentDirectory {
    fn default() -> Self {
        Self::new()
    }
}
