//! 行情数据模型
//!
//! 定义行情快照的固定结构（Quote）与上游深度行情（DepthMarketData），
//! 以及价格有效性过滤、两位小数量化、时间串拼装等构建规则。
//! 遵循解耦原则：数据模型与网络层分离。

pub mod cache;
pub mod directory;

/// 行情深度档位数（对外固定10档，6-10档恒为空）
pub const DEPTH_LEVELS: usize = 10;

/// 上游实际提供的深度档位数
pub const FEED_DEPTH: usize = 5;

/// 合约ID/时间串的定长存储宽度（含结尾NUL，有效内容 ≤ 31 字节）
pub const ID_CAPACITY: usize = 32;

/// 价格有效性判断
///
/// 上游以极大/极小值表示缺失：绝对值 ≤ 1e-6 或 ≥ 1e300 视为无效。
#[inline]
pub fn price_valid(v: f64) -> bool {
    v.is_finite() && v.abs() > 1e-6 && v.abs() < 1e300
}

/// 价格量化到两位小数
#[inline]
pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// 无效价格归零，有效价格量化到两位小数
#[inline]
pub fn clean_price(v: f64) -> f64 {
    if price_valid(v) {
        round2(v)
    } else {
        0.0
    }
}

/// 拼装 `YYYY-MM-DD HH:MM:SS.mmm` 格式时间串
///
/// 交易日为 `YYYYMMDD`，更新时间为 `HH:MM:SS`。字段缺失时尽量降级输出。
pub fn format_datetime(trading_day: &str, update_time: &str, millisec: i32) -> String {
    let mut out = String::with_capacity(24);

    let td = trading_day.as_bytes();
    if td.len() == 8 && td.iter().all(|b| b.is_ascii_digit()) {
        out.push_str(&trading_day[0..4]);
        out.push('-');
        out.push_str(&trading_day[4..6]);
        out.push('-');
        out.push_str(&trading_day[6..8]);
        out.push(' ');
    }

    if !update_time.is_empty() {
        out.push_str(update_time);
        let ms = millisec.clamp(0, 999);
        out.push('.');
        out.push((b'0' + (ms / 100) as u8) as char);
        out.push((b'0' + (ms / 10 % 10) as u8) as char);
        out.push((b'0' + (ms % 10) as u8) as char);
    }

    out
}

fn copy_truncated(dst: &mut [u8; ID_CAPACITY], src: &str) {
    let bytes = src.as_bytes();
    let len = bytes.len().min(ID_CAPACITY - 1);
    dst[..len].copy_from_slice(&bytes[..len]);
    for b in dst[len..].iter_mut() {
        *b = 0;
    }
}

fn trim_nul(buf: &[u8]) -> &str {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    std::str::from_utf8(&buf[..end]).unwrap_or("")
}

/// 上游深度行情（vendor回调原始数据）
///
/// 字段与CTP深度行情回报对齐，价格缺失时为哨兵值（极大数）。
#[derive(Debug, Clone, Default)]
pub struct DepthMarketData {
    pub instrument_id: String,
    /// 交易日 `YYYYMMDD`
    pub trading_day: String,
    /// 更新时间 `HH:MM:SS`
    pub update_time: String,
    pub update_millisec: i32,

    pub last_price: f64,
    pub highest_price: f64,
    pub lowest_price: f64,
    pub open_price: f64,
    pub close_price: f64,
    pub settlement_price: f64,
    pub upper_limit_price: f64,
    pub lower_limit_price: f64,
    pub pre_settlement_price: f64,
    pub pre_close_price: f64,

    pub volume: i32,
    pub turnover: f64,
    pub open_interest: f64,
    pub pre_open_interest: f64,

    pub bid_price: [f64; FEED_DEPTH],
    pub bid_volume: [i32; FEED_DEPTH],
    pub ask_price: [f64; FEED_DEPTH],
    pub ask_volume: [i32; FEED_DEPTH],
}

/// 行情快照（固定结构，`Copy`）
///
/// SeqLock 槽位直接整体拷贝此结构，因此保持 POD 形态：
/// 合约ID与时间串用定长字节数组存储，不携带堆内存。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quote {
    /// 展示形式合约ID（带交易所前缀，如 `SHFE.rb2501`）
    pub instrument_id: [u8; ID_CAPACITY],
    /// `YYYY-MM-DD HH:MM:SS.mmm`
    pub datetime: [u8; ID_CAPACITY],
    /// 接收时刻（毫秒时间戳）
    pub timestamp: u64,

    pub ask_price: [f64; DEPTH_LEVELS],
    pub ask_volume: [i32; DEPTH_LEVELS],
    pub bid_price: [f64; DEPTH_LEVELS],
    pub bid_volume: [i32; DEPTH_LEVELS],

    pub last_price: f64,
    pub highest: f64,
    pub lowest: f64,
    pub open: f64,
    pub close: f64,
    pub volume: i32,
    pub amount: f64,
    pub open_interest: i64,
    pub settlement: f64,
    pub upper_limit: f64,
    pub lower_limit: f64,
    pub pre_open_interest: i64,
    pub pre_settlement: f64,
    pub pre_close: f64,
}

impl Default for Quote {
    fn default() -> Self {
        Self {
            instrument_id: [0; ID_CAPACITY],
            datetime: [0; ID_CAPACITY],
            timestamp: 0,
            ask_price: [0.0; DEPTH_LEVELS],
            ask_volume: [0; DEPTH_LEVELS],
            bid_price: [0.0; DEPTH_LEVELS],
            bid_volume: [0; DEPTH_LEVELS],
            last_price: 0.0,
            highest: 0.0,
            lowest: 0.0,
            open: 0.0,
            close: 0.0,
            volume: 0,
            amount: 0.0,
            open_interest: 0,
            settlement: 0.0,
            upper_limit: 0.0,
            lower_limit: 0.0,
            pre_open_interest: 0,
            pre_settlement: 0.0,
            pre_close: 0.0,
        }
    }
}

impl Quote {
    pub fn instrument_id_str(&self) -> &str {
        trim_nul(&self.instrument_id)
    }

    pub fn datetime_str(&self) -> &str {
        trim_nul(&self.datetime)
    }

    pub fn set_instrument_id(&mut self, id: &str) {
        copy_truncated(&mut self.instrument_id, id);
    }

    pub fn set_datetime(&mut self, dt: &str) {
        copy_truncated(&mut self.datetime, dt);
    }

    /// 从上游深度行情构建快照
    ///
    /// 应用价格有效性过滤与两位小数量化；无效档位保持 0。
    pub fn from_depth(depth: &DepthMarketData, display_instrument: &str, recv_time_ms: u64) -> Self {
        let mut q = Quote::default();

        q.set_instrument_id(display_instrument);
        q.set_datetime(&format_datetime(
            &depth.trading_day,
            &depth.update_time,
            depth.update_millisec,
        ));
        q.timestamp = recv_time_ms;

        for i in 0..FEED_DEPTH {
            let ask = depth.ask_price[i];
            if price_valid(ask) {
                q.ask_price[i] = round2(ask);
                q.ask_volume[i] = depth.ask_volume[i];
            }

            let bid = depth.bid_price[i];
            if price_valid(bid) {
                q.bid_price[i] = round2(bid);
                q.bid_volume[i] = depth.bid_volume[i];
            }
        }

        q.last_price = clean_price(depth.last_price);
        q.highest = clean_price(depth.highest_price);
        q.lowest = clean_price(depth.lowest_price);
        q.open = clean_price(depth.open_price);
        q.close = clean_price(depth.close_price);
        q.settlement = clean_price(depth.settlement_price);
        q.upper_limit = clean_price(depth.upper_limit_price);
        q.lower_limit = clean_price(depth.lower_limit_price);
        q.pre_settlement = clean_price(depth.pre_settlement_price);
        q.pre_close = clean_price(depth.pre_close_price);

        q.volume = depth.volume;
        q.amount = depth.turnover;
        q.open_interest = depth.open_interest as i64;
        q.pre_open_interest = depth.pre_open_interest as i64;

        q
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_depth() -> DepthMarketData {
        DepthMarketData {
            instrument_id: "rb2501".to_string(),
            trading_day: "20250109".to_string(),
            update_time: "21:30:15".to_string(),
            update_millisec: 500,
            last_price: 3850.0,
            highest_price: 3880.0,
            lowest_price: 3820.0,
            open_price: 3830.0,
            close_price: f64::MAX,
            settlement_price: f64::MAX,
            upper_limit_price: 4100.0,
            lower_limit_price: 3600.0,
            pre_settlement_price: 3840.0,
            pre_close_price: 3838.0,
            volume: 10000,
            turnover: 385_000_000.0,
            open_interest: 120_000.0,
            pre_open_interest: 118_000.0,
            bid_price: [3849.0, 3848.0, 3847.0, 3846.0, 3845.0],
            bid_volume: [100, 80, 60, 40, 20],
            ask_price: [3851.0, 3852.0, 3853.0, 3854.0, 3855.0],
            ask_volume: [50, 70, 90, 110, 130],
        }
    }

    #[test]
    fn test_price_validity_filter() {
        assert!(!price_valid(0.0));
        assert!(!price_valid(1e-7));
        assert!(!price_valid(1e300));
        assert!(!price_valid(f64::MAX));
        assert!(!price_valid(-1e301));
        assert!(!price_valid(f64::NAN));
        assert!(price_valid(3850.0));
        assert!(price_valid(-0.5));
    }

    #[test]
    fn test_clean_price_rounds_to_two_decimals() {
        assert_eq!(clean_price(3850.123), 3850.12);
        assert_eq!(clean_price(3850.125), 3850.13);
        assert_eq!(clean_price(f64::MAX), 0.0);
        assert_eq!(clean_price(0.0), 0.0);
    }

    #[test]
    fn test_format_datetime() {
        assert_eq!(
            format_datetime("20250109", "21:30:15", 500),
            "2025-01-09 21:30:15.500"
        );
        assert_eq!(
            format_datetime("20250109", "09:00:00", 7),
            "2025-01-09 09:00:00.007"
        );
        // 更新时间缺失时只输出日期部分
        assert_eq!(format_datetime("20250109", "", 0), "2025-01-09 ");
        // 交易日非法时只输出时间部分
        assert_eq!(format_datetime("bad", "21:30:15", 0), "21:30:15.000");
    }

    #[test]
    fn test_from_depth_builds_quote() {
        let depth = sample_depth();
        let q = Quote::from_depth(&depth, "SHFE.rb2501", 1736430615500);

        assert_eq!(q.instrument_id_str(), "SHFE.rb2501");
        assert_eq!(q.datetime_str(), "2025-01-09 21:30:15.500");
        assert_eq!(q.timestamp, 1736430615500);
        assert_eq!(q.last_price, 3850.0);
        assert_eq!(q.ask_price[0], 3851.0);
        assert_eq!(q.ask_volume[0], 50);
        assert_eq!(q.bid_price[0], 3849.0);
        assert_eq!(q.bid_volume[0], 100);
        // 6-10 档为空
        assert_eq!(q.ask_price[5], 0.0);
        assert_eq!(q.bid_volume[9], 0);
        // 哨兵值过滤
        assert_eq!(q.close, 0.0);
        assert_eq!(q.settlement, 0.0);
        assert_eq!(q.volume, 10000);
        assert_eq!(q.open_interest, 120_000);
    }

    #[test]
    fn test_invalid_level_keeps_volume_zero() {
        let mut depth = sample_depth();
        depth.bid_price[4] = f64::MAX;
        depth.bid_volume[4] = 999;

        let q = Quote::from_depth(&depth, "SHFE.rb2501", 0);
        assert_eq!(q.bid_price[4], 0.0);
        assert_eq!(q.bid_volume[4], 0);
    }

    #[test]
    fn test_instrument_id_truncated_to_31_bytes() {
        let mut q = Quote::default();
        let long_id = "EXCHANGE.instrument_with_a_very_long_symbol";
        q.set_instrument_id(long_id);
        assert_eq!(q.instrument_id_str().len(), ID_CAPACITY - 1);
        assert!(long_id.starts_with(q.instrument_id_str()));
    }
}
