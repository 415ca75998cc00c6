//! 行情快照的 JSON 构建与字段级差分
//!
//! 全量形态：每合约输出完整字段集，6-10 档深度与 `average` 恒为 null。
//! 差分形态：只输出与上一次发送值不同的字段；价格在入缓存时已量化到
//! 两位小数，因此数值比较用严格相等，不引入 epsilon。

use serde_json::{json, Map, Value};

use crate::market::{Quote, DEPTH_LEVELS, FEED_DEPTH};

// 预分配的 JSON key，避免运行时拼接
const ASK_PRICE_KEYS: [&str; DEPTH_LEVELS] = [
    "ask_price1", "ask_price2", "ask_price3", "ask_price4", "ask_price5",
    "ask_price6", "ask_price7", "ask_price8", "ask_price9", "ask_price10",
];
const ASK_VOLUME_KEYS: [&str; DEPTH_LEVELS] = [
    "ask_volume1", "ask_volume2", "ask_volume3", "ask_volume4", "ask_volume5",
    "ask_volume6", "ask_volume7", "ask_volume8", "ask_volume9", "ask_volume10",
];
const BID_PRICE_KEYS: [&str; DEPTH_LEVELS] = [
    "bid_price1", "bid_price2", "bid_price3", "bid_price4", "bid_price5",
    "bid_price6", "bid_price7", "bid_price8", "bid_price9", "bid_price10",
];
const BID_VOLUME_KEYS: [&str; DEPTH_LEVELS] = [
    "bid_volume1", "bid_volume2", "bid_volume3", "bid_volume4", "bid_volume5",
    "bid_volume6", "bid_volume7", "bid_volume8", "bid_volume9", "bid_volume10",
];

/// 构建单合约全量 JSON
pub fn quote_to_json(q: &Quote) -> Value {
    let mut m = Map::new();

    m.insert("instrument_id".to_string(), json!(q.instrument_id_str()));
    m.insert("datetime".to_string(), json!(q.datetime_str()));
    m.insert("timestamp".to_string(), json!(q.timestamp));

    // Ask 10-6 恒为 null
    for i in (FEED_DEPTH..DEPTH_LEVELS).rev() {
        m.insert(ASK_PRICE_KEYS[i].to_string(), Value::Null);
        m.insert(ASK_VOLUME_KEYS[i].to_string(), Value::Null);
    }
    // Ask 5-1
    for i in (0..FEED_DEPTH).rev() {
        m.insert(ASK_PRICE_KEYS[i].to_string(), json!(q.ask_price[i]));
        m.insert(ASK_VOLUME_KEYS[i].to_string(), json!(q.ask_volume[i]));
    }

    // Bid 1-5
    for i in 0..FEED_DEPTH {
        m.insert(BID_PRICE_KEYS[i].to_string(), json!(q.bid_price[i]));
        m.insert(BID_VOLUME_KEYS[i].to_string(), json!(q.bid_volume[i]));
    }
    // Bid 6-10 恒为 null
    for i in FEED_DEPTH..DEPTH_LEVELS {
        m.insert(BID_PRICE_KEYS[i].to_string(), Value::Null);
        m.insert(BID_VOLUME_KEYS[i].to_string(), Value::Null);
    }

    m.insert("last_price".to_string(), json!(q.last_price));
    m.insert("highest".to_string(), json!(q.highest));
    m.insert("lowest".to_string(), json!(q.lowest));
    m.insert("open".to_string(), json!(q.open));
    m.insert("close".to_string(), json!(q.close));

    m.insert("average".to_string(), Value::Null);
    m.insert("volume".to_string(), json!(q.volume));
    m.insert("amount".to_string(), json!(q.amount));
    m.insert("open_interest".to_string(), json!(q.open_interest));

    m.insert("settlement".to_string(), json!(q.settlement));
    m.insert("upper_limit".to_string(), json!(q.upper_limit));
    m.insert("lower_limit".to_string(), json!(q.lower_limit));

    m.insert("pre_open_interest".to_string(), json!(q.pre_open_interest));
    m.insert("pre_settlement".to_string(), json!(q.pre_settlement));
    m.insert("pre_close".to_string(), json!(q.pre_close));

    Value::Object(m)
}

/// 两次快照间是否存在差异
#[inline]
pub fn quote_changed(old: &Quote, new: &Quote) -> bool {
    old != new
}

/// 计算字段级差分：仅包含发生变化的字段
pub fn quote_diff(old: &Quote, new: &Quote) -> Map<String, Value> {
    let mut m = Map::new();

    if old.instrument_id != new.instrument_id {
        m.insert("instrument_id".to_string(), json!(new.instrument_id_str()));
    }
    if old.datetime != new.datetime {
        m.insert("datetime".to_string(), json!(new.datetime_str()));
    }
    if old.timestamp != new.timestamp {
        m.insert("timestamp".to_string(), json!(new.timestamp));
    }

    // 深度档位逐档比较，价与量各自独立
    for i in 0..DEPTH_LEVELS {
        if old.ask_price[i] != new.ask_price[i] {
            m.insert(ASK_PRICE_KEYS[i].to_string(), json!(new.ask_price[i]));
        }
        if old.ask_volume[i] != new.ask_volume[i] {
            m.insert(ASK_VOLUME_KEYS[i].to_string(), json!(new.ask_volume[i]));
        }
        if old.bid_price[i] != new.bid_price[i] {
            m.insert(BID_PRICE_KEYS[i].to_string(), json!(new.bid_price[i]));
        }
        if old.bid_volume[i] != new.bid_volume[i] {
            m.insert(BID_VOLUME_KEYS[i].to_string(), json!(new.bid_volume[i]));
        }
    }

    if old.last_price != new.last_price {
        m.insert("last_price".to_string(), json!(new.last_price));
    }
    if old.highest != new.highest {
        m.insert("highest".to_string(), json!(new.highest));
    }
    if old.lowest != new.lowest {
        m.insert("lowest".to_string(), json!(new.lowest));
    }
    if old.open != new.open {
        m.insert("open".to_string(), json!(new.open));
    }
    if old.close != new.close {
        m.insert("close".to_string(), json!(new.close));
    }
    if old.upper_limit != new.upper_limit {
        m.insert("upper_limit".to_string(), json!(new.upper_limit));
    }
    if old.lower_limit != new.lower_limit {
        m.insert("lower_limit".to_string(), json!(new.lower_limit));
    }
    if old.pre_settlement != new.pre_settlement {
        m.insert("pre_settlement".to_string(), json!(new.pre_settlement));
    }
    if old.pre_close != new.pre_close {
        m.insert("pre_close".to_string(), json!(new.pre_close));
    }
    if old.settlement != new.settlement {
        m.insert("settlement".to_string(), json!(new.settlement));
    }

    if old.volume != new.volume {
        m.insert("volume".to_string(), json!(new.volume));
    }
    if old.amount != new.amount {
        m.insert("amount".to_string(), json!(new.amount));
    }
    if old.open_interest != new.open_interest {
        m.insert("open_interest".to_string(), json!(new.open_interest));
    }
    if old.pre_open_interest != new.pre_open_interest {
        m.insert("pre_open_interest".to_string(), json!(new.pre_open_interest));
    }

    m
}

/// 组装 rtn_data 帧
///
/// ```json
/// {"aid":"rtn_data","data":[
///   {"quotes":{ "<display_id>": { ... }, ... }},
///   {"account_id":"", "ins_list":"", "mdhis_more_data":false}
/// ]}
/// ```
pub fn rtn_data_frame(quotes: Map<String, Value>) -> Value {
    json!({
        "aid": "rtn_data",
        "data": [
            { "quotes": Value::Object(quotes) },
            { "account_id": "", "ins_list": "", "mdhis_more_data": false }
        ]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::DepthMarketData;

    fn base_quote() -> Quote {
        let mut depth = DepthMarketData {
            instrument_id: "rb2501".to_string(),
            trading_day: "20250109".to_string(),
            update_time: "21:30:15".to_string(),
            update_millisec: 0,
            last_price: 3850.0,
            volume: 10000,
            ..Default::default()
        };
        depth.bid_price[0] = 3849.0;
        depth.bid_volume[0] = 100;
        depth.ask_price[0] = 3851.0;
        depth.ask_volume[0] = 50;
        Quote::from_depth(&depth, "SHFE.rb2501", 1736430615000)
    }

    #[test]
    fn test_full_json_shape() {
        let q = base_quote();
        let v = quote_to_json(&q);

        assert_eq!(v["instrument_id"], "SHFE.rb2501");
        assert_eq!(v["last_price"], 3850.0);
        assert_eq!(v["ask_price1"], 3851.0);
        assert_eq!(v["ask_volume1"], 50);
        assert_eq!(v["bid_price1"], 3849.0);

        // 6-10 档与 average 恒为 null
        for key in [
            "bid_price6",
            "bid_price7",
            "bid_price8",
            "bid_price9",
            "bid_price10",
            "ask_volume6",
            "ask_volume10",
            "average",
        ] {
            assert!(v[key].is_null(), "{} should be null", key);
        }

        // 未成交档位输出 0 而非 null
        assert_eq!(v["ask_price2"], 0.0);
        assert_eq!(v["volume"], 10000);
        assert_eq!(v["timestamp"], 1736430615000u64);
    }

    #[test]
    fn test_diff_contains_exactly_changed_fields() {
        let old = base_quote();
        let mut new = old;
        new.last_price = 3850.5;
        new.volume = 10001;

        let diff = quote_diff(&old, &new);
        assert_eq!(diff.len(), 2);
        assert_eq!(diff["last_price"], 3850.5);
        assert_eq!(diff["volume"], 10001);
    }

    #[test]
    fn test_diff_depth_levels_independent() {
        let old = base_quote();
        let mut new = old;
        new.bid_price[0] = 3848.0;

        let diff = quote_diff(&old, &new);
        assert_eq!(diff.len(), 1);
        assert_eq!(diff["bid_price1"], 3848.0);
        // 量未变不输出
        assert!(!diff.contains_key("bid_volume1"));
    }

    #[test]
    fn test_diff_string_and_timestamp_fields() {
        let old = base_quote();
        let mut new = old;
        new.set_datetime("2025-01-09 21:30:16.000");
        new.timestamp = 1736430616000;

        let diff = quote_diff(&old, &new);
        assert_eq!(diff.len(), 2);
        assert_eq!(diff["datetime"], "2025-01-09 21:30:16.000");
        assert_eq!(diff["timestamp"], 1736430616000u64);
    }

    #[test]
    fn test_identical_quotes_produce_empty_diff() {
        let q = base_quote();
        assert!(!quote_changed(&q, &q));
        assert!(quote_diff(&q, &q).is_empty());
    }

    #[test]
    fn test_rtn_data_envelope() {
        let mut quotes = Map::new();
        quotes.insert("SHFE.rb2501".to_string(), quote_to_json(&base_quote()));
        let frame = rtn_data_frame(quotes);

        assert_eq!(frame["aid"], "rtn_data");
        assert_eq!(frame["data"].as_array().unwrap().len(), 2);
        assert_eq!(
            frame["data"][0]["quotes"]["SHFE.rb2501"]["last_price"],
            3850.0
        );
        assert_eq!(frame["data"][1]["account_id"], "");
        assert_eq!(frame["data"][1]["ins_list"], "");
        assert_eq!(frame["data"][1]["mdhis_more_data"], false);
    }

    /// 全量帧 + 若干差分帧按序合并后应还原为最新快照（round-trip）
    #[test]
    fn test_full_plus_diffs_reconstruct_latest() {
        let q0 = base_quote();
        let mut q1 = q0;
        q1.last_price = 3850.5;
        q1.volume = 10001;
        let mut q2 = q1;
        q2.bid_price[0] = 3850.0;
        q2.bid_volume[0] = 30;
        q2.timestamp = 1736430617000;

        // 客户端侧：以全量为底，依次覆盖差分字段
        let mut state = quote_to_json(&q0);
        for (old, new) in [(&q0, &q1), (&q1, &q2)] {
            for (k, v) in quote_diff(old, new) {
                state[k.as_str()] = v;
            }
        }

        let latest = quote_to_json(&q2);
        assert_eq!(state, latest);
    }
}
