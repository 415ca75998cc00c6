//! 推送协议层
//!
//! aid 风格增量快照协议：会话首帧为全量（FULL），之后为字段级差分
//! （DIFF）。本模块只负责 JSON 构建，不关心网络与会话状态。

pub mod diff;

pub use diff::{quote_changed, quote_diff, quote_to_json, rtn_data_frame};
