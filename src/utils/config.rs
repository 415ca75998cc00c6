//! 配置管理模块
//!
//! 网关配置由外部加载器提供 JSON，这里只负责结构定义、默认值与校验。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::{GatewayError, Result};

/// 单个CTP前置连接配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CtpConnectionConfig {
    pub connection_id: String,

    /// 前置地址，如 `tcp://180.168.146.187:10210`
    pub front_addr: String,

    pub broker_id: String,

    /// 每个连接最大订阅数
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions: usize,

    /// 连接优先级（1-10，数字越小优先级越高；当前仅作展示，不参与轮询）
    #[serde(default = "default_priority")]
    pub priority: u8,

    /// 是否启用此连接
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// 网关全局配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_websocket_port")]
    pub websocket_port: u16,

    /// 是否开启自动故障转移
    #[serde(default = "default_true")]
    pub auto_failover: bool,

    /// 健康检查间隔(秒)
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval: u64,

    /// 订阅维护间隔(秒)
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval: u64,

    /// 订阅失败最大重试次数
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,

    pub connections: Vec<CtpConnectionConfig>,
}

fn default_websocket_port() -> u16 {
    7799
}
fn default_health_check_interval() -> u64 {
    30
}
fn default_maintenance_interval() -> u64 {
    60
}
fn default_max_retry_count() -> u32 {
    3
}
fn default_max_subscriptions() -> usize {
    500
}
fn default_priority() -> u8 {
    1
}
fn default_true() -> bool {
    true
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            websocket_port: default_websocket_port(),
            auto_failover: true,
            health_check_interval: default_health_check_interval(),
            maintenance_interval: default_maintenance_interval(),
            max_retry_count: default_max_retry_count(),
            connections: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// 从 JSON 文件加载配置
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| GatewayError::ConfigError(format!("Failed to read config file: {}", e)))?;
        Self::load_from_json(&content)
    }

    /// 从 JSON 字符串加载配置
    pub fn load_from_json(json: &str) -> Result<Self> {
        let config: GatewayConfig = serde_json::from_str(json)
            .map_err(|e| GatewayError::ConfigError(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// 以单前置地址构建单连接配置（`--front-addr` 兼容模式）
    pub fn single_front(front_addr: &str, broker_id: &str, websocket_port: u16) -> Self {
        Self {
            websocket_port,
            connections: vec![CtpConnectionConfig {
                connection_id: "single".to_string(),
                front_addr: front_addr.to_string(),
                broker_id: broker_id.to_string(),
                max_subscriptions: default_max_subscriptions(),
                priority: 1,
                enabled: true,
            }],
            ..Default::default()
        }
    }

    /// SimNow 环境默认多前置配置
    pub fn simnow_default() -> Self {
        let fronts = [
            ("simnow_telecom", "tcp://180.168.146.187:10210", 1u8),
            ("simnow_unicom", "tcp://180.168.146.187:10211", 2u8),
            ("simnow_mobile", "tcp://218.202.237.33:10212", 3u8),
        ];

        Self {
            connections: fronts
                .iter()
                .map(|(id, addr, priority)| CtpConnectionConfig {
                    connection_id: id.to_string(),
                    front_addr: addr.to_string(),
                    broker_id: "9999".to_string(),
                    max_subscriptions: default_max_subscriptions(),
                    priority: *priority,
                    enabled: true,
                })
                .collect(),
            ..Default::default()
        }
    }

    /// 启用中的连接配置
    pub fn enabled_connections(&self) -> impl Iterator<Item = &CtpConnectionConfig> {
        self.connections.iter().filter(|c| c.enabled)
    }

    /// 配置校验
    pub fn validate(&self) -> Result<()> {
        if self.websocket_port == 0 {
            return Err(GatewayError::ConfigError(
                "websocket_port must be non-zero".to_string(),
            ));
        }

        if self.enabled_connections().next().is_none() {
            return Err(GatewayError::ConfigError(
                "at least one enabled connection is required".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for conn in &self.connections {
            if conn.connection_id.is_empty() {
                return Err(GatewayError::ConfigError(
                    "connection_id must not be empty".to_string(),
                ));
            }
            if !seen.insert(conn.connection_id.as_str()) {
                return Err(GatewayError::ConfigError(format!(
                    "duplicate connection_id: {}",
                    conn.connection_id
                )));
            }
            if conn.front_addr.is_empty() {
                return Err(GatewayError::ConfigError(format!(
                    "front_addr must not be empty for connection {}",
                    conn.connection_id
                )));
            }
            if conn.max_subscriptions == 0 {
                return Err(GatewayError::ConfigError(format!(
                    "max_subscriptions must be positive for connection {}",
                    conn.connection_id
                )));
            }
            if !(1..=10).contains(&conn.priority) {
                return Err(GatewayError::ConfigError(format!(
                    "priority must be in 1..=10 for connection {}",
                    conn.connection_id
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_from_json() {
        let json = r#"{
            "websocket_port": 7799,
            "auto_failover": true,
            "health_check_interval": 30,
            "maintenance_interval": 60,
            "max_retry_count": 3,
            "connections": [
                {
                    "connection_id": "simnow_telecom",
                    "front_addr": "tcp://180.168.146.187:10210",
                    "broker_id": "9999",
                    "max_subscriptions": 500,
                    "priority": 1,
                    "enabled": true
                }
            ]
        }"#;

        let config = GatewayConfig::load_from_json(json).unwrap();
        assert_eq!(config.websocket_port, 7799);
        assert_eq!(config.connections.len(), 1);
        assert_eq!(config.connections[0].broker_id, "9999");
    }

    #[test]
    fn test_defaults_applied() {
        let json = r#"{
            "connections": [
                {"connection_id": "c1", "front_addr": "tcp://127.0.0.1:1", "broker_id": "9999"}
            ]
        }"#;

        let config = GatewayConfig::load_from_json(json).unwrap();
        assert_eq!(config.websocket_port, 7799);
        assert_eq!(config.health_check_interval, 30);
        assert_eq!(config.maintenance_interval, 60);
        assert_eq!(config.max_retry_count, 3);
        assert!(config.auto_failover);
        assert_eq!(config.connections[0].max_subscriptions, 500);
        assert_eq!(config.connections[0].priority, 1);
        assert!(config.connections[0].enabled);
    }

    #[test]
    fn test_validate_rejects_empty_connections() {
        let config = GatewayConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_ids() {
        let mut config = GatewayConfig::simnow_default();
        config.connections[1].connection_id = config.connections[0].connection_id.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_priority() {
        let mut config = GatewayConfig::single_front("tcp://127.0.0.1:1", "9999", 7799);
        config.connections[0].priority = 11;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_simnow_default() {
        let config = GatewayConfig::simnow_default();
        assert!(config.validate().is_ok());
        assert_eq!(config.connections.len(), 3);
        assert_eq!(config.connections[2].priority, 3);
    }

    #[test]
    fn test_disabled_connections_filtered() {
        let mut config = GatewayConfig::simnow_default();
        config.connections[0].enabled = false;
        assert_eq!(config.enabled_connections().count(), 2);
    }
}
