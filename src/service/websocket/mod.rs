//! WebSocket 服务模块
//!
//! 接入端：每 accept 一个客户端通道就生成一个会话 ID 并拉起一个
//! [`MdSession`] Actor。服务器根对象持有注册表、分发器、映射表与
//! 连接池的共享句柄，注入每个会话。

pub mod messages;
pub mod registry;
pub mod session;

use std::sync::Arc;

use actix_web::{web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use rand::Rng;

use self::registry::SessionRegistry;
use self::session::MdSession;
use crate::dispatch::SubscriptionDispatcher;
use crate::market::directory::InstrumentDirectory;
use crate::upstream::pool::CtpConnectionPool;

/// WebSocket 服务器（会话共享依赖的根持有者）
pub struct WebSocketServer {
    registry: Arc<SessionRegistry>,
    dispatcher: Arc<SubscriptionDispatcher>,
    directory: Arc<InstrumentDirectory>,
    pool: Arc<CtpConnectionPool>,
}

impl WebSocketServer {
    pub fn new(
        registry: Arc<SessionRegistry>,
        dispatcher: Arc<SubscriptionDispatcher>,
        directory: Arc<InstrumentDirectory>,
        pool: Arc<CtpConnectionPool>,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            directory,
            pool,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// 处理一次 WebSocket 接入
    pub async fn handle_connection(
        &self,
        req: HttpRequest,
        stream: web::Payload,
    ) -> Result<HttpResponse, Error> {
        let session_id = create_session_id();

        let session = MdSession::new(
            session_id,
            self.registry.clone(),
            self.dispatcher.clone(),
            self.directory.clone(),
            self.pool.clone(),
        );

        ws::start(session, &req, stream)
    }
}

/// 生成会话 ID：`session_<unix秒>_<毫秒>_<rand6>`
pub fn create_session_id() -> String {
    let now = chrono::Utc::now();
    let secs = now.timestamp();
    let millis = now.timestamp_subsec_millis();
    let suffix: u32 = rand::thread_rng().gen_range(100_000..=999_999);
    format!("session_{}_{}_{}", secs, millis, suffix)
}

/// WebSocket 路由处理函数
pub async fn ws_route(
    req: HttpRequest,
    stream: web::Payload,
    server: web::Data<Arc<WebSocketServer>>,
) -> Result<HttpResponse, Error> {
    server.handle_connection(req, stream).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_format() {
        let id = create_session_id();
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "session");
        assert!(parts[1].parse::<i64>().is_ok());
        assert!(parts[2].parse::<u32>().unwrap() < 1000);
        let suffix: u32 = parts[3].parse().unwrap();
        assert!((100_000..=999_999).contains(&suffix));
    }

    #[test]
    fn test_session_ids_unique() {
        let a = create_session_id();
        let b = create_session_id();
        // 毫秒相同也有 rand6 区分（碰撞概率可忽略）
        assert_ne!(a, b);
    }
}
