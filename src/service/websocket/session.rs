//! WebSocket 会话 Actor
//!
//! 一个客户端通道一个 Actor：接入即发 welcome 帧，解析 aid 帧，
//! 订阅经 映射表 → 注册表 → 分发器 三步落地，peek 委托注册表执行。
//! 出站帧经 Actor 信箱投递，单会话天然单写且保序。

use std::sync::Arc;
use std::time::{Duration, Instant};

use actix::{
    Actor, ActorContext, Addr, AsyncContext, Handler as ActixHandler, Message as ActixMessage,
    StreamHandler,
};
use actix_web_actors::ws;

use super::messages::{error_frame, subscribe_ack_frame, welcome_frame, MdClientMessage};
use super::registry::{SessionRegistry, SessionSink};
use crate::dispatch::SubscriptionDispatcher;
use crate::market::directory::InstrumentDirectory;
use crate::upstream::pool::CtpConnectionPool;

/// 心跳间隔
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
/// 客户端超时时间
const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct MdSession {
    /// 会话 ID（`session_<秒>_<毫秒>_<rand6>`）
    pub session_id: String,

    registry: Arc<SessionRegistry>,
    dispatcher: Arc<SubscriptionDispatcher>,
    directory: Arc<InstrumentDirectory>,
    pool: Arc<CtpConnectionPool>,

    heartbeat: Instant,
}

impl MdSession {
    pub fn new(
        session_id: String,
        registry: Arc<SessionRegistry>,
        dispatcher: Arc<SubscriptionDispatcher>,
        directory: Arc<InstrumentDirectory>,
        pool: Arc<CtpConnectionPool>,
    ) -> Self {
        Self {
            session_id,
            registry,
            dispatcher,
            directory,
            pool,
            heartbeat: Instant::now(),
        }
    }

    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.heartbeat) > CLIENT_TIMEOUT {
                log::warn!("Session {} timed out, disconnecting", act.session_id);
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn handle_client_message(&mut self, msg: MdClientMessage, ctx: &mut ws::WebsocketContext<Self>) {
        match msg {
            MdClientMessage::SubscribeQuote { ins_list } => {
                for entry in ins_list.split(',') {
                    let display = entry.trim();
                    if display.is_empty() {
                        continue;
                    }

                    // 去掉交易所前缀得到 raw ID，上游通信用 raw 形式
                    let raw = InstrumentDirectory::strip_exchange_prefix(display);
                    self.directory.insert(raw, display);
                    self.registry.add_subscription(&self.session_id, raw);
                    self.dispatcher.add_subscription(&self.session_id, raw);
                }

                ctx.text(subscribe_ack_frame().to_string());
                log::info!("Session {} subscribed: {}", self.session_id, ins_list);
            }

            MdClientMessage::PeekMessage => {
                // 可能立即经 Addr 投递一帧，也可能挂起待行情唤醒
                self.registry.handle_peek(&self.session_id);
            }
        }
    }

    fn send_error(&self, message: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let frame = error_frame(message, chrono::Utc::now().timestamp_millis());
        ctx.text(frame.to_string());
    }
}

impl Actor for MdSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        log::info!("WebSocket session connected: {}", self.session_id);

        self.registry
            .register_session(&self.session_id, Arc::new(AddrSink(ctx.address())));
        self.start_heartbeat(ctx);

        let frame = welcome_frame(
            &self.session_id,
            self.pool.is_connected(),
            chrono::Utc::now().timestamp_millis(),
        );
        ctx.text(frame.to_string());
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        log::info!("WebSocket session closed: {}", self.session_id);

        self.dispatcher.remove_all_for_session(&self.session_id);
        self.registry.remove_session(&self.session_id);
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for MdSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.heartbeat = Instant::now();

                match serde_json::from_str::<MdClientMessage>(&text) {
                    Ok(client_msg) => self.handle_client_message(client_msg, ctx),
                    Err(e) => {
                        log::error!(
                            "Failed to parse message from session {}: {}",
                            self.session_id,
                            e
                        );
                        self.send_error(&format!("Invalid message format: {}", e), ctx);
                    }
                }
            }

            Ok(ws::Message::Ping(payload)) => {
                self.heartbeat = Instant::now();
                ctx.pong(&payload);
            }

            Ok(ws::Message::Pong(_)) => {
                self.heartbeat = Instant::now();
            }

            Ok(ws::Message::Binary(_)) => {
                log::warn!("Binary messages not supported");
            }

            Ok(ws::Message::Close(reason)) => {
                log::info!("Session {} closing: {:?}", self.session_id, reason);
                ctx.stop();
            }

            Err(e) => {
                log::error!("WebSocket protocol error on session {}: {}", self.session_id, e);
                ctx.stop();
            }

            _ => {}
        }
    }
}

/// 出站帧（注册表 → 会话 Actor）
pub struct SendFrame(pub String);

impl ActixMessage for SendFrame {
    type Result = ();
}

impl ActixHandler<SendFrame> for MdSession {
    type Result = ();

    fn handle(&mut self, msg: SendFrame, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

/// 以 Actor 地址实现的发送端：经信箱投递，单会话保序
struct AddrSink(Addr<MdSession>);

impl SessionSink for AddrSink {
    fn send_frame(&self, frame: String) {
        self.0.do_send(SendFrame(frame));
    }
}
