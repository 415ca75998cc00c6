//! QAMD 行情网关服务
//!
//! 集成功能：
//! 1. 多CTP前置连接池（健康检查 + 自动重启）
//! 2. 订阅分发器（轮询负载均衡 + 故障转移 + 定期重试）
//! 3. SeqLock 行情缓存 + peek_message 增量推送
//! 4. WebSocket 接入（每通道一个会话 Actor）
//!
//! 生产环境以 vendor 行情库实现 `MdApiFactory` 接入真实前置；
//! 本二进制内置一个模拟前置（SimMdApiFactory）用于本机联调。
//!
//! 运行: cargo run --bin qamd-gateway -- --config config/gateway.json

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use parking_lot::Mutex;
use rand::Rng;

use qamd_gateway::dispatch::{DispatcherMailbox, SubscriptionDispatcher};
use qamd_gateway::market::cache::QuoteCache;
use qamd_gateway::market::directory::InstrumentDirectory;
use qamd_gateway::market::DepthMarketData;
use qamd_gateway::service::websocket::registry::SessionRegistry;
use qamd_gateway::service::websocket::{ws_route, WebSocketServer};
use qamd_gateway::upstream::pool::CtpConnectionPool;
use qamd_gateway::upstream::{
    CtpConnection, DispatcherEvents, MdApi, MdApiFactory, RspInfo,
};
use qamd_gateway::GatewayConfig;

/// 模拟前置的行情推送周期
const SIM_TICK_INTERVAL: Duration = Duration::from_millis(500);

/// 模拟前置会话
///
/// connect 后异步回报 front-connected / login-ok，订阅即回报成功并
/// 开始对已订阅合约做随机游走行情推送。
struct SimMdApi {
    spi: Weak<CtpConnection>,
    session_alive: Arc<AtomicBool>,
    instruments: Arc<Mutex<BTreeSet<String>>>,
}

impl SimMdApi {
    fn new(spi: Weak<CtpConnection>) -> Self {
        Self {
            spi,
            session_alive: Arc::new(AtomicBool::new(true)),
            instruments: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    fn synthetic_depth(instrument_id: &str, last_price: f64, volume: i32) -> DepthMarketData {
        let now = chrono::Local::now();
        let mut depth = DepthMarketData {
            instrument_id: instrument_id.to_string(),
            trading_day: now.format("%Y%m%d").to_string(),
            update_time: now.format("%H:%M:%S").to_string(),
            update_millisec: now.timestamp_subsec_millis() as i32,
            last_price,
            highest_price: last_price * 1.01,
            lowest_price: last_price * 0.99,
            open_price: last_price,
            close_price: f64::MAX,
            settlement_price: f64::MAX,
            upper_limit_price: last_price * 1.1,
            lower_limit_price: last_price * 0.9,
            pre_settlement_price: last_price,
            pre_close_price: last_price,
            volume,
            turnover: last_price * volume as f64,
            open_interest: 100_000.0,
            pre_open_interest: 100_000.0,
            ..Default::default()
        };
        for i in 0..5 {
            depth.bid_price[i] = last_price - (i as f64 + 1.0);
            depth.bid_volume[i] = 100 - (i as i32) * 10;
            depth.ask_price[i] = last_price + (i as f64 + 1.0);
            depth.ask_volume[i] = 100 - (i as i32) * 10;
        }
        depth
    }
}

impl MdApi for SimMdApi {
    fn connect(&self) {
        let spi = self.spi.clone();
        let alive = self.session_alive.clone();
        let instruments = self.instruments.clone();

        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            let Some(conn) = spi.upgrade() else { return };
            conn.on_front_connected();

            // 行情推送循环
            let mut rng = rand::thread_rng();
            let mut price = 4000.0f64;
            let mut volume = 0i32;
            while alive.load(Ordering::Relaxed) {
                std::thread::sleep(SIM_TICK_INTERVAL);
                let Some(conn) = spi.upgrade() else { break };

                price = (price + rng.gen_range(-2.0..2.0)).clamp(3600.0, 4400.0);
                volume += rng.gen_range(1..50);

                let subscribed: Vec<String> = instruments.lock().iter().cloned().collect();
                for instrument_id in subscribed {
                    let depth = SimMdApi::synthetic_depth(&instrument_id, price, volume);
                    conn.on_tick(&depth);
                }
            }
        });
    }

    fn release(&self) {
        self.session_alive.store(false, Ordering::Relaxed);
    }

    fn req_user_login(&self, _broker_id: &str, _request_id: i32) -> i32 {
        let spi = self.spi.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            if let Some(conn) = spi.upgrade() {
                conn.on_rsp_user_login(&RspInfo::ok());
            }
        });
        0
    }

    fn subscribe_market_data(&self, instrument_id: &str) -> i32 {
        self.instruments.lock().insert(instrument_id.to_string());

        let spi = self.spi.clone();
        let instrument = instrument_id.to_string();
        std::thread::spawn(move || {
            if let Some(conn) = spi.upgrade() {
                conn.on_rsp_sub_market_data(&instrument, &RspInfo::ok());
            }
        });
        0
    }

    fn unsubscribe_market_data(&self, instrument_id: &str) -> i32 {
        self.instruments.lock().remove(instrument_id);

        let spi = self.spi.clone();
        let instrument = instrument_id.to_string();
        std::thread::spawn(move || {
            if let Some(conn) = spi.upgrade() {
                conn.on_rsp_unsub_market_data(&instrument, &RspInfo::ok());
            }
        });
        0
    }
}

struct SimMdApiFactory;

impl MdApiFactory for SimMdApiFactory {
    fn create_md_api(
        &self,
        connection_id: &str,
        _flow_path: &str,
        front_addr: &str,
        spi: Weak<CtpConnection>,
    ) -> qamd_gateway::Result<Arc<dyn MdApi>> {
        log::info!(
            "SimMdApi session created for connection {} ({})",
            connection_id,
            front_addr
        );
        Ok(Arc::new(SimMdApi::new(spi)))
    }
}

/// 命令行参数
struct CliArgs {
    config_path: Option<String>,
    port: Option<u16>,
    front_addr: Option<String>,
    broker_id: String,
    multi_ctp: bool,
}

fn parse_args() -> CliArgs {
    let mut cli = CliArgs {
        config_path: None,
        port: None,
        front_addr: None,
        broker_id: "9999".to_string(),
        multi_ctp: false,
    };

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                if i + 1 < args.len() {
                    cli.config_path = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--port" => {
                if i + 1 < args.len() {
                    cli.port = args[i + 1].parse().ok();
                    i += 1;
                }
            }
            "--front-addr" => {
                if i + 1 < args.len() {
                    cli.front_addr = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--broker-id" => {
                if i + 1 < args.len() {
                    cli.broker_id = args[i + 1].clone();
                    i += 1;
                }
            }
            "--multi-ctp" => {
                cli.multi_ctp = true;
            }
            other => {
                log::warn!("Ignoring unknown argument: {}", other);
            }
        }
        i += 1;
    }

    cli
}

fn resolve_config(cli: &CliArgs) -> anyhow::Result<GatewayConfig> {
    let mut config = if let Some(ref path) = cli.config_path {
        GatewayConfig::load_from_file(path)
            .with_context(|| format!("failed to load config from {}", path))?
    } else if let Some(ref front_addr) = cli.front_addr {
        GatewayConfig::single_front(front_addr, &cli.broker_id, cli.port.unwrap_or(7799))
    } else {
        if !cli.multi_ctp {
            log::info!("No config given, falling back to SimNow default (multi-CTP)");
        }
        GatewayConfig::simnow_default()
    };

    if let Some(port) = cli.port {
        config.websocket_port = port;
    }
    config.validate().context("invalid gateway configuration")?;
    Ok(config)
}

fn print_startup_banner(config: &GatewayConfig, pool: &CtpConnectionPool) {
    println!("\n╔═══════════════════════════════════════════════════════╗");
    println!("║            🚀 QAMD Gateway Started                    ║");
    println!("╚═══════════════════════════════════════════════════════╝\n");

    println!("📡 WebSocket: ws://0.0.0.0:{}/ws", config.websocket_port);

    println!("\n🔌 Upstream connections:");
    for line in pool.connection_status() {
        println!("   • {}", line);
    }

    println!("\n📋 Protocol:");
    println!("   {{\"aid\":\"subscribe_quote\",\"ins_list\":\"SHFE.rb2501\"}}");
    println!("   {{\"aid\":\"peek_message\"}}");

    println!("\n🟢 Server is running. Press Ctrl+C to stop.\n");
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = parse_args();
    let config = resolve_config(&cli)?;

    log::info!("Starting QAMD Gateway in multi-CTP mode...");

    let running = Arc::new(AtomicBool::new(true));
    let directory = Arc::new(InstrumentDirectory::new());

    // 缓存 publish → 通知线程 的唤醒通道
    let (notify_tx, notify_rx) = crossbeam::channel::unbounded();
    let cache = Arc::new(QuoteCache::with_default_capacity(notify_tx));

    // 连接回报 → 分发器事件线程 的信箱
    let (event_tx, event_rx) = crossbeam::channel::unbounded();
    let mailbox: Arc<dyn DispatcherEvents> = Arc::new(DispatcherMailbox::new(event_tx));

    let dispatcher = Arc::new(SubscriptionDispatcher::new(&config));

    let pool = Arc::new(CtpConnectionPool::new(
        Arc::new(SimMdApiFactory),
        Arc::downgrade(&mailbox),
        cache.clone(),
        directory.clone(),
        running.clone(),
        config.health_check_interval,
    ));
    dispatcher.attach_pool(pool.clone());

    let registry = Arc::new(SessionRegistry::new(cache.clone(), directory.clone()));

    // 后台线程：行情唤醒、分发器事件、订阅维护
    let notifier_handle = registry.clone().start_notifier(notify_rx, running.clone());
    let event_handle = dispatcher.clone().start_event_loop(event_rx, running.clone());
    dispatcher.clone().start_maintenance(running.clone());

    for conn_config in &config.connections {
        if conn_config.enabled {
            if !pool.add_connection(conn_config.clone()) {
                anyhow::bail!("failed to add connection: {}", conn_config.connection_id);
            }
        } else {
            log::info!("Skipped disabled connection: {}", conn_config.connection_id);
        }
    }

    if !pool.clone().start_all() {
        log::warn!("Some CTP connections failed to start");
    }

    let ws_server = Arc::new(WebSocketServer::new(
        registry.clone(),
        dispatcher.clone(),
        directory.clone(),
        pool.clone(),
    ));

    print_startup_banner(&config, &pool);

    let bind_address = ("0.0.0.0", config.websocket_port);
    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(ws_server.clone()))
            .wrap(middleware::Logger::default())
            .route("/ws", web::get().to(ws_route))
            .route("/health", web::get().to(|| async { "OK" }))
    })
    .bind(bind_address)
    .with_context(|| format!("failed to bind {}:{}", bind_address.0, bind_address.1))?
    .run();

    let result = server.await;

    // 停机：1 秒粒度内所有后台循环观察到标志并退出
    log::info!("Stopping QAMD Gateway...");
    running.store(false, Ordering::SeqCst);
    dispatcher.stop_maintenance();
    pool.stop_all();
    let _ = notifier_handle.join();
    let _ = event_handle.join();
    log::info!("QAMD Gateway stopped");

    result.map_err(Into::into)
}
