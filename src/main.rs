//! 审批引擎主入口

use approval_engine::{
    config::{AppConfig, StorageBackend},
    handlers::health,
    middleware::AppState,
    repository::{ApprovalStore, MemoryStore, PgStore},
    routes,
    services::{Clock, SystemClock},
    telemetry,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ===== CLI 参数处理 =====
    let args: Vec<String> = std::env::args().collect();

    if args.len() > 1 {
        match args[1].as_str() {
            "--version" => {
                println!("approval-engine {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--help" => {
                print_help();
                return Ok(());
            }
            _ => {
                eprintln!("未知参数: {}", args[1]);
                print_help();
                std::process::exit(1);
            }
        }
    }

    // 加载 .env 文件（开发环境）
    if let Ok(env) = std::env::var("APPROVAL_ENV") {
        dotenv::from_filename(format!(".env.{}", env)).ok();
    } else {
        dotenv::from_filename(".env.local").ok();
        dotenv::dotenv().ok();
    }

    health::set_start_time();

    // 1. 加载配置
    let config = AppConfig::from_env().map_err(|e| {
        eprintln!("Configuration error: {}", e);
        anyhow::anyhow!("Failed to load configuration: {}", e)
    })?;

    // 2. 初始化日志与指标
    telemetry::init_telemetry(&config);
    telemetry::init_metrics();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        backend = ?config.storage.backend,
        "Approval engine starting..."
    );

    // 3. 存储后端
    let (store, pg_store) = match config.storage.backend {
        StorageBackend::Postgres => {
            let pg = PgStore::connect(&config.database).await?;
            let store: Arc<dyn ApprovalStore> = Arc::new(pg.clone());
            (store, Some(pg))
        }
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory storage, state is lost on restart");
            let store: Arc<dyn ApprovalStore> = Arc::new(MemoryStore::new());
            (store, None)
        }
    };

    // 4. 构建应用状态
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let app_state = Arc::new(AppState::new(config.clone(), store, pg_store, clock));

    // 5. 超时扫描后台任务
    if config.engine.timeout_sweep_interval_secs > 0 {
        let flows = app_state.flow_service.clone();
        let period = Duration::from_secs(config.engine.timeout_sweep_interval_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Err(e) = flows.sweep_timeouts().await {
                    tracing::error!(error = %e, "Timeout sweep failed");
                }
            }
        });
    }

    // 6. 构建路由并启动服务器
    let app = routes::create_router(app_state);

    let addr = &config.server.addr;
    let listener = TcpListener::bind(addr).await?;

    tracing::info!(addr = %addr, "Server listening");

    // 7. 优雅关闭
    let grace = Duration::from_secs(config.server.graceful_shutdown_timeout_secs);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(grace))
        .await?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// 优雅关闭信号处理
///
/// 收到信号后开始排空连接；超过宽限期仍未结束则强制退出进程。
async fn shutdown_signal(grace: Duration) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Ctrl+C received, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Terminate signal received, starting graceful shutdown");
        },
    }

    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        tracing::warn!("Graceful shutdown timeout reached, forcing exit");
        std::process::exit(1);
    });
}

/// 打印帮助信息
fn print_help() {
    println!("approval-engine {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("用法: approval-engine [选项]");
    println!();
    println!("选项:");
    println!("  --version     打印版本信息并退出");
    println!("  --help        打印此帮助信息并退出");
    println!();
    println!("环境变量:");
    println!("  所有配置通过 APPROVAL_ 前缀的环境变量完成");
    println!("  可用选项请参考 .env.example");
}
