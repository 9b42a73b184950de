//! 日志与追踪系统
//! 初始化结构化日志和指标收集

use crate::config::AppConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// 初始化日志与追踪系统
pub fn init_telemetry(config: &AppConfig) {
    // 从环境变量构建过滤器
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    // 根据配置选择日志格式
    let log_layer = match config.logging.format.to_lowercase().as_str() {
        "json" => {
            // JSON 格式（生产环境）
            tracing_subscriber::fmt::layer()
                .json()
                .with_target(false)
                .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
                .boxed()
        }
        "pretty" => {
            // 美化格式（开发环境）
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_target(false)
                .boxed()
        }
        _ => tracing_subscriber::fmt::layer().with_target(false).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(log_layer)
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        level = %config.logging.level,
        format = %config.logging.format,
        backend = ?config.storage.backend,
        "Telemetry initialized"
    );
}

/// 审批引擎指标名称
pub mod metric_names {
    pub const FLOWS_CREATED: &str = "approval_flows_created_total";
    pub const FLOWS_COMPLETED: &str = "approval_flows_completed_total";
    pub const DECISIONS: &str = "approval_decisions_total";
    pub const STEPS_TIMED_OUT: &str = "approval_steps_timed_out_total";
    pub const CASCADE_WRITES: &str = "role_cascade_writes_total";
}

/// 初始化指标收集器
pub fn init_metrics() {
    // metrics 0.24 不再需要显式注册指标
    // 指标会在首次使用时自动创建
    metrics::describe_counter!(metric_names::FLOWS_CREATED, "Approval flows instantiated");
    metrics::describe_counter!(metric_names::FLOWS_COMPLETED, "Approval flows reaching a terminal state");
    metrics::describe_counter!(metric_names::DECISIONS, "Approve/reject decisions recorded");
    metrics::describe_counter!(metric_names::STEPS_TIMED_OUT, "Approval steps past their deadline");
    metrics::describe_counter!(metric_names::CASCADE_WRITES, "Role assignment rows written by cascades");
    tracing::debug!("Metrics initialized");
}
