//! 健康检查处理器
//! 提供 /health 和 /ready 端点

use axum::{extract::State, Json};
use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

use crate::middleware::AppState;

/// 存活探针响应
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
}

/// 就绪探针响应
#[derive(Serialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub checks: Vec<HealthCheck>,
}

/// 健康检查项
#[derive(Serialize)]
pub struct HealthCheck {
    pub name: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

static START_TIME: Lazy<Instant> = Lazy::new(Instant::now);

/// 记录应用启动时间（main 中尽早调用）
pub fn set_start_time() {
    Lazy::force(&START_TIME);
}

/// 获取应用运行时间（秒）
pub fn get_uptime() -> u64 {
    START_TIME.elapsed().as_secs()
}

/// 存活探针
/// 快速响应，不检查依赖
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: get_uptime(),
    })
}

/// 就绪探针
/// 内存后端总是就绪；PostgreSQL 后端检查数据库连接
pub async fn readiness_check(State(state): State<Arc<AppState>>) -> Json<ReadinessResponse> {
    let mut checks = Vec::new();

    match &state.db {
        Some(store) => {
            let (status, message) = match store.ping().await {
                Ok(()) => ("healthy", None),
                Err(e) => {
                    tracing::warn!(error = %e, "Approval store readiness check failed");
                    ("unhealthy", Some(e.to_string()))
                }
            };
            checks.push(HealthCheck {
                name: "database".to_string(),
                status: status.to_string(),
                message,
            });
        }
        None => checks.push(HealthCheck {
            name: "storage".to_string(),
            status: "healthy".to_string(),
            message: Some("in-memory backend".to_string()),
        }),
    }

    let all_healthy = checks.iter().all(|c| c.status == "healthy");

    Json(ReadinessResponse {
        ready: all_healthy,
        checks,
    })
}
