//! HTTP 中间件
//! 应用状态与请求追踪

use axum::{
    extract::Request,
    http::{HeaderMap, HeaderValue},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::realtime::EventBus;
use crate::repository::{ApprovalStore, PgStore};
use crate::services::{
    AdminLock, Clock, FlowService, MatrixService, OrganizationService, RoleService,
};

/// 应用状态
///
/// 服务之间共享同一个存储、时钟和管理锁；Clone 只拷贝 Arc。
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    /// 仅 PostgreSQL 后端时存在，用于就绪检查
    pub db: Option<PgStore>,
    pub organization_service: Arc<OrganizationService>,
    pub role_service: Arc<RoleService>,
    pub matrix_service: Arc<MatrixService>,
    pub flow_service: Arc<FlowService>,
    pub event_bus: Arc<EventBus>,
}

impl AppState {
    /// 基于给定存储组装全部服务
    pub fn new(
        config: AppConfig,
        store: Arc<dyn ApprovalStore>,
        db: Option<PgStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let admin_lock: AdminLock = Arc::new(tokio::sync::Mutex::new(()));
        let event_bus = Arc::new(EventBus::new(config.engine.event_bus_capacity));

        let organization_service = Arc::new(OrganizationService::new(
            store.clone(),
            admin_lock.clone(),
            clock.clone(),
            config.engine.max_organization_level,
        ));
        let role_service = Arc::new(RoleService::new(store.clone(), admin_lock, clock.clone()));
        let matrix_service = Arc::new(MatrixService::new(store.clone(), clock.clone()));
        let flow_service = Arc::new(FlowService::new(
            store,
            role_service.clone(),
            matrix_service.clone(),
            event_bus.clone(),
            clock,
            config.engine.clone(),
        ));

        Self {
            config,
            db,
            organization_service,
            role_service,
            matrix_service,
            flow_service,
            event_bus,
        }
    }
}

/// 请求追踪中间件
/// 为每个请求生成 trace_id 和 request_id，并记录指标
pub async fn request_tracking_middleware(req: Request, next: Next) -> Response {
    let trace_id = extract_or_generate_trace_id(req.headers());
    let request_id = Uuid::new_v4().to_string();

    let method = req.method().to_string();
    let uri = req.uri().path().to_string();

    let span = tracing::info_span!(
        "http_request",
        trace_id = %trace_id,
        request_id = %request_id,
        method = %method,
        uri = %uri,
    );

    async move {
        let start = Instant::now();
        let mut response = next.run(req).await;
        let elapsed = start.elapsed();

        // 指标标签只用静态字符串
        let status = response.status().as_u16();
        let method_name = match method.as_str() {
            "GET" => "GET",
            "POST" => "POST",
            "PUT" => "PUT",
            "DELETE" => "DELETE",
            "PATCH" => "PATCH",
            _ => "UNKNOWN",
        };
        let status_class = match status {
            200..=299 => "2xx",
            400..=499 => "4xx",
            500..=599 => "5xx",
            _ => "other",
        };

        metrics::counter!("http_requests_total", "method" => method_name, "status" => status_class)
            .increment(1);
        metrics::histogram!("http_request_duration_seconds").record(elapsed.as_secs_f64());

        tracing::info!(
            status = status,
            elapsed_ms = elapsed.as_millis(),
            "Request completed"
        );

        if let Ok(value) = HeaderValue::from_str(&trace_id) {
            response.headers_mut().insert("x-trace-id", value);
        }
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response.headers_mut().insert("x-request-id", value);
        }
        response
    }
    .instrument(span)
    .await
}

/// 从请求头中提取或生成 trace_id
fn extract_or_generate_trace_id(headers: &HeaderMap) -> String {
    headers
        .get("x-trace-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}
