//! 路由注册
//! 创建所有 API 路由并应用中间件

use axum::{
    middleware as axum_middleware,
    routing::{delete, get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer};

use crate::{handlers, middleware::AppState};

/// 请求体上限（矩阵定义是最大的请求体）
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// 创建应用路由
pub fn create_router(state: Arc<AppState>) -> Router {
    // 公开端点（健康检查）
    let public_routes = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/ready", get(handlers::health::readiness_check));

    let api_routes = Router::new()
        // 组织树
        .route(
            "/api/v1/organizations",
            get(handlers::organization::list_organizations)
                .post(handlers::organization::create_organization),
        )
        .route("/api/v1/organizations/{id}", get(handlers::organization::get_organization))
        .route("/api/v1/organizations/{id}/move", post(handlers::organization::move_subtree))
        .route("/api/v1/organizations/{id}/promote", post(handlers::organization::promote_to_root))
        .route(
            "/api/v1/organizations/{id}/deactivate",
            post(handlers::organization::deactivate_organization),
        )

        // 角色与分配
        .route(
            "/api/v1/roles",
            get(handlers::role::list_roles).post(handlers::role::create_role),
        )
        .route(
            "/api/v1/organizations/{id}/roles",
            get(handlers::role::get_available_roles).post(handlers::role::assign_role),
        )
        .route(
            "/api/v1/organizations/{id}/roles/{role_id}",
            delete(handlers::role::unassign_role),
        )
        .route(
            "/api/v1/organizations/{id}/roles/{role_id}/holders",
            post(handlers::role::appoint_holder),
        )
        .route(
            "/api/v1/organizations/{id}/roles/{role_id}/holders/{user_id}",
            delete(handlers::role::remove_holder),
        )

        // 审批矩阵
        .route(
            "/api/v1/matrices",
            get(handlers::matrix::list_matrices).post(handlers::matrix::create_matrix),
        )
        .route("/api/v1/matrices/select", post(handlers::matrix::preview_matrix))
        .route("/api/v1/matrices/{id}/deactivate", post(handlers::matrix::deactivate_matrix))
        .route("/api/v1/escalation-rules", put(handlers::matrix::upsert_escalation_rule))

        // 审批流
        .route("/api/v1/flows", post(handlers::approval::create_flow))
        .route("/api/v1/flows/{id}", get(handlers::approval::get_flow_status))
        .route("/api/v1/flows/{id}/cancel", post(handlers::approval::cancel_flow))
        .route("/api/v1/flows/{id}/refresh", post(handlers::approval::refresh_unresolved))
        .route("/api/v1/steps/{id}/decision", post(handlers::approval::process_decision))
        .route("/api/v1/users/{id}/pending-steps", get(handlers::approval::get_pending_steps))

        // 实时事件
        .route("/api/v1/stream/approvals", get(handlers::approval::stream_approvals));

    Router::new()
        .merge(public_routes)
        .merge(api_routes)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(CorsLayer::permissive())
        .layer(axum_middleware::from_fn(crate::middleware::request_tracking_middleware))
        .with_state(state)
}
