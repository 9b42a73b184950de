//! Approval handlers
//! 审批流：创建、决策、取消、待办与实时事件

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::{
    error::{AppError, ErrorDetail, ErrorResponse, Result},
    middleware::AppState,
    models::flow::*,
};

/// 创建审批流
pub async fn create_flow(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateFlowRequest>,
) -> Result<impl IntoResponse> {
    let view = state.flow_service.create_flow(request).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

/// 获取审批流状态
pub async fn get_flow_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let view = state.flow_service.get_flow_status(id).await?;
    Ok(Json(view))
}

/// 取消审批流
pub async fn cancel_flow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let view = state.flow_service.cancel_flow(id).await?;
    Ok(Json(view))
}

/// 为未解析步骤重新解析审批人
pub async fn refresh_unresolved(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let view = state.flow_service.refresh_unresolved(id).await?;
    Ok(Json(view))
}

/// 决策冲突时的响应体：原样带回提交内容和步骤当前状态
#[derive(Serialize)]
pub struct DecisionConflict {
    pub error: ErrorDetail,
    pub submitted_action: DecisionAction,
    pub submitted_comments: Option<String>,
    pub current_step: Option<ApprovalStep>,
}

/// 提交审批决定
pub async fn process_decision(
    State(state): State<Arc<AppState>>,
    Path(step_id): Path<Uuid>,
    Json(request): Json<ProcessDecisionRequest>,
) -> Response {
    let action = request.action;
    let comments = request.comments.clone();

    match state.flow_service.process_decision(step_id, request).await {
        Ok(view) => Json(view).into_response(),
        Err(e) if e.is_conflict() || matches!(e, AppError::Timeout(_)) => {
            tracing::warn!(step_id = %step_id, error = %e, "Decision not applied");
            let current_step = state.flow_service.get_step(step_id).await.ok();
            let body = DecisionConflict {
                error: ErrorResponse::from_error(&e).error,
                submitted_action: action,
                submitted_comments: comments,
                current_step,
            };
            (e.status_code(), Json(body)).into_response()
        }
        Err(e) => e.into_response(),
    }
}

/// 用户的待办步骤
pub async fn get_pending_steps(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let steps = state.flow_service.get_pending_steps_for_user(user_id).await?;
    Ok(Json(steps))
}

/// 事件流过滤参数
#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub flow_id: Option<Uuid>,
}

/// 审批事件 SSE 流
pub async fn stream_approvals(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StreamQuery>,
) -> impl IntoResponse {
    let stream = state
        .event_bus
        .subscribe_to_approvals(query.flow_id)
        .into_sse_stream(Duration::from_secs(30));

    Sse::new(stream).keep_alive(KeepAlive::default())
}
