//! Matrix handlers
//! 审批矩阵与超时升级规则

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    error::Result,
    middleware::AppState,
    models::matrix::*,
};

/// 矩阵列表过滤条件
#[derive(Debug, Deserialize)]
pub struct MatrixListQuery {
    pub tenant_id: Uuid,
    pub category: Option<TransactionCategory>,
}

/// 创建审批矩阵
pub async fn create_matrix(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateMatrixRequest>,
) -> Result<impl IntoResponse> {
    let matrix = state.matrix_service.create_matrix(request).await?;
    Ok((StatusCode::CREATED, Json(matrix)))
}

/// 列出审批矩阵
pub async fn list_matrices(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MatrixListQuery>,
) -> Result<impl IntoResponse> {
    let matrices = state
        .matrix_service
        .list_matrices(query.tenant_id, query.category)
        .await?;
    Ok(Json(matrices))
}

/// 停用审批矩阵
pub async fn deactivate_matrix(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let matrix = state.matrix_service.deactivate_matrix(id).await?;
    Ok(Json(matrix))
}

/// 预览：给定金额、类别与组织会选中哪个矩阵
pub async fn preview_matrix(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SelectMatrixRequest>,
) -> Result<impl IntoResponse> {
    let matrix = state
        .matrix_service
        .select_matrix(request.organization_id, request.amount, request.category)
        .await?;
    Ok(Json(matrix))
}

/// 设置类别的超时升级规则
pub async fn upsert_escalation_rule(
    State(state): State<Arc<AppState>>,
    Json(request): Json<UpsertEscalationRuleRequest>,
) -> Result<impl IntoResponse> {
    let rule = state.matrix_service.upsert_escalation_rule(request).await?;
    Ok(Json(rule))
}
