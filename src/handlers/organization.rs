//! Organization handlers
//! 组织树管理：创建、查询、重组、停用

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    error::Result,
    handlers::TenantQuery,
    middleware::AppState,
    models::organization::*,
};

/// 创建组织
pub async fn create_organization(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateOrganizationRequest>,
) -> Result<impl IntoResponse> {
    let org = state.organization_service.create_organization(request).await?;
    Ok((StatusCode::CREATED, Json(org)))
}

/// 列出租户的全部组织
pub async fn list_organizations(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TenantQuery>,
) -> Result<impl IntoResponse> {
    let orgs = state.organization_service.list_organizations(query.tenant_id).await?;
    Ok(Json(orgs))
}

/// 获取组织详情
pub async fn get_organization(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let org = state.organization_service.get_organization(id).await?;
    Ok(Json(org))
}

/// 移动子树
pub async fn move_subtree(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<MoveSubtreeRequest>,
) -> Result<impl IntoResponse> {
    let result = state
        .organization_service
        .move_subtree(id, request.new_parent_id, request.new_level)
        .await?;
    Ok(Json(result))
}

/// 提升为根组织
pub async fn promote_to_root(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let result = state.organization_service.promote_to_root(id).await?;
    Ok(Json(result))
}

/// 停用组织
pub async fn deactivate_organization(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let org = state.organization_service.deactivate_organization(id).await?;
    Ok(Json(org))
}
