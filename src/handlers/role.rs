//! Role handlers
//! 角色、角色分配（含级联）与角色持有人

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
    models::role::*,
};

/// 创建角色
pub async fn create_role(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateRoleRequest>,
) -> Result<impl IntoResponse> {
    let role = state.role_service.create_role(request).await?;
    Ok((StatusCode::CREATED, Json(role)))
}

/// 列出租户角色
pub async fn list_roles(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TenantQuery>,
) -> Result<impl IntoResponse> {
    let roles = state.role_service.list_roles(query.tenant_id).await?;
    Ok(Json(roles))
}

/// 组织上的可用角色（含继承来源）
pub async fn get_available_roles(
    State(state): State<Arc<AppState>>,
    Path(organization_id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let roles = state.role_service.get_available_roles(organization_id).await?;
    Ok(Json(roles))
}

/// 分配角色
pub async fn assign_role(
    State(state): State<Arc<AppState>>,
    Path(organization_id): Path<Uuid>,
    Json(request): Json<AssignRoleRequest>,
) -> Result<impl IntoResponse> {
    let outcome = state
        .role_service
        .assign_role(organization_id, request.role_id, request.cascade)
        .await?;
    Ok(Json(outcome))
}

/// 撤销角色分配
pub async fn unassign_role(
    State(state): State<Arc<AppState>>,
    Path((organization_id, role_id)): Path<(Uuid, Uuid)>,
    Query(params): Query<UnassignRoleParams>,
) -> Result<impl IntoResponse> {
    let outcome = state
        .role_service
        .unassign_role(organization_id, role_id, params.remove_inherited)
        .await?;
    Ok(Json(outcome))
}

/// 任命角色持有人
pub async fn appoint_holder(
    State(state): State<Arc<AppState>>,
    Path((organization_id, role_id)): Path<(Uuid, Uuid)>,
    Json(request): Json<AppointHolderRequest>,
) -> Result<impl IntoResponse> {
    let holder = state
        .role_service
        .appoint_holder(organization_id, role_id, request.user_id)
        .await?;
    Ok((StatusCode::CREATED, Json(holder)))
}

/// 移除角色持有人
pub async fn remove_holder(
    State(state): State<Arc<AppState>>,
    Path((organization_id, role_id, user_id)): Path<(Uuid, Uuid, Uuid)>,
) -> Result<impl IntoResponse> {
    state
        .role_service
        .remove_holder(organization_id, role_id, user_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
