//! Organization service
//! 组织创建、重组（移动子树 / 提升为根）与停用

use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::error::{AppError, Result};
use crate::models::organization::*;
use crate::repository::ApprovalStore;
use crate::services::{
    clock::Clock, load_tree, role_service::plan_tenant_reconcile, AdminLock,
};
use crate::telemetry::metric_names;

/// 组织服务
pub struct OrganizationService {
    store: Arc<dyn ApprovalStore>,
    admin_lock: AdminLock,
    clock: Arc<dyn Clock>,
    max_level: i32,
}

impl OrganizationService {
    pub fn new(
        store: Arc<dyn ApprovalStore>,
        admin_lock: AdminLock,
        clock: Arc<dyn Clock>,
        max_level: i32,
    ) -> Self {
        Self { store, admin_lock, clock, max_level }
    }

    /// 创建组织，层级由上级推导；新节点立即继承祖先的级联角色
    #[instrument(skip(self, request), fields(tenant_id = %request.tenant_id, code = %request.code))]
    pub async fn create_organization(&self, request: CreateOrganizationRequest) -> Result<Organization> {
        request.validate()?;
        let _guard = self.admin_lock.lock().await;

        let tree = load_tree(self.store.as_ref(), request.tenant_id).await?;
        let level = match request.parent_id {
            Some(parent_id) => {
                let parent = tree.get(parent_id).ok_or_else(|| {
                    AppError::structural(format!("parent {} does not exist in this tenant", parent_id))
                })?;
                if !parent.is_active {
                    return Err(AppError::structural("parent organization is inactive"));
                }
                parent.level + 1
            }
            None => 1,
        };

        if level > self.max_level {
            return Err(AppError::structural(format!(
                "organization would be at level {} (maximum {})",
                level, self.max_level
            )));
        }

        let now = self.clock.now();
        let org = Organization {
            id: Uuid::new_v4(),
            tenant_id: request.tenant_id,
            code: request.code,
            name: request.name,
            level,
            parent_id: request.parent_id,
            is_active: true,
            sort_order: request.sort_order,
            created_at: now,
            updated_at: now,
        };

        let tree = tree.with_node(org.clone());
        let assignments =
            plan_tenant_reconcile(self.store.as_ref(), org.tenant_id, &tree, &[org.id], now).await?;

        self.store.insert_organization(&org, &assignments).await?;

        info!(organization_id = %org.id, level, inherited = assignments.len(), "Organization created");
        Ok(org)
    }

    pub async fn get_organization(&self, id: Uuid) -> Result<Organization> {
        self.store
            .find_organization(id)
            .await?
            .ok_or_else(|| AppError::not_found("Organization not found"))
    }

    pub async fn list_organizations(&self, tenant_id: Uuid) -> Result<Vec<Organization>> {
        self.store.list_organizations(tenant_id).await
    }

    /// 移动子树：节点及全部后代按同一差值重新分级，并修正继承角色
    ///
    /// 先在内存中算出全部变更并校验，任何一个后代越界都整体拒绝。
    #[instrument(skip(self))]
    pub async fn move_subtree(
        &self,
        node_id: Uuid,
        new_parent_id: Option<Uuid>,
        new_level: i32,
    ) -> Result<ReorganizationResult> {
        let _guard = self.admin_lock.lock().await;

        let node = self.get_organization(node_id).await?;
        let tree = load_tree(self.store.as_ref(), node.tenant_id).await?;

        let changes = tree.plan_move(node_id, new_parent_id, new_level, self.max_level).map_err(|e| {
            warn!(error = %e, "Reorganization rejected");
            e
        })?;

        if changes.is_empty() {
            return Ok(ReorganizationResult { moved: changes, assignments_changed: 0 });
        }

        let moved_tree = tree.with_changes(&changes);
        let scope: Vec<Uuid> = changes.iter().map(|c| c.organization_id).collect();
        let now = self.clock.now();
        let assignments =
            plan_tenant_reconcile(self.store.as_ref(), node.tenant_id, &moved_tree, &scope, now)
                .await?;

        self.store.apply_reorganization(&changes, &assignments).await?;

        metrics::counter!(metric_names::CASCADE_WRITES).increment(assignments.len() as u64);
        info!(
            moved = changes.len(),
            assignments_changed = assignments.len(),
            "Subtree moved"
        );
        Ok(ReorganizationResult { moved: changes, assignments_changed: assignments.len() })
    }

    /// 提升为根：没有上级，层级为 1
    pub async fn promote_to_root(&self, node_id: Uuid) -> Result<ReorganizationResult> {
        self.move_subtree(node_id, None, 1).await
    }

    /// 软停用；仍有活跃下级时拒绝
    #[instrument(skip(self))]
    pub async fn deactivate_organization(&self, id: Uuid) -> Result<Organization> {
        let _guard = self.admin_lock.lock().await;

        let org = self.get_organization(id).await?;
        let tree = load_tree(self.store.as_ref(), org.tenant_id).await?;
        let active_children = tree
            .children(id)
            .iter()
            .filter(|c| tree.get(**c).is_some_and(|o| o.is_active))
            .count();
        if active_children > 0 {
            return Err(AppError::structural(format!(
                "organization {} still has {} active child organization(s)",
                org.code, active_children
            )));
        }

        self.store.set_organization_active(id, false).await?;
        info!(organization_id = %id, "Organization deactivated");
        self.get_organization(id).await
    }
}
