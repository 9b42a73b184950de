//! Role inheritance service
//!
//! 继承是声明式的：组织 X 上角色 R 的继承来源，是最近的、持有
//! R 的活跃级联直接分配的严格祖先；X 自己有直接分配时不继承。
//! 所有写操作先在内存中算出完整的行变更集，再由存储层原子写入。
//! 旧行只做失效，不删除，保留分配历史。

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

use crate::error::{AppError, Result};
use crate::models::role::*;
use crate::repository::ApprovalStore;
use crate::services::{clock::Clock, load_tree, org_tree::OrgTree, AdminLock};
use crate::telemetry::metric_names;

/// 单个角色的分配行工作集
///
/// 持有该角色在租户内的全部分配行，记录被修改过的行；
/// `into_changes` 的结果可直接交给存储层 upsert。
#[derive(Debug, Clone)]
pub struct AssignmentPlan {
    role_id: Uuid,
    rows: HashMap<Uuid, RoleAssignment>,
    changed: Vec<Uuid>,
}

impl AssignmentPlan {
    pub fn new(role_id: Uuid, rows: Vec<RoleAssignment>) -> Self {
        Self {
            role_id,
            rows: rows.into_iter().filter(|r| r.role_id == role_id).map(|r| (r.id, r)).collect(),
            changed: Vec::new(),
        }
    }

    fn write(&mut self, row: RoleAssignment) {
        if !self.changed.contains(&row.id) {
            self.changed.push(row.id);
        }
        self.rows.insert(row.id, row);
    }

    /// 组织上的活跃分配（直接分配优先）
    pub fn active_at(&self, organization_id: Uuid) -> Option<&RoleAssignment> {
        let mut active = self
            .rows
            .values()
            .filter(|r| r.is_active && r.organization_id == organization_id);
        let first = active.next()?;
        if first.is_inherited {
            Some(active.find(|r| !r.is_inherited).unwrap_or(first))
        } else {
            Some(first)
        }
    }

    fn latest_inactive(
        &self,
        organization_id: Uuid,
        matches: impl Fn(&RoleAssignment) -> bool,
    ) -> Option<RoleAssignment> {
        self.rows
            .values()
            .filter(|r| !r.is_active && r.organization_id == organization_id && matches(r))
            .max_by_key(|r| (r.updated_at, r.id))
            .cloned()
    }

    /// 最近的级联直接分配所在祖先
    pub fn cascading_source(&self, tree: &OrgTree, organization_id: Uuid) -> Option<Uuid> {
        tree.ancestors(organization_id)
            .into_iter()
            .find(|a| self.active_at(*a).is_some_and(RoleAssignment::is_cascading_direct))
    }

    /// 在组织上建立（或重新激活）直接分配
    ///
    /// 已有活跃直接分配时只允许把 `cascades` 从 false 升级为 true。
    pub fn assign_direct(&mut self, organization_id: Uuid, cascade: bool, now: DateTime<Utc>) {
        if let Some(current) = self.active_at(organization_id).cloned() {
            if !current.is_inherited {
                if cascade && !current.cascades {
                    let mut upgraded = current;
                    upgraded.cascades = true;
                    upgraded.updated_at = now;
                    self.write(upgraded);
                }
                return;
            }

            // 直接分配覆盖继承分配
            let mut overridden = current;
            overridden.is_active = false;
            overridden.updated_at = now;
            self.write(overridden);
        }

        let row = match self.latest_inactive(organization_id, |r| !r.is_inherited) {
            Some(mut previous) => {
                previous.is_active = true;
                previous.cascades = cascade;
                previous.updated_at = now;
                previous
            }
            None => RoleAssignment::direct(organization_id, self.role_id, cascade, now),
        };
        self.write(row);
    }

    /// 撤销组织上的直接分配
    pub fn unassign_direct(&mut self, organization_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        let mut current = self
            .active_at(organization_id)
            .filter(|r| !r.is_inherited)
            .cloned()
            .ok_or_else(|| AppError::not_found("Direct role assignment not found"))?;

        current.is_active = false;
        current.updated_at = now;
        self.write(current);
        Ok(())
    }

    /// 失效所有来源为 `source` 的继承分配，返回失效行数
    pub fn remove_inherited_from(&mut self, source: Uuid, now: DateTime<Utc>) -> usize {
        let stale: Vec<RoleAssignment> = self
            .rows
            .values()
            .filter(|r| r.is_active && r.is_inherited && r.inherited_from_organization_id == Some(source))
            .cloned()
            .collect();

        let count = stale.len();
        for mut row in stale {
            row.is_active = false;
            row.updated_at = now;
            self.write(row);
        }
        count
    }

    /// 把 `scope` 内每个组织的继承分配修正为期望状态；直接分配不受影响
    pub fn reconcile(&mut self, tree: &OrgTree, scope: &[Uuid], now: DateTime<Utc>) {
        for &organization_id in scope {
            let current = self.active_at(organization_id).cloned();
            if current.as_ref().is_some_and(|r| !r.is_inherited) {
                continue;
            }

            let desired = self.cascading_source(tree, organization_id);
            let current_source = current.as_ref().and_then(|r| r.inherited_from_organization_id);
            if desired == current_source {
                continue;
            }

            if let Some(mut stale) = current {
                stale.is_active = false;
                stale.updated_at = now;
                self.write(stale);
            }

            if let Some(source) = desired {
                let row = match self.latest_inactive(organization_id, |r| {
                    r.is_inherited && r.inherited_from_organization_id == Some(source)
                }) {
                    Some(mut previous) => {
                        previous.is_active = true;
                        previous.updated_at = now;
                        previous
                    }
                    None => RoleAssignment::inherited(organization_id, self.role_id, source, now),
                };
                self.write(row);
            }
        }
    }

    pub fn into_changes(self) -> Vec<RoleAssignment> {
        let Self { mut rows, changed, .. } = self;
        changed.into_iter().filter_map(|id| rows.remove(&id)).collect()
    }
}

/// 为租户所有角色计算 `scope` 内的继承修正（新建组织、重组时使用）
pub(crate) async fn plan_tenant_reconcile(
    store: &dyn ApprovalStore,
    tenant_id: Uuid,
    tree: &OrgTree,
    scope: &[Uuid],
    now: DateTime<Utc>,
) -> Result<Vec<RoleAssignment>> {
    let mut changes = Vec::new();
    for role in store.list_roles(tenant_id).await? {
        let mut plan = AssignmentPlan::new(role.id, store.list_assignments_for_role(role.id).await?);
        plan.reconcile(tree, scope, now);
        changes.extend(plan.into_changes());
    }
    Ok(changes)
}

/// 角色服务
pub struct RoleService {
    store: Arc<dyn ApprovalStore>,
    admin_lock: AdminLock,
    clock: Arc<dyn Clock>,
}

impl RoleService {
    pub fn new(store: Arc<dyn ApprovalStore>, admin_lock: AdminLock, clock: Arc<dyn Clock>) -> Self {
        Self { store, admin_lock, clock }
    }

    // ==================== Roles ====================

    #[instrument(skip(self, request), fields(tenant_id = %request.tenant_id, name = %request.name))]
    pub async fn create_role(&self, request: CreateRoleRequest) -> Result<Role> {
        request.validate()?;

        let role = Role {
            id: Uuid::new_v4(),
            tenant_id: request.tenant_id,
            name: request.name.trim().to_string(),
            rank: request.rank,
            is_leadership: request.is_leadership,
            created_at: self.clock.now(),
        };
        if role.name.is_empty() {
            return Err(AppError::validation("Role name must not be blank"));
        }

        self.store.insert_role(&role).await?;
        info!(role_id = %role.id, "Role created");
        Ok(role)
    }

    pub async fn list_roles(&self, tenant_id: Uuid) -> Result<Vec<Role>> {
        self.store.list_roles(tenant_id).await
    }

    async fn require_role(&self, role_id: Uuid) -> Result<Role> {
        self.store
            .find_role(role_id)
            .await?
            .ok_or_else(|| AppError::not_found("Role not found"))
    }

    // ==================== Assignments ====================

    /// 直接分配角色；`cascade` 为 true 时向整个子树级联
    #[instrument(skip(self))]
    pub async fn assign_role(
        &self,
        organization_id: Uuid,
        role_id: Uuid,
        cascade: bool,
    ) -> Result<AssignmentOutcome> {
        let _guard = self.admin_lock.lock().await;

        let role = self.require_role(role_id).await?;
        let org = self
            .store
            .find_organization(organization_id)
            .await?
            .ok_or_else(|| AppError::not_found("Organization not found"))?;
        if org.tenant_id != role.tenant_id {
            return Err(AppError::validation("Role and organization belong to different tenants"));
        }
        if !org.is_active {
            return Err(AppError::validation("Cannot assign roles to an inactive organization"));
        }

        let tree = load_tree(self.store.as_ref(), org.tenant_id).await?;
        let now = self.clock.now();

        let mut plan = AssignmentPlan::new(role_id, self.store.list_assignments_for_role(role_id).await?);
        plan.assign_direct(organization_id, cascade, now);
        plan.reconcile(&tree, &tree.descendants(organization_id), now);

        let changes = plan.into_changes();
        self.store.apply_assignment_changes(&changes).await?;

        let outcome = AssignmentOutcome::from_changes(organization_id, role_id, &changes);
        metrics::counter!(metric_names::CASCADE_WRITES).increment(changes.len() as u64);
        info!(
            role = %role.name,
            rows_written = outcome.rows_written,
            inherited_activated = outcome.inherited_activated,
            "Role assigned"
        );
        Ok(outcome)
    }

    /// 撤销直接分配；`remove_inherited` 为 true 时同时撤销由此级联出的继承分配，
    /// 并从下一个仍然级联的祖先重新级联
    #[instrument(skip(self))]
    pub async fn unassign_role(
        &self,
        organization_id: Uuid,
        role_id: Uuid,
        remove_inherited: bool,
    ) -> Result<AssignmentOutcome> {
        let _guard = self.admin_lock.lock().await;

        let org = self
            .store
            .find_organization(organization_id)
            .await?
            .ok_or_else(|| AppError::not_found("Organization not found"))?;

        let tree = load_tree(self.store.as_ref(), org.tenant_id).await?;
        let now = self.clock.now();

        let mut plan = AssignmentPlan::new(role_id, self.store.list_assignments_for_role(role_id).await?);
        plan.unassign_direct(organization_id, now)?;

        let mut scope = vec![organization_id];
        if remove_inherited {
            plan.remove_inherited_from(organization_id, now);
            scope.extend(tree.descendants(organization_id));
        }
        plan.reconcile(&tree, &scope, now);

        let changes = plan.into_changes();
        self.store.apply_assignment_changes(&changes).await?;

        let outcome = AssignmentOutcome::from_changes(organization_id, role_id, &changes);
        metrics::counter!(metric_names::CASCADE_WRITES).increment(changes.len() as u64);
        info!(
            rows_written = outcome.rows_written,
            inherited_deactivated = outcome.inherited_deactivated,
            "Role unassigned"
        );
        Ok(outcome)
    }

    /// 组织上的有效角色（直接 + 继承，带来源）
    #[instrument(skip(self))]
    pub async fn get_effective_roles(&self, organization_id: Uuid) -> Result<Vec<EffectiveRole>> {
        if self.store.find_organization(organization_id).await?.is_none() {
            return Err(AppError::not_found("Organization not found"));
        }

        let rows = self.store.list_assignments_for_organization(organization_id).await?;
        let mut roles = Vec::new();
        for row in rows.into_iter().filter(|r| r.is_active) {
            let Some(role) = self.store.find_role(row.role_id).await? else {
                continue;
            };
            roles.push(EffectiveRole {
                role_id: role.id,
                role_name: role.name,
                rank: role.rank,
                is_leadership: role.is_leadership,
                is_inherited: row.is_inherited,
                inherited_from_organization_id: row.inherited_from_organization_id,
                cascades: row.cascades,
                holder_user_ids: self.slot_holders(&row).await?,
            });
        }

        roles.sort_by(|a, b| b.rank.cmp(&a.rank).then(a.role_name.cmp(&b.role_name)));
        Ok(roles)
    }

    /// UI 使用的可用角色列表
    pub async fn get_available_roles(&self, organization_id: Uuid) -> Result<Vec<EffectiveRole>> {
        self.get_effective_roles(organization_id).await
    }

    // ==================== Holders ====================

    async fn slot_holders(&self, slot: &RoleAssignment) -> Result<Vec<Uuid>> {
        let mut users: Vec<Uuid> = self
            .store
            .list_holders(slot.organization_id, slot.role_id)
            .await?
            .into_iter()
            .map(|h| h.user_id)
            .collect();

        if let Some(source) = slot.inherited_from_organization_id {
            users.extend(
                self.store
                    .list_holders(source, slot.role_id)
                    .await?
                    .into_iter()
                    .map(|h| h.user_id),
            );
        }

        users.sort();
        users.dedup();
        Ok(users)
    }

    async fn active_slot(&self, organization_id: Uuid, role_id: Uuid) -> Result<Option<RoleAssignment>> {
        Ok(self
            .store
            .list_assignments_for_organization(organization_id)
            .await?
            .into_iter()
            .find(|r| r.is_active && r.role_id == role_id))
    }

    /// 组织上可以以该角色审批的用户
    pub async fn eligible_approvers(&self, organization_id: Uuid, role_id: Uuid) -> Result<Vec<Uuid>> {
        match self.active_slot(organization_id, role_id).await? {
            Some(slot) => self.slot_holders(&slot).await,
            None => Ok(Vec::new()),
        }
    }

    /// 按角色名解析审批人；角色不存在时视为无人可审批
    pub async fn eligible_approvers_by_name(
        &self,
        tenant_id: Uuid,
        organization_id: Uuid,
        role_name: &str,
    ) -> Result<Vec<Uuid>> {
        match self.store.find_role_by_name(tenant_id, role_name).await? {
            Some(role) => self.eligible_approvers(organization_id, role.id).await,
            None => Ok(Vec::new()),
        }
    }

    #[instrument(skip(self))]
    pub async fn appoint_holder(
        &self,
        organization_id: Uuid,
        role_id: Uuid,
        user_id: Uuid,
    ) -> Result<RoleHolder> {
        if self.active_slot(organization_id, role_id).await?.is_none() {
            return Err(AppError::validation(
                "Role is not assigned (directly or by inheritance) at this organization",
            ));
        }

        let holder = RoleHolder {
            id: Uuid::new_v4(),
            organization_id,
            role_id,
            user_id,
            is_active: true,
            created_at: self.clock.now(),
        };
        self.store.upsert_holder(&holder).await?;
        info!("Role holder appointed");
        Ok(holder)
    }

    #[instrument(skip(self))]
    pub async fn remove_holder(&self, organization_id: Uuid, role_id: Uuid, user_id: Uuid) -> Result<()> {
        let mut holder = self
            .store
            .list_holders(organization_id, role_id)
            .await?
            .into_iter()
            .find(|h| h.user_id == user_id)
            .ok_or_else(|| AppError::not_found("Role holder not found"))?;

        holder.is_active = false;
        self.store.upsert_holder(&holder).await?;
        info!("Role holder removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::org_tree::tests::org;

    struct Fixture {
        tree: OrgTree,
        root: Uuid,
        mid: Vec<Uuid>,
        leaves: Vec<Uuid>,
    }

    /// 1 -> 3 -> 9
    fn fixture() -> Fixture {
        let tenant = Uuid::new_v4();
        let root = org(tenant, "ROOT", 1, None);
        let mut orgs = vec![root.clone()];
        let mut mid = Vec::new();
        let mut leaves = Vec::new();
        for i in 0..3 {
            let m = org(tenant, &format!("M{}", i), 2, Some(root.id));
            for j in 0..3 {
                let leaf = org(tenant, &format!("L{}{}", i, j), 3, Some(m.id));
                leaves.push(leaf.id);
                orgs.push(leaf);
            }
            mid.push(m.id);
            orgs.push(m);
        }
        Fixture { tree: OrgTree::build(orgs), root: root.id, mid, leaves }
    }

    fn apply(rows: &mut Vec<RoleAssignment>, changes: Vec<RoleAssignment>) {
        for change in changes {
            match rows.iter_mut().find(|r| r.id == change.id) {
                Some(existing) => *existing = change,
                None => rows.push(change),
            }
        }
    }

    fn assign(rows: &mut Vec<RoleAssignment>, tree: &OrgTree, role: Uuid, at: Uuid, cascade: bool) {
        let now = Utc::now();
        let mut plan = AssignmentPlan::new(role, rows.clone());
        plan.assign_direct(at, cascade, now);
        plan.reconcile(tree, &tree.descendants(at), now);
        apply(rows, plan.into_changes());
    }

    fn active(rows: &[RoleAssignment]) -> Vec<&RoleAssignment> {
        rows.iter().filter(|r| r.is_active).collect()
    }

    #[test]
    fn test_cascade_from_root_covers_every_descendant() {
        let f = fixture();
        let role = Uuid::new_v4();
        let mut rows = Vec::new();
        assign(&mut rows, &f.tree, role, f.root, true);

        let active = active(&rows);
        assert_eq!(active.iter().filter(|r| !r.is_inherited).count(), 1);
        let inherited: Vec<_> = active.iter().filter(|r| r.is_inherited).collect();
        assert_eq!(inherited.len(), 12);
        assert!(inherited.iter().all(|r| r.inherited_from_organization_id == Some(f.root)));
    }

    #[test]
    fn test_direct_assignment_blocks_inheritance() {
        let f = fixture();
        let role = Uuid::new_v4();
        let mut rows = Vec::new();
        assign(&mut rows, &f.tree, role, f.leaves[0], false);
        assign(&mut rows, &f.tree, role, f.root, true);

        let at_leaf: Vec<_> = rows.iter().filter(|r| r.is_active && r.organization_id == f.leaves[0]).collect();
        assert_eq!(at_leaf.len(), 1);
        assert!(!at_leaf[0].is_inherited);
        assert_eq!(active(&rows).iter().filter(|r| r.is_inherited).count(), 11);
    }

    #[test]
    fn test_direct_assignment_replaces_inherited_slot() {
        let f = fixture();
        let role = Uuid::new_v4();
        let mut rows = Vec::new();
        assign(&mut rows, &f.tree, role, f.root, true);
        assign(&mut rows, &f.tree, role, f.mid[0], false);

        let at_mid: Vec<_> = rows.iter().filter(|r| r.organization_id == f.mid[0]).collect();
        assert_eq!(at_mid.len(), 2);
        assert_eq!(at_mid.iter().filter(|r| r.is_active).count(), 1);
        assert!(at_mid.iter().any(|r| r.is_active && !r.is_inherited));
    }

    #[test]
    fn test_nearest_cascading_ancestor_wins() {
        let f = fixture();
        let role = Uuid::new_v4();
        let mut rows = Vec::new();
        assign(&mut rows, &f.tree, role, f.root, true);
        assign(&mut rows, &f.tree, role, f.mid[1], true);

        for leaf in &f.leaves[3..6] {
            let slot = rows.iter().find(|r| r.is_active && r.organization_id == *leaf).unwrap();
            assert_eq!(slot.inherited_from_organization_id, Some(f.mid[1]));
        }
        let other = rows.iter().find(|r| r.is_active && r.organization_id == f.leaves[0]).unwrap();
        assert_eq!(other.inherited_from_organization_id, Some(f.root));
    }

    #[test]
    fn test_remove_inherited_recascades_from_next_ancestor() {
        let f = fixture();
        let role = Uuid::new_v4();
        let mut rows = Vec::new();
        assign(&mut rows, &f.tree, role, f.root, true);
        assign(&mut rows, &f.tree, role, f.mid[1], true);

        let now = Utc::now();
        let mut plan = AssignmentPlan::new(role, rows.clone());
        plan.unassign_direct(f.mid[1], now).unwrap();
        plan.remove_inherited_from(f.mid[1], now);
        let mut scope = vec![f.mid[1]];
        scope.extend(f.tree.descendants(f.mid[1]));
        plan.reconcile(&f.tree, &scope, now);
        apply(&mut rows, plan.into_changes());

        let active = active(&rows);
        assert!(active.iter().all(|r| r.inherited_from_organization_id != Some(f.mid[1])));
        assert_eq!(active.iter().filter(|r| r.is_inherited).count(), 12);
        assert_eq!(active.iter().filter(|r| !r.is_inherited).count(), 1);
    }

    #[test]
    fn test_unassign_without_direct_row_fails() {
        let f = fixture();
        let mut plan = AssignmentPlan::new(Uuid::new_v4(), Vec::new());
        assert!(matches!(plan.unassign_direct(f.root, Utc::now()), Err(AppError::NotFound(_))));
    }

    #[test]
    fn test_cascade_flag_is_sticky() {
        let f = fixture();
        let role = Uuid::new_v4();
        let mut rows = Vec::new();
        assign(&mut rows, &f.tree, role, f.root, true);
        assign(&mut rows, &f.tree, role, f.root, false);

        let direct = rows.iter().find(|r| r.is_active && !r.is_inherited).unwrap();
        assert!(direct.cascades);
        assert_eq!(active(&rows).len(), 13);
    }

    #[test]
    fn test_reconcile_after_move_drops_foreign_source() {
        let f = fixture();
        let role = Uuid::new_v4();
        let mut rows = Vec::new();
        assign(&mut rows, &f.tree, role, f.mid[0], true);

        // L00 从 M0 移到 M2 下
        let changes = f.tree.plan_move(f.leaves[0], Some(f.mid[2]), 3, 4).unwrap();
        let moved = f.tree.with_changes(&changes);
        let now = Utc::now();
        let mut plan = AssignmentPlan::new(role, rows.clone());
        plan.reconcile(&moved, &[f.leaves[0]], now);
        apply(&mut rows, plan.into_changes());

        assert!(rows.iter().all(|r| !(r.is_active && r.organization_id == f.leaves[0])));
    }

    #[test]
    fn test_at_most_one_active_row_per_slot() {
        let f = fixture();
        let role = Uuid::new_v4();
        let mut rows = Vec::new();
        assign(&mut rows, &f.tree, role, f.root, true);
        assign(&mut rows, &f.tree, role, f.mid[0], true);
        assign(&mut rows, &f.tree, role, f.leaves[4], false);
        assign(&mut rows, &f.tree, role, f.mid[0], true);

        let mut seen = std::collections::HashSet::new();
        for row in active(&rows) {
            assert!(seen.insert(row.organization_id), "duplicate active slot");
        }
    }
}
