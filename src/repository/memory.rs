//! In-memory storage backend
//!
//! 全部状态放在一把 RwLock 后面；每个写批次在一次写锁内完成，
//! 因而与 PostgreSQL 事务具有相同的原子可见性。

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    order_assignment_writes, FlowRepository, MatrixRepository, OrganizationRepository,
    RoleRepository,
};
use crate::error::{AppError, Result};
use crate::models::{
    flow::{ApprovalFlow, ApprovalStep, FlowStatus},
    matrix::{ApprovalMatrix, EscalationRule, TransactionCategory},
    organization::{LevelChange, Organization},
    role::{Role, RoleAssignment, RoleHolder},
};

#[derive(Default)]
struct MemoryState {
    organizations: HashMap<Uuid, Organization>,
    roles: HashMap<Uuid, Role>,
    assignments: HashMap<Uuid, RoleAssignment>,
    holders: HashMap<Uuid, RoleHolder>,
    matrices: HashMap<Uuid, ApprovalMatrix>,
    escalation_rules: HashMap<(Uuid, TransactionCategory), EscalationRule>,
    flows: HashMap<Uuid, ApprovalFlow>,
    steps: HashMap<Uuid, ApprovalStep>,
}

impl MemoryState {
    fn upsert_assignments(&mut self, changes: &[RoleAssignment]) -> Result<()> {
        for change in order_assignment_writes(changes) {
            if change.is_active {
                let duplicate = self.assignments.values().any(|a| {
                    a.is_active
                        && a.id != change.id
                        && a.organization_id == change.organization_id
                        && a.role_id == change.role_id
                });
                if duplicate {
                    return Err(AppError::conflict(
                        "an active assignment already exists for this organization and role",
                    ));
                }
            }
            self.assignments.insert(change.id, change.clone());
        }
        Ok(())
    }
}

/// 内存存储
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrganizationRepository for MemoryStore {
    async fn insert_organization(
        &self,
        org: &Organization,
        assignments: &[RoleAssignment],
    ) -> Result<()> {
        let mut state = self.state.write().await;
        if state
            .organizations
            .values()
            .any(|o| o.tenant_id == org.tenant_id && o.code == org.code)
        {
            return Err(AppError::Conflict(format!("organization code {} already exists", org.code)));
        }

        // 失败时回滚到快照，不留下部分写入
        let snapshot = state.assignments.clone();
        if let Err(e) = state.upsert_assignments(assignments) {
            state.assignments = snapshot;
            return Err(e);
        }

        state.organizations.insert(org.id, org.clone());
        Ok(())
    }

    async fn find_organization(&self, id: Uuid) -> Result<Option<Organization>> {
        Ok(self.state.read().await.organizations.get(&id).cloned())
    }

    async fn list_organizations(&self, tenant_id: Uuid) -> Result<Vec<Organization>> {
        let state = self.state.read().await;
        let mut orgs: Vec<Organization> = state
            .organizations
            .values()
            .filter(|o| o.tenant_id == tenant_id)
            .cloned()
            .collect();
        orgs.sort_by(|a, b| {
            a.level
                .cmp(&b.level)
                .then(a.sort_order.cmp(&b.sort_order))
                .then(a.code.cmp(&b.code))
        });
        Ok(orgs)
    }

    async fn apply_reorganization(
        &self,
        changes: &[LevelChange],
        assignments: &[RoleAssignment],
    ) -> Result<()> {
        let mut state = self.state.write().await;

        if let Some(missing) =
            changes.iter().find(|c| !state.organizations.contains_key(&c.organization_id))
        {
            return Err(AppError::NotFound(format!("organization {}", missing.organization_id)));
        }

        let snapshot = state.assignments.clone();
        if let Err(e) = state.upsert_assignments(assignments) {
            state.assignments = snapshot;
            return Err(e);
        }

        let now = chrono::Utc::now();
        for change in changes {
            if let Some(org) = state.organizations.get_mut(&change.organization_id) {
                org.parent_id = change.parent_id;
                org.level = change.level;
                org.updated_at = now;
            }
        }
        Ok(())
    }

    async fn set_organization_active(&self, id: Uuid, is_active: bool) -> Result<()> {
        let mut state = self.state.write().await;
        let org = state
            .organizations
            .get_mut(&id)
            .ok_or_else(|| AppError::not_found("Organization not found"))?;
        org.is_active = is_active;
        org.updated_at = chrono::Utc::now();
        Ok(())
    }
}

#[async_trait]
impl RoleRepository for MemoryStore {
    async fn insert_role(&self, role: &Role) -> Result<()> {
        let mut state = self.state.write().await;
        if state
            .roles
            .values()
            .any(|r| r.tenant_id == role.tenant_id && r.name == role.name)
        {
            return Err(AppError::Conflict(format!("role {} already exists", role.name)));
        }
        state.roles.insert(role.id, role.clone());
        Ok(())
    }

    async fn find_role(&self, id: Uuid) -> Result<Option<Role>> {
        Ok(self.state.read().await.roles.get(&id).cloned())
    }

    async fn find_role_by_name(&self, tenant_id: Uuid, name: &str) -> Result<Option<Role>> {
        Ok(self
            .state
            .read()
            .await
            .roles
            .values()
            .find(|r| r.tenant_id == tenant_id && r.name == name)
            .cloned())
    }

    async fn list_roles(&self, tenant_id: Uuid) -> Result<Vec<Role>> {
        let state = self.state.read().await;
        let mut roles: Vec<Role> =
            state.roles.values().filter(|r| r.tenant_id == tenant_id).cloned().collect();
        roles.sort_by(|a, b| b.rank.cmp(&a.rank).then(a.name.cmp(&b.name)));
        Ok(roles)
    }

    async fn list_assignments_for_role(&self, role_id: Uuid) -> Result<Vec<RoleAssignment>> {
        let state = self.state.read().await;
        let mut rows: Vec<RoleAssignment> =
            state.assignments.values().filter(|a| a.role_id == role_id).cloned().collect();
        rows.sort_by_key(|a| a.created_at);
        Ok(rows)
    }

    async fn list_assignments_for_organization(
        &self,
        organization_id: Uuid,
    ) -> Result<Vec<RoleAssignment>> {
        let state = self.state.read().await;
        let mut rows: Vec<RoleAssignment> = state
            .assignments
            .values()
            .filter(|a| a.organization_id == organization_id)
            .cloned()
            .collect();
        rows.sort_by_key(|a| a.created_at);
        Ok(rows)
    }

    async fn apply_assignment_changes(&self, changes: &[RoleAssignment]) -> Result<()> {
        let mut state = self.state.write().await;
        let snapshot = state.assignments.clone();
        if let Err(e) = state.upsert_assignments(changes) {
            state.assignments = snapshot;
            return Err(e);
        }
        Ok(())
    }

    async fn upsert_holder(&self, holder: &RoleHolder) -> Result<()> {
        let mut state = self.state.write().await;
        let existing = state
            .holders
            .values()
            .find(|h| {
                h.organization_id == holder.organization_id
                    && h.role_id == holder.role_id
                    && h.user_id == holder.user_id
            })
            .map(|h| h.id);

        match existing {
            Some(id) => {
                if let Some(row) = state.holders.get_mut(&id) {
                    row.is_active = holder.is_active;
                }
            }
            None => {
                state.holders.insert(holder.id, holder.clone());
            }
        }
        Ok(())
    }

    async fn list_holders(&self, organization_id: Uuid, role_id: Uuid) -> Result<Vec<RoleHolder>> {
        let state = self.state.read().await;
        let mut holders: Vec<RoleHolder> = state
            .holders
            .values()
            .filter(|h| h.is_active && h.organization_id == organization_id && h.role_id == role_id)
            .cloned()
            .collect();
        holders.sort_by_key(|h| h.created_at);
        Ok(holders)
    }
}

#[async_trait]
impl MatrixRepository for MemoryStore {
    async fn insert_matrix(&self, matrix: &ApprovalMatrix) -> Result<()> {
        self.state.write().await.matrices.insert(matrix.id, matrix.clone());
        Ok(())
    }

    async fn find_matrix(&self, id: Uuid) -> Result<Option<ApprovalMatrix>> {
        Ok(self.state.read().await.matrices.get(&id).cloned())
    }

    async fn list_matrices(
        &self,
        tenant_id: Uuid,
        category: Option<TransactionCategory>,
    ) -> Result<Vec<ApprovalMatrix>> {
        let state = self.state.read().await;
        let mut matrices: Vec<ApprovalMatrix> = state
            .matrices
            .values()
            .filter(|m| m.tenant_id == tenant_id && category.map_or(true, |c| m.category == c))
            .cloned()
            .collect();
        matrices.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));
        Ok(matrices)
    }

    async fn set_matrix_active(&self, id: Uuid, is_active: bool) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.matrices.get_mut(&id) {
            Some(matrix) => {
                matrix.is_active = is_active;
                matrix.updated_at = chrono::Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn upsert_escalation_rule(&self, rule: &EscalationRule) -> Result<()> {
        self.state
            .write()
            .await
            .escalation_rules
            .insert((rule.tenant_id, rule.category), rule.clone());
        Ok(())
    }

    async fn find_escalation_rule(
        &self,
        tenant_id: Uuid,
        category: TransactionCategory,
    ) -> Result<Option<EscalationRule>> {
        Ok(self.state.read().await.escalation_rules.get(&(tenant_id, category)).cloned())
    }
}

#[async_trait]
impl FlowRepository for MemoryStore {
    async fn insert_flow(&self, flow: &ApprovalFlow, steps: &[ApprovalStep]) -> Result<()> {
        let mut state = self.state.write().await;
        if state
            .flows
            .values()
            .any(|f| f.tenant_id == flow.tenant_id && f.transaction_id == flow.transaction_id)
        {
            return Err(AppError::Conflict(format!(
                "transaction {} already has an approval flow",
                flow.transaction_id
            )));
        }
        state.flows.insert(flow.id, flow.clone());
        for step in steps {
            state.steps.insert(step.id, step.clone());
        }
        Ok(())
    }

    async fn find_flow(&self, id: Uuid) -> Result<Option<ApprovalFlow>> {
        Ok(self.state.read().await.flows.get(&id).cloned())
    }

    async fn find_flow_by_transaction(
        &self,
        tenant_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<Option<ApprovalFlow>> {
        Ok(self
            .state
            .read()
            .await
            .flows
            .values()
            .find(|f| f.tenant_id == tenant_id && f.transaction_id == transaction_id)
            .cloned())
    }

    async fn find_step(&self, id: Uuid) -> Result<Option<ApprovalStep>> {
        Ok(self.state.read().await.steps.get(&id).cloned())
    }

    async fn list_steps(&self, flow_id: Uuid) -> Result<Vec<ApprovalStep>> {
        let state = self.state.read().await;
        let mut steps: Vec<ApprovalStep> =
            state.steps.values().filter(|s| s.flow_id == flow_id).cloned().collect();
        steps.sort_by(|a, b| {
            a.level_order
                .cmp(&b.level_order)
                .then(a.position.cmp(&b.position))
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(steps)
    }

    async fn list_flows_by_status(&self, status: FlowStatus) -> Result<Vec<ApprovalFlow>> {
        let state = self.state.read().await;
        let mut flows: Vec<ApprovalFlow> =
            state.flows.values().filter(|f| f.status == status).cloned().collect();
        flows.sort_by_key(|f| f.created_at);
        Ok(flows)
    }

    async fn list_pending_steps_for_user(&self, user_id: Uuid) -> Result<Vec<ApprovalStep>> {
        let state = self.state.read().await;
        let mut steps: Vec<ApprovalStep> = state
            .steps
            .values()
            .filter(|s| s.is_pending() && s.is_candidate(user_id))
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.created_at);
        Ok(steps)
    }

    async fn commit_flow(
        &self,
        flow: &ApprovalFlow,
        expected_version: i64,
        steps: &[ApprovalStep],
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        let current = state
            .flows
            .get(&flow.id)
            .ok_or_else(|| AppError::not_found("Approval flow not found"))?;

        if current.version != expected_version {
            return Ok(false);
        }

        state.flows.insert(flow.id, flow.clone());
        for step in steps {
            state.steps.insert(step.id, step.clone());
        }
        Ok(true)
    }
}
