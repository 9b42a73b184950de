//! Approval matrix selection and administration
//!
//! 选择规则：活跃 + 类别匹配 + 作用域覆盖申请组织 + 金额落在闭区间内；
//! 优先级高者胜，其次区间更窄者胜，再按创建时间、id 定序，结果完全确定。

use sqlx::types::Json;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

use crate::error::{AppError, Result};
use crate::models::matrix::*;
use crate::repository::ApprovalStore;
use crate::services::{clock::Clock, load_tree, org_tree::OrgTree};

fn in_scope(matrix: &ApprovalMatrix, tree: &OrgTree, organization_id: Uuid) -> bool {
    match matrix.organization_scope {
        None => true,
        Some(scope) => scope == organization_id || tree.is_ancestor(scope, organization_id),
    }
}

fn precedence(a: &ApprovalMatrix, b: &ApprovalMatrix) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then(a.band_width().cmp(&b.band_width()))
        .then(a.created_at.cmp(&b.created_at))
        .then(a.id.cmp(&b.id))
}

/// 从候选矩阵中选出唯一适用的一个
pub fn select_matrix<'a>(
    matrices: &'a [ApprovalMatrix],
    tree: &OrgTree,
    organization_id: Uuid,
    amount: i64,
    category: TransactionCategory,
) -> Result<&'a ApprovalMatrix> {
    if amount < 0 {
        return Err(AppError::validation("Amount must not be negative"));
    }

    matrices
        .iter()
        .filter(|m| m.is_active && m.category == category)
        .filter(|m| m.covers_amount(amount))
        .filter(|m| in_scope(m, tree, organization_id))
        .min_by(|a, b| precedence(a, b))
        .ok_or_else(|| AppError::NoApplicableMatrix { category: category.to_string(), amount })
}

/// 审批矩阵服务
pub struct MatrixService {
    store: Arc<dyn ApprovalStore>,
    clock: Arc<dyn Clock>,
}

impl MatrixService {
    pub fn new(store: Arc<dyn ApprovalStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    #[instrument(skip(self, request), fields(tenant_id = %request.tenant_id, name = %request.name))]
    pub async fn create_matrix(&self, request: CreateMatrixRequest) -> Result<ApprovalMatrix> {
        request.validate()?;

        let min = request.min_amount.unwrap_or(0);
        if min < 0 {
            return Err(AppError::validation("min_amount must not be negative"));
        }
        if let Some(max) = request.max_amount {
            if max < min {
                return Err(AppError::validation("max_amount must not be below min_amount"));
            }
        }

        let mut orders = HashSet::new();
        for level in &request.levels {
            if !orders.insert(level.level_order) {
                return Err(AppError::Validation(format!(
                    "duplicate level_order {}",
                    level.level_order
                )));
            }
            if level.required_roles.is_empty() {
                return Err(AppError::Validation(format!(
                    "level {} names no required roles",
                    level.level_order
                )));
            }
            if level.timeout_hours.is_some_and(|h| h <= 0) {
                return Err(AppError::Validation(format!(
                    "level {} timeout_hours must be positive",
                    level.level_order
                )));
            }
            let mut names = HashSet::new();
            for role_name in &level.required_roles {
                if !names.insert(role_name.trim()) {
                    return Err(AppError::Validation(format!(
                        "level {} lists role {} more than once",
                        level.level_order,
                        role_name.trim()
                    )));
                }
                if self.store.find_role_by_name(request.tenant_id, role_name).await?.is_none() {
                    return Err(AppError::Validation(format!("unknown role {}", role_name)));
                }
            }
        }

        if let Some(scope) = request.organization_scope {
            match self.store.find_organization(scope).await? {
                Some(org) if org.tenant_id == request.tenant_id => {}
                _ => return Err(AppError::validation("organization_scope is not in this tenant")),
            }
        }

        let now = self.clock.now();
        let matrix = ApprovalMatrix {
            id: Uuid::new_v4(),
            tenant_id: request.tenant_id,
            name: request.name,
            category: request.category,
            min_amount: request.min_amount,
            max_amount: request.max_amount,
            priority: request.priority,
            is_active: true,
            organization_scope: request.organization_scope,
            levels: Json(request.levels),
            created_at: now,
            updated_at: now,
        };

        self.store.insert_matrix(&matrix).await?;
        info!(matrix_id = %matrix.id, "Approval matrix created");
        Ok(matrix)
    }

    pub async fn list_matrices(
        &self,
        tenant_id: Uuid,
        category: Option<TransactionCategory>,
    ) -> Result<Vec<ApprovalMatrix>> {
        self.store.list_matrices(tenant_id, category).await
    }

    #[instrument(skip(self))]
    pub async fn deactivate_matrix(&self, id: Uuid) -> Result<ApprovalMatrix> {
        if !self.store.set_matrix_active(id, false).await? {
            return Err(AppError::not_found("Approval matrix not found"));
        }
        info!(matrix_id = %id, "Approval matrix deactivated");
        self.store
            .find_matrix(id)
            .await?
            .ok_or_else(|| AppError::not_found("Approval matrix not found"))
    }

    /// 为 (金额, 类别, 组织) 选出适用矩阵
    #[instrument(skip(self))]
    pub async fn select_matrix(
        &self,
        organization_id: Uuid,
        amount: i64,
        category: TransactionCategory,
    ) -> Result<ApprovalMatrix> {
        let org = self
            .store
            .find_organization(organization_id)
            .await?
            .ok_or_else(|| AppError::not_found("Organization not found"))?;

        let tree = load_tree(self.store.as_ref(), org.tenant_id).await?;
        let matrices = self.store.list_matrices(org.tenant_id, Some(category)).await?;
        select_matrix(&matrices, &tree, organization_id, amount, category).cloned()
    }

    pub async fn upsert_escalation_rule(
        &self,
        request: UpsertEscalationRuleRequest,
    ) -> Result<EscalationRule> {
        let rule = EscalationRule {
            tenant_id: request.tenant_id,
            category: request.category,
            action: request.action,
            updated_at: self.clock.now(),
        };
        self.store.upsert_escalation_rule(&rule).await?;
        info!(category = %rule.category, action = ?rule.action, "Escalation rule updated");
        Ok(rule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::org_tree::tests::org;
    use chrono::{Duration, Utc};

    fn matrix(
        category: TransactionCategory,
        min: Option<i64>,
        max: Option<i64>,
        priority: i32,
    ) -> ApprovalMatrix {
        ApprovalMatrix {
            id: Uuid::new_v4(),
            tenant_id: Uuid::nil(),
            name: format!("{:?}-{}", min, priority),
            category,
            min_amount: min,
            max_amount: max,
            priority,
            is_active: true,
            organization_scope: None,
            levels: Json(vec![]),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn tree() -> (OrgTree, Uuid, Uuid, Uuid) {
        let tenant = Uuid::nil();
        let root = org(tenant, "ROOT", 1, None);
        let a = org(tenant, "A", 2, Some(root.id));
        let b = org(tenant, "B", 2, Some(root.id));
        let ids = (root.id, a.id, b.id);
        (OrgTree::build(vec![root, a, b]), ids.0, ids.1, ids.2)
    }

    #[test]
    fn test_selects_band_containing_amount() {
        let (tree, _, a, _) = tree();
        let low = matrix(TransactionCategory::Equipment, Some(0), Some(100_000), 50);
        let mid = matrix(TransactionCategory::Equipment, Some(100_001), Some(500_000), 70);
        let other = matrix(TransactionCategory::Event, None, None, 90);
        let matrices = vec![low, mid.clone(), other];

        let selected =
            select_matrix(&matrices, &tree, a, 300_000, TransactionCategory::Equipment).unwrap();
        assert_eq!(selected.id, mid.id);
    }

    #[test]
    fn test_priority_then_narrowest_band() {
        let (tree, _, a, _) = tree();
        let wide = matrix(TransactionCategory::Equipment, None, None, 70);
        let narrow = matrix(TransactionCategory::Equipment, Some(1_000), Some(2_000), 70);
        let low_priority = matrix(TransactionCategory::Equipment, Some(1_500), Some(1_600), 10);
        let matrices = vec![wide, narrow.clone(), low_priority];

        let selected =
            select_matrix(&matrices, &tree, a, 1_500, TransactionCategory::Equipment).unwrap();
        assert_eq!(selected.id, narrow.id);
    }

    #[test]
    fn test_full_tie_is_deterministic() {
        let (tree, _, a, _) = tree();
        let mut first = matrix(TransactionCategory::Other, Some(0), Some(10), 1);
        let mut second = first.clone();
        second.id = Uuid::new_v4();
        second.created_at = first.created_at + Duration::seconds(1);
        first.name = "first".to_string();

        let forward = vec![first.clone(), second.clone()];
        let backward = vec![second, first.clone()];
        assert_eq!(
            select_matrix(&forward, &tree, a, 5, TransactionCategory::Other).unwrap().id,
            first.id
        );
        assert_eq!(
            select_matrix(&backward, &tree, a, 5, TransactionCategory::Other).unwrap().id,
            first.id
        );
    }

    #[test]
    fn test_scope_restricts_to_subtree() {
        let (tree, root, a, b) = tree();
        let mut scoped = matrix(TransactionCategory::Mission, None, None, 99);
        scoped.organization_scope = Some(a);
        let fallback = matrix(TransactionCategory::Mission, None, None, 1);
        let matrices = vec![scoped.clone(), fallback.clone()];

        assert_eq!(
            select_matrix(&matrices, &tree, a, 10, TransactionCategory::Mission).unwrap().id,
            scoped.id
        );
        assert_eq!(
            select_matrix(&matrices, &tree, b, 10, TransactionCategory::Mission).unwrap().id,
            fallback.id
        );
        assert_eq!(
            select_matrix(&matrices, &tree, root, 10, TransactionCategory::Mission).unwrap().id,
            fallback.id
        );
    }

    #[test]
    fn test_no_match_is_hard_failure() {
        let (tree, _, a, _) = tree();
        let mut inactive = matrix(TransactionCategory::Personnel, None, None, 1);
        inactive.is_active = false;
        let matrices = vec![inactive, matrix(TransactionCategory::Personnel, Some(10), Some(20), 1)];

        let err = select_matrix(&matrices, &tree, a, 5, TransactionCategory::Personnel).unwrap_err();
        assert!(matches!(err, AppError::NoApplicableMatrix { amount: 5, .. }));
        assert!(matches!(
            select_matrix(&matrices, &tree, a, -1, TransactionCategory::Personnel),
            Err(AppError::Validation(_))
        ));
    }
}
