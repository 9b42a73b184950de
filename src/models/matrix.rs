//! Approval matrix models
//! 审批矩阵：(类别, 金额区间) -> 有序审批层级

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use std::fmt;
use uuid::Uuid;
use validator::Validate;

/// 支出类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "transaction_category", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransactionCategory {
    Operational,
    Equipment,
    Construction,
    Event,
    Mission,
    Personnel,
    Other,
}

impl TransactionCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionCategory::Operational => "operational",
            TransactionCategory::Equipment => "equipment",
            TransactionCategory::Construction => "construction",
            TransactionCategory::Event => "event",
            TransactionCategory::Mission => "mission",
            TransactionCategory::Personnel => "personnel",
            TransactionCategory::Other => "other",
        }
    }
}

impl fmt::Display for TransactionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 审批层级的组织解析方式（相对于申请组织）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrganizationLevelMode {
    /// 申请组织本身
    Same,
    /// 申请组织的上级
    Parent,
    /// 申请组织所在树的根
    Root,
}

/// 审批矩阵层级
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalMatrixLevel {
    pub level_order: i32,
    pub required_roles: Vec<String>,
    pub organization_level_mode: OrganizationLevelMode,
    #[serde(default = "default_true")]
    pub is_required: bool,
    #[serde(default)]
    pub is_parallel: bool,
    pub timeout_hours: Option<i32>,
}

fn default_true() -> bool {
    true
}

/// 审批矩阵
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ApprovalMatrix {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub category: TransactionCategory,
    pub min_amount: Option<i64>, // 空表示 0
    pub max_amount: Option<i64>, // 空表示无上限
    pub priority: i32,           // 数字越大优先级越高
    pub is_active: bool,
    pub organization_scope: Option<Uuid>, // 仅对该子树生效
    pub levels: Json<Vec<ApprovalMatrixLevel>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApprovalMatrix {
    /// 金额是否落在 [min ?? 0, max ?? +inf] 闭区间内
    pub fn covers_amount(&self, amount: i64) -> bool {
        amount >= self.min_amount.unwrap_or(0) && amount <= self.max_amount.unwrap_or(i64::MAX)
    }

    /// 金额区间宽度，无界的一侧按极大值处理
    pub fn band_width(&self) -> i128 {
        self.max_amount.unwrap_or(i64::MAX) as i128 - self.min_amount.unwrap_or(0) as i128
    }

    /// 按 level_order 升序的层级
    pub fn ordered_levels(&self) -> Vec<ApprovalMatrixLevel> {
        let mut levels = self.levels.0.clone();
        levels.sort_by_key(|l| l.level_order);
        levels
    }
}

/// 超时处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "timeout_action", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    /// 升级到上一级组织
    Escalate,
    /// 整个流程驳回
    Reject,
}

/// 按类别配置的超时升级规则
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EscalationRule {
    pub tenant_id: Uuid,
    pub category: TransactionCategory,
    pub action: TimeoutAction,
    pub updated_at: DateTime<Utc>,
}

/// 创建审批矩阵请求
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateMatrixRequest {
    pub tenant_id: Uuid,
    #[validate(length(min = 1, max = 200))]
    pub name: String,
    pub category: TransactionCategory,
    pub min_amount: Option<i64>,
    pub max_amount: Option<i64>,
    #[serde(default)]
    pub priority: i32,
    pub organization_scope: Option<Uuid>,
    #[validate(length(min = 1))]
    pub levels: Vec<ApprovalMatrixLevel>,
}

/// 矩阵选择预览请求
#[derive(Debug, Clone, Deserialize)]
pub struct SelectMatrixRequest {
    pub organization_id: Uuid,
    pub amount: i64,
    pub category: TransactionCategory,
}

/// 升级规则请求
#[derive(Debug, Clone, Deserialize)]
pub struct UpsertEscalationRuleRequest {
    pub tenant_id: Uuid,
    pub category: TransactionCategory,
    pub action: TimeoutAction,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix(min: Option<i64>, max: Option<i64>) -> ApprovalMatrix {
        ApprovalMatrix {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            name: "m".to_string(),
            category: TransactionCategory::Equipment,
            min_amount: min,
            max_amount: max,
            priority: 0,
            is_active: true,
            organization_scope: None,
            levels: Json(vec![]),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_covers_amount_is_inclusive() {
        let m = matrix(Some(100_001), Some(500_000));
        assert!(m.covers_amount(100_001));
        assert!(m.covers_amount(500_000));
        assert!(!m.covers_amount(100_000));
        assert!(!m.covers_amount(500_001));
    }

    #[test]
    fn test_unbounded_band_is_widest() {
        let bounded = matrix(Some(0), Some(1_000));
        let open = matrix(Some(0), None);
        assert!(open.band_width() > bounded.band_width());
        assert!(matrix(None, None).covers_amount(i64::MAX));
    }

    #[test]
    fn test_level_defaults_from_json() {
        let level: ApprovalMatrixLevel = serde_json::from_value(serde_json::json!({
            "level_order": 1,
            "required_roles": ["Department Head"],
            "organization_level_mode": "same",
            "timeout_hours": null
        }))
        .unwrap();
        assert!(level.is_required);
        assert!(!level.is_parallel);
        assert_eq!(level.organization_level_mode, OrganizationLevelMode::Same);
    }
}
