//! Role, role assignment and role holder models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// 组织角色（租户级别，不绑定具体组织）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Role {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub rank: i32, // 数值越大越资深
    pub is_leadership: bool,
    pub created_at: DateTime<Utc>,
}

/// 角色分配（组织 <-> 角色）
///
/// 同一 (organization_id, role_id) 最多一条 active 记录。直接分配
/// (`is_inherited = false`) 总是覆盖并阻断来自祖先的继承分配。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct RoleAssignment {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub role_id: Uuid,
    pub is_inherited: bool,
    pub inherited_from_organization_id: Option<Uuid>, // 当且仅当 is_inherited
    pub cascades: bool,                                // 直接分配是否向下级联
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RoleAssignment {
    pub fn direct(organization_id: Uuid, role_id: Uuid, cascades: bool, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            organization_id,
            role_id,
            is_inherited: false,
            inherited_from_organization_id: None,
            cascades,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn inherited(
        organization_id: Uuid,
        role_id: Uuid,
        source_organization_id: Uuid,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            organization_id,
            role_id,
            is_inherited: true,
            inherited_from_organization_id: Some(source_organization_id),
            cascades: false,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active_direct(&self) -> bool {
        self.is_active && !self.is_inherited
    }

    pub fn is_cascading_direct(&self) -> bool {
        self.is_active_direct() && self.cascades
    }
}

/// 角色持有人：某用户在某组织担任某角色
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct RoleHolder {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub role_id: Uuid,
    pub user_id: Uuid,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// 组织上的有效角色（含继承来源）
#[derive(Debug, Clone, Serialize)]
pub struct EffectiveRole {
    pub role_id: Uuid,
    pub role_name: String,
    pub rank: i32,
    pub is_leadership: bool,
    pub is_inherited: bool,
    pub inherited_from_organization_id: Option<Uuid>,
    pub cascades: bool,
    /// 可审批用户（本组织持有人 + 继承来源组织持有人）
    pub holder_user_ids: Vec<Uuid>,
}

/// 创建角色请求
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateRoleRequest {
    pub tenant_id: Uuid,
    #[validate(length(min = 1, max = 100))]
    pub name: String,
    #[serde(default)]
    pub rank: i32,
    #[serde(default)]
    pub is_leadership: bool,
}

/// 分配角色请求
#[derive(Debug, Clone, Deserialize)]
pub struct AssignRoleRequest {
    pub role_id: Uuid,
    #[serde(default)]
    pub cascade: bool,
}

/// 取消分配查询参数
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UnassignRoleParams {
    #[serde(default)]
    pub remove_inherited: bool,
}

/// 任命持有人请求
#[derive(Debug, Clone, Deserialize)]
pub struct AppointHolderRequest {
    pub user_id: Uuid,
}

/// 角色分配变更摘要
#[derive(Debug, Clone, Serialize)]
pub struct AssignmentOutcome {
    pub organization_id: Uuid,
    pub role_id: Uuid,
    pub rows_written: usize,
    pub inherited_activated: usize,
    pub inherited_deactivated: usize,
}

impl AssignmentOutcome {
    pub fn from_changes(organization_id: Uuid, role_id: Uuid, changes: &[RoleAssignment]) -> Self {
        Self {
            organization_id,
            role_id,
            rows_written: changes.len(),
            inherited_activated: changes.iter().filter(|a| a.is_inherited && a.is_active).count(),
            inherited_deactivated: changes
                .iter()
                .filter(|a| a.is_inherited && !a.is_active)
                .count(),
        }
    }
}
