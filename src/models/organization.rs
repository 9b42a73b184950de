//! Organization tree models
//! 组织树：每个租户一棵单根树，层级从 1 开始

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// 组织编码格式（大写字母、数字、下划线、短横线）
pub static ORGANIZATION_CODE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z0-9][A-Z0-9_-]{0,63}$").expect("valid organization code regex"));

/// 组织节点
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Organization {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub code: String,
    pub name: String,
    pub level: i32,                // 层级（根为 1）
    pub parent_id: Option<Uuid>,   // 仅根节点为空
    pub is_active: bool,
    pub sort_order: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Organization {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// 重组时单个节点的新位置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LevelChange {
    pub organization_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub level: i32,
}

/// 创建组织请求
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateOrganizationRequest {
    pub tenant_id: Uuid,
    #[validate(regex(path = *ORGANIZATION_CODE_RE))]
    pub code: String,
    #[validate(length(min = 1, max = 200))]
    pub name: String,
    pub parent_id: Option<Uuid>,
    #[serde(default)]
    pub sort_order: i32,
}

/// 移动子树请求
#[derive(Debug, Clone, Deserialize)]
pub struct MoveSubtreeRequest {
    pub new_parent_id: Option<Uuid>,
    pub new_level: i32,
}

/// 重组结果
#[derive(Debug, Clone, Serialize)]
pub struct ReorganizationResult {
    pub moved: Vec<LevelChange>,
    pub assignments_changed: usize,
}
