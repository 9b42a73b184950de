//! HTTP 处理器模块

use serde::Deserialize;
use uuid::Uuid;

pub mod approval;
pub mod health;
pub mod matrix;
pub mod organization;
pub mod role;

/// 按租户列表查询参数
#[derive(Debug, Deserialize)]
pub struct TenantQuery {
    pub tenant_id: Uuid,
}
