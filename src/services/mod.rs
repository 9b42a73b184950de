//! Business logic services layer
//! 组织树、角色继承、矩阵选择与审批流引擎

use std::sync::Arc;
use uuid::Uuid;

use crate::error::Result;
use crate::repository::ApprovalStore;

pub mod clock;
pub mod flow_service;
pub mod matrix_selector;
pub mod org_tree;
pub mod organization_service;
pub mod role_service;
pub mod step_machine;

pub use clock::{Clock, ManualClock, SystemClock};
pub use flow_service::FlowService;
pub use matrix_selector::MatrixService;
pub use org_tree::OrgTree;
pub use organization_service::OrganizationService;
pub use role_service::RoleService;

/// 管理类写操作（组织重组、角色分配）在进程内串行执行
pub type AdminLock = Arc<tokio::sync::Mutex<()>>;

/// 加载租户的组织树
pub(crate) async fn load_tree(store: &dyn ApprovalStore, tenant_id: Uuid) -> Result<OrgTree> {
    Ok(OrgTree::build(store.list_organizations(tenant_id).await?))
}
