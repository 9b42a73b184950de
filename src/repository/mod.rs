//! Storage repository layer
//!
//! 每个聚合一个 trait；PostgreSQL 与内存两套实现。所有多行写入
//! （重组、级联、审批流提交）在实现内部作为单个事务/单次写锁完成，
//! 读者看不到部分应用的状态。

use async_trait::async_trait;
use secrecy::ExposeSecret;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::error::{AppError, Result};
use crate::models::{
    flow::{ApprovalFlow, ApprovalStep, FlowStatus},
    matrix::{ApprovalMatrix, EscalationRule, TransactionCategory},
    organization::{LevelChange, Organization},
    role::{Role, RoleAssignment, RoleHolder},
};

pub mod flow_repo;
pub mod matrix_repo;
pub mod memory;
pub mod organization_repo;
pub mod role_repo;

pub use memory::MemoryStore;

/// PostgreSQL 存储（四个仓储 trait 分别在 *_repo.rs 中实现）
#[derive(Clone, Debug)]
pub struct PgStore {
    db: sqlx::PgPool,
}

impl PgStore {
    /// 建立连接池并执行内置迁移
    ///
    /// 连接串无效或数据库不可达属于配置错误；迁移失败属于内部错误。
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let db = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .max_lifetime(Duration::from_secs(config.max_lifetime_secs))
            .test_before_acquire(true)
            .connect(config.url.expose_secret())
            .await
            .map_err(|e| AppError::Config(format!("cannot open approval store: {}", e)))?;
        tracing::info!(max_connections = config.max_connections, "Approval store pool ready");

        sqlx::migrate!("./migrations")
            .run(&db)
            .await
            .map_err(|e| AppError::Internal(format!("approval store migration failed: {}", e)))?;
        tracing::info!("Approval store schema up to date");

        Ok(Self { db })
    }

    /// 就绪检查用的往返查询
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.db).await?;
        Ok(())
    }
}

#[async_trait]
pub trait OrganizationRepository: Send + Sync {
    /// 插入组织及其继承得到的角色分配（同一事务）
    async fn insert_organization(
        &self,
        org: &Organization,
        assignments: &[RoleAssignment],
    ) -> Result<()>;

    async fn find_organization(&self, id: Uuid) -> Result<Option<Organization>>;

    async fn list_organizations(&self, tenant_id: Uuid) -> Result<Vec<Organization>>;

    /// 原子地应用重组：节点位置变更 + 角色分配修正
    async fn apply_reorganization(
        &self,
        changes: &[LevelChange],
        assignments: &[RoleAssignment],
    ) -> Result<()>;

    async fn set_organization_active(&self, id: Uuid, is_active: bool) -> Result<()>;
}

#[async_trait]
pub trait RoleRepository: Send + Sync {
    /// 同租户重名返回 Conflict
    async fn insert_role(&self, role: &Role) -> Result<()>;

    async fn find_role(&self, id: Uuid) -> Result<Option<Role>>;

    async fn find_role_by_name(&self, tenant_id: Uuid, name: &str) -> Result<Option<Role>>;

    async fn list_roles(&self, tenant_id: Uuid) -> Result<Vec<Role>>;

    /// 某角色在全部组织上的分配（含非活跃记录）
    async fn list_assignments_for_role(&self, role_id: Uuid) -> Result<Vec<RoleAssignment>>;

    async fn list_assignments_for_organization(
        &self,
        organization_id: Uuid,
    ) -> Result<Vec<RoleAssignment>>;

    /// 按 id upsert，整批原子写入
    async fn apply_assignment_changes(&self, changes: &[RoleAssignment]) -> Result<()>;

    async fn upsert_holder(&self, holder: &RoleHolder) -> Result<()>;

    /// 活跃持有人
    async fn list_holders(&self, organization_id: Uuid, role_id: Uuid) -> Result<Vec<RoleHolder>>;
}

#[async_trait]
pub trait MatrixRepository: Send + Sync {
    async fn insert_matrix(&self, matrix: &ApprovalMatrix) -> Result<()>;

    async fn find_matrix(&self, id: Uuid) -> Result<Option<ApprovalMatrix>>;

    async fn list_matrices(
        &self,
        tenant_id: Uuid,
        category: Option<TransactionCategory>,
    ) -> Result<Vec<ApprovalMatrix>>;

    async fn set_matrix_active(&self, id: Uuid, is_active: bool) -> Result<bool>;

    async fn upsert_escalation_rule(&self, rule: &EscalationRule) -> Result<()>;

    async fn find_escalation_rule(
        &self,
        tenant_id: Uuid,
        category: TransactionCategory,
    ) -> Result<Option<EscalationRule>>;
}

#[async_trait]
pub trait FlowRepository: Send + Sync {
    /// 同一交易已有审批流时返回 Conflict
    async fn insert_flow(&self, flow: &ApprovalFlow, steps: &[ApprovalStep]) -> Result<()>;

    async fn find_flow(&self, id: Uuid) -> Result<Option<ApprovalFlow>>;

    async fn find_flow_by_transaction(
        &self,
        tenant_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<Option<ApprovalFlow>>;

    async fn find_step(&self, id: Uuid) -> Result<Option<ApprovalStep>>;

    /// 按 (level_order, position, created_at) 排序
    async fn list_steps(&self, flow_id: Uuid) -> Result<Vec<ApprovalStep>>;

    async fn list_flows_by_status(&self, status: FlowStatus) -> Result<Vec<ApprovalFlow>>;

    /// 候选人包含该用户的 PENDING 步骤
    async fn list_pending_steps_for_user(&self, user_id: Uuid) -> Result<Vec<ApprovalStep>>;

    /// 以 expected_version 为条件提交流程及变更步骤；版本不符返回 false
    async fn commit_flow(
        &self,
        flow: &ApprovalFlow,
        expected_version: i64,
        steps: &[ApprovalStep],
    ) -> Result<bool>;
}

/// 审批引擎所需的全部存储能力
pub trait ApprovalStore:
    OrganizationRepository + RoleRepository + MatrixRepository + FlowRepository
{
}

impl<T> ApprovalStore for T where
    T: OrganizationRepository + RoleRepository + MatrixRepository + FlowRepository
{
}

/// 先写失效记录再写激活记录，避免触发 (organization_id, role_id) 活跃唯一约束
pub(crate) fn order_assignment_writes(changes: &[RoleAssignment]) -> Vec<&RoleAssignment> {
    let mut ordered: Vec<&RoleAssignment> = changes.iter().collect();
    ordered.sort_by_key(|a| a.is_active);
    ordered
}

/// 唯一约束冲突映射为 Conflict，其余按数据库错误处理
pub(crate) fn map_unique_violation(e: sqlx::Error, message: String) -> AppError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            AppError::Conflict(message)
        }
        _ => {
            tracing::error!(error = %e, "Database write failed");
            AppError::Database(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::Secret;

    fn database(url: &str) -> DatabaseConfig {
        DatabaseConfig {
            url: Secret::new(url.to_string()),
            max_connections: 1,
            min_connections: 0,
            acquire_timeout_secs: 1,
            idle_timeout_secs: 1,
            max_lifetime_secs: 1,
        }
    }

    #[tokio::test]
    async fn test_connect_with_malformed_url_is_config_error() {
        let err = PgStore::connect(&database("not a database url")).await.unwrap_err();
        assert!(matches!(err, AppError::Config(ref msg) if msg.starts_with("cannot open approval store")));
        assert_eq!(err.code(), 500);
    }

    #[test]
    fn test_assignment_writes_deactivate_first() {
        let now = chrono::Utc::now();
        let row = |is_active| RoleAssignment {
            is_active,
            ..RoleAssignment::direct(Uuid::new_v4(), Uuid::new_v4(), false, now)
        };
        let changes = vec![row(true), row(false), row(true)];
        let ordered = order_assignment_writes(&changes);
        assert!(!ordered[0].is_active);
        assert!(ordered[1..].iter().all(|a| a.is_active));
    }
}
