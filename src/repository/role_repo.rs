//! Role repository (角色、角色分配与持有人数据访问)

use async_trait::async_trait;
use tracing::error;
use uuid::Uuid;

use super::{map_unique_violation, organization_repo::write_assignments, PgStore, RoleRepository};
use crate::error::{AppError, Result};
use crate::models::role::{Role, RoleAssignment, RoleHolder};

#[async_trait]
impl RoleRepository for PgStore {
    // ==================== Roles ====================

    async fn insert_role(&self, role: &Role) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO roles (id, tenant_id, name, rank, is_leadership, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(role.id)
        .bind(role.tenant_id)
        .bind(&role.name)
        .bind(role.rank)
        .bind(role.is_leadership)
        .bind(role.created_at)
        .execute(&self.db)
        .await
        .map_err(|e| map_unique_violation(e, format!("role {} already exists", role.name)))?;

        Ok(())
    }

    async fn find_role(&self, id: Uuid) -> Result<Option<Role>> {
        let role = sqlx::query_as::<_, Role>("SELECT * FROM roles WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?;

        Ok(role)
    }

    async fn find_role_by_name(&self, tenant_id: Uuid, name: &str) -> Result<Option<Role>> {
        let role =
            sqlx::query_as::<_, Role>("SELECT * FROM roles WHERE tenant_id = $1 AND name = $2")
                .bind(tenant_id)
                .bind(name)
                .fetch_optional(&self.db)
                .await?;

        Ok(role)
    }

    async fn list_roles(&self, tenant_id: Uuid) -> Result<Vec<Role>> {
        let roles = sqlx::query_as::<_, Role>(
            "SELECT * FROM roles WHERE tenant_id = $1 ORDER BY rank DESC, name",
        )
        .bind(tenant_id)
        .fetch_all(&self.db)
        .await?;

        Ok(roles)
    }

    // ==================== Assignments ====================

    async fn list_assignments_for_role(&self, role_id: Uuid) -> Result<Vec<RoleAssignment>> {
        let rows = sqlx::query_as::<_, RoleAssignment>(
            "SELECT * FROM role_assignments WHERE role_id = $1 ORDER BY created_at",
        )
        .bind(role_id)
        .fetch_all(&self.db)
        .await?;

        Ok(rows)
    }

    async fn list_assignments_for_organization(
        &self,
        organization_id: Uuid,
    ) -> Result<Vec<RoleAssignment>> {
        let rows = sqlx::query_as::<_, RoleAssignment>(
            "SELECT * FROM role_assignments WHERE organization_id = $1 ORDER BY created_at",
        )
        .bind(organization_id)
        .fetch_all(&self.db)
        .await?;

        Ok(rows)
    }

    async fn apply_assignment_changes(&self, changes: &[RoleAssignment]) -> Result<()> {
        let mut tx = self.db.begin().await.map_err(|e| {
            error!(error = %e, "Failed to begin transaction");
            AppError::database("Failed to begin transaction")
        })?;

        write_assignments(&mut tx, changes).await?;

        tx.commit().await.map_err(|e| {
            error!(error = %e, "Failed to commit transaction");
            AppError::database("Failed to commit transaction")
        })?;

        Ok(())
    }

    // ==================== Holders ====================

    async fn upsert_holder(&self, holder: &RoleHolder) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO role_holders (id, organization_id, role_id, user_id, is_active, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (organization_id, role_id, user_id)
            DO UPDATE SET is_active = EXCLUDED.is_active
            "#,
        )
        .bind(holder.id)
        .bind(holder.organization_id)
        .bind(holder.role_id)
        .bind(holder.user_id)
        .bind(holder.is_active)
        .bind(holder.created_at)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn list_holders(&self, organization_id: Uuid, role_id: Uuid) -> Result<Vec<RoleHolder>> {
        let holders = sqlx::query_as::<_, RoleHolder>(
            r#"
            SELECT * FROM role_holders
            WHERE organization_id = $1 AND role_id = $2 AND is_active
            ORDER BY created_at
            "#,
        )
        .bind(organization_id)
        .bind(role_id)
        .fetch_all(&self.db)
        .await?;

        Ok(holders)
    }
}
