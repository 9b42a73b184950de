//! Organization repository (组织数据访问)

use async_trait::async_trait;
use sqlx::{Postgres, Transaction};
use tracing::error;
use uuid::Uuid;

use super::{map_unique_violation, order_assignment_writes, OrganizationRepository, PgStore};
use crate::error::{AppError, Result};
use crate::models::{
    organization::{LevelChange, Organization},
    role::RoleAssignment,
};

/// 在事务内按 id upsert 角色分配；失效记录先写
pub(super) async fn write_assignments(
    tx: &mut Transaction<'_, Postgres>,
    changes: &[RoleAssignment],
) -> Result<()> {
    for row in order_assignment_writes(changes) {
        sqlx::query(
            r#"
            INSERT INTO role_assignments (
                id, organization_id, role_id, is_inherited,
                inherited_from_organization_id, cascades, is_active,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO UPDATE SET
                cascades = EXCLUDED.cascades,
                is_active = EXCLUDED.is_active,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(row.id)
        .bind(row.organization_id)
        .bind(row.role_id)
        .bind(row.is_inherited)
        .bind(row.inherited_from_organization_id)
        .bind(row.cascades)
        .bind(row.is_active)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| {
            map_unique_violation(
                e,
                "an active assignment already exists for this organization and role".to_string(),
            )
        })?;
    }
    Ok(())
}

#[async_trait]
impl OrganizationRepository for PgStore {
    async fn insert_organization(
        &self,
        org: &Organization,
        assignments: &[RoleAssignment],
    ) -> Result<()> {
        let mut tx = self.db.begin().await.map_err(|e| {
            error!(error = %e, "Failed to begin transaction");
            AppError::database("Failed to begin transaction")
        })?;

        sqlx::query(
            r#"
            INSERT INTO organizations (
                id, tenant_id, code, name, level, parent_id,
                is_active, sort_order, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(org.id)
        .bind(org.tenant_id)
        .bind(&org.code)
        .bind(&org.name)
        .bind(org.level)
        .bind(org.parent_id)
        .bind(org.is_active)
        .bind(org.sort_order)
        .bind(org.created_at)
        .bind(org.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_unique_violation(e, format!("organization code {} already exists", org.code)))?;

        write_assignments(&mut tx, assignments).await?;

        tx.commit().await.map_err(|e| {
            error!(error = %e, "Failed to commit transaction");
            AppError::database("Failed to commit transaction")
        })?;

        Ok(())
    }

    async fn find_organization(&self, id: Uuid) -> Result<Option<Organization>> {
        let org = sqlx::query_as::<_, Organization>("SELECT * FROM organizations WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?;

        Ok(org)
    }

    async fn list_organizations(&self, tenant_id: Uuid) -> Result<Vec<Organization>> {
        let orgs = sqlx::query_as::<_, Organization>(
            "SELECT * FROM organizations WHERE tenant_id = $1 ORDER BY level, sort_order, code",
        )
        .bind(tenant_id)
        .fetch_all(&self.db)
        .await?;

        Ok(orgs)
    }

    async fn apply_reorganization(
        &self,
        changes: &[LevelChange],
        assignments: &[RoleAssignment],
    ) -> Result<()> {
        let mut tx = self.db.begin().await.map_err(|e| {
            error!(error = %e, "Failed to begin transaction");
            AppError::database("Failed to begin transaction")
        })?;

        for change in changes {
            let result = sqlx::query(
                "UPDATE organizations SET parent_id = $2, level = $3, updated_at = NOW() WHERE id = $1",
            )
            .bind(change.organization_id)
            .bind(change.parent_id)
            .bind(change.level)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                error!(error = %e, organization_id = %change.organization_id, "Failed to move organization");
                AppError::database("Failed to move organization")
            })?;

            if result.rows_affected() == 0 {
                return Err(AppError::NotFound(format!("organization {}", change.organization_id)));
            }
        }

        write_assignments(&mut tx, assignments).await?;

        tx.commit().await.map_err(|e| {
            error!(error = %e, "Failed to commit transaction");
            AppError::database("Failed to commit transaction")
        })?;

        Ok(())
    }

    async fn set_organization_active(&self, id: Uuid, is_active: bool) -> Result<()> {
        let result = sqlx::query(
            "UPDATE organizations SET is_active = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(is_active)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::not_found("Organization not found"));
        }

        Ok(())
    }
}
