//! Matrix repository (审批矩阵与超时升级规则)

use async_trait::async_trait;
use uuid::Uuid;

use super::{MatrixRepository, PgStore};
use crate::error::Result;
use crate::models::matrix::{ApprovalMatrix, EscalationRule, TransactionCategory};

#[async_trait]
impl MatrixRepository for PgStore {
    async fn insert_matrix(&self, matrix: &ApprovalMatrix) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO approval_matrices (
                id, tenant_id, name, category, min_amount, max_amount,
                priority, is_active, organization_scope, levels,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(matrix.id)
        .bind(matrix.tenant_id)
        .bind(&matrix.name)
        .bind(matrix.category)
        .bind(matrix.min_amount)
        .bind(matrix.max_amount)
        .bind(matrix.priority)
        .bind(matrix.is_active)
        .bind(matrix.organization_scope)
        .bind(&matrix.levels)
        .bind(matrix.created_at)
        .bind(matrix.updated_at)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn find_matrix(&self, id: Uuid) -> Result<Option<ApprovalMatrix>> {
        let matrix =
            sqlx::query_as::<_, ApprovalMatrix>("SELECT * FROM approval_matrices WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.db)
                .await?;

        Ok(matrix)
    }

    async fn list_matrices(
        &self,
        tenant_id: Uuid,
        category: Option<TransactionCategory>,
    ) -> Result<Vec<ApprovalMatrix>> {
        let matrices = sqlx::query_as::<_, ApprovalMatrix>(
            r#"
            SELECT * FROM approval_matrices
            WHERE tenant_id = $1 AND ($2::transaction_category IS NULL OR category = $2)
            ORDER BY priority DESC, created_at
            "#,
        )
        .bind(tenant_id)
        .bind(category)
        .fetch_all(&self.db)
        .await?;

        Ok(matrices)
    }

    async fn set_matrix_active(&self, id: Uuid, is_active: bool) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE approval_matrices SET is_active = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(is_active)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn upsert_escalation_rule(&self, rule: &EscalationRule) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO escalation_rules (tenant_id, category, action, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (tenant_id, category)
            DO UPDATE SET action = EXCLUDED.action, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(rule.tenant_id)
        .bind(rule.category)
        .bind(rule.action)
        .bind(rule.updated_at)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn find_escalation_rule(
        &self,
        tenant_id: Uuid,
        category: TransactionCategory,
    ) -> Result<Option<EscalationRule>> {
        let rule = sqlx::query_as::<_, EscalationRule>(
            "SELECT * FROM escalation_rules WHERE tenant_id = $1 AND category = $2",
        )
        .bind(tenant_id)
        .bind(category)
        .fetch_optional(&self.db)
        .await?;

        Ok(rule)
    }
}
