//! Flow repository (审批流与审批步骤)
//!
//! 提交以 approval_flows.version 为乐观锁：UPDATE ... WHERE version = $n，
//! 受影响行数为 0 即表示并发决策已先行提交。

use async_trait::async_trait;
use sqlx::{Postgres, Transaction};
use tracing::error;
use uuid::Uuid;

use super::{map_unique_violation, FlowRepository, PgStore};
use crate::error::{AppError, Result};
use crate::models::flow::{ApprovalFlow, ApprovalStep, FlowStatus};

async fn upsert_step(tx: &mut Transaction<'_, Postgres>, step: &ApprovalStep) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO approval_steps (
            id, flow_id, level_order, position, resolved_organization_id,
            required_role_name, candidate_approver_ids, approver_user_id, status,
            is_required, is_parallel_group, is_unresolved, timeout_hours,
            activated_at, deadline, decided_at, comments,
            escalated_from_step_id, escalation_count, created_at
        ) VALUES (
            $1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
            $11, $12, $13, $14, $15, $16, $17, $18, $19, $20
        )
        ON CONFLICT (id) DO UPDATE SET
            candidate_approver_ids = EXCLUDED.candidate_approver_ids,
            approver_user_id = EXCLUDED.approver_user_id,
            status = EXCLUDED.status,
            is_unresolved = EXCLUDED.is_unresolved,
            activated_at = EXCLUDED.activated_at,
            deadline = EXCLUDED.deadline,
            decided_at = EXCLUDED.decided_at,
            comments = EXCLUDED.comments
        "#,
    )
    .bind(step.id)
    .bind(step.flow_id)
    .bind(step.level_order)
    .bind(step.position)
    .bind(step.resolved_organization_id)
    .bind(&step.required_role_name)
    .bind(&step.candidate_approver_ids)
    .bind(step.approver_user_id)
    .bind(step.status)
    .bind(step.is_required)
    .bind(step.is_parallel_group)
    .bind(step.is_unresolved)
    .bind(step.timeout_hours)
    .bind(step.activated_at)
    .bind(step.deadline)
    .bind(step.decided_at)
    .bind(&step.comments)
    .bind(step.escalated_from_step_id)
    .bind(step.escalation_count)
    .bind(step.created_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| {
        error!(error = %e, step_id = %step.id, "Failed to write approval step");
        AppError::database("Failed to write approval step")
    })?;

    Ok(())
}

#[async_trait]
impl FlowRepository for PgStore {
    async fn insert_flow(&self, flow: &ApprovalFlow, steps: &[ApprovalStep]) -> Result<()> {
        let mut tx = self.db.begin().await.map_err(|e| {
            error!(error = %e, "Failed to begin transaction");
            AppError::database("Failed to begin transaction")
        })?;

        sqlx::query(
            r#"
            INSERT INTO approval_flows (
                id, tenant_id, transaction_id, requesting_organization_id, matrix_id,
                category, amount, status, current_level, rejection_reason, version,
                created_at, updated_at, completed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(flow.id)
        .bind(flow.tenant_id)
        .bind(flow.transaction_id)
        .bind(flow.requesting_organization_id)
        .bind(flow.matrix_id)
        .bind(flow.category)
        .bind(flow.amount)
        .bind(flow.status)
        .bind(flow.current_level)
        .bind(flow.rejection_reason)
        .bind(flow.version)
        .bind(flow.created_at)
        .bind(flow.updated_at)
        .bind(flow.completed_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            map_unique_violation(
                e,
                format!("transaction {} already has an approval flow", flow.transaction_id),
            )
        })?;

        for step in steps {
            upsert_step(&mut tx, step).await?;
        }

        tx.commit().await.map_err(|e| {
            error!(error = %e, "Failed to commit transaction");
            AppError::database("Failed to commit transaction")
        })?;

        Ok(())
    }

    async fn find_flow(&self, id: Uuid) -> Result<Option<ApprovalFlow>> {
        let flow = sqlx::query_as::<_, ApprovalFlow>("SELECT * FROM approval_flows WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?;

        Ok(flow)
    }

    async fn find_flow_by_transaction(
        &self,
        tenant_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<Option<ApprovalFlow>> {
        let flow = sqlx::query_as::<_, ApprovalFlow>(
            "SELECT * FROM approval_flows WHERE tenant_id = $1 AND transaction_id = $2",
        )
        .bind(tenant_id)
        .bind(transaction_id)
        .fetch_optional(&self.db)
        .await?;

        Ok(flow)
    }

    async fn find_step(&self, id: Uuid) -> Result<Option<ApprovalStep>> {
        let step = sqlx::query_as::<_, ApprovalStep>("SELECT * FROM approval_steps WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?;

        Ok(step)
    }

    async fn list_steps(&self, flow_id: Uuid) -> Result<Vec<ApprovalStep>> {
        let steps = sqlx::query_as::<_, ApprovalStep>(
            r#"
            SELECT * FROM approval_steps
            WHERE flow_id = $1
            ORDER BY level_order, position, created_at
            "#,
        )
        .bind(flow_id)
        .fetch_all(&self.db)
        .await?;

        Ok(steps)
    }

    async fn list_flows_by_status(&self, status: FlowStatus) -> Result<Vec<ApprovalFlow>> {
        let flows = sqlx::query_as::<_, ApprovalFlow>(
            "SELECT * FROM approval_flows WHERE status = $1 ORDER BY created_at",
        )
        .bind(status)
        .fetch_all(&self.db)
        .await?;

        Ok(flows)
    }

    async fn list_pending_steps_for_user(&self, user_id: Uuid) -> Result<Vec<ApprovalStep>> {
        let steps = sqlx::query_as::<_, ApprovalStep>(
            r#"
            SELECT * FROM approval_steps
            WHERE status = 'pending'
              AND candidate_approver_ids @> jsonb_build_array($1::text)
            ORDER BY created_at
            "#,
        )
        .bind(user_id.to_string())
        .fetch_all(&self.db)
        .await?;

        Ok(steps)
    }

    async fn commit_flow(
        &self,
        flow: &ApprovalFlow,
        expected_version: i64,
        steps: &[ApprovalStep],
    ) -> Result<bool> {
        let mut tx = self.db.begin().await.map_err(|e| {
            error!(error = %e, "Failed to begin transaction");
            AppError::database("Failed to begin transaction")
        })?;

        let result = sqlx::query(
            r#"
            UPDATE approval_flows
            SET status = $3, current_level = $4, rejection_reason = $5,
                version = $6, updated_at = $7, completed_at = $8
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(flow.id)
        .bind(expected_version)
        .bind(flow.status)
        .bind(flow.current_level)
        .bind(flow.rejection_reason)
        .bind(flow.version)
        .bind(flow.updated_at)
        .bind(flow.completed_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            error!(error = %e, flow_id = %flow.id, "Failed to update approval flow");
            AppError::database("Failed to update approval flow")
        })?;

        // 版本已被其他决策推进，放弃本次写入
        if result.rows_affected() == 0 {
            tx.rollback().await.map_err(|e| {
                error!(error = %e, "Failed to roll back transaction");
                AppError::database("Failed to roll back transaction")
            })?;
            return Ok(false);
        }

        for step in steps {
            upsert_step(&mut tx, step).await?;
        }

        tx.commit().await.map_err(|e| {
            error!(error = %e, "Failed to commit transaction");
            AppError::database("Failed to commit transaction")
        })?;

        Ok(true)
    }
}
