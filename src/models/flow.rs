//! Approval flow and step models
//! 审批流：单笔交易的矩阵实例化结果

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use std::fmt;
use uuid::Uuid;
use validator::Validate;

use crate::models::matrix::TransactionCategory;

/// 审批流状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "flow_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    InProgress,
    Approved,
    Rejected,
    Cancelled,
}

impl FlowStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, FlowStatus::InProgress)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FlowStatus::InProgress => "in_progress",
            FlowStatus::Approved => "approved",
            FlowStatus::Rejected => "rejected",
            FlowStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 审批步骤状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "step_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Approved,
    Rejected,
    Skipped,
    TimedOut,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Approved => "approved",
            StepStatus::Rejected => "rejected",
            StepStatus::Skipped => "skipped",
            StepStatus::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 驳回原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "rejection_reason", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    /// 审批人驳回
    Rejected,
    /// 超时策略驳回
    Timeout,
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::Rejected => f.write_str("rejected"),
            RejectionReason::Timeout => f.write_str("timeout"),
        }
    }
}

/// 审批动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    Approve,
    Reject,
}

/// 审批流
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ApprovalFlow {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub transaction_id: Uuid, // 一笔交易只对应一个审批流
    pub requesting_organization_id: Uuid,
    pub matrix_id: Uuid,
    pub category: TransactionCategory,
    pub amount: i64,
    pub status: FlowStatus,
    pub current_level: i32,
    pub rejection_reason: Option<RejectionReason>,
    pub version: i64, // 乐观并发版本号
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// 审批步骤
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ApprovalStep {
    pub id: Uuid,
    pub flow_id: Uuid,
    pub level_order: i32,
    pub position: i32, // 同一层级内的角色顺序
    pub resolved_organization_id: Uuid,
    pub required_role_name: String,
    pub candidate_approver_ids: Json<Vec<Uuid>>,
    /// 实际做出决定的审批人（首个终态决定写入）
    pub approver_user_id: Option<Uuid>,
    pub status: StepStatus,
    pub is_required: bool,
    pub is_parallel_group: bool,
    pub is_unresolved: bool,
    pub timeout_hours: Option<i32>,
    pub activated_at: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
    pub decided_at: Option<DateTime<Utc>>,
    pub comments: Option<String>,
    pub escalated_from_step_id: Option<Uuid>,
    pub escalation_count: i32,
    pub created_at: DateTime<Utc>,
}

impl ApprovalStep {
    pub fn is_pending(&self) -> bool {
        self.status == StepStatus::Pending
    }

    /// 已激活且仍待决定
    pub fn is_open(&self) -> bool {
        self.is_pending() && self.activated_at.is_some()
    }

    pub fn is_candidate(&self, user_id: Uuid) -> bool {
        self.candidate_approver_ids.0.contains(&user_id)
    }

    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        self.is_open() && self.deadline.is_some_and(|deadline| deadline <= now)
    }
}

/// 创建审批流请求
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateFlowRequest {
    pub transaction_id: Uuid,
    pub organization_id: Uuid,
    #[validate(range(min = 0))]
    pub amount: i64,
    pub category: TransactionCategory,
}

/// 审批决策请求
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ProcessDecisionRequest {
    pub approver_user_id: Uuid,
    pub action: DecisionAction,
    #[validate(length(max = 2000))]
    pub comments: Option<String>,
}

/// 审批流状态视图
#[derive(Debug, Clone, Serialize)]
pub struct FlowStatusView {
    pub flow: ApprovalFlow,
    pub steps: Vec<ApprovalStep>,
    /// 无人可审批、流程卡住的层级
    pub unresolved_levels: Vec<i32>,
    pub open_step_ids: Vec<Uuid>,
}

/// 用户待办步骤
#[derive(Debug, Clone, Serialize)]
pub struct PendingStepView {
    pub step: ApprovalStep,
    pub transaction_id: Uuid,
    pub requesting_organization_id: Uuid,
    pub category: TransactionCategory,
    pub amount: i64,
}
