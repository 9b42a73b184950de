//! Approval step state machine
//!
//! 纯内存状态机：加载一个审批流及其全部步骤，施加决定 / 超时 / 取消，
//! 产出需要写回的流程、变更步骤和待发布事件。是否真正写入由调用方
//! 以版本号为条件提交决定。
//!
//! 层级规则：
//! - 有必需步骤的层级：所有仍有效（未超时）的必需步骤都 APPROVED 才满足；
//!   任一必需步骤 REJECTED 立即驳回整个流程。
//! - 无必需步骤的层级：任一步骤 APPROVED 即满足；全部有效步骤都 REJECTED 才驳回。
//! - 非并行且有必需步骤的层级按角色顺序逐个开放，其余层级一次全部开放。

use chrono::{DateTime, Duration, Utc};
use sqlx::types::Json;
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::flow::*;
use crate::realtime::ApprovalEvent;

/// 待提交的变更
#[derive(Debug, Clone)]
pub struct FlowCommit {
    pub flow: ApprovalFlow,
    pub expected_version: i64,
    pub steps: Vec<ApprovalStep>,
    pub events: Vec<ApprovalEvent>,
}

#[derive(Debug, Clone)]
pub struct FlowState {
    flow: ApprovalFlow,
    steps: Vec<ApprovalStep>,
    loaded_version: i64,
    changed: Vec<Uuid>,
    flow_changed: bool,
    events: Vec<ApprovalEvent>,
}

impl FlowState {
    pub fn new(flow: ApprovalFlow, mut steps: Vec<ApprovalStep>) -> Self {
        steps.sort_by(|a, b| {
            a.level_order
                .cmp(&b.level_order)
                .then(a.position.cmp(&b.position))
                .then(a.created_at.cmp(&b.created_at))
        });
        let loaded_version = flow.version;
        Self {
            flow,
            steps,
            loaded_version,
            changed: Vec::new(),
            flow_changed: false,
            events: Vec::new(),
        }
    }

    pub fn flow(&self) -> &ApprovalFlow {
        &self.flow
    }

    pub fn steps(&self) -> &[ApprovalStep] {
        &self.steps
    }

    pub fn step(&self, step_id: Uuid) -> Option<&ApprovalStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn is_dirty(&self) -> bool {
        self.flow_changed || !self.changed.is_empty()
    }

    fn mark(&mut self, index: usize) {
        let id = self.steps[index].id;
        if !self.changed.contains(&id) {
            self.changed.push(id);
        }
    }

    fn touch_flow(&mut self) {
        self.flow_changed = true;
    }

    fn levels(&self) -> BTreeSet<i32> {
        self.steps.iter().map(|s| s.level_order).collect()
    }

    fn level_indices(&self, level: i32) -> Vec<usize> {
        (0..self.steps.len()).filter(|i| self.steps[*i].level_order == level).collect()
    }

    /// 逐个开放的层级：非并行且包含必需步骤
    fn is_sequential(&self, level: i32) -> bool {
        let steps: Vec<&ApprovalStep> = self.steps.iter().filter(|s| s.level_order == level).collect();
        steps.iter().any(|s| s.is_required) && steps.iter().all(|s| !s.is_parallel_group)
    }

    fn open_step(&mut self, index: usize, now: DateTime<Utc>) {
        let step = &mut self.steps[index];
        step.activated_at = Some(now);
        step.deadline = step.timeout_hours.map(|h| now + Duration::hours(i64::from(h)));

        let event = if step.is_unresolved {
            ApprovalEvent::ApproverUnresolved { flow_id: step.flow_id, level_order: step.level_order }
        } else {
            ApprovalEvent::StepPendingApproval {
                step_id: step.id,
                flow_id: step.flow_id,
                candidate_approver_ids: step.candidate_approver_ids.0.clone(),
            }
        };
        if !self.events.contains(&event) {
            self.events.push(event);
        }
        self.mark(index);
    }

    /// 开放层级中应当开放的步骤
    fn activate_level(&mut self, level: i32, now: DateTime<Utc>) {
        if self.flow.current_level != level {
            self.flow.current_level = level;
            self.touch_flow();
        }

        let waiting: Vec<usize> = self
            .level_indices(level)
            .into_iter()
            .filter(|i| self.steps[*i].is_pending() && self.steps[*i].activated_at.is_none())
            .collect();

        if self.is_sequential(level) {
            let has_open = self.level_indices(level).into_iter().any(|i| self.steps[i].is_open());
            if !has_open {
                if let Some(first) = waiting.first() {
                    self.open_step(*first, now);
                }
            }
        } else {
            for index in waiting {
                self.open_step(index, now);
            }
        }
    }

    /// 新建审批流：开放第一个层级
    pub fn start(&mut self, now: DateTime<Utc>) {
        if let Some(first) = self.levels().into_iter().next() {
            self.activate_level(first, now);
        }
    }

    /// 处理审批决定
    pub fn decide(
        &mut self,
        step_id: Uuid,
        user_id: Uuid,
        action: DecisionAction,
        comments: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self.flow.status.is_terminal() {
            return Err(AppError::FlowAlreadyTerminal {
                flow_id: self.flow.id,
                status: self.flow.status.to_string(),
            });
        }

        let index = self
            .steps
            .iter()
            .position(|s| s.id == step_id)
            .ok_or_else(|| AppError::not_found("Approval step not found"))?;
        let step = &self.steps[index];

        match step.status {
            StepStatus::Pending => {}
            StepStatus::TimedOut => {
                return Err(AppError::Timeout(format!(
                    "step {} passed its deadline before a decision was recorded",
                    step_id
                )));
            }
            other => {
                return Err(AppError::StepAlreadyDecided { step_id, status: other.to_string() });
            }
        }
        if !step.is_open() {
            return Err(AppError::validation("Step is not open for decisions yet"));
        }
        if step.is_unresolved {
            return Err(AppError::UnresolvedApprover(format!(
                "no holder of {} can decide step {}",
                step.required_role_name, step_id
            )));
        }
        if !step.is_candidate(user_id) {
            return Err(AppError::NotEligibleApprover { step_id, user_id });
        }

        let step = &mut self.steps[index];
        step.status = match action {
            DecisionAction::Approve => StepStatus::Approved,
            DecisionAction::Reject => StepStatus::Rejected,
        };
        step.approver_user_id = Some(user_id);
        step.decided_at = Some(now);
        step.comments = comments;
        self.mark(index);

        self.advance(now);
        Ok(())
    }

    /// 根据当前层级的状态推进流程，可能连续越过多个层级
    pub fn advance(&mut self, now: DateTime<Utc>) {
        while !self.flow.status.is_terminal() {
            let level = self.flow.current_level;
            let live: Vec<usize> = self
                .level_indices(level)
                .into_iter()
                .filter(|i| self.steps[*i].status != StepStatus::TimedOut)
                .collect();
            let required: Vec<usize> =
                live.iter().copied().filter(|i| self.steps[*i].is_required).collect();

            let satisfied = if required.is_empty() {
                let any_approved = live.iter().any(|i| self.steps[*i].status == StepStatus::Approved);
                let all_rejected = !live.is_empty()
                    && live.iter().all(|i| self.steps[*i].status == StepStatus::Rejected);
                if all_rejected {
                    self.reject(RejectionReason::Rejected, now);
                    return;
                }
                any_approved
            } else {
                if required.iter().any(|i| self.steps[*i].status == StepStatus::Rejected) {
                    self.reject(RejectionReason::Rejected, now);
                    return;
                }
                required.iter().all(|i| self.steps[*i].status == StepStatus::Approved)
            };

            if !satisfied {
                // 顺序层级：上一步已批准时开放下一步
                self.activate_level(level, now);
                return;
            }

            for index in self.level_indices(level) {
                if self.steps[index].is_pending() {
                    self.steps[index].status = StepStatus::Skipped;
                    self.mark(index);
                }
            }

            match self.levels().into_iter().find(|l| *l > level) {
                Some(next) => self.activate_level(next, now),
                None => {
                    self.flow.status = FlowStatus::Approved;
                    self.flow.completed_at = Some(now);
                    self.touch_flow();
                    self.events.push(ApprovalEvent::FlowApproved { flow_id: self.flow.id });
                }
            }
        }
    }

    fn skip_pending(&mut self) {
        for index in 0..self.steps.len() {
            if self.steps[index].is_pending() {
                self.steps[index].status = StepStatus::Skipped;
                self.mark(index);
            }
        }
    }

    /// 驳回整个流程，后续步骤全部 SKIPPED
    pub fn reject(&mut self, reason: RejectionReason, now: DateTime<Utc>) {
        if self.flow.status.is_terminal() {
            return;
        }
        self.flow.status = FlowStatus::Rejected;
        self.flow.rejection_reason = Some(reason);
        self.flow.completed_at = Some(now);
        self.touch_flow();
        self.skip_pending();
        self.events.push(ApprovalEvent::FlowRejected { flow_id: self.flow.id, reason });
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.flow.status.is_terminal() {
            return Err(AppError::FlowAlreadyTerminal {
                flow_id: self.flow.id,
                status: self.flow.status.to_string(),
            });
        }
        self.flow.status = FlowStatus::Cancelled;
        self.flow.completed_at = Some(now);
        self.touch_flow();
        self.skip_pending();
        self.events.push(ApprovalEvent::FlowCancelled { flow_id: self.flow.id });
        Ok(())
    }

    /// 把已过截止时间的开放步骤标记为 TIMED_OUT，返回这些步骤
    pub fn expire_due(&mut self, now: DateTime<Utc>) -> Vec<ApprovalStep> {
        if self.flow.status.is_terminal() {
            return Vec::new();
        }

        let mut expired = Vec::new();
        for index in 0..self.steps.len() {
            if self.steps[index].is_past_deadline(now) {
                self.steps[index].status = StepStatus::TimedOut;
                self.steps[index].decided_at = Some(now);
                self.mark(index);
                expired.push(self.steps[index].clone());
            }
        }
        expired
    }

    /// 为超时步骤在上级组织创建升级步骤
    pub fn escalate(
        &mut self,
        timed_out: &ApprovalStep,
        organization_id: Uuid,
        candidates: Vec<Uuid>,
        now: DateTime<Utc>,
    ) -> Uuid {
        let step = ApprovalStep {
            id: Uuid::new_v4(),
            flow_id: timed_out.flow_id,
            level_order: timed_out.level_order,
            position: timed_out.position,
            resolved_organization_id: organization_id,
            required_role_name: timed_out.required_role_name.clone(),
            is_unresolved: candidates.is_empty(),
            candidate_approver_ids: Json(candidates),
            approver_user_id: None,
            status: StepStatus::Pending,
            is_required: timed_out.is_required,
            is_parallel_group: timed_out.is_parallel_group,
            timeout_hours: timed_out.timeout_hours,
            activated_at: None,
            deadline: None,
            decided_at: None,
            comments: None,
            escalated_from_step_id: Some(timed_out.id),
            escalation_count: timed_out.escalation_count + 1,
            created_at: now,
        };
        let id = step.id;
        self.steps.push(step);
        let index = self.steps.len() - 1;
        self.open_step(index, now);
        id
    }

    /// 管理员补齐持有人后重新填充未解析步骤的候选人；返回被解析的步骤数
    pub fn refresh_candidates(&mut self, step_id: Uuid, candidates: Vec<Uuid>) -> bool {
        let Some(index) = self.steps.iter().position(|s| s.id == step_id) else {
            return false;
        };
        let step = &self.steps[index];
        if !step.is_pending() || !step.is_unresolved || candidates.is_empty() {
            return false;
        }

        let step = &mut self.steps[index];
        step.candidate_approver_ids = Json(candidates);
        step.is_unresolved = false;
        let event = step.activated_at.map(|_| ApprovalEvent::StepPendingApproval {
            step_id: step.id,
            flow_id: step.flow_id,
            candidate_approver_ids: step.candidate_approver_ids.0.clone(),
        });
        self.mark(index);
        if let Some(event) = event {
            self.events.push(event);
        }
        true
    }

    /// 仍在等待管理员处理的层级
    pub fn unresolved_levels(&self) -> Vec<i32> {
        let levels: BTreeSet<i32> = self
            .steps
            .iter()
            .filter(|s| s.is_pending() && s.is_unresolved)
            .map(|s| s.level_order)
            .collect();
        levels.into_iter().collect()
    }

    pub fn open_step_ids(&self) -> Vec<Uuid> {
        self.steps.iter().filter(|s| s.is_open()).map(|s| s.id).collect()
    }

    /// 取出新建审批流的完整数据
    pub fn into_new_flow(self) -> (ApprovalFlow, Vec<ApprovalStep>, Vec<ApprovalEvent>) {
        (self.flow, self.steps, self.events)
    }

    /// 取出以版本号为条件的提交；没有变化时为 None
    pub fn into_commit(self, now: DateTime<Utc>) -> Option<FlowCommit> {
        if !self.is_dirty() {
            return None;
        }

        let Self { mut flow, steps, loaded_version, changed, events, .. } = self;
        flow.version = loaded_version + 1;
        flow.updated_at = now;
        let steps = steps.into_iter().filter(|s| changed.contains(&s.id)).collect();

        Some(FlowCommit { flow, expected_version: loaded_version, steps, events })
    }
}
