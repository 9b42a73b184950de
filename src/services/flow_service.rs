//! Approval flow service
//!
//! 审批流实例化、决策处理、取消与超时处理。超时在每次读取或操作
//! 审批流时惰性判定，并由后台定时任务兜底扫描。所有写入都以流程
//! 版本号为条件提交，事件只在提交成功后发布。

use std::collections::BTreeSet;
use std::sync::Arc;
use sqlx::types::Json;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::config::EngineConfig;
use crate::error::{AppError, Result};
use crate::models::{
    flow::*,
    matrix::{OrganizationLevelMode, TimeoutAction},
};
use crate::realtime::EventBus;
use crate::repository::ApprovalStore;
use crate::services::{
    clock::Clock,
    load_tree,
    matrix_selector::MatrixService,
    org_tree::OrgTree,
    role_service::RoleService,
    step_machine::{FlowCommit, FlowState},
};
use crate::telemetry::metric_names;

/// 解析层级的目标组织；根组织的 PARENT 解析为自身
pub fn resolve_target_organization(
    tree: &OrgTree,
    requesting_organization_id: Uuid,
    mode: OrganizationLevelMode,
) -> Uuid {
    match mode {
        OrganizationLevelMode::Same => requesting_organization_id,
        OrganizationLevelMode::Parent => tree
            .parent(requesting_organization_id)
            .map(|p| p.id)
            .unwrap_or(requesting_organization_id),
        OrganizationLevelMode::Root => tree.root_of(requesting_organization_id),
    }
}

/// 审批流服务
pub struct FlowService {
    store: Arc<dyn ApprovalStore>,
    roles: Arc<RoleService>,
    matrices: Arc<MatrixService>,
    event_bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    engine: EngineConfig,
}

impl FlowService {
    pub fn new(
        store: Arc<dyn ApprovalStore>,
        roles: Arc<RoleService>,
        matrices: Arc<MatrixService>,
        event_bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        engine: EngineConfig,
    ) -> Self {
        Self { store, roles, matrices, event_bus, clock, engine }
    }

    // ==================== Instantiation ====================

    /// 为一笔交易创建审批流
    ///
    /// 无人可审批的步骤不会阻止创建：流程仍为 IN_PROGRESS，停在该层级，
    /// 并发布 `ApproverUnresolved` 事件等待管理员处理。
    #[instrument(skip(self, request), fields(transaction_id = %request.transaction_id, organization_id = %request.organization_id))]
    pub async fn create_flow(&self, request: CreateFlowRequest) -> Result<FlowStatusView> {
        request.validate()?;

        let org = self
            .store
            .find_organization(request.organization_id)
            .await?
            .ok_or_else(|| AppError::not_found("Organization not found"))?;
        if !org.is_active {
            return Err(AppError::validation("Inactive organizations cannot originate approval flows"));
        }

        if self
            .store
            .find_flow_by_transaction(org.tenant_id, request.transaction_id)
            .await?
            .is_some()
        {
            return Err(AppError::Conflict(format!(
                "transaction {} already has an approval flow",
                request.transaction_id
            )));
        }

        let matrix = self
            .matrices
            .select_matrix(org.id, request.amount, request.category)
            .await?;
        let tree = load_tree(self.store.as_ref(), org.tenant_id).await?;
        let now = self.clock.now();

        let flow = ApprovalFlow {
            id: Uuid::new_v4(),
            tenant_id: org.tenant_id,
            transaction_id: request.transaction_id,
            requesting_organization_id: org.id,
            matrix_id: matrix.id,
            category: request.category,
            amount: request.amount,
            status: FlowStatus::InProgress,
            current_level: 0,
            rejection_reason: None,
            version: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };

        let mut steps = Vec::new();
        for level in matrix.ordered_levels() {
            let target = resolve_target_organization(&tree, org.id, level.organization_level_mode);
            for (position, role_name) in level.required_roles.iter().enumerate() {
                let candidates = self
                    .roles
                    .eligible_approvers_by_name(org.tenant_id, target, role_name)
                    .await?;
                if candidates.is_empty() {
                    warn!(
                        level_order = level.level_order,
                        role = %role_name,
                        organization_id = %target,
                        "No eligible approver for required role"
                    );
                }

                steps.push(ApprovalStep {
                    id: Uuid::new_v4(),
                    flow_id: flow.id,
                    level_order: level.level_order,
                    position: position as i32,
                    resolved_organization_id: target,
                    required_role_name: role_name.clone(),
                    is_unresolved: candidates.is_empty(),
                    candidate_approver_ids: Json(candidates),
                    approver_user_id: None,
                    status: StepStatus::Pending,
                    is_required: level.is_required,
                    is_parallel_group: level.is_parallel,
                    timeout_hours: level.timeout_hours,
                    activated_at: None,
                    deadline: None,
                    decided_at: None,
                    comments: None,
                    escalated_from_step_id: None,
                    escalation_count: 0,
                    created_at: now,
                });
            }
        }

        let mut state = FlowState::new(flow, steps);
        state.start(now);
        let unresolved_levels = state.unresolved_levels();
        let open_step_ids = state.open_step_ids();
        let (flow, steps, events) = state.into_new_flow();

        self.store.insert_flow(&flow, &steps).await?;
        self.event_bus.publish_all(events);
        metrics::counter!(metric_names::FLOWS_CREATED, "category" => flow.category.as_str())
            .increment(1);

        info!(
            flow_id = %flow.id,
            matrix = %matrix.name,
            steps = steps.len(),
            unresolved_levels = ?unresolved_levels,
            "Approval flow created"
        );
        Ok(FlowStatusView { flow, steps, unresolved_levels, open_step_ids })
    }

    // ==================== Decisions ====================

    /// 处理审批决定
    ///
    /// 同一步骤的并发决定只会有一个成功：提交以流程版本为条件，
    /// 失败方重新加载后会看到 `StepAlreadyDecided`。
    #[instrument(skip(self, request), fields(approver = %request.approver_user_id, action = ?request.action))]
    pub async fn process_decision(
        &self,
        step_id: Uuid,
        request: ProcessDecisionRequest,
    ) -> Result<FlowStatusView> {
        request.validate()?;

        let step = self
            .store
            .find_step(step_id)
            .await?
            .ok_or_else(|| AppError::not_found("Approval step not found"))?;

        for attempt in 0..=self.engine.decision_retry_limit {
            let now = self.clock.now();
            let mut state = self.load_state(step.flow_id).await?;
            self.apply_timeouts(&mut state, now).await?;

            if let Err(e) = state.decide(
                step_id,
                request.approver_user_id,
                request.action,
                request.comments.clone(),
                now,
            ) {
                // 先落盘惰性判定出的超时，再把拒绝原因返回给调用方
                self.persist_best_effort(state, now).await;
                return Err(e);
            }

            let Some(commit) = state.into_commit(now) else {
                return Err(AppError::internal_error("Decision produced no changes"));
            };

            if self.try_commit(commit).await? {
                let action = match request.action {
                    DecisionAction::Approve => "approve",
                    DecisionAction::Reject => "reject",
                };
                metrics::counter!(metric_names::DECISIONS, "action" => action).increment(1);
                info!(step_id = %step_id, "Decision recorded");
                return self.snapshot(step.flow_id).await;
            }

            warn!(step_id = %step_id, attempt, "Concurrent update on approval flow, retrying");
        }

        Err(AppError::Conflict(format!(
            "approval flow {} kept changing, decision not applied",
            step.flow_id
        )))
    }

    /// 取消审批流（交易撤回）
    #[instrument(skip(self))]
    pub async fn cancel_flow(&self, flow_id: Uuid) -> Result<FlowStatusView> {
        for attempt in 0..=self.engine.decision_retry_limit {
            let now = self.clock.now();
            let mut state = self.load_state(flow_id).await?;
            self.apply_timeouts(&mut state, now).await?;

            if let Err(e) = state.cancel(now) {
                self.persist_best_effort(state, now).await;
                return Err(e);
            }

            let Some(commit) = state.into_commit(now) else {
                return Err(AppError::internal_error("Cancellation produced no changes"));
            };
            if self.try_commit(commit).await? {
                info!("Approval flow cancelled");
                return self.snapshot(flow_id).await;
            }

            warn!(attempt, "Concurrent update on approval flow, retrying");
        }

        Err(AppError::Conflict(format!("approval flow {} kept changing, not cancelled", flow_id)))
    }

    /// 管理员补齐角色持有人后，为未解析步骤重新解析候选人
    #[instrument(skip(self))]
    pub async fn refresh_unresolved(&self, flow_id: Uuid) -> Result<FlowStatusView> {
        for attempt in 0..=self.engine.decision_retry_limit {
            let now = self.clock.now();
            let mut state = self.load_state(flow_id).await?;
            self.apply_timeouts(&mut state, now).await?;

            let unresolved: Vec<ApprovalStep> = state
                .steps()
                .iter()
                .filter(|s| s.is_pending() && s.is_unresolved)
                .cloned()
                .collect();

            let tenant_id = state.flow().tenant_id;
            let mut resolved = 0;
            for step in unresolved {
                let candidates = self
                    .roles
                    .eligible_approvers_by_name(tenant_id, step.resolved_organization_id, &step.required_role_name)
                    .await?;
                if state.refresh_candidates(step.id, candidates) {
                    resolved += 1;
                }
            }

            let Some(commit) = state.into_commit(now) else {
                return self.snapshot(flow_id).await;
            };
            if self.try_commit(commit).await? {
                info!(resolved, "Unresolved approval steps refreshed");
                return self.snapshot(flow_id).await;
            }

            warn!(attempt, "Concurrent update on approval flow, retrying");
        }

        Err(AppError::Conflict(format!("approval flow {} kept changing", flow_id)))
    }

    // ==================== Queries ====================

    /// 审批流当前状态（先应用到期的超时）
    #[instrument(skip(self))]
    pub async fn get_flow_status(&self, flow_id: Uuid) -> Result<FlowStatusView> {
        self.refresh_timeouts(flow_id).await?;
        self.snapshot(flow_id).await
    }

    /// 用户当前可以决定的步骤
    #[instrument(skip(self))]
    pub async fn get_pending_steps_for_user(&self, user_id: Uuid) -> Result<Vec<PendingStepView>> {
        let candidates = self.store.list_pending_steps_for_user(user_id).await?;
        let flow_ids: BTreeSet<Uuid> = candidates.iter().map(|s| s.flow_id).collect();

        let mut pending = Vec::new();
        for flow_id in flow_ids {
            self.refresh_timeouts(flow_id).await?;
            let state = self.load_state(flow_id).await?;
            let flow = state.flow();
            if flow.status.is_terminal() {
                continue;
            }

            for step in state.steps() {
                if step.is_open() && !step.is_unresolved && step.is_candidate(user_id) {
                    pending.push(PendingStepView {
                        step: step.clone(),
                        transaction_id: flow.transaction_id,
                        requesting_organization_id: flow.requesting_organization_id,
                        category: flow.category,
                        amount: flow.amount,
                    });
                }
            }
        }

        pending.sort_by(|a, b| a.step.activated_at.cmp(&b.step.activated_at));
        Ok(pending)
    }

    pub async fn get_step(&self, step_id: Uuid) -> Result<ApprovalStep> {
        self.store
            .find_step(step_id)
            .await?
            .ok_or_else(|| AppError::not_found("Approval step not found"))
    }

    // ==================== Timeouts ====================

    /// 扫描所有进行中的审批流并应用超时，返回发生变化的流程数
    #[instrument(skip(self))]
    pub async fn sweep_timeouts(&self) -> Result<usize> {
        let flows = self.store.list_flows_by_status(FlowStatus::InProgress).await?;
        let mut changed = 0;
        for flow in flows {
            match self.refresh_timeouts(flow.id).await {
                Ok(true) => changed += 1,
                Ok(false) => {}
                Err(e) => error!(flow_id = %flow.id, error = %e, "Timeout sweep failed for flow"),
            }
        }
        if changed > 0 {
            info!(changed, "Timeout sweep applied");
        }
        Ok(changed)
    }

    /// 应用到期超时并提交；返回是否有变化
    async fn refresh_timeouts(&self, flow_id: Uuid) -> Result<bool> {
        for _ in 0..=self.engine.decision_retry_limit {
            let now = self.clock.now();
            let mut state = self.load_state(flow_id).await?;
            self.apply_timeouts(&mut state, now).await?;

            let Some(commit) = state.into_commit(now) else {
                return Ok(false);
            };
            if self.try_commit(commit).await? {
                return Ok(true);
            }
        }
        Err(AppError::Conflict(format!("approval flow {} kept changing", flow_id)))
    }

    /// 把过期的开放步骤标记为超时，并按类别的升级规则升级或驳回
    async fn apply_timeouts(&self, state: &mut FlowState, now: chrono::DateTime<chrono::Utc>) -> Result<()> {
        let expired = state.expire_due(now);
        if expired.is_empty() {
            return Ok(());
        }
        metrics::counter!(metric_names::STEPS_TIMED_OUT).increment(expired.len() as u64);

        let flow = state.flow().clone();
        let action = self
            .store
            .find_escalation_rule(flow.tenant_id, flow.category)
            .await?
            .map(|r| r.action)
            .unwrap_or(TimeoutAction::Reject);

        let tree = match action {
            TimeoutAction::Escalate => Some(load_tree(self.store.as_ref(), flow.tenant_id).await?),
            TimeoutAction::Reject => None,
        };

        let mut dropped_optional = false;
        for step in expired {
            if state.flow().status.is_terminal() {
                break;
            }
            warn!(step_id = %step.id, flow_id = %flow.id, action = ?action, "Approval step timed out");

            let parent = tree
                .as_ref()
                .and_then(|t| t.parent(step.resolved_organization_id))
                .map(|p| p.id)
                .filter(|_| step.escalation_count < self.engine.max_escalations);

            match parent {
                Some(parent_id) => {
                    let candidates = self
                        .roles
                        .eligible_approvers_by_name(flow.tenant_id, parent_id, &step.required_role_name)
                        .await?;
                    let escalated = state.escalate(&step, parent_id, candidates, now);
                    info!(step_id = %step.id, escalated_step_id = %escalated, organization_id = %parent_id, "Approval step escalated");
                }
                None if step.is_required => state.reject(RejectionReason::Timeout, now),
                // 非必需步骤超时只退出竞争，由下面的层级判定决定结果
                None => dropped_optional = true,
            }
        }

        // 超时让当前层级失去最后一个可批准的步骤时，驳回原因是超时而不是兄弟步骤的驳回
        if dropped_optional && level_exhausted(state) {
            state.reject(RejectionReason::Timeout, now);
        }

        state.advance(now);
        if level_exhausted(state) {
            state.reject(RejectionReason::Timeout, now);
        }
        Ok(())
    }

    // ==================== Helpers ====================

    async fn load_state(&self, flow_id: Uuid) -> Result<FlowState> {
        let flow = self
            .store
            .find_flow(flow_id)
            .await?
            .ok_or_else(|| AppError::not_found("Approval flow not found"))?;
        let steps = self.store.list_steps(flow_id).await?;
        Ok(FlowState::new(flow, steps))
    }

    async fn snapshot(&self, flow_id: Uuid) -> Result<FlowStatusView> {
        let state = self.load_state(flow_id).await?;
        Ok(FlowStatusView {
            unresolved_levels: state.unresolved_levels(),
            open_step_ids: state.open_step_ids(),
            flow: state.flow().clone(),
            steps: state.steps().to_vec(),
        })
    }

    /// 条件提交；成功后发布事件
    async fn try_commit(&self, commit: FlowCommit) -> Result<bool> {
        let FlowCommit { flow, expected_version, steps, events } = commit;
        if !self.store.commit_flow(&flow, expected_version, &steps).await? {
            return Ok(false);
        }

        if flow.status.is_terminal() {
            metrics::counter!(metric_names::FLOWS_COMPLETED, "status" => flow.status.as_str())
                .increment(1);
            info!(flow_id = %flow.id, status = %flow.status, "Approval flow completed");
        }
        self.event_bus.publish_all(events);
        Ok(true)
    }

    /// 拒绝操作前的超时副作用尽量落盘；版本冲突说明别人已经处理过
    async fn persist_best_effort(&self, state: FlowState, now: chrono::DateTime<chrono::Utc>) {
        let Some(commit) = state.into_commit(now) else {
            return;
        };
        match self.try_commit(commit).await {
            Ok(_) => {}
            Err(e) => error!(error = %e, "Failed to persist timeout side effects"),
        }
    }
}

/// 当前层级已没有待处理或已批准的步骤
fn level_exhausted(state: &FlowState) -> bool {
    if state.flow().status.is_terminal() {
        return false;
    }
    let level = state.flow().current_level;
    !state.steps().iter().any(|s| {
        s.level_order == level && matches!(s.status, StepStatus::Pending | StepStatus::Approved)
    })
}
