//! 测试公共模块
//! 基于内存存储和手动时钟的测试环境

#![allow(dead_code)]

use approval_engine::{
    config::{
        AppConfig, DatabaseConfig, EngineConfig, LoggingConfig, ServerConfig, StorageBackend,
        StorageConfig,
    },
    middleware::AppState,
    models::{
        matrix::{
            ApprovalMatrix, ApprovalMatrixLevel, CreateMatrixRequest, OrganizationLevelMode,
            TimeoutAction, TransactionCategory, UpsertEscalationRuleRequest,
        },
        organization::{CreateOrganizationRequest, Organization},
        role::{CreateRoleRequest, Role},
    },
    repository::MemoryStore,
    services::ManualClock,
};
use chrono::{TimeZone, Utc};
use secrecy::Secret;
use std::sync::Arc;
use uuid::Uuid;

/// 创建测试配置
pub fn create_test_config() -> AppConfig {
    AppConfig {
        server: ServerConfig {
            addr: "127.0.0.1:0".to_string(), // 使用随机端口
            graceful_shutdown_timeout_secs: 5,
        },
        database: DatabaseConfig {
            url: Secret::new(String::new()),
            max_connections: 5,
            min_connections: 1,
            acquire_timeout_secs: 5,
            idle_timeout_secs: 300,
            max_lifetime_secs: 1800,
        },
        logging: LoggingConfig {
            level: "debug".to_string(),
            format: "pretty".to_string(),
        },
        storage: StorageConfig { backend: StorageBackend::Memory },
        engine: EngineConfig {
            timeout_sweep_interval_secs: 0, // 测试中手动触发扫描
            ..EngineConfig::default()
        },
    }
}

/// 测试环境：同一租户下的全部服务
pub struct TestEnv {
    pub state: Arc<AppState>,
    pub clock: Arc<ManualClock>,
    pub tenant_id: Uuid,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_config(create_test_config())
    }

    pub fn with_config(config: AppConfig) -> Self {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let state = Arc::new(AppState::new(
            config,
            Arc::new(MemoryStore::new()),
            None,
            clock.clone(),
        ));
        Self { state, clock, tenant_id: Uuid::new_v4() }
    }

    /// 创建组织
    pub async fn org(&self, code: &str, parent: Option<&Organization>) -> Organization {
        self.state
            .organization_service
            .create_organization(CreateOrganizationRequest {
                tenant_id: self.tenant_id,
                code: code.to_string(),
                name: format!("Organization {}", code),
                parent_id: parent.map(|p| p.id),
                sort_order: 0,
            })
            .await
            .expect("Failed to create organization")
    }

    /// 创建角色
    pub async fn role(&self, name: &str, rank: i32) -> Role {
        self.state
            .role_service
            .create_role(CreateRoleRequest {
                tenant_id: self.tenant_id,
                name: name.to_string(),
                rank,
                is_leadership: rank >= 50,
            })
            .await
            .expect("Failed to create role")
    }

    pub async fn assign(&self, org: &Organization, role: &Role, cascade: bool) {
        self.state
            .role_service
            .assign_role(org.id, role.id, cascade)
            .await
            .expect("Failed to assign role");
    }

    /// 在组织上任命一个新用户为角色持有人，返回该用户
    pub async fn appoint(&self, org: &Organization, role: &Role) -> Uuid {
        let user_id = Uuid::new_v4();
        self.state
            .role_service
            .appoint_holder(org.id, role.id, user_id)
            .await
            .expect("Failed to appoint holder");
        user_id
    }

    pub async fn matrix(
        &self,
        name: &str,
        category: TransactionCategory,
        band: (Option<i64>, Option<i64>),
        priority: i32,
        levels: Vec<ApprovalMatrixLevel>,
    ) -> ApprovalMatrix {
        self.state
            .matrix_service
            .create_matrix(CreateMatrixRequest {
                tenant_id: self.tenant_id,
                name: name.to_string(),
                category,
                min_amount: band.0,
                max_amount: band.1,
                priority,
                organization_scope: None,
                levels,
            })
            .await
            .expect("Failed to create matrix")
    }

    pub async fn escalation_rule(&self, category: TransactionCategory, action: TimeoutAction) {
        self.state
            .matrix_service
            .upsert_escalation_rule(UpsertEscalationRuleRequest {
                tenant_id: self.tenant_id,
                category,
                action,
            })
            .await
            .expect("Failed to upsert escalation rule");
    }
}

/// 单角色层级
pub fn level(
    order: i32,
    roles: &[&str],
    mode: OrganizationLevelMode,
    timeout_hours: Option<i32>,
) -> ApprovalMatrixLevel {
    ApprovalMatrixLevel {
        level_order: order,
        required_roles: roles.iter().map(|r| r.to_string()).collect(),
        organization_level_mode: mode,
        is_required: true,
        is_parallel: false,
        timeout_hours,
    }
}
