//! 审批矩阵集成测试：定义校验与选择

use approval_engine::error::AppError;
use approval_engine::models::matrix::{
    CreateMatrixRequest, OrganizationLevelMode, TransactionCategory,
};
use uuid::Uuid;

mod common;
use common::{level, TestEnv};

fn request(env: &TestEnv, levels: Vec<approval_engine::models::matrix::ApprovalMatrixLevel>) -> CreateMatrixRequest {
    CreateMatrixRequest {
        tenant_id: env.tenant_id,
        name: "Equipment mid band".to_string(),
        category: TransactionCategory::Equipment,
        min_amount: Some(100_001),
        max_amount: Some(500_000),
        priority: 70,
        organization_scope: None,
        levels,
    }
}

#[tokio::test]
async fn test_create_matrix_validation() {
    let env = TestEnv::new();
    env.role("Department Head", 40).await;
    let service = &env.state.matrix_service;

    // 未知角色
    let err = service
        .create_matrix(request(&env, vec![level(1, &["Treasurer"], OrganizationLevelMode::Same, None)]))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    // 重复的 level_order
    let err = service
        .create_matrix(request(
            &env,
            vec![
                level(1, &["Department Head"], OrganizationLevelMode::Same, None),
                level(1, &["Department Head"], OrganizationLevelMode::Parent, None),
            ],
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    // 同一层级重复列出角色
    let err = service
        .create_matrix(request(
            &env,
            vec![level(1, &["Department Head", " Department Head "], OrganizationLevelMode::Same, None)],
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(ref msg) if msg.contains("more than once")));

    // 区间颠倒
    let mut inverted =
        request(&env, vec![level(1, &["Department Head"], OrganizationLevelMode::Same, None)]);
    inverted.min_amount = Some(10);
    inverted.max_amount = Some(5);
    assert!(matches!(service.create_matrix(inverted).await, Err(AppError::Validation(_))));

    // 没有层级
    assert!(matches!(service.create_matrix(request(&env, vec![])).await, Err(AppError::Validation(_))));

    // 非正的超时
    let err = service
        .create_matrix(request(
            &env,
            vec![level(1, &["Department Head"], OrganizationLevelMode::Same, Some(0))],
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    // 作用域不在本租户
    let mut foreign =
        request(&env, vec![level(1, &["Department Head"], OrganizationLevelMode::Same, None)]);
    foreign.organization_scope = Some(Uuid::new_v4());
    assert!(matches!(service.create_matrix(foreign).await, Err(AppError::Validation(_))));
}

#[tokio::test]
async fn test_select_matrix_by_band_and_priority() {
    let env = TestEnv::new();
    let root = env.org("ROOT", None).await;
    env.role("Department Head", 40).await;
    env.role("Parish Head", 60).await;

    let low = env
        .matrix(
            "Equipment low",
            TransactionCategory::Equipment,
            (Some(0), Some(100_000)),
            50,
            vec![level(1, &["Department Head"], OrganizationLevelMode::Same, None)],
        )
        .await;
    let mid = env
        .matrix(
            "Equipment mid",
            TransactionCategory::Equipment,
            (Some(100_001), Some(500_000)),
            70,
            vec![
                level(1, &["Department Head"], OrganizationLevelMode::Same, None),
                level(2, &["Parish Head"], OrganizationLevelMode::Parent, None),
            ],
        )
        .await;
    let catch_all = env
        .matrix(
            "Equipment any",
            TransactionCategory::Equipment,
            (None, None),
            1,
            vec![level(1, &["Parish Head"], OrganizationLevelMode::Root, None)],
        )
        .await;

    let service = &env.state.matrix_service;
    let pick = |amount| service.select_matrix(root.id, amount, TransactionCategory::Equipment);

    assert_eq!(pick(300_000).await.unwrap().id, mid.id);
    assert_eq!(pick(100_000).await.unwrap().id, low.id);
    assert_eq!(pick(100_001).await.unwrap().id, mid.id);
    assert_eq!(pick(9_000_000).await.unwrap().id, catch_all.id);

    // 停用后落到兜底矩阵
    let deactivated = service.deactivate_matrix(mid.id).await.unwrap();
    assert!(!deactivated.is_active);
    assert_eq!(pick(300_000).await.unwrap().id, catch_all.id);

    // 其他类别没有矩阵
    let err = service
        .select_matrix(root.id, 10, TransactionCategory::Event)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NoApplicableMatrix { amount: 10, .. }));

    let listed = service
        .list_matrices(env.tenant_id, Some(TransactionCategory::Equipment))
        .await
        .unwrap();
    assert_eq!(listed.len(), 3);
}

#[tokio::test]
async fn test_deactivate_unknown_matrix() {
    let env = TestEnv::new();
    let err = env
        .state
        .matrix_service
        .deactivate_matrix(Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}
