//! 组织树集成测试：创建、重组与停用

use approval_engine::error::AppError;
use approval_engine::models::organization::CreateOrganizationRequest;
use uuid::Uuid;

mod common;
use common::TestEnv;

fn role_source(
    roles: &[approval_engine::models::role::EffectiveRole],
    name: &str,
) -> Option<Option<Uuid>> {
    roles
        .iter()
        .find(|r| r.role_name == name)
        .map(|r| r.inherited_from_organization_id)
}

#[tokio::test]
async fn test_levels_derived_from_parent() {
    let env = TestEnv::new();
    let diocese = env.org("DIOCESE", None).await;
    let parish = env.org("PARISH-A", Some(&diocese)).await;
    let dept = env.org("DEPT-A1", Some(&parish)).await;
    let team = env.org("TEAM-A1", Some(&dept)).await;

    assert_eq!(diocese.level, 1);
    assert!(diocese.parent_id.is_none());
    assert_eq!(parish.level, 2);
    assert_eq!(dept.level, 3);
    assert_eq!(team.level, 4);

    // 超过最大层级
    let err = env
        .state
        .organization_service
        .create_organization(CreateOrganizationRequest {
            tenant_id: env.tenant_id,
            code: "TOO-DEEP".to_string(),
            name: "Too deep".to_string(),
            parent_id: Some(team.id),
            sort_order: 0,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::StructuralViolation(_)));
}

#[tokio::test]
async fn test_duplicate_code_and_unknown_parent() {
    let env = TestEnv::new();
    let diocese = env.org("DIOCESE", None).await;

    let duplicate = env
        .state
        .organization_service
        .create_organization(CreateOrganizationRequest {
            tenant_id: env.tenant_id,
            code: diocese.code.clone(),
            name: "Again".to_string(),
            parent_id: None,
            sort_order: 0,
        })
        .await
        .unwrap_err();
    assert!(duplicate.is_conflict());

    let orphan = env
        .state
        .organization_service
        .create_organization(CreateOrganizationRequest {
            tenant_id: env.tenant_id,
            code: "ORPHAN".to_string(),
            name: "Orphan".to_string(),
            parent_id: Some(Uuid::new_v4()),
            sort_order: 0,
        })
        .await
        .unwrap_err();
    assert!(matches!(orphan, AppError::StructuralViolation(_)));

    let bad_code = env
        .state
        .organization_service
        .create_organization(CreateOrganizationRequest {
            tenant_id: env.tenant_id,
            code: "lower case".to_string(),
            name: "Bad".to_string(),
            parent_id: None,
            sort_order: 0,
        })
        .await
        .unwrap_err();
    assert!(matches!(bad_code, AppError::Validation(_)));
}

#[tokio::test]
async fn test_new_child_inherits_cascading_roles() {
    let env = TestEnv::new();
    let diocese = env.org("DIOCESE", None).await;
    let bishop = env.role("Bishop", 100).await;
    env.assign(&diocese, &bishop, true).await;

    let parish = env.org("PARISH-A", Some(&diocese)).await;
    let roles = env.state.role_service.get_effective_roles(parish.id).await.unwrap();

    assert_eq!(role_source(&roles, "Bishop"), Some(Some(diocese.id)));
}

#[tokio::test]
async fn test_move_subtree_relevels_and_reinherits() {
    let env = TestEnv::new();
    let diocese = env.org("DIOCESE", None).await;
    let parish_a = env.org("PARISH-A", Some(&diocese)).await;
    let parish_b = env.org("PARISH-B", Some(&diocese)).await;
    let dept = env.org("DEPT-A1", Some(&parish_a)).await;
    let team = env.org("TEAM-A1", Some(&dept)).await;

    let vicar = env.role("Vicar", 60).await;
    let sacristan = env.role("Sacristan", 10).await;
    env.assign(&parish_a, &vicar, true).await;
    env.assign(&parish_b, &vicar, true).await;
    env.assign(&parish_a, &sacristan, true).await;

    let before = env.state.role_service.get_effective_roles(team.id).await.unwrap();
    assert_eq!(role_source(&before, "Vicar"), Some(Some(parish_a.id)));
    assert_eq!(role_source(&before, "Sacristan"), Some(Some(parish_a.id)));

    let result = env
        .state
        .organization_service
        .move_subtree(dept.id, Some(parish_b.id), 3)
        .await
        .unwrap();
    assert_eq!(result.moved.len(), 2);
    assert!(result.assignments_changed > 0);

    let moved = env.state.organization_service.get_organization(dept.id).await.unwrap();
    assert_eq!(moved.parent_id, Some(parish_b.id));
    assert_eq!(moved.level, 3);

    let after = env.state.role_service.get_effective_roles(team.id).await.unwrap();
    assert_eq!(role_source(&after, "Vicar"), Some(Some(parish_b.id)));
    assert_eq!(role_source(&after, "Sacristan"), None);
}

#[tokio::test]
async fn test_move_rejects_cycles_and_depth_overflow_atomically() {
    let env = TestEnv::new();
    let diocese = env.org("DIOCESE", None).await;
    let parish_a = env.org("PARISH-A", Some(&diocese)).await;
    let parish_b = env.org("PARISH-B", Some(&diocese)).await;
    let dept_a = env.org("DEPT-A1", Some(&parish_a)).await;
    let team = env.org("TEAM-A1", Some(&dept_a)).await;
    let dept_b = env.org("DEPT-B1", Some(&parish_b)).await;

    let service = &env.state.organization_service;

    // 移到自己的后代下面
    let err = service.move_subtree(parish_a.id, Some(team.id), 5).await.unwrap_err();
    assert!(matches!(err, AppError::StructuralViolation(_)));

    // TEAM-A1 会落到第 5 层
    let err = service.move_subtree(dept_a.id, Some(dept_b.id), 4).await.unwrap_err();
    assert!(matches!(err, AppError::StructuralViolation(_)));

    // 层级与新上级不一致
    let err = service.move_subtree(dept_a.id, Some(parish_b.id), 4).await.unwrap_err();
    assert!(matches!(err, AppError::StructuralViolation(_)));

    // 全部失败，树保持原样
    let dept_a = service.get_organization(dept_a.id).await.unwrap();
    let team = service.get_organization(team.id).await.unwrap();
    assert_eq!(dept_a.parent_id, Some(parish_a.id));
    assert_eq!(dept_a.level, 3);
    assert_eq!(team.level, 4);
}

#[tokio::test]
async fn test_promote_to_root_drops_ancestor_roles() {
    let env = TestEnv::new();
    let diocese = env.org("DIOCESE", None).await;
    let parish = env.org("PARISH-B", Some(&diocese)).await;
    let dept = env.org("DEPT-B1", Some(&parish)).await;

    let bishop = env.role("Bishop", 100).await;
    env.assign(&diocese, &bishop, true).await;

    let result = env.state.organization_service.promote_to_root(parish.id).await.unwrap();
    assert_eq!(result.moved.len(), 2);

    let parish = env.state.organization_service.get_organization(parish.id).await.unwrap();
    let dept = env.state.organization_service.get_organization(dept.id).await.unwrap();
    assert_eq!(parish.level, 1);
    assert!(parish.parent_id.is_none());
    assert_eq!(dept.level, 2);

    let roles = env.state.role_service.get_effective_roles(dept.id).await.unwrap();
    assert_eq!(role_source(&roles, "Bishop"), None);

    // 已经是根：无变化
    let noop = env.state.organization_service.promote_to_root(parish.id).await.unwrap();
    assert!(noop.moved.is_empty());
}

#[tokio::test]
async fn test_deactivate_requires_no_active_children() {
    let env = TestEnv::new();
    let diocese = env.org("DIOCESE", None).await;
    let parish = env.org("PARISH-A", Some(&diocese)).await;

    let err = env
        .state
        .organization_service
        .deactivate_organization(diocese.id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::StructuralViolation(_)));

    let parish = env
        .state
        .organization_service
        .deactivate_organization(parish.id)
        .await
        .unwrap();
    assert!(!parish.is_active);

    // 停用的组织不能再作为上级
    let err = env
        .state
        .organization_service
        .create_organization(CreateOrganizationRequest {
            tenant_id: env.tenant_id,
            code: "DEPT-X".to_string(),
            name: "Dept".to_string(),
            parent_id: Some(parish.id),
            sort_order: 0,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::StructuralViolation(_)));

    env.state
        .organization_service
        .deactivate_organization(diocese.id)
        .await
        .unwrap();
}
