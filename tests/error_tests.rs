//! 错误处理单元测试
//!
//! 测试应用错误类型的状态码、用户消息与响应体

use axum::http::StatusCode;
use axum::response::IntoResponse;
use approval_engine::error::{AppError, ErrorResponse};
use http_body_util::BodyExt;
use uuid::Uuid;

// ==================== 错误状态码测试 ====================

#[test]
fn test_error_status_codes() {
    assert_eq!(AppError::NotFound("flow".to_string()).status_code(), StatusCode::NOT_FOUND);
    assert_eq!(AppError::Validation("amount".to_string()).status_code(), StatusCode::BAD_REQUEST);
    assert_eq!(
        AppError::NotEligibleApprover { step_id: Uuid::nil(), user_id: Uuid::nil() }.status_code(),
        StatusCode::FORBIDDEN
    );
    assert_eq!(AppError::conflict("duplicate").status_code(), StatusCode::CONFLICT);
    assert_eq!(
        AppError::FlowAlreadyTerminal { flow_id: Uuid::nil(), status: "approved".to_string() }
            .status_code(),
        StatusCode::CONFLICT
    );
    assert_eq!(
        AppError::UnresolvedApprover("Treasurer".to_string()).status_code(),
        StatusCode::UNPROCESSABLE_ENTITY
    );
    assert_eq!(AppError::Timeout("step".to_string()).status_code(), StatusCode::GONE);
}

#[test]
fn test_server_error_status_codes() {
    assert_eq!(
        AppError::Database(sqlx::Error::RowNotFound).status_code(),
        StatusCode::INTERNAL_SERVER_ERROR
    );
    assert_eq!(
        AppError::Config("Invalid config".to_string()).status_code(),
        StatusCode::INTERNAL_SERVER_ERROR
    );
    assert_eq!(
        AppError::internal_error("boom").status_code(),
        StatusCode::INTERNAL_SERVER_ERROR
    );
}

// ==================== 冲突判定 ====================

#[test]
fn test_conflict_family() {
    assert!(AppError::conflict("x").is_conflict());
    assert!(AppError::StepAlreadyDecided { step_id: Uuid::nil(), status: "rejected".to_string() }
        .is_conflict());
    assert!(!AppError::Timeout("step".to_string()).is_conflict());
    assert!(!AppError::not_found("flow").is_conflict());
}

// ==================== 用户消息测试 ====================

#[test]
fn test_user_messages_no_sensitive_info() {
    // 数据库错误不应该暴露技术细节
    let message = AppError::Database(sqlx::Error::RowNotFound).user_message();
    assert_eq!(message, "Database error occurred");
    assert!(!message.to_lowercase().contains("sqlx"));

    let message = AppError::Config("database.url missing".to_string()).user_message();
    assert_eq!(message, "Configuration error");
    assert!(!message.contains("database.url"));

    assert_eq!(AppError::internal_error("lock poisoned").user_message(), "Internal server error");
}

#[test]
fn test_user_messages_for_business_errors() {
    assert_eq!(
        AppError::not_found("Approval flow not found").user_message(),
        "Resource not found: Approval flow not found"
    );
    assert_eq!(
        AppError::NoApplicableMatrix { category: "equipment".to_string(), amount: 42 }
            .user_message(),
        "No applicable approval matrix for category equipment and amount 42"
    );
    assert_eq!(
        AppError::structural("cycle").user_message(),
        "Structural violation: cycle"
    );
}

// ==================== 响应体测试 ====================

#[test]
fn test_error_response_shape() {
    let response = ErrorResponse::from_error(&AppError::validation("amount must not be negative"));
    let json = serde_json::to_value(&response).unwrap();

    assert_eq!(json["error"]["code"], 400);
    assert_eq!(json["error"]["message"], "Validation error: amount must not be negative");
    assert!(Uuid::parse_str(json["error"]["request_id"].as_str().unwrap()).is_ok());
}

#[tokio::test]
async fn test_into_response() {
    let response = AppError::Timeout("step expired".to_string()).into_response();
    assert_eq!(response.status(), StatusCode::GONE);

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(json["error"]["code"], 410);
}

// ==================== 转换测试 ====================

#[test]
fn test_from_config_error() {
    let err: AppError = config::ConfigError::Message("bad".to_string()).into();
    assert!(matches!(err, AppError::Config(_)));
}
