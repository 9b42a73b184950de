//! 统一错误模型
//! 定义审批引擎的所有错误类型和错误响应格式

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// 结果类型别名
pub type Result<T> = std::result::Result<T, AppError>;

/// 应用错误类型
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// 组织树不变量将被破坏，整个操作被拒绝
    #[error("Structural violation: {0}")]
    StructuralViolation(String),

    /// 没有匹配的审批矩阵（配置缺口）
    #[error("No applicable approval matrix for category {category} and amount {amount}")]
    NoApplicableMatrix { category: String, amount: i64 },

    /// 必需角色在目标组织没有持有人
    #[error("Unresolved approver: {0}")]
    UnresolvedApprover(String),

    #[error("Step {step_id} already decided ({status})")]
    StepAlreadyDecided { step_id: Uuid, status: String },

    #[error("Flow {flow_id} already terminal ({status})")]
    FlowAlreadyTerminal { flow_id: Uuid, status: String },

    #[error("Approver {user_id} is not eligible for step {step_id}")]
    NotEligibleApprover { step_id: Uuid, user_id: Uuid },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    /// 获取 HTTP 状态码
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotEligibleApprover { .. } => StatusCode::FORBIDDEN,
            AppError::Conflict(_)
            | AppError::StepAlreadyDecided { .. }
            | AppError::FlowAlreadyTerminal { .. } => StatusCode::CONFLICT,
            AppError::StructuralViolation(_)
            | AppError::NoApplicableMatrix { .. }
            | AppError::UnresolvedApprover(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Timeout(_) => StatusCode::GONE,
            AppError::Database(_) | AppError::Config(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// 获取用户友好的错误消息（不包含敏感信息）
    pub fn user_message(&self) -> String {
        match self {
            AppError::NotFound(msg) => format!("Resource not found: {}", msg),
            AppError::Database(_) => "Database error occurred".to_string(),
            AppError::Config(_) => "Configuration error".to_string(),
            AppError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }

    /// 获取错误码
    pub fn code(&self) -> u16 {
        self.status_code().as_u16()
    }

    /// 并发竞争失败方，调用方应刷新状态后重试
    pub fn is_conflict(&self) -> bool {
        self.status_code() == StatusCode::CONFLICT
    }

    // 便捷方法
    pub fn not_found(msg: &str) -> Self {
        AppError::NotFound(msg.to_string())
    }

    pub fn validation(msg: &str) -> Self {
        AppError::Validation(msg.to_string())
    }

    pub fn conflict(msg: &str) -> Self {
        AppError::Conflict(msg.to_string())
    }

    pub fn structural(msg: impl Into<String>) -> Self {
        AppError::StructuralViolation(msg.into())
    }

    pub fn database(msg: &str) -> Self {
        AppError::Internal(format!("Database error: {}", msg))
    }

    pub fn internal_error(msg: &str) -> Self {
        AppError::Internal(msg.to_string())
    }
}

/// 错误响应 DTO
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: u16,
    pub message: String,
    pub request_id: String,
}

impl ErrorResponse {
    pub fn from_error(error: &AppError) -> Self {
        ErrorResponse {
            error: ErrorDetail {
                code: error.code(),
                message: error.user_message(),
                request_id: Uuid::new_v4().to_string(),
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_response = ErrorResponse::from_error(&self);

        // 业务拒绝只记 warn，基础设施故障记 error
        if status.is_server_error() {
            tracing::error!(
                code = self.code(),
                message = %self,
                request_id = %error_response.error.request_id,
                "Application error"
            );
        } else {
            tracing::warn!(
                code = self.code(),
                message = %self,
                request_id = %error_response.error.request_id,
                "Request rejected"
            );
        }

        (status, Json(error_response)).into_response()
    }
}

/// 从 config::ConfigError 转换
impl From<config::ConfigError> for AppError {
    fn from(e: config::ConfigError) -> Self {
        AppError::Config(e.to_string())
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(e: validator::ValidationErrors) -> Self {
        AppError::Validation(e.to_string())
    }
}
