//! 配置系统
//! 从环境变量加载所有配置，使用 Secret 包装敏感信息

use config::{Config, ConfigError, Environment};
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// 监听地址，例如 "0.0.0.0:3000"
    pub addr: String,
    /// 优雅关闭超时时间（秒）
    pub graceful_shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// 数据库连接 URL（使用 Secret 包装，防止日志泄露）
    pub url: Secret<String>,
    /// 最大连接数
    pub max_connections: u32,
    /// 最小连接数
    pub min_connections: u32,
    /// 获取连接超时时间（秒）
    pub acquire_timeout_secs: u64,
    /// 空闲连接超时时间（秒）
    pub idle_timeout_secs: u64,
    /// 连接最大生命周期（秒）
    pub max_lifetime_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别: trace, debug, info, warn, error
    pub level: String,
    /// 日志格式: json, pretty
    pub format: String,
}

/// 存储后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// 组织树最大层级（根为 1）
    pub max_organization_level: i32,
    /// 超时巡检间隔（秒），0 表示只做惰性检查
    pub timeout_sweep_interval_secs: u64,
    /// 单个步骤最多升级次数
    pub max_escalations: i32,
    /// 审批决策乐观并发冲突的最大重试次数
    pub decision_retry_limit: u32,
    /// 事件总线容量
    pub event_bus_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_organization_level: 4,
            timeout_sweep_interval_secs: 300,
            max_escalations: 3,
            decision_retry_limit: 3,
            event_bus_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub storage: StorageConfig,
    pub engine: EngineConfig,
}

impl AppConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = EngineConfig::default();
        let mut settings = Config::builder();

        // 添加默认配置
        settings = settings
            .set_default("server.addr", "0.0.0.0:3000")?
            .set_default("server.graceful_shutdown_timeout_secs", 30)?
            .set_default("database.url", "")?
            .set_default("database.max_connections", 10)?
            .set_default("database.min_connections", 2)?
            .set_default("database.acquire_timeout_secs", 30)?
            .set_default("database.idle_timeout_secs", 600)?
            .set_default("database.max_lifetime_secs", 1800)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "json")?
            .set_default("storage.backend", "postgres")?
            .set_default("engine.max_organization_level", defaults.max_organization_level as i64)?
            .set_default(
                "engine.timeout_sweep_interval_secs",
                defaults.timeout_sweep_interval_secs,
            )?
            .set_default("engine.max_escalations", defaults.max_escalations as i64)?
            .set_default("engine.decision_retry_limit", defaults.decision_retry_limit as i64)?
            .set_default("engine.event_bus_capacity", defaults.event_bus_capacity as u64)?;

        // 从环境变量加载配置（前缀为 APPROVAL_）
        settings = settings.add_source(
            Environment::with_prefix("APPROVAL")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = settings.build()?.try_deserialize()?;

        // 验证配置
        config.validate()?;

        Ok(config)
    }

    /// 验证配置合法性
    pub fn validate(&self) -> Result<(), ConfigError> {
        // 验证端口范围
        if let Some(port_str) = self.server.addr.split(':').next_back() {
            if let Ok(port) = port_str.parse::<u16>() {
                if port != 0 && port < 1024 {
                    return Err(ConfigError::Message("Server port should be >= 1024".to_string()));
                }
            }
        }

        // 验证日志级别
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(ConfigError::Message(format!(
                    "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                    self.logging.level
                )))
            }
        }

        // 验证日志格式
        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" => {}
            _ => {
                return Err(ConfigError::Message(format!(
                    "Invalid log format: {}. Must be one of: json, pretty",
                    self.logging.format
                )))
            }
        }

        if self.storage.backend == StorageBackend::Postgres {
            if self.database.url.expose_secret().is_empty() {
                return Err(ConfigError::Message(
                    "database.url is required for the postgres backend".to_string(),
                ));
            }

            // 验证数据库连接池配置
            if self.database.max_connections < self.database.min_connections {
                return Err(ConfigError::Message(
                    "max_connections must be >= min_connections".to_string(),
                ));
            }
        }

        if self.engine.max_organization_level < 1 {
            return Err(ConfigError::Message(
                "engine.max_organization_level must be >= 1".to_string(),
            ));
        }

        if self.engine.max_escalations < 0 {
            return Err(ConfigError::Message("engine.max_escalations must be >= 0".to_string()));
        }

        if self.engine.decision_retry_limit == 0 {
            return Err(ConfigError::Message(
                "engine.decision_retry_limit must be >= 1".to_string(),
            ));
        }

        if self.engine.event_bus_capacity == 0 {
            return Err(ConfigError::Message(
                "engine.event_bus_capacity must be >= 1".to_string(),
            ));
        }

        Ok(())
    }
}
