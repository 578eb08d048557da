//! 统一错误处理模型
//!
//! 提供 stepup 主程序的顶层错误类型，聚合子 crate 和依赖 crate 的错误

use thiserror::Error;

/// 主应用的统一错误枚举
#[derive(Debug, Error)]
pub enum Error {
    /// Base crate 聚合错误（配置、授权核心、IO）
    #[error("Base library error: {0}")]
    Base(Box<stepup_common::BaseError>),

    /// I/O 操作错误
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// 序列化/反序列化错误
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// 后台任务异常退出
    #[error("Task error: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// 指标注册或导出错误
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// 服务启动失败
    #[error("Service startup failed: {message}")]
    ServiceStartup { message: String },

    /// 服务配置验证失败
    #[error("Service configuration validation failed: {message}")]
    ServiceValidation { message: String },

    /// Anyhow 错误兼容层
    #[error("{0:#}")]
    Anyhow(#[from] anyhow::Error),

    /// 自定义错误消息
    #[error("Application error: {message}")]
    Custom { message: String },
}

impl From<stepup_common::BaseError> for Error {
    fn from(err: stepup_common::BaseError) -> Self {
        Error::Base(Box::new(err))
    }
}

impl From<stepup_common::ConfigError> for Error {
    fn from(err: stepup_common::ConfigError) -> Self {
        stepup_common::BaseError::from(err).into()
    }
}

impl From<stepup_authz::AuthzError> for Error {
    fn from(err: stepup_authz::AuthzError) -> Self {
        stepup_common::BaseError::from(err).into()
    }
}

/// 统一的 Result 类型
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// 创建自定义错误
    pub fn custom(message: impl Into<String>) -> Self {
        Self::Custom {
            message: message.into(),
        }
    }

    /// 创建服务启动失败错误
    pub fn service_startup(message: impl Into<String>) -> Self {
        Self::ServiceStartup {
            message: message.into(),
        }
    }

    /// 创建服务配置验证失败错误
    pub fn service_validation(message: impl Into<String>) -> Self {
        Self::ServiceValidation {
            message: message.into(),
        }
    }
}
