//! 顶层错误枚举
//!
//! 聚合配置、授权核心与 I/O 错误，提供统一的错误处理接口

use super::ConfigError;
use stepup_authz::AuthzError;
use thiserror::Error;

/// 顶层错误枚举
#[derive(Error, Debug)]
pub enum BaseError {
    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// 授权核心错误
    #[error("Authz error: {0}")]
    Authz(#[from] AuthzError),

    /// IO 错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 通用错误（用于不适合其他类别的错误）
    #[error("General error: {message}")]
    General { message: String },

    /// 内部错误（通常表示编程错误）
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl BaseError {
    /// 创建通用错误
    pub fn general(message: impl Into<String>) -> Self {
        Self::General {
            message: message.into(),
        }
    }

    /// 创建内部错误
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// 统一的 Result 类型
pub type Result<T> = std::result::Result<T, BaseError>;
