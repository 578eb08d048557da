//! Step-up 授权核心错误定义
//!
//! 对外只暴露一个封闭的错误分类（[`ErrorKind`]），调用方按 kind 分支，
//! 而不是按具体类型做断言。OTP 的具体拒绝原因只在内部携带和记录日志，
//! 不会出现在 `Display` 文本中。

use chrono::{DateTime, Utc};
use serde_json::error::Category;
use thiserror::Error;

/// 封闭的错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    PayloadNotFound,
    PayloadAlreadyConsumed,
    PayloadExpired,
    PayloadMarshalFailed,
    InvalidOtp,
    OtpExpired,
    LockConflict,
    /// 存储后端故障
    Storage,
    /// 配置或调用参数错误
    Config,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::PayloadNotFound => "payload_not_found",
            ErrorKind::PayloadAlreadyConsumed => "payload_already_consumed",
            ErrorKind::PayloadExpired => "payload_expired",
            ErrorKind::PayloadMarshalFailed => "payload_marshal_failed",
            ErrorKind::InvalidOtp => "invalid_otp",
            ErrorKind::OtpExpired => "otp_expired",
            ErrorKind::LockConflict => "lock_conflict",
            ErrorKind::Storage => "storage",
            ErrorKind::Config => "config",
        }
    }

    /// 是否属于用户可见（4xx 类）错误
    pub fn is_user_facing(self) -> bool {
        !matches!(
            self,
            ErrorKind::PayloadMarshalFailed | ErrorKind::Storage | ErrorKind::Config
        )
    }

    /// HTTP 等价状态码，供外层 handler 使用
    pub fn status_code(self) -> u16 {
        match self {
            ErrorKind::PayloadNotFound => 404,
            ErrorKind::PayloadAlreadyConsumed => 409,
            ErrorKind::PayloadExpired => 410,
            ErrorKind::InvalidOtp | ErrorKind::OtpExpired => 401,
            ErrorKind::LockConflict => 409,
            ErrorKind::PayloadMarshalFailed | ErrorKind::Storage | ErrorKind::Config => 500,
        }
    }
}

/// OTP 被拒绝的内部原因，仅用于日志与指标
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtpRejection {
    /// 记录不存在
    NotFound,
    /// 记录属于其他用户
    OwnerMismatch,
    /// 状态已不是 SENT
    NotPending,
    CodeMismatch,
    /// apiPath 与签发时不一致
    RouteMismatch,
    /// spend 时尚未 verify
    NotVerified,
    /// 条件更新未命中（并发竞争失败）
    LostRace,
}

impl OtpRejection {
    pub fn as_str(self) -> &'static str {
        match self {
            OtpRejection::NotFound => "not_found",
            OtpRejection::OwnerMismatch => "owner_mismatch",
            OtpRejection::NotPending => "not_pending",
            OtpRejection::CodeMismatch => "code_mismatch",
            OtpRejection::RouteMismatch => "route_mismatch",
            OtpRejection::NotVerified => "not_verified",
            OtpRejection::LostRace => "lost_race",
        }
    }
}

/// 授权核心错误类型
#[derive(Error, Debug)]
pub enum AuthzError {
    /// 载荷不存在或不属于调用者（两者对外不可区分）
    #[error("Payload not found")]
    PayloadNotFound,

    #[error("Payload already consumed")]
    PayloadAlreadyConsumed,

    #[error("Payload expired")]
    PayloadExpired,

    /// 只保留 serde 的错误类别，避免把载荷内容带进错误文本
    #[error("Payload marshal failed: {category:?}")]
    PayloadMarshalFailed { category: Category },

    #[error("Please enter a valid one-time password.")]
    InvalidOtp { reason: OtpRejection },

    #[error("One Time Password is expired.")]
    OtpExpired,

    /// `until` 为已知的锁到期时间
    #[error("Action is temporarily locked")]
    LockConflict { until: Option<DateTime<Utc>> },

    /// 存储层错误
    #[error("Storage error: {0}")]
    Storage(String),

    /// 配置或参数错误
    #[error("Configuration error: {0}")]
    Config(String),
}

impl AuthzError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AuthzError::PayloadNotFound => ErrorKind::PayloadNotFound,
            AuthzError::PayloadAlreadyConsumed => ErrorKind::PayloadAlreadyConsumed,
            AuthzError::PayloadExpired => ErrorKind::PayloadExpired,
            AuthzError::PayloadMarshalFailed { .. } => ErrorKind::PayloadMarshalFailed,
            AuthzError::InvalidOtp { .. } => ErrorKind::InvalidOtp,
            AuthzError::OtpExpired => ErrorKind::OtpExpired,
            AuthzError::LockConflict { .. } => ErrorKind::LockConflict,
            AuthzError::Storage(_) => ErrorKind::Storage,
            AuthzError::Config(_) => ErrorKind::Config,
        }
    }

    pub(crate) fn marshal(err: &serde_json::Error) -> Self {
        AuthzError::PayloadMarshalFailed {
            category: err.classify(),
        }
    }

    /// 面向客户端的文本
    ///
    /// 内部错误一律返回通用文本，不暴露细节
    pub fn public_message(&self) -> String {
        if self.kind().is_user_facing() {
            self.to_string()
        } else {
            tracing::error!("Internal authz error: {:?}", self);
            "Internal server error".to_string()
        }
    }
}

/// 授权核心结果类型别名
pub type AuthzResult<T> = Result<T, AuthzError>;
