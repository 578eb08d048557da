//! 授权核心配置
//!
//! 载荷 TTL 与 OTP 有效期分开配置。

use crate::error::{AuthzError, AuthzResult};
use crate::storage::StorageConfig;
use crate::types::OtpChannel;
use chrono::Duration;
use serde::{Deserialize, Serialize};

/// 签名载荷默认 TTL（秒）
pub const DEFAULT_PAYLOAD_TTL_SECS: u64 = 180;

/// 签名载荷 TTL 上限（秒）
pub const MAX_PAYLOAD_TTL_SECS: u64 = 86_400;

/// 过期载荷保留期上限（秒）
pub const MAX_RETENTION_GRACE_SECS: u64 = 30 * 86_400;

/// 授权核心配置
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct AuthzConfig {
    /// 存储配置
    #[serde(default)]
    pub storage: StorageConfig,

    /// 签名载荷配置
    #[serde(default)]
    pub payload: PayloadConfig,

    /// OTP 配置
    #[serde(default)]
    pub otp: OtpConfig,
}

/// 签名载荷配置
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PayloadConfig {
    /// 载荷可被消费的最长时间（秒）
    #[serde(default = "default_payload_ttl_secs")]
    pub ttl_secs: u64,

    /// 过期后保留多久才允许清理（秒）
    #[serde(default = "default_retention_grace_secs")]
    pub retention_grace_secs: u64,
}

impl Default for PayloadConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_payload_ttl_secs(),
            retention_grace_secs: default_retention_grace_secs(),
        }
    }
}

/// OTP 配置
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OtpConfig {
    /// 默认验证码位数
    #[serde(default = "default_digits")]
    pub digits: u8,

    /// 短信验证码有效期（毫秒）
    #[serde(default = "default_phone_expiry_ms")]
    pub sms_expiry_ms: u64,

    /// 语音验证码有效期（毫秒）
    #[serde(default = "default_phone_expiry_ms")]
    pub call_expiry_ms: u64,

    /// 邮件验证码有效期（毫秒）
    #[serde(default = "default_email_expiry_ms")]
    pub email_expiry_ms: u64,
}

impl Default for OtpConfig {
    fn default() -> Self {
        Self {
            digits: default_digits(),
            sms_expiry_ms: default_phone_expiry_ms(),
            call_expiry_ms: default_phone_expiry_ms(),
            email_expiry_ms: default_email_expiry_ms(),
        }
    }
}

impl PayloadConfig {
    /// 载荷可消费窗口
    pub fn ttl(&self) -> AuthzResult<Duration> {
        bounded_seconds("authz.payload.ttl_secs", self.ttl_secs, MAX_PAYLOAD_TTL_SECS)
    }

    /// 过期后的保留期
    pub fn retention_grace(&self) -> AuthzResult<Duration> {
        bounded_seconds(
            "authz.payload.retention_grace_secs",
            self.retention_grace_secs,
            MAX_RETENTION_GRACE_SECS,
        )
    }
}

fn bounded_seconds(field: &str, secs: u64, max: u64) -> AuthzResult<Duration> {
    if secs > max {
        return Err(AuthzError::Config(format!(
            "{field} = {secs} exceeds the maximum of {max}"
        )));
    }
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .ok_or_else(|| AuthzError::Config(format!("{field} = {secs} is out of range")))
}

impl OtpConfig {
    pub const MIN_DIGITS: u8 = 4;
    pub const MAX_DIGITS: u8 = 10;

    /// 指定渠道的主有效期
    pub fn expiry_ms(&self, channel: OtpChannel) -> u64 {
        match channel {
            OtpChannel::Sms => self.sms_expiry_ms,
            OtpChannel::Call => self.call_expiry_ms,
            OtpChannel::Email => self.email_expiry_ms,
        }
    }
}

fn default_payload_ttl_secs() -> u64 {
    DEFAULT_PAYLOAD_TTL_SECS
}

fn default_retention_grace_secs() -> u64 {
    86_400
}

fn default_digits() -> u8 {
    6
}

fn default_phone_expiry_ms() -> u64 {
    300_000
}

fn default_email_expiry_ms() -> u64 {
    900_000
}

impl AuthzConfig {
    /// 验证配置有效性
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.payload.ttl_secs == 0 {
            errors.push("authz.payload.ttl_secs must be greater than 0".to_string());
        }
        if self.payload.ttl_secs > MAX_PAYLOAD_TTL_SECS {
            errors.push(format!(
                "authz.payload.ttl_secs must be at most {MAX_PAYLOAD_TTL_SECS}"
            ));
        } else if self.payload.ttl_secs != DEFAULT_PAYLOAD_TTL_SECS {
            errors.push(format!(
                "Warning: authz.payload.ttl_secs = {} differs from the standard {}s signing window",
                self.payload.ttl_secs, DEFAULT_PAYLOAD_TTL_SECS
            ));
        }

        if self.payload.retention_grace_secs > MAX_RETENTION_GRACE_SECS {
            errors.push(format!(
                "authz.payload.retention_grace_secs must be at most {MAX_RETENTION_GRACE_SECS}"
            ));
        }

        if !(OtpConfig::MIN_DIGITS..=OtpConfig::MAX_DIGITS).contains(&self.otp.digits) {
            errors.push(format!(
                "Invalid authz.otp.digits {}, must be between {} and {}",
                self.otp.digits,
                OtpConfig::MIN_DIGITS,
                OtpConfig::MAX_DIGITS
            ));
        }

        for channel in [OtpChannel::Sms, OtpChannel::Call, OtpChannel::Email] {
            if self.otp.expiry_ms(channel) == 0 {
                errors.push(format!(
                    "authz.otp expiry for {channel} must be greater than 0"
                ));
            }
        }

        match self.storage.backend {
            crate::storage::StorageBackend::Sqlite | crate::storage::StorageBackend::Memory => {}
            crate::storage::StorageBackend::Postgres => {
                if self.storage.postgres.is_none() {
                    errors.push(
                        "authz is configured to use PostgreSQL but postgres config is missing"
                            .to_string(),
                    );
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
