//! 授权核心数据类型定义

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 存储中的签名载荷记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignablePayloadRecord {
    /// 载荷 ID（UUID v4）
    pub id: String,
    /// 所属用户，`None` 表示匿名载荷，永远不能被消费
    pub owner_user_id: Option<String>,
    /// 序列化后的载荷内容
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
    /// 消费时间，只会从 `None` 变为 `Some` 一次
    pub consumed_at: Option<DateTime<Utc>>,
}

/// 创建载荷的返回值
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedPayload {
    pub payload_id: String,
    /// 客户端需要签名的规范化 JSON 文本
    pub serialized_payload: String,
}

/// OTP 投递渠道
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OtpChannel {
    Sms,
    Call,
    Email,
}

impl OtpChannel {
    pub fn as_str(self) -> &'static str {
        match self {
            OtpChannel::Sms => "SMS",
            OtpChannel::Call => "CALL",
            OtpChannel::Email => "EMAIL",
        }
    }
}

impl fmt::Display for OtpChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OtpChannel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SMS" => Ok(OtpChannel::Sms),
            "CALL" => Ok(OtpChannel::Call),
            "EMAIL" => Ok(OtpChannel::Email),
            other => Err(format!("Unknown OTP channel: {other}")),
        }
    }
}

/// OTP 挑战状态
///
/// `Expired` 是惰性落库的派生状态，不保证被及时清扫
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OtpStatus {
    Sent,
    Verified,
    Expired,
}

impl OtpStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OtpStatus::Sent => "SENT",
            OtpStatus::Verified => "VERIFIED",
            OtpStatus::Expired => "EXPIRED",
        }
    }
}

impl fmt::Display for OtpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OtpStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SENT" => Ok(OtpStatus::Sent),
            "VERIFIED" => Ok(OtpStatus::Verified),
            "EXPIRED" => Ok(OtpStatus::Expired),
            other => Err(format!("Unknown OTP status: {other}")),
        }
    }
}

/// 存储中的 OTP 挑战记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtpChallengeRecord {
    pub id: String,
    pub code: String,
    pub channel: OtpChannel,
    /// 签发时绑定的逻辑路由
    pub api_path: String,
    pub owner_user_id: String,
    /// 投递地址（明文存储，返回给客户端前必须脱敏）
    pub contact: String,
    pub status: OtpStatus,
    pub created_at: DateTime<Utc>,
    /// 主有效期（毫秒），签发时按渠道配置确定
    pub expiry_ms: i64,
    /// verify 成功的时间
    pub used_at: Option<DateTime<Utc>>,
    /// spend 成功的时间
    pub challenge_expired_at: Option<DateTime<Utc>>,
}

impl OtpChallengeRecord {
    /// `now - created_at > expiry` 时过期，恰好等于有效期仍然有效
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.created_at) > Duration::milliseconds(self.expiry_ms)
    }
}

/// 签发 OTP 的返回值
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuedOtp {
    pub otp_id: String,
    pub expiry_duration_ms: i64,
    pub masked_contact: String,
}

/// 冷却锁授予凭据
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CooldownGrant {
    pub lock_key: String,
    pub expires_at: DateTime<Utc>,
}

/// 存储统计信息
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageStats {
    pub payloads_total: u64,
    pub payloads_consumed: u64,
    pub otp_sent: u64,
    pub otp_verified: u64,
    pub otp_expired: u64,
    /// 尚未释放的冷却锁（含已到期未清理的）
    pub cooldown_locks: u64,
}

/// 毫秒时间戳转换，存储后端统一使用 Unix 毫秒
pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn challenge(created_at: DateTime<Utc>, expiry_ms: i64) -> OtpChallengeRecord {
        OtpChallengeRecord {
            id: "otp-1".into(),
            code: "123456".into(),
            channel: OtpChannel::Sms,
            api_path: "/cards/pin".into(),
            owner_user_id: "user-1".into(),
            contact: "+15555550100".into(),
            status: OtpStatus::Sent,
            created_at,
            expiry_ms,
            used_at: None,
            challenge_expired_at: None,
        }
    }

    #[test]
    fn test_expiry_boundary_is_inclusive() {
        let created = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let otp = challenge(created, 60_000);

        assert!(!otp.is_expired_at(created + Duration::seconds(60)));
        assert!(otp.is_expired_at(created + Duration::milliseconds(60_001)));
    }

    #[test]
    fn test_channel_and_status_round_trip_strings() {
        for channel in [OtpChannel::Sms, OtpChannel::Call, OtpChannel::Email] {
            assert_eq!(channel.as_str().parse::<OtpChannel>().unwrap(), channel);
        }
        assert_eq!("VERIFIED".parse::<OtpStatus>().unwrap(), OtpStatus::Verified);
        assert!("verified".parse::<OtpStatus>().is_err());
    }

    #[test]
    fn test_channel_serde_uses_uppercase() {
        let json = serde_json::to_string(&OtpChannel::Email).unwrap();
        assert_eq!(json, "\"EMAIL\"");
    }

    #[test]
    fn test_millis_conversion_keeps_millisecond_precision() {
        let at = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        assert_eq!(from_millis(to_millis(at)), at);
    }
}
