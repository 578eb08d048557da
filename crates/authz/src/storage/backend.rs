//! 存储后端抽象接口
//!
//! 定义了所有存储后端必须实现的统一异步接口。
//!
//! 所有状态迁移都是单条条件更新（`UPDATE ... WHERE id = ? AND <前置条件>`），
//! 返回受影响的行数。调用方以行数为 0 判定并发竞争失败，
//! 不允许在应用层做"先读后写"的两步迁移。

use crate::error::AuthzResult;
use crate::types::{OtpChallengeRecord, SignablePayloadRecord, StorageStats};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// 签名载荷存储接口
#[async_trait]
pub trait PayloadRepository: Send + Sync {
    /// 插入新载荷，id 冲突时返回错误
    async fn insert_payload(&self, record: &SignablePayloadRecord) -> AuthzResult<()>;

    /// 按 id 查询载荷
    ///
    /// # Returns
    /// * `Ok(Some(record))` - 找到记录
    /// * `Ok(None)` - 记录不存在
    async fn find_payload(&self, id: &str) -> AuthzResult<Option<SignablePayloadRecord>>;

    /// 仅当 `consumed_at IS NULL` 时写入消费时间
    ///
    /// # Returns
    /// 受影响行数（0 或 1）
    async fn mark_payload_consumed(&self, id: &str, consumed_at: DateTime<Utc>)
    -> AuthzResult<u64>;
}

/// OTP 挑战存储接口
#[async_trait]
pub trait OtpRepository: Send + Sync {
    async fn insert_otp(&self, record: &OtpChallengeRecord) -> AuthzResult<()>;

    async fn find_otp(&self, id: &str) -> AuthzResult<Option<OtpChallengeRecord>>;

    /// 仅当 `status = SENT` 时置为 VERIFIED 并写入 `used_at`
    async fn mark_otp_verified(&self, id: &str, used_at: DateTime<Utc>) -> AuthzResult<u64>;

    /// 仅当 `status = SENT` 时置为 EXPIRED
    async fn mark_otp_expired(&self, id: &str) -> AuthzResult<u64>;

    /// 仅当 `status = VERIFIED` 且 `challenge_expired_at IS NULL` 时写入 spend 时间
    async fn mark_otp_spent(&self, id: &str, spent_at: DateTime<Utc>) -> AuthzResult<u64>;
}

/// 冷却锁存储接口
#[async_trait]
pub trait CooldownRepository: Send + Sync {
    /// 查询当前锁到期时间，锁不存在或已释放时返回 `None`
    async fn find_cooldown(&self, lock_key: &str) -> AuthzResult<Option<DateTime<Utc>>>;

    /// 单条条件 upsert：锁不存在、为空或 `<= now` 时写入新的到期时间
    ///
    /// # Returns
    /// 受影响行数，0 表示锁仍被占用
    async fn claim_cooldown(
        &self,
        lock_key: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> AuthzResult<u64>;

    /// 仅当到期时间仍是 `expires_at`（即本次授予）时删除锁
    async fn release_cooldown(&self, lock_key: &str, expires_at: DateTime<Utc>)
    -> AuthzResult<u64>;
}

/// 维护接口：清理、惰性过期落库与统计
#[async_trait]
pub trait MaintenanceRepository: Send + Sync {
    /// 删除 `created_at < created_before` 的载荷
    async fn purge_payloads(&self, created_before: DateTime<Utc>) -> AuthzResult<u64>;

    /// 把主有效期已过的 SENT 挑战标记为 EXPIRED
    async fn expire_stale_otps(&self, now: DateTime<Utc>) -> AuthzResult<u64>;

    /// 删除 `lock_expires_at` 为空或 `<= now` 的冷却锁
    async fn purge_cooldowns(&self, now: DateTime<Utc>) -> AuthzResult<u64>;

    async fn stats(&self) -> AuthzResult<StorageStats>;
}
