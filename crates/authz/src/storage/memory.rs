//! 进程内存储后端
//!
//! 所有条件更新都在同一把互斥锁内完成，语义与 SQL 后端的单条条件 UPDATE 一致。
//! 数据不持久化，只用于开发环境和测试。

use crate::error::{AuthzError, AuthzResult};
use crate::storage::backend::{
    CooldownRepository, MaintenanceRepository, OtpRepository, PayloadRepository,
};
use crate::types::{OtpChallengeRecord, OtpStatus, SignablePayloadRecord, StorageStats};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct MemoryState {
    payloads: HashMap<String, SignablePayloadRecord>,
    otps: HashMap<String, OtpChallengeRecord>,
    cooldowns: HashMap<String, DateTime<Utc>>,
}

/// 内存存储后端
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl PayloadRepository for MemoryBackend {
    async fn insert_payload(&self, record: &SignablePayloadRecord) -> AuthzResult<()> {
        match self.state().payloads.entry(record.id.clone()) {
            Entry::Occupied(_) => Err(AuthzError::Storage(format!(
                "Duplicate payload id: {}",
                record.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(())
            }
        }
    }

    async fn find_payload(&self, id: &str) -> AuthzResult<Option<SignablePayloadRecord>> {
        Ok(self.state().payloads.get(id).cloned())
    }

    async fn mark_payload_consumed(
        &self,
        id: &str,
        consumed_at: DateTime<Utc>,
    ) -> AuthzResult<u64> {
        let mut state = self.state();
        match state.payloads.get_mut(id) {
            Some(record) if record.consumed_at.is_none() => {
                record.consumed_at = Some(consumed_at);
                Ok(1)
            }
            _ => Ok(0),
        }
    }
}

#[async_trait]
impl OtpRepository for MemoryBackend {
    async fn insert_otp(&self, record: &OtpChallengeRecord) -> AuthzResult<()> {
        match self.state().otps.entry(record.id.clone()) {
            Entry::Occupied(_) => Err(AuthzError::Storage(format!(
                "Duplicate OTP id: {}",
                record.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(())
            }
        }
    }

    async fn find_otp(&self, id: &str) -> AuthzResult<Option<OtpChallengeRecord>> {
        Ok(self.state().otps.get(id).cloned())
    }

    async fn mark_otp_verified(&self, id: &str, used_at: DateTime<Utc>) -> AuthzResult<u64> {
        let mut state = self.state();
        match state.otps.get_mut(id) {
            Some(record) if record.status == OtpStatus::Sent => {
                record.status = OtpStatus::Verified;
                record.used_at = Some(used_at);
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn mark_otp_expired(&self, id: &str) -> AuthzResult<u64> {
        let mut state = self.state();
        match state.otps.get_mut(id) {
            Some(record) if record.status == OtpStatus::Sent => {
                record.status = OtpStatus::Expired;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn mark_otp_spent(&self, id: &str, spent_at: DateTime<Utc>) -> AuthzResult<u64> {
        let mut state = self.state();
        match state.otps.get_mut(id) {
            Some(record)
                if record.status == OtpStatus::Verified
                    && record.challenge_expired_at.is_none() =>
            {
                record.challenge_expired_at = Some(spent_at);
                Ok(1)
            }
            _ => Ok(0),
        }
    }
}

#[async_trait]
impl CooldownRepository for MemoryBackend {
    async fn find_cooldown(&self, lock_key: &str) -> AuthzResult<Option<DateTime<Utc>>> {
        Ok(self.state().cooldowns.get(lock_key).copied())
    }

    async fn claim_cooldown(
        &self,
        lock_key: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> AuthzResult<u64> {
        let mut state = self.state();
        match state.cooldowns.get(lock_key).copied() {
            Some(current) if current > now => Ok(0),
            _ => {
                state.cooldowns.insert(lock_key.to_string(), expires_at);
                Ok(1)
            }
        }
    }

    async fn release_cooldown(
        &self,
        lock_key: &str,
        expires_at: DateTime<Utc>,
    ) -> AuthzResult<u64> {
        let mut state = self.state();
        match state.cooldowns.get(lock_key).copied() {
            Some(current) if current == expires_at => {
                state.cooldowns.remove(lock_key);
                Ok(1)
            }
            _ => Ok(0),
        }
    }
}

#[async_trait]
impl MaintenanceRepository for MemoryBackend {
    async fn purge_payloads(&self, created_before: DateTime<Utc>) -> AuthzResult<u64> {
        let mut state = self.state();
        let before = state.payloads.len();
        state
            .payloads
            .retain(|_, record| record.created_at >= created_before);
        Ok((before - state.payloads.len()) as u64)
    }

    async fn expire_stale_otps(&self, now: DateTime<Utc>) -> AuthzResult<u64> {
        let mut state = self.state();
        let mut expired = 0;
        for record in state.otps.values_mut() {
            let deadline = record.created_at + Duration::milliseconds(record.expiry_ms);
            if record.status == OtpStatus::Sent && deadline < now {
                record.status = OtpStatus::Expired;
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn purge_cooldowns(&self, now: DateTime<Utc>) -> AuthzResult<u64> {
        let mut state = self.state();
        let before = state.cooldowns.len();
        state
            .cooldowns
            .retain(|_, expires_at| *expires_at > now);
        Ok((before - state.cooldowns.len()) as u64)
    }

    async fn stats(&self) -> AuthzResult<StorageStats> {
        let state = self.state();
        let count_status =
            |status: OtpStatus| state.otps.values().filter(|o| o.status == status).count() as u64;

        Ok(StorageStats {
            payloads_total: state.payloads.len() as u64,
            payloads_consumed: state
                .payloads
                .values()
                .filter(|p| p.consumed_at.is_some())
                .count() as u64,
            otp_sent: count_status(OtpStatus::Sent),
            otp_verified: count_status(OtpStatus::Verified),
            otp_expired: count_status(OtpStatus::Expired),
            cooldown_locks: state.cooldowns.len() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_payload_id_rejected() {
        let backend = MemoryBackend::new();
        let record = SignablePayloadRecord {
            id: "p-1".into(),
            owner_user_id: Some("u".into()),
            payload: b"{}".to_vec(),
            created_at: t(0),
            consumed_at: None,
        };

        backend.insert_payload(&record).await.unwrap();
        let err = backend.insert_payload(&record).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Storage);
    }

    #[tokio::test]
    async fn test_cooldown_claim_respects_boundary() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.claim_cooldown("k", t(0), t(10)).await.unwrap(), 1);
        assert_eq!(backend.claim_cooldown("k", t(9), t(19)).await.unwrap(), 0);
        assert_eq!(backend.claim_cooldown("k", t(10), t(20)).await.unwrap(), 1);
        assert_eq!(backend.find_cooldown("k").await.unwrap(), Some(t(20)));

        assert_eq!(backend.purge_cooldowns(t(15)).await.unwrap(), 0);
        assert_eq!(backend.purge_cooldowns(t(20)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_released_cooldown_is_not_counted() {
        let backend = MemoryBackend::new();
        backend.claim_cooldown("a", t(0), t(60)).await.unwrap();
        backend.claim_cooldown("b", t(0), t(60)).await.unwrap();
        assert_eq!(backend.stats().await.unwrap().cooldown_locks, 2);

        // 到期时间不符时不释放
        assert_eq!(backend.release_cooldown("a", t(30)).await.unwrap(), 0);
        assert_eq!(backend.release_cooldown("a", t(60)).await.unwrap(), 1);
        assert_eq!(backend.find_cooldown("a").await.unwrap(), None);
        assert_eq!(backend.stats().await.unwrap().cooldown_locks, 1);

        // 释放后立即可以重新获取
        assert_eq!(backend.claim_cooldown("a", t(1), t(61)).await.unwrap(), 1);
    }
}
