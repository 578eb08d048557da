//! 签名载荷存储
//!
//! 服务端生成并持久化一份待签名的操作描述，客户端签名后由真正执行
//! 副作用的业务动作消费一次。消费检查顺序固定：
//!
//! 1. 不存在 / 匿名 / 属于他人 → `PayloadNotFound`（三者对外不可区分）
//! 2. 已消费 → `PayloadAlreadyConsumed`
//! 3. `now - created_at > ttl` → `PayloadExpired`（恰好等于 ttl 仍有效）
//! 4. 条件写入 `consumed_at`，受影响行数为 0 视为被并发消费

use crate::clock::Clock;
use crate::config::PayloadConfig;
use crate::error::{AuthzError, AuthzResult};
use crate::metrics::{PAYLOAD_CONSUME_ATTEMPTS, PAYLOADS_CREATED};
use crate::storage::{MaintenanceRepository, PayloadRepository};
use crate::types::{CreatedPayload, SignablePayloadRecord};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, info, warn};

/// 惰性清理触发间隔：每创建 N 个载荷检查一次
const PURGE_CHECK_INTERVAL: u32 = 100;

/// 签名载荷存储
#[derive(Clone)]
pub struct SignablePayloadStore {
    repo: Arc<dyn PayloadRepository>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    retention_grace: Duration,
    purger: Option<Arc<dyn MaintenanceRepository>>,
    create_counter: Arc<AtomicU32>,
}

impl SignablePayloadStore {
    /// # Errors
    /// ttl 或保留期超出允许范围时返回 `Config`
    pub fn new(
        repo: Arc<dyn PayloadRepository>,
        clock: Arc<dyn Clock>,
        config: &PayloadConfig,
    ) -> AuthzResult<Self> {
        Ok(Self {
            repo,
            clock,
            ttl: config.ttl()?,
            retention_grace: config.retention_grace()?,
            purger: None,
            create_counter: Arc::new(AtomicU32::new(0)),
        })
    }

    /// 启用惰性清理：创建载荷时定期在后台删除超过 ttl + 保留期的旧记录
    pub fn with_lazy_purge(mut self, purger: Arc<dyn MaintenanceRepository>) -> Self {
        self.purger = Some(purger);
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// 创建载荷
    ///
    /// # Arguments
    /// * `owner_user_id` - 所属用户，`None` 创建的匿名载荷永远无法被消费
    /// * `payload` - 任意可序列化的操作描述
    ///
    /// # Returns
    /// 载荷 ID 与需要客户端签名的规范化 JSON 文本
    pub async fn create_payload<T>(
        &self,
        owner_user_id: Option<&str>,
        payload: &T,
    ) -> AuthzResult<CreatedPayload>
    where
        T: Serialize + ?Sized,
    {
        let serialized = serde_json::to_string(payload).map_err(|e| {
            PAYLOADS_CREATED.with_label_values(&["marshal_failed"]).inc();
            AuthzError::marshal(&e)
        })?;

        let record = SignablePayloadRecord {
            id: uuid::Uuid::new_v4().to_string(),
            owner_user_id: owner_user_id.map(str::to_string),
            payload: serialized.clone().into_bytes(),
            created_at: self.clock.now(),
            consumed_at: None,
        };

        self.repo.insert_payload(&record).await?;
        PAYLOADS_CREATED.with_label_values(&["ok"]).inc();

        info!(
            "Created signable payload {} for owner {:?}",
            record.id, record.owner_user_id
        );

        self.maybe_purge_expired(record.created_at);

        Ok(CreatedPayload {
            payload_id: record.id,
            serialized_payload: serialized,
        })
    }

    /// 消费载荷并反序列化为调用方的结构
    ///
    /// 反序列化在条件写入之前完成，类型不匹配不会烧掉载荷。
    pub async fn consume_payload<T: DeserializeOwned>(
        &self,
        caller_user_id: &str,
        payload_id: &str,
    ) -> AuthzResult<T> {
        let (record, now) = self.check_consumable(caller_user_id, payload_id).await?;

        let value = serde_json::from_slice(&record.payload).map_err(|e| {
            PAYLOAD_CONSUME_ATTEMPTS
                .with_label_values(&["marshal_failed"])
                .inc();
            AuthzError::marshal(&e)
        })?;

        self.commit(&record.id, now).await?;
        Ok(value)
    }

    /// 消费载荷，返回原始字节
    pub async fn consume_payload_raw(
        &self,
        caller_user_id: &str,
        payload_id: &str,
    ) -> AuthzResult<Vec<u8>> {
        let (record, now) = self.check_consumable(caller_user_id, payload_id).await?;
        self.commit(&record.id, now).await?;
        Ok(record.payload)
    }

    /// 步骤 1-3：只读检查
    async fn check_consumable(
        &self,
        caller_user_id: &str,
        payload_id: &str,
    ) -> AuthzResult<(SignablePayloadRecord, DateTime<Utc>)> {
        let record = match self.repo.find_payload(payload_id).await? {
            Some(record) if record.owner_user_id.as_deref() == Some(caller_user_id) => record,
            Some(_) => {
                warn!(
                    "Payload {} requested by non-owner {}",
                    payload_id, caller_user_id
                );
                return Err(self.reject(AuthzError::PayloadNotFound, "not_found"));
            }
            None => {
                debug!("Payload {} not found", payload_id);
                return Err(self.reject(AuthzError::PayloadNotFound, "not_found"));
            }
        };

        if record.consumed_at.is_some() {
            warn!("Payload {} already consumed", payload_id);
            return Err(self.reject(AuthzError::PayloadAlreadyConsumed, "already_consumed"));
        }

        let now = self.clock.now();
        if now.signed_duration_since(record.created_at) > self.ttl {
            debug!(
                "Payload {} expired (created_at={}, now={})",
                payload_id, record.created_at, now
            );
            return Err(self.reject(AuthzError::PayloadExpired, "expired"));
        }

        Ok((record, now))
    }

    /// 步骤 4：单条条件写入
    async fn commit(&self, payload_id: &str, now: DateTime<Utc>) -> AuthzResult<()> {
        let affected = self.repo.mark_payload_consumed(payload_id, now).await?;
        if affected == 0 {
            warn!("Payload {} lost consume race", payload_id);
            return Err(self.reject(AuthzError::PayloadAlreadyConsumed, "already_consumed"));
        }

        PAYLOAD_CONSUME_ATTEMPTS.with_label_values(&["ok"]).inc();
        info!("Consumed signable payload {}", payload_id);
        Ok(())
    }

    fn reject(&self, err: AuthzError, outcome: &str) -> AuthzError {
        PAYLOAD_CONSUME_ATTEMPTS.with_label_values(&[outcome]).inc();
        err
    }

    /// 惰性清理：每 PURGE_CHECK_INTERVAL 次创建在后台执行一次，不阻塞当前请求
    fn maybe_purge_expired(&self, now: DateTime<Utc>) {
        let Some(purger) = self.purger.clone() else {
            return;
        };

        let count = self.create_counter.fetch_add(1, Ordering::Relaxed);
        if count % PURGE_CHECK_INTERVAL != PURGE_CHECK_INTERVAL - 1 {
            return;
        }

        let Some(cutoff) = now
            .checked_sub_signed(self.ttl)
            .and_then(|at| at.checked_sub_signed(self.retention_grace))
        else {
            warn!("Lazy purge skipped: cutoff before {} out of range", now);
            return;
        };
        tokio::spawn(async move {
            match purger.purge_payloads(cutoff).await {
                Ok(0) => debug!("Lazy purge: no payloads older than {}", cutoff),
                Ok(purged) => info!("Lazy purge removed {} stale payloads", purged),
                Err(e) => warn!("Lazy purge failed: {}", e),
            }
        });
    }
}

impl std::fmt::Debug for SignablePayloadStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignablePayloadStore")
            .field("ttl", &self.ttl)
            .field("lazy_purge", &self.purger.is_some())
            .finish()
    }
}
