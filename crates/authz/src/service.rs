//! 组件装配
//!
//! 从配置打开存储后端，并用同一个时钟把各组件装配起来。

use crate::clock::Clock;
use crate::config::AuthzConfig;
use crate::cooldown::CooldownRegistry;
use crate::error::AuthzResult;
use crate::maintenance::Maintenance;
use crate::otp::{NotificationSender, OtpChallengeEngine};
use crate::payload::SignablePayloadStore;
use crate::storage::AuthzStorage;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// 授权核心组件集合
#[derive(Debug, Clone)]
pub struct AuthzCore {
    pub storage: AuthzStorage,
    pub payloads: SignablePayloadStore,
    pub otp: OtpChallengeEngine,
    pub cooldowns: CooldownRegistry,
    pub maintenance: Maintenance,
}

impl AuthzCore {
    /// 根据配置创建全部组件
    ///
    /// # Arguments
    /// * `config` - 授权核心配置
    /// * `db_path` - SQLite 数据文件目录
    /// * `clock` - 时间源
    /// * `notifier` - 验证码投递通道
    pub async fn from_config<P: AsRef<Path>>(
        config: &AuthzConfig,
        db_path: P,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn NotificationSender>,
    ) -> AuthzResult<Self> {
        let storage = AuthzStorage::from_config(&config.storage, db_path).await?;
        let shared = Arc::new(storage.clone());

        let payloads = SignablePayloadStore::new(shared.clone(), clock.clone(), &config.payload)?
            .with_lazy_purge(shared.clone());
        let otp = OtpChallengeEngine::new(
            shared.clone(),
            notifier,
            clock.clone(),
            config.otp.clone(),
        );
        let cooldowns = CooldownRegistry::new(shared.clone(), clock.clone());
        let maintenance = Maintenance::new(shared, clock, &config.payload)?;

        info!("Authz core ready ({} backend)", storage.backend_name());

        Ok(Self {
            storage,
            payloads,
            otp,
            cooldowns,
            maintenance,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FrozenClock;
    use crate::otp::LoggingNotifier;
    use crate::storage::StorageBackend;
    use crate::types::OtpChannel;

    #[tokio::test]
    async fn test_core_from_memory_config() {
        let mut config = AuthzConfig::default();
        config.storage.backend = StorageBackend::Memory;

        let core = AuthzCore::from_config(
            &config,
            "unused",
            Arc::new(FrozenClock::at_unix(1_700_000_000)),
            Arc::new(LoggingNotifier),
        )
        .await
        .unwrap();

        let created = core
            .payloads
            .create_payload(Some("user-1"), &serde_json::json!({"action": "close"}))
            .await
            .unwrap();
        core.otp
            .issue("user-1", OtpChannel::Email, "/close", "someone@bank.test", 6)
            .await
            .unwrap();

        let stats = core.maintenance.stats().await.unwrap();
        assert_eq!(stats.payloads_total, 1);
        assert_eq!(stats.otp_sent, 1);

        let raw = core
            .payloads
            .consume_payload_raw("user-1", &created.payload_id)
            .await
            .unwrap();
        assert_eq!(raw, br#"{"action":"close"}"#);
    }

    #[tokio::test]
    async fn test_core_rejects_unbounded_payload_ttl() {
        let mut config = AuthzConfig::default();
        config.storage.backend = StorageBackend::Memory;
        config.payload.ttl_secs = u64::MAX;

        let err = AuthzCore::from_config(
            &config,
            "unused",
            Arc::new(FrozenClock::at_unix(1_700_000_000)),
            Arc::new(LoggingNotifier),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }
}
