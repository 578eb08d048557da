//! 授权核心存储模块
//!
//! 提供多种存储后端支持：SQLite, PostgreSQL, Memory
//!
//! # 设计
//!
//! - `PayloadRepository` / `OtpRepository` / `CooldownRepository` /
//!   `MaintenanceRepository` trait 定义统一的异步接口，组件只依赖自己需要的那一个
//! - `AuthzStorage` enum 封装不同的后端实现
//! - 通过 `StorageConfig` 配置选择和初始化后端

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub mod backend;
pub mod config;
pub mod memory;
pub mod sqlite;

#[cfg(feature = "backend-postgres")]
pub mod postgres;

use crate::error::{AuthzError, AuthzResult};
use crate::types::{OtpChallengeRecord, SignablePayloadRecord, StorageStats};

pub use backend::{CooldownRepository, MaintenanceRepository, OtpRepository, PayloadRepository};
pub use config::{PostgresConfig, SqliteConfig, StorageBackend, StorageConfig};
pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

#[cfg(feature = "backend-postgres")]
pub use postgres::PostgresBackend;

/// 存储统一接口
///
/// 使用 enum 而不是 trait object：可以 Clone，后端集合在编译期确定
#[derive(Clone, Debug)]
pub enum AuthzStorage {
    /// SQLite 存储后端（始终可用）
    Sqlite(Box<SqliteBackend>),

    /// 内存存储后端
    Memory(MemoryBackend),

    /// PostgreSQL 存储后端
    #[cfg(feature = "backend-postgres")]
    Postgres(PostgresBackend),
}

/// 把调用分发到具体后端
macro_rules! dispatch {
    ($self:ident, $backend:ident => $call:expr) => {
        match $self {
            AuthzStorage::Sqlite($backend) => $call,
            AuthzStorage::Memory($backend) => $call,
            #[cfg(feature = "backend-postgres")]
            AuthzStorage::Postgres($backend) => $call,
        }
    };
}

impl AuthzStorage {
    /// 从配置创建存储实例
    ///
    /// # Arguments
    /// * `config` - 存储配置
    /// * `db_path` - 数据库文件存储目录路径（backend = "sqlite" 时使用）
    ///
    /// # Errors
    /// - 缺少对应后端的配置
    /// - 后端初始化失败
    /// - 后端功能未启用（feature flag）
    pub async fn from_config<P: AsRef<Path>>(
        config: &StorageConfig,
        db_path: P,
    ) -> AuthzResult<Self> {
        match config.backend {
            StorageBackend::Sqlite => {
                let cfg = config.sqlite.clone().unwrap_or_default();
                let backend = SqliteBackend::new(&cfg, db_path.as_ref()).await?;
                Ok(Self::Sqlite(Box::new(backend)))
            }

            StorageBackend::Memory => Ok(Self::Memory(MemoryBackend::new())),

            #[cfg(feature = "backend-postgres")]
            StorageBackend::Postgres => {
                let cfg = config
                    .postgres
                    .as_ref()
                    .ok_or_else(|| AuthzError::Config("Missing PostgreSQL config".into()))?;
                let backend = PostgresBackend::new(cfg).await?;
                Ok(Self::Postgres(backend))
            }

            #[cfg(not(feature = "backend-postgres"))]
            StorageBackend::Postgres => Err(AuthzError::Config(
                "PostgreSQL backend not enabled. Compile with --features backend-postgres".into(),
            )),
        }
    }

    /// 获取后端类型名称
    pub fn backend_name(&self) -> &'static str {
        match self {
            Self::Sqlite(_) => "SQLite",
            Self::Memory(_) => "Memory",
            #[cfg(feature = "backend-postgres")]
            Self::Postgres(_) => "Postgres",
        }
    }
}

#[async_trait]
impl PayloadRepository for AuthzStorage {
    async fn insert_payload(&self, record: &SignablePayloadRecord) -> AuthzResult<()> {
        dispatch!(self, b => b.insert_payload(record).await)
    }

    async fn find_payload(&self, id: &str) -> AuthzResult<Option<SignablePayloadRecord>> {
        dispatch!(self, b => b.find_payload(id).await)
    }

    async fn mark_payload_consumed(
        &self,
        id: &str,
        consumed_at: DateTime<Utc>,
    ) -> AuthzResult<u64> {
        dispatch!(self, b => b.mark_payload_consumed(id, consumed_at).await)
    }
}

#[async_trait]
impl OtpRepository for AuthzStorage {
    async fn insert_otp(&self, record: &OtpChallengeRecord) -> AuthzResult<()> {
        dispatch!(self, b => b.insert_otp(record).await)
    }

    async fn find_otp(&self, id: &str) -> AuthzResult<Option<OtpChallengeRecord>> {
        dispatch!(self, b => b.find_otp(id).await)
    }

    async fn mark_otp_verified(&self, id: &str, used_at: DateTime<Utc>) -> AuthzResult<u64> {
        dispatch!(self, b => b.mark_otp_verified(id, used_at).await)
    }

    async fn mark_otp_expired(&self, id: &str) -> AuthzResult<u64> {
        dispatch!(self, b => b.mark_otp_expired(id).await)
    }

    async fn mark_otp_spent(&self, id: &str, spent_at: DateTime<Utc>) -> AuthzResult<u64> {
        dispatch!(self, b => b.mark_otp_spent(id, spent_at).await)
    }
}

#[async_trait]
impl CooldownRepository for AuthzStorage {
    async fn find_cooldown(&self, lock_key: &str) -> AuthzResult<Option<DateTime<Utc>>> {
        dispatch!(self, b => b.find_cooldown(lock_key).await)
    }

    async fn claim_cooldown(
        &self,
        lock_key: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> AuthzResult<u64> {
        dispatch!(self, b => b.claim_cooldown(lock_key, now, expires_at).await)
    }

    async fn release_cooldown(
        &self,
        lock_key: &str,
        expires_at: DateTime<Utc>,
    ) -> AuthzResult<u64> {
        dispatch!(self, b => b.release_cooldown(lock_key, expires_at).await)
    }
}

#[async_trait]
impl MaintenanceRepository for AuthzStorage {
    async fn purge_payloads(&self, created_before: DateTime<Utc>) -> AuthzResult<u64> {
        dispatch!(self, b => b.purge_payloads(created_before).await)
    }

    async fn expire_stale_otps(&self, now: DateTime<Utc>) -> AuthzResult<u64> {
        dispatch!(self, b => b.expire_stale_otps(now).await)
    }

    async fn purge_cooldowns(&self, now: DateTime<Utc>) -> AuthzResult<u64> {
        dispatch!(self, b => b.purge_cooldowns(now).await)
    }

    async fn stats(&self) -> AuthzResult<StorageStats> {
        dispatch!(self, b => b.stats().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_storage_from_config_sqlite() {
        let temp_dir = tempdir().unwrap();
        let config = StorageConfig::default();

        let storage = AuthzStorage::from_config(&config, temp_dir.path())
            .await
            .unwrap();
        assert_eq!(storage.backend_name(), "SQLite");
        assert!(temp_dir.path().join("stepup.db").exists());

        let stats = storage.stats().await.unwrap();
        assert_eq!(stats, StorageStats::default());
    }

    #[tokio::test]
    async fn test_storage_from_config_memory() {
        let config = StorageConfig {
            backend: StorageBackend::Memory,
            ..Default::default()
        };

        let storage = AuthzStorage::from_config(&config, "unused").await.unwrap();
        assert_eq!(storage.backend_name(), "Memory");
    }

    #[cfg(not(feature = "backend-postgres"))]
    #[tokio::test]
    async fn test_postgres_requires_feature() {
        let config = StorageConfig {
            backend: StorageBackend::Postgres,
            postgres: Some(PostgresConfig::default()),
            ..Default::default()
        };

        let result = AuthzStorage::from_config(&config, "unused").await;
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("PostgreSQL backend not enabled")
        );
    }
}
