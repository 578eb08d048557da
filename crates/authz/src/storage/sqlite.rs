//! SQLite 存储后端实现
//!
//! 使用 sqlx 提供原生异步 SQLite 存储支持。时间统一以 Unix 毫秒存储，
//! SQL 中从不调用数据库自身的当前时间，所有时间都由调用方的 Clock 提供。

use crate::error::{AuthzError, AuthzResult};
use crate::storage::backend::{
    CooldownRepository, MaintenanceRepository, OtpRepository, PayloadRepository,
};
use crate::storage::config::SqliteConfig;
use crate::types::{
    OtpChallengeRecord, OtpStatus, SignablePayloadRecord, StorageStats, from_millis, to_millis,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

type PayloadRow = (String, Option<String>, Vec<u8>, i64, Option<i64>);

type OtpRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    i64,
    i64,
    Option<i64>,
    Option<i64>,
);

/// SQLite 存储后端
#[derive(Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl std::fmt::Debug for SqliteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBackend")
            .field("pool_size", &self.pool.size())
            .finish()
    }
}

impl SqliteBackend {
    /// 创建新的 SQLite 后端实例
    ///
    /// # Arguments
    /// * `config` - SQLite 配置
    /// * `db_path` - 数据库文件存储目录路径（来自 StepupConfig.sqlite_path）
    pub async fn new(config: &SqliteConfig, db_path: &Path) -> AuthzResult<Self> {
        std::fs::create_dir_all(db_path).map_err(|e| {
            AuthzError::Storage(format!(
                "Failed to create database directory {}: {e}",
                db_path.display()
            ))
        })?;
        let file = db_path.join(&config.file_name);

        // 创建连接选项并启用 WAL 模式
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", file.display()))
            .map_err(|e| AuthzError::Storage(format!("Failed to parse SQLite URL: {e}")))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.pool_size)
            .connect_with(options)
            .await
            .map_err(|e| AuthzError::Storage(format!("Failed to connect to SQLite: {e}")))?;

        let backend = Self { pool };
        backend.init().await?;

        info!(
            "SQLite authz storage initialized: path={}, WAL mode enabled",
            file.display()
        );

        Ok(backend)
    }

    /// 初始化数据库表结构
    pub async fn init(&self) -> AuthzResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS signable_payloads (
                id TEXT PRIMARY KEY,
                owner_user_id TEXT,
                payload BLOB NOT NULL,
                created_at INTEGER NOT NULL,
                consumed_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AuthzError::Storage(format!("Failed to create payload table: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS otp_challenges (
                id TEXT PRIMARY KEY,
                code TEXT NOT NULL,
                channel TEXT NOT NULL,
                api_path TEXT NOT NULL,
                owner_user_id TEXT NOT NULL,
                contact TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expiry_ms INTEGER NOT NULL,
                used_at INTEGER,
                challenge_expired_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AuthzError::Storage(format!("Failed to create OTP table: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cooldown_locks (
                lock_key TEXT PRIMARY KEY,
                lock_expires_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AuthzError::Storage(format!("Failed to create cooldown table: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_signable_payloads_created_at ON signable_payloads(created_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AuthzError::Storage(format!("Failed to create index: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_otp_challenges_status_created_at ON otp_challenges(status, created_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AuthzError::Storage(format!("Failed to create index: {e}")))?;

        debug!("SQLite authz tables and indexes initialized");
        Ok(())
    }

    /// 获取数据库连接池
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn count(&self, sql: &str) -> AuthzResult<u64> {
        let (count,) = sqlx::query_as::<_, (i64,)>(sql)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AuthzError::Storage(format!("Failed to count rows: {e}")))?;
        Ok(count as u64)
    }
}

fn payload_from_row(row: PayloadRow) -> SignablePayloadRecord {
    let (id, owner_user_id, payload, created_at, consumed_at) = row;
    SignablePayloadRecord {
        id,
        owner_user_id,
        payload,
        created_at: from_millis(created_at),
        consumed_at: consumed_at.map(from_millis),
    }
}

fn otp_from_row(row: OtpRow) -> AuthzResult<OtpChallengeRecord> {
    let (
        id,
        code,
        channel,
        api_path,
        owner_user_id,
        contact,
        status,
        created_at,
        expiry_ms,
        used_at,
        challenge_expired_at,
    ) = row;

    Ok(OtpChallengeRecord {
        channel: channel.parse().map_err(AuthzError::Storage)?,
        status: status.parse().map_err(AuthzError::Storage)?,
        id,
        code,
        api_path,
        owner_user_id,
        contact,
        created_at: from_millis(created_at),
        expiry_ms,
        used_at: used_at.map(from_millis),
        challenge_expired_at: challenge_expired_at.map(from_millis),
    })
}

#[async_trait]
impl PayloadRepository for SqliteBackend {
    async fn insert_payload(&self, record: &SignablePayloadRecord) -> AuthzResult<()> {
        sqlx::query(
            r#"INSERT INTO signable_payloads (id, owner_user_id, payload, created_at, consumed_at)
               VALUES (?1, ?2, ?3, ?4, ?5)"#,
        )
        .bind(&record.id)
        .bind(&record.owner_user_id)
        .bind(&record.payload)
        .bind(to_millis(record.created_at))
        .bind(record.consumed_at.map(to_millis))
        .execute(&self.pool)
        .await
        .map_err(|e| AuthzError::Storage(format!("Failed to insert payload: {e}")))?;

        Ok(())
    }

    async fn find_payload(&self, id: &str) -> AuthzResult<Option<SignablePayloadRecord>> {
        let row = sqlx::query_as::<_, PayloadRow>(
            "SELECT id, owner_user_id, payload, created_at, consumed_at FROM signable_payloads WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AuthzError::Storage(format!("Failed to query payload: {e}")))?;

        Ok(row.map(payload_from_row))
    }

    async fn mark_payload_consumed(
        &self,
        id: &str,
        consumed_at: DateTime<Utc>,
    ) -> AuthzResult<u64> {
        let result = sqlx::query(
            "UPDATE signable_payloads SET consumed_at = ?1 WHERE id = ?2 AND consumed_at IS NULL",
        )
        .bind(to_millis(consumed_at))
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| AuthzError::Storage(format!("Failed to consume payload: {e}")))?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl OtpRepository for SqliteBackend {
    async fn insert_otp(&self, record: &OtpChallengeRecord) -> AuthzResult<()> {
        sqlx::query(
            r#"INSERT INTO otp_challenges
               (id, code, channel, api_path, owner_user_id, contact, status,
                created_at, expiry_ms, used_at, challenge_expired_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"#,
        )
        .bind(&record.id)
        .bind(&record.code)
        .bind(record.channel.as_str())
        .bind(&record.api_path)
        .bind(&record.owner_user_id)
        .bind(&record.contact)
        .bind(record.status.as_str())
        .bind(to_millis(record.created_at))
        .bind(record.expiry_ms)
        .bind(record.used_at.map(to_millis))
        .bind(record.challenge_expired_at.map(to_millis))
        .execute(&self.pool)
        .await
        .map_err(|e| AuthzError::Storage(format!("Failed to insert OTP challenge: {e}")))?;

        Ok(())
    }

    async fn find_otp(&self, id: &str) -> AuthzResult<Option<OtpChallengeRecord>> {
        let row = sqlx::query_as::<_, OtpRow>(
            r#"SELECT id, code, channel, api_path, owner_user_id, contact, status,
                      created_at, expiry_ms, used_at, challenge_expired_at
               FROM otp_challenges WHERE id = ?"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AuthzError::Storage(format!("Failed to query OTP challenge: {e}")))?;

        row.map(otp_from_row).transpose()
    }

    async fn mark_otp_verified(&self, id: &str, used_at: DateTime<Utc>) -> AuthzResult<u64> {
        let result = sqlx::query(
            "UPDATE otp_challenges SET status = ?1, used_at = ?2 WHERE id = ?3 AND status = ?4",
        )
        .bind(OtpStatus::Verified.as_str())
        .bind(to_millis(used_at))
        .bind(id)
        .bind(OtpStatus::Sent.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| AuthzError::Storage(format!("Failed to verify OTP challenge: {e}")))?;

        Ok(result.rows_affected())
    }

    async fn mark_otp_expired(&self, id: &str) -> AuthzResult<u64> {
        let result =
            sqlx::query("UPDATE otp_challenges SET status = ?1 WHERE id = ?2 AND status = ?3")
                .bind(OtpStatus::Expired.as_str())
                .bind(id)
                .bind(OtpStatus::Sent.as_str())
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    AuthzError::Storage(format!("Failed to expire OTP challenge: {e}"))
                })?;

        Ok(result.rows_affected())
    }

    async fn mark_otp_spent(&self, id: &str, spent_at: DateTime<Utc>) -> AuthzResult<u64> {
        let result = sqlx::query(
            r#"UPDATE otp_challenges SET challenge_expired_at = ?1
               WHERE id = ?2 AND status = ?3 AND challenge_expired_at IS NULL"#,
        )
        .bind(to_millis(spent_at))
        .bind(id)
        .bind(OtpStatus::Verified.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| AuthzError::Storage(format!("Failed to spend OTP challenge: {e}")))?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl CooldownRepository for SqliteBackend {
    async fn find_cooldown(&self, lock_key: &str) -> AuthzResult<Option<DateTime<Utc>>> {
        let row = sqlx::query_as::<_, (Option<i64>,)>(
            "SELECT lock_expires_at FROM cooldown_locks WHERE lock_key = ?",
        )
        .bind(lock_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AuthzError::Storage(format!("Failed to query cooldown lock: {e}")))?;

        Ok(row.and_then(|(expires_at,)| expires_at).map(from_millis))
    }

    async fn claim_cooldown(
        &self,
        lock_key: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> AuthzResult<u64> {
        let result = sqlx::query(
            r#"INSERT INTO cooldown_locks (lock_key, lock_expires_at) VALUES (?1, ?2)
               ON CONFLICT(lock_key) DO UPDATE SET lock_expires_at = excluded.lock_expires_at
               WHERE cooldown_locks.lock_expires_at IS NULL
                  OR cooldown_locks.lock_expires_at <= ?3"#,
        )
        .bind(lock_key)
        .bind(to_millis(expires_at))
        .bind(to_millis(now))
        .execute(&self.pool)
        .await
        .map_err(|e| AuthzError::Storage(format!("Failed to claim cooldown lock: {e}")))?;

        Ok(result.rows_affected())
    }

    async fn release_cooldown(
        &self,
        lock_key: &str,
        expires_at: DateTime<Utc>,
    ) -> AuthzResult<u64> {
        let result = sqlx::query(
            "DELETE FROM cooldown_locks WHERE lock_key = ?1 AND lock_expires_at = ?2",
        )
        .bind(lock_key)
        .bind(to_millis(expires_at))
        .execute(&self.pool)
        .await
        .map_err(|e| AuthzError::Storage(format!("Failed to release cooldown lock: {e}")))?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl MaintenanceRepository for SqliteBackend {
    async fn purge_payloads(&self, created_before: DateTime<Utc>) -> AuthzResult<u64> {
        let result = sqlx::query("DELETE FROM signable_payloads WHERE created_at < ?")
            .bind(to_millis(created_before))
            .execute(&self.pool)
            .await
            .map_err(|e| AuthzError::Storage(format!("Failed to purge payloads: {e}")))?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            debug!("Purged {} signable payloads", deleted);
        }
        Ok(deleted)
    }

    async fn expire_stale_otps(&self, now: DateTime<Utc>) -> AuthzResult<u64> {
        let result = sqlx::query(
            "UPDATE otp_challenges SET status = ?1 WHERE status = ?2 AND created_at + expiry_ms < ?3",
        )
        .bind(OtpStatus::Expired.as_str())
        .bind(OtpStatus::Sent.as_str())
        .bind(to_millis(now))
        .execute(&self.pool)
        .await
        .map_err(|e| AuthzError::Storage(format!("Failed to expire stale OTPs: {e}")))?;

        Ok(result.rows_affected())
    }

    async fn purge_cooldowns(&self, now: DateTime<Utc>) -> AuthzResult<u64> {
        let result = sqlx::query(
            "DELETE FROM cooldown_locks WHERE lock_expires_at IS NULL OR lock_expires_at <= ?",
        )
        .bind(to_millis(now))
        .execute(&self.pool)
        .await
        .map_err(|e| AuthzError::Storage(format!("Failed to purge cooldown locks: {e}")))?;

        Ok(result.rows_affected())
    }

    async fn stats(&self) -> AuthzResult<StorageStats> {
        Ok(StorageStats {
            payloads_total: self.count("SELECT COUNT(*) FROM signable_payloads").await?,
            payloads_consumed: self
                .count("SELECT COUNT(*) FROM signable_payloads WHERE consumed_at IS NOT NULL")
                .await?,
            otp_sent: self
                .count("SELECT COUNT(*) FROM otp_challenges WHERE status = 'SENT'")
                .await?,
            otp_verified: self
                .count("SELECT COUNT(*) FROM otp_challenges WHERE status = 'VERIFIED'")
                .await?,
            otp_expired: self
                .count("SELECT COUNT(*) FROM otp_challenges WHERE status = 'EXPIRED'")
                .await?,
            cooldown_locks: self
                .count("SELECT COUNT(*) FROM cooldown_locks WHERE lock_expires_at IS NOT NULL")
                .await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OtpChannel;
    use chrono::Duration as ChronoDuration;
    use tempfile::{TempDir, tempdir};

    async fn create_test_backend() -> (SqliteBackend, TempDir) {
        let temp_dir = tempdir().unwrap();
        let backend = SqliteBackend::new(&SqliteConfig::default(), temp_dir.path())
            .await
            .unwrap();
        (backend, temp_dir)
    }

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn payload(id: &str, owner: Option<&str>) -> SignablePayloadRecord {
        SignablePayloadRecord {
            id: id.to_string(),
            owner_user_id: owner.map(str::to_string),
            payload: br#"{"card_id":"c-1"}"#.to_vec(),
            created_at: t(0),
            consumed_at: None,
        }
    }

    fn otp(id: &str) -> OtpChallengeRecord {
        OtpChallengeRecord {
            id: id.to_string(),
            code: "042917".to_string(),
            channel: OtpChannel::Email,
            api_path: "/v1/cards/pin".to_string(),
            owner_user_id: "user-1".to_string(),
            contact: "jane@example.com".to_string(),
            status: OtpStatus::Sent,
            created_at: t(0),
            expiry_ms: 60_000,
            used_at: None,
            challenge_expired_at: None,
        }
    }

    #[tokio::test]
    async fn test_payload_insert_and_find() {
        let (backend, _dir) = create_test_backend().await;
        backend.insert_payload(&payload("p-1", None)).await.unwrap();

        let found = backend.find_payload("p-1").await.unwrap().unwrap();
        assert_eq!(found, payload("p-1", None));
        assert!(backend.find_payload("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_payload_consumed_only_once() {
        let (backend, _dir) = create_test_backend().await;
        backend
            .insert_payload(&payload("p-1", Some("user-1")))
            .await
            .unwrap();

        assert_eq!(backend.mark_payload_consumed("p-1", t(10)).await.unwrap(), 1);
        assert_eq!(backend.mark_payload_consumed("p-1", t(11)).await.unwrap(), 0);
        assert_eq!(backend.mark_payload_consumed("nope", t(11)).await.unwrap(), 0);

        let found = backend.find_payload("p-1").await.unwrap().unwrap();
        assert_eq!(found.consumed_at, Some(t(10)));
    }

    #[tokio::test]
    async fn test_otp_transitions_are_conditional() {
        let (backend, _dir) = create_test_backend().await;
        backend.insert_otp(&otp("o-1")).await.unwrap();

        // spend 之前必须先 verify
        assert_eq!(backend.mark_otp_spent("o-1", t(5)).await.unwrap(), 0);
        assert_eq!(backend.mark_otp_verified("o-1", t(5)).await.unwrap(), 1);
        assert_eq!(backend.mark_otp_verified("o-1", t(6)).await.unwrap(), 0);
        // 已 VERIFIED 的挑战不会被标记为 EXPIRED
        assert_eq!(backend.mark_otp_expired("o-1").await.unwrap(), 0);
        assert_eq!(backend.mark_otp_spent("o-1", t(7)).await.unwrap(), 1);
        assert_eq!(backend.mark_otp_spent("o-1", t(8)).await.unwrap(), 0);

        let found = backend.find_otp("o-1").await.unwrap().unwrap();
        assert_eq!(found.status, OtpStatus::Verified);
        assert_eq!(found.used_at, Some(t(5)));
        assert_eq!(found.challenge_expired_at, Some(t(7)));
        assert_eq!(found.channel, OtpChannel::Email);
    }

    #[tokio::test]
    async fn test_cooldown_claim_and_release() {
        let (backend, _dir) = create_test_backend().await;

        assert_eq!(
            backend.claim_cooldown("card:1", t(0), t(60)).await.unwrap(),
            1
        );
        assert_eq!(
            backend.claim_cooldown("card:1", t(30), t(90)).await.unwrap(),
            0
        );
        assert_eq!(backend.find_cooldown("card:1").await.unwrap(), Some(t(60)));

        // 到期时刻即可重新获取
        assert_eq!(
            backend.claim_cooldown("card:1", t(60), t(120)).await.unwrap(),
            1
        );

        // 只有当前授予者可以释放
        assert_eq!(backend.release_cooldown("card:1", t(60)).await.unwrap(), 0);
        assert_eq!(backend.release_cooldown("card:1", t(120)).await.unwrap(), 1);
        assert_eq!(backend.find_cooldown("card:1").await.unwrap(), None);
        assert_eq!(backend.stats().await.unwrap().cooldown_locks, 0);

        assert_eq!(
            backend.claim_cooldown("card:1", t(61), t(121)).await.unwrap(),
            1
        );
        assert_eq!(backend.stats().await.unwrap().cooldown_locks, 1);
    }

    #[tokio::test]
    async fn test_maintenance_and_stats() {
        let (backend, _dir) = create_test_backend().await;
        backend.insert_payload(&payload("old", Some("u"))).await.unwrap();
        let mut fresh = payload("fresh", Some("u"));
        fresh.created_at = t(3600);
        backend.insert_payload(&fresh).await.unwrap();
        backend.insert_otp(&otp("stale")).await.unwrap();
        backend.claim_cooldown("k", t(0), t(10)).await.unwrap();

        let now = t(0) + ChronoDuration::seconds(61);
        assert_eq!(backend.expire_stale_otps(now).await.unwrap(), 1);
        assert_eq!(backend.purge_payloads(t(1800)).await.unwrap(), 1);
        assert_eq!(backend.purge_cooldowns(now).await.unwrap(), 1);

        let stats = backend.stats().await.unwrap();
        assert_eq!(stats.payloads_total, 1);
        assert_eq!(stats.otp_expired, 1);
        assert_eq!(stats.otp_sent, 0);
        assert_eq!(stats.cooldown_locks, 0);
    }

    #[tokio::test]
    async fn test_data_survives_reopen() {
        let temp_dir = tempdir().unwrap();
        {
            let backend = SqliteBackend::new(&SqliteConfig::default(), temp_dir.path())
                .await
                .unwrap();
            backend.insert_otp(&otp("o-1")).await.unwrap();
            backend.pool().close().await;
        }

        let reopened = SqliteBackend::new(&SqliteConfig::default(), temp_dir.path())
            .await
            .unwrap();
        assert!(reopened.find_otp("o-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_closed_pool_reports_storage_error() {
        let (backend, _dir) = create_test_backend().await;
        backend.pool().close().await;

        let err = backend.find_payload("p-1").await.unwrap_err();
        assert!(matches!(err, AuthzError::Storage(_)));
        assert_eq!(err.kind(), crate::error::ErrorKind::Storage);

        let err = backend.stats().await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Storage);
    }
}
