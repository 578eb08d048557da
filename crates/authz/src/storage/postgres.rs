//! PostgreSQL 存储后端实现
//!
//! 使用 sqlx 提供 PostgreSQL 存储支持，表结构与 SQLite 后端一致

use crate::error::{AuthzError, AuthzResult};
use crate::storage::backend::{
    CooldownRepository, MaintenanceRepository, OtpRepository, PayloadRepository,
};
use crate::storage::config::PostgresConfig;
use crate::types::{
    OtpChallengeRecord, OtpStatus, SignablePayloadRecord, StorageStats, from_millis, to_millis,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
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

/// PostgreSQL 存储后端
#[derive(Clone)]
pub struct PostgresBackend {
    pool: PgPool,
}

impl std::fmt::Debug for PostgresBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresBackend")
            .field("pool_size", &self.pool.size())
            .finish()
    }
}

impl PostgresBackend {
    /// 创建新的 PostgreSQL 后端实例
    pub async fn new(config: &PostgresConfig) -> AuthzResult<Self> {
        let url = format!(
            "postgres://{}:{}@{}:{}/{}",
            config.username, config.password, config.host, config.port, config.database
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .max_lifetime(Duration::from_secs(config.max_lifetime_secs))
            .connect(&url)
            .await
            .map_err(|e| AuthzError::Storage(format!("Failed to connect to PostgreSQL: {e}")))?;

        let backend = Self { pool };
        backend.init().await?;

        info!(
            "PostgreSQL authz storage initialized: host={}:{}, db={}",
            config.host, config.port, config.database
        );

        Ok(backend)
    }

    /// 初始化数据库表结构
    pub async fn init(&self) -> AuthzResult<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS signable_payloads (
                id TEXT PRIMARY KEY,
                owner_user_id TEXT,
                payload BYTEA NOT NULL,
                created_at BIGINT NOT NULL,
                consumed_at BIGINT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS otp_challenges (
                id TEXT PRIMARY KEY,
                code TEXT NOT NULL,
                channel TEXT NOT NULL,
                api_path TEXT NOT NULL,
                owner_user_id TEXT NOT NULL,
                contact TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at BIGINT NOT NULL,
                expiry_ms BIGINT NOT NULL,
                used_at BIGINT,
                challenge_expired_at BIGINT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS cooldown_locks (
                lock_key TEXT PRIMARY KEY,
                lock_expires_at BIGINT
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_signable_payloads_created_at ON signable_payloads(created_at)",
            "CREATE INDEX IF NOT EXISTS idx_otp_challenges_sent ON otp_challenges(created_at) WHERE status = 'SENT'",
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| AuthzError::Storage(format!("Failed to initialize schema: {e}")))?;
        }

        debug!("PostgreSQL authz tables and indexes initialized");
        Ok(())
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
impl PayloadRepository for PostgresBackend {
    async fn insert_payload(&self, record: &SignablePayloadRecord) -> AuthzResult<()> {
        sqlx::query(
            r#"INSERT INTO signable_payloads (id, owner_user_id, payload, created_at, consumed_at)
               VALUES ($1, $2, $3, $4, $5)"#,
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
            "SELECT id, owner_user_id, payload, created_at, consumed_at FROM signable_payloads WHERE id = $1",
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
            "UPDATE signable_payloads SET consumed_at = $1 WHERE id = $2 AND consumed_at IS NULL",
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
impl OtpRepository for PostgresBackend {
    async fn insert_otp(&self, record: &OtpChallengeRecord) -> AuthzResult<()> {
        sqlx::query(
            r#"INSERT INTO otp_challenges
               (id, code, channel, api_path, owner_user_id, contact, status,
                created_at, expiry_ms, used_at, challenge_expired_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"#,
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
               FROM otp_challenges WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AuthzError::Storage(format!("Failed to query OTP challenge: {e}")))?;

        row.map(otp_from_row).transpose()
    }

    async fn mark_otp_verified(&self, id: &str, used_at: DateTime<Utc>) -> AuthzResult<u64> {
        let result = sqlx::query(
            "UPDATE otp_challenges SET status = $1, used_at = $2 WHERE id = $3 AND status = $4",
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
            sqlx::query("UPDATE otp_challenges SET status = $1 WHERE id = $2 AND status = $3")
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
            r#"UPDATE otp_challenges SET challenge_expired_at = $1
               WHERE id = $2 AND status = $3 AND challenge_expired_at IS NULL"#,
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
impl CooldownRepository for PostgresBackend {
    async fn find_cooldown(&self, lock_key: &str) -> AuthzResult<Option<DateTime<Utc>>> {
        let row = sqlx::query_as::<_, (Option<i64>,)>(
            "SELECT lock_expires_at FROM cooldown_locks WHERE lock_key = $1",
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
            r#"INSERT INTO cooldown_locks (lock_key, lock_expires_at) VALUES ($1, $2)
               ON CONFLICT (lock_key) DO UPDATE SET lock_expires_at = EXCLUDED.lock_expires_at
               WHERE cooldown_locks.lock_expires_at IS NULL
                  OR cooldown_locks.lock_expires_at <= $3"#,
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
            "DELETE FROM cooldown_locks WHERE lock_key = $1 AND lock_expires_at = $2",
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
impl MaintenanceRepository for PostgresBackend {
    async fn purge_payloads(&self, created_before: DateTime<Utc>) -> AuthzResult<u64> {
        let result = sqlx::query("DELETE FROM signable_payloads WHERE created_at < $1")
            .bind(to_millis(created_before))
            .execute(&self.pool)
            .await
            .map_err(|e| AuthzError::Storage(format!("Failed to purge payloads: {e}")))?;

        Ok(result.rows_affected())
    }

    async fn expire_stale_otps(&self, now: DateTime<Utc>) -> AuthzResult<u64> {
        let result = sqlx::query(
            "UPDATE otp_challenges SET status = $1 WHERE status = $2 AND created_at + expiry_ms < $3",
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
            "DELETE FROM cooldown_locks WHERE lock_expires_at IS NULL OR lock_expires_at <= $1",
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
