//! 冷却锁
//!
//! [`CooldownLock`] 是纯时间比较：到期时间为空或 `<= now` 时允许执行。
//! [`CooldownRegistry`] 把它落到按 key 存储的锁表上，先用单条条件 upsert
//! 抢占锁再执行动作，两个并发调用不可能同时通过检查。

use crate::clock::Clock;
use crate::error::{AuthzError, AuthzResult};
use crate::metrics::COOLDOWN_ATTEMPTS;
use crate::storage::CooldownRepository;
use crate::types::CooldownGrant;
use chrono::{DateTime, Duration, Utc};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 基于时间戳的冷却锁
#[derive(Debug, Clone)]
pub struct CooldownLock {
    clock: Arc<dyn Clock>,
}

impl CooldownLock {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// 锁为空或已到期时返回 true
    pub fn try_acquire(&self, current_lock_expiry: Option<DateTime<Utc>>) -> bool {
        match current_lock_expiry {
            None => true,
            Some(expiry) => expiry <= self.clock.now(),
        }
    }

    /// 从现在起计算新的到期时间
    pub fn set_lock(&self, duration_from_now: Duration) -> DateTime<Utc> {
        self.clock.now() + duration_from_now
    }

    /// `try_acquire` 失败时返回 `LockConflict`
    pub fn ensure_available(&self, current_lock_expiry: Option<DateTime<Utc>>) -> AuthzResult<()> {
        if self.try_acquire(current_lock_expiry) {
            Ok(())
        } else {
            Err(AuthzError::LockConflict {
                until: current_lock_expiry,
            })
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

/// 持久化的冷却锁集合
#[derive(Clone)]
pub struct CooldownRegistry {
    lock: CooldownLock,
    repo: Arc<dyn CooldownRepository>,
}

impl CooldownRegistry {
    pub fn new(repo: Arc<dyn CooldownRepository>, clock: Arc<dyn Clock>) -> Self {
        Self {
            lock: CooldownLock::new(clock),
            repo,
        }
    }

    pub fn lock(&self) -> &CooldownLock {
        &self.lock
    }

    /// 抢占 `lock_key` 的冷却窗口
    ///
    /// # Errors
    /// - `LockConflict`: 锁仍在有效期内
    /// - `Config`: duration 不是正数
    pub async fn acquire(&self, lock_key: &str, duration: Duration) -> AuthzResult<CooldownGrant> {
        if duration <= Duration::zero() {
            return Err(AuthzError::Config(format!(
                "Cooldown duration for {lock_key} must be positive"
            )));
        }

        let now = self.lock.now();
        let expires_at = self.lock.set_lock(duration);

        if self.repo.claim_cooldown(lock_key, now, expires_at).await? == 0 {
            let until = self.repo.find_cooldown(lock_key).await?;
            COOLDOWN_ATTEMPTS.with_label_values(&["conflict"]).inc();
            warn!("Cooldown {} still locked until {:?}", lock_key, until);
            return Err(AuthzError::LockConflict { until });
        }

        COOLDOWN_ATTEMPTS.with_label_values(&["ok"]).inc();
        debug!("Cooldown {} locked until {}", lock_key, expires_at);

        Ok(CooldownGrant {
            lock_key: lock_key.to_string(),
            expires_at,
        })
    }

    /// 释放本次授予的锁；锁已被他人重新抢占时不做任何事
    pub async fn release(&self, grant: &CooldownGrant) -> AuthzResult<bool> {
        let released = self
            .repo
            .release_cooldown(&grant.lock_key, grant.expires_at)
            .await?;
        Ok(released > 0)
    }

    /// 查询当前锁到期时间
    pub async fn lock_expiry(&self, lock_key: &str) -> AuthzResult<Option<DateTime<Utc>>> {
        self.repo.find_cooldown(lock_key).await
    }

    /// 当前是否允许执行
    pub async fn is_available(&self, lock_key: &str) -> AuthzResult<bool> {
        let expiry = self.repo.find_cooldown(lock_key).await?;
        Ok(self.lock.try_acquire(expiry))
    }

    /// 抢占锁后执行 `action`；动作失败时释放锁，允许立即重试
    pub async fn run_exclusive<T, E, F, Fut>(
        &self,
        lock_key: &str,
        duration: Duration,
        action: F,
    ) -> Result<T, E>
    where
        E: From<AuthzError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let grant = self.acquire(lock_key, duration).await?;

        match action().await {
            Ok(value) => {
                info!(
                    "Action under cooldown {} completed, locked until {}",
                    lock_key, grant.expires_at
                );
                Ok(value)
            }
            Err(err) => {
                match self.release(&grant).await {
                    Ok(true) => debug!("Released cooldown {} after failed action", lock_key),
                    Ok(false) => debug!("Cooldown {} was already replaced", lock_key),
                    Err(e) => warn!("Failed to release cooldown {}: {}", lock_key, e),
                }
                Err(err)
            }
        }
    }
}

impl std::fmt::Debug for CooldownRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CooldownRegistry")
            .field("lock", &self.lock)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FrozenClock;
    use crate::error::ErrorKind;
    use crate::storage::MemoryBackend;

    fn setup() -> (CooldownRegistry, FrozenClock) {
        let clock = FrozenClock::at_unix(1_700_000_000);
        let registry = CooldownRegistry::new(
            Arc::new(MemoryBackend::new()),
            Arc::new(clock.clone()),
        );
        (registry, clock)
    }

    #[test]
    fn test_try_acquire_boundaries() {
        let clock = FrozenClock::at_unix(1_700_000_000);
        let lock = CooldownLock::new(Arc::new(clock.clone()));
        let now = clock.now();

        assert!(lock.try_acquire(None));
        assert!(lock.try_acquire(Some(now - Duration::seconds(1))));
        assert!(lock.try_acquire(Some(now)));
        assert!(!lock.try_acquire(Some(now + Duration::seconds(1))));

        let err = lock
            .ensure_available(Some(now + Duration::seconds(1)))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LockConflict);
    }

    #[test]
    fn test_set_lock_uses_clock() {
        let clock = FrozenClock::at_unix(1_700_000_000);
        let lock = CooldownLock::new(Arc::new(clock.clone()));
        assert_eq!(
            lock.set_lock(Duration::hours(24)),
            clock.now() + Duration::hours(24)
        );
    }

    #[tokio::test]
    async fn test_acquire_conflict_until_expiry() {
        let (registry, clock) = setup();
        let grant = registry
            .acquire("card:1:replace", Duration::minutes(10))
            .await
            .unwrap();

        clock.advance(Duration::minutes(9));
        let err = registry
            .acquire("card:1:replace", Duration::minutes(10))
            .await
            .unwrap_err();
        match err {
            AuthzError::LockConflict { until } => assert_eq!(until, Some(grant.expires_at)),
            other => panic!("unexpected error: {other:?}"),
        }

        // 其他 key 不受影响
        registry
            .acquire("card:2:replace", Duration::minutes(10))
            .await
            .unwrap();

        clock.advance(Duration::minutes(1));
        assert!(registry.is_available("card:1:replace").await.unwrap());
        registry
            .acquire("card:1:replace", Duration::minutes(10))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_exclusive_releases_on_failure() {
        let (registry, _clock) = setup();

        let failed: Result<(), AuthzError> = registry
            .run_exclusive("k", Duration::minutes(5), || async {
                Err(AuthzError::Storage("ledger unavailable".into()))
            })
            .await;
        assert_eq!(failed.unwrap_err().kind(), ErrorKind::Storage);
        assert_eq!(registry.lock_expiry("k").await.unwrap(), None);

        let value: Result<u32, AuthzError> = registry
            .run_exclusive("k", Duration::minutes(5), || async { Ok(7) })
            .await;
        assert_eq!(value.unwrap(), 7);

        let blocked: Result<u32, AuthzError> = registry
            .run_exclusive("k", Duration::minutes(5), || async { Ok(8) })
            .await;
        assert_eq!(blocked.unwrap_err().kind(), ErrorKind::LockConflict);
    }

    #[tokio::test]
    async fn test_release_ignores_stale_grant() {
        let (registry, clock) = setup();
        let first = registry.acquire("k", Duration::seconds(10)).await.unwrap();

        clock.advance(Duration::seconds(10));
        let second = registry.acquire("k", Duration::seconds(10)).await.unwrap();

        assert!(!registry.release(&first).await.unwrap());
        assert_eq!(
            registry.lock_expiry("k").await.unwrap(),
            Some(second.expires_at)
        );
        assert!(registry.release(&second).await.unwrap());
    }

    #[tokio::test]
    async fn test_non_positive_duration_rejected() {
        let (registry, _clock) = setup();
        let err = registry.acquire("k", Duration::zero()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }
}
