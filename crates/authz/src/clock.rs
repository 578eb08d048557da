//! 时间源抽象
//!
//! 所有组件通过构造函数注入 [`Clock`]，生产环境使用墙钟时间，
//! 测试中使用可冻结、可推进的 [`FrozenClock`]。

use chrono::{DateTime, Duration, Utc};
use std::fmt::Debug;
use std::sync::{Arc, PoisonError, RwLock};

/// 时间源
pub trait Clock: Send + Sync + Debug {
    /// 当前时间
    fn now(&self) -> DateTime<Utc>;
}

/// 墙钟时间源
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// 冻结时间源
///
/// 克隆出的实例共享同一个时间点，推进任意一个都会影响全部持有者。
#[derive(Debug, Clone)]
pub struct FrozenClock {
    now: Arc<RwLock<DateTime<Utc>>>,
}

impl FrozenClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(RwLock::new(at)),
        }
    }

    /// 冻结在给定的 Unix 秒
    pub fn at_unix(secs: i64) -> Self {
        Self::new(DateTime::from_timestamp(secs, 0).unwrap_or_default())
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.write().unwrap_or_else(PoisonError::into_inner) = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.write().unwrap_or_else(PoisonError::into_inner);
        *now = *now + by;
    }
}

impl Clock for FrozenClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frozen_clock_shared_between_clones() {
        let clock = FrozenClock::at_unix(1_700_000_000);
        let other = clock.clone();

        clock.advance(Duration::seconds(90));
        assert_eq!(other.now().timestamp(), 1_700_000_090);

        other.set(DateTime::from_timestamp(42, 0).unwrap());
        assert_eq!(clock.now().timestamp(), 42);
    }

    #[test]
    fn test_system_clock_moves_forward() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
