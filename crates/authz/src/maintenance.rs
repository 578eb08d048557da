//! 存储维护
//!
//! 一次维护包括：删除超过 ttl + 保留期的载荷、把主有效期已过的 SENT 挑战
//! 标记为 EXPIRED、删除已到期的冷却锁。OTP 记录只改状态，不删除。

use crate::clock::Clock;
use crate::config::PayloadConfig;
use crate::error::AuthzResult;
use crate::metrics::{MAINTENANCE_LAST_RUN, MAINTENANCE_PURGED};
use crate::storage::MaintenanceRepository;
use crate::types::StorageStats;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info};

/// 单次维护结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub purged_payloads: u64,
    pub expired_otps: u64,
    pub purged_cooldowns: u64,
}

impl MaintenanceReport {
    pub fn is_empty(&self) -> bool {
        self.purged_payloads == 0 && self.expired_otps == 0 && self.purged_cooldowns == 0
    }
}

/// 维护任务执行器
#[derive(Clone)]
pub struct Maintenance {
    repo: Arc<dyn MaintenanceRepository>,
    clock: Arc<dyn Clock>,
    payload_retention: Duration,
}

impl Maintenance {
    pub fn new(
        repo: Arc<dyn MaintenanceRepository>,
        clock: Arc<dyn Clock>,
        payload: &PayloadConfig,
    ) -> AuthzResult<Self> {
        let payload_retention = payload.ttl()? + payload.retention_grace()?;
        Ok(Self {
            repo,
            clock,
            payload_retention,
        })
    }

    /// 执行一次维护
    pub async fn run_once(&self) -> AuthzResult<MaintenanceReport> {
        let now = self.clock.now();

        let report = MaintenanceReport {
            purged_payloads: self.repo.purge_payloads(now - self.payload_retention).await?,
            expired_otps: self.repo.expire_stale_otps(now).await?,
            purged_cooldowns: self.repo.purge_cooldowns(now).await?,
        };

        MAINTENANCE_PURGED
            .with_label_values(&["payloads"])
            .inc_by(report.purged_payloads);
        MAINTENANCE_PURGED
            .with_label_values(&["otps_expired"])
            .inc_by(report.expired_otps);
        MAINTENANCE_PURGED
            .with_label_values(&["cooldowns"])
            .inc_by(report.purged_cooldowns);
        MAINTENANCE_LAST_RUN.set(now.timestamp());

        if report.is_empty() {
            debug!("Maintenance pass found nothing to do");
        } else {
            info!(
                "Maintenance pass: purged {} payloads, expired {} OTPs, purged {} cooldown locks",
                report.purged_payloads, report.expired_otps, report.purged_cooldowns
            );
        }

        Ok(report)
    }

    pub async fn stats(&self) -> AuthzResult<StorageStats> {
        self.repo.stats().await
    }

    /// 周期执行维护，直到收到关闭信号
    ///
    /// 单次失败只记录日志，下一个周期继续
    pub async fn run_periodic(
        &self,
        period: std::time::Duration,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        info!("Starting maintenance loop every {:?}", period);
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!("Maintenance pass failed: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal, stopping maintenance loop");
                    break;
                }
            }
        }
    }
}

impl std::fmt::Debug for Maintenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Maintenance")
            .field("payload_retention", &self.payload_retention)
            .finish()
    }
}
