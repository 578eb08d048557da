//! 后台维护配置

use serde::{Deserialize, Serialize};

/// 维护循环配置
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MaintenanceConfig {
    /// 两次维护之间的间隔（秒）
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
        }
    }
}

fn default_interval_secs() -> u64 {
    60
}

impl MaintenanceConfig {
    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.interval_secs)
    }
}
