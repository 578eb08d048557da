//! Stepup 基础设施库
//!
//! 为 stepup 服务提供配置加载与校验、统一错误类型

pub mod config;
pub mod error;

// Re-export commonly used types for convenience
pub use config::{LogConfig, MaintenanceConfig, ObservabilityConfig, StepupConfig};
pub use error::{BaseError, ConfigError, Result};
