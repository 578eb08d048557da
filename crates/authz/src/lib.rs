//! Step-up 授权核心
//!
//! 在不可逆的敏感操作（修改 PIN、激活卡片、ACH 转账、销户等）之前提供三道关卡：
//! 1. 一次性签名载荷：服务端生成操作描述，属主在 TTL 内恰好消费一次
//! 2. OTP 挑战：签发 / 校验 / spend 状态机，对外错误不区分具体原因
//! 3. 冷却锁：动作执行后在一段时间内拒绝重复执行
//!
//! 所有状态都在持久化存储中，每次状态迁移都是单条条件更新；
//! 时间统一来自注入的 [`Clock`]。

pub mod clock;
pub mod config;
pub mod cooldown;
pub mod error;
pub mod maintenance;
pub mod metrics;
pub mod otp;
pub mod payload;
pub mod service;
pub mod storage;
pub mod types;

// Re-export commonly used items
pub use clock::{Clock, FrozenClock, SystemClock};
pub use config::{AuthzConfig, OtpConfig, PayloadConfig};
pub use cooldown::{CooldownLock, CooldownRegistry};
pub use error::{AuthzError, AuthzResult, ErrorKind, OtpRejection};
pub use maintenance::{Maintenance, MaintenanceReport};
pub use metrics::{export_metrics, register_authz_metrics};
pub use otp::{LoggingNotifier, NotificationSender, NotifyError, OtpChallengeEngine};
pub use payload::SignablePayloadStore;
pub use service::AuthzCore;
pub use storage::{AuthzStorage, StorageBackend, StorageConfig};
pub use types::{
    CooldownGrant, CreatedPayload, IssuedOtp, OtpChallengeRecord, OtpChannel, OtpStatus,
    SignablePayloadRecord, StorageStats,
};
