//! 一次性验证码（OTP）挑战
//!
//! - `engine`: 签发 / 校验 / spend 状态机
//! - `code`: 验证码生成与常量时间比较
//! - `mask`: 联系方式脱敏
//! - `notifier`: 投递通道接口

mod code;
mod engine;
mod mask;
mod notifier;

pub use code::{codes_match, generate_code};
pub use engine::OtpChallengeEngine;
pub use mask::{mask_contact, mask_email, mask_phone};
pub use notifier::{LoggingNotifier, NotificationSender, NotifyError};
