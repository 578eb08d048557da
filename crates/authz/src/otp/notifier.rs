//! 验证码投递接口
//!
//! 真正的短信、语音、邮件通道由外部实现。引擎只调用一次 `send`，
//! 不重试也不根据结果回滚已持久化的挑战。

use super::mask::mask_contact;
use crate::types::OtpChannel;
use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

/// 投递失败
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Channel {0} is not supported by this sender")]
    UnsupportedChannel(OtpChannel),

    #[error("Delivery failed: {0}")]
    Delivery(String),
}

/// 验证码投递通道
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, contact: &str, channel: OtpChannel, code: &str)
    -> Result<(), NotifyError>;
}

/// 只记录日志的投递通道，用于开发环境
///
/// 日志中只出现脱敏后的地址，验证码本身不落日志
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingNotifier;

#[async_trait]
impl NotificationSender for LoggingNotifier {
    async fn send(
        &self,
        contact: &str,
        channel: OtpChannel,
        _code: &str,
    ) -> Result<(), NotifyError> {
        info!(
            "OTP delivery ({}) to {} handed to logging notifier",
            channel,
            mask_contact(channel, contact)
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_logging_notifier_accepts_every_channel() {
        let notifier = LoggingNotifier;
        for channel in [OtpChannel::Sms, OtpChannel::Call, OtpChannel::Email] {
            notifier.send("someone@bank.test", channel, "123456").await.unwrap();
        }
    }

    #[test]
    fn test_notify_error_display() {
        let err = NotifyError::UnsupportedChannel(OtpChannel::Call);
        assert_eq!(err.to_string(), "Channel CALL is not supported by this sender");
    }
}
