//! OTP 挑战状态机
//!
//! 状态：`SENT → VERIFIED`（之后还有一次性的 spend 门），或 `SENT → EXPIRED`。
//! 对外只有 `InvalidOtp` / `OtpExpired` 两种错误，具体原因只写日志。

use super::code::{codes_match, generate_code};
use super::mask::mask_contact;
use super::notifier::NotificationSender;
use crate::clock::Clock;
use crate::config::OtpConfig;
use crate::error::{AuthzError, AuthzResult, OtpRejection};
use crate::metrics::{OTP_ISSUED, OTP_SPEND_ATTEMPTS, OTP_VERIFY_ATTEMPTS};
use crate::storage::OtpRepository;
use crate::types::{IssuedOtp, OtpChallengeRecord, OtpChannel, OtpStatus};
use prometheus::IntCounterVec;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// OTP 挑战引擎
#[derive(Clone)]
pub struct OtpChallengeEngine {
    repo: Arc<dyn OtpRepository>,
    notifier: Arc<dyn NotificationSender>,
    clock: Arc<dyn Clock>,
    config: OtpConfig,
}

impl OtpChallengeEngine {
    pub fn new(
        repo: Arc<dyn OtpRepository>,
        notifier: Arc<dyn NotificationSender>,
        clock: Arc<dyn Clock>,
        config: OtpConfig,
    ) -> Self {
        Self {
            repo,
            notifier,
            clock,
            config,
        }
    }

    /// 配置的默认位数
    pub fn default_digits(&self) -> u8 {
        self.config.digits
    }

    /// 签发挑战
    ///
    /// 记录先落库再投递；投递失败只记日志，签发仍然成功。
    pub async fn issue(
        &self,
        user_id: &str,
        channel: OtpChannel,
        api_path: &str,
        contact: &str,
        digit_count: u8,
    ) -> AuthzResult<IssuedOtp> {
        let code = generate_code(digit_count)?;
        let expiry_ms = i64::try_from(self.config.expiry_ms(channel)).map_err(|_| {
            AuthzError::Config(format!("OTP expiry for {channel} does not fit in i64"))
        })?;

        let record = OtpChallengeRecord {
            id: uuid::Uuid::new_v4().to_string(),
            code,
            channel,
            api_path: api_path.to_string(),
            owner_user_id: user_id.to_string(),
            contact: contact.to_string(),
            status: OtpStatus::Sent,
            created_at: self.clock.now(),
            expiry_ms,
            used_at: None,
            challenge_expired_at: None,
        };
        self.repo.insert_otp(&record).await?;

        let masked_contact = mask_contact(channel, contact);
        let delivery = match self.notifier.send(contact, channel, &record.code).await {
            Ok(()) => "ok",
            Err(e) => {
                warn!(
                    "OTP {} delivery to {} failed: {}",
                    record.id, masked_contact, e
                );
                "failed"
            }
        };
        OTP_ISSUED
            .with_label_values(&[channel.as_str(), delivery])
            .inc();

        info!(
            "Issued OTP {} ({}) for user {} on {} to {}",
            record.id, channel, user_id, api_path, masked_contact
        );

        Ok(IssuedOtp {
            otp_id: record.id,
            expiry_duration_ms: expiry_ms,
            masked_contact,
        })
    }

    /// 校验验证码
    pub async fn verify(
        &self,
        user_id: &str,
        otp_id: &str,
        submitted_code: &str,
        expected_api_path: &str,
    ) -> AuthzResult<()> {
        let record = self
            .load_owned(user_id, otp_id, &OTP_VERIFY_ATTEMPTS)
            .await?;

        let now = self.clock.now();
        if record.is_expired_at(now) {
            let marked = self.repo.mark_otp_expired(otp_id).await?;
            debug!("OTP {} expired at verify (marked rows: {})", otp_id, marked);
            OTP_VERIFY_ATTEMPTS.with_label_values(&["expired"]).inc();
            return Err(AuthzError::OtpExpired);
        }

        if record.status != OtpStatus::Sent {
            return Err(reject(&OTP_VERIFY_ATTEMPTS, otp_id, OtpRejection::NotPending));
        }

        if !codes_match(&record.code, submitted_code) {
            return Err(reject(
                &OTP_VERIFY_ATTEMPTS,
                otp_id,
                OtpRejection::CodeMismatch,
            ));
        }

        if record.api_path != expected_api_path {
            return Err(reject(
                &OTP_VERIFY_ATTEMPTS,
                otp_id,
                OtpRejection::RouteMismatch,
            ));
        }

        if self.repo.mark_otp_verified(otp_id, now).await? == 0 {
            return Err(reject(&OTP_VERIFY_ATTEMPTS, otp_id, OtpRejection::LostRace));
        }

        OTP_VERIFY_ATTEMPTS.with_label_values(&["ok"]).inc();
        info!("OTP {} verified for user {}", otp_id, user_id);
        Ok(())
    }

    /// 由真正执行敏感操作的动作调用，已校验的挑战只能被 spend 一次
    pub async fn spend(
        &self,
        user_id: &str,
        otp_id: &str,
        expected_api_path: &str,
    ) -> AuthzResult<()> {
        let record = self
            .load_owned(user_id, otp_id, &OTP_SPEND_ATTEMPTS)
            .await?;

        if record.api_path != expected_api_path {
            return Err(reject(
                &OTP_SPEND_ATTEMPTS,
                otp_id,
                OtpRejection::RouteMismatch,
            ));
        }

        if record.status != OtpStatus::Verified {
            return Err(reject(&OTP_SPEND_ATTEMPTS, otp_id, OtpRejection::NotVerified));
        }

        if record.challenge_expired_at.is_some() {
            debug!("OTP {} already spent", otp_id);
            OTP_SPEND_ATTEMPTS.with_label_values(&["expired"]).inc();
            return Err(AuthzError::OtpExpired);
        }

        let now = self.clock.now();
        if self.repo.mark_otp_spent(otp_id, now).await? == 0 {
            warn!(
                "OTP {} spend rejected: {}",
                otp_id,
                OtpRejection::LostRace.as_str()
            );
            OTP_SPEND_ATTEMPTS.with_label_values(&["expired"]).inc();
            return Err(AuthzError::OtpExpired);
        }

        OTP_SPEND_ATTEMPTS.with_label_values(&["ok"]).inc();
        info!("OTP {} spent by user {}", otp_id, user_id);
        Ok(())
    }

    /// 不存在与属于他人统一返回 `InvalidOtp`
    async fn load_owned(
        &self,
        user_id: &str,
        otp_id: &str,
        counter: &IntCounterVec,
    ) -> AuthzResult<OtpChallengeRecord> {
        match self.repo.find_otp(otp_id).await? {
            Some(record) if record.owner_user_id == user_id => Ok(record),
            Some(_) => Err(reject(counter, otp_id, OtpRejection::OwnerMismatch)),
            None => Err(reject(counter, otp_id, OtpRejection::NotFound)),
        }
    }
}

fn reject(counter: &IntCounterVec, otp_id: &str, reason: OtpRejection) -> AuthzError {
    warn!("OTP {} rejected: {}", otp_id, reason.as_str());
    counter.with_label_values(&[reason.as_str()]).inc();
    AuthzError::InvalidOtp { reason }
}

impl std::fmt::Debug for OtpChallengeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OtpChallengeEngine")
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FrozenClock;
    use crate::error::ErrorKind;
    use crate::otp::NotifyError;
    use crate::storage::MemoryBackend;
    use async_trait::async_trait;
    use chrono::Duration;
    use std::sync::Mutex;

    /// 记录投递内容，测试中用来拿到验证码
    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<(String, OtpChannel, String)>>,
    }

    impl RecordingNotifier {
        fn last_code(&self) -> String {
            self.sent.lock().unwrap().last().unwrap().2.clone()
        }
    }

    #[async_trait]
    impl NotificationSender for RecordingNotifier {
        async fn send(
            &self,
            contact: &str,
            channel: OtpChannel,
            code: &str,
        ) -> Result<(), NotifyError> {
            self.sent
                .lock()
                .unwrap()
                .push((contact.to_string(), channel, code.to_string()));
            Ok(())
        }
    }

    struct FailingNotifier;

    #[async_trait]
    impl NotificationSender for FailingNotifier {
        async fn send(&self, _: &str, _: OtpChannel, _: &str) -> Result<(), NotifyError> {
            Err(NotifyError::Delivery("gateway timeout".into()))
        }
    }

    struct Fixture {
        engine: OtpChallengeEngine,
        clock: FrozenClock,
        backend: MemoryBackend,
        notifier: Arc<RecordingNotifier>,
    }

    fn setup() -> Fixture {
        let clock = FrozenClock::at_unix(1_700_000_000);
        let backend = MemoryBackend::new();
        let notifier = Arc::new(RecordingNotifier::default());
        let engine = OtpChallengeEngine::new(
            Arc::new(backend.clone()),
            notifier.clone(),
            Arc::new(clock.clone()),
            OtpConfig::default(),
        );
        Fixture {
            engine,
            clock,
            backend,
            notifier,
        }
    }

    fn wrong(code: &str) -> String {
        let last = code.chars().last().unwrap();
        let flipped = if last == '0' { '1' } else { '0' };
        format!("{}{}", &code[..code.len() - 1], flipped)
    }

    #[tokio::test]
    async fn test_issue_persists_and_masks() {
        let f = setup();
        let issued = f
            .engine
            .issue("user-1", OtpChannel::Sms, "/cards/pin", "+1 555 555 0100", 6)
            .await
            .unwrap();

        assert_eq!(issued.masked_contact, "XXX-XXX-0100");
        assert_eq!(issued.expiry_duration_ms, 300_000);

        let record = f.backend.find_otp(&issued.otp_id).await.unwrap().unwrap();
        assert_eq!(record.status, OtpStatus::Sent);
        assert_eq!(record.code, f.notifier.last_code());
        assert_eq!(record.code.len(), 6);
        assert_eq!(record.created_at, f.clock.now());
    }

    #[tokio::test]
    async fn test_issue_rejects_bad_digit_count() {
        let f = setup();
        let err = f
            .engine
            .issue("user-1", OtpChannel::Email, "/x", "a@b.c", 2)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[tokio::test]
    async fn test_delivery_failure_does_not_fail_issue() {
        let clock = FrozenClock::at_unix(1_700_000_000);
        let backend = MemoryBackend::new();
        let engine = OtpChallengeEngine::new(
            Arc::new(backend.clone()),
            Arc::new(FailingNotifier),
            Arc::new(clock),
            OtpConfig::default(),
        );

        let issued = engine
            .issue("user-1", OtpChannel::Email, "/x", "someone@bank.test", 6)
            .await
            .unwrap();
        assert_eq!(issued.masked_contact, "so*****@bank.test");
        assert_eq!(issued.expiry_duration_ms, 900_000);
        assert!(backend.find_otp(&issued.otp_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_verify_then_spend_once() {
        let f = setup();
        let issued = f
            .engine
            .issue("user-1", OtpChannel::Sms, "/cards/pin", "5555550100", 6)
            .await
            .unwrap();
        let code = f.notifier.last_code();

        f.clock.advance(Duration::seconds(30));
        f.engine
            .verify("user-1", &issued.otp_id, &code, "/cards/pin")
            .await
            .unwrap();

        let record = f.backend.find_otp(&issued.otp_id).await.unwrap().unwrap();
        assert_eq!(record.status, OtpStatus::Verified);
        assert_eq!(record.used_at, Some(f.clock.now()));

        // 已 verify 的挑战不能再次 verify
        let err = f
            .engine
            .verify("user-1", &issued.otp_id, &code, "/cards/pin")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOtp);

        f.engine
            .spend("user-1", &issued.otp_id, "/cards/pin")
            .await
            .unwrap();
        let err = f
            .engine
            .spend("user-1", &issued.otp_id, "/cards/pin")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OtpExpired);

        let record = f.backend.find_otp(&issued.otp_id).await.unwrap().unwrap();
        assert_eq!(record.status, OtpStatus::Verified);
        assert!(record.challenge_expired_at.is_some());
    }

    #[tokio::test]
    async fn test_verify_rejections_share_one_message() {
        let f = setup();
        let issued = f
            .engine
            .issue("user-1", OtpChannel::Sms, "/a", "5555550100", 6)
            .await
            .unwrap();
        let code = f.notifier.last_code();

        let attempts = [
            f.engine.verify("user-1", "missing", &code, "/a").await,
            f.engine.verify("user-2", &issued.otp_id, &code, "/a").await,
            f.engine
                .verify("user-1", &issued.otp_id, &wrong(&code), "/a")
                .await,
            f.engine.verify("user-1", &issued.otp_id, &code, "/b").await,
        ];
        let reasons: Vec<OtpRejection> = attempts
            .into_iter()
            .map(|r| match r.unwrap_err() {
                AuthzError::InvalidOtp { reason } => reason,
                other => panic!("unexpected error: {other:?}"),
            })
            .collect();
        assert_eq!(
            reasons,
            vec![
                OtpRejection::NotFound,
                OtpRejection::OwnerMismatch,
                OtpRejection::CodeMismatch,
                OtpRejection::RouteMismatch,
            ]
        );

        // 失败的尝试不改变状态，正确的调用仍可成功
        f.engine
            .verify("user-1", &issued.otp_id, &code, "/a")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_verify_after_expiry_marks_expired() {
        let f = setup();
        let issued = f
            .engine
            .issue("user-1", OtpChannel::Sms, "/a", "5555550100", 6)
            .await
            .unwrap();
        let code = f.notifier.last_code();

        f.clock.advance(Duration::milliseconds(300_001));
        let err = f
            .engine
            .verify("user-1", &issued.otp_id, &code, "/a")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OtpExpired);
        assert_eq!(err.public_message(), "One Time Password is expired.");

        let record = f.backend.find_otp(&issued.otp_id).await.unwrap().unwrap();
        assert_eq!(record.status, OtpStatus::Expired);

        // 后续尝试继续失败，即便时钟回拨到有效期内也不会复活
        let err = f
            .engine
            .verify("user-1", &issued.otp_id, &wrong(&code), "/a")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OtpExpired);

        f.clock.advance(Duration::milliseconds(-300_001));
        let err = f
            .engine
            .verify("user-1", &issued.otp_id, &code, "/a")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOtp);
    }

    #[tokio::test]
    async fn test_verify_exactly_at_expiry_succeeds() {
        let f = setup();
        let issued = f
            .engine
            .issue("user-1", OtpChannel::Call, "/a", "5555550100", 4)
            .await
            .unwrap();
        let code = f.notifier.last_code();

        f.clock.advance(Duration::milliseconds(300_000));
        f.engine
            .verify("user-1", &issued.otp_id, &code, "/a")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_spend_requires_verify_and_route() {
        let f = setup();
        let issued = f
            .engine
            .issue("user-1", OtpChannel::Sms, "/a", "5555550100", 6)
            .await
            .unwrap();
        let code = f.notifier.last_code();

        let err = f.engine.spend("user-1", &issued.otp_id, "/a").await.unwrap_err();
        assert!(matches!(
            err,
            AuthzError::InvalidOtp {
                reason: OtpRejection::NotVerified
            }
        ));

        f.engine
            .verify("user-1", &issued.otp_id, &code, "/a")
            .await
            .unwrap();

        let err = f.engine.spend("user-1", &issued.otp_id, "/b").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOtp);
        let err = f.engine.spend("user-2", &issued.otp_id, "/a").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOtp);

        f.engine.spend("user-1", &issued.otp_id, "/a").await.unwrap();
    }
}
