//! 验证码生成与比较

use crate::config::OtpConfig;
use crate::error::{AuthzError, AuthzResult};
use rand::Rng;
use rand::rngs::OsRng;
use subtle::ConstantTimeEq;

/// 生成 `digits` 位纯数字验证码（允许前导 0）
pub fn generate_code(digits: u8) -> AuthzResult<String> {
    if !(OtpConfig::MIN_DIGITS..=OtpConfig::MAX_DIGITS).contains(&digits) {
        return Err(AuthzError::Config(format!(
            "OTP digit count {} out of range {}..={}",
            digits,
            OtpConfig::MIN_DIGITS,
            OtpConfig::MAX_DIGITS
        )));
    }

    let mut rng = OsRng;
    Ok((0..digits)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect())
}

/// 常量时间比较，长度不同直接不匹配
pub fn codes_match(expected: &str, submitted: &str) -> bool {
    expected.as_bytes().ct_eq(submitted.as_bytes()).into()
}
