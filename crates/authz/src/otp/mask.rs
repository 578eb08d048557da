//! 联系方式脱敏

use crate::types::OtpChannel;

/// 按渠道脱敏投递地址
pub fn mask_contact(channel: OtpChannel, contact: &str) -> String {
    match channel {
        OtpChannel::Sms | OtpChannel::Call => mask_phone(contact),
        OtpChannel::Email => mask_email(contact),
    }
}

/// `+1 (555) 555-0100` → `XXX-XXX-0100`
pub fn mask_phone(phone: &str) -> String {
    let digits: Vec<char> = phone.chars().filter(char::is_ascii_digit).collect();
    let tail: String = digits[digits.len().saturating_sub(4)..].iter().collect();
    format!("XXX-XXX-{tail}")
}

/// `jane.doe@example.com` → `ja******@example.com`
///
/// 一般规则是保留本地部分前两个字符、其余换成 `*`。本地部分不超过两个字符时
/// 刻意偏离该规则：整段用 `*` 替代（`ab@x.io` → `**@x.io`），不原样输出；
/// 至少输出一个 `*`
pub fn mask_email(email: &str) -> String {
    let (local, domain) = match email.rsplit_once('@') {
        Some((local, domain)) => (local, Some(domain)),
        None => (email, None),
    };

    let local_len = local.chars().count();
    let masked_local = if local_len <= 2 {
        "*".repeat(local_len.max(1))
    } else {
        let head: String = local.chars().take(2).collect();
        format!("{head}{}", "*".repeat(local_len - 2))
    };

    match domain {
        Some(domain) => format!("{masked_local}@{domain}"),
        None => masked_local,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_phone() {
        assert_eq!(mask_phone("+1 (555) 555-0100"), "XXX-XXX-0100");
        assert_eq!(mask_phone("5555550199"), "XXX-XXX-0199");
        assert_eq!(mask_phone("12"), "XXX-XXX-12");
    }

    #[test]
    fn test_mask_email() {
        assert_eq!(mask_email("jane.doe@example.com"), "ja******@example.com");
        assert_eq!(mask_email("abc@x.io"), "ab*@x.io");
        assert_eq!(mask_email("ab@x.io"), "**@x.io");
        assert_eq!(mask_email("a@x.io"), "*@x.io");
        assert_eq!(mask_email("@x.io"), "*@x.io");
    }

    #[test]
    fn test_mask_email_short_local_part_is_fully_hidden() {
        for local in ["q", "qz"] {
            let masked = mask_email(&format!("{local}@example.com"));
            let (masked_local, domain) = masked.split_once('@').unwrap();
            assert!(masked_local.chars().all(|c| c == '*'), "{masked}");
            assert_eq!(masked_local.len(), local.len());
            assert_eq!(domain, "example.com");
        }
    }

    #[test]
    fn test_mask_contact_dispatches_by_channel() {
        assert_eq!(
            mask_contact(OtpChannel::Call, "+15555550100"),
            "XXX-XXX-0100"
        );
        assert_eq!(
            mask_contact(OtpChannel::Email, "someone@bank.test"),
            "so*****@bank.test"
        );
    }
}
