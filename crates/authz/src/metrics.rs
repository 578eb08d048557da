//! 授权核心 Prometheus 指标
//!
//! 标签只包含结果分类，不包含用户 ID 或载荷 ID，避免基数爆炸。

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

lazy_static! {
    pub(crate) static ref PAYLOADS_CREATED: IntCounterVec = IntCounterVec::new(
        Opts::new("payloads_created_total", "Total number of signable payloads created")
            .namespace("stepup"),
        &["result"]
    ).unwrap();

    pub(crate) static ref PAYLOAD_CONSUME_ATTEMPTS: IntCounterVec = IntCounterVec::new(
        Opts::new("payload_consume_total", "Signable payload consume attempts by outcome")
            .namespace("stepup"),
        &["outcome"]
    ).unwrap();

    pub(crate) static ref OTP_ISSUED: IntCounterVec = IntCounterVec::new(
        Opts::new("otp_issued_total", "Total number of OTP challenges issued")
            .namespace("stepup"),
        &["channel", "delivery"]
    ).unwrap();

    pub(crate) static ref OTP_VERIFY_ATTEMPTS: IntCounterVec = IntCounterVec::new(
        Opts::new("otp_verify_total", "OTP verify attempts by outcome")
            .namespace("stepup"),
        &["outcome"]
    ).unwrap();

    pub(crate) static ref OTP_SPEND_ATTEMPTS: IntCounterVec = IntCounterVec::new(
        Opts::new("otp_spend_total", "OTP spend attempts by outcome")
            .namespace("stepup"),
        &["outcome"]
    ).unwrap();

    pub(crate) static ref COOLDOWN_ATTEMPTS: IntCounterVec = IntCounterVec::new(
        Opts::new("cooldown_acquire_total", "Cooldown lock acquire attempts by outcome")
            .namespace("stepup"),
        &["outcome"]
    ).unwrap();

    pub(crate) static ref MAINTENANCE_PURGED: IntCounterVec = IntCounterVec::new(
        Opts::new("maintenance_rows_total", "Rows touched by maintenance passes")
            .namespace("stepup"),
        &["kind"]
    ).unwrap();

    pub(crate) static ref MAINTENANCE_LAST_RUN: IntGauge = IntGauge::with_opts(
        Opts::new("maintenance_last_run_timestamp", "Unix timestamp of the last maintenance pass")
            .namespace("stepup")
    ).unwrap();
}

/// 注册授权核心 metrics 到给定 registry
pub fn register_authz_metrics(registry: &Registry) -> Result<(), prometheus::Error> {
    registry.register(Box::new(PAYLOADS_CREATED.clone()))?;
    registry.register(Box::new(PAYLOAD_CONSUME_ATTEMPTS.clone()))?;
    registry.register(Box::new(OTP_ISSUED.clone()))?;
    registry.register(Box::new(OTP_VERIFY_ATTEMPTS.clone()))?;
    registry.register(Box::new(OTP_SPEND_ATTEMPTS.clone()))?;
    registry.register(Box::new(COOLDOWN_ATTEMPTS.clone()))?;
    registry.register(Box::new(MAINTENANCE_PURGED.clone()))?;
    registry.register(Box::new(MAINTENANCE_LAST_RUN.clone()))?;
    Ok(())
}

/// 以 Prometheus 文本格式导出 registry 中的全部指标
pub fn export_metrics(registry: &Registry) -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;

    String::from_utf8(buffer)
        .map_err(|e| prometheus::Error::Msg(format!("Metrics output is not UTF-8: {e}")))
}
