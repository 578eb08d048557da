//! 可观测性配置（日志、指标导出）

use serde::{Deserialize, Serialize};

/// 可观测性配置
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ObservabilityConfig {
    /// 过滤级别
    ///
    /// 支持 EnvFilter 语法（如 "info,sqlx=warn"）。默认值 "info"。
    #[serde(default = "default_filter_level")]
    pub filter_level: String,

    #[serde(default)]
    pub log: LogConfig,

    /// Prometheus 文本格式指标文件路径
    ///
    /// 设置后守护进程每个维护周期覆盖写入一次，供 node_exporter textfile collector 采集
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_file: Option<String>,
}

/// 日志配置
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LogConfig {
    /// 日志输出目标
    ///
    /// - "console": 仅输出到控制台（默认）
    /// - "file": 输出到文件
    #[serde(default = "default_log_output")]
    pub output: String,

    /// 当 output = "file" 时有效：true 按天轮转，false 追加到单个文件
    #[serde(default)]
    pub rotate: bool,

    /// 日志目录，当 output = "file" 时有效
    #[serde(default = "default_log_path")]
    pub path: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            filter_level: default_filter_level(),
            log: LogConfig::default(),
            metrics_file: None,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            output: default_log_output(),
            rotate: false,
            path: default_log_path(),
        }
    }
}

fn default_log_output() -> String {
    "console".to_string()
}

fn default_log_path() -> String {
    "logs/".to_string()
}

fn default_filter_level() -> String {
    "info".to_string()
}

impl ObservabilityConfig {
    /// 校验过滤级别与输出目标
    pub fn validate(&self, errors: &mut Vec<String>) {
        let main_level = self.filter_level.split(',').next().unwrap_or("").trim();
        if !["trace", "debug", "info", "warn", "error"].contains(&main_level) {
            errors.push(format!(
                "Invalid filter level '{}', must start with one of: trace, debug, info, warn, error",
                self.filter_level
            ));
        }

        if !["console", "file"].contains(&self.log.output.as_str()) {
            errors.push(format!(
                "Invalid log output '{}' (observability.log.output), must be 'console' or 'file'",
                self.log.output
            ));
        }

        if self.log.output == "file" && self.log.path.trim().is_empty() {
            errors.push("observability.log.path cannot be empty when logging to file".to_string());
        }

        if matches!(&self.metrics_file, Some(path) if path.trim().is_empty()) {
            errors.push("observability.metrics_file cannot be empty when set".to_string());
        }
    }
}
