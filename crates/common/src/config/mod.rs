//! 统一配置管理系统
//!
//! 本模块是 stepup 服务配置的"单一真理之源"。
//! 所有配置项的定义、文档、默认值都在这里统一管理。

pub mod maintenance;
pub mod observability;

pub use maintenance::MaintenanceConfig;
pub use observability::{LogConfig, ObservabilityConfig};

use crate::error::ConfigError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::{Path, PathBuf};
use stepup_authz::{AuthzConfig, StorageBackend};

/// stepup 服务主配置
///
/// 配置文件使用 TOML 格式，所有段落都有默认值。
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StepupConfig {
    /// 服务器实例名称
    ///
    /// 用于在日志中区分不同实例，如 stepup-01, stepup-prod-east-1。
    pub name: String,

    /// 运行环境标识
    ///
    /// - "dev": 开发环境，允许内存存储
    /// - "prod": 生产环境，严格检查
    /// - "test": 测试环境，用于自动化测试
    pub env: String,

    /// SQLite 数据库文件存储目录路径
    ///
    /// 数据库文件为 `{sqlite_path}/{authz.storage.sqlite.file_name}`。
    #[serde(
        serialize_with = "serialize_pathbuf",
        deserialize_with = "deserialize_pathbuf"
    )]
    pub sqlite_path: PathBuf,

    /// 可观测性配置（日志）
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// 授权核心配置：存储后端、载荷 TTL、OTP 位数与有效期
    #[serde(default)]
    pub authz: AuthzConfig,

    /// 后台维护配置
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
}

fn serialize_pathbuf<S>(path: &Path, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    path.display().to_string().serialize(serializer)
}

fn deserialize_pathbuf<'de, D>(deserializer: D) -> Result<PathBuf, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    Ok(PathBuf::from(s))
}

impl Default for StepupConfig {
    fn default() -> Self {
        Self {
            name: "stepup-default".to_string(),
            env: "dev".to_string(),
            sqlite_path: PathBuf::from("database"),
            observability: ObservabilityConfig::default(),
            authz: AuthzConfig::default(),
            maintenance: MaintenanceConfig::default(),
        }
    }
}

impl StepupConfig {
    /// 返回可观测性配置引用
    pub fn observability_config(&self) -> &ObservabilityConfig {
        &self.observability
    }

    /// 返回日志配置引用
    pub fn log_config(&self) -> &LogConfig {
        &self.observability.log
    }

    /// 检查是否使用控制台日志输出
    pub fn is_console_logging(&self) -> bool {
        self.observability.log.output == "console"
    }

    /// 检查是否应该轮转日志
    pub fn should_rotate_logs(&self) -> bool {
        self.observability.log.output == "file" && self.observability.log.rotate
    }

    /// 获取日志过滤级别，优先使用 RUST_LOG
    pub fn get_filter_level(&self) -> String {
        std::env::var("RUST_LOG")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| self.observability.filter_level.clone())
    }

    /// 从文件加载配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();

        if !path_ref.exists() {
            return Err(ConfigError::FileNotFound {
                path: path_ref.to_path_buf(),
            });
        }

        if !path_ref.is_file() {
            return Err(ConfigError::NotAFile {
                path: path_ref.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_ref.to_path_buf(),
            source,
        })?;

        Self::from_toml(&content)
    }

    /// 从 TOML 字符串加载配置
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// 将配置序列化为 TOML 字符串
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string(self)?)
    }

    /// 验证配置有效性
    ///
    /// 返回的列表中以 "Warning:" 开头的是建议项，其余为错误。
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push("Instance name cannot be empty".to_string());
        }

        if !["dev", "prod", "test"].contains(&self.env.as_str()) {
            errors.push(format!(
                "Invalid environment '{}', must be one of: dev, prod, test",
                self.env
            ));
        }

        self.observability.validate(&mut errors);

        if self
            .sqlite_path
            .to_str()
            .map(|s| s.trim().is_empty())
            .unwrap_or(true)
        {
            errors.push("SQLite database path cannot be empty".to_string());
        }

        if let Err(authz_errors) = self.authz.validate() {
            errors.extend(authz_errors);
        }

        if self.maintenance.interval_secs == 0 {
            errors.push("maintenance.interval_secs must be greater than 0".to_string());
        }

        // 生产环境额外检查
        if self.env == "prod" {
            if self.authz.storage.backend == StorageBackend::Memory {
                errors.push(
                    "Memory storage backend is not allowed in production (authz.storage.backend)"
                        .to_string(),
                );
            }

            if self.observability.log.output == "console" {
                errors.push("Warning: Production environment should use file logging (observability.log.output = \"file\")".to_string());
            }

            if self.observability.log.output == "file" && !self.observability.log.rotate {
                errors.push("Warning: Production environment should enable log rotation (observability.log.rotate = true)".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// 只保留非警告类问题
    pub fn validation_errors(&self) -> Vec<String> {
        match self.validate() {
            Ok(()) => Vec::new(),
            Err(errors) => errors
                .into_iter()
                .filter(|e| !e.starts_with("Warning:"))
                .collect(),
        }
    }
}
