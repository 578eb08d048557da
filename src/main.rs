//! Step-up 授权核心主程序
//!
//! 打开授权核心存储，运行后台维护循环，或执行一次性的维护 / 统计命令

mod cli;
mod error;
mod observability;

use anyhow::Context;
use clap::Parser;
use observability::init_observability;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stepup_authz::{
    AuthzCore, LoggingNotifier, SystemClock, export_metrics, register_authz_metrics,
};
use stepup_common::StepupConfig;

use tracing::{debug, error, info, warn};

macro_rules! bootstrap_info {
    ($($arg:tt)*) => {
        eprintln!($($arg)*);
    };
}

macro_rules! bootstrap_error {
    ($($arg:tt)*) => {
        eprintln!($($arg)*);
    };
}

use cli::{Cli, Commands};
use error::{Error, Result};

/// 主程序运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunMode {
    /// 周期维护，直到 Ctrl-C
    Daemon,
    /// 执行一次维护并输出报告
    Purge,
    /// 输出存储统计
    Stats,
    /// 执行一次维护并输出 Prometheus 指标
    Metrics,
}

/// Application launcher utilities
struct ApplicationLauncher;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mode = match &cli.command {
        Some(Commands::Test { config_file }) => {
            let config_path =
                ApplicationLauncher::find_config_file(config_file.as_ref().unwrap_or(&cli.config))?;
            return ApplicationLauncher::test_config_file(&config_path);
        }
        Some(Commands::Purge) => RunMode::Purge,
        Some(Commands::Stats) => RunMode::Stats,
        Some(Commands::Metrics) => RunMode::Metrics,
        None => RunMode::Daemon,
    };

    let config_path = ApplicationLauncher::find_config_file(&cli.config)?;

    // Create Tokio runtime（before running the application）
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(ApplicationLauncher::run_application(&config_path, mode))
}

impl ApplicationLauncher {
    /// Find config file with fallback locations
    fn find_config_file(provided_path: &PathBuf) -> Result<PathBuf> {
        // If the provided path is not the default "config.toml", check if it exists
        if provided_path != Path::new("config.toml") {
            if provided_path.exists() {
                bootstrap_info!("Using provided config file: {:?}", provided_path);
                return Ok(provided_path.clone());
            } else {
                bootstrap_error!("Provided config file not found: {:?}", provided_path);
                return Err(Error::custom(format!(
                    "Config file not found: {provided_path:?}"
                )));
            }
        }

        let fallback_paths = vec![
            // 1. Current working directory
            PathBuf::from("config.toml"),
            // 2. System config directory
            PathBuf::from("/etc/stepup/config.toml"),
        ];

        bootstrap_info!("Searching for config file in default locations...");

        for path in &fallback_paths {
            if path.exists() {
                bootstrap_info!("Found config file: {:?}", path);
                return Ok(path.clone());
            } else {
                bootstrap_info!("Config not found at: {:?}", path);
            }
        }

        bootstrap_error!("No configuration file found!");
        bootstrap_error!("Please create a config file in one of these locations:");
        for (i, path) in fallback_paths.iter().enumerate() {
            bootstrap_error!("  {}. {:?}", i + 1, path);
        }
        bootstrap_error!("Or specify a custom path with: stepup --config <path>");

        Err(Error::custom(
            "No configuration file found. Please create one or specify path with --config",
        ))
    }

    /// 加载并校验配置；只有警告时继续
    fn load_config(config_path: &Path) -> Result<StepupConfig> {
        let config = match StepupConfig::from_file(config_path) {
            Ok(config) => config,
            Err(e) => {
                bootstrap_error!("❌ 配置解析失败: {}", e);
                return Err(Error::service_validation(format!("配置解析失败: {e}")));
            }
        };

        if let Err(errors) = config.validate() {
            bootstrap_error!("配置验证发现问题:");
            let mut has_critical_errors = false;
            for (i, err) in errors.iter().enumerate() {
                if err.starts_with("Warning:") {
                    bootstrap_info!("  {}. ⚠️  {}", i + 1, err);
                } else {
                    bootstrap_error!("  {}. ❌ {}", i + 1, err);
                    has_critical_errors = true;
                }
            }
            if has_critical_errors {
                return Err(Error::service_validation("配置验证失败，请修复上述错误"));
            }
        }

        Ok(config)
    }

    /// 测试配置文件是否有效
    fn test_config_file(config_path: &Path) -> Result<()> {
        Self::load_config(config_path)?;
        bootstrap_info!("✅ 配置验证通过: {:?}", config_path);
        Ok(())
    }

    /// 运行应用程序的主入口
    async fn run_application(config_path: &Path, mode: RunMode) -> Result<()> {
        bootstrap_info!("📄 加载配置文件: {:?}", config_path);
        let config = Self::load_config(config_path)?;

        let _observability_guard = init_observability(&config)?;

        std::fs::create_dir_all(&config.sqlite_path).with_context(|| {
            format!(
                "Failed to create SQLite data directory: {}",
                config.sqlite_path.display()
            )
        })?;

        let core = AuthzCore::from_config(
            &config.authz,
            &config.sqlite_path,
            Arc::new(SystemClock),
            Arc::new(LoggingNotifier),
        )
        .await
        .map_err(|e| Error::service_startup(format!("授权核心初始化失败: {e}")))?;

        info!(
            "✅ {} 就绪 (env={}, backend={})",
            config.name,
            config.env,
            core.storage.backend_name()
        );

        match mode {
            RunMode::Purge => {
                let report = core.maintenance.run_once().await?;
                println!("{}", serde_json::to_string_pretty(&report)?);
                Ok(())
            }
            RunMode::Stats => {
                let stats = core.maintenance.stats().await?;
                println!("{}", serde_json::to_string_pretty(&stats)?);
                Ok(())
            }
            RunMode::Metrics => {
                let registry = prometheus::Registry::new();
                register_authz_metrics(&registry)?;
                core.maintenance.run_once().await?;
                print!("{}", export_metrics(&registry)?);
                Ok(())
            }
            RunMode::Daemon => Self::run_daemon(&config, core).await,
        }
    }

    /// 周期维护直到收到 Ctrl-C
    async fn run_daemon(config: &StepupConfig, core: AuthzCore) -> Result<()> {
        let registry = prometheus::Registry::new();
        if let Err(e) = register_authz_metrics(&registry) {
            warn!("Prometheus metrics registration warning: {}", e);
        } else {
            info!("✅ Prometheus metrics registry 初始化成功");
        }

        let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(10);
        setup_ctrl_c_handler(shutdown_tx.clone());

        let maintenance = core.maintenance.clone();
        let interval = config.maintenance.interval();
        let handle = tokio::spawn(async move {
            maintenance.run_periodic(interval, shutdown_rx).await;
        });

        info!("🚀 维护循环已启动，间隔 {:?}", interval);

        let exporter = tokio::spawn(run_metrics_exporter(
            registry,
            config.observability.metrics_file.clone().map(PathBuf::from),
            interval,
            shutdown_tx.subscribe(),
        ));

        if let Err(e) = handle.await {
            error!("Maintenance task terminated unexpectedly: {}", e);
            let _ = shutdown_tx.send(());
            return Err(e.into());
        }

        if let Err(e) = exporter.await {
            warn!("Metrics exporter task terminated unexpectedly: {}", e);
        }

        info!("🛑 stepup 已安全关闭");
        Ok(())
    }
}

/// 每个维护周期导出一次指标；未配置文件时输出到 debug 日志
async fn run_metrics_exporter(
    registry: prometheus::Registry,
    metrics_file: Option<PathBuf>,
    period: std::time::Duration,
    mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let text = match export_metrics(&registry) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to encode metrics: {}", e);
                        continue;
                    }
                };
                match &metrics_file {
                    Some(path) => {
                        if let Err(e) = write_metrics_file(path, &text).await {
                            warn!("Failed to write metrics file {:?}: {}", path, e);
                        }
                    }
                    None => debug!("Metrics snapshot:\n{}", text),
                }
            }
            _ = shutdown_rx.recv() => {
                debug!("Metrics exporter stopped");
                break;
            }
        }
    }
}

/// 先写临时文件再 rename，采集方不会读到半截内容
async fn write_metrics_file(path: &Path, text: &str) -> std::io::Result<()> {
    let tmp = path.with_extension("prom.tmp");
    tokio::fs::write(&tmp, text).await?;
    tokio::fs::rename(&tmp, path).await
}

/// 设置Ctrl-C信号处理程序
fn setup_ctrl_c_handler(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("无法监听Ctrl-C信号: {}", e);
            return;
        }
        info!("收到Ctrl-C信号，开始优雅关闭...");
        let _ = shutdown_tx.send(());
    });
}
