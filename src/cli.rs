//! 命令行界面定义
//!
//! 定义了主程序的命令行参数和选项
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "stepup")]
#[command(version)]
#[command(
    about = "Step-up authorization core: single-use signable payloads, OTP challenges and cooldown locks"
)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub(crate) command: Option<Commands>,

    /// Configuration file path (defaults to searching standard locations)
    #[arg(short, long, default_value = "config.toml")]
    pub(crate) config: PathBuf,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Commands {
    /// Test configuration file
    Test {
        /// Configuration file path (optional, defaults to config.toml)
        #[arg(index = 1)]
        config_file: Option<PathBuf>,
    },

    /// Run one maintenance pass and print the report as JSON
    Purge,

    /// Print storage row counts as JSON
    Stats,

    /// Run one maintenance pass and print Prometheus metrics in text format
    Metrics,
}
