//! 日志系统模块
//!
//! 基于 `tracing` 提供结构化的日志记录功能。
//!
//! # 特性
//!
//! - 结构化日志：支持键值对
//! - 控制台 + 文件双输出
//! - 每次运行一个日志文件：`<log_dir>/<YYYYMMDD_HHMMSS>.log`
//!
//! # 使用示例
//!
//! ```no_run
//! use kestrel_engine::core::config::LoggingConfig;
//! use kestrel_engine::core::log;
//!
//! let log_file = log::init_logger(&LoggingConfig::default()).unwrap();
//! tracing::info!(width = 1280, height = 720, "Window created");
//! ```

use std::path::{Path, PathBuf};

use tracing::Level;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use super::config::{LogLevel, LoggingConfig};
use super::error::{EngineError, Result};

/// 初始化日志系统
///
/// 必须在程序开始时调用一次。`RUST_LOG` 环境变量优先于配置中的级别。
///
/// # 返回值
///
/// 启用文件输出时返回本次运行的日志文件路径
pub fn init_logger(config: &LoggingConfig) -> Result<Option<PathBuf>> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(config.level.into()).into())
        .from_env_lossy();

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_ansi(true);

    if config.file_output {
        let directory = Path::new(&config.log_dir);
        std::fs::create_dir_all(directory)?;
        let filename = run_log_file_name(chrono::Local::now());

        // 每次运行一个文件，不滚动
        let file_appender = tracing_appender::rolling::never(directory, &filename);

        let file_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_ansi(false) // 文件不需要 ANSI 颜色
            .with_writer(file_appender);

        tracing_subscriber::registry()
            .with(filter)
            .with(console_layer)
            .with(file_layer)
            .try_init()
            .map_err(|e| EngineError::Log(e.to_string()))?;

        Ok(Some(directory.join(filename)))
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(console_layer)
            .try_init()
            .map_err(|e| EngineError::Log(e.to_string()))?;

        Ok(None)
    }
}

/// 本次运行的日志文件名
pub fn run_log_file_name<Tz: chrono::TimeZone>(now: chrono::DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("{}.log", now.format("%Y%m%d_%H%M%S"))
}

/// 引擎核心日志 - Info 级别
#[macro_export]
macro_rules! engine_info {
    ($($arg:tt)*) => {
        tracing::info!(target: "kestrel::engine", $($arg)*)
    };
}

/// 引擎核心日志 - Warn 级别
#[macro_export]
macro_rules! engine_warn {
    ($($arg:tt)*) => {
        tracing::warn!(target: "kestrel::engine", $($arg)*)
    };
}

/// 引擎核心日志 - Error 级别
#[macro_export]
macro_rules! engine_error {
    ($($arg:tt)*) => {
        tracing::error!(target: "kestrel::engine", $($arg)*)
    };
}

/// 日志级别转换
impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(Level::from(LogLevel::Info), Level::INFO);
        assert_eq!(Level::from(LogLevel::Error), Level::ERROR);
        assert_eq!(LevelFilter::from_level(LogLevel::Trace.into()), LevelFilter::TRACE);
    }

    #[test]
    fn test_run_log_file_name() {
        let now = chrono::Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(run_log_file_name(now), "20240309_070501.log");
    }
}
