//! 核心功能模块
//!
//! 与图形 API 无关的基础设施：配置、日志、错误类型、崩溃转储，以及输入和场景切换。
//!
//! # 模块组织
//!
//! - `config`：TOML 配置加载和命令行覆盖
//! - `log`：基于 `tracing` 的日志初始化
//! - `error`：统一错误类型
//! - `crash`：panic 钩子和崩溃转储
//! - `input`：键盘鼠标状态
//! - `scene`：场景状态机

pub mod config;
pub mod crash;
pub mod error;
pub mod input;
pub mod log;
pub mod scene;

pub use config::Config;
pub use error::{EngineError, Result};
