//! Kestrel - Direct3D 12 渲染引擎核心
//!
//! 提供一个单队列、双缓冲、多帧并行的渲染核心：命令批次与 Fence、呈现表面、
//! 描述符池、资源上传、纹理缓存和实例化粒子绘制。设备通过 [`gfx::GpuBackend`]
//! 抽象，Windows 上使用 Direct3D 12，其他平台和测试使用内存中的模拟设备。
//!
//! # 模块结构
//!
//! - `core`: 配置、日志、崩溃转储、错误类型、输入和场景切换
//! - `component`: 变换和相机组件
//! - `math`: 矩阵与颜色工具
//! - `gfx`: 图形后端抽象及 DX12 / headless 实现
//! - `renderer`: 渲染核心
//! - `engine`: 应用上下文，按顺序持有以上所有状态
//!
//! # 使用示例
//!
//! ```no_run
//! use kestrel_engine::core::Config;
//! use kestrel_engine::core::input::InputSystem;
//! use kestrel_engine::engine::Engine;
//! use kestrel_engine::gfx::headless::{CompletionMode, HeadlessDevice};
//!
//! let config = Config::default();
//! let device = HeadlessDevice::new(1280, 720, CompletionMode::Immediate);
//! let mut engine = Engine::new(device, &config).unwrap();
//!
//! let input = InputSystem::new(&config.input);
//! engine.run_frame(&input, 1.0 / 60.0).unwrap();
//! engine.shutdown().unwrap();
//! ```

pub mod component;
pub mod core;
pub mod engine;
pub mod gfx;
pub mod math;
pub mod renderer;
