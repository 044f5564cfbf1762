//! 图形后端
//!
//! - `backend`：[`GpuBackend`] trait 和命令枚举
//! - `headless`：CPU 内存中的模拟设备，用于测试和非 Windows 平台
//! - `dx12`：Direct3D 12 实现（仅 Windows）

pub mod backend;
pub mod headless;
#[cfg(target_os = "windows")]
pub mod dx12;

pub use backend::{GpuBackend, GpuCommand};
pub use headless::HeadlessDevice;
#[cfg(target_os = "windows")]
pub use dx12::Dx12Device;
