//! DirectX 12 图形后端
//!
//! [`Dx12Device`] 是 [`GpuBackend`](crate::gfx::GpuBackend) 在 Windows 上的实现，
//! 渲染核心的命令批次、Fence、描述符池都直接映射到对应的 D3D12 对象。
//!
//! # 模块组织
//!
//! - `context`：适配器选择、设备、命令队列、Fence、交换链
//! - `descriptor`：描述符堆和视图描述
//! - `pipeline`：D3DCompile 编译、根签名、PSO
//! - `convert`：引擎枚举到 D3D12/DXGI 常量的转换
//! - `device`：`GpuBackend` 实现
//!
//! # 初始化流程
//!
//! 1. 启用调试层（配置开启且为 Debug 构建）
//! 2. 创建 DXGI 工厂，按高性能优先枚举硬件适配器
//! 3. 依次尝试 12.2 / 12.1 / 12.0 功能级别创建设备
//! 4. 创建直接命令队列、命令列表、Fence 和等待事件
//! 5. 从窗口句柄创建双缓冲 Flip 交换链

mod context;
mod convert;
mod descriptor;
mod device;
mod pipeline;

pub use device::Dx12Device;
pub use pipeline::Dx12Pipeline;
