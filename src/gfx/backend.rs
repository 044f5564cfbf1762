//! 图形后端抽象
//!
//! 渲染核心（命令批次、Fence、描述符池、上传管线、纹理缓存、粒子）只通过
//! [`GpuBackend`] 与设备交互。具体实现：
//!
//! - `dx12`：Direct3D 12 设备（仅 Windows）
//! - `headless`：内存中的模拟设备，GPU 时间线可以手动推进，用于测试

use std::fmt;
use std::path::Path;

use crate::core::error::Result;
use crate::renderer::descriptor::{CpuDescriptorHandle, DescriptorHeapInfo, GpuDescriptorHandle, PoolKind, ViewDesc};
use crate::renderer::resource::{ClearValue, MemoryKind, ResourceDesc, ResourceState, TextureMetadata, UploadLayout};
use crate::renderer::shaders::{PipelineDesc, ShaderBlob};

/// 设备支持的 Direct3D 功能级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FeatureLevel {
    Level12_0,
    Level12_1,
    Level12_2,
}

impl FeatureLevel {
    /// 创建设备时依次尝试的功能级别，从高到低
    pub const CANDIDATES: [FeatureLevel; 3] = [FeatureLevel::Level12_2, FeatureLevel::Level12_1, FeatureLevel::Level12_0];

    pub fn name(&self) -> &'static str {
        match self {
            FeatureLevel::Level12_0 => "12.0",
            FeatureLevel::Level12_1 => "12.1",
            FeatureLevel::Level12_2 => "12.2",
        }
    }
}

/// 选中的物理适配器信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterInfo {
    pub name: String,
    pub vendor_id: u32,
    pub device_id: u32,
    /// 独占显存（字节）
    pub dedicated_video_memory: u64,
    pub feature_level: FeatureLevel,
}

/// 录制到命令列表中的一条命令
///
/// `R` 是资源句柄类型，`P` 是管线句柄类型。
#[derive(Debug)]
pub enum GpuCommand<'a, R, P> {
    /// 资源状态转换屏障
    Barrier { resource: &'a R, before: ResourceState, after: ResourceState },
    /// 缓冲区到缓冲区复制
    CopyBuffer { dst: &'a R, src: &'a R, size: u64 },
    /// 暂存缓冲到纹理的逐子资源复制
    CopyTexture { dst: &'a R, src: &'a R, layout: &'a UploadLayout },
    SetRenderTargets { rtv: CpuDescriptorHandle, dsv: Option<CpuDescriptorHandle> },
    ClearRenderTarget { rtv: CpuDescriptorHandle, color: [f32; 4] },
    ClearDepth { dsv: CpuDescriptorHandle, depth: f32 },
    /// 视口与裁剪矩形（覆盖整个目标）
    SetViewport { width: u32, height: u32 },
    /// 绑定着色器可见描述符堆
    SetDescriptorHeap,
    SetPipeline(&'a P),
    /// 根参数：描述符表
    SetRootDescriptorTable { index: u32, base: GpuDescriptorHandle },
    /// 根参数：常量缓冲地址
    SetRootConstantBuffer { index: u32, buffer: &'a R },
    /// 绑定槽 0 的顶点缓冲
    SetVertexBuffer { buffer: &'a R, stride: u32, size: u64 },
    DrawInstanced { vertex_count: u32, instance_count: u32 },
}

/// 后端命令的简写
pub type Command<'a, B> = GpuCommand<'a, <B as GpuBackend>::Resource, <B as GpuBackend>::Pipeline>;

/// 统一的 GPU 设备接口
///
/// 渲染核心假设只有一个驱动线程，所有方法都通过 `&mut self` 调用。
pub trait GpuBackend {
    /// 资源句柄
    type Resource: Clone + fmt::Debug;
    /// 管线状态句柄
    type Pipeline: fmt::Debug;

    fn backend_name(&self) -> &str;

    fn adapter_info(&self) -> &AdapterInfo;

    // ========== 资源 ==========

    /// 创建提交资源（committed resource）
    fn create_resource(
        &mut self,
        desc: &ResourceDesc,
        memory: MemoryKind,
        initial_state: ResourceState,
        clear: Option<ClearValue>,
    ) -> Result<Self::Resource>;

    /// 写入上传堆资源的映射内存
    fn write_mapped(&mut self, resource: &Self::Resource, offset: u64, data: &[u8]) -> Result<()>;

    /// 释放资源。调用方保证 GPU 不再引用它
    fn release_resource(&mut self, resource: Self::Resource);

    /// 纹理上传时暂存缓冲的布局
    fn upload_layout(&self, meta: &TextureMetadata) -> UploadLayout {
        UploadLayout::for_texture(meta)
    }

    // ========== 描述符 ==========

    fn create_descriptor_heap(&mut self, kind: PoolKind, capacity: u32) -> Result<DescriptorHeapInfo>;

    fn create_view(
        &mut self,
        kind: PoolKind,
        handle: CpuDescriptorHandle,
        resource: &Self::Resource,
        view: &ViewDesc,
    ) -> Result<()>;

    // ========== 命令录制与提交 ==========

    /// 重置指定的命令分配器，并让命令列表进入录制状态
    fn reset_commands(&mut self, allocator_index: usize) -> Result<()>;

    fn record(&mut self, command: Command<'_, Self>) -> Result<()>;

    fn close_commands(&mut self) -> Result<()>;

    /// 把已关闭的命令列表提交到队列，立即返回
    fn execute_commands(&mut self) -> Result<()>;

    // ========== Fence ==========

    /// 在队列上排入一个 Fence 信号
    fn signal(&mut self, value: u64) -> Result<()>;

    /// GPU 已完成的 Fence 值
    fn completed_value(&self) -> u64;

    /// 阻塞等待 GPU 到达 `value`，使用操作系统事件而不是自旋
    fn wait_for_value(&mut self, value: u64) -> Result<()>;

    // ========== 交换链 ==========

    fn back_buffer(&self, index: usize) -> Result<Self::Resource>;

    /// 当前应渲染的后缓冲索引（不是正在显示的那一个）
    fn current_back_buffer_index(&self) -> usize;

    fn present(&mut self, vsync: bool) -> Result<()>;

    /// 调整交换链尺寸。调用前所有后缓冲引用必须已释放
    fn resize_surface(&mut self, width: u32, height: u32) -> Result<()>;

    fn surface_size(&self) -> (u32, u32);

    // ========== 着色器与管线 ==========

    fn compile_shader(&mut self, path: &Path, profile: &str) -> Result<ShaderBlob>;

    fn create_pipeline(&mut self, desc: &PipelineDesc) -> Result<Self::Pipeline>;
}
