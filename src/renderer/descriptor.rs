//! 描述符管理模块
//!
//! 三个固定容量的描述符池（RTV、DSV、着色器可见的 CBV/SRV/UAV），
//! 按槽位线性分配，并根据槽位计算 CPU / GPU 句柄。
//!
//! # 设计原则
//!
//! - **单调分配**：只增不减，没有释放路径。工作负载是"启动时加载一次，之后一直使用"
//! - **槽 0 保留**：着色器可见池的槽 0 属于调试界面，普通分配从 1 开始
//! - **句柄计算**：`base + slot * increment`，纯计算，不访问设备
//!
//! # DirectX 12 描述符类型
//!
//! - **RTV** (Render Target View)：渲染目标视图，用于渲染输出
//! - **DSV** (Depth Stencil View)：深度模板视图，用于深度测试
//! - **SRV** (Shader Resource View)：着色资源视图，用于着色器读取纹理/结构化缓冲

use tracing::{debug, trace};

use crate::core::config::ViewPoolConfig;
use crate::core::error::{ContractViolation, GraphicsError, Result};
use crate::gfx::backend::GpuBackend;

use super::resource::TextureFormat;

/// 着色器可见池中保留给调试界面的槽位
pub const OVERLAY_SLOT: u32 = 0;

/// 描述符池类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    /// 渲染目标视图 (RTV)
    RenderTarget,
    /// 深度模板视图 (DSV)
    DepthStencil,
    /// 着色器可见的 CBV/SRV/UAV
    ShaderVisible,
}

impl PoolKind {
    /// 描述符池是否需要着色器可见
    pub fn is_shader_visible(&self) -> bool {
        matches!(self, PoolKind::ShaderVisible)
    }

    /// 获取描述符池名称
    pub fn name(&self) -> &'static str {
        match self {
            PoolKind::RenderTarget => "render-target",
            PoolKind::DepthStencil => "depth-stencil",
            PoolKind::ShaderVisible => "shader-visible",
        }
    }
}

/// 描述符句柄（CPU 可见）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CpuDescriptorHandle {
    /// 句柄指针值
    pub ptr: usize,
}

impl CpuDescriptorHandle {
    pub fn new(ptr: usize) -> Self {
        Self { ptr }
    }

    /// 偏移 `index` 个描述符
    pub fn offset(&self, index: u32, increment: u32) -> Self {
        Self { ptr: self.ptr + index as usize * increment as usize }
    }
}

/// 描述符句柄（GPU 可见）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GpuDescriptorHandle {
    /// 句柄指针值
    pub ptr: u64,
}

impl GpuDescriptorHandle {
    pub fn new(ptr: u64) -> Self {
        Self { ptr }
    }

    /// 偏移 `index` 个描述符
    pub fn offset(&self, index: u32, increment: u32) -> Self {
        Self { ptr: self.ptr + index as u64 * increment as u64 }
    }
}

/// 后端创建的描述符堆的起始地址和步长
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorHeapInfo {
    pub cpu_start: CpuDescriptorHandle,
    /// 仅着色器可见堆有 GPU 地址
    pub gpu_start: Option<GpuDescriptorHandle>,
    /// 单个描述符的字节跨度
    pub increment: u32,
}

/// 视图类型及参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewDesc {
    /// 2D 纹理 SRV
    Texture2D { format: TextureFormat, mip_levels: u32 },
    /// 结构化缓冲 SRV
    StructuredBuffer { num_elements: u32, stride: u32 },
    /// 渲染目标视图
    RenderTarget { format: TextureFormat },
    /// 深度模板视图
    DepthStencil { format: TextureFormat },
}

impl ViewDesc {
    /// 该视图应放在哪个池中
    pub fn pool(&self) -> PoolKind {
        match self {
            ViewDesc::Texture2D { .. } | ViewDesc::StructuredBuffer { .. } => PoolKind::ShaderVisible,
            ViewDesc::RenderTarget { .. } => PoolKind::RenderTarget,
            ViewDesc::DepthStencil { .. } => PoolKind::DepthStencil,
        }
    }
}

/// 单个描述符池
#[derive(Debug)]
pub struct ViewSlotPool {
    kind: PoolKind,
    capacity: u32,
    next_free: u32,
    heap: DescriptorHeapInfo,
}

impl ViewSlotPool {
    pub fn new(kind: PoolKind, capacity: u32, heap: DescriptorHeapInfo) -> Self {
        // 着色器可见池的槽 0 从一开始就归调试界面所有
        let next_free = if kind.is_shader_visible() { OVERLAY_SLOT + 1 } else { 0 };
        Self { kind, capacity, next_free, heap }
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// 下一个将分配的槽位
    pub fn next_free(&self) -> u32 {
        self.next_free
    }

    pub fn can_allocate(&self) -> bool {
        self.next_free < self.capacity
    }

    /// 分配下一个槽位，池满时返回错误
    pub fn allocate(&mut self) -> Result<u32> {
        if !self.can_allocate() {
            return Err(GraphicsError::PoolExhausted {
                pool: self.kind.name(),
                capacity: self.capacity,
            }
            .into());
        }
        let slot = self.next_free;
        self.next_free += 1;
        trace!(pool = self.kind.name(), slot, "View slot allocated");
        Ok(slot)
    }

    /// 槽位是否已经被分配
    pub fn is_allocated(&self, slot: u32) -> bool {
        slot < self.next_free
    }

    pub fn cpu_handle(&self, slot: u32) -> CpuDescriptorHandle {
        self.heap.cpu_start.offset(slot, self.heap.increment)
    }

    pub fn gpu_handle(&self, slot: u32) -> Option<GpuDescriptorHandle> {
        self.heap.gpu_start.map(|start| start.offset(slot, self.heap.increment))
    }

    pub fn heap(&self) -> &DescriptorHeapInfo {
        &self.heap
    }
}

/// 描述符槽分配器
///
/// 持有三个池，由应用上下文独占，只在驱动线程上访问。
#[derive(Debug)]
pub struct ViewSlotAllocator {
    render_target: ViewSlotPool,
    depth_stencil: ViewSlotPool,
    shader_visible: ViewSlotPool,
    overlay_claimed: bool,
}

impl ViewSlotAllocator {
    /// 在设备上创建三个描述符堆
    pub fn new<B: GpuBackend>(backend: &mut B, pools: &ViewPoolConfig) -> Result<Self> {
        let mut make = |kind: PoolKind, capacity: u32| -> Result<ViewSlotPool> {
            let heap = backend.create_descriptor_heap(kind, capacity)?;
            if kind.is_shader_visible() && heap.gpu_start.is_none() {
                return Err(GraphicsError::ResourceCreation(
                    "shader-visible descriptor heap has no GPU address".to_string(),
                )
                .into());
            }
            debug!(
                pool = kind.name(),
                capacity,
                increment = heap.increment,
                "Descriptor heap created"
            );
            Ok(ViewSlotPool::new(kind, capacity, heap))
        };

        Ok(Self {
            render_target: make(PoolKind::RenderTarget, pools.render_target)?,
            depth_stencil: make(PoolKind::DepthStencil, pools.depth_stencil)?,
            shader_visible: make(PoolKind::ShaderVisible, pools.shader_visible)?,
            overlay_claimed: false,
        })
    }

    pub fn pool(&self, kind: PoolKind) -> &ViewSlotPool {
        match kind {
            PoolKind::RenderTarget => &self.render_target,
            PoolKind::DepthStencil => &self.depth_stencil,
            PoolKind::ShaderVisible => &self.shader_visible,
        }
    }

    fn pool_mut(&mut self, kind: PoolKind) -> &mut ViewSlotPool {
        match kind {
            PoolKind::RenderTarget => &mut self.render_target,
            PoolKind::DepthStencil => &mut self.depth_stencil,
            PoolKind::ShaderVisible => &mut self.shader_visible,
        }
    }

    pub fn allocate(&mut self, kind: PoolKind) -> Result<u32> {
        self.pool_mut(kind).allocate()
    }

    pub fn can_allocate(&self, kind: PoolKind) -> bool {
        self.pool(kind).can_allocate()
    }

    /// 领取调试界面的保留槽位（着色器可见池槽 0）
    ///
    /// 只能领取一次。
    pub fn claim_overlay_slot(&mut self) -> Result<u32> {
        if self.overlay_claimed {
            return Err(ContractViolation::OverlaySlotAlreadyClaimed.into());
        }
        self.overlay_claimed = true;
        debug!(slot = OVERLAY_SLOT, "Overlay view slot claimed");
        Ok(OVERLAY_SLOT)
    }

    pub fn cpu_handle(&self, kind: PoolKind, slot: u32) -> CpuDescriptorHandle {
        self.pool(kind).cpu_handle(slot)
    }

    /// 着色器可见槽位的 CPU / GPU 句柄
    pub fn shader_visible_handles(&self, slot: u32) -> (CpuDescriptorHandle, GpuDescriptorHandle) {
        let pool = &self.shader_visible;
        let cpu = pool.cpu_handle(slot);
        // 构造时已保证着色器可见堆有 GPU 起始地址
        let gpu = pool.gpu_handle(slot).unwrap_or(GpuDescriptorHandle::new(0));
        (cpu, gpu)
    }

    /// 在已分配的槽位上创建视图
    ///
    /// 覆盖一个仍被在飞 GPU 工作引用的槽位是调用方的责任。
    pub fn create_view<B: GpuBackend>(
        &self,
        backend: &mut B,
        slot: u32,
        resource: &B::Resource,
        view: &ViewDesc,
    ) -> Result<()> {
        let kind = view.pool();
        let pool = self.pool(kind);
        if !pool.is_allocated(slot) || slot >= pool.capacity() {
            return Err(ContractViolation::SlotNotAllocated { pool: kind.name(), slot }.into());
        }

        backend.create_view(kind, pool.cpu_handle(slot), resource, view)?;
        trace!(pool = kind.name(), slot, view = ?view, "View created");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap(cpu: usize, gpu: Option<u64>, increment: u32) -> DescriptorHeapInfo {
        DescriptorHeapInfo {
            cpu_start: CpuDescriptorHandle::new(cpu),
            gpu_start: gpu.map(GpuDescriptorHandle::new),
            increment,
        }
    }

    #[test]
    fn test_pool_kind() {
        assert!(PoolKind::ShaderVisible.is_shader_visible());
        assert!(!PoolKind::RenderTarget.is_shader_visible());
        assert_eq!(PoolKind::DepthStencil.name(), "depth-stencil");
    }

    #[test]
    fn test_cpu_descriptor_handle_offset() {
        let handle = CpuDescriptorHandle::new(1000);
        assert_eq!(handle.offset(5, 32).ptr, 1160); // 1000 + 5 * 32
    }

    #[test]
    fn test_gpu_descriptor_handle_offset() {
        let handle = GpuDescriptorHandle::new(2000);
        assert_eq!(handle.offset(10, 32).ptr, 2320); // 2000 + 10 * 32
    }

    #[test]
    fn test_allocation_is_monotonic() {
        let mut pool = ViewSlotPool::new(PoolKind::RenderTarget, 8, heap(1000, None, 32));
        let mut last = None;
        while pool.can_allocate() {
            let slot = pool.allocate().unwrap();
            if let Some(prev) = last {
                assert!(slot > prev);
            }
            last = Some(slot);
        }
        assert_eq!(last, Some(7));
        assert_eq!(pool.next_free(), pool.capacity());
        assert!(!pool.can_allocate());
        assert!(pool.allocate().is_err());
    }

    #[test]
    fn test_can_allocate_exactly_at_capacity() {
        let mut pool = ViewSlotPool::new(PoolKind::DepthStencil, 2, heap(0, None, 8));
        assert!(pool.can_allocate());
        pool.allocate().unwrap();
        assert!(pool.can_allocate());
        pool.allocate().unwrap();
        assert!(!pool.can_allocate());
    }

    #[test]
    fn test_shader_visible_skips_overlay_slot() {
        let mut pool = ViewSlotPool::new(PoolKind::ShaderVisible, 4, heap(1000, Some(5000), 32));
        assert_eq!(pool.allocate().unwrap(), 1);
        assert_eq!(pool.allocate().unwrap(), 2);
        assert_eq!(pool.allocate().unwrap(), 3);
        assert!(pool.allocate().is_err());
    }

    #[test]
    fn test_slot_addresses_are_exact() {
        let pool = ViewSlotPool::new(PoolKind::ShaderVisible, 16, heap(0x1000, Some(0x8000), 48));
        for slot in 0..16 {
            assert_eq!(pool.cpu_handle(slot).ptr, 0x1000 + slot as usize * 48);
            assert_eq!(pool.gpu_handle(slot).unwrap().ptr, 0x8000 + slot as u64 * 48);
        }
        // 相邻槽位之间正好相差一个步长
        assert_eq!(pool.cpu_handle(3).ptr - pool.cpu_handle(2).ptr, 48);
    }

    #[test]
    fn test_non_shader_visible_has_no_gpu_handle() {
        let pool = ViewSlotPool::new(PoolKind::RenderTarget, 2, heap(64, None, 32));
        assert!(pool.gpu_handle(0).is_none());
    }

    #[test]
    fn test_view_desc_pool() {
        let tex = ViewDesc::Texture2D { format: TextureFormat::Rgba8UnormSrgb, mip_levels: 4 };
        let buf = ViewDesc::StructuredBuffer { num_elements: 10, stride: 144 };
        assert_eq!(tex.pool(), PoolKind::ShaderVisible);
        assert_eq!(buf.pool(), PoolKind::ShaderVisible);
        assert_eq!(ViewDesc::DepthStencil { format: TextureFormat::Depth24UnormStencil8 }.pool(), PoolKind::DepthStencil);
    }
}
