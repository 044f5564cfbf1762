//! 呈现表面
//!
//! 双缓冲交换链的 CPU 侧视图：两个后缓冲、各自的 RTV 槽位，以及本帧所处的阶段。
//!
//! # 帧内阶段
//!
//! ```text
//! Idle --begin_render--> Rendering(i) --end_render--> ReadyToPresent(i) --present--> Idle
//! ```
//!
//! `begin_render` 录制 Present -> RenderTarget，`end_render` 录制 RenderTarget -> Present，
//! 每帧各一次。跳过任意一步就呈现会返回契约错误。

use tracing::{debug, info};

use crate::core::error::{ContractViolation, GraphicsError, Result};
use crate::gfx::backend::GpuBackend;

use super::command::CommandBatch;
use super::descriptor::{CpuDescriptorHandle, PoolKind, ViewDesc, ViewSlotAllocator};
use super::resource::{MemoryKind, ResourceDesc, ResourceState, TextureFormat, TextureMetadata, TrackedResource};

/// 后缓冲格式
pub const BACK_BUFFER_FORMAT: TextureFormat = TextureFormat::Rgba8UnormSrgb;

/// 后缓冲数量
pub const BACK_BUFFER_COUNT: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SurfacePhase {
    Idle,
    Rendering(usize),
    ReadyToPresent(usize),
}

/// 呈现表面
#[derive(Debug)]
pub struct PresentationSurface<R> {
    back_buffers: Vec<TrackedResource<R>>,
    rtv_slots: Vec<u32>,
    rtv_handles: Vec<CpuDescriptorHandle>,
    phase: SurfacePhase,
    width: u32,
    height: u32,
}

impl<R: Clone> PresentationSurface<R> {
    /// 获取交换链后缓冲，并在 RTV 池中为每个缓冲分配一个槽位
    pub fn new<B>(backend: &mut B, views: &mut ViewSlotAllocator) -> Result<Self>
    where
        B: GpuBackend<Resource = R>,
    {
        let (width, height) = backend.surface_size();
        let mut rtv_slots = Vec::with_capacity(BACK_BUFFER_COUNT);
        let mut rtv_handles = Vec::with_capacity(BACK_BUFFER_COUNT);
        for _ in 0..BACK_BUFFER_COUNT {
            let slot = views.allocate(PoolKind::RenderTarget)?;
            rtv_slots.push(slot);
            rtv_handles.push(views.cpu_handle(PoolKind::RenderTarget, slot));
        }

        let mut surface = Self {
            back_buffers: Vec::with_capacity(BACK_BUFFER_COUNT),
            rtv_slots,
            rtv_handles,
            phase: SurfacePhase::Idle,
            width,
            height,
        };
        surface.acquire_buffers(backend, views)?;

        info!(width, height, buffers = BACK_BUFFER_COUNT, "Presentation surface created");
        Ok(surface)
    }

    fn acquire_buffers<B>(&mut self, backend: &mut B, views: &ViewSlotAllocator) -> Result<()>
    where
        B: GpuBackend<Resource = R>,
    {
        let meta = TextureMetadata::new(self.width, self.height, BACK_BUFFER_FORMAT, 1);
        self.back_buffers.clear();
        for (index, &slot) in self.rtv_slots.iter().enumerate() {
            let handle = backend.back_buffer(index)?;
            views.create_view(backend, slot, &handle, &ViewDesc::RenderTarget { format: BACK_BUFFER_FORMAT })?;
            self.back_buffers.push(TrackedResource::new(
                handle,
                ResourceDesc::Texture2D(meta),
                MemoryKind::DeviceLocal,
                ResourceState::Present,
            ));
        }
        Ok(())
    }

    /// 本帧应渲染的后缓冲索引（不是正在显示的那一个）
    pub fn current_index<B: GpuBackend>(&self, backend: &B) -> usize {
        backend.current_back_buffer_index()
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn back_buffer(&self, index: usize) -> Option<&TrackedResource<R>> {
        self.back_buffers.get(index)
    }

    pub fn rtv_slot(&self, index: usize) -> Option<u32> {
        self.rtv_slots.get(index).copied()
    }

    pub fn rtv_handle(&self, index: usize) -> Option<CpuDescriptorHandle> {
        self.rtv_handles.get(index).copied()
    }

    /// 是否处于两次转换之间
    pub fn is_rendering(&self) -> bool {
        matches!(self.phase, SurfacePhase::Rendering(_))
    }

    /// 录制 Present -> RenderTarget，返回本帧的缓冲索引
    pub fn begin_render<B>(&mut self, backend: &mut B, batch: &mut CommandBatch) -> Result<usize>
    where
        B: GpuBackend<Resource = R>,
    {
        let index = backend.current_back_buffer_index();
        if self.phase != SurfacePhase::Idle {
            return Err(ContractViolation::DuplicateTransition {
                index,
                state: ResourceState::RenderTarget.name(),
            }
            .into());
        }

        let buffer = self
            .back_buffers
            .get_mut(index)
            .ok_or_else(|| GraphicsError::SwapchainError(format!("back buffer {index} does not exist")))?;
        batch.transition(backend, buffer, ResourceState::RenderTarget)?;
        self.phase = SurfacePhase::Rendering(index);
        Ok(index)
    }

    /// 录制 RenderTarget -> Present
    pub fn end_render<B>(&mut self, backend: &mut B, batch: &mut CommandBatch) -> Result<()>
    where
        B: GpuBackend<Resource = R>,
    {
        let index = match self.phase {
            SurfacePhase::Rendering(index) => index,
            SurfacePhase::Idle => {
                return Err(ContractViolation::PresentWithoutTransition {
                    index: backend.current_back_buffer_index(),
                    expected: ResourceState::RenderTarget.name(),
                }
                .into())
            }
            SurfacePhase::ReadyToPresent(index) => {
                return Err(ContractViolation::DuplicateTransition { index, state: ResourceState::Present.name() }.into())
            }
        };

        batch.transition(backend, &mut self.back_buffers[index], ResourceState::Present)?;
        self.phase = SurfacePhase::ReadyToPresent(index);
        Ok(())
    }

    /// 翻转交换链
    ///
    /// 调用前命令批次必须已经提交。
    pub fn present<B>(&mut self, backend: &mut B, vsync: bool) -> Result<()>
    where
        B: GpuBackend<Resource = R>,
    {
        match self.phase {
            SurfacePhase::ReadyToPresent(_) => {
                backend.present(vsync)?;
                self.phase = SurfacePhase::Idle;
                Ok(())
            }
            SurfacePhase::Rendering(index) => Err(ContractViolation::PresentWithoutTransition {
                index,
                expected: ResourceState::Present.name(),
            }
            .into()),
            SurfacePhase::Idle => Err(ContractViolation::PresentWithoutTransition {
                index: backend.current_back_buffer_index(),
                expected: ResourceState::RenderTarget.name(),
            }
            .into()),
        }
    }

    /// 调整交换链尺寸，RTV 复用原来的槽位
    ///
    /// 调用前 GPU 必须已经刷新。
    pub fn resize<B>(&mut self, backend: &mut B, views: &ViewSlotAllocator, width: u32, height: u32) -> Result<()>
    where
        B: GpuBackend<Resource = R>,
    {
        if self.phase != SurfacePhase::Idle {
            return Err(GraphicsError::SwapchainError("resize requested in the middle of a frame".to_string()).into());
        }

        // 交换链要求所有后缓冲引用先释放
        self.back_buffers.clear();
        backend.resize_surface(width, height)?;
        self.width = width;
        self.height = height;
        self.acquire_buffers(backend, views)?;

        debug!(width, height, "Presentation surface resized");
        Ok(())
    }
}
