//! 帧驱动与渲染核心
//!
//! [`Renderer`] 持有设备和所有与帧相关的状态：命令批次、帧 Fence、帧资源池、
//! 描述符分配器、呈现表面和深度缓冲，并把它们组合成一帧的完整流程。
//!
//! # 一帧的流程
//!
//! ```text
//! begin_frame:
//!   等待当前帧分配器上次提交的 Fence 值 -> 重置命令批次
//!   后缓冲 Present -> RenderTarget -> 设置渲染目标 -> 清屏/清深度
//!   -> 视口 -> 绑定着色器可见描述符堆 -> 调试界面 begin 钩子
//! （可绘制对象录制命令）
//! end_frame:
//!   调试界面 end 钩子 -> 后缓冲 RenderTarget -> Present -> 提交 -> 呈现
//!   -> Fence 加一并发出信号 -> 记录到当前帧资源 -> 轮转到下一帧资源
//! ```
//!
//! 不在帧内时也可以录制上传命令：批次会按需打开，由 [`Renderer::submit_uploads`]
//! 或下一次 `end_frame` 一起提交。

use std::path::{Path, PathBuf};

use tracing::{debug, error, info, trace};

use crate::core::config::GraphicsConfig;
use crate::core::error::{ContractViolation, GraphicsError, Result};
use crate::gfx::backend::{GpuBackend, GpuCommand};

use super::command::{BatchRecorder, CommandBatch};
use super::descriptor::{CpuDescriptorHandle, GpuDescriptorHandle, PoolKind, ViewDesc, ViewSlotAllocator};
use super::mipmap::TextureImage;
use super::resource::{
    ClearValue, FrameResourcePool, MemoryKind, ResourceDesc, ResourceState, TextureFormat, TextureMetadata,
    TrackedResource,
};
use super::shaders::{PipelineDesc, ShaderBlob};
use super::surface::PresentationSurface;
use super::sync::{FenceValue, FrameFence};
use super::upload::{self, StagingBuffer};

/// 深度缓冲格式
pub const DEPTH_FORMAT: TextureFormat = TextureFormat::Depth24UnormStencil8;

/// 深度清除值
pub const DEPTH_CLEAR: f32 = 1.0;

/// 调试界面钩子
///
/// 在 `begin_frame` 末尾和 `end_frame` 开头被调用，
/// 此时后缓冲处于 RenderTarget 状态、着色器可见描述符堆已绑定。
pub trait OverlayHook<B: GpuBackend> {
    fn begin_frame(&mut self, recorder: &mut BatchRecorder<'_, B>) -> Result<()>;

    fn end_frame(&mut self, recorder: &mut BatchRecorder<'_, B>) -> Result<()>;
}

/// 渲染核心
pub struct Renderer<B: GpuBackend> {
    backend: B,
    batch: CommandBatch,
    fence: FrameFence,
    frames: FrameResourcePool,
    views: ViewSlotAllocator,
    surface: PresentationSurface<B::Resource>,
    depth: TrackedResource<B::Resource>,
    dsv_slot: u32,
    clear_color: [f32; 4],
    vsync: bool,
    shader_dir: PathBuf,
    overlay: Option<Box<dyn OverlayHook<B>>>,
    in_frame: bool,
    frame_count: u64,
}

impl<B: GpuBackend> Renderer<B> {
    pub fn new(mut backend: B, config: &GraphicsConfig) -> Result<Self> {
        let mut views = ViewSlotAllocator::new(&mut backend, &config.pools)?;
        let surface = PresentationSurface::new(&mut backend, &mut views)?;

        let (width, height) = backend.surface_size();
        let depth = create_depth_buffer(&mut backend, width, height)?;
        let dsv_slot = views.allocate(PoolKind::DepthStencil)?;
        views.create_view(&mut backend, dsv_slot, depth.handle(), &ViewDesc::DepthStencil { format: DEPTH_FORMAT })?;

        let adapter = backend.adapter_info();
        info!(
            backend = backend.backend_name(),
            adapter = %adapter.name,
            feature_level = adapter.feature_level.name(),
            frames_in_flight = config.frames_in_flight,
            "Renderer initialized"
        );

        Ok(Self {
            backend,
            batch: CommandBatch::new(),
            fence: FrameFence::new(),
            frames: FrameResourcePool::new(config.frames_in_flight as usize),
            views,
            surface,
            depth,
            dsv_slot,
            clear_color: config.clear_color,
            vsync: config.vsync,
            shader_dir: PathBuf::from(&config.shader_dir),
            overlay: None,
            in_frame: false,
            frame_count: 0,
        })
    }

    // ========== 帧循环 ==========

    /// 按需打开命令批次
    ///
    /// 先等待当前帧分配器上一次的提交完成，再重置它。
    fn open_batch(&mut self) -> Result<()> {
        if self.batch.is_recording() {
            return Ok(());
        }

        self.wait_for_frame_slot()?;
        let frame_index = self.frames.current().frame_index;
        self.batch.begin(&mut self.backend, frame_index)
    }

    /// 阻塞到当前帧资源不再被 GPU 使用
    ///
    /// 按帧环形复用的 CPU 可写缓冲在写入前需要调用。
    pub fn wait_for_frame_slot(&mut self) -> Result<()> {
        let frame = *self.frames.current();
        self.fence.wait_until(&mut self.backend, FenceValue::new(frame.fence_value))
    }

    /// 当前帧资源是否可以不阻塞地复用
    pub fn frame_slot_ready(&self) -> bool {
        let frame = self.frames.current();
        self.fence.is_completed(&self.backend, FenceValue::new(frame.fence_value))
    }

    /// 开始一帧，返回本帧渲染的后缓冲索引
    pub fn begin_frame(&mut self) -> Result<usize> {
        if self.in_frame {
            return Err(ContractViolation::BeginWhileRecording.into());
        }

        self.open_batch()?;
        let index = self.surface.begin_render(&mut self.backend, &mut self.batch)?;
        let rtv = self
            .surface
            .rtv_handle(index)
            .ok_or_else(|| GraphicsError::SwapchainError(format!("no render target view for buffer {index}")))?;
        let dsv = self.dsv_handle();
        let (width, height) = self.surface.size();

        let commands = [
            GpuCommand::SetRenderTargets { rtv, dsv: Some(dsv) },
            GpuCommand::ClearRenderTarget { rtv, color: self.clear_color },
            GpuCommand::ClearDepth { dsv, depth: DEPTH_CLEAR },
            GpuCommand::SetViewport { width, height },
            GpuCommand::SetDescriptorHeap,
        ];
        for command in commands {
            self.batch.record(&mut self.backend, command)?;
        }

        if let Some(overlay) = self.overlay.as_mut() {
            overlay.begin_frame(&mut BatchRecorder::new(&mut self.batch, &mut self.backend))?;
        }

        self.in_frame = true;
        trace!(frame = self.frame_count, buffer = index, "Frame begun");
        Ok(index)
    }

    /// 结束一帧：转换回 Present、提交、呈现并发出 Fence 信号
    pub fn end_frame(&mut self) -> Result<FenceValue> {
        if !self.in_frame {
            return Err(ContractViolation::EndWithoutBegin.into());
        }

        if let Some(overlay) = self.overlay.as_mut() {
            overlay.end_frame(&mut BatchRecorder::new(&mut self.batch, &mut self.backend))?;
        }

        self.surface.end_render(&mut self.backend, &mut self.batch)?;
        self.batch.submit(&mut self.backend)?;
        self.surface.present(&mut self.backend, self.vsync)?;
        self.in_frame = false;

        let value = self.finish_submission()?;
        self.frame_count += 1;
        trace!(frame = self.frame_count, fence = value.value(), "Frame submitted");
        Ok(value)
    }

    /// 提交后：发出信号，记录到当前帧资源，轮转
    fn finish_submission(&mut self) -> Result<FenceValue> {
        let value = self.fence.signal(&mut self.backend)?;
        self.frames.mark_in_use(value.value());
        self.frames.advance();
        Ok(value)
    }

    /// 提交帧外录制的上传命令
    ///
    /// 没有待提交的命令时直接返回最后一次信号值。
    pub fn submit_uploads(&mut self) -> Result<FenceValue> {
        if self.in_frame {
            return Err(ContractViolation::SubmitDuringFrame.into());
        }
        if !self.batch.is_recording() {
            return Ok(self.fence.last_signaled());
        }

        self.batch.submit(&mut self.backend)?;
        let value = self.finish_submission()?;
        debug!(fence = value.value(), "Uploads submitted");
        Ok(value)
    }

    /// 等待所有已提交的工作完成
    ///
    /// 帧外还有未提交的上传命令时先提交它们。
    pub fn flush(&mut self) -> Result<FenceValue> {
        if self.in_frame {
            return Err(ContractViolation::SubmitDuringFrame.into());
        }
        self.submit_uploads()?;
        self.fence.flush(&mut self.backend)
    }

    /// 调整交换链和深度缓冲尺寸
    ///
    /// 尺寸为 0（窗口最小化）时忽略。
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 || (width, height) == self.surface.size() {
            return Ok(());
        }
        self.flush()?;

        self.surface.resize(&mut self.backend, &self.views, width, height)?;

        let depth = create_depth_buffer(&mut self.backend, width, height)?;
        let old = std::mem::replace(&mut self.depth, depth);
        self.backend.release_resource(old.into_handle());
        self.views.create_view(
            &mut self.backend,
            self.dsv_slot,
            self.depth.handle(),
            &ViewDesc::DepthStencil { format: DEPTH_FORMAT },
        )?;

        info!(width, height, "Renderer resized");
        Ok(())
    }

    /// 安装调试界面钩子，并领取保留的着色器可见槽 0
    pub fn set_overlay(&mut self, overlay: Box<dyn OverlayHook<B>>) -> Result<u32> {
        let slot = self.views.claim_overlay_slot()?;
        self.overlay = Some(overlay);
        Ok(slot)
    }

    // ========== 可绘制对象接口 ==========

    /// 创建 CPU 可写的上传堆缓冲，初始状态 GenericRead
    pub fn create_buffer_resource(&mut self, size: u64) -> Result<TrackedResource<B::Resource>> {
        upload::create_upload_buffer(&mut self.backend, size)
    }

    /// 写入上传堆缓冲
    pub fn write_buffer(&mut self, buffer: &TrackedResource<B::Resource>, offset: u64, bytes: &[u8]) -> Result<()> {
        if buffer.memory() != MemoryKind::Upload {
            return Err(ContractViolation::ResourceNotMappable.into());
        }
        self.backend.write_mapped(buffer.handle(), offset, bytes)
    }

    /// 创建设备本地纹理，初始状态 CopyDest
    pub fn create_texture_resource(&mut self, metadata: &TextureMetadata) -> Result<TrackedResource<B::Resource>> {
        self.create_device_resource(&ResourceDesc::Texture2D(*metadata))
    }

    pub fn create_device_resource(&mut self, desc: &ResourceDesc) -> Result<TrackedResource<B::Resource>> {
        upload::create_device_resource(&mut self.backend, desc)
    }

    /// 录制纹理上传，返回的暂存缓冲在本批次的 Fence 完成后才能释放
    pub fn upload_texture_data(
        &mut self,
        resource: &mut TrackedResource<B::Resource>,
        image: &TextureImage,
    ) -> Result<StagingBuffer<B::Resource>> {
        self.open_batch()?;
        let retire_after = self.fence.pending_value();
        upload::upload_texture(&mut self.backend, &mut self.batch, resource, &image.mips, retire_after)
    }

    /// 录制缓冲区上传
    pub fn upload_buffer_data(
        &mut self,
        resource: &mut TrackedResource<B::Resource>,
        bytes: &[u8],
    ) -> Result<StagingBuffer<B::Resource>> {
        self.open_batch()?;
        let retire_after = self.fence.pending_value();
        upload::upload_buffer(&mut self.backend, &mut self.batch, resource, bytes, retire_after)
    }

    /// 释放 GPU 已经用完的暂存缓冲；尚未完成时原样交还
    pub fn retire_staging(&mut self, staging: StagingBuffer<B::Resource>) -> Option<StagingBuffer<B::Resource>> {
        if staging.is_retired(self.completed_fence()) {
            self.backend.release_resource(staging.into_resource());
            None
        } else {
            Some(staging)
        }
    }

    /// 释放资源，调用方保证 GPU 不再引用它
    pub fn release_resource(&mut self, resource: TrackedResource<B::Resource>) {
        self.backend.release_resource(resource.into_handle());
    }

    /// 编译着色器，相对路径相对于着色器目录
    pub fn compile_shader(&mut self, path: &Path, profile: &str) -> Result<ShaderBlob> {
        let full = if path.is_relative() { self.shader_dir.join(path) } else { path.to_path_buf() };

        info!(path = %full.display(), profile, "Begin CompileShader");
        match self.backend.compile_shader(&full, profile) {
            Ok(blob) => {
                info!(path = %full.display(), profile, bytes = blob.bytecode.len(), "Compile Succeeded");
                Ok(blob)
            }
            Err(err) => {
                error!(path = %full.display(), profile, error = %err, "Shader compilation failed");
                Err(err)
            }
        }
    }

    pub fn create_pipeline(&mut self, desc: &PipelineDesc) -> Result<B::Pipeline> {
        let pipeline = self.backend.create_pipeline(desc)?;
        debug!(name = %desc.name, blend = ?desc.blend, "Pipeline created");
        Ok(pipeline)
    }

    /// 当前命令批次，未打开时按需打开
    pub fn current_command_batch(&mut self) -> Result<BatchRecorder<'_, B>> {
        self.open_batch()?;
        Ok(BatchRecorder::new(&mut self.batch, &mut self.backend))
    }

    /// 分配一个着色器可见槽位
    pub fn allocate_view_slot(&mut self) -> Result<u32> {
        self.views.allocate(PoolKind::ShaderVisible)
    }

    pub fn can_allocate_view_slot(&self) -> bool {
        self.views.can_allocate(PoolKind::ShaderVisible)
    }

    /// 着色器可见槽位的 CPU / GPU 地址
    pub fn view_slot_addresses(&self, slot: u32) -> (CpuDescriptorHandle, GpuDescriptorHandle) {
        self.views.shader_visible_handles(slot)
    }

    pub fn create_view(&mut self, slot: u32, resource: &B::Resource, view: &ViewDesc) -> Result<()> {
        self.views.create_view(&mut self.backend, slot, resource, view)
    }

    // ========== 查询 ==========

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn views(&self) -> &ViewSlotAllocator {
        &self.views
    }

    pub fn surface(&self) -> &PresentationSurface<B::Resource> {
        &self.surface
    }

    pub fn surface_size(&self) -> (u32, u32) {
        self.surface.size()
    }

    pub fn dsv_handle(&self) -> CpuDescriptorHandle {
        self.views.cpu_handle(PoolKind::DepthStencil, self.dsv_slot)
    }

    pub fn completed_fence(&self) -> FenceValue {
        self.fence.completed(&self.backend)
    }

    pub fn last_signaled_fence(&self) -> FenceValue {
        self.fence.last_signaled()
    }

    /// 当前帧资源（实例缓冲环等按它索引）
    pub fn frame_index(&self) -> usize {
        self.frames.current_index()
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames.len()
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn is_in_frame(&self) -> bool {
        self.in_frame
    }
}

fn create_depth_buffer<B: GpuBackend>(backend: &mut B, width: u32, height: u32) -> Result<TrackedResource<B::Resource>> {
    let desc = ResourceDesc::Texture2D(TextureMetadata::new(width.max(1), height.max(1), DEPTH_FORMAT, 1));
    let handle = backend.create_resource(
        &desc,
        MemoryKind::DeviceLocal,
        ResourceState::DepthWrite,
        Some(ClearValue::Depth { depth: DEPTH_CLEAR, stencil: 0 }),
    )?;
    Ok(TrackedResource::new(handle, desc, MemoryKind::DeviceLocal, ResourceState::DepthWrite))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gfx::headless::{CompletionMode, HeadlessDevice, RecordedCommand};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn renderer(mode: CompletionMode) -> Renderer<HeadlessDevice> {
        Renderer::new(HeadlessDevice::new(4, 4, mode), &GraphicsConfig::default()).unwrap()
    }

    #[test]
    fn test_frame_clears_back_buffer() {
        let mut renderer = renderer(CompletionMode::Immediate);
        let index = renderer.begin_frame().unwrap();
        renderer.end_frame().unwrap();

        let device = renderer.backend();
        let back = device.back_buffer(index).unwrap();
        let pixels = device.read_resource(back).unwrap();
        // 清屏颜色 (0.1, 0.25, 0.5) 以 sRGB 编码写入
        assert_eq!(pixels[3], 255);
        assert!(pixels[2] > pixels[1] && pixels[1] > pixels[0]);
        assert!(device.validation_errors().is_empty());
        assert_eq!(device.present_count(), 1);
    }

    #[test]
    fn test_frames_signal_monotonic_fence() {
        let mut renderer = renderer(CompletionMode::Immediate);
        let mut last = FenceValue::ZERO;
        for _ in 0..5 {
            renderer.begin_frame().unwrap();
            let value = renderer.end_frame().unwrap();
            assert_eq!(value, last.next());
            last = value;
        }
        assert_eq!(renderer.frame_count(), 5);
        assert_eq!(renderer.completed_fence(), last);
    }

    #[test]
    fn test_end_without_begin_is_error() {
        let mut renderer = renderer(CompletionMode::Immediate);
        assert!(renderer.end_frame().unwrap_err().is_contract_violation());
        renderer.begin_frame().unwrap();
        assert!(renderer.begin_frame().unwrap_err().is_contract_violation());
    }

    #[test]
    fn test_frames_in_flight_reuse_waits_for_gpu() {
        let mut renderer = renderer(CompletionMode::Manual);
        let timeline = renderer.backend().timeline();

        // 两个帧资源都在飞行中
        renderer.begin_frame().unwrap();
        renderer.end_frame().unwrap();
        renderer.begin_frame().unwrap();
        renderer.end_frame().unwrap();
        assert!(!renderer.frame_slot_ready());

        let advanced = Arc::new(AtomicBool::new(false));
        let flag = advanced.clone();
        let worker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            flag.store(true, Ordering::SeqCst);
            timeline.advance();
        });

        // 帧 0 的分配器必须等到第一帧完成才能复用
        renderer.begin_frame().unwrap();
        assert!(advanced.load(Ordering::SeqCst));
        renderer.end_frame().unwrap();
        worker.join().unwrap();

        renderer.backend().timeline().advance_all();
        assert!(renderer.backend().validation_errors().is_empty());
    }

    #[test]
    fn test_uploads_before_first_frame() {
        let mut renderer = renderer(CompletionMode::Manual);
        let mut buffer = renderer.create_device_resource(&ResourceDesc::buffer(4)).unwrap();
        let staging = renderer.upload_buffer_data(&mut buffer, &[4, 3, 2, 1]).unwrap();

        let value = renderer.submit_uploads().unwrap();
        assert_eq!(staging.retire_after(), value);

        // GPU 还没执行完，暂存缓冲不能释放
        let staging = renderer.retire_staging(staging).unwrap();
        renderer.backend().timeline().advance_all();
        assert!(renderer.retire_staging(staging).is_none());

        assert_eq!(renderer.backend().read_resource(*buffer.handle()).unwrap(), vec![4, 3, 2, 1]);
        assert!(renderer.backend().removed_reason().is_none());
    }

    #[test]
    fn test_flush_submits_pending_uploads() {
        let mut renderer = renderer(CompletionMode::Immediate);
        let mut buffer = renderer.create_device_resource(&ResourceDesc::buffer(2)).unwrap();
        let staging = renderer.upload_buffer_data(&mut buffer, &[7, 7]).unwrap();

        renderer.flush().unwrap();
        assert!(staging.is_retired(renderer.completed_fence()));
        assert_eq!(renderer.backend().read_resource(*buffer.handle()).unwrap(), vec![7, 7]);
    }

    #[test]
    fn test_write_buffer_requires_upload_memory() {
        let mut renderer = renderer(CompletionMode::Immediate);
        let cb = renderer.create_buffer_resource(16).unwrap();
        renderer.write_buffer(&cb, 0, &[1; 16]).unwrap();
        assert_eq!(renderer.backend().read_resource(*cb.handle()).unwrap(), vec![1; 16]);

        let local = renderer.create_device_resource(&ResourceDesc::buffer(16)).unwrap();
        assert!(renderer.write_buffer(&local, 0, &[1]).unwrap_err().is_contract_violation());
    }

    struct TraceOverlay {
        calls: Arc<Mutex<Vec<&'static str>>>,
    }

    impl OverlayHook<HeadlessDevice> for TraceOverlay {
        fn begin_frame(&mut self, recorder: &mut BatchRecorder<'_, HeadlessDevice>) -> Result<()> {
            self.calls.lock().push("begin");
            assert!(recorder.is_recording());
            Ok(())
        }

        fn end_frame(&mut self, recorder: &mut BatchRecorder<'_, HeadlessDevice>) -> Result<()> {
            self.calls.lock().push("end");
            recorder.record(GpuCommand::DrawInstanced { vertex_count: 3, instance_count: 1 })
        }
    }

    #[test]
    fn test_overlay_hooks_run_before_present_transition() {
        let mut renderer = renderer(CompletionMode::Immediate);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let slot = renderer.set_overlay(Box::new(TraceOverlay { calls: calls.clone() })).unwrap();
        assert_eq!(slot, 0);
        assert!(renderer
            .set_overlay(Box::new(TraceOverlay { calls: calls.clone() }))
            .unwrap_err()
            .is_contract_violation());

        renderer.begin_frame().unwrap();
        renderer.end_frame().unwrap();
        assert_eq!(*calls.lock(), vec!["begin", "end"]);

        let list = renderer.backend().submitted_commands().last().unwrap().clone();
        let n = list.len();
        assert_eq!(list[n - 2], RecordedCommand::DrawInstanced { vertex_count: 3, instance_count: 1 });
        assert!(matches!(
            list[n - 1],
            RecordedCommand::Barrier { after: ResourceState::Present, .. }
        ));
    }

    #[test]
    fn test_compile_shader_resolves_shader_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("test.vs.hlsl"), "float4 main(uint id : SV_VertexID) : SV_POSITION { return 0; }")
            .unwrap();

        let config = GraphicsConfig { shader_dir: dir.path().display().to_string(), ..GraphicsConfig::default() };
        let mut renderer = Renderer::new(HeadlessDevice::new(4, 4, CompletionMode::Immediate), &config).unwrap();

        let blob = renderer.compile_shader(Path::new("test.vs.hlsl"), "vs_5_0").unwrap();
        assert!(!blob.bytecode.is_empty());
        assert!(renderer.compile_shader(Path::new("missing.hlsl"), "vs_5_0").unwrap_err().is_fatal());
    }

    #[test]
    fn test_resize_recreates_depth_buffer() {
        let mut renderer = renderer(CompletionMode::Immediate);
        renderer.resize(8, 6).unwrap();
        assert_eq!(renderer.surface_size(), (8, 6));

        let bound = renderer.backend().bound_view(renderer.dsv_handle()).unwrap();
        assert!(!renderer.backend().is_released(bound.resource));

        renderer.begin_frame().unwrap();
        renderer.end_frame().unwrap();
        assert!(renderer.backend().validation_errors().is_empty());
    }
}
