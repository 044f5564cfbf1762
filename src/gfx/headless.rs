//! 无窗口模拟设备
//!
//! 在 CPU 内存中模拟一个 D3D12 风格的设备：资源是字节数组，命令列表被翻译成
//! [`RecordedCommand`] 并排入一个模拟的 GPU 队列，只有时间线推进时才真正执行。
//!
//! # 设计原则
//!
//! - **异步可控**：`Immediate` 模式下提交即执行；`Manual` 模式下由 [`Timeline`]
//!   显式推进，可以在任意线程上推进，用来验证 Fence 等待和帧资源复用
//! - **阻塞等待**：Fence 等待使用条件变量，不自旋
//! - **错误暴露**：执行时引用已释放资源会把设备标记为已移除；
//!   重置仍在飞行中的分配器、屏障前状态不符等问题记录到验证错误列表
//! - **可回读**：测试可以读出任意资源当前的字节内容
//!
//! 非 Windows 平台上引擎也使用这个设备运行（无呈现输出）。

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, trace, warn};

use crate::core::error::{ContractViolation, GraphicsError, Result};
use crate::gfx::backend::{AdapterInfo, Command, FeatureLevel, GpuBackend, GpuCommand};
use crate::math::color_space::linear_to_srgb;
use crate::renderer::descriptor::{CpuDescriptorHandle, DescriptorHeapInfo, GpuDescriptorHandle, PoolKind, ViewDesc};
use crate::renderer::resource::{
    ClearValue, MemoryKind, ResourceDesc, ResourceState, TextureFormat, TextureMetadata, UploadLayout,
};
use crate::renderer::shaders::{BlendMode, PipelineDesc, ShaderBlob, ShaderStage};

/// 交换链缓冲数量
const BACK_BUFFER_COUNT: usize = 2;

/// 着色器可见堆的 GPU 地址相对 CPU 地址的偏移
const GPU_HANDLE_OFFSET: u64 = 0x1_0000_0000;

/// GPU 时间线的推进方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    /// 提交和信号立即完成
    Immediate,
    /// 只有调用 [`Timeline::advance`] 时才执行
    Manual,
}

/// 模拟资源句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(u64);

impl ResourceId {
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// 模拟管线状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadlessPipeline {
    pub name: String,
    pub blend: BlendMode,
    pub depth_write: bool,
    pub root_parameters: usize,
}

/// 已提交的一条命令（不含借用，可保存在历史中）
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    Barrier { resource: ResourceId, before: ResourceState, after: ResourceState },
    CopyBuffer { dst: ResourceId, src: ResourceId, size: u64 },
    CopyTexture { dst: ResourceId, src: ResourceId, layout: UploadLayout },
    SetRenderTargets { rtv: CpuDescriptorHandle, dsv: Option<CpuDescriptorHandle> },
    ClearRenderTarget { rtv: CpuDescriptorHandle, color: [f32; 4] },
    ClearDepth { dsv: CpuDescriptorHandle, depth: f32 },
    SetViewport { width: u32, height: u32 },
    SetDescriptorHeap,
    SetPipeline(String),
    SetRootDescriptorTable { index: u32, base: GpuDescriptorHandle },
    SetRootConstantBuffer { index: u32, buffer: ResourceId },
    SetVertexBuffer { buffer: ResourceId, stride: u32, size: u64 },
    DrawInstanced { vertex_count: u32, instance_count: u32 },
}

impl RecordedCommand {
    fn from_command(command: Command<'_, HeadlessDevice>) -> Self {
        match command {
            GpuCommand::Barrier { resource, before, after } => {
                RecordedCommand::Barrier { resource: *resource, before, after }
            }
            GpuCommand::CopyBuffer { dst, src, size } => RecordedCommand::CopyBuffer { dst: *dst, src: *src, size },
            GpuCommand::CopyTexture { dst, src, layout } => {
                RecordedCommand::CopyTexture { dst: *dst, src: *src, layout: layout.clone() }
            }
            GpuCommand::SetRenderTargets { rtv, dsv } => RecordedCommand::SetRenderTargets { rtv, dsv },
            GpuCommand::ClearRenderTarget { rtv, color } => RecordedCommand::ClearRenderTarget { rtv, color },
            GpuCommand::ClearDepth { dsv, depth } => RecordedCommand::ClearDepth { dsv, depth },
            GpuCommand::SetViewport { width, height } => RecordedCommand::SetViewport { width, height },
            GpuCommand::SetDescriptorHeap => RecordedCommand::SetDescriptorHeap,
            GpuCommand::SetPipeline(pipeline) => RecordedCommand::SetPipeline(pipeline.name.clone()),
            GpuCommand::SetRootDescriptorTable { index, base } => RecordedCommand::SetRootDescriptorTable { index, base },
            GpuCommand::SetRootConstantBuffer { index, buffer } => {
                RecordedCommand::SetRootConstantBuffer { index, buffer: *buffer }
            }
            GpuCommand::SetVertexBuffer { buffer, stride, size } => {
                RecordedCommand::SetVertexBuffer { buffer: *buffer, stride, size }
            }
            GpuCommand::DrawInstanced { vertex_count, instance_count } => {
                RecordedCommand::DrawInstanced { vertex_count, instance_count }
            }
        }
    }

    /// 命令引用的资源
    fn resources(&self) -> Vec<ResourceId> {
        match self {
            RecordedCommand::Barrier { resource, .. } => vec![*resource],
            RecordedCommand::CopyBuffer { dst, src, .. } | RecordedCommand::CopyTexture { dst, src, .. } => {
                vec![*dst, *src]
            }
            RecordedCommand::SetRootConstantBuffer { buffer, .. } | RecordedCommand::SetVertexBuffer { buffer, .. } => {
                vec![*buffer]
            }
            _ => Vec::new(),
        }
    }
}

/// 绑定在某个描述符上的视图
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundView {
    pub kind: PoolKind,
    pub resource: ResourceId,
    pub view: ViewDesc,
}

#[derive(Debug)]
struct SimResource {
    desc: ResourceDesc,
    memory: MemoryKind,
    /// GPU 侧执行到目前为止的状态
    state: ResourceState,
    /// 缓冲区原始字节；纹理按 mip 紧密排列
    data: Vec<u8>,
}

#[derive(Debug)]
enum QueueItem {
    Commands { allocator: usize, list: Vec<RecordedCommand> },
    Signal(u64),
}

impl QueueItem {
    fn references(&self, id: ResourceId) -> bool {
        match self {
            QueueItem::Commands { list, .. } => list.iter().any(|c| c.resources().contains(&id)),
            QueueItem::Signal(_) => false,
        }
    }
}

/// GPU 侧共享状态
#[derive(Debug, Default)]
struct GpuState {
    resources: HashMap<ResourceId, SimResource>,
    views: HashMap<usize, BoundView>,
    queue: VecDeque<QueueItem>,
    completed: u64,
    validation_errors: Vec<String>,
    removed: Option<String>,
}

impl GpuState {
    /// 队列中尚未执行的命令是否引用了该资源（包括经由描述符表引用）
    fn queued_reference(&self, id: ResourceId) -> bool {
        self.queue.iter().any(|item| {
            item.references(id)
                || match item {
                    QueueItem::Commands { list, .. } => list.iter().any(|command| match command {
                        RecordedCommand::SetRootDescriptorTable { base, .. } => base
                            .ptr
                            .checked_sub(GPU_HANDLE_OFFSET)
                            .and_then(|cpu| self.views.get(&(cpu as usize)))
                            .map_or(false, |view| view.resource == id),
                        _ => false,
                    }),
                    QueueItem::Signal(_) => false,
                }
        })
    }

    fn mark_removed(&mut self, reason: String) {
        if self.removed.is_none() {
            error!(reason = %reason, "Simulated device removed");
            self.removed = Some(reason);
        }
    }

    fn validation(&mut self, message: String) {
        warn!(message = %message, "Simulated device validation error");
        self.validation_errors.push(message);
    }

    /// 查找一个仍然存活的资源，已释放则移除设备
    fn live(&mut self, id: ResourceId) -> bool {
        // 资源 id 不复用，表里找不到就是已经释放
        if self.resources.contains_key(&id) {
            return true;
        }
        self.mark_removed(format!("resource {} used by the GPU after it was released", id.0));
        false
    }

    /// 执行队列头部的一项，返回完成的信号值
    fn process_front(&mut self) -> Option<Option<u64>> {
        let item = self.queue.pop_front()?;
        match item {
            QueueItem::Commands { list, .. } => {
                for command in &list {
                    if self.removed.is_some() {
                        break;
                    }
                    self.execute(command);
                }
                Some(None)
            }
            QueueItem::Signal(value) => {
                if self.removed.is_none() {
                    self.completed = value;
                }
                Some(Some(value))
            }
        }
    }

    fn execute(&mut self, command: &RecordedCommand) {
        match command {
            RecordedCommand::Barrier { resource, before, after } => {
                if !self.live(*resource) {
                    return;
                }
                let mut mismatch = None;
                if let Some(res) = self.resources.get_mut(resource) {
                    if res.state != *before {
                        mismatch = Some(res.state);
                    }
                    res.state = *after;
                }
                if let Some(actual) = mismatch {
                    self.validation(format!(
                        "barrier on resource {} expected {} but resource was {}",
                        resource.0,
                        before.name(),
                        actual.name()
                    ));
                }
            }
            RecordedCommand::CopyBuffer { dst, src, size } => {
                if !self.live(*src) || !self.live(*dst) {
                    return;
                }
                let size = *size as usize;
                let bytes = match self.resources.get(src) {
                    Some(res) if res.data.len() >= size => res.data[..size].to_vec(),
                    _ => {
                        self.validation(format!("copy of {size} bytes overruns source {}", src.0));
                        return;
                    }
                };
                match self.resources.get_mut(dst) {
                    Some(res) if res.data.len() >= size => res.data[..size].copy_from_slice(&bytes),
                    _ => self.validation(format!("copy of {size} bytes overruns destination {}", dst.0)),
                }
            }
            RecordedCommand::CopyTexture { dst, src, layout } => {
                if !self.live(*src) || !self.live(*dst) {
                    return;
                }
                let staging = match self.resources.get(src) {
                    Some(res) => res.data.clone(),
                    None => return,
                };
                let Some(target) = self.resources.get_mut(dst) else { return };

                let mut tight = 0usize;
                let mut overrun = false;
                for footprint in &layout.footprints {
                    let row_bytes = footprint.row_bytes as usize;
                    for row in 0..footprint.height as usize {
                        let from = footprint.offset as usize + row * footprint.row_pitch as usize;
                        let to = tight + row * row_bytes;
                        if from + row_bytes > staging.len() || to + row_bytes > target.data.len() {
                            overrun = true;
                            break;
                        }
                        target.data[to..to + row_bytes].copy_from_slice(&staging[from..from + row_bytes]);
                    }
                    tight += row_bytes * footprint.height as usize;
                }
                if overrun {
                    self.validation(format!("texture copy into resource {} overruns a subresource", dst.0));
                }
            }
            RecordedCommand::ClearRenderTarget { rtv, color } => {
                let Some(view) = self.views.get(&rtv.ptr).copied() else {
                    self.validation(format!("clear of unbound render target view {:#x}", rtv.ptr));
                    return;
                };
                if !self.live(view.resource) {
                    return;
                }
                if let Some(res) = self.resources.get_mut(&view.resource) {
                    if res.state != ResourceState::RenderTarget {
                        let state = res.state.name();
                        self.validation(format!("render target cleared in state {state}"));
                        return;
                    }
                    let format = match res.desc {
                        ResourceDesc::Texture2D(meta) => meta.format,
                        ResourceDesc::Buffer { .. } => return,
                    };
                    let texel = encode_color(format, color);
                    for chunk in res.data.chunks_exact_mut(texel.len()) {
                        chunk.copy_from_slice(&texel);
                    }
                }
            }
            RecordedCommand::ClearDepth { dsv, .. } => {
                if !self.views.contains_key(&dsv.ptr) {
                    self.validation(format!("clear of unbound depth stencil view {:#x}", dsv.ptr));
                }
            }
            RecordedCommand::SetRootConstantBuffer { buffer, .. } | RecordedCommand::SetVertexBuffer { buffer, .. } => {
                self.live(*buffer);
            }
            RecordedCommand::SetRenderTargets { .. }
            | RecordedCommand::SetViewport { .. }
            | RecordedCommand::SetDescriptorHeap
            | RecordedCommand::SetPipeline(_)
            | RecordedCommand::SetRootDescriptorTable { .. }
            | RecordedCommand::DrawInstanced { .. } => {}
        }
    }
}

/// 把清屏颜色编码为一个像素的字节
fn encode_color(format: TextureFormat, color: &[f32; 4]) -> Vec<u8> {
    let unorm = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u8;
    match format {
        TextureFormat::Rgba8UnormSrgb => vec![
            unorm(linear_to_srgb(color[0])),
            unorm(linear_to_srgb(color[1])),
            unorm(linear_to_srgb(color[2])),
            unorm(color[3]),
        ],
        TextureFormat::Bgra8Unorm => vec![unorm(color[2]), unorm(color[1]), unorm(color[0]), unorm(color[3])],
        TextureFormat::R32Float => color[0].to_le_bytes().to_vec(),
        TextureFormat::Rgba32Float => color.iter().flat_map(|c| c.to_le_bytes()).collect(),
        _ => color.iter().map(|&c| unorm(c)).collect(),
    }
}

#[derive(Debug, Default)]
struct GpuShared {
    state: Mutex<GpuState>,
    completed_cv: Condvar,
}

/// 模拟 GPU 的时间线句柄
///
/// 可以克隆并发送到其他线程，用来在 `Manual` 模式下推进执行。
#[derive(Debug, Clone)]
pub struct Timeline {
    shared: Arc<GpuShared>,
}

impl Timeline {
    /// 执行到下一个 Fence 信号为止，返回完成的信号值
    ///
    /// 队列中没有信号时执行完剩余命令并返回 `None`。
    pub fn advance(&self) -> Option<u64> {
        let mut state = self.shared.state.lock();
        let mut signaled = None;
        while let Some(result) = state.process_front() {
            if let Some(value) = result {
                signaled = Some(value);
                break;
            }
        }
        drop(state);
        self.shared.completed_cv.notify_all();
        signaled
    }

    /// 执行队列中的全部工作，返回完成值
    pub fn advance_all(&self) -> u64 {
        let mut state = self.shared.state.lock();
        while state.process_front().is_some() {}
        let completed = state.completed;
        drop(state);
        self.shared.completed_cv.notify_all();
        completed
    }

    pub fn completed(&self) -> u64 {
        self.shared.state.lock().completed
    }

    /// 队列中尚未执行的项数（命令列表和信号）
    pub fn pending_len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// 尚未释放的资源数，设备丢弃后仍可查询
    pub fn live_resource_count(&self) -> usize {
        self.shared.state.lock().resources.len()
    }

    pub fn removed_reason(&self) -> Option<String> {
        self.shared.state.lock().removed.clone()
    }
}

/// 无窗口模拟设备
#[derive(Debug)]
pub struct HeadlessDevice {
    shared: Arc<GpuShared>,
    mode: CompletionMode,
    adapter: AdapterInfo,
    next_id: u64,
    next_heap_base: usize,
    /// 正在录制的命令（分配器索引，命令）
    recording: Option<(usize, Vec<RecordedCommand>)>,
    /// 已关闭、等待提交的命令
    closed: Option<(usize, Vec<RecordedCommand>)>,
    history: Vec<Vec<RecordedCommand>>,
    last_signal: u64,
    back_buffers: Vec<ResourceId>,
    current_back_buffer: usize,
    width: u32,
    height: u32,
    present_count: u64,
}

impl HeadlessDevice {
    pub fn new(width: u32, height: u32, mode: CompletionMode) -> Self {
        let adapter = AdapterInfo {
            name: "Kestrel Headless Adapter".to_string(),
            vendor_id: 0,
            device_id: 0,
            dedicated_video_memory: 0,
            feature_level: FeatureLevel::Level12_0,
        };

        let mut device = Self {
            shared: Arc::new(GpuShared::default()),
            mode,
            adapter,
            next_id: 1,
            next_heap_base: 0x1000,
            recording: None,
            closed: None,
            history: Vec::new(),
            last_signal: 0,
            back_buffers: Vec::with_capacity(BACK_BUFFER_COUNT),
            current_back_buffer: 0,
            width,
            height,
            present_count: 0,
        };
        device.create_back_buffers();

        info!(width, height, mode = ?mode, "Headless device created");
        device
    }

    fn create_back_buffers(&mut self) {
        let meta = TextureMetadata::new(self.width.max(1), self.height.max(1), TextureFormat::Rgba8UnormSrgb, 1);
        self.back_buffers = (0..BACK_BUFFER_COUNT)
            .map(|_| self.insert_resource(ResourceDesc::Texture2D(meta), MemoryKind::DeviceLocal, ResourceState::Present))
            .collect();
        self.current_back_buffer = 0;
    }

    fn insert_resource(&mut self, desc: ResourceDesc, memory: MemoryKind, state: ResourceState) -> ResourceId {
        let id = ResourceId(self.next_id);
        self.next_id += 1;
        let resource = SimResource {
            desc,
            memory,
            state,
            data: vec![0u8; desc.byte_size() as usize],
        };
        self.shared.state.lock().resources.insert(id, resource);
        id
    }

    /// 获取时间线句柄
    pub fn timeline(&self) -> Timeline {
        Timeline { shared: Arc::clone(&self.shared) }
    }

    pub fn mode(&self) -> CompletionMode {
        self.mode
    }

    /// 回读资源当前内容（纹理按 mip 紧密排列）
    pub fn read_resource(&self, id: ResourceId) -> Option<Vec<u8>> {
        let state = self.shared.state.lock();
        state.resources.get(&id).map(|r| r.data.clone())
    }

    /// GPU 执行到目前为止资源所处的状态
    pub fn resource_state(&self, id: ResourceId) -> Option<ResourceState> {
        self.shared.state.lock().resources.get(&id).map(|r| r.state)
    }

    pub fn is_released(&self, id: ResourceId) -> bool {
        !self.shared.state.lock().resources.contains_key(&id)
    }

    /// 尚未释放的资源数
    pub fn live_resource_count(&self) -> usize {
        self.shared.state.lock().resources.len()
    }

    /// 按提交顺序的命令列表历史
    pub fn submitted_commands(&self) -> &[Vec<RecordedCommand>] {
        &self.history
    }

    pub fn validation_errors(&self) -> Vec<String> {
        self.shared.state.lock().validation_errors.clone()
    }

    pub fn removed_reason(&self) -> Option<String> {
        self.shared.state.lock().removed.clone()
    }

    pub fn bound_view(&self, cpu: CpuDescriptorHandle) -> Option<BoundView> {
        self.shared.state.lock().views.get(&cpu.ptr).copied()
    }

    pub fn present_count(&self) -> u64 {
        self.present_count
    }

    fn check_removed(&self) -> Result<()> {
        match &self.shared.state.lock().removed {
            Some(reason) => Err(GraphicsError::DeviceRemoved(reason.clone()).into()),
            None => Ok(()),
        }
    }

    /// `Immediate` 模式下把队列执行完
    fn pump(&self) {
        if self.mode == CompletionMode::Immediate {
            self.timeline().advance_all();
        }
    }
}

impl GpuBackend for HeadlessDevice {
    type Resource = ResourceId;
    type Pipeline = HeadlessPipeline;

    fn backend_name(&self) -> &str {
        "Headless"
    }

    fn adapter_info(&self) -> &AdapterInfo {
        &self.adapter
    }

    fn create_resource(
        &mut self,
        desc: &ResourceDesc,
        memory: MemoryKind,
        initial_state: ResourceState,
        clear: Option<ClearValue>,
    ) -> Result<ResourceId> {
        if desc.byte_size() == 0 {
            return Err(GraphicsError::ResourceCreation("zero-sized resource".to_string()).into());
        }
        let id = self.insert_resource(*desc, memory, initial_state);
        trace!(id = id.0, desc = ?desc, memory = ?memory, clear = ?clear, "Resource created");
        Ok(id)
    }

    fn write_mapped(&mut self, resource: &ResourceId, offset: u64, data: &[u8]) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.queued_reference(*resource) {
            state.validation(format!("CPU write to resource {} while the GPU may still read it", resource.0));
        }

        let Some(res) = state.resources.get_mut(resource) else {
            return Err(GraphicsError::ResourceCreation(format!("resource {} does not exist", resource.0)).into());
        };
        if res.memory != MemoryKind::Upload {
            return Err(ContractViolation::ResourceNotMappable.into());
        }
        let size = res.data.len() as u64;
        let len = data.len() as u64;
        if offset.checked_add(len).map_or(true, |end| end > size) {
            return Err(ContractViolation::WriteOutOfBounds { offset, len, size }.into());
        }

        let start = offset as usize;
        res.data[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn release_resource(&mut self, resource: ResourceId) {
        let mut state = self.shared.state.lock();
        if state.resources.remove(&resource).is_some() {
            trace!(id = resource.0, "Resource released");
        }
    }

    fn create_descriptor_heap(&mut self, kind: PoolKind, capacity: u32) -> Result<DescriptorHeapInfo> {
        let increment = match kind {
            PoolKind::RenderTarget | PoolKind::DepthStencil => 32,
            PoolKind::ShaderVisible => 64,
        };
        let cpu_start = CpuDescriptorHandle::new(self.next_heap_base);
        // 相邻的堆之间留出空隙，越界句柄不会落到别的堆里
        self.next_heap_base += (capacity as usize + 16) * increment as usize;

        let gpu_start = kind
            .is_shader_visible()
            .then(|| GpuDescriptorHandle::new(GPU_HANDLE_OFFSET + cpu_start.ptr as u64));

        Ok(DescriptorHeapInfo { cpu_start, gpu_start, increment })
    }

    fn create_view(
        &mut self,
        kind: PoolKind,
        handle: CpuDescriptorHandle,
        resource: &ResourceId,
        view: &ViewDesc,
    ) -> Result<()> {
        let mut state = self.shared.state.lock();
        if !state.resources.contains_key(resource) {
            return Err(GraphicsError::ResourceCreation(format!("view of released resource {}", resource.0)).into());
        }
        state.views.insert(handle.ptr, BoundView { kind, resource: *resource, view: *view });
        Ok(())
    }

    fn reset_commands(&mut self, allocator_index: usize) -> Result<()> {
        self.check_removed()?;
        if self.recording.is_some() {
            return Err(GraphicsError::CommandExecution("command list reset while recording".to_string()).into());
        }

        let mut state = self.shared.state.lock();
        let in_flight = state
            .queue
            .iter()
            .any(|item| matches!(item, QueueItem::Commands { allocator, .. } if *allocator == allocator_index));
        if in_flight {
            state.validation(format!("command allocator {allocator_index} reset while its commands are in flight"));
        }
        drop(state);

        self.recording = Some((allocator_index, Vec::new()));
        Ok(())
    }

    fn record(&mut self, command: Command<'_, Self>) -> Result<()> {
        let Some((_, list)) = self.recording.as_mut() else {
            return Err(GraphicsError::CommandExecution("record into a closed command list".to_string()).into());
        };
        list.push(RecordedCommand::from_command(command));
        Ok(())
    }

    fn close_commands(&mut self) -> Result<()> {
        let recording = self
            .recording
            .take()
            .ok_or_else(|| GraphicsError::CommandExecution("close of a command list that is not recording".to_string()))?;
        self.closed = Some(recording);
        Ok(())
    }

    fn execute_commands(&mut self) -> Result<()> {
        self.check_removed()?;
        let (allocator, list) = self
            .closed
            .take()
            .ok_or_else(|| GraphicsError::CommandExecution("no closed command list to execute".to_string()))?;

        self.history.push(list.clone());
        self.shared.state.lock().queue.push_back(QueueItem::Commands { allocator, list });
        self.pump();
        self.check_removed()
    }

    fn signal(&mut self, value: u64) -> Result<()> {
        if value <= self.last_signal {
            return Err(ContractViolation::NonMonotonicSignal { value, last: self.last_signal }.into());
        }
        self.last_signal = value;
        self.shared.state.lock().queue.push_back(QueueItem::Signal(value));
        self.pump();
        Ok(())
    }

    fn completed_value(&self) -> u64 {
        self.shared.state.lock().completed
    }

    fn wait_for_value(&mut self, value: u64) -> Result<()> {
        let mut state = self.shared.state.lock();
        loop {
            if state.completed >= value {
                return Ok(());
            }
            if let Some(reason) = &state.removed {
                return Err(GraphicsError::DeviceRemoved(reason.clone()).into());
            }
            self.shared.completed_cv.wait(&mut state);
        }
    }

    fn back_buffer(&self, index: usize) -> Result<ResourceId> {
        self.back_buffers
            .get(index)
            .copied()
            .ok_or_else(|| GraphicsError::SwapchainError(format!("back buffer {index} does not exist")).into())
    }

    fn current_back_buffer_index(&self) -> usize {
        self.current_back_buffer
    }

    fn present(&mut self, vsync: bool) -> Result<()> {
        self.check_removed()?;
        self.present_count += 1;
        self.current_back_buffer = (self.current_back_buffer + 1) % self.back_buffers.len();
        trace!(vsync, presents = self.present_count, "Present");
        Ok(())
    }

    fn resize_surface(&mut self, width: u32, height: u32) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            let busy = self
                .back_buffers
                .iter()
                .any(|id| state.queue.iter().any(|item| item.references(*id)));
            if busy {
                state.validation("swap chain resized while back buffers are in flight".to_string());
            }
            for id in &self.back_buffers {
                state.resources.remove(id);
            }
        }

        self.width = width;
        self.height = height;
        self.create_back_buffers();
        debug!(width, height, "Headless surface resized");
        Ok(())
    }

    fn surface_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn compile_shader(&mut self, path: &Path, profile: &str) -> Result<ShaderBlob> {
        let stage = ShaderStage::from_profile(profile)
            .ok_or_else(|| GraphicsError::ShaderCompilation(format!("unsupported profile '{profile}'")))?;
        let source = std::fs::read_to_string(path)
            .map_err(|e| GraphicsError::ShaderCompilation(format!("{}: {e}", path.display())))?;
        if !source.contains("main(") {
            return Err(GraphicsError::ShaderCompilation(format!(
                "{}: entry point 'main' not found",
                path.display()
            ))
            .into());
        }

        Ok(ShaderBlob { stage, bytecode: source.into_bytes() })
    }

    fn create_pipeline(&mut self, desc: &PipelineDesc) -> Result<HeadlessPipeline> {
        if desc.vertex_shader.stage != ShaderStage::Vertex || desc.pixel_shader.stage != ShaderStage::Pixel {
            return Err(GraphicsError::PipelineCreation(format!("{}: shader stages do not match", desc.name)).into());
        }
        if !desc.depth_format.is_depth() {
            return Err(GraphicsError::PipelineCreation(format!("{}: depth format is not a depth format", desc.name)).into());
        }

        Ok(HeadlessPipeline {
            name: desc.name.clone(),
            blend: desc.blend,
            depth_write: desc.depth_write,
            root_parameters: desc.root_parameters.len(),
        })
    }
}
