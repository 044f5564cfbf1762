//! `GpuBackend` 的 Direct3D 12 实现
//!
//! 一个直接命令列表配合每帧一个命令分配器（按需创建），所有命令都在渲染核心的
//! 单一驱动线程上录制。资源句柄就是 `ID3D12Resource`，引用计数由 COM 管理，
//! 渲染核心负责在 Fence 完成之后才调用 `release_resource`。

use std::mem::ManuallyDrop;
use std::path::Path;

use raw_window_handle::HasWindowHandle;
use tracing::{debug, error, info, trace, warn};
use windows::Win32::Foundation::RECT;
use windows::Win32::Graphics::Direct3D::*;
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::*;
use windows::Win32::Graphics::Dxgi::*;
use windows::Win32::System::Threading::{WaitForSingleObject, INFINITE};

use super::context::Dx12Context;
use super::convert;
use super::descriptor::{self, Dx12DescriptorHeap};
use super::pipeline::{self, Dx12Pipeline};
use crate::core::config::GraphicsConfig;
use crate::core::error::{ContractViolation, GraphicsError, Result};
use crate::gfx::backend::{AdapterInfo, Command, GpuBackend, GpuCommand};
use crate::renderer::descriptor::{CpuDescriptorHandle, DescriptorHeapInfo, PoolKind, ViewDesc};
use crate::renderer::resource::{ClearValue, MemoryKind, ResourceDesc, ResourceState, UploadLayout};
use crate::renderer::shaders::{PipelineDesc, ShaderBlob};
use crate::renderer::surface::{BACK_BUFFER_COUNT, BACK_BUFFER_FORMAT};

/// Direct3D 12 设备
pub struct Dx12Device {
    context: Dx12Context,
    command_list: ID3D12GraphicsCommandList,
    allocators: Vec<ID3D12CommandAllocator>,
    heaps: Vec<Dx12DescriptorHeap>,
    recording: bool,
    last_signaled: u64,
}

impl Dx12Device {
    /// 在窗口上创建设备和交换链
    pub fn new(window: &impl HasWindowHandle, width: u32, height: u32, config: &GraphicsConfig) -> Result<Self> {
        let context = Dx12Context::new(window, width, height, config.debug_layer)?;

        unsafe {
            let allocator: ID3D12CommandAllocator = context
                .device
                .CreateCommandAllocator(D3D12_COMMAND_LIST_TYPE_DIRECT)
                .map_err(|e| GraphicsError::DeviceCreation(format!("Failed to create command allocator: {:?}", e)))?;
            let command_list: ID3D12GraphicsCommandList = context
                .device
                .CreateCommandList(0, D3D12_COMMAND_LIST_TYPE_DIRECT, &allocator, None)
                .map_err(|e| GraphicsError::DeviceCreation(format!("Failed to create command list: {:?}", e)))?;
            // 命令列表创建后处于录制状态，先关闭，由 reset_commands 重新打开
            command_list
                .Close()
                .map_err(|e| GraphicsError::DeviceCreation(format!("Failed to close command list: {:?}", e)))?;

            Ok(Self {
                context,
                command_list,
                allocators: vec![allocator],
                heaps: Vec::new(),
                recording: false,
                last_signaled: 0,
            })
        }
    }

    pub fn device(&self) -> &ID3D12Device {
        &self.context.device
    }

    fn shader_visible_heap(&self) -> Option<&ID3D12DescriptorHeap> {
        self.heaps.iter().find(|heap| heap.kind().is_shader_visible()).map(Dx12DescriptorHeap::heap)
    }

    /// 设备移除时给出原因
    fn device_error(&self, what: &str, e: windows::core::Error) -> crate::core::error::EngineError {
        unsafe {
            let reason = self.context.device.GetDeviceRemovedReason();
            if reason.is_err() {
                error!(operation = what, reason = ?reason, "DX12 device removed");
                return GraphicsError::DeviceRemoved(format!("{what}: {:?}", reason)).into();
            }
        }
        GraphicsError::CommandExecution(format!("{what}: {:?}", e)).into()
    }

    unsafe fn record_barrier(&self, resource: &ID3D12Resource, before: ResourceState, after: ResourceState) {
        let barrier = D3D12_RESOURCE_BARRIER {
            Type: D3D12_RESOURCE_BARRIER_TYPE_TRANSITION,
            Flags: D3D12_RESOURCE_BARRIER_FLAG_NONE,
            Anonymous: D3D12_RESOURCE_BARRIER_0 {
                Transition: ManuallyDrop::new(D3D12_RESOURCE_TRANSITION_BARRIER {
                    pResource: ManuallyDrop::new(Some(resource.clone())),
                    Subresource: D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES,
                    StateBefore: convert::resource_state(before),
                    StateAfter: convert::resource_state(after),
                }),
            },
        };
        let barriers = [barrier];
        self.command_list.ResourceBarrier(&barriers);

        // 屏障结构持有一份资源引用，录制完成后归还
        let [barrier] = barriers;
        let mut transition = ManuallyDrop::into_inner(barrier.Anonymous.Transition);
        ManuallyDrop::drop(&mut transition.pResource);
    }

    unsafe fn record_texture_copy(&self, dst: &ID3D12Resource, src: &ID3D12Resource, layout: &UploadLayout) {
        let format = dst.GetDesc().Format;
        for (subresource, footprint) in layout.footprints.iter().enumerate() {
            let mut dst_location = D3D12_TEXTURE_COPY_LOCATION {
                pResource: ManuallyDrop::new(Some(dst.clone())),
                Type: D3D12_TEXTURE_COPY_TYPE_SUBRESOURCE_INDEX,
                Anonymous: D3D12_TEXTURE_COPY_LOCATION_0 { SubresourceIndex: subresource as u32 },
            };
            let mut src_location = D3D12_TEXTURE_COPY_LOCATION {
                pResource: ManuallyDrop::new(Some(src.clone())),
                Type: D3D12_TEXTURE_COPY_TYPE_PLACED_FOOTPRINT,
                Anonymous: D3D12_TEXTURE_COPY_LOCATION_0 {
                    PlacedFootprint: D3D12_PLACED_SUBRESOURCE_FOOTPRINT {
                        Offset: footprint.offset,
                        Footprint: D3D12_SUBRESOURCE_FOOTPRINT {
                            Format: format,
                            Width: footprint.width,
                            Height: footprint.height,
                            Depth: 1,
                            RowPitch: footprint.row_pitch as u32,
                        },
                    },
                },
            };
            self.command_list.CopyTextureRegion(&dst_location, 0, 0, 0, &src_location, None);
            ManuallyDrop::drop(&mut dst_location.pResource);
            ManuallyDrop::drop(&mut src_location.pResource);
        }
    }
}

impl Drop for Dx12Device {
    fn drop(&mut self) {
        // 交换链和资源释放前 GPU 必须空闲
        if let Err(e) = self.wait_for_value(self.last_signaled) {
            warn!(error = %e, "Failed to drain the GPU before releasing the DX12 device");
        }
        debug!("DX12 device released");
    }
}

impl GpuBackend for Dx12Device {
    type Resource = ID3D12Resource;
    type Pipeline = Dx12Pipeline;

    fn backend_name(&self) -> &str {
        "DirectX 12"
    }

    fn adapter_info(&self) -> &AdapterInfo {
        &self.context.adapter_info
    }

    fn create_resource(
        &mut self,
        desc: &ResourceDesc,
        memory: MemoryKind,
        initial_state: ResourceState,
        clear: Option<ClearValue>,
    ) -> Result<ID3D12Resource> {
        let heap_props = D3D12_HEAP_PROPERTIES { Type: convert::heap_type(memory), ..Default::default() };

        let resource_desc = match desc {
            ResourceDesc::Buffer { size } => D3D12_RESOURCE_DESC {
                Dimension: D3D12_RESOURCE_DIMENSION_BUFFER,
                Width: *size,
                Height: 1,
                DepthOrArraySize: 1,
                MipLevels: 1,
                Format: DXGI_FORMAT_UNKNOWN,
                SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
                Layout: D3D12_TEXTURE_LAYOUT_ROW_MAJOR,
                ..Default::default()
            },
            ResourceDesc::Texture2D(meta) => D3D12_RESOURCE_DESC {
                Dimension: D3D12_RESOURCE_DIMENSION_TEXTURE2D,
                Width: meta.width as u64,
                Height: meta.height,
                DepthOrArraySize: 1,
                MipLevels: meta.mip_levels as u16,
                Format: convert::texture_format(meta.format),
                SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
                Layout: D3D12_TEXTURE_LAYOUT_UNKNOWN,
                Flags: if meta.format.is_depth() {
                    D3D12_RESOURCE_FLAG_ALLOW_DEPTH_STENCIL
                } else {
                    D3D12_RESOURCE_FLAG_NONE
                },
                ..Default::default()
            },
        };

        let clear_value = clear.map(|clear| {
            let format = match desc {
                ResourceDesc::Texture2D(meta) => convert::texture_format(meta.format),
                ResourceDesc::Buffer { .. } => DXGI_FORMAT_UNKNOWN,
            };
            match clear {
                ClearValue::Color(color) => D3D12_CLEAR_VALUE { Format: format, Anonymous: D3D12_CLEAR_VALUE_0 { Color: color } },
                ClearValue::Depth { depth, stencil } => D3D12_CLEAR_VALUE {
                    Format: format,
                    Anonymous: D3D12_CLEAR_VALUE_0 {
                        DepthStencil: D3D12_DEPTH_STENCIL_VALUE { Depth: depth, Stencil: stencil },
                    },
                },
            }
        });

        unsafe {
            let mut resource: Option<ID3D12Resource> = None;
            self.context
                .device
                .CreateCommittedResource(
                    &heap_props,
                    D3D12_HEAP_FLAG_NONE,
                    &resource_desc,
                    convert::resource_state(initial_state),
                    clear_value.as_ref().map(|value| value as *const D3D12_CLEAR_VALUE),
                    &mut resource,
                )
                .map_err(|e| {
                    GraphicsError::ResourceCreation(format!("Failed to create {:?} ({:?}): {:?}", desc, memory, e))
                })?;
            let resource =
                resource.ok_or_else(|| GraphicsError::ResourceCreation(format!("Driver returned no resource for {:?}", desc)))?;

            trace!(?desc, ?memory, "DX12 resource created");
            Ok(resource)
        }
    }

    fn write_mapped(&mut self, resource: &ID3D12Resource, offset: u64, data: &[u8]) -> Result<()> {
        unsafe {
            let desc = resource.GetDesc();
            if desc.Dimension != D3D12_RESOURCE_DIMENSION_BUFFER {
                return Err(ContractViolation::ResourceNotMappable.into());
            }
            let end = offset + data.len() as u64;
            if end > desc.Width {
                return Err(ContractViolation::WriteOutOfBounds { offset, len: data.len() as u64, size: desc.Width }.into());
            }

            // 只写不读，读取范围为空
            let read_range = D3D12_RANGE { Begin: 0, End: 0 };
            let mut mapped: *mut core::ffi::c_void = std::ptr::null_mut();
            resource
                .Map(0, Some(&read_range), Some(&mut mapped))
                .map_err(|_| ContractViolation::ResourceNotMappable)?;
            std::ptr::copy_nonoverlapping(data.as_ptr(), (mapped as *mut u8).add(offset as usize), data.len());
            let written = D3D12_RANGE { Begin: offset as usize, End: end as usize };
            resource.Unmap(0, Some(&written));
        }
        Ok(())
    }

    fn release_resource(&mut self, resource: ID3D12Resource) {
        drop(resource);
    }

    fn create_descriptor_heap(&mut self, kind: PoolKind, capacity: u32) -> Result<DescriptorHeapInfo> {
        let heap = Dx12DescriptorHeap::new(&self.context.device, kind, capacity)?;
        let info = heap.info();
        debug!(pool = kind.name(), capacity, increment = info.increment, "DX12 descriptor heap created");
        self.heaps.push(heap);
        Ok(info)
    }

    fn create_view(
        &mut self,
        _kind: PoolKind,
        handle: CpuDescriptorHandle,
        resource: &ID3D12Resource,
        view: &ViewDesc,
    ) -> Result<()> {
        unsafe { descriptor::write_view(&self.context.device, handle, resource, view) };
        Ok(())
    }

    fn reset_commands(&mut self, allocator_index: usize) -> Result<()> {
        unsafe {
            while self.allocators.len() <= allocator_index {
                let allocator: ID3D12CommandAllocator = self
                    .context
                    .device
                    .CreateCommandAllocator(D3D12_COMMAND_LIST_TYPE_DIRECT)
                    .map_err(|e| GraphicsError::ResourceCreation(format!("Failed to create command allocator: {:?}", e)))?;
                self.allocators.push(allocator);
            }

            let allocator = &self.allocators[allocator_index];
            allocator.Reset().map_err(|e| self.device_error("reset command allocator", e))?;
            self.command_list.Reset(allocator, None).map_err(|e| self.device_error("reset command list", e))?;
        }
        self.recording = true;
        Ok(())
    }

    fn record(&mut self, command: Command<'_, Self>) -> Result<()> {
        if !self.recording {
            return Err(ContractViolation::RecordIntoClosedList.into());
        }

        unsafe {
            let list = &self.command_list;
            match command {
                GpuCommand::Barrier { resource, before, after } => self.record_barrier(resource, before, after),
                GpuCommand::CopyBuffer { dst, src, size } => list.CopyBufferRegion(dst, 0, src, 0, size),
                GpuCommand::CopyTexture { dst, src, layout } => self.record_texture_copy(dst, src, layout),
                GpuCommand::SetRenderTargets { rtv, dsv } => {
                    let rtv = D3D12_CPU_DESCRIPTOR_HANDLE { ptr: rtv.ptr };
                    let dsv = dsv.map(|dsv| D3D12_CPU_DESCRIPTOR_HANDLE { ptr: dsv.ptr });
                    list.OMSetRenderTargets(
                        1,
                        Some(&rtv),
                        false,
                        dsv.as_ref().map(|dsv| dsv as *const D3D12_CPU_DESCRIPTOR_HANDLE),
                    );
                }
                GpuCommand::ClearRenderTarget { rtv, color } => {
                    list.ClearRenderTargetView(D3D12_CPU_DESCRIPTOR_HANDLE { ptr: rtv.ptr }, &color, None);
                }
                GpuCommand::ClearDepth { dsv, depth } => {
                    list.ClearDepthStencilView(
                        D3D12_CPU_DESCRIPTOR_HANDLE { ptr: dsv.ptr },
                        D3D12_CLEAR_FLAG_DEPTH,
                        depth,
                        0,
                        None,
                    );
                }
                GpuCommand::SetViewport { width, height } => {
                    let viewport = D3D12_VIEWPORT {
                        TopLeftX: 0.0,
                        TopLeftY: 0.0,
                        Width: width as f32,
                        Height: height as f32,
                        MinDepth: 0.0,
                        MaxDepth: 1.0,
                    };
                    let scissor = RECT { left: 0, top: 0, right: width as i32, bottom: height as i32 };
                    list.RSSetViewports(&[viewport]);
                    list.RSSetScissorRects(&[scissor]);
                }
                GpuCommand::SetDescriptorHeap => {
                    let heap = self
                        .shader_visible_heap()
                        .ok_or_else(|| GraphicsError::CommandExecution("No shader-visible descriptor heap".to_string()))?;
                    list.SetDescriptorHeaps(&[Some(heap.clone())]);
                }
                GpuCommand::SetPipeline(pipeline) => {
                    list.SetGraphicsRootSignature(&pipeline.root_signature);
                    list.SetPipelineState(&pipeline.pso);
                    list.IASetPrimitiveTopology(D3D_PRIMITIVE_TOPOLOGY_TRIANGLELIST);
                }
                GpuCommand::SetRootDescriptorTable { index, base } => {
                    list.SetGraphicsRootDescriptorTable(index, D3D12_GPU_DESCRIPTOR_HANDLE { ptr: base.ptr });
                }
                GpuCommand::SetRootConstantBuffer { index, buffer } => {
                    list.SetGraphicsRootConstantBufferView(index, buffer.GetGPUVirtualAddress());
                }
                GpuCommand::SetVertexBuffer { buffer, stride, size } => {
                    let view = D3D12_VERTEX_BUFFER_VIEW {
                        BufferLocation: buffer.GetGPUVirtualAddress(),
                        SizeInBytes: size as u32,
                        StrideInBytes: stride,
                    };
                    list.IASetVertexBuffers(0, Some(&[view]));
                }
                GpuCommand::DrawInstanced { vertex_count, instance_count } => {
                    list.DrawInstanced(vertex_count, instance_count, 0, 0);
                }
            }
        }
        Ok(())
    }

    fn close_commands(&mut self) -> Result<()> {
        if !self.recording {
            return Err(ContractViolation::SubmitWithoutRecording.into());
        }
        self.recording = false;
        unsafe { self.command_list.Close().map_err(|e| self.device_error("close command list", e)) }
    }

    fn execute_commands(&mut self) -> Result<()> {
        if self.recording {
            return Err(ContractViolation::SubmitWithoutRecording.into());
        }
        unsafe {
            let lists = [Some(self.command_list.clone().into())];
            self.context.queue.ExecuteCommandLists(&lists);
        }
        Ok(())
    }

    fn signal(&mut self, value: u64) -> Result<()> {
        if value <= self.last_signaled {
            return Err(ContractViolation::NonMonotonicSignal { value, last: self.last_signaled }.into());
        }
        unsafe {
            self.context
                .queue
                .Signal(&self.context.fence, value)
                .map_err(|e| self.device_error("signal fence", e))?;
        }
        self.last_signaled = value;
        Ok(())
    }

    fn completed_value(&self) -> u64 {
        unsafe { self.context.fence.GetCompletedValue() }
    }

    fn wait_for_value(&mut self, value: u64) -> Result<()> {
        if value > self.last_signaled {
            return Err(ContractViolation::WaitOnUnsignaledValue { requested: value, signaled: self.last_signaled }.into());
        }

        unsafe {
            let completed = self.context.fence.GetCompletedValue();
            // 设备移除后 Fence 读数为全 1
            if completed == u64::MAX {
                return Err(GraphicsError::DeviceRemoved(format!(
                    "fence reads {:#x}: {:?}",
                    completed,
                    self.context.device.GetDeviceRemovedReason()
                ))
                .into());
            }
            if completed < value {
                self.context
                    .fence
                    .SetEventOnCompletion(value, self.context.fence_event)
                    .map_err(|e| self.device_error("set fence event", e))?;
                WaitForSingleObject(self.context.fence_event, INFINITE);
            }
        }
        Ok(())
    }

    fn back_buffer(&self, index: usize) -> Result<ID3D12Resource> {
        unsafe {
            self.context.swap_chain.GetBuffer::<ID3D12Resource>(index as u32).map_err(|e| {
                GraphicsError::SwapchainError(format!("Failed to get back buffer {index}: {:?}", e)).into()
            })
        }
    }

    fn current_back_buffer_index(&self) -> usize {
        unsafe { self.context.swap_chain.GetCurrentBackBufferIndex() as usize }
    }

    fn present(&mut self, vsync: bool) -> Result<()> {
        let interval = if vsync { 1 } else { 0 };
        unsafe {
            let hr = self.context.swap_chain.Present(interval, DXGI_PRESENT(0));
            if hr == DXGI_ERROR_DEVICE_REMOVED || hr == DXGI_ERROR_DEVICE_RESET {
                let reason = self.context.device.GetDeviceRemovedReason();
                error!(?hr, ?reason, "Device lost during present");
                return Err(GraphicsError::DeviceRemoved(format!("present: {:?}", reason)).into());
            }
            hr.ok().map_err(|e| GraphicsError::SwapchainError(format!("Present failed: {:?}", e)))?;
        }
        Ok(())
    }

    fn resize_surface(&mut self, width: u32, height: u32) -> Result<()> {
        unsafe {
            self.context
                .swap_chain
                .ResizeBuffers(
                    BACK_BUFFER_COUNT as u32,
                    width,
                    height,
                    convert::swap_chain_format(BACK_BUFFER_FORMAT),
                    DXGI_SWAP_CHAIN_FLAG(0),
                )
                .map_err(|e| GraphicsError::SwapchainError(format!("Failed to resize swap chain buffers: {:?}", e)))?;
        }
        self.context.width = width;
        self.context.height = height;
        info!(width, height, "DX12 swap chain resized");
        Ok(())
    }

    fn surface_size(&self) -> (u32, u32) {
        (self.context.width, self.context.height)
    }

    fn compile_shader(&mut self, path: &Path, profile: &str) -> Result<ShaderBlob> {
        pipeline::compile_shader(path, profile)
    }

    fn create_pipeline(&mut self, desc: &PipelineDesc) -> Result<Dx12Pipeline> {
        pipeline::create_pipeline(&self.context.device, desc)
    }
}
